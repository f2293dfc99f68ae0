//! Per-endpoint pool of isolated handler instances.
//!
//! This module defines [`EndpointPool`], which owns every slot created for
//! one endpoint and decides, under a single lock, which slot serves the next
//! request. The lock only guards bookkeeping (the idle set and counters); it
//! is never held across an `.await`.
//!
//! ## Slot lifecycle
//!
//! - Pre-warmed at startup (`min_idle`), or cold-spawned on acquire when no
//!   idle slot exists and capacity remains.
//! - `Idle → Busy` on acquire. On release a slot goes back to idle only if
//!   the endpoint opted into reuse, the request left no anomaly, timeout or
//!   disconnect behind, and the idle set is below `max_idle`. Every other
//!   slot is drained and torn down.
//! - Each discard schedules a background replacement that refills the idle
//!   set toward `min_idle`, within `max_size`.
//!
//! Idle, busy and spawning slots together never exceed `max_size`.

use crate::{
    common::{
        error::{Error, Result, SpawnError},
        types::{Payload, RequestContext, SlotId},
    },
    pool::{
        config::{Backpressure, EndpointConfig, ReusePolicy},
        handler::HandlerFactory,
        instance::{DispatchError, Instance},
        metrics::{Counters, PoolMetrics, PoolStatus},
    },
};
use core::time::Duration;
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};
use tokio::{
    sync::Notify,
    time::{Instant, sleep, sleep_until, timeout, timeout_at},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

/// How long a closing pool waits for each idle handler to acknowledge
/// shutdown.
const CLOSE_ACK_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Busy,
    Draining,
}

/// A handler instance as tracked by the pool.
#[derive(Debug)]
pub struct InstanceSlot {
    instance: Instance,
    state: SlotState,
}

impl InstanceSlot {
    const fn new(instance: Instance, state: SlotState) -> Self {
        Self { instance, state }
    }
}

#[derive(Debug, Default)]
struct PoolState {
    idle: VecDeque<InstanceSlot>,
    busy: usize,
    spawning: usize,
    closed: bool,
}

impl PoolState {
    fn total(&self) -> usize {
        self.idle.len() + self.busy + self.spawning
    }
}

/// Pool-wide pieces shared by every endpoint.
#[derive(Clone)]
pub(crate) struct Shared {
    pub(crate) slot_ids: Arc<AtomicU64>,
    pub(crate) closing: CancellationToken,
    pub(crate) force: CancellationToken,
    pub(crate) replacement_retries: u32,
    pub(crate) replacement_backoff: Duration,
    pub(crate) created_at: Instant,
}

/// Capacity counted in `spawning` for slots that are still being created.
///
/// Dropping a reservation that was not consumed (failed spawn, cancelled
/// caller) hands the capacity back and wakes waiting acquires.
struct Reservation<'a, F: HandlerFactory> {
    pool: &'a EndpointPool<F>,
    count: usize,
}

impl<'a, F: HandlerFactory> Reservation<'a, F> {
    /// Wraps `count` units the caller already added to `spawning`.
    const fn new(pool: &'a EndpointPool<F>, count: usize) -> Self {
        Self { pool, count }
    }

    /// Settles the reservation under a lock the caller already holds.
    fn consume(mut self, state: &mut PoolState) {
        state.spawning -= self.count;
        self.count = 0;
    }
}

impl<F: HandlerFactory> Drop for Reservation<'_, F> {
    fn drop(&mut self) {
        if self.count == 0 {
            return;
        }
        self.pool.state.lock().spawning -= self.count;
        self.pool.available.notify_one();
    }
}

/// Result of one pass over the bookkeeping in [`EndpointPool::acquire`].
enum Step {
    Ready(InstanceSlot),
    Spawn,
    Full,
    Closed,
}

pub struct EndpointPool<F: HandlerFactory> {
    name: Arc<str>,
    config: EndpointConfig,
    factory: Arc<F>,
    state: Mutex<PoolState>,
    /// Signalled whenever capacity may have freed up.
    available: Notify,
    /// Signalled whenever the busy count drops.
    released: Notify,
    replacements: TaskTracker,
    counters: Arc<Counters>,
    shared: Shared,
}

impl<F: HandlerFactory> EndpointPool<F> {
    pub(crate) fn new(
        name: &str,
        config: EndpointConfig,
        factory: Arc<F>,
        shared: Shared,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: Arc::from(name),
            config,
            factory,
            state: Mutex::new(PoolState::default()),
            available: Notify::new(),
            released: Notify::new(),
            replacements: TaskTracker::new(),
            counters: Arc::new(Counters::default()),
            shared,
        })
    }

    /// Spawns `min_idle` slots concurrently and parks them in the idle set.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SpawnFailure`] for the first slot that could not be
    /// created. Slots that did spawn are kept.
    pub(crate) async fn prewarm(&self) -> Result<()> {
        let wanted = {
            let mut state = self.state.lock();
            let room = self.config.max_size.saturating_sub(state.total());
            let wanted = self
                .config
                .min_idle
                .saturating_sub(state.idle.len() + state.spawning)
                .min(room);
            state.spawning += wanted;
            wanted
        };
        let reservation = Reservation::new(self, wanted);

        let spawned =
            futures::future::join_all((0..wanted).map(|_| self.spawn_instance())).await;

        let mut first_error = None;
        let mut retired = Vec::new();
        {
            let mut state = self.state.lock();
            reservation.consume(&mut state);
            for result in spawned {
                match result {
                    Ok(instance) if !state.closed && state.idle.len() < self.config.max_idle => {
                        state
                            .idle
                            .push_back(InstanceSlot::new(instance, SlotState::Idle));
                    }
                    Ok(instance) => retired.push(InstanceSlot::new(instance, SlotState::Draining)),
                    Err(e) => {
                        first_error.get_or_insert(e);
                    }
                }
            }
        }
        self.retire(retired);
        self.available.notify_waiters();

        #[cfg(feature = "tracing")]
        tracing::info!(
            endpoint = %self.name,
            idle = self.status().idle,
            target = self.config.min_idle,
            "Handler pool warmed"
        );

        match first_error {
            Some(source) => Err(Error::SpawnFailure {
                endpoint: self.name.to_string(),
                source,
            }),
            None => Ok(()),
        }
    }

    /// Runs one request on a slot of this endpoint.
    ///
    /// Acquires a slot (idle, cold-spawned, or after waiting per the
    /// endpoint's [`Backpressure`]), dispatches through its instance
    /// wrapper, and releases it according to the outcome.
    #[cfg_attr(
        feature = "tracing",
        tracing::instrument(
            skip_all,
            fields(endpoint = %self.name, request_id = %context.request_id)
        )
    )]
    pub async fn submit(
        self: &Arc<Self>,
        request: Payload,
        context: RequestContext,
    ) -> Result<Payload> {
        let mut lease = self.acquire().await?;

        let dispatched = tokio::select! {
            biased;
            () = self.shared.force.cancelled() => None,
            result = lease.dispatch(request, context, self.config.request_timeout) => {
                Some(result)
            }
        };
        // Dropping an unreleased lease discards its slot.
        let Some(result) = dispatched else {
            return Err(Error::ShuttingDown);
        };

        let healthy = match &result {
            Ok(_) => {
                Counters::bump(&self.counters.completed);
                true
            }
            Err(DispatchError::Handler(_)) => {
                Counters::bump(&self.counters.handler_errors);
                true
            }
            Err(DispatchError::Timeout) => {
                Counters::bump(&self.counters.timeouts);
                false
            }
            Err(DispatchError::Disconnected) => {
                Counters::bump(&self.counters.disconnects);
                false
            }
        };
        lease.release(healthy);

        result.map_err(|e| match e {
            DispatchError::Timeout => Error::DispatchTimeout {
                endpoint: self.name.to_string(),
                timeout: self.config.request_timeout,
            },
            DispatchError::Handler(failure) => Error::HandlerError {
                endpoint: self.name.to_string(),
                failure,
            },
            DispatchError::Disconnected => Error::HandlerDisconnected {
                endpoint: self.name.to_string(),
            },
        })
    }

    /// Takes a slot out of the pool and marks it busy.
    ///
    /// # Errors
    ///
    /// - [`Error::ShuttingDown`] once the pool is closing.
    /// - [`Error::SpawnFailure`] if a required cold spawn fails.
    /// - [`Error::PoolExhausted`] at capacity under
    ///   [`Backpressure::FailFast`].
    /// - [`Error::AcquireTimeout`] if no slot frees up within
    ///   `acquire_timeout` under [`Backpressure::Wait`].
    pub(crate) async fn acquire(self: &Arc<Self>) -> Result<Lease<F>> {
        let started = Instant::now();
        let deadline = started + self.config.acquire_timeout;

        loop {
            // Register interest before inspecting state so a release between
            // the check and the wait is not missed.
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let mut retired = Vec::new();
            let step = {
                let mut state = self.state.lock();
                if state.closed {
                    Step::Closed
                } else {
                    let mut found = None;
                    while let Some(mut slot) = state.idle.pop_back() {
                        if slot.instance.is_reusable() {
                            found = Some(slot);
                            break;
                        }
                        // Tainted while idle (e.g. a late duplicate completion).
                        slot.state = SlotState::Draining;
                        retired.push(slot);
                    }
                    if let Some(mut slot) = found {
                        slot.state = SlotState::Busy;
                        state.busy += 1;
                        Step::Ready(slot)
                    } else if state.total() < self.config.max_size {
                        state.spawning += 1;
                        Step::Spawn
                    } else {
                        Step::Full
                    }
                }
            };
            if !retired.is_empty() {
                self.retire(retired);
                self.replenish();
            }

            match step {
                Step::Closed => return Err(Error::ShuttingDown),
                Step::Ready(slot) => {
                    self.log_stats("acquired idle handler");
                    return Ok(Lease::new(Arc::clone(self), slot));
                }
                Step::Spawn => {
                    let reservation = Reservation::new(self, 1);
                    return self.cold_spawn(reservation).await;
                }
                Step::Full => match self.config.backpressure {
                    Backpressure::FailFast => {
                        Counters::bump(&self.counters.exhausted);
                        return Err(Error::PoolExhausted {
                            endpoint: self.name.to_string(),
                        });
                    }
                    Backpressure::Wait => {
                        tokio::select! {
                            () = &mut notified => {}
                            () = self.shared.closing.cancelled() => return Err(Error::ShuttingDown),
                            () = sleep_until(deadline) => {
                                Counters::bump(&self.counters.exhausted);
                                return Err(Error::AcquireTimeout {
                                    endpoint: self.name.to_string(),
                                    waited: started.elapsed(),
                                });
                            }
                        }
                    }
                },
            }
        }
    }

    /// Creates a slot on the caller's path, holding the capacity reserved
    /// for it under the lock until the slot is accounted as busy.
    async fn cold_spawn(self: &Arc<Self>, reservation: Reservation<'_, F>) -> Result<Lease<F>> {
        Counters::bump(&self.counters.cold_spawns);
        #[cfg(feature = "tracing")]
        tracing::debug!(endpoint = %self.name, "Pool empty, spawning fresh handler");

        match self.spawn_instance().await {
            Ok(instance) => {
                let accepted = {
                    let mut state = self.state.lock();
                    reservation.consume(&mut state);
                    if state.closed {
                        Err(instance)
                    } else {
                        state.busy += 1;
                        Ok(instance)
                    }
                };
                match accepted {
                    Ok(instance) => {
                        self.log_stats("acquired cold handler");
                        let slot = InstanceSlot::new(instance, SlotState::Busy);
                        Ok(Lease::new(Arc::clone(self), slot))
                    }
                    Err(instance) => {
                        self.retire(vec![InstanceSlot::new(instance, SlotState::Draining)]);
                        self.available.notify_one();
                        Err(Error::ShuttingDown)
                    }
                }
            }
            Err(source) => {
                drop(reservation);
                Err(Error::SpawnFailure {
                    endpoint: self.name.to_string(),
                    source,
                })
            }
        }
    }

    /// Returns a busy slot to the pool, or tears it down.
    ///
    /// Discard always wins: a slot is only kept when `healthy`, the endpoint
    /// reuses slots, the instance is still reusable, the pool is open and the
    /// idle set has room.
    fn release(self: &Arc<Self>, mut slot: InstanceSlot, healthy: bool) {
        let keep = healthy
            && self.config.reuse == ReusePolicy::Reuse
            && slot.instance.is_reusable();

        debug_assert_eq!(slot.state, SlotState::Busy);
        let retired = {
            let mut state = self.state.lock();
            state.busy -= 1;
            if keep && !state.closed && state.idle.len() < self.config.max_idle {
                slot.state = SlotState::Idle;
                state.idle.push_back(slot);
                None
            } else {
                slot.state = SlotState::Draining;
                Some(slot)
            }
        };

        #[cfg(feature = "tracing")]
        tracing::trace!(
            endpoint = %self.name,
            reused = retired.is_none(),
            "Released handler"
        );

        if let Some(slot) = retired {
            self.retire(vec![slot]);
        }
        self.available.notify_one();
        self.released.notify_waiters();
        self.replenish();
    }

    /// Tears draining slots down outside the lock.
    fn retire(&self, slots: Vec<InstanceSlot>) {
        debug_assert!(slots.iter().all(|slot| slot.state == SlotState::Draining));
        Counters::add(&self.counters.slots_discarded, slots.len() as u64);
        drop(slots);
    }

    /// Schedules background spawns so idle + spawning reaches `min_idle`.
    fn replenish(self: &Arc<Self>) {
        if self.shared.closing.is_cancelled() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let wanted = {
            let mut state = self.state.lock();
            if state.closed {
                0
            } else {
                let room = self.config.max_size.saturating_sub(state.total());
                let wanted = self
                    .config
                    .min_idle
                    .saturating_sub(state.idle.len() + state.spawning)
                    .min(room);
                state.spawning += wanted;
                wanted
            }
        };
        for _ in 0..wanted {
            let pool = Arc::clone(self);
            self.replacements
                .spawn_on(async move { pool.spawn_replacement().await }, &runtime);
        }
    }

    /// Creates one replacement slot, retrying with bounded exponential
    /// backoff. Gives up early when the pool starts closing.
    async fn spawn_replacement(self: Arc<Self>) {
        let reservation = Reservation::new(&self, 1);
        let attempts = self.shared.replacement_retries.max(1);
        let mut delay = self.shared.replacement_backoff;

        for attempt in 1..=attempts {
            let result = tokio::select! {
                () = self.shared.closing.cancelled() => break,
                result = self.spawn_instance() => result,
            };
            match result {
                Ok(instance) => {
                    Counters::bump(&self.counters.replacement_spawns);
                    let retired = {
                        let mut state = self.state.lock();
                        reservation.consume(&mut state);
                        if !state.closed && state.idle.len() < self.config.max_idle {
                            state
                                .idle
                                .push_back(InstanceSlot::new(instance, SlotState::Idle));
                            None
                        } else {
                            Some(InstanceSlot::new(instance, SlotState::Draining))
                        }
                    };
                    if let Some(slot) = retired {
                        self.retire(vec![slot]);
                    }
                    #[cfg(feature = "tracing")]
                    tracing::debug!(endpoint = %self.name, "Spawned replacement handler");
                    self.available.notify_one();
                    return;
                }
                Err(_e) => {
                    #[cfg(feature = "tracing")]
                    tracing::error!(
                        endpoint = %self.name,
                        attempt,
                        "Failed to spawn replacement handler: {_e}"
                    );
                    if attempt < attempts {
                        tokio::select! {
                            () = self.shared.closing.cancelled() => break,
                            () = sleep(delay) => {}
                        }
                        delay = delay.saturating_mul(2);
                    }
                }
            }
        }
    }

    /// Creates and wraps one handler, bounded by `spawn_timeout`.
    async fn spawn_instance(&self) -> core::result::Result<Instance, SpawnError> {
        let handler = match timeout(self.config.spawn_timeout, self.factory.create(&self.name))
            .await
        {
            Ok(Ok(handler)) => handler,
            Ok(Err(e)) => {
                Counters::bump(&self.counters.spawn_failures);
                return Err(e);
            }
            Err(_) => {
                Counters::bump(&self.counters.spawn_failures);
                return Err(SpawnError::Timeout(self.config.spawn_timeout));
            }
        };
        let id = SlotId(self.shared.slot_ids.fetch_add(1, Ordering::Relaxed));
        Counters::bump(&self.counters.slots_created);
        Ok(Instance::start(
            id,
            Arc::clone(&self.name),
            handler,
            Arc::clone(&self.counters),
        ))
    }

    /// Stops handing out slots and wakes every waiting acquire.
    pub(crate) fn close(&self) {
        self.state.lock().closed = true;
        self.available.notify_waiters();
    }

    /// Waits until no slot is busy or `deadline` passes. Returns whether the
    /// pool drained.
    pub(crate) async fn drain(&self, deadline: Instant) -> bool {
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.state.lock().busy == 0 {
                return true;
            }
            if timeout_at(deadline, notified).await.is_err() {
                return false;
            }
        }
    }

    /// Waits for outstanding replacement spawns to stop, then closes every
    /// idle handler.
    pub(crate) async fn teardown(&self) {
        self.replacements.close();
        self.replacements.wait().await;

        let idle: Vec<InstanceSlot> = self.state.lock().idle.drain(..).collect();
        Counters::add(&self.counters.slots_discarded, idle.len() as u64);
        futures::future::join_all(
            idle.into_iter()
                .map(|slot| slot.instance.close(CLOSE_ACK_TIMEOUT)),
        )
        .await;
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.state.lock();
        PoolStatus {
            endpoint: self.name.to_string(),
            idle: state.idle.len(),
            busy: state.busy,
            spawning: state.spawning,
            min_idle: self.config.min_idle,
            max_idle: self.config.max_idle,
            max_size: self.config.max_size,
        }
    }

    pub fn metrics(&self) -> PoolMetrics {
        self.counters.snapshot(self.shared.created_at.elapsed())
    }

    #[allow(clippy::used_underscore_binding)]
    fn log_stats(&self, _what: &str) {
        #[cfg(feature = "tracing")]
        {
            let status = self.status();
            tracing::debug!(
                endpoint = %self.name,
                available = status.idle,
                busy = status.busy,
                spawning = status.spawning,
                "Pool stats: {_what}"
            );
        }
    }
}

/// Exclusive use of one busy slot.
///
/// Call [`Lease::release`] with the request's outcome. A lease dropped
/// without release (caller cancelled, forced shutdown) discards its slot,
/// since the handler may be mid-request.
pub(crate) struct Lease<F: HandlerFactory> {
    pool: Arc<EndpointPool<F>>,
    slot: Option<InstanceSlot>,
}

impl<F: HandlerFactory> Lease<F> {
    const fn new(pool: Arc<EndpointPool<F>>, slot: InstanceSlot) -> Self {
        Self {
            pool,
            slot: Some(slot),
        }
    }

    /// Runs one request on the leased instance.
    async fn dispatch(
        &mut self,
        request: Payload,
        context: RequestContext,
        request_timeout: Duration,
    ) -> core::result::Result<Payload, DispatchError> {
        match self.slot.as_mut() {
            Some(slot) => {
                slot.instance
                    .submit(request, context, request_timeout)
                    .await
            }
            None => Err(DispatchError::Disconnected),
        }
    }

    pub(crate) fn release(mut self, healthy: bool) {
        if let Some(slot) = self.slot.take() {
            self.pool.release(slot, healthy);
        }
    }
}

impl<F: HandlerFactory> Drop for Lease<F> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            #[cfg(feature = "tracing")]
            tracing::debug!(
                endpoint = %self.pool.name,
                slot = %slot.instance.id(),
                "Discarding handler abandoned mid-request"
            );
            self.pool.release(slot, false);
        }
    }
}
