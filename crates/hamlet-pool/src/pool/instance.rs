//! The instance wrapper: one handler plus its single-request routing state.
//!
//! An [`Instance`] owns a [`Handler`] for its whole life and a
//! [`CorrelationDispatcher`] scoped to that handler. The handler's output
//! stream is consumed by a listener task that is spawned with the instance
//! and aborted when the instance is dropped, so no subscription outlives
//! the slot it belongs to.

use crate::{
    common::types::{
        Completion, CorrelationToken, Envelope, HandlerFailure, Payload, RequestContext, SlotId,
    },
    pool::{
        dispatcher::{CompletionMatch, CorrelationDispatcher, Phase, Resolution},
        handler::Handler,
        metrics::Counters,
    },
};
use core::time::Duration;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::{Instant, timeout_at},
};

/// Why a single dispatch did not produce a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// No matching completion before the deadline.
    Timeout,
    /// The handler answered with a business failure.
    Handler(HandlerFailure),
    /// The handler's channels closed, or its routing state was already
    /// occupied.
    Disconnected,
}

pub struct Instance {
    id: SlotId,
    endpoint: Arc<str>,
    handler: Handler,
    dispatcher: Arc<Mutex<CorrelationDispatcher>>,
    listener: Option<JoinHandle<()>>,
    next_seq: u64,
    uses: u64,
    created_at: Instant,
}

impl Instance {
    /// Wraps `handler` and starts its slot-scoped completion listener.
    ///
    /// Must be called from within a Tokio runtime.
    pub(crate) fn start(
        id: SlotId,
        endpoint: Arc<str>,
        mut handler: Handler,
        counters: Arc<Counters>,
    ) -> Self {
        let dispatcher = Arc::new(Mutex::new(CorrelationDispatcher::new(id)));
        let listener = match handler.take_events() {
            Some(events) => Some(tokio::spawn(listen(
                Arc::clone(&endpoint),
                events,
                Arc::clone(&dispatcher),
                counters,
            ))),
            // Without an output stream nothing can ever complete.
            None => {
                dispatcher.lock().disconnect();
                None
            }
        };

        Self {
            id,
            endpoint,
            handler,
            dispatcher,
            listener,
            next_seq: 0,
            uses: 0,
            created_at: Instant::now(),
        }
    }

    pub const fn id(&self) -> SlotId {
        self.id
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub const fn uses(&self) -> u64 {
        self.uses
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn phase(&self) -> Phase {
        self.dispatcher.lock().phase()
    }

    /// Whether this instance may be handed out again.
    ///
    /// False once any timeout, anomaly or disconnect touched it, or once its
    /// handler has gone away.
    pub fn is_reusable(&self) -> bool {
        !self.handler.is_closed() && !self.dispatcher.lock().requires_discard()
    }

    /// Sends one request to the handler and waits for its matching
    /// completion, at most `request_timeout`.
    ///
    /// Takes `&mut self`: exclusive access is what guarantees a single
    /// request in flight per instance.
    pub async fn submit(
        &mut self,
        request: Payload,
        context: RequestContext,
        request_timeout: Duration,
    ) -> Result<Payload, DispatchError> {
        self.next_seq += 1;
        self.uses += 1;
        let token = CorrelationToken::new(self.id, self.next_seq);
        let deadline = Instant::now() + request_timeout;
        let (tx, mut rx) = oneshot::channel();

        if let Err(_live) = self.dispatcher.lock().register(token, tx, deadline) {
            #[cfg(feature = "tracing")]
            tracing::warn!(
                endpoint = %self.endpoint,
                slot = %self.id,
                live = %_live,
                "Refusing dispatch: slot still has a live request"
            );
            return Err(DispatchError::Disconnected);
        }

        #[cfg(feature = "tracing")]
        tracing::trace!(
            endpoint = %self.endpoint,
            request_id = %context.request_id,
            %token,
            "Dispatching request"
        );

        let envelope = Envelope {
            token,
            request,
            context,
        };
        match timeout_at(deadline, self.handler.send(envelope)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                self.dispatcher.lock().disconnect();
                return Err(DispatchError::Disconnected);
            }
            Err(_) => return self.timed_out(token, &mut rx),
        }

        match timeout_at(deadline, &mut rx).await {
            Ok(Ok(resolution)) => resolve(resolution),
            // The resolver was collected by a sweep: the deadline passed.
            Ok(Err(_)) => Err(DispatchError::Timeout),
            Err(_) => self.timed_out(token, &mut rx),
        }
    }

    /// Expires `token`, unless the listener resolved it in the meantime.
    fn timed_out(
        &self,
        token: CorrelationToken,
        rx: &mut oneshot::Receiver<Resolution>,
    ) -> Result<Payload, DispatchError> {
        if self.dispatcher.lock().expire(token) {
            #[cfg(feature = "tracing")]
            tracing::warn!(endpoint = %self.endpoint, %token, "Request timed out");
            return Err(DispatchError::Timeout);
        }
        // Matched right at the deadline: the match wins.
        match rx.try_recv() {
            Ok(resolution) => resolve(resolution),
            Err(_) => Err(DispatchError::Timeout),
        }
    }

    /// Asks the handler to stop, waiting up to `wait` for acknowledgement,
    /// then tears the instance down.
    pub async fn close(self, wait: Duration) {
        let _acknowledged = self.handler.shutdown(wait).await;
        #[cfg(feature = "tracing")]
        tracing::trace!(
            endpoint = %self.endpoint,
            slot = %self.id,
            acknowledged = _acknowledged,
            "Handler closed"
        );
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        // The handler aborts its own task when dropped right after this.
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
    }
}

impl core::fmt::Debug for Instance {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("uses", &self.uses)
            .field("handler", &self.handler)
            .finish_non_exhaustive()
    }
}

fn resolve(resolution: Resolution) -> Result<Payload, DispatchError> {
    match resolution {
        Resolution::Completed(Ok(response)) => Ok(response),
        Resolution::Completed(Err(failure)) => Err(DispatchError::Handler(failure)),
        Resolution::Disconnected => Err(DispatchError::Disconnected),
    }
}

/// Slot-scoped listener: routes each completion through the dispatcher.
#[allow(clippy::used_underscore_binding)]
async fn listen(
    _endpoint: Arc<str>,
    mut events: mpsc::Receiver<Completion>,
    dispatcher: Arc<Mutex<CorrelationDispatcher>>,
    counters: Arc<Counters>,
) {
    while let Some(Completion { token, outcome }) = events.recv().await {
        let matched = {
            let mut dispatcher = dispatcher.lock();
            dispatcher.sweep(Instant::now());
            dispatcher.complete(token, outcome)
        };
        if matched == CompletionMatch::Unmatched {
            Counters::bump(&counters.anomalies);
            #[cfg(feature = "tracing")]
            tracing::warn!(
                endpoint = %_endpoint,
                %token,
                "Correlation anomaly: dropped completion with no matching request"
            );
        }
    }
    dispatcher.lock().disconnect();
}
