//! Pool status snapshots and lifetime counters.

use core::time::Duration;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time occupancy of one endpoint's pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub endpoint: String,
    /// Slots waiting for work.
    pub idle: usize,
    /// Slots bound to an in-flight request.
    pub busy: usize,
    /// Slots being created (cold or replacement).
    pub spawning: usize,
    pub min_idle: usize,
    pub max_idle: usize,
    pub max_size: usize,
}

impl PoolStatus {
    /// Every slot the pool currently accounts for.
    #[must_use]
    pub const fn total(&self) -> usize {
        self.idle + self.busy + self.spawning
    }

    /// Calculate the utilization percentage.
    #[must_use]
    pub fn utilization(&self) -> f64 {
        if self.max_size == 0 {
            return 0.0;
        }
        (self.busy as f64 / self.max_size as f64) * 100.0
    }

    /// Check if the pool is at capacity.
    #[must_use]
    pub const fn is_at_capacity(&self) -> bool {
        self.total() >= self.max_size
    }
}

/// Lifetime counters, updated lock-free by the pool.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) slots_created: AtomicU64,
    pub(crate) slots_discarded: AtomicU64,
    pub(crate) cold_spawns: AtomicU64,
    pub(crate) replacement_spawns: AtomicU64,
    pub(crate) spawn_failures: AtomicU64,
    pub(crate) completed: AtomicU64,
    pub(crate) handler_errors: AtomicU64,
    pub(crate) timeouts: AtomicU64,
    pub(crate) disconnects: AtomicU64,
    pub(crate) anomalies: AtomicU64,
    pub(crate) exhausted: AtomicU64,
}

impl Counters {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, uptime: Duration) -> PoolMetrics {
        let read = |c: &AtomicU64| c.load(Ordering::Relaxed);
        PoolMetrics {
            slots_created: read(&self.slots_created),
            slots_discarded: read(&self.slots_discarded),
            cold_spawns: read(&self.cold_spawns),
            replacement_spawns: read(&self.replacement_spawns),
            spawn_failures: read(&self.spawn_failures),
            completed: read(&self.completed),
            handler_errors: read(&self.handler_errors),
            timeouts: read(&self.timeouts),
            disconnects: read(&self.disconnects),
            anomalies: read(&self.anomalies),
            exhausted: read(&self.exhausted),
            uptime,
        }
    }
}

/// Metrics collected from the pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolMetrics {
    /// Handler instances created since start (all paths).
    pub slots_created: u64,
    /// Handler instances torn down.
    pub slots_discarded: u64,
    /// Instances created synchronously on the acquire path.
    pub cold_spawns: u64,
    /// Instances created in the background to refill the idle set.
    pub replacement_spawns: u64,
    /// Failed handler creations (any path, including retried ones).
    pub spawn_failures: u64,
    /// Requests that produced a successful response.
    pub completed: u64,
    /// Requests the handler answered with a business failure.
    pub handler_errors: u64,
    /// Requests with no matching completion before the deadline.
    pub timeouts: u64,
    /// Requests whose handler went away mid-flight.
    pub disconnects: u64,
    /// Completions dropped because their token matched nothing.
    pub anomalies: u64,
    /// Acquires that failed for lack of capacity.
    pub exhausted: u64,
    /// Time since pool creation.
    pub uptime: Duration,
}

impl PoolMetrics {
    /// Calculate request success rate (0.0 to 1.0).
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        let total = self.completed + self.handler_errors + self.timeouts + self.disconnects;
        if total == 0 {
            return 1.0;
        }
        self.completed as f64 / total as f64
    }

    /// Folds another endpoint's counters into this one.
    #[must_use]
    pub fn merge(mut self, other: &Self) -> Self {
        self.slots_created += other.slots_created;
        self.slots_discarded += other.slots_discarded;
        self.cold_spawns += other.cold_spawns;
        self.replacement_spawns += other.replacement_spawns;
        self.spawn_failures += other.spawn_failures;
        self.completed += other.completed;
        self.handler_errors += other.handler_errors;
        self.timeouts += other.timeouts;
        self.disconnects += other.disconnects;
        self.anomalies += other.anomalies;
        self.exhausted += other.exhausted;
        self.uptime = self.uptime.max(other.uptime);
        self
    }
}
