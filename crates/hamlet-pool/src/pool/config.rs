//! Pool configuration.
//!
//! Configuration is supplied once at startup and is immutable afterwards.
//! Each endpoint gets its own [`EndpointConfig`]; the [`PoolConfig`] holds
//! the static endpoint map produced by the generation layer together with
//! the pool-wide lifecycle settings.

use crate::common::error::{Error, Result};
use core::time::Duration;
use std::collections::BTreeMap;

/// What `acquire` does when every slot is busy and the endpoint is at
/// `max_size`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Backpressure {
    /// Return [`Error::PoolExhausted`] immediately.
    FailFast,
    /// Wait up to `acquire_timeout` for a slot, then return
    /// [`Error::AcquireTimeout`].
    #[default]
    Wait,
}

/// Whether a slot that completed a request cleanly may serve another one.
///
/// Reuse is an explicit per-endpoint opt-in for handlers whose contract
/// guarantees that no mutable state survives a completed cycle. Every other
/// endpoint discards a slot after one use and relies on pre-warmed
/// replacements for latency.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReusePolicy {
    #[default]
    DiscardAfterUse,
    /// Return cleanly completed slots to the idle set (subject to
    /// `max_idle`), including after handler-reported business errors.
    Reuse,
}

/// Sizing, timeout and policy settings for one endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EndpointConfig {
    /// Idle slots kept warm; pre-spawned at startup and restored after
    /// discards.
    pub min_idle: usize,
    /// Upper bound on idle slots at rest.
    pub max_idle: usize,
    /// Upper bound on idle + busy + spawning slots.
    pub max_size: usize,
    /// Longest a caller waits for a slot under [`Backpressure::Wait`].
    pub acquire_timeout: Duration,
    /// Longest a handler may take to produce a matching completion.
    pub request_timeout: Duration,
    /// Longest a single handler creation may take.
    pub spawn_timeout: Duration,
    pub backpressure: Backpressure,
    pub reuse: ReusePolicy,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            min_idle: 2,
            max_idle: 4,
            max_size: 10,
            acquire_timeout: Duration::from_secs(1),
            request_timeout: Duration::from_secs(5),
            spawn_timeout: Duration::from_secs(2),
            backpressure: Backpressure::Wait,
            reuse: ReusePolicy::DiscardAfterUse,
        }
    }
}

impl EndpointConfig {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn min_idle(mut self, count: usize) -> Self {
        self.min_idle = count;
        self
    }

    #[must_use]
    pub const fn max_idle(mut self, count: usize) -> Self {
        self.max_idle = count;
        self
    }

    #[must_use]
    pub const fn max_size(mut self, count: usize) -> Self {
        self.max_size = count;
        self
    }

    #[must_use]
    pub const fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn spawn_timeout(mut self, timeout: Duration) -> Self {
        self.spawn_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn backpressure(mut self, policy: Backpressure) -> Self {
        self.backpressure = policy;
        self
    }

    #[must_use]
    pub const fn reuse(mut self, policy: ReusePolicy) -> Self {
        self.reuse = policy;
        self
    }

    /// Checks the sizing and timeout invariants for `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `max_size` is zero, if
    /// `min_idle <= max_idle <= max_size` does not hold, or if any timeout is
    /// zero.
    pub fn validate(&self, endpoint: &str) -> Result<()> {
        if self.max_size == 0 {
            return Err(Error::invalid_config(format!(
                "{endpoint}: max_size must be greater than 0"
            )));
        }
        if self.max_idle > self.max_size {
            return Err(Error::invalid_config(format!(
                "{endpoint}: max_idle ({}) exceeds max_size ({})",
                self.max_idle, self.max_size
            )));
        }
        if self.min_idle > self.max_idle {
            return Err(Error::invalid_config(format!(
                "{endpoint}: min_idle ({}) exceeds max_idle ({})",
                self.min_idle, self.max_idle
            )));
        }
        for (name, value) in [
            ("acquire_timeout", self.acquire_timeout),
            ("request_timeout", self.request_timeout),
            ("spawn_timeout", self.spawn_timeout),
        ] {
            if value.is_zero() {
                return Err(Error::invalid_config(format!(
                    "{endpoint}: {name} must be greater than 0"
                )));
            }
        }
        Ok(())
    }
}

/// Static endpoint map plus pool-wide lifecycle settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    pub endpoints: BTreeMap<String, EndpointConfig>,
    /// How long shutdown waits for in-flight requests before tearing busy
    /// slots down.
    pub shutdown_grace: Duration,
    /// Attempts per background replacement spawn before giving up.
    pub replacement_retries: u32,
    /// Delay before the first replacement retry; doubles per attempt.
    pub replacement_backoff: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            endpoints: BTreeMap::new(),
            shutdown_grace: Duration::from_secs(3),
            replacement_retries: 3,
            replacement_backoff: Duration::from_millis(50),
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or replaces) the configuration for `name`.
    #[must_use]
    pub fn endpoint(mut self, name: impl Into<String>, config: EndpointConfig) -> Self {
        self.endpoints.insert(name.into(), config);
        self
    }

    #[must_use]
    pub const fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    #[must_use]
    pub const fn replacement_retries(mut self, attempts: u32) -> Self {
        self.replacement_retries = attempts;
        self
    }

    #[must_use]
    pub const fn replacement_backoff(mut self, delay: Duration) -> Self {
        self.replacement_backoff = delay;
        self
    }

    /// Validates every endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if no endpoint is configured, if an
    /// endpoint name is empty, or if any endpoint fails
    /// [`EndpointConfig::validate`].
    pub fn validate(&self) -> Result<()> {
        if self.endpoints.is_empty() {
            return Err(Error::invalid_config("at least one endpoint is required"));
        }
        for (name, endpoint) in &self.endpoints {
            if name.trim().is_empty() {
                return Err(Error::invalid_config("endpoint names must not be empty"));
            }
            endpoint.validate(name)?;
        }
        Ok(())
    }
}
