//! Error types for the handler pool.
//!
//! This module defines the central `Error` enum returned by every outward
//! facing pool operation. Nothing crosses the pool boundary as a panic; the
//! dispatch front receives one of these values and picks a status code or
//! retry policy from [`Error::kind`].
//!
//! ## Error Cases
//! - `UnknownEndpoint`: No pool is configured for the requested endpoint.
//! - `SpawnFailure`: The handler factory failed to initialise a slot on the
//!   synchronous acquire path.
//! - `PoolExhausted`: No slot was free and the endpoint fails fast.
//! - `AcquireTimeout`: No slot freed up within the bounded wait.
//! - `DispatchTimeout`: No matching completion arrived within the request
//!   timeout.
//! - `HandlerError`: The handler reported a business-level failure.
//! - `HandlerDisconnected`: The handler's channels closed mid-request.
//! - `ShuttingDown`: The pool is draining or closed.
//! - `InvalidConfig`: The pool configuration violates an invariant.
//!
//! Correlation anomalies are deliberately absent: they are dropped and logged
//! inside the instance wrapper and never resolve any caller.

use crate::common::types::HandlerFailure;
use core::time::Duration;

pub type Result<T> = core::result::Result<T, Error>;

/// Failure reported by a [`HandlerFactory`](crate::HandlerFactory) while
/// creating a handler instance.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum SpawnError {
    /// The factory has no handler for this endpoint name.
    #[error("no handler registered for endpoint `{0}`")]
    UnknownEndpoint(String),

    /// The handler could not be initialised.
    #[error("handler initialisation failed: {0}")]
    Init(String),

    /// Initialisation did not finish within the spawn timeout.
    #[error("handler initialisation timed out after {0:?}")]
    Timeout(Duration),
}

/// Unified error type for the handler pool.
#[derive(Clone, thiserror::Error, Debug)]
pub enum Error {
    /// No pool is configured under this endpoint name.
    #[error("Unknown endpoint: {endpoint}")]
    UnknownEndpoint { endpoint: String },

    /// A cold spawn on the acquire path failed.
    #[error("Failed to spawn handler for {endpoint}: {source}")]
    SpawnFailure {
        endpoint: String,
        #[source]
        source: SpawnError,
    },

    /// Fail-fast backpressure: every slot is busy and the pool is at capacity.
    #[error("Pool exhausted for {endpoint}")]
    PoolExhausted { endpoint: String },

    /// Bounded-wait backpressure: no slot became free in time.
    #[error("Timed out after {waited:?} waiting for a free {endpoint} handler")]
    AcquireTimeout { endpoint: String, waited: Duration },

    /// No matching completion arrived before the request deadline.
    #[error("Handler {endpoint} did not complete within {timeout:?}")]
    DispatchTimeout { endpoint: String, timeout: Duration },

    /// The handler reported a business-level failure.
    #[error("Handler {endpoint} failed: {failure}")]
    HandlerError {
        endpoint: String,
        failure: HandlerFailure,
    },

    /// The handler's input or output channel closed while a request was
    /// pending.
    #[error("Handler {endpoint} disconnected")]
    HandlerDisconnected { endpoint: String },

    /// The pool is in the process of shutting down.
    #[error("Pool is shutting down")]
    ShuttingDown,

    /// The pool configuration is invalid.
    #[error("Invalid pool configuration: {reason}")]
    InvalidConfig { reason: String },
}

/// Coarse classification of an [`Error`], for transport-level decisions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The caller asked for something that does not exist or is malformed.
    NotFound,
    /// The pool had no capacity for the request.
    Unavailable,
    /// The handler did not answer in time.
    Timeout,
    /// The handler answered with a business failure.
    Handler,
    /// The pool or a handler instance failed internally.
    Internal,
}

impl Error {
    /// Returns the coarse class of this error.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownEndpoint { .. } => ErrorKind::NotFound,
            Self::PoolExhausted { .. } | Self::AcquireTimeout { .. } | Self::ShuttingDown => {
                ErrorKind::Unavailable
            }
            Self::DispatchTimeout { .. } => ErrorKind::Timeout,
            Self::HandlerError { .. } => ErrorKind::Handler,
            Self::SpawnFailure { .. }
            | Self::HandlerDisconnected { .. }
            | Self::InvalidConfig { .. } => ErrorKind::Internal,
        }
    }

    /// Whether retrying the same request later may succeed.
    ///
    /// Capacity and instance failures are transient because the pool discards
    /// and replaces the affected slots. Business failures and unknown
    /// endpoints are not.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::SpawnFailure { .. }
                | Self::PoolExhausted { .. }
                | Self::AcquireTimeout { .. }
                | Self::DispatchTimeout { .. }
                | Self::HandlerDisconnected { .. }
        )
    }

    pub(crate) fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_errors_are_distinguishable_from_business_errors() {
        let exhausted = Error::PoolExhausted {
            endpoint: "Echo".into(),
        };
        let business = Error::HandlerError {
            endpoint: "Echo".into(),
            failure: HandlerFailure::new("invalid", "bad input"),
        };
        let timeout = Error::DispatchTimeout {
            endpoint: "Echo".into(),
            timeout: Duration::from_secs(5),
        };

        assert_eq!(exhausted.kind(), ErrorKind::Unavailable);
        assert_eq!(business.kind(), ErrorKind::Handler);
        assert_eq!(timeout.kind(), ErrorKind::Timeout);
        assert!(exhausted.is_retryable());
        assert!(timeout.is_retryable());
        assert!(!business.is_retryable());
    }

    #[test]
    fn spawn_failure_keeps_its_source() {
        use std::error::Error as _;

        let err = Error::SpawnFailure {
            endpoint: "Echo".into(),
            source: SpawnError::Init("boom".into()),
        };
        let source = err.source().map(ToString::to_string);
        assert_eq!(source.as_deref(), Some("handler initialisation failed: boom"));
    }
}
