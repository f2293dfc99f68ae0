//! # Shared Request, Completion and Identity Types
//!
//! This module defines the values that travel between the pool and the
//! handler instances it manages. Handlers never see pool internals; they only
//! receive [`Envelope`]s on their input channel and emit [`Completion`]s on
//! their output stream.
//!
//! ## Overview
//!
//! - [`Payload`] - Request and response bodies (any JSON value)
//! - [`RequestContext`] - Per-request metadata forwarded untouched
//! - [`SlotId`] - Identity of one handler instance for its whole lifetime
//! - [`CorrelationToken`] - Binds one request to its completion event
//! - [`HandlerFailure`] - A business-level error reported by a handler

use core::fmt;
use serde::{Deserialize, Serialize};

/// Request and response body exchanged with handlers.
///
/// The pool does not inspect payloads; any serializable value is accepted.
pub type Payload = serde_json::Value;

/// Metadata attached to every submitted request.
///
/// The dispatch front fills this from the transport (headers, session) and
/// the pool forwards it to the handler as-is.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    pub request_id: String,
    pub host: String,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
}

impl RequestContext {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            host: String::from("localhost"),
            user_id: None,
            session_id: None,
        }
    }

    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    #[must_use]
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    #[must_use]
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

/// Identity of a single handler instance.
///
/// Slot IDs are allocated from a pool-wide counter and are never reused, so a
/// token minted by one slot can always be told apart from another slot's.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlotId(pub u64);

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot-{}", self.0)
    }
}

/// Unique identifier binding a request to its eventual completion event.
///
/// A token is the pair of the issuing slot and a per-slot sequence number.
/// Sequence numbers increase monotonically for the lifetime of the slot, so a
/// token never collides within an instance's lifetime, and the slot component
/// makes tokens from different instances distinct as well.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationToken {
    pub slot: SlotId,
    pub seq: u64,
}

impl CorrelationToken {
    pub const fn new(slot: SlotId, seq: u64) -> Self {
        Self { slot, seq }
    }
}

impl fmt::Display for CorrelationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.slot, self.seq)
    }
}

/// A business-level failure explicitly reported by a handler.
///
/// Surfaced to the caller verbatim; it says nothing about the health of the
/// handler instance that produced it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerFailure {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Payload>,
}

impl HandlerFailure {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    #[must_use]
    pub fn with_details(mut self, details: Payload) -> Self {
        self.details = Some(details);
        self
    }
}

impl fmt::Display for HandlerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// A request as delivered to a handler's input channel.
#[derive(Clone, Debug)]
pub struct Envelope {
    pub token: CorrelationToken,
    pub request: Payload,
    pub context: RequestContext,
}

/// A completion event emitted on a handler's output stream.
#[derive(Clone, Debug)]
pub struct Completion {
    pub token: CorrelationToken,
    pub outcome: Result<Payload, HandlerFailure>,
}

impl Completion {
    pub const fn ok(token: CorrelationToken, response: Payload) -> Self {
        Self {
            token,
            outcome: Ok(response),
        }
    }

    pub const fn err(token: CorrelationToken, failure: HandlerFailure) -> Self {
        Self {
            token,
            outcome: Err(failure),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_from_different_slots_differ() {
        let a = CorrelationToken::new(SlotId(1), 7);
        let b = CorrelationToken::new(SlotId(2), 7);
        assert_ne!(a, b);
        assert_eq!(a.to_string(), "slot-1#7");
    }

    #[test]
    fn context_builder_fills_optional_fields() {
        let ctx = RequestContext::new("req-1")
            .with_host("tenant.example")
            .with_user("u1")
            .with_session("s1");
        assert_eq!(ctx.host, "tenant.example");
        assert_eq!(ctx.user_id.as_deref(), Some("u1"));
        assert_eq!(ctx.session_id.as_deref(), Some("s1"));
    }

    #[test]
    fn failure_serializes_without_empty_details() {
        let failure = HandlerFailure::new("invalid", "missing field");
        let json = serde_json::to_value(&failure).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"code": "invalid", "message": "missing field"})
        );
    }
}
