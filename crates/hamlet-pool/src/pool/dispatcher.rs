//! Per-slot correlation of completions to callers.
//!
//! Every slot owns one [`CorrelationDispatcher`]. It holds at most one
//! [`PendingRequest`], and a pending entry lives for exactly one request:
//! it is created when the request is sent and destroyed when it is resolved,
//! expires, or the handler disconnects. A completion whose token does not
//! match the live entry is reported as [`CompletionMatch::Unmatched`] and is
//! never used to resolve anything, so a late or foreign completion cannot
//! reach a caller it was not meant for.
//!
//! ```text
//! Empty ─register─▶ AwaitingCompletion(token) ─┬─ match ───▶ Resolved
//!                                              ├─ deadline ▶ TimedOut   (discard)
//!                                              ├─ closed ──▶ Disconnected (discard)
//!                                              └─ foreign ─▶ (tainted, keeps waiting)
//! Resolved / Empty ─ any completion ─▶ Anomaly (discard)
//! ```

use crate::common::types::{CorrelationToken, HandlerFailure, Payload, SlotId};
use tokio::{sync::oneshot, time::Instant};

/// How a pending request was resolved by the listener.
#[derive(Debug)]
pub enum Resolution {
    /// A completion with the matching token arrived.
    Completed(Result<Payload, HandlerFailure>),
    /// The handler's output stream ended while the request was pending.
    Disconnected,
}

pub type Resolver = oneshot::Sender<Resolution>;

/// The single outstanding request of a slot.
#[derive(Debug)]
pub struct PendingRequest {
    pub token: CorrelationToken,
    pub resolver: Resolver,
    pub deadline: Instant,
}

/// Where a slot's routing state currently stands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Empty,
    AwaitingCompletion(CorrelationToken),
    Resolved,
    TimedOut,
    Anomaly,
    Disconnected,
}

/// Result of offering a completion to the dispatcher.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompletionMatch {
    /// The completion resolved the live request.
    Matched,
    /// No live request carries this token. The completion was dropped.
    Unmatched,
}

#[derive(Debug)]
pub struct CorrelationDispatcher {
    slot: SlotId,
    pending: Option<PendingRequest>,
    phase: Phase,
    tainted: bool,
    anomalies: u64,
}

impl CorrelationDispatcher {
    pub const fn new(slot: SlotId) -> Self {
        Self {
            slot,
            pending: None,
            phase: Phase::Empty,
            tainted: false,
            anomalies: 0,
        }
    }

    /// Registers the slot's next request.
    ///
    /// Expired entries are collected first. If a live entry remains, the
    /// registration is refused and the live token is returned; a slot never
    /// has two requests outstanding.
    pub fn register(
        &mut self,
        token: CorrelationToken,
        resolver: Resolver,
        deadline: Instant,
    ) -> Result<(), CorrelationToken> {
        self.sweep(Instant::now());
        if let Some(live) = &self.pending {
            self.tainted = true;
            return Err(live.token);
        }
        self.pending = Some(PendingRequest {
            token,
            resolver,
            deadline,
        });
        self.phase = Phase::AwaitingCompletion(token);
        Ok(())
    }

    /// Offers a completion event.
    ///
    /// Resolves and clears the live entry on a token match. Anything else is
    /// an anomaly: the event is dropped, the slot is tainted, and the caller
    /// must not treat it as success.
    pub fn complete(
        &mut self,
        token: CorrelationToken,
        outcome: Result<Payload, HandlerFailure>,
    ) -> CompletionMatch {
        match self.pending.take() {
            Some(pending) if pending.token == token => {
                // The waiting side may already have given up; that is fine.
                let _ = pending.resolver.send(Resolution::Completed(outcome));
                self.phase = Phase::Resolved;
                CompletionMatch::Matched
            }
            other => {
                self.pending = other;
                self.tainted = true;
                self.anomalies += 1;
                if self.pending.is_none() {
                    self.phase = Phase::Anomaly;
                }
                CompletionMatch::Unmatched
            }
        }
    }

    /// Drops the live entry for `token` after its deadline elapsed.
    ///
    /// Returns `false` if the entry was already gone (resolved or collected).
    pub fn expire(&mut self, token: CorrelationToken) -> bool {
        match &self.pending {
            Some(pending) if pending.token == token => {
                self.pending = None;
                self.phase = Phase::TimedOut;
                true
            }
            _ => false,
        }
    }

    /// Collects the live entry if its deadline has passed, so a hung handler
    /// cannot keep a resolver alive forever. Returns the number collected.
    pub fn sweep(&mut self, now: Instant) -> usize {
        match &self.pending {
            Some(pending) if pending.deadline <= now => {
                // Dropping the resolver wakes the waiting side with an error.
                self.pending = None;
                self.phase = Phase::TimedOut;
                1
            }
            _ => 0,
        }
    }

    /// Marks the handler as gone, resolving any live entry accordingly.
    pub fn disconnect(&mut self) {
        if let Some(pending) = self.pending.take() {
            let _ = pending.resolver.send(Resolution::Disconnected);
        }
        self.phase = Phase::Disconnected;
    }

    /// Whether the slot ended in a state that forbids reuse.
    pub const fn requires_discard(&self) -> bool {
        self.tainted
            || matches!(
                self.phase,
                Phase::TimedOut | Phase::Anomaly | Phase::Disconnected
            )
    }

    pub const fn phase(&self) -> Phase {
        self.phase
    }

    pub const fn slot(&self) -> SlotId {
        self.slot
    }

    pub const fn anomalies(&self) -> u64 {
        self.anomalies
    }

    pub const fn is_empty(&self) -> bool {
        self.pending.is_none()
    }
}
