//! The handler factory contract.
//!
//! Business logic reaches the pool through two seams:
//!
//! - [`HandlerFactory`] builds a fresh, isolated [`Handler`] for an endpoint
//!   name. The pool calls it for pre-warming, cold spawns and replacements.
//! - [`Handler`] is the product: an input channel that accepts
//!   [`WorkRequest`]s and an output stream of [`Completion`]s. The output
//!   stream belongs to exactly one slot and is torn down with it.
//!
//! Most handlers do not need to drive the channels by hand; implementing
//! [`HandlerLogic`] and passing it to [`spawn_worker`](crate::spawn_worker)
//! yields a task-backed [`Handler`].

use crate::common::{
    error::SpawnError,
    types::{Completion, Envelope, HandlerFailure, Payload, RequestContext},
};
use core::{future::Future, time::Duration};
use tokio::{
    sync::{mpsc, oneshot},
    task::AbortHandle,
    time::timeout,
};

/// Messages accepted on a handler's input channel.
#[derive(Debug)]
pub enum WorkRequest {
    /// Process one request and emit exactly one [`Completion`] carrying the
    /// envelope's token.
    Process(Envelope),
    /// Stop after acknowledging on `response`.
    Shutdown { response: oneshot::Sender<()> },
}

/// Builds isolated handler instances by endpoint name.
///
/// Every call must return an instance that shares no mutable state with any
/// instance returned earlier.
pub trait HandlerFactory: Send + Sync + 'static {
    /// Creates and initialises a new handler for `endpoint`.
    fn create(&self, endpoint: &str) -> impl Future<Output = Result<Handler, SpawnError>> + Send;
}

/// Business logic run by a task-backed handler.
///
/// The value is owned by one worker task for the lifetime of one slot, so
/// `&mut self` state is never observed by two requests at once. Whether it
/// survives across requests depends on the endpoint's
/// [`ReusePolicy`](crate::ReusePolicy).
pub trait HandlerLogic: Send + 'static {
    fn handle(
        &mut self,
        request: Payload,
        context: &RequestContext,
    ) -> impl Future<Output = Result<Payload, HandlerFailure>> + Send;
}

/// One isolated handler instance as produced by a [`HandlerFactory`].
pub struct Handler {
    input: mpsc::Sender<WorkRequest>,
    events: Option<mpsc::Receiver<Completion>>,
    task: Option<AbortHandle>,
}

impl Handler {
    /// Wraps the two channels of a handler instance.
    pub const fn new(
        input: mpsc::Sender<WorkRequest>,
        events: mpsc::Receiver<Completion>,
    ) -> Self {
        Self {
            input,
            events: Some(events),
            task: None,
        }
    }

    /// Attaches the task driving this handler so teardown can stop it.
    #[must_use]
    pub fn with_task(mut self, task: AbortHandle) -> Self {
        self.task = Some(task);
        self
    }

    /// Sends a request into the input channel.
    ///
    /// # Errors
    ///
    /// Fails if the handler's input channel has closed.
    pub async fn send(
        &self,
        envelope: Envelope,
    ) -> Result<(), mpsc::error::SendError<WorkRequest>> {
        self.input.send(WorkRequest::Process(envelope)).await
    }

    /// Whether the handler's input channel has closed.
    pub fn is_closed(&self) -> bool {
        self.input.is_closed()
    }

    /// Moves the output stream out so a slot-scoped listener can own it.
    pub(crate) fn take_events(&mut self) -> Option<mpsc::Receiver<Completion>> {
        self.events.take()
    }

    /// Asks the handler to stop and waits up to `wait` for the
    /// acknowledgement. Returns whether it was acknowledged.
    pub async fn shutdown(&self, wait: Duration) -> bool {
        let (tx, rx) = oneshot::channel();
        if self
            .input
            .send(WorkRequest::Shutdown { response: tx })
            .await
            .is_err()
        {
            return false;
        }
        matches!(timeout(wait, rx).await, Ok(Ok(())))
    }
}

impl Drop for Handler {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl core::fmt::Debug for Handler {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Handler")
            .field("closed", &self.input.is_closed())
            .field("listening", &self.events.is_some())
            .field("task", &self.task.is_some())
            .finish()
    }
}
