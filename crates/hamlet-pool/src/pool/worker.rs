use crate::{
    common::types::Completion,
    pool::handler::{Handler, HandlerLogic, WorkRequest},
};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Capacity of a task-backed handler's completion stream.
///
/// A slot has at most one request in flight, so a handful of slots is enough
/// to absorb a late or duplicate completion without stalling the worker.
const EVENT_BUFFER: usize = 4;

/// Spawns a Tokio task that runs `logic` behind a fresh [`Handler`].
///
/// The input channel has a capacity of one: the pool never sends a second
/// request to a slot before the first one has completed, so a deeper buffer
/// would only hide protocol violations.
///
/// Must be called from within a Tokio runtime.
pub fn spawn_worker<L: HandlerLogic>(name: impl Into<Arc<str>>, logic: L) -> Handler {
    let (input_tx, input_rx) = mpsc::channel(1);
    let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
    let task = tokio::spawn(worker_loop(name.into(), input_rx, events_tx, logic));
    Handler::new(input_tx, events_rx).with_task(task.abort_handle())
}

/// Worker task responsible for processing [`WorkRequest`] messages.
///
/// Each worker owns its own [`HandlerLogic`] value. The worker listens on an
/// MPSC channel and processes requests one at a time until a shutdown signal
/// is received or the input channel closes.
///
/// # Arguments
///
/// - `_name`: Label used in logs/tracing (usually the endpoint name).
/// - `rx`: Receiver through which [`WorkRequest`]s are received.
/// - `events`: Output stream on which one [`Completion`] per request is
///   emitted, tagged with the request's token.
/// - `logic`: The state value driving this handler instance.
///
/// # Request Types
///
/// - [`WorkRequest::Process`] - Runs the logic and emits its completion.
/// - [`WorkRequest::Shutdown`] - Signals the worker to stop and acknowledge
///   shutdown.
#[allow(clippy::used_underscore_binding)]
pub async fn worker_loop<L: HandlerLogic>(
    _name: Arc<str>,
    mut rx: mpsc::Receiver<WorkRequest>,
    events: mpsc::Sender<Completion>,
    mut logic: L,
) {
    #[cfg(feature = "tracing")]
    tracing::trace!("Handler worker {_name} started");

    while let Some(work) = rx.recv().await {
        match work {
            WorkRequest::Process(envelope) => {
                let outcome = logic.handle(envelope.request, &envelope.context).await;
                let completion = Completion {
                    token: envelope.token,
                    outcome,
                };
                if let Err(_e) = events.send(completion).await {
                    #[cfg(feature = "tracing")]
                    tracing::debug!("Handler worker {_name} lost its listener: {_e}");
                    break;
                }
            }
            WorkRequest::Shutdown { response } => {
                #[cfg(feature = "tracing")]
                tracing::debug!("Handler worker {_name} received shutdown signal");

                if response.send(()).is_err() {
                    #[cfg(feature = "tracing")]
                    tracing::error!("Handler worker {_name} failed to acknowledge shutdown");
                }
                break;
            }
        }
    }

    #[cfg(feature = "tracing")]
    tracing::trace!("Handler worker {_name} stopped");
}
