//! Built-in endpoint handlers.
//!
//! Business handlers come from the generation layer; these exist so the
//! server is runnable on its own and to exercise the pool end to end.
//!
//! - `Echo` answers with the request body and the request id.
//! - `Delay` sleeps for `ms` milliseconds (default 100) before answering.
//! - `Fail` always reports a business failure.

use core::time::Duration;
use hamlet_pool::{
    Handler, HandlerFactory, HandlerFailure, HandlerLogic, Payload, RequestContext, SpawnError,
    spawn_worker,
};
use serde_json::json;

pub const BUILTIN_ENDPOINTS: &[&str] = &["Echo", "Delay", "Fail"];

const DEFAULT_DELAY_MS: u64 = 100;

/// Creates a fresh built-in handler for each slot.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinFactory;

impl HandlerFactory for BuiltinFactory {
    async fn create(&self, endpoint: &str) -> Result<Handler, SpawnError> {
        let name = endpoint.to_string();
        match endpoint {
            "Echo" => Ok(spawn_worker(name, Echo::default())),
            "Delay" => Ok(spawn_worker(name, Delay)),
            "Fail" => Ok(spawn_worker(name, Fail)),
            _ => Err(SpawnError::UnknownEndpoint(name)),
        }
    }
}

/// Echoes its input. Counts the requests it has served so reuse is visible
/// from the outside.
#[derive(Debug, Default)]
pub struct Echo {
    served: u64,
}

impl HandlerLogic for Echo {
    async fn handle(
        &mut self,
        request: Payload,
        context: &RequestContext,
    ) -> Result<Payload, HandlerFailure> {
        self.served += 1;
        Ok(json!({
            "echo": request,
            "request_id": context.request_id,
            "host": context.host,
            "user_id": context.user_id,
            "session_id": context.session_id,
            "served": self.served,
        }))
    }
}

#[derive(Debug)]
pub struct Delay;

impl HandlerLogic for Delay {
    async fn handle(
        &mut self,
        request: Payload,
        _context: &RequestContext,
    ) -> Result<Payload, HandlerFailure> {
        let ms = match request.get("ms") {
            None => DEFAULT_DELAY_MS,
            Some(value) => value.as_u64().ok_or_else(|| {
                HandlerFailure::new("invalid_input", "`ms` must be a non-negative integer")
                    .with_details(json!({ "ms": value }))
            })?,
        };
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(json!({ "slept_ms": ms }))
    }
}

#[derive(Debug)]
pub struct Fail;

impl HandlerLogic for Fail {
    async fn handle(
        &mut self,
        request: Payload,
        _context: &RequestContext,
    ) -> Result<Payload, HandlerFailure> {
        let message = request
            .get("message")
            .and_then(Payload::as_str)
            .unwrap_or("failure requested");
        Err(HandlerFailure::new("requested_failure", message))
    }
}
