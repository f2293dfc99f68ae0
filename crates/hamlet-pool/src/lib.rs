#![doc = include_str!("../README.md")]

mod common;
mod pool;

pub use crate::common::{
    error::{Error, ErrorKind, Result, SpawnError},
    types::{
        Completion, CorrelationToken, Envelope, HandlerFailure, Payload, RequestContext, SlotId,
    },
};
pub use crate::pool::{
    config::{Backpressure, EndpointConfig, PoolConfig, ReusePolicy},
    dispatcher::{
        CompletionMatch, CorrelationDispatcher, PendingRequest, Phase, Resolution, Resolver,
    },
    handler::{Handler, HandlerFactory, HandlerLogic, WorkRequest},
    instance::{DispatchError, Instance},
    metrics::{PoolMetrics, PoolStatus},
    registry::HandlerPool,
    worker::spawn_worker,
};

#[cfg(test)]
mod tests;
