//! Endpoint registry: the public face of the pool.
//!
//! [`HandlerPool`] owns one [`EndpointPool`] per configured endpoint,
//! pre-warms them at startup and routes each request by endpoint name.
//! Endpoints are fully independent: a slow, exhausted or failing endpoint
//! never blocks another one.

use crate::{
    common::{
        error::{Error, Result},
        types::{Payload, RequestContext},
    },
    pool::{
        config::PoolConfig,
        handler::HandlerFactory,
        manager::{EndpointPool, Shared},
        metrics::{PoolMetrics, PoolStatus},
    },
};
use std::{
    collections::BTreeMap,
    sync::{Arc, atomic::AtomicU64},
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// A pool of isolated handler instances, partitioned by endpoint.
///
/// Cheap to clone; all clones share the same slots.
pub struct HandlerPool<F: HandlerFactory> {
    inner: Arc<Inner<F>>,
}

struct Inner<F: HandlerFactory> {
    endpoints: BTreeMap<String, Arc<EndpointPool<F>>>,
    shared: Shared,
    shutdown_grace: core::time::Duration,
}

impl<F: HandlerFactory> Clone for HandlerPool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: HandlerFactory> HandlerPool<F> {
    /// Validates `config`, builds every endpoint pool and pre-warms them all
    /// concurrently. Returns once every endpoint holds `min_idle` idle
    /// slots.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidConfig`] if the configuration is inconsistent.
    /// - [`Error::SpawnFailure`] if any pre-warm spawn fails. Slots created
    ///   before the failure are shut down.
    pub async fn start(config: PoolConfig, factory: F) -> Result<Self> {
        config.validate()?;

        let factory = Arc::new(factory);
        let shared = Shared {
            slot_ids: Arc::new(AtomicU64::new(1)),
            closing: CancellationToken::new(),
            force: CancellationToken::new(),
            replacement_retries: config.replacement_retries,
            replacement_backoff: config.replacement_backoff,
            created_at: Instant::now(),
        };
        let endpoints = config
            .endpoints
            .iter()
            .map(|(name, endpoint)| {
                let pool = EndpointPool::new(name, *endpoint, Arc::clone(&factory), shared.clone());
                (name.clone(), pool)
            })
            .collect::<BTreeMap<_, _>>();

        let pool = Self {
            inner: Arc::new(Inner {
                endpoints,
                shared,
                shutdown_grace: config.shutdown_grace,
            }),
        };

        #[cfg(feature = "tracing")]
        tracing::info!(
            endpoints = pool.inner.endpoints.len(),
            "Pre-warming handler pools"
        );

        let warmed = futures::future::join_all(
            pool.inner.endpoints.values().map(|endpoint| endpoint.prewarm()),
        )
        .await;
        if let Some(Err(e)) = warmed.into_iter().find(Result::is_err) {
            #[cfg(feature = "tracing")]
            tracing::error!("Pre-warm failed, aborting startup: {e}");
            pool.shutdown().await;
            return Err(e);
        }

        Ok(pool)
    }

    /// Runs `request` on an isolated handler instance of `endpoint`.
    ///
    /// # Errors
    ///
    /// - [`Error::UnknownEndpoint`] if no pool exists for `endpoint`.
    /// - Any capacity, dispatch or handler error from the endpoint's pool.
    pub async fn submit(
        &self,
        endpoint: &str,
        request: Payload,
        context: RequestContext,
    ) -> Result<Payload> {
        let Some(pool) = self.inner.endpoints.get(endpoint) else {
            return Err(Error::UnknownEndpoint {
                endpoint: endpoint.to_string(),
            });
        };
        pool.submit(request, context).await
    }

    pub fn has_endpoint(&self, endpoint: &str) -> bool {
        self.inner.endpoints.contains_key(endpoint)
    }

    /// Configured endpoint names, sorted.
    pub fn endpoints(&self) -> impl Iterator<Item = &str> {
        self.inner.endpoints.keys().map(String::as_str)
    }

    pub fn status(&self, endpoint: &str) -> Option<PoolStatus> {
        self.inner.endpoints.get(endpoint).map(|pool| pool.status())
    }

    pub fn statuses(&self) -> Vec<PoolStatus> {
        self.inner.endpoints.values().map(|pool| pool.status()).collect()
    }

    pub fn endpoint_metrics(&self, endpoint: &str) -> Option<PoolMetrics> {
        self.inner.endpoints.get(endpoint).map(|pool| pool.metrics())
    }

    /// Counters summed over every endpoint.
    pub fn metrics(&self) -> PoolMetrics {
        self.inner
            .endpoints
            .values()
            .fold(PoolMetrics::default(), |acc, pool| acc.merge(&pool.metrics()))
    }

    /// Whether [`shutdown`](Self::shutdown) has begun.
    pub fn is_closed(&self) -> bool {
        self.inner.shared.closing.is_cancelled()
    }

    /// Gracefully shuts the pool down.
    ///
    /// - Refuses new acquires and wakes every waiting caller.
    /// - Waits up to `shutdown_grace` for busy slots to finish.
    /// - Cancels whatever is still running; those callers get
    ///   [`Error::ShuttingDown`] and their slots are discarded.
    /// - Stops pending replacement spawns and closes every idle handler.
    ///
    /// Calling it again is a no-op.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if inner.shared.closing.is_cancelled() {
            return;
        }

        // === Phase 0: Stop accepting new requests ===
        #[cfg(feature = "tracing")]
        tracing::info!("Refusing new requests");
        inner.shared.closing.cancel();
        for pool in inner.endpoints.values() {
            pool.close();
        }

        // === Phase 1: Wait for busy slots to drain ===
        let deadline = Instant::now() + inner.shutdown_grace;
        let drained =
            futures::future::join_all(inner.endpoints.values().map(|pool| pool.drain(deadline)))
                .await;
        if drained.iter().all(|done| *done) {
            #[cfg(feature = "tracing")]
            tracing::debug!("All in-flight requests drained");
        } else {
            #[cfg(feature = "tracing")]
            tracing::warn!(
                busy = inner.endpoints.values().map(|p| p.status().busy).sum::<usize>(),
                "Graceful drain timed out"
            );
        }

        // === Phase 2: Cancel any remaining work ===
        inner.shared.force.cancel();

        // === Phase 3: Close idle handlers ===
        futures::future::join_all(inner.endpoints.values().map(|pool| pool.teardown())).await;

        #[cfg(feature = "tracing")]
        tracing::info!("Handler pool shutdown complete");
    }
}

impl<F: HandlerFactory> core::fmt::Debug for HandlerPool<F> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HandlerPool")
            .field("endpoints", &self.inner.endpoints.keys().collect::<Vec<_>>())
            .field("closed", &self.is_closed())
            .finish()
    }
}
