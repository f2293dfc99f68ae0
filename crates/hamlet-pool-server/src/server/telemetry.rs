//! Logging, tracing and metrics for the dispatch front.
//!
//! Console logging through `tracing_subscriber::fmt` is always on and
//! filtered by `RUST_LOG` (default `info`). Everything else is opt-in:
//!
//! - `tracing`: request spans (and the pool's own events inside them) are
//!   exported through OpenTelemetry.
//! - `metrics`: request counters, the in-flight gauge and the duration
//!   histogram, plus observable instruments read straight from the handler
//!   pool (`pool.slots` per endpoint and state, `pool.events` per endpoint
//!   and lifetime counter).
//! - `stdout` / `honeycomb`: where exports go. Either or both, but only
//!   together with `tracing` or `metrics`.
//!
//! Honeycomb reads `HONEYCOMB_ENDPOINT`, `HONEYCOMB_API_KEY`,
//! `HONEYCOMB_DATASET` and `HONEYCOMB_COMPRESSION` (`gzip` or `zstd`) once at
//! startup; spans and metrics share the same target.
//!
//! ```bash
//! cargo run --features tracing,metrics,honeycomb
//! cargo run --features metrics,stdout
//! ```

#[cfg(all(
    any(feature = "honeycomb", feature = "stdout"),
    not(any(feature = "tracing", feature = "metrics"))
))]
compile_error!("Exporters need at least one of the 'tracing' or 'metrics' features.");

use hamlet_pool::{PoolMetrics, PoolStatus};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(feature = "honeycomb")]
use opentelemetry_otlp::{Compression, Protocol, WithExportConfig, WithTonicConfig};
#[cfg(all(feature = "honeycomb", feature = "metrics"))]
use opentelemetry_sdk::metrics::Temporality;
#[cfg(feature = "honeycomb")]
use tonic::{metadata::MetadataMap, transport::ClientTlsConfig};

#[cfg(feature = "metrics")]
use crate::server::service::handler::Pool;
#[cfg(feature = "metrics")]
use opentelemetry::{
    KeyValue,
    metrics::{Counter, Histogram, Meter, ObservableCounter, ObservableGauge, UpDownCounter},
};
#[cfg(feature = "metrics")]
use opentelemetry_sdk::metrics as sdkmetrics;
#[cfg(feature = "metrics")]
use std::sync::OnceLock;

#[cfg(any(feature = "metrics", feature = "tracing"))]
use opentelemetry::InstrumentationScope;
#[cfg(any(feature = "metrics", feature = "tracing"))]
use opentelemetry_sdk::Resource;
#[cfg(any(feature = "metrics", feature = "tracing"))]
use opentelemetry_semantic_conventions as semvcns;

#[cfg(feature = "tracing")]
use opentelemetry::trace::TracerProvider;
#[cfg(feature = "tracing")]
use opentelemetry_sdk::{propagation::TraceContextPropagator, trace as sdktrace};

#[cfg(any(feature = "metrics", feature = "tracing"))]
const SERVICE_NAME: &str = "hamlet-pool-server";

/// Providers to flush and shut down once the pool has drained.
pub struct TelemetryProviders {
    #[cfg(feature = "tracing")]
    pub tracer_provider: sdktrace::SdkTracerProvider,
    #[cfg(feature = "metrics")]
    pub meter_provider: sdkmetrics::SdkMeterProvider,
}

pub fn init_telemetry() -> anyhow::Result<TelemetryProviders> {
    #[cfg(any(feature = "metrics", feature = "tracing"))]
    let exporters = Exporters::from_env()?;

    #[cfg(any(feature = "metrics", feature = "tracing"))]
    let scope = InstrumentationScope::builder("hamlet")
        .with_version(env!("CARGO_PKG_VERSION"))
        .with_schema_url(semvcns::SCHEMA_URL)
        .build();

    let registry = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
                .pretty(),
        );

    #[cfg(feature = "tracing")]
    let (registry, tracer_provider) = {
        opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());
        let provider = init_tracer(&exporters)?;
        opentelemetry::global::set_tracer_provider(provider.clone());
        let layer = tracing_opentelemetry::layer()
            .with_tracer(provider.tracer_with_scope(scope.clone()))
            .with_error_records_to_exceptions(true);
        (registry.with(layer), provider)
    };

    #[cfg(feature = "metrics")]
    let (registry, meter_provider) = {
        let provider = init_meter(&exporters)?;
        opentelemetry::global::set_meter_provider(provider.clone());
        init_request_instruments(opentelemetry::global::meter_with_scope(scope));
        let layer = tracing_opentelemetry::MetricsLayer::new(provider.clone());
        (registry.with(layer), provider)
    };

    registry.init();

    Ok(TelemetryProviders {
        #[cfg(feature = "tracing")]
        tracer_provider,
        #[cfg(feature = "metrics")]
        meter_provider,
    })
}

#[cfg(any(feature = "metrics", feature = "tracing"))]
fn resource() -> Resource {
    Resource::builder()
        .with_service_name(SERVICE_NAME)
        .with_schema_url(
            [opentelemetry::KeyValue::new(
                semvcns::resource::SERVICE_VERSION,
                env!("CARGO_PKG_VERSION"),
            )],
            semvcns::SCHEMA_URL,
        )
        .build()
}

/// Export targets, resolved once from the environment.
#[cfg(any(feature = "metrics", feature = "tracing"))]
struct Exporters {
    #[cfg(feature = "honeycomb")]
    honeycomb: Honeycomb,
}

#[cfg(any(feature = "metrics", feature = "tracing"))]
impl Exporters {
    fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            #[cfg(feature = "honeycomb")]
            honeycomb: Honeycomb::from_env()?,
        })
    }
}

/// One OTLP/gRPC destination shared by the span and metric exporters.
#[cfg(feature = "honeycomb")]
struct Honeycomb {
    endpoint: String,
    compression: Compression,
    metadata: MetadataMap,
}

#[cfg(feature = "honeycomb")]
impl Honeycomb {
    const EXPORT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

    fn from_env() -> anyhow::Result<Self> {
        use anyhow::Context;
        use std::str::FromStr;

        let var = |name: &str| std::env::var(name).with_context(|| format!("missing `{name}`"));

        let mut metadata = MetadataMap::new();
        metadata.insert(
            "x-honeycomb-team",
            var("HONEYCOMB_API_KEY")?
                .parse()
                .context("invalid `HONEYCOMB_API_KEY`")?,
        );
        metadata.insert(
            "x-honeycomb-dataset",
            var("HONEYCOMB_DATASET")?
                .parse()
                .context("invalid `HONEYCOMB_DATASET`")?,
        );
        let compression =
            Compression::from_str(&var("HONEYCOMB_COMPRESSION")?.to_ascii_lowercase())?;

        Ok(Self {
            endpoint: var("HONEYCOMB_ENDPOINT")?,
            compression,
            metadata,
        })
    }

    /// Points a span or metric exporter builder at this destination.
    fn configure<B: WithExportConfig + WithTonicConfig>(&self, builder: B) -> B {
        builder
            .with_tls_config(ClientTlsConfig::new().with_native_roots())
            .with_metadata(self.metadata.clone())
            .with_compression(self.compression)
            .with_endpoint(self.endpoint.clone())
            .with_protocol(Protocol::Grpc)
            .with_timeout(Self::EXPORT_TIMEOUT)
    }
}

#[cfg(all(feature = "tracing", any(feature = "stdout", feature = "honeycomb")))]
fn batched<E: sdktrace::SpanExporter + 'static>(exporter: E) -> sdktrace::BatchSpanProcessor {
    sdktrace::BatchSpanProcessor::builder(exporter)
        .with_batch_config(
            sdktrace::BatchConfigBuilder::default()
                .with_scheduled_delay(std::time::Duration::from_secs(5))
                .with_max_queue_size(2048)
                .build(),
        )
        .build()
}

#[cfg(feature = "tracing")]
#[cfg_attr(not(feature = "honeycomb"), allow(unused_variables))]
fn init_tracer(exporters: &Exporters) -> anyhow::Result<sdktrace::SdkTracerProvider> {
    let builder = sdktrace::SdkTracerProvider::builder().with_resource(resource());

    #[cfg(feature = "stdout")]
    let builder = builder.with_span_processor(batched(opentelemetry_stdout::SpanExporter::default()));

    #[cfg(feature = "honeycomb")]
    let builder = {
        use anyhow::Context;
        let exporter = exporters
            .honeycomb
            .configure(opentelemetry_otlp::SpanExporter::builder().with_tonic())
            .build()
            .context("failed to build span exporter")?;
        builder.with_span_processor(batched(exporter))
    };

    Ok(builder.build())
}

#[cfg(feature = "metrics")]
#[cfg_attr(not(feature = "honeycomb"), allow(unused_variables))]
fn init_meter(exporters: &Exporters) -> anyhow::Result<sdkmetrics::SdkMeterProvider> {
    let builder = sdkmetrics::SdkMeterProvider::builder().with_resource(resource());

    #[cfg(feature = "stdout")]
    let builder = builder.with_reader(
        sdkmetrics::PeriodicReader::builder(opentelemetry_stdout::MetricExporter::default())
            .with_interval(std::time::Duration::from_secs(5))
            .build(),
    );

    #[cfg(feature = "honeycomb")]
    let builder = {
        use anyhow::Context;
        let exporter = exporters
            .honeycomb
            .configure(opentelemetry_otlp::MetricExporter::builder().with_tonic())
            .with_temporality(Temporality::Delta)
            .build()
            .context("failed to build metric exporter")?;
        builder.with_periodic_exporter(exporter)
    };

    Ok(builder.build())
}

// Request instruments, recorded by the HTTP handlers.
#[cfg(feature = "metrics")]
static METER: OnceLock<Meter> = OnceLock::new();
#[cfg(feature = "metrics")]
static REQUESTS: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static REQUESTS_INFLIGHT: OnceLock<UpDownCounter<i64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static REQUEST_ERRORS: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static REQUEST_DURATION_MS: OnceLock<Histogram<f64>> = OnceLock::new();

// Pool instruments are callbacks; the handles only need to stay alive.
#[cfg(feature = "metrics")]
static POOL_INSTRUMENTS: OnceLock<(ObservableGauge<u64>, ObservableCounter<u64>)> =
    OnceLock::new();

#[cfg(feature = "metrics")]
fn init_request_instruments(meter: Meter) {
    let _ = REQUESTS.set(
        meter
            .u64_counter("requests")
            .with_description("Requests received per endpoint")
            .build(),
    );
    let _ = REQUESTS_INFLIGHT.set(
        meter
            .i64_up_down_counter("requests_inflight")
            .with_description("Requests waiting for or running on a handler instance")
            .build(),
    );
    let _ = REQUEST_ERRORS.set(
        meter
            .u64_counter("errors")
            .with_description("Failed requests per endpoint and error kind")
            .build(),
    );
    let _ = REQUEST_DURATION_MS.set(
        meter
            .f64_histogram("request_duration")
            .with_unit("ms")
            .with_description("Time from request to response, acquire included")
            .build(),
    );
    let _ = METER.set(meter);
}

/// Publishes the pool's own occupancy and lifetime counters as observable
/// instruments. A no-op before [`init_telemetry`] or without `metrics`.
#[cfg(feature = "metrics")]
pub fn observe_pool(pool: &Pool) {
    let Some(meter) = METER.get() else {
        return;
    };

    let for_slots = pool.clone();
    let slots = meter
        .u64_observable_gauge("pool.slots")
        .with_description("Handler instances per endpoint and slot state")
        .with_callback(move |observer| {
            for (endpoint, state, value) in slot_readings(&for_slots.statuses()) {
                observer.observe(
                    value,
                    &[
                        KeyValue::new("endpoint", endpoint),
                        KeyValue::new("state", state),
                    ],
                );
            }
        })
        .build();

    let for_events = pool.clone();
    let events = meter
        .u64_observable_counter("pool.events")
        .with_description("Pool lifetime counters per endpoint")
        .with_callback(move |observer| {
            for endpoint in for_events.endpoints() {
                let Some(metrics) = for_events.endpoint_metrics(endpoint) else {
                    continue;
                };
                for (event, value) in event_readings(&metrics) {
                    observer.observe(
                        value,
                        &[
                            KeyValue::new("endpoint", endpoint.to_string()),
                            KeyValue::new("event", event),
                        ],
                    );
                }
            }
        })
        .build();

    let _ = POOL_INSTRUMENTS.set((slots, events));
}

#[cfg(not(feature = "metrics"))]
pub fn observe_pool(_pool: &crate::server::service::handler::Pool) {}

/// `(endpoint, state, count)` for every endpoint and slot state.
#[cfg_attr(not(feature = "metrics"), allow(dead_code))]
fn slot_readings(statuses: &[PoolStatus]) -> Vec<(String, &'static str, u64)> {
    statuses
        .iter()
        .flat_map(|status| {
            [
                ("idle", status.idle),
                ("busy", status.busy),
                ("spawning", status.spawning),
            ]
            .map(|(state, count)| (status.endpoint.clone(), state, count as u64))
        })
        .collect()
}

#[cfg_attr(not(feature = "metrics"), allow(dead_code))]
const fn event_readings(metrics: &PoolMetrics) -> [(&'static str, u64); 9] {
    [
        ("slot_created", metrics.slots_created),
        ("slot_discarded", metrics.slots_discarded),
        ("cold_spawn", metrics.cold_spawns),
        ("replacement_spawn", metrics.replacement_spawns),
        ("spawn_failure", metrics.spawn_failures),
        ("timeout", metrics.timeouts),
        ("disconnect", metrics.disconnects),
        ("anomaly", metrics.anomalies),
        ("exhausted", metrics.exhausted),
    ]
}

#[cfg(feature = "metrics")]
fn endpoint_attr(endpoint: &str) -> [KeyValue; 1] {
    [KeyValue::new("endpoint", endpoint.to_string())]
}

#[cfg(feature = "metrics")]
pub fn increment_requests(endpoint: &str) {
    if let Some(counter) = REQUESTS.get() {
        counter.add(1, &endpoint_attr(endpoint));
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_requests(_endpoint: &str) {}

#[cfg(feature = "metrics")]
pub fn increment_requests_inflight(endpoint: &str) {
    if let Some(counter) = REQUESTS_INFLIGHT.get() {
        counter.add(1, &endpoint_attr(endpoint));
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_requests_inflight(_endpoint: &str) {}

#[cfg(feature = "metrics")]
pub fn decrement_requests_inflight(endpoint: &str) {
    if let Some(counter) = REQUESTS_INFLIGHT.get() {
        counter.add(-1, &endpoint_attr(endpoint));
    }
}

#[cfg(not(feature = "metrics"))]
pub fn decrement_requests_inflight(_endpoint: &str) {}

#[cfg(feature = "metrics")]
pub fn increment_request_errors(endpoint: &str, kind: &'static str) {
    if let Some(counter) = REQUEST_ERRORS.get() {
        counter.add(
            1,
            &[
                KeyValue::new("endpoint", endpoint.to_string()),
                KeyValue::new("kind", kind),
            ],
        );
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_request_errors(_endpoint: &str, _kind: &'static str) {}

#[cfg(feature = "metrics")]
pub fn record_request_duration(endpoint: &str, duration_ms: f64) {
    if let Some(histogram) = REQUEST_DURATION_MS.get() {
        histogram.record(duration_ms, &endpoint_attr(endpoint));
    }
}

#[cfg(not(feature = "metrics"))]
pub fn record_request_duration(_endpoint: &str, _duration_ms: f64) {}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(endpoint: &str, idle: usize, busy: usize, spawning: usize) -> PoolStatus {
        PoolStatus {
            endpoint: endpoint.into(),
            idle,
            busy,
            spawning,
            min_idle: 1,
            max_idle: 2,
            max_size: 4,
        }
    }

    #[test]
    fn slot_readings_cover_every_state_of_every_endpoint() {
        let readings = slot_readings(&[status("Delay", 0, 3, 1), status("Echo", 2, 0, 0)]);
        assert_eq!(readings.len(), 6);
        assert!(readings.contains(&("Delay".to_string(), "busy", 3)));
        assert!(readings.contains(&("Delay".to_string(), "spawning", 1)));
        assert!(readings.contains(&("Echo".to_string(), "idle", 2)));
    }

    #[test]
    fn event_readings_carry_pool_counters() {
        let metrics = PoolMetrics {
            anomalies: 2,
            timeouts: 1,
            exhausted: 5,
            ..PoolMetrics::default()
        };
        let readings = event_readings(&metrics);
        assert!(readings.contains(&("anomaly", 2)));
        assert!(readings.contains(&("timeout", 1)));
        assert!(readings.contains(&("exhausted", 5)));
        assert!(readings.contains(&("slot_created", 0)));
    }
}
