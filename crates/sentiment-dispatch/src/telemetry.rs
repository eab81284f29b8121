//! # Telemetry
//!
//! Console logging through `tracing-subscriber` is always on and goes to
//! stderr, in the format chosen by `LOG_FORMAT`. On top of it, spans and
//! metrics can be exported via OpenTelemetry.
//!
//! ## Features
//!
//! - `otel`: export dispatch spans.
//! - `metrics`: export the dispatch counters and histograms below.
//! - `otlp`: export over OTLP/gRPC. The target comes from the standard
//!   `OTEL_EXPORTER_OTLP_ENDPOINT`, `OTEL_EXPORTER_OTLP_HEADERS` and
//!   `OTEL_EXPORTER_OTLP_COMPRESSION` variables.
//! - `stdout`: print exported spans and metrics, for local debugging.
//!
//! Exporters need `otel` or `metrics`; both exporters may be enabled together.
//!
//! ## Spans
//!
//! The dispatch entry points (`analyze_sync`, `analyze_async`, `analyze_batch`,
//! `submit`) open spans carrying the request or batch id. Events inside them
//! become span events; events outside are only logged.
//!
//! ## Metrics
//!
//! Requests by mode, pending tasks, evictions, malformed envelopes, batch
//! fallbacks and batch duration. Without `metrics` the recording helpers are
//! no-ops.
//!
//! ```bash
//! OTEL_EXPORTER_OTLP_ENDPOINT=http://collector:4317 \
//!     cargo run --features otel,metrics,otlp -- worker
//! ```

#[cfg(all(feature = "otlp", not(any(feature = "otel", feature = "metrics"))))]
compile_error!("The 'otlp' feature requires at least one of 'otel' or 'metrics' to be enabled.");

#[cfg(all(feature = "stdout", not(any(feature = "otel", feature = "metrics"))))]
compile_error!("The 'stdout' feature requires at least one of 'otel' or 'metrics' to be enabled.");

use tracing_subscriber::{EnvFilter, Layer, Registry, layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(all(feature = "otlp", any(feature = "metrics", feature = "otel")))]
use opentelemetry_otlp::{Compression, Protocol, WithExportConfig, WithTonicConfig};
#[cfg(all(feature = "otlp", feature = "metrics"))]
use opentelemetry_sdk::metrics::Temporality;
#[cfg(all(feature = "otlp", any(feature = "metrics", feature = "otel")))]
use tonic::{metadata::MetadataMap, transport::ClientTlsConfig};

#[cfg(feature = "metrics")]
use opentelemetry::metrics::{Counter, Histogram, Meter, UpDownCounter};
#[cfg(feature = "metrics")]
use opentelemetry_sdk::metrics as sdkmetrics;
#[cfg(feature = "metrics")]
use std::sync::OnceLock;

#[cfg(any(feature = "metrics", feature = "otel"))]
use opentelemetry::{InstrumentationScope, KeyValue};
#[cfg(any(feature = "metrics", feature = "otel"))]
use opentelemetry_sdk::Resource;
#[cfg(any(feature = "metrics", feature = "otel"))]
use opentelemetry_semantic_conventions as semvcns;

#[cfg(feature = "otel")]
use opentelemetry::trace::TracerProvider;
#[cfg(feature = "otel")]
use opentelemetry_sdk::propagation::TraceContextPropagator;
#[cfg(feature = "otel")]
use opentelemetry_sdk::trace as sdktrace;

const SERVICE_NAME: &str = "sentiment-dispatch";

/// Console log layout.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    /// One line per event.
    #[default]
    Compact,
    /// Multi-line, with source locations.
    Pretty,
    /// One JSON object per event.
    Json,
}

pub struct TelemetryProviders {
    #[cfg(feature = "otel")]
    pub tracer_provider: sdktrace::SdkTracerProvider,
    #[cfg(feature = "metrics")]
    pub meter_provider: sdkmetrics::SdkMeterProvider,
}

impl TelemetryProviders {
    /// Flushes and stops the exporters. Errors go to stderr since the
    /// subscriber may already be unusable.
    pub fn shutdown(self) {
        #[cfg(feature = "otel")]
        {
            if let Err(err) = self.tracer_provider.force_flush() {
                eprintln!("Error flushing traces: {err:#?}");
            }
            if let Err(err) = self.tracer_provider.shutdown() {
                eprintln!("Error shutting down tracer: {err:#?}");
            }
        }

        #[cfg(feature = "metrics")]
        {
            if let Err(err) = self.meter_provider.force_flush() {
                eprintln!("Error flushing metrics: {err:#?}");
            }
            if let Err(err) = self.meter_provider.shutdown() {
                eprintln!("Error shutting down meter: {err:#?}");
            }
        }
    }
}

fn console_layer(format: LogFormat) -> Box<dyn Layer<Registry> + Send + Sync> {
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);
    match format {
        LogFormat::Compact => layer.compact().boxed(),
        LogFormat::Pretty => layer
            .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .pretty()
            .boxed(),
        LogFormat::Json => layer.json().with_current_span(true).boxed(),
    }
}

/// Installs the global subscriber. Call once, at startup.
///
/// Console output goes to stderr so that command results printed on stdout
/// stay machine-readable.
pub fn init_telemetry(format: LogFormat) -> anyhow::Result<TelemetryProviders> {
    #[cfg(feature = "otel")]
    opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());

    #[cfg(feature = "otel")]
    let tracer_provider = init_tracer()?;

    #[cfg(feature = "metrics")]
    let meter_provider = init_metrics()?;

    #[cfg(any(feature = "metrics", feature = "otel"))]
    let scope = InstrumentationScope::builder(SERVICE_NAME)
        .with_version(env!("CARGO_PKG_VERSION"))
        .with_schema_url(semvcns::SCHEMA_URL)
        .build();

    let registry = tracing_subscriber::registry()
        .with(console_layer(format))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()));

    #[cfg(feature = "otel")]
    let registry = {
        opentelemetry::global::set_tracer_provider(tracer_provider.clone());
        registry.with(
            tracing_opentelemetry::layer()
                .with_tracer(tracer_provider.tracer_with_scope(scope.clone()))
                .with_error_records_to_exceptions(true),
        )
    };

    #[cfg(feature = "metrics")]
    let registry = {
        opentelemetry::global::set_meter_provider(meter_provider.clone());
        init_metric_handles(opentelemetry::global::meter_with_scope(scope));
        registry.with(tracing_opentelemetry::MetricsLayer::new(meter_provider.clone()))
    };

    registry.init();

    Ok(TelemetryProviders {
        #[cfg(feature = "otel")]
        tracer_provider,
        #[cfg(feature = "metrics")]
        meter_provider,
    })
}

/// Where the OTLP exporters send to.
#[cfg(all(feature = "otlp", any(feature = "metrics", feature = "otel")))]
struct OtlpTarget {
    endpoint: String,
    metadata: MetadataMap,
    compression: Option<Compression>,
}

#[cfg(all(feature = "otlp", any(feature = "metrics", feature = "otel")))]
impl OtlpTarget {
    fn from_env() -> anyhow::Result<Self> {
        use anyhow::Context;
        use std::str::FromStr;

        let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
            .unwrap_or_else(|_| "http://localhost:4317".to_string());
        let headers = std::env::var("OTEL_EXPORTER_OTLP_HEADERS").unwrap_or_default();
        let compression = match std::env::var("OTEL_EXPORTER_OTLP_COMPRESSION") {
            Ok(raw) => Some(
                Compression::from_str(&raw.to_ascii_lowercase())
                    .context("invalid `OTEL_EXPORTER_OTLP_COMPRESSION`")?,
            ),
            Err(_) => None,
        };

        Ok(Self {
            endpoint,
            metadata: parse_headers(&headers)?,
            compression,
        })
    }

    fn apply<B: WithExportConfig + WithTonicConfig>(&self, builder: B) -> B {
        let builder = builder
            .with_endpoint(self.endpoint.clone())
            .with_metadata(self.metadata.clone())
            .with_timeout(std::time::Duration::from_secs(10))
            .with_protocol(Protocol::Grpc);
        let builder = if self.endpoint.starts_with("https://") {
            builder.with_tls_config(ClientTlsConfig::new().with_native_roots())
        } else {
            builder
        };
        match self.compression {
            Some(compression) => builder.with_compression(compression),
            None => builder,
        }
    }
}

/// Parses `key=value` pairs separated by commas into gRPC metadata.
#[cfg(all(feature = "otlp", any(feature = "metrics", feature = "otel")))]
fn parse_headers(raw: &str) -> anyhow::Result<MetadataMap> {
    use anyhow::Context;
    use tonic::metadata::{Ascii, MetadataKey, MetadataValue};

    let mut map = MetadataMap::new();
    for pair in raw.split(',').map(str::trim).filter(|pair| !pair.is_empty()) {
        let (key, value) = pair
            .split_once('=')
            .with_context(|| format!("header `{pair}` is not `key=value`"))?;
        let key = MetadataKey::from_bytes(key.trim().to_ascii_lowercase().as_bytes())
            .with_context(|| format!("invalid header name `{key}`"))?;
        let value: MetadataValue<Ascii> = value
            .trim()
            .parse()
            .with_context(|| format!("invalid value for header `{}`", key.as_str()))?;
        map.insert(key, value);
    }
    Ok(map)
}

#[cfg(any(feature = "metrics", feature = "otel"))]
fn resource() -> Resource {
    Resource::builder()
        .with_service_name(SERVICE_NAME)
        .with_schema_url(
            [KeyValue::new(
                semvcns::resource::SERVICE_VERSION,
                env!("CARGO_PKG_VERSION"),
            )],
            semvcns::SCHEMA_URL,
        )
        .build()
}

#[cfg(feature = "metrics")]
fn init_metrics() -> anyhow::Result<sdkmetrics::SdkMeterProvider> {
    let builder = sdkmetrics::SdkMeterProvider::builder().with_resource(resource());

    #[cfg(feature = "stdout")]
    let builder = builder.with_reader(
        sdkmetrics::PeriodicReader::builder(opentelemetry_stdout::MetricExporter::default())
            .with_interval(std::time::Duration::from_secs(5))
            .build(),
    );

    #[cfg(feature = "otlp")]
    let builder = {
        use anyhow::Context;

        let target = OtlpTarget::from_env()?;
        let exporter = target
            .apply(opentelemetry_otlp::MetricExporter::builder().with_tonic())
            .with_temporality(Temporality::Delta)
            .build()
            .context("failed to build metrics exporter")?;
        builder.with_periodic_exporter(exporter)
    };

    Ok(builder.build())
}

#[cfg(feature = "otel")]
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

#[cfg(feature = "otel")]
fn init_tracer() -> anyhow::Result<sdktrace::SdkTracerProvider> {
    let builder = sdktrace::SdkTracerProvider::builder().with_resource(resource());

    #[cfg(feature = "stdout")]
    let builder = builder.with_span_processor(batched(opentelemetry_stdout::SpanExporter::default()));

    #[cfg(feature = "otlp")]
    let builder = {
        use anyhow::Context;

        let target = OtlpTarget::from_env()?;
        let exporter = target
            .apply(opentelemetry_otlp::SpanExporter::builder().with_tonic())
            .build()
            .context("failed to build span exporter")?;
        builder.with_span_processor(batched(exporter))
    };

    Ok(builder.build())
}

#[cfg(feature = "metrics")]
static REQUESTS: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static TASKS_PENDING: OnceLock<UpDownCounter<i64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static TASKS_EVICTED: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static MALFORMED_ENVELOPES: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static BATCH_FALLBACKS: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static BATCH_DURATION_MS: OnceLock<Histogram<f64>> = OnceLock::new();

#[cfg(feature = "metrics")]
fn init_metric_handles(meter: Meter) {
    let counter = |name: &'static str, description: &'static str| {
        meter.u64_counter(name).with_description(description).build()
    };

    let _ = REQUESTS.set(counter("requests", "Accepted analysis requests by delivery mode"));
    let _ = TASKS_EVICTED.set(counter("tasks_evicted", "Async tasks evicted without a result"));
    let _ = MALFORMED_ENVELOPES.set(counter(
        "malformed_envelopes",
        "Broker payloads discarded as malformed",
    ));
    let _ = BATCH_FALLBACKS.set(counter(
        "batch_fallbacks",
        "Batch items resolved through the unary fallback",
    ));
    let _ = TASKS_PENDING.set(
        meter
            .i64_up_down_counter("tasks_pending")
            .with_description("Async tasks awaiting a result")
            .build(),
    );
    let _ = BATCH_DURATION_MS.set(
        meter
            .f64_histogram("batch_duration")
            .with_unit("ms")
            .with_description("End-to-end batch duration")
            .build(),
    );
}

#[cfg(feature = "metrics")]
pub fn increment_requests(mode: &'static str) {
    if let Some(counter) = REQUESTS.get() {
        counter.add(1, &[KeyValue::new("mode", mode)]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_requests(_mode: &'static str) {}

#[cfg(feature = "metrics")]
pub fn increment_tasks_pending() {
    if let Some(counter) = TASKS_PENDING.get() {
        counter.add(1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_tasks_pending() {}

#[cfg(feature = "metrics")]
pub fn decrement_tasks_pending() {
    if let Some(counter) = TASKS_PENDING.get() {
        counter.add(-1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn decrement_tasks_pending() {}

#[cfg(feature = "metrics")]
pub fn increment_tasks_evicted() {
    if let Some(counter) = TASKS_EVICTED.get() {
        counter.add(1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_tasks_evicted() {}

#[cfg(feature = "metrics")]
pub fn increment_malformed_envelopes() {
    if let Some(counter) = MALFORMED_ENVELOPES.get() {
        counter.add(1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_malformed_envelopes() {}

#[cfg(feature = "metrics")]
pub fn increment_batch_fallbacks(count: u64) {
    if let Some(counter) = BATCH_FALLBACKS.get() {
        counter.add(count, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_batch_fallbacks(_count: u64) {}

#[cfg(feature = "metrics")]
pub fn record_batch_duration(duration_ms: f64) {
    if let Some(histogram) = BATCH_DURATION_MS.get() {
        histogram.record(duration_ms, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn record_batch_duration(_duration_ms: f64) {}
