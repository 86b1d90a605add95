//! Log output and optional OpenTelemetry export.
//!
//! ## Feature matrix
//!
//! - `trace`: export spans through OpenTelemetry.
//! - `metrics`: export the pool's counters and histograms through
//!   OpenTelemetry. The pool records through the global meter, so the meter
//!   provider must be installed before the pool is built.
//! - `stdout`: print exported spans and metrics to stdout.
//!
//! Events outside a span only reach the console log. Console output is
//! filtered with `RUST_LOG` and defaults to `info`.

#[cfg(all(feature = "stdout", not(any(feature = "trace", feature = "metrics"))))]
compile_error!("The 'stdout' feature requires at least one of 'trace' or 'metrics' to be enabled.");

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(feature = "metrics")]
use opentelemetry_sdk::metrics as sdkmetrics;

#[cfg(any(feature = "metrics", feature = "trace"))]
use opentelemetry::{InstrumentationScope, KeyValue};
#[cfg(any(feature = "metrics", feature = "trace"))]
use opentelemetry_sdk::Resource;
#[cfg(any(feature = "metrics", feature = "trace"))]
use opentelemetry_semantic_conventions as semvcns;

#[cfg(feature = "trace")]
use opentelemetry::trace::TracerProvider;
#[cfg(feature = "trace")]
use opentelemetry_sdk::trace as sdktrace;

pub struct TelemetryProviders {
    #[cfg(feature = "trace")]
    pub tracer_provider: sdktrace::SdkTracerProvider,
    #[cfg(feature = "metrics")]
    pub meter_provider: sdkmetrics::SdkMeterProvider,
}

impl TelemetryProviders {
    /// Flushes and shuts down every exporter. Errors go to stderr because the
    /// log pipeline may already be gone.
    pub fn shutdown(self) {
        #[cfg(feature = "trace")]
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

pub fn init_telemetry() -> anyhow::Result<TelemetryProviders> {
    #[cfg(feature = "trace")]
    let tracer_provider = init_tracer();

    #[cfg(feature = "metrics")]
    let meter_provider = init_metrics();

    let registry = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_thread_ids(true)
                .with_target(false)
                .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339()),
        );

    #[cfg(feature = "trace")]
    let registry = {
        let scope = InstrumentationScope::builder("solverpool-soak")
            .with_version(env!("CARGO_PKG_VERSION"))
            .with_schema_url(semvcns::SCHEMA_URL)
            .build();
        opentelemetry::global::set_tracer_provider(tracer_provider.clone());
        registry.with(
            tracing_opentelemetry::layer()
                .with_tracer(tracer_provider.tracer_with_scope(scope))
                .with_error_records_to_exceptions(true),
        )
    };

    #[cfg(feature = "metrics")]
    let registry = {
        opentelemetry::global::set_meter_provider(meter_provider.clone());
        registry.with(tracing_opentelemetry::MetricsLayer::new(
            meter_provider.clone(),
        ))
    };

    registry.try_init()?;

    Ok(TelemetryProviders {
        #[cfg(feature = "trace")]
        tracer_provider,
        #[cfg(feature = "metrics")]
        meter_provider,
    })
}

#[cfg(any(feature = "metrics", feature = "trace"))]
fn resource() -> Resource {
    Resource::builder()
        .with_service_name("solverpool-soak")
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
fn init_metrics() -> sdkmetrics::SdkMeterProvider {
    let builder = sdkmetrics::SdkMeterProvider::builder().with_resource(resource());

    #[cfg(feature = "stdout")]
    let builder = {
        use opentelemetry_stdout::MetricExporter;
        let exporter = MetricExporter::default();
        let reader = sdkmetrics::PeriodicReader::builder(exporter)
            .with_interval(std::time::Duration::from_secs(5))
            .build();

        builder.with_reader(reader)
    };

    builder.build()
}

#[cfg(feature = "trace")]
fn init_tracer() -> sdktrace::SdkTracerProvider {
    let builder = sdktrace::SdkTracerProvider::builder().with_resource(resource());

    #[cfg(feature = "stdout")]
    let builder = {
        use opentelemetry_stdout::SpanExporter;
        let batch = sdktrace::BatchSpanProcessor::builder(SpanExporter::default())
            .with_batch_config(
                sdktrace::BatchConfigBuilder::default()
                    .with_scheduled_delay(std::time::Duration::from_secs(5))
                    .with_max_queue_size(2048)
                    .build(),
            )
            .build();
        builder.with_span_processor(batch)
    };

    builder.build()
}
