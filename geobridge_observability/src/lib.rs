//! Logging, tracing and metrics setup shared by the geobridge crates.
//!
//! Logs go to stdout, either in a compact colored format or as JSON lines
//! when `RUST_LOG_FORMAT=json`. Traces and metrics go through OpenTelemetry;
//! OTLP export is enabled only when `OTEL_SDK_DISABLED=false`.
use std::{borrow::Cow, time::Duration};

use opentelemetry::{InstrumentationScope, global, trace::TracerProvider as _};
use opentelemetry_otlp::{ExporterBuildError, MetricExporter, SpanExporter};
use opentelemetry_sdk::{
    Resource,
    metrics::{MeterProviderBuilder, PeriodicReader, SdkMeterProvider},
    trace::SdkTracerProvider,
};
use snafu::{ResultExt, Snafu};
use tracing::Subscriber;
use tracing_opentelemetry::MetricsLayer;
use tracing_subscriber::{EnvFilter, Layer, prelude::*, registry::LookupSpan};

pub use opentelemetry::{
    KeyValue,
    metrics::{Counter, Meter},
};

use crate::format::BridgeFormat;

mod format;

const OTEL_SDK_DISABLED: &str = "OTEL_SDK_DISABLED";
const RUST_LOG_FORMAT: &str = "RUST_LOG_FORMAT";
const DEFAULT_FILTER: &str = "info";
const METRICS_EXPORT_INTERVAL: Duration = Duration::from_secs(10);

pub type BoxedLayer<S> = Box<dyn Layer<S> + Send + Sync>;

#[derive(Debug, Snafu)]
pub enum ObservabilityError {
    #[snafu(display("failed to build otlp exporter"))]
    Exporter { source: ExporterBuildError },
    #[snafu(display("failed to install the global subscriber"))]
    Subscriber {
        source: tracing_subscriber::util::TryInitError,
    },
}

/// Log output format, selected with `RUST_LOG_FORMAT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Json,
}

/// Keeps the OpenTelemetry providers alive. Dropping it flushes pending
/// spans and metrics.
pub struct ObservabilityGuard {
    tracer_provider: SdkTracerProvider,
    meter_provider: SdkMeterProvider,
}

pub fn meter(name: &'static str) -> Meter {
    global::meter(name)
}

pub fn init_observability(
    package_name: impl Into<Cow<'static, str>>,
    package_version: impl Into<Cow<'static, str>>,
) -> Result<ObservabilityGuard, ObservabilityError> {
    // The otel sdk ignores OTEL_SDK_DISABLED, so it is handled here.
    // Export stays off unless explicitly enabled.
    let export_enabled = std::env::var(OTEL_SDK_DISABLED)
        .map(|v| v == "false")
        .unwrap_or(false);

    let (otel_layer, guard) = otel(
        package_name.into(),
        package_version.into(),
        export_enabled,
    )?;

    let layers = vec![stdout(LogFormat::from_env()), otel_layer];

    tracing_subscriber::registry()
        .with(layers)
        .try_init()
        .context(SubscriberSnafu)?;

    Ok(guard)
}

impl LogFormat {
    pub fn from_env() -> Self {
        match std::env::var(RUST_LOG_FORMAT) {
            Ok(value) if value.eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Compact,
        }
    }
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

fn stdout<S>(format: LogFormat) -> BoxedLayer<S>
where
    S: Subscriber,
    for<'a> S: LookupSpan<'a>,
{
    match format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_target(true)
            .json()
            .with_filter(env_filter())
            .boxed(),
        LogFormat::Compact => tracing_subscriber::fmt::layer()
            .with_ansi(true)
            .event_format(BridgeFormat::default())
            .fmt_fields(BridgeFormat::default())
            .with_filter(env_filter())
            .boxed(),
    }
}

fn otel<S>(
    package_name: Cow<'static, str>,
    version: Cow<'static, str>,
    export_enabled: bool,
) -> Result<(BoxedLayer<S>, ObservabilityGuard), ObservabilityError>
where
    S: Subscriber + Send + Sync,
    for<'a> S: LookupSpan<'a>,
{
    let resource = Resource::builder()
        .with_service_name(package_name.to_string())
        .build();

    let scope = InstrumentationScope::builder(package_name)
        .with_version(version)
        .build();

    let mut tracer_provider = SdkTracerProvider::builder().with_resource(resource.clone());
    if export_enabled {
        let span_exporter = SpanExporter::builder()
            .with_tonic()
            .build()
            .context(ExporterSnafu)?;
        tracer_provider = tracer_provider.with_batch_exporter(span_exporter);
    }
    let tracer_provider = tracer_provider.build();
    let tracer = tracer_provider.tracer_with_scope(scope);

    let mut meter_provider = MeterProviderBuilder::default().with_resource(resource);
    if export_enabled {
        let exporter = MetricExporter::builder()
            .with_tonic()
            .build()
            .context(ExporterSnafu)?;
        let reader = PeriodicReader::builder(exporter)
            .with_interval(METRICS_EXPORT_INTERVAL)
            .build();
        meter_provider = meter_provider.with_reader(reader);
    }
    let meter_provider = meter_provider.build();

    global::set_meter_provider(meter_provider.clone());

    let layer = env_filter()
        .and_then(MetricsLayer::new(meter_provider.clone()))
        .and_then(tracing_opentelemetry::layer().with_tracer(tracer))
        .boxed();

    let guard = ObservabilityGuard {
        tracer_provider,
        meter_provider,
    };

    Ok((layer, guard))
}

impl Drop for ObservabilityGuard {
    fn drop(&mut self) {
        if let Err(err) = self.tracer_provider.shutdown() {
            eprintln!("failed to shut down tracer provider: {err}");
        }

        if let Err(err) = self.meter_provider.shutdown() {
            eprintln!("failed to shut down meter provider: {err}");
        }
    }
}
