//! Tracing and OpenTelemetry wiring.
//!
//! Logging always goes through `tracing`. When any `OTEL_EXPORTER_OTLP_*`
//! variable is set, spans and metrics are additionally exported over OTLP
//! (HTTP or gRPC); otherwise only the local fmt subscriber is installed.

use opentelemetry::{KeyValue, global, trace::TracerProvider as _};
use opentelemetry_sdk::{
    Resource,
    metrics::{MeterProviderBuilder, PeriodicReader, SdkMeterProvider},
    trace::{RandomIdGenerator, Sampler, SdkTracerProvider},
};
use opentelemetry_semantic_conventions::{
    SCHEMA_URL,
    attribute::{DEPLOYMENT_ENVIRONMENT_NAME, SERVICE_VERSION},
};
use std::env;
use tower_http::classify::{ServerErrorsAsFailures, SharedClassifier};
use tower_http::trace::TraceLayer;
use tracing_opentelemetry::{MetricsLayer, OpenTelemetryLayer};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// OTLP transport, chosen via `OTEL_EXPORTER_OTLP_PROTOCOL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OtlpProtocol {
    Http,
    Grpc,
}

impl OtlpProtocol {
    /// Some protocol when any OTLP variable is present, `None` otherwise.
    fn from_env() -> Option<Self> {
        let enabled = env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok()
            || env::var("OTEL_EXPORTER_OTLP_HEADERS").is_ok()
            || env::var("OTEL_EXPORTER_OTLP_PROTOCOL").is_ok();
        if !enabled {
            return None;
        }
        match env::var("OTEL_EXPORTER_OTLP_PROTOCOL").as_deref() {
            Ok("grpc") => Some(OtlpProtocol::Grpc),
            _ => Some(OtlpProtocol::Http),
        }
    }
}

/// Builder for the process-wide telemetry setup.
pub struct Telemetry {
    name: &'static str,
    version: &'static str,
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new()
    }
}

impl Telemetry {
    pub fn new() -> Self {
        Telemetry {
            name: env!("CARGO_PKG_NAME"),
            version: env!("CARGO_PKG_VERSION"),
        }
    }

    pub fn with_name(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    pub fn with_version(mut self, version: &'static str) -> Self {
        self.version = version;
        self
    }

    fn resource(&self) -> Resource {
        let deployment_env = env::var("DEPLOYMENT_ENV").unwrap_or_else(|_| "develop".to_string());
        Resource::builder()
            .with_service_name(self.name)
            .with_schema_url(
                [
                    KeyValue::new(SERVICE_VERSION, self.version),
                    KeyValue::new(DEPLOYMENT_ENVIRONMENT_NAME, deployment_env),
                ],
                SCHEMA_URL,
            )
            .build()
    }

    fn meter_provider(&self, protocol: OtlpProtocol) -> SdkMeterProvider {
        let exporter = opentelemetry_otlp::MetricExporter::builder();
        let exporter = match protocol {
            OtlpProtocol::Http => exporter.with_http().build(),
            OtlpProtocol::Grpc => exporter.with_tonic().build(),
        }
        .expect("Failed to build OTLP metric exporter");

        let reader = PeriodicReader::builder(exporter)
            .with_interval(std::time::Duration::from_secs(30))
            .build();

        let meter_provider = MeterProviderBuilder::default()
            .with_resource(self.resource())
            .with_reader(reader)
            .build();
        global::set_meter_provider(meter_provider.clone());
        meter_provider
    }

    fn tracer_provider(&self, protocol: OtlpProtocol) -> SdkTracerProvider {
        let exporter = opentelemetry_otlp::SpanExporter::builder();
        let exporter = match protocol {
            OtlpProtocol::Http => exporter.with_http().build(),
            OtlpProtocol::Grpc => exporter.with_tonic().build(),
        }
        .expect("Failed to build OTLP span exporter");

        SdkTracerProvider::builder()
            .with_sampler(Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(
                1.0,
            ))))
            .with_id_generator(RandomIdGenerator::default())
            .with_resource(self.resource())
            .with_batch_exporter(exporter)
            .build()
    }

    /// Install the global subscriber and return a guard that shuts the
    /// exporters down on drop.
    pub fn register(self) -> TelemetryGuard {
        let env_filter =
            || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match OtlpProtocol::from_env() {
            Some(protocol) => {
                let tracer_provider = self.tracer_provider(protocol);
                let meter_provider = self.meter_provider(protocol);
                let tracer = tracer_provider.tracer("tracing-otel-subscriber");

                tracing_subscriber::registry()
                    .with(env_filter())
                    .with(tracing_subscriber::fmt::layer())
                    .with(MetricsLayer::new(meter_provider.clone()))
                    .with(OpenTelemetryLayer::new(tracer))
                    .init();

                tracing::info!("OpenTelemetry export enabled via {:?}", protocol);
                TelemetryGuard {
                    tracer_provider: Some(tracer_provider),
                    meter_provider: Some(meter_provider),
                }
            }
            None => {
                tracing_subscriber::registry()
                    .with(env_filter())
                    .with(tracing_subscriber::fmt::layer())
                    .init();

                tracing::info!("OpenTelemetry is not enabled");
                TelemetryGuard {
                    tracer_provider: None,
                    meter_provider: None,
                }
            }
        }
    }
}

/// Keeps the exporter providers alive; flushes them on drop.
pub struct TelemetryGuard {
    tracer_provider: Option<SdkTracerProvider>,
    meter_provider: Option<SdkMeterProvider>,
}

impl TelemetryGuard {
    /// Request/response span layer for the HTTP router.
    pub fn http_tracing(&self) -> TraceLayer<SharedClassifier<ServerErrorsAsFailures>> {
        TraceLayer::new_for_http()
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(tracer_provider) = self.tracer_provider.as_ref() {
            if let Err(err) = tracer_provider.shutdown() {
                eprintln!("{err:?}");
            }
        }
        if let Some(meter_provider) = self.meter_provider.as_ref() {
            if let Err(err) = meter_provider.shutdown() {
                eprintln!("{err:?}");
            }
        }
    }
}
