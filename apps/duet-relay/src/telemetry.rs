use anyhow::{Context, Result};
use metrics::{describe_counter, describe_gauge, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use opentelemetry::global;
use opentelemetry::trace::TracerProvider;
use opentelemetry::KeyValue;
use opentelemetry_sdk::resource::Resource;
use opentelemetry_sdk::trace::{Sampler, SdkTracerProvider};
use opentelemetry_stdout::SpanExporter;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const SERVICE_NAME: &str = "duet-relay";
const OTEL_STDOUT_ENV: &str = "DUET_RELAY_OTEL_STDOUT";

/// Metric names recorded by the relay registry.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "duet_relay_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "duet_relay_connections_active";
    pub const FRAMES_RECEIVED_TOTAL: &str = "duet_relay_frames_received_total";
    pub const DELIVERIES_TOTAL: &str = "duet_relay_deliveries_total";
    pub const EVICTIONS_TOTAL: &str = "duet_relay_evictions_total";
}

/// Process-wide logging and metrics for the relay binary.
///
/// Holds the Prometheus handle served at `/metrics` and, when
/// `DUET_RELAY_OTEL_STDOUT` is truthy, a span exporter that prints to stdout.
/// Dropping it flushes the exporter.
pub struct Telemetry {
    metrics_handle: PrometheusHandle,
    tracer_provider: Option<SdkTracerProvider>,
}

impl Telemetry {
    pub fn init() -> Result<Self> {
        let metrics_handle = PrometheusBuilder::new()
            .install_recorder()
            .context("failed to install Prometheus metrics recorder")?;
        describe_relay_metrics();

        let tracer_provider = otel_stdout_enabled().then(stdout_tracer_provider);
        let otel_layer = tracer_provider.as_ref().map(|provider| {
            tracing_opentelemetry::layer().with_tracer(provider.tracer(SERVICE_NAME))
        });

        tracing_subscriber::registry()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .with(otel_layer)
            .try_init()
            .context("failed to initialise tracing subscriber")?;

        if tracer_provider.is_some() {
            info!("span export to stdout enabled ({OTEL_STDOUT_ENV})");
        }

        Ok(Self {
            metrics_handle,
            tracer_provider,
        })
    }

    pub fn metrics_handle(&self) -> PrometheusHandle {
        self.metrics_handle.clone()
    }
}

impl Drop for Telemetry {
    fn drop(&mut self) {
        if let Some(provider) = self.tracer_provider.take() {
            if let Err(err) = provider.shutdown() {
                warn!(error = %err, "failed to shutdown OpenTelemetry tracer provider");
            }
        }
    }
}

fn stdout_tracer_provider() -> SdkTracerProvider {
    let provider = SdkTracerProvider::builder()
        .with_simple_exporter(SpanExporter::default())
        .with_sampler(Sampler::AlwaysOn)
        .with_resource(
            Resource::builder()
                .with_attributes(vec![KeyValue::new("service.name", SERVICE_NAME)])
                .build(),
        )
        .build();
    global::set_tracer_provider(provider.clone());
    provider
}

pub(crate) fn describe_relay_metrics() {
    describe_counter!(
        names::CONNECTIONS_TOTAL,
        Unit::Count,
        "websocket connections accepted"
    );
    describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        Unit::Count,
        "websocket connections currently registered"
    );
    describe_counter!(
        names::FRAMES_RECEIVED_TOTAL,
        Unit::Count,
        "text or binary frames received from peers"
    );
    describe_counter!(
        names::DELIVERIES_TOTAL,
        Unit::Count,
        "frames queued to a receiving peer"
    );
    describe_counter!(
        names::EVICTIONS_TOTAL,
        Unit::Count,
        "peers dropped after a failed delivery"
    );
}

fn otel_stdout_enabled() -> bool {
    std::env::var(OTEL_STDOUT_ENV)
        .map(|value| is_truthy(&value))
        .unwrap_or(false)
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
