//! Tracing bootstrap for the gateway.
//!
//! Console logs are always on. Span export is opt-in: it activates only
//! when the standard `OTEL_EXPORTER_OTLP_ENDPOINT` is configured, sampled
//! at the `KRUISE_TRACE_SAMPLE` ratio. Because several replicas serve the
//! same fleet, every exported span carries the replica's pod identity so
//! a claim traced on one replica and proxied on another can be told
//! apart.

use std::env;

use anyhow::Result;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    propagation::TraceContextPropagator,
    resource::Resource,
    runtime,
    trace::{self, Sampler},
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Export settings resolved from the environment.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetrySettings {
    /// OTLP collector address; export stays off without one.
    pub endpoint: Option<String>,
    /// Head sampling ratio in `0.0..=1.0`; out-of-range input clamps,
    /// unparseable input keeps the default of sampling everything.
    pub sample_ratio: f64,
}

impl TelemetrySettings {
    pub fn from_env() -> Self {
        Self::resolve(
            env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok().as_deref(),
            env::var("KRUISE_TRACE_SAMPLE").ok().as_deref(),
        )
    }

    fn resolve(endpoint: Option<&str>, sample: Option<&str>) -> Self {
        let endpoint = endpoint
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string);
        let sample_ratio = sample
            .and_then(|raw| raw.trim().parse::<f64>().ok())
            .map(|ratio| ratio.clamp(0.0, 1.0))
            .unwrap_or(1.0);
        Self {
            endpoint,
            sample_ratio,
        }
    }

    fn exports(&self) -> bool {
        self.endpoint.is_some() && self.sample_ratio > 0.0
    }
}

/// Flushes the span pipeline when the process winds down. Console-only
/// setups have nothing to flush.
pub struct TelemetryGuard {
    exporting: bool,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if self.exporting {
            global::shutdown_tracer_provider();
        }
    }
}

pub fn init(service_name: &str) -> Result<TelemetryGuard> {
    let settings = TelemetrySettings::from_env();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if settings.exports() {
        match install_exporter(service_name, &settings) {
            Ok(tracer) => {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(tracing_subscriber::fmt::layer())
                    .with(tracing_opentelemetry::layer().with_tracer(tracer))
                    .init();
                info!(
                    sample_ratio = settings.sample_ratio,
                    endpoint = settings.endpoint.as_deref().unwrap_or(""),
                    "span export enabled"
                );
                return Ok(TelemetryGuard { exporting: true });
            }
            Err(error) => {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(tracing_subscriber::fmt::layer())
                    .init();
                warn!(%error, "span exporter failed to start, console logs only");
                return Ok(TelemetryGuard { exporting: false });
            }
        }
    }

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
    info!("no OTLP endpoint configured, console logs only");
    Ok(TelemetryGuard { exporting: false })
}

/// Identity attached to every exported span: which replica, which fleet.
fn replica_resource(service_name: &str) -> Resource {
    Resource::new(vec![
        KeyValue::new("service.name", service_name.to_string()),
        KeyValue::new(
            "service.instance.id",
            env::var("POD_IP").unwrap_or_else(|_| "standalone".to_string()),
        ),
        KeyValue::new(
            "service.namespace",
            env::var("SYSTEM_NAMESPACE").unwrap_or_else(|_| "kruise-system".to_string()),
        ),
    ])
}

fn install_exporter(service_name: &str, settings: &TelemetrySettings) -> Result<trace::Tracer> {
    global::set_text_map_propagator(TraceContextPropagator::new());

    let endpoint = settings.endpoint.clone().unwrap_or_default();
    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(endpoint);

    // Parent-based so proxied requests keep the sampling decision the
    // entry replica already made.
    let sampler = Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(
        settings.sample_ratio,
    )));

    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_trace_config(
            trace::Config::default()
                .with_sampler(sampler)
                .with_resource(replica_resource(service_name)),
        )
        .with_exporter(exporter)
        .install_batch(runtime::Tokio)?;
    Ok(tracer)
}
