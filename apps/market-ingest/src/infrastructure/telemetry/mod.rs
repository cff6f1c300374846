//! Tracing Setup
//!
//! Installs the global `tracing` subscriber: an `EnvFilter`, a fmt layer and,
//! unless disabled, an OpenTelemetry OTLP layer. Exported spans carry a
//! resource describing the ingest instance: service version, account type,
//! stream endpoint and store namespace. The connection manager and order cache
//! open `stream_session`, `replay`, `reconnect` and `sync_now` spans beneath it.
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: filter directives (default: `info`, with transport crates at `warn`)
//! - `OTEL_ENABLED`: set to "false" to disable export (default: true)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4318>)
//! - `OTEL_SERVICE_NAME`: service name (default: market-ingest)

use opentelemetry::KeyValue;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::infrastructure::config::IngestConfig;

const DEFAULT_SERVICE_NAME: &str = "market-ingest";
const DEFAULT_OTLP_ENDPOINT: &str = "http://localhost:4318";

/// Applied when `RUST_LOG` is unset.
const DEFAULT_FILTER: &str = "info";
const QUIET_TARGETS: [&str; 3] = ["tungstenite=warn", "tokio_tungstenite=warn", "hyper=warn"];

/// Telemetry initialization failures.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    /// `RUST_LOG` or a built-in directive did not parse.
    #[error("invalid log directive: {0}")]
    Directive(#[from] tracing_subscriber::filter::ParseError),

    /// The OTLP exporter could not be built.
    #[error("failed to build OTLP exporter: {0}")]
    Exporter(#[from] opentelemetry_otlp::ExporterBuildError),
}

/// Flushes and shuts down the tracer provider when dropped.
pub struct TelemetryGuard {
    tracer_provider: Option<SdkTracerProvider>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.tracer_provider.take()
            && let Err(e) = provider.shutdown()
        {
            // The subscriber may already be gone.
            eprintln!("Failed to shut down tracer provider: {e}");
        }
    }
}

/// Subscriber and exporter settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// Service name on exported spans.
    pub service_name: String,
    /// OTLP endpoint; `None` disables export.
    pub otlp_endpoint: Option<String>,
    /// `RUST_LOG` directives, if set.
    pub log_filter: Option<String>,
    /// Resource attributes identifying this ingest instance.
    pub resource: Vec<(&'static str, String)>,
}

impl TelemetryConfig {
    /// Settings for `config`, with exporter options from the environment.
    #[must_use]
    pub fn for_ingest(config: &IngestConfig) -> Self {
        Self::from_lookup(config, |key| std::env::var(key).ok())
    }

    /// Settings for `config`, with exporter options from `lookup`.
    pub fn from_lookup<F>(config: &IngestConfig, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let enabled =
            lookup("OTEL_ENABLED").is_none_or(|v| !v.trim().eq_ignore_ascii_case("false"));
        let otlp_endpoint = enabled.then(|| {
            lookup("OTEL_EXPORTER_OTLP_ENDPOINT")
                .unwrap_or_else(|| DEFAULT_OTLP_ENDPOINT.to_string())
        });

        Self {
            service_name: lookup("OTEL_SERVICE_NAME")
                .unwrap_or_else(|| DEFAULT_SERVICE_NAME.to_string()),
            otlp_endpoint,
            log_filter: lookup("RUST_LOG").filter(|v| !v.trim().is_empty()),
            resource: vec![
                ("service.version", env!("CARGO_PKG_VERSION").to_string()),
                ("ingest.account_type", config.stream.account_type.to_string()),
                ("ingest.endpoint", config.stream.url.clone()),
                ("ingest.namespace", config.store_keys().prefix().to_string()),
            ],
        }
    }

    fn resource(&self) -> Resource {
        Resource::builder()
            .with_service_name(self.service_name.clone())
            .with_attributes(
                self.resource
                    .iter()
                    .map(|(key, value)| KeyValue::new(*key, value.clone())),
            )
            .build()
    }
}

/// Build the log filter. Explicit `RUST_LOG` directives are used as given;
/// otherwise `info` with the transport crates held at `warn`.
fn filter(log_filter: Option<&str>) -> Result<EnvFilter, TelemetryError> {
    if let Some(directives) = log_filter {
        return Ok(EnvFilter::try_new(directives)?);
    }
    let mut filter = EnvFilter::try_new(DEFAULT_FILTER)?;
    for directive in QUIET_TARGETS {
        filter = filter.add_directive(directive.parse()?);
    }
    Ok(filter)
}

/// Install the global subscriber.
///
/// Keep the returned guard alive for the life of the process.
///
/// # Errors
///
/// - [`TelemetryError::Directive`] if `RUST_LOG` does not parse
/// - [`TelemetryError::Exporter`] if the OTLP exporter cannot be built
pub fn init(config: &TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    let env_filter = filter(config.log_filter.as_deref())?;
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);

    let Some(endpoint) = &config.otlp_endpoint else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .init();
        return Ok(TelemetryGuard {
            tracer_provider: None,
        });
    };

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;
    let tracer_provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(config.resource())
        .build();
    let tracer = tracer_provider.tracer(config.service_name.clone());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(tracing_opentelemetry::layer().with_tracer(tracer))
        .init();

    Ok(TelemetryGuard {
        tracer_provider: Some(tracer_provider),
    })
}
