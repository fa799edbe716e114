use anyhow::Result;
use opentelemetry::KeyValue;
use opentelemetry::global::{self, BoxedSpan, BoxedTracer};
use opentelemetry::trace::{Span, Tracer};
use opentelemetry_otlp::{Protocol, WithExportConfig};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::EnvFilter;

/// OpenTelemetry integration for tracing libsniff execution (§4.7): spans
/// bracket the build phase, per-application detection, and result-file
/// writing. Strictly additive — disabled telemetry never changes detection
/// results.
pub(crate) struct Telemetry {
    enabled: bool,
    provider: Option<SdkTracerProvider>,
    tracer: BoxedTracer,
}

impl Telemetry {
    pub(crate) fn new(endpoint: Option<String>) -> Result<Self> {
        let endpoint = endpoint.or_else(|| std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok());
        if let Some(endpoint) = endpoint {
            let exporter = opentelemetry_otlp::SpanExporter::builder()
                .with_http()
                .with_protocol(Protocol::HttpBinary)
                .with_endpoint(endpoint)
                .build()?;
            let resource = Resource::builder().with_service_name("libsniff").build();
            let provider = SdkTracerProvider::builder()
                .with_simple_exporter(exporter)
                .with_resource(resource)
                .build();
            global::set_tracer_provider(provider.clone());
            let tracer = global::tracer("libsniff");
            Ok(Self {
                enabled: true,
                provider: Some(provider),
                tracer,
            })
        } else {
            Ok(Self::disabled())
        }
    }

    pub(crate) fn disabled() -> Self {
        Self {
            enabled: false,
            provider: None,
            tracer: global::tracer("libsniff"),
        }
    }

    pub(crate) fn span(&self, name: &str, attributes: Vec<KeyValue>) -> TelemetrySpan {
        if !self.enabled {
            return TelemetrySpan::disabled();
        }
        let mut span = self.tracer.start(name.to_string());
        span.set_attributes(attributes);
        TelemetrySpan::new(span)
    }

    pub(crate) fn shutdown(&self) -> Result<()> {
        if let Some(provider) = &self.provider {
            provider.shutdown()?;
        }
        Ok(())
    }
}

/// RAII guard for OpenTelemetry spans.
pub(crate) struct TelemetrySpan {
    span: Option<BoxedSpan>,
}

impl TelemetrySpan {
    fn new(span: BoxedSpan) -> Self {
        Self { span: Some(span) }
    }

    fn disabled() -> Self {
        Self { span: None }
    }
}

impl Drop for TelemetrySpan {
    fn drop(&mut self) {
        if let Some(mut span) = self.span.take() {
            span.end();
        }
    }
}

/// Runs `f` inside a span when telemetry is configured; a plain call
/// otherwise. Shared by every phase that wants a §4.7 span without holding
/// an `Engine`-like owner.
pub(crate) fn with_span<T>(
    telemetry: Option<&Telemetry>,
    name: &str,
    attributes: &[KeyValue],
    f: impl FnOnce() -> T,
) -> T {
    match telemetry {
        Some(telemetry) => {
            let _span = telemetry.span(name, attributes.to_vec());
            f()
        }
        None => f(),
    }
}

/// Initializes the `tracing` subscriber once at process start (§4.5, §4.7).
/// Respects `RUST_LOG`, defaulting to `info`.
pub(crate) fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
