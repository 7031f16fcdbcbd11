//! Process-wide logging and optional span export for mesh nodes.
//!
//! Spans opened on the call path (`mesh.call`, `mesh.serve`, `mesh.announce`)
//! are forwarded to an OTLP collector when one is configured; otherwise only
//! log lines are written.

use crate::infrastructure::config::{LogFormat, TelemetrySettings};
use anyhow::{Context, Result};
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::{BatchSpanProcessor, Sampler, SdkTracerProvider};
use opentelemetry_sdk::Resource;
use opentelemetry_semantic_conventions::resource as semconv;
use tracing::Subscriber;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

const INSTANCE_ID: &str = "service.instance.id";

type BoxedLayer<S> = Box<dyn Layer<S> + Send + Sync + 'static>;

/// Where spans go when export is on.
#[derive(Debug, Clone, PartialEq)]
struct Export {
    endpoint: String,
    sampling_ratio: f64,
}

/// Configures and installs the global subscriber once per process.
#[derive(Debug, Clone)]
pub struct TelemetryBuilder {
    service: String,
    version: String,
    instance: Option<String>,
    directive: String,
    format: LogFormat,
    export: Option<Export>,
}

impl TelemetryBuilder {
    /// Starts from JSON logs at `info` without span export.
    pub fn new(service: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            version: version.into(),
            instance: None,
            directive: "info".to_string(),
            format: LogFormat::Json,
            export: None,
        }
    }

    /// Mirrors the telemetry section of the loaded settings.
    #[must_use]
    pub fn from_settings(settings: &TelemetrySettings, version: impl Into<String>) -> Self {
        let mut builder = Self::new(settings.service_name.clone(), version);
        builder.directive.clone_from(&settings.log_level);
        builder.format = settings.log_format;
        match &settings.otlp_endpoint {
            Some(endpoint) => builder.with_export(endpoint.clone(), settings.sampling_ratio),
            None => builder,
        }
    }

    /// Sends spans to the OTLP collector at `endpoint`, keeping `ratio` of roots.
    #[must_use]
    pub fn with_export(mut self, endpoint: impl Into<String>, ratio: f64) -> Self {
        let sampling_ratio = if ratio.is_finite() { ratio.clamp(0.0, 1.0) } else { 1.0 };
        self.export = Some(Export {
            endpoint: endpoint.into(),
            sampling_ratio,
        });
        self
    }

    /// Tags exported spans with the node they came from.
    #[must_use]
    pub fn with_instance(mut self, node: Option<&str>) -> Self {
        self.instance = node.map(str::to_string);
        self
    }

    /// Writes compact lines to stderr instead of JSON.
    #[must_use]
    pub fn with_plain_logs(mut self) -> Self {
        self.format = LogFormat::Plain;
        self
    }

    /// Installs the subscriber and, with export on, the global tracer provider.
    ///
    /// # Errors
    ///
    /// Fails when the OTLP exporter cannot be built or a global subscriber is
    /// already installed.
    pub fn init(self) -> Result<()> {
        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&self.directive))
            .with_context(|| format!("Invalid log directive `{}`", self.directive))?;

        let mut layers: Vec<BoxedLayer<_>> = vec![self.log_layer()];
        if let Some(export) = &self.export {
            let provider = self.tracer_provider(export)?;
            opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());
            let tracer = provider.tracer(self.service.clone());
            opentelemetry::global::set_tracer_provider(provider);
            layers.push(tracing_opentelemetry::layer().with_tracer(tracer).boxed());
        }

        tracing_subscriber::registry()
            .with(filter)
            .with(layers)
            .try_init()
            .context("Failed to install tracing subscriber")
    }

    fn log_layer<S>(&self) -> BoxedLayer<S>
    where
        S: Subscriber + for<'a> LookupSpan<'a>,
    {
        match self.format {
            LogFormat::Json => fmt::layer().json().with_span_events(FmtSpan::CLOSE).boxed(),
            LogFormat::Plain => fmt::layer()
                .compact()
                .with_target(false)
                .with_writer(std::io::stderr)
                .boxed(),
        }
    }

    fn resource(&self) -> Resource {
        let mut attributes = vec![
            KeyValue::new(semconv::SERVICE_NAME, self.service.clone()),
            KeyValue::new(semconv::SERVICE_VERSION, self.version.clone()),
        ];
        if let Some(node) = &self.instance {
            attributes.push(KeyValue::new(INSTANCE_ID, node.clone()));
        }
        Resource::builder().with_attributes(attributes).build()
    }

    fn tracer_provider(&self, export: &Export) -> Result<SdkTracerProvider> {
        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_endpoint(export.endpoint.clone())
            .build()
            .with_context(|| format!("Failed to build OTLP exporter for {}", export.endpoint))?;

        let sampler = Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(
            export.sampling_ratio,
        )));
        Ok(SdkTracerProvider::builder()
            .with_span_processor(BatchSpanProcessor::builder(exporter).build())
            .with_resource(self.resource())
            .with_sampler(sampler)
            .build())
    }
}
