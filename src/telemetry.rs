use std::error::Error;

use opentelemetry::{Context, KeyValue, global, trace::TracerProvider};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    error::OTelSdkResult, propagation::TraceContextPropagator, resource::Resource,
    trace::SdkTracerProvider,
};
use tonic::metadata::{Ascii, MetadataKey, MetadataMap, MetadataValue};
use tracing::Span;
use tracing_opentelemetry::OpenTelemetrySpanExt;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// RAII guard that shuts down the tracer provider when dropped.
pub struct TelemetryGuard {
    provider: Option<SdkTracerProvider>,
}

impl TelemetryGuard {
    /// Shutdown the underlying tracer provider, flushing any pending spans.
    pub fn shutdown(mut self) -> OTelSdkResult {
        match self.provider.take() {
            Some(provider) => provider.shutdown(),
            None => Ok(()),
        }
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.provider.take() {
            if let Err(err) = provider.shutdown() {
                tracing::error!(?err, "failed to shutdown tracer provider");
            }
        }
    }
}

/// Install the global subscriber: env-filtered fmt output, plus an OTLP span
/// exporter unless tracing export is disabled.
///
/// `OTEL_EXPORTER_OTLP_ENDPOINT` (default `http://127.0.0.1:4317`),
/// `OTEL_SERVICE_NAME` and `OTEL_SERVICE_INSTANCE_ID` override the exporter
/// target and resource attributes. Keep the returned guard alive for as long
/// as spans should be exported.
pub fn init_tracing(
    default_service_name: &str,
    default_instance: Option<String>,
) -> Result<TelemetryGuard, Box<dyn Error>> {
    let env_filter =
        || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = || tracing_subscriber::fmt::layer().with_target(true);
    if tracing_disabled() {
        tracing_subscriber::registry()
            .with(env_filter())
            .with(fmt_layer())
            .try_init()?;
        return Ok(TelemetryGuard { provider: None });
    }

    let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .unwrap_or_else(|_| "http://127.0.0.1:4317".to_string());
    let service_name =
        std::env::var("OTEL_SERVICE_NAME").unwrap_or_else(|_| default_service_name.to_string());
    let instance = std::env::var("OTEL_SERVICE_INSTANCE_ID")
        .ok()
        .or(default_instance);

    global::set_text_map_propagator(TraceContextPropagator::new());

    let mut resource_builder = Resource::builder().with_service_name(service_name);
    if let Some(instance_id) = instance {
        resource_builder =
            resource_builder.with_attribute(KeyValue::new("service.instance.id", instance_id));
    }

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(otlp_endpoint)
        .build()?;
    let provider = SdkTracerProvider::builder()
        .with_resource(resource_builder.build())
        .with_batch_exporter(exporter)
        .build();

    let guard = TelemetryGuard {
        provider: Some(provider.clone()),
    };
    let tracer = provider.tracer(default_service_name.to_owned());
    let _ = global::set_tracer_provider(provider);

    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt_layer())
        .with(tracing_opentelemetry::layer().with_tracer(tracer))
        .try_init()?;

    Ok(guard)
}

/// Extract the caller's trace context from incoming HTTP headers.
pub fn extract_remote_context(headers: &hyper::HeaderMap) -> Context {
    global::get_text_map_propagator(|prop| prop.extract(&HeaderExtractor(headers)))
}

/// Inject the current span's context into outgoing gRPC metadata.
pub fn inject_context(metadata: &mut MetadataMap) {
    global::get_text_map_propagator(|prop| {
        let context = Span::current().context();
        prop.inject_context(&context, &mut MetadataMapInjector(metadata));
    });
}

struct HeaderExtractor<'a>(&'a hyper::HeaderMap);

impl<'a> opentelemetry::propagation::Extractor for HeaderExtractor<'a> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|value| value.to_str().ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(|name| name.as_str()).collect()
    }
}

struct MetadataMapInjector<'a>(&'a mut MetadataMap);

impl<'a> opentelemetry::propagation::Injector for MetadataMapInjector<'a> {
    fn set(&mut self, key: &str, value: String) {
        if let Ok(value) = MetadataValue::<Ascii>::try_from(value.as_str()) {
            if let Ok(key) = key.parse::<MetadataKey<Ascii>>() {
                let _ = self.0.insert(key, value);
            }
        }
    }
}

pub fn tracing_disabled() -> bool {
    matches!(
        std::env::var("CASS_PILOT_DISABLE_TRACING"),
        Ok(v) if matches!(v.as_str(), "1" | "true" | "TRUE" | "True" | "yes" | "YES")
    )
}
