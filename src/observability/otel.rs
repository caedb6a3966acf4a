use anyhow::Result;
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{resource::Resource, trace as sdktrace};

/// OTLP tracer exporting every span of a run to `endpoint`.
pub fn install_tracer(service_name: &str, endpoint: &str) -> Result<sdktrace::Tracer> {
    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_trace_config(
            sdktrace::Config::default().with_resource(Resource::new(vec![KeyValue::new(
                "service.name",
                service_name.to_string(),
            )])),
        )
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint),
        )
        .install_simple()?;
    Ok(tracer)
}

pub fn shutdown() {
    opentelemetry::global::shutdown_tracer_provider();
}
