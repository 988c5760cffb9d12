use anyhow::Context;

use crate::config::Settings;
use crate::Telemetry;

/// Installs the process logger and builds the tracing pipeline.
///
/// Must run outside of an async runtime: the exporter sends spans from its
/// own thread with a blocking HTTP client.
pub fn init(settings: &Settings, version: &'static str) -> anyhow::Result<Telemetry> {
    env_logger::Builder::new()
        .parse_filters(&settings.rust_log)
        .try_init()
        .context("could not install logger")?;

    let resource = resource(&settings.service_name, version);
    let provider = tracer(&settings.traces_endpoint(), resource)?;

    log::info!(
        service:% = settings.service_name,
        endpoint:% = settings.otel_exporter_otlp_endpoint;
        "telemetry initialized"
    );

    Ok(Telemetry::new(provider).with_shutdown_timeout(settings.shutdown_timeout()))
}

fn tracer(
    endpoint: &str,
    resource: opentelemetry_sdk::Resource,
) -> anyhow::Result<opentelemetry_sdk::trace::SdkTracerProvider> {
    let provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
        .with_batch_exporter(exporter(endpoint)?)
        .with_resource(resource)
        .build();

    Ok(provider)
}

fn exporter(endpoint: &str) -> anyhow::Result<opentelemetry_otlp::SpanExporter> {
    use opentelemetry_otlp::WithExportConfig;

    opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_endpoint(endpoint)
        .build()
        .context("could not build span exporter")
}

fn resource(name: &str, version: &'static str) -> opentelemetry_sdk::Resource {
    use opentelemetry_semantic_conventions::resource::SERVICE_VERSION;

    opentelemetry_sdk::Resource::builder()
        .with_service_name(name.to_owned())
        .with_attribute(opentelemetry::KeyValue::new(SERVICE_VERSION, version))
        .build()
}
