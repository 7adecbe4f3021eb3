use super::{LogFormat, TelemetryConfig};
use opentelemetry::{trace::TracerProvider as _, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    trace::{self as sdktrace, BatchConfig, BatchSpanProcessor, RandomIdGenerator, Sampler},
    Resource,
};
use opentelemetry_semantic_conventions::resource::{SERVICE_NAME, SERVICE_VERSION};
use std::env;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize tracing with an OTLP span exporter.
///
/// Falls back to local-only tracing when OpenTelemetry is disabled or no
/// endpoint is configured.
pub fn init_telemetry(config: &TelemetryConfig) -> anyhow::Result<()> {
    let json = config.log_format == LogFormat::Json;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.default_filter.as_str().into());

    let endpoint = match (&config.otel_enabled, &config.otel_endpoint) {
        (true, Some(endpoint)) => endpoint.clone(),
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(json.then(|| tracing_subscriber::fmt::layer().json()))
                .with((!json).then(tracing_subscriber::fmt::layer))
                .try_init()
                .map_err(|e| anyhow::anyhow!("Failed to install tracing subscriber: {}", e))?;

            tracing::info!("OpenTelemetry disabled, using standard tracing");
            return Ok(());
        }
    };

    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.to_str().map(|s| s.to_string()))
        .unwrap_or_else(|| "unknown".to_string());

    let instance_id =
        env::var("OTEL_SERVICE_INSTANCE_ID").unwrap_or_else(|_| uuid::Uuid::new_v4().to_string());

    let resource = Resource::new(vec![
        KeyValue::new(SERVICE_NAME, config.otel_service_name.clone()),
        KeyValue::new(SERVICE_VERSION, config.otel_service_version.clone()),
        KeyValue::new("deployment.environment", config.environment.clone()),
        KeyValue::new("host.name", hostname.clone()),
        KeyValue::new("service.instance.id", instance_id.clone()),
    ]);

    let sampler = if config.otel_sample_ratio >= 1.0 {
        Sampler::AlwaysOn
    } else if config.otel_sample_ratio <= 0.0 {
        Sampler::AlwaysOff
    } else {
        Sampler::TraceIdRatioBased(config.otel_sample_ratio)
    };

    let span_exporter = if config.otel_protocol == "http" {
        opentelemetry_otlp::SpanExporter::builder()
            .with_http()
            .with_endpoint(&endpoint)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build HTTP span exporter: {}", e))?
    } else {
        opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_endpoint(&endpoint)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build gRPC span exporter: {}", e))?
    };

    let batch_processor =
        BatchSpanProcessor::builder(span_exporter, opentelemetry_sdk::runtime::Tokio)
            .with_batch_config(BatchConfig::default())
            .build();

    let tracer_provider = sdktrace::TracerProvider::builder()
        .with_span_processor(batch_processor)
        .with_sampler(sampler)
        .with_id_generator(RandomIdGenerator::default())
        .with_resource(resource)
        .build();

    let tracer = tracer_provider.tracer(config.otel_service_name.clone());
    opentelemetry::global::set_tracer_provider(tracer_provider);

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(tracing_subscriber::fmt::layer))
        .with(tracing_opentelemetry::layer().with_tracer(tracer))
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to install tracing subscriber: {}", e))?;

    tracing::info!(
        endpoint = %endpoint,
        protocol = %config.otel_protocol,
        environment = %config.environment,
        sample_ratio = config.otel_sample_ratio,
        hostname = %hostname,
        instance_id = %instance_id,
        "OpenTelemetry initialized successfully"
    );

    Ok(())
}

pub async fn shutdown_telemetry() {
    tracing::info!("Shutting down OpenTelemetry...");
    opentelemetry::global::shutdown_tracer_provider();
    tracing::info!("OpenTelemetry shutdown complete");
}
