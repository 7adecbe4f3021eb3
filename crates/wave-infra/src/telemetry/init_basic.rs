use super::{LogFormat, TelemetryConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize basic tracing (without OpenTelemetry)
pub fn init_telemetry(config: &TelemetryConfig) -> anyhow::Result<()> {
    let json = config.log_format == LogFormat::Json;

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.default_filter.as_str().into()),
        )
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(tracing_subscriber::fmt::layer))
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to install tracing subscriber: {}", e))?;

    if config.otel_enabled {
        tracing::warn!("OTEL_ENABLED is set but the OpenTelemetry feature is not compiled in");
    }
    Ok(())
}

pub async fn shutdown_telemetry() {
    tracing::debug!("Telemetry shutdown (OpenTelemetry feature not enabled)");
}
