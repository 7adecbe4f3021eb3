use std::env;

const DEFAULT_FILTER: &str = "wave=info,wave_storage=info,wave_cli=info";

/// Output format of the fmt layer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Telemetry settings, read from the environment by the binaries.
#[derive(Clone, Debug, PartialEq)]
pub struct TelemetryConfig {
    pub otel_enabled: bool,
    pub otel_endpoint: Option<String>,
    pub otel_service_name: String,
    pub otel_service_version: String,
    pub otel_protocol: String,
    pub otel_sample_ratio: f64,
    pub environment: String,
    pub log_format: LogFormat,
    /// Used when `RUST_LOG` is not set.
    pub default_filter: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        TelemetryConfig {
            otel_enabled: false,
            otel_endpoint: None,
            otel_service_name: "wave".to_string(),
            otel_service_version: env!("CARGO_PKG_VERSION").to_string(),
            otel_protocol: "grpc".to_string(),
            otel_sample_ratio: 1.0,
            environment: "development".to_string(),
            log_format: LogFormat::Text,
            default_filter: DEFAULT_FILTER.to_string(),
        }
    }
}

impl TelemetryConfig {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = TelemetryConfig::default();
        let var = |name: &str| lookup(name).filter(|s| !s.trim().is_empty());

        TelemetryConfig {
            otel_enabled: var("OTEL_ENABLED")
                .map(|s| s.to_lowercase().parse().unwrap_or(false))
                .unwrap_or(defaults.otel_enabled),
            otel_endpoint: var("OTEL_EXPORTER_OTLP_ENDPOINT"),
            otel_service_name: var("OTEL_SERVICE_NAME").unwrap_or(defaults.otel_service_name),
            otel_service_version: var("OTEL_SERVICE_VERSION")
                .unwrap_or(defaults.otel_service_version),
            otel_protocol: var("OTEL_EXPORTER_OTLP_PROTOCOL")
                .map(|s| s.to_lowercase())
                .unwrap_or(defaults.otel_protocol),
            otel_sample_ratio: var("OTEL_SAMPLE_RATIO")
                .and_then(|s| s.parse::<f64>().ok())
                .map(|ratio| ratio.clamp(0.0, 1.0))
                .unwrap_or(defaults.otel_sample_ratio),
            environment: var("ENVIRONMENT")
                .or_else(|| var("APP_ENV"))
                .unwrap_or(defaults.environment),
            log_format: match var("LOG_FORMAT").map(|s| s.to_lowercase()).as_deref() {
                Some("json") => LogFormat::Json,
                _ => LogFormat::Text,
            },
            default_filter: defaults.default_filter,
        }
    }
}
