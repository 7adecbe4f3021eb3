//! Telemetry initialization
//!
//! Without the `observability-opentelemetry` feature only a local tracing
//! subscriber is installed; with it, spans are also exported over OTLP.

mod config;

#[cfg(feature = "observability-opentelemetry")]
mod init_opentelemetry;

#[cfg(not(feature = "observability-opentelemetry"))]
mod init_basic;

pub use config::{LogFormat, TelemetryConfig};

#[cfg(feature = "observability-opentelemetry")]
pub use init_opentelemetry::{init_telemetry, shutdown_telemetry};

#[cfg(not(feature = "observability-opentelemetry"))]
pub use init_basic::{init_telemetry, shutdown_telemetry};
