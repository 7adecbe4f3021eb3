//! Wave Infrastructure Library
//!
//! Shared infrastructure for Wave binaries:
//! - Telemetry initialization (tracing subscriber, optional OpenTelemetry export)

#[cfg(feature = "observability-basic")]
pub mod telemetry;

// Re-export commonly used types
#[cfg(feature = "observability-basic")]
pub use telemetry::{init_telemetry, shutdown_telemetry, LogFormat, TelemetryConfig};
