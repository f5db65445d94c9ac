//! Telemetry helpers for the IoT voice relay.
//! Installs the tracing subscriber (with optional OTLP export), and provides message labels and
//! metric recorders on top of the `metrics` facade.

use anyhow::Result;

mod config;
mod context;
mod metrics;
mod tracing_init;

pub use config::{TelemetryConfig, TelemetryProtocol};
pub use context::{MessageLabels, with_message_fields};
pub use metrics::{record_counter, record_histogram};
pub use tracing_init::{init_telemetry, shutdown_telemetry, telemetry_enabled};

/// Installs the shared subscriber configured from `RUST_LOG`, `LOG_FORMAT` and `OTEL_*`.
pub fn install(service_name: &str, service_version: &str) -> Result<()> {
    init_telemetry(TelemetryConfig::from_env(service_name, service_version))
}
