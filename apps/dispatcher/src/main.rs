use anyhow::Result;
use iotv_dispatcher::config::DispatcherConfig;

#[tokio::main]
async fn main() -> Result<()> {
    iotv_telemetry::install("iotv-dispatcher", env!("CARGO_PKG_VERSION"))?;
    tracing::info!(
        otlp = iotv_telemetry::telemetry_enabled(),
        version = env!("CARGO_PKG_VERSION"),
        "telemetry installed"
    );
    let config = DispatcherConfig::from_env()?;
    let result = iotv_dispatcher::run(config).await;
    iotv_telemetry::shutdown_telemetry();
    result
}
