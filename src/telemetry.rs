//! Structured logging and metrics bootstrap.
//!
//! `tracing`/`tracing-subscriber` wiring follows the same `init_tracing`
//! shape used elsewhere in this stack; the Prometheus recorder follows the
//! same `metrics`/`metrics-exporter-prometheus` wiring. Both are installed
//! once from `main.rs` at process start.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "risk_control_plane=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Installs the Prometheus recorder backing the `risk_metrics` measurement.
/// Returns the bound address text for a startup log line.
pub fn init_metrics_recorder(listen: std::net::SocketAddr) -> anyhow::Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(listen)
        .install()?;
    Ok(())
}
