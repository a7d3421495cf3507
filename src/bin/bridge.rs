//! Bridge binary: runs the AMQP listener.
//!
//! Optional: set AMBRIDGE_METRICS_ADDR (e.g. 0.0.0.0:8080) to also serve
//! Prometheus metrics and a health endpoint over HTTP.

use std::sync::Arc;

use ambridge::{amqp, observability, BridgeConfig};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("ambridge=info".parse()?))
        .init();

    let config = Arc::new(BridgeConfig::from_env()?);

    if let Some(metrics_addr) = config.metrics_addr.clone() {
        tokio::spawn(async move {
            if let Err(err) = observability::serve_metrics(metrics_addr).await {
                tracing::error!(%err, "metrics server failed");
            }
        });
    }

    amqp::listener::run(config).await?;
    Ok(())
}
