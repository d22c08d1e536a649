//! Tally server entry point.

use tally_server::{build_engine, init_tracing, run, ServerConfig, ServerResult};

#[tokio::main]
async fn main() -> ServerResult<()> {
    let config = ServerConfig::from_env()?;
    init_tracing(config.log_format)?;

    tracing::info!(
        store = ?config.store,
        coordination = ?config.coordination,
        bucket_interval_ms = config.engine.bucket_interval.as_millis() as u64,
        "Starting tally server"
    );

    let engine = build_engine(&config).await?;
    run(&engine, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
        }
    })
    .await
}
