use anyhow::Context;
use molflow_observability::LogFormat;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let format = match std::env::var("MOLFLOW_LOG_FORMAT") {
        Ok(raw) => raw.parse::<LogFormat>()?,
        Err(_) => LogFormat::default(),
    };
    molflow_observability::init(format);

    let config = molflow_execution::ExecutionConfig::from_env()
        .context("invalid MOLFLOW_* configuration")?;
    let database_url = std::env::var("DATABASE_URL").ok();

    let app = molflow_worker::app::start(config, database_url.as_deref()).await?;
    tracing::info!(providers = ?app.providers(), "molflow worker running");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    tracing::info!("shutdown requested");

    app.shutdown().await;
    Ok(())
}
