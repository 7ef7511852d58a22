use log::{info, warn};
use loghouse::{Backends, IngestConfig, Pipeline};
use miette::IntoDiagnostic;

#[tokio::main]
async fn main() -> miette::Result<()> {
    env_logger::init();

    let config = IngestConfig::config().into_diagnostic()?;
    info!(
        "starting loghouse: stream {} / group {}, {} stream workers",
        config.stream_key, config.consumer_group, config.stream_processor_count
    );

    let backends = Backends::connect(&config).await.into_diagnostic()?;
    let pipeline = Pipeline::start(config, backends).await;

    // First ctrl-c drains, a second one abandons the drain
    tokio::signal::ctrl_c().await.into_diagnostic()?;
    info!("received shutdown signal, draining");

    tokio::select! {
        _ = pipeline.shutdown() => {}
        result = tokio::signal::ctrl_c() => {
            result.into_diagnostic()?;
            warn!("second shutdown signal, abandoning the drain");
        }
    }

    let stats = pipeline.stats();
    info!(
        "final stats: {}",
        serde_json::to_string(&stats).into_diagnostic()?
    );

    Ok(())
}
