use std::time::Duration;

use replay_pipeline::{
    app_state::AppState,
    config::AppConfig,
    models::job::Stage,
    pipeline::orchestrator::PipelineStep,
};
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

const POLL_INTERVAL_SECS: u64 = 30;

/// Long-running classification worker: reconciles stored replays and
/// classifies them, then polls for more.
#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting replay classification worker");

    // Load configuration
    let config = AppConfig::from_env().expect("Failed to load configuration");
    replay_pipeline::describe_metrics();

    let state = AppState::from_config(&config)
        .await
        .expect("Failed to initialize worker collaborators");
    let pipeline = state.pipeline(&config);

    tracing::info!(
        workers = config.worker_pool_size,
        "Worker ready, starting classification loop"
    );

    let steps = [PipelineStep::Reconcile, PipelineStep::Classify];
    loop {
        if let Some(secs) = config.reclaim_stale_after_secs {
            if let Err(e) = pipeline
                .reclaim_stale(Stage::Classify, Duration::from_secs(secs))
                .await
            {
                tracing::error!(error = %e, "Failed to reclaim stale jobs");
            }
        }

        match pipeline.run(&steps).await {
            Ok(report) => {
                let classified = report.classify.map(|s| s.processed()).unwrap_or(0);
                tracing::debug!(classified, "Classification pass finished");
            }
            Err(e) => {
                tracing::error!(error = %e, "Classification pass failed, will retry");
            }
        }

        sleep(Duration::from_secs(POLL_INTERVAL_SECS)).await;
    }
}
