use std::time::Duration;

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::EnvFilter;

use replay_pipeline::{app_state::AppState, config::AppConfig, models::job::Stage};

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");
    let steps = config.steps().expect("Invalid pipeline steps");

    tracing::info!(steps = %config.pipeline_steps, "Starting replay pipeline");

    if let Some(addr) = &config.metrics_addr {
        let addr: std::net::SocketAddr = addr.parse().expect("Invalid METRICS_ADDR");
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .expect("Failed to install Prometheus metrics exporter");
        tracing::info!(%addr, "Prometheus exporter listening");
    }
    replay_pipeline::describe_metrics();

    let state = AppState::from_config(&config)
        .await
        .expect("Failed to initialize pipeline collaborators");
    let pipeline = state.pipeline(&config);

    if let Some(secs) = config.reclaim_stale_after_secs {
        for stage in [Stage::Fetch, Stage::Classify] {
            pipeline
                .reclaim_stale(stage, Duration::from_secs(secs))
                .await
                .expect("Failed to reclaim stale jobs");
        }
    }

    if config.requeue_failed {
        for stage in [Stage::Fetch, Stage::Classify] {
            pipeline
                .requeue_failed(stage)
                .await
                .expect("Failed to re-queue failed jobs");
        }
    }

    match pipeline.run(&steps).await {
        Ok(report) => {
            tracing::info!(
                report = %serde_json::to_string(&report).unwrap_or_default(),
                "Pipeline run complete"
            );
        }
        Err(e) => {
            tracing::error!(error = %e, "Pipeline run aborted");
            std::process::exit(1);
        }
    }
}
