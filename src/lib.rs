//! Replay pipeline
//!
//! Moves league match replays through two stages: fetch each replay from its
//! source and store it under a deterministic key, then classify the stored
//! replay and persist the derived deck records. Job state lives in Postgres
//! and every transition is a compare-and-set.

pub mod app_state;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod services;

/// Register descriptions for the metrics the pipeline emits.
pub fn describe_metrics() {
    metrics::describe_counter!(
        "replay_jobs_total",
        "Jobs processed per stage, labeled by outcome"
    );
    metrics::describe_counter!(
        "replay_fetch_attempts_total",
        "Fetch attempts, including retries"
    );
    metrics::describe_histogram!(
        "replay_stage_seconds",
        "Time spent in a stage (per job for fetch, per batch for classify)"
    );
}
