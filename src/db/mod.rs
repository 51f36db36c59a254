use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;
use uuid::Uuid;

use crate::models::derived::DerivedRecord;
use crate::models::job::{Job, JobState, Stage, StaleStateError, TransitionError};

pub mod memory;
pub mod postgres;

/// Initialize PostgreSQL connection pool
pub async fn init_pool(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .min_connections(1)
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await
}

/// Run database migrations
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| sqlx::Error::Migrate(Box::new(e)))
}

/// Persisted job state. Every state mutation is a compare-and-set on
/// `(job_id, expected_state)`.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a job. Returns `false` when a job with the same object key
    /// already exists.
    async fn insert(&self, job: &Job) -> Result<bool, JobStoreError>;

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>, JobStoreError>;

    /// Jobs in exactly `state`, ordered by object key ascending.
    async fn select_by_state(&self, state: JobState) -> Result<Vec<Job>, JobStoreError>;

    async fn compare_and_set(
        &self,
        job_id: Uuid,
        expected: JobState,
        new: JobState,
    ) -> Result<(), JobStoreError>;

    /// Insert derived records and advance the job in one atomic unit.
    async fn persist_derived(
        &self,
        job_id: Uuid,
        expected: JobState,
        new: JobState,
        records: &[DerivedRecord],
    ) -> Result<(), JobStoreError>;

    async fn derived_for_job(&self, job_id: Uuid) -> Result<Vec<DerivedRecord>, JobStoreError>;

    /// Operator action: move every failed job of `stage` back to pending.
    async fn requeue_failed(&self, stage: Stage) -> Result<u64, JobStoreError>;

    /// Operator action: release in-progress jobs of `stage` not updated since
    /// `cutoff` back to pending.
    async fn reclaim_stale(&self, stage: Stage, cutoff: DateTime<Utc>) -> Result<u64, JobStoreError>;
}

pub(crate) fn check_edge(expected: JobState, new: JobState) -> Result<(), JobStoreError> {
    if expected.can_transition_to(new) {
        Ok(())
    } else {
        Err(JobStoreError::InvalidTransition {
            from: expected,
            to: new,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JobStoreError {
    #[error(transparent)]
    Stale(#[from] StaleStateError),

    #[error("job {0} not found")]
    NotFound(Uuid),

    #[error("transition {from} -> {to} is not part of the job lifecycle")]
    InvalidTransition { from: JobState, to: JobState },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("corrupt job row: {0}")]
    Corrupt(String),

    #[error("job store lock poisoned")]
    Poisoned,
}

impl From<TransitionError> for JobStoreError {
    fn from(e: TransitionError) -> Self {
        match e {
            TransitionError::Stale(stale) => JobStoreError::Stale(stale),
            TransitionError::Invalid { from, to } => JobStoreError::InvalidTransition { from, to },
        }
    }
}
