use std::sync::Arc;

use uuid::Uuid;

use crate::db::{JobStore, JobStoreError};
use crate::error::{StageError, Transience};
use crate::models::job::{Job, JobState, Stage};
use crate::pipeline::retry::{RetryError, RetryPolicy};
use crate::pipeline::StageOutcome;
use crate::services::source::ReplaySource;
use crate::services::storage::{ContentKind, ObjectStore};

/// Per-job logic of the fetch stage: fetch the replay, write it to the
/// object store at the job's key, advance the job.
pub struct FetchExecutor {
    source: Arc<dyn ReplaySource>,
    store: Arc<dyn ObjectStore>,
    jobs: Arc<dyn JobStore>,
    retry: RetryPolicy,
    prefix: String,
}

impl FetchExecutor {
    pub fn new(
        source: Arc<dyn ReplaySource>,
        store: Arc<dyn ObjectStore>,
        jobs: Arc<dyn JobStore>,
        retry: RetryPolicy,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            source,
            store,
            jobs,
            retry,
            prefix: prefix.into(),
        }
    }

    pub fn storage_key(&self, job: &Job) -> String {
        format!("{}{}", self.prefix, job.object_key)
    }

    /// Process one job in `fetch_pending`.
    pub async fn execute(&self, job: Job) -> StageOutcome {
        let started = std::time::Instant::now();

        match self
            .jobs
            .compare_and_set(job.id, JobState::FetchPending, JobState::FetchInProgress)
            .await
        {
            Ok(()) => {}
            Err(JobStoreError::Stale(e)) => {
                tracing::info!(job_id = %job.id, stage = %Stage::Fetch, actual = %e.actual, "Job already claimed, skipping");
                return StageOutcome::Skipped;
            }
            Err(e) => {
                tracing::error!(job_id = %job.id, stage = %Stage::Fetch, error = %e, "Failed to claim job");
                return StageOutcome::Errored;
            }
        }

        let key = self.storage_key(&job);
        let result = self
            .retry
            .run(
                |attempt| {
                    metrics::counter!("replay_fetch_attempts_total").increment(1);
                    tracing::debug!(job_id = %job.id, attempt, object_key = %key, "Fetching replay");
                    self.fetch_and_store(&job, &key)
                },
                |e: &StageError| e.is_transient(),
            )
            .await;

        let outcome = match result {
            Ok(()) => self.finish(&job, JobState::FetchCompleted).await,
            Err(RetryError::Exhausted { attempts, last }) => {
                tracing::error!(
                    job_id = %job.id,
                    stage = %Stage::Fetch,
                    attempts,
                    error = %last,
                    "Job exceeded retries, marking failed"
                );
                self.finish(&job, JobState::FetchFailed).await
            }
            Err(RetryError::Permanent(e)) => {
                tracing::error!(job_id = %job.id, stage = %Stage::Fetch, error = %e, "Permanent failure, marking failed");
                self.finish(&job, JobState::FetchFailed).await
            }
        };

        metrics::histogram!("replay_stage_seconds", "stage" => "fetch")
            .record(started.elapsed().as_secs_f64());
        outcome
    }

    async fn fetch_and_store(&self, job: &Job, key: &str) -> Result<(), StageError> {
        let raw = self.source.fetch(&job.source_locator).await?;
        let kind = ContentKind::from_key(key)?;
        let body = kind.encode(&raw)?;
        self.store.put(key, &body, kind).await?;
        Ok(())
    }

    async fn finish(&self, job: &Job, to: JobState) -> StageOutcome {
        match self.commit(job.id, to).await {
            Ok(()) => {
                tracing::info!(job_id = %job.id, stage = %Stage::Fetch, object_key = %job.object_key, state = %to, "Job state committed");
                if to == JobState::FetchCompleted {
                    StageOutcome::Completed
                } else {
                    StageOutcome::Failed
                }
            }
            Err(JobStoreError::Stale(e)) => {
                tracing::warn!(job_id = %job.id, stage = %Stage::Fetch, error = %e, "Job moved underneath us, skipping commit");
                StageOutcome::Skipped
            }
            Err(e) => {
                tracing::error!(job_id = %job.id, stage = %Stage::Fetch, error = %e, "Failed to commit job state");
                self.release(job).await
            }
        }
    }

    /// Hand the job back to `fetch_pending` so a later run picks it up. The
    /// stored object, if any, is overwritten by that run.
    async fn release(&self, job: &Job) -> StageOutcome {
        match self.commit(job.id, JobState::FetchPending).await {
            Ok(()) => {
                tracing::warn!(job_id = %job.id, stage = %Stage::Fetch, "Job released back to pending");
                StageOutcome::Released
            }
            Err(e) => {
                // Left in fetch_in_progress; reclaim_stale releases it.
                tracing::error!(job_id = %job.id, stage = %Stage::Fetch, error = %e, "Failed to release job");
                StageOutcome::Errored
            }
        }
    }

    async fn commit(&self, job_id: Uuid, to: JobState) -> Result<(), JobStoreError> {
        self.jobs
            .compare_and_set(job_id, JobState::FetchInProgress, to)
            .await
    }
}
