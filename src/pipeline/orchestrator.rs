use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use strum::{Display, EnumString};

use crate::db::{JobStore, JobStoreError};
use crate::models::job::{Job, JobState, Stage};
use crate::models::league_match::LeagueMatch;
use crate::pipeline::fetch::FetchExecutor;
use crate::pipeline::retry::RetryPolicy;
use crate::pipeline::runner::{run_each, RunLimits};
use crate::pipeline::worker_pool::WorkerPool;
use crate::pipeline::StageSummary;
use crate::services::classifier::Classifier;
use crate::services::source::ReplaySource;
use crate::services::storage::{ObjectStore, StorageError};

/// One step of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum PipelineStep {
    Fetch,
    Reconcile,
    Classify,
}

/// Tunables the orchestrator passes down to its executors.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub retry: RetryPolicy,
    pub limits: RunLimits,
    pub worker_pool_size: usize,
    pub storage_prefix: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub checked: usize,
    pub advanced: usize,
    pub missing: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub fetch: Option<StageSummary>,
    pub reconcile: Option<ReconcileSummary>,
    pub classify: Option<StageSummary>,
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("job store error: {0}")]
    JobStore(#[from] JobStoreError),

    #[error("object store error: {0}")]
    Storage(#[from] StorageError),
}

/// Selects jobs by state and drives them through the stages.
pub struct Pipeline {
    jobs: Arc<dyn JobStore>,
    store: Arc<dyn ObjectStore>,
    fetch: Arc<FetchExecutor>,
    pool: WorkerPool,
    settings: PipelineSettings,
}

impl Pipeline {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        store: Arc<dyn ObjectStore>,
        source: Arc<dyn ReplaySource>,
        classifier: Arc<dyn Classifier>,
        settings: PipelineSettings,
    ) -> Self {
        let fetch = Arc::new(FetchExecutor::new(
            source,
            store.clone(),
            jobs.clone(),
            settings.retry.clone(),
            settings.storage_prefix.clone(),
        ));
        let pool = WorkerPool::new(
            settings.worker_pool_size,
            classifier,
            store.clone(),
            jobs.clone(),
            settings.storage_prefix.clone(),
        );

        Self {
            jobs,
            store,
            fetch,
            pool,
            settings,
        }
    }

    /// Create fetch jobs for every eligible match. Matches that already have
    /// a job are left alone. Returns the number of jobs created.
    pub async fn enqueue_matches(&self, matches: &[LeagueMatch]) -> Result<usize, JobStoreError> {
        let mut created = 0;
        for league_match in matches {
            if !league_match.is_eligible_for_job() {
                tracing::debug!(league_match_id = %league_match.id, score = %league_match.match_score, "Match not eligible for a replay job");
                continue;
            }
            let (Some(replay_id), Some(locator)) = (league_match.resolved_replay_id(), league_match.source_locator()) else {
                continue;
            };
            if self.jobs.insert(&Job::new(league_match.id, replay_id, locator)).await? {
                created += 1;
            }
        }
        tracing::info!(matches = matches.len(), created, "Enqueued replay jobs");
        Ok(created)
    }

    /// Run the fetch stage over every `fetch_pending` job.
    pub async fn run_fetch_stage(&self) -> Result<StageSummary, JobStoreError> {
        let candidates = self.jobs.select_by_state(JobState::FetchPending).await?;
        let mut summary = StageSummary::new(Stage::Fetch, candidates.len());

        if candidates.is_empty() {
            tracing::info!(stage = %Stage::Fetch, "No pending jobs found");
            return Ok(summary);
        }
        tracing::info!(stage = %Stage::Fetch, count = candidates.len(), "Found pending jobs to process");

        let executor = self.fetch.clone();
        let outcomes = run_each(
            candidates,
            move |job| {
                let executor = executor.clone();
                async move { executor.execute(job).await }
            },
            self.settings.limits,
        )
        .await;

        for outcome in outcomes {
            summary.record(outcome);
        }
        tracing::info!(stage = %Stage::Fetch, ?summary, "Fetch stage finished");
        Ok(summary)
    }

    /// Move `fetch_completed` jobs whose object exists in the store to
    /// `classify_pending`.
    pub async fn reconcile(&self) -> Result<ReconcileSummary, PipelineError> {
        let prefix = &self.settings.storage_prefix;
        let stored: HashSet<String> = self
            .store
            .list(prefix)
            .await?
            .into_iter()
            .filter_map(|key| key.strip_prefix(prefix.as_str()).map(str::to_string))
            .filter(|key| !key.is_empty())
            .collect();

        let candidates = self.jobs.select_by_state(JobState::FetchCompleted).await?;
        let mut summary = ReconcileSummary {
            checked: candidates.len(),
            ..Default::default()
        };

        for job in candidates {
            if !stored.contains(&job.object_key) {
                tracing::warn!(job_id = %job.id, object_key = %job.object_key, "Completed job has no stored object");
                summary.missing += 1;
                continue;
            }
            match self
                .jobs
                .compare_and_set(job.id, JobState::FetchCompleted, JobState::ClassifyPending)
                .await
            {
                Ok(()) => summary.advanced += 1,
                Err(JobStoreError::Stale(e)) => {
                    tracing::info!(job_id = %job.id, error = %e, "Job moved during reconcile, skipping");
                    summary.skipped += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }

        tracing::info!(
            stored = stored.len(),
            checked = summary.checked,
            advanced = summary.advanced,
            missing = summary.missing,
            "Reconciled jobs against object store"
        );
        Ok(summary)
    }

    /// Run the classification stage over every `classify_pending` job.
    pub async fn run_classify_stage(&self) -> Result<StageSummary, JobStoreError> {
        let candidates = self.jobs.select_by_state(JobState::ClassifyPending).await?;
        if candidates.is_empty() {
            tracing::info!(stage = %Stage::Classify, "No pending jobs found");
            return Ok(StageSummary::new(Stage::Classify, 0));
        }
        tracing::info!(
            stage = %Stage::Classify,
            count = candidates.len(),
            workers = self.pool.size(),
            "Found pending jobs to classify"
        );

        let started = std::time::Instant::now();
        let summary = self.pool.run(candidates).await;
        metrics::histogram!("replay_stage_seconds", "stage" => "classify")
            .record(started.elapsed().as_secs_f64());

        tracing::info!(stage = %Stage::Classify, ?summary, "Classification stage finished");
        Ok(summary)
    }

    /// Operator action: put failed jobs of `stage` back in the queue.
    pub async fn requeue_failed(&self, stage: Stage) -> Result<u64, JobStoreError> {
        let count = self.jobs.requeue_failed(stage).await?;
        tracing::info!(stage = %stage, count, "Re-queued failed jobs");
        Ok(count)
    }

    /// Operator action: release jobs stuck in progress for longer than
    /// `older_than`.
    pub async fn reclaim_stale(&self, stage: Stage, older_than: Duration) -> Result<u64, JobStoreError> {
        let window = chrono::Duration::from_std(older_than).unwrap_or(chrono::Duration::MAX);
        let cutoff = chrono::Utc::now()
            .checked_sub_signed(window)
            .unwrap_or(chrono::DateTime::<chrono::Utc>::MIN_UTC);
        let count = self.jobs.reclaim_stale(stage, cutoff).await?;
        if count > 0 {
            tracing::warn!(stage = %stage, count, "Reclaimed stale in-progress jobs");
        }
        Ok(count)
    }

    /// Run the given steps in order.
    pub async fn run(&self, steps: &[PipelineStep]) -> Result<RunReport, PipelineError> {
        let mut report = RunReport::default();
        for step in steps {
            match step {
                PipelineStep::Fetch => report.fetch = Some(self.run_fetch_stage().await?),
                PipelineStep::Reconcile => report.reconcile = Some(self.reconcile().await?),
                PipelineStep::Classify => report.classify = Some(self.run_classify_stage().await?),
            }
        }
        Ok(report)
    }
}
