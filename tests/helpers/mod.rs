//! Test helpers: scripted collaborators and a pipeline wired to in-memory stores.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use replay_pipeline::{
    db::{memory::InMemoryJobStore, JobStore, JobStoreError},
    models::{
        derived::{Classification, DerivedRecord},
        job::{Job, JobState, Stage},
    },
    pipeline::{
        orchestrator::{Pipeline, PipelineSettings},
        retry::RetryPolicy,
        runner::RunLimits,
    },
    services::{
        classifier::{ClassifyError, Classifier, SignatureClassifier},
        source::{FetchError, ReplaySource},
        storage::{ContentKind, InMemoryObjectStore, ObjectStore, StorageError},
    },
};
use uuid::Uuid;

use crate::fixtures;

pub const PREFIX: &str = "replays/";

/// Scripted reply of the fake replay source.
#[derive(Debug, Clone)]
pub enum Reply {
    Body(Vec<u8>),
    Transient,
    Permanent,
}

/// Replay source that answers from a per-locator script. Once a script runs
/// out, the last reply repeats. Unknown locators get the default payload.
#[derive(Default)]
pub struct ScriptedSource {
    scripts: Mutex<HashMap<String, VecDeque<Reply>>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, locator: &str, replies: Vec<Reply>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(locator.to_string(), replies.into());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, locator: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == locator).count()
    }
}

#[async_trait]
impl ReplaySource for ScriptedSource {
    async fn fetch(&self, locator: &str) -> Result<Vec<u8>, FetchError> {
        self.calls.lock().unwrap().push(locator.to_string());

        let reply = {
            let mut scripts = self.scripts.lock().unwrap();
            match scripts.get_mut(locator) {
                Some(queue) if queue.len() > 1 => queue.pop_front(),
                Some(queue) => queue.front().cloned(),
                None => None,
            }
        };

        // Yield so concurrent fetches interleave.
        tokio::task::yield_now().await;

        match reply.unwrap_or_else(|| Reply::Body(fixtures::replay_payload())) {
            Reply::Body(body) => Ok(body),
            Reply::Transient => Err(FetchError::Unavailable(format!("{} busy", locator))),
            Reply::Permanent => Err(FetchError::Rejected(format!("{} is not a replay", locator))),
        }
    }
}

/// Fixture classifier that misbehaves on marked payloads.
pub struct MarkedClassifier {
    inner: SignatureClassifier,
}

impl MarkedClassifier {
    pub fn new() -> Self {
        Self {
            inner: SignatureClassifier::new(fixtures::deck_model()),
        }
    }
}

impl Classifier for MarkedClassifier {
    fn classify(&self, payload: &[u8]) -> Result<Vec<Classification>, ClassifyError> {
        let text = String::from_utf8_lossy(payload);
        if text.contains("\"marker\":\"flaky\"") {
            return Err(ClassifyError::Unavailable("model warming up".to_string()));
        }
        if text.contains("\"marker\":\"explode\"") {
            panic!("classifier crashed");
        }
        self.inner.classify(payload)
    }
}

/// Object store that panics when `key` is read.
pub struct PanickingStore {
    pub inner: InMemoryObjectStore,
    key: String,
}

impl PanickingStore {
    pub fn new(key: &str) -> Self {
        Self {
            inner: InMemoryObjectStore::new(),
            key: key.to_string(),
        }
    }
}

#[async_trait]
impl ObjectStore for PanickingStore {
    async fn put(&self, key: &str, data: &[u8], kind: ContentKind) -> Result<(), StorageError> {
        self.inner.put(key, data, kind).await
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        if key == self.key {
            panic!("object store crashed reading {}", key);
        }
        self.inner.get(key).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        self.inner.list(prefix).await
    }
}

/// Job store whose commits into `fail_on` fail with a database error.
pub struct FailingCommitStore {
    pub inner: InMemoryJobStore,
    fail_on: JobState,
}

impl FailingCommitStore {
    pub fn new(fail_on: JobState) -> Self {
        Self {
            inner: InMemoryJobStore::new(),
            fail_on,
        }
    }
}

#[async_trait]
impl JobStore for FailingCommitStore {
    async fn insert(&self, job: &Job) -> Result<bool, JobStoreError> {
        self.inner.insert(job).await
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>, JobStoreError> {
        self.inner.get(job_id).await
    }

    async fn select_by_state(&self, state: JobState) -> Result<Vec<Job>, JobStoreError> {
        self.inner.select_by_state(state).await
    }

    async fn compare_and_set(
        &self,
        job_id: Uuid,
        expected: JobState,
        new: JobState,
    ) -> Result<(), JobStoreError> {
        if new == self.fail_on {
            return Err(JobStoreError::Database(sqlx::Error::PoolTimedOut));
        }
        self.inner.compare_and_set(job_id, expected, new).await
    }

    async fn persist_derived(
        &self,
        job_id: Uuid,
        expected: JobState,
        new: JobState,
        records: &[DerivedRecord],
    ) -> Result<(), JobStoreError> {
        self.inner.persist_derived(job_id, expected, new, records).await
    }

    async fn derived_for_job(&self, job_id: Uuid) -> Result<Vec<DerivedRecord>, JobStoreError> {
        self.inner.derived_for_job(job_id).await
    }

    async fn requeue_failed(&self, stage: Stage) -> Result<u64, JobStoreError> {
        self.inner.requeue_failed(stage).await
    }

    async fn reclaim_stale(&self, stage: Stage, cutoff: DateTime<Utc>) -> Result<u64, JobStoreError> {
        self.inner.reclaim_stale(stage, cutoff).await
    }
}

/// Walk a fresh job through the fetch stage by hand, up to `classify_pending`.
pub async fn advance_to_classify(jobs: &dyn JobStore, job: &Job) {
    for (from, to) in [
        (JobState::FetchPending, JobState::FetchInProgress),
        (JobState::FetchInProgress, JobState::FetchCompleted),
        (JobState::FetchCompleted, JobState::ClassifyPending),
    ] {
        jobs.compare_and_set(job.id, from, to).await.unwrap();
    }
}

pub struct Harness {
    pub jobs: Arc<InMemoryJobStore>,
    pub store: Arc<InMemoryObjectStore>,
    pub source: Arc<ScriptedSource>,
    pub pipeline: Pipeline,
}

pub fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new(
        max_attempts,
        Duration::from_millis(1),
        Duration::from_millis(4),
        2.0,
    )
}

pub fn settings(max_concurrent: usize, workers: usize) -> PipelineSettings {
    PipelineSettings {
        retry: fast_retry(3),
        limits: RunLimits::new(max_concurrent, 1_000),
        worker_pool_size: workers,
        storage_prefix: PREFIX.to_string(),
    }
}

pub fn harness_with(settings: PipelineSettings) -> Harness {
    let jobs = Arc::new(InMemoryJobStore::new());
    let store = Arc::new(InMemoryObjectStore::new());
    let source = Arc::new(ScriptedSource::new());
    let pipeline = Pipeline::new(
        jobs.clone(),
        store.clone(),
        source.clone(),
        Arc::new(MarkedClassifier::new()),
        settings,
    );
    Harness {
        jobs,
        store,
        source,
        pipeline,
    }
}

pub fn harness() -> Harness {
    harness_with(settings(4, 2))
}

impl Harness {
    /// Insert a fresh `fetch_pending` job for `replay_id`.
    pub async fn add_job(&self, replay_id: i64) -> Job {
        let job = Job::new(
            Uuid::new_v4(),
            replay_id,
            format!("https://duelingbook.com/replay?id={}", replay_id),
        );
        assert!(self.jobs.insert(&job).await.unwrap());
        job
    }

    pub async fn state(&self, job: &Job) -> JobState {
        self.jobs.get(job.id).await.unwrap().unwrap().state
    }

    /// Every recorded state change must be an allowed edge.
    pub fn assert_lifecycle(&self, job: &Job) {
        let history = self.jobs.history(job.id);
        assert_eq!(history.first(), Some(&JobState::FetchPending));
        for pair in history.windows(2) {
            assert!(
                pair[0].can_transition_to(pair[1]) || pair[0].can_requeue_to(pair[1]),
                "illegal transition {} -> {} in {:?}",
                pair[0],
                pair[1],
                history
            );
        }
    }
}
