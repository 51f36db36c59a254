use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{check_edge, JobStore, JobStoreError};
use crate::models::derived::DerivedRecord;
use crate::models::job::{Job, JobState, Stage};

/// In-memory job store.
///
/// Intended for tests and dry runs. Keeps every state a job passed through
/// so tests can check the lifecycle.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    inner: RwLock<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<Uuid, Job>,
    derived: HashMap<Uuid, Vec<DerivedRecord>>,
    history: HashMap<Uuid, Vec<JobState>>,
}

impl Inner {
    fn set_state(&mut self, job_id: Uuid, state: JobState) {
        if let Some(job) = self.jobs.get_mut(&job_id) {
            job.state = state;
            job.updated_at = Utc::now();
        }
        self.history.entry(job_id).or_default().push(state);
    }

    fn cas(&mut self, job_id: Uuid, expected: JobState, new: JobState) -> Result<(), JobStoreError> {
        check_edge(expected, new)?;
        let job = self
            .jobs
            .get_mut(&job_id)
            .ok_or(JobStoreError::NotFound(job_id))?;
        job.transition(expected, new)?;
        self.history.entry(job_id).or_default().push(new);
        Ok(())
    }
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every state the job has been in, starting with its initial state.
    pub fn history(&self, job_id: Uuid) -> Vec<JobState> {
        self.inner
            .read()
            .map(|inner| inner.history.get(&job_id).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    /// Force a job's `updated_at`, for staleness tests.
    pub fn backdate(&self, job_id: Uuid, updated_at: DateTime<Utc>) {
        if let Ok(mut inner) = self.inner.write() {
            if let Some(job) = inner.jobs.get_mut(&job_id) {
                job.updated_at = updated_at;
            }
        }
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: &Job) -> Result<bool, JobStoreError> {
        let mut inner = self.inner.write().map_err(|_| JobStoreError::Poisoned)?;
        if inner.jobs.values().any(|j| j.object_key == job.object_key) {
            return Ok(false);
        }
        inner.jobs.insert(job.id, job.clone());
        inner.history.insert(job.id, vec![job.state]);
        Ok(true)
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>, JobStoreError> {
        let inner = self.inner.read().map_err(|_| JobStoreError::Poisoned)?;
        Ok(inner.jobs.get(&job_id).cloned())
    }

    async fn select_by_state(&self, state: JobState) -> Result<Vec<Job>, JobStoreError> {
        let inner = self.inner.read().map_err(|_| JobStoreError::Poisoned)?;
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| j.state == state)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.object_key.cmp(&b.object_key));
        Ok(jobs)
    }

    async fn compare_and_set(
        &self,
        job_id: Uuid,
        expected: JobState,
        new: JobState,
    ) -> Result<(), JobStoreError> {
        let mut inner = self.inner.write().map_err(|_| JobStoreError::Poisoned)?;
        inner.cas(job_id, expected, new)
    }

    async fn persist_derived(
        &self,
        job_id: Uuid,
        expected: JobState,
        new: JobState,
        records: &[DerivedRecord],
    ) -> Result<(), JobStoreError> {
        // One write lock covers both parts, so readers never see one without the other.
        let mut inner = self.inner.write().map_err(|_| JobStoreError::Poisoned)?;
        inner.cas(job_id, expected, new)?;
        inner
            .derived
            .entry(job_id)
            .or_default()
            .extend(records.iter().cloned());
        Ok(())
    }

    async fn derived_for_job(&self, job_id: Uuid) -> Result<Vec<DerivedRecord>, JobStoreError> {
        let inner = self.inner.read().map_err(|_| JobStoreError::Poisoned)?;
        let mut records = inner.derived.get(&job_id).cloned().unwrap_or_default();
        records.sort_by_key(|r| r.sequence);
        Ok(records)
    }

    async fn requeue_failed(&self, stage: Stage) -> Result<u64, JobStoreError> {
        let mut inner = self.inner.write().map_err(|_| JobStoreError::Poisoned)?;
        let failed = JobState::failed(stage);
        let ids: Vec<Uuid> = inner
            .jobs
            .values()
            .filter(|j| j.state == failed)
            .map(|j| j.id)
            .collect();
        for id in &ids {
            if let Some(job) = inner.jobs.get_mut(id) {
                job.requeue()?;
            }
            inner.history.entry(*id).or_default().push(JobState::pending(stage));
        }
        Ok(ids.len() as u64)
    }

    async fn reclaim_stale(&self, stage: Stage, cutoff: DateTime<Utc>) -> Result<u64, JobStoreError> {
        let mut inner = self.inner.write().map_err(|_| JobStoreError::Poisoned)?;
        let in_progress = JobState::in_progress(stage);
        let ids: Vec<Uuid> = inner
            .jobs
            .values()
            .filter(|j| j.state == in_progress && j.updated_at < cutoff)
            .map(|j| j.id)
            .collect();
        for id in &ids {
            inner.set_state(*id, JobState::pending(stage));
        }
        Ok(ids.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::derived::{DerivedRecord, Label};
    use crate::models::job::StaleStateError;

    fn record(job: &Job, sequence: i32) -> DerivedRecord {
        DerivedRecord {
            id: Uuid::new_v4(),
            job_id: job.id,
            league_match_id: job.league_match_id,
            sequence,
            labels: vec![Label {
                subject: "alice".to_string(),
                label: "Warrior".to_string(),
                confidence: 0.9,
            }],
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_insert_is_idempotent_on_object_key() {
        let store = InMemoryJobStore::new();
        let match_id = Uuid::new_v4();
        assert!(store.insert(&Job::new(match_id, 42, "a")).await.unwrap());
        assert!(!store.insert(&Job::new(match_id, 42, "a")).await.unwrap());
        assert_eq!(store.select_by_state(JobState::FetchPending).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_select_orders_by_object_key() {
        let store = InMemoryJobStore::new();
        for replay_id in [30, 10, 20] {
            store.insert(&Job::new(Uuid::new_v4(), replay_id, "x")).await.unwrap();
        }
        let keys: Vec<String> = store
            .select_by_state(JobState::FetchPending)
            .await
            .unwrap()
            .into_iter()
            .map(|j| j.object_key)
            .collect();
        assert_eq!(keys, vec!["10_replay.json", "20_replay.json", "30_replay.json"]);
    }

    #[tokio::test]
    async fn test_compare_and_set_rejects_stale_expectation() {
        let store = InMemoryJobStore::new();
        let job = Job::new(Uuid::new_v4(), 1, "x");
        store.insert(&job).await.unwrap();

        store
            .compare_and_set(job.id, JobState::FetchPending, JobState::FetchInProgress)
            .await
            .unwrap();
        let err = store
            .compare_and_set(job.id, JobState::FetchPending, JobState::FetchInProgress)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            JobStoreError::Stale(StaleStateError {
                actual: JobState::FetchInProgress,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_compare_and_set_rejects_unknown_edges() {
        let store = InMemoryJobStore::new();
        let job = Job::new(Uuid::new_v4(), 1, "x");
        store.insert(&job).await.unwrap();
        let err = store
            .compare_and_set(job.id, JobState::FetchPending, JobState::ClassifyPending)
            .await
            .unwrap_err();
        assert!(matches!(err, JobStoreError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_persist_derived_is_all_or_nothing() {
        let store = InMemoryJobStore::new();
        let job = Job::new(Uuid::new_v4(), 1, "x");
        store.insert(&job).await.unwrap();

        // Wrong expected state: nothing is written.
        let err = store
            .persist_derived(
                job.id,
                JobState::ClassifyInProgress,
                JobState::ClassifyCompleted,
                &[record(&job, 1)],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, JobStoreError::Stale(_)));
        assert!(store.derived_for_job(job.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_requeue_and_reclaim() {
        let store = InMemoryJobStore::new();
        let failed = Job::new(Uuid::new_v4(), 1, "x");
        let stuck = Job::new(Uuid::new_v4(), 2, "y");
        store.insert(&failed).await.unwrap();
        store.insert(&stuck).await.unwrap();

        for id in [failed.id, stuck.id] {
            store
                .compare_and_set(id, JobState::FetchPending, JobState::FetchInProgress)
                .await
                .unwrap();
        }
        store
            .compare_and_set(failed.id, JobState::FetchInProgress, JobState::FetchFailed)
            .await
            .unwrap();

        assert_eq!(store.requeue_failed(Stage::Fetch).await.unwrap(), 1);
        assert_eq!(
            store.get(failed.id).await.unwrap().unwrap().state,
            JobState::FetchPending
        );

        let cutoff = Utc::now();
        assert_eq!(store.reclaim_stale(Stage::Fetch, cutoff - chrono::Duration::hours(1)).await.unwrap(), 0);
        store.backdate(stuck.id, cutoff - chrono::Duration::hours(2));
        assert_eq!(store.reclaim_stale(Stage::Fetch, cutoff - chrono::Duration::hours(1)).await.unwrap(), 1);
        assert_eq!(
            store.get(stuck.id).await.unwrap().unwrap().state,
            JobState::FetchPending
        );
    }
}
