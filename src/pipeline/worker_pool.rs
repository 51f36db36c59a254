//! Worker pool for the classification stage.
//!
//! A fixed number of OS threads, each started once with an immutable
//! [`WorkerContext`]. Workers pull jobs from a shared assignment queue, do
//! their store I/O through the runtime handle, run the classifier on their
//! own thread, and report every step to a single log aggregator over their
//! own sender.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;

use tokio::runtime::Handle;
use tokio::sync::mpsc as events;
use uuid::Uuid;

use crate::db::{JobStore, JobStoreError};
use crate::error::{StageError, Transience};
use crate::models::derived::DerivedRecord;
use crate::models::job::{Job, JobState, Stage};
use crate::pipeline::{StageOutcome, StageSummary};
use crate::services::classifier::{ClassifyError, Classifier};
use crate::services::storage::ObjectStore;

/// Event sent from a worker to the log aggregator.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Started {
        worker: usize,
    },
    Finished {
        worker: usize,
        job_id: Uuid,
        object_key: String,
        outcome: StageOutcome,
        records: usize,
        error: Option<String>,
    },
    Stopped {
        worker: usize,
        processed: usize,
    },
}

/// Everything a worker needs, handed to it once at startup.
pub struct WorkerContext {
    pub worker_id: usize,
    pub classifier: Arc<dyn Classifier>,
    pub store: Arc<dyn ObjectStore>,
    pub jobs: Arc<dyn JobStore>,
    pub runtime: Handle,
    pub prefix: String,
    pub events: events::UnboundedSender<WorkerEvent>,
}

impl WorkerContext {
    fn emit(&self, event: WorkerEvent) {
        // The aggregator outlives every worker; a send error only means the
        // pool is being torn down.
        let _ = self.events.send(event);
    }

    /// Classify one job in `classify_pending`. Never panics on classifier
    /// failure.
    pub fn process(&self, job: &Job) -> StageOutcome {
        let (outcome, records, error) = self.process_inner(job);
        self.emit(WorkerEvent::Finished {
            worker: self.worker_id,
            job_id: job.id,
            object_key: job.object_key.clone(),
            outcome,
            records,
            error,
        });
        outcome
    }

    fn process_inner(&self, job: &Job) -> (StageOutcome, usize, Option<String>) {
        let claim = self.runtime.block_on(self.jobs.compare_and_set(
            job.id,
            JobState::ClassifyPending,
            JobState::ClassifyInProgress,
        ));
        match claim {
            Ok(()) => {}
            Err(JobStoreError::Stale(e)) => return (StageOutcome::Skipped, 0, Some(e.to_string())),
            Err(e) => return (StageOutcome::Errored, 0, Some(e.to_string())),
        }

        let records = match self.classify(job) {
            Ok(records) => records,
            Err(e) if e.is_transient() => {
                let outcome = self.move_to(job.id, JobState::ClassifyPending, StageOutcome::Released);
                return (outcome, 0, Some(e.to_string()));
            }
            Err(e) => {
                let outcome = self.move_to(job.id, JobState::ClassifyFailed, StageOutcome::Failed);
                return (outcome, 0, Some(e.to_string()));
            }
        };

        let count = records.len();
        let committed = self.runtime.block_on(self.jobs.persist_derived(
            job.id,
            JobState::ClassifyInProgress,
            JobState::ClassifyCompleted,
            &records,
        ));
        match committed {
            Ok(()) => (StageOutcome::Completed, count, None),
            Err(JobStoreError::Stale(e)) => (StageOutcome::Skipped, 0, Some(e.to_string())),
            Err(e) => {
                // Nothing was written; give the job back for a later run.
                let outcome = self.move_to(job.id, JobState::ClassifyPending, StageOutcome::Released);
                (outcome, 0, Some(e.to_string()))
            }
        }
    }

    /// Report a job whose processing panicked outside the classifier and try
    /// to hand it back to `classify_pending`.
    fn recover(&self, job: &Job, message: String) {
        tracing::error!(
            job_id = %job.id,
            stage = %Stage::Classify,
            worker = self.worker_id,
            error = %message,
            "Worker panicked while processing job"
        );
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            self.runtime.block_on(self.jobs.compare_and_set(
                job.id,
                JobState::ClassifyInProgress,
                JobState::ClassifyPending,
            ))
        }));
        let outcome = match outcome {
            Ok(Ok(())) => StageOutcome::Released,
            // Never claimed, already committed, or the store itself is broken.
            _ => StageOutcome::Errored,
        };
        self.emit(WorkerEvent::Finished {
            worker: self.worker_id,
            job_id: job.id,
            object_key: job.object_key.clone(),
            outcome,
            records: 0,
            error: Some(format!("worker panicked: {}", message)),
        });
    }

    fn classify(&self, job: &Job) -> Result<Vec<DerivedRecord>, StageError> {
        let key = format!("{}{}", self.prefix, job.object_key);
        let payload = self
            .runtime
            .block_on(self.store.get(&key))?
            .ok_or(StageError::MissingPayload(key))?;

        let classifications = catch_unwind(AssertUnwindSafe(|| self.classifier.classify(&payload)))
            .map_err(|panic| ClassifyError::Panicked(panic_message(panic.as_ref())))??;

        Ok(classifications
            .into_iter()
            .map(|c| DerivedRecord::from_classification(job.id, job.league_match_id, c))
            .collect())
    }

    fn move_to(&self, job_id: Uuid, to: JobState, outcome: StageOutcome) -> StageOutcome {
        match self
            .runtime
            .block_on(self.jobs.compare_and_set(job_id, JobState::ClassifyInProgress, to))
        {
            Ok(()) => outcome,
            Err(e) => {
                tracing::error!(
                    job_id = %job_id,
                    stage = %Stage::Classify,
                    worker = self.worker_id,
                    error = %e,
                    "Failed to commit job state"
                );
                StageOutcome::Errored
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn worker_loop(ctx: WorkerContext, queue: Arc<Mutex<mpsc::Receiver<Job>>>) {
    ctx.emit(WorkerEvent::Started {
        worker: ctx.worker_id,
    });

    let mut processed = 0;
    loop {
        let next = match queue.lock() {
            Ok(rx) => rx.recv(),
            Err(_) => break,
        };
        let Ok(job) = next else { break };
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| ctx.process(&job))) {
            ctx.recover(&job, panic_message(panic.as_ref()));
        }
        processed += 1;
    }

    ctx.emit(WorkerEvent::Stopped {
        worker: ctx.worker_id,
        processed,
    });
}

/// Fixed-size pool of classification workers.
pub struct WorkerPool {
    size: usize,
    classifier: Arc<dyn Classifier>,
    store: Arc<dyn ObjectStore>,
    jobs: Arc<dyn JobStore>,
    prefix: String,
}

impl WorkerPool {
    pub fn new(
        size: usize,
        classifier: Arc<dyn Classifier>,
        store: Arc<dyn ObjectStore>,
        jobs: Arc<dyn JobStore>,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            size: size.max(1),
            classifier,
            store,
            jobs,
            prefix: prefix.into(),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Classify every job and return once all workers have drained the queue.
    pub async fn run(&self, batch: Vec<Job>) -> StageSummary {
        let mut summary = StageSummary::new(Stage::Classify, batch.len());
        if batch.is_empty() {
            return summary;
        }

        let (assign_tx, assign_rx) = mpsc::channel::<Job>();
        let queue = Arc::new(Mutex::new(assign_rx));
        let (event_tx, mut event_rx) = events::unbounded_channel();
        let runtime = Handle::current();

        let mut handles = Vec::with_capacity(self.size);
        for worker_id in 0..self.size {
            let ctx = WorkerContext {
                worker_id,
                classifier: self.classifier.clone(),
                store: self.store.clone(),
                jobs: self.jobs.clone(),
                runtime: runtime.clone(),
                prefix: self.prefix.clone(),
                events: event_tx.clone(),
            };
            let queue = queue.clone();
            let spawned = thread::Builder::new()
                .name(format!("classify-worker-{}", worker_id))
                .spawn(move || worker_loop(ctx, queue));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => tracing::error!(worker = worker_id, error = %e, "Failed to start worker"),
            }
        }
        drop(event_tx);

        if handles.is_empty() {
            tracing::error!(stage = %Stage::Classify, "No workers started, leaving jobs pending");
            return summary;
        }

        for job in batch {
            if assign_tx.send(job).is_err() {
                break;
            }
        }
        drop(assign_tx);

        while let Some(event) = event_rx.recv().await {
            aggregate(&event, &mut summary);
        }

        let joined = tokio::task::spawn_blocking(move || {
            handles
                .into_iter()
                .filter_map(|h| h.join().err())
                .count()
        })
        .await;
        match joined {
            Ok(0) => {}
            Ok(n) => tracing::error!(crashed = n, "Classification workers exited abnormally"),
            Err(e) => tracing::error!(error = %e, "Failed to join classification workers"),
        }

        summary
    }
}

/// Single sink for worker output.
fn aggregate(event: &WorkerEvent, summary: &mut StageSummary) {
    match event {
        WorkerEvent::Started { worker } => {
            tracing::debug!(worker, "Classification worker started");
        }
        WorkerEvent::Finished {
            worker,
            job_id,
            object_key,
            outcome,
            records,
            error,
        } => {
            summary.record(*outcome);
            summary.records_written += records;
            match (outcome, error) {
                (StageOutcome::Completed, _) => tracing::info!(
                    worker,
                    job_id = %job_id,
                    stage = %Stage::Classify,
                    object_key = %object_key,
                    records,
                    "Job classified"
                ),
                (StageOutcome::Skipped, error) => tracing::info!(
                    worker,
                    job_id = %job_id,
                    stage = %Stage::Classify,
                    reason = error.as_deref().unwrap_or(""),
                    "Job already claimed, skipping"
                ),
                (outcome, error) => tracing::error!(
                    worker,
                    job_id = %job_id,
                    stage = %Stage::Classify,
                    object_key = %object_key,
                    outcome = ?outcome,
                    error = error.as_deref().unwrap_or(""),
                    "Job classification failed"
                ),
            }
        }
        WorkerEvent::Stopped { worker, processed } => {
            tracing::debug!(worker, processed, "Classification worker stopped");
        }
    }
}
