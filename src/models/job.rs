use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Pipeline stage a job state belongs to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Display, EnumString, PartialEq, Eq, Hash)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Fetch the replay from its source and store it.
    Fetch,
    /// Classify the stored replay and persist derived records.
    Classify,
}

/// Lifecycle state of a replay job. Two chained four-state lifecycles:
///
/// ```text
/// fetch_pending    -> fetch_in_progress    -> fetch_completed    | fetch_failed
/// classify_pending -> classify_in_progress -> classify_completed | classify_failed
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Display, EnumString, PartialEq, Eq, Hash)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    FetchPending,
    FetchInProgress,
    FetchCompleted,
    FetchFailed,
    ClassifyPending,
    ClassifyInProgress,
    ClassifyCompleted,
    ClassifyFailed,
}

impl JobState {
    pub fn stage(self) -> Stage {
        match self {
            JobState::FetchPending
            | JobState::FetchInProgress
            | JobState::FetchCompleted
            | JobState::FetchFailed => Stage::Fetch,
            JobState::ClassifyPending
            | JobState::ClassifyInProgress
            | JobState::ClassifyCompleted
            | JobState::ClassifyFailed => Stage::Classify,
        }
    }

    pub fn pending(stage: Stage) -> Self {
        match stage {
            Stage::Fetch => JobState::FetchPending,
            Stage::Classify => JobState::ClassifyPending,
        }
    }

    pub fn in_progress(stage: Stage) -> Self {
        match stage {
            Stage::Fetch => JobState::FetchInProgress,
            Stage::Classify => JobState::ClassifyInProgress,
        }
    }

    pub fn completed(stage: Stage) -> Self {
        match stage {
            Stage::Fetch => JobState::FetchCompleted,
            Stage::Classify => JobState::ClassifyCompleted,
        }
    }

    pub fn failed(stage: Stage) -> Self {
        match stage {
            Stage::Fetch => JobState::FetchFailed,
            Stage::Classify => JobState::ClassifyFailed,
        }
    }

    /// Whether the pipeline itself may move a job from `self` to `next`.
    ///
    /// Includes the release edge `in_progress -> pending` used when a worker
    /// hands a job back. `failed -> pending` is an operator action and is
    /// checked by [`JobState::can_requeue_to`] instead.
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (FetchPending, FetchInProgress)
                | (FetchInProgress, FetchCompleted)
                | (FetchInProgress, FetchFailed)
                | (FetchInProgress, FetchPending)
                | (FetchCompleted, ClassifyPending)
                | (ClassifyPending, ClassifyInProgress)
                | (ClassifyInProgress, ClassifyCompleted)
                | (ClassifyInProgress, ClassifyFailed)
                | (ClassifyInProgress, ClassifyPending)
        )
    }

    /// Operator re-queue: only `failed -> pending` within the same stage.
    pub fn can_requeue_to(self, next: JobState) -> bool {
        matches!(
            (self, next),
            (JobState::FetchFailed, JobState::FetchPending)
                | (JobState::ClassifyFailed, JobState::ClassifyPending)
        )
    }
}

/// Compare-and-set failure: the job was not in the expected state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("job {job_id} is in state {actual}, expected {expected}")]
pub struct StaleStateError {
    pub job_id: Uuid,
    pub expected: JobState,
    pub actual: JobState,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error(transparent)]
    Stale(#[from] StaleStateError),

    #[error("transition {from} -> {to} is not part of the job lifecycle")]
    Invalid { from: JobState, to: JobState },
}

/// Object key for a replay: deterministic in the replay id, so every retry
/// of the same job overwrites the same storage location.
pub fn replay_object_key(replay_id: i64) -> String {
    format!("{}_replay.json", replay_id)
}

/// A replay processing job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: Uuid,
    pub league_match_id: Uuid,
    pub replay_id: i64,
    pub source_locator: String,
    pub state: JobState,
    pub object_key: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(league_match_id: Uuid, replay_id: i64, source_locator: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            league_match_id,
            replay_id,
            source_locator: source_locator.into(),
            state: JobState::FetchPending,
            object_key: replay_object_key(replay_id),
            created_at: now,
            updated_at: now,
        }
    }

    /// Compare-and-set state change. Only `state` and `updated_at` change.
    pub fn transition(&mut self, from: JobState, to: JobState) -> Result<(), TransitionError> {
        if self.state != from {
            return Err(StaleStateError {
                job_id: self.id,
                expected: from,
                actual: self.state,
            }
            .into());
        }
        if !from.can_transition_to(to) {
            return Err(TransitionError::Invalid { from, to });
        }
        self.state = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Operator re-queue of a failed job back to its stage's pending state.
    pub fn requeue(&mut self) -> Result<(), TransitionError> {
        let from = self.state;
        let to = JobState::pending(from.stage());
        if !from.can_requeue_to(to) {
            return Err(TransitionError::Invalid { from, to });
        }
        self.state = to;
        self.updated_at = Utc::now();
        Ok(())
    }
}
