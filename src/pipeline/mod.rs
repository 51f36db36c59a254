//! Job orchestration: retry policy, bounded-concurrency runner, the fetch
//! executor, the classification worker pool and the orchestrator tying
//! them together.

use serde::Serialize;

use crate::models::job::Stage;

pub mod fetch;
pub mod orchestrator;
pub mod retry;
pub mod runner;
pub mod worker_pool;

/// Result of running one job through one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome {
    /// Advanced to the stage's completed state.
    Completed,
    /// Marked failed (permanent error or retries exhausted).
    Failed,
    /// Handed back to the stage's pending state after a transient failure
    /// or a failed commit.
    Released,
    /// Another caller moved the job first.
    Skipped,
    /// The job store could not record the result; state left untouched.
    Errored,
}

impl StageOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            StageOutcome::Completed => "completed",
            StageOutcome::Failed => "failed",
            StageOutcome::Released => "released",
            StageOutcome::Skipped => "skipped",
            StageOutcome::Errored => "errored",
        }
    }
}

/// Tally of one stage run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageSummary {
    pub stage: Stage,
    pub selected: usize,
    pub completed: usize,
    pub failed: usize,
    pub released: usize,
    pub skipped: usize,
    pub errored: usize,
    pub records_written: usize,
}

impl StageSummary {
    pub fn new(stage: Stage, selected: usize) -> Self {
        Self {
            stage,
            selected,
            completed: 0,
            failed: 0,
            released: 0,
            skipped: 0,
            errored: 0,
            records_written: 0,
        }
    }

    pub fn record(&mut self, outcome: StageOutcome) {
        match outcome {
            StageOutcome::Completed => self.completed += 1,
            StageOutcome::Failed => self.failed += 1,
            StageOutcome::Released => self.released += 1,
            StageOutcome::Skipped => self.skipped += 1,
            StageOutcome::Errored => self.errored += 1,
        }
        let stage = self.stage.to_string();
        metrics::counter!("replay_jobs_total", "stage" => stage, "outcome" => outcome.as_str())
            .increment(1);
    }

    pub fn processed(&self) -> usize {
        self.completed + self.failed + self.released + self.skipped + self.errored
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_counts_each_outcome() {
        let mut summary = StageSummary::new(Stage::Fetch, 4);
        summary.record(StageOutcome::Completed);
        summary.record(StageOutcome::Completed);
        summary.record(StageOutcome::Failed);
        summary.record(StageOutcome::Skipped);

        assert_eq!(summary.completed, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.processed(), summary.selected);
    }
}
