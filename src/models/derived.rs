use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One labeled output of the classifier (e.g. a player's deck type).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Label {
    /// What was labeled, e.g. the player name.
    pub subject: String,
    pub label: String,
    pub confidence: f64,
}

/// Classifier output for one game of a replay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Classification {
    pub sequence: i32,
    pub labels: Vec<Label>,
}

/// Immutable record produced once per classified game. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DerivedRecord {
    pub id: Uuid,
    pub job_id: Uuid,
    pub league_match_id: Uuid,
    pub sequence: i32,
    pub labels: Vec<Label>,
    pub created_at: DateTime<Utc>,
}

impl DerivedRecord {
    pub fn from_classification(job_id: Uuid, league_match_id: Uuid, c: Classification) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            league_match_id,
            sequence: c.sequence,
            labels: c.labels,
            created_at: Utc::now(),
        }
    }
}
