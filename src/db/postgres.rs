use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::{check_edge, JobStore, JobStoreError};
use crate::models::derived::{DerivedRecord, Label};
use crate::models::job::{Job, JobState, Stage, StaleStateError};

const JOB_COLUMNS: &str =
    "id, league_match_id, replay_id, source_locator, state, object_key, created_at, updated_at";

/// Postgres-backed job store.
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Resolve why a compare-and-set matched no row.
    async fn stale_or_missing(&self, job_id: Uuid, expected: JobState) -> JobStoreError {
        let row = sqlx::query("SELECT state FROM replay_jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await;

        let row = match row {
            Ok(Some(r)) => r,
            Ok(None) => return JobStoreError::NotFound(job_id),
            Err(e) => return e.into(),
        };

        let actual = row
            .try_get::<String, _>("state")
            .map_err(JobStoreError::from)
            .and_then(|s| parse_state(&s));
        match actual {
            Ok(actual) => StaleStateError {
                job_id,
                expected,
                actual,
            }
            .into(),
            Err(e) => e,
        }
    }
}

fn parse_state(s: &str) -> Result<JobState, JobStoreError> {
    JobState::from_str(s).map_err(|_| JobStoreError::Corrupt(format!("unknown job state '{}'", s)))
}

fn job_from_row(row: &PgRow) -> Result<Job, JobStoreError> {
    let state: String = row.try_get("state")?;
    Ok(Job {
        id: row.try_get("id")?,
        league_match_id: row.try_get("league_match_id")?,
        replay_id: row.try_get("replay_id")?,
        source_locator: row.try_get("source_locator")?,
        state: parse_state(&state)?,
        object_key: row.try_get("object_key")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn insert(&self, job: &Job) -> Result<bool, JobStoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO replay_jobs
                (id, league_match_id, replay_id, source_locator, state, object_key, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (object_key) DO NOTHING
            "#,
        )
        .bind(job.id)
        .bind(job.league_match_id)
        .bind(job.replay_id)
        .bind(&job.source_locator)
        .bind(job.state.to_string())
        .bind(&job.object_key)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query(&format!("SELECT {} FROM replay_jobs WHERE id = $1", JOB_COLUMNS))
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn select_by_state(&self, state: JobState) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM replay_jobs WHERE state = $1 ORDER BY object_key ASC",
            JOB_COLUMNS
        ))
        .bind(state.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(job_from_row).collect()
    }

    async fn compare_and_set(
        &self,
        job_id: Uuid,
        expected: JobState,
        new: JobState,
    ) -> Result<(), JobStoreError> {
        check_edge(expected, new)?;

        let result = sqlx::query(
            r#"
            UPDATE replay_jobs
            SET state = $1, updated_at = NOW()
            WHERE id = $2 AND state = $3
            "#,
        )
        .bind(new.to_string())
        .bind(job_id)
        .bind(expected.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.stale_or_missing(job_id, expected).await);
        }
        Ok(())
    }

    async fn persist_derived(
        &self,
        job_id: Uuid,
        expected: JobState,
        new: JobState,
        records: &[DerivedRecord],
    ) -> Result<(), JobStoreError> {
        check_edge(expected, new)?;

        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE replay_jobs
            SET state = $1, updated_at = NOW()
            WHERE id = $2 AND state = $3
            "#,
        )
        .bind(new.to_string())
        .bind(job_id)
        .bind(expected.to_string())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(self.stale_or_missing(job_id, expected).await);
        }

        for record in records {
            sqlx::query(
                r#"
                INSERT INTO derived_records (id, job_id, league_match_id, sequence, labels, created_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(record.id)
            .bind(record.job_id)
            .bind(record.league_match_id)
            .bind(record.sequence)
            .bind(Json(&record.labels))
            .bind(record.created_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn derived_for_job(&self, job_id: Uuid) -> Result<Vec<DerivedRecord>, JobStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, job_id, league_match_id, sequence, labels, created_at
            FROM derived_records
            WHERE job_id = $1
            ORDER BY sequence ASC
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| -> Result<DerivedRecord, JobStoreError> {
                let labels: Json<Vec<Label>> = r.try_get("labels")?;
                Ok(DerivedRecord {
                    id: r.try_get("id")?,
                    job_id: r.try_get("job_id")?,
                    league_match_id: r.try_get("league_match_id")?,
                    sequence: r.try_get("sequence")?,
                    labels: labels.0,
                    created_at: r.try_get("created_at")?,
                })
            })
            .collect()
    }

    async fn requeue_failed(&self, stage: Stage) -> Result<u64, JobStoreError> {
        let (from, to) = (JobState::failed(stage), JobState::pending(stage));
        if !from.can_requeue_to(to) {
            return Err(JobStoreError::InvalidTransition { from, to });
        }

        let result = sqlx::query(
            r#"
            UPDATE replay_jobs
            SET state = $1, updated_at = NOW()
            WHERE state = $2
            "#,
        )
        .bind(to.to_string())
        .bind(from.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn reclaim_stale(&self, stage: Stage, cutoff: DateTime<Utc>) -> Result<u64, JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE replay_jobs
            SET state = $1, updated_at = NOW()
            WHERE state = $2 AND updated_at < $3
            "#,
        )
        .bind(JobState::pending(stage).to_string())
        .bind(JobState::in_progress(stage).to_string())
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
