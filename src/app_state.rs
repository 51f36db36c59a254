use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;

use crate::config::AppConfig;
use crate::db::{self, postgres::PgJobStore, JobStore};
use crate::pipeline::orchestrator::Pipeline;
use crate::services::{
    classifier::{Classifier, SignatureClassifier},
    source::{HttpReplaySource, ReplaySource},
    storage::{ObjectStore, S3ObjectStore},
};

/// Collaborators shared by the pipeline binaries.
#[derive(Clone)]
pub struct AppState {
    pub jobs: Arc<dyn JobStore>,
    pub storage: Arc<dyn ObjectStore>,
    pub source: Arc<dyn ReplaySource>,
    pub classifier: Arc<dyn Classifier>,
}

impl AppState {
    pub fn new(
        db: PgPool,
        storage: S3ObjectStore,
        source: HttpReplaySource,
        classifier: SignatureClassifier,
    ) -> Self {
        Self {
            jobs: Arc::new(PgJobStore::new(db)),
            storage: Arc::new(storage),
            source: Arc::new(source),
            classifier: Arc::new(classifier),
        }
    }

    /// Connect to every collaborator named in `config`.
    pub async fn from_config(config: &AppConfig) -> Result<Self, Box<dyn std::error::Error>> {
        tracing::info!("Connecting to PostgreSQL database");
        let db_pool = db::init_pool(&config.database_url, config.db_max_connections).await?;

        tracing::info!("Running database migrations");
        db::run_migrations(&db_pool).await?;

        tracing::info!(bucket = %config.s3_bucket, "Initializing object storage client");
        let storage = S3ObjectStore::new(
            &config.s3_bucket,
            &config.s3_region,
            config.s3_endpoint.as_deref(),
            &config.s3_access_key,
            &config.s3_secret_key,
        )?;

        let source = HttpReplaySource::new(Duration::from_secs(config.fetch_timeout_secs))?;

        tracing::info!(path = %config.classifier_model_path, "Loading deck classifier");
        let classifier = SignatureClassifier::from_path(&config.classifier_model_path)?;

        Ok(Self::new(db_pool, storage, source, classifier))
    }

    pub fn pipeline(&self, config: &AppConfig) -> Pipeline {
        Pipeline::new(
            self.jobs.clone(),
            self.storage.clone(),
            self.source.clone(),
            self.classifier.clone(),
            config.pipeline_settings(),
        )
    }
}
