use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;
use s3::creds::Credentials;
use s3::{Bucket, Region};

use crate::error::Transience;

/// Kind of content written to the object store. Resolved once from the
/// object key and then used to pick the encoder and content type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Json,
    Csv,
}

impl ContentKind {
    /// Resolve the content kind from a key's extension.
    pub fn from_key(key: &str) -> Result<Self, StorageError> {
        match key.rsplit_once('.').map(|(_, ext)| ext) {
            Some("json") => Ok(ContentKind::Json),
            Some("csv") => Ok(ContentKind::Csv),
            _ => Err(StorageError::UnsupportedContent(key.to_string())),
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            ContentKind::Json => "application/json",
            ContentKind::Csv => "text/csv",
        }
    }

    /// Validate and normalize a payload for this content kind.
    pub fn encode(self, payload: &[u8]) -> Result<Vec<u8>, StorageError> {
        match self {
            ContentKind::Json => {
                let value: serde_json::Value = serde_json::from_slice(payload)
                    .map_err(|e| StorageError::InvalidPayload(e.to_string()))?;
                if !(value.is_object() || value.is_array()) {
                    return Err(StorageError::InvalidPayload(
                        "JSON payload must be an object or array".to_string(),
                    ));
                }
                serde_json::to_vec(&value).map_err(|e| StorageError::InvalidPayload(e.to_string()))
            }
            ContentKind::Csv => {
                std::str::from_utf8(payload)
                    .map_err(|e| StorageError::InvalidPayload(e.to_string()))?;
                Ok(payload.to_vec())
            }
        }
    }
}

/// Durable object store consumed by the pipeline.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Write `data` at `key`, replacing anything already there.
    async fn put(&self, key: &str, data: &[u8], kind: ContentKind) -> Result<(), StorageError>;

    /// Read the object at `key`, `None` if absent.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// List keys starting with `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
}

/// Client for S3-compatible object storage (AWS S3, Cloudflare R2, MinIO).
pub struct S3ObjectStore {
    bucket: Box<Bucket>,
}

impl S3ObjectStore {
    pub fn new(
        bucket_name: &str,
        region: &str,
        endpoint: Option<&str>,
        access_key: &str,
        secret_key: &str,
    ) -> Result<Self, StorageError> {
        let region = match endpoint {
            Some(endpoint) => Region::Custom {
                region: region.to_string(),
                endpoint: endpoint.to_string(),
            },
            None => region
                .parse::<Region>()
                .map_err(|e| StorageError::Config(format!("{:?}", e)))?,
        };

        let credentials =
            Credentials::new(Some(access_key), Some(secret_key), None, None, None)
                .map_err(|e| StorageError::Config(e.to_string()))?;

        let bucket = Bucket::new(bucket_name, region, credentials)
            .map_err(|e| StorageError::Config(e.to_string()))?;

        Ok(Self { bucket })
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put(&self, key: &str, data: &[u8], kind: ContentKind) -> Result<(), StorageError> {
        let response = self
            .bucket
            .put_object_with_content_type(key, data, kind.content_type())
            .await?;
        check_status(key, response.status_code())?;
        tracing::debug!(key, bytes = data.len(), "Uploaded object");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let response = self.bucket.get_object(key).await?;
        if response.status_code() == 404 {
            return Ok(None);
        }
        check_status(key, response.status_code())?;
        Ok(Some(response.to_vec()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let pages = self.bucket.list(prefix.to_string(), None).await?;
        let keys: Vec<String> = pages
            .into_iter()
            .flat_map(|page| page.contents.into_iter().map(|object| object.key))
            .collect();
        tracing::debug!(prefix, count = keys.len(), "Listed objects");
        Ok(keys)
    }
}

fn check_status(key: &str, status: u16) -> Result<(), StorageError> {
    if (200..300).contains(&status) {
        Ok(())
    } else {
        Err(StorageError::Status {
            key: key.to_string(),
            status,
        })
    }
}

/// In-memory object store for tests and dry runs.
#[derive(Debug, Default)]
pub struct InMemoryObjectStore {
    objects: RwLock<BTreeMap<String, (Vec<u8>, ContentKind)>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.read().map(|o| o.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn put(&self, key: &str, data: &[u8], kind: ContentKind) -> Result<(), StorageError> {
        let mut objects = self.objects.write().map_err(|_| StorageError::Poisoned)?;
        objects.insert(key.to_string(), (data.to_vec(), kind));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let objects = self.objects.read().map_err(|_| StorageError::Poisoned)?;
        Ok(objects.get(key).map(|(data, _)| data.clone()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let objects = self.objects.read().map_err(|_| StorageError::Poisoned)?;
        Ok(objects
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("S3 operation failed: {0}")]
    S3(#[from] s3::error::S3Error),

    #[error("Object store returned status {status} for {key}")]
    Status { key: String, status: u16 },

    #[error("Storage configuration error: {0}")]
    Config(String),

    #[error("Unsupported content kind for key {0}")]
    UnsupportedContent(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Object store lock poisoned")]
    Poisoned,
}

impl Transience for StorageError {
    fn is_transient(&self) -> bool {
        match self {
            StorageError::S3(_) => true,
            StorageError::Status { status, .. } => *status == 429 || *status >= 500,
            StorageError::Config(_)
            | StorageError::UnsupportedContent(_)
            | StorageError::InvalidPayload(_)
            | StorageError::Poisoned => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_kind_from_key() {
        assert_eq!(ContentKind::from_key("replays/42_replay.json").unwrap(), ContentKind::Json);
        assert_eq!(ContentKind::from_key("tables/games.csv").unwrap(), ContentKind::Csv);
        assert!(ContentKind::from_key("replays/42").is_err());
    }

    #[test]
    fn test_json_encoding_rejects_scalars() {
        assert!(ContentKind::Json.encode(b"{\"games\": []}").is_ok());
        assert!(ContentKind::Json.encode(b"[1, 2]").is_ok());
        let err = ContentKind::Json.encode(b"42").unwrap_err();
        assert!(!err.is_transient());
        assert!(ContentKind::Json.encode(b"<html>").is_err());
    }

    #[test]
    fn test_status_transience() {
        let throttled = StorageError::Status { key: "k".into(), status: 429 };
        let unavailable = StorageError::Status { key: "k".into(), status: 503 };
        let forbidden = StorageError::Status { key: "k".into(), status: 403 };
        assert!(throttled.is_transient());
        assert!(unavailable.is_transient());
        assert!(!forbidden.is_transient());
    }

    #[tokio::test]
    async fn test_in_memory_put_overwrites() {
        let store = InMemoryObjectStore::new();
        store.put("replays/1_replay.json", b"{}", ContentKind::Json).await.unwrap();
        store.put("replays/1_replay.json", b"[]", ContentKind::Json).await.unwrap();
        store.put("other/2.csv", b"a,b", ContentKind::Csv).await.unwrap();

        assert_eq!(store.len(), 2);
        assert_eq!(
            store.get("replays/1_replay.json").await.unwrap().as_deref(),
            Some(&b"[]"[..])
        );
        assert_eq!(store.get("missing").await.unwrap(), None);
        assert_eq!(
            store.list("replays/").await.unwrap(),
            vec!["replays/1_replay.json".to_string()]
        );
    }
}
