//! Object storage for registration uploads.
//!
//! Uploads go to an S3-compatible bucket (MinIO in development). References
//! handed back to callers are path-style URLs, `<endpoint>/<bucket>/<key>`.

use crate::config::ObjectStoreConfig;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use aws_sdk_s3::{config::Credentials, primitives::ByteStream, Client as S3Client};
use secrecy::ExposeSecret;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::RwLock;
use tracing::{debug, error, info, instrument};
use ulid::Ulid;

#[derive(Clone, Debug)]
pub struct Upload {
    pub file_name: String,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `upload` and return a retrievable reference.
    async fn put(&self, upload: Upload) -> Result<String>;
}

/// Keep `[A-Za-z0-9._-]`, replace everything else, and never return a name
/// that carries a path.
#[must_use]
pub fn sanitize_object_name(file_name: &str) -> String {
    let base = file_name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default();
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "upload".to_string()
    } else {
        cleaned.to_string()
    }
}

/// `<ULID>-<sanitised file name>`, so two users uploading `photo.png` never
/// overwrite each other.
fn object_key(file_name: &str) -> String {
    format!("{}-{}", Ulid::new(), sanitize_object_name(file_name))
}

fn reference(base_url: &str, bucket: &str, key: &str) -> String {
    format!("{}/{bucket}/{key}", base_url.trim_end_matches('/'))
}

fn refuse_empty(upload: &Upload) -> Result<()> {
    if upload.bytes.is_empty() {
        return Err(anyhow!(
            "refusing to store empty upload '{}'",
            upload.file_name
        ));
    }
    Ok(())
}

#[derive(Clone, Debug)]
pub struct S3ObjectStore {
    client: S3Client,
    bucket: String,
    base_url: String,
}

impl S3ObjectStore {
    /// Build a path-style client for `config.url`. Static credentials are used
    /// when configured, otherwise the default AWS provider chain.
    pub async fn connect(config: &ObjectStoreConfig) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .endpoint_url(&config.url)
            .region(aws_config::Region::new(config.region.clone()));

        if let (Some(access_key), Some(secret_key)) =
            (&config.access_key_id, &config.secret_access_key)
        {
            loader = loader.credentials_provider(Credentials::new(
                access_key,
                secret_key.expose_secret(),
                None,
                None,
                "registrar",
            ));
        }

        let shared = loader.load().await;
        let s3_config = aws_sdk_s3::config::Builder::from(&shared)
            .force_path_style(true)
            .build();

        Self {
            client: S3Client::from_conf(s3_config),
            bucket: config.bucket.clone(),
            base_url: config.url.clone(),
        }
    }

    /// Create the bucket if it does not exist yet.
    ///
    /// # Errors
    /// Returns an error if the endpoint is unreachable or refuses the bucket.
    pub async fn ensure_bucket(&self) -> Result<()> {
        match self.client.head_bucket().bucket(&self.bucket).send().await {
            Ok(_) => {
                debug!(bucket = %self.bucket, "bucket exists");
                return Ok(());
            }
            Err(err) if err.as_service_error().is_some_and(|e| e.is_not_found()) => {}
            Err(err) => {
                return Err(err).with_context(|| format!("failed to check bucket {}", self.bucket));
            }
        }

        match self.client.create_bucket().bucket(&self.bucket).send().await {
            Ok(_) => {
                info!(bucket = %self.bucket, "bucket created");
                Ok(())
            }
            Err(err)
                if err
                    .as_service_error()
                    .is_some_and(|e| e.is_bucket_already_owned_by_you()) =>
            {
                Ok(())
            }
            Err(err) => {
                Err(err).with_context(|| format!("failed to create bucket {}", self.bucket))
            }
        }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[instrument(
        skip(self, upload),
        fields(file_name = %upload.file_name, size = upload.bytes.len())
    )]
    async fn put(&self, upload: Upload) -> Result<String> {
        refuse_empty(&upload)?;

        let key = object_key(&upload.file_name);
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(ByteStream::from(upload.bytes));
        if let Some(content_type) = upload.content_type {
            request = request.content_type(content_type);
        }

        request.send().await.map_err(|err| {
            error!(%key, error = %err, "S3 upload failed");
            anyhow!("failed to upload object {key}: {err}")
        })?;

        debug!(%key, "object stored");
        Ok(reference(&self.base_url, &self.bucket, &key))
    }
}

/// In-process bucket for tests and local runs without MinIO.
#[derive(Clone, Debug, Default)]
pub struct MemoryObjectStore {
    base_url: String,
    bucket: String,
    objects: Arc<RwLock<HashMap<String, Upload>>>,
}

impl MemoryObjectStore {
    #[must_use]
    pub fn new(base_url: &str, bucket: impl Into<String>) -> Self {
        Self {
            base_url: base_url.to_string(),
            bucket: bucket.into(),
            objects: Arc::default(),
        }
    }

    /// The upload behind a reference returned by [`ObjectStore::put`].
    pub async fn get(&self, reference: &str) -> Option<Upload> {
        let key = reference.rsplit('/').next()?;
        self.objects.read().await.get(key).cloned()
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, upload: Upload) -> Result<String> {
        refuse_empty(&upload)?;
        let key = object_key(&upload.file_name);
        self.objects.write().await.insert(key.clone(), upload);
        Ok(reference(&self.base_url, &self.bucket, &key))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn upload(file_name: &str, bytes: &[u8]) -> Upload {
        Upload {
            file_name: file_name.to_string(),
            content_type: Some("application/pdf".to_string()),
            bytes: bytes.to_vec(),
        }
    }

    #[test]
    fn sanitize_strips_paths_and_odd_characters() {
        assert_eq!(sanitize_object_name("photo.png"), "photo.png");
        assert_eq!(sanitize_object_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_object_name("C:\\docs\\id card.pdf"), "id_card.pdf");
        assert_eq!(sanitize_object_name(".."), "upload");
        assert_eq!(sanitize_object_name(""), "upload");
    }

    #[test]
    fn references_are_path_style() {
        assert_eq!(
            reference("http://localhost:9000/", "user-files", "01J-a.png"),
            "http://localhost:9000/user-files/01J-a.png"
        );
        let key = object_key("id card.pdf");
        assert!(key.ends_with("-id_card.pdf"));
        assert_ne!(key, object_key("id card.pdf"));
    }

    #[tokio::test]
    async fn memory_store_keeps_what_it_references() {
        let store = MemoryObjectStore::new("http://localhost:9000", "user-files");

        let reference = store.put(upload("id card.pdf", b"%PDF-1.7")).await.unwrap();

        assert!(reference.starts_with("http://localhost:9000/user-files/"));
        assert!(reference.ends_with("-id_card.pdf"));
        let stored = store.get(&reference).await.unwrap();
        assert_eq!(stored.bytes, b"%PDF-1.7");
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn empty_upload_is_refused() {
        let store = MemoryObjectStore::new("http://localhost:9000", "user-files");
        assert!(store.put(upload("empty.txt", b"")).await.is_err());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn s3_store_uses_configured_endpoint() {
        let config = ObjectStoreConfig {
            access_key_id: Some("minioadmin".to_string()),
            secret_access_key: Some("minioadmin".to_string().into()),
            ..ObjectStoreConfig::default()
        };
        let store = S3ObjectStore::connect(&config).await;

        assert_eq!(store.bucket, "user-files");
        assert_eq!(store.base_url, "http://localhost:9000");
        assert!(store.put(upload("empty.txt", b"")).await.is_err());
    }
}
