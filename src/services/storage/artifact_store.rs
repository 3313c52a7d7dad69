// Artifact stores: where detector model artifacts are fetched from

use async_trait::async_trait;
use aws_sdk_s3::{
    config::{Credentials, Region},
    Client,
};
use std::path::{Component, Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument};

use crate::core::config::StorageConfig;
use crate::core::errors::ArtifactError;

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Stream the blob `bucket/key` to `dest`, replacing anything already there
    async fn fetch(&self, bucket: &str, key: &str, dest: &Path) -> Result<(), ArtifactError>;

    /// Short backend name for logs and the status surface
    fn backend(&self) -> &'static str;
}

/// S3 (or S3-compatible, e.g. MinIO) artifact store
pub struct S3ArtifactStore {
    client: Client,
}

impl S3ArtifactStore {
    pub fn new(config: &StorageConfig) -> Self {
        let credentials = Credentials::new(
            &config.access_key_id,
            &config.secret_access_key,
            None,
            None,
            "labelling-pipeline",
        );

        let mut builder = aws_sdk_s3::Config::builder()
            .credentials_provider(credentials)
            .region(Region::new(config.region.clone()))
            .behavior_version_latest();

        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        Self {
            client: Client::from_conf(builder.build()),
        }
    }
}

#[async_trait]
impl ArtifactStore for S3ArtifactStore {
    #[instrument(skip(self, dest), fields(dest = %dest.display()))]
    async fn fetch(&self, bucket: &str, key: &str, dest: &Path) -> Result<(), ArtifactError> {
        let response = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                let detail = format!("{:?}", e);
                if detail.contains("NoSuchKey") || detail.contains("NotFound") {
                    ArtifactError::NotFound {
                        bucket: bucket.to_string(),
                        key: key.to_string(),
                    }
                } else {
                    ArtifactError::Storage(e.to_string())
                }
            })?;

        let mut body = response.body;
        let mut file = tokio::fs::File::create(dest).await?;
        let mut written: u64 = 0;
        while let Some(chunk) = body
            .try_next()
            .await
            .map_err(|e| ArtifactError::Storage(e.to_string()))?
        {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        file.sync_all().await?;

        info!("Fetched s3://{}/{} ({} bytes)", bucket, key, written);
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "s3"
    }
}

/// Artifact store over a local directory; `bucket` maps to a subdirectory
pub struct LocalArtifactStore {
    root: PathBuf,
}

impl LocalArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, bucket: &str, key: &str) -> Result<PathBuf, ArtifactError> {
        let relative = Path::new(bucket).join(key);
        // keys must stay inside the store root
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(ArtifactError::Storage(format!(
                "invalid artifact key: {}",
                relative.display()
            )));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    async fn fetch(&self, bucket: &str, key: &str, dest: &Path) -> Result<(), ArtifactError> {
        let source = self.resolve(bucket, key)?;
        if !tokio::fs::try_exists(&source).await? {
            return Err(ArtifactError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            });
        }
        let copied = tokio::fs::copy(&source, dest).await?;
        debug!("Copied {} to {} ({} bytes)", source.display(), dest.display(), copied);
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_fetch_copies_artifact() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("models/yolo")).unwrap();
        std::fs::write(dir.path().join("models/yolo/v2.pt"), b"PK\x03\x04weights").unwrap();

        let store = LocalArtifactStore::new(dir.path());
        let dest = dir.path().join("out.pt");
        store.fetch("models", "yolo/v2.pt", &dest).await.unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"PK\x03\x04weights");
    }

    #[tokio::test]
    async fn test_local_missing_key_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalArtifactStore::new(dir.path());
        let result = store.fetch("", "missing.pt", &dir.path().join("out.pt")).await;
        assert!(matches!(result, Err(ArtifactError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_local_rejects_escaping_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalArtifactStore::new(dir.path().join("store"));
        let result = store
            .fetch("models", "../../etc/passwd", &dir.path().join("out.pt"))
            .await;
        assert!(matches!(result, Err(ArtifactError::Storage(_))));
    }
}
