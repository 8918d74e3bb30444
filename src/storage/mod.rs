//! Durable object storage used for backup archives and object-store file trees.

pub mod filesystem;
pub mod s3;

use async_trait::async_trait;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use crate::config::StorageConfig;
use crate::errors::{AppError, Result};

pub use filesystem::FilesystemObjectStore;
pub use s3::S3ObjectStore;

/// A bucket plus a key inside it, written as `s3://bucket/key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectLocation {
    pub bucket: String,
    pub key: String,
}

impl ObjectLocation {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    /// Parses an S3 URI (s3://bucket/key) into bucket and key.
    ///
    /// An empty key is allowed so that whole-bucket prefixes can be addressed.
    pub fn parse(uri: &str) -> Result<Self> {
        let parsed = url::Url::parse(uri)?;
        if parsed.scheme() != "s3" {
            return Err(AppError::Storage(format!(
                "object URI must start with s3://, got {}",
                uri
            )));
        }
        let bucket = parsed
            .host_str()
            .filter(|b| !b.is_empty())
            .ok_or_else(|| AppError::Storage(format!("object URI missing bucket name: {}", uri)))?
            .to_string();
        let key = parsed.path().trim_start_matches('/').to_string();
        Ok(Self { bucket, key })
    }

    pub fn uri(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.key)
    }
}

impl fmt::Display for ObjectLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s3://{}/{}", self.bucket, self.key)
    }
}

/// Trait for durable object stores. Implementations must be safe to share
/// between concurrent transfer workers.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Uploads a local file, replacing any existing object. Returns bytes written.
    async fn put_file(&self, location: &ObjectLocation, source: &Path) -> Result<u64>;

    /// Downloads an object into `dest`, creating parent directories. Returns bytes written.
    async fn get_file(&self, location: &ObjectLocation, dest: &Path) -> Result<u64>;

    /// Lists every key in `bucket` starting with `prefix`.
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>>;

    /// Removes one object. Deleting a key that does not exist succeeds.
    async fn delete(&self, location: &ObjectLocation) -> Result<()>;

    /// Checks that `bucket` exists and is reachable.
    async fn probe(&self, bucket: &str) -> Result<()>;
}

pub async fn connect(config: &StorageConfig) -> Result<Arc<dyn ObjectStore>> {
    match config {
        StorageConfig::S3(s3_config) => Ok(Arc::new(S3ObjectStore::connect(s3_config).await)),
        StorageConfig::Filesystem { root } => Ok(Arc::new(FilesystemObjectStore::new(root.clone()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bucket_and_key() {
        let loc = ObjectLocation::parse("s3://central/backups/staging/backup_1.tar.gz").unwrap();
        assert_eq!(loc.bucket, "central");
        assert_eq!(loc.key, "backups/staging/backup_1.tar.gz");
        assert_eq!(loc.uri(), "s3://central/backups/staging/backup_1.tar.gz");
    }

    #[test]
    fn bucket_only_uri_has_empty_key() {
        let loc = ObjectLocation::parse("s3://site-files").unwrap();
        assert_eq!(loc.bucket, "site-files");
        assert_eq!(loc.key, "");
    }

    #[test]
    fn rejects_other_schemes() {
        assert!(ObjectLocation::parse("gs://bucket/key").is_err());
        assert!(ObjectLocation::parse("not a uri").is_err());
    }
}
