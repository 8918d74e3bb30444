//! Object store laid out on a local (or mounted) filesystem as `<root>/<bucket>/<key>`.

use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use walkdir::WalkDir;

use super::{ObjectLocation, ObjectStore};
use crate::errors::{AppError, Result};

#[derive(Debug, Clone)]
pub struct FilesystemObjectStore {
    root: PathBuf,
}

impl FilesystemObjectStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn bucket_path(&self, bucket: &str) -> Result<PathBuf> {
        if bucket.is_empty() || bucket.contains('/') || bucket == "." || bucket == ".." {
            return Err(AppError::Storage(format!("Invalid bucket name: {:?}", bucket)));
        }
        Ok(self.root.join(bucket))
    }

    /// Convert a storage key to a filesystem path, refusing keys that leave the bucket.
    fn object_path(&self, location: &ObjectLocation) -> Result<PathBuf> {
        let mut path = self.bucket_path(&location.bucket)?;
        let key = Path::new(&location.key);
        for component in key.components() {
            match component {
                Component::Normal(part) => path.push(part),
                _ => {
                    return Err(AppError::Storage(format!(
                        "Invalid object key: {}",
                        location.key
                    )));
                }
            }
        }
        if location.key.is_empty() || location.key.ends_with('/') {
            return Err(AppError::Storage(format!(
                "Invalid object key: {:?}",
                location.key
            )));
        }
        Ok(path)
    }
}

#[async_trait]
impl ObjectStore for FilesystemObjectStore {
    async fn put_file(&self, location: &ObjectLocation, source: &Path) -> Result<u64> {
        let dest = self.object_path(location)?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }
        // Write next to the target then rename so readers never see a partial object.
        let staging = dest.with_file_name(format!(
            ".{}.partial",
            dest.file_name().and_then(|n| n.to_str()).unwrap_or("object")
        ));
        let written = fs::copy(source, &staging).await.map_err(|e| {
            AppError::Storage(format!(
                "Failed to store {} as {}: {}",
                source.display(),
                location,
                e
            ))
        })?;
        fs::rename(&staging, &dest).await?;
        Ok(written)
    }

    async fn get_file(&self, location: &ObjectLocation, dest: &Path) -> Result<u64> {
        let source = self.object_path(location)?;
        if !fs::try_exists(&source).await? {
            return Err(AppError::Storage(format!("Object not found: {}", location)));
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::copy(&source, dest).await.map_err(|e| {
            AppError::Storage(format!(
                "Failed to read {} into {}: {}",
                location,
                dest.display(),
                e
            ))
        })
    }

    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        let bucket_root = self.bucket_path(bucket)?;
        let prefix = prefix.to_string();
        tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
            if !bucket_root.exists() {
                return Ok(Vec::new());
            }
            let mut keys = Vec::new();
            for entry in WalkDir::new(&bucket_root).sort_by_file_name() {
                let entry = entry?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let Ok(relative) = entry.path().strip_prefix(&bucket_root) else {
                    continue;
                };
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                let is_partial = relative
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with('.') && n.ends_with(".partial"));
                if key.starts_with(&prefix) && !is_partial {
                    keys.push(key);
                }
            }
            Ok(keys)
        })
        .await
        .map_err(|e| AppError::Storage(format!("Listing task failed: {}", e)))?
    }

    async fn delete(&self, location: &ObjectLocation) -> Result<()> {
        let path = self.object_path(location)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AppError::Storage(format!(
                "Failed to delete {}: {}",
                location, e
            ))),
        }
    }

    async fn probe(&self, bucket: &str) -> Result<()> {
        let path = self.bucket_path(bucket)?;
        match fs::metadata(&path).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(AppError::Storage(format!(
                "Bucket path {} is not a directory",
                path.display()
            ))),
            Err(e) => Err(AppError::Storage(format!(
                "Bucket directory {} is not usable: {}",
                path.display(),
                e
            ))),
        }
    }
}
