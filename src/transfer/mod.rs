//! Bounded-concurrency bulk transfer between a local tree and an object prefix.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::errors::{AppError, Result, TransferFailure};
use crate::storage::{ObjectLocation, ObjectStore};

/// One object to move or remove. Owned by exactly one worker.
#[derive(Debug, Clone)]
pub enum TransferJob {
    Download { source: ObjectLocation, dest: PathBuf },
    Upload { source: PathBuf, dest: ObjectLocation },
    Delete { target: ObjectLocation },
}

impl TransferJob {
    pub fn label(&self) -> String {
        match self {
            TransferJob::Download { source, .. } => source.uri(),
            TransferJob::Upload { source, .. } => source.display().to_string(),
            TransferJob::Delete { target } => target.uri(),
        }
    }

    async fn execute(&self, store: &dyn ObjectStore) -> Result<u64> {
        match self {
            TransferJob::Download { source, dest } => store.get_file(source, dest).await,
            TransferJob::Upload { source, dest } => store.put_file(dest, source).await,
            TransferJob::Delete { target } => store.delete(target).await.map(|_| 0),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferSummary {
    pub total: usize,
    pub bytes: u64,
    /// Stale objects removed after an upload.
    pub removed: usize,
}

#[derive(Clone)]
pub struct BulkTransfer {
    store: Arc<dyn ObjectStore>,
    max_concurrency: usize,
    cancel: CancellationToken,
}

impl BulkTransfer {
    pub fn new(store: Arc<dyn ObjectStore>, max_concurrency: usize) -> Self {
        Self {
            store,
            max_concurrency: max_concurrency.max(1),
            cancel: CancellationToken::new(),
        }
    }

    /// Jobs still waiting or running stop when `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Number of workers used for `jobs` jobs.
    pub fn workers_for(&self, jobs: usize) -> usize {
        self.max_concurrency.min(jobs)
    }

    /// Mirrors every object under `source` into `local_root`.
    pub async fn download_prefix(
        &self,
        source: &ObjectLocation,
        local_root: &Path,
    ) -> Result<TransferSummary> {
        tokio::fs::create_dir_all(local_root).await?;
        let prefix = directory_prefix(&source.key);
        let keys = self.store.list(&source.bucket, &prefix).await?;

        let mut jobs = Vec::with_capacity(keys.len());
        let mut rejected = Vec::new();
        for key in keys {
            let Some(relative) = key.strip_prefix(prefix.as_str()) else {
                continue;
            };
            // directory markers
            if relative.is_empty() || relative.ends_with('/') {
                continue;
            }
            let location = ObjectLocation::new(source.bucket.clone(), key.clone());
            match local_path_for(local_root, relative) {
                Some(dest) => jobs.push(TransferJob::Download {
                    source: location,
                    dest,
                }),
                None => rejected.push(TransferFailure {
                    job: location.uri(),
                    reason: "object key escapes the destination directory".to_string(),
                }),
            }
        }

        info!(
            source = %source,
            dest = %local_root.display(),
            objects = jobs.len() + rejected.len(),
            "Starting bulk download"
        );
        self.run(jobs, rejected).await
    }

    /// Mirrors every regular file under `local_root` to objects under `dest`.
    ///
    /// Once every upload has succeeded, objects under the prefix with no
    /// local counterpart are deleted. A failed upload leaves them in place.
    pub async fn upload_tree(
        &self,
        local_root: &Path,
        dest: &ObjectLocation,
    ) -> Result<TransferSummary> {
        if !local_root.is_dir() {
            return Err(AppError::Storage(format!(
                "Upload source is not a directory: {}",
                local_root.display()
            )));
        }
        let prefix = directory_prefix(&dest.key);
        let root = local_root.to_path_buf();
        let bucket = dest.bucket.clone();
        let key_prefix = prefix.clone();

        let (jobs, rejected) = tokio::task::spawn_blocking(
            move || -> Result<(Vec<TransferJob>, Vec<TransferFailure>)> {
                let mut jobs = Vec::new();
                let mut rejected = Vec::new();
                for entry in WalkDir::new(&root).sort_by_file_name() {
                    let entry = entry?;
                    if !entry.file_type().is_file() {
                        continue;
                    }
                    let Ok(relative) = entry.path().strip_prefix(&root) else {
                        continue;
                    };
                    match slash_key(relative) {
                        Some(key) => jobs.push(TransferJob::Upload {
                            source: entry.path().to_path_buf(),
                            dest: ObjectLocation::new(bucket.clone(), format!("{}{}", key_prefix, key)),
                        }),
                        None => rejected.push(TransferFailure {
                            job: entry.path().display().to_string(),
                            reason: "file name is not valid UTF-8".to_string(),
                        }),
                    }
                }
                Ok((jobs, rejected))
            },
        )
        .await
        .map_err(|e| AppError::Storage(format!("Directory walk task failed: {}", e)))??;

        info!(
            source = %local_root.display(),
            dest = %dest,
            files = jobs.len() + rejected.len(),
            "Starting bulk upload"
        );
        let uploaded: HashSet<String> = jobs
            .iter()
            .filter_map(|job| match job {
                TransferJob::Upload { dest, .. } => Some(dest.key.clone()),
                _ => None,
            })
            .collect();
        let mut summary = self.run(jobs, rejected).await?;

        let stale: Vec<TransferJob> = self
            .store
            .list(&dest.bucket, &prefix)
            .await?
            .into_iter()
            .filter(|key| !key.ends_with('/') && !uploaded.contains(key))
            .map(|key| TransferJob::Delete {
                target: ObjectLocation::new(dest.bucket.clone(), key),
            })
            .collect();
        if !stale.is_empty() {
            info!(dest = %dest, objects = stale.len(), "Removing objects missing from the local tree");
            summary.removed = self.run(stale, Vec::new()).await?.total;
        }
        Ok(summary)
    }

    /// Runs every job, waits for all of them, then aggregates failures.
    pub async fn run(
        &self,
        jobs: Vec<TransferJob>,
        mut failures: Vec<TransferFailure>,
    ) -> Result<TransferSummary> {
        let total = jobs.len() + failures.len();
        if total == 0 {
            info!("Nothing to transfer");
            return Ok(TransferSummary::default());
        }
        if self.cancel.is_cancelled() {
            return Err(AppError::Cancelled(format!("bulk transfer of {} objects", total)));
        }

        let workers = self.workers_for(jobs.len()).max(1);
        let semaphore = Arc::new(Semaphore::new(workers));
        debug!(jobs = jobs.len(), workers, "Dispatching transfer jobs");

        let labels: Vec<String> = jobs.iter().map(TransferJob::label).collect();
        let handles: Vec<_> = jobs
            .into_iter()
            .map(|job| {
                let store = Arc::clone(&self.store);
                let semaphore = Arc::clone(&semaphore);
                let cancel = self.cancel.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = cancel.cancelled() => Err(AppError::Cancelled(job.label())),
                        result = async {
                            let _permit = semaphore
                                .acquire_owned()
                                .await
                                .map_err(|e| AppError::Storage(format!("Transfer pool closed: {}", e)))?;
                            job.execute(store.as_ref()).await
                        } => result,
                    }
                })
            })
            .collect();

        // Wait for ALL jobs before looking at any result
        let results = futures::future::join_all(handles).await;

        if self.cancel.is_cancelled() {
            let finished = results
                .iter()
                .filter(|r| matches!(r, Ok(Ok(_))))
                .count();
            warn!(finished, total, "Bulk transfer cancelled");
            return Err(AppError::Cancelled(format!(
                "bulk transfer stopped after {} of {} objects",
                finished, total
            )));
        }

        let mut bytes = 0u64;
        for (label, result) in labels.into_iter().zip(results) {
            match result {
                Ok(Ok(written)) => bytes += written,
                Ok(Err(e)) => failures.push(TransferFailure {
                    job: label,
                    reason: e.to_string(),
                }),
                Err(e) => failures.push(TransferFailure {
                    job: label,
                    reason: format!("worker task failed: {}", e),
                }),
            }
        }

        if !failures.is_empty() {
            failures.sort_by(|a, b| a.job.cmp(&b.job));
            for failure in &failures {
                error!(job = %failure.job, reason = %failure.reason, "Transfer failed");
            }
            return Err(AppError::Transfer { total, failures });
        }

        info!(objects = total, bytes, "✓ Bulk transfer completed");
        Ok(TransferSummary {
            total,
            bytes,
            removed: 0,
        })
    }
}

/// `""` stays empty, anything else ends with exactly one `/`.
fn directory_prefix(key: &str) -> String {
    let trimmed = key.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{}/", trimmed)
    }
}

/// Relative path as an object key with `/` separators, or `None` for non-UTF-8 names.
fn slash_key(relative: &Path) -> Option<String> {
    let parts = relative
        .components()
        .map(|c| c.as_os_str().to_str())
        .collect::<Option<Vec<_>>>()?;
    Some(parts.join("/"))
}

/// Local destination for a relative object key, or `None` when it would leave `root`.
fn local_path_for(root: &Path, relative_key: &str) -> Option<PathBuf> {
    let mut path = root.to_path_buf();
    let mut pushed = false;
    for component in Path::new(relative_key).components() {
        match component {
            Component::Normal(part) => {
                path.push(part);
                pushed = true;
            }
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    pushed.then_some(path)
}
