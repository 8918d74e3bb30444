//! The six primitive operations a backup or restore run is built from.

pub mod rsync;

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{EnvironmentConfig, FileTransportKind, PollingConfig};
use crate::database::{self, DatabaseJobService, JobKind, JobRequest, reconcile, wait_for_job};
use crate::errors::{AppError, Result};
use crate::storage::{ObjectLocation, ObjectStore};
use crate::transfer::BulkTransfer;

pub use rsync::HostSync;

/// A database on a particular server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseRef {
    pub instance_ref: String,
    pub db_name: String,
}

impl DatabaseRef {
    pub fn of(env: &EnvironmentConfig) -> Self {
        Self {
            instance_ref: env.instance_ref.clone(),
            db_name: env.db_name.clone(),
        }
    }
}

/// Where a dump is loaded, and which database it was taken from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportTarget {
    pub database: DatabaseRef,
    pub origin_db_name: String,
}

#[async_trait]
pub trait Backend: Send + Sync {
    /// Writes a complete dump of `db` to `local_dump_path`.
    async fn export_database(&self, db: &DatabaseRef, local_dump_path: &Path) -> Result<()>;

    /// Loads a dump into `target`, replacing its content.
    async fn import_database(&self, target: &ImportTarget, local_dump_path: &Path) -> Result<()>;

    /// Mirrors the remote tree at `remote_source` into `local_dest`.
    async fn download_folder(&self, remote_source: &str, local_dest: &Path) -> Result<()>;

    async fn upload_folder(&self, local_source: &Path, remote_dest: &str) -> Result<()>;

    async fn upload_archive(&self, local_archive: &Path, remote: &ObjectLocation) -> Result<()>;

    async fn download_archive(&self, remote: &ObjectLocation, local_archive: &Path) -> Result<()>;
}

/// How live file trees are moved. Chosen once, from configuration.
#[derive(Clone)]
pub enum FileTransport {
    HostSync(HostSync),
    ObjectStore(BulkTransfer),
}

impl FileTransport {
    pub fn from_config(
        kind: FileTransportKind,
        store: Arc<dyn ObjectStore>,
        max_concurrency: usize,
        cancel: CancellationToken,
    ) -> Self {
        match kind {
            FileTransportKind::HostSync => FileTransport::HostSync(HostSync::new(cancel)),
            FileTransportKind::ObjectStore => FileTransport::ObjectStore(
                BulkTransfer::new(store, max_concurrency).with_cancellation(cancel),
            ),
        }
    }

    async fn pull(&self, remote: &str, local: &Path) -> Result<()> {
        match self {
            FileTransport::HostSync(sync) => sync.pull(remote, local).await,
            FileTransport::ObjectStore(transfer) => {
                let source = ObjectLocation::parse(remote)?;
                transfer.download_prefix(&source, local).await.map(|_| ())
            }
        }
    }

    async fn push(&self, local: &Path, remote: &str) -> Result<()> {
        match self {
            FileTransport::HostSync(sync) => sync.push(local, remote).await,
            FileTransport::ObjectStore(transfer) => {
                let dest = ObjectLocation::parse(remote)?;
                transfer.upload_tree(local, &dest).await.map(|_| ())
            }
        }
    }
}

/// Backend built from a database job service, an object store and a file transport.
pub struct StandardBackend {
    jobs: Arc<dyn DatabaseJobService>,
    store: Arc<dyn ObjectStore>,
    files: FileTransport,
    polling: PollingConfig,
    cancel: CancellationToken,
    create_database_if_missing: bool,
}

impl StandardBackend {
    pub fn new(
        jobs: Arc<dyn DatabaseJobService>,
        store: Arc<dyn ObjectStore>,
        files: FileTransport,
        polling: PollingConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            jobs,
            store,
            files,
            polling,
            cancel,
            create_database_if_missing: true,
        }
    }

    pub fn create_database_if_missing(mut self, enabled: bool) -> Self {
        self.create_database_if_missing = enabled;
        self
    }

    async fn run_job(&self, request: JobRequest) -> Result<()> {
        let handle = self.jobs.start(request).await?;
        wait_for_job(self.jobs.as_ref(), &handle, &self.polling, &self.cancel).await
    }
}

#[async_trait]
impl Backend for StandardBackend {
    async fn export_database(&self, db: &DatabaseRef, local_dump_path: &Path) -> Result<()> {
        if let Some(parent) = local_dump_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        info!(database = %db.db_name, "Exporting database");
        self.run_job(JobRequest {
            kind: JobKind::Export,
            db_name: db.db_name.clone(),
            connection_url: database::connection_url(&db.instance_ref, &db.db_name)?,
            dump_path: local_dump_path.to_path_buf(),
        })
        .await?;

        let size = match tokio::fs::metadata(local_dump_path).await {
            Ok(meta) => meta.len(),
            Err(_) => {
                return Err(AppError::RemoteOperation {
                    operation: format!("export {}", db.db_name),
                    message: format!("no dump was written to {}", local_dump_path.display()),
                });
            }
        };
        info!(database = %db.db_name, bytes = size, "✓ Database exported");
        Ok(())
    }

    async fn import_database(&self, target: &ImportTarget, local_dump_path: &Path) -> Result<()> {
        let dest = &target.database;
        if !tokio::fs::try_exists(local_dump_path).await? {
            return Err(AppError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("dump file not found: {}", local_dump_path.display()),
            )));
        }
        if self.create_database_if_missing {
            database::target::ensure_database_exists(&dest.instance_ref, &dest.db_name).await?;
        }

        let dump = local_dump_path.to_path_buf();
        let origin = target.origin_db_name.clone();
        let dest_name = dest.db_name.clone();
        let prepared = tokio::task::spawn_blocking(move || {
            reconcile::prepare_dump_for_import(&dump, &origin, &dest_name)
        })
        .await
        .map_err(|e| AppError::Archive(format!("dump preparation task failed: {}", e)))??;

        info!(
            database = %dest.db_name,
            origin = %target.origin_db_name,
            dump = %prepared.display(),
            "Importing database"
        );
        self.run_job(JobRequest {
            kind: JobKind::Import,
            db_name: dest.db_name.clone(),
            connection_url: database::connection_url(&dest.instance_ref, &dest.db_name)?,
            dump_path: prepared,
        })
        .await?;
        info!(database = %dest.db_name, "✓ Database imported");
        Ok(())
    }

    async fn download_folder(&self, remote_source: &str, local_dest: &Path) -> Result<()> {
        self.files.pull(remote_source, local_dest).await
    }

    async fn upload_folder(&self, local_source: &Path, remote_dest: &str) -> Result<()> {
        self.files.push(local_source, remote_dest).await
    }

    async fn upload_archive(&self, local_archive: &Path, remote: &ObjectLocation) -> Result<()> {
        let bytes = self.store.put_file(remote, local_archive).await?;
        info!(dest = %remote, bytes, "✓ Archive uploaded");
        Ok(())
    }

    async fn download_archive(&self, remote: &ObjectLocation, local_archive: &Path) -> Result<()> {
        let bytes = self.store.get_file(remote, local_archive).await?;
        info!(source = %remote, bytes, "✓ Archive downloaded");
        Ok(())
    }
}
