//! Test doubles shared by the backup and restore pipeline tests.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use super::{LocalScratch, ScratchSpace};
use crate::backend::{Backend, DatabaseRef, ImportTarget};
use crate::config::{EnvironmentConfig, EnvironmentRegistry};
use crate::errors::{AppError, Result};
use crate::storage::{FilesystemObjectStore, ObjectLocation, ObjectStore};

pub fn environment(bucket: &str, db_name: &str, storage_target: &str) -> EnvironmentConfig {
    EnvironmentConfig {
        backup_bucket: bucket.to_string(),
        db_name: db_name.to_string(),
        storage_target: storage_target.to_string(),
        project_id: "acme".to_string(),
        instance_ref: "postgres://admin@db:5432".to_string(),
    }
}

/// `staging` and `production`, sharing one backup bucket.
pub fn registry() -> EnvironmentRegistry {
    let mut environments = HashMap::new();
    environments.insert(
        "staging".to_string(),
        environment("central-backups", "staging_db", "deploy@staging:/var/www/files"),
    );
    environments.insert(
        "production".to_string(),
        environment("central-backups", "production_db", "deploy@prod:/var/www/files"),
    );
    EnvironmentRegistry::new(environments)
}

pub type Tree = BTreeMap<String, Vec<u8>>;

/// In-memory stand-in for the live environments. Archives go to a real
/// filesystem object store so they can be inspected.
pub struct RecordingBackend {
    pub archives: FilesystemObjectStore,
    pub remote_trees: Mutex<HashMap<String, Tree>>,
    pub imports: Mutex<Vec<(ImportTarget, String)>>,
    pub calls: Mutex<Vec<&'static str>>,
    pub fail_on: Option<&'static str>,
    pub cancel_on: Option<(&'static str, CancellationToken)>,
    pub write_dump: bool,
}

impl RecordingBackend {
    pub fn new(archive_root: &Path) -> Self {
        Self {
            archives: FilesystemObjectStore::new(archive_root.to_path_buf()),
            remote_trees: Mutex::new(HashMap::new()),
            imports: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            fail_on: None,
            cancel_on: None,
            write_dump: true,
        }
    }

    pub fn failing_on(mut self, operation: &'static str) -> Self {
        self.fail_on = Some(operation);
        self
    }

    /// Fires `cancel` while `operation` runs; the operation itself succeeds.
    pub fn cancelling_on(mut self, operation: &'static str, cancel: CancellationToken) -> Self {
        self.cancel_on = Some((operation, cancel));
        self
    }

    /// Exports report success without producing a dump.
    pub fn without_dump(mut self) -> Self {
        self.write_dump = false;
        self
    }

    pub fn with_tree(self, target: &str, files: &[(&str, &[u8])]) -> Self {
        self.set_tree(target, files);
        self
    }

    pub fn set_tree(&self, target: &str, files: &[(&str, &[u8])]) {
        let tree = files
            .iter()
            .map(|(name, body)| (name.to_string(), body.to_vec()))
            .collect();
        self.remote_trees.lock().unwrap().insert(target.to_string(), tree);
    }

    pub fn tree(&self, target: &str) -> Tree {
        self.remote_trees
            .lock()
            .unwrap()
            .get(target)
            .cloned()
            .unwrap_or_default()
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, operation: &'static str) -> Result<()> {
        self.calls.lock().unwrap().push(operation);
        if let Some((_, cancel)) = self.cancel_on.as_ref().filter(|(op, _)| *op == operation) {
            cancel.cancel();
        }
        if self.fail_on == Some(operation) {
            return Err(AppError::Storage(format!("injected {} failure", operation)));
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for RecordingBackend {
    async fn export_database(&self, db: &DatabaseRef, local_dump_path: &Path) -> Result<()> {
        self.record("export_database")?;
        if self.write_dump {
            std::fs::write(local_dump_path, format!("\\connect {}\nSELECT 1;\n", db.db_name))?;
        }
        Ok(())
    }

    async fn import_database(&self, target: &ImportTarget, local_dump_path: &Path) -> Result<()> {
        self.record("import_database")?;
        let dump = std::fs::read_to_string(local_dump_path)?;
        self.imports.lock().unwrap().push((target.clone(), dump));
        Ok(())
    }

    async fn download_folder(&self, remote_source: &str, local_dest: &Path) -> Result<()> {
        self.record("download_folder")?;
        std::fs::create_dir_all(local_dest)?;
        for (name, body) in self.tree(remote_source) {
            let path = local_dest.join(&name);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, body)?;
        }
        Ok(())
    }

    async fn upload_folder(&self, local_source: &Path, remote_dest: &str) -> Result<()> {
        self.record("upload_folder")?;
        let mut tree = Tree::new();
        for entry in WalkDir::new(local_source) {
            let entry = entry?;
            if entry.file_type().is_file() {
                let relative = entry
                    .path()
                    .strip_prefix(local_source)
                    .map_err(|e| AppError::Storage(e.to_string()))?;
                tree.insert(
                    relative.to_string_lossy().replace('\\', "/"),
                    std::fs::read(entry.path())?,
                );
            }
        }
        self.remote_trees
            .lock()
            .unwrap()
            .insert(remote_dest.to_string(), tree);
        Ok(())
    }

    async fn upload_archive(&self, local_archive: &Path, remote: &ObjectLocation) -> Result<()> {
        self.record("upload_archive")?;
        self.archives.put_file(remote, local_archive).await.map(|_| ())
    }

    async fn download_archive(&self, remote: &ObjectLocation, local_archive: &Path) -> Result<()> {
        self.record("download_archive")?;
        self.archives.get_file(remote, local_archive).await.map(|_| ())
    }
}

/// Creates workspaces normally but can never remove them.
pub struct StickyScratch;

impl ScratchSpace for StickyScratch {
    fn prepare(&self, root: &Path) -> Result<()> {
        LocalScratch.prepare(root)
    }

    fn discard(&self, root: &Path) -> Result<()> {
        Err(AppError::Io(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            format!("cannot remove {}", root.display()),
        )))
    }
}

/// Entry names of a backup archive, in stream order.
pub fn archive_entries(path: &Path) -> Vec<String> {
    let file = std::fs::File::open(path).unwrap();
    let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(file));
    archive
        .entries()
        .unwrap()
        .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
        .collect()
}
