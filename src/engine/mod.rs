//! Sequences backend calls into complete backup and restore runs.

pub mod backup;
pub mod restore;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::archive::DUMP_ENTRY_NAME;
use crate::backend::Backend;
use crate::config::{EnvironmentConfig, EnvironmentRegistry};
use crate::errors::{AppError, Result, Step};
use crate::storage::ObjectLocation;

pub use backup::BackupReport;
pub use restore::RestoreReport;

pub const ARCHIVE_FILE_NAME: &str = "backup_archive.tar.gz";
pub const FILES_DIR_NAME: &str = "files";

/// Per-run temporary working directory.
pub trait ScratchSpace: Send + Sync {
    /// Creates an empty workspace at `root`, discarding leftovers from an earlier run.
    fn prepare(&self, root: &Path) -> Result<()>;

    fn discard(&self, root: &Path) -> Result<()>;
}

/// Scratch space on the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalScratch;

impl ScratchSpace for LocalScratch {
    fn prepare(&self, root: &Path) -> Result<()> {
        if root.exists() {
            debug!(path = %root.display(), "Removing stale workspace");
            std::fs::remove_dir_all(root)?;
        }
        std::fs::create_dir_all(root.join(FILES_DIR_NAME))?;
        Ok(())
    }

    fn discard(&self, root: &Path) -> Result<()> {
        match std::fs::remove_dir_all(root) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Paths used by one run, all under `root`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    pub root: PathBuf,
    pub files_dir: PathBuf,
    pub dump_path: PathBuf,
    pub archive_path: PathBuf,
}

impl Workspace {
    fn at(root: PathBuf) -> Self {
        Self {
            files_dir: root.join(FILES_DIR_NAME),
            dump_path: root.join(DUMP_ENTRY_NAME),
            archive_path: root.join(ARCHIVE_FILE_NAME),
            root,
        }
    }

    pub fn for_backup(temp_root: &Path, run_id: &str) -> Self {
        Self::at(temp_root.join(format!("backup_{}", run_id)))
    }

    pub fn for_restore(temp_root: &Path, run_id: &str) -> Self {
        Self::at(temp_root.join(format!("restore_{}", run_id)))
    }
}

/// Run ids end up in object keys and directory names.
pub fn validate_run_id(run_id: &str) -> Result<()> {
    let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.');
    if run_id.is_empty() || run_id == "." || run_id == ".." || !run_id.chars().all(allowed) {
        return Err(AppError::Config(format!(
            "invalid run id '{}': use only letters, digits, '-', '_' and '.'",
            run_id
        )));
    }
    Ok(())
}

/// `s3://<backup_bucket>/backups/<environment>/backup_<run_id>.tar.gz`
pub fn archive_location(environment: &str, env: &EnvironmentConfig, run_id: &str) -> ObjectLocation {
    ObjectLocation::new(
        env.backup_bucket.clone(),
        format!("backups/{}/backup_{}.tar.gz", environment, run_id),
    )
}

pub struct Engine {
    backend: Arc<dyn Backend>,
    registry: EnvironmentRegistry,
    temp_root: PathBuf,
    scratch: Arc<dyn ScratchSpace>,
    cancel: CancellationToken,
}

impl Engine {
    pub fn new(backend: Arc<dyn Backend>, registry: EnvironmentRegistry, temp_root: PathBuf) -> Self {
        Self {
            backend,
            registry,
            temp_root,
            scratch: Arc::new(LocalScratch),
            cancel: CancellationToken::new(),
        }
    }

    /// Once `cancel` fires no further step is started.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_scratch(mut self, scratch: Arc<dyn ScratchSpace>) -> Self {
        self.scratch = scratch;
        self
    }

    fn checkpoint(&self, next: Step) -> Result<()> {
        if self.cancel.is_cancelled() {
            warn!(step = %next, "Run cancelled");
            return Err(AppError::Cancelled(format!("stopped before {}", next)).at(next));
        }
        Ok(())
    }

    /// Failures are logged and swallowed.
    fn cleanup(&self, workspace: &Workspace) {
        match self.scratch.discard(&workspace.root) {
            Ok(()) => debug!(path = %workspace.root.display(), "Workspace removed"),
            Err(e) => warn!(
                path = %workspace.root.display(),
                error = %e,
                "Failed to clean up workspace"
            ),
        }
    }
}

/// Runs blocking archive work off the async executor.
async fn run_blocking<T, F>(work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| AppError::Archive(format!("archive task failed: {}", e)))?
}

#[cfg(test)]
pub(crate) mod testing;

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn run_ids_must_be_path_safe() {
        for ok in ["2024-01-15-001", "nightly_3", "v1.2", "A"] {
            assert!(validate_run_id(ok).is_ok(), "{ok}");
        }
        for bad in ["", ".", "..", "../etc", "a/b", "a b", "run\\1", "ü"] {
            assert!(
                matches!(validate_run_id(bad), Err(AppError::Config(_))),
                "{bad:?}"
            );
        }
    }

    #[test]
    fn workspace_layout() {
        let ws = Workspace::for_backup(Path::new("/tmp"), "2024-01-15-001");
        assert_eq!(ws.root, PathBuf::from("/tmp/backup_2024-01-15-001"));
        assert_eq!(ws.files_dir, PathBuf::from("/tmp/backup_2024-01-15-001/files"));
        assert_eq!(ws.dump_path, PathBuf::from("/tmp/backup_2024-01-15-001/db_dump.sql"));
        assert_eq!(
            ws.archive_path,
            PathBuf::from("/tmp/backup_2024-01-15-001/backup_archive.tar.gz")
        );
        assert_eq!(
            Workspace::for_restore(Path::new("/var/tmp"), "r1").root,
            PathBuf::from("/var/tmp/restore_r1")
        );
    }

    #[test]
    fn archive_key_is_deterministic() {
        let env = testing::environment("central-backups", "staging_db", "s3://site/staging");
        let loc = archive_location("staging", &env, "2024-01-15-001");
        assert_eq!(
            loc.uri(),
            "s3://central-backups/backups/staging/backup_2024-01-15-001.tar.gz"
        );
        assert_eq!(loc, archive_location("staging", &env, "2024-01-15-001"));
    }

    #[test]
    fn local_scratch_resets_and_discards() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("backup_1");
        std::fs::create_dir_all(root.join("files/old")).unwrap();
        std::fs::write(root.join("files/old/stale.txt"), b"stale").unwrap();

        LocalScratch.prepare(&root).unwrap();
        assert!(root.join("files").is_dir());
        assert!(!root.join("files/old").exists());

        LocalScratch.discard(&root).unwrap();
        assert!(!root.exists());
        // already gone
        LocalScratch.discard(&root).unwrap();
    }
}
