// envbackup/src/engine/restore.rs
use tracing::{Instrument, info, info_span};

use super::{Engine, Workspace, archive_location, run_blocking, validate_run_id};
use crate::archive::extract_backup_archive;
use crate::backend::{DatabaseRef, ImportTarget};
use crate::config::EnvironmentConfig;
use crate::errors::{AppError, Result, Step};
use crate::storage::ObjectLocation;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreReport {
    pub source_env: String,
    pub dest_env: String,
    pub run_id: String,
    pub archive: ObjectLocation,
    pub files: usize,
    pub bytes: u64,
}

impl Engine {
    /// Restores the backup `run_id` of `source_env` into `dest_env`.
    ///
    /// The destination database is replaced with the archived dump and the
    /// archived file tree is pushed to the destination's storage target.
    pub async fn perform_restore(
        &self,
        source_env: &str,
        run_id: &str,
        dest_env: &str,
    ) -> Result<RestoreReport> {
        validate_run_id(run_id)?;
        let source = self.registry.get(source_env)?;
        let dest = self.registry.get(dest_env)?;

        let span = info_span!("restore", environment = source_env, run_id, dest_env);
        async {
            let workspace = Workspace::for_restore(&self.temp_root, run_id);
            info!(workspace = %workspace.root.display(), "🔄 Starting restore");
            self.scratch
                .prepare(&workspace.root)
                .map_err(|e| e.at(Step::PrepareWorkspace))?;

            let result = self
                .restore_steps(source_env, &source, run_id, dest_env, &dest, &workspace)
                .await;
            self.cleanup(&workspace);
            result
        }
        .instrument(span)
        .await
    }

    async fn restore_steps(
        &self,
        source_env: &str,
        source: &EnvironmentConfig,
        run_id: &str,
        dest_env: &str,
        dest: &EnvironmentConfig,
        workspace: &Workspace,
    ) -> Result<RestoreReport> {
        self.checkpoint(Step::DownloadArchive)?;
        let location = archive_location(source_env, source, run_id);
        info!("Step 1/4: Downloading archive {}", location);
        self.backend
            .download_archive(&location, &workspace.archive_path)
            .await
            .map_err(|e| e.at(Step::DownloadArchive))?;

        self.checkpoint(Step::ExtractArchive)?;
        info!("Step 2/4: Extracting archive");
        let archive_path = workspace.archive_path.clone();
        let root = workspace.root.clone();
        let summary = run_blocking(move || extract_backup_archive(&archive_path, &root))
            .await
            .map_err(|e| e.at(Step::ExtractArchive))?;
        if !workspace.dump_path.is_file() {
            return Err(AppError::Archive(format!(
                "archive {} has no database dump",
                location
            ))
            .at(Step::ExtractArchive));
        }

        self.checkpoint(Step::ImportDatabase)?;
        info!(
            "Step 3/4: Importing {} into {}",
            source.db_name, dest.db_name
        );
        let target = ImportTarget {
            database: DatabaseRef::of(dest),
            origin_db_name: source.db_name.clone(),
        };
        self.backend
            .import_database(&target, &workspace.dump_path)
            .await
            .map_err(|e| e.at(Step::ImportDatabase))?;

        self.checkpoint(Step::UploadFolder)?;
        info!("Step 4/4: Uploading files to {}", dest.storage_target);
        self.backend
            .upload_folder(&workspace.files_dir, &dest.storage_target)
            .await
            .map_err(|e| e.at(Step::UploadFolder))?;

        info!(archive = %location, "✓ Restore completed");
        Ok(RestoreReport {
            source_env: source_env.to_string(),
            dest_env: dest_env.to_string(),
            run_id: run_id.to_string(),
            archive: location,
            // the dump is one of the extracted files
            files: summary.files.saturating_sub(1),
            bytes: summary.bytes,
        })
    }
}
