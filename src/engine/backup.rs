// envbackup/src/engine/backup.rs
use tracing::{Instrument, info, info_span};

use super::{Engine, Workspace, archive_location, run_blocking, validate_run_id};
use crate::archive::create_backup_archive;
use crate::backend::DatabaseRef;
use crate::config::EnvironmentConfig;
use crate::errors::{Result, Step};
use crate::storage::ObjectLocation;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupReport {
    pub environment: String,
    pub run_id: String,
    pub archive: ObjectLocation,
    /// Files from the live tree, not counting the dump.
    pub files: usize,
    pub bytes: u64,
}

impl Engine {
    /// Exports the database and file tree of `environment` into one archive.
    ///
    /// Steps run in order and the first failure aborts the run. The
    /// workspace is removed afterwards whether or not the run succeeded.
    pub async fn perform_backup(&self, environment: &str, run_id: &str) -> Result<BackupReport> {
        validate_run_id(run_id)?;
        let env = self.registry.get(environment)?;

        let span = info_span!("backup", environment, run_id);
        async {
            let workspace = Workspace::for_backup(&self.temp_root, run_id);
            info!(workspace = %workspace.root.display(), "🚀 Starting backup");
            self.scratch
                .prepare(&workspace.root)
                .map_err(|e| e.at(Step::PrepareWorkspace))?;

            let result = self.backup_steps(environment, &env, run_id, &workspace).await;
            self.cleanup(&workspace);
            result
        }
        .instrument(span)
        .await
    }

    async fn backup_steps(
        &self,
        environment: &str,
        env: &EnvironmentConfig,
        run_id: &str,
        workspace: &Workspace,
    ) -> Result<BackupReport> {
        self.checkpoint(Step::ExportDatabase)?;
        info!("Step 1/4: Exporting database {}", env.db_name);
        self.backend
            .export_database(&DatabaseRef::of(env), &workspace.dump_path)
            .await
            .map_err(|e| e.at(Step::ExportDatabase))?;

        self.checkpoint(Step::DownloadFolder)?;
        info!("Step 2/4: Downloading files from {}", env.storage_target);
        self.backend
            .download_folder(&env.storage_target, &workspace.files_dir)
            .await
            .map_err(|e| e.at(Step::DownloadFolder))?;

        self.checkpoint(Step::CreateArchive)?;
        info!("Step 3/4: Creating backup archive");
        let archive_path = workspace.archive_path.clone();
        let dump_path = workspace.dump_path.clone();
        let files_dir = workspace.files_dir.clone();
        let summary =
            run_blocking(move || create_backup_archive(&archive_path, &dump_path, &files_dir))
                .await
                .map_err(|e| e.at(Step::CreateArchive))?;

        self.checkpoint(Step::UploadArchive)?;
        let location = archive_location(environment, env, run_id);
        info!("Step 4/4: Uploading archive to {}", location);
        self.backend
            .upload_archive(&workspace.archive_path, &location)
            .await
            .map_err(|e| e.at(Step::UploadArchive))?;

        info!(archive = %location, "✓ Backup completed");
        Ok(BackupReport {
            environment: environment.to_string(),
            run_id: run_id.to_string(),
            archive: location,
            files: summary.files.saturating_sub(1),
            bytes: summary.bytes,
        })
    }
}
