// envbackup/src/backend/rsync.rs
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::{AppError, Result};

/// Mirrors directory trees to and from a remote host with `rsync` over `ssh`.
#[derive(Debug, Clone)]
pub struct HostSync {
    program: PathBuf,
    cancel: CancellationToken,
}

fn as_directory(path: &str) -> String {
    format!("{}/", path.trim_end_matches('/'))
}

impl HostSync {
    /// A running rsync is killed when `cancel` fires.
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            program: PathBuf::from("rsync"),
            cancel,
        }
    }

    #[cfg(test)]
    fn with_program(program: PathBuf, cancel: CancellationToken) -> Self {
        Self { program, cancel }
    }

    /// `rsync -az -e ssh <target>/ <local>/`
    pub fn pull_args(target: &str, local: &Path) -> Vec<OsString> {
        vec![
            "-az".into(),
            "-e".into(),
            "ssh".into(),
            as_directory(target).into(),
            as_directory(&local.to_string_lossy()).into(),
        ]
    }

    /// Push replaces the remote tree, dropping files that are not in `local`.
    pub fn push_args(local: &Path, target: &str) -> Vec<OsString> {
        vec![
            "-rlz".into(),
            "--delete".into(),
            "--no-times".into(),
            "--no-perms".into(),
            "--chmod=ugo=rwX".into(),
            "-e".into(),
            "ssh".into(),
            as_directory(&local.to_string_lossy()).into(),
            as_directory(target).into(),
        ]
    }

    pub async fn pull(&self, target: &str, local: &Path) -> Result<()> {
        tokio::fs::create_dir_all(local).await?;
        info!(source = target, dest = %local.display(), "Starting rsync download");
        self.run(Self::pull_args(target, local)).await?;
        info!(source = target, "✓ Downloaded files via rsync");
        Ok(())
    }

    pub async fn push(&self, local: &Path, target: &str) -> Result<()> {
        if !local.is_dir() {
            return Err(AppError::Storage(format!(
                "Upload source is not a directory: {}",
                local.display()
            )));
        }
        info!(source = %local.display(), dest = target, "Starting rsync upload");
        self.run(Self::push_args(local, target)).await?;
        info!(dest = target, "✓ Uploaded files via rsync");
        Ok(())
    }

    async fn run(&self, args: Vec<OsString>) -> Result<()> {
        let program = self.program.display().to_string();
        if self.cancel.is_cancelled() {
            return Err(AppError::Cancelled(program));
        }
        debug!(program = %program, ?args, "Running rsync");
        let child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AppError::Command {
                program: program.clone(),
                stderr: format!("failed to start: {}", e),
            })?;

        // dropping the child future kills the process
        let output = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                warn!(program = %program, "Cancellation requested, stopping rsync");
                return Err(AppError::Cancelled(program));
            }
            output = child.wait_with_output() => output?,
        };

        if !output.status.success() {
            return Err(AppError::Command {
                program,
                stderr: format!(
                    "exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn strings(args: Vec<OsString>) -> Vec<String> {
        args.into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn pull_copies_directory_contents() {
        let args = HostSync::pull_args("deploy@staging:/var/www/files", Path::new("/tmp/backup_1/files"));
        assert_eq!(
            strings(args),
            vec!["-az", "-e", "ssh", "deploy@staging:/var/www/files/", "/tmp/backup_1/files/"]
        );
    }

    #[test]
    fn push_deletes_extraneous_and_normalizes_modes() {
        let args = strings(HostSync::push_args(
            Path::new("/tmp/restore_1/files/"),
            "deploy@prod:/var/www/files/",
        ));
        assert!(args.contains(&"--delete".to_string()));
        assert!(args.contains(&"--chmod=ugo=rwX".to_string()));
        assert_eq!(args[args.len() - 2], "/tmp/restore_1/files/");
        assert_eq!(args[args.len() - 1], "deploy@prod:/var/www/files/");
    }

    #[tokio::test]
    async fn failing_command_is_reported() {
        let local = TempDir::new().unwrap();
        let sync = HostSync::with_program(PathBuf::from("false"), CancellationToken::new());
        let err = sync.push(local.path(), "nobody@nowhere:/x").await.unwrap_err();
        assert!(matches!(err, AppError::Command { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn cancelled_sync_does_not_run() {
        let local = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let sync = HostSync::with_program(PathBuf::from("true"), cancel);
        let err = sync.pull("nobody@nowhere:/x", local.path()).await.unwrap_err();
        assert!(matches!(err, AppError::Cancelled(_)), "{err:?}");
    }

    #[tokio::test]
    async fn push_requires_local_directory() {
        let local = TempDir::new().unwrap();
        let err = HostSync::new(CancellationToken::new())
            .push(&local.path().join("missing"), "h:/x")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Storage(_)));
    }
}
