// envbackup/src/database/process.rs
use async_trait::async_trait;
use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};
use which::which;

use super::{DatabaseJobService, JobHandle, JobKind, JobRequest, JobStatus};
use crate::errors::{AppError, Result};

const STDERR_TAIL_LINES: usize = 20;

struct RunningJob {
    child: Child,
    program: String,
    stderr_log: PathBuf,
}

/// Runs `pg_dump` / `psql` as child processes and tracks them as jobs.
pub struct ProcessJobService {
    log_dir: PathBuf,
    next_id: AtomicU64,
    jobs: Mutex<HashMap<u64, RunningJob>>,
}

impl ProcessJobService {
    /// Job stderr is captured as `<log_dir>/job_<id>.log`.
    pub fn new(log_dir: PathBuf) -> Self {
        Self {
            log_dir,
            next_id: AtomicU64::new(1),
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// Program name and arguments for a request.
    pub fn command_line(request: &JobRequest) -> (&'static str, Vec<OsString>) {
        match request.kind {
            JobKind::Export => (
                "pg_dump",
                vec![
                    "--clean".into(),
                    "--if-exists".into(),
                    "--no-owner".into(),
                    "--no-acl".into(),
                    "--format=plain".into(),
                    "-f".into(),
                    request.dump_path.clone().into_os_string(),
                    request.connection_url.clone().into(),
                ],
            ),
            JobKind::Import => (
                "psql",
                vec![
                    "-X".into(), // Do not read psqlrc
                    "-q".into(),
                    "-v".into(),
                    "ON_ERROR_STOP=1".into(),
                    "-d".into(),
                    request.connection_url.clone().into(),
                    "-f".into(),
                    request.dump_path.clone().into_os_string(),
                ],
            ),
        }
    }

    /// Spawns `program` and registers it as a running job.
    pub async fn spawn(
        &self,
        program: &Path,
        args: Vec<OsString>,
        description: String,
    ) -> Result<JobHandle> {
        tokio::fs::create_dir_all(&self.log_dir).await?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let stderr_log = self.log_dir.join(format!("job_{}.log", id));
        let stderr_file = std::fs::File::create(&stderr_log)?;

        let child = Command::new(program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(stderr_file))
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AppError::Command {
                program: program.display().to_string(),
                stderr: format!("failed to start: {}", e),
            })?;

        debug!(id, job = %description, pid = ?child.id(), "Job process started");
        self.lock_jobs()?.insert(
            id,
            RunningJob {
                child,
                program: program.display().to_string(),
                stderr_log,
            },
        );
        Ok(JobHandle { id, description })
    }

    fn lock_jobs(&self) -> Result<std::sync::MutexGuard<'_, HashMap<u64, RunningJob>>> {
        self.jobs
            .lock()
            .map_err(|_| AppError::RemoteOperation {
                operation: "job registry".to_string(),
                message: "job table lock poisoned".to_string(),
            })
    }
}

fn find_executable(name: &str) -> Result<PathBuf> {
    which(name).map_err(|_| {
        AppError::Config(format!(
            "{} executable not found in PATH. Please ensure PostgreSQL client tools are installed and in your PATH.",
            name
        ))
    })
}

async fn stderr_tail(path: &Path) -> String {
    match tokio::fs::read(path).await {
        Ok(bytes) => {
            let text = String::from_utf8_lossy(&bytes);
            let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
            let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
            lines[start..].join("\n")
        }
        Err(e) => format!("(stderr log unavailable: {})", e),
    }
}

#[async_trait]
impl DatabaseJobService for ProcessJobService {
    async fn start(&self, request: JobRequest) -> Result<JobHandle> {
        let (program, args) = Self::command_line(&request);
        let program_path = find_executable(program)?;
        info!(
            kind = %request.kind,
            database = %request.db_name,
            dump = %request.dump_path.display(),
            "Starting {} with {}",
            request.kind,
            program_path.display()
        );
        self.spawn(
            &program_path,
            args,
            format!("{} {}", request.kind, request.db_name),
        )
        .await
    }

    async fn poll(&self, handle: &JobHandle) -> Result<JobStatus> {
        let finished: Option<(ExitStatus, RunningJob)> = {
            let mut jobs = self.lock_jobs()?;
            let job = jobs.get_mut(&handle.id).ok_or_else(|| AppError::RemoteOperation {
                operation: handle.description.clone(),
                message: "unknown job".to_string(),
            })?;
            match job.child.try_wait()? {
                None => None,
                Some(status) => jobs.remove(&handle.id).map(|job| (status, job)),
            }
        };

        let Some((status, job)) = finished else {
            return Ok(JobStatus::Running);
        };
        if status.success() {
            debug!(job = %handle.description, "Job process exited cleanly");
            return Ok(JobStatus::Succeeded);
        }
        let tail = stderr_tail(&job.stderr_log).await;
        Ok(JobStatus::Failed(format!(
            "{} exited with {}: {}",
            job.program, status, tail
        )))
    }

    async fn abort(&self, handle: &JobHandle) -> Result<()> {
        let job = self.lock_jobs()?.remove(&handle.id);
        let Some(mut job) = job else {
            return Ok(());
        };
        if let Err(e) = job.child.kill().await {
            warn!(job = %handle.description, error = %e, "Failed to kill job process");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn poll_until_terminal(service: &ProcessJobService, handle: &JobHandle) -> JobStatus {
        for _ in 0..500 {
            let status = service.poll(handle).await.unwrap();
            if status != JobStatus::Running {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job never finished");
    }

    fn sh(script: &str) -> Vec<OsString> {
        vec!["-c".into(), script.into()]
    }

    #[test]
    fn export_command_line() {
        let request = JobRequest {
            kind: JobKind::Export,
            db_name: "staging_db".into(),
            connection_url: "postgres://h/staging_db".into(),
            dump_path: PathBuf::from("/tmp/backup_1/db_dump.sql"),
        };
        let (program, args) = ProcessJobService::command_line(&request);
        assert_eq!(program, "pg_dump");
        assert!(args.contains(&OsString::from("--clean")));
        assert!(args.contains(&OsString::from("--no-owner")));
        assert_eq!(args.last().unwrap(), "postgres://h/staging_db");
    }

    #[test]
    fn import_command_line_stops_on_error() {
        let request = JobRequest {
            kind: JobKind::Import,
            db_name: "production_db".into(),
            connection_url: "postgres://h/production_db".into(),
            dump_path: PathBuf::from("/tmp/restore_1/db_dump.sql"),
        };
        let (program, args) = ProcessJobService::command_line(&request);
        assert_eq!(program, "psql");
        let joined: Vec<String> = args.iter().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(
            joined,
            vec![
                "-X",
                "-q",
                "-v",
                "ON_ERROR_STOP=1",
                "-d",
                "postgres://h/production_db",
                "-f",
                "/tmp/restore_1/db_dump.sql"
            ]
        );
    }

    #[tokio::test]
    async fn successful_process_reports_succeeded() {
        let logs = TempDir::new().unwrap();
        let service = ProcessJobService::new(logs.path().to_path_buf());
        let handle = service
            .spawn(Path::new("sh"), sh("exit 0"), "ok".into())
            .await
            .unwrap();
        assert_eq!(poll_until_terminal(&service, &handle).await, JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn failed_process_includes_stderr_tail() {
        let logs = TempDir::new().unwrap();
        let service = ProcessJobService::new(logs.path().to_path_buf());
        let handle = service
            .spawn(
                Path::new("sh"),
                sh("echo 'relation \"users\" does not exist' >&2; exit 3"),
                "import production_db".into(),
            )
            .await
            .unwrap();
        match poll_until_terminal(&service, &handle).await {
            JobStatus::Failed(message) => {
                assert!(message.contains("does not exist"), "{message}");
            }
            other => panic!("unexpected status {other:?}"),
        }
        // finished jobs are forgotten
        assert!(service.poll(&handle).await.is_err());
    }

    #[tokio::test]
    async fn abort_kills_running_process() {
        let logs = TempDir::new().unwrap();
        let service = ProcessJobService::new(logs.path().to_path_buf());
        let handle = service
            .spawn(Path::new("sh"), sh("sleep 30"), "export slow".into())
            .await
            .unwrap();
        assert_eq!(service.poll(&handle).await.unwrap(), JobStatus::Running);
        service.abort(&handle).await.unwrap();
        // aborting twice is fine
        service.abort(&handle).await.unwrap();
    }
}
