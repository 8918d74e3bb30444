//! Database export/import as asynchronous jobs.
//!
//! A [`DatabaseJobService`] starts a long-running export or import and hands
//! back a [`JobHandle`]; callers drive it to a terminal state with
//! [`poll::wait_for_job`].

pub mod poll;
pub mod process;
pub mod reconcile;
pub mod target;

use async_trait::async_trait;
use std::fmt;
use std::path::PathBuf;
use url::Url;

use crate::errors::{AppError, Result};

pub use poll::wait_for_job;
pub use process::ProcessJobService;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Export,
    Import,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::Export => f.write_str("export"),
            JobKind::Import => f.write_str("import"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobRequest {
    pub kind: JobKind,
    pub db_name: String,
    pub connection_url: String,
    pub dump_path: PathBuf,
}

/// Opaque reference to a started job.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobHandle {
    pub id: u64,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Running,
    Succeeded,
    Failed(String),
}

#[async_trait]
pub trait DatabaseJobService: Send + Sync {
    async fn start(&self, request: JobRequest) -> Result<JobHandle>;

    async fn poll(&self, handle: &JobHandle) -> Result<JobStatus>;

    /// Best effort; a job that already finished is not an error.
    async fn abort(&self, handle: &JobHandle) -> Result<()>;
}

/// Builds `<instance_ref>/<db_name>`, replacing any database already in the path.
pub fn connection_url(instance_ref: &str, db_name: &str) -> Result<String> {
    if db_name.trim().is_empty() {
        return Err(AppError::Config("database name must not be empty".to_string()));
    }
    let mut url = Url::parse(instance_ref)?;
    url.set_path(&format!("/{}", db_name));
    Ok(url.to_string())
}
