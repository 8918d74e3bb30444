use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// A pipeline step, named the way it shows up in logs and wrapped errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    PrepareWorkspace,
    ExportDatabase,
    DownloadFolder,
    CreateArchive,
    UploadArchive,
    DownloadArchive,
    ExtractArchive,
    ImportDatabase,
    UploadFolder,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Step::PrepareWorkspace => "PrepareWorkspace",
            Step::ExportDatabase => "ExportDatabase",
            Step::DownloadFolder => "DownloadFolder",
            Step::CreateArchive => "CreateArchive",
            Step::UploadArchive => "UploadArchive",
            Step::DownloadArchive => "DownloadArchive",
            Step::ExtractArchive => "ExtractArchive",
            Step::ImportDatabase => "ImportDatabase",
            Step::UploadFolder => "UploadFolder",
        };
        f.write_str(name)
    }
}

/// One failed job inside a bulk transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferFailure {
    pub job: String,
    pub reason: String,
}

impl fmt::Display for TransferFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.job, self.reason)
    }
}

fn list_failures(failures: &[TransferFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("URL parsing error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("Storage operation failed: {0}")]
    Storage(String),

    #[error("{} of {total} transfers failed: {}", .failures.len(), list_failures(.failures))]
    Transfer {
        total: usize,
        failures: Vec<TransferFailure>,
    },

    #[error("Remote operation {operation} failed: {message}")]
    RemoteOperation { operation: String, message: String },

    #[error("Remote operation {operation} did not reach a terminal state within {waited:?}")]
    RemoteTimeout { operation: String, waited: Duration },

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Archive entry escapes the extraction root: {0}")]
    UnsafeArchiveEntry(String),

    #[error("Command `{program}` failed: {stderr}")]
    Command { program: String, stderr: String },

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("{step} failed: {source}")]
    Step {
        step: Step,
        #[source]
        source: Box<AppError>,
    },
}

impl AppError {
    /// Wraps `self` with the pipeline step that produced it.
    pub fn at(self, step: Step) -> Self {
        AppError::Step {
            step,
            source: Box::new(self),
        }
    }

    /// The failing step for a wrapped error.
    pub fn step(&self) -> Option<Step> {
        match self {
            AppError::Step { step, .. } => Some(*step),
            _ => None,
        }
    }

    /// Strips step wrappers and returns the innermost error.
    pub fn root(&self) -> &AppError {
        match self {
            AppError::Step { source, .. } => source.root(),
            other => other,
        }
    }
}

impl From<walkdir::Error> for AppError {
    fn from(err: walkdir::Error) -> Self {
        match err.into_io_error() {
            Some(io) => AppError::Io(io),
            None => AppError::Storage("directory walk hit a filesystem loop".to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
