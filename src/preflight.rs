//! Checks that a host can run backups before the first real run.

use std::collections::BTreeSet;
use tracing::{info, warn};

use crate::config::{AppConfig, FileTransportKind};
use crate::storage::ObjectStore;

/// Executables the configured backends shell out to.
pub fn required_tools(file_transport: FileTransportKind) -> Vec<&'static str> {
    let mut tools = vec!["pg_dump", "psql"];
    if file_transport == FileTransportKind::HostSync {
        tools.extend(["rsync", "ssh"]);
    }
    tools
}

/// Runs every check and returns all problems found. Nothing is modified.
pub async fn run_checks<F>(config: &AppConfig, store: &dyn ObjectStore, tool_exists: F) -> Vec<String>
where
    F: Fn(&str) -> bool,
{
    let mut problems = Vec::new();

    for tool in required_tools(config.file_transport) {
        if tool_exists(tool) {
            info!(tool, "✓ Found executable");
        } else {
            warn!(tool, "Executable not found in PATH");
            problems.push(format!("{} executable not found in PATH", tool));
        }
    }

    let buckets: BTreeSet<&str> = config
        .registry
        .iter()
        .map(|(_, env)| env.backup_bucket.as_str())
        .collect();
    for bucket in buckets {
        if let Err(e) = store.probe(bucket).await {
            warn!(bucket, error = %e, "Backup bucket is not reachable");
            problems.push(format!("backup bucket {}: {}", bucket, e));
        }
    }

    problems
}

/// `which`-based lookup used by the binary.
pub fn on_path(tool: &str) -> bool {
    which::which(tool).is_ok()
}
