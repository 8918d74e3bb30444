use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{DatabaseJobService, JobHandle, JobStatus};
use crate::config::PollingConfig;
use crate::errors::{AppError, Result};

/// Polls `handle` until it reaches a terminal state.
///
/// Sleeps between polls with capped exponential backoff. When the deadline
/// passes or `cancel` fires, the job is asked to abort before returning.
pub async fn wait_for_job(
    service: &dyn DatabaseJobService,
    handle: &JobHandle,
    policy: &PollingConfig,
    cancel: &CancellationToken,
) -> Result<()> {
    let started = Instant::now();
    let mut interval = policy.initial_interval;

    loop {
        let status = match service.poll(handle).await {
            Ok(status) => status,
            Err(e) => {
                abort_quietly(service, handle).await;
                return Err(e);
            }
        };

        match status {
            JobStatus::Succeeded => return Ok(()),
            JobStatus::Failed(message) => {
                return Err(AppError::RemoteOperation {
                    operation: handle.description.clone(),
                    message,
                });
            }
            JobStatus::Running => {}
        }

        let mut sleep_for = interval;
        if let Some(deadline) = policy.deadline {
            let elapsed = started.elapsed();
            if elapsed >= deadline {
                warn!(job = %handle.description, ?elapsed, "Job exceeded its deadline, aborting");
                abort_quietly(service, handle).await;
                return Err(AppError::RemoteTimeout {
                    operation: handle.description.clone(),
                    waited: elapsed,
                });
            }
            sleep_for = sleep_for.min(deadline - elapsed);
        }

        debug!(job = %handle.description, wait_ms = sleep_for.as_millis() as u64, "Job still running");
        tokio::select! {
            _ = cancel.cancelled() => {
                warn!(job = %handle.description, "Cancellation requested, aborting job");
                abort_quietly(service, handle).await;
                return Err(AppError::Cancelled(handle.description.clone()));
            }
            _ = tokio::time::sleep(sleep_for) => {}
        }

        interval = next_interval(interval, policy);
    }
}

fn next_interval(current: Duration, policy: &PollingConfig) -> Duration {
    let grown = current.as_secs_f64() * policy.multiplier.max(1.0);
    Duration::from_secs_f64(grown.min(policy.max_interval.as_secs_f64()))
}

async fn abort_quietly(service: &dyn DatabaseJobService, handle: &JobHandle) {
    if let Err(e) = service.abort(handle).await {
        warn!(job = %handle.description, error = %e, "Failed to abort job");
    }
}
