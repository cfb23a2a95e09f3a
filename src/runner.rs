//! Worker loop: pull, execute, report, repeat.
//!
//! Runners hold no scheduling state of their own. All coordination lives in
//! the controller; a runner just executes whatever it is handed and reports
//! the outcome. Panics inside a job body are caught and converted to terminal
//! failures so one bad job cannot take a worker down.

use crate::controller::{ActiveJob, JobController};
use crate::id::now_ms;
use crate::job::{JobContext, JobResult};
use crate::store::JobStorage;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Spawn one runner task. Runners never exit on their own.
pub fn spawn<S: JobStorage + 'static>(
    runner_id: usize,
    controller: Arc<JobController<S>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::debug!(runner_id, "Runner started");
        loop {
            let mut active = match controller.pull_next_eligible().await {
                Ok(active) => active,
                Err(e) => {
                    tracing::error!(runner_id, error = %e, "Failed to pull a job");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };
            let result = execute(runner_id, &mut active).await;
            if let Err(e) = report(&controller, &active, result).await {
                tracing::error!(
                    runner_id,
                    job_id = %active.spec.id,
                    error = %e,
                    "Failed to report job outcome"
                );
            }
        }
    })
}

/// Run one attempt and normalize the outcome: expiry, panics, cancellation,
/// and attempt exhaustion all collapse into the four `JobResult` variants.
async fn execute(runner_id: usize, active: &mut ActiveJob) -> JobResult {
    if active.spec.is_expired(now_ms()) {
        tracing::warn!(
            runner_id,
            job_id = %active.spec.id,
            lifespan_ms = active.spec.lifespan_ms,
            "Job exceeded its lifespan, failing without running"
        );
        return JobResult::Failure;
    }

    let ctx = JobContext::new(active.spec.run_attempt, active.cancellation.clone());
    let mut result = match AssertUnwindSafe(active.job.run(&ctx)).catch_unwind().await {
        Ok(result) => result,
        Err(_) => {
            tracing::error!(runner_id, job_id = %active.spec.id, "Job panicked");
            JobResult::Failure
        }
    };

    if active.cancellation.is_set() {
        tracing::info!(runner_id, job_id = %active.spec.id, "Job was canceled while running");
        result = JobResult::Failure;
    } else if result == JobResult::Retry
        && active.spec.attempts_exhausted(active.spec.run_attempt + 1)
    {
        tracing::warn!(
            runner_id,
            job_id = %active.spec.id,
            max_attempts = active.spec.max_attempts,
            "Job exhausted its attempts"
        );
        result = JobResult::Failure;
    }
    result
}

async fn report<S: JobStorage>(
    controller: &JobController<S>,
    active: &ActiveJob,
    result: JobResult,
) -> crate::error::Result<()> {
    match result {
        JobResult::Success { output } => {
            controller.on_success(&active.spec.id, output).await?;
        }
        JobResult::Retry => {
            controller.on_retry(active).await?;
        }
        JobResult::Failure => {
            let dependents = controller.on_failure(&active.spec.id).await?;
            active.job.on_failure();
            for dependent in &dependents {
                dependent.on_failure();
            }
        }
        JobResult::Fatal { message } => {
            let dependents = controller.on_failure(&active.spec.id).await?;
            active.job.on_failure();
            for dependent in &dependents {
                dependent.on_failure();
            }
            // The job declared the process unsound. A panic here would be
            // swallowed by the runtime along with this task, so abort once
            // the failure is durably recorded.
            tracing::error!(job_id = %active.spec.id, message = %message, "Fatal job result, aborting");
            std::process::abort();
        }
    }
    Ok(())
}
