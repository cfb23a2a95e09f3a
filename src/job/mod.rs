//! The job abstraction: the user-defined unit of work.
//!
//! A [`Job`] is durable and retryable. It is reconstructed from storage for
//! every attempt, so implementations must not assume shared mutable state
//! between attempts. Cancellation is cooperative: the body should poll
//! [`JobContext::is_canceled`] at safe points and bail out early.

mod parameters;

pub use parameters::{
    DEFAULT_MAX_BACKOFF_MS, PRIORITY_DEFAULT, PRIORITY_HIGH, PRIORITY_LOW, Parameters,
    ParametersBuilder,
};

use crate::data::Data;
use crate::id::generate_job_id;
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Shared cancellation flag, settable from any thread.
///
/// Setting the flag does not interrupt a running job; it becomes visible to
/// the job body and to the post-run failure path, which forces a failure
/// outcome once `run()` returns regardless of the returned result.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Per-attempt execution context handed to [`Job::run`].
#[derive(Debug, Clone)]
pub struct JobContext {
    /// Number of attempts before this one (0 on the first run).
    pub run_attempt: u32,
    cancellation: CancellationFlag,
}

impl JobContext {
    pub fn new(run_attempt: u32, cancellation: CancellationFlag) -> Self {
        Self { run_attempt, cancellation }
    }

    pub fn is_canceled(&self) -> bool {
        self.cancellation.is_set()
    }
}

/// Outcome of a single execution attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum JobResult {
    /// Terminal. Output data, if any, becomes the input of direct dependents.
    Success { output: Option<Data> },
    /// Non-terminal; rescheduled with exponential backoff unless attempts are
    /// exhausted, in which case the runner escalates to failure.
    Retry,
    /// Terminal; cascades failure to every transitive dependent.
    Failure,
    /// Terminal failure that additionally crashes the process once
    /// bookkeeping completes. For unrecoverable programming errors only.
    Fatal { message: String },
}

impl JobResult {
    pub fn success() -> Self {
        JobResult::Success { output: None }
    }

    pub fn success_with_output(output: Data) -> Self {
        JobResult::Success { output: Some(output) }
    }

    pub fn retry() -> Self {
        JobResult::Retry
    }

    pub fn failure() -> Self {
        JobResult::Failure
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        JobResult::Fatal { message: message.into() }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, JobResult::Success { .. })
    }
}

/// A durable, retryable unit of work.
///
/// Implementations are registered under a factory key at manager construction
/// time; the key plus [`Job::serialize`] output must be enough to reconstruct
/// behavior after a process restart.
#[async_trait]
pub trait Job: Send + Sync {
    /// Key under which this job's factory is registered.
    fn factory_key(&self) -> &'static str;

    /// The submission-time configuration. Immutable once built.
    fn parameters(&self) -> Parameters;

    /// Capture everything needed to reconstruct this job. Called once per
    /// submission; retries reconstruct from the data already in storage.
    fn serialize(&self) -> Data;

    /// Execute one attempt on a worker. May be invoked many times across
    /// retries. Should poll `ctx.is_canceled()` at safe points.
    async fn run(&mut self, ctx: &JobContext) -> JobResult;

    /// Fires once at submission, synchronously, before the job can ever run.
    /// Useful for optimistic side effects that must happen regardless of
    /// whether the job executes.
    fn on_added(&self) {}

    /// Fires after the controller accepts a retry, before the next attempt.
    fn on_retry(&self) {}

    /// Fires once the job (or the whole chain from it forward) is terminally
    /// abandoned, whether by its own failure, an upstream failure, expiry, or
    /// cancellation.
    fn on_failure(&self) {}
}

/// A job paired with its pre-assigned id, en route to the controller.
pub struct PendingJob {
    pub id: String,
    pub parameters: Parameters,
    pub job: Box<dyn Job>,
}

impl PendingJob {
    pub fn new(job: Box<dyn Job>) -> Self {
        Self {
            id: generate_job_id(),
            parameters: job.parameters(),
            job,
        }
    }
}

impl std::fmt::Debug for PendingJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingJob")
            .field("id", &self.id)
            .field("factory_key", &self.job.factory_key())
            .finish()
    }
}
