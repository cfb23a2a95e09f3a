//! Submission-time configuration for a job.
//!
//! `Parameters` are immutable once built. The controller persists them into a
//! `JobSpec` and reconstructs them from storage on every attempt; a job never
//! sees its parameters change mid-flight.

use crate::id::now_ms;
use serde::{Deserialize, Serialize};

/// Default cap on retry backoff: one minute.
pub const DEFAULT_MAX_BACKOFF_MS: u64 = 60_000;

/// Higher values are pulled for execution first.
pub const PRIORITY_HIGH: i32 = 1;
pub const PRIORITY_DEFAULT: i32 = 0;
pub const PRIORITY_LOW: i32 = -1;

/// Immutable configuration a job declares at submission time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameters {
    /// Jobs sharing a queue run strictly in creation order, one at a time.
    pub queue: Option<String>,
    /// Constraint factory keys gating eligibility.
    pub constraint_keys: Vec<String>,
    /// Attempts before terminal failure; `None` means unlimited.
    pub max_attempts: Option<u32>,
    /// Upper bound on exponential retry backoff.
    pub max_backoff_ms: u64,
    /// Max milliseconds from creation before forced failure; `None` means immortal.
    pub lifespan_ms: Option<u64>,
    /// Cap on concurrently-pending instances sharing a factory key; `None` means unlimited.
    pub max_instances: Option<u32>,
    /// Memory-only jobs are never written to durable storage and are lost on restart.
    pub memory_only: bool,
    pub priority: i32,
    /// Creation timestamp, epoch ms. Set when the builder is created.
    pub create_time: i64,
}

impl Default for Parameters {
    fn default() -> Self {
        ParametersBuilder::new().build()
    }
}

impl Parameters {
    pub fn builder() -> ParametersBuilder {
        ParametersBuilder::new()
    }
}

/// Builder for [`Parameters`].
#[derive(Debug, Clone)]
pub struct ParametersBuilder {
    inner: Parameters,
}

impl ParametersBuilder {
    pub fn new() -> Self {
        Self {
            inner: Parameters {
                queue: None,
                constraint_keys: Vec::new(),
                max_attempts: Some(1),
                max_backoff_ms: DEFAULT_MAX_BACKOFF_MS,
                lifespan_ms: None,
                max_instances: None,
                memory_only: false,
                priority: PRIORITY_DEFAULT,
                create_time: now_ms(),
            },
        }
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.inner.queue = Some(queue.into());
        self
    }

    pub fn add_constraint(mut self, factory_key: impl Into<String>) -> Self {
        self.inner.constraint_keys.push(factory_key.into());
        self
    }

    /// `None` means retry forever.
    pub fn max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.inner.max_attempts = max_attempts;
        self
    }

    pub fn max_backoff_ms(mut self, max_backoff_ms: u64) -> Self {
        self.inner.max_backoff_ms = max_backoff_ms;
        self
    }

    /// `None` means the job never expires.
    pub fn lifespan_ms(mut self, lifespan_ms: Option<u64>) -> Self {
        self.inner.lifespan_ms = lifespan_ms;
        self
    }

    /// `None` means no instance cap. Only enforced for solo submissions.
    pub fn max_instances(mut self, max_instances: Option<u32>) -> Self {
        self.inner.max_instances = max_instances;
        self
    }

    pub fn memory_only(mut self, memory_only: bool) -> Self {
        self.inner.memory_only = memory_only;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.inner.priority = priority;
        self
    }

    pub fn build(self) -> Parameters {
        self.inner
    }
}

impl Default for ParametersBuilder {
    fn default() -> Self {
        Self::new()
    }
}
