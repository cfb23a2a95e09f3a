//! Persisted spec records: the durable shadow of runtime jobs.
//!
//! A `JobSpec` row is created at submission, mutated across retries, and
//! deleted on any terminal outcome. Constraint and dependency rows have no
//! independent lifecycle; they are created and deleted with their owning job.

use crate::job::Parameters;
use serde::{Deserialize, Serialize};

/// Persisted record of one job instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Unique id, assigned at enqueue time.
    pub id: String,
    /// Selects which job subtype to reconstruct.
    pub factory_key: String,
    /// Jobs sharing a queue run strictly in creation order.
    pub queue_key: Option<String>,
    /// Epoch ms.
    pub create_time: i64,
    /// Job is not eligible before this time. Non-decreasing across retries.
    pub next_run_attempt_time: i64,
    /// Attempts so far.
    pub run_attempt: u32,
    /// `None` means unlimited.
    pub max_attempts: Option<u32>,
    pub max_backoff_ms: u64,
    /// `None` means immortal.
    pub lifespan_ms: Option<u64>,
    /// `None` means unlimited.
    pub max_instances: Option<u32>,
    /// Opaque payload produced by `Job::serialize`.
    pub serialized_data: Vec<u8>,
    pub is_running: bool,
    /// Never written to durable storage; lost on process restart.
    pub is_memory_only: bool,
    pub priority: i32,
}

impl JobSpec {
    /// Build the spec for a freshly submitted job.
    pub fn from_parameters(id: &str, params: &Parameters, serialized_data: Vec<u8>) -> Self {
        Self {
            id: id.to_string(),
            factory_key: String::new(),
            queue_key: params.queue.clone(),
            create_time: params.create_time,
            next_run_attempt_time: params.create_time,
            run_attempt: 0,
            max_attempts: params.max_attempts,
            max_backoff_ms: params.max_backoff_ms,
            lifespan_ms: params.lifespan_ms,
            max_instances: params.max_instances,
            serialized_data,
            is_running: false,
            is_memory_only: params.memory_only,
            priority: params.priority,
        }
    }

    /// Recover the submission-time parameters (constraints live in their own
    /// rows and are attached by the caller).
    pub fn to_parameters(&self, constraint_keys: Vec<String>) -> Parameters {
        Parameters {
            queue: self.queue_key.clone(),
            constraint_keys,
            max_attempts: self.max_attempts,
            max_backoff_ms: self.max_backoff_ms,
            lifespan_ms: self.lifespan_ms,
            max_instances: self.max_instances,
            memory_only: self.is_memory_only,
            priority: self.priority,
            create_time: self.create_time,
        }
    }

    /// Whether the lifespan has elapsed at `now`.
    pub fn is_expired(&self, now: i64) -> bool {
        match self.lifespan_ms {
            Some(lifespan) => now - self.create_time > lifespan as i64,
            None => false,
        }
    }

    /// Whether `run_attempt` attempts have exhausted the budget.
    pub fn attempts_exhausted(&self, attempts_run: u32) -> bool {
        match self.max_attempts {
            Some(max) => attempts_run >= max,
            None => false,
        }
    }
}

/// Row linking a job to a constraint factory key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstraintSpec {
    pub job_id: String,
    pub factory_key: String,
}

/// Directed edge: `job_id` cannot run until `depends_on_job_id` is gone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencySpec {
    pub job_id: String,
    pub depends_on_job_id: String,
}

/// One job spec bundled with its constraint and dependency rows, inserted as
/// a unit.
#[derive(Debug, Clone, PartialEq)]
pub struct FullSpec {
    pub job_spec: JobSpec,
    pub constraint_specs: Vec<ConstraintSpec>,
    pub dependency_specs: Vec<DependencySpec>,
}

impl FullSpec {
    pub fn new(
        job_spec: JobSpec,
        constraint_specs: Vec<ConstraintSpec>,
        dependency_specs: Vec<DependencySpec>,
    ) -> Self {
        Self { job_spec, constraint_specs, dependency_specs }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(id: &str) -> JobSpec {
        JobSpec {
            id: id.to_string(),
            factory_key: "TestJob".to_string(),
            queue_key: None,
            create_time: 1_000,
            next_run_attempt_time: 1_000,
            run_attempt: 0,
            max_attempts: Some(3),
            max_backoff_ms: 10_000,
            lifespan_ms: None,
            max_instances: None,
            serialized_data: Vec::new(),
            is_running: false,
            is_memory_only: false,
            priority: 0,
        }
    }

    #[test]
    fn test_from_parameters_carries_config() {
        let params = Parameters::builder()
            .queue("q1")
            .add_constraint("NetworkConstraint")
            .max_attempts(Some(5))
            .lifespan_ms(Some(1_000))
            .build();

        let job_spec = JobSpec::from_parameters("id1", &params, vec![1, 2, 3]);
        assert_eq!(job_spec.id, "id1");
        assert_eq!(job_spec.queue_key.as_deref(), Some("q1"));
        assert_eq!(job_spec.max_attempts, Some(5));
        assert_eq!(job_spec.lifespan_ms, Some(1_000));
        assert_eq!(job_spec.serialized_data, vec![1, 2, 3]);
        assert_eq!(job_spec.create_time, params.create_time);
        assert_eq!(job_spec.next_run_attempt_time, params.create_time);
        assert!(!job_spec.is_running);
        assert_eq!(job_spec.run_attempt, 0);
    }

    #[test]
    fn test_parameters_round_trip() {
        let params = Parameters::builder()
            .queue("q1")
            .add_constraint("NetworkConstraint")
            .max_attempts(None)
            .max_instances(Some(4))
            .build();

        let job_spec = JobSpec::from_parameters("id1", &params, Vec::new());
        let restored = job_spec.to_parameters(vec!["NetworkConstraint".to_string()]);
        assert_eq!(restored, params);
    }

    #[test]
    fn test_is_expired() {
        let mut s = spec("id1");
        assert!(!s.is_expired(i64::MAX), "immortal jobs never expire");

        s.lifespan_ms = Some(500);
        assert!(!s.is_expired(1_500));
        assert!(s.is_expired(1_501));
    }

    #[test]
    fn test_attempts_exhausted() {
        let mut s = spec("id1");
        assert!(!s.attempts_exhausted(2));
        assert!(s.attempts_exhausted(3));

        s.max_attempts = None;
        assert!(!s.attempts_exhausted(u32::MAX));
    }

    #[test]
    fn test_spec_serialization_round_trip() {
        let s = spec("id1");
        let json = serde_json::to_string(&s).unwrap();
        let restored: JobSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(s, restored);
    }
}
