//! Storage layer: durable job specs with an in-memory working set.
//!
//! The controller is the sole caller of this module and always holds its own
//! lock while doing so, so implementations are synchronous and need no
//! interior locking. [`SqliteJobStore`] keeps every spec in memory for reads
//! and mirrors non-memory-only mutations into SQLite for crash recovery.

mod records;
mod sqlite_store;

pub use records::{ConstraintSpec, DependencySpec, FullSpec, JobSpec};
pub use sqlite_store::SqliteJobStore;

use crate::error::Result;

/// Persistence contract for job, constraint, and dependency specs.
///
/// Eligibility ordering and dependency traversal live here rather than in the
/// controller so an implementation can push them down into its query layer.
pub trait JobStorage: Send {
    /// Load durable state and reset any `is_running` flags left over from a
    /// previous process (those attempts died with it).
    fn init(&mut self) -> Result<()>;

    /// Insert a batch of specs atomically, in order.
    fn insert_jobs(&mut self, full_specs: Vec<FullSpec>) -> Result<()>;

    fn get_job_spec(&self, id: &str) -> Option<&JobSpec>;

    fn get_all_job_specs(&self) -> Vec<JobSpec>;

    /// Jobs that are not running, are past `next_run_attempt_time`, and have
    /// no dependencies and no earlier unfinished job in their queue. Sorted by
    /// priority descending, then create time ascending, then insertion order.
    fn get_pending_jobs_with_no_dependencies(&self, now: i64) -> Vec<JobSpec>;

    fn get_jobs_in_queue(&self, queue_key: &str) -> Vec<JobSpec>;

    /// Count of jobs sharing a factory key, running or not.
    fn get_job_instance_count(&self, factory_key: &str) -> usize;

    fn mark_job_as_running(&mut self, id: &str) -> Result<()>;

    /// Record a failed attempt: bump the attempt count, set the next eligible
    /// time, replace the serialized payload, and clear the running flag.
    fn update_job_after_retry(
        &mut self,
        id: &str,
        run_attempt: u32,
        next_run_attempt_time: i64,
        serialized_data: Vec<u8>,
    ) -> Result<()>;

    /// Apply an arbitrary rewrite to every job spec, persisting those that
    /// change. Used for input-data updates and dependent-data propagation.
    fn transform_jobs(&mut self, transform: &mut dyn FnMut(&JobSpec) -> Option<JobSpec>)
    -> Result<()>;

    /// Delete the named jobs along with their constraint and dependency rows,
    /// including dependency edges pointing at them from survivors.
    fn delete_jobs(&mut self, ids: &[String]) -> Result<()>;

    fn get_constraint_specs(&self, job_id: &str) -> Vec<ConstraintSpec>;

    fn get_all_constraint_specs(&self) -> Vec<ConstraintSpec>;

    /// Every dependency edge whose target is `id`, directly or through a
    /// chain of intermediate jobs. The transitive closure is what failure
    /// cascades operate on.
    fn get_dependency_specs_that_depend_on_job(&self, id: &str) -> Vec<DependencySpec>;

    fn get_all_dependency_specs(&self) -> Vec<DependencySpec>;

    fn get_meta(&self, key: &str) -> Result<Option<String>>;

    fn set_meta(&mut self, key: &str, value: &str) -> Result<()>;
}
