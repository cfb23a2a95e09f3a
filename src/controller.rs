//! The controller: sole owner of job state transitions.
//!
//! Every mutation of storage and of the running set happens under the
//! controller's one lock, which is what makes the scheduler's invariants
//! (queue serialization, dependency ordering, single execution per job) hold
//! without any cooperation from callers. Runners block in
//! [`JobController::pull_next_eligible`]; everyone else pokes the shared
//! wake-up signal after changing state.

use crate::data::{Data, DataSerializer};
use crate::error::Result;
use crate::id::now_ms;
use crate::job::{CancellationFlag, Job, PendingJob};
use crate::migrator::JobMigrator;
use crate::registry::{ConstraintRegistry, JobRegistry};
use crate::scheduler::{Debouncer, Scheduler};
use crate::store::{ConstraintSpec, DependencySpec, FullSpec, JobSpec, JobStorage};
use crate::tracker::{JobInfo, JobState, JobTracker};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

/// A job checked out for execution. Exists only between a successful pull and
/// the runner's terminal report back to the controller.
pub struct ActiveJob {
    pub spec: JobSpec,
    pub job: Box<dyn Job>,
    pub cancellation: CancellationFlag,
}

struct ControllerState<S> {
    storage: S,
    running: HashMap<String, CancellationFlag>,
}

pub struct JobController<S: JobStorage> {
    state: Mutex<ControllerState<S>>,
    wake: Arc<Notify>,
    job_registry: JobRegistry,
    constraint_registry: ConstraintRegistry,
    serializer: Arc<dyn DataSerializer>,
    tracker: JobTracker,
    scheduler: Arc<dyn Scheduler>,
    empty_debouncer: Debouncer,
    empty_callback: Arc<dyn Fn() + Send + Sync>,
}

fn info_of(spec: &JobSpec) -> JobInfo {
    JobInfo { job_id: spec.id.clone(), factory_key: spec.factory_key.clone() }
}

/// `next = now + min(1000 * 2^min(attempt, 30), max_backoff_ms)`
pub fn backoff_interval_ms(attempt: u32, max_backoff_ms: u64) -> u64 {
    (1000u64 << attempt.min(30)).min(max_backoff_ms)
}

#[allow(clippy::too_many_arguments)]
impl<S: JobStorage> JobController<S> {
    pub fn new(
        storage: S,
        job_registry: JobRegistry,
        constraint_registry: ConstraintRegistry,
        serializer: Arc<dyn DataSerializer>,
        tracker: JobTracker,
        scheduler: Arc<dyn Scheduler>,
        wake: Arc<Notify>,
        empty_queue_debounce_ms: u64,
        empty_callback: Arc<dyn Fn() + Send + Sync>,
    ) -> Self {
        Self {
            state: Mutex::new(ControllerState { storage, running: HashMap::new() }),
            wake,
            job_registry,
            constraint_registry,
            serializer,
            tracker,
            scheduler,
            empty_debouncer: Debouncer::new(empty_queue_debounce_ms),
            empty_callback,
        }
    }

    /// Load durable state and run pending migrations. Jobs that were mid-run
    /// when the previous process died come back as pending.
    pub async fn init(&self, migrator: &JobMigrator) -> Result<()> {
        let mut state = self.state.lock().await;
        state.storage.init()?;
        migrator.migrate(&mut state.storage)?;
        for spec in state.storage.get_all_job_specs() {
            self.tracker.on_state_change(info_of(&spec), JobState::Pending);
        }
        Ok(())
    }

    pub fn wake_up(&self) {
        self.wake.notify_waiters();
    }

    pub fn tracker(&self) -> &JobTracker {
        &self.tracker
    }

    /// Enqueue a chain: each stage depends on every job of the previous
    /// stage. A single-stage, single-job chain is a solo submission and is
    /// subject to its instance limit; anything larger is not.
    pub async fn submit_chain(&self, stages: Vec<Vec<PendingJob>>) -> Result<()> {
        let stages: Vec<Vec<PendingJob>> =
            stages.into_iter().filter(|stage| !stage.is_empty()).collect();
        if stages.is_empty() {
            return Ok(());
        }

        // One memory-only link makes the whole chain memory-only; a durable
        // dependent of a vanished dependency would be stranded forever.
        let chain_memory_only = stages.iter().flatten().any(|p| p.parameters.memory_only);

        let state = &mut *self.state.lock().await;

        if stages.len() == 1 && stages[0].len() == 1 {
            let pending = &stages[0][0];
            if let Some(limit) = pending.parameters.max_instances {
                let count = state.storage.get_job_instance_count(pending.job.factory_key());
                if count >= limit as usize {
                    tracing::debug!(
                        job_id = %pending.id,
                        factory_key = pending.job.factory_key(),
                        limit,
                        "Dropping job, instance limit reached"
                    );
                    self.tracker.on_state_change(
                        JobInfo {
                            job_id: pending.id.clone(),
                            factory_key: pending.job.factory_key().to_string(),
                        },
                        JobState::Ignored,
                    );
                    return Ok(());
                }
            }
        }

        let mut full_specs = Vec::new();
        let mut previous_stage_ids: Vec<String> = Vec::new();
        for stage in &stages {
            for pending in stage {
                let serialized = self.serializer.serialize(&pending.job.serialize())?;
                let mut spec = JobSpec::from_parameters(&pending.id, &pending.parameters, serialized);
                spec.factory_key = pending.job.factory_key().to_string();
                spec.is_memory_only = chain_memory_only;
                let constraint_specs = pending
                    .parameters
                    .constraint_keys
                    .iter()
                    .map(|key| ConstraintSpec {
                        job_id: pending.id.clone(),
                        factory_key: key.clone(),
                    })
                    .collect();
                let dependency_specs = previous_stage_ids
                    .iter()
                    .map(|dep| DependencySpec {
                        job_id: pending.id.clone(),
                        depends_on_job_id: dep.clone(),
                    })
                    .collect();
                full_specs.push(FullSpec::new(spec, constraint_specs, dependency_specs));
            }
            previous_stage_ids = stage.iter().map(|p| p.id.clone()).collect();
        }
        state.storage.insert_jobs(full_specs)?;

        for pending in stages.iter().flatten() {
            tracing::info!(
                job_id = %pending.id,
                factory_key = pending.job.factory_key(),
                "Job enqueued"
            );
            self.tracker.on_state_change(
                JobInfo {
                    job_id: pending.id.clone(),
                    factory_key: pending.job.factory_key().to_string(),
                },
                JobState::Pending,
            );
            pending.job.on_added();
            self.scheduler.schedule(0, &pending.parameters.constraint_keys);
        }
        self.wake.notify_waiters();
        Ok(())
    }

    /// Enqueue one job behind explicit predecessor ids plus every job
    /// currently sitting in `depends_on_queue`. Ids that no longer exist are
    /// skipped; their work is already done.
    pub async fn submit_job_with_existing_dependencies(
        &self,
        pending: PendingJob,
        depends_on: Vec<String>,
        depends_on_queue: Option<String>,
    ) -> Result<()> {
        let state = &mut *self.state.lock().await;

        let mut dependency_ids: Vec<String> = depends_on
            .into_iter()
            .filter(|id| state.storage.get_job_spec(id).is_some())
            .collect();
        if let Some(queue) = depends_on_queue.as_deref() {
            for job in state.storage.get_jobs_in_queue(queue) {
                if !dependency_ids.contains(&job.id) {
                    dependency_ids.push(job.id);
                }
            }
        }

        if dependency_ids.is_empty() {
            if let Some(limit) = pending.parameters.max_instances {
                let count = state.storage.get_job_instance_count(pending.job.factory_key());
                if count >= limit as usize {
                    self.tracker.on_state_change(
                        JobInfo {
                            job_id: pending.id.clone(),
                            factory_key: pending.job.factory_key().to_string(),
                        },
                        JobState::Ignored,
                    );
                    return Ok(());
                }
            }
        }

        let serialized = self.serializer.serialize(&pending.job.serialize())?;
        let mut spec = JobSpec::from_parameters(&pending.id, &pending.parameters, serialized);
        spec.factory_key = pending.job.factory_key().to_string();
        let constraint_specs = pending
            .parameters
            .constraint_keys
            .iter()
            .map(|key| ConstraintSpec { job_id: pending.id.clone(), factory_key: key.clone() })
            .collect();
        let dependency_specs = dependency_ids
            .into_iter()
            .map(|dep| DependencySpec { job_id: pending.id.clone(), depends_on_job_id: dep })
            .collect();
        state
            .storage
            .insert_jobs(vec![FullSpec::new(spec, constraint_specs, dependency_specs)])?;

        self.tracker.on_state_change(
            JobInfo {
                job_id: pending.id.clone(),
                factory_key: pending.job.factory_key().to_string(),
            },
            JobState::Pending,
        );
        pending.job.on_added();
        self.scheduler.schedule(0, &pending.parameters.constraint_keys);
        self.wake.notify_waiters();
        Ok(())
    }

    /// Block until a job is eligible, then check it out: mark it running,
    /// reconstruct it from its stored payload, and hand it to the caller.
    pub async fn pull_next_eligible(&self) -> Result<ActiveJob> {
        loop {
            let notified = self.wake.notified();
            tokio::pin!(notified);
            // Arm before inspecting state so a wake-up racing with the check
            // below is not lost.
            notified.as_mut().enable();

            let sleep_hint = {
                let state = &mut *self.state.lock().await;
                let now = now_ms();
                let mut chosen = None;
                for candidate in state.storage.get_pending_jobs_with_no_dependencies(now) {
                    let constraint_keys: Vec<String> = state
                        .storage
                        .get_constraint_specs(&candidate.id)
                        .into_iter()
                        .map(|c| c.factory_key)
                        .collect();
                    if self.constraint_registry.all_met(&constraint_keys) {
                        chosen = Some((candidate, constraint_keys));
                        break;
                    }
                }

                if let Some((mut spec, constraint_keys)) = chosen {
                    state.storage.mark_job_as_running(&spec.id)?;
                    spec.is_running = true;
                    let cancellation = CancellationFlag::new();
                    state.running.insert(spec.id.clone(), cancellation.clone());
                    let data = self.serializer.deserialize(&spec.serialized_data)?;
                    let parameters = spec.to_parameters(constraint_keys);
                    let job = self.job_registry.instantiate(&spec.factory_key, parameters, data);
                    self.tracker.on_state_change(info_of(&spec), JobState::Running);
                    tracing::info!(
                        job_id = %spec.id,
                        factory_key = %spec.factory_key,
                        run_attempt = spec.run_attempt,
                        "Job checked out for execution"
                    );
                    return Ok(ActiveJob { spec, job, cancellation });
                }

                // Nothing runnable and nothing in flight: the scheduler is
                // idle. Platform schedulers treat this as the queue having
                // emptied.
                if state.running.is_empty() {
                    self.publish_empty();
                }

                // Sleep until the earliest backoff expiry or until someone
                // wakes us.
                state
                    .storage
                    .get_all_job_specs()
                    .iter()
                    .filter(|j| !j.is_running && j.next_run_attempt_time > now)
                    .map(|j| (j.next_run_attempt_time - now) as u64)
                    .min()
            };

            match sleep_hint {
                Some(delay_ms) => {
                    let _ = tokio::time::timeout(
                        Duration::from_millis(delay_ms),
                        notified.as_mut(),
                    )
                    .await;
                }
                None => notified.as_mut().await,
            }
        }
    }

    /// Terminal success: push output data to direct dependents, then delete.
    pub async fn on_success(&self, id: &str, output: Option<Data>) -> Result<()> {
        {
            let state = &mut *self.state.lock().await;
            if let Some(data) = output {
                let serialized = self.serializer.serialize(&data)?;
                let direct: HashSet<String> = state
                    .storage
                    .get_all_dependency_specs()
                    .into_iter()
                    .filter(|d| d.depends_on_job_id == id)
                    .map(|d| d.job_id)
                    .collect();
                if !direct.is_empty() {
                    state.storage.transform_jobs(&mut |spec| {
                        direct.contains(&spec.id).then(|| {
                            let mut updated = spec.clone();
                            updated.serialized_data = serialized.clone();
                            updated
                        })
                    })?;
                }
            }

            let info = state.storage.get_job_spec(id).map(info_of);
            state.storage.delete_jobs(&[id.to_string()])?;
            state.running.remove(id);
            if let Some(info) = info {
                self.tracker.on_state_change(info, JobState::Success);
            }
            self.check_empty(state);
        }
        self.wake.notify_waiters();
        Ok(())
    }

    /// Non-terminal failure: record the attempt and schedule the next one
    /// with exponential backoff.
    pub async fn on_retry(&self, active: &ActiveJob) -> Result<()> {
        // The exponent counts the attempt that just failed: the first retry
        // waits 2s, not 1s.
        let backoff_ms =
            backoff_interval_ms(active.spec.run_attempt + 1, active.spec.max_backoff_ms);
        let constraint_keys: Vec<String>;
        {
            let state = &mut *self.state.lock().await;
            let serialized = self.serializer.serialize(&active.job.serialize())?;
            state.storage.update_job_after_retry(
                &active.spec.id,
                active.spec.run_attempt + 1,
                now_ms() + backoff_ms as i64,
                serialized,
            )?;
            state.running.remove(&active.spec.id);
            constraint_keys = state
                .storage
                .get_constraint_specs(&active.spec.id)
                .into_iter()
                .map(|c| c.factory_key)
                .collect();
            self.tracker.on_state_change(info_of(&active.spec), JobState::Pending);
        }
        tracing::info!(
            job_id = %active.spec.id,
            backoff_ms,
            "Job will be retried"
        );
        active.job.on_retry();
        self.scheduler.schedule(backoff_ms, &constraint_keys);
        // The retried job may have been blocking its queue; others are not
        // affected, but waking is harmless.
        self.wake.notify_waiters();
        Ok(())
    }

    /// Terminal failure: delete the job and every transitive dependent.
    /// Returns the reconstructed dependents so the caller can invoke their
    /// `on_failure` callbacks outside the lock.
    pub async fn on_failure(&self, id: &str) -> Result<Vec<Box<dyn Job>>> {
        let dependents;
        {
            let state = &mut *self.state.lock().await;
            dependents = self.fail_and_cascade(state, id)?;
            self.check_empty(state);
        }
        self.wake.notify_waiters();
        Ok(dependents)
    }

    /// Cancel by id. A running job is flagged and fails when its current
    /// attempt returns; a pending job fails immediately, cascading to its
    /// dependents. Unknown ids are a no-op.
    pub async fn cancel(&self, id: &str) -> Result<()> {
        let mut callbacks: Vec<Box<dyn Job>> = Vec::new();
        {
            let state = &mut *self.state.lock().await;
            if let Some(flag) = state.running.get(id) {
                tracing::info!(job_id = %id, "Canceling running job");
                flag.set();
                return Ok(());
            }
            if state.storage.get_job_spec(id).is_none() {
                return Ok(());
            }
            tracing::info!(job_id = %id, "Canceling pending job");
            if let Some(job) = self.reconstruct(state, id)? {
                callbacks.push(job);
            }
            callbacks.extend(self.fail_and_cascade(state, id)?);
            self.check_empty(state);
        }
        self.wake.notify_waiters();
        for job in &callbacks {
            job.on_failure();
        }
        Ok(())
    }

    pub async fn cancel_all_in_queue(&self, queue_key: &str) -> Result<()> {
        let ids: Vec<String> = {
            let state = &*self.state.lock().await;
            state.storage.get_jobs_in_queue(queue_key).into_iter().map(|j| j.id).collect()
        };
        for id in ids {
            self.cancel(&id).await?;
        }
        Ok(())
    }

    /// Apply an arbitrary rewrite across all enqueued specs. Specs checked
    /// out by a runner are skipped; they belong to the runner until it
    /// reports back.
    pub async fn update_jobs(
        &self,
        transform: &mut (dyn FnMut(&JobSpec) -> Option<JobSpec> + Send),
    ) -> Result<()> {
        {
            let state = &mut *self.state.lock().await;
            state.storage.transform_jobs(&mut |spec| {
                if spec.is_running { None } else { transform(spec) }
            })?;
        }
        self.wake.notify_waiters();
        Ok(())
    }

    /// Racy snapshot of specs matching a predicate.
    pub async fn find_job_specs(&self, predicate: &(dyn Fn(&JobSpec) -> bool + Sync)) -> Vec<JobSpec> {
        let state = &*self.state.lock().await;
        state.storage.get_all_job_specs().into_iter().filter(|s| predicate(s)).collect()
    }

    pub async fn are_queues_empty(&self, queue_keys: &HashSet<String>) -> bool {
        let state = &*self.state.lock().await;
        !state
            .storage
            .get_all_job_specs()
            .iter()
            .any(|j| j.queue_key.as_deref().is_some_and(|q| queue_keys.contains(q)))
    }

    /// Human-readable dump of everything the controller knows.
    pub async fn get_debug_info(&self) -> String {
        let state = &*self.state.lock().await;
        let jobs = state.storage.get_all_job_specs();
        let constraints = state.storage.get_all_constraint_specs();
        let dependencies = state.storage.get_all_dependency_specs();

        let mut out = String::new();
        out.push_str(&format!(
            "-- jobs ({} total, {} running)\n",
            jobs.len(),
            state.running.len()
        ));
        for job in &jobs {
            out.push_str(&format!(
                "{} | {} | queue={} | attempt={} | running={} | priority={}\n",
                job.id,
                job.factory_key,
                job.queue_key.as_deref().unwrap_or("-"),
                job.run_attempt,
                job.is_running,
                job.priority,
            ));
        }
        out.push_str(&format!("-- constraints ({})\n", constraints.len()));
        for constraint in &constraints {
            out.push_str(&format!("{} | {}\n", constraint.job_id, constraint.factory_key));
        }
        out.push_str(&format!("-- dependencies ({})\n", dependencies.len()));
        for dependency in &dependencies {
            out.push_str(&format!(
                "{} depends on {}\n",
                dependency.job_id, dependency.depends_on_job_id
            ));
        }
        out
    }

    fn reconstruct(
        &self,
        state: &ControllerState<S>,
        id: &str,
    ) -> Result<Option<Box<dyn Job>>> {
        let Some(spec) = state.storage.get_job_spec(id) else {
            return Ok(None);
        };
        let constraint_keys = state
            .storage
            .get_constraint_specs(id)
            .into_iter()
            .map(|c| c.factory_key)
            .collect();
        let data = self.serializer.deserialize(&spec.serialized_data)?;
        let parameters = spec.to_parameters(constraint_keys);
        Ok(Some(self.job_registry.instantiate(&spec.factory_key, parameters, data)))
    }

    fn fail_and_cascade(
        &self,
        state: &mut ControllerState<S>,
        id: &str,
    ) -> Result<Vec<Box<dyn Job>>> {
        let dependent_edges = state.storage.get_dependency_specs_that_depend_on_job(id);
        let mut dependents = Vec::new();
        let mut doomed = vec![id.to_string()];
        for edge in &dependent_edges {
            if doomed.contains(&edge.job_id) {
                continue;
            }
            if let Some(spec) = state.storage.get_job_spec(&edge.job_id) {
                let info = info_of(spec);
                if let Some(job) = self.reconstruct(state, &edge.job_id)? {
                    dependents.push(job);
                }
                self.tracker.on_state_change(info, JobState::Failure);
                doomed.push(edge.job_id.clone());
            }
        }
        if let Some(spec) = state.storage.get_job_spec(id) {
            self.tracker.on_state_change(info_of(spec), JobState::Failure);
        }
        tracing::warn!(job_id = %id, dependents = doomed.len() - 1, "Job failed");
        state.storage.delete_jobs(&doomed)?;
        state.running.remove(id);
        Ok(dependents)
    }

    fn check_empty(&self, state: &ControllerState<S>) {
        if state.storage.get_all_job_specs().is_empty() {
            self.publish_empty();
        }
    }

    fn publish_empty(&self) {
        let callback = self.empty_callback.clone();
        self.empty_debouncer.publish(move || callback());
    }
}
