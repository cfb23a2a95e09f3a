//! The public façade: configuration, submission API, and the command loop.
//!
//! All mutating operations are funneled through one unbounded command channel
//! consumed by a single task. That task performs the full initialization
//! sequence (storage load, migrations, crash recovery, constraint observer
//! registration) before touching the first command, so callers may submit
//! jobs immediately after construction; nothing executes until the loop is
//! ready and [`JobManager::begin_job_loop`] has been called.

use crate::constraint::{ConstraintNotifier, ConstraintObserver};
use crate::controller::JobController;
use crate::data::{DataSerializer, JsonDataSerializer};
use crate::error::{JobqError, Result};
use crate::job::{Job, PendingJob};
use crate::migrator::JobMigrator;
use crate::registry::{ConstraintFactory, ConstraintRegistry, JobFactory, JobRegistry};
use crate::runner;
use crate::scheduler::{CompositeScheduler, InAppScheduler, Scheduler};
use crate::store::{JobSpec, SqliteJobStore};
use crate::tracker::{JobFilter, JobInfo, JobListener, JobState, JobTracker, ListenerHandle};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{Notify, mpsc, oneshot};

const DEFAULT_RUNNER_COUNT: usize = 4;
const DEFAULT_EMPTY_QUEUE_DEBOUNCE_MS: u64 = 500;

pub type EmptyQueueListener = Arc<dyn Fn() + Send + Sync>;

type UpdateTransform = Box<dyn FnMut(&JobSpec) -> Option<JobSpec> + Send>;
type FindPredicate = Box<dyn Fn(&JobSpec) -> bool + Send + Sync>;

/// Everything the manager needs to know at construction.
pub struct Configuration {
    /// `None` runs against a throwaway in-memory database.
    pub db_path: Option<PathBuf>,
    pub runner_count: usize,
    pub job_factories: HashMap<String, JobFactory>,
    pub constraint_factories: HashMap<String, ConstraintFactory>,
    pub constraint_observers: Vec<Box<dyn ConstraintObserver>>,
    pub migrator: JobMigrator,
    pub data_serializer: Arc<dyn DataSerializer>,
    pub empty_queue_debounce_ms: u64,
    /// Platform schedulers composed alongside the in-process one.
    pub extra_schedulers: Vec<Box<dyn Scheduler>>,
}

impl Configuration {
    pub fn new(job_factories: HashMap<String, JobFactory>) -> Self {
        Self {
            db_path: None,
            runner_count: DEFAULT_RUNNER_COUNT,
            job_factories,
            constraint_factories: HashMap::new(),
            constraint_observers: Vec::new(),
            migrator: JobMigrator::empty(),
            data_serializer: Arc::new(JsonDataSerializer),
            empty_queue_debounce_ms: DEFAULT_EMPTY_QUEUE_DEBOUNCE_MS,
            extra_schedulers: Vec::new(),
        }
    }

    pub fn db_path(mut self, db_path: impl Into<PathBuf>) -> Self {
        self.db_path = Some(db_path.into());
        self
    }

    pub fn runner_count(mut self, runner_count: usize) -> Self {
        self.runner_count = runner_count;
        self
    }

    pub fn constraint_factories(
        mut self,
        constraint_factories: HashMap<String, ConstraintFactory>,
    ) -> Self {
        self.constraint_factories = constraint_factories;
        self
    }

    pub fn constraint_observer(mut self, observer: Box<dyn ConstraintObserver>) -> Self {
        self.constraint_observers.push(observer);
        self
    }

    pub fn migrator(mut self, migrator: JobMigrator) -> Self {
        self.migrator = migrator;
        self
    }

    pub fn data_serializer(mut self, serializer: Arc<dyn DataSerializer>) -> Self {
        self.data_serializer = serializer;
        self
    }

    pub fn empty_queue_debounce_ms(mut self, debounce_ms: u64) -> Self {
        self.empty_queue_debounce_ms = debounce_ms;
        self
    }

    pub fn extra_scheduler(mut self, scheduler: Box<dyn Scheduler>) -> Self {
        self.extra_schedulers.push(scheduler);
        self
    }
}

enum Command {
    SubmitChain(Vec<Vec<PendingJob>>),
    SubmitWithDependencies {
        job: PendingJob,
        depends_on: Vec<String>,
        depends_on_queue: Option<String>,
    },
    Cancel(String),
    CancelAllInQueue(String),
    Update(UpdateTransform),
    Find { predicate: FindPredicate, reply: oneshot::Sender<Vec<JobSpec>> },
    AreQueuesEmpty { queues: HashSet<String>, reply: oneshot::Sender<bool> },
    DebugInfo(oneshot::Sender<String>),
    Flush(oneshot::Sender<()>),
    WakeUp,
    BeginJobLoop,
}

/// Single-process durable job scheduler.
pub struct JobManager {
    commands: mpsc::UnboundedSender<Command>,
    tracker: JobTracker,
    wake: Arc<Notify>,
    empty_listeners: Arc<StdMutex<Vec<(usize, EmptyQueueListener)>>>,
    next_empty_listener_id: AtomicUsize,
}

impl JobManager {
    /// Must be called from within a tokio runtime. Commands submitted before
    /// initialization completes are queued, not rejected.
    pub fn new(config: Configuration) -> Result<Self> {
        let storage = match &config.db_path {
            Some(path) => SqliteJobStore::open(path)?,
            None => SqliteJobStore::open_in_memory()?,
        };

        let tracker = JobTracker::new();
        let wake = Arc::new(Notify::new());
        let job_registry = JobRegistry::new(config.job_factories);
        let constraint_registry = ConstraintRegistry::new(config.constraint_factories);

        let empty_listeners: Arc<StdMutex<Vec<(usize, EmptyQueueListener)>>> =
            Arc::new(StdMutex::new(Vec::new()));
        let listeners = empty_listeners.clone();
        let empty_callback: Arc<dyn Fn() + Send + Sync> = Arc::new(move || {
            if let Ok(listeners) = listeners.lock() {
                for (_, listener) in listeners.iter() {
                    listener();
                }
            }
        });

        let mut schedulers: Vec<Box<dyn Scheduler>> = vec![Box::new(InAppScheduler::new(
            wake.clone(),
            constraint_registry.clone(),
        ))];
        schedulers.extend(config.extra_schedulers);

        let controller = Arc::new(JobController::new(
            storage,
            job_registry,
            constraint_registry,
            config.data_serializer,
            tracker.clone(),
            Arc::new(CompositeScheduler::new(schedulers)),
            wake.clone(),
            config.empty_queue_debounce_ms,
            empty_callback,
        ));

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(command_loop(
            controller,
            config.migrator,
            config.constraint_observers,
            wake.clone(),
            config.runner_count,
            rx,
        ));

        Ok(Self {
            commands: tx,
            tracker,
            wake,
            empty_listeners,
            next_empty_listener_id: AtomicUsize::new(0),
        })
    }

    /// Start the runner tasks. Submissions are accepted before this; nothing
    /// executes until it is called.
    pub fn begin_job_loop(&self) {
        self.send(Command::BeginJobLoop);
    }

    /// Enqueue a single job. Returns its assigned id.
    pub fn add(&self, job: Box<dyn Job>) -> String {
        let pending = PendingJob::new(job);
        let id = pending.id.clone();
        self.send(Command::SubmitChain(vec![vec![pending]]));
        id
    }

    /// Enqueue independent jobs in one transaction. Returns their ids.
    pub fn add_all(&self, jobs: Vec<Box<dyn Job>>) -> Vec<String> {
        let pending: Vec<PendingJob> = jobs.into_iter().map(PendingJob::new).collect();
        let ids = pending.iter().map(|p| p.id.clone()).collect();
        self.send(Command::SubmitChain(vec![pending]));
        ids
    }

    /// Enqueue a job behind explicit predecessors and/or everything currently
    /// in `depends_on_queue`.
    pub fn add_with_dependencies(
        &self,
        job: Box<dyn Job>,
        depends_on: Vec<String>,
        depends_on_queue: Option<String>,
    ) -> String {
        let pending = PendingJob::new(job);
        let id = pending.id.clone();
        self.send(Command::SubmitWithDependencies { job: pending, depends_on, depends_on_queue });
        id
    }

    /// Begin a chain whose first stage is `job`.
    pub fn start_chain(&self, job: Box<dyn Job>) -> Chain<'_> {
        Chain { manager: self, stages: vec![vec![PendingJob::new(job)]] }
    }

    /// Run one job to completion, returning its terminal state.
    pub async fn run_synchronously(
        &self,
        job: Box<dyn Job>,
        timeout: Duration,
    ) -> Result<JobState> {
        self.start_chain(job).enqueue_and_block_until_completion(timeout).await
    }

    pub fn cancel(&self, id: impl Into<String>) {
        self.send(Command::Cancel(id.into()));
    }

    pub fn cancel_all_in_queue(&self, queue_key: impl Into<String>) {
        self.send(Command::CancelAllInQueue(queue_key.into()));
    }

    /// Rewrite stored specs in place (for example, to update input payloads).
    pub fn update(
        &self,
        transform: impl FnMut(&JobSpec) -> Option<JobSpec> + Send + 'static,
    ) {
        self.send(Command::Update(Box::new(transform)));
    }

    /// Racy snapshot of stored specs matching a predicate.
    pub async fn find(
        &self,
        predicate: impl Fn(&JobSpec) -> bool + Send + Sync + 'static,
    ) -> Vec<JobSpec> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Find { predicate: Box::new(predicate), reply });
        rx.await.unwrap_or_default()
    }

    pub fn add_listener(&self, filter: JobFilter, listener: JobListener) -> ListenerHandle {
        self.tracker.add_listener(filter, listener)
    }

    pub fn add_listener_for_id(
        &self,
        job_id: impl Into<String>,
        listener: JobListener,
    ) -> ListenerHandle {
        self.tracker.add_listener(JobTracker::id_filter(job_id), listener)
    }

    pub fn remove_listener(&self, handle: ListenerHandle) {
        self.tracker.remove_listener(handle);
    }

    /// Latest known state of the oldest tracked job matching the filter.
    pub fn get_first_matching_job_state(&self, filter: &JobFilter) -> Option<(JobInfo, JobState)> {
        self.tracker.first_matching(filter)
    }

    /// Round-trip no-op: resolves once every previously submitted command has
    /// been processed.
    pub async fn flush(&self) {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Flush(reply));
        let _ = rx.await;
    }

    pub async fn is_queue_empty(&self, queue_key: impl Into<String>) -> bool {
        self.are_queues_empty([queue_key.into()].into()).await
    }

    pub async fn are_queues_empty(&self, queues: HashSet<String>) -> bool {
        let (reply, rx) = oneshot::channel();
        self.send(Command::AreQueuesEmpty { queues, reply });
        rx.await.unwrap_or(true)
    }

    pub async fn get_debug_info(&self) -> String {
        let (reply, rx) = oneshot::channel();
        self.send(Command::DebugInfo(reply));
        rx.await.unwrap_or_default()
    }

    /// External signal that an environmental condition now holds.
    pub fn on_constraint_met(&self, reason: &str) {
        tracing::info!(reason, "Constraint reported met");
        self.wake.notify_waiters();
    }

    pub fn wake_up(&self) {
        self.send(Command::WakeUp);
    }

    /// Fires (debounced) whenever the job store drains completely.
    pub fn add_on_empty_queue_listener(&self, listener: EmptyQueueListener) -> usize {
        let id = self.next_empty_listener_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut listeners) = self.empty_listeners.lock() {
            listeners.push((id, listener));
        }
        id
    }

    pub fn remove_on_empty_queue_listener(&self, id: usize) {
        if let Ok(mut listeners) = self.empty_listeners.lock() {
            listeners.retain(|(listener_id, _)| *listener_id != id);
        }
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            tracing::error!("Job manager command loop is gone; command dropped");
        }
    }
}

/// Ordered stages under construction; each stage depends on the previous one.
pub struct Chain<'a> {
    manager: &'a JobManager,
    stages: Vec<Vec<PendingJob>>,
}

impl Chain<'_> {
    /// Append a stage of one job.
    pub fn then(mut self, job: Box<dyn Job>) -> Self {
        self.stages.push(vec![PendingJob::new(job)]);
        self
    }

    /// Append a stage whose jobs run in parallel.
    pub fn then_all(mut self, jobs: Vec<Box<dyn Job>>) -> Self {
        self.stages.push(jobs.into_iter().map(PendingJob::new).collect());
        self
    }

    /// Submit the chain. Returns all job ids in stage order.
    pub fn enqueue(self) -> Vec<String> {
        let ids = self.stages.iter().flatten().map(|p| p.id.clone()).collect();
        self.manager.send(Command::SubmitChain(self.stages));
        ids
    }

    /// Submit and wait for the final job's terminal state.
    pub async fn enqueue_and_block_until_completion(
        self,
        timeout: Duration,
    ) -> Result<JobState> {
        let last_id = self
            .stages
            .last()
            .and_then(|stage| stage.last())
            .map(|p| p.id.clone())
            .ok_or_else(|| JobqError::InvalidState("empty chain".to_string()))?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = self.manager.add_listener_for_id(
            &last_id,
            Arc::new(move |_info, state| {
                if state.is_complete() {
                    let _ = tx.send(state);
                }
            }),
        );

        self.manager.send(Command::SubmitChain(self.stages));

        let outcome = tokio::time::timeout(timeout, rx.recv()).await;
        self.manager.remove_listener(handle);
        match outcome {
            Ok(Some(state)) => Ok(state),
            _ => Err(JobqError::Timeout),
        }
    }
}

async fn command_loop(
    controller: Arc<JobController<SqliteJobStore>>,
    migrator: JobMigrator,
    observers: Vec<Box<dyn ConstraintObserver>>,
    wake: Arc<Notify>,
    runner_count: usize,
    mut rx: mpsc::UnboundedReceiver<Command>,
) {
    // Nothing below runs until recovery is complete; commands queue up in
    // the channel meanwhile.
    if let Err(e) = controller.init(&migrator).await {
        panic!("Job manager initialization failed: {e}");
    }

    let notifier_wake = wake.clone();
    let notifier = ConstraintNotifier::new(Arc::new(move |_reason| {
        notifier_wake.notify_waiters();
    }));
    for observer in &observers {
        observer.register(notifier.clone());
    }
    tracing::info!(runner_count, "Job manager initialized");

    let mut runners_started = false;
    while let Some(command) = rx.recv().await {
        let outcome = match command {
            Command::SubmitChain(stages) => controller.submit_chain(stages).await,
            Command::SubmitWithDependencies { job, depends_on, depends_on_queue } => {
                controller
                    .submit_job_with_existing_dependencies(job, depends_on, depends_on_queue)
                    .await
            }
            Command::Cancel(id) => controller.cancel(&id).await,
            Command::CancelAllInQueue(queue) => controller.cancel_all_in_queue(&queue).await,
            Command::Update(mut transform) => controller.update_jobs(&mut *transform).await,
            Command::Find { predicate, reply } => {
                let _ = reply.send(controller.find_job_specs(&*predicate).await);
                Ok(())
            }
            Command::AreQueuesEmpty { queues, reply } => {
                let _ = reply.send(controller.are_queues_empty(&queues).await);
                Ok(())
            }
            Command::DebugInfo(reply) => {
                let _ = reply.send(controller.get_debug_info().await);
                Ok(())
            }
            Command::Flush(reply) => {
                let _ = reply.send(());
                Ok(())
            }
            Command::WakeUp => {
                controller.wake_up();
                Ok(())
            }
            Command::BeginJobLoop => {
                if !runners_started {
                    for runner_id in 0..runner_count {
                        runner::spawn(runner_id, controller.clone());
                    }
                    runners_started = true;
                }
                Ok(())
            }
        };
        if let Err(e) = outcome {
            tracing::error!(error = %e, "Job manager command failed");
        }
    }
    tracing::debug!("Job manager command loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Data;
    use crate::job::{JobContext, JobResult, Parameters};
    use async_trait::async_trait;

    /// Appends its tag to a shared log when run.
    struct TagJob {
        params: Parameters,
        data: Data,
        log: Arc<StdMutex<Vec<String>>>,
    }

    #[async_trait]
    impl Job for TagJob {
        fn factory_key(&self) -> &'static str {
            "TagJob"
        }

        fn parameters(&self) -> Parameters {
            self.params.clone()
        }

        fn serialize(&self) -> Data {
            self.data.clone()
        }

        async fn run(&mut self, _ctx: &JobContext) -> JobResult {
            self.log.lock().unwrap().push(self.data.get_string("tag"));
            JobResult::success()
        }
    }

    fn manager_with_log() -> (JobManager, Arc<StdMutex<Vec<String>>>) {
        let log: Arc<StdMutex<Vec<String>>> = Arc::new(StdMutex::new(Vec::new()));
        let factory_log = log.clone();
        let mut factories: HashMap<String, JobFactory> = HashMap::new();
        factories.insert(
            "TagJob".to_string(),
            Arc::new(move |params, data| {
                Box::new(TagJob { params, data, log: factory_log.clone() })
            }),
        );
        let manager = JobManager::new(
            Configuration::new(factories).runner_count(1).empty_queue_debounce_ms(10),
        )
        .unwrap();
        (manager, log)
    }

    fn tag_job(tag: &str, log: &Arc<StdMutex<Vec<String>>>) -> Box<dyn Job> {
        Box::new(TagJob {
            params: Parameters::default(),
            data: Data::builder().put_string("tag", tag.to_string()).build(),
            log: log.clone(),
        })
    }

    #[tokio::test]
    async fn test_add_and_find_before_job_loop() {
        let (manager, _log) = manager_with_log();
        let id = manager.add(tag_job("a", &Arc::new(StdMutex::new(Vec::new()))));
        manager.flush().await;

        let found = manager.find(move |spec| spec.id == id).await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].factory_key, "TagJob");
    }

    #[tokio::test]
    async fn test_run_synchronously() {
        let (manager, log) = manager_with_log();
        manager.begin_job_loop();

        let state = manager
            .run_synchronously(tag_job("solo", &log), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(state, JobState::Success);
        assert_eq!(*log.lock().unwrap(), vec!["solo"]);
    }

    #[tokio::test]
    async fn test_chain_runs_in_order() {
        let (manager, log) = manager_with_log();
        manager.begin_job_loop();

        let state = manager
            .start_chain(tag_job("first", &log))
            .then(tag_job("second", &log))
            .then(tag_job("third", &log))
            .enqueue_and_block_until_completion(Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(state, JobState::Success);
        assert_eq!(*log.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_queue_state_queries() {
        let (manager, log) = manager_with_log();
        // Job loop not started, so the queue stays occupied.
        manager.add(Box::new(TagJob {
            params: Parameters::builder().queue("q").build(),
            data: Data::builder().put_string("tag", "queued".to_string()).build(),
            log: log.clone(),
        }));
        manager.flush().await;

        assert!(!manager.is_queue_empty("q").await);
        assert!(manager.is_queue_empty("other").await);
        assert!(manager.get_debug_info().await.contains("TagJob"));
    }

    #[tokio::test]
    async fn test_empty_queue_listener_fires() {
        let (manager, log) = manager_with_log();
        manager.begin_job_loop();

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        manager.add_on_empty_queue_listener(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        manager
            .run_synchronously(tag_job("only", &log), Duration::from_secs(5))
            .await
            .unwrap();

        for _ in 0..200 {
            if fired.load(Ordering::SeqCst) > 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("empty-queue listener never fired");
    }

    #[tokio::test]
    async fn test_timeout_when_job_loop_not_started() {
        let (manager, log) = manager_with_log();
        let result = manager
            .run_synchronously(tag_job("never", &log), Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(JobqError::Timeout)));
    }

    #[tokio::test]
    async fn test_first_matching_job_state() {
        let (manager, _log) = manager_with_log();
        let id = manager.add(tag_job("x", &Arc::new(StdMutex::new(Vec::new()))));
        manager.flush().await;

        // Tracker updates flow through an async dispatch; poll briefly.
        for _ in 0..200 {
            if let Some((info, state)) =
                manager.get_first_matching_job_state(&JobTracker::factory_filter("TagJob"))
            {
                assert_eq!(info.job_id, id);
                assert_eq!(state, JobState::Pending);
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job never appeared in the tracker");
    }
}
