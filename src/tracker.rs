//! In-memory observation of job lifecycles.
//!
//! The tracker is advisory: losing it loses no work, only visibility. It
//! keeps a bounded cache of recent job states for replay and dispatches every
//! transition to matching listeners from a single task, so any one listener
//! observes transitions in the exact order they were reported.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Upper bound on remembered job states.
const MAX_TRACKED: usize = 1_000;

/// Observable lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Running,
    Success,
    Failure,
    /// Dropped at submission by an instance limit; never ran.
    Ignored,
}

impl JobState {
    pub fn is_complete(&self) -> bool {
        matches!(self, JobState::Success | JobState::Failure | JobState::Ignored)
    }
}

/// Identity snapshot carried with every transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobInfo {
    pub job_id: String,
    pub factory_key: String,
}

pub type JobFilter = Arc<dyn Fn(&JobInfo) -> bool + Send + Sync>;
pub type JobListener = Arc<dyn Fn(&JobInfo, JobState) + Send + Sync>;

/// Handle for detaching a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerHandle(usize);

enum TrackerEvent {
    Update(JobInfo, JobState),
    AddListener(usize, JobFilter, JobListener),
    RemoveListener(usize),
}

#[derive(Clone)]
pub struct JobTracker {
    states: Arc<Mutex<StateCache>>,
    events: mpsc::UnboundedSender<TrackerEvent>,
    next_listener_id: Arc<AtomicUsize>,
}

#[derive(Default)]
struct StateCache {
    by_id: HashMap<String, (JobInfo, JobState)>,
    insertion_order: VecDeque<String>,
}

impl StateCache {
    fn record(&mut self, info: JobInfo, state: JobState) {
        if !self.by_id.contains_key(&info.job_id) {
            self.insertion_order.push_back(info.job_id.clone());
            while self.insertion_order.len() > MAX_TRACKED {
                if let Some(evicted) = self.insertion_order.pop_front() {
                    self.by_id.remove(&evicted);
                }
            }
        }
        self.by_id.insert(info.job_id.clone(), (info, state));
    }
}

impl JobTracker {
    /// Must be called from within a tokio runtime; spawns the dispatch task.
    pub fn new() -> Self {
        let states = Arc::new(Mutex::new(StateCache::default()));
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(dispatch_loop(rx));
        Self {
            states,
            events: tx,
            next_listener_id: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Record a transition and queue it for listener dispatch.
    pub fn on_state_change(&self, info: JobInfo, state: JobState) {
        tracing::debug!(job_id = %info.job_id, ?state, "Job state change");
        if let Ok(mut cache) = self.states.lock() {
            cache.record(info.clone(), state);
        }
        let _ = self.events.send(TrackerEvent::Update(info, state));
    }

    /// Attach a listener. The current state of every cached job matching the
    /// filter is replayed to it before any newer transitions.
    pub fn add_listener(&self, filter: JobFilter, listener: JobListener) -> ListenerHandle {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        let _ = self.events.send(TrackerEvent::AddListener(id, filter, listener));
        ListenerHandle(id)
    }

    pub fn remove_listener(&self, handle: ListenerHandle) {
        let _ = self.events.send(TrackerEvent::RemoveListener(handle.0));
    }

    /// First cached job (oldest first) matching the filter, with its state.
    pub fn first_matching(&self, filter: &JobFilter) -> Option<(JobInfo, JobState)> {
        let cache = self.states.lock().ok()?;
        cache
            .insertion_order
            .iter()
            .filter_map(|job_id| cache.by_id.get(job_id))
            .find(|(info, _)| filter(info))
            .cloned()
    }

    /// Most recently recorded state, if the job is still in the cache.
    pub fn get_state(&self, job_id: &str) -> Option<JobState> {
        self.states
            .lock()
            .ok()
            .and_then(|cache| cache.by_id.get(job_id).map(|(_, state)| *state))
    }

    /// Filter matching exactly one job id.
    pub fn id_filter(job_id: impl Into<String>) -> JobFilter {
        let job_id = job_id.into();
        Arc::new(move |info: &JobInfo| info.job_id == job_id)
    }

    /// Filter matching every job sharing a factory key.
    pub fn factory_filter(factory_key: impl Into<String>) -> JobFilter {
        let factory_key = factory_key.into();
        Arc::new(move |info: &JobInfo| info.factory_key == factory_key)
    }
}

impl Default for JobTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for JobTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobTracker").finish_non_exhaustive()
    }
}

async fn dispatch_loop(mut rx: mpsc::UnboundedReceiver<TrackerEvent>) {
    // Replay must never run ahead of updates still queued in the channel, so
    // the dispatch task keeps its own view of job states, advanced strictly
    // in step with the updates it has delivered. The shared cache is only
    // for synchronous point queries.
    let mut view = StateCache::default();
    let mut listeners: Vec<(usize, JobFilter, JobListener)> = Vec::new();
    while let Some(event) = rx.recv().await {
        match event {
            TrackerEvent::Update(info, state) => {
                view.record(info.clone(), state);
                for (_, filter, listener) in &listeners {
                    if filter(&info) {
                        listener(&info, state);
                    }
                }
            }
            TrackerEvent::AddListener(id, filter, listener) => {
                for job_id in &view.insertion_order {
                    if let Some((info, state)) = view.by_id.get(job_id) {
                        if filter(info) {
                            listener(info, *state);
                        }
                    }
                }
                listeners.push((id, filter, listener));
            }
            TrackerEvent::RemoveListener(id) => {
                listeners.retain(|(listener_id, _, _)| *listener_id != id);
            }
        }
    }
}
