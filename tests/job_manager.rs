//! End-to-end tests driving a real `JobManager` with scripted jobs.

use async_trait::async_trait;
use jobq::data::Data;
use jobq::id::now_ms;
use jobq::job::{Job, JobContext, JobResult, Parameters};
use jobq::manager::{Configuration, JobManager};
use jobq::registry::{ConstraintFactory, JobFactory};
use jobq::tracker::JobState;
use jobq::JobqError;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(10);

type Log = Arc<Mutex<Vec<String>>>;

/// Scripted job driven entirely by its `Data` payload:
/// - `tag`: appended to the shared log on every run
/// - `succeed_at`: attempts below this return `Retry`
/// - `fail`: return terminal `Failure`
/// - `sleep_ms`: hold the runner before finishing
/// - `output_tag`: succeed with output data carrying this tag
struct ScriptedJob {
    params: Parameters,
    data: Data,
    log: Log,
}

#[async_trait]
impl Job for ScriptedJob {
    fn factory_key(&self) -> &'static str {
        "ScriptedJob"
    }

    fn parameters(&self) -> Parameters {
        self.params.clone()
    }

    fn serialize(&self) -> Data {
        self.data.clone()
    }

    async fn run(&mut self, ctx: &JobContext) -> JobResult {
        self.log.lock().unwrap().push(self.data.get_string("tag"));

        if self.data.has_long("sleep_ms") {
            tokio::time::sleep(Duration::from_millis(self.data.get_long("sleep_ms") as u64)).await;
        }
        if self.data.has_boolean("fail") {
            return JobResult::failure();
        }
        if self.data.has_long("succeed_at") && ctx.run_attempt < self.data.get_long("succeed_at") as u32
        {
            return JobResult::retry();
        }
        if self.data.has_string("output_tag") {
            return JobResult::success_with_output(
                Data::builder()
                    .put_string("tag", self.data.get_string("output_tag"))
                    .build(),
            );
        }
        JobResult::success()
    }
}

struct Harness {
    manager: JobManager,
    log: Log,
    gate: Arc<AtomicBool>,
}

fn harness(db_path: Option<PathBuf>, runner_count: usize) -> Harness {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let gate = Arc::new(AtomicBool::new(false));

    let factory_log = log.clone();
    let mut job_factories: HashMap<String, JobFactory> = HashMap::new();
    job_factories.insert(
        "ScriptedJob".to_string(),
        Arc::new(move |params, data| {
            Box::new(ScriptedJob { params, data, log: factory_log.clone() })
        }),
    );

    let constraint_gate = gate.clone();
    let mut constraint_factories: HashMap<String, ConstraintFactory> = HashMap::new();
    constraint_factories.insert(
        "Gate".to_string(),
        Arc::new(move || {
            let gate = constraint_gate.clone();
            struct GateConstraint(Arc<AtomicBool>);
            impl jobq::constraint::Constraint for GateConstraint {
                fn is_met(&self) -> bool {
                    self.0.load(Ordering::SeqCst)
                }
            }
            Box::new(GateConstraint(gate))
        }),
    );

    let mut config = Configuration::new(job_factories)
        .constraint_factories(constraint_factories)
        .runner_count(runner_count)
        .empty_queue_debounce_ms(10);
    if let Some(path) = db_path {
        config = config.db_path(path);
    }

    Harness { manager: JobManager::new(config).unwrap(), log, gate }
}

fn job(log: &Log, params: Parameters, build: impl FnOnce(jobq::data::DataBuilder) -> jobq::data::DataBuilder) -> Box<dyn Job> {
    Box::new(ScriptedJob {
        params,
        data: build(Data::builder()).build(),
        log: log.clone(),
    })
}

fn tagged(log: &Log, tag: &str) -> Box<dyn Job> {
    let tag = tag.to_string();
    job(log, Parameters::default(), move |d| d.put_string("tag", tag))
}

async fn wait_for<F: Fn() -> bool>(what: &str, check: F) {
    for _ in 0..2_000 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn test_chain_runs_stages_in_order() {
    let h = harness(None, 4);
    h.manager.begin_job_loop();

    let state = h
        .manager
        .start_chain(tagged(&h.log, "a"))
        .then(tagged(&h.log, "b"))
        .then(tagged(&h.log, "c"))
        .enqueue_and_block_until_completion(WAIT)
        .await
        .unwrap();

    assert_eq!(state, JobState::Success);
    assert_eq!(*h.log.lock().unwrap(), vec!["a", "b", "c"]);
    assert!(h.manager.find(|_| true).await.is_empty());
}

#[tokio::test]
async fn test_chain_failure_cascades_downstream() {
    let h = harness(None, 4);
    h.manager.begin_job_loop();

    let ids = h
        .manager
        .start_chain(tagged(&h.log, "first"))
        .then(job(&h.log, Parameters::default(), |d| {
            d.put_string("tag", "bad".to_string()).put_boolean("fail", true)
        }))
        .then(tagged(&h.log, "never"))
        .enqueue();
    let last_id = ids.last().unwrap().clone();

    wait_for("cascade failure", || {
        h.manager.get_first_matching_job_state(&jobq::tracker::JobTracker::id_filter(last_id.clone()))
            .is_some_and(|(_, state)| state == JobState::Failure)
    })
    .await;

    // The downstream job never ran, and nothing is left in storage.
    assert_eq!(*h.log.lock().unwrap(), vec!["first", "bad"]);
    assert!(h.manager.find(|_| true).await.is_empty());
}

#[tokio::test]
async fn test_queue_members_run_serially_in_submission_order() {
    let h = harness(None, 4);
    h.manager.begin_job_loop();

    // Four runners, but queue members must not overlap or reorder. Each job
    // sleeps so overlap would be visible as interleaved tags.
    let mut last = String::new();
    for tag in ["q1-a", "q1-b", "q1-c"] {
        let tag = tag.to_string();
        last = h.manager.add(job(
            &h.log,
            Parameters::builder().queue("q1").build(),
            move |d| d.put_string("tag", tag).put_long("sleep_ms", 20),
        ));
    }
    // An unqueued job may interleave freely.
    h.manager.add(tagged(&h.log, "free"));

    let last_id = last;
    wait_for("queue to drain", || {
        h.manager.get_first_matching_job_state(&jobq::tracker::JobTracker::id_filter(last_id.clone()))
            .is_some_and(|(_, state)| state == JobState::Success)
    })
    .await;

    let order: Vec<String> = h
        .log
        .lock()
        .unwrap()
        .iter()
        .filter(|tag| tag.starts_with("q1-"))
        .cloned()
        .collect();
    assert_eq!(order, vec!["q1-a", "q1-b", "q1-c"]);
}

#[tokio::test]
async fn test_retry_applies_backoff() {
    let h = harness(None, 1);

    let attempt_times: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));
    let times = attempt_times.clone();
    let id = h.manager.add(job(
        &h.log,
        Parameters::builder().max_attempts(Some(3)).max_backoff_ms(60).build(),
        |d| d.put_string("tag", "flaky".to_string()).put_long("succeed_at", 2),
    ));
    h.manager.add_listener_for_id(
        &id,
        Arc::new(move |_, state| {
            if state == JobState::Running {
                times.lock().unwrap().push(now_ms());
            }
        }),
    );
    h.manager.begin_job_loop();

    wait_for("retries to finish", || attempt_times.lock().unwrap().len() == 3).await;
    let times = attempt_times.lock().unwrap();
    // Backoff is capped at 60ms; allow some slack for listener dispatch lag.
    assert!(times[1] - times[0] >= 50, "first retry came back too fast");
    assert!(times[2] - times[1] >= 50, "second retry came back too fast");
}

#[tokio::test]
async fn test_attempts_exhausted_is_terminal_failure() {
    let h = harness(None, 1);
    h.manager.begin_job_loop();

    let state = h
        .manager
        .run_synchronously(
            job(
                &h.log,
                Parameters::builder().max_attempts(Some(2)).max_backoff_ms(1).build(),
                |d| d.put_string("tag", "doomed".to_string()).put_long("succeed_at", 10),
            ),
            WAIT,
        )
        .await
        .unwrap();

    assert_eq!(state, JobState::Failure);
    assert_eq!(*h.log.lock().unwrap(), vec!["doomed", "doomed"]);
}

#[tokio::test]
async fn test_instance_limit_drops_duplicate_submission() {
    let h = harness(None, 1);

    let params = Parameters::builder().max_instances(Some(1)).build();
    h.manager.add(job(&h.log, params.clone(), |d| d.put_string("tag", "one".to_string())));
    let second =
        h.manager.add(job(&h.log, params, |d| d.put_string("tag", "two".to_string())));
    h.manager.flush().await;

    assert_eq!(h.manager.find(|_| true).await.len(), 1);
    wait_for("ignored state", || {
        h.manager.get_first_matching_job_state(&jobq::tracker::JobTracker::id_filter(second.clone()))
            .is_some_and(|(_, state)| state == JobState::Ignored)
    })
    .await;
}

#[tokio::test]
async fn test_jobs_survive_process_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("jobs.db");

    {
        // First "process": enqueue but never start the job loop.
        let h = harness(Some(db_path.clone()), 1);
        h.manager.add(tagged(&h.log, "survivor"));
        h.manager
            .add(job(&h.log, Parameters::builder().memory_only(true).build(), |d| {
                d.put_string("tag", "ephemeral".to_string())
            }));
        h.manager.flush().await;
        assert_eq!(h.manager.find(|_| true).await.len(), 2);
    }

    // Second "process": the durable job is recovered and runs; the
    // memory-only job is gone.
    let h = harness(Some(db_path), 1);
    h.manager.flush().await;
    let recovered = h.manager.find(|_| true).await;
    assert_eq!(recovered.len(), 1);

    h.manager.begin_job_loop();
    wait_for("recovered job to run", || h.log.lock().unwrap().contains(&"survivor".to_string()))
        .await;
    assert!(!h.log.lock().unwrap().contains(&"ephemeral".to_string()));
}

#[tokio::test]
async fn test_expired_job_fails_without_running() {
    let h = harness(None, 1);

    let id = h.manager.add(job(
        &h.log,
        Parameters::builder().lifespan_ms(Some(1)).build(),
        |d| d.put_string("tag", "stale".to_string()),
    ));
    h.manager.flush().await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    h.manager.begin_job_loop();

    wait_for("expiry failure", || {
        h.manager.get_first_matching_job_state(&jobq::tracker::JobTracker::id_filter(id.clone()))
            .is_some_and(|(_, state)| state == JobState::Failure)
    })
    .await;
    assert!(h.log.lock().unwrap().is_empty(), "expired job must not run");
}

#[tokio::test]
async fn test_listener_sees_full_retry_sequence() {
    let h = harness(None, 1);

    let id = h.manager.add(job(
        &h.log,
        Parameters::builder().max_attempts(Some(3)).max_backoff_ms(1).build(),
        |d| d.put_string("tag", "watched".to_string()).put_long("succeed_at", 2),
    ));
    h.manager.flush().await;

    let states: Arc<Mutex<Vec<JobState>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = states.clone();
    h.manager.add_listener_for_id(
        &id,
        Arc::new(move |_, state| sink.lock().unwrap().push(state)),
    );
    h.manager.begin_job_loop();

    wait_for("terminal state", || {
        states.lock().unwrap().last().is_some_and(|s| s.is_complete())
    })
    .await;
    assert_eq!(
        *states.lock().unwrap(),
        vec![
            JobState::Pending,
            JobState::Running,
            JobState::Pending,
            JobState::Running,
            JobState::Pending,
            JobState::Running,
            JobState::Success,
        ]
    );
}

#[tokio::test]
async fn test_constraint_blocks_until_met() {
    let h = harness(None, 1);
    h.manager.begin_job_loop();

    let id = h.manager.add(job(
        &h.log,
        Parameters::builder().add_constraint("Gate").build(),
        |d| d.put_string("tag", "gated".to_string()),
    ));
    h.manager.flush().await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.log.lock().unwrap().is_empty(), "constrained job ran before its gate opened");

    h.gate.store(true, Ordering::SeqCst);
    h.manager.on_constraint_met("gate opened");

    wait_for("gated job to run", || {
        h.manager.get_first_matching_job_state(&jobq::tracker::JobTracker::id_filter(id.clone()))
            .is_some_and(|(_, state)| state == JobState::Success)
    })
    .await;
    assert_eq!(*h.log.lock().unwrap(), vec!["gated"]);
}

#[tokio::test]
async fn test_empty_queue_notifies_while_blocked_jobs_remain() {
    let h = harness(None, 1);

    // A gated job parks in storage; the gate never opens in this test.
    h.manager.add(job(
        &h.log,
        Parameters::builder().add_constraint("Gate").build(),
        |d| d.put_string("tag", "parked".to_string()),
    ));
    h.manager.flush().await;

    let fired = Arc::new(AtomicBool::new(false));
    let flag = fired.clone();
    h.manager.add_on_empty_queue_listener(Arc::new(move || {
        flag.store(true, Ordering::SeqCst);
    }));
    h.manager.begin_job_loop();

    h.manager.run_synchronously(tagged(&h.log, "done"), WAIT).await.unwrap();

    // Idleness triggers the notification even though the parked job keeps
    // storage non-empty.
    wait_for("empty-queue notification", || fired.load(Ordering::SeqCst)).await;
    assert_eq!(h.manager.find(|_| true).await.len(), 1);
    assert!(h.log.lock().unwrap().contains(&"done".to_string()));
}

#[tokio::test]
async fn test_output_data_becomes_dependent_input() {
    let h = harness(None, 2);
    h.manager.begin_job_loop();

    let state = h
        .manager
        .start_chain(job(&h.log, Parameters::default(), |d| {
            d.put_string("tag", "producer".to_string())
                .put_string("output_tag", "handoff".to_string())
        }))
        .then(tagged(&h.log, "consumer-original"))
        .enqueue_and_block_until_completion(WAIT)
        .await
        .unwrap();

    assert_eq!(state, JobState::Success);
    // The consumer's payload was replaced by the producer's output before it
    // ran, so it logs the handed-off tag instead of its own.
    assert_eq!(*h.log.lock().unwrap(), vec!["producer", "handoff"]);
}

#[tokio::test]
async fn test_cancel_all_in_queue_fails_pending_jobs() {
    let h = harness(None, 1);

    let ids: Vec<String> = ["a", "b"]
        .iter()
        .map(|tag| {
            let tag = tag.to_string();
            h.manager.add(job(
                &h.log,
                Parameters::builder().queue("doomed").build(),
                move |d| d.put_string("tag", tag),
            ))
        })
        .collect();
    h.manager.cancel_all_in_queue("doomed");
    h.manager.flush().await;

    assert!(h.manager.find(|_| true).await.is_empty());
    for id in ids {
        wait_for("canceled state", || {
            h.manager.get_first_matching_job_state(&jobq::tracker::JobTracker::id_filter(id.clone()))
                .is_some_and(|(_, state)| state == JobState::Failure)
        })
        .await;
    }
    assert!(h.log.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_add_with_queue_dependency_waits_for_queue() {
    let h = harness(None, 4);

    h.manager.add(job(
        &h.log,
        Parameters::builder().queue("upload").build(),
        |d| d.put_string("tag", "upload".to_string()).put_long("sleep_ms", 30),
    ));
    let follower = h.manager.add_with_dependencies(
        tagged(&h.log, "after-upload"),
        Vec::new(),
        Some("upload".to_string()),
    );
    h.manager.begin_job_loop();

    wait_for("follower success", || {
        h.manager.get_first_matching_job_state(&jobq::tracker::JobTracker::id_filter(follower.clone()))
            .is_some_and(|(_, state)| state == JobState::Success)
    })
    .await;
    assert_eq!(*h.log.lock().unwrap(), vec!["upload", "after-upload"]);
}

#[tokio::test]
async fn test_run_synchronously_times_out_without_job_loop() {
    let h = harness(None, 1);
    let result = h
        .manager
        .run_synchronously(tagged(&h.log, "never"), Duration::from_millis(50))
        .await;
    assert!(matches!(result, Err(JobqError::Timeout)));
}
