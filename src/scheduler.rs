//! Wake-up scheduling for deferred work.
//!
//! After every state change the controller asks the scheduler to arrange a
//! future wake-up: "poke me in `delay_ms`, and whenever any of these
//! constraints might newly hold". The in-process scheduler handles the delay
//! half with timers; platform-specific schedulers (alarms, push wake-ups) can
//! be composed in alongside it.

use crate::registry::ConstraintRegistry;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

pub trait Scheduler: Send + Sync {
    /// Arrange for the job loop to be woken after `delay_ms`, or earlier if
    /// one of the named constraints becomes satisfied.
    fn schedule(&self, delay_ms: u64, constraint_keys: &[String]);
}

/// Timer-based scheduler that pokes the controller's wake-up signal from
/// within the current process.
///
/// A delay is only worth registering if the job could actually run when it
/// fires, so requests whose constraints are currently unmet are dropped; the
/// constraint observer wakes the loop when the environment changes.
pub struct InAppScheduler {
    wake: Arc<Notify>,
    constraints: ConstraintRegistry,
}

impl InAppScheduler {
    /// `wake` is the controller's shared wake-up signal.
    pub fn new(wake: Arc<Notify>, constraints: ConstraintRegistry) -> Self {
        Self { wake, constraints }
    }
}

impl Scheduler for InAppScheduler {
    fn schedule(&self, delay_ms: u64, constraint_keys: &[String]) {
        if !self.constraints.all_met(constraint_keys) {
            return;
        }
        let wake = self.wake.clone();
        if delay_ms == 0 {
            wake.notify_waiters();
            return;
        }
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            wake.notify_waiters();
        });
    }
}

/// Fans every request out to all child schedulers.
pub struct CompositeScheduler {
    children: Vec<Box<dyn Scheduler>>,
}

impl CompositeScheduler {
    pub fn new(children: Vec<Box<dyn Scheduler>>) -> Self {
        Self { children }
    }
}

impl Scheduler for CompositeScheduler {
    fn schedule(&self, delay_ms: u64, constraint_keys: &[String]) {
        for child in &self.children {
            child.schedule(delay_ms, constraint_keys);
        }
    }
}

/// Collapses bursts of publishes into one callback invocation.
///
/// Each publish restarts the timer; the callback runs once the burst has been
/// quiet for the full delay. Used for empty-queue notification, which would
/// otherwise fire between every pair of back-to-back jobs.
#[derive(Clone)]
pub struct Debouncer {
    delay_ms: u64,
    generation: Arc<AtomicU64>,
}

impl Debouncer {
    pub fn new(delay_ms: u64) -> Self {
        Self { delay_ms, generation: Arc::new(AtomicU64::new(0)) }
    }

    /// Must be called from within a tokio runtime.
    pub fn publish(&self, callback: impl FnOnce() + Send + 'static) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let latest = self.generation.clone();
        let delay_ms = self.delay_ms;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            if latest.load(Ordering::SeqCst) == generation {
                callback();
            }
        });
    }
}
