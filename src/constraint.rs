//! Constraint abstraction: named boolean preconditions gating job eligibility.
//!
//! The core never implements constraint predicates itself. It only defines
//! the protocol: a job declares constraint factory keys, the controller
//! withholds the job while any constraint reports unmet, and external
//! observers poke [`ConstraintNotifier::on_constraint_met`] when the
//! environment changes.

use std::sync::Arc;

/// A boolean precondition on job execution.
pub trait Constraint: Send + Sync {
    /// Whether the external condition currently holds. Must be cheap; the
    /// controller calls this on every eligibility pass.
    fn is_met(&self) -> bool;
}

/// The single notification contract the core exposes to the outside world:
/// call this whenever an external condition transitions to satisfied.
#[derive(Clone)]
pub struct ConstraintNotifier {
    notify: Arc<dyn Fn(&str) + Send + Sync>,
}

impl ConstraintNotifier {
    pub(crate) fn new(notify: Arc<dyn Fn(&str) + Send + Sync>) -> Self {
        Self { notify }
    }

    pub fn on_constraint_met(&self, reason: &str) {
        tracing::info!(reason, "Constraint met");
        (self.notify)(reason);
    }
}

impl std::fmt::Debug for ConstraintNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConstraintNotifier").finish_non_exhaustive()
    }
}

/// External code registers observers at manager construction; each observer
/// wires its platform event source to the provided notifier.
pub trait ConstraintObserver: Send {
    fn register(&self, notifier: ConstraintNotifier);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_notifier_invokes_callback() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let notifier = ConstraintNotifier::new(Arc::new(move |_reason| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        notifier.on_constraint_met("network");
        notifier.on_constraint_met("battery");
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
