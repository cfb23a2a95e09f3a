//! Factory registries for reconstructing jobs and constraints from storage.
//!
//! Registries are built once at manager construction from explicit maps and
//! never mutated afterwards. A stored key with no registered factory is a
//! configuration error: the deployment promised it could reconstruct every
//! persisted job, and silently skipping one would strand its dependents. That
//! contract is enforced with a panic, never graceful degradation.

use crate::constraint::Constraint;
use crate::data::Data;
use crate::job::{Job, Parameters};
use std::collections::HashMap;
use std::sync::Arc;

/// Factory that turns a stored payload back into a live job.
pub type JobFactory = Arc<dyn Fn(Parameters, Data) -> Box<dyn Job> + Send + Sync>;

/// Factory for a live constraint instance.
pub type ConstraintFactory = Arc<dyn Fn() -> Box<dyn Constraint> + Send + Sync>;

/// Owned, immutable map from factory key to job factory.
#[derive(Clone, Default)]
pub struct JobRegistry {
    factories: Arc<HashMap<String, JobFactory>>,
}

impl JobRegistry {
    pub fn new(factories: HashMap<String, JobFactory>) -> Self {
        Self { factories: Arc::new(factories) }
    }

    /// Panics if `factory_key` has no registered factory.
    pub fn instantiate(&self, factory_key: &str, parameters: Parameters, data: Data) -> Box<dyn Job> {
        match self.factories.get(factory_key) {
            Some(factory) => factory(parameters, data),
            None => panic!("No job factory registered for key '{factory_key}'"),
        }
    }

    pub fn contains(&self, factory_key: &str) -> bool {
        self.factories.contains_key(factory_key)
    }
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("keys", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Owned, immutable map from factory key to constraint factory.
#[derive(Clone, Default)]
pub struct ConstraintRegistry {
    factories: Arc<HashMap<String, ConstraintFactory>>,
}

impl ConstraintRegistry {
    pub fn new(factories: HashMap<String, ConstraintFactory>) -> Self {
        Self { factories: Arc::new(factories) }
    }

    /// Panics if `factory_key` has no registered factory.
    pub fn instantiate(&self, factory_key: &str) -> Box<dyn Constraint> {
        match self.factories.get(factory_key) {
            Some(factory) => factory(),
            None => panic!("No constraint factory registered for key '{factory_key}'"),
        }
    }

    /// Whether every named constraint currently reports met.
    pub fn all_met(&self, factory_keys: impl IntoIterator<Item = impl AsRef<str>>) -> bool {
        factory_keys
            .into_iter()
            .all(|key| self.instantiate(key.as_ref()).is_met())
    }
}

impl std::fmt::Debug for ConstraintRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConstraintRegistry")
            .field("keys", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}
