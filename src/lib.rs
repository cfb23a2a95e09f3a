//! jobq - A durable job scheduling subsystem
//!
//! Persistent work queue with dependency ordering, per-queue serialization,
//! instance limits, retry with exponential backoff, expiration, and pluggable
//! environmental constraints. Jobs survive process restarts: they are
//! reconstructed from storage through registered factories and re-executed
//! at-least-once.

pub mod constraint;
pub mod controller;
pub mod data;
pub mod error;
pub mod id;
pub mod job;
pub mod manager;
pub mod migrator;
pub mod registry;
pub mod runner;
pub mod scheduler;
pub mod store;
pub mod tracker;

pub use error::{JobqError, Result};
pub use job::{Job, JobContext, JobResult, Parameters};
pub use manager::{Chain, Configuration, JobManager};
pub use tracker::JobState;
