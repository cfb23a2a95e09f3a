//! Versioned migration of persisted job specs.
//!
//! Jobs can outlive the code that enqueued them. When a release renames a
//! factory key or reshapes a payload, a [`JobMigration`] rewrites the stored
//! specs before the job loop starts. The storage's schema version is kept in
//! its meta table and stamped forward after a successful pass, so each
//! migration runs at most once.

use crate::error::Result;
use crate::store::{JobSpec, JobStorage};
use std::collections::HashMap;

const VERSION_KEY: &str = "job_schema_version";
const INITIAL_VERSION: u32 = 1;

/// One step that brings persisted specs up to `end_version`.
pub trait JobMigration: Send + Sync {
    /// The schema version this migration produces.
    fn end_version(&self) -> u32;

    /// Rewrite a single spec, or return `None` to leave it untouched.
    fn migrate(&self, spec: &JobSpec) -> Option<JobSpec>;
}

pub struct JobMigrator {
    current_version: u32,
    migrations: HashMap<u32, Box<dyn JobMigration>>,
}

impl JobMigrator {
    /// Panics if two migrations claim the same end version, or if any step
    /// between the initial and current version is missing. A gap would leave
    /// old stores silently half-migrated.
    pub fn new(current_version: u32, migrations: Vec<Box<dyn JobMigration>>) -> Self {
        let mut by_version = HashMap::new();
        for migration in migrations {
            let version = migration.end_version();
            if by_version.insert(version, migration).is_some() {
                panic!("Duplicate job migration for version {version}");
            }
        }
        for version in (INITIAL_VERSION + 1)..=current_version {
            if !by_version.contains_key(&version) {
                panic!("No job migration registered for version {version}");
            }
        }
        Self { current_version, migrations: by_version }
    }

    /// Migrator with no migrations registered; still stamps the version.
    pub fn empty() -> Self {
        Self::new(INITIAL_VERSION, Vec::new())
    }

    /// Bring storage up to `current_version`, applying each missing step in
    /// order. Called once during manager initialization, before any job runs.
    pub fn migrate<S: JobStorage + ?Sized>(&self, storage: &mut S) -> Result<()> {
        let stored_version = storage
            .get_meta(VERSION_KEY)?
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(INITIAL_VERSION);

        if stored_version >= self.current_version {
            return Ok(());
        }

        for version in (stored_version + 1)..=self.current_version {
            // Presence of every step was checked at construction.
            let migration = &self.migrations[&version];
            tracing::info!(version, "Applying job migration");
            storage.transform_jobs(&mut |spec| migration.migrate(spec))?;
        }
        storage.set_meta(VERSION_KEY, &self.current_version.to_string())?;
        Ok(())
    }
}
