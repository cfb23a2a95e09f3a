//! SQLite-backed job store with an in-memory working set.
//!
//! All reads are served from memory; SQLite exists purely so pending jobs
//! survive a process restart. Memory-only specs live in the working set but
//! are never written to the database.

use crate::error::Result;
use crate::store::records::{ConstraintSpec, DependencySpec, FullSpec, JobSpec};
use crate::store::JobStorage;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{HashMap, HashSet};
use std::path::Path;

pub struct SqliteJobStore {
    db: Connection,
    jobs: Vec<JobSpec>,
    constraints: Vec<ConstraintSpec>,
    dependencies: Vec<DependencySpec>,
}

impl SqliteJobStore {
    /// Open or create the store at `db_path`.
    pub fn open(db_path: &Path) -> Result<Self> {
        Self::from_connection(Connection::open(db_path)?)
    }

    /// Store backed by a throwaway in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(db: Connection) -> Result<Self> {
        Self::init_schema(&db)?;
        Ok(Self {
            db,
            jobs: Vec::new(),
            constraints: Vec::new(),
            dependencies: Vec::new(),
        })
    }

    fn init_schema(db: &Connection) -> Result<()> {
        db.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                factory_key TEXT NOT NULL,
                queue_key TEXT,
                create_time INTEGER NOT NULL,
                next_run_attempt_time INTEGER NOT NULL,
                run_attempt INTEGER NOT NULL,
                max_attempts INTEGER,
                max_backoff_ms INTEGER NOT NULL,
                lifespan_ms INTEGER,
                max_instances INTEGER,
                serialized_data BLOB NOT NULL,
                is_running INTEGER NOT NULL,
                priority INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_queue ON jobs(queue_key);
            CREATE INDEX IF NOT EXISTS idx_jobs_factory ON jobs(factory_key);

            CREATE TABLE IF NOT EXISTS job_constraints (
                job_id TEXT NOT NULL,
                factory_key TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS job_dependencies (
                job_id TEXT NOT NULL,
                depends_on_job_id TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    fn load_working_set(&mut self) -> Result<()> {
        let mut stmt = self.db.prepare(
            "SELECT id, factory_key, queue_key, create_time, next_run_attempt_time, run_attempt,
                    max_attempts, max_backoff_ms, lifespan_ms, max_instances, serialized_data,
                    is_running, priority
             FROM jobs ORDER BY create_time ASC, rowid ASC",
        )?;
        let jobs = stmt
            .query_map([], |row| {
                Ok(JobSpec {
                    id: row.get(0)?,
                    factory_key: row.get(1)?,
                    queue_key: row.get(2)?,
                    create_time: row.get(3)?,
                    next_run_attempt_time: row.get(4)?,
                    run_attempt: row.get(5)?,
                    max_attempts: row.get(6)?,
                    // SQLite integers are i64; widths beyond that are not
                    // representable, so the casts are lossless.
                    max_backoff_ms: row.get::<_, i64>(7)? as u64,
                    lifespan_ms: row.get::<_, Option<i64>>(8)?.map(|v| v as u64),
                    max_instances: row.get(9)?,
                    serialized_data: row.get(10)?,
                    is_running: row.get(11)?,
                    priority: row.get(12)?,
                    is_memory_only: false,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        drop(stmt);
        self.jobs = jobs;

        let mut stmt = self
            .db
            .prepare("SELECT job_id, factory_key FROM job_constraints ORDER BY rowid ASC")?;
        self.constraints = stmt
            .query_map([], |row| {
                Ok(ConstraintSpec { job_id: row.get(0)?, factory_key: row.get(1)? })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        drop(stmt);

        let mut stmt = self
            .db
            .prepare("SELECT job_id, depends_on_job_id FROM job_dependencies ORDER BY rowid ASC")?;
        self.dependencies = stmt
            .query_map([], |row| {
                Ok(DependencySpec { job_id: row.get(0)?, depends_on_job_id: row.get(1)? })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(())
    }

    fn persist_job(db: &Connection, spec: &JobSpec) -> Result<()> {
        db.execute(
            "INSERT OR REPLACE INTO jobs
                 (id, factory_key, queue_key, create_time, next_run_attempt_time, run_attempt,
                  max_attempts, max_backoff_ms, lifespan_ms, max_instances, serialized_data,
                  is_running, priority)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                spec.id,
                spec.factory_key,
                spec.queue_key,
                spec.create_time,
                spec.next_run_attempt_time,
                spec.run_attempt,
                spec.max_attempts,
                spec.max_backoff_ms as i64,
                spec.lifespan_ms.map(|v| v as i64),
                spec.max_instances,
                spec.serialized_data,
                spec.is_running,
                spec.priority,
            ],
        )?;
        Ok(())
    }

    fn spec_index(&self, id: &str) -> Option<usize> {
        self.jobs.iter().position(|j| j.id == id)
    }

    /// Earliest job per queue, the only queue member allowed to run next.
    fn queue_heads(&self) -> HashMap<&str, &str> {
        let mut heads: HashMap<&str, (&str, i64)> = HashMap::new();
        for job in &self.jobs {
            let Some(queue) = job.queue_key.as_deref() else { continue };
            match heads.get(queue) {
                Some(&(_, best)) if best <= job.create_time => {}
                _ => {
                    heads.insert(queue, (job.id.as_str(), job.create_time));
                }
            }
        }
        heads.into_iter().map(|(q, (id, _))| (q, id)).collect()
    }
}

impl JobStorage for SqliteJobStore {
    fn init(&mut self) -> Result<()> {
        self.db.execute("UPDATE jobs SET is_running = 0", [])?;
        self.load_working_set()?;
        tracing::info!(jobs = self.jobs.len(), "Job store initialized");
        Ok(())
    }

    fn insert_jobs(&mut self, full_specs: Vec<FullSpec>) -> Result<()> {
        let tx = self.db.transaction()?;
        for full_spec in &full_specs {
            if full_spec.job_spec.is_memory_only {
                continue;
            }
            Self::persist_job(&tx, &full_spec.job_spec)?;
            for constraint in &full_spec.constraint_specs {
                tx.execute(
                    "INSERT INTO job_constraints (job_id, factory_key) VALUES (?1, ?2)",
                    params![constraint.job_id, constraint.factory_key],
                )?;
            }
            for dependency in &full_spec.dependency_specs {
                tx.execute(
                    "INSERT INTO job_dependencies (job_id, depends_on_job_id) VALUES (?1, ?2)",
                    params![dependency.job_id, dependency.depends_on_job_id],
                )?;
            }
        }
        tx.commit()?;

        for full_spec in full_specs {
            self.jobs.push(full_spec.job_spec);
            self.constraints.extend(full_spec.constraint_specs);
            self.dependencies.extend(full_spec.dependency_specs);
        }
        Ok(())
    }

    fn get_job_spec(&self, id: &str) -> Option<&JobSpec> {
        self.jobs.iter().find(|j| j.id == id)
    }

    fn get_all_job_specs(&self) -> Vec<JobSpec> {
        self.jobs.clone()
    }

    fn get_pending_jobs_with_no_dependencies(&self, now: i64) -> Vec<JobSpec> {
        let blocked: HashSet<&str> =
            self.dependencies.iter().map(|d| d.job_id.as_str()).collect();
        let running_queues: HashSet<&str> = self
            .jobs
            .iter()
            .filter(|j| j.is_running)
            .filter_map(|j| j.queue_key.as_deref())
            .collect();
        let heads = self.queue_heads();

        let mut eligible: Vec<JobSpec> = self
            .jobs
            .iter()
            .filter(|job| !job.is_running)
            .filter(|job| job.next_run_attempt_time <= now)
            .filter(|job| !blocked.contains(job.id.as_str()))
            .filter(|job| match job.queue_key.as_deref() {
                Some(queue) => {
                    !running_queues.contains(queue)
                        && heads.get(queue).copied() == Some(job.id.as_str())
                }
                None => true,
            })
            .cloned()
            .collect();

        // Stable sort keeps insertion order within equal (priority, create_time).
        eligible.sort_by(|a, b| {
            b.priority.cmp(&a.priority).then(a.create_time.cmp(&b.create_time))
        });
        eligible
    }

    fn get_jobs_in_queue(&self, queue_key: &str) -> Vec<JobSpec> {
        self.jobs
            .iter()
            .filter(|j| j.queue_key.as_deref() == Some(queue_key))
            .cloned()
            .collect()
    }

    fn get_job_instance_count(&self, factory_key: &str) -> usize {
        self.jobs.iter().filter(|j| j.factory_key == factory_key).count()
    }

    fn mark_job_as_running(&mut self, id: &str) -> Result<()> {
        let Some(index) = self.spec_index(id) else {
            return Err(crate::error::JobqError::JobNotFound(id.to_string()));
        };
        self.jobs[index].is_running = true;
        if !self.jobs[index].is_memory_only {
            self.db
                .execute("UPDATE jobs SET is_running = 1 WHERE id = ?1", params![id])?;
        }
        Ok(())
    }

    fn update_job_after_retry(
        &mut self,
        id: &str,
        run_attempt: u32,
        next_run_attempt_time: i64,
        serialized_data: Vec<u8>,
    ) -> Result<()> {
        let Some(index) = self.spec_index(id) else {
            return Err(crate::error::JobqError::JobNotFound(id.to_string()));
        };
        let job = &mut self.jobs[index];
        job.run_attempt = run_attempt;
        job.next_run_attempt_time = next_run_attempt_time;
        job.serialized_data = serialized_data;
        job.is_running = false;
        if !job.is_memory_only {
            Self::persist_job(&self.db, job)?;
        }
        Ok(())
    }

    fn transform_jobs(
        &mut self,
        transform: &mut dyn FnMut(&JobSpec) -> Option<JobSpec>,
    ) -> Result<()> {
        for index in 0..self.jobs.len() {
            if let Some(mut updated) = transform(&self.jobs[index]) {
                // Identity and placement are not transformable.
                updated.id = self.jobs[index].id.clone();
                updated.is_memory_only = self.jobs[index].is_memory_only;
                if updated != self.jobs[index] {
                    if !updated.is_memory_only {
                        Self::persist_job(&self.db, &updated)?;
                    }
                    self.jobs[index] = updated;
                }
            }
        }
        Ok(())
    }

    fn delete_jobs(&mut self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let tx = self.db.transaction()?;
        for id in ids {
            tx.execute("DELETE FROM jobs WHERE id = ?1", params![id])?;
            tx.execute("DELETE FROM job_constraints WHERE job_id = ?1", params![id])?;
            tx.execute(
                "DELETE FROM job_dependencies WHERE job_id = ?1 OR depends_on_job_id = ?1",
                params![id],
            )?;
        }
        tx.commit()?;

        let doomed: HashSet<&str> = ids.iter().map(String::as_str).collect();
        self.jobs.retain(|j| !doomed.contains(j.id.as_str()));
        self.constraints.retain(|c| !doomed.contains(c.job_id.as_str()));
        self.dependencies.retain(|d| {
            !doomed.contains(d.job_id.as_str()) && !doomed.contains(d.depends_on_job_id.as_str())
        });
        Ok(())
    }

    fn get_constraint_specs(&self, job_id: &str) -> Vec<ConstraintSpec> {
        self.constraints.iter().filter(|c| c.job_id == job_id).cloned().collect()
    }

    fn get_all_constraint_specs(&self) -> Vec<ConstraintSpec> {
        self.constraints.clone()
    }

    fn get_dependency_specs_that_depend_on_job(&self, id: &str) -> Vec<DependencySpec> {
        let mut collected: Vec<DependencySpec> = Vec::new();
        let mut seen: HashSet<&str> = HashSet::new();
        let mut frontier: Vec<&str> = vec![id];
        while let Some(target) = frontier.pop() {
            for dependency in &self.dependencies {
                if dependency.depends_on_job_id == target
                    && seen.insert(dependency.job_id.as_str())
                {
                    collected.push(dependency.clone());
                    frontier.push(dependency.job_id.as_str());
                }
            }
        }
        collected
    }

    fn get_all_dependency_specs(&self) -> Vec<DependencySpec> {
        self.dependencies.clone()
    }

    fn get_meta(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .db
            .query_row("SELECT value FROM meta WHERE key = ?1", params![key], |row| row.get(0))
            .optional()?;
        Ok(value)
    }

    fn set_meta(&mut self, key: &str, value: &str) -> Result<()> {
        self.db.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }
}
