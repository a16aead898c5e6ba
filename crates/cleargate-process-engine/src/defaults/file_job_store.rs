//! File-system backed job store.
//!
//! Layout:
//! ```text
//! {base_dir}/jobs/{job_id}.json
//! {base_dir}/dead_letter/{job_id}.json
//! ```
//!
//! Every write goes to a temp file that is fsynced and renamed over the
//! target, so a crash leaves either the old or the new record. Leases are
//! persisted with the job: after a restart, jobs whose lease has expired are
//! claimable again. Claim exclusivity holds within one process.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;

use super::in_memory_job_store::{check_lease, claim_order, lease, release, revive};
use crate::errors::JobStoreError;
use crate::traits::JobStore;
use crate::types::{DeadLetterJob, Job};

pub struct FileJobStore {
    base_dir: PathBuf,
    /// Serializes read-modify-write cycles.
    lock: Mutex<()>,
}

fn store_err(context: &str, e: impl std::fmt::Display) -> JobStoreError {
    JobStoreError::Store {
        message: format!("{context}: {e}"),
    }
}

impl FileJobStore {
    /// Open (or create) a store rooted at `base_dir`.
    pub fn new(base_dir: PathBuf) -> Result<Self, JobStoreError> {
        for dir in ["jobs", "dead_letter"] {
            std::fs::create_dir_all(base_dir.join(dir))
                .map_err(|e| store_err("failed to create job directory", e))?;
        }
        Ok(Self {
            base_dir,
            lock: Mutex::new(()),
        })
    }

    fn job_path(&self, id: &str) -> PathBuf {
        self.base_dir.join("jobs").join(format!("{id}.json"))
    }

    fn dead_path(&self, id: &str) -> PathBuf {
        self.base_dir.join("dead_letter").join(format!("{id}.json"))
    }

    fn read_job(&self, id: &str) -> Result<Option<Job>, JobStoreError> {
        read_json(&self.job_path(id))
    }

    fn read_all<T: DeserializeOwned>(&self, dir: &str) -> Result<Vec<T>, JobStoreError> {
        let entries = std::fs::read_dir(self.base_dir.join(dir))
            .map_err(|e| store_err("failed to read job directory", e))?;
        let mut out = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| store_err("failed to read dir entry", e))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(record) = read_json(&path)? {
                out.push(record);
            }
        }
        Ok(out)
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, JobStoreError> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(store_err("failed to read job file", e)),
    };
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|e| store_err("failed to deserialize job", e))
}

/// All-or-nothing write: temp file, fsync, rename.
fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), JobStoreError> {
    use std::io::Write as _;

    let bytes =
        serde_json::to_vec_pretty(value).map_err(|e| store_err("failed to serialize job", e))?;
    let temp_path = path.with_extension("json.tmp");
    let mut file =
        std::fs::File::create(&temp_path).map_err(|e| store_err("failed to create temp file", e))?;
    file.write_all(&bytes)
        .map_err(|e| store_err("failed to write job", e))?;
    file.sync_all().map_err(|e| store_err("failed to fsync", e))?;
    drop(file);
    std::fs::rename(&temp_path, path).map_err(|e| store_err("failed to rename temp file", e))
}

fn remove_file(path: &Path) -> Result<bool, JobStoreError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(store_err("failed to remove job file", e)),
    }
}

#[async_trait]
impl JobStore for FileJobStore {
    async fn insert(&self, job: Job) -> Result<(), JobStoreError> {
        let _guard = self.lock.lock().await;
        write_json(&self.job_path(&job.id), &job)
    }

    async fn get(&self, id: &str) -> Result<Option<Job>, JobStoreError> {
        let _guard = self.lock.lock().await;
        self.read_job(id)
    }

    async fn claim_due(
        &self,
        owner: &str,
        now: DateTime<Utc>,
        lock_until: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let _guard = self.lock.lock().await;
        let mut due: Vec<Job> = self
            .read_all::<Job>("jobs")?
            .into_iter()
            .filter(|j| j.is_claimable(now))
            .collect();
        due.sort_by(claim_order);
        due.truncate(limit);

        for job in &mut due {
            lease(job, owner, lock_until);
            write_json(&self.job_path(&job.id), job)?;
        }
        Ok(due)
    }

    async fn extend_lease(
        &self,
        id: &str,
        owner: &str,
        lock_until: DateTime<Utc>,
    ) -> Result<bool, JobStoreError> {
        let _guard = self.lock.lock().await;
        let Some(mut job) = self.read_job(id)? else {
            return Ok(false);
        };
        if job.lock_owner.as_deref() != Some(owner) {
            return Ok(false);
        }
        job.lock_expires_at = Some(lock_until);
        write_json(&self.job_path(id), &job)?;
        Ok(true)
    }

    async fn complete(&self, id: &str, owner: &str) -> Result<bool, JobStoreError> {
        let _guard = self.lock.lock().await;
        let Some(job) = self.read_job(id)? else {
            return Ok(false);
        };
        check_lease(&job, owner)?;
        remove_file(&self.job_path(id))
    }

    async fn reschedule(
        &self,
        id: &str,
        owner: &str,
        retry_count: u32,
        due_time: DateTime<Utc>,
        error: &str,
    ) -> Result<(), JobStoreError> {
        let _guard = self.lock.lock().await;
        let mut job = self
            .read_job(id)?
            .ok_or_else(|| JobStoreError::NotFound { id: id.to_string() })?;
        check_lease(&job, owner)?;
        job.retry_count = retry_count;
        job.due_time = due_time;
        release(&mut job, error);
        write_json(&self.job_path(id), &job)
    }

    async fn dead_letter(
        &self,
        id: &str,
        owner: &str,
        error: &str,
        permanent: bool,
    ) -> Result<(), JobStoreError> {
        let _guard = self.lock.lock().await;
        let mut job = self
            .read_job(id)?
            .ok_or_else(|| JobStoreError::NotFound { id: id.to_string() })?;
        check_lease(&job, owner)?;
        release(&mut job, error);
        let dead = DeadLetterJob {
            job,
            error: error.to_string(),
            permanent,
            dead_lettered_at: Utc::now(),
        };
        // Dead letter first: a crash in between leaves a duplicate, never a loss.
        write_json(&self.dead_path(id), &dead)?;
        remove_file(&self.job_path(id))?;
        Ok(())
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetterJob>, JobStoreError> {
        let _guard = self.lock.lock().await;
        let mut dead: Vec<DeadLetterJob> = self.read_all("dead_letter")?;
        dead.sort_by_key(|d| d.dead_lettered_at);
        Ok(dead)
    }

    async fn retry_dead_letter(&self, id: &str) -> Result<Job, JobStoreError> {
        let _guard = self.lock.lock().await;
        let dead: DeadLetterJob = read_json(&self.dead_path(id))?
            .ok_or_else(|| JobStoreError::NotFound { id: id.to_string() })?;
        let job = revive(dead.job);
        write_json(&self.job_path(id), &job)?;
        remove_file(&self.dead_path(id))?;
        Ok(job)
    }

    async fn pending(&self) -> Result<Vec<Job>, JobStoreError> {
        let _guard = self.lock.lock().await;
        let mut jobs: Vec<Job> = self.read_all("jobs")?;
        jobs.sort_by(claim_order);
        Ok(jobs)
    }
}
