//! In-memory job store for testing and lightweight usage.
//!
//! Jobs do not survive a restart; use
//! [`FileJobStore`](super::FileJobStore) when they must.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::errors::JobStoreError;
use crate::traits::JobStore;
use crate::types::{DeadLetterJob, Job};

#[derive(Default)]
struct Inner {
    jobs: HashMap<String, Job>,
    dead: BTreeMap<String, DeadLetterJob>,
}

/// In-memory implementation of [`JobStore`].
#[derive(Clone, Default)]
pub struct InMemoryJobStore {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Order claimable jobs by due time, then creation time.
pub(crate) fn claim_order(a: &Job, b: &Job) -> std::cmp::Ordering {
    a.due_time
        .cmp(&b.due_time)
        .then(a.created_at.cmp(&b.created_at))
        .then(a.id.cmp(&b.id))
}

/// Apply a lease to a job.
pub(crate) fn lease(job: &mut Job, owner: &str, lock_until: DateTime<Utc>) {
    job.lock_owner = Some(owner.to_string());
    job.lock_expires_at = Some(lock_until);
}

/// Fail unless `owner` holds the job's lease.
pub(crate) fn check_lease(job: &Job, owner: &str) -> Result<(), JobStoreError> {
    if job.lock_owner.as_deref() == Some(owner) {
        Ok(())
    } else {
        Err(JobStoreError::LeaseLost {
            id: job.id.clone(),
            owner: owner.to_string(),
        })
    }
}

/// Drop the lease after an attempt.
pub(crate) fn release(job: &mut Job, error: &str) {
    job.last_error = Some(error.to_string());
    job.lock_owner = None;
    job.lock_expires_at = None;
}

/// Reset a dead-lettered job so it runs again immediately.
pub(crate) fn revive(mut job: Job) -> Job {
    job.retry_count = 0;
    job.due_time = Utc::now();
    job.lock_owner = None;
    job.lock_expires_at = None;
    job
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: Job) -> Result<(), JobStoreError> {
        self.inner.lock().await.jobs.insert(job.id.clone(), job);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Job>, JobStoreError> {
        Ok(self.inner.lock().await.jobs.get(id).cloned())
    }

    async fn claim_due(
        &self,
        owner: &str,
        now: DateTime<Utc>,
        lock_until: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let mut inner = self.inner.lock().await;
        let mut due: Vec<&mut Job> = inner
            .jobs
            .values_mut()
            .filter(|j| j.is_claimable(now))
            .collect();
        due.sort_by(|a, b| claim_order(a, b));

        Ok(due
            .into_iter()
            .take(limit)
            .map(|job| {
                lease(job, owner, lock_until);
                job.clone()
            })
            .collect())
    }

    async fn extend_lease(
        &self,
        id: &str,
        owner: &str,
        lock_until: DateTime<Utc>,
    ) -> Result<bool, JobStoreError> {
        let mut inner = self.inner.lock().await;
        match inner.jobs.get_mut(id) {
            Some(job) if job.lock_owner.as_deref() == Some(owner) => {
                job.lock_expires_at = Some(lock_until);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete(&self, id: &str, owner: &str) -> Result<bool, JobStoreError> {
        let mut inner = self.inner.lock().await;
        let Some(job) = inner.jobs.get(id) else {
            return Ok(false);
        };
        check_lease(job, owner)?;
        Ok(inner.jobs.remove(id).is_some())
    }

    async fn reschedule(
        &self,
        id: &str,
        owner: &str,
        retry_count: u32,
        due_time: DateTime<Utc>,
        error: &str,
    ) -> Result<(), JobStoreError> {
        let mut inner = self.inner.lock().await;
        let job = inner
            .jobs
            .get_mut(id)
            .ok_or_else(|| JobStoreError::NotFound { id: id.to_string() })?;
        check_lease(job, owner)?;
        job.retry_count = retry_count;
        job.due_time = due_time;
        release(job, error);
        Ok(())
    }

    async fn dead_letter(
        &self,
        id: &str,
        owner: &str,
        error: &str,
        permanent: bool,
    ) -> Result<(), JobStoreError> {
        let mut inner = self.inner.lock().await;
        let job = inner
            .jobs
            .get(id)
            .ok_or_else(|| JobStoreError::NotFound { id: id.to_string() })?;
        check_lease(job, owner)?;
        let Some(mut job) = inner.jobs.remove(id) else {
            return Err(JobStoreError::NotFound { id: id.to_string() });
        };
        release(&mut job, error);
        inner.dead.insert(
            id.to_string(),
            DeadLetterJob {
                job,
                error: error.to_string(),
                permanent,
                dead_lettered_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetterJob>, JobStoreError> {
        let inner = self.inner.lock().await;
        let mut dead: Vec<DeadLetterJob> = inner.dead.values().cloned().collect();
        dead.sort_by_key(|d| d.dead_lettered_at);
        Ok(dead)
    }

    async fn retry_dead_letter(&self, id: &str) -> Result<Job, JobStoreError> {
        let mut inner = self.inner.lock().await;
        let dead = inner
            .dead
            .remove(id)
            .ok_or_else(|| JobStoreError::NotFound { id: id.to_string() })?;
        let job = revive(dead.job);
        inner.jobs.insert(job.id.clone(), job.clone());
        Ok(job)
    }

    async fn pending(&self) -> Result<Vec<Job>, JobStoreError> {
        let inner = self.inner.lock().await;
        let mut jobs: Vec<Job> = inner.jobs.values().cloned().collect();
        jobs.sort_by(claim_order);
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::JobType;
    use chrono::Duration;
    use serde_json::json;

    fn job(execution_id: &str) -> Job {
        Job::new(JobType::Trigger, execution_id, json!({}))
    }

    #[tokio::test]
    async fn claim_is_exclusive_until_lease_expires() {
        let store = InMemoryJobStore::new();
        store.insert(job("e1")).await.unwrap();
        let now = Utc::now() + Duration::seconds(1);

        let a = store
            .claim_due("worker-a", now, now + Duration::seconds(30), 10)
            .await
            .unwrap();
        let b = store
            .claim_due("worker-b", now, now + Duration::seconds(30), 10)
            .await
            .unwrap();
        assert_eq!(a.len(), 1);
        assert!(b.is_empty());
        assert_eq!(a[0].lock_owner.as_deref(), Some("worker-a"));

        // Worker A "crashed": after expiry the job is claimable again.
        let later = now + Duration::seconds(31);
        let c = store
            .claim_due("worker-c", later, later + Duration::seconds(30), 10)
            .await
            .unwrap();
        assert_eq!(c.len(), 1);
        assert_eq!(c[0].id, a[0].id);
    }

    #[tokio::test]
    async fn future_jobs_are_not_claimed() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        store.insert(job("e1").due_at(now + Duration::minutes(5))).await.unwrap();
        assert!(store
            .claim_due("w", now, now + Duration::seconds(30), 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn claim_respects_limit_and_due_order() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let late = job("late").due_at(now - Duration::seconds(1));
        let early = job("early").due_at(now - Duration::seconds(10));
        store.insert(late).await.unwrap();
        store.insert(early).await.unwrap();

        let claimed = store
            .claim_due("w", now, now + Duration::seconds(30), 1)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].execution_id, "early");
    }

    async fn claimed(store: &InMemoryJobStore, owner: &str) -> Job {
        let now = Utc::now() + Duration::seconds(1);
        let mut jobs = store
            .claim_due(owner, now, now + Duration::seconds(30), 1)
            .await
            .unwrap();
        jobs.remove(0)
    }

    #[tokio::test]
    async fn outcomes_need_the_current_lease() {
        let store = InMemoryJobStore::new();
        store.insert(job("e1")).await.unwrap();
        let now = Utc::now() + Duration::seconds(1);
        let first = store
            .claim_due("worker-a", now, now + Duration::seconds(1), 10)
            .await
            .unwrap();
        let id = first[0].id.clone();

        // A's lease ran out and B took the job over.
        let later = now + Duration::seconds(2);
        let taken = store
            .claim_due("worker-b", later, later + Duration::seconds(30), 10)
            .await
            .unwrap();
        assert_eq!(taken.len(), 1);

        assert!(!store
            .extend_lease(&id, "worker-a", later + Duration::seconds(60))
            .await
            .unwrap());
        assert!(matches!(
            store.complete(&id, "worker-a").await,
            Err(JobStoreError::LeaseLost { .. })
        ));
        assert!(matches!(
            store.reschedule(&id, "worker-a", 1, later, "late").await,
            Err(JobStoreError::LeaseLost { .. })
        ));
        assert!(matches!(
            store.dead_letter(&id, "worker-a", "late", true).await,
            Err(JobStoreError::LeaseLost { .. })
        ));

        let stored = store.get(&id).await.unwrap().unwrap();
        assert_eq!(stored.lock_owner.as_deref(), Some("worker-b"));
        assert_eq!(stored.retry_count, 0);
        assert!(store.dead_letters().await.unwrap().is_empty());

        assert!(store
            .extend_lease(&id, "worker-b", later + Duration::seconds(60))
            .await
            .unwrap());
        assert!(store.complete(&id, "worker-b").await.unwrap());
    }

    #[tokio::test]
    async fn reschedule_releases_lease() {
        let store = InMemoryJobStore::new();
        let j = job("e1");
        let id = j.id.clone();
        store.insert(j).await.unwrap();
        let now = Utc::now() + Duration::seconds(1);
        store
            .claim_due("w", now, now + Duration::seconds(30), 10)
            .await
            .unwrap();

        store
            .reschedule(&id, "w", 1, now + Duration::seconds(5), "boom")
            .await
            .unwrap();
        let stored = store.get(&id).await.unwrap().unwrap();
        assert_eq!(stored.retry_count, 1);
        assert!(stored.lock_owner.is_none());
        assert_eq!(stored.last_error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn dead_letter_and_retry() {
        let store = InMemoryJobStore::new();
        let mut j = job("e1");
        j.retry_count = 3;
        let id = j.id.clone();
        store.insert(j).await.unwrap();
        claimed(&store, "w").await;

        store.dead_letter(&id, "w", "gave up", false).await.unwrap();
        assert!(store.pending().await.unwrap().is_empty());
        let dead = store.dead_letters().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].error, "gave up");
        assert!(!dead[0].permanent);

        let revived = store.retry_dead_letter(&id).await.unwrap();
        assert_eq!(revived.retry_count, 0);
        assert!(revived.lock_owner.is_none());
        assert!(store.dead_letters().await.unwrap().is_empty());
        assert_eq!(store.pending().await.unwrap().len(), 1);
        assert_eq!(claimed(&store, "w2").await.id, id);

        assert!(matches!(
            store.retry_dead_letter(&id).await,
            Err(JobStoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn complete_reports_missing() {
        let store = InMemoryJobStore::new();
        let j = job("e1");
        let id = j.id.clone();
        store.insert(j).await.unwrap();
        claimed(&store, "w").await;
        assert!(store.complete(&id, "w").await.unwrap());
        assert!(!store.complete(&id, "w").await.unwrap());
    }
}
