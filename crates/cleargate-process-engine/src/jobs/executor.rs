//! Job executor: worker pool over a [`JobStore`].
//!
//! Each worker is a tokio task that claims a batch of due jobs under a
//! lease, runs them one by one and sleeps for the poll interval when nothing
//! is due. A job's lease is renewed right before it runs and every half
//! lease while its handler is busy. Outcomes:
//!
//! - success: the job is deleted;
//! - transient failure: `retry_count` is bumped and the job rescheduled per
//!   the [`JobRetryPolicy`], or dead-lettered once retries are exhausted;
//! - permanent failure or no handler for the job type: dead-lettered at once;
//! - lease lost to another worker: the outcome is discarded and the job left
//!   to its new holder.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::errors::{JobFailure, JobStoreError};
use crate::traits::{JobHandler, JobStore};
use crate::types::{Job, JobRetryPolicy, JobType};

/// Worker pool settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct JobExecutorConfig {
    /// Concurrent workers. Default: 2.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Sleep between polls when no job is due. Default: 500 ms.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Lease length; a job whose worker dies is reclaimable after it.
    /// Default: 300 000 (5 min).
    #[serde(default = "default_lock_duration_ms")]
    pub lock_duration_ms: u64,
    /// Jobs claimed per poll. Default: 10.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for JobExecutorConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            poll_interval_ms: default_poll_interval_ms(),
            lock_duration_ms: default_lock_duration_ms(),
            batch_size: default_batch_size(),
        }
    }
}

fn default_workers() -> usize {
    2
}
fn default_poll_interval_ms() -> u64 {
    500
}
fn default_lock_duration_ms() -> u64 {
    300_000
}
fn default_batch_size() -> usize {
    10
}

/// Longest accepted lease: one week.
pub const MAX_LOCK_DURATION_MS: u64 = 7 * 24 * 60 * 60 * 1000;

impl JobExecutorConfig {
    /// Reject settings the worker pool cannot run with.
    pub fn validate(&self) -> Result<(), String> {
        if self.workers == 0 {
            return Err("job_executor.workers must be at least 1".into());
        }
        if self.batch_size == 0 {
            return Err("job_executor.batch_size must be at least 1".into());
        }
        if self.poll_interval_ms == 0 {
            return Err("job_executor.poll_interval_ms must be at least 1".into());
        }
        if self.lock_duration_ms == 0 || self.lock_duration_ms > MAX_LOCK_DURATION_MS {
            return Err(format!(
                "job_executor.lock_duration_ms must be between 1 and {MAX_LOCK_DURATION_MS}"
            ));
        }
        Ok(())
    }
}

/// What happened to one job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed,
    Retried {
        retry_count: u32,
        due_time: DateTime<Utc>,
    },
    DeadLettered {
        permanent: bool,
    },
    /// Another worker holds the lease now; nothing was recorded.
    LeaseLost,
}

/// Totals of one [`JobExecutor::run_due_jobs`] pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobRunSummary {
    pub completed: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    pub lease_lost: usize,
}

impl JobRunSummary {
    fn record(&mut self, outcome: &JobOutcome) {
        match outcome {
            JobOutcome::Completed => self.completed += 1,
            JobOutcome::Retried { .. } => self.retried += 1,
            JobOutcome::DeadLettered { .. } => self.dead_lettered += 1,
            JobOutcome::LeaseLost => self.lease_lost += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.completed + self.retried + self.dead_lettered + self.lease_lost
    }
}

pub struct JobExecutor {
    store: Arc<dyn JobStore>,
    handlers: HashMap<JobType, Arc<dyn JobHandler>>,
    retry: JobRetryPolicy,
    config: JobExecutorConfig,
}

impl JobExecutor {
    pub fn new(store: Arc<dyn JobStore>, retry: JobRetryPolicy, config: JobExecutorConfig) -> Self {
        Self {
            store,
            handlers: HashMap::new(),
            retry,
            config,
        }
    }

    /// Register a handler for its job type, replacing any previous one.
    pub fn with_handler(mut self, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.insert(handler.job_type(), handler);
        self
    }

    fn lease_length(&self) -> Duration {
        let ms = self.config.lock_duration_ms.clamp(1, MAX_LOCK_DURATION_MS);
        Duration::milliseconds(ms as i64)
    }

    fn renew_every(&self) -> std::time::Duration {
        let ms = self.config.lock_duration_ms.clamp(1, MAX_LOCK_DURATION_MS);
        std::time::Duration::from_millis((ms / 2).max(1))
    }

    /// Claim and run every job due at `now`, once. Jobs rescheduled during
    /// the pass wait for the next one.
    pub async fn run_due_jobs(&self, now: DateTime<Utc>) -> Result<JobRunSummary, JobStoreError> {
        let owner = format!("pass-{}", uuid::Uuid::new_v4());
        let jobs = self
            .store
            .claim_due(&owner, now, now + self.lease_length(), usize::MAX)
            .await?;
        let mut summary = JobRunSummary::default();
        for job in jobs {
            let outcome = self.execute_job(job, &owner, now).await?;
            summary.record(&outcome);
        }
        Ok(summary)
    }

    /// Run one job leased by `owner` and record its outcome in the store.
    pub async fn execute_job(
        &self,
        job: Job,
        owner: &str,
        now: DateTime<Utc>,
    ) -> Result<JobOutcome, JobStoreError> {
        // Earlier jobs of the batch used up part of the claim's lease.
        if !self
            .store
            .extend_lease(&job.id, owner, now + self.lease_length())
            .await?
        {
            tracing::warn!(job_id = %job.id, worker = %owner, "job lease lost before it ran");
            return Ok(JobOutcome::LeaseLost);
        }

        let result = match self.handlers.get(&job.job_type) {
            Some(handler) => self.run_leased(&job, owner, handler.execute(&job)).await,
            None => Err(JobFailure::Permanent {
                message: format!("no handler registered for job type {}", job.job_type),
            }),
        };

        let recorded = match result {
            Ok(()) => self.store.complete(&job.id, owner).await.map(|_| {
                tracing::debug!(job_id = %job.id, job_type = %job.job_type, "job completed");
                JobOutcome::Completed
            }),
            Err(failure) => self.fail(&job, owner, failure, now).await,
        };
        match recorded {
            Err(JobStoreError::LeaseLost { .. }) => {
                tracing::warn!(job_id = %job.id, worker = %owner, "job lease lost, outcome discarded");
                Ok(JobOutcome::LeaseLost)
            }
            other => other,
        }
    }

    /// Drive `work` to completion, renewing the job's lease meanwhile.
    async fn run_leased(
        &self,
        job: &Job,
        owner: &str,
        work: impl Future<Output = Result<(), JobFailure>>,
    ) -> Result<(), JobFailure> {
        tokio::pin!(work);
        let every = self.renew_every();
        let mut renew = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
        loop {
            tokio::select! {
                result = &mut work => return result,
                _ = renew.tick() => {
                    let until = Utc::now() + self.lease_length();
                    match self.store.extend_lease(&job.id, owner, until).await {
                        Ok(true) => {}
                        Ok(false) => {
                            tracing::warn!(job_id = %job.id, worker = %owner, "job lease lost while running");
                        }
                        Err(e) => {
                            tracing::warn!(job_id = %job.id, worker = %owner, error = %e, "failed to renew job lease");
                        }
                    }
                }
            }
        }
    }

    async fn fail(
        &self,
        job: &Job,
        owner: &str,
        failure: JobFailure,
        now: DateTime<Utc>,
    ) -> Result<JobOutcome, JobStoreError> {
        let message = failure.message();
        if !failure.is_permanent() && self.retry.allows_retry(job.retry_count) {
            let retry_count = job.retry_count + 1;
            let due_time = now + self.retry.delay_for(retry_count);
            self.store
                .reschedule(&job.id, owner, retry_count, due_time, message)
                .await?;
            tracing::debug!(
                job_id = %job.id,
                retry_count,
                due_time = %due_time,
                error = %message,
                "job failed, retry scheduled"
            );
            return Ok(JobOutcome::Retried {
                retry_count,
                due_time,
            });
        }

        let permanent = failure.is_permanent();
        self.store
            .dead_letter(&job.id, owner, message, permanent)
            .await?;
        tracing::warn!(
            job_id = %job.id,
            job_type = %job.job_type,
            execution_id = %job.execution_id,
            retry_count = job.retry_count,
            permanent,
            error = %message,
            "job dead-lettered"
        );
        Ok(JobOutcome::DeadLettered { permanent })
    }

    /// Spawn the worker pool.
    pub fn start(self: Arc<Self>) -> JobExecutorHandle {
        let (shutdown_tx, _) = broadcast::channel(1);
        let handles = (0..self.config.workers.max(1))
            .map(|n| {
                let executor = Arc::clone(&self);
                let shutdown_rx = shutdown_tx.subscribe();
                let owner = format!("worker-{n}-{}", uuid::Uuid::new_v4());
                tokio::spawn(async move { executor.worker_loop(owner, shutdown_rx).await })
            })
            .collect();
        tracing::info!(workers = self.config.workers.max(1), "job executor started");
        JobExecutorHandle {
            shutdown_tx,
            handles,
        }
    }

    async fn worker_loop(&self, owner: String, mut shutdown: broadcast::Receiver<()>) {
        let poll = std::time::Duration::from_millis(self.config.poll_interval_ms);
        loop {
            let now = Utc::now();
            let claimed = match self
                .store
                .claim_due(&owner, now, now + self.lease_length(), self.config.batch_size)
                .await
            {
                Ok(jobs) => jobs,
                Err(e) => {
                    tracing::warn!(worker = %owner, error = %e, "failed to claim jobs");
                    Vec::new()
                }
            };

            let idle = claimed.is_empty();
            for job in claimed {
                let job_id = job.id.clone();
                if let Err(e) = self.execute_job(job, &owner, Utc::now()).await {
                    tracing::error!(worker = %owner, job_id = %job_id, error = %e, "failed to record job outcome");
                }
            }

            if idle {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = tokio::time::sleep(poll) => {}
                }
            } else if !matches!(shutdown.try_recv(), Err(broadcast::error::TryRecvError::Empty)) {
                break;
            }
        }
        tracing::debug!(worker = %owner, "job worker stopped");
    }
}

/// Running worker pool.
pub struct JobExecutorHandle {
    shutdown_tx: broadcast::Sender<()>,
    handles: Vec<JoinHandle<()>>,
}

impl JobExecutorHandle {
    /// Signal every worker and wait for them to finish their current job.
    pub async fn shutdown(self) {
        // Workers may already be gone.
        let _ = self.shutdown_tx.send(());
        for result in futures::future::join_all(self.handles).await {
            if let Err(e) = result {
                tracing::error!(error = %e, "job worker panicked");
            }
        }
    }
}
