//! Durable deferred work.
//!
//! [`JobQueue`] enqueues jobs into a [`JobStore`]; [`JobExecutor`] claims due
//! jobs, runs the [`JobHandler`](crate::traits::JobHandler) registered for
//! their type and applies the retry policy. The bundled handlers resume
//! executions through the trigger engine, either as a validated trigger
//! ([`TriggerJobHandler`]) or as a plain continuation
//! ([`AdvanceJobHandler`]).

pub mod executor;
pub mod handlers;

pub use executor::{JobExecutor, JobExecutorConfig, JobExecutorHandle, JobOutcome, JobRunSummary};
pub use handlers::{AdvanceJobHandler, TriggerJobHandler, TriggerJobPayload};

use std::sync::Arc;

use crate::errors::JobStoreError;
use crate::traits::JobStore;
use crate::trigger::TriggerRequest;
use crate::types::{Job, JobType};

/// Enqueue side of the job subsystem. Cheap to clone.
#[derive(Clone)]
pub struct JobQueue {
    store: Arc<dyn JobStore>,
}

impl JobQueue {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Persist a job. Returns its id once stored.
    pub async fn enqueue(&self, job: Job) -> Result<String, JobStoreError> {
        let id = job.id.clone();
        tracing::debug!(job_id = %id, job_type = %job.job_type, execution_id = %job.execution_id, "job enqueued");
        self.store.insert(job).await?;
        Ok(id)
    }

    pub async fn enqueue_trigger(&self, request: &TriggerRequest) -> Result<String, JobStoreError> {
        self.enqueue_request(JobType::Trigger, request).await
    }

    /// Continue an execution asynchronously, past its current wait node.
    pub async fn enqueue_advance(&self, request: &TriggerRequest) -> Result<String, JobStoreError> {
        self.enqueue_request(JobType::Advance, request).await
    }

    async fn enqueue_request(
        &self,
        job_type: JobType,
        request: &TriggerRequest,
    ) -> Result<String, JobStoreError> {
        let payload = TriggerJobPayload::from_request(request);
        self.enqueue(Job::new(job_type, request.execution_id.clone(), payload.to_value()?))
            .await
    }
}
