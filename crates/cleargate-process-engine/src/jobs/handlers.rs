//! Built-in job handlers.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::{JobFailure, JobStoreError};
use crate::traits::JobHandler;
use crate::trigger::{TriggerEngine, TriggerError, TriggerRequest, TriggerResult};
use crate::types::{Job, JobType, Variables};

/// Payload of `trigger` and `advance` jobs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TriggerJobPayload {
    #[serde(default)]
    pub variables: Variables,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transition_hint: Option<String>,
    /// Wait node the execution was in when the job was enqueued.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_node: Option<String>,
}

impl TriggerJobPayload {
    pub(crate) fn from_request(request: &TriggerRequest) -> Self {
        Self {
            variables: request.variables.clone(),
            transition_hint: request.transition_hint.clone(),
            expected_node: request.expected_node.clone(),
        }
    }

    fn into_request(self, execution_id: &str) -> TriggerRequest {
        TriggerRequest {
            execution_id: execution_id.to_string(),
            variables: self.variables,
            transition_hint: self.transition_hint,
            expected_node: self.expected_node,
        }
    }

    pub(crate) fn to_value(&self) -> Result<serde_json::Value, JobStoreError> {
        serde_json::to_value(self).map_err(|e| JobStoreError::Store {
            message: format!("failed to serialize job payload: {e}"),
        })
    }

    fn from_job(job: &Job) -> Result<Self, JobFailure> {
        serde_json::from_value(job.payload.clone()).map_err(|e| JobFailure::Permanent {
            message: format!("undecodable {} job payload: {e}", job.job_type),
        })
    }
}

/// Runs `trigger` jobs through the [`TriggerEngine`], with the same
/// validation and rollback as a synchronous trigger.
pub struct TriggerJobHandler {
    engine: Arc<TriggerEngine>,
}

impl TriggerJobHandler {
    pub fn new(engine: Arc<TriggerEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl JobHandler for TriggerJobHandler {
    fn job_type(&self) -> JobType {
        JobType::Trigger
    }

    async fn execute(&self, job: &Job) -> Result<(), JobFailure> {
        let request = TriggerJobPayload::from_job(job)?.into_request(&job.execution_id);
        job_result(self.engine.trigger(request).await)
    }
}

fn job_result(result: Result<TriggerResult, TriggerError>) -> Result<(), JobFailure> {
    match result {
        Ok(_) => Ok(()),
        Err(e) if e.is_permanent() => Err(JobFailure::Permanent {
            message: e.to_string(),
        }),
        Err(e) => Err(JobFailure::Transient {
            message: e.to_string(),
        }),
    }
}

/// Runs `advance` jobs through [`TriggerEngine::advance`]: under the
/// execution's lock and only while the execution still waits in the node it
/// waited in when the job was enqueued.
pub struct AdvanceJobHandler {
    engine: Arc<TriggerEngine>,
}

impl AdvanceJobHandler {
    pub fn new(engine: Arc<TriggerEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl JobHandler for AdvanceJobHandler {
    fn job_type(&self) -> JobType {
        JobType::Advance
    }

    async fn execute(&self, job: &Job) -> Result<(), JobFailure> {
        let request = TriggerJobPayload::from_job(job)?.into_request(&job.execution_id);
        job_result(self.engine.advance(request).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defaults::{InMemoryJobStore, InMemoryProcessRuntime, InMemorySubscriptionStore};
    use crate::errors::BehaviorError;
    use crate::jobs::JobQueue;
    use crate::traits::{ActivityBehavior, JobStore, ProcessLifecycle};
    use crate::types::{ActivityContext, InstanceState, ProcessDefinition, Variables};
    use async_trait::async_trait;
    use serde_json::json;

    struct Counting;

    #[async_trait]
    impl ActivityBehavior for Counting {
        async fn execute(&self, ctx: &mut ActivityContext) -> Result<(), BehaviorError> {
            ctx.set_variable("count", 1);
            Ok(())
        }
    }

    struct Fixture {
        runtime: Arc<InMemoryProcessRuntime>,
        engine: Arc<TriggerEngine>,
        jobs: Arc<InMemoryJobStore>,
    }

    fn fixture() -> Fixture {
        let subs = Arc::new(InMemorySubscriptionStore::new());
        let jobs = Arc::new(InMemoryJobStore::new());
        let runtime = Arc::new(InMemoryProcessRuntime::new(subs.clone()));
        runtime.register_behavior("counting", Arc::new(Counting));
        let engine = Arc::new(TriggerEngine::new(
            runtime.clone(),
            subs,
            JobQueue::new(jobs.clone()),
        ));
        Fixture {
            runtime,
            engine,
            jobs,
        }
    }

    #[tokio::test]
    async fn missing_execution_is_permanent() {
        let engine = fixture().engine;
        let handler = TriggerJobHandler::new(engine);
        let job = Job::new(JobType::Trigger, "gone", json!({}));
        let failure = handler.execute(&job).await.unwrap_err();
        assert!(failure.is_permanent());
        assert!(failure.message().contains("gone"));
    }

    #[tokio::test]
    async fn undecodable_payload_is_permanent() {
        let handler = AdvanceJobHandler::new(fixture().engine);
        let job = Job::new(JobType::Advance, "e1", json!({"variables": "not a map"}));
        let failure = handler.execute(&job).await.unwrap_err();
        assert!(failure.is_permanent());
    }

    #[tokio::test]
    async fn advance_job_is_void_once_the_execution_moved_on() {
        let f = fixture();
        let def_id = f
            .runtime
            .deploy(
                ProcessDefinition::new("process")
                    .service_task("service1", "counting", true)
                    .user_task("usertask1")
                    .flow("start", "service1")
                    .flow("service1", "usertask1"),
            )
            .await
            .unwrap();
        let instance = f
            .runtime
            .start_instance(&def_id, Variables::new(), None)
            .await
            .unwrap();
        let exec = f.runtime.instance(&instance).await.unwrap().unwrap().execution_id;

        let ack = f.engine.advance_async(TriggerRequest::new(&exec)).await.unwrap();
        let job = f.jobs.get(&ack.job_id).await.unwrap().unwrap();
        let payload = TriggerJobPayload::from_job(&job).unwrap();
        assert_eq!(payload.expected_node.as_deref(), Some("service1"));

        // A trigger gets there first and parks the execution in the user task.
        f.engine.trigger(TriggerRequest::new(&exec)).await.unwrap();

        let failure = AdvanceJobHandler::new(f.engine.clone())
            .execute(&job)
            .await
            .unwrap_err();
        assert!(failure.is_permanent());
        let record = f.runtime.instance(&instance).await.unwrap().unwrap();
        assert_eq!(record.state, InstanceState::Running);
        assert_eq!(record.current_node.as_deref(), Some("usertask1"));
    }

    #[test]
    fn payload_defaults_when_empty() {
        let job = Job::new(JobType::Trigger, "e1", json!({}));
        let payload = TriggerJobPayload::from_job(&job).unwrap();
        assert_eq!(payload, TriggerJobPayload::default());
    }
}
