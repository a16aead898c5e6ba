//! Engine facade: the single entry point for embedding the trigger core.
//!
//! The [`ProcessEngine`] assembles the event registry, subscription store,
//! process runtime, trigger engine, dispatcher and job executor. Construct
//! via [`ProcessEngine::builder()`].
//!
//! ```rust,ignore
//! let engine = ProcessEngine::builder()
//!     .behavior("chargeCard", ChargeCard::new(gateway))
//!     .job_store_dir("./data/jobs")
//!     .trigger_mode(TriggerMode::Async)
//!     .build()?;
//!
//! engine.deploy_event_definition(order_paid())?;
//! engine.deploy_process(order_process()).await?;
//! engine.start_job_executor().await;
//! let result = engine.dispatch(br#"{"type":"orderPaid","orderId":"o-1"}"#).await?;
//! ```

mod builder;
pub mod config;
pub mod error;

pub use builder::EngineBuilder;
pub use config::{EngineConfig, TriggerMode};
pub use error::EngineError;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

use crate::dispatch::{DispatchResult, EventDispatcher, InboundChannel};
use crate::jobs::{JobExecutor, JobExecutorHandle, JobQueue, JobRunSummary};
use crate::registry::EventRegistry;
use crate::traits::{JobStore, ProcessLifecycle, SubscriptionStore};
use crate::trigger::{TriggerAck, TriggerEngine, TriggerRequest, TriggerResult};
use crate::types::{
    DeadLetterJob, EventDefinition, ExecutionSnapshot, InboundEvent, Job, ProcessDefinition,
    ProcessInstanceRecord, Variables,
};

/// The assembled process engine. Constructed via [`ProcessEngine::builder()`].
pub struct ProcessEngine {
    pub(super) config: EngineConfig,
    pub(super) registry: EventRegistry,
    pub(super) subscriptions: Arc<dyn SubscriptionStore>,
    pub(super) lifecycle: Arc<dyn ProcessLifecycle>,
    pub(super) jobs: JobQueue,
    pub(super) triggers: Arc<TriggerEngine>,
    pub(super) dispatcher: Arc<EventDispatcher>,
    pub(super) executor: Arc<JobExecutor>,
    /// Running worker pool, once started.
    pub(super) executor_handle: Mutex<Option<JobExecutorHandle>>,
    /// Stops inbound channel loops.
    pub(super) shutdown_tx: broadcast::Sender<()>,
    pub(super) channel_handles: Mutex<Vec<JoinHandle<usize>>>,
}

impl ProcessEngine {
    /// Create a new [`EngineBuilder`].
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &EventRegistry {
        &self.registry
    }

    pub fn subscriptions(&self) -> &Arc<dyn SubscriptionStore> {
        &self.subscriptions
    }

    pub fn lifecycle(&self) -> &Arc<dyn ProcessLifecycle> {
        &self.lifecycle
    }

    pub fn job_store(&self) -> &Arc<dyn JobStore> {
        self.jobs.store()
    }

    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.dispatcher
    }

    // -- deployment --------------------------------------------------------

    /// Register an event type. Replaces an earlier definition of the same key.
    pub fn deploy_event_definition(&self, definition: EventDefinition) -> Result<(), EngineError> {
        let key = definition.key.clone();
        self.registry.deploy(definition)?;
        tracing::info!(event_type = %key, "event definition deployed");
        Ok(())
    }

    /// Deploy a process definition and return its id (`key:version`).
    pub async fn deploy_process(&self, definition: ProcessDefinition) -> Result<String, EngineError> {
        Ok(self.lifecycle.deploy(definition).await?)
    }

    pub async fn undeploy_process(&self, process_definition_id: &str) -> Result<(), EngineError> {
        Ok(self.lifecycle.undeploy(process_definition_id).await?)
    }

    // -- instances ---------------------------------------------------------

    /// Start the latest deployed version of `key`.
    pub async fn start_process(&self, key: &str, variables: Variables) -> Result<String, EngineError> {
        let definition_id = self
            .lifecycle
            .latest_definition_id(key)
            .await?
            .ok_or_else(|| EngineError::ProcessNotDeployed {
                key: key.to_string(),
            })?;
        Ok(self
            .lifecycle
            .start_instance(&definition_id, variables, None)
            .await?)
    }

    pub async fn cancel_instance(&self, instance_id: &str, reason: &str) -> Result<(), EngineError> {
        Ok(self.lifecycle.cancel_instance(instance_id, reason).await?)
    }

    pub async fn instance(&self, instance_id: &str) -> Result<Option<ProcessInstanceRecord>, EngineError> {
        Ok(self.lifecycle.instance(instance_id).await?)
    }

    pub async fn execution(&self, execution_id: &str) -> Result<Option<ExecutionSnapshot>, EngineError> {
        Ok(self.lifecycle.execution(execution_id).await?)
    }

    pub async fn running_instances(
        &self,
        process_definition_id: Option<&str>,
    ) -> Result<Vec<ProcessInstanceRecord>, EngineError> {
        Ok(self.lifecycle.running_instances(process_definition_id).await?)
    }

    // -- triggering --------------------------------------------------------

    /// Resume a paused execution on the caller's task.
    pub async fn trigger(&self, request: TriggerRequest) -> Result<TriggerResult, EngineError> {
        Ok(self.triggers.trigger(request).await?)
    }

    /// Enqueue a trigger job; returns once the job is stored.
    pub async fn trigger_async(&self, request: TriggerRequest) -> Result<TriggerAck, EngineError> {
        Ok(self.triggers.trigger_async(request).await?)
    }

    /// Complete the user task an execution waits in.
    pub async fn complete_task(
        &self,
        execution_id: &str,
        variables: Variables,
    ) -> Result<TriggerResult, EngineError> {
        Ok(self.triggers.complete_task(execution_id, variables).await?)
    }

    /// Continue an execution past its wait node from a job, skipping trigger
    /// validation. The job is void once the execution leaves the node it
    /// waits in now.
    pub async fn advance_async(&self, execution_id: &str, variables: Variables) -> Result<TriggerAck, EngineError> {
        let request = TriggerRequest::new(execution_id).with_variables(variables);
        Ok(self.triggers.advance_async(request).await?)
    }

    // -- inbound events ----------------------------------------------------

    /// Decode and dispatch one raw event.
    pub async fn dispatch(&self, raw: &[u8]) -> Result<DispatchResult, EngineError> {
        Ok(self.dispatcher.dispatch(raw).await?)
    }

    pub async fn dispatch_event(&self, event: InboundEvent) -> Result<DispatchResult, EngineError> {
        Ok(self.dispatcher.dispatch_event(event).await?)
    }

    /// Open an inbound channel whose loop stops on [`shutdown`](Self::shutdown).
    pub async fn open_channel(&self, capacity: usize) -> InboundChannel {
        let (channel, handle) = InboundChannel::spawn(
            Arc::clone(&self.dispatcher),
            capacity,
            self.shutdown_tx.subscribe(),
        );
        self.channel_handles.lock().await.push(handle);
        channel
    }

    // -- jobs --------------------------------------------------------------

    /// Run every job due at `now` once, on the caller's task.
    pub async fn run_due_jobs(&self, now: DateTime<Utc>) -> Result<JobRunSummary, EngineError> {
        Ok(self.executor.run_due_jobs(now).await?)
    }

    pub async fn dead_letters(&self) -> Result<Vec<DeadLetterJob>, EngineError> {
        Ok(self.jobs.store().dead_letters().await?)
    }

    /// Move a dead letter back to the queue with its retries reset.
    pub async fn retry_dead_letter(&self, job_id: &str) -> Result<Job, EngineError> {
        Ok(self.jobs.store().retry_dead_letter(job_id).await?)
    }

    /// Spawn the job worker pool. No-op if already running.
    pub async fn start_job_executor(&self) {
        let mut handle = self.executor_handle.lock().await;
        if handle.is_none() {
            *handle = Some(Arc::clone(&self.executor).start());
        }
    }

    /// Stop inbound channels and the job worker pool, waiting for in-flight
    /// work to finish.
    pub async fn shutdown(&self) {
        // Channels may already be closed.
        let _ = self.shutdown_tx.send(());
        let handles = std::mem::take(&mut *self.channel_handles.lock().await);
        for handle in handles {
            let _ = handle.await;
        }
        if let Some(executor) = self.executor_handle.lock().await.take() {
            executor.shutdown().await;
        }
        tracing::info!("process engine stopped");
    }
}
