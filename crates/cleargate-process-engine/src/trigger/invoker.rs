//! How a matched execution subscription is turned into a trigger.
//!
//! The dispatcher hands every [`TriggerRequest`] to one configured
//! [`TriggerInvoker`]: [`ImmediateTrigger`] runs it inline,
//! [`DeferredTrigger`] enqueues a `trigger` job for the job executor.

use std::sync::Arc;

use async_trait::async_trait;

use super::{TriggerAck, TriggerEngine, TriggerError, TriggerRequest, TriggerResult};

#[derive(Debug, Clone, PartialEq)]
pub enum InvokeOutcome {
    Triggered(TriggerResult),
    Enqueued(TriggerAck),
}

#[async_trait]
pub trait TriggerInvoker: Send + Sync {
    async fn invoke(&self, request: TriggerRequest) -> Result<InvokeOutcome, TriggerError>;
}

/// Trigger on the caller's task.
pub struct ImmediateTrigger {
    engine: Arc<TriggerEngine>,
}

impl ImmediateTrigger {
    pub fn new(engine: Arc<TriggerEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl TriggerInvoker for ImmediateTrigger {
    async fn invoke(&self, request: TriggerRequest) -> Result<InvokeOutcome, TriggerError> {
        self.engine.trigger(request).await.map(InvokeOutcome::Triggered)
    }
}

/// Trigger through a durable job.
pub struct DeferredTrigger {
    engine: Arc<TriggerEngine>,
}

impl DeferredTrigger {
    pub fn new(engine: Arc<TriggerEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl TriggerInvoker for DeferredTrigger {
    async fn invoke(&self, request: TriggerRequest) -> Result<InvokeOutcome, TriggerError> {
        self.engine
            .trigger_async(request)
            .await
            .map(InvokeOutcome::Enqueued)
    }
}
