//! Trigger engine: resumes a paused execution.
//!
//! A trigger validates that the execution exists and waits in a state that
//! accepts it, removes the execution's subscriptions, merges the supplied
//! variables and advances the execution through the
//! [`ProcessLifecycle`]. If advancing fails, the removed subscriptions are
//! restored and the lifecycle leaves the execution untouched, so the whole
//! trigger is one unit of work.
//!
//! Triggers on the same execution are serialized by a per-execution lock,
//! and at most one of the triggers that overlap in time advances it: a
//! trigger that waited for the lock while another one advanced the
//! execution fails with [`TriggerError::InvalidExecutionState`]. A request
//! may also pin the wait node it targets
//! ([`TriggerRequest::expecting_node`]); the asynchronous paths pin the node
//! the execution waits in when the job is enqueued.

pub mod invoker;

pub use invoker::{DeferredTrigger, ImmediateTrigger, InvokeOutcome, TriggerInvoker};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;

use crate::errors::{JobStoreError, LifecycleError, SubscriptionStoreError};
use crate::jobs::JobQueue;
use crate::traits::{ProcessLifecycle, SubscriptionStore};
use crate::types::{AdvanceOutcome, EventSubscription, Variables, WaitNodeKind};

// ---------------------------------------------------------------------------
// Requests and results
// ---------------------------------------------------------------------------

/// Resume `execution_id` with `variables`, leaving along `transition_hint`
/// (a boundary listener id or outgoing flow id) when given.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TriggerRequest {
    pub execution_id: String,
    #[serde(default)]
    pub variables: Variables,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transition_hint: Option<String>,
    /// Wait node the execution must still be in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_node: Option<String>,
}

impl TriggerRequest {
    pub fn new(execution_id: impl Into<String>) -> Self {
        Self {
            execution_id: execution_id.into(),
            variables: Variables::new(),
            transition_hint: None,
            expected_node: None,
        }
    }

    pub fn with_variables(mut self, variables: Variables) -> Self {
        self.variables = variables;
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.transition_hint = Some(hint.into());
        self
    }

    /// Fail with `InvalidExecutionState` unless the execution still waits
    /// in `node_id`.
    pub fn expecting_node(mut self, node_id: impl Into<String>) -> Self {
        self.expected_node = Some(node_id.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TriggerResult {
    pub execution_id: String,
    pub process_instance_id: String,
    pub outcome: AdvanceOutcome,
}

/// Returned by the asynchronous path once the trigger job is enqueued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerAck {
    pub job_id: String,
}

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("execution not found: {execution_id}")]
    ExecutionNotFound { execution_id: String },
    #[error("execution {execution_id} cannot be triggered: {message}")]
    InvalidExecutionState {
        execution_id: String,
        message: String,
    },
    #[error("trigger of execution {execution_id} failed: {source}")]
    TriggerFailed {
        execution_id: String,
        #[source]
        source: LifecycleError,
    },
    #[error("subscription error: {0}")]
    Subscription(#[from] SubscriptionStoreError),
    #[error("failed to enqueue trigger job: {0}")]
    Enqueue(#[from] JobStoreError),
}

impl TriggerError {
    /// Precondition failures that no retry can fix.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::ExecutionNotFound { .. } | Self::InvalidExecutionState { .. }
        )
    }

    fn from_lifecycle(execution_id: &str, error: LifecycleError) -> Self {
        match error {
            LifecycleError::ExecutionNotFound { .. } | LifecycleError::InstanceNotFound { .. } => {
                Self::ExecutionNotFound {
                    execution_id: execution_id.to_string(),
                }
            }
            LifecycleError::InvalidState { message, .. } => Self::InvalidExecutionState {
                execution_id: execution_id.to_string(),
                message,
            },
            other => Self::TriggerFailed {
                execution_id: execution_id.to_string(),
                source: other,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Per-execution locks
// ---------------------------------------------------------------------------

/// Lock of one execution plus the number of advances made under it.
#[derive(Default)]
struct ExecutionSlot {
    mutex: Arc<tokio::sync::Mutex<()>>,
    advances: AtomicU64,
}

/// One slot per execution id, created on demand and dropped when no task
/// holds or waits for it.
#[derive(Default)]
struct ExecutionLocks {
    locks: parking_lot::Mutex<HashMap<String, Arc<ExecutionSlot>>>,
}

struct ExecutionGuard<'a> {
    locks: &'a ExecutionLocks,
    execution_id: String,
    slot: Arc<ExecutionSlot>,
    /// Advances seen when this task queued for the lock.
    seen: u64,
    guard: Option<OwnedMutexGuard<()>>,
}

impl ExecutionLocks {
    async fn lock(&self, execution_id: &str) -> ExecutionGuard<'_> {
        let (slot, seen) = {
            let mut map = self.locks.lock();
            let slot = map.entry(execution_id.to_string()).or_default().clone();
            let seen = slot.advances.load(Ordering::Acquire);
            (slot, seen)
        };
        let guard = slot.mutex.clone().lock_owned().await;
        ExecutionGuard {
            locks: self,
            execution_id: execution_id.to_string(),
            slot,
            seen,
            guard: Some(guard),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().len()
    }
}

impl ExecutionGuard<'_> {
    /// Whether another task advanced the execution while this one queued.
    fn superseded(&self) -> bool {
        self.slot.advances.load(Ordering::Acquire) != self.seen
    }

    fn record_advance(&self) {
        self.slot.advances.fetch_add(1, Ordering::AcqRel);
    }
}

impl Drop for ExecutionGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut map = self.locks.locks.lock();
        // Map entry + this guard: nobody else holds or waits.
        if Arc::strong_count(&self.slot) == 2 {
            map.remove(&self.execution_id);
        }
    }
}

// ---------------------------------------------------------------------------
// TriggerEngine
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, PartialEq, Eq)]
enum Resume {
    /// An external signal: the execution must accept a trigger.
    Signal,
    /// A person completing a user task.
    CompleteTask,
    /// A continuation job: any wait node kind.
    Advance,
}

pub struct TriggerEngine {
    lifecycle: Arc<dyn ProcessLifecycle>,
    subscriptions: Arc<dyn SubscriptionStore>,
    jobs: JobQueue,
    locks: ExecutionLocks,
}

impl TriggerEngine {
    pub fn new(
        lifecycle: Arc<dyn ProcessLifecycle>,
        subscriptions: Arc<dyn SubscriptionStore>,
        jobs: JobQueue,
    ) -> Self {
        Self {
            lifecycle,
            subscriptions,
            jobs,
            locks: ExecutionLocks::default(),
        }
    }

    /// Resume a paused execution synchronously.
    pub async fn trigger(&self, request: TriggerRequest) -> Result<TriggerResult, TriggerError> {
        self.resume(request, Resume::Signal).await
    }

    /// Enqueue a `trigger` job and return once it is durably stored. The
    /// job only applies to the wait node the execution is in now.
    pub async fn trigger_async(&self, mut request: TriggerRequest) -> Result<TriggerAck, TriggerError> {
        self.pin_current_node(&mut request).await?;
        let job_id = self.jobs.enqueue_trigger(&request).await?;
        tracing::debug!(
            execution_id = %request.execution_id,
            job_id = %job_id,
            "trigger enqueued"
        );
        Ok(TriggerAck { job_id })
    }

    /// Complete the user task an execution waits in.
    pub async fn complete_task(
        &self,
        execution_id: &str,
        variables: Variables,
    ) -> Result<TriggerResult, TriggerError> {
        self.resume(
            TriggerRequest::new(execution_id).with_variables(variables),
            Resume::CompleteTask,
        )
        .await
    }

    /// Continue an execution past its wait node, whatever kind of node it
    /// is. Locking, the pinned-node check and rollback match `trigger`.
    pub async fn advance(&self, request: TriggerRequest) -> Result<TriggerResult, TriggerError> {
        self.resume(request, Resume::Advance).await
    }

    /// Enqueue an `advance` job for the wait node the execution is in now.
    pub async fn advance_async(&self, mut request: TriggerRequest) -> Result<TriggerAck, TriggerError> {
        self.pin_current_node(&mut request).await?;
        let job_id = self.jobs.enqueue_advance(&request).await?;
        tracing::debug!(
            execution_id = %request.execution_id,
            job_id = %job_id,
            "advance enqueued"
        );
        Ok(TriggerAck { job_id })
    }

    /// Set `expected_node` to the current wait node unless the caller did.
    /// An unknown execution is left unpinned; its job fails when it runs.
    async fn pin_current_node(&self, request: &mut TriggerRequest) -> Result<(), TriggerError> {
        if request.expected_node.is_some() {
            return Ok(());
        }
        request.expected_node = self
            .lifecycle
            .execution(&request.execution_id)
            .await
            .map_err(|e| TriggerError::from_lifecycle(&request.execution_id, e))?
            .map(|snapshot| snapshot.node_id);
        Ok(())
    }

    async fn resume(&self, request: TriggerRequest, mode: Resume) -> Result<TriggerResult, TriggerError> {
        let execution_id = request.execution_id.as_str();
        let guard = self.locks.lock(execution_id).await;
        if guard.superseded() {
            return Err(TriggerError::InvalidExecutionState {
                execution_id: execution_id.to_string(),
                message: "execution advanced while this trigger waited".into(),
            });
        }

        let snapshot = self
            .lifecycle
            .execution(execution_id)
            .await
            .map_err(|e| TriggerError::from_lifecycle(execution_id, e))?
            .ok_or_else(|| TriggerError::ExecutionNotFound {
                execution_id: execution_id.to_string(),
            })?;

        if let Some(expected) = request.expected_node.as_deref() {
            if snapshot.node_id != expected {
                return Err(TriggerError::InvalidExecutionState {
                    execution_id: execution_id.to_string(),
                    message: format!("execution moved from {expected} to {}", snapshot.node_id),
                });
            }
        }

        let hint = request.transition_hint.as_deref();
        let accepted = match mode {
            Resume::Signal => snapshot.accepts_trigger(hint),
            Resume::CompleteTask => snapshot.node_kind == WaitNodeKind::UserTask,
            Resume::Advance => true,
        };
        if !accepted {
            return Err(TriggerError::InvalidExecutionState {
                execution_id: execution_id.to_string(),
                message: format!("node {} ({:?}) does not accept this trigger", snapshot.node_id, snapshot.node_kind),
            });
        }

        let removed = self
            .subscriptions
            .delete_by_owner_execution(execution_id)
            .await?;

        match self
            .lifecycle
            .advance(execution_id, request.variables, hint)
            .await
        {
            Ok(outcome) => {
                guard.record_advance();
                tracing::debug!(
                    execution_id = %execution_id,
                    process_instance_id = %snapshot.process_instance_id,
                    from = %snapshot.node_id,
                    outcome = ?outcome,
                    "execution triggered"
                );
                Ok(TriggerResult {
                    execution_id: execution_id.to_string(),
                    process_instance_id: snapshot.process_instance_id,
                    outcome,
                })
            }
            Err(e) => {
                self.restore(removed).await;
                tracing::warn!(execution_id = %execution_id, error = %e, "trigger failed, rolled back");
                Err(TriggerError::from_lifecycle(execution_id, e))
            }
        }
    }

    async fn restore(&self, removed: Vec<EventSubscription>) {
        if removed.is_empty() {
            return;
        }
        if let Err(e) = self.subscriptions.restore(removed).await {
            tracing::error!(error = %e, "failed to restore subscriptions after failed trigger");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defaults::{InMemoryJobStore, InMemoryProcessRuntime, InMemorySubscriptionStore};
    use crate::errors::BehaviorError;
    use crate::traits::{ActivityBehavior, JobStore};
    use crate::types::{
        variables, ActivityContext, EventListenerDef, EventValue, JobType, ProcessDefinition,
    };
    use async_trait::async_trait;

    struct CountingBehavior;

    #[async_trait]
    impl ActivityBehavior for CountingBehavior {
        async fn execute(&self, ctx: &mut ActivityContext) -> Result<(), BehaviorError> {
            ctx.set_variable("count", 1);
            Ok(())
        }

        async fn trigger(&self, ctx: &mut ActivityContext) -> Result<(), BehaviorError> {
            let count = ctx.variable("count").and_then(|v| v.as_i64()).unwrap_or(0);
            ctx.set_variable("count", count + 1);
            Ok(())
        }
    }

    struct RejectingTrigger;

    #[async_trait]
    impl ActivityBehavior for RejectingTrigger {
        async fn execute(&self, _ctx: &mut ActivityContext) -> Result<(), BehaviorError> {
            Ok(())
        }

        async fn trigger(&self, _ctx: &mut ActivityContext) -> Result<(), BehaviorError> {
            Err(BehaviorError::new("callback rejected"))
        }
    }

    /// Gives way to other tasks while resuming.
    struct YieldingTrigger;

    #[async_trait]
    impl ActivityBehavior for YieldingTrigger {
        async fn execute(&self, _ctx: &mut ActivityContext) -> Result<(), BehaviorError> {
            Ok(())
        }

        async fn trigger(&self, _ctx: &mut ActivityContext) -> Result<(), BehaviorError> {
            tokio::task::yield_now().await;
            Ok(())
        }
    }

    struct Fixture {
        runtime: Arc<InMemoryProcessRuntime>,
        subs: Arc<InMemorySubscriptionStore>,
        jobs: Arc<InMemoryJobStore>,
        engine: Arc<TriggerEngine>,
    }

    fn fixture() -> Fixture {
        let subs = Arc::new(InMemorySubscriptionStore::new());
        let jobs = Arc::new(InMemoryJobStore::new());
        let runtime = Arc::new(InMemoryProcessRuntime::new(subs.clone()));
        runtime.register_behavior("counting", Arc::new(CountingBehavior));
        runtime.register_behavior("rejecting", Arc::new(RejectingTrigger));
        runtime.register_behavior("yielding", Arc::new(YieldingTrigger));
        let engine = Arc::new(TriggerEngine::new(
            runtime.clone(),
            subs.clone(),
            JobQueue::new(jobs.clone()),
        ));
        Fixture {
            runtime,
            subs,
            jobs,
            engine,
        }
    }

    /// Deploy and start `def`; returns (instance id, execution id).
    async fn start(f: &Fixture, def: ProcessDefinition) -> (String, String) {
        let def_id = f.runtime.deploy(def).await.unwrap();
        let instance = f
            .runtime
            .start_instance(&def_id, Variables::new(), None)
            .await
            .unwrap();
        let exec = f
            .runtime
            .instance(&instance)
            .await
            .unwrap()
            .unwrap()
            .execution_id;
        (instance, exec)
    }

    fn service_process(behavior: &str) -> ProcessDefinition {
        ProcessDefinition::new("process")
            .service_task("service1", behavior, true)
            .user_task("usertask1")
            .boundary("service1", "timeoutEvent", EventListenerDef::new("myEvent"), "usertask1")
            .flow("start", "service1")
            .flow("service1", "usertask1")
    }

    fn chained_process() -> ProcessDefinition {
        ProcessDefinition::new("chained")
            .service_task("s1", "yielding", true)
            .service_task("s2", "yielding", true)
            .user_task("u")
            .flow("start", "s1")
            .flow("s1", "s2")
            .flow("s2", "u")
    }

    #[tokio::test]
    async fn trigger_merges_variables_and_removes_subscriptions() {
        let f = fixture();
        let (instance, exec) = start(&f, service_process("counting")).await;

        let result = f
            .engine
            .trigger(TriggerRequest::new(&exec).with_variables(variables([("count", 2)])))
            .await
            .unwrap();
        assert_eq!(result.process_instance_id, instance);
        assert_eq!(
            result.outcome,
            AdvanceOutcome::Waiting {
                node_id: "usertask1".into()
            }
        );

        let record = f.runtime.instance(&instance).await.unwrap().unwrap();
        assert_eq!(record.variables.get("count"), Some(&EventValue::Integer(3)));
        assert!(f.subs.find_by_owner_execution(&exec).await.unwrap().is_empty());
        assert_eq!(f.engine.locks.len(), 0);
    }

    #[tokio::test]
    async fn unknown_execution_is_reported() {
        let f = fixture();
        let err = f.engine.trigger(TriggerRequest::new("nope")).await.unwrap_err();
        assert!(matches!(err, TriggerError::ExecutionNotFound { .. }));
        assert!(err.is_permanent());
    }

    #[tokio::test]
    async fn user_task_rejects_plain_trigger_but_completes() {
        let f = fixture();
        let (instance, exec) = start(&f, service_process("counting")).await;
        f.engine.trigger(TriggerRequest::new(&exec)).await.unwrap();

        let err = f.engine.trigger(TriggerRequest::new(&exec)).await.unwrap_err();
        assert!(matches!(err, TriggerError::InvalidExecutionState { .. }));

        let done = f.engine.complete_task(&exec, Variables::new()).await.unwrap();
        assert_eq!(done.outcome, AdvanceOutcome::Completed);
        let record = f.runtime.instance(&instance).await.unwrap().unwrap();
        assert!(record.state.is_terminal());
    }

    #[tokio::test]
    async fn complete_task_rejects_non_user_task() {
        let f = fixture();
        let (_, exec) = start(&f, service_process("counting")).await;
        let err = f.engine.complete_task(&exec, Variables::new()).await.unwrap_err();
        assert!(matches!(err, TriggerError::InvalidExecutionState { .. }));
    }

    #[tokio::test]
    async fn failed_advance_restores_subscriptions() {
        let f = fixture();
        let (instance, exec) = start(&f, service_process("rejecting")).await;
        let before = f.subs.find_by_owner_execution(&exec).await.unwrap();

        let err = f
            .engine
            .trigger(TriggerRequest::new(&exec).with_variables(variables([("x", 1)])))
            .await
            .unwrap_err();
        assert!(matches!(err, TriggerError::TriggerFailed { .. }));
        assert!(!err.is_permanent());

        let after = f.subs.find_by_owner_execution(&exec).await.unwrap();
        assert_eq!(
            before.iter().map(|s| &s.id).collect::<Vec<_>>(),
            after.iter().map(|s| &s.id).collect::<Vec<_>>()
        );
        let record = f.runtime.instance(&instance).await.unwrap().unwrap();
        assert_eq!(record.current_node.as_deref(), Some("service1"));
        assert!(record.variables.get("x").is_none());
    }

    #[tokio::test]
    async fn concurrent_triggers_resume_once() {
        let f = fixture();
        let (instance, exec) = start(&f, service_process("counting")).await;

        let a = {
            let engine = f.engine.clone();
            let exec = exec.clone();
            tokio::spawn(async move { engine.trigger(TriggerRequest::new(exec)).await })
        };
        let b = {
            let engine = f.engine.clone();
            let exec = exec.clone();
            tokio::spawn(async move { engine.trigger(TriggerRequest::new(exec)).await })
        };
        let results = [a.await.unwrap(), b.await.unwrap()];
        let ok = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(ok, 1);
        assert!(results.iter().any(|r| matches!(r, Err(TriggerError::InvalidExecutionState { .. }))));

        let record = f.runtime.instance(&instance).await.unwrap().unwrap();
        assert_eq!(record.variables.get("count"), Some(&EventValue::Integer(2)));
    }

    #[tokio::test]
    async fn overlapping_triggers_advance_one_wait_state() {
        let f = fixture();
        let (instance, exec) = start(&f, chained_process()).await;

        let (a, b) = tokio::join!(
            f.engine.trigger(TriggerRequest::new(&exec)),
            f.engine.trigger(TriggerRequest::new(&exec)),
        );
        let results = [a, b];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(TriggerError::InvalidExecutionState { .. }))));
        let record = f.runtime.instance(&instance).await.unwrap().unwrap();
        assert_eq!(record.current_node.as_deref(), Some("s2"));
        assert_eq!(f.engine.locks.len(), 0);

        // A trigger arriving afterwards resumes the next wait state.
        let next = f.engine.trigger(TriggerRequest::new(&exec)).await.unwrap();
        assert_eq!(next.outcome, AdvanceOutcome::Waiting { node_id: "u".into() });
    }

    #[tokio::test]
    async fn pinned_trigger_fails_once_the_execution_moved_on() {
        let f = fixture();
        let (instance, exec) = start(&f, chained_process()).await;

        f.engine
            .trigger(TriggerRequest::new(&exec).expecting_node("s1"))
            .await
            .unwrap();
        let err = f
            .engine
            .trigger(TriggerRequest::new(&exec).expecting_node("s1"))
            .await
            .unwrap_err();
        assert!(matches!(err, TriggerError::InvalidExecutionState { .. }));
        assert!(err.is_permanent());
        let record = f.runtime.instance(&instance).await.unwrap().unwrap();
        assert_eq!(record.current_node.as_deref(), Some("s2"));
    }

    #[test]
    fn vanished_instance_counts_as_missing_execution() {
        let err = TriggerError::from_lifecycle(
            "e1",
            LifecycleError::InstanceNotFound { id: "i1".into() },
        );
        assert!(matches!(err, TriggerError::ExecutionNotFound { .. }));
        assert!(err.is_permanent());
    }

    #[tokio::test]
    async fn trigger_async_enqueues_job() {
        let f = fixture();
        let (_, exec) = start(&f, service_process("counting")).await;

        let ack = f
            .engine
            .trigger_async(TriggerRequest::new(&exec).with_variables(variables([("count", 2)])))
            .await
            .unwrap();
        let job = f.jobs.get(&ack.job_id).await.unwrap().expect("job stored");
        assert_eq!(job.job_type, JobType::Trigger);
        assert_eq!(job.execution_id, exec);
        assert_eq!(job.payload["expected_node"], "service1");
        // Nothing happens until a worker runs the job.
        assert!(f.runtime.execution(&exec).await.unwrap().is_some());
    }
}
