//! In-memory process runtime.
//!
//! Executes [`ProcessDefinition`] graphs with one execution per instance.
//! Service tasks run registered [`ActivityBehavior`]s; triggerable service
//! tasks, receive tasks, user tasks and intermediate catch events are wait
//! states. Entering a wait state creates the execution's subscriptions
//! (its own listener plus one per boundary listener); leaving it deletes
//! them.
//!
//! Every operation works on a copy of the instance and commits it only when
//! the graph walk and the subscription changes have all succeeded.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use crate::errors::{LifecycleError, SubscriptionStoreError};
use crate::traits::{ActivityBehavior, ProcessLifecycle, SubscriptionStore};
use crate::types::{
    ActivityContext, AdvanceOutcome, CorrelationSource, EventListenerDef, EventValue,
    ExecutionSnapshot, InstanceReference, InstanceState, NewSubscription, NodeDef, NodeKind,
    ProcessDefinition, ProcessInstanceRecord, Variables,
};

/// Upper bound on nodes visited in one walk; guards against flow cycles
/// without a wait state.
const MAX_STEPS: usize = 10_000;

struct InstanceEntry {
    record: ProcessInstanceRecord,
    execution_id: String,
}

#[derive(Default)]
struct Inner {
    definitions: HashMap<String, Arc<ProcessDefinition>>,
    /// key → (version, definition id)
    latest: HashMap<String, (u32, String)>,
    undeployed: HashSet<String>,
    instances: HashMap<String, InstanceEntry>,
    /// execution id → instance id, for running instances only
    executions: HashMap<String, String>,
}

impl Inner {
    fn definition(&self, id: &str) -> Result<Arc<ProcessDefinition>, LifecycleError> {
        self.definitions
            .get(id)
            .cloned()
            .ok_or_else(|| LifecycleError::DefinitionNotFound { id: id.to_string() })
    }
}

/// Reference implementation of [`ProcessLifecycle`].
pub struct InMemoryProcessRuntime {
    subscriptions: Arc<dyn SubscriptionStore>,
    behaviors: parking_lot::RwLock<HashMap<String, Arc<dyn ActivityBehavior>>>,
    inner: Mutex<Inner>,
}

impl InMemoryProcessRuntime {
    pub fn new(subscriptions: Arc<dyn SubscriptionStore>) -> Self {
        Self {
            subscriptions,
            behaviors: parking_lot::RwLock::new(HashMap::new()),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Register the behavior service tasks refer to by `name`. Replaces any
    /// previous registration.
    pub fn register_behavior(&self, name: impl Into<String>, behavior: Arc<dyn ActivityBehavior>) {
        self.behaviors.write().insert(name.into(), behavior);
    }

    fn behavior(&self, name: &str) -> Option<Arc<dyn ActivityBehavior>> {
        self.behaviors.read().get(name).cloned()
    }

    async fn invoke(
        &self,
        behavior_name: &str,
        node: &NodeDef,
        ctx_ids: (&str, &str),
        variables: &mut Variables,
        on_trigger: bool,
    ) -> Result<(), LifecycleError> {
        let behavior = self
            .behavior(behavior_name)
            .ok_or_else(|| LifecycleError::Behavior {
                activity_id: node.id.clone(),
                message: format!("no behavior registered as {behavior_name}"),
            })?;
        let (process_instance_id, execution_id) = ctx_ids;
        let mut ctx = ActivityContext {
            execution_id: execution_id.to_string(),
            process_instance_id: process_instance_id.to_string(),
            activity_id: node.id.clone(),
            variables: std::mem::take(variables),
        };
        let result = if on_trigger {
            behavior.trigger(&mut ctx).await
        } else {
            behavior.execute(&mut ctx).await
        };
        *variables = ctx.variables;
        result.map_err(|e| LifecycleError::Behavior {
            activity_id: node.id.clone(),
            message: e.message,
        })
    }

    /// Walk from `next` until a wait state or the end of the process.
    async fn walk(
        &self,
        definition: &ProcessDefinition,
        ctx_ids: (&str, &str),
        mut next: Option<String>,
        variables: &mut Variables,
    ) -> Result<AdvanceOutcome, LifecycleError> {
        for _ in 0..MAX_STEPS {
            let Some(node_id) = next else {
                return Ok(AdvanceOutcome::Completed);
            };
            let node = definition
                .nodes
                .get(&node_id)
                .ok_or_else(|| LifecycleError::Advance {
                    message: format!("flow leads to unknown node {node_id}"),
                })?;
            match &node.kind {
                NodeKind::EndEvent => return Ok(AdvanceOutcome::Completed),
                NodeKind::ServiceTask {
                    behavior,
                    triggerable,
                } => {
                    self.invoke(behavior, node, ctx_ids, variables, false).await?;
                    if *triggerable {
                        return Ok(AdvanceOutcome::Waiting { node_id });
                    }
                }
                NodeKind::ReceiveTask | NodeKind::UserTask | NodeKind::IntermediateCatchEvent { .. } => {
                    return Ok(AdvanceOutcome::Waiting { node_id });
                }
            }
            next = definition.outgoing(&node_id).next().map(|f| f.target.clone());
        }
        Err(LifecycleError::Advance {
            message: format!("no wait state reached after {MAX_STEPS} steps"),
        })
    }

    /// Create the subscriptions of the wait node `node_id`. On failure the
    /// ones already created are removed again.
    async fn arm(
        &self,
        definition: &ProcessDefinition,
        node_id: &str,
        ctx_ids: (&str, &str),
        variables: &Variables,
    ) -> Result<(), LifecycleError> {
        let Some(node) = definition.nodes.get(node_id) else {
            return Ok(());
        };
        let (process_instance_id, execution_id) = ctx_ids;
        let mut wanted = Vec::new();
        if let NodeKind::IntermediateCatchEvent { listener } = &node.kind {
            wanted.push((node.id.as_str(), listener));
        }
        for boundary in &node.boundary {
            wanted.push((boundary.id.as_str(), &boundary.listener));
        }

        for (activity_id, listener) in wanted {
            let mut new = NewSubscription::for_execution(
                listener.event_type.clone(),
                execution_id,
                process_instance_id,
            )
            .activity(activity_id);
            new.correlation = resolve_correlation(listener, variables);
            new.configuration.outputs = listener.outputs.clone();
            if let Err(e) = self.subscriptions.create(new).await {
                self.discard_subscriptions(execution_id).await;
                return Err(e.into());
            }
        }
        Ok(())
    }

    async fn discard_subscriptions(&self, execution_id: &str) {
        if let Err(e) = self.subscriptions.delete_by_owner_execution(execution_id).await {
            tracing::warn!(execution_id = %execution_id, error = %e, "failed to discard subscriptions");
        }
    }

    async fn put_back(&self, removed: Vec<crate::types::EventSubscription>) {
        if removed.is_empty() {
            return;
        }
        if let Err(e) = self.subscriptions.restore(removed).await {
            tracing::error!(error = %e, "failed to restore subscriptions after rollback");
        }
    }

    async fn deploy_start_subscription(
        &self,
        definition: &ProcessDefinition,
        process_definition_id: &str,
    ) -> Result<(), SubscriptionStoreError> {
        let Some(listener) = &definition.start.listener else {
            return Ok(());
        };
        let mut new =
            NewSubscription::for_process_definition(listener.event_type.clone(), process_definition_id)
                .activity(definition.start.id.clone())
                .start_policy(definition.start.start_policy);
        new.correlation = resolve_correlation(listener, &Variables::new());
        new.configuration.outputs = listener.outputs.clone();
        self.subscriptions.create(new).await.map(|_| ())
    }
}

/// Literal values as declared; variables as currently set, `null` if unset.
fn resolve_correlation(
    listener: &EventListenerDef,
    variables: &Variables,
) -> std::collections::BTreeMap<String, EventValue> {
    listener
        .correlation
        .iter()
        .map(|(name, source)| {
            let value = match source {
                CorrelationSource::Literal(v) => v.clone(),
                CorrelationSource::Variable(var) => {
                    variables.get(var).cloned().unwrap_or(EventValue::Null)
                }
            };
            (name.clone(), value)
        })
        .collect()
}

#[async_trait]
impl ProcessLifecycle for InMemoryProcessRuntime {
    async fn deploy(&self, definition: ProcessDefinition) -> Result<String, LifecycleError> {
        definition
            .validate()
            .map_err(|errors| LifecycleError::InvalidDefinition { errors })?;

        let mut inner = self.inner.lock().await;
        let previous = inner.latest.get(&definition.key).cloned();
        let version = previous.as_ref().map(|(v, _)| v + 1).unwrap_or(1);
        let id = format!("{}:{version}", definition.key);

        self.deploy_start_subscription(&definition, &id).await?;
        // Only the newest version of a key starts on events.
        if let Some((_, previous_id)) = previous {
            self.subscriptions
                .delete_by_process_definition(&previous_id)
                .await?;
        }

        tracing::info!(
            process_definition_id = %id,
            event_start = definition.start.listener.is_some(),
            "process definition deployed"
        );
        inner.latest.insert(definition.key.clone(), (version, id.clone()));
        inner.definitions.insert(id.clone(), Arc::new(definition));
        Ok(id)
    }

    async fn undeploy(&self, process_definition_id: &str) -> Result<(), LifecycleError> {
        let mut inner = self.inner.lock().await;
        let definition = inner.definition(process_definition_id)?;
        let removed = self
            .subscriptions
            .delete_by_process_definition(process_definition_id)
            .await?;
        inner.undeployed.insert(process_definition_id.to_string());
        if inner
            .latest
            .get(&definition.key)
            .is_some_and(|(_, id)| id == process_definition_id)
        {
            inner.latest.remove(&definition.key);
        }
        tracing::info!(
            process_definition_id = %process_definition_id,
            start_subscriptions = removed,
            "process definition undeployed"
        );
        Ok(())
    }

    async fn latest_definition_id(&self, key: &str) -> Result<Option<String>, LifecycleError> {
        Ok(self.inner.lock().await.latest.get(key).map(|(_, id)| id.clone()))
    }

    async fn process_definition(
        &self,
        process_definition_id: &str,
    ) -> Result<Option<ProcessDefinition>, LifecycleError> {
        Ok(self
            .inner
            .lock()
            .await
            .definitions
            .get(process_definition_id)
            .map(|d| (**d).clone()))
    }

    async fn start_instance(
        &self,
        process_definition_id: &str,
        variables: Variables,
        reference: Option<InstanceReference>,
    ) -> Result<String, LifecycleError> {
        let mut inner = self.inner.lock().await;
        if inner.undeployed.contains(process_definition_id) {
            return Err(LifecycleError::DefinitionNotFound {
                id: process_definition_id.to_string(),
            });
        }
        let definition = inner.definition(process_definition_id)?;

        if let Some(reference) = &reference {
            let existing = inner.instances.values().find(|e| {
                e.record.state == InstanceState::Running
                    && e.record.process_definition_id == process_definition_id
                    && e.record.reference.as_ref().map(|r| &r.reference_id)
                        == Some(&reference.reference_id)
            });
            if let Some(existing) = existing {
                return Err(LifecycleError::DuplicateReference {
                    process_definition_id: process_definition_id.to_string(),
                    reference_id: reference.reference_id.clone(),
                    existing_instance_id: existing.record.id.clone(),
                });
            }
        }

        let instance_id = uuid::Uuid::new_v4().to_string();
        let execution_id = uuid::Uuid::new_v4().to_string();
        let ids = (instance_id.as_str(), execution_id.as_str());
        let mut vars = variables;
        let first = definition
            .outgoing(&definition.start.id)
            .next()
            .map(|f| f.target.clone());

        let outcome = self.walk(&definition, ids, first, &mut vars).await?;
        if let AdvanceOutcome::Waiting { node_id } = &outcome {
            self.arm(&definition, node_id, ids, &vars).await?;
        }

        let now = Utc::now();
        let (state, current_node, ended_at) = match outcome {
            AdvanceOutcome::Waiting { node_id } => (InstanceState::Running, Some(node_id), None),
            AdvanceOutcome::Completed => (InstanceState::Completed, None, Some(now)),
        };
        tracing::debug!(
            process_instance_id = %instance_id,
            process_definition_id = %process_definition_id,
            node = ?current_node,
            "process instance started"
        );
        if state == InstanceState::Running {
            inner
                .executions
                .insert(execution_id.clone(), instance_id.clone());
        }
        inner.instances.insert(
            instance_id.clone(),
            InstanceEntry {
                record: ProcessInstanceRecord {
                    id: instance_id.clone(),
                    process_definition_id: process_definition_id.to_string(),
                    execution_id: execution_id.clone(),
                    reference,
                    state,
                    variables: vars,
                    current_node,
                    started_at: now,
                    ended_at,
                },
                execution_id,
            },
        );
        Ok(instance_id)
    }

    async fn advance(
        &self,
        execution_id: &str,
        variables: Variables,
        transition_hint: Option<&str>,
    ) -> Result<AdvanceOutcome, LifecycleError> {
        let mut inner = self.inner.lock().await;
        let instance_id = inner
            .executions
            .get(execution_id)
            .cloned()
            .ok_or_else(|| LifecycleError::ExecutionNotFound {
                id: execution_id.to_string(),
            })?;
        let record = match inner.instances.get(&instance_id) {
            Some(entry) => entry.record.clone(),
            None => {
                return Err(LifecycleError::InstanceNotFound { id: instance_id });
            }
        };
        let definition = inner.definition(&record.process_definition_id)?;
        let invalid = |message: String| LifecycleError::InvalidState {
            execution_id: execution_id.to_string(),
            message,
        };
        let node_id = record
            .current_node
            .clone()
            .ok_or_else(|| invalid("execution is not waiting".into()))?;
        let node = definition
            .nodes
            .get(&node_id)
            .ok_or_else(|| invalid(format!("unknown node {node_id}")))?;
        if node.wait_kind().is_none() {
            return Err(invalid(format!("node {node_id} is not a wait state")));
        }

        let ids = (instance_id.as_str(), execution_id);
        let mut vars = record.variables.clone();
        vars.extend(variables);

        let boundary = transition_hint.and_then(|h| node.boundary.iter().find(|b| b.id == h));
        let next = match boundary {
            Some(b) => Some(b.target.clone()),
            None => {
                let next = match transition_hint {
                    Some(hint) if hint != node.id => {
                        let flow = definition
                            .outgoing(&node.id)
                            .find(|f| f.id == hint)
                            .ok_or_else(|| invalid(format!("no transition {hint} from {node_id}")))?;
                        Some(flow.target.clone())
                    }
                    _ => definition.outgoing(&node.id).next().map(|f| f.target.clone()),
                };
                if let NodeKind::ServiceTask { behavior, .. } = &node.kind {
                    self.invoke(behavior, node, ids, &mut vars, true).await?;
                }
                next
            }
        };

        let outcome = self.walk(&definition, ids, next, &mut vars).await?;

        let removed = self
            .subscriptions
            .delete_by_owner_execution(execution_id)
            .await?;
        if let AdvanceOutcome::Waiting { node_id } = &outcome {
            if let Err(e) = self.arm(&definition, node_id, ids, &vars).await {
                self.put_back(removed).await;
                return Err(e);
            }
        }

        let entry = inner
            .instances
            .get_mut(&instance_id)
            .ok_or_else(|| LifecycleError::InstanceNotFound {
                id: instance_id.clone(),
            })?;
        entry.record.variables = vars;
        match &outcome {
            AdvanceOutcome::Waiting { node_id } => {
                entry.record.current_node = Some(node_id.clone());
            }
            AdvanceOutcome::Completed => {
                entry.record.current_node = None;
                entry.record.state = InstanceState::Completed;
                entry.record.ended_at = Some(Utc::now());
                inner.executions.remove(execution_id);
                tracing::debug!(process_instance_id = %instance_id, "process instance completed");
            }
        }
        Ok(outcome)
    }

    async fn find_instance_by_reference(
        &self,
        process_definition_id: &str,
        reference_id: &str,
    ) -> Result<Option<String>, LifecycleError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .instances
            .values()
            .find(|e| {
                e.record.state == InstanceState::Running
                    && e.record.process_definition_id == process_definition_id
                    && e.record
                        .reference
                        .as_ref()
                        .is_some_and(|r| r.reference_id == reference_id)
            })
            .map(|e| e.record.id.clone()))
    }

    async fn execution(&self, execution_id: &str) -> Result<Option<ExecutionSnapshot>, LifecycleError> {
        let inner = self.inner.lock().await;
        let Some(entry) = inner
            .executions
            .get(execution_id)
            .and_then(|instance_id| inner.instances.get(instance_id))
        else {
            return Ok(None);
        };
        let Some(node_id) = &entry.record.current_node else {
            return Ok(None);
        };
        let definition = inner.definition(&entry.record.process_definition_id)?;
        let Some(node) = definition.nodes.get(node_id) else {
            return Ok(None);
        };
        Ok(node.wait_kind().map(|node_kind| ExecutionSnapshot {
            execution_id: entry.execution_id.clone(),
            process_instance_id: entry.record.id.clone(),
            process_definition_id: entry.record.process_definition_id.clone(),
            node_id: node.id.clone(),
            node_kind,
            boundary_listeners: node.boundary.iter().map(|b| b.id.clone()).collect(),
        }))
    }

    async fn instance(&self, instance_id: &str) -> Result<Option<ProcessInstanceRecord>, LifecycleError> {
        Ok(self
            .inner
            .lock()
            .await
            .instances
            .get(instance_id)
            .map(|e| e.record.clone()))
    }

    async fn running_instances(
        &self,
        process_definition_id: Option<&str>,
    ) -> Result<Vec<ProcessInstanceRecord>, LifecycleError> {
        let inner = self.inner.lock().await;
        let mut running: Vec<ProcessInstanceRecord> = inner
            .instances
            .values()
            .filter(|e| e.record.state == InstanceState::Running)
            .filter(|e| process_definition_id.map_or(true, |d| e.record.process_definition_id == d))
            .map(|e| e.record.clone())
            .collect();
        running.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.id.cmp(&b.id)));
        Ok(running)
    }

    async fn cancel_instance(&self, instance_id: &str, reason: &str) -> Result<(), LifecycleError> {
        let mut inner = self.inner.lock().await;
        let (execution_id, state) = match inner.instances.get(instance_id) {
            Some(e) => (e.execution_id.clone(), e.record.state.clone()),
            None => {
                return Err(LifecycleError::InstanceNotFound {
                    id: instance_id.to_string(),
                })
            }
        };
        if state.is_terminal() {
            return Err(LifecycleError::InvalidState {
                execution_id,
                message: format!("instance {instance_id} already ended"),
            });
        }

        self.subscriptions
            .delete_by_owner_execution(&execution_id)
            .await?;
        inner.executions.remove(&execution_id);
        if let Some(entry) = inner.instances.get_mut(instance_id) {
            entry.record.state = InstanceState::Cancelled {
                reason: reason.to_string(),
            };
            entry.record.current_node = None;
            entry.record.ended_at = Some(Utc::now());
        }
        tracing::info!(process_instance_id = %instance_id, reason = %reason, "process instance cancelled");
        Ok(())
    }
}
