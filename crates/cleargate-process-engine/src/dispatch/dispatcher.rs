//! Inbound event dispatcher.
//!
//! Decodes a raw event, selects the subscriptions it satisfies and acts on
//! each one independently:
//!
//! - a definition-owned subscription starts a process instance, unless the
//!   single-instance policy finds one already running for the same
//!   correlation key;
//! - an execution-owned subscription is consumed and handed to the
//!   configured [`TriggerInvoker`].
//!
//! A failure on one match never affects the others; it is reported in the
//! [`DispatchResult`] and logged. Nothing is retried here.

use std::sync::Arc;

use thiserror::Error;

use crate::correlation::{self, ReferenceKeyStrategy};
use crate::errors::{DecodeError, LifecycleError, SubscriptionStoreError};
use crate::registry::EventRegistry;
use crate::traits::{EventDecoder, ProcessLifecycle, SubscriptionStore};
use crate::trigger::{InvokeOutcome, TriggerError, TriggerInvoker, TriggerRequest};
use crate::types::{
    AdvanceOutcome, CorrelationKey, EventSubscription, InboundEvent, InstanceReference,
    StartPolicy, SubscriptionOwner, Variables,
};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("event dropped: {0}")]
    Decode(#[from] DecodeError),
    #[error("subscription lookup failed: {0}")]
    Subscription(#[from] SubscriptionStoreError),
    #[error("inbound channel closed")]
    ChannelClosed,
}

/// What a single matched subscription led to.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    StartedInstance {
        process_instance_id: String,
    },
    TriggeredExecution {
        execution_id: String,
        outcome: AdvanceOutcome,
    },
    EnqueuedTrigger {
        execution_id: String,
        job_id: String,
    },
    /// Single-instance policy: an instance for this correlation key is
    /// already running.
    SkippedSingleInstance {
        existing_instance_id: Option<String>,
    },
    /// Another delivery consumed the subscription first.
    AlreadyConsumed,
    Failed {
        error: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchReport {
    pub subscription_id: String,
    pub outcome: MatchOutcome,
}

/// Per-match outcomes of one delivery, in match order.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchResult {
    pub event_type: String,
    pub reports: Vec<MatchReport>,
}

impl DispatchResult {
    /// Ids of instances started by this delivery.
    pub fn started_instances(&self) -> Vec<&str> {
        self.reports
            .iter()
            .filter_map(|r| match &r.outcome {
                MatchOutcome::StartedInstance {
                    process_instance_id,
                } => Some(process_instance_id.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn failures(&self) -> Vec<&MatchReport> {
        self.reports
            .iter()
            .filter(|r| matches!(r.outcome, MatchOutcome::Failed { .. }))
            .collect()
    }

    /// No subscription matched.
    pub fn is_unmatched(&self) -> bool {
        self.reports.is_empty()
    }
}

pub struct EventDispatcher {
    decoder: Arc<dyn EventDecoder>,
    registry: EventRegistry,
    subscriptions: Arc<dyn SubscriptionStore>,
    lifecycle: Arc<dyn ProcessLifecycle>,
    invoker: Arc<dyn TriggerInvoker>,
    reference_keys: Arc<dyn ReferenceKeyStrategy>,
}

impl EventDispatcher {
    pub fn new(
        decoder: Arc<dyn EventDecoder>,
        registry: EventRegistry,
        subscriptions: Arc<dyn SubscriptionStore>,
        lifecycle: Arc<dyn ProcessLifecycle>,
        invoker: Arc<dyn TriggerInvoker>,
        reference_keys: Arc<dyn ReferenceKeyStrategy>,
    ) -> Self {
        Self {
            decoder,
            registry,
            subscriptions,
            lifecycle,
            invoker,
            reference_keys,
        }
    }

    /// Decode and dispatch one raw event.
    pub async fn dispatch(&self, raw: &[u8]) -> Result<DispatchResult, DispatchError> {
        let event = self.decoder.decode(raw).map_err(|e| {
            tracing::warn!(error = %e, bytes = raw.len(), "dropping undecodable event");
            e
        })?;
        self.dispatch_event(event).await
    }

    /// Dispatch an already decoded event.
    pub async fn dispatch_event(&self, event: InboundEvent) -> Result<DispatchResult, DispatchError> {
        let candidates = self
            .subscriptions
            .find_by_event_type(&event.event_type)
            .await?;
        let matched = correlation::matches(&event.event_type, &event.payload, &candidates);
        tracing::debug!(
            event_type = %event.event_type,
            candidates = candidates.len(),
            matched = matched.len(),
            "event received"
        );

        let mut reports = Vec::with_capacity(matched.len());
        for sub in matched {
            let outcome = match &sub.owner {
                SubscriptionOwner::ProcessDefinition {
                    process_definition_id,
                } => self.start_instance(&event, &sub, process_definition_id).await,
                SubscriptionOwner::Execution { .. } => self.trigger_execution(&event, &sub).await,
            };
            if let MatchOutcome::Failed { error } = &outcome {
                tracing::warn!(
                    event_type = %event.event_type,
                    subscription_id = %sub.id,
                    error = %error,
                    "event match failed"
                );
            }
            reports.push(MatchReport {
                subscription_id: sub.id,
                outcome,
            });
        }

        Ok(DispatchResult {
            event_type: event.event_type,
            reports,
        })
    }

    /// Variables seeded from the event: the subscription's output mappings
    /// if it has any, otherwise every declared parameter by name.
    fn seed_variables(&self, event: &InboundEvent, sub: &EventSubscription) -> Variables {
        let outputs = &sub.configuration.outputs;
        if !outputs.is_empty() {
            return outputs
                .iter()
                .filter_map(|m| {
                    event
                        .payload
                        .get(&m.event_field)
                        .map(|v| (m.variable.clone(), v.clone()))
                })
                .collect();
        }
        match self.registry.get(&event.event_type) {
            Some(definition) => event
                .payload
                .iter()
                .filter(|(name, _)| definition.parameter(name).is_some())
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            None => event.payload.clone(),
        }
    }

    fn correlation_key(&self, event: &InboundEvent) -> CorrelationKey {
        self.registry
            .get(&event.event_type)
            .map(|definition| correlation::correlation_key(&definition, &event.payload))
            .unwrap_or_default()
    }

    async fn start_instance(
        &self,
        event: &InboundEvent,
        sub: &EventSubscription,
        process_definition_id: &str,
    ) -> MatchOutcome {
        let variables = self.seed_variables(event, sub);
        let reference = match sub.configuration.start_policy {
            StartPolicy::Always => None,
            StartPolicy::SingleInstance => {
                let key = self.correlation_key(event);
                let reference_id = self.reference_keys.reference_id(process_definition_id, &key);
                match self
                    .lifecycle
                    .find_instance_by_reference(process_definition_id, &reference_id)
                    .await
                {
                    Ok(Some(existing)) => {
                        tracing::debug!(
                            process_definition_id = %process_definition_id,
                            existing_instance_id = %existing,
                            "instance already running for correlation key"
                        );
                        return MatchOutcome::SkippedSingleInstance {
                            existing_instance_id: Some(existing),
                        };
                    }
                    Ok(None) => Some(InstanceReference::event_process(reference_id)),
                    Err(e) => {
                        return MatchOutcome::Failed {
                            error: e.to_string(),
                        }
                    }
                }
            }
        };

        match self
            .lifecycle
            .start_instance(process_definition_id, variables, reference)
            .await
        {
            Ok(process_instance_id) => {
                tracing::debug!(
                    process_definition_id = %process_definition_id,
                    process_instance_id = %process_instance_id,
                    event_type = %event.event_type,
                    "instance started by event"
                );
                MatchOutcome::StartedInstance {
                    process_instance_id,
                }
            }
            // Lost the race against a concurrent delivery.
            Err(LifecycleError::DuplicateReference {
                existing_instance_id,
                ..
            }) => MatchOutcome::SkippedSingleInstance {
                existing_instance_id: Some(existing_instance_id),
            },
            Err(e) => MatchOutcome::Failed {
                error: e.to_string(),
            },
        }
    }

    async fn trigger_execution(&self, event: &InboundEvent, sub: &EventSubscription) -> MatchOutcome {
        let Some(execution_id) = sub.execution_id() else {
            return MatchOutcome::Failed {
                error: format!("subscription {} has no owning execution", sub.id),
            };
        };
        let consumed = match self.subscriptions.consume(&sub.id).await {
            Ok(Some(consumed)) => consumed,
            Ok(None) => {
                tracing::debug!(subscription_id = %sub.id, "subscription already consumed");
                return MatchOutcome::AlreadyConsumed;
            }
            Err(e) => {
                return MatchOutcome::Failed {
                    error: e.to_string(),
                }
            }
        };

        let mut request =
            TriggerRequest::new(execution_id).with_variables(self.seed_variables(event, sub));
        request.transition_hint = sub.activity_id.clone();

        match self.invoker.invoke(request).await {
            Ok(InvokeOutcome::Triggered(result)) => MatchOutcome::TriggeredExecution {
                execution_id: result.execution_id,
                outcome: result.outcome,
            },
            Ok(InvokeOutcome::Enqueued(ack)) => MatchOutcome::EnqueuedTrigger {
                execution_id: execution_id.to_string(),
                job_id: ack.job_id,
            },
            Err(e) => {
                // A vanished or moved-on execution keeps its subscription gone.
                if !matches!(
                    e,
                    TriggerError::ExecutionNotFound { .. } | TriggerError::InvalidExecutionState { .. }
                ) {
                    if let Err(restore_err) = self.subscriptions.restore(vec![consumed]).await {
                        tracing::error!(
                            subscription_id = %sub.id,
                            error = %restore_err,
                            "failed to restore consumed subscription"
                        );
                    }
                }
                MatchOutcome::Failed {
                    error: e.to_string(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlation::ExactCorrelationKey;
    use crate::defaults::{InMemoryJobStore, InMemoryProcessRuntime, InMemorySubscriptionStore};
    use crate::errors::BehaviorError;
    use crate::jobs::JobQueue;
    use crate::traits::ActivityBehavior;
    use crate::trigger::{ImmediateTrigger, TriggerEngine};
    use crate::types::{
        ActivityContext, EventDefinition, EventListenerDef, EventValueType, NewSubscription,
        ProcessDefinition,
    };
    use async_trait::async_trait;

    struct Unavailable;

    #[async_trait]
    impl ActivityBehavior for Unavailable {
        async fn execute(&self, _ctx: &mut ActivityContext) -> Result<(), BehaviorError> {
            Err(BehaviorError::new("downstream unavailable"))
        }
    }

    /// Decodes `event_type` and nothing else.
    struct TypeOnly;

    impl EventDecoder for TypeOnly {
        fn decode(&self, raw: &[u8]) -> Result<InboundEvent, DecodeError> {
            std::str::from_utf8(raw)
                .ok()
                .filter(|s| !s.is_empty())
                .map(InboundEvent::new)
                .ok_or_else(|| DecodeError::Malformed {
                    message: "empty event".into(),
                })
        }
    }

    struct Fixture {
        subs: Arc<InMemorySubscriptionStore>,
        runtime: Arc<InMemoryProcessRuntime>,
        dispatcher: EventDispatcher,
    }

    fn fixture() -> Fixture {
        let registry = EventRegistry::new();
        registry
            .deploy(EventDefinition::new("myEvent").correlation_parameter("customerId", EventValueType::String))
            .unwrap();
        let subs = Arc::new(InMemorySubscriptionStore::new());
        let runtime = Arc::new(InMemoryProcessRuntime::new(subs.clone()));
        runtime.register_behavior("unavailable", Arc::new(Unavailable));
        let engine = Arc::new(TriggerEngine::new(
            runtime.clone(),
            subs.clone(),
            JobQueue::new(Arc::new(InMemoryJobStore::new())),
        ));
        let dispatcher = EventDispatcher::new(
            Arc::new(TypeOnly),
            registry,
            subs.clone(),
            runtime.clone(),
            Arc::new(ImmediateTrigger::new(engine)),
            Arc::new(ExactCorrelationKey),
        );
        Fixture {
            subs,
            runtime,
            dispatcher,
        }
    }

    #[tokio::test]
    async fn failed_match_is_isolated_and_restores_its_subscription() {
        let f = fixture();
        let broken = f
            .runtime
            .deploy(
                ProcessDefinition::new("broken")
                    .catch_event("wait", EventListenerDef::new("myEvent"))
                    .service_task("call", "unavailable", false)
                    .end("end")
                    .flow("start", "wait")
                    .flow("wait", "call")
                    .flow("call", "end"),
            )
            .await
            .unwrap();
        let instance = f
            .runtime
            .start_instance(&broken, Variables::new(), None)
            .await
            .unwrap();
        f.runtime
            .deploy(
                ProcessDefinition::new("starter")
                    .start_on_event(EventListenerDef::new("myEvent"), StartPolicy::Always)
                    .user_task("task")
                    .flow("start", "task"),
            )
            .await
            .unwrap();

        let result = f.dispatcher.dispatch(b"myEvent").await.unwrap();
        assert_eq!(result.reports.len(), 2);
        assert_eq!(result.failures().len(), 1);
        assert_eq!(result.started_instances().len(), 1);

        let record = f.runtime.instance(&instance).await.unwrap().unwrap();
        assert_eq!(record.current_node.as_deref(), Some("wait"));
        assert_eq!(
            f.subs.find_by_owner_execution(&record.execution_id).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn vanished_execution_keeps_its_subscription_removed() {
        let f = fixture();
        let sub = f
            .subs
            .create(NewSubscription::for_execution("myEvent", "ghost", "ghost-instance"))
            .await
            .unwrap();

        let result = f.dispatcher.dispatch(b"myEvent").await.unwrap();
        assert_eq!(result.reports[0].subscription_id, sub.id);
        assert!(matches!(result.reports[0].outcome, MatchOutcome::Failed { .. }));
        assert!(f.subs.get(&sub.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn decode_failure_is_an_error() {
        let f = fixture();
        assert!(matches!(
            f.dispatcher.dispatch(b"").await,
            Err(DispatchError::Decode(DecodeError::Malformed { .. }))
        ));
    }

    #[tokio::test]
    async fn unregistered_event_type_defaults_to_empty_correlation_key() {
        let f = fixture();
        let def = f
            .runtime
            .deploy(
                ProcessDefinition::new("single")
                    .start_on_event(EventListenerDef::new("otherEvent"), StartPolicy::SingleInstance)
                    .user_task("task")
                    .flow("start", "task"),
            )
            .await
            .unwrap();

        f.dispatcher.dispatch(b"otherEvent").await.unwrap();
        let second = f.dispatcher.dispatch(b"otherEvent").await.unwrap();
        assert!(matches!(
            second.reports[0].outcome,
            MatchOutcome::SkippedSingleInstance { .. }
        ));
        assert_eq!(f.runtime.running_instances(Some(&def)).await.unwrap().len(), 1);
    }
}
