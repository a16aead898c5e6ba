//! Event subscription records.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::EventValue;

/// Which runtime a subscription belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeType {
    #[default]
    Bpmn,
    Custom(String),
}

/// Who a subscription belongs to.
///
/// An execution-owned subscription is consumed by the event that satisfies
/// it. A definition-owned subscription is an event-based process start and
/// is never consumed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum SubscriptionOwner {
    Execution {
        execution_id: String,
        process_instance_id: String,
    },
    ProcessDefinition {
        process_definition_id: String,
    },
}

impl fmt::Display for SubscriptionOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Execution { execution_id, .. } => write!(f, "execution {execution_id}"),
            Self::ProcessDefinition {
                process_definition_id,
            } => write!(f, "process definition {process_definition_id}"),
        }
    }
}

/// Whether a definition-owned subscription may start a second instance for
/// the same correlation key while the first is still running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartPolicy {
    #[default]
    Always,
    SingleInstance,
}

/// Copies an event field into a process variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct VariableMapping {
    pub event_field: String,
    pub variable: String,
}

impl VariableMapping {
    pub fn new(event_field: impl Into<String>, variable: impl Into<String>) -> Self {
        Self {
            event_field: event_field.into(),
            variable: variable.into(),
        }
    }
}

/// Per-subscription behavior captured when the subscription is created.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SubscriptionConfig {
    /// Empty means every declared event parameter is copied by name.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<VariableMapping>,
    #[serde(default)]
    pub start_policy: StartPolicy,
}

/// A subscription about to be created. The store assigns `id` and
/// `created_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct NewSubscription {
    pub event_type: String,
    #[serde(default)]
    pub correlation: BTreeMap<String, EventValue>,
    #[serde(default)]
    pub scope_type: ScopeType,
    pub owner: SubscriptionOwner,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity_id: Option<String>,
    #[serde(default)]
    pub configuration: SubscriptionConfig,
}

impl NewSubscription {
    pub fn for_execution(
        event_type: impl Into<String>,
        execution_id: impl Into<String>,
        process_instance_id: impl Into<String>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            correlation: BTreeMap::new(),
            scope_type: ScopeType::Bpmn,
            owner: SubscriptionOwner::Execution {
                execution_id: execution_id.into(),
                process_instance_id: process_instance_id.into(),
            },
            activity_id: None,
            configuration: SubscriptionConfig::default(),
        }
    }

    pub fn for_process_definition(
        event_type: impl Into<String>,
        process_definition_id: impl Into<String>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            correlation: BTreeMap::new(),
            scope_type: ScopeType::Bpmn,
            owner: SubscriptionOwner::ProcessDefinition {
                process_definition_id: process_definition_id.into(),
            },
            activity_id: None,
            configuration: SubscriptionConfig::default(),
        }
    }

    pub fn correlate(mut self, name: impl Into<String>, value: impl Into<EventValue>) -> Self {
        self.correlation.insert(name.into(), value.into());
        self
    }

    pub fn activity(mut self, activity_id: impl Into<String>) -> Self {
        self.activity_id = Some(activity_id.into());
        self
    }

    pub fn output(mut self, event_field: impl Into<String>, variable: impl Into<String>) -> Self {
        self.configuration
            .outputs
            .push(VariableMapping::new(event_field, variable));
        self
    }

    pub fn start_policy(mut self, policy: StartPolicy) -> Self {
        self.configuration.start_policy = policy;
        self
    }
}

/// A live subscription binding an event type (and optional correlation
/// value) to a paused execution or a process definition's start event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct EventSubscription {
    pub id: String,
    pub event_type: String,
    /// Empty means "no correlation": every event of the type matches.
    #[serde(default)]
    pub correlation: BTreeMap<String, EventValue>,
    pub scope_type: ScopeType,
    pub owner: SubscriptionOwner,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity_id: Option<String>,
    #[serde(default)]
    pub configuration: SubscriptionConfig,
    pub created_at: DateTime<Utc>,
}

impl EventSubscription {
    /// Materialize a [`NewSubscription`] with a fresh id.
    pub fn from_new(new: NewSubscription) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            event_type: new.event_type,
            correlation: new.correlation,
            scope_type: new.scope_type,
            owner: new.owner,
            activity_id: new.activity_id,
            configuration: new.configuration,
            created_at: Utc::now(),
        }
    }

    pub fn execution_id(&self) -> Option<&str> {
        match &self.owner {
            SubscriptionOwner::Execution { execution_id, .. } => Some(execution_id),
            SubscriptionOwner::ProcessDefinition { .. } => None,
        }
    }

    pub fn process_definition_id(&self) -> Option<&str> {
        match &self.owner {
            SubscriptionOwner::ProcessDefinition {
                process_definition_id,
            } => Some(process_definition_id),
            SubscriptionOwner::Execution { .. } => None,
        }
    }
}
