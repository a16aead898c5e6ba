//! Process definitions, instances and executions as seen by the trigger
//! core.
//!
//! The definition graph is deliberately small: start event, service tasks,
//! receive tasks, user tasks, intermediate catch events, end events and
//! boundary listeners on wait nodes. It is what the bundled
//! [`InMemoryProcessRuntime`](crate::defaults::InMemoryProcessRuntime)
//! executes.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{EventValue, StartPolicy, VariableMapping, Variables};

/// `reference_type` recorded on instances started by an inbound event.
pub const REFERENCE_TYPE_EVENT_PROCESS: &str = "event-to-process";

// ---------------------------------------------------------------------------
// Instances and executions
// ---------------------------------------------------------------------------

/// Records what caused an instance to start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct InstanceReference {
    pub reference_id: String,
    pub reference_type: String,
}

impl InstanceReference {
    pub fn event_process(reference_id: impl Into<String>) -> Self {
        Self {
            reference_id: reference_id.into(),
            reference_type: REFERENCE_TYPE_EVENT_PROCESS.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum InstanceState {
    Running,
    Completed,
    Cancelled { reason: String },
}

impl InstanceState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ProcessInstanceRecord {
    pub id: String,
    pub process_definition_id: String,
    /// The instance's single execution; the id `trigger()` takes.
    pub execution_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<InstanceReference>,
    pub state: InstanceState,
    pub variables: Variables,
    /// Node the instance's execution currently waits in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_node: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

/// The kind of wait node an execution is parked in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitNodeKind {
    /// A service task awaiting its callback.
    TriggerableServiceTask,
    ReceiveTask,
    IntermediateCatchEvent,
    /// Completed by a person, never by `trigger()` on its own.
    UserTask,
}

/// Read-only view of a paused execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ExecutionSnapshot {
    pub execution_id: String,
    pub process_instance_id: String,
    pub process_definition_id: String,
    pub node_id: String,
    pub node_kind: WaitNodeKind,
    /// Ids of boundary listeners attached to the current node.
    #[serde(default)]
    pub boundary_listeners: Vec<String>,
}

impl ExecutionSnapshot {
    /// Whether `trigger()` may resume this execution.
    ///
    /// User tasks only accept a trigger routed through one of their
    /// boundary listeners.
    pub fn accepts_trigger(&self, transition_hint: Option<&str>) -> bool {
        if let Some(hint) = transition_hint {
            if self.boundary_listeners.iter().any(|b| b == hint) {
                return true;
            }
        }
        !matches!(self.node_kind, WaitNodeKind::UserTask)
    }
}

/// What an activity behavior sees and may change.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityContext {
    pub execution_id: String,
    pub process_instance_id: String,
    pub activity_id: String,
    pub variables: Variables,
}

impl ActivityContext {
    pub fn variable(&self, name: &str) -> Option<&EventValue> {
        self.variables.get(name)
    }

    pub fn set_variable(&mut self, name: impl Into<String>, value: impl Into<EventValue>) {
        self.variables.insert(name.into(), value.into());
    }
}

/// Where an execution ended up after being advanced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum AdvanceOutcome {
    Waiting { node_id: String },
    Completed,
}

// ---------------------------------------------------------------------------
// Definitions
// ---------------------------------------------------------------------------

/// Where a correlation value comes from when a subscription is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrelationSource {
    Literal(EventValue),
    /// A process variable; unset variables correlate as `null`.
    Variable(String),
}

/// An event listener declared on a start event, catch event or boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct EventListenerDef {
    pub event_type: String,
    #[serde(default)]
    pub correlation: BTreeMap<String, CorrelationSource>,
    #[serde(default)]
    pub outputs: Vec<VariableMapping>,
}

impl EventListenerDef {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            correlation: BTreeMap::new(),
            outputs: Vec::new(),
        }
    }

    pub fn correlate_literal(mut self, name: impl Into<String>, value: impl Into<EventValue>) -> Self {
        self.correlation
            .insert(name.into(), CorrelationSource::Literal(value.into()));
        self
    }

    pub fn correlate_variable(mut self, name: impl Into<String>, variable: impl Into<String>) -> Self {
        self.correlation
            .insert(name.into(), CorrelationSource::Variable(variable.into()));
        self
    }

    pub fn output(mut self, event_field: impl Into<String>, variable: impl Into<String>) -> Self {
        self.outputs.push(VariableMapping::new(event_field, variable));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct StartEventDef {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listener: Option<EventListenerDef>,
    #[serde(default)]
    pub start_policy: StartPolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum NodeKind {
    ServiceTask { behavior: String, triggerable: bool },
    ReceiveTask,
    UserTask,
    IntermediateCatchEvent { listener: EventListenerDef },
    EndEvent,
}

/// A listener attached to a wait node; firing it leaves the node along
/// `target` instead of the node's own outgoing flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct BoundaryEventDef {
    pub id: String,
    pub listener: EventListenerDef,
    pub target: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct NodeDef {
    pub id: String,
    pub kind: NodeKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub boundary: Vec<BoundaryEventDef>,
}

impl NodeDef {
    /// The wait kind of this node, or `None` for nodes that never pause.
    pub fn wait_kind(&self) -> Option<WaitNodeKind> {
        match &self.kind {
            NodeKind::ServiceTask {
                triggerable: true, ..
            } => Some(WaitNodeKind::TriggerableServiceTask),
            NodeKind::ReceiveTask => Some(WaitNodeKind::ReceiveTask),
            NodeKind::UserTask => Some(WaitNodeKind::UserTask),
            NodeKind::IntermediateCatchEvent { .. } => Some(WaitNodeKind::IntermediateCatchEvent),
            NodeKind::ServiceTask { .. } | NodeKind::EndEvent => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SequenceFlow {
    pub id: String,
    pub source: String,
    pub target: String,
}

/// A deployable process graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ProcessDefinition {
    pub key: String,
    pub start: StartEventDef,
    pub nodes: BTreeMap<String, NodeDef>,
    #[serde(default)]
    pub flows: Vec<SequenceFlow>,
}

impl ProcessDefinition {
    /// Start a definition with a plain (non-event) start event `"start"`.
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            start: StartEventDef {
                id: "start".into(),
                listener: None,
                start_policy: StartPolicy::Always,
            },
            nodes: BTreeMap::new(),
            flows: Vec::new(),
        }
    }

    /// Make the start event listen for an inbound event.
    pub fn start_on_event(mut self, listener: EventListenerDef, policy: StartPolicy) -> Self {
        self.start.listener = Some(listener);
        self.start.start_policy = policy;
        self
    }

    pub fn node(mut self, id: impl Into<String>, kind: NodeKind) -> Self {
        let id = id.into();
        self.nodes.insert(
            id.clone(),
            NodeDef {
                id,
                kind,
                boundary: Vec::new(),
            },
        );
        self
    }

    pub fn service_task(self, id: impl Into<String>, behavior: impl Into<String>, triggerable: bool) -> Self {
        self.node(
            id,
            NodeKind::ServiceTask {
                behavior: behavior.into(),
                triggerable,
            },
        )
    }

    pub fn user_task(self, id: impl Into<String>) -> Self {
        self.node(id, NodeKind::UserTask)
    }

    pub fn receive_task(self, id: impl Into<String>) -> Self {
        self.node(id, NodeKind::ReceiveTask)
    }

    pub fn catch_event(self, id: impl Into<String>, listener: EventListenerDef) -> Self {
        self.node(id, NodeKind::IntermediateCatchEvent { listener })
    }

    pub fn end(self, id: impl Into<String>) -> Self {
        self.node(id, NodeKind::EndEvent)
    }

    /// Attach a boundary listener to an existing node. Unknown nodes are
    /// reported by [`validate`](Self::validate).
    pub fn boundary(
        mut self,
        attached_to: &str,
        id: impl Into<String>,
        listener: EventListenerDef,
        target: impl Into<String>,
    ) -> Self {
        if let Some(node) = self.nodes.get_mut(attached_to) {
            node.boundary.push(BoundaryEventDef {
                id: id.into(),
                listener,
                target: target.into(),
            });
        } else {
            // Keep the dangling reference visible to validate().
            self.flows.push(SequenceFlow {
                id: id.into(),
                source: attached_to.to_string(),
                target: target.into(),
            });
        }
        self
    }

    /// Add a sequence flow with a generated id `"{source}->{target}"`.
    pub fn flow(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        let source = source.into();
        let target = target.into();
        self.flows.push(SequenceFlow {
            id: format!("{source}->{target}"),
            source,
            target,
        });
        self
    }

    /// Add a sequence flow with an explicit id (usable as a transition hint).
    pub fn named_flow(
        mut self,
        id: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        self.flows.push(SequenceFlow {
            id: id.into(),
            source: source.into(),
            target: target.into(),
        });
        self
    }

    pub fn outgoing<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a SequenceFlow> + 'a {
        self.flows.iter().filter(move |f| f.source == node_id)
    }

    /// Structural checks run at deployment. Returns every problem found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if self.key.trim().is_empty() {
            errors.push("process key must not be empty".to_string());
        }
        for flow in &self.flows {
            if flow.source != self.start.id && !self.nodes.contains_key(&flow.source) {
                errors.push(format!("flow {} has unknown source {}", flow.id, flow.source));
            }
            if !self.nodes.contains_key(&flow.target) {
                errors.push(format!("flow {} has unknown target {}", flow.id, flow.target));
            }
        }
        for node in self.nodes.values() {
            for b in &node.boundary {
                if !self.nodes.contains_key(&b.target) {
                    errors.push(format!("boundary {} has unknown target {}", b.id, b.target));
                }
                if node.wait_kind().is_none() {
                    errors.push(format!("boundary {} is attached to non-wait node {}", b.id, node.id));
                }
            }
        }
        if let Some(listener) = &self.start.listener {
            if listener.event_type.trim().is_empty() {
                errors.push("start event listener needs an event type".to_string());
            }
            if listener
                .correlation
                .values()
                .any(|s| matches!(s, CorrelationSource::Variable(_)))
            {
                errors.push("start event correlation must use literal values".to_string());
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_task_accepts_trigger_only_through_boundary() {
        let snap = ExecutionSnapshot {
            execution_id: "e1".into(),
            process_instance_id: "p1".into(),
            process_definition_id: "process:1".into(),
            node_id: "task".into(),
            node_kind: WaitNodeKind::UserTask,
            boundary_listeners: vec!["eventBoundary".into()],
        };
        assert!(!snap.accepts_trigger(None));
        assert!(!snap.accepts_trigger(Some("other")));
        assert!(snap.accepts_trigger(Some("eventBoundary")));
    }

    #[test]
    fn validate_reports_dangling_references() {
        let def = ProcessDefinition::new("process")
            .user_task("task")
            .flow("start", "task")
            .flow("task", "missing")
            .boundary("nope", "b1", EventListenerDef::new("myEvent"), "task");
        let errors = def.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("unknown target missing")));
        assert!(errors.iter().any(|e| e.contains("unknown source nope")));
    }

    #[test]
    fn start_correlation_must_be_literal() {
        let def = ProcessDefinition::new("process")
            .start_on_event(
                EventListenerDef::new("myEvent").correlate_variable("customerId", "var"),
                StartPolicy::Always,
            )
            .end("end")
            .flow("start", "end");
        assert!(def.validate().is_err());
    }
}
