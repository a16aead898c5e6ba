//! Inbound event types and event definitions.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{EventValue, EventValueType};

/// Event payload: field name → typed scalar.
pub type Payload = BTreeMap<String, EventValue>;

/// A decoded inbound event. Transient: built per delivery and never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct InboundEvent {
    pub event_type: String,
    #[serde(default)]
    pub payload: Payload,
}

impl InboundEvent {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            payload: Payload::new(),
        }
    }

    /// Add a payload field.
    pub fn with(mut self, field: impl Into<String>, value: impl Into<EventValue>) -> Self {
        self.payload.insert(field.into(), value.into());
        self
    }
}

/// The projection of a payload onto the correlation parameters declared for
/// its event type. Two events target the same logical instance iff their
/// keys are equal.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CorrelationKey(pub BTreeMap<String, EventValue>);

impl CorrelationKey {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&EventValue> {
        self.0.get(name)
    }
}

/// A named, typed field of an event definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct EventParameter {
    pub name: String,
    pub value_type: EventValueType,
}

/// Declares the shape of an event type: which fields correlate it to a
/// target and which fields are plain payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct EventDefinition {
    pub key: String,
    #[serde(default)]
    pub correlation_parameters: Vec<EventParameter>,
    #[serde(default)]
    pub payload_parameters: Vec<EventParameter>,
}

impl EventDefinition {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            correlation_parameters: Vec::new(),
            payload_parameters: Vec::new(),
        }
    }

    pub fn correlation_parameter(mut self, name: impl Into<String>, ty: EventValueType) -> Self {
        self.correlation_parameters.push(EventParameter {
            name: name.into(),
            value_type: ty,
        });
        self
    }

    pub fn payload_parameter(mut self, name: impl Into<String>, ty: EventValueType) -> Self {
        self.payload_parameters.push(EventParameter {
            name: name.into(),
            value_type: ty,
        });
        self
    }

    /// Look up a declared parameter of either kind.
    pub fn parameter(&self, name: &str) -> Option<&EventParameter> {
        self.correlation_parameters
            .iter()
            .chain(self.payload_parameters.iter())
            .find(|p| p.name == name)
    }

    pub fn is_correlation_parameter(&self, name: &str) -> bool {
        self.correlation_parameters.iter().any(|p| p.name == name)
    }

    /// All declared parameters, correlation first.
    pub fn parameters(&self) -> impl Iterator<Item = &EventParameter> {
        self.correlation_parameters
            .iter()
            .chain(self.payload_parameters.iter())
    }
}
