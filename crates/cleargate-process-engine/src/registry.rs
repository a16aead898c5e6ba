//! Registry of deployed event definitions.
//!
//! The [`EventRegistry`] stores [`EventDefinition`]s keyed by event type so
//! the decoder can type payload fields and the dispatcher can derive
//! correlation keys. Deploy definitions via
//! [`ProcessEngine::deploy_event_definition`](crate::ProcessEngine::deploy_event_definition).
//!
//! Thread-safe and cheaply cloneable; all clones share the same storage.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::errors::RegistryError;
use crate::types::EventDefinition;

#[derive(Clone, Default)]
pub struct EventRegistry {
    inner: Arc<RwLock<HashMap<String, Arc<EventDefinition>>>>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and register a definition. Replaces any previous definition
    /// with the same key.
    pub fn deploy(&self, definition: EventDefinition) -> Result<(), RegistryError> {
        validate(&definition)?;
        tracing::debug!(event_type = %definition.key, "event definition deployed");
        self.inner
            .write()
            .insert(definition.key.clone(), Arc::new(definition));
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<Arc<EventDefinition>> {
        self.inner.read().get(key).cloned()
    }

    pub fn remove(&self, key: &str) -> Option<Arc<EventDefinition>> {
        self.inner.write().remove(key)
    }

    /// Registered event types, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

impl std::fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRegistry")
            .field("count", &self.inner.read().len())
            .finish()
    }
}

fn validate(definition: &EventDefinition) -> Result<(), RegistryError> {
    let invalid = |message: String| RegistryError::InvalidDefinition {
        key: definition.key.clone(),
        message,
    };
    if definition.key.trim().is_empty() {
        return Err(invalid("event key must not be empty".into()));
    }
    let mut seen = BTreeSet::new();
    for param in definition.parameters() {
        if param.name.trim().is_empty() {
            return Err(invalid("parameter name must not be empty".into()));
        }
        if !seen.insert(param.name.as_str()) {
            return Err(invalid(format!("parameter {} declared twice", param.name)));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EventValueType;

    fn customer_event() -> EventDefinition {
        EventDefinition::new("myEvent")
            .correlation_parameter("customerId", EventValueType::String)
            .payload_parameter("payload1", EventValueType::String)
    }

    #[test]
    fn deploy_and_get() {
        let registry = EventRegistry::new();
        assert!(registry.is_empty());

        registry.deploy(customer_event()).unwrap();
        let def = registry.get("myEvent").expect("deployed definition");
        assert!(def.is_correlation_parameter("customerId"));
        assert_eq!(registry.keys(), vec!["myEvent".to_string()]);
    }

    #[test]
    fn redeploy_replaces_definition() {
        let registry = EventRegistry::new();
        registry.deploy(customer_event()).unwrap();
        registry
            .deploy(customer_event().payload_parameter("payload2", EventValueType::Integer))
            .unwrap();

        assert_eq!(registry.len(), 1);
        assert!(registry.get("myEvent").unwrap().parameter("payload2").is_some());
    }

    #[test]
    fn duplicate_parameter_is_rejected() {
        let registry = EventRegistry::new();
        let def = customer_event().payload_parameter("customerId", EventValueType::String);
        let err = registry.deploy(def).unwrap_err();
        assert!(err.to_string().contains("customerId declared twice"));
        assert!(registry.is_empty());
    }

    #[test]
    fn clones_share_state() {
        let registry = EventRegistry::new();
        let clone = registry.clone();
        registry.deploy(customer_event()).unwrap();
        assert!(clone.get("myEvent").is_some());
        assert!(clone.remove("myEvent").is_some());
        assert!(registry.is_empty());
    }
}
