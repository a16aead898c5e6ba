//! Correlation matching and reference keys.
//!
//! [`matches`] is the pure predicate deciding which subscriptions an inbound
//! event satisfies. [`ReferenceKeyStrategy`] turns a correlation key into the
//! reference id that enforces the single-instance start policy.

use sha2::{Digest, Sha256};

use super::types::{CorrelationKey, EventDefinition, EventSubscription, EventValue, Payload};

// ---------------------------------------------------------------------------
// Matching
// ---------------------------------------------------------------------------

/// Whether one subscription is satisfied by an event.
///
/// The event type must be equal and every correlation entry must equal the
/// payload field of the same name. Comparison is type-sensitive and an
/// absent payload field never matches, not even a `null` entry.
pub fn is_match(event_type: &str, payload: &Payload, subscription: &EventSubscription) -> bool {
    subscription.event_type == event_type
        && subscription
            .correlation
            .iter()
            .all(|(name, expected)| payload.get(name) == Some(expected))
}

/// Every candidate the event satisfies, in candidate order.
pub fn matches(
    event_type: &str,
    payload: &Payload,
    candidates: &[EventSubscription],
) -> Vec<EventSubscription> {
    candidates
        .iter()
        .filter(|s| is_match(event_type, payload, s))
        .cloned()
        .collect()
}

/// Project a payload onto the correlation parameters declared for its type.
///
/// Parameters absent from the payload are absent from the key.
pub fn correlation_key(definition: &EventDefinition, payload: &Payload) -> CorrelationKey {
    CorrelationKey(
        definition
            .correlation_parameters
            .iter()
            .filter_map(|p| payload.get(&p.name).map(|v| (p.name.clone(), v.clone())))
            .collect(),
    )
}

// ---------------------------------------------------------------------------
// Reference keys
// ---------------------------------------------------------------------------

/// Maps a correlation key to the reference id recorded on an event-started
/// instance. Two events whose keys map to the same id are "the same
/// instance" for the single-instance policy.
pub trait ReferenceKeyStrategy: Send + Sync {
    fn reference_id(&self, process_definition_id: &str, key: &CorrelationKey) -> String;
}

/// Exact, type-sensitive equality: SHA-256 over the canonical JSON of the
/// definition id and the key.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExactCorrelationKey;

impl ReferenceKeyStrategy for ExactCorrelationKey {
    fn reference_id(&self, process_definition_id: &str, key: &CorrelationKey) -> String {
        let correlation: serde_json::Map<String, serde_json::Value> = key
            .0
            .iter()
            .map(|(name, value)| (name.clone(), to_json(value)))
            .collect();
        let mut canonical = serde_json::Map::new();
        canonical.insert("correlation".into(), serde_json::Value::Object(correlation));
        canonical.insert(
            "process_definition_id".into(),
            serde_json::Value::String(process_definition_id.to_string()),
        );
        let bytes = serde_json::Value::Object(canonical).to_string();
        let hash = Sha256::digest(bytes.as_bytes());
        format!("{hash:x}")
    }
}

fn to_json(value: &EventValue) -> serde_json::Value {
    use serde_json::Value as Json;
    match value {
        EventValue::Null => Json::Null,
        EventValue::Boolean(b) => Json::Bool(*b),
        EventValue::Integer(i) => Json::from(*i),
        EventValue::Double(d) => serde_json::Number::from_f64(*d)
            .map(Json::Number)
            .unwrap_or(Json::Null),
        EventValue::String(s) => Json::String(s.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EventValueType, NewSubscription};

    fn sub(event_type: &str) -> NewSubscription {
        NewSubscription::for_execution(event_type, "exec-1", "inst-1")
    }

    fn payload(pairs: &[(&str, EventValue)]) -> Payload {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn empty_correlation_matches_every_event_of_the_type() {
        let s = EventSubscription::from_new(sub("myEvent"));
        assert!(is_match("myEvent", &Payload::new(), &s));
        assert!(is_match("myEvent", &payload(&[("customerId", "kermit".into())]), &s));
        assert!(!is_match("otherEvent", &Payload::new(), &s));
    }

    #[test]
    fn correlation_requires_exact_typed_value() {
        let s = EventSubscription::from_new(sub("myEvent").correlate("customerId", "kermit"));
        assert!(is_match("myEvent", &payload(&[("customerId", "kermit".into())]), &s));
        assert!(!is_match("myEvent", &payload(&[("customerId", "fozzie".into())]), &s));
        assert!(!is_match("myEvent", &Payload::new(), &s));

        let numeric = EventSubscription::from_new(sub("myEvent").correlate("orderId", 1));
        assert!(!is_match("myEvent", &payload(&[("orderId", "1".into())]), &numeric));
        assert!(is_match("myEvent", &payload(&[("orderId", 1.into())]), &numeric));
    }

    #[test]
    fn null_entry_needs_explicit_null_field() {
        let s = EventSubscription::from_new(sub("myEvent").correlate("customerId", EventValue::Null));
        assert!(!is_match("myEvent", &Payload::new(), &s));
        assert!(is_match("myEvent", &payload(&[("customerId", EventValue::Null)]), &s));
    }

    #[test]
    fn matches_preserves_candidate_order() {
        let a = EventSubscription::from_new(sub("myEvent"));
        let b = EventSubscription::from_new(sub("myEvent").correlate("customerId", "kermit"));
        let c = EventSubscription::from_new(sub("myEvent").correlate("customerId", "fozzie"));
        let d = EventSubscription::from_new(sub("otherEvent"));
        let candidates = vec![a.clone(), b.clone(), c, d];

        let found = matches("myEvent", &payload(&[("customerId", "kermit".into())]), &candidates);
        let ids: Vec<_> = found.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec![a.id.as_str(), b.id.as_str()]);
    }

    #[test]
    fn correlation_key_projects_declared_parameters_only() {
        let def = EventDefinition::new("myEvent")
            .correlation_parameter("customerId", EventValueType::String)
            .correlation_parameter("orderId", EventValueType::String)
            .payload_parameter("payload1", EventValueType::String);
        let p = payload(&[("customerId", "kermit".into()), ("payload1", "hello".into())]);

        let key = correlation_key(&def, &p);
        assert_eq!(key.get("customerId"), Some(&EventValue::from("kermit")));
        assert!(key.get("orderId").is_none());
        assert!(key.get("payload1").is_none());
    }

    #[test]
    fn reference_id_is_stable_and_discriminating() {
        let strategy = ExactCorrelationKey;
        let kermit = CorrelationKey([("customerId".to_string(), EventValue::from("kermit"))].into());
        let fozzie = CorrelationKey([("customerId".to_string(), EventValue::from("fozzie"))].into());
        let numeric = CorrelationKey([("customerId".to_string(), EventValue::from("1"))].into());
        let integer = CorrelationKey([("customerId".to_string(), EventValue::from(1))].into());

        let a = strategy.reference_id("process:1", &kermit);
        assert_eq!(a, strategy.reference_id("process:1", &kermit.clone()));
        assert_eq!(a.len(), 64);
        assert_ne!(a, strategy.reference_id("process:1", &fozzie));
        assert_ne!(a, strategy.reference_id("process:2", &kermit));
        assert_ne!(
            strategy.reference_id("process:1", &numeric),
            strategy.reference_id("process:1", &integer)
        );
    }
}
