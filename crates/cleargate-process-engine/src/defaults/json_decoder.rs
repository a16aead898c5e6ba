//! JSON channel decoder.
//!
//! Reads a JSON object, takes the event type from a configurable field
//! (default `"type"`) and maps the remaining fields directly onto payload
//! parameters of the same name, typed by the deployed
//! [`EventDefinition`](crate::types::EventDefinition). Undeclared fields are
//! dropped. A field whose JSON type does not fit its declaration is left out
//! of the payload; the event is still delivered, so listeners that do not
//! correlate on that field still match.

use serde::{Deserialize, Serialize};

use crate::errors::DecodeError;
use crate::registry::EventRegistry;
use crate::traits::EventDecoder;
use crate::types::{InboundEvent, Payload};

/// Decoder configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DecoderConfig {
    /// JSON field holding the event type. Default: `"type"`.
    #[serde(default = "default_event_key_field")]
    pub event_key_field: String,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            event_key_field: default_event_key_field(),
        }
    }
}

fn default_event_key_field() -> String {
    "type".into()
}

pub struct JsonEventDecoder {
    registry: EventRegistry,
    config: DecoderConfig,
}

impl JsonEventDecoder {
    pub fn new(registry: EventRegistry, config: DecoderConfig) -> Self {
        Self { registry, config }
    }
}

impl EventDecoder for JsonEventDecoder {
    fn decode(&self, raw: &[u8]) -> Result<InboundEvent, DecodeError> {
        let value: serde_json::Value =
            serde_json::from_slice(raw).map_err(|e| DecodeError::Malformed {
                message: e.to_string(),
            })?;
        let serde_json::Value::Object(fields) = value else {
            return Err(DecodeError::Malformed {
                message: "expected a JSON object".into(),
            });
        };

        let key_field = &self.config.event_key_field;
        let event_type = fields
            .get(key_field)
            .and_then(|v| v.as_str())
            .ok_or_else(|| DecodeError::MissingEventKey {
                field: key_field.clone(),
            })?
            .to_string();

        let definition =
            self.registry
                .get(&event_type)
                .ok_or_else(|| DecodeError::UnknownEventType {
                    event_type: event_type.clone(),
                })?;

        let mut payload = Payload::new();
        for param in definition.parameters() {
            let Some(raw_value) = fields.get(&param.name) else {
                continue;
            };
            match param.value_type.coerce(raw_value) {
                Some(value) => {
                    payload.insert(param.name.clone(), value);
                }
                None => tracing::warn!(
                    event_type = %event_type,
                    field = %param.name,
                    expected = %param.value_type,
                    "event field has the wrong type, left out of the payload"
                ),
            }
        }

        Ok(InboundEvent {
            event_type,
            payload,
        })
    }
}
