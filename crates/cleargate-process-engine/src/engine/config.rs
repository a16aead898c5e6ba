//! Engine configuration.

use serde::{Deserialize, Serialize};

use crate::defaults::DecoderConfig;
use crate::jobs::JobExecutorConfig;
use crate::types::JobRetryPolicy;

/// How matched execution subscriptions are triggered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    /// Inline, on the dispatching task.
    #[default]
    Sync,
    /// Through a durable `trigger` job.
    Async,
}

/// Everything tunable about a [`ProcessEngine`](super::ProcessEngine).
/// Every field has a default, so `{}` is a valid configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct EngineConfig {
    #[serde(default)]
    pub trigger_mode: TriggerMode,
    #[serde(default)]
    pub job_executor: JobExecutorConfig,
    #[serde(default)]
    pub retry: JobRetryPolicy,
    #[serde(default)]
    pub decoder: DecoderConfig,
}

impl EngineConfig {
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Checks every section, naming the first one out of range.
    pub fn validate(&self) -> Result<(), String> {
        self.job_executor
            .validate()
            .map_err(|e| format!("job_executor: {e}"))?;
        self.retry.validate().map_err(|e| format!("retry: {e}"))?;
        if self.decoder.event_key_field.is_empty() {
            return Err("decoder: event_key_field must not be empty".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_gives_defaults() {
        let config = EngineConfig::from_json("{}").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.trigger_mode, TriggerMode::Sync);
        assert_eq!(config.decoder.event_key_field, "type");
        assert_eq!(config.job_executor.workers, 2);
        assert_eq!(config.retry.max_retries, 3);
    }

    #[test]
    fn out_of_range_sections_fail_validation() {
        assert!(EngineConfig::default().validate().is_ok());

        let config = EngineConfig::from_json(r#"{"job_executor": {"lock_duration_ms": 18446744073709551615}}"#)
            .unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.starts_with("job_executor:"), "{err}");

        let config = EngineConfig::from_json(r#"{"retry": {"backoff_multiplier": 0.0}}"#).unwrap();
        assert!(config.validate().unwrap_err().starts_with("retry:"));

        let config = EngineConfig::from_json(r#"{"decoder": {"event_key_field": ""}}"#).unwrap();
        assert!(config.validate().unwrap_err().starts_with("decoder:"));
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let config = EngineConfig::from_json(
            r#"{
                "trigger_mode": "async",
                "job_executor": {"workers": 4},
                "retry": {"max_retries": 5, "backoff_multiplier": 1.0},
                "decoder": {"event_key_field": "eventKey"}
            }"#,
        )
        .unwrap();
        assert_eq!(config.trigger_mode, TriggerMode::Async);
        assert_eq!(config.job_executor.workers, 4);
        assert_eq!(config.job_executor.batch_size, 10);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.backoff_ms, 1_000);
        assert_eq!(config.decoder.event_key_field, "eventKey");
    }
}
