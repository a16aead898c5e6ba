//! Deferred-work records for the async trigger path.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// What a job does when it runs. Handlers are registered per type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Resume a paused execution through the trigger engine.
    Trigger,
    /// Continue an execution from whatever wait state it is pinned to.
    Advance,
    Custom(String),
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Trigger => f.write_str("trigger"),
            Self::Advance => f.write_str("advance"),
            Self::Custom(name) => f.write_str(name),
        }
    }
}

/// A unit of deferred work targeting one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Job {
    pub id: String,
    pub job_type: JobType,
    pub execution_id: String,
    /// Opaque to the queue; decoded by the handler.
    pub payload: serde_json::Value,
    pub retry_count: u32,
    pub due_time: DateTime<Utc>,
    /// Worker currently holding the lease, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// A new job, due immediately.
    pub fn new(job_type: JobType, execution_id: impl Into<String>, payload: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            job_type,
            execution_id: execution_id.into(),
            payload,
            retry_count: 0,
            due_time: now,
            lock_owner: None,
            lock_expires_at: None,
            last_error: None,
            created_at: now,
        }
    }

    pub fn due_at(mut self, due_time: DateTime<Utc>) -> Self {
        self.due_time = due_time;
        self
    }

    /// Due and not leased by a live worker at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        if self.due_time > now {
            return false;
        }
        match self.lock_expires_at {
            Some(expires) => expires <= now,
            None => true,
        }
    }
}

/// A job that will not be retried again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DeadLetterJob {
    pub job: Job,
    pub error: String,
    /// `true` when the failure was a precondition that retrying cannot fix.
    pub permanent: bool,
    pub dead_lettered_at: DateTime<Utc>,
}

/// Longest single retry delay any policy may produce (30 days).
pub const MAX_BACKOFF_MS: u64 = 30 * 24 * 60 * 60 * 1_000;

/// Retry schedule for failed jobs.
///
/// The delay before retry `n` (1-based) is
/// `backoff_ms * backoff_multiplier^(n-1)`, capped at `max_backoff_ms`.
/// A multiplier of `1.0` gives a fixed schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct JobRetryPolicy {
    /// Retries after the first attempt. Default: 3.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Initial backoff in milliseconds. Default: 1 000.
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    /// Backoff multiplier per retry. Default: 2.0.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Upper bound for a single delay. Default: 300 000 (5 min).
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for JobRetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_ms: default_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl JobRetryPolicy {
    /// Fixed delay between retries.
    pub fn fixed(max_retries: u32, backoff_ms: u64) -> Self {
        Self {
            max_retries,
            backoff_ms,
            backoff_multiplier: 1.0,
            max_backoff_ms: backoff_ms,
        }
    }

    /// Rejects schedules that would shrink or overflow.
    pub fn validate(&self) -> Result<(), String> {
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(format!(
                "backoff_multiplier must be a finite number >= 1.0, got {}",
                self.backoff_multiplier
            ));
        }
        if self.max_backoff_ms > MAX_BACKOFF_MS {
            return Err(format!(
                "max_backoff_ms must be at most {MAX_BACKOFF_MS}, got {}",
                self.max_backoff_ms
            ));
        }
        if self.backoff_ms > self.max_backoff_ms {
            return Err(format!(
                "backoff_ms ({}) exceeds max_backoff_ms ({})",
                self.backoff_ms, self.max_backoff_ms
            ));
        }
        Ok(())
    }

    /// Delay before the given retry (1-based). Never longer than
    /// [`MAX_BACKOFF_MS`], even for a policy that failed validation.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
        let raw = self.backoff_ms as f64 * self.backoff_multiplier.powi(exponent);
        let ceiling = self.max_backoff_ms.min(MAX_BACKOFF_MS) as f64;
        // NaN falls through both comparisons to zero.
        let capped = if raw > 0.0 { raw.min(ceiling) } else { 0.0 };
        Duration::milliseconds(capped as i64)
    }

    /// Whether a job that has already been retried `retry_count` times may
    /// be retried once more.
    pub fn allows_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }
}

fn default_max_retries() -> u32 {
    3
}
fn default_backoff_ms() -> u64 {
    1_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_max_backoff_ms() -> u64 {
    300_000
}
