//! Job record schema, JSON codec, and `PUSH` validation (component F).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ValidationError;

pub const DEFAULT_QUEUE: &str = "default";
pub const DEFAULT_RETRY: i64 = 25;
pub const DEFAULT_RESERVE_FOR: u32 = 1800;
pub const MIN_RESERVE_FOR: u32 = 60;
const MAX_QUEUE_NAME_BYTES: usize = 128;
const MIN_JID_LEN: usize = 16;

/// Failure metadata recorded on a job after its first failed attempt.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Failure {
    pub retry_count: u32,
    pub failed_at: DateTime<Utc>,
    pub next_at: Option<DateTime<Utc>>,
    pub error_class: String,
    pub error_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backtrace: Option<Vec<String>>,
}

/// A work unit. Unknown fields are preserved in `extra` so that forward-
/// compatible clients can round-trip fields this crate doesn't model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub jid: String,
    pub jobtype: String,
    pub args: Value,
    #[serde(default = "default_queue")]
    pub queue: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enqueued_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at: Option<DateTime<Utc>>,
    #[serde(default = "default_retry")]
    pub retry: i64,
    #[serde(default = "default_reserve_for")]
    pub reserve_for: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<Failure>,

    /// Fields not modeled above. Preserved verbatim across decode/encode.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

fn default_queue() -> String {
    DEFAULT_QUEUE.to_string()
}

fn default_retry() -> i64 {
    DEFAULT_RETRY
}

fn default_reserve_for() -> u32 {
    DEFAULT_RESERVE_FOR
}

impl Job {
    /// Encodes a job as canonical JSON bytes.
    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Decodes a job from JSON bytes produced by [`Job::encode`] (or any
    /// compatible client).
    pub fn decode(bytes: &[u8]) -> serde_json::Result<Job> {
        serde_json::from_slice(bytes)
    }

    /// Effective lease duration, clamped to the 60s floor.
    pub fn reserve_for_secs(&self) -> u32 {
        self.reserve_for.max(MIN_RESERVE_FOR)
    }
}

/// Validates a job for admission via `PUSH`.
pub fn validate_push(job: &Job) -> Result<(), ValidationError> {
    if job.jid.len() < MIN_JID_LEN {
        return Err(ValidationError::JidTooShort);
    }
    if job.jobtype.is_empty() {
        return Err(ValidationError::EmptyJobType);
    }
    if !matches!(job.args, Value::Array(_) | Value::Object(_)) {
        return Err(ValidationError::MissingArgs);
    }
    if job.queue.is_empty()
        || !job
            .queue
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-'))
    {
        return Err(ValidationError::InvalidQueueName(job.queue.clone()));
    }
    if job.queue.len() > MAX_QUEUE_NAME_BYTES {
        return Err(ValidationError::QueueNameTooLong);
    }
    // `retry` is typed as i64 on the struct so decode already rejects
    // non-integers; nothing further to check here beyond the type itself.
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Job {
        Job {
            jid: "a".repeat(16),
            jobtype: "SomeWorker".into(),
            args: json!([1, 2, 3]),
            queue: "default".into(),
            created_at: Utc::now(),
            enqueued_at: None,
            at: None,
            retry: 25,
            reserve_for: 1800,
            failure: None,
            extra: BTreeMap::new(),
        }
    }

    #[test]
    fn round_trip_preserves_unknown_fields() {
        let mut job = sample();
        job.extra
            .insert("custom".into(), json!({"trace_id": "abc123"}));

        let encoded = job.encode().unwrap();
        let decoded = Job::decode(&encoded).unwrap();
        assert_eq!(decoded, job);

        let reencoded = decoded.encode().unwrap();
        let redecoded = Job::decode(&reencoded).unwrap();
        assert_eq!(redecoded, job);
    }

    #[test]
    fn validate_rejects_short_jid() {
        let mut job = sample();
        job.jid = "short".into();
        assert_eq!(validate_push(&job), Err(ValidationError::JidTooShort));
    }

    #[test]
    fn validate_rejects_empty_jobtype() {
        let mut job = sample();
        job.jobtype = "".into();
        assert_eq!(validate_push(&job), Err(ValidationError::EmptyJobType));
    }

    #[test]
    fn validate_rejects_scalar_args() {
        let mut job = sample();
        job.args = json!("not-an-array-or-object");
        assert_eq!(validate_push(&job), Err(ValidationError::MissingArgs));
    }

    #[test]
    fn validate_rejects_bad_queue_name() {
        let mut job = sample();
        job.queue = "bad queue!".into();
        assert!(matches!(
            validate_push(&job),
            Err(ValidationError::InvalidQueueName(_))
        ));
    }

    #[test]
    fn reserve_for_is_floored_at_60() {
        let mut job = sample();
        job.reserve_for = 5;
        assert_eq!(job.reserve_for_secs(), MIN_RESERVE_FOR);
    }
}
