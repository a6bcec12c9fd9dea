//! Retry policy (component I): decides retry vs dead, and computes the
//! next run time, on job failure.

use chrono::{DateTime, Utc};
use rand::Rng;

use crate::job::{Failure, Job};
use crate::time::now_utc;

/// What a failed job's next placement should be.
pub enum Disposition {
    /// Re-insert into the retries set at `next_at`.
    Retry { next_at: DateTime<Utc> },
    /// Move straight to the dead set.
    Dead,
}

/// A single failure report from `FAIL` (or a synthetic reservation-expiry
/// failure).
pub struct FailureReport<'a> {
    pub error_class: &'a str,
    pub error_message: &'a str,
    pub backtrace: Option<Vec<String>>,
}

/// Applies `report` to `job`, mutating its `failure` field in place, and
/// returns where it should land next.
///
/// `next_at = now + (retry_count^4 + 15 + rand(0..30))` seconds
/// (spec §4.I: "cubic-plus-jitter" — named cubic in the prose but the
/// formula itself is the 4th power, which is what's implemented here and
/// checked by the seed scenario in spec §8 item 3).
pub fn apply_failure(job: &mut Job, report: FailureReport<'_>) -> Disposition {
    let now = now_utc();
    let retry_count = job.failure.as_ref().map(|f| f.retry_count).unwrap_or(0) + 1;

    let dead = job.retry < 0 || retry_count as i64 > job.retry;

    let next_at = if dead {
        None
    } else {
        let jitter = rand::thread_rng().gen_range(0..30);
        let delay = (retry_count as i64).pow(4) + 15 + jitter;
        Some(now + chrono::Duration::seconds(delay))
    };

    job.failure = Some(Failure {
        retry_count,
        failed_at: now,
        next_at,
        error_class: report.error_class.to_string(),
        error_message: report.error_message.to_string(),
        backtrace: report.backtrace,
    });

    match next_at {
        Some(next_at) => Disposition::Retry { next_at },
        None => Disposition::Dead,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn job(retry: i64) -> Job {
        Job {
            jid: "a".repeat(16),
            jobtype: "SomeWorker".into(),
            args: json!([]),
            queue: "default".into(),
            created_at: now_utc(),
            enqueued_at: None,
            at: None,
            retry,
            reserve_for: 1800,
            failure: None,
            extra: BTreeMap::new(),
        }
    }

    fn report() -> FailureReport<'static> {
        FailureReport { error_class: "E", error_message: "boom", backtrace: None }
    }

    #[test]
    fn first_failure_with_budget_retries() {
        let mut j = job(3);
        let before = now_utc();
        let disposition = apply_failure(&mut j, report());

        assert_eq!(j.failure.as_ref().unwrap().retry_count, 1);
        match disposition {
            Disposition::Retry { next_at } => {
                let delta = (next_at - before).num_seconds();
                assert!((15..=46).contains(&delta), "delta was {delta}");
            },
            Disposition::Dead => panic!("expected retry"),
        }
    }

    #[test]
    fn exhausting_retry_budget_goes_dead() {
        let mut j = job(3);
        for _ in 0..3 {
            apply_failure(&mut j, report());
        }
        // retry_count is now 3, equal to retry=3: still within budget (3 > 3 is false)
        assert_eq!(j.failure.as_ref().unwrap().retry_count, 3);

        match apply_failure(&mut j, report()) {
            Disposition::Dead => {},
            Disposition::Retry { .. } => panic!("expected dead, retry_count now 4 > retry=3"),
        }
    }

    #[test]
    fn negative_retry_goes_straight_to_dead() {
        let mut j = job(-1);
        match apply_failure(&mut j, report()) {
            Disposition::Dead => {},
            Disposition::Retry { .. } => panic!("expected dead for retry < 0"),
        }
    }
}
