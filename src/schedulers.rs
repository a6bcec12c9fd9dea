//! Schedulers (component J): periodic tasks that promote due entries out
//! of the scheduled/retries sorted sets, reclaim expired reservations and
//! dead workers' outstanding work, and purge the dead set.
//!
//! Each task is a `tokio::spawn`ed loop with a jittered `tokio::time::sleep`
//! and a `CancellationToken` for graceful shutdown, mirroring the
//! teacher's `accept_loop`'s `select! { ..., _ = cancel.cancelled() => }`
//! idiom (`bin/ebeans/main.rs`).

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument};

use crate::coordinator::Coordinator;
use crate::store::PromotableSet;
use crate::time::now_utc;

/// Configurable knobs (spec §9: "Dead-set cap (10,000) and age (180 d) are
/// drawn from conventional defaults; treat as configurable, not fixed").
#[derive(Clone, Copy, Debug)]
pub struct SchedulerConfig {
    /// Base period for the promotion and reclaim passes (spec: 5s ± 15%).
    pub period: Duration,
    /// Base period for the dead-set purge pass (spec: once per minute).
    pub purge_period: Duration,
    pub dead_max_age: chrono::Duration,
    pub dead_max_count: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            period: Duration::from_secs(5),
            purge_period: Duration::from_secs(60),
            dead_max_age: chrono::Duration::days(180),
            dead_max_count: 10_000,
        }
    }
}

/// Jitters `period` by up to ±15% (spec §4.J).
fn jittered(period: Duration) -> Duration {
    let frac = rand::thread_rng().gen_range(-0.15..=0.15_f64);
    period.mul_f64((1.0 + frac).max(0.01))
}

/// Spawns all four periodic tasks, returning their join handles so the
/// caller can `abort()` them on shutdown (the coordinator's own
/// `CancellationToken` is what makes them stop gracefully in the common
/// case; `abort()` is a backstop).
pub fn spawn_all(coordinator: Arc<Coordinator>, config: SchedulerConfig) -> Vec<JoinHandle<()>> {
    vec![
        spawn_promotion(Arc::clone(&coordinator), PromotableSet::Scheduled, config.period),
        spawn_promotion(Arc::clone(&coordinator), PromotableSet::Retries, config.period),
        spawn_reclaim(Arc::clone(&coordinator), config.period),
        spawn_purge(coordinator, config.purge_period, config.dead_max_age, config.dead_max_count),
    ]
}

fn spawn_promotion(
    coordinator: Arc<Coordinator>,
    which: PromotableSet,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = coordinator.cancel.cancelled() => return,
                _ = tokio::time::sleep(jittered(period)) => {},
            }
            run_promotion_pass(&coordinator, which);
        }
    })
}

#[instrument(skip(coordinator), fields(set = ?which))]
fn run_promotion_pass(coordinator: &Coordinator, which: PromotableSet) {
    match coordinator.store().promote_due(which) {
        Ok(jobs) if !jobs.is_empty() => info!(count = jobs.len(), "promoted due jobs"),
        Ok(_) => {},
        Err(error) => error!(%error, "promotion pass failed; continuing"),
    }
}

fn spawn_reclaim(coordinator: Arc<Coordinator>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = coordinator.cancel.cancelled() => return,
                _ = tokio::time::sleep(jittered(period)) => {},
            }
            run_reclaim_pass(&coordinator);
        }
    })
}

#[instrument(skip(coordinator))]
fn run_reclaim_pass(coordinator: &Coordinator) {
    let now = now_utc();

    let expired = coordinator.reservations().reclaim_expired(now);
    if !expired.is_empty() {
        info!(count = expired.len(), "reclaiming expired reservations");
    }
    for reservation in expired {
        if let Err(error) = coordinator.reclaim_as_failure(reservation, "ReservationExpired") {
            error!(%error, "failed to reclaim expired reservation; continuing");
        }
    }

    let dead_workers = coordinator.heartbeats().dead_workers(now);
    for wid in dead_workers {
        let reservations = coordinator.reservations().reclaim_worker(&wid);
        if !reservations.is_empty() {
            info!(%wid, count = reservations.len(), "reclaiming dead worker's reservations");
        }
        for reservation in reservations {
            if let Err(error) = coordinator.reclaim_as_failure(reservation, "WorkerDisconnected") {
                error!(%error, "failed to reclaim dead worker's reservation; continuing");
            }
        }
        coordinator.heartbeats().remove(&wid);
    }
}

fn spawn_purge(
    coordinator: Arc<Coordinator>,
    period: Duration,
    max_age: chrono::Duration,
    max_count: u64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = coordinator.cancel.cancelled() => return,
                _ = tokio::time::sleep(jittered(period)) => {},
            }
            run_purge_pass(&coordinator, max_age, max_count);
        }
    })
}

#[instrument(skip(coordinator))]
fn run_purge_pass(coordinator: &Coordinator, max_age: chrono::Duration, max_count: u64) {
    match coordinator.store().purge_dead(max_age, max_count) {
        Ok(removed) if removed > 0 => info!(removed, "purged dead set"),
        Ok(_) => {},
        Err(error) => error!(%error, "dead-set purge pass failed; continuing"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Job;
    use crate::time::{format_ts, random_jid};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn boot() -> Arc<Coordinator> {
        let mut p = std::env::temp_dir();
        p.push(format!("faktory-rs-scheduler-test-{}", random_jid()));
        Coordinator::boot(p, None, 60).unwrap()
    }

    fn job(jid: &str) -> Job {
        Job {
            jid: jid.to_string(),
            jobtype: "SomeWorker".into(),
            args: json!([]),
            queue: "default".into(),
            created_at: now_utc(),
            enqueued_at: None,
            at: None,
            retry: 25,
            reserve_for: 60,
            failure: None,
            extra: BTreeMap::new(),
        }
    }

    #[test]
    fn jittered_stays_within_fifteen_percent() {
        let period = Duration::from_secs(5);
        for _ in 0..100 {
            let j = jittered(period);
            assert!(j >= Duration::from_millis(4250) && j <= Duration::from_millis(5750));
        }
    }

    #[test]
    fn promotion_pass_moves_due_scheduled_jobs() {
        let coord = boot();
        let j = job("aaaaaaaaaaaaaaaa");
        let ts = format_ts(now_utc() - chrono::Duration::seconds(1));
        coord.store().scheduled().add(&ts, &j.jid, &j.encode().unwrap()).unwrap();

        run_promotion_pass(&coord, PromotableSet::Scheduled);

        assert_eq!(coord.store().scheduled().size().unwrap(), 0);
        assert_eq!(coord.store().get_queue("default").unwrap().size().unwrap(), 1);
    }

    #[tokio::test]
    async fn reclaim_pass_requeues_expired_reservation_as_retry() {
        let coord = boot();
        let mut session = crate::coordinator::Session::new();
        session.identified = true;
        session.wid = "w1".to_string();

        coord.push(job("bbbbbbbbbbbbbbbb")).unwrap();
        coord.fetch(&session, vec!["default".to_string()]).await.unwrap();

        // Manually force the reservation's deadline into the past by
        // reclaiming at a time far enough in the future that even a 60s
        // lease has expired.
        let far_future = now_utc() + chrono::Duration::seconds(120);
        let expired = coord.reservations().reclaim_expired(far_future);
        assert_eq!(expired.len(), 1);
        for reservation in expired {
            coord.reclaim_as_failure(reservation, "ReservationExpired").unwrap();
        }

        assert_eq!(coord.reservations().len(), 0);
        assert_eq!(coord.store().retries().size().unwrap(), 1);
    }

    #[test]
    fn purge_pass_removes_aged_out_dead_entries() {
        let coord = boot();
        let j = job("cccccccccccccccc");
        let ts = format_ts(now_utc() - chrono::Duration::days(200));
        coord.store().dead().add(&ts, &j.jid, &j.encode().unwrap()).unwrap();

        run_purge_pass(&coord, chrono::Duration::days(180), 10_000);

        assert_eq!(coord.store().dead().size().unwrap(), 0);
    }
}
