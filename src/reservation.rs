//! Reservation registry (component H): an in-memory `jid -> Reservation`
//! map plus a time-ordered index for expiry scanning.
//!
//! In-memory, not durable: real Faktory's working set is not persisted
//! either. A crash loses in-flight reservations; the lease-expiry reclaim
//! path is what recovers them.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::job::Job;

#[derive(Clone, Debug)]
pub struct Reservation {
    pub jid: String,
    pub wid: String,
    pub expires_at: DateTime<Utc>,
    pub queue: String,
    pub job: Job,
}

struct Inner {
    by_jid: HashMap<String, Reservation>,
    /// Secondary index for cheap expiry scans: kept alongside the primary
    /// map rather than derived from it on each reclaim pass.
    by_deadline: BTreeSet<(DateTime<Utc>, String)>,
}

/// `jid -> Reservation`, single-mutex guarded per spec §5 ("reservation
/// registry uses a single mutex, fine-grained sharding optional").
pub struct ReservationRegistry {
    inner: Mutex<Inner>,
}

impl Default for ReservationRegistry {
    fn default() -> Self {
        ReservationRegistry {
            inner: Mutex::new(Inner { by_jid: HashMap::new(), by_deadline: BTreeSet::new() }),
        }
    }
}

impl ReservationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a freshly-fetched job as reserved by `wid` until
    /// `expires_at`.
    pub fn insert(&self, wid: &str, queue: &str, expires_at: DateTime<Utc>, job: Job) {
        let mut inner = self.inner.lock().expect("reservation mutex poisoned");
        let jid = job.jid.clone();
        inner.by_deadline.insert((expires_at, jid.clone()));
        inner.by_jid.insert(
            jid.clone(),
            Reservation { jid, wid: wid.to_string(), expires_at, queue: queue.to_string(), job },
        );
    }

    /// Removes the reservation for `jid` iff it's owned by `wid`. Returns
    /// the reservation on success so the caller can inspect its job/queue.
    pub fn remove_owned(&self, jid: &str, wid: &str) -> Option<Reservation> {
        let mut inner = self.inner.lock().expect("reservation mutex poisoned");
        let owns = inner.by_jid.get(jid).is_some_and(|r| r.wid == wid);
        if !owns {
            return None;
        }
        let r = inner.by_jid.remove(jid)?;
        inner.by_deadline.remove(&(r.expires_at, jid.to_string()));
        Some(r)
    }

    /// Removes and returns every reservation whose lease has expired as
    /// of `now`, for the reclaim scheduler (component J).
    pub fn reclaim_expired(&self, now: DateTime<Utc>) -> Vec<Reservation> {
        let mut inner = self.inner.lock().expect("reservation mutex poisoned");
        // `by_deadline` is ordered by (deadline, jid), so every entry with
        // deadline <= now is a contiguous prefix.
        let expired: Vec<(DateTime<Utc>, String)> =
            inner.by_deadline.iter().take_while(|(t, _)| *t <= now).cloned().collect();

        let mut out = Vec::with_capacity(expired.len());
        for key in expired {
            inner.by_deadline.remove(&key);
            if let Some(r) = inner.by_jid.remove(&key.1) {
                out.push(r);
            }
        }
        out
    }

    /// Removes every reservation owned by `wid`, for dead-worker cleanup
    /// (spec §4.K: "a worker absent > 60s is considered dead: its
    /// outstanding reservations are reclaimed").
    pub fn reclaim_worker(&self, wid: &str) -> Vec<Reservation> {
        let mut inner = self.inner.lock().expect("reservation mutex poisoned");
        let jids: Vec<String> = inner
            .by_jid
            .values()
            .filter(|r| r.wid == wid)
            .map(|r| r.jid.clone())
            .collect();

        let mut out = Vec::with_capacity(jids.len());
        for jid in jids {
            if let Some(r) = inner.by_jid.remove(&jid) {
                inner.by_deadline.remove(&(r.expires_at, jid));
                out.push(r);
            }
        }
        out
    }

    pub fn get(&self, jid: &str) -> Option<Reservation> {
        self.inner.lock().expect("reservation mutex poisoned").by_jid.get(jid).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("reservation mutex poisoned").by_jid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn all(&self) -> Vec<Reservation> {
        self.inner.lock().expect("reservation mutex poisoned").by_jid.values().cloned().collect()
    }

    /// Drops every reservation without returning the jobs to a queue or
    /// set. Used by `FLUSH` (spec §4.G: "clears all state; debugging").
    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("reservation mutex poisoned");
        inner.by_jid.clear();
        inner.by_deadline.clear();
    }
}
