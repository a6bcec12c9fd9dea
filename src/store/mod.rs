//! Store facade (component E): owns the KV backend and exposes the named
//! queues plus the three built-in sorted sets, with lifecycle
//! open/close/flush.
//!
//! Per the Design Notes ("global singleton store... re-architect as a
//! Coordinator object owned by the application root"), this is a plain
//! struct handed around as `Arc<Store>` rather than process-global state.

pub mod queue;
pub mod sortedset;

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::error::StoreError;
use crate::job::Job;
use crate::kv::{Kv, KvOp};
use crate::time::{format_ts, now_utc};

pub use queue::Queue;
pub use sortedset::SortedSet;

const SCHEDULED: &str = "scheduled";
const RETRIES: &str = "retries";
const DEAD: &str = "dead";

fn queue_registry_key(name: &str) -> Vec<u8> {
    format!("m|queues|{name}").into_bytes()
}

/// The two sorted sets that feed a destination queue on promotion. `dead`
/// is deliberately excluded: it has no promotion path, only purge.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PromotableSet {
    Scheduled,
    Retries,
}

impl PromotableSet {
    fn name(self) -> &'static str {
        match self {
            PromotableSet::Scheduled => SCHEDULED,
            PromotableSet::Retries => RETRIES,
        }
    }
}

pub struct Store {
    kv: Arc<Kv>,
    queues: Mutex<HashMap<String, Arc<Queue>>>,
    scheduled: SortedSet,
    retries: SortedSet,
    dead: SortedSet,
}

impl Store {
    /// Opens the store at `data_dir`, creating it if absent.
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let kv = Arc::new(Kv::open(data_dir)?);
        Ok(Store {
            scheduled: SortedSet::new(Arc::clone(&kv), SCHEDULED),
            retries: SortedSet::new(Arc::clone(&kv), RETRIES),
            dead: SortedSet::new(Arc::clone(&kv), DEAD),
            queues: Mutex::new(HashMap::new()),
            kv,
        })
    }

    pub fn scheduled(&self) -> &SortedSet {
        &self.scheduled
    }

    pub fn retries(&self) -> &SortedSet {
        &self.retries
    }

    pub fn dead(&self) -> &SortedSet {
        &self.dead
    }

    /// Returns the named queue, creating it (and registering it in the
    /// queue index used by [`Store::queue_names`]) on first use.
    pub fn get_queue(&self, name: &str) -> Result<Arc<Queue>, StoreError> {
        let mut queues = self.queues.lock().expect("queue registry mutex poisoned");
        if let Some(q) = queues.get(name) {
            return Ok(Arc::clone(q));
        }

        self.kv.put(&queue_registry_key(name), b"")?;
        let q = Arc::new(Queue::new(Arc::clone(&self.kv), name.to_string(), Arc::new(Notify::new())));
        queues.insert(name.to_string(), Arc::clone(&q));
        Ok(q)
    }

    /// Every queue name ever admitted via [`Store::get_queue`], from the
    /// durable registry (so it survives restarts even for now-empty
    /// queues).
    pub fn queue_names(&self) -> Result<Vec<String>, StoreError> {
        let prefix = b"m|queues|";
        let mut names = Vec::new();
        for entry in self.kv.scan(prefix) {
            let (k, _) = entry?;
            names.push(String::from_utf8_lossy(&k[prefix.len()..]).into_owned());
        }
        Ok(names)
    }

    /// Atomically promotes every due entry out of `which` into its
    /// recorded destination queue, as a single KV batch: a crash
    /// mid-operation either leaves the job in the sorted set or already in
    /// its queue, never neither. Returns the promoted jobs (with
    /// `enqueued_at` refreshed).
    ///
    /// Holds the KV's single-writer lock across the whole scan-then-write
    /// sequence (same reason as [`SortedSet::remove_before`]), and since it
    /// also assigns fresh tail slots per destination queue, this is what
    /// serializes promotion against concurrent `PUSH`/`FETCH` on those same
    /// queues.
    pub fn promote_due(&self, which: PromotableSet) -> Result<Vec<Job>, StoreError> {
        let _writer = self.kv.lock_writer();

        let set = match which {
            PromotableSet::Scheduled => &self.scheduled,
            PromotableSet::Retries => &self.retries,
        };

        let now = now_utc();
        let upper = sortedset::cutoff_key(set.name(), &format_ts(now));

        let due: Vec<(Vec<u8>, Vec<u8>)> = set
            .each()
            .take_while(|r| match r {
                Ok((k, _)) => k.as_slice() <= upper.as_slice(),
                Err(_) => true,
            })
            .collect::<Result<_, _>>()?;

        if due.is_empty() {
            return Ok(Vec::new());
        }

        let mut ops = Vec::with_capacity(due.len() * 2 + 1);
        let mut tails: HashMap<String, u64> = HashMap::new();
        let mut jobs = Vec::with_capacity(due.len());

        for (key, payload) in &due {
            ops.push(KvOp::delete(key.clone()));

            let mut job = Job::decode(payload)?;
            job.enqueued_at = Some(now);
            let payload = job.encode()?;

            let qname = job.queue.clone();
            let next_tail = match tails.get(&qname) {
                Some(t) => *t,
                None => self.get_queue(&qname)?.tail()?,
            };

            ops.push(KvOp::put(queue::job_key(&qname, next_tail), payload));
            ops.push(KvOp::put(queue::tail_key(&qname), (next_tail + 1).to_be_bytes().to_vec()));
            tails.insert(qname, next_tail + 1);

            jobs.push(job);
        }

        let size = set.size()?;
        ops.push(KvOp::put(
            sortedset::size_key(set.name()),
            size.saturating_sub(due.len() as u64).to_be_bytes().to_vec(),
        ));

        self.kv.atomic_batch(ops)?;

        for qname in tails.keys() {
            self.get_queue(qname)?.notify().notify_waiters();
        }

        Ok(jobs)
    }

    /// Purges the dead set: drops entries older than `max_age`, then caps
    /// the remainder at `max_count` by deleting the oldest survivors. Both
    /// are configurable defaults, not fixed constants.
    pub fn purge_dead(&self, max_age: chrono::Duration, max_count: u64) -> Result<usize, StoreError> {
        let cutoff = format_ts(now_utc() - max_age);
        let mut removed = self.dead.remove_before(&cutoff)?.len();

        let size = self.dead.size()?;
        if size > max_count {
            let excess = (size - max_count) as usize;
            let victims: Vec<Vec<u8>> = self
                .dead
                .page(0, excess)
                .map(|r| r.map(|(k, _)| k))
                .collect::<Result<_, _>>()?;
            for key in &victims {
                self.dead.remove(key)?;
            }
            removed += victims.len();
        }

        Ok(removed)
    }

    /// Flushes all pending writes to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        Ok(self.kv.flush()?)
    }

    /// Flushes and marks the backend closed.
    pub fn close(&self) -> Result<(), StoreError> {
        Ok(self.kv.close()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn open_tmp() -> Store {
        let mut p = std::env::temp_dir();
        p.push(format!("faktory-rs-store-test-{}", crate::time::random_jid()));
        Store::open(p).unwrap()
    }

    fn job(jid: &str, queue: &str) -> Job {
        Job {
            jid: jid.to_string(),
            jobtype: "SomeWorker".into(),
            args: json!([]),
            queue: queue.to_string(),
            created_at: now_utc(),
            enqueued_at: None,
            at: None,
            retry: 25,
            reserve_for: 1800,
            failure: None,
            extra: BTreeMap::new(),
        }
    }

    #[test]
    fn promote_due_moves_scheduled_jobs_into_their_queues() {
        let store = open_tmp();
        let j = job("aaaaaaaaaaaaaaaa", "default");
        let ts = format_ts(now_utc() - chrono::Duration::seconds(5));

        store.scheduled().add(&ts, &j.jid, &j.encode().unwrap()).unwrap();
        assert_eq!(store.scheduled().size().unwrap(), 1);

        let promoted = store.promote_due(PromotableSet::Scheduled).unwrap();
        assert_eq!(promoted.len(), 1);
        assert_eq!(promoted[0].jid, j.jid);

        assert_eq!(store.scheduled().size().unwrap(), 0);
        assert_eq!(store.get_queue("default").unwrap().size().unwrap(), 1);
    }

    #[test]
    fn promote_due_is_noop_when_nothing_is_due() {
        let store = open_tmp();
        let j = job("bbbbbbbbbbbbbbbb", "default");
        let ts = format_ts(now_utc() + chrono::Duration::seconds(60));

        store.scheduled().add(&ts, &j.jid, &j.encode().unwrap()).unwrap();

        let promoted = store.promote_due(PromotableSet::Scheduled).unwrap();
        assert!(promoted.is_empty());
        assert_eq!(store.scheduled().size().unwrap(), 1);
    }

    #[test]
    fn purge_dead_respects_age_and_count_cap() {
        let store = open_tmp();
        for i in 0..5u32 {
            let j = job(&format!("{i:016x}"), "default");
            let ts = format_ts(now_utc() - chrono::Duration::days(200) + chrono::Duration::seconds(i as i64));
            store.dead().add(&ts, &j.jid, &j.encode().unwrap()).unwrap();
        }
        for i in 5..8u32 {
            let j = job(&format!("{i:016x}"), "default");
            let ts = format_ts(now_utc());
            store.dead().add(&ts, &j.jid, &j.encode().unwrap()).unwrap();
        }

        let removed = store.purge_dead(chrono::Duration::days(180), 100).unwrap();
        assert_eq!(removed, 5);
        assert_eq!(store.dead().size().unwrap(), 3);
    }

    #[test]
    fn queue_names_survive_relisting() {
        let store = open_tmp();
        store.get_queue("a").unwrap();
        store.get_queue("b").unwrap();

        let mut names = store.queue_names().unwrap();
        names.sort();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
    }
}
