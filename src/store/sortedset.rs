//! Sorted set (component D): a time-indexed set over the KV backend, used
//! for the `scheduled`, `retries`, and `dead` built-in sets.

use std::sync::Arc;

use crate::error::{KvError, StoreError};
use crate::kv::{Kv, KvOp};

/// `s|<setname>|<TIMESTAMP>|<JID>` holds an encoded job; size lives at
/// `m|s|<setname>|size` as a big-endian `u64`.
///
/// The `TIMESTAMP|JID` key format is a contract: admin collaborators
/// construct these keys directly when issuing retry/kill/delete actions,
/// so it must stay exactly `YYYY-MM-DDTHH:MM:SS.nnnnnnnnnZ|<jid>`.
pub struct SortedSet {
    kv: Arc<Kv>,
    name: String,
}

pub(crate) fn size_key(name: &str) -> Vec<u8> {
    format!("m|s|{name}|size").into_bytes()
}

fn prefix(name: &str) -> Vec<u8> {
    format!("s|{name}|").into_bytes()
}

pub(crate) fn entry_key(name: &str, ts: &str, jid: &str) -> Vec<u8> {
    format!("s|{name}|{ts}|{jid}").into_bytes()
}

/// Upper bound used by `remove_before`: `~` (0x7E) sorts after every
/// expected jid character, so `prefix|ts|~` is inclusive of every entry
/// at exactly `ts` regardless of jid.
pub(crate) fn cutoff_key(name: &str, ts: &str) -> Vec<u8> {
    format!("s|{name}|{ts}|~").into_bytes()
}

fn read_size(kv: &Kv, name: &str) -> Result<u64, KvError> {
    Ok(kv
        .get(&size_key(name))?
        .map(|v| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&v[..8]);
            u64::from_be_bytes(buf)
        })
        .unwrap_or(0))
}

impl SortedSet {
    pub(crate) fn new(kv: Arc<Kv>, name: impl Into<String>) -> Self {
        SortedSet { kv, name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> Result<u64, KvError> {
        read_size(&self.kv, &self.name)
    }

    /// Inserts `payload` keyed by `(timestamp_str, jid)`.
    ///
    /// Holds the KV's single-writer lock across the read-size-then-write
    /// sequence: without it, two concurrent adders could read the same
    /// size and the second write would leave `size()` one short.
    pub fn add(&self, timestamp_str: &str, jid: &str, payload: &[u8]) -> Result<(), KvError> {
        let _writer = self.kv.lock_writer();

        let size = self.size()?;
        self.kv.atomic_batch(vec![
            KvOp::put(entry_key(&self.name, timestamp_str, jid), payload.to_vec()),
            KvOp::put(size_key(&self.name), (size + 1).to_be_bytes().to_vec()),
        ])
    }

    /// Non-consuming iteration in `(timestamp, jid)` order, yielding the
    /// full key alongside the payload so admin callers can pass it back to
    /// [`SortedSet::remove`].
    pub fn each(&self) -> impl Iterator<Item = Result<(Vec<u8>, Vec<u8>), KvError>> + '_ {
        self.kv.scan(&prefix(&self.name))
    }

    /// As [`SortedSet::each`], skipping `offset` entries and yielding at
    /// most `count`.
    pub fn page(
        &self,
        offset: usize,
        count: usize,
    ) -> impl Iterator<Item = Result<(Vec<u8>, Vec<u8>), KvError>> + '_ {
        self.each().skip(offset).take(count)
    }

    /// Removes a single entry by its full key (as yielded by `each`/`page`).
    ///
    /// Holds the KV's single-writer lock across the read-size-then-write
    /// sequence, for the same reason as [`SortedSet::add`].
    pub fn remove(&self, key: &[u8]) -> Result<(), KvError> {
        let _writer = self.kv.lock_writer();

        let size = self.size()?;
        self.kv.atomic_batch(vec![
            KvOp::delete(key.to_vec()),
            KvOp::put(size_key(&self.name), size.saturating_sub(1).to_be_bytes().to_vec()),
        ])
    }

    /// Atomically extracts and deletes every entry whose key is
    /// `<= <setname>|<cutoff>|~`, returning the removed payloads in key
    /// order. `size()` decreases by exactly the count returned.
    ///
    /// Holds the KV's single-writer lock across the whole scan-then-write
    /// sequence: without it, a concurrent `add`/`remove` could land between
    /// the scan and the final batch, corrupting the returned set or the
    /// size bookkeeping.
    pub fn remove_before(&self, cutoff: &str) -> Result<Vec<Vec<u8>>, KvError> {
        let _writer = self.kv.lock_writer();

        let upper = cutoff_key(&self.name, cutoff);
        let due: Vec<(Vec<u8>, Vec<u8>)> = self
            .each()
            .take_while(|r| match r {
                Ok((k, _)) => k.as_slice() <= upper.as_slice(),
                Err(_) => true,
            })
            .collect::<Result<_, _>>()?;

        if due.is_empty() {
            return Ok(Vec::new());
        }

        let size = self.size()?;
        let mut ops: Vec<KvOp> = due.iter().map(|(k, _)| KvOp::delete(k.clone())).collect();
        ops.push(KvOp::put(
            size_key(&self.name),
            size.saturating_sub(due.len() as u64).to_be_bytes().to_vec(),
        ));
        self.kv.atomic_batch(ops)?;

        Ok(due.into_iter().map(|(_, v)| v).collect())
    }

    /// Atomically moves the entry at `(timestamp_str, jid)` from this set
    /// into `target`, letting `transform` rewrite the timestamp and
    /// payload in the same batch. Errors if the source key is absent.
    ///
    /// `self` and `target` always share the same underlying [`Kv`] (the
    /// Store facade's three built-in sets are all opened over one backend),
    /// so locking `self.kv`'s writer also covers `target`. Held across the
    /// whole get-then-write sequence for the same reason as the other
    /// mutating operations here.
    pub fn move_to(
        &self,
        target: &SortedSet,
        timestamp_str: &str,
        jid: &str,
        transform: impl FnOnce(Vec<u8>) -> (String, Vec<u8>),
    ) -> Result<(), StoreError> {
        let _writer = self.kv.lock_writer();

        let source_key = entry_key(&self.name, timestamp_str, jid);
        let payload = self
            .kv
            .get(&source_key)?
            .ok_or(StoreError::MoveToSourceMissing)?;

        let (new_ts, new_payload) = transform(payload);
        let target_key = entry_key(&target.name, &new_ts, jid);

        let source_size = self.size()?;
        let target_size = target.size()?;

        self.kv.atomic_batch(vec![
            KvOp::delete(source_key),
            KvOp::put(size_key(&self.name), source_size.saturating_sub(1).to_be_bytes().to_vec()),
            KvOp::put(target_key, new_payload),
            KvOp::put(size_key(&target.name), (target_size + 1).to_be_bytes().to_vec()),
        ])?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_tmp() -> Arc<Kv> {
        let mut p = std::env::temp_dir();
        p.push(format!("faktory-rs-sortedset-test-{}", crate::time::random_jid()));
        Arc::new(Kv::open(p).unwrap())
    }

    fn set(kv: &Arc<Kv>, name: &str) -> SortedSet {
        SortedSet::new(Arc::clone(kv), name)
    }

    #[test]
    fn orders_by_timestamp_then_jid() {
        let kv = open_tmp();
        let s = set(&kv, "retries");

        s.add("2026-01-01T00:00:00.000000001Z", "b", b"2").unwrap();
        s.add("2026-01-01T00:00:00.000000001Z", "a", b"1").unwrap();
        s.add("2026-01-01T00:00:00.000000000Z", "z", b"0").unwrap();

        let payloads: Vec<_> = s.each().map(|r| r.unwrap().1).collect();
        assert_eq!(payloads, vec![b"0".to_vec(), b"1".to_vec(), b"2".to_vec()]);
    }

    #[test]
    fn remove_before_is_atomic_and_inclusive_of_cutoff() {
        let kv = open_tmp();
        let s = set(&kv, "retries");

        s.add("2026-01-01T00:00:00.000000000Z", "a", b"a").unwrap();
        s.add("2026-01-01T00:00:01.000000000Z", "b", b"b").unwrap();
        s.add("2026-01-01T00:00:02.000000000Z", "c", b"c").unwrap();

        let removed = s.remove_before("2026-01-01T00:00:01.000000000Z").unwrap();
        assert_eq!(removed, vec![b"a".to_vec(), b"b".to_vec()]);
        assert_eq!(s.size().unwrap(), 1);
    }

    #[test]
    fn move_to_preserves_total_count_and_errors_on_missing_source() {
        let kv = open_tmp();
        let retries = set(&kv, "retries");
        let dead = set(&kv, "dead");

        retries.add("2026-01-01T00:00:00.000000000Z", "jid1", b"payload").unwrap();

        retries
            .move_to(&dead, "2026-01-01T00:00:00.000000000Z", "jid1", |p| {
                ("2026-01-02T00:00:00.000000000Z".to_string(), p)
            })
            .unwrap();

        assert_eq!(retries.size().unwrap(), 0);
        assert_eq!(dead.size().unwrap(), 1);

        let err = retries.move_to(&dead, "2026-01-01T00:00:00.000000000Z", "jid1", |p| {
            ("x".to_string(), p)
        });
        assert!(matches!(err, Err(StoreError::MoveToSourceMissing)));
    }
}
