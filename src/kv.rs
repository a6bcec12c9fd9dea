//! Ordered KV backend (component B), implemented over `sled`: a single
//! tree of byte keys to byte values, with lazy, restartable scans whose
//! lifetime is bounded by a read snapshot rather than a collect-everything
//! callback.

use std::ops::Bound;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::error::KvError;

/// A single mutation within an [`Kv::atomic_batch`] call.
#[derive(Debug, Clone)]
pub enum KvOp {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

impl KvOp {
    pub fn put(k: impl Into<Vec<u8>>, v: impl Into<Vec<u8>>) -> Self {
        KvOp::Put(k.into(), v.into())
    }

    pub fn delete(k: impl Into<Vec<u8>>) -> Self {
        KvOp::Delete(k.into())
    }
}

/// The ordered KV backend. Single-writer: `put`/`get`/`delete`/`atomic_batch`
/// are each individually atomic via `sled`, but a compound sequence (read a
/// cursor, then write based on it) is not atomic unless the caller holds
/// [`Kv::lock_writer`] across the whole sequence. The Store facade's queues
/// and sorted sets do exactly that for every operation that reads-then-writes
/// (push, pop, clear, add, remove, remove_before, move_to, promote_due),
/// satisfying spec §5's "all store-mutating operations serialize through a
/// single writer."
pub struct Kv {
    db: sled::Db,
    closed: AtomicBool,
    writer: Mutex<()>,
}

impl Kv {
    /// Opens (or creates) the KV backend at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, KvError> {
        let db = sled::open(path)?;
        Ok(Kv { db, closed: AtomicBool::new(false), writer: Mutex::new(()) })
    }

    fn check_open(&self) -> Result<(), KvError> {
        if self.closed.load(Ordering::Acquire) {
            Err(KvError::Closed)
        } else {
            Ok(())
        }
    }

    /// Acquires the single-writer lock for the duration of a compound
    /// read-then-write sequence (spec §5). Callers hold the returned guard
    /// across the whole sequence, not just the final `atomic_batch` call,
    /// so two concurrent callers can never observe and act on the same
    /// stale cursor/size read.
    pub fn lock_writer(&self) -> MutexGuard<'_, ()> {
        self.writer.lock().expect("kv writer mutex poisoned")
    }

    pub fn put(&self, k: &[u8], v: &[u8]) -> Result<(), KvError> {
        self.check_open()?;
        self.db.insert(k, v)?;
        Ok(())
    }

    pub fn get(&self, k: &[u8]) -> Result<Option<Vec<u8>>, KvError> {
        self.check_open()?;
        Ok(self.db.get(k)?.map(|v| v.to_vec()))
    }

    pub fn delete(&self, k: &[u8]) -> Result<(), KvError> {
        self.check_open()?;
        self.db.remove(k)?;
        Ok(())
    }

    /// Lazily iterates all `(key, value)` pairs whose key starts with
    /// `prefix`, in lexicographic key order, over a read snapshot. The
    /// caller may stop consuming the iterator at any time without
    /// completing the scan.
    pub fn scan(
        &self,
        prefix: &[u8],
    ) -> impl Iterator<Item = Result<(Vec<u8>, Vec<u8>), KvError>> + '_ {
        self.db.scan_prefix(prefix).map(|r| {
            r.map(|(k, v)| (k.to_vec(), v.to_vec())).map_err(KvError::from)
        })
    }

    /// Atomically deletes every key in `[prefix, upper_bound_inclusive]`.
    /// Returns the number of keys removed. The deleted entries are not
    /// returned here; callers that need the payloads should `scan` first
    /// within the same logical operation (see [`crate::store::sortedset`]).
    pub fn range_delete(
        &self,
        prefix: &[u8],
        upper_bound_inclusive: &[u8],
    ) -> Result<u64, KvError> {
        self.check_open()?;

        let keys: Vec<sled::IVec> = self
            .db
            .range((
                Bound::Included(prefix.to_vec()),
                Bound::Included(upper_bound_inclusive.to_vec()),
            ))
            .keys()
            .collect::<Result<_, _>>()?;

        let mut batch = sled::Batch::default();
        for k in &keys {
            batch.remove(k.clone());
        }
        self.db.apply_batch(batch)?;

        Ok(keys.len() as u64)
    }

    /// Applies a list of puts/deletes as a single all-or-nothing batch,
    /// visible atomically to subsequent reads.
    pub fn atomic_batch(&self, ops: Vec<KvOp>) -> Result<(), KvError> {
        self.check_open()?;

        let mut batch = sled::Batch::default();
        for op in ops {
            match op {
                KvOp::Put(k, v) => batch.insert(k, v),
                KvOp::Delete(k) => batch.remove(k),
            }
        }
        self.db.apply_batch(batch)?;
        Ok(())
    }

    /// Blocks until all prior writes are durable on disk.
    pub fn flush(&self) -> Result<(), KvError> {
        self.check_open()?;
        self.db.flush()?;
        Ok(())
    }

    /// Marks the backend closed; further operations return [`KvError::Closed`].
    pub fn close(&self) -> Result<(), KvError> {
        self.db.flush()?;
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_tmp() -> Kv {
        let dir = tempdir();
        Kv::open(dir).unwrap()
    }

    fn tempdir() -> std::path::PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("faktory-rs-kv-test-{}", crate::time::random_jid()));
        p
    }

    #[test]
    fn put_get_delete_round_trip() {
        let kv = open_tmp();
        kv.put(b"k1", b"v1").unwrap();
        assert_eq!(kv.get(b"k1").unwrap(), Some(b"v1".to_vec()));
        kv.delete(b"k1").unwrap();
        assert_eq!(kv.get(b"k1").unwrap(), None);
    }

    #[test]
    fn scan_yields_prefix_in_order() {
        let kv = open_tmp();
        kv.put(b"q|x|0001", b"a").unwrap();
        kv.put(b"q|x|0002", b"b").unwrap();
        kv.put(b"q|y|0001", b"c").unwrap();

        let got: Vec<_> = kv
            .scan(b"q|x|")
            .map(|r| r.unwrap())
            .map(|(_, v)| v)
            .collect();
        assert_eq!(got, vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[test]
    fn atomic_batch_is_all_or_nothing_visible() {
        let kv = open_tmp();
        kv.atomic_batch(vec![
            KvOp::put("a", "1"),
            KvOp::put("b", "2"),
        ])
        .unwrap();
        assert_eq!(kv.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(kv.get(b"b").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn range_delete_removes_bounded_keys() {
        let kv = open_tmp();
        kv.put(b"s|r|a", b"1").unwrap();
        kv.put(b"s|r|b", b"2").unwrap();
        kv.put(b"s|r|z", b"3").unwrap();

        let n = kv.range_delete(b"s|r|", b"s|r|b").unwrap();
        assert_eq!(n, 2);
        assert_eq!(kv.get(b"s|r|a").unwrap(), None);
        assert_eq!(kv.get(b"s|r|b").unwrap(), None);
        assert_eq!(kv.get(b"s|r|z").unwrap(), Some(b"3".to_vec()));
    }

    #[test]
    fn closed_backend_rejects_operations() {
        let kv = open_tmp();
        kv.close().unwrap();
        assert!(matches!(kv.get(b"a"), Err(KvError::Closed)));
        assert!(matches!(kv.put(b"a", b"1"), Err(KvError::Closed)));
    }
}
