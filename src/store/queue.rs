//! FIFO queue (component C): a named append/pop queue over the KV backend.

use std::sync::Arc;

use tokio::sync::Notify;

use crate::error::KvError;
use crate::kv::{Kv, KvOp};

/// `q|<queuename>|<seq>` holds an encoded job; cursors live at
/// `m|q|<queuename>|head` / `...|tail` as big-endian `u64`.
pub struct Queue {
    kv: Arc<Kv>,
    name: String,
    /// Woken on every successful push so blocked `FETCH`s don't spin.
    notify: Arc<Notify>,
}

fn head_key(name: &str) -> Vec<u8> {
    format!("m|q|{name}|head").into_bytes()
}

pub(crate) fn tail_key(name: &str) -> Vec<u8> {
    format!("m|q|{name}|tail").into_bytes()
}

pub(crate) fn job_key(name: &str, seq: u64) -> Vec<u8> {
    let mut k = format!("q|{name}|").into_bytes();
    k.extend_from_slice(&seq.to_be_bytes());
    k
}

fn prefix(name: &str) -> Vec<u8> {
    format!("q|{name}|").into_bytes()
}

fn read_cursor(kv: &Kv, key: &[u8]) -> Result<u64, KvError> {
    Ok(kv
        .get(key)?
        .map(|v| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&v[..8]);
            u64::from_be_bytes(buf)
        })
        .unwrap_or(0))
}

impl Queue {
    pub(crate) fn new(kv: Arc<Kv>, name: String, notify: Arc<Notify>) -> Self {
        Queue { kv, name, notify }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Appends `job_bytes` at the tail. Durable once this returns `Ok`.
    ///
    /// Holds the KV's single-writer lock across the read-tail-then-write
    /// sequence: without it, two concurrent pushers could read the same
    /// `tail`, and the second `atomic_batch` would silently overwrite the
    /// first job and undercount `size()`.
    pub fn push(&self, job_bytes: &[u8]) -> Result<(), KvError> {
        let _writer = self.kv.lock_writer();

        let tail = read_cursor(&self.kv, &tail_key(&self.name))?;
        self.kv.atomic_batch(vec![
            KvOp::put(job_key(&self.name, tail), job_bytes.to_vec()),
            KvOp::put(tail_key(&self.name), (tail + 1).to_be_bytes().to_vec()),
        ])?;

        drop(_writer);
        self.notify.notify_waiters();
        Ok(())
    }

    /// Removes and returns the job at the head, or `None` if drained.
    /// Tolerant of a torn cursor (head key present, payload absent) left
    /// by a prior crash mid-advance: skips forward rather than panicking.
    ///
    /// Holds the KV's single-writer lock for the whole read-head-then-write
    /// sequence (including any torn-cursor retries): without it, two
    /// concurrent poppers could both read the same `head`, both see the
    /// same payload, and both return it to different workers.
    pub fn pop(&self) -> Result<Option<Vec<u8>>, KvError> {
        let _writer = self.kv.lock_writer();

        loop {
            let head = read_cursor(&self.kv, &head_key(&self.name))?;
            let tail = read_cursor(&self.kv, &tail_key(&self.name))?;
            if head >= tail {
                return Ok(None);
            }

            let k = job_key(&self.name, head);
            match self.kv.get(&k)? {
                Some(v) => {
                    self.kv.atomic_batch(vec![
                        KvOp::delete(k),
                        KvOp::put(head_key(&self.name), (head + 1).to_be_bytes().to_vec()),
                    ])?;
                    return Ok(Some(v));
                },
                None => {
                    self.kv.atomic_batch(vec![KvOp::put(
                        head_key(&self.name),
                        (head + 1).to_be_bytes().to_vec(),
                    )])?;
                    continue;
                },
            }
        }
    }

    /// Range-deletes every entry and resets cursors; returns the count
    /// removed.
    pub fn clear(&self) -> Result<u64, KvError> {
        let _writer = self.kv.lock_writer();

        let head = read_cursor(&self.kv, &head_key(&self.name))?;
        let tail = read_cursor(&self.kv, &tail_key(&self.name))?;
        let removed = tail.saturating_sub(head);

        let prefix = prefix(&self.name);
        let upper = job_key(&self.name, u64::MAX);
        self.kv.range_delete(&prefix, &upper)?;
        self.kv.atomic_batch(vec![
            KvOp::put(head_key(&self.name), 0u64.to_be_bytes().to_vec()),
            KvOp::put(tail_key(&self.name), 0u64.to_be_bytes().to_vec()),
        ])?;

        Ok(removed)
    }

    /// O(1) size from the cached cursors.
    pub fn size(&self) -> Result<u64, KvError> {
        let head = read_cursor(&self.kv, &head_key(&self.name))?;
        let tail = read_cursor(&self.kv, &tail_key(&self.name))?;
        Ok(tail.saturating_sub(head))
    }

    /// Non-consuming iteration in FIFO order, over a read snapshot.
    pub fn each(&self) -> impl Iterator<Item = Result<Vec<u8>, KvError>> + '_ {
        self.kv.scan(&prefix(&self.name)).map(|r| r.map(|(_, v)| v))
    }

    pub(crate) fn notify(&self) -> Arc<Notify> {
        Arc::clone(&self.notify)
    }

    pub(crate) fn tail(&self) -> Result<u64, KvError> {
        read_cursor(&self.kv, &tail_key(&self.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_tmp() -> Arc<Kv> {
        let mut p = std::env::temp_dir();
        p.push(format!("faktory-rs-queue-test-{}", crate::time::random_jid()));
        Arc::new(Kv::open(p).unwrap())
    }

    fn queue(kv: &Arc<Kv>, name: &str) -> Queue {
        Queue::new(Arc::clone(kv), name.to_string(), Arc::new(Notify::new()))
    }

    #[test]
    fn fifo_order_is_preserved() {
        let kv = open_tmp();
        let q = queue(&kv, "default");

        q.push(b"one").unwrap();
        q.push(b"two").unwrap();
        q.push(b"three").unwrap();

        assert_eq!(q.size().unwrap(), 3);
        assert_eq!(q.pop().unwrap(), Some(b"one".to_vec()));
        assert_eq!(q.pop().unwrap(), Some(b"two".to_vec()));
        assert_eq!(q.size().unwrap(), 1);
        assert_eq!(q.pop().unwrap(), Some(b"three".to_vec()));
        assert_eq!(q.pop().unwrap(), None);
    }

    #[test]
    fn each_is_non_consuming_and_in_push_order() {
        let kv = open_tmp();
        let q = queue(&kv, "default");
        q.push(b"a").unwrap();
        q.push(b"b").unwrap();

        let seen: Vec<_> = q.each().map(|r| r.unwrap()).collect();
        assert_eq!(seen, vec![b"a".to_vec(), b"b".to_vec()]);
        assert_eq!(q.size().unwrap(), 2);
    }

    #[test]
    fn clear_removes_everything_and_reports_count() {
        let kv = open_tmp();
        let q = queue(&kv, "default");
        for _ in 0..1000 {
            q.push(b"x").unwrap();
        }

        assert_eq!(q.clear().unwrap(), 1000);
        assert_eq!(q.size().unwrap(), 0);
        assert_eq!(q.each().count(), 0);
    }
}
