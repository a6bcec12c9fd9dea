//! Heartbeat registry (component K): worker session liveness, quiet/
//! terminate signaling.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::time::now_utc;

/// A worker's liveness window; absent past this is considered dead.
pub const DEAD_AFTER: chrono::Duration = chrono::Duration::seconds(60);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Running,
    Quiet,
    Terminate,
}

#[derive(Clone, Debug, Serialize)]
pub struct Worker {
    pub wid: String,
    pub hostname: String,
    pub pid: u32,
    pub labels: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    pub state: WorkerState,
}

/// `wid -> Worker`, single-mutex guarded.
#[derive(Default)]
pub struct HeartbeatRegistry {
    workers: Mutex<HashMap<String, Worker>>,
}

impl HeartbeatRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or re-registers) a worker session on its first `HELLO`.
    pub fn register(&self, wid: &str, hostname: &str, pid: u32, labels: Vec<String>) {
        let now = now_utc();
        let mut workers = self.workers.lock().expect("heartbeat mutex poisoned");
        workers.insert(
            wid.to_string(),
            Worker {
                wid: wid.to_string(),
                hostname: hostname.to_string(),
                pid,
                labels,
                started_at: now,
                last_heartbeat_at: now,
                state: WorkerState::Running,
            },
        );
    }

    /// Records a `BEAT`, returning the worker's current state so the
    /// caller can relay `quiet`/`terminate` back to the worker. Returns
    /// `None` if the worker was never registered (the caller should treat
    /// this like a fresh `HELLO` is required).
    pub fn beat(&self, wid: &str) -> Option<WorkerState> {
        let mut workers = self.workers.lock().expect("heartbeat mutex poisoned");
        let w = workers.get_mut(wid)?;
        w.last_heartbeat_at = now_utc();
        Some(w.state)
    }

    /// Sets a worker's desired state (external collaborators: admin UI).
    pub fn set_state(&self, wid: &str, state: WorkerState) -> bool {
        let mut workers = self.workers.lock().expect("heartbeat mutex poisoned");
        match workers.get_mut(wid) {
            Some(w) => {
                w.state = state;
                true
            },
            None => false,
        }
    }

    pub fn remove(&self, wid: &str) -> Option<Worker> {
        self.workers.lock().expect("heartbeat mutex poisoned").remove(wid)
    }

    /// Workers whose last heartbeat is older than [`DEAD_AFTER`]; the
    /// caller (component J's reclaim pass) should reclaim their
    /// reservations and drop them from the registry.
    pub fn dead_workers(&self, now: DateTime<Utc>) -> Vec<String> {
        self.workers
            .lock()
            .expect("heartbeat mutex poisoned")
            .values()
            .filter(|w| now - w.last_heartbeat_at > DEAD_AFTER)
            .map(|w| w.wid.clone())
            .collect()
    }

    pub fn all(&self) -> Vec<Worker> {
        self.workers.lock().expect("heartbeat mutex poisoned").values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.workers.lock().expect("heartbeat mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn beat_reports_current_state_and_updates_liveness() {
        let reg = HeartbeatRegistry::new();
        reg.register("w1", "host", 123, vec![]);

        assert_eq!(reg.beat("w1"), Some(WorkerState::Running));

        reg.set_state("w1", WorkerState::Quiet);
        assert_eq!(reg.beat("w1"), Some(WorkerState::Quiet));
    }

    #[test]
    fn unknown_worker_beat_returns_none() {
        let reg = HeartbeatRegistry::new();
        assert_eq!(reg.beat("ghost"), None);
    }

    #[test]
    fn dead_workers_are_those_past_the_window() {
        let reg = HeartbeatRegistry::new();
        reg.register("w1", "host", 1, vec![]);

        let now = now_utc();
        let later = now + DEAD_AFTER + chrono::Duration::seconds(1);
        assert!(reg.dead_workers(later).contains(&"w1".to_string()));
        assert!(reg.dead_workers(now).is_empty());
    }
}
