//! Coordinator (component L): the single owner of the Store, reservation
//! registry, and heartbeat registry, and the outward contract of the core.
//!
//! Per the Design Notes ("re-architect as a Coordinator object owned by
//! the application root, passed explicitly to the protocol engine and
//! collaborators"), this replaces the source's global singleton store: a
//! `Coordinator` is built once in `main`, handed to the protocol engine
//! (`crate::server`) as an `Arc`, and to external collaborators (an admin
//! UI, were one part of this crate) as read access to its registries.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::RngCore;
use sha2::{Digest, Sha256};
use tokio::time::Instant as TokioInstant;
use tokio_util::sync::CancellationToken;

use crate::error::{CommandError, StoreError};
use crate::heartbeat::{HeartbeatRegistry, WorkerState};
use crate::job::{validate_push, Job};
use crate::reservation::{Reservation, ReservationRegistry};
use crate::retry::{apply_failure, Disposition, FailureReport};
use crate::store::Store;
use crate::time::{format_ts, now_utc};
use crate::wire::protocol::{
    FailArgs, FaktoryInfo, HelloArgs, HiGreeting, InfoResponse, Response, ServerInfo, TaskCounts,
};

/// Hash iterations applied to `nonce || password` on `HELLO`. A small
/// fixed count is enough to demonstrate the mechanism without making
/// every connection's handshake noticeably slower.
const HASH_ITERATIONS: u32 = 5;

/// Per-connection state the protocol engine (`crate::server`) threads
/// through dispatch. `nonce` is generated fresh per connection for the
/// `HI` greeting; `wid` is assigned on `HELLO` (from the client, or a
/// generated one for connections that never supply it).
pub struct Session {
    pub identified: bool,
    pub wid: String,
    nonce: String,
}

impl Session {
    pub fn new() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        Session { identified: false, wid: String::new(), nonce: hex::encode(bytes) }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
struct Stats {
    total_enqueued: AtomicU64,
    total_processed: AtomicU64,
    total_failures: AtomicU64,
    connections: AtomicU64,
    command_count: AtomicU64,
}

pub struct Coordinator {
    store: Arc<Store>,
    reservations: ReservationRegistry,
    heartbeats: HeartbeatRegistry,
    password: Option<String>,
    /// Floor applied to a job's `reserve_for` when computing a
    /// reservation's lease. Defaults to 60s; operators can raise it via
    /// a CLI flag but never below the job's own floor.
    reserve_for_floor: u32,
    started_at: DateTime<Utc>,
    stats: Stats,
    pub cancel: CancellationToken,
}

impl Coordinator {
    /// Opens the store at `data_dir` and returns a freshly booted
    /// coordinator. `password` is the shared secret loaded from the
    /// config directory's `password` file, if any.
    pub fn boot(
        data_dir: impl AsRef<Path>,
        password: Option<String>,
        reserve_for_floor: u32,
    ) -> Result<Arc<Coordinator>, StoreError> {
        let store = Arc::new(Store::open(data_dir)?);
        Ok(Arc::new(Coordinator {
            store,
            reservations: ReservationRegistry::new(),
            heartbeats: HeartbeatRegistry::new(),
            password,
            reserve_for_floor,
            started_at: now_utc(),
            stats: Stats::default(),
            cancel: CancellationToken::new(),
        }))
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn reservations(&self) -> &ReservationRegistry {
        &self.reservations
    }

    pub fn heartbeats(&self) -> &HeartbeatRegistry {
        &self.heartbeats
    }

    pub fn connection_opened(&self) {
        self.stats.connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.stats.connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_command(&self) {
        self.stats.command_count.fetch_add(1, Ordering::Relaxed);
    }

    /// The `HI` greeting sent unprompted when a connection opens (spec
    /// §4.G): `{"v":2,"s":"<nonce>","i":<iterations>}`.
    pub fn greeting(&self, session: &Session) -> HiGreeting {
        HiGreeting { v: 2, s: session.nonce.clone(), i: HASH_ITERATIONS }
    }

    /// `HELLO`: authenticates (if a password is configured) and moves the
    /// connection from `NEW` to `IDENTIFIED`.
    pub fn hello(&self, session: &mut Session, args: HelloArgs) -> Result<Response, CommandError> {
        if let Some(password) = &self.password {
            let provided = args
                .pwdhash
                .as_deref()
                .ok_or_else(|| CommandError::Auth("Invalid password".to_string()))?;
            let expected = compute_pwdhash(password, &session.nonce, HASH_ITERATIONS);
            if provided != expected {
                return Err(CommandError::Auth("Invalid password".to_string()));
            }
        }

        session.identified = true;
        session.wid = args.wid.clone().unwrap_or_else(crate::time::random_jid);

        if let (Some(hostname), Some(pid)) = (args.hostname.as_deref(), args.pid) {
            self.heartbeats.register(&session.wid, hostname, pid, args.labels.clone());
        }

        Ok(Response::ok())
    }

    /// `PUSH`: validates and admits a job, either directly to its queue or
    /// to the scheduled set if `at` is in the future. Durable (flushed)
    /// before returning `+OK`.
    pub fn push(&self, mut job: Job) -> Result<Response, CommandError> {
        validate_push(&job).map_err(|e| CommandError::client("ERR", e.to_string()))?;

        let now = now_utc();
        if let Some(at) = job.at {
            if at > now {
                let ts = format_ts(at);
                let payload = job.encode()?;
                self.store.scheduled().add(&ts, &job.jid, &payload)?;
                self.store.flush()?;
                self.stats.total_enqueued.fetch_add(1, Ordering::Relaxed);
                return Ok(Response::ok());
            }
        }

        job.enqueued_at = Some(now);
        let payload = job.encode()?;
        let queue = self.store.get_queue(&job.queue)?;
        queue.push(&payload)?;
        self.store.flush()?;
        self.stats.total_enqueued.fetch_add(1, Ordering::Relaxed);
        Ok(Response::ok())
    }

    /// `FETCH`: reserves the next job from the first non-empty queue,
    /// scanned left to right in strict priority order (not round-robin),
    /// blocking up to ~2s if every named queue is currently empty. Returns
    /// a null bulk reply on timeout.
    pub async fn fetch(
        &self,
        session: &Session,
        queue_names: Vec<String>,
    ) -> Result<Response, CommandError> {
        if queue_names.is_empty() {
            return Err(CommandError::client("ERR", "FETCH requires at least one queue"));
        }

        let deadline = TokioInstant::now() + std::time::Duration::from_secs(2);

        loop {
            let queues: Vec<_> = queue_names
                .iter()
                .map(|n| self.store.get_queue(n))
                .collect::<Result<_, _>>()?;

            // Register as a waiter on every candidate queue's notifier
            // *before* checking whether any of them are non-empty: tokio's
            // `Notify::notified()` guarantees a `notify_waiters()` call
            // between this point and the eventual `.await` below is not
            // missed, which a check-then-subscribe ordering would race.
            let notify_handles: Vec<_> = queues.iter().map(|q| q.notify()).collect();
            let waiters: Vec<Pin<Box<dyn Future<Output = ()> + Send + '_>>> =
                notify_handles.iter().map(|n| Box::pin(n.notified()) as _).collect();

            for (name, queue) in queue_names.iter().zip(queues.iter()) {
                if let Some(bytes) = queue.pop()? {
                    self.store.flush()?;
                    let job = Job::decode(&bytes)?;
                    let lease_secs = job.reserve_for_secs().max(self.reserve_for_floor);
                    let expires_at = now_utc() + chrono::Duration::seconds(lease_secs as i64);
                    self.reservations.insert(&session.wid, name, expires_at, job);
                    return Ok(Response::bulk(bytes));
                }
            }

            let now = TokioInstant::now();
            if now >= deadline {
                return Ok(Response::null_bulk());
            }
            let remaining = deadline - now;

            tokio::select! {
                _ = futures::future::select_all(waiters) => continue,
                _ = tokio::time::sleep(remaining) => return Ok(Response::null_bulk()),
            }
        }
    }

    /// `ACK`: removes the reservation iff owned by the acking worker.
    pub fn ack(&self, session: &Session, jid: &str) -> Result<Response, CommandError> {
        match self.reservations.remove_owned(jid, &session.wid) {
            Some(_) => {
                self.stats.total_processed.fetch_add(1, Ordering::Relaxed);
                Ok(Response::ok())
            },
            None => Err(CommandError::client("ERR", "Unknown job")),
        }
    }

    /// `FAIL`: removes the reservation and forwards to the retry policy.
    pub fn fail(&self, session: &Session, args: FailArgs) -> Result<Response, CommandError> {
        let reservation = self
            .reservations
            .remove_owned(&args.jid, &session.wid)
            .ok_or_else(|| CommandError::client("ERR", "Unknown job"))?;

        self.apply_disposition(
            reservation.job,
            FailureReport {
                error_class: &args.errtype,
                error_message: &args.message,
                backtrace: args.backtrace,
            },
        )?;
        self.stats.total_failures.fetch_add(1, Ordering::Relaxed);
        Ok(Response::ok())
    }

    /// Applies the retry policy to a reclaimed/failed job and deposits it
    /// into the retries or dead set. Shared by [`Coordinator::fail`] and
    /// the reservation-reclaim scheduler, which treats a lease expiry as a
    /// synthetic failure with its own errtype, never surfaced back to the
    /// worker that held the expired reservation.
    pub(crate) fn apply_disposition(
        &self,
        mut job: Job,
        report: FailureReport<'_>,
    ) -> Result<(), StoreError> {
        match apply_failure(&mut job, report) {
            Disposition::Retry { next_at } => {
                let ts = format_ts(next_at);
                let payload = job.encode()?;
                self.store.retries().add(&ts, &job.jid, &payload)?;
            },
            Disposition::Dead => {
                let ts = format_ts(now_utc());
                let payload = job.encode()?;
                self.store.dead().add(&ts, &job.jid, &payload)?;
            },
        }
        self.store.flush()?;
        Ok(())
    }

    /// Treats a reclaimed reservation (expired lease, or a dead worker's
    /// outstanding work) as a failure with a synthetic error class.
    pub fn reclaim_as_failure(&self, reservation: Reservation, error_class: &str) -> Result<(), StoreError> {
        self.apply_disposition(
            reservation.job,
            FailureReport {
                error_class,
                error_message: "reservation lease expired before ack or fail",
                backtrace: None,
            },
        )?;
        self.stats.total_failures.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// `BEAT`: records liveness and returns the worker's desired state.
    /// Auto-registers a minimal session if `wid` was never seen via
    /// `HELLO` (spec's lifecycle table credits the heartbeat's creation to
    /// "first BEAT command").
    pub fn beat(&self, wid: &str) -> Result<Response, CommandError> {
        let state = match self.heartbeats.beat(wid) {
            Some(state) => state,
            None => {
                self.heartbeats.register(wid, "", 0, Vec::new());
                self.heartbeats.beat(wid).expect("just registered")
            },
        };

        Ok(match state {
            WorkerState::Running => Response::ok(),
            WorkerState::Quiet => Response::simple(r#"{"state":"quiet"}"#),
            WorkerState::Terminate => Response::simple(r#"{"state":"terminate"}"#),
        })
    }

    /// `INFO`: server/queue/set statistics.
    pub fn info(&self) -> Result<Response, CommandError> {
        let mut queues = BTreeMap::new();
        for name in self.store.queue_names()? {
            let size = self.store.get_queue(&name)?.size()?;
            queues.insert(name, size);
        }

        let body = InfoResponse {
            faktory: FaktoryInfo {
                total_enqueued: self.stats.total_enqueued.load(Ordering::Relaxed),
                total_processed: self.stats.total_processed.load(Ordering::Relaxed),
                total_failures: self.stats.total_failures.load(Ordering::Relaxed),
                total_reserved: self.reservations.len() as u64,
                queues,
                tasks: TaskCounts {
                    scheduled: self.store.scheduled().size()?,
                    retries: self.store.retries().size()?,
                    dead: self.store.dead().size()?,
                },
            },
            server: ServerInfo {
                description: "faktory-rs",
                faktory_version: env!("CARGO_PKG_VERSION"),
                uptime: (now_utc() - self.started_at).num_seconds(),
                connections: self.stats.connections.load(Ordering::Relaxed),
                command_count: self.stats.command_count.load(Ordering::Relaxed),
            },
        };

        let bytes = serde_json::to_vec(&body)?;
        Ok(Response::bulk(bytes))
    }

    /// `FLUSH`: a debugging aid that clears all queues and sorted sets and
    /// drops outstanding reservations. Worker heartbeat sessions are left
    /// intact since they track live connections, not job data.
    pub fn flush(&self) -> Result<Response, CommandError> {
        for name in self.store.queue_names()? {
            self.store.get_queue(&name)?.clear()?;
        }

        let far_future = format_ts(now_utc() + chrono::Duration::days(365 * 200));
        self.store.scheduled().remove_before(&far_future)?;
        self.store.retries().remove_before(&far_future)?;
        self.store.dead().remove_before(&far_future)?;

        self.reservations.clear();
        self.store.flush()?;
        Ok(Response::ok())
    }

    /// Stops accepting new work, flushes, and closes the store. Called
    /// once the acceptor has stopped and in-flight connections have
    /// drained.
    pub async fn stop(&self) -> Result<(), StoreError> {
        self.cancel.cancel();
        self.store.close()
    }
}

/// `SHA256(nonce || password)`, hashed `iterations` times total (spec
/// §4.G).
fn compute_pwdhash(password: &str, nonce: &str, iterations: u32) -> String {
    let mut hash = Sha256::digest(format!("{nonce}{password}").as_bytes()).to_vec();
    for _ in 1..iterations {
        hash = Sha256::digest(&hash).to_vec();
    }
    hex::encode(hash)
}
