//! Crate-wide error types.
//!
//! The KV/store layer uses `thiserror`-derived enums (broader surface than
//! the protocol codec's hand-rolled `Error`, which keeps the narrower
//! `From`-impl shape used in [`crate::wire::decoder`] and
//! [`crate::wire::encoder`]).

use thiserror::Error;

/// Errors from the ordered KV backend (component B).
///
/// All three kinds are fatal to the operation that raised them; per
/// spec §4.B the caller (the Store facade, then the coordinator) must
/// surface them rather than silently retry.
#[derive(Debug, Error)]
pub enum KvError {
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage corruption detected: {0}")]
    Corruption(String),

    #[error("storage backend is closed")]
    Closed,
}

impl From<sled::Error> for KvError {
    fn from(e: sled::Error) -> Self {
        match e {
            sled::Error::Io(io) => KvError::Io(io),
            sled::Error::Corruption { .. } => KvError::Corruption(e.to_string()),
            sled::Error::CollectionNotFound(_) => KvError::Corruption(e.to_string()),
            sled::Error::Unsupported(msg) => KvError::Corruption(msg),
            sled::Error::ReportableBug(msg) => KvError::Corruption(msg),
            other => KvError::Corruption(other.to_string()),
        }
    }
}

/// Errors raised by job validation (component F) on `PUSH`.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("jid must be present and at least 16 characters")]
    JidTooShort,
    #[error("jobtype must be non-empty")]
    EmptyJobType,
    #[error("args must be present")]
    MissingArgs,
    #[error("queue name invalid: {0}")]
    InvalidQueueName(String),
    #[error("queue name exceeds 128 bytes")]
    QueueNameTooLong,
    #[error("retry must be an integer")]
    InvalidRetry,
    #[error("at must be a valid UTC timestamp")]
    InvalidAt,
}

/// Errors surfaced by the Store facade (component E) to the coordinator.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Kv(#[from] KvError),

    #[error("no such key in sorted set: move_to source absent")]
    MoveToSourceMissing,

    #[error("stored job record is corrupt: {0}")]
    CorruptJob(#[from] serde_json::Error),
}

/// Errors raised while serving a single protocol command (component G/L).
/// Kept in the same narrow shape as [`crate::wire::codec::Error`] (an enum
/// with manual `From` impls) rather than deriving `thiserror`, mirroring
/// the teacher's own `wire::decoder::Error`/`wire::encoder::Error`.
#[derive(Debug)]
pub enum CommandError {
    /// Surfaced to the caller as `-ERR <detail>`; connection stays open.
    Client { kind: &'static str, message: String },
    /// `HELLO` with a wrong or missing password: respond `-ERR <detail>`,
    /// then close the connection (spec §7: "Auth... respond -ERR Invalid
    /// password, close").
    Auth(String),
    /// Fatal to the connection: storage fault, corruption, or I/O error.
    Fatal(StoreError),
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandError::Client { kind, message } => write!(f, "{kind} {message}"),
            CommandError::Auth(message) => write!(f, "auth: {message}"),
            CommandError::Fatal(e) => write!(f, "internal: {e}"),
        }
    }
}

impl std::error::Error for CommandError {}

impl From<StoreError> for CommandError {
    fn from(e: StoreError) -> Self {
        CommandError::Fatal(e)
    }
}

impl From<KvError> for CommandError {
    fn from(e: KvError) -> Self {
        CommandError::Fatal(StoreError::from(e))
    }
}

impl From<serde_json::Error> for CommandError {
    fn from(e: serde_json::Error) -> Self {
        CommandError::Fatal(StoreError::from(e))
    }
}

impl CommandError {
    pub fn client(kind: &'static str, message: impl Into<String>) -> Self {
        CommandError::Client { kind, message: message.into() }
    }
}
