//! Command/response vocabulary for the line protocol (component G), kept
//! in the teacher's shape — plain enums, doc comments naming the wire
//! form — but with the Faktory `VERB <json-arg>\r\n` grammar and
//! `+OK`/`$len`/`-KIND msg` framing from spec §4.G in place of
//! beanstalkd's per-verb textual replies.

use serde::{Deserialize, Serialize};

use crate::error::CommandError;
use crate::job::Job;

/// The client hello payload sent with `HELLO` (spec §4.G).
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct HelloArgs {
    pub v: u32,
    #[serde(default)]
    pub wid: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub pwdhash: Option<String>,
}

/// The `FAIL` payload.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct FailArgs {
    pub jid: String,
    pub errtype: String,
    pub message: String,
    #[serde(default)]
    pub backtrace: Option<Vec<String>>,
}

#[derive(Clone, Debug, Deserialize)]
struct JidArg {
    jid: String,
}

#[derive(Clone, Debug, Deserialize)]
struct WidArg {
    wid: String,
}

/// A command sent by the client to the server, already verb-dispatched
/// and argument-parsed.
#[derive(Clone, Debug)]
pub enum Command {
    /// `HELLO <json>` — identify this connection. Must be the first
    /// command on a new connection.
    Hello(HelloArgs),
    /// `PUSH <json job>` — admit a job to its queue (or a sorted set, if
    /// `at` is in the future).
    Push(Box<Job>),
    /// `FETCH <queue1> <queue2> ...` — reserve the next job from the
    /// first non-empty queue, scanned left to right (spec §9: fixed as
    /// strict priority, not round-robin).
    Fetch(Vec<String>),
    /// `ACK <json {jid}>` — the reserving worker completed the job.
    Ack { jid: String },
    /// `FAIL <json>` — the reserving worker failed the job.
    Fail(FailArgs),
    /// `BEAT <json {wid}>` — worker liveness ping.
    Beat { wid: String },
    /// `INFO` — server/queue/set statistics.
    Info,
    /// `FLUSH` — clears all state (debugging).
    Flush,
    /// `END` — close the connection.
    End,
}

impl Command {
    /// Parses a verb and its (possibly empty) argument text into a
    /// [`Command`]. Unknown verbs and malformed arguments are surfaced as
    /// [`CommandError::Client`], to be answered with `-ERR ...` while the
    /// connection stays open (spec §7's "Protocol parse" policy).
    pub fn parse(verb: &str, arg: &[u8]) -> Result<Command, CommandError> {
        fn json<T: for<'de> Deserialize<'de>>(arg: &[u8]) -> Result<T, CommandError> {
            serde_json::from_slice(arg)
                .map_err(|e| CommandError::client("ERR", format!("invalid argument: {e}")))
        }

        match verb.to_ascii_uppercase().as_str() {
            "HELLO" => Ok(Command::Hello(json(arg)?)),
            "PUSH" => Ok(Command::Push(Box::new(json(arg)?))),
            "FETCH" => {
                let queues: Vec<String> = std::str::from_utf8(arg)
                    .map_err(|_| CommandError::client("ERR", "invalid utf-8"))?
                    .split_ascii_whitespace()
                    .map(str::to_string)
                    .collect();
                Ok(Command::Fetch(queues))
            },
            "ACK" => Ok(Command::Ack { jid: json::<JidArg>(arg)?.jid }),
            "FAIL" => Ok(Command::Fail(json(arg)?)),
            "BEAT" => Ok(Command::Beat { wid: json::<WidArg>(arg)?.wid }),
            "INFO" => Ok(Command::Info),
            "FLUSH" => Ok(Command::Flush),
            "END" => Ok(Command::End),
            _ => Err(CommandError::client("ERR", "Unknown command")),
        }
    }
}

/// A response frame (spec §4.G): `+text`, `$len` bulk (possibly null), or
/// `-kind message`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Response {
    Simple(String),
    Bulk(Option<Vec<u8>>),
    Error { kind: String, message: String },
}

impl Response {
    pub fn ok() -> Response {
        Response::Simple("OK".to_string())
    }

    pub fn simple(text: impl Into<String>) -> Response {
        Response::Simple(text.into())
    }

    pub fn bulk(data: impl Into<Vec<u8>>) -> Response {
        Response::Bulk(Some(data.into()))
    }

    pub fn null_bulk() -> Response {
        Response::Bulk(None)
    }

    pub fn error(kind: impl Into<String>, message: impl Into<String>) -> Response {
        Response::Error { kind: kind.into(), message: message.into() }
    }
}

impl From<CommandError> for Response {
    fn from(e: CommandError) -> Self {
        match e {
            CommandError::Client { kind, message } => Response::error(kind, message),
            CommandError::Auth(message) => Response::error("ERR", message),
            CommandError::Fatal(e) => Response::error("ERR", format!("Internal: {e}")),
        }
    }
}

/// `INFO` response body (spec §6).
#[derive(Debug, Serialize)]
pub struct InfoResponse {
    pub faktory: FaktoryInfo,
    pub server: ServerInfo,
}

#[derive(Debug, Serialize)]
pub struct FaktoryInfo {
    pub total_enqueued: u64,
    pub total_processed: u64,
    pub total_failures: u64,
    pub total_reserved: u64,
    pub queues: std::collections::BTreeMap<String, u64>,
    pub tasks: TaskCounts,
}

#[derive(Debug, Serialize)]
pub struct TaskCounts {
    #[serde(rename = "Scheduled")]
    pub scheduled: u64,
    #[serde(rename = "Retries")]
    pub retries: u64,
    #[serde(rename = "Dead")]
    pub dead: u64,
}

#[derive(Debug, Serialize)]
pub struct ServerInfo {
    pub description: &'static str,
    pub faktory_version: &'static str,
    pub uptime: i64,
    pub connections: u64,
    pub command_count: u64,
}

/// The `HI` greeting sent before `HELLO` is processed (spec §4.G).
#[derive(Debug, Serialize)]
pub struct HiGreeting {
    pub v: u32,
    pub s: String,
    pub i: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fetch_with_priority_ordered_queues() {
        let cmd = Command::parse("FETCH", b"critical default low").unwrap();
        match cmd {
            Command::Fetch(qs) => assert_eq!(qs, vec!["critical", "default", "low"]),
            _ => panic!("expected Fetch"),
        }
    }

    #[test]
    fn parses_ack() {
        let cmd = Command::parse("ACK", br#"{"jid":"aaaaaaaaaaaaaaaa"}"#).unwrap();
        match cmd {
            Command::Ack { jid } => assert_eq!(jid, "aaaaaaaaaaaaaaaa"),
            _ => panic!("expected Ack"),
        }
    }

    #[test]
    fn unknown_verb_is_a_client_error() {
        let err = Command::parse("BOGUS", b"").unwrap_err();
        assert!(matches!(err, CommandError::Client { kind: "ERR", .. }));
    }

    #[test]
    fn verb_is_case_insensitive() {
        assert!(matches!(Command::parse("info", b"").unwrap(), Command::Info));
        assert!(matches!(Command::parse("End", b"").unwrap(), Command::End));
    }
}
