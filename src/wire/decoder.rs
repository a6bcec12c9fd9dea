//! Line framing for the `VERB <json-arg>\r\n` grammar: a
//! `tokio_util::codec::Decoder` hand-searching for `\r\n` with
//! `itertools::tuple_windows`, and a `Client`/`Io` error split with manual
//! `From` impls. Faktory commands carry their JSON argument inline, so
//! there's no separate binary body to stream in — just a 1 MB line cap.

use std::{error, fmt, io};

use itertools::Itertools;
use tokio_util::codec;

use super::events::ClientEvent;
use super::protocol::{Command, Response};

const MAX_LINE_LEN: usize = 1024 * 1024;

#[derive(Debug, Default)]
pub struct Decoder {
    /// Set once a line longer than [`MAX_LINE_LEN`] forces the connection
    /// to be torn down; subsequent calls keep returning the same error so
    /// the caller doesn't keep trying to make progress on a doomed stream.
    poisoned: bool,
}

impl codec::Decoder for Decoder {
    type Item = ClientEvent;
    type Error = Error;

    fn decode(&mut self, src: &mut bytes::BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.poisoned {
            return Err(Response::error("ERR", "Invalid format").into());
        }

        // Imagine src contains b"abc\r\n": tuple_windows over the bytes
        // yields ab, bc, c\r, \r\n, so idx is 3 — the same trick the
        // teacher's decoder uses, just without the 224-byte cap.
        match src
            .iter()
            .take(MAX_LINE_LEN)
            .tuple_windows()
            .find_position(|&(&a, &b)| a == b'\r' && b == b'\n')
        {
            Some((idx, _)) => {
                let line = src.split_to(idx);
                src.advance2();

                let line = line.freeze();
                let (verb, arg) = split_verb(&line);

                Ok(Some(match Command::parse(verb, arg) {
                    Ok(cmd) => ClientEvent::Command(cmd),
                    Err(e) => ClientEvent::Rejected(e),
                }))
            },
            None => {
                if src.len() >= MAX_LINE_LEN {
                    self.poisoned = true;
                    Err(Response::error("ERR", "Invalid format").into())
                } else {
                    Ok(None)
                }
            },
        }
    }
}

/// Splits `line` into its verb (first whitespace-delimited token) and the
/// remainder, trimmed of a single leading space. The remainder is handed
/// to [`Command::parse`] as-is so a JSON argument's internal spaces
/// survive.
fn split_verb(line: &[u8]) -> (&str, &[u8]) {
    let line_str = std::str::from_utf8(line).unwrap_or("");
    match line.iter().position(|&b| b == b' ') {
        Some(idx) => (&line_str[..idx], &line[idx + 1..]),
        None => (line_str, b""),
    }
}

trait BytesMutExt {
    fn advance2(&mut self);
}

impl BytesMutExt for bytes::BytesMut {
    fn advance2(&mut self) {
        bytes::Buf::advance(self, 2)
    }
}

#[derive(Debug)]
pub enum Error {
    Client(Response),
    Io(io::Error),
}

impl error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl From<Response> for Error {
    fn from(value: Response) -> Self {
        Self::Client(value)
    }
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;
    use tokio_util::codec::FramedRead;

    fn stream_from(lines: &[&str]) -> Vec<u8> {
        let mut s = lines.join("\r\n");
        s.push_str("\r\n");
        s.into_bytes()
    }

    #[tokio::test]
    async fn parses_a_normal_sequence_of_commands() {
        let stream =
            stream_from(&[r#"PUSH {"jid":"aaaaaaaaaaaaaaaa","jobtype":"X","args":[],"queue":"default"}"#, "INFO", "END"]);

        let decoder = Decoder::default();
        let mut framed = FramedRead::new(stream.as_slice(), decoder);

        match framed.next().await.unwrap().unwrap() {
            ClientEvent::Command(Command::Push(job)) => assert_eq!(job.jid, "aaaaaaaaaaaaaaaa"),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(matches!(framed.next().await.unwrap().unwrap(), ClientEvent::Command(Command::Info)));
        assert!(matches!(framed.next().await.unwrap().unwrap(), ClientEvent::Command(Command::End)));
        assert!(framed.next().await.is_none());
    }

    #[tokio::test]
    async fn malformed_argument_yields_rejected_not_fatal() {
        let stream = stream_from(&["ACK not-json", "INFO"]);

        let decoder = Decoder::default();
        let mut framed = FramedRead::new(stream.as_slice(), decoder);

        assert!(matches!(framed.next().await.unwrap().unwrap(), ClientEvent::Rejected(_)));
        // The stream is still usable afterwards.
        assert!(matches!(framed.next().await.unwrap().unwrap(), ClientEvent::Command(Command::Info)));
    }

    #[tokio::test]
    async fn unknown_verb_is_rejected() {
        let stream = stream_from(&["BOGUS"]);
        let decoder = Decoder::default();
        let mut framed = FramedRead::new(stream.as_slice(), decoder);

        assert!(matches!(framed.next().await.unwrap().unwrap(), ClientEvent::Rejected(_)));
    }
}
