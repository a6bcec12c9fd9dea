//! Response framing for the `+`/`$`/`-` grammar: a `codec::Encoder` built
//! from hand-written `BufMut::put_slice` calls and an `Error` enum with a
//! single `From<io::Error>` impl, producing Faktory's three response kinds.

use std::{error, fmt, io};

use bytes::BufMut;
use tokio_util::codec;

use super::protocol::Response;

#[derive(Debug, Default)]
pub struct Encoder {}

impl codec::Encoder<Response> for Encoder {
    type Error = Error;

    fn encode(&mut self, item: Response, dst: &mut bytes::BytesMut) -> Result<(), Self::Error> {
        match item {
            Response::Simple(text) => {
                dst.reserve(1 + text.len() + 2);
                dst.put_u8(b'+');
                dst.put_slice(text.as_bytes());
                dst.put_slice(b"\r\n");
            },
            Response::Bulk(Some(data)) => {
                let len_str = data.len().to_string();
                dst.reserve(1 + len_str.len() + 2 + data.len() + 2);
                dst.put_u8(b'$');
                dst.put_slice(len_str.as_bytes());
                dst.put_slice(b"\r\n");
                dst.put_slice(&data);
                dst.put_slice(b"\r\n");
            },
            Response::Bulk(None) => dst.put_slice(b"$-1\r\n"),
            Response::Error { kind, message } => {
                dst.reserve(1 + kind.len() + 1 + message.len() + 2);
                dst.put_u8(b'-');
                dst.put_slice(kind.as_bytes());
                dst.put_u8(b' ');
                dst.put_slice(message.as_bytes());
                dst.put_slice(b"\r\n");
            },
        }
        Ok(())
    }
}

#[derive(Debug)]
pub enum Error {
    Io(io::Error),
}

impl error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
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
    use tokio_util::codec::Encoder as _;

    fn encode(resp: Response) -> Vec<u8> {
        let mut dst = bytes::BytesMut::new();
        Encoder::default().encode(resp, &mut dst).unwrap();
        dst.to_vec()
    }

    #[test]
    fn simple_response_framing() {
        assert_eq!(encode(Response::ok()), b"+OK\r\n".to_vec());
    }

    #[test]
    fn bulk_response_framing() {
        assert_eq!(encode(Response::bulk(b"{}".to_vec())), b"$2\r\n{}\r\n".to_vec());
    }

    #[test]
    fn null_bulk_response_framing() {
        assert_eq!(encode(Response::null_bulk()), b"$-1\r\n".to_vec());
    }

    #[test]
    fn error_response_framing() {
        assert_eq!(
            encode(Response::error("ERR", "Unknown job")),
            b"-ERR Unknown job\r\n".to_vec()
        );
    }
}
