//! Minimal RESP2 codec
//!
//! Enough of the Redis serialization protocol to issue commands and read
//! replies and pub/sub pushes. Commands are always sent as arrays of bulk
//! strings.

use futures_util::future::BoxFuture;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Largest bulk string accepted from the server (Redis' own limit)
pub const MAX_BULK_LENGTH: i64 = 512 * 1024 * 1024;

/// Deepest array nesting accepted from the server
pub const MAX_NESTING: usize = 8;

/// Errors that can occur while decoding RESP frames
#[derive(Debug, Error)]
pub enum RespError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unknown frame prefix: {0:#04x}")]
    UnknownPrefix(u8),

    #[error("Malformed frame: {0}")]
    Malformed(String),

    #[error("Connection closed mid-frame")]
    UnexpectedEof,
}

/// Result type for codec operations
pub type RespResult<T> = Result<T, RespError>;

/// A decoded RESP2 value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Option<Vec<u8>>),
    Array(Option<Vec<Frame>>),
}

impl Frame {
    /// Interpret the frame as a pub/sub `message` push, returning `(channel, payload)`
    pub fn into_message(self) -> Option<(Vec<u8>, Vec<u8>)> {
        let Frame::Array(Some(items)) = self else {
            return None;
        };
        let mut items = items.into_iter();
        match (items.next(), items.next(), items.next(), items.next()) {
            (
                Some(Frame::Bulk(Some(kind))),
                Some(Frame::Bulk(Some(channel))),
                Some(Frame::Bulk(Some(payload))),
                None,
            ) if kind.eq_ignore_ascii_case(b"message") => Some((channel, payload)),
            _ => None,
        }
    }

    /// Whether this frame acknowledges `kind` (`subscribe`/`unsubscribe`) for `channel`
    pub fn is_ack(&self, kind: &str, channel: &str) -> bool {
        let Frame::Array(Some(items)) = self else {
            return false;
        };
        matches!(
            items.as_slice(),
            [Frame::Bulk(Some(k)), Frame::Bulk(Some(c)), Frame::Integer(_)]
                if k.eq_ignore_ascii_case(kind.as_bytes()) && c.as_slice() == channel.as_bytes()
        )
    }
}

/// Encode a command as a RESP array of bulk strings
pub fn encode_command(args: &[&[u8]]) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + args.iter().map(|a| a.len() + 16).sum::<usize>());
    out.extend_from_slice(format!("*{}\r\n", args.len()).as_bytes());
    for arg in args {
        out.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        out.extend_from_slice(arg);
        out.extend_from_slice(b"\r\n");
    }
    out
}

/// Read one frame. Returns `Ok(None)` on a clean end of stream.
pub fn read_frame<'a, R>(reader: &'a mut R) -> BoxFuture<'a, RespResult<Option<Frame>>>
where
    R: AsyncBufRead + Unpin + Send,
{
    read_nested(reader, 0)
}

fn read_nested<'a, R>(reader: &'a mut R, depth: usize) -> BoxFuture<'a, RespResult<Option<Frame>>>
where
    R: AsyncBufRead + Unpin + Send,
{
    Box::pin(async move {
        if depth > MAX_NESTING {
            return Err(RespError::Malformed(format!(
                "arrays nested deeper than {}",
                MAX_NESTING
            )));
        }

        let mut line = Vec::new();
        if reader.read_until(b'\n', &mut line).await? == 0 {
            return Ok(None);
        }
        let line = strip_crlf(&line)?;
        let (prefix, rest) = line
            .split_first()
            .ok_or_else(|| RespError::Malformed("empty line".to_string()))?;

        let frame = match prefix {
            b'+' => Frame::Simple(String::from_utf8_lossy(rest).into_owned()),
            b'-' => Frame::Error(String::from_utf8_lossy(rest).into_owned()),
            b':' => Frame::Integer(parse_int(rest)?),
            b'$' => {
                let len = parse_int(rest)?;
                if len < 0 {
                    Frame::Bulk(None)
                } else if len > MAX_BULK_LENGTH {
                    return Err(RespError::Malformed(format!("bulk length {} too large", len)));
                } else {
                    let len = len as usize;
                    let mut buf = vec![0u8; len + 2];
                    reader.read_exact(&mut buf).await.map_err(eof_mid_frame)?;
                    if &buf[len..] != b"\r\n" {
                        return Err(RespError::Malformed("bulk string not CRLF terminated".to_string()));
                    }
                    buf.truncate(len);
                    Frame::Bulk(Some(buf))
                }
            }
            b'*' => {
                let len = parse_int(rest)?;
                if len < 0 {
                    Frame::Array(None)
                } else {
                    let mut items = Vec::with_capacity(len.min(64) as usize);
                    for _ in 0..len {
                        match read_nested(&mut *reader, depth + 1).await? {
                            Some(item) => items.push(item),
                            None => return Err(RespError::UnexpectedEof),
                        }
                    }
                    Frame::Array(Some(items))
                }
            }
            other => return Err(RespError::UnknownPrefix(*other)),
        };

        Ok(Some(frame))
    })
}

fn strip_crlf(line: &[u8]) -> RespResult<&[u8]> {
    line.strip_suffix(b"\r\n").ok_or(RespError::UnexpectedEof)
}

fn parse_int(digits: &[u8]) -> RespResult<i64> {
    std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| {
            RespError::Malformed(format!("invalid integer: {:?}", String::from_utf8_lossy(digits)))
        })
}

fn eof_mid_frame(e: std::io::Error) -> RespError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        RespError::UnexpectedEof
    } else {
        RespError::Io(e)
    }
}
