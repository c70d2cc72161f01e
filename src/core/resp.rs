//! Minimal RESP2 codec.
//!
//! Commands are always encoded as arrays of bulk strings. Replies are decoded
//! from any buffered async reader, one complete value at a time.

use futures::future::{BoxFuture, FutureExt};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Largest bulk string accepted from a peer (Redis `proto-max-bulk-len`)
const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// Largest array accepted from a peer
const MAX_ARRAY_LEN: i64 = 1024 * 1024;

/// A decoded RESP2 value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// +OK\r\n
    SimpleString(String),
    /// -ERR message\r\n
    Error(String),
    /// :1000\r\n
    Integer(i64),
    /// $5\r\nhello\r\n
    BulkString(Vec<u8>),
    /// $-1\r\n or *-1\r\n
    Null,
    /// *2\r\n$3\r\nfoo\r\n$3\r\nbar\r\n
    Array(Vec<RespValue>),
}

impl RespValue {
    pub fn ok() -> Self {
        Self::SimpleString("OK".to_string())
    }

    pub fn error(msg: &str) -> Self {
        Self::Error(msg.to_string())
    }

    pub fn bulk(data: impl Into<Vec<u8>>) -> Self {
        Self::BulkString(data.into())
    }

    /// Text view of a simple or bulk string (bulk must be valid UTF-8)
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::SimpleString(s) => Some(s),
            Self::BulkString(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn into_string(self) -> Option<String> {
        match self {
            Self::SimpleString(s) => Some(s),
            Self::BulkString(b) => String::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// Encode this value onto the wire (used by servers and tests)
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Self::SimpleString(s) => {
                out.push(b'+');
                out.extend_from_slice(s.as_bytes());
                out.extend_from_slice(b"\r\n");
            }
            Self::Error(s) => {
                out.push(b'-');
                out.extend_from_slice(s.as_bytes());
                out.extend_from_slice(b"\r\n");
            }
            Self::Integer(n) => out.extend_from_slice(format!(":{}\r\n", n).as_bytes()),
            Self::BulkString(b) => {
                out.extend_from_slice(format!("${}\r\n", b.len()).as_bytes());
                out.extend_from_slice(b);
                out.extend_from_slice(b"\r\n");
            }
            Self::Null => out.extend_from_slice(b"$-1\r\n"),
            Self::Array(items) => {
                out.extend_from_slice(format!("*{}\r\n", items.len()).as_bytes());
                for item in items {
                    item.encode_into(out);
                }
            }
        }
    }
}

/// Encode a command as a RESP array of bulk strings
pub fn encode_command<S: AsRef<[u8]>>(args: &[S]) -> Vec<u8> {
    let mut out = format!("*{}\r\n", args.len()).into_bytes();
    for arg in args {
        let arg = arg.as_ref();
        out.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        out.extend_from_slice(arg);
        out.extend_from_slice(b"\r\n");
    }
    out
}

/// Read one complete RESP value
pub fn read_value<'a, R>(reader: &'a mut R) -> BoxFuture<'a, Result<RespValue, RespError>>
where
    R: AsyncBufRead + Unpin + Send,
{
    async move {
        let line = read_line(reader).await?;
        let kind = line.as_bytes()[0];
        let body = line.get(1..).unwrap_or_default();

        match kind {
            b'+' => Ok(RespValue::SimpleString(body.to_string())),
            b'-' => Ok(RespValue::Error(body.to_string())),
            b':' => Ok(RespValue::Integer(parse_int(body)?)),
            b'$' => {
                let len = parse_int(body)?;
                if len < 0 {
                    return Ok(RespValue::Null);
                }
                if len > MAX_BULK_LEN {
                    return Err(RespError::Protocol(format!(
                        "bulk length {} exceeds limit of {}",
                        len, MAX_BULK_LEN
                    )));
                }
                // Grow with the bytes actually received rather than the advertised length
                let expected = len as u64 + 2;
                let mut data = Vec::new();
                (&mut *reader).take(expected).read_to_end(&mut data).await?;
                if (data.len() as u64) < expected {
                    return Err(RespError::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "bulk string truncated",
                    )));
                }
                if !data.ends_with(b"\r\n") {
                    return Err(RespError::Protocol(
                        "bulk string not terminated by CRLF".to_string(),
                    ));
                }
                data.truncate(len as usize);
                Ok(RespValue::BulkString(data))
            }
            b'*' => {
                let count = parse_int(body)?;
                if count < 0 {
                    return Ok(RespValue::Null);
                }
                if count > MAX_ARRAY_LEN {
                    return Err(RespError::Protocol(format!(
                        "array length {} exceeds limit of {}",
                        count, MAX_ARRAY_LEN
                    )));
                }
                let mut items = Vec::new();
                for _ in 0..count {
                    items.push(read_value(reader).await?);
                }
                Ok(RespValue::Array(items))
            }
            other => Err(RespError::Protocol(format!(
                "unexpected type byte 0x{:02x}",
                other
            ))),
        }
    }
    .boxed()
}

async fn read_line<R>(reader: &mut R) -> Result<String, RespError>
where
    R: AsyncBufRead + Unpin + Send,
{
    let mut buf = Vec::new();
    let n = reader.read_until(b'\n', &mut buf).await?;
    if n == 0 {
        return Err(RespError::ConnectionClosed);
    }
    if !buf.ends_with(b"\r\n") || buf.len() < 3 {
        return Err(RespError::Protocol("malformed line".to_string()));
    }
    buf.truncate(buf.len() - 2);
    String::from_utf8(buf).map_err(|e| RespError::Protocol(e.to_string()))
}

fn parse_int(s: &str) -> Result<i64, RespError> {
    s.parse::<i64>()
        .map_err(|_| RespError::Protocol(format!("invalid integer '{}'", s)))
}

#[derive(Debug, thiserror::Error)]
pub enum RespError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Connection closed by peer")]
    ConnectionClosed,
    #[error("Protocol error: {0}")]
    Protocol(String),
}
