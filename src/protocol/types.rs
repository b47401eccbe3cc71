//! RESP Value Types and Encoders
//!
//! Every reply relaykv sends, and every request a replica sends upstream
//! during the handshake, is built from a [`RespValue`] and serialized here.
//!
//! ## Wire Forms
//!
//! ```text
//! +PONG\r\n                      simple string
//! -ERR syntax error\r\n          error
//! :42\r\n                        integer
//! $5\r\nhello\r\n                bulk string
//! $-1\r\n                        null bulk string
//! *2\r\n$3\r\nGET\r\n$1\r\nk\r\n array of bulk strings
//! $<len>\r\n<snapshot bytes>     snapshot transfer (no trailing CRLF)
//! ```

use bytes::Bytes;
use std::fmt;

/// The CRLF terminator used in RESP protocol
pub const CRLF: &[u8] = b"\r\n";

/// RESP protocol type prefixes
pub mod prefix {
    pub const SIMPLE_STRING: u8 = b'+';
    pub const ERROR: u8 = b'-';
    pub const INTEGER: u8 = b':';
    pub const BULK_STRING: u8 = b'$';
    pub const ARRAY: u8 = b'*';
}

/// A single RESP2 value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// `+<string>\r\n`, must not contain CR or LF.
    SimpleString(String),

    /// `-<message>\r\n`
    Error(String),

    /// `:<integer>\r\n`
    Integer(i64),

    /// `$<length>\r\n<data>\r\n`, binary safe.
    BulkString(Bytes),

    /// `$-1\r\n`. A null array (`*-1\r\n`) also parses to this.
    Null,

    /// `*<count>\r\n<element>...`
    Array(Vec<RespValue>),
}

impl RespValue {
    pub fn simple_string(s: impl Into<String>) -> Self {
        RespValue::SimpleString(s.into())
    }

    /// Creates an error reply. Callers include the `ERR` prefix themselves.
    ///
    /// # Example
    /// ```
    /// use relaykv::protocol::RespValue;
    /// let err = RespValue::error("ERR syntax error");
    /// assert_eq!(err.serialize(), b"-ERR syntax error\r\n");
    /// ```
    pub fn error(s: impl Into<String>) -> Self {
        RespValue::Error(s.into())
    }

    pub fn integer(n: i64) -> Self {
        RespValue::Integer(n)
    }

    pub fn bulk_string(data: impl Into<Bytes>) -> Self {
        RespValue::BulkString(data.into())
    }

    pub fn null() -> Self {
        RespValue::Null
    }

    pub fn array(values: Vec<RespValue>) -> Self {
        RespValue::Array(values)
    }

    /// Builds a request frame: an array of bulk strings.
    ///
    /// # Example
    /// ```
    /// use relaykv::protocol::RespValue;
    /// let ping = RespValue::command(["PING"]);
    /// assert_eq!(ping.serialize(), b"*1\r\n$4\r\nPING\r\n");
    /// ```
    pub fn command<I, T>(parts: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Bytes>,
    {
        RespValue::Array(
            parts
                .into_iter()
                .map(|part| RespValue::BulkString(part.into()))
                .collect(),
        )
    }

    pub fn ok() -> Self {
        RespValue::SimpleString("OK".to_string())
    }

    pub fn pong() -> Self {
        RespValue::SimpleString("PONG".to_string())
    }

    /// Serializes the value to its wire representation.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.serialize_into(&mut buf);
        buf
    }

    /// Serializes into an existing buffer.
    pub fn serialize_into(&self, buf: &mut Vec<u8>) {
        match self {
            RespValue::SimpleString(s) => {
                buf.push(prefix::SIMPLE_STRING);
                buf.extend_from_slice(s.as_bytes());
                buf.extend_from_slice(CRLF);
            }
            RespValue::Error(s) => {
                buf.push(prefix::ERROR);
                buf.extend_from_slice(s.as_bytes());
                buf.extend_from_slice(CRLF);
            }
            RespValue::Integer(n) => {
                buf.push(prefix::INTEGER);
                buf.extend_from_slice(n.to_string().as_bytes());
                buf.extend_from_slice(CRLF);
            }
            RespValue::BulkString(data) => {
                write_length_header(buf, prefix::BULK_STRING, data.len());
                buf.extend_from_slice(data);
                buf.extend_from_slice(CRLF);
            }
            RespValue::Null => {
                buf.push(prefix::BULK_STRING);
                buf.extend_from_slice(b"-1");
                buf.extend_from_slice(CRLF);
            }
            RespValue::Array(values) => {
                write_length_header(buf, prefix::ARRAY, values.len());
                for value in values {
                    value.serialize_into(buf);
                }
            }
        }
    }

    /// Returns the text of a SimpleString, or a UTF-8 BulkString.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            RespValue::SimpleString(s) => Some(s),
            RespValue::BulkString(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn into_array(self) -> Option<Vec<RespValue>> {
        match self {
            RespValue::Array(arr) => Some(arr),
            _ => None,
        }
    }
}

/// Writes `<prefix><len>\r\n`.
fn write_length_header(buf: &mut Vec<u8>, prefix: u8, len: usize) {
    buf.push(prefix);
    buf.extend_from_slice(len.to_string().as_bytes());
    buf.extend_from_slice(CRLF);
}

/// Frames a snapshot blob for transfer to a replica.
///
/// The length header matches a bulk string, but the payload is a file
/// transfer and is not followed by CRLF.
pub fn encode_snapshot(blob: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(blob.len() + 16);
    write_length_header(&mut buf, prefix::BULK_STRING, blob.len());
    buf.extend_from_slice(blob);
    buf
}

impl fmt::Display for RespValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RespValue::SimpleString(s) => write!(f, "\"{}\"", s),
            RespValue::Error(s) => write!(f, "(error) {}", s),
            RespValue::Integer(n) => write!(f, "(integer) {}", n),
            RespValue::BulkString(data) => match std::str::from_utf8(data) {
                Ok(s) => write!(f, "\"{}\"", s),
                Err(_) => write!(f, "(binary data, {} bytes)", data.len()),
            },
            RespValue::Null => write!(f, "(nil)"),
            RespValue::Array(values) => {
                if values.is_empty() {
                    return write!(f, "(empty array)");
                }
                writeln!(f)?;
                for (i, v) in values.iter().enumerate() {
                    writeln!(f, "{}) {}", i + 1, v)?;
                }
                Ok(())
            }
        }
    }
}
