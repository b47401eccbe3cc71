//! Incremental RESP Parser
//!
//! Two entry points share the same length-line handling:
//!
//! - [`RespParser`] parses any RESP value. The replica uses it to read the
//!   master's handshake replies, and tests use it to read server replies.
//! - [`decode_commands`] decodes client request frames. A request is strictly
//!   an array of bulk strings; anything else is a protocol error. It returns
//!   the requests decoded ahead of a malformed frame alongside the error.
//!
//! Both report progress the same way:
//!
//! - `Ok(Some((value, consumed)))` - a complete value, `consumed` bytes used
//! - `Ok(None)` - the frame is incomplete, read more and retry
//! - `Err(ParseError)` - the stream is malformed and cannot be resynchronized
//!
//! Payloads are located by their declared length, never by scanning for a
//! terminator, so bulk strings may contain `\r\n`, `$` or NUL bytes.

use crate::protocol::command::Command;
use crate::protocol::types::{prefix, RespValue, CRLF};
use bytes::{Buf, Bytes, BytesMut};
use std::num::ParseIntError;
use thiserror::Error;

/// Errors that can occur during RESP parsing.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParseError {
    /// Unknown type prefix byte
    #[error("unknown type prefix: {0:#04x}")]
    UnknownPrefix(u8),

    /// A request frame did not start with the expected prefix
    #[error("expected '{expected}', got {found:#04x}")]
    UnexpectedPrefix { expected: char, found: u8 },

    /// Invalid integer format
    #[error("invalid integer: {0}")]
    InvalidInteger(String),

    /// Invalid UTF-8 in a simple string or error message
    #[error("invalid UTF-8: {0}")]
    InvalidUtf8(String),

    /// Bulk string length is negative (but not -1 for null)
    #[error("invalid bulk string length: {0}")]
    InvalidBulkLength(i64),

    /// Array length is negative (but not -1 for null)
    #[error("invalid array length: {0}")]
    InvalidArrayLength(i64),

    /// Protocol violation (missing CRLF, etc.)
    #[error("{0}")]
    ProtocolError(String),

    /// The message exceeds maximum allowed size
    #[error("message too large: {size} (max: {max})")]
    MessageTooLarge { size: usize, max: usize },
}

/// Result type for parsing operations.
pub type ParseResult<T> = Result<T, ParseError>;

/// Maximum size for a single bulk string (512 MB, same as Redis)
pub const MAX_BULK_SIZE: usize = 512 * 1024 * 1024;

/// Maximum number of elements in a request frame
pub const MAX_REQUEST_ARGS: usize = 1024 * 1024;

/// Maximum array nesting depth (prevent stack overflow)
pub const MAX_NESTING_DEPTH: usize = 32;

/// A RESP value parser.
///
/// # Example
///
/// ```
/// use relaykv::protocol::{RespParser, RespValue};
///
/// let mut parser = RespParser::new();
/// let (value, consumed) = parser.parse(b"+FULLRESYNC abc 0\r\n").unwrap().unwrap();
/// assert_eq!(value, RespValue::simple_string("FULLRESYNC abc 0"));
/// assert_eq!(consumed, 19);
/// ```
#[derive(Debug, Default)]
pub struct RespParser {
    /// Current nesting depth (for array parsing)
    depth: usize,
}

impl RespParser {
    pub fn new() -> Self {
        Self { depth: 0 }
    }

    /// Attempts to parse one RESP value from the front of `buf`.
    pub fn parse(&mut self, buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
        self.depth = 0;
        self.parse_value(buf)
    }

    fn parse_value(&mut self, buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
        if buf.is_empty() {
            return Ok(None);
        }

        if self.depth > MAX_NESTING_DEPTH {
            return Err(ParseError::ProtocolError(format!(
                "maximum nesting depth exceeded: {}",
                MAX_NESTING_DEPTH
            )));
        }

        match buf[0] {
            prefix::SIMPLE_STRING => Ok(parse_line(buf)?
                .map(|(line, consumed)| (RespValue::SimpleString(line.to_string()), consumed))),
            prefix::ERROR => Ok(parse_line(buf)?
                .map(|(line, consumed)| (RespValue::Error(line.to_string()), consumed))),
            prefix::INTEGER => self.parse_integer(buf),
            prefix::BULK_STRING => Ok(parse_bulk_string(buf)?
                .map(|(data, consumed)| match data {
                    Some(data) => (RespValue::BulkString(data), consumed),
                    None => (RespValue::Null, consumed),
                })),
            prefix::ARRAY => self.parse_array(buf),
            other => Err(ParseError::UnknownPrefix(other)),
        }
    }

    /// Parses an integer: `:<integer>\r\n`
    fn parse_integer(&mut self, buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
        match parse_length_line(buf)? {
            Some((n, consumed)) => Ok(Some((RespValue::Integer(n), consumed))),
            None => Ok(None),
        }
    }

    /// Parses an array: `*<count>\r\n<elements...>`
    fn parse_array(&mut self, buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
        let (count, mut consumed) = match parse_length_line(buf)? {
            Some(header) => header,
            None => return Ok(None),
        };

        if count == -1 {
            return Ok(Some((RespValue::Null, consumed)));
        }
        if count < 0 {
            return Err(ParseError::InvalidArrayLength(count));
        }

        let count = count as usize;
        let mut elements = Vec::with_capacity(count.min(1024));

        self.depth += 1;
        for _ in 0..count {
            match self.parse_value(&buf[consumed..])? {
                Some((value, element_consumed)) => {
                    elements.push(value);
                    consumed += element_consumed;
                }
                None => return Ok(None),
            }
        }
        self.depth -= 1;

        Ok(Some((RespValue::Array(elements), consumed)))
    }
}

/// Parses `<prefix><text>\r\n`, returning the text and bytes consumed.
fn parse_line(buf: &[u8]) -> ParseResult<Option<(&str, usize)>> {
    match find_crlf(&buf[1..]) {
        Some(pos) => {
            let line = std::str::from_utf8(&buf[1..1 + pos])
                .map_err(|e| ParseError::InvalidUtf8(e.to_string()))?;
            Ok(Some((line, 1 + pos + 2)))
        }
        None => Ok(None),
    }
}

/// Parses `<prefix><integer>\r\n`.
fn parse_length_line(buf: &[u8]) -> ParseResult<Option<(i64, usize)>> {
    let (line, consumed) = match parse_line(buf)? {
        Some(line) => line,
        None => return Ok(None),
    };

    let n = line
        .parse::<i64>()
        .map_err(|e: ParseIntError| ParseError::InvalidInteger(format!("{:?}: {}", line, e)))?;

    Ok(Some((n, consumed)))
}

/// Parses `$<length>\r\n<data>\r\n`. `Some((None, _))` is the null bulk string.
fn parse_bulk_string(buf: &[u8]) -> ParseResult<Option<(Option<Bytes>, usize)>> {
    let (length, data_start) = match parse_length_line(buf)? {
        Some(header) => header,
        None => return Ok(None),
    };

    if length == -1 {
        return Ok(Some((None, data_start)));
    }

    let length = checked_bulk_length(length)?;

    let total_needed = data_start + length + 2;
    if buf.len() < total_needed {
        return Ok(None);
    }

    if &buf[data_start + length..total_needed] != CRLF {
        return Err(ParseError::ProtocolError(
            "bulk string missing trailing CRLF".to_string(),
        ));
    }

    let data = Bytes::copy_from_slice(&buf[data_start..data_start + length]);
    Ok(Some((Some(data), total_needed)))
}

fn checked_bulk_length(length: i64) -> ParseResult<usize> {
    if length < 0 {
        return Err(ParseError::InvalidBulkLength(length));
    }
    let length = length as usize;
    if length > MAX_BULK_SIZE {
        return Err(ParseError::MessageTooLarge {
            size: length,
            max: MAX_BULK_SIZE,
        });
    }
    Ok(length)
}

/// Finds the position of CRLF in the buffer.
///
/// Returns the position of `\r` if found, or None if CRLF is not present.
#[inline]
fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|window| window == CRLF)
}

fn expect_prefix(buf: &[u8], expected: u8) -> ParseResult<()> {
    if buf[0] != expected {
        return Err(ParseError::UnexpectedPrefix {
            expected: expected as char,
            found: buf[0],
        });
    }
    Ok(())
}

/// Parses one request frame (`*<n>\r\n` followed by `n` bulk strings).
///
/// Returns the frame's elements and the number of bytes it occupied.
pub fn parse_request(buf: &[u8]) -> ParseResult<Option<(Vec<Bytes>, usize)>> {
    if buf.is_empty() {
        return Ok(None);
    }
    expect_prefix(buf, prefix::ARRAY)?;

    let (count, mut consumed) = match parse_length_line(buf)? {
        Some(header) => header,
        None => return Ok(None),
    };

    if count < 0 {
        return Err(ParseError::InvalidArrayLength(count));
    }
    let count = count as usize;
    if count > MAX_REQUEST_ARGS {
        return Err(ParseError::MessageTooLarge {
            size: count,
            max: MAX_REQUEST_ARGS,
        });
    }

    let mut parts = Vec::with_capacity(count.min(64));
    for _ in 0..count {
        let rest = &buf[consumed..];
        if rest.is_empty() {
            return Ok(None);
        }
        expect_prefix(rest, prefix::BULK_STRING)?;

        match parse_bulk_string(rest)? {
            Some((Some(data), element_consumed)) => {
                parts.push(data);
                consumed += element_consumed;
            }
            Some((None, _)) => {
                return Err(ParseError::ProtocolError(
                    "null bulk string in request".to_string(),
                ))
            }
            None => return Ok(None),
        }
    }

    Ok(Some((parts, consumed)))
}

/// Decodes every complete request frame at the front of `buf`.
///
/// Consumed bytes are removed from `buf`; a trailing partial frame stays in
/// place so decoding resumes once the rest of it has been read. Empty arrays
/// (`*0\r\n`) are consumed and skipped.
///
/// Decoding stops at the first malformed frame. The requests before it are
/// still returned, together with the error, so the caller can answer them
/// before giving up on the stream.
///
/// # Example
///
/// ```
/// use bytes::BytesMut;
/// use relaykv::protocol::decode_commands;
///
/// let mut buf = BytesMut::from(&b"*1\r\n$4\r\nPING\r\n*2\r\n$3\r\nGET"[..]);
/// let (commands, error) = decode_commands(&mut buf);
/// assert!(error.is_none());
/// assert_eq!(commands.len(), 1);
/// assert_eq!(commands[0].name(), "PING");
/// assert_eq!(&buf[..], b"*2\r\n$3\r\nGET");
/// ```
pub fn decode_commands(buf: &mut BytesMut) -> (Vec<Command>, Option<ParseError>) {
    let mut commands = Vec::new();

    loop {
        match parse_request(buf) {
            Ok(Some((parts, consumed))) => {
                buf.advance(consumed);
                if let Some(command) = Command::from_parts(parts, consumed) {
                    commands.push(command);
                }
            }
            Ok(None) => return (commands, None),
            Err(e) => return (commands, Some(e)),
        }
    }
}

/// Parses a snapshot transfer: `$<length>\r\n<blob>` with no trailing CRLF.
pub fn parse_snapshot(buf: &[u8]) -> ParseResult<Option<(Bytes, usize)>> {
    if buf.is_empty() {
        return Ok(None);
    }
    expect_prefix(buf, prefix::BULK_STRING)?;

    let (length, data_start) = match parse_length_line(buf)? {
        Some(header) => header,
        None => return Ok(None),
    };
    let length = checked_bulk_length(length)?;

    let total_needed = data_start + length;
    if buf.len() < total_needed {
        return Ok(None);
    }

    Ok(Some((
        Bytes::copy_from_slice(&buf[data_start..total_needed]),
        total_needed,
    )))
}

/// Helper function to parse a single RESP value from bytes.
pub fn parse_message(buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
    RespParser::new().parse(buf)
}
