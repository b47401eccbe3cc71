//! RESP Protocol Implementation
//!
//! Framing and encoding for the subset of RESP2 relaykv speaks.
//!
//! ## Modules
//!
//! - `types`: the `RespValue` enum, reply encoders and snapshot framing
//! - `parser`: incremental parsers for replies, request frames and snapshots
//! - `command`: the decoded request type handed to the dispatcher
//!
//! ## Example
//!
//! ```
//! use relaykv::protocol::{decode_commands, RespValue};
//! use bytes::BytesMut;
//!
//! // Two pipelined requests arriving in one read
//! let mut buf = BytesMut::from(&b"*1\r\n$4\r\nPING\r\n*2\r\n$3\r\nGET\r\n$4\r\nname\r\n"[..]);
//! let (commands, error) = decode_commands(&mut buf);
//! assert!(error.is_none());
//! assert_eq!(commands.len(), 2);
//!
//! // Encoding a reply
//! assert_eq!(RespValue::bulk_string("relay").serialize(), b"$5\r\nrelay\r\n");
//! ```

pub mod command;
pub mod parser;
pub mod types;

pub use command::Command;
pub use parser::{
    decode_commands, parse_message, parse_request, parse_snapshot, ParseError, ParseResult,
    RespParser,
};
pub use types::{encode_snapshot, RespValue};
