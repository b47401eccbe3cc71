//! Decoded client requests.

use crate::protocol::types::RespValue;
use bytes::Bytes;

/// A request frame: command name plus binary-safe arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Every element as received, name first.
    parts: Vec<Bytes>,
    /// Upper-cased command name used for dispatch.
    name: String,
    /// Bytes the frame occupied on the wire.
    wire_len: usize,
}

impl Command {
    /// Builds a command from decoded frame elements. Returns `None` for an
    /// empty frame.
    pub fn from_parts(parts: Vec<Bytes>, wire_len: usize) -> Option<Self> {
        let name = String::from_utf8_lossy(parts.first()?).to_uppercase();
        Some(Self {
            parts,
            name,
            wire_len,
        })
    }

    /// Builds a command from string-like parts, as a client would send it.
    pub fn new<I, T>(parts: I) -> Option<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<Bytes>,
    {
        let parts: Vec<Bytes> = parts.into_iter().map(Into::into).collect();
        let wire_len = RespValue::command(parts.iter().cloned()).serialize().len();
        Self::from_parts(parts, wire_len)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Arguments after the command name.
    pub fn args(&self) -> &[Bytes] {
        &self.parts[1..]
    }

    pub fn wire_len(&self) -> usize {
        self.wire_len
    }

    /// Re-encodes the command as a request frame, preserving the original
    /// spelling of the name.
    pub fn to_resp(&self) -> RespValue {
        RespValue::command(self.parts.iter().cloned())
    }
}
