//! Command Handler Module
//!
//! This module implements the command processing layer for relaykv.
//! It receives decoded requests, executes them against the keyspace and the
//! replication manager, and returns replies.
//!
//! ## Architecture
//!
//! ```text
//! Client Request
//!       │
//!       ▼
//! ┌─────────────────┐
//! │ decode_commands │  (protocol module)
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │ CommandHandler  │  (this module)
//! │                 │
//! │  - Dispatch     │
//! │  - Validate     │
//! │  - Execute      │
//! └───┬─────────┬───┘
//!     │         │ writes
//!     │         ▼
//!     │   ┌────────────────────┐
//!     │   │ ReplicationManager │ ──> replica queues
//!     │   └─────────┬──────────┘
//!     ▼             ▼
//! ┌─────────────────────────┐
//! │ StorageEngine           │  (storage module)
//! └─────────────────────────┘
//! ```
//!
//! ## Supported Commands
//!
//! - `PING`, `ECHO`
//! - `SET`, `GET`
//! - `INFO`
//! - `REPLCONF`, `PSYNC`

pub mod handler;

pub use handler::{CommandHandler, CommandOutcome, ConnectionContext};
