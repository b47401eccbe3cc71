//! Replication Module
//!
//! Master/replica replication: a master streams every accepted write to its
//! replicas, which keep an eventually-consistent copy of the keyspace.
//!
//! ## Architecture
//!
//! ```text
//!            client SET                         replica node
//!                │                       ┌──────────────────────┐
//!                ▼                       │ ReplicaLink          │
//!   ┌─────────────────────────┐          │  sync():  handshake  │
//!   │ ReplicationManager      │  PSYNC   │           + snapshot │
//!   │  commit_write ──┐       │ <─────── │  stream(): apply     │
//!   │  (sessions lock)│       │          └──────────┬───────────┘
//!   │    apply ───────┼──> StorageEngine            │
//!   │    enqueue ─────┼──> session queues ────────> │ socket
//!   └─────────────────────────┘   (bounded mpsc)
//! ```
//!
//! On the master, the connection that issued PSYNC owns the socket and
//! drains its session queue. On the replica, a single task owns the link.

pub mod master;
pub mod replica;
pub mod state;

pub use master::{FullResync, ReplicaInfo, ReplicationManager, DEFAULT_QUEUE_CAPACITY};
pub use replica::ReplicaLink;
pub use state::{generate_replication_id, LinkState, ReplicationState, Role};

use crate::protocol::ParseError;
use crate::storage::SnapshotError;
use std::io;
use thiserror::Error;

/// Errors raised on either end of a replication link.
#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error("failed to connect to master at {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("I/O error on replication link: {0}")]
    Io(#[from] io::Error),

    #[error("protocol error on replication link: {0}")]
    Parse(#[from] ParseError),

    #[error("unexpected reply to {command}: {reply}")]
    UnexpectedReply {
        command: &'static str,
        reply: String,
    },

    #[error("malformed FULLRESYNC reply: {0}")]
    BadFullResync(String),

    #[error("invalid snapshot: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("master closed the connection")]
    UpstreamClosed,

    #[error("timed out waiting for master")]
    Timeout,

    #[error("PSYNC is only supported on a master")]
    NotMaster,
}
