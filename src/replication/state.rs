//! Process-wide replication state.

use crate::config::MasterAddr;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

/// Length of a replication id, as in Redis.
pub const REPLICATION_ID_LEN: usize = 40;

/// Generates a random 40 character alphanumeric replication id.
pub fn generate_replication_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(REPLICATION_ID_LEN)
        .map(char::from)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    Master,
    Replica(MasterAddr),
}

impl Role {
    /// The name Redis uses for this role in `INFO replication`.
    pub fn as_info_str(&self) -> &'static str {
        match self {
            Role::Master => "master",
            Role::Replica(_) => "slave",
        }
    }
}

/// Progress of a replica's link to its master.
///
/// ```text
/// Disconnected ─> Handshaking ─> ReceivingSnapshot ─> Streaming
///                      │                │                 │
///                      └────────────────┴─────────────────┴──> Failed
/// ```
///
/// `Failed` is terminal; only a restart leaves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Handshaking,
    ReceivingSnapshot,
    Streaming,
    Failed,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Handshaking => "handshaking",
            LinkState::ReceivingSnapshot => "receiving_snapshot",
            LinkState::Streaming => "streaming",
            LinkState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
struct LinkStatus {
    state: LinkState,
    upstream_id: Option<String>,
}

/// Replication state for this node, created once at startup.
#[derive(Debug)]
pub struct ReplicationState {
    role: Role,
    replication_id: String,
    /// Bytes of write stream propagated by this node as master
    master_offset: AtomicU64,
    /// Bytes of the upstream stream applied by this node as replica
    processed_offset: AtomicU64,
    link: RwLock<LinkStatus>,
}

impl ReplicationState {
    pub fn master() -> Self {
        Self::new(Role::Master)
    }

    pub fn replica(master: MasterAddr) -> Self {
        Self::new(Role::Replica(master))
    }

    fn new(role: Role) -> Self {
        Self {
            role,
            replication_id: generate_replication_id(),
            master_offset: AtomicU64::new(0),
            processed_offset: AtomicU64::new(0),
            link: RwLock::new(LinkStatus {
                state: LinkState::Disconnected,
                upstream_id: None,
            }),
        }
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    pub fn is_master(&self) -> bool {
        self.role == Role::Master
    }

    pub fn replication_id(&self) -> &str {
        &self.replication_id
    }

    pub fn master_offset(&self) -> u64 {
        self.master_offset.load(Ordering::Acquire)
    }

    /// Advances the master offset by `bytes`, returning the new offset.
    pub fn advance_master_offset(&self, bytes: usize) -> u64 {
        self.master_offset
            .fetch_add(bytes as u64, Ordering::AcqRel)
            + bytes as u64
    }

    pub fn processed_offset(&self) -> u64 {
        self.processed_offset.load(Ordering::Acquire)
    }

    pub(crate) fn set_processed_offset(&self, offset: u64) {
        self.processed_offset.store(offset, Ordering::Release);
    }

    pub(crate) fn advance_processed_offset(&self, bytes: usize) -> u64 {
        self.processed_offset
            .fetch_add(bytes as u64, Ordering::AcqRel)
            + bytes as u64
    }

    pub fn link_state(&self) -> LinkState {
        self.link
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .state
    }

    pub(crate) fn set_link_state(&self, state: LinkState) {
        self.link
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .state = state;
    }

    /// The master's replication id, once FULLRESYNC has been received.
    pub fn upstream_replication_id(&self) -> Option<String> {
        self.link
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .upstream_id
            .clone()
    }

    pub(crate) fn set_upstream_replication_id(&self, id: String) {
        self.link
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .upstream_id = Some(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replication_id_shape() {
        let id = generate_replication_id();
        assert_eq!(id.len(), REPLICATION_ID_LEN);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(id, generate_replication_id());
    }

    #[test]
    fn test_replication_id_fixed_for_lifetime() {
        let state = ReplicationState::master();
        let id = state.replication_id().to_string();
        state.advance_master_offset(31);
        assert_eq!(state.replication_id(), id);
    }

    #[test]
    fn test_master_offset_is_monotonic() {
        let state = ReplicationState::master();
        assert_eq!(state.master_offset(), 0);
        assert_eq!(state.advance_master_offset(31), 31);
        assert_eq!(state.advance_master_offset(0), 31);
        assert_eq!(state.advance_master_offset(14), 45);
    }

    #[test]
    fn test_replica_starts_disconnected() {
        let state = ReplicationState::replica(MasterAddr {
            host: "localhost".to_string(),
            port: 6379,
        });
        assert!(!state.is_master());
        assert_eq!(state.role().as_info_str(), "slave");
        assert_eq!(state.link_state(), LinkState::Disconnected);
        assert_eq!(state.upstream_replication_id(), None);
    }
}
