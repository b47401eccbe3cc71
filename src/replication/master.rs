//! Master-side replication: replica sessions and ordered write propagation.
//!
//! Every write accepted by a master goes through
//! [`ReplicationManager::commit_write`]. It holds the sessions lock while it
//! applies the write to the store and enqueues the encoded frame to each
//! session, so every replica sees writes in exactly the order the store
//! applied them. [`ReplicationManager::begin_full_resync`] takes the
//! snapshot and registers the new session under the same lock: a write is
//! either in the snapshot or in the session's queue, never both and never
//! neither.
//!
//! Queues are bounded. A replica that cannot keep up is dropped instead of
//! stalling client writers.

use crate::protocol::RespValue;
use crate::replication::{ReplicationError, ReplicationState};
use crate::storage::{RespSnapshot, SnapshotFormat, StorageEngine};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

/// Default number of frames a replica may have queued before it is dropped.
pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

/// A replica registered on this master.
#[derive(Debug)]
struct ReplicaSession {
    peer: SocketAddr,
    listening_port: Option<u16>,
    sender: mpsc::Sender<Bytes>,
}

/// A read-only view of a replica session, for `INFO replication`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaInfo {
    pub id: u64,
    pub peer: SocketAddr,
    pub listening_port: Option<u16>,
}

/// Everything a connection needs to turn itself into a replica session.
#[derive(Debug)]
pub struct FullResync {
    pub session_id: u64,
    /// `+FULLRESYNC <replid> <offset>`
    pub header: RespValue,
    /// Encoded snapshot, to be sent with `encode_snapshot`
    pub snapshot: Bytes,
    /// Frames committed after the snapshot, in commit order
    pub feed: mpsc::Receiver<Bytes>,
}

#[derive(Debug, Default)]
struct Sessions {
    next_id: u64,
    active: BTreeMap<u64, ReplicaSession>,
}

/// Owns the replica sessions of this node and the write serialization point.
pub struct ReplicationManager {
    state: Arc<ReplicationState>,
    storage: Arc<StorageEngine>,
    format: Arc<dyn SnapshotFormat>,
    queue_capacity: usize,
    sessions: Mutex<Sessions>,
}

impl ReplicationManager {
    pub fn new(state: Arc<ReplicationState>, storage: Arc<StorageEngine>) -> Self {
        Self {
            state,
            storage,
            format: Arc::new(RespSnapshot),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            sessions: Mutex::new(Sessions::default()),
        }
    }

    /// Replaces the snapshot format used for full resyncs.
    pub fn with_snapshot_format(mut self, format: Arc<dyn SnapshotFormat>) -> Self {
        self.format = format;
        self
    }

    /// Sets the per-session queue capacity (at least 1).
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    pub fn state(&self) -> &Arc<ReplicationState> {
        &self.state
    }

    pub fn storage(&self) -> &Arc<StorageEngine> {
        &self.storage
    }

    pub fn snapshot_format(&self) -> &Arc<dyn SnapshotFormat> {
        &self.format
    }

    fn lock_sessions(&self) -> MutexGuard<'_, Sessions> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies a client write and propagates `frame` to every replica.
    ///
    /// On a replica node the write is applied locally and nothing is
    /// propagated.
    pub fn commit_write<F, R>(&self, frame: &RespValue, apply: F) -> R
    where
        F: FnOnce(&StorageEngine) -> R,
    {
        if !self.state.is_master() {
            return apply(&self.storage);
        }

        let mut sessions = self.lock_sessions();
        let result = apply(&self.storage);

        let frame = Bytes::from(frame.serialize());
        let offset = self.state.advance_master_offset(frame.len());

        let mut dropped = Vec::new();
        for (id, session) in sessions.active.iter() {
            match session.sender.try_send(frame.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(
                        session = id,
                        peer = %session.peer,
                        capacity = self.queue_capacity,
                        "Replica queue full, dropping replica"
                    );
                    dropped.push(*id);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(session = id, peer = %session.peer, "Replica session closed");
                    dropped.push(*id);
                }
            }
        }
        for id in dropped {
            sessions.active.remove(&id);
        }

        debug!(offset = offset, replicas = sessions.active.len(), "Write propagated");
        result
    }

    /// Registers a new replica session and captures the snapshot it starts from.
    pub fn begin_full_resync(
        &self,
        peer: SocketAddr,
        listening_port: Option<u16>,
    ) -> Result<FullResync, ReplicationError> {
        if !self.state.is_master() {
            return Err(ReplicationError::NotMaster);
        }

        let (sender, feed) = mpsc::channel(self.queue_capacity);

        let (session_id, offset, entries) = {
            let mut sessions = self.lock_sessions();
            let entries = self.storage.snapshot_all();
            let offset = self.state.master_offset();

            let session_id = sessions.next_id;
            sessions.next_id += 1;
            sessions.active.insert(
                session_id,
                ReplicaSession {
                    peer,
                    listening_port,
                    sender,
                },
            );
            (session_id, offset, entries)
        };

        let snapshot = self.format.encode(&entries);
        info!(
            session = session_id,
            peer = %peer,
            keys = entries.len(),
            snapshot_bytes = snapshot.len(),
            offset = offset,
            "Full resync started"
        );

        Ok(FullResync {
            session_id,
            header: RespValue::simple_string(format!(
                "FULLRESYNC {} {}",
                self.state.replication_id(),
                offset
            )),
            snapshot,
            feed,
        })
    }

    /// Removes a session. Removing an unknown id is a no-op.
    pub fn remove_session(&self, id: u64) {
        if let Some(session) = self.lock_sessions().active.remove(&id) {
            info!(session = id, peer = %session.peer, "Replica session removed");
        }
    }

    pub fn session_count(&self) -> usize {
        self.lock_sessions().active.len()
    }

    /// Live sessions, ordered by registration.
    pub fn sessions(&self) -> Vec<ReplicaInfo> {
        self.lock_sessions()
            .active
            .iter()
            .map(|(id, session)| ReplicaInfo {
                id: *id,
                peer: session.peer,
                listening_port: session.listening_port,
            })
            .collect()
    }
}

impl std::fmt::Debug for ReplicationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationManager")
            .field("state", &self.state)
            .field("queue_capacity", &self.queue_capacity)
            .field("sessions", &self.session_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MasterAddr;
    use crate::protocol::parse_request;
    use crate::storage::{SnapshotEntry, SnapshotError};

    /// `key=value` lines, keys without expiry only.
    struct LineSnapshot;

    impl SnapshotFormat for LineSnapshot {
        fn encode(&self, entries: &[SnapshotEntry]) -> Bytes {
            let mut out = Vec::new();
            for entry in entries {
                out.extend_from_slice(&entry.key);
                out.push(b'=');
                out.extend_from_slice(&entry.value);
                out.push(b'\n');
            }
            Bytes::from(out)
        }

        fn decode(&self, blob: &[u8]) -> Result<Vec<SnapshotEntry>, SnapshotError> {
            blob.split(|&b| b == b'\n')
                .filter(|line| !line.is_empty())
                .map(|line| {
                    let eq = line
                        .iter()
                        .position(|&b| b == b'=')
                        .ok_or_else(|| SnapshotError::Malformed("missing '='".to_string()))?;
                    Ok(SnapshotEntry {
                        key: Bytes::copy_from_slice(&line[..eq]),
                        value: Bytes::copy_from_slice(&line[eq + 1..]),
                        ttl: None,
                    })
                })
                .collect()
        }
    }

    fn create_master() -> ReplicationManager {
        ReplicationManager::new(
            Arc::new(ReplicationState::master()),
            Arc::new(StorageEngine::new()),
        )
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    fn set_frame(key: &str, value: &str) -> RespValue {
        RespValue::command(["SET".to_string(), key.to_string(), value.to_string()])
    }

    fn commit_set(manager: &ReplicationManager, key: &str, value: &str) {
        manager.commit_write(&set_frame(key, value), |store| {
            store.set(Bytes::from(key.to_string()), Bytes::from(value.to_string()))
        });
    }

    #[test]
    fn test_commit_advances_offset_without_replicas() {
        let manager = create_master();
        commit_set(&manager, "foo", "bar");

        let expected = set_frame("foo", "bar").serialize().len() as u64;
        assert_eq!(manager.state().master_offset(), expected);
        assert_eq!(manager.storage().get(&Bytes::from("foo")), Some(Bytes::from("bar")));
    }

    #[test]
    fn test_full_resync_header_and_snapshot() {
        let manager = create_master();
        commit_set(&manager, "x", "9");
        let offset = manager.state().master_offset();

        let resync = manager.begin_full_resync(peer(), Some(6380)).unwrap();
        assert_eq!(
            resync.header,
            RespValue::simple_string(format!(
                "FULLRESYNC {} {}",
                manager.state().replication_id(),
                offset
            ))
        );
        assert_eq!(
            RespSnapshot.decode(&resync.snapshot).unwrap(),
            vec![SnapshotEntry {
                key: Bytes::from("x"),
                value: Bytes::from("9"),
                ttl: None,
            }]
        );
        assert_eq!(manager.session_count(), 1);
        assert_eq!(
            manager.sessions(),
            vec![ReplicaInfo {
                id: resync.session_id,
                peer: peer(),
                listening_port: Some(6380),
            }]
        );
    }

    #[test]
    fn test_full_resync_uses_configured_snapshot_format() {
        let master = create_master().with_snapshot_format(Arc::new(LineSnapshot));
        commit_set(&master, "alpha", "1");
        commit_set(&master, "beta", "2");

        let resync = master.begin_full_resync(peer(), None).unwrap();
        let mut lines: Vec<&[u8]> = resync.snapshot.split(|&b| b == b'\n').collect();
        lines.sort();
        assert_eq!(lines, vec![&b""[..], &b"alpha=1"[..], &b"beta=2"[..]]);
        assert_eq!(
            RespSnapshot.decode(&resync.snapshot),
            Err(SnapshotError::BadMagic)
        );

        let replica = ReplicationManager::new(
            Arc::new(ReplicationState::replica(MasterAddr {
                host: "127.0.0.1".to_string(),
                port: 6379,
            })),
            Arc::new(StorageEngine::new()),
        )
        .with_snapshot_format(Arc::new(LineSnapshot));
        let entries = replica.snapshot_format().decode(&resync.snapshot).unwrap();
        replica.storage().replace_all(entries);

        assert_eq!(replica.storage().len(), 2);
        assert_eq!(
            replica.storage().get(&Bytes::from("beta")),
            Some(Bytes::from("2"))
        );
    }

    #[test]
    fn test_writes_after_resync_are_queued_in_order() {
        let manager = create_master();
        commit_set(&manager, "before", "1");

        let mut resync = manager.begin_full_resync(peer(), None).unwrap();
        for i in 0..5 {
            commit_set(&manager, &format!("k{}", i), &i.to_string());
        }

        // The pre-resync write is only in the snapshot
        let snapshot = RespSnapshot.decode(&resync.snapshot).unwrap();
        assert_eq!(snapshot.len(), 1);

        for i in 0..5 {
            let frame = resync.feed.try_recv().unwrap();
            let (parts, consumed) = parse_request(&frame).unwrap().unwrap();
            assert_eq!(consumed, frame.len());
            assert_eq!(parts[1], Bytes::from(format!("k{}", i)));
        }
        assert!(resync.feed.try_recv().is_err());
    }

    #[test]
    fn test_slow_replica_dropped_on_overflow() {
        let manager = create_master().with_queue_capacity(2);
        let _slow = manager.begin_full_resync(peer(), None).unwrap();
        let mut fast = manager.begin_full_resync(peer(), None).unwrap();
        assert_eq!(manager.session_count(), 2);

        commit_set(&manager, "a", "1");
        commit_set(&manager, "b", "2");
        fast.feed.try_recv().unwrap();
        fast.feed.try_recv().unwrap();

        // Third write overflows the session nobody is draining
        commit_set(&manager, "c", "3");
        assert_eq!(manager.session_count(), 1);
        assert_eq!(manager.sessions()[0].id, fast.session_id);

        // Writers were never blocked
        assert_eq!(manager.storage().len(), 3);
        assert!(fast.feed.try_recv().is_ok());
    }

    #[test]
    fn test_closed_session_is_pruned() {
        let manager = create_master();
        let resync = manager.begin_full_resync(peer(), None).unwrap();
        drop(resync);

        commit_set(&manager, "a", "1");
        assert_eq!(manager.session_count(), 0);
    }

    #[test]
    fn test_remove_session_is_idempotent() {
        let manager = create_master();
        let resync = manager.begin_full_resync(peer(), None).unwrap();
        manager.remove_session(resync.session_id);
        manager.remove_session(resync.session_id);
        assert_eq!(manager.session_count(), 0);
    }

    #[test]
    fn test_replica_node_does_not_propagate() {
        let state = Arc::new(ReplicationState::replica(MasterAddr {
            host: "localhost".to_string(),
            port: 6379,
        }));
        let manager = ReplicationManager::new(state, Arc::new(StorageEngine::new()));

        commit_set(&manager, "a", "1");
        assert_eq!(manager.state().master_offset(), 0);
        assert_eq!(manager.storage().len(), 1);
        assert!(matches!(
            manager.begin_full_resync(peer(), None),
            Err(ReplicationError::NotMaster)
        ));
    }

    #[test]
    fn test_concurrent_writers_preserve_store_order() {
        let manager = Arc::new(create_master());
        let mut resync = manager.begin_full_resync(peer(), None).unwrap();

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let manager = Arc::clone(&manager);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        commit_set(&manager, &format!("t{}-{}", t, i % 10), &i.to_string());
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        // Replaying the queue yields the same final value for every key
        let mut replayed = std::collections::HashMap::new();
        while let Ok(frame) = resync.feed.try_recv() {
            let (parts, _) = parse_request(&frame).unwrap().unwrap();
            replayed.insert(parts[1].clone(), parts[2].clone());
        }
        assert_eq!(replayed.len(), 40);
        for (key, value) in replayed {
            assert_eq!(manager.storage().get(&key), Some(value));
        }
    }
}
