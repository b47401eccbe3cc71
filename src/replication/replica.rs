//! Replica-side replication: the link to the master.
//!
//! A replica opens one connection to its master and keeps it for life:
//!
//! ```text
//! replica                                   master
//!   │ PING                                    │
//!   │ ─────────────────────────────────────>  │
//!   │                                  +PONG  │
//!   │ REPLCONF listening-port <port>          │
//!   │ REPLCONF capa psync2                    │
//!   │ ─────────────────────────────────────>  │
//!   │                             +OK / +OK   │
//!   │ PSYNC ? -1                              │
//!   │ ─────────────────────────────────────>  │
//!   │          +FULLRESYNC <replid> <offset>  │
//!   │          $<len>\r\n<snapshot>           │
//!   │          *3\r\n$3\r\nSET... (stream)     │
//!   │ <─────────────────────────────────────  │
//! ```
//!
//! Bytes read past the snapshot stay in the link's buffer and become the
//! start of the write stream. The replica never writes to the link after
//! the handshake.

use crate::commands::CommandHandler;
use crate::config::MasterAddr;
use crate::protocol::{decode_commands, parse_snapshot, RespParser, RespValue};
use crate::replication::{LinkState, ReplicationError, ReplicationManager};
use bytes::{Buf, Bytes, BytesMut};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// How long the master may take to answer a single handshake step.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

const INITIAL_BUFFER_SIZE: usize = 4096;

/// A replica's connection to its master.
pub struct ReplicaLink<S> {
    stream: S,
    buffer: BytesMut,
    parser: RespParser,
    replication: Arc<ReplicationManager>,
}

impl ReplicaLink<TcpStream> {
    /// Opens the TCP connection to the master.
    pub async fn connect(
        master: &MasterAddr,
        replication: Arc<ReplicationManager>,
    ) -> Result<Self, ReplicationError> {
        info!(master = %master, "Connecting to master");
        let stream = TcpStream::connect((master.host.as_str(), master.port))
            .await
            .map_err(|source| ReplicationError::Connect {
                addr: master.to_string(),
                source,
            })?;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream, replication))
    }
}

impl<S> ReplicaLink<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, replication: Arc<ReplicationManager>) -> Self {
        Self {
            stream,
            buffer: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
            parser: RespParser::new(),
            replication,
        }
    }

    /// Performs the handshake and loads the master's snapshot into the store.
    ///
    /// On failure the link state becomes [`LinkState::Failed`].
    pub async fn sync(&mut self, listening_port: u16) -> Result<(), ReplicationError> {
        let result = self.full_sync(listening_port).await;
        if let Err(e) = &result {
            error!(error = %e, "Synchronization with master failed");
            self.replication.state().set_link_state(LinkState::Failed);
        }
        result
    }

    async fn full_sync(&mut self, listening_port: u16) -> Result<(), ReplicationError> {
        let state = Arc::clone(self.replication.state());
        state.set_link_state(LinkState::Handshaking);

        self.handshake_step(vec![Bytes::from_static(b"PING")], "PING", "PONG")
            .await?;
        self.handshake_step(
            vec![
                Bytes::from_static(b"REPLCONF"),
                Bytes::from_static(b"listening-port"),
                Bytes::from(listening_port.to_string()),
            ],
            "REPLCONF listening-port",
            "OK",
        )
        .await?;
        self.handshake_step(
            vec![
                Bytes::from_static(b"REPLCONF"),
                Bytes::from_static(b"capa"),
                Bytes::from_static(b"psync2"),
            ],
            "REPLCONF capa",
            "OK",
        )
        .await?;

        self.send_command(vec![
            Bytes::from_static(b"PSYNC"),
            Bytes::from_static(b"?"),
            Bytes::from_static(b"-1"),
        ])
        .await?;
        let reply = self.read_reply().await?;
        let (replication_id, offset) = parse_fullresync(&reply)?;
        info!(
            master_replid = %replication_id,
            offset = offset,
            "Master accepted full resync"
        );
        state.set_upstream_replication_id(replication_id);
        state.set_processed_offset(offset);

        state.set_link_state(LinkState::ReceivingSnapshot);
        let blob = self.read_snapshot().await?;
        let entries = self.replication.snapshot_format().decode(&blob)?;
        let keys = entries.len();
        self.replication.storage().replace_all(entries);
        info!(
            keys = keys,
            snapshot_bytes = blob.len(),
            "Snapshot loaded from master"
        );

        state.set_link_state(LinkState::Streaming);
        Ok(())
    }

    /// Applies the master's write stream until the link fails or `shutdown`
    /// fires. Never writes to the master.
    pub async fn stream(
        mut self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ReplicationError> {
        let handler = CommandHandler::new(Arc::clone(&self.replication));
        let state = Arc::clone(self.replication.state());
        state.set_link_state(LinkState::Streaming);

        let result = loop {
            let (commands, parse_error) = decode_commands(&mut self.buffer);
            for command in commands {
                handler.apply_replicated(&command);
                let offset = state.advance_processed_offset(command.wire_len());
                debug!(command = command.name(), offset = offset, "Applied replicated command");
            }
            if let Some(e) = parse_error {
                break Err(ReplicationError::from(e));
            }

            tokio::select! {
                read = self.stream.read_buf(&mut self.buffer) => match read {
                    Ok(0) => break Err(ReplicationError::UpstreamClosed),
                    Ok(_) => {}
                    Err(e) => break Err(ReplicationError::from(e)),
                },
                _ = shutdown.changed() => {
                    debug!("Replication stream received shutdown signal");
                    break Ok(());
                }
            }
        };

        if let Err(e) = &result {
            warn!(error = %e, "Replication stream ended");
            state.set_link_state(LinkState::Failed);
        }
        result
    }

    async fn handshake_step(
        &mut self,
        parts: Vec<Bytes>,
        command: &'static str,
        expected: &str,
    ) -> Result<(), ReplicationError> {
        self.send_command(parts).await?;
        let reply = self.read_reply().await?;
        match &reply {
            RespValue::SimpleString(s) if s.eq_ignore_ascii_case(expected) => {
                debug!(command = command, "Handshake step acknowledged");
                Ok(())
            }
            other => Err(ReplicationError::UnexpectedReply {
                command,
                reply: other.to_string(),
            }),
        }
    }

    async fn send_command(&mut self, parts: Vec<Bytes>) -> Result<(), ReplicationError> {
        let frame = RespValue::command(parts).serialize();
        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn read_reply(&mut self) -> Result<RespValue, ReplicationError> {
        loop {
            if let Some((value, consumed)) = self.parser.parse(&self.buffer)? {
                self.buffer.advance(consumed);
                return Ok(value);
            }
            self.fill_buffer().await?;
        }
    }

    async fn read_snapshot(&mut self) -> Result<Bytes, ReplicationError> {
        loop {
            if let Some((blob, consumed)) = parse_snapshot(&self.buffer)? {
                self.buffer.advance(consumed);
                return Ok(blob);
            }
            self.fill_buffer().await?;
        }
    }

    async fn fill_buffer(&mut self) -> Result<(), ReplicationError> {
        let read = self.stream.read_buf(&mut self.buffer);
        let n = tokio::time::timeout(HANDSHAKE_TIMEOUT, read)
            .await
            .map_err(|_| ReplicationError::Timeout)??;
        if n == 0 {
            return Err(ReplicationError::UpstreamClosed);
        }
        Ok(())
    }
}

/// Parses `+FULLRESYNC <replid> <offset>`.
fn parse_fullresync(reply: &RespValue) -> Result<(String, u64), ReplicationError> {
    let bad = || ReplicationError::BadFullResync(reply.to_string());

    let RespValue::SimpleString(line) = reply else {
        return Err(bad());
    };
    let mut fields = line.split_whitespace();
    match (fields.next(), fields.next(), fields.next(), fields.next()) {
        (Some(keyword), Some(id), Some(offset), None)
            if keyword.eq_ignore_ascii_case("FULLRESYNC") =>
        {
            let offset = offset.parse().map_err(|_| bad())?;
            Ok((id.to_string(), offset))
        }
        _ => Err(bad()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::encode_snapshot;
    use crate::replication::ReplicationState;
    use crate::storage::{RespSnapshot, SnapshotEntry, SnapshotFormat, StorageEngine};
    use tokio_test::io::Builder;

    const MASTER_ID: &str = "8371b4fb1155b71f4a04d3e1bc3e18c4a990aeeb";

    fn create_replica() -> Arc<ReplicationManager> {
        let state = ReplicationState::replica(MasterAddr {
            host: "127.0.0.1".to_string(),
            port: 6379,
        });
        Arc::new(ReplicationManager::new(
            Arc::new(state),
            Arc::new(StorageEngine::new()),
        ))
    }

    fn handshake(builder: &mut Builder) -> &mut Builder {
        builder
            .write(b"*1\r\n$4\r\nPING\r\n")
            .read(b"+PONG\r\n")
            .write(b"*3\r\n$8\r\nREPLCONF\r\n$14\r\nlistening-port\r\n$4\r\n6380\r\n")
            .read(b"+OK\r\n")
            .write(b"*3\r\n$8\r\nREPLCONF\r\n$4\r\ncapa\r\n$6\r\npsync2\r\n")
            .read(b"+OK\r\n")
            .write(b"*3\r\n$5\r\nPSYNC\r\n$1\r\n?\r\n$2\r\n-1\r\n")
    }

    fn snapshot_of(entries: &[(&'static str, &'static str)]) -> Vec<u8> {
        let entries: Vec<_> = entries
            .iter()
            .map(|(k, v)| SnapshotEntry {
                key: Bytes::from(*k),
                value: Bytes::from(*v),
                ttl: None,
            })
            .collect();
        encode_snapshot(&RespSnapshot.encode(&entries))
    }

    #[tokio::test]
    async fn test_sync_loads_snapshot() {
        let mut wire = format!("+FULLRESYNC {} 0\r\n", MASTER_ID).into_bytes();
        wire.extend(snapshot_of(&[("x", "9")]));
        let mock = handshake(&mut Builder::new()).read(&wire).build();

        let replication = create_replica();
        let mut link = ReplicaLink::new(mock, Arc::clone(&replication));
        link.sync(6380).await.unwrap();

        let state = replication.state();
        assert_eq!(state.link_state(), LinkState::Streaming);
        assert_eq!(state.upstream_replication_id().as_deref(), Some(MASTER_ID));
        assert_eq!(
            replication.storage().get(&Bytes::from("x")),
            Some(Bytes::from("9"))
        );
    }

    #[tokio::test]
    async fn test_stream_applies_frames_after_snapshot() {
        // The first write arrives in the same read as the snapshot
        let set_foo = b"*3\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$3\r\nbar\r\n";
        let mut wire = format!("+FULLRESYNC {} 100\r\n", MASTER_ID).into_bytes();
        wire.extend(snapshot_of(&[]));
        wire.extend_from_slice(set_foo);

        let ping = b"*1\r\n$4\r\nPING\r\n";
        let set_baz = b"*5\r\n$3\r\nSET\r\n$3\r\nbaz\r\n$3\r\nqux\r\n$2\r\npx\r\n$5\r\n60000\r\n";

        let mock = handshake(&mut Builder::new())
            .read(&wire)
            .read(ping)
            .read(&set_baz[..10])
            .read(&set_baz[10..])
            .build();

        let replication = create_replica();
        let mut link = ReplicaLink::new(mock, Arc::clone(&replication));
        link.sync(6380).await.unwrap();

        let (_tx, shutdown) = watch::channel(false);
        let result = link.stream(shutdown).await;
        assert!(matches!(result, Err(ReplicationError::UpstreamClosed)));

        let storage = replication.storage();
        assert_eq!(storage.get(&Bytes::from("foo")), Some(Bytes::from("bar")));
        let baz = storage.get_entry(&Bytes::from("baz")).unwrap();
        assert_eq!(baz.value, Bytes::from("qux"));
        assert!(baz.ttl().is_some());
        assert!(storage.get_entry(&Bytes::from("foo")).unwrap().seq < baz.seq);

        let state = replication.state();
        assert_eq!(
            state.processed_offset(),
            100 + (set_foo.len() + ping.len() + set_baz.len()) as u64
        );
        assert_eq!(state.link_state(), LinkState::Failed);
    }

    #[tokio::test]
    async fn test_stream_applies_writes_ahead_of_malformed_frame() {
        let set_a = b"*3\r\n$3\r\nSET\r\n$1\r\na\r\n$1\r\n1\r\n";
        let mut wire = format!("+FULLRESYNC {} 0\r\n", MASTER_ID).into_bytes();
        wire.extend(snapshot_of(&[]));

        let mut garbled = set_a.to_vec();
        garbled.extend_from_slice(b"*1\r\n:7\r\n");
        let mock = handshake(&mut Builder::new())
            .read(&wire)
            .read(&garbled)
            .build();

        let replication = create_replica();
        let mut link = ReplicaLink::new(mock, Arc::clone(&replication));
        link.sync(6380).await.unwrap();

        let (_tx, shutdown) = watch::channel(false);
        let result = link.stream(shutdown).await;

        assert!(matches!(result, Err(ReplicationError::Parse(_))));
        assert_eq!(
            replication.storage().get(&Bytes::from("a")),
            Some(Bytes::from("1"))
        );
        let state = replication.state();
        assert_eq!(state.processed_offset(), set_a.len() as u64);
        assert_eq!(state.link_state(), LinkState::Failed);
    }

    #[tokio::test]
    async fn test_unexpected_reply_fails_link() {
        let mock = Builder::new()
            .write(b"*1\r\n$4\r\nPING\r\n")
            .read(b"-NOAUTH Authentication required.\r\n")
            .build();

        let replication = create_replica();
        let mut link = ReplicaLink::new(mock, Arc::clone(&replication));
        let err = link.sync(6380).await.unwrap_err();

        assert!(matches!(
            err,
            ReplicationError::UnexpectedReply { command: "PING", .. }
        ));
        assert_eq!(replication.state().link_state(), LinkState::Failed);
    }

    #[tokio::test]
    async fn test_master_closes_mid_snapshot() {
        let mut wire = format!("+FULLRESYNC {} 0\r\n", MASTER_ID).into_bytes();
        let snapshot = snapshot_of(&[("x", "9")]);
        wire.extend_from_slice(&snapshot[..snapshot.len() - 4]);
        let mock = handshake(&mut Builder::new()).read(&wire).build();

        let replication = create_replica();
        let mut link = ReplicaLink::new(mock, Arc::clone(&replication));
        let err = link.sync(6380).await.unwrap_err();

        assert!(matches!(err, ReplicationError::UpstreamClosed));
        assert!(replication.storage().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_is_rejected() {
        let mut wire = format!("+FULLRESYNC {} 0\r\n", MASTER_ID).into_bytes();
        wire.extend(encode_snapshot(b"REDIS0011"));
        let mock = handshake(&mut Builder::new()).read(&wire).build();

        let replication = create_replica();
        let mut link = ReplicaLink::new(mock, Arc::clone(&replication));
        let err = link.sync(6380).await.unwrap_err();

        assert!(matches!(err, ReplicationError::Snapshot(_)));
        assert_eq!(replication.state().link_state(), LinkState::Failed);
    }

    #[test]
    fn test_parse_fullresync() {
        let reply = RespValue::simple_string(format!("FULLRESYNC {} 42", MASTER_ID));
        assert_eq!(
            parse_fullresync(&reply).unwrap(),
            (MASTER_ID.to_string(), 42)
        );

        for bad in ["CONTINUE", "FULLRESYNC abc", "FULLRESYNC abc x", "FULLRESYNC a 1 2"] {
            assert!(matches!(
                parse_fullresync(&RespValue::simple_string(bad)),
                Err(ReplicationError::BadFullResync(_))
            ));
        }
        assert!(parse_fullresync(&RespValue::bulk_string("FULLRESYNC a 1")).is_err());
    }
}
