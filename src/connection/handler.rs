//! Connection Handler Module
//!
//! This module handles individual client connections to relaykv.
//! Each client gets its own handler task that runs in a loop,
//! reading commands and sending responses.
//!
//! ## Connection Lifecycle
//!
//! ```text
//! 1. Client connects (TCP handshake)
//!        │
//!        ▼
//! 2. ConnectionHandler spawned
//!        │
//!        ▼
//! 3. ┌──────────────────────────────┐
//!    │      Main Loop               │
//!    │                              │
//!    │  Read bytes from socket      │
//!    │  Decode every complete frame │
//!    │  Execute, write each reply   │
//!    │  Flush once per batch        │
//!    │         [Loop back]          │
//!    └──────────────┬───────────────┘
//!                   │ PSYNC
//!                   ▼
//! 4. ┌──────────────────────────────┐
//!    │      Replica Session         │
//!    │                              │
//!    │  +FULLRESYNC, snapshot       │
//!    │  Forward queued writes       │
//!    │  Discard replica input       │
//!    └──────────────────────────────┘
//!        │
//!        ▼
//! 5. Disconnect / error / shutdown: handler task ends
//! ```
//!
//! ## Buffer Management
//!
//! A BytesMut buffer accumulates incoming data. TCP is a stream protocol, so
//! a read may hold a partial frame or several pipelined frames; incomplete
//! bytes stay buffered until the rest arrives.

use crate::commands::{CommandHandler, CommandOutcome, ConnectionContext};
use crate::protocol::{decode_commands, encode_snapshot, ParseError, RespValue};
use crate::replication::FullResync;
use bytes::{Bytes, BytesMut};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, trace, warn};

/// Maximum size of a pending partial frame (1 MiB)
const MAX_BUFFER_SIZE: usize = 1024 * 1024;

/// Initial buffer capacity
const INITIAL_BUFFER_SIZE: usize = 4096;

/// Statistics for connection handling
#[derive(Debug, Default)]
pub struct ConnectionStats {
    /// Total number of connections accepted
    pub connections_accepted: AtomicU64,
    /// Currently active connections
    pub active_connections: AtomicU64,
    /// Total commands processed
    pub commands_processed: AtomicU64,
    /// Total bytes read
    pub bytes_read: AtomicU64,
    /// Total bytes written
    pub bytes_written: AtomicU64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn command_processed(&self) {
        self.commands_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_read(&self, count: usize) {
        self.bytes_read.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn bytes_written(&self, count: usize) {
        self.bytes_written
            .fetch_add(count as u64, Ordering::Relaxed);
    }
}

/// Handles a single client connection.
///
/// Owns the socket, the read buffer and the per-connection
/// [`ConnectionContext`]. After a successful PSYNC the same handler serves
/// the replica session.
pub struct ConnectionHandler {
    stream: BufWriter<TcpStream>,

    buffer: BytesMut,

    /// Peer address and handshake state
    context: ConnectionContext,

    /// The command handler (shared across connections)
    command_handler: CommandHandler,

    /// Connection statistics (shared)
    stats: Arc<ConnectionStats>,

    /// Close the connection after this long without input
    idle_timeout: Option<Duration>,

    shutdown: watch::Receiver<bool>,
}

impl ConnectionHandler {
    pub fn new(
        stream: TcpStream,
        addr: SocketAddr,
        command_handler: CommandHandler,
        stats: Arc<ConnectionStats>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        stats.connection_opened();

        Self {
            stream: BufWriter::new(stream),
            buffer: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
            context: ConnectionContext::new(addr),
            command_handler,
            stats,
            idle_timeout: None,
            shutdown,
        }
    }

    /// Closes the connection when no input arrives for `timeout`.
    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    fn addr(&self) -> SocketAddr {
        self.context.peer
    }

    /// Runs the connection until the client disconnects, an error occurs or
    /// the server shuts down.
    pub async fn run(mut self) -> Result<(), ConnectionError> {
        let addr = self.addr();
        info!(client = %addr, "Client connected");

        let result = self.main_loop().await;

        match &result {
            Ok(()) => info!(client = %addr, "Connection closed"),
            Err(e) => match e {
                ConnectionError::ClientDisconnected => {
                    debug!(client = %addr, "Client disconnected")
                }
                ConnectionError::IoError(io_err)
                    if io_err.kind() == io::ErrorKind::ConnectionReset =>
                {
                    debug!(client = %addr, "Connection reset by client")
                }
                _ => warn!(client = %addr, error = %e, "Connection error"),
            },
        }

        self.stats.connection_closed();
        result
    }

    /// The main read-execute-respond loop.
    async fn main_loop(&mut self) -> Result<(), ConnectionError> {
        loop {
            // Requests ahead of a malformed frame are answered before the
            // protocol error.
            let (commands, parse_error) = decode_commands(&mut self.buffer);

            let mut commands = commands.into_iter();
            while let Some(command) = commands.next() {
                self.stats.command_processed();
                trace!(client = %self.addr(), command = command.name(), "Executing command");

                match self.command_handler.execute(&command, &mut self.context) {
                    CommandOutcome::Reply(reply) => self.write_response(&reply).await?,
                    CommandOutcome::FullResync(resync) => {
                        self.stream.flush().await?;
                        if commands.len() > 0 || parse_error.is_some() {
                            debug!(
                                client = %self.addr(),
                                discarded = commands.len(),
                                "Discarding input pipelined after PSYNC"
                            );
                        }
                        return self.serve_replica(resync).await;
                    }
                }
            }

            if let Some(e) = parse_error {
                warn!(client = %self.addr(), error = %e, "Protocol error");
                let reply = RespValue::error(format!("ERR Protocol error: {}", e));
                self.write_response(&reply).await?;
                self.stream.flush().await?;
                return Err(ConnectionError::ParseError(e));
            }
            self.stream.flush().await?;

            if !self.read_more_data().await? {
                return Ok(());
            }
        }
    }

    /// Reads more data from the socket into the buffer.
    ///
    /// Returns `false` when the server is shutting down.
    async fn read_more_data(&mut self) -> Result<bool, ConnectionError> {
        if self.buffer.len() >= MAX_BUFFER_SIZE {
            error!(
                client = %self.addr(),
                size = self.buffer.len(),
                "Buffer size limit exceeded"
            );
            return Err(ConnectionError::BufferFull);
        }

        if self.buffer.capacity() - self.buffer.len() < 1024 {
            self.buffer.reserve(INITIAL_BUFFER_SIZE);
        }

        let idle_timeout = self.idle_timeout;
        let read = self.stream.get_mut().read_buf(&mut self.buffer);
        let n = tokio::select! {
            result = read_with_timeout(idle_timeout, read) => result?,
            _ = self.shutdown.changed() => {
                debug!(client = %self.context.peer, "Closing connection for shutdown");
                return Ok(false);
            }
        };

        if n == 0 {
            if self.buffer.is_empty() {
                return Err(ConnectionError::ClientDisconnected);
            } else {
                return Err(ConnectionError::UnexpectedEof);
            }
        }

        self.stats.bytes_read(n);
        trace!(client = %self.addr(), bytes = n, "Read data");

        Ok(true)
    }

    /// Buffers a reply; the caller flushes.
    async fn write_response(&mut self, response: &RespValue) -> Result<(), ConnectionError> {
        let bytes = response.serialize();
        self.write_raw(&bytes).await
    }

    async fn write_raw(&mut self, bytes: &[u8]) -> Result<(), ConnectionError> {
        self.stream.write_all(bytes).await?;
        self.stats.bytes_written(bytes.len());
        Ok(())
    }

    /// Serves a replica session until it ends, then unregisters it.
    async fn serve_replica(&mut self, resync: FullResync) -> Result<(), ConnectionError> {
        let FullResync {
            session_id,
            header,
            snapshot,
            mut feed,
        } = resync;

        info!(
            client = %self.addr(),
            session = session_id,
            listening_port = ?self.context.listening_port,
            "Client promoted to replica"
        );

        let result = self.stream_to_replica(&header, &snapshot, &mut feed).await;
        self.command_handler
            .replication()
            .remove_session(session_id);
        result
    }

    async fn stream_to_replica(
        &mut self,
        header: &RespValue,
        snapshot: &Bytes,
        feed: &mut mpsc::Receiver<Bytes>,
    ) -> Result<(), ConnectionError> {
        self.write_response(header).await?;
        self.write_raw(&encode_snapshot(snapshot)).await?;
        self.stream.flush().await?;
        self.buffer.clear();

        loop {
            tokio::select! {
                frame = feed.recv() => {
                    let Some(frame) = frame else {
                        return Err(ConnectionError::ReplicaDropped);
                    };
                    self.write_raw(&frame).await?;
                    while let Ok(frame) = feed.try_recv() {
                        self.write_raw(&frame).await?;
                    }
                    self.stream.flush().await?;
                }
                read = self.stream.get_mut().read_buf(&mut self.buffer) => {
                    let n = read?;
                    if n == 0 {
                        return Err(ConnectionError::ClientDisconnected);
                    }
                    // Acknowledgements are not tracked
                    self.stats.bytes_read(n);
                    self.buffer.clear();
                }
                _ = self.shutdown.changed() => return Ok(()),
            }
        }
    }
}

async fn read_with_timeout<F>(timeout: Option<Duration>, read: F) -> Result<usize, ConnectionError>
where
    F: Future<Output = io::Result<usize>>,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, read)
            .await
            .map_err(|_| ConnectionError::IdleTimeout)?
            .map_err(ConnectionError::from),
        None => Ok(read.await?),
    }
}

/// Errors that can occur while handling a connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// I/O error (network issue)
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    /// Malformed request frame
    #[error("Parse error: {0}")]
    ParseError(#[from] ParseError),

    /// Client disconnected normally
    #[error("Client disconnected")]
    ClientDisconnected,

    /// Unexpected end of stream (partial command)
    #[error("Unexpected end of stream")]
    UnexpectedEof,

    /// Buffer size limit exceeded
    #[error("Buffer size limit exceeded")]
    BufferFull,

    #[error("Idle timeout")]
    IdleTimeout,

    /// The replica fell too far behind and its session was removed
    #[error("Replica session dropped")]
    ReplicaDropped,
}

/// Creates a [`ConnectionHandler`] and runs it to completion.
pub async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    command_handler: CommandHandler,
    stats: Arc<ConnectionStats>,
    idle_timeout: Option<Duration>,
    shutdown: watch::Receiver<bool>,
) {
    let handler = ConnectionHandler::new(stream, addr, command_handler, stats, shutdown)
        .with_idle_timeout(idle_timeout);
    if let Err(e) = handler.run().await {
        match e {
            ConnectionError::ClientDisconnected => {}
            ConnectionError::IoError(ref io_err)
                if io_err.kind() == io::ErrorKind::ConnectionReset => {}
            _ => {
                debug!(client = %addr, error = %e, "Connection ended with error");
            }
        }
    }
}
