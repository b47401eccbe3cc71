//! # relaykv - A Replicated In-Memory Key-Value Server
//!
//! relaykv speaks the Redis protocol (RESP2). A master accepts writes and
//! streams them to replicas, which keep an eventually-consistent copy of the
//! keyspace.
//!
//! ## Features
//!
//! - **Redis-Compatible**: RESP framing, works with `redis-cli`
//! - **Replication**: PSYNC handshake, snapshot transfer, ordered write stream
//! - **TTL Support**: Keys can expire, with passive and active expiry
//! - **Async I/O**: Built on Tokio, one task per connection
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              relaykv                                    │
//! │                                                                         │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐                  │
//! │  │   Server    │───>│ Connection  │───>│  Command    │                  │
//! │  │ (JoinSet)   │    │  Handler    │    │  Handler    │                  │
//! │  └─────────────┘    └──────┬──────┘    └──────┬──────┘                  │
//! │                            │ PSYNC            │                         │
//! │                            ▼                  ▼                         │
//! │                     ┌──────────────────────────────────┐                │
//! │                     │        ReplicationManager        │ ──> replicas   │
//! │                     └────────────────┬─────────────────┘                │
//! │                                      ▼                                  │
//! │  ┌─────────────┐    ┌──────────────────────────────────────────────┐   │
//! │  │ ReplicaLink │───>│              StorageEngine                   │   │
//! │  │ (replicas)  │    │  ┌────────┐ ┌────────┐ ┌────────┐ ┌────────┐ │   │
//! │  └─────────────┘    │  │Shard 0 │ │Shard 1 │ │Shard 2 │ │...N    │ │   │
//! │                     │  └────────┘ └────────┘ └────────┘ └────────┘ │   │
//! │                     └──────────────────────────────────────────────┘   │
//! │                                               ▲                         │
//! │                     ┌─────────────────────────┴───────────────────────┐ │
//! │                     │           ExpirySweeper                         │ │
//! │                     │      (Background Tokio Task)                    │ │
//! │                     └─────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use relaykv::commands::CommandHandler;
//! use relaykv::replication::{ReplicationManager, ReplicationState};
//! use relaykv::server::Server;
//! use relaykv::storage::{start_expiry_sweeper, StorageEngine};
//! use std::sync::Arc;
//! use tokio::net::TcpListener;
//!
//! #[tokio::main]
//! async fn main() {
//!     let storage = Arc::new(StorageEngine::new());
//!     let _sweeper = start_expiry_sweeper(Arc::clone(&storage));
//!
//!     let state = Arc::new(ReplicationState::master());
//!     let replication = Arc::new(ReplicationManager::new(state, storage));
//!     let server = Server::new(CommandHandler::new(replication));
//!
//!     let listener = TcpListener::bind("127.0.0.1:6379").await.unwrap();
//!     server.run(listener, async { tokio::signal::ctrl_c().await.unwrap() }).await;
//! }
//! ```
//!
//! ## Module Overview
//!
//! - [`protocol`]: RESP types, request decoding, snapshot framing
//! - [`storage`]: Thread-safe keyspace with TTL support, snapshots, sweeper
//! - [`commands`]: Command dispatch
//! - [`replication`]: Master sessions and the replica link
//! - [`connection`]: Client connection management
//! - [`server`]: Accept loop and graceful shutdown
//! - [`config`]: Command-line flags

pub mod commands;
pub mod config;
pub mod connection;
pub mod protocol;
pub mod replication;
pub mod server;
pub mod storage;

// Re-export commonly used types for convenience
pub use commands::CommandHandler;
pub use config::Config;
pub use connection::{handle_connection, ConnectionStats};
pub use protocol::{ParseError, RespParser, RespValue};
pub use replication::{ReplicaLink, ReplicationError, ReplicationManager, ReplicationState};
pub use server::Server;
pub use storage::{start_expiry_sweeper, ExpiryConfig, ExpirySweeper, StorageEngine};

/// The default port relaykv listens on (same as Redis)
pub const DEFAULT_PORT: u16 = 6379;

/// The default host relaykv binds to
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Version of relaykv
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
