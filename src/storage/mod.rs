//! Storage Engine Module
//!
//! The keyspace, its snapshot format and the background expiry sweeper.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     StorageEngine                           │
//! │  ┌─────────┐ ┌─────────┐ ┌─────────┐ ┌─────────┐           │
//! │  │ Shard 0 │ │ Shard 1 │ │ Shard 2 │ │...64    │           │
//! │  │ RwLock  │ │ RwLock  │ │ RwLock  │ │ shards  │           │
//! │  └─────────┘ └─────────┘ └─────────┘ └─────────┘           │
//! └─────────────────────────────────────────────────────────────┘
//!        ▲                    │ snapshot_all / replace_all
//!        │                    ▼
//!  ┌─────┴─────────────┐   ┌──────────────────┐
//!  │  ExpirySweeper    │   │  SnapshotFormat  │
//!  │ (Tokio task)      │   │  (RespSnapshot)  │
//!  └───────────────────┘   └──────────────────┘
//! ```
//!
//! ## Example
//!
//! ```
//! use relaykv::storage::{RespSnapshot, SnapshotFormat, StorageEngine};
//! use bytes::Bytes;
//!
//! let master = StorageEngine::new();
//! master.set(Bytes::from("x"), Bytes::from("9"));
//!
//! let blob = RespSnapshot.encode(&master.snapshot_all());
//!
//! let replica = StorageEngine::new();
//! replica.replace_all(RespSnapshot.decode(&blob).unwrap());
//! assert_eq!(replica.get(&Bytes::from("x")), Some(Bytes::from("9")));
//! ```

pub mod engine;
pub mod expiry;
pub mod snapshot;

pub use engine::{Entry, StorageEngine, StorageStats};
pub use expiry::{start_expiry_sweeper, ExpiryConfig, ExpirySweeper, DEFAULT_SWEEP_INTERVAL};
pub use snapshot::{RespSnapshot, SnapshotEntry, SnapshotError, SnapshotFormat};
