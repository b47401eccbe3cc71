//! Thread-Safe Keyspace Store with Expiry Support
//!
//! This module implements the keyspace for relaykv: a concurrent map from
//! key to [`Entry`] with optional absolute expiry.
//!
//! ## Design Decisions
//!
//! 1. **Sharded Locks**: keys are spread over independent `RwLock`s so
//!    unrelated keys do not contend.
//! 2. **Passive + Active Expiry**: reads drop expired entries on access, and
//!    the sweeper removes the rest in per-shard batches.
//! 3. **Whole-Keyspace Views**: `snapshot_all` and `replace_all` lock every
//!    shard at once, so a snapshot is a single point in time and a loaded
//!    snapshot appears atomically.
//! 4. **Write Sequence**: every write stamps its entry with a store-wide
//!    sequence number, making application order observable.
//!
//! Whole-keyspace operations always acquire shard locks in index order.

use crate::storage::snapshot::SnapshotEntry;
use bytes::Bytes;
use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

/// Number of shards for the storage engine.
const NUM_SHARDS: usize = 64;

/// A stored value with optional expiry time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// The stored value
    pub value: Bytes,
    /// When this entry expires (None = never expires)
    pub expires_at: Option<Instant>,
    /// Store-wide write sequence number of the write that produced this entry
    pub seq: u64,
}

impl Entry {
    fn new(value: Bytes, ttl: Option<Duration>, seq: u64) -> Self {
        Self {
            value,
            // A ttl too large to represent never expires in practice.
            expires_at: ttl.and_then(|ttl| Instant::now().checked_add(ttl)),
            seq,
        }
    }

    /// Checks if this entry has expired.
    #[inline]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }

    #[inline]
    fn is_expired_at(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|exp| now >= exp)
    }

    /// Time left before expiry, or None if the entry never expires.
    pub fn ttl(&self) -> Option<Duration> {
        self.expires_at
            .map(|exp| exp.saturating_duration_since(Instant::now()))
    }
}

type ShardMap = HashMap<Bytes, Entry>;

/// A single shard containing a portion of the keyspace.
#[derive(Debug, Default)]
struct Shard {
    data: RwLock<ShardMap>,
}

impl Shard {
    // A panic while holding a shard lock cannot leave an entry half written
    // (inserts and removes are single map operations), so poisoning is ignored.
    fn read(&self) -> RwLockReadGuard<'_, ShardMap> {
        self.data.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, ShardMap> {
        self.data.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The keyspace store.
///
/// Designed to be wrapped in an `Arc` and shared by every connection task,
/// the replication stream and the expiry sweeper. All operations are
/// thread-safe.
///
/// # Example
///
/// ```
/// use relaykv::storage::StorageEngine;
/// use bytes::Bytes;
/// use std::time::Duration;
///
/// let engine = StorageEngine::new();
///
/// engine.set(Bytes::from("replica:count"), Bytes::from("2"));
/// engine.set_with_ttl(Bytes::from("lease"), Bytes::from("n1"), Duration::from_millis(1500));
///
/// let first = engine.get_entry(&Bytes::from("replica:count")).unwrap();
/// let second = engine.get_entry(&Bytes::from("lease")).unwrap();
/// assert!(first.seq < second.seq);
/// assert!(second.ttl().is_some());
/// ```
pub struct StorageEngine {
    shards: Vec<Shard>,

    /// Next write sequence number
    next_seq: AtomicU64,

    /// Statistics: total number of keys (approximate)
    key_count: AtomicU64,

    /// Statistics: total GET operations
    get_count: AtomicU64,

    /// Statistics: total SET operations
    set_count: AtomicU64,

    /// Statistics: total DEL operations
    del_count: AtomicU64,

    /// Statistics: number of expired keys removed (passively or actively)
    expired_count: AtomicU64,
}

impl std::fmt::Debug for StorageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageEngine")
            .field("shards", &self.shards.len())
            .field("key_count", &self.key_count.load(Ordering::Relaxed))
            .field("next_seq", &self.next_seq.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for StorageEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageEngine {
    pub fn new() -> Self {
        let shards = (0..NUM_SHARDS).map(|_| Shard::default()).collect();

        Self {
            shards,
            next_seq: AtomicU64::new(1),
            key_count: AtomicU64::new(0),
            get_count: AtomicU64::new(0),
            set_count: AtomicU64::new(0),
            del_count: AtomicU64::new(0),
            expired_count: AtomicU64::new(0),
        }
    }

    #[inline]
    fn shard_index(&self, key: &[u8]) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % NUM_SHARDS
    }

    #[inline]
    fn get_shard(&self, key: &[u8]) -> &Shard {
        &self.shards[self.shard_index(key)]
    }

    /// Sets a key-value pair without expiry.
    ///
    /// Returns `true` if a new key was created, `false` if an existing key
    /// was overwritten.
    pub fn set(&self, key: Bytes, value: Bytes) -> bool {
        self.set_entry(key, value, None)
    }

    /// Sets a key-value pair that expires after `ttl`.
    pub fn set_with_ttl(&self, key: Bytes, value: Bytes, ttl: Duration) -> bool {
        self.set_entry(key, value, Some(ttl))
    }

    /// Inserts or overwrites an entry; the absolute expiry is now + `ttl`.
    pub fn set_entry(&self, key: Bytes, value: Bytes, ttl: Option<Duration>) -> bool {
        self.set_count.fetch_add(1, Ordering::Relaxed);

        let mut data = self.get_shard(&key).write();
        // Sequence is taken under the shard lock so per-key order matches seq order.
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);

        let is_new = data.insert(key, Entry::new(value, ttl, seq)).is_none();
        if is_new {
            self.key_count.fetch_add(1, Ordering::Relaxed);
        }

        is_new
    }

    /// Gets the value for a key.
    ///
    /// Returns `None` if the key doesn't exist or has expired. An expired
    /// entry found here is removed (passive expiry).
    pub fn get(&self, key: &Bytes) -> Option<Bytes> {
        self.get_count.fetch_add(1, Ordering::Relaxed);
        self.get_entry(key).map(|entry| entry.value)
    }

    /// Gets the full entry for a key, including its expiry and sequence.
    pub fn get_entry(&self, key: &Bytes) -> Option<Entry> {
        let shard = self.get_shard(key);

        {
            let data = shard.read();
            match data.get(key) {
                Some(entry) if !entry.is_expired() => return Some(entry.clone()),
                Some(_) => {}
                None => return None,
            }
        }

        // Expired: upgrade to a write lock and re-check, the key may have
        // been rewritten in between.
        let mut data = shard.write();
        match data.get(key) {
            Some(entry) if entry.is_expired() => {
                data.remove(key);
                self.key_count.fetch_sub(1, Ordering::Relaxed);
                self.expired_count.fetch_add(1, Ordering::Relaxed);
                None
            }
            Some(entry) => Some(entry.clone()),
            None => None,
        }
    }

    /// Deletes a key. Returns `true` if it existed.
    pub fn delete(&self, key: &Bytes) -> bool {
        self.del_count.fetch_add(1, Ordering::Relaxed);

        let mut data = self.get_shard(key).write();
        if data.remove(key).is_some() {
            self.key_count.fetch_sub(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Checks if a key exists and has not expired.
    pub fn exists(&self, key: &Bytes) -> bool {
        self.get_shard(key)
            .read()
            .get(key)
            .is_some_and(|e| !e.is_expired())
    }

    /// Returns every live entry as of a single point in time.
    ///
    /// All shard read locks are held together for the duration of the scan.
    /// Expired entries are skipped; they are left for the sweeper or the next
    /// read to remove.
    pub fn snapshot_all(&self) -> Vec<SnapshotEntry> {
        let guards: Vec<_> = self.shards.iter().map(Shard::read).collect();
        let now = Instant::now();

        guards
            .iter()
            .flat_map(|data| data.iter())
            .filter(|(_, entry)| !entry.is_expired_at(now))
            .map(|(key, entry)| SnapshotEntry {
                key: key.clone(),
                value: entry.value.clone(),
                ttl: entry
                    .expires_at
                    .map(|exp| exp.saturating_duration_since(now)),
            })
            .collect()
    }

    /// Replaces the whole keyspace with `entries`.
    ///
    /// All shard write locks are held together, so readers see either the
    /// old keyspace or the new one. Entries are applied in order, so a later
    /// duplicate key wins.
    pub fn replace_all(&self, entries: Vec<SnapshotEntry>) {
        let mut guards: Vec<_> = self.shards.iter().map(Shard::write).collect();
        for data in guards.iter_mut() {
            data.clear();
        }

        let mut count = 0u64;
        for entry in entries {
            let index = self.shard_index(&entry.key);
            let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
            if guards[index]
                .insert(entry.key, Entry::new(entry.value, entry.ttl, seq))
                .is_none()
            {
                count += 1;
            }
        }

        self.key_count.store(count, Ordering::Relaxed);
    }

    /// Returns the approximate number of keys, including expired keys that
    /// have not been removed yet.
    pub fn len(&self) -> u64 {
        self.key_count.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> StorageStats {
        StorageStats {
            keys: self.key_count.load(Ordering::Relaxed),
            get_ops: self.get_count.load(Ordering::Relaxed),
            set_ops: self.set_count.load(Ordering::Relaxed),
            del_ops: self.del_count.load(Ordering::Relaxed),
            expired: self.expired_count.load(Ordering::Relaxed),
        }
    }

    /// Removes expired keys from every shard (active expiry).
    ///
    /// Each shard is one batch: its write lock is taken, swept and released
    /// before the next shard is touched, so client operations on other
    /// shards are never blocked and a client is held back by at most one
    /// shard's sweep.
    ///
    /// Returns the number of keys removed.
    pub fn cleanup_expired(&self) -> u64 {
        let mut cleaned = 0u64;

        for shard in &self.shards {
            let mut data = shard.write();
            let now = Instant::now();
            let before = data.len();

            data.retain(|_, entry| !entry.is_expired_at(now));

            // Counted while the shard is still locked, so a concurrent
            // replace_all cannot reset key_count in between.
            let removed = (before - data.len()) as u64;
            if removed > 0 {
                self.key_count.fetch_sub(removed, Ordering::Relaxed);
                self.expired_count.fetch_add(removed, Ordering::Relaxed);
            }
            cleaned += removed;
        }

        cleaned
    }
}

/// Store statistics.
#[derive(Debug, Clone, Copy)]
pub struct StorageStats {
    /// Number of keys currently stored
    pub keys: u64,
    /// Total GET operations
    pub get_ops: u64,
    /// Total SET operations
    pub set_ops: u64,
    /// Total DEL operations
    pub del_ops: u64,
    /// Total expired keys removed
    pub expired: u64,
}
