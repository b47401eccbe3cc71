//! Active expiry.
//!
//! Reads only drop an expired key when they touch it, so a key written with
//! `PX` and never read again would stay resident. The sweeper is a Tokio task
//! that periodically walks every shard and removes what has lapsed.
//!
//! The interval defaults to one minute. The first sweep happens one full
//! interval after start, not immediately.

use crate::storage::StorageEngine;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, trace};

/// Period between active expiry sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct ExpiryConfig {
    pub interval: Duration,
}

impl Default for ExpiryConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

/// Owns the sweeper task. Dropping it stops the task at its next wakeup.
#[derive(Debug)]
pub struct ExpirySweeper {
    stop_tx: watch::Sender<bool>,
    task: Option<JoinHandle<u64>>,
}

impl ExpirySweeper {
    /// Spawns the sweeper on the current Tokio runtime.
    ///
    /// ```ignore
    /// let engine = Arc::new(StorageEngine::new());
    /// let sweeper = ExpirySweeper::start(Arc::clone(&engine), ExpiryConfig::default());
    /// let removed = sweeper.shutdown().await;
    /// ```
    pub fn start(engine: Arc<StorageEngine>, config: ExpiryConfig) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        info!(
            interval_secs = config.interval.as_secs_f64(),
            "Expiry sweeper started"
        );
        let task = tokio::spawn(run_sweeps(engine, config.interval, stop_rx));
        Self {
            stop_tx,
            task: Some(task),
        }
    }

    /// Stops the task and waits for it. Returns the total number of keys it
    /// removed over its lifetime.
    pub async fn shutdown(mut self) -> u64 {
        self.stop_tx.send_replace(true);
        match self.task.take() {
            Some(task) => task.await.unwrap_or(0),
            None => 0,
        }
    }
}

impl Drop for ExpirySweeper {
    fn drop(&mut self) {
        self.stop_tx.send_replace(true);
    }
}

async fn run_sweeps(
    engine: Arc<StorageEngine>,
    period: Duration,
    mut stop_rx: watch::Receiver<bool>,
) -> u64 {
    let mut ticker = time::interval_at(time::Instant::now() + period, period);
    // A sweep that overruns pushes the schedule back instead of bursting.
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut removed_total = 0u64;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stop_rx.changed() => break,
        }
        if *stop_rx.borrow() {
            break;
        }

        let removed = engine.cleanup_expired();
        removed_total += removed;
        if removed > 0 {
            debug!(removed, remaining = engine.len(), "Active expiry sweep");
        } else {
            trace!("Active expiry sweep removed nothing");
        }
    }

    info!(removed_total, "Expiry sweeper stopped");
    removed_total
}

/// Starts a sweeper with [`DEFAULT_SWEEP_INTERVAL`].
pub fn start_expiry_sweeper(engine: Arc<StorageEngine>) -> ExpirySweeper {
    ExpirySweeper::start(engine, ExpiryConfig::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn fast() -> ExpiryConfig {
        ExpiryConfig {
            interval: Duration::from_millis(20),
        }
    }

    #[tokio::test]
    async fn test_unread_px_keys_are_reclaimed() {
        let engine = Arc::new(StorageEngine::new());
        for n in 0..5 {
            engine.set_with_ttl(
                Bytes::from(format!("session:{}", n)),
                Bytes::from("token"),
                Duration::from_millis(30),
            );
        }
        engine.set(Bytes::from("config"), Bytes::from("on"));

        let sweeper = ExpirySweeper::start(Arc::clone(&engine), fast());
        time::sleep(Duration::from_millis(150)).await;

        assert_eq!(engine.len(), 1);
        assert_eq!(engine.stats().expired, 5);
        assert_eq!(sweeper.shutdown().await, 5);
        assert_eq!(engine.get(&Bytes::from("config")), Some(Bytes::from("on")));
    }

    #[tokio::test]
    async fn test_first_sweep_waits_one_interval() {
        let engine = Arc::new(StorageEngine::new());
        engine.set_with_ttl(
            Bytes::from("k"),
            Bytes::from("v"),
            Duration::from_millis(1),
        );
        time::sleep(Duration::from_millis(5)).await;

        let sweeper = ExpirySweeper::start(
            Arc::clone(&engine),
            ExpiryConfig {
                interval: Duration::from_secs(30),
            },
        );
        time::sleep(Duration::from_millis(20)).await;

        // Lapsed but not yet swept
        assert_eq!(engine.len(), 1);
        assert_eq!(sweeper.shutdown().await, 0);
    }

    #[tokio::test]
    async fn test_dropped_sweeper_leaves_passive_expiry() {
        let engine = Arc::new(StorageEngine::new());
        drop(ExpirySweeper::start(Arc::clone(&engine), fast()));
        time::sleep(Duration::from_millis(10)).await;

        engine.set_with_ttl(
            Bytes::from("k"),
            Bytes::from("v"),
            Duration::from_millis(10),
        );
        time::sleep(Duration::from_millis(80)).await;

        assert_eq!(engine.len(), 1);
        assert_eq!(engine.get(&Bytes::from("k")), None);
        assert_eq!(engine.len(), 0);
    }
}
