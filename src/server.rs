//! TCP accept loop and connection task lifecycle.

use crate::commands::CommandHandler;
use crate::connection::{handle_connection, ConnectionStats};
use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Accepts clients and runs one task per connection.
pub struct Server {
    handler: CommandHandler,
    stats: Arc<ConnectionStats>,
    idle_timeout: Option<Duration>,
    shutdown_tx: watch::Sender<bool>,
}

impl Server {
    pub fn new(handler: CommandHandler) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            handler,
            stats: Arc::new(ConnectionStats::new()),
            idle_timeout: None,
            shutdown_tx,
        }
    }

    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn stats(&self) -> &Arc<ConnectionStats> {
        &self.stats
    }

    /// A receiver that fires when the server begins shutting down.
    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Serves `listener` until `shutdown` completes, then closes every
    /// connection and waits for their tasks to finish.
    pub async fn run<F>(&self, listener: TcpListener, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            warn!(client = %addr, error = %e, "Failed to set TCP_NODELAY");
                        }
                        connections.spawn(handle_connection(
                            stream,
                            addr,
                            self.handler.clone(),
                            Arc::clone(&self.stats),
                            self.idle_timeout,
                            self.subscribe_shutdown(),
                        ));
                    }
                    Err(e) => error!(error = %e, "Failed to accept connection"),
                },
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Connection task failed");
                    }
                }
                _ = &mut shutdown => break,
            }
        }

        info!(
            active = self.stats.active_connections.load(Ordering::Relaxed),
            "Shutting down, closing connections"
        );
        self.shutdown_tx.send_replace(true);

        while let Some(joined) = connections.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Connection task failed");
            }
        }

        info!(
            connections = self.stats.connections_accepted.load(Ordering::Relaxed),
            commands = self.stats.commands_processed.load(Ordering::Relaxed),
            "Server stopped"
        );
    }
}
