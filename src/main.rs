//! relaykv - A Replicated In-Memory Key-Value Server
//!
//! Entry point: parses flags, sets up logging, synchronizes with the master
//! when running as a replica, then serves clients until Ctrl+C.

use anyhow::Context;
use clap::Parser;
use relaykv::commands::CommandHandler;
use relaykv::config::Config;
use relaykv::replication::{ReplicaLink, ReplicationManager, ReplicationState};
use relaykv::server::Server;
use relaykv::storage::{ExpiryConfig, ExpirySweeper, StorageEngine};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

fn print_banner(config: &Config) {
    let role = match &config.replicaof {
        Some(master) => format!("replica of {}", master),
        None => "master".to_string(),
    };
    println!(
        r#"
relaykv v{} - Replicated In-Memory Key-Value Server
──────────────────────────────────────────────────────
Listening on {} ({})

Use Ctrl+C to shutdown gracefully.
"#,
        relaykv::VERSION,
        config.bind_address(),
        role
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    // RUST_LOG overrides the default level
    FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    let storage = Arc::new(StorageEngine::new());
    let state = Arc::new(match &config.replicaof {
        Some(master) => ReplicationState::replica(master.clone()),
        None => ReplicationState::master(),
    });
    info!(
        role = state.role().as_info_str(),
        replid = state.replication_id(),
        "Replication state initialized"
    );
    let replication = Arc::new(
        ReplicationManager::new(state, Arc::clone(&storage))
            .with_queue_capacity(config.replica_queue_capacity),
    );

    let listener = TcpListener::bind(config.bind_address())
        .await
        .with_context(|| format!("failed to bind {}", config.bind_address()))?;
    info!("Listening on {}", config.bind_address());

    let sweeper = ExpirySweeper::start(
        Arc::clone(&storage),
        ExpiryConfig {
            interval: config.expiry_interval(),
        },
    );

    let server = Server::new(CommandHandler::new(Arc::clone(&replication)))
        .with_idle_timeout(config.idle_timeout());

    let upstream = match &config.replicaof {
        Some(master) => {
            let mut link = ReplicaLink::connect(master, Arc::clone(&replication))
                .await
                .with_context(|| format!("failed to reach master {}", master))?;
            link.sync(config.port)
                .await
                .with_context(|| format!("full resync with master {} failed", master))?;

            let shutdown = server.subscribe_shutdown();
            Some(tokio::spawn(async move {
                if let Err(e) = link.stream(shutdown).await {
                    error!(error = %e, "Replication link lost");
                }
            }))
        }
        None => None,
    };

    print_banner(&config);

    server.run(listener, shutdown_signal()).await;

    if let Some(upstream) = upstream {
        if let Err(e) = upstream.await {
            error!(error = %e, "Replication task failed");
        }
    }

    let expired = sweeper.shutdown().await;
    info!(expired, "Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    match signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received, stopping server..."),
        Err(e) => error!(error = %e, "Failed to listen for Ctrl+C, stopping server"),
    }
}
