// src/core/sentinel/mod.rs

//! JasperDB's high-availability coordinator, the Sentinel.
//!
//! Sentinel runs as a separate process mode (`--sentinel`) and is responsible
//! for:
//! - Monitoring the health of the configured primary and its replicas.
//! - Detecting when the primary is down (subjective down and, via the voting
//!   protocol, objective down).
//! - Electing a leader among peer sentinels with epoch-scoped voting.
//! - Promoting the best replica and reconfiguring the rest on failover.
//! - Serving the `SENTINEL` command family to clients and peers.

use anyhow::{Result, anyhow};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{error, info};

pub mod client;
pub mod config;
pub mod election;
pub mod failover;
pub mod listener;
pub mod monitor;
pub mod peers;
pub mod state;

pub use config::SentinelConfig;
pub use state::{MasterChange, MasterChangeCallback, SentinelState};

use self::listener::run_listener;
use self::monitor::SentinelMonitor;

/// The main entry point for running JasperDB in sentinel mode.
pub async fn run(config: SentinelConfig, on_master_change: Option<MasterChangeCallback>) -> Result<()> {
    config.validate()?;
    info!(
        "Sentinel {} starting; monitoring master '{}' at {}:{} (quorum {}, {} peer(s)).",
        config.my_id(),
        config.master_name,
        config.master_host,
        config.master_port,
        config.quorum,
        config.sentinel_addrs.len(),
    );

    let state = SentinelState::new(config, on_master_change);
    let (shutdown_tx, _) = broadcast::channel::<()>(8);

    let mut tasks: JoinSet<()> = JoinSet::new();

    // The peer server other sentinels and clients query.
    let listener_state = state.clone();
    let listener_shutdown = shutdown_tx.clone();
    tasks.spawn(async move {
        if let Err(e) = run_listener(listener_state, listener_shutdown).await {
            error!("Sentinel listener failed: {}", e);
        }
    });

    // Outbound supervised links to every configured peer.
    peers::spawn_peer_supervisors(&state, &shutdown_tx, &mut tasks);

    // Probes, replica discovery, and the election timer.
    let monitor = SentinelMonitor::new(state.clone());
    let monitor_shutdown = shutdown_tx.clone();
    tasks.spawn(async move {
        monitor.run(&monitor_shutdown).await;
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received; stopping sentinel.");
            let _ = shutdown_tx.send(());
            // Grace window for tasks to observe the signal; stragglers are detached.
            let _ = tokio::time::timeout(
                std::time::Duration::from_secs(5),
                async { while tasks.join_next().await.is_some() {} },
            )
            .await;
            Ok(())
        }
        joined = tasks.join_next() => {
            // Long-lived tasks only return on failure.
            Err(anyhow!("a sentinel task terminated unexpectedly: {joined:?}"))
        }
    }
}
