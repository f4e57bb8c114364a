// src/server/mod.rs

//! The data-server shell: startup, persistence recovery, background tasks,
//! and the connection accept loop.

use crate::config::Config;
use crate::connection::ConnectionHandler;
use crate::core::JasperError;
use crate::core::cluster::{ClusterState, Node, NodeFlags};
use crate::core::commands::dispatch;
use crate::core::persistence::{AofWriterTask, snapshot};
use crate::core::replication::spawn_replication;
use crate::core::state::{ServerState, generate_run_id};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// How long shutdown waits for tasks to observe the stop signal before
/// detaching them.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// The main server startup function, orchestrating all setup phases.
pub async fn run(config: Config) -> Result<()> {
    let run_id = generate_run_id();
    info!("JasperDB starting with run id {}", run_id);

    let cluster = build_cluster_state(&config, &run_id)?;

    // The AOF writer is created before the state so the dispatch path holds
    // its handle from the start.
    let (aof_task, aof_handle) = if config.persistence.aof_enabled {
        let (task, handle) =
            AofWriterTask::open(&config.persistence.aof_path, config.persistence.appendfsync)
                .await
                .context("cannot open append-only log")?;
        (Some(task), Some(handle))
    } else {
        (None, None)
    };

    let state = ServerState::new(config, aof_handle, cluster, run_id);

    recover_dataset(&state).await?;

    let mut tasks: JoinSet<()> = JoinSet::new();

    if let Some(aof_task) = aof_task {
        let shutdown_rx = state.shutdown_tx.subscribe();
        tasks.spawn(async move {
            aof_task.run(shutdown_rx).await;
        });
    }

    spawn_replication(&state, &mut tasks);
    spawn_snapshot_task(&state, &mut tasks);

    let bind_addr = format!("{}:{}", state.config.host, state.config.port);
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("cannot bind {bind_addr}"))?;
    info!("Listening for clients on {}", bind_addr);

    let accept_state = state.clone();
    let mut accept_shutdown = state.shutdown_tx.subscribe();
    tasks.spawn(async move {
        loop {
            tokio::select! {
                _ = accept_shutdown.recv() => return,
                accepted = listener.accept() => {
                    let (socket, addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!("Failed to accept connection: {}", e);
                            continue;
                        }
                    };
                    let current = accept_state.client_count.load(Ordering::SeqCst);
                    if current >= accept_state.config.max_clients {
                        warn!("Rejecting connection from {}: max clients reached.", addr);
                        drop(socket);
                        continue;
                    }
                    accept_state.client_count.fetch_add(1, Ordering::SeqCst);
                    let conn_state = accept_state.clone();
                    tokio::spawn(async move {
                        ConnectionHandler::new(conn_state.clone(), addr, socket).run().await;
                        conn_state.client_count.fetch_sub(1, Ordering::SeqCst);
                    });
                }
            }
        }
    });

    // Run until a shutdown signal, then grant the grace window.
    tokio::signal::ctrl_c().await.ok();
    info!("Shutdown signal received; stopping server.");
    let _ = state.shutdown_tx.send(());
    let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
        while tasks.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!("Grace window elapsed; detaching remaining tasks.");
    }
    info!("Server stopped.");
    Ok(())
}

/// Builds the cluster topology from static configuration, or `None` when
/// cluster mode is off.
fn build_cluster_state(config: &Config, run_id: &str) -> Result<Option<Arc<ClusterState>>> {
    if !config.cluster.enabled {
        return Ok(None);
    }
    let cluster = ClusterState::new(true, run_id.to_string());

    let own_slots = config.cluster.parse_own_slots()?;
    cluster.add_node(Node {
        id: run_id.to_string(),
        address: config.host.clone(),
        port: config.port,
        slots: own_slots,
        flags: NodeFlags::MYSELF | NodeFlags::MASTER,
    });

    for node in &config.cluster.nodes {
        cluster.add_node(Node {
            id: node.id.clone(),
            address: node.address.clone(),
            port: node.port,
            slots: crate::config::parse_slot_spec(&node.slots)?,
            flags: NodeFlags::MASTER,
        });
    }

    info!(
        "Cluster mode enabled: {}/{} slots assigned across {} node(s).",
        cluster.assigned_slots(),
        crate::core::cluster::NUM_SLOTS,
        cluster.nodes.len()
    );
    Ok(Some(Arc::new(cluster)))
}

/// Restores the dataset at startup. With the AOF enabled the journal is the
/// authority and is replayed through the normal dispatch; otherwise the
/// snapshot is loaded, and a corrupt snapshot degrades to an empty start
/// rather than a crash.
async fn recover_dataset(state: &Arc<ServerState>) -> Result<()> {
    if state.config.persistence.aof_enabled {
        let path = state.config.persistence.aof_path.clone();
        let replay_state = state.clone();
        crate::core::persistence::aof::replay(&path, async |args| {
            dispatch::execute_parsed(&replay_state, &args).map(|_| ())
        })
        .await?;
        return Ok(());
    }

    match snapshot::load(&state.config.persistence.snapshot_path, &state.db).await {
        Ok(_) => Ok(()),
        Err(JasperError::SnapshotCorrupt(reason)) => {
            error!(
                "Snapshot {} is corrupt ({}); starting with an empty dataset.",
                state.config.persistence.snapshot_path, reason
            );
            state.db.clear();
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Periodically snapshots the store. Disabled when the interval is zero.
fn spawn_snapshot_task(state: &Arc<ServerState>, tasks: &mut JoinSet<()>) {
    let interval = state.config.persistence.snapshot_interval;
    if interval.is_zero() {
        return;
    }
    let state = state.clone();
    let mut shutdown_rx = state.shutdown_tx.subscribe();
    tasks.spawn(async move {
        let mut tick = tokio::time::interval(interval);
        tick.tick().await; // The immediate first tick.
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    if let Err(e) = snapshot::save(&state.db, &state.config.persistence.snapshot_path).await {
                        error!("Final snapshot on shutdown failed: {}", e);
                    }
                    return;
                }
                _ = tick.tick() => {
                    if let Err(e) = snapshot::save(&state.db, &state.config.persistence.snapshot_path).await {
                        error!("Periodic snapshot failed: {}", e);
                    }
                }
            }
        }
    });
}
