// src/core/sentinel/listener.rs

//! The sentinel's TCP listener: accepts RESP connections from clients and
//! peer sentinels and answers the `SENTINEL` command family, including the
//! vote-carrying `IS-MASTER-DOWN-BY-ADDR`.

use super::election::{VoteRequest, handle_vote_request};
use super::state::SentinelState;
use crate::core::protocol::{RespFrame, RespFrameCodec};
use anyhow::Result;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

/// Per-command read deadline on sentinel connections.
const COMMAND_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// A tagged status value, serialized to RESP for the informational
/// `SENTINEL MASTERS` / `REPLICAS` / `SENTINELS` replies.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusValue {
    Int(i64),
    Str(String),
    Bool(bool),
    List(Vec<StatusValue>),
}

impl From<StatusValue> for RespFrame {
    fn from(value: StatusValue) -> Self {
        match value {
            StatusValue::Int(i) => RespFrame::Integer(i),
            StatusValue::Str(s) => RespFrame::BulkString(Bytes::from(s)),
            StatusValue::Bool(b) => RespFrame::Integer(b as i64),
            StatusValue::List(items) => {
                RespFrame::Array(items.into_iter().map(RespFrame::from).collect())
            }
        }
    }
}

/// Builds the flat field/value list describing one instance.
fn instance_status(fields: Vec<(&str, StatusValue)>) -> StatusValue {
    let mut flat = Vec::with_capacity(fields.len() * 2);
    for (name, value) in fields {
        flat.push(StatusValue::Str(name.to_string()));
        flat.push(value);
    }
    StatusValue::List(flat)
}

/// Runs the main TCP listener loop for the sentinel.
pub async fn run_listener(
    state: Arc<SentinelState>,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<()> {
    let bind_addr = format!("{}:{}", state.config.host, state.config.port);
    let listener = TcpListener::bind(&bind_addr).await?;
    info!("Sentinel listening for commands on {}", bind_addr);

    let mut shutdown_rx = shutdown_tx.subscribe();
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("Sentinel listener shutting down.");
                return Ok(());
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((socket, addr)) => {
                        let state = state.clone();
                        tokio::spawn(async move {
                            debug!("Accepted sentinel connection from {}", addr);
                            if let Err(e) = handle_connection(socket, state).await {
                                debug!("Sentinel connection from {} ended: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        warn!("Failed to accept sentinel connection: {}", e);
                    }
                }
            }
        }
    }
}

/// Handles a single connection, reading commands and sending responses.
/// The connection closes when a command does not arrive within the read
/// deadline.
async fn handle_connection(socket: TcpStream, state: Arc<SentinelState>) -> Result<()> {
    let mut framed = Framed::new(socket, RespFrameCodec);

    loop {
        let frame = match tokio::time::timeout(COMMAND_READ_TIMEOUT, framed.next()).await {
            Err(_) => return Ok(()), // Idle deadline reached.
            Ok(None) => return Ok(()),
            Ok(Some(Err(e))) => {
                warn!("Error decoding sentinel command: {}", e);
                return Ok(());
            }
            Ok(Some(Ok(frame))) => frame,
        };

        let response = match frame.into_args() {
            Ok(args) => process_command(&args, &state),
            Err(_) => RespFrame::Error(
                "ERR invalid command format. Commands must be RESP arrays.".to_string(),
            ),
        };
        framed.send(response).await?;
    }
}

/// Parses and processes a single command received by the sentinel.
pub fn process_command(args: &[Bytes], state: &Arc<SentinelState>) -> RespFrame {
    let Some(cmd) = args.first() else {
        return RespFrame::Error("ERR empty command".to_string());
    };

    if cmd.eq_ignore_ascii_case(b"ping") {
        return RespFrame::SimpleString("PONG".to_string());
    }

    if cmd.eq_ignore_ascii_case(b"info") {
        return info_reply(state);
    }

    if cmd.eq_ignore_ascii_case(b"sentinel") {
        let Some(subcmd) = args.get(1) else {
            return RespFrame::Error("ERR unknown sentinel subcommand".to_string());
        };
        return process_sentinel_subcommand(subcmd, &args[2..], state);
    }

    RespFrame::Error(format!(
        "ERR unknown command '{}'",
        String::from_utf8_lossy(cmd)
    ))
}

fn process_sentinel_subcommand(
    subcmd: &Bytes,
    rest: &[Bytes],
    state: &Arc<SentinelState>,
) -> RespFrame {
    if subcmd.eq_ignore_ascii_case(b"get-master-addr-by-name") {
        let Some(name) = rest.first() else {
            return RespFrame::Error(
                "ERR wrong number of arguments for 'sentinel get-master-addr-by-name'".to_string(),
            );
        };
        if !name_matches(state, name) {
            return RespFrame::NullArray;
        }
        let (host, port) = state.master_addr();
        return RespFrame::Array(vec![
            RespFrame::BulkString(Bytes::from(host)),
            RespFrame::BulkString(Bytes::from(port.to_string())),
        ]);
    }

    if subcmd.eq_ignore_ascii_case(b"masters") {
        return masters_reply(state);
    }

    if subcmd.eq_ignore_ascii_case(b"replicas") || subcmd.eq_ignore_ascii_case(b"slaves") {
        let Some(name) = rest.first() else {
            return RespFrame::Error(
                "ERR wrong number of arguments for 'sentinel replicas'".to_string(),
            );
        };
        if !name_matches(state, name) {
            return RespFrame::Error(format!(
                "ERR No such master with that name: {}",
                String::from_utf8_lossy(name)
            ));
        }
        return replicas_reply(state);
    }

    if subcmd.eq_ignore_ascii_case(b"sentinels") {
        let Some(name) = rest.first() else {
            return RespFrame::Error(
                "ERR wrong number of arguments for 'sentinel sentinels'".to_string(),
            );
        };
        if !name_matches(state, name) {
            return RespFrame::Error(format!(
                "ERR No such master with that name: {}",
                String::from_utf8_lossy(name)
            ));
        }
        return sentinels_reply(state);
    }

    if subcmd.eq_ignore_ascii_case(b"is-master-down-by-addr") {
        return is_master_down_reply(rest, state);
    }

    if subcmd.eq_ignore_ascii_case(b"reset") {
        let Some(pattern) = rest.first() else {
            return RespFrame::Error(
                "ERR wrong number of arguments for 'sentinel reset'".to_string(),
            );
        };
        let pattern = String::from_utf8_lossy(pattern);
        if pattern == "*" || pattern == state.config.master_name {
            // Drop any in-flight election bookkeeping; monitoring continues.
            let mut voting = state.voting.lock();
            voting.voted_epoch = 0;
            voting.voted_for = None;
        }
        return RespFrame::Integer(1);
    }

    RespFrame::Error(format!(
        "ERR unknown command 'SENTINEL {}'",
        String::from_utf8_lossy(subcmd)
    ))
}

fn name_matches(state: &SentinelState, name: &Bytes) -> bool {
    state.config.master_name.as_bytes() == name.as_ref()
}

fn info_reply(state: &Arc<SentinelState>) -> RespFrame {
    let (host, port) = state.master_addr();
    let status = if state.master_is_sdown() { "sdown" } else { "ok" };
    let text = format!(
        "# Sentinel\r\nsentinel_id:{}\r\nsentinel_masters:1\r\nmaster0:name={},status={},address={}:{},quorum={}\r\n",
        state.my_id, state.config.master_name, status, host, port, state.config.quorum
    );
    RespFrame::BulkString(Bytes::from(text))
}

fn masters_reply(state: &Arc<SentinelState>) -> RespFrame {
    let (master, down_after) = {
        let master = state.master.lock();
        (master.clone(), state.config.down_after)
    };
    let num_replicas = state.replicas.lock().len();
    let epoch = state.voting.lock().current_epoch;
    let flags = if master.is_sdown(down_after) {
        "master,s_down"
    } else {
        "master"
    };
    let status = instance_status(vec![
        ("name", StatusValue::Str(state.config.master_name.clone())),
        ("ip", StatusValue::Str(master.host.clone())),
        ("port", StatusValue::Int(master.port as i64)),
        ("flags", StatusValue::Str(flags.to_string())),
        ("num-slaves", StatusValue::Int(num_replicas as i64)),
        ("quorum", StatusValue::Int(state.config.quorum as i64)),
        ("config-epoch", StatusValue::Int(epoch as i64)),
        (
            "down-after-milliseconds",
            StatusValue::Int(down_after.as_millis() as i64),
        ),
    ]);
    RespFrame::Array(vec![status.into()])
}

fn replicas_reply(state: &Arc<SentinelState>) -> RespFrame {
    let replicas: Vec<_> = {
        let replicas = state.replicas.lock();
        replicas.values().cloned().collect()
    };
    let items = replicas
        .into_iter()
        .map(|replica| {
            let flags = if replica.down_flag {
                "slave,s_down"
            } else {
                "slave"
            };
            instance_status(vec![
                ("name", StatusValue::Str(replica.addr())),
                ("ip", StatusValue::Str(replica.host.clone())),
                ("port", StatusValue::Int(replica.port as i64)),
                ("flags", StatusValue::Str(flags.to_string())),
                ("slave-repl-offset", StatusValue::Int(replica.repl_offset as i64)),
                ("slave-priority", StatusValue::Int(replica.priority as i64)),
            ])
            .into()
        })
        .collect();
    RespFrame::Array(items)
}

fn sentinels_reply(state: &Arc<SentinelState>) -> RespFrame {
    let items = state
        .connected_peers
        .iter()
        .map(|entry| {
            let (host, port) = entry
                .key()
                .rsplit_once(':')
                .map(|(h, p)| (h.to_string(), p.to_string()))
                .unwrap_or_else(|| (entry.key().clone(), "0".to_string()));
            instance_status(vec![
                ("name", StatusValue::Str(entry.key().clone())),
                ("ip", StatusValue::Str(host)),
                ("port", StatusValue::Int(port.parse().unwrap_or(0))),
                ("flags", StatusValue::Str("sentinel".to_string())),
            ])
            .into()
        })
        .collect();
    RespFrame::Array(items)
}

/// Answers `SENTINEL IS-MASTER-DOWN-BY-ADDR <ip> <port> <epoch> <runid>`
/// with the exact three-element array `[agrees, leader, epoch]`.
fn is_master_down_reply(rest: &[Bytes], state: &Arc<SentinelState>) -> RespFrame {
    let (Some(ip), Some(port), Some(epoch), Some(candidate)) =
        (rest.first(), rest.get(1), rest.get(2), rest.get(3))
    else {
        return RespFrame::Error(
            "ERR wrong number of arguments for 'sentinel is-master-down-by-addr'".to_string(),
        );
    };
    let Ok(port) = String::from_utf8_lossy(port).parse::<u16>() else {
        return RespFrame::Error("ERR invalid port".to_string());
    };
    let Ok(epoch) = String::from_utf8_lossy(epoch).parse::<u64>() else {
        return RespFrame::Error("ERR invalid epoch".to_string());
    };
    let request = VoteRequest {
        master_host: String::from_utf8_lossy(ip).to_string(),
        master_port: port,
        epoch,
        candidate_id: String::from_utf8_lossy(candidate).to_string(),
    };

    // Copy the local view out; the voting lock is taken last and covers only
    // the check-and-update.
    let (master_host, master_port) = state.master_addr();
    let master_matches = master_host == request.master_host && master_port == request.master_port;
    let master_sdown = state.master_is_sdown();

    let reply = {
        let mut voting = state.voting.lock();
        handle_vote_request(&mut voting, master_matches, master_sdown, &request)
    };
    debug!(
        "Vote request from {} for epoch {}: agrees={}",
        request.candidate_id, request.epoch, reply.agrees
    );

    RespFrame::Array(vec![
        RespFrame::Integer(reply.agrees as i64),
        match reply.leader {
            Some(leader) => RespFrame::BulkString(Bytes::from(leader)),
            None => RespFrame::Null,
        },
        RespFrame::Integer(reply.epoch as i64),
    ])
}
