// src/core/commands/dispatch.rs

//! The store-level command executor. Takes a parsed `Command` and applies it
//! to the server state, returning the RESP reply. Connection-level commands
//! (PSYNC, SUBSCRIBE, REPLICAOF, REPLCONF, ASKING) never reach this
//! function; the connection handler intercepts them because they change the
//! session itself.

use crate::core::JasperError;
use crate::core::cluster::{NUM_SLOTS, compact_slot_ranges};
use crate::core::commands::{ClusterSubcommand, Command, SlotMigrationAction};
use crate::core::protocol::RespFrame;
use crate::core::state::ServerState;
use crate::core::storage::data_types::{DataValue, StoredValue};
use bytes::Bytes;
use indexmap::IndexMap;
use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

/// The internal bypass path for commands arriving over the replication
/// stream (or AOF replay): executes without the read-only guard. Writes are
/// journaled to this server's own AOF but never re-published for fan-out.
pub async fn execute_replicated(
    state: &ServerState,
    args: Vec<Bytes>,
) -> Result<RespFrame, JasperError> {
    let cmd = Command::parse(&args)?;
    let reply = execute_data(state, &cmd)?;
    if cmd.is_write()
        && let Some(aof) = &state.aof
    {
        aof.append(RespFrame::command(args)).await?;
    }
    Ok(reply)
}

/// Executes a raw argument list against the store only. Used by AOF replay,
/// which must not append back into the log it is reading.
pub fn execute_parsed(state: &ServerState, args: &[Bytes]) -> Result<RespFrame, JasperError> {
    let cmd = Command::parse(args)?;
    execute_data(state, &cmd)
}

pub fn execute_data(state: &ServerState, cmd: &Command) -> Result<RespFrame, JasperError> {
    let db = &state.db;
    match cmd {
        Command::Ping(None) => Ok(RespFrame::SimpleString("PONG".into())),
        Command::Ping(Some(msg)) => Ok(RespFrame::BulkString(msg.clone())),
        Command::Echo(msg) => Ok(RespFrame::BulkString(msg.clone())),

        Command::Get { key } => match db.get(key) {
            Some(value) => match value.data {
                DataValue::String(s) => Ok(RespFrame::BulkString(s)),
                _ => Err(JasperError::WrongType),
            },
            None => Ok(RespFrame::Null),
        },

        Command::Set { key, value, ttl } => {
            let mut stored = StoredValue::new(DataValue::String(value.clone()));
            stored.expiry = ttl.map(|d| Instant::now() + d);
            db.set(key.clone(), stored);
            Ok(RespFrame::SimpleString("OK".into()))
        }

        Command::Del { keys } => {
            let removed = keys.iter().filter(|k| db.remove(k)).count();
            Ok(RespFrame::Integer(removed as i64))
        }

        Command::Exists { keys } => {
            let found = keys.iter().filter(|k| db.exists(k)).count();
            Ok(RespFrame::Integer(found as i64))
        }

        Command::Expire { key, seconds } => {
            let applied = db.expire_at(key, Instant::now() + Duration::from_secs(*seconds));
            Ok(RespFrame::Integer(applied as i64))
        }

        Command::Ttl { key } => match db.get(key) {
            None => Ok(RespFrame::Integer(-2)),
            Some(value) => match value.remaining_ttl_secs() {
                Some(secs) => Ok(RespFrame::Integer(secs as i64)),
                None => Ok(RespFrame::Integer(-1)),
            },
        },

        Command::HSet { key, pairs } => {
            let added = db.update_or_insert_with(
                key.clone(),
                || DataValue::Hash(IndexMap::new()),
                |stored| match &mut stored.data {
                    DataValue::Hash(hash) => {
                        let mut added = 0i64;
                        for (field, value) in pairs {
                            if hash.insert(field.clone(), value.clone()).is_none() {
                                added += 1;
                            }
                        }
                        Ok(added)
                    }
                    _ => Err(JasperError::WrongType),
                },
            )?;
            Ok(RespFrame::Integer(added))
        }

        Command::HGet { key, field } => match db.get(key) {
            None => Ok(RespFrame::Null),
            Some(value) => match value.data {
                DataValue::Hash(hash) => Ok(hash
                    .get(field)
                    .map(|v| RespFrame::BulkString(v.clone()))
                    .unwrap_or(RespFrame::Null)),
                _ => Err(JasperError::WrongType),
            },
        },

        Command::HGetAll { key } => match db.get(key) {
            None => Ok(RespFrame::Array(Vec::new())),
            Some(value) => match value.data {
                DataValue::Hash(hash) => {
                    let mut items = Vec::with_capacity(hash.len() * 2);
                    for (field, val) in hash {
                        items.push(RespFrame::BulkString(field));
                        items.push(RespFrame::BulkString(val));
                    }
                    Ok(RespFrame::Array(items))
                }
                _ => Err(JasperError::WrongType),
            },
        },

        Command::LPush { key, values } | Command::RPush { key, values } => {
            let push_front = matches!(cmd, Command::LPush { .. });
            let len = db.update_or_insert_with(
                key.clone(),
                || DataValue::List(VecDeque::new()),
                |stored| match &mut stored.data {
                    DataValue::List(list) => {
                        for value in values {
                            if push_front {
                                list.push_front(value.clone());
                            } else {
                                list.push_back(value.clone());
                            }
                        }
                        Ok(list.len() as i64)
                    }
                    _ => Err(JasperError::WrongType),
                },
            )?;
            Ok(RespFrame::Integer(len))
        }

        Command::LRange { key, start, stop } => match db.get(key) {
            None => Ok(RespFrame::Array(Vec::new())),
            Some(value) => match value.data {
                DataValue::List(list) => {
                    let (start, stop) = normalize_range(*start, *stop, list.len());
                    let items = list
                        .iter()
                        .skip(start)
                        .take(stop.saturating_sub(start))
                        .map(|item| RespFrame::BulkString(item.clone()))
                        .collect();
                    Ok(RespFrame::Array(items))
                }
                _ => Err(JasperError::WrongType),
            },
        },

        Command::LLen { key } => match db.get(key) {
            None => Ok(RespFrame::Integer(0)),
            Some(value) => match value.data {
                DataValue::List(list) => Ok(RespFrame::Integer(list.len() as i64)),
                _ => Err(JasperError::WrongType),
            },
        },

        Command::SAdd { key, members } => {
            let added = db.update_or_insert_with(
                key.clone(),
                || DataValue::Set(HashSet::new()),
                |stored| match &mut stored.data {
                    DataValue::Set(set) => Ok(members
                        .iter()
                        .filter(|m| set.insert((*m).clone()))
                        .count() as i64),
                    _ => Err(JasperError::WrongType),
                },
            )?;
            Ok(RespFrame::Integer(added))
        }

        Command::SMembers { key } => match db.get(key) {
            None => Ok(RespFrame::Array(Vec::new())),
            Some(value) => match value.data {
                DataValue::Set(set) => Ok(RespFrame::Array(
                    set.into_iter().map(RespFrame::BulkString).collect(),
                )),
                _ => Err(JasperError::WrongType),
            },
        },

        Command::DbSize => Ok(RespFrame::Integer(state.db.len() as i64)),

        Command::Info { section } => Ok(RespFrame::BulkString(Bytes::from(
            state.info_string(section.as_deref()),
        ))),

        Command::Publish { channel, message } => {
            let receivers = state.pubsub.publish(channel, message.clone());
            Ok(RespFrame::Integer(receivers as i64))
        }

        Command::Cluster(sub) => execute_cluster(state, sub),

        other => Err(JasperError::Internal(format!(
            "command {other:?} must be handled by the connection layer"
        ))),
    }
}

fn execute_cluster(state: &ServerState, sub: &ClusterSubcommand) -> Result<RespFrame, JasperError> {
    let Some(cluster) = &state.cluster else {
        return Err(JasperError::InvalidState(
            "This instance has cluster support disabled".into(),
        ));
    };
    match sub {
        ClusterSubcommand::MyId => Ok(RespFrame::BulkString(Bytes::from(cluster.my_id.clone()))),
        ClusterSubcommand::Info => {
            let assigned = cluster.assigned_slots();
            let cluster_state = if cluster.state_ok() { "ok" } else { "fail" };
            let info = format!(
                "cluster_enabled:1\r\ncluster_state:{cluster_state}\r\ncluster_slots_assigned:{assigned}\r\ncluster_known_nodes:{}\r\n",
                cluster.nodes.len()
            );
            Ok(RespFrame::BulkString(Bytes::from(info)))
        }
        ClusterSubcommand::SetSlot { slot, action } => {
            match action {
                SlotMigrationAction::Migrating(target) => {
                    cluster.set_slot_migrating(*slot, target)?;
                }
                SlotMigrationAction::Importing(source) => {
                    cluster.set_slot_importing(*slot, source);
                }
                SlotMigrationAction::Stable => {
                    cluster.clear_slot_migration(*slot);
                }
                SlotMigrationAction::Node(owner) => {
                    cluster.finalize_slot_owner(*slot, owner)?;
                }
            }
            Ok(RespFrame::SimpleString("OK".into()))
        }
        ClusterSubcommand::Slots => {
            let mut reply = Vec::new();
            for node in cluster.nodes.iter() {
                let mut slots: Vec<u16> = node.slots.clone();
                slots.sort_unstable();
                for (start, end) in compact_slot_ranges(&slots) {
                    reply.push(RespFrame::Array(vec![
                        RespFrame::Integer(start as i64),
                        RespFrame::Integer(end as i64),
                        RespFrame::Array(vec![
                            RespFrame::BulkString(Bytes::from(node.address.clone())),
                            RespFrame::Integer(node.port as i64),
                            RespFrame::BulkString(Bytes::from(node.id.clone())),
                        ]),
                    ]));
                }
            }
            debug_assert!(cluster.assigned_slots() <= NUM_SLOTS);
            Ok(RespFrame::Array(reply))
        }
    }
}

/// Normalizes redis-style inclusive `[start, stop]` indices (negative counts
/// from the tail) into an exclusive `[start, end)` range over `len` items.
fn normalize_range(start: i64, stop: i64, len: usize) -> (usize, usize) {
    let len = len as i64;
    let mut start = if start < 0 { len + start } else { start };
    let mut stop = if stop < 0 { len + stop } else { stop };
    start = start.clamp(0, len);
    stop = stop.clamp(-1, len - 1);
    if start > stop {
        return (0, 0);
    }
    (start as usize, (stop + 1) as usize)
}
