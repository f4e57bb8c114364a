// src/core/commands/mod.rs

//! The command surface of the data server: parsing a RESP argument list into
//! a typed `Command`, plus the store-level executor. The surrounding pipeline
//! (read-only guard, slot ownership, AOF, replication fan-out) lives in the
//! connection handler.

pub mod dispatch;

use crate::core::JasperError;
use bytes::Bytes;
use std::time::Duration;

/// `CLUSTER` subcommands the shell answers.
#[derive(Debug, Clone, PartialEq)]
pub enum ClusterSubcommand {
    Slots,
    Info,
    MyId,
    SetSlot { slot: u16, action: SlotMigrationAction },
}

/// The `CLUSTER SETSLOT` migration actions.
#[derive(Debug, Clone, PartialEq)]
pub enum SlotMigrationAction {
    /// Hand the slot off to the named node; moved-out keys answer `ASK`.
    Migrating(String),
    /// Receive the slot from the named node; served only to `ASKING` clients.
    Importing(String),
    /// Drop any migration state for the slot.
    Stable,
    /// Finalize: the named node owns the slot.
    Node(String),
}

/// A fully parsed client command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Ping(Option<Bytes>),
    Echo(Bytes),

    Get { key: Bytes },
    Set { key: Bytes, value: Bytes, ttl: Option<Duration> },
    Del { keys: Vec<Bytes> },
    Exists { keys: Vec<Bytes> },
    Expire { key: Bytes, seconds: u64 },
    Ttl { key: Bytes },

    HSet { key: Bytes, pairs: Vec<(Bytes, Bytes)> },
    HGet { key: Bytes, field: Bytes },
    HGetAll { key: Bytes },

    LPush { key: Bytes, values: Vec<Bytes> },
    RPush { key: Bytes, values: Vec<Bytes> },
    LRange { key: Bytes, start: i64, stop: i64 },
    LLen { key: Bytes },

    SAdd { key: Bytes, members: Vec<Bytes> },
    SMembers { key: Bytes },

    DbSize,
    Info { section: Option<String> },

    /// `REPLICAOF host port`; `None` means `REPLICAOF NO ONE`.
    ReplicaOf { target: Option<(String, u16)> },
    ReplConf { pairs: Vec<(String, String)> },
    Psync { replid: String, offset: String },

    Subscribe { channels: Vec<Bytes> },
    Publish { channel: Bytes, message: Bytes },

    /// One-shot announcement that the next command targets an importing slot.
    Asking,
    Cluster(ClusterSubcommand),
}

impl Command {
    /// Parses the raw argument list of a RESP command array.
    pub fn parse(args: &[Bytes]) -> Result<Command, JasperError> {
        let Some(name) = args.first() else {
            return Err(JasperError::ProtocolError("empty command".into()));
        };
        let name_upper = String::from_utf8_lossy(name).to_ascii_uppercase();
        let rest = &args[1..];

        match name_upper.as_str() {
            "PING" => match rest {
                [] => Ok(Command::Ping(None)),
                [msg] => Ok(Command::Ping(Some(msg.clone()))),
                _ => Err(wrong_args("ping")),
            },
            "ECHO" => match rest {
                [msg] => Ok(Command::Echo(msg.clone())),
                _ => Err(wrong_args("echo")),
            },
            "GET" => match rest {
                [key] => Ok(Command::Get { key: key.clone() }),
                _ => Err(wrong_args("get")),
            },
            "SET" => parse_set(rest),
            "DEL" => {
                if rest.is_empty() {
                    return Err(wrong_args("del"));
                }
                Ok(Command::Del {
                    keys: rest.to_vec(),
                })
            }
            "EXISTS" => {
                if rest.is_empty() {
                    return Err(wrong_args("exists"));
                }
                Ok(Command::Exists {
                    keys: rest.to_vec(),
                })
            }
            "EXPIRE" => match rest {
                [key, secs] => Ok(Command::Expire {
                    key: key.clone(),
                    seconds: parse_u64(secs)?,
                }),
                _ => Err(wrong_args("expire")),
            },
            "TTL" => match rest {
                [key] => Ok(Command::Ttl { key: key.clone() }),
                _ => Err(wrong_args("ttl")),
            },
            "HSET" => {
                if rest.len() < 3 || rest.len() % 2 != 1 {
                    return Err(wrong_args("hset"));
                }
                let pairs = rest[1..]
                    .chunks_exact(2)
                    .map(|pair| (pair[0].clone(), pair[1].clone()))
                    .collect();
                Ok(Command::HSet {
                    key: rest[0].clone(),
                    pairs,
                })
            }
            "HGET" => match rest {
                [key, field] => Ok(Command::HGet {
                    key: key.clone(),
                    field: field.clone(),
                }),
                _ => Err(wrong_args("hget")),
            },
            "HGETALL" => match rest {
                [key] => Ok(Command::HGetAll { key: key.clone() }),
                _ => Err(wrong_args("hgetall")),
            },
            "LPUSH" | "RPUSH" => {
                if rest.len() < 2 {
                    return Err(wrong_args(&name_upper.to_ascii_lowercase()));
                }
                let key = rest[0].clone();
                let values = rest[1..].to_vec();
                if name_upper == "LPUSH" {
                    Ok(Command::LPush { key, values })
                } else {
                    Ok(Command::RPush { key, values })
                }
            }
            "LRANGE" => match rest {
                [key, start, stop] => Ok(Command::LRange {
                    key: key.clone(),
                    start: parse_i64(start)?,
                    stop: parse_i64(stop)?,
                }),
                _ => Err(wrong_args("lrange")),
            },
            "LLEN" => match rest {
                [key] => Ok(Command::LLen { key: key.clone() }),
                _ => Err(wrong_args("llen")),
            },
            "SADD" => {
                if rest.len() < 2 {
                    return Err(wrong_args("sadd"));
                }
                Ok(Command::SAdd {
                    key: rest[0].clone(),
                    members: rest[1..].to_vec(),
                })
            }
            "SMEMBERS" => match rest {
                [key] => Ok(Command::SMembers { key: key.clone() }),
                _ => Err(wrong_args("smembers")),
            },
            "DBSIZE" => Ok(Command::DbSize),
            "INFO" => match rest {
                [] => Ok(Command::Info { section: None }),
                [section] => Ok(Command::Info {
                    section: Some(String::from_utf8_lossy(section).to_ascii_lowercase()),
                }),
                _ => Err(wrong_args("info")),
            },
            "REPLICAOF" | "SLAVEOF" => match rest {
                [host, port] => {
                    let host_str = String::from_utf8_lossy(host).to_string();
                    let port_str = String::from_utf8_lossy(port).to_string();
                    if host_str.eq_ignore_ascii_case("no") && port_str.eq_ignore_ascii_case("one") {
                        Ok(Command::ReplicaOf { target: None })
                    } else {
                        let port: u16 = port_str.parse().map_err(|_| JasperError::NotAnInteger)?;
                        Ok(Command::ReplicaOf {
                            target: Some((host_str, port)),
                        })
                    }
                }
                _ => Err(wrong_args("replicaof")),
            },
            "REPLCONF" => {
                if rest.len() % 2 != 0 {
                    return Err(wrong_args("replconf"));
                }
                let pairs = rest
                    .chunks_exact(2)
                    .map(|pair| {
                        (
                            String::from_utf8_lossy(&pair[0]).to_ascii_lowercase(),
                            String::from_utf8_lossy(&pair[1]).to_string(),
                        )
                    })
                    .collect();
                Ok(Command::ReplConf { pairs })
            }
            "PSYNC" => match rest {
                [replid, offset] => Ok(Command::Psync {
                    replid: String::from_utf8_lossy(replid).to_string(),
                    offset: String::from_utf8_lossy(offset).to_string(),
                }),
                _ => Err(wrong_args("psync")),
            },
            "SUBSCRIBE" => {
                if rest.is_empty() {
                    return Err(wrong_args("subscribe"));
                }
                Ok(Command::Subscribe {
                    channels: rest.to_vec(),
                })
            }
            "PUBLISH" => match rest {
                [channel, message] => Ok(Command::Publish {
                    channel: channel.clone(),
                    message: message.clone(),
                }),
                _ => Err(wrong_args("publish")),
            },
            "ASKING" => {
                if !rest.is_empty() {
                    return Err(wrong_args("asking"));
                }
                Ok(Command::Asking)
            }
            "CLUSTER" => {
                let Some(sub) = rest.first() else {
                    return Err(wrong_args("cluster"));
                };
                let sub_upper = String::from_utf8_lossy(sub).to_ascii_uppercase();
                match sub_upper.as_str() {
                    "SLOTS" => Ok(Command::Cluster(ClusterSubcommand::Slots)),
                    "INFO" => Ok(Command::Cluster(ClusterSubcommand::Info)),
                    "MYID" => Ok(Command::Cluster(ClusterSubcommand::MyId)),
                    "SETSLOT" => parse_setslot(&rest[1..]),
                    other => Err(JasperError::UnknownCommand(format!("CLUSTER {other}"))),
                }
            }
            _ => Err(JasperError::UnknownCommand(
                String::from_utf8_lossy(name).to_string(),
            )),
        }
    }

    /// Whether this command mutates the keyspace. Write commands go through
    /// the read-only guard, the AOF, and replication fan-out.
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Command::Set { .. }
                | Command::Del { .. }
                | Command::Expire { .. }
                | Command::HSet { .. }
                | Command::LPush { .. }
                | Command::RPush { .. }
                | Command::SAdd { .. }
        )
    }

    /// The keys this command touches, for slot-ownership checks.
    pub fn keys(&self) -> Vec<Bytes> {
        match self {
            Command::Get { key }
            | Command::Expire { key, .. }
            | Command::Ttl { key }
            | Command::HSet { key, .. }
            | Command::HGet { key, .. }
            | Command::HGetAll { key }
            | Command::LPush { key, .. }
            | Command::RPush { key, .. }
            | Command::LRange { key, .. }
            | Command::LLen { key }
            | Command::SAdd { key, .. }
            | Command::SMembers { key }
            | Command::Set { key, .. } => vec![key.clone()],
            Command::Del { keys } | Command::Exists { keys } => keys.clone(),
            _ => Vec::new(),
        }
    }
}

fn wrong_args(name: &str) -> JasperError {
    JasperError::WrongArgumentCount(name.to_string())
}

fn parse_u64(b: &Bytes) -> Result<u64, JasperError> {
    String::from_utf8_lossy(b)
        .parse::<u64>()
        .map_err(|_| JasperError::NotAnInteger)
}

fn parse_i64(b: &Bytes) -> Result<i64, JasperError> {
    String::from_utf8_lossy(b)
        .parse::<i64>()
        .map_err(|_| JasperError::NotAnInteger)
}

fn parse_setslot(rest: &[Bytes]) -> Result<Command, JasperError> {
    let (Some(slot), Some(action)) = (rest.first(), rest.get(1)) else {
        return Err(wrong_args("cluster|setslot"));
    };
    let slot = String::from_utf8_lossy(slot)
        .parse::<u16>()
        .map_err(|_| JasperError::NotAnInteger)?;
    if slot as usize >= crate::core::cluster::NUM_SLOTS {
        return Err(JasperError::InvalidRequest(format!(
            "slot {slot} is out of range"
        )));
    }

    let node_arg = || {
        rest.get(2)
            .map(|n| String::from_utf8_lossy(n).to_string())
            .ok_or_else(|| wrong_args("cluster|setslot"))
    };
    let action = match String::from_utf8_lossy(action).to_ascii_uppercase().as_str() {
        "MIGRATING" => SlotMigrationAction::Migrating(node_arg()?),
        "IMPORTING" => SlotMigrationAction::Importing(node_arg()?),
        "STABLE" => SlotMigrationAction::Stable,
        "NODE" => SlotMigrationAction::Node(node_arg()?),
        other => {
            return Err(JasperError::InvalidRequest(format!(
                "unknown SETSLOT action '{other}'"
            )));
        }
    };
    Ok(Command::Cluster(ClusterSubcommand::SetSlot { slot, action }))
}

fn parse_set(rest: &[Bytes]) -> Result<Command, JasperError> {
    if rest.len() < 2 {
        return Err(wrong_args("set"));
    }
    let key = rest[0].clone();
    let value = rest[1].clone();
    let mut ttl = None;

    let mut i = 2;
    while i < rest.len() {
        let opt = String::from_utf8_lossy(&rest[i]).to_ascii_uppercase();
        match opt.as_str() {
            "EX" => {
                let secs = rest.get(i + 1).ok_or(JasperError::SyntaxError)?;
                ttl = Some(Duration::from_secs(parse_u64(secs)?));
                i += 2;
            }
            "PX" => {
                let ms = rest.get(i + 1).ok_or(JasperError::SyntaxError)?;
                ttl = Some(Duration::from_millis(parse_u64(ms)?));
                i += 2;
            }
            _ => return Err(JasperError::SyntaxError),
        }
    }

    Ok(Command::Set { key, value, ttl })
}
