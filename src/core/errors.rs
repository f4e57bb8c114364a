// src/core/errors.rs

//! Defines the primary error type for the entire application.

use std::num::ParseIntError;
use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all possible failures within the server.
/// Using `thiserror` allows for clean error definitions and automatic `From` trait implementations.
#[derive(Error, Debug)]
pub enum JasperError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Incomplete data in stream")]
    IncompleteData,

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Syntax error")]
    SyntaxError,

    #[error("Protocol error: frame exceeds allowed size")]
    OversizedFrame,

    #[error("Unknown command '{0}'")]
    UnknownCommand(String),

    #[error("Wrong number of arguments for '{0}' command")]
    WrongArgumentCount(String),

    #[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
    WrongType,

    #[error("Value is not an integer or out of range")]
    NotAnInteger,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Command not allowed in the current state: {0}")]
    InvalidState(String),

    #[error("READONLY {0}")]
    ReadOnly(String),

    #[error("Persistence Error: {0}")]
    AofError(String),

    #[error("Snapshot is corrupt: {0}")]
    SnapshotCorrupt(String),

    #[error("Replication Error: {0}")]
    ReplicationError(String),

    #[error("Sentinel Error: {0}")]
    SentinelError(String),

    #[error("Max retries exceeded: {0}")]
    MaxRetriesExceeded(String),

    #[error("Internal Server Error: {0}")]
    Internal(String),

    // --- Cluster-specific errors ---
    /// A redirect error indicating that a key/slot has moved to a different node.
    #[error("MOVED {slot} {addr}")]
    Moved { slot: u16, addr: String },

    /// A temporary redirect error for a slot that is currently being migrated.
    #[error("ASK {slot} {addr}")]
    Ask { slot: u16, addr: String },

    /// A multi-key command was attempted on keys in different slots.
    #[error("CROSSSLOT Keys in request don't hash to the same slot")]
    CrossSlot,

    /// An error indicating that the cluster is down or a slot is unassigned.
    #[error("CLUSTERDOWN {0}")]
    ClusterDown(String),
}

// Manual implementation of Clone because `std::io::Error` is not cloneable.
// We wrap it in an Arc to allow for cheap, shared cloning.
impl Clone for JasperError {
    fn clone(&self) -> Self {
        match self {
            JasperError::Io(e) => JasperError::Io(Arc::clone(e)),
            JasperError::IncompleteData => JasperError::IncompleteData,
            JasperError::ProtocolError(s) => JasperError::ProtocolError(s.clone()),
            JasperError::SyntaxError => JasperError::SyntaxError,
            JasperError::OversizedFrame => JasperError::OversizedFrame,
            JasperError::UnknownCommand(s) => JasperError::UnknownCommand(s.clone()),
            JasperError::WrongArgumentCount(s) => JasperError::WrongArgumentCount(s.clone()),
            JasperError::WrongType => JasperError::WrongType,
            JasperError::NotAnInteger => JasperError::NotAnInteger,
            JasperError::InvalidRequest(s) => JasperError::InvalidRequest(s.clone()),
            JasperError::InvalidState(s) => JasperError::InvalidState(s.clone()),
            JasperError::ReadOnly(s) => JasperError::ReadOnly(s.clone()),
            JasperError::AofError(s) => JasperError::AofError(s.clone()),
            JasperError::SnapshotCorrupt(s) => JasperError::SnapshotCorrupt(s.clone()),
            JasperError::ReplicationError(s) => JasperError::ReplicationError(s.clone()),
            JasperError::SentinelError(s) => JasperError::SentinelError(s.clone()),
            JasperError::MaxRetriesExceeded(s) => JasperError::MaxRetriesExceeded(s.clone()),
            JasperError::Internal(s) => JasperError::Internal(s.clone()),
            JasperError::Moved { slot, addr } => JasperError::Moved {
                slot: *slot,
                addr: addr.clone(),
            },
            JasperError::Ask { slot, addr } => JasperError::Ask {
                slot: *slot,
                addr: addr.clone(),
            },
            JasperError::CrossSlot => JasperError::CrossSlot,
            JasperError::ClusterDown(s) => JasperError::ClusterDown(s.clone()),
        }
    }
}

impl PartialEq for JasperError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (JasperError::Io(e1), JasperError::Io(e2)) => e1.to_string() == e2.to_string(),
            (JasperError::ProtocolError(s1), JasperError::ProtocolError(s2)) => s1 == s2,
            (JasperError::UnknownCommand(s1), JasperError::UnknownCommand(s2)) => s1 == s2,
            (JasperError::WrongArgumentCount(s1), JasperError::WrongArgumentCount(s2)) => s1 == s2,
            (JasperError::InvalidRequest(s1), JasperError::InvalidRequest(s2)) => s1 == s2,
            (JasperError::InvalidState(s1), JasperError::InvalidState(s2)) => s1 == s2,
            (JasperError::ReadOnly(s1), JasperError::ReadOnly(s2)) => s1 == s2,
            (JasperError::AofError(s1), JasperError::AofError(s2)) => s1 == s2,
            (JasperError::SnapshotCorrupt(s1), JasperError::SnapshotCorrupt(s2)) => s1 == s2,
            (JasperError::ReplicationError(s1), JasperError::ReplicationError(s2)) => s1 == s2,
            (JasperError::SentinelError(s1), JasperError::SentinelError(s2)) => s1 == s2,
            (JasperError::MaxRetriesExceeded(s1), JasperError::MaxRetriesExceeded(s2)) => s1 == s2,
            (JasperError::Internal(s1), JasperError::Internal(s2)) => s1 == s2,
            (JasperError::ClusterDown(s1), JasperError::ClusterDown(s2)) => s1 == s2,
            (
                JasperError::Moved { slot: s1, addr: a1 },
                JasperError::Moved { slot: s2, addr: a2 },
            ) => s1 == s2 && a1 == a2,
            (JasperError::Ask { slot: s1, addr: a1 }, JasperError::Ask { slot: s2, addr: a2 }) => {
                s1 == s2 && a1 == a2
            }
            _ => core::mem::discriminant(self) == core::mem::discriminant(other),
        }
    }
}

// --- From trait implementations for easy error conversion ---

impl From<std::io::Error> for JasperError {
    fn from(e: std::io::Error) -> Self {
        JasperError::Io(Arc::new(e))
    }
}

impl From<std::str::Utf8Error> for JasperError {
    fn from(_: std::str::Utf8Error) -> Self {
        JasperError::WrongType
    }
}

impl From<std::string::FromUtf8Error> for JasperError {
    fn from(_: std::string::FromUtf8Error) -> Self {
        JasperError::WrongType
    }
}

impl From<ParseIntError> for JasperError {
    fn from(_: ParseIntError) -> Self {
        JasperError::NotAnInteger
    }
}
