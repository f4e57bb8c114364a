// src/core/persistence/mod.rs

//! Durability: the append-only log and the binary snapshot format.

pub mod aof;
pub mod snapshot;

pub use aof::{AofHandle, AofWriterTask, AppendFsync};
