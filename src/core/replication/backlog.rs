// src/core/replication/backlog.rs

//! A bounded history of the primary's recent write commands.
//!
//! Replicas that drop off briefly can catch up by replaying only the part of
//! the stream they missed, provided it is still inside this window; anything
//! older forces a full snapshot transfer. The window is a deque of entries
//! trimmed from the front by byte budget, so `window_start` always names the
//! oldest stream offset that can still be served.

use crate::core::protocol::RespFrame;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::watch;
use tracing::trace;

/// Byte budget for the retained history. Roughly, how long a replica may be
/// gone before partial resync stops being possible.
const DEFAULT_CAPACITY_BYTES: usize = 2 * 1024 * 1024;

/// One retained write: the command frame plus its position and encoded size
/// in the replication stream.
#[derive(Debug, Clone)]
pub struct BacklogEntry {
    pub offset: u64,
    pub len: usize,
    pub frame: RespFrame,
}

impl BacklogEntry {
    /// The stream offset immediately after this entry.
    pub fn end_offset(&self) -> u64 {
        self.offset + self.len as u64
    }
}

#[derive(Debug)]
struct Window {
    entries: VecDeque<BacklogEntry>,
    /// The oldest stream offset still served by this window. Advances past
    /// every evicted entry, so it stays valid even when the deque drains.
    window_start: u64,
    bytes_held: usize,
}

/// The primary's replication backlog.
#[derive(Debug)]
pub struct ReplicationBacklog {
    window: Mutex<Window>,
    capacity: usize,
    /// Publishes the end offset of the stream; replica handlers wake on it.
    stream_end_tx: watch::Sender<u64>,
}

impl ReplicationBacklog {
    pub fn new() -> Self {
        let (stream_end_tx, _) = watch::channel(0u64);
        Self {
            window: Mutex::new(Window {
                entries: VecDeque::new(),
                window_start: 0,
                bytes_held: 0,
            }),
            capacity: DEFAULT_CAPACITY_BYTES,
            stream_end_tx,
        }
    }

    /// A receiver tracking the advancing end offset of the stream.
    pub fn offset_watch(&self) -> watch::Receiver<u64> {
        self.stream_end_tx.subscribe()
    }

    /// Records an accepted write at `offset`, trimming the oldest entries
    /// once the byte budget is exceeded, then wakes the stream watchers.
    pub fn append(&self, offset: u64, frame: RespFrame, len: usize) {
        let stream_end = offset + len as u64;
        {
            let mut window = self.window.lock();
            if window.entries.is_empty() {
                window.window_start = offset;
            }
            window.entries.push_back(BacklogEntry { offset, len, frame });
            window.bytes_held += len;

            while window.bytes_held > self.capacity {
                let Some(evicted) = window.entries.pop_front() else {
                    break;
                };
                window.bytes_held -= evicted.len;
                window.window_start = evicted.end_offset();
            }
        }

        self.stream_end_tx.send_if_modified(|end| {
            if *end < stream_end {
                *end = stream_end;
                true
            } else {
                false
            }
        });
    }

    /// Collects every entry at or after `offset`, in stream order.
    ///
    /// Returns `None` when that part of the stream has already been trimmed;
    /// the replica asking for it can only be helped by a full resync.
    pub fn collect_from(&self, offset: u64) -> Option<Vec<BacklogEntry>> {
        let window = self.window.lock();
        if offset < window.window_start {
            trace!(
                requested = offset,
                window_start = window.window_start,
                "partial resync position already trimmed from the backlog"
            );
            return None;
        }
        // Entries are offset-sorted, so the suffix starts at the first entry
        // not strictly before the requested offset.
        let first = window.entries.partition_point(|entry| entry.offset < offset);
        Some(window.entries.iter().skip(first).cloned().collect())
    }
}

impl Default for ReplicationBacklog {
    fn default() -> Self {
        Self::new()
    }
}
