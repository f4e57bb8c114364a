// src/core/cluster/slot.rs

//! Implements the cluster hash slot algorithm.

use bytes::Bytes;
use crc::{CRC_16_XMODEM, Crc};

/// The total number of hash slots in the cluster.
pub const NUM_SLOTS: usize = 16384;

/// The CRC16 algorithm used for calculating hash slots.
const CRC16_ALGO: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// Calculates the hash slot for a given key.
///
/// The algorithm first checks for a "hash tag" (a substring enclosed in
/// `{...}`) within the key. If a non-empty hash tag is found, only the content
/// within the first such tag is used for the CRC16 calculation. This allows
/// users to force multiple keys into the same hash slot. If no hash tag is
/// found, the entire key is used.
///
/// The final slot is determined by `CRC16(key) % NUM_SLOTS`.
pub fn key_hash_slot(key: &[u8]) -> u16 {
    // Check for a hash tag, e.g., "user:{123}:name".
    if let Some(start) = key.iter().position(|&b| b == b'{')
        && let Some(end_offset) = key[start + 1..].iter().position(|&b| b == b'}')
    {
        let end = start + 1 + end_offset;
        // An empty tag, e.g. "user:{}", falls back to hashing the whole key.
        if end > start + 1 {
            return CRC16_ALGO.checksum(&key[start + 1..end]) % (NUM_SLOTS as u16);
        }
    }
    CRC16_ALGO.checksum(key) % (NUM_SLOTS as u16)
}

/// Returns true iff all keys hash to the same slot. Empty and single-key
/// inputs are trivially same-slot.
pub fn keys_in_same_slot(keys: &[Bytes]) -> bool {
    let mut slots = keys.iter().map(|k| key_hash_slot(k));
    match slots.next() {
        None => true,
        Some(first) => slots.all(|s| s == first),
    }
}

/// Compacts a sorted slot list into contiguous `[start, end]` ranges,
/// the shape `CLUSTER SLOTS` responses are built from.
pub fn compact_slot_ranges(sorted_slots: &[u16]) -> Vec<(u16, u16)> {
    let mut ranges: Vec<(u16, u16)> = Vec::new();
    for &slot in sorted_slots {
        match ranges.last_mut() {
            Some((_, end)) if *end + 1 == slot => *end = slot,
            Some((_, end)) if *end == slot => {}
            _ => ranges.push((slot, slot)),
        }
    }
    ranges
}
