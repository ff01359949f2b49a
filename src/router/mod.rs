//! Chunk router: time-partitioned fragment buffers
//!
//! Fragments are appended to in-memory byte buffers keyed by chunk name.
//! A fragment at time `t` lands in chunk `t / full_chunk_length`; fragments
//! inside the trailing overlap window are additionally replicated into the
//! chunk's `_post` twin and the next chunk's `_pre` twin so that pulses
//! crossing a boundary are recoverable from either side.
//!
//! The router also tracks the per-packet watermark: the smallest chunk any
//! fragment of the current packet was routed to. Chunks older than the
//! watermark by two are guaranteed complete (replication only reaches one
//! chunk back) and are handed to the writer.

use std::collections::BTreeMap;

/// Routes fragments into per-chunk byte buffers
#[derive(Debug)]
pub struct ChunkRouter {
    full_chunk_length_ns: i64,
    chunk_overlap_ns: i64,
    chunk_name_length: usize,
    /// Sorted so finalization drains oldest chunks first
    buffers: BTreeMap<String, Vec<u8>>,
    /// Smallest chunk touched since the last `take_watermark`
    packet_min: Option<i64>,
    buffered_bytes: usize,
}

impl ChunkRouter {
    pub fn new(chunk_length_ns: i64, chunk_overlap_ns: i64, chunk_name_length: usize) -> Self {
        Self {
            full_chunk_length_ns: chunk_length_ns + chunk_overlap_ns,
            chunk_overlap_ns,
            chunk_name_length,
            buffers: BTreeMap::new(),
            packet_min: None,
            buffered_bytes: 0,
        }
    }

    /// Chunk index for a timestamp
    pub fn chunk_id(&self, time_ns: i64) -> i64 {
        time_ns / self.full_chunk_length_ns
    }

    /// Zero-padded chunk name
    pub fn chunk_key(&self, chunk_id: i64) -> String {
        format!("{:0width$}", chunk_id, width = self.chunk_name_length)
    }

    /// Append a fragment to its chunk, replicating into the pre/post twins
    /// when it falls inside the overlap window. Returns the primary chunk id.
    pub fn add_fragment(&mut self, fragment: &[u8], time_ns: i64) -> i64 {
        let chunk_id = self.chunk_id(time_ns);
        let nextpre = (chunk_id + 1) * self.full_chunk_length_ns - time_ns < self.chunk_overlap_ns;

        let key = self.chunk_key(chunk_id);
        self.append(key.clone(), fragment);

        if nextpre {
            let next_key = self.chunk_key(chunk_id + 1);
            self.append(format!("{}_pre", next_key), fragment);
            self.append(format!("{}_post", key), fragment);
        }

        self.packet_min = Some(match self.packet_min {
            Some(min) => min.min(chunk_id),
            None => chunk_id,
        });
        chunk_id
    }

    fn append(&mut self, key: String, fragment: &[u8]) {
        self.buffered_bytes += fragment.len();
        self.buffers.entry(key).or_default().extend_from_slice(fragment);
    }

    /// Smallest chunk id seen since the last call, resetting the tracker.
    /// `None` when no fragment was routed.
    pub fn take_watermark(&mut self) -> Option<i64> {
        self.packet_min.take()
    }

    /// Remove and return the buffers that can be finalized: chunks older
    /// than the watermark by two, or everything when `end` is set.
    /// Buffers come back in ascending key order.
    pub fn take_ready(&mut self, watermark: i64, end: bool) -> Vec<(String, Vec<u8>)> {
        let ready_keys: Vec<String> = self
            .buffers
            .keys()
            .filter(|key| {
                if end {
                    return true;
                }
                match parse_chunk_index(key, self.chunk_name_length) {
                    Some(n) => n < watermark - 1,
                    None => false,
                }
            })
            .cloned()
            .collect();

        ready_keys
            .into_iter()
            .filter_map(|key| {
                self.buffers.remove(&key).map(|buf| {
                    self.buffered_bytes -= buf.len();
                    (key, buf)
                })
            })
            .collect()
    }

    /// Bytes currently buffered across all chunks
    pub fn buffered_bytes(&self) -> usize {
        self.buffered_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Buffer keys in ascending order (test and introspection aid)
    pub fn keys(&self) -> Vec<String> {
        self.buffers.keys().cloned().collect()
    }
}

/// Numeric chunk index from the front of a buffer key
pub fn parse_chunk_index(key: &str, name_length: usize) -> Option<i64> {
    key.get(..name_length)?.parse().ok()
}
