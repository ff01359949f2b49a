//! Shared counters for inserter workers
//!
//! # Design Principles (KISS)
//! - Lock-free atomic counters for the hot path (events, fragments, bytes)
//! - Mutex-held maps for the low-rate per-board / per-channel tallies
//! - Readers drain the maps and reset them, so consecutive reads report deltas

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::Serialize;

/// Counters shared between workers and the controller.
///
/// The atomic totals are updated on every event and never reset; the two
/// maps accumulate between drains. All atomic operations use Relaxed
/// ordering, eventual consistency is fine for monitoring.
#[derive(Debug, Default)]
pub struct SharedCounters {
    /// Events parsed (one per event header, including board-fail events)
    pub events: AtomicU64,
    /// Fragments appended to chunk buffers
    pub fragments: AtomicU64,
    /// Raw packet bytes consumed
    pub bytes: AtomicU64,
    /// Board-fail events per board id
    fail_counter: Mutex<HashMap<i16, u64>>,
    /// Waveform bytes per global channel id
    data_per_channel: Mutex<HashMap<i16, u64>>,
}

impl SharedCounters {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn add_events(&self, n: u64) {
        self.events.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_fragments(&self, n: u64) {
        self.fragments.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_bytes(&self, n: u64) {
        self.bytes.fetch_add(n, Ordering::Relaxed);
    }

    /// Record one board-fail event for `board_id`.
    pub fn add_board_fail(&self, board_id: i16) {
        let mut map = self.fail_counter.lock().unwrap_or_else(|e| e.into_inner());
        *map.entry(board_id).or_insert(0) += 1;
    }

    /// Merge a per-packet channel tally into the shared map.
    pub fn add_channel_data(&self, per_channel: &HashMap<i16, u64>) {
        if per_channel.is_empty() {
            return;
        }
        let mut map = self
            .data_per_channel
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        for (channel, bytes) in per_channel {
            *map.entry(*channel).or_insert(0) += bytes;
        }
    }

    /// Return the accumulated board-fail counts and reset them.
    pub fn drain_fail_counter(&self) -> HashMap<i16, u64> {
        let mut map = self.fail_counter.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *map)
    }

    /// Return the accumulated per-channel byte counts and reset them.
    pub fn drain_data_per_channel(&self) -> HashMap<i16, u64> {
        let mut map = self
            .data_per_channel
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *map)
    }

    /// Snapshot of the atomic totals.
    pub fn totals(&self) -> CounterTotals {
        CounterTotals {
            events: self.events.load(Ordering::Relaxed),
            fragments: self.fragments.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time snapshot of the atomic totals
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterTotals {
    pub events: u64,
    pub fragments: u64,
    pub bytes: u64,
}

/// Per-worker totals surfaced when the worker stops
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkerReport {
    pub worker_id: usize,
    /// Raw packet bytes parsed
    pub bytes_processed: u64,
    /// Event headers seen
    pub events_processed: u64,
    /// Fragments written into chunk buffers
    pub fragments_processed: u64,
    /// Data packets consumed
    pub data_packets: u64,
    /// Histogram of dequeued batch sizes
    pub batch_size_counts: BTreeMap<usize, u64>,
    /// Wall time spent parsing and routing, microseconds
    pub processing_us: u64,
    /// Wall time spent compressing and writing, microseconds
    pub compression_us: u64,
}

impl WorkerReport {
    pub fn new(worker_id: usize) -> Self {
        Self {
            worker_id,
            ..Default::default()
        }
    }

    /// Record one dequeued batch of `size` packets.
    pub fn record_batch(&mut self, size: usize) {
        *self.batch_size_counts.entry(size).or_insert(0) += 1;
        self.data_packets += size as u64;
    }
}
