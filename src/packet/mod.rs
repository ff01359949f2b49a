//! Data packets and the upstream packet source
//!
//! A [`DataPacket`] is one board readout: a contiguous buffer of 32-bit
//! little-endian words plus the clock bookkeeping the driver attaches at
//! readout time. Packets are owned by the worker that dequeues them and are
//! dropped after parsing.
//!
//! The upstream queue is abstracted behind [`PacketSource`] so workers can
//! run against the real driver, the emulator or a test fixture. Dequeues
//! are non-blocking; workers sleep briefly on a miss.

use crossbeam_queue::SegQueue;

/// Terminates the word walk inside a packet
pub const BUFFER_SENTINEL: u32 = 0xFFFF_FFFF;

/// One raw readout from one board
#[derive(Debug, Clone)]
pub struct DataPacket {
    /// Board that produced this buffer, keys the format table
    pub board_id: i16,
    /// Raw payload, one or more events back-to-back
    pub words: Vec<u32>,
    /// Driver's running count of known clock rollovers
    pub clock_counter: u32,
    /// First event time of the packet, used for rollover disambiguation
    pub header_time: u32,
}

impl DataPacket {
    pub fn new(board_id: i16, words: Vec<u32>, clock_counter: u32, header_time: u32) -> Self {
        Self {
            board_id,
            words,
            clock_counter,
            header_time,
        }
    }

    /// Payload size in bytes
    pub fn size_bytes(&self) -> usize {
        self.words.len() * std::mem::size_of::<u32>()
    }
}

/// Non-blocking upstream packet source
///
/// The source handles its own synchronization; ownership of returned
/// packets transfers to the caller.
pub trait PacketSource: Send + Sync {
    /// Dequeue a single packet, if one is available
    fn try_dequeue(&self) -> Option<DataPacket>;

    /// Dequeue everything currently available, if anything is
    fn try_dequeue_batch(&self) -> Option<Vec<DataPacket>>;

    /// Packets currently queued (approximate)
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Lock-free in-memory packet queue
///
/// Multiple producers push readouts, multiple workers pop them. Batch
/// dequeues drain whatever is queued at call time.
#[derive(Debug, Default)]
pub struct PacketQueue {
    inner: SegQueue<DataPacket>,
}

impl PacketQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, packet: DataPacket) {
        self.inner.push(packet);
    }
}

impl PacketSource for PacketQueue {
    fn try_dequeue(&self) -> Option<DataPacket> {
        self.inner.pop()
    }

    fn try_dequeue_batch(&self) -> Option<Vec<DataPacket>> {
        let mut batch = Vec::new();
        while let Some(packet) = self.inner.pop() {
            batch.push(packet);
        }
        if batch.is_empty() {
            None
        } else {
            Some(batch)
        }
    }

    fn len(&self) -> usize {
        self.inner.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(board_id: i16) -> DataPacket {
        DataPacket::new(board_id, vec![0xA000_0004, 0, 0, 0], 0, 0)
    }

    #[test]
    fn size_in_bytes() {
        let p = packet(1);
        assert_eq!(p.size_bytes(), 16);
    }

    #[test]
    fn single_dequeue_fifo() {
        let queue = PacketQueue::new();
        queue.push(packet(1));
        queue.push(packet(2));

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.try_dequeue().unwrap().board_id, 1);
        assert_eq!(queue.try_dequeue().unwrap().board_id, 2);
        assert!(queue.try_dequeue().is_none());
    }

    #[test]
    fn batch_dequeue_drains() {
        let queue = PacketQueue::new();
        for id in 0..5 {
            queue.push(packet(id));
        }

        let batch = queue.try_dequeue_batch().unwrap();
        assert_eq!(batch.len(), 5);
        assert!(queue.is_empty());
        assert!(queue.try_dequeue_batch().is_none());
    }
}
