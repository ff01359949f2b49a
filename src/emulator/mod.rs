//! Packet emulator - generates well-formed digitizer buffers for testing
//!
//! Produces [`DataPacket`]s in the 2-word-sub-header (DPP-DAW, narrow clock)
//! layout with monotonically increasing timestamps, tracking clock rollovers
//! the way the real driver does. Useful for soak-testing the inserter
//! pipeline without hardware.

use rand::Rng;

use crate::config::BoardFormat;
use crate::packet::{DataPacket, BUFFER_SENTINEL};

/// Emulator configuration
#[derive(Debug, Clone)]
pub struct EmulatorConfig {
    /// Board id stamped on generated packets
    pub board_id: i16,
    /// Channel mask of active channels
    pub channel_mask: u8,
    /// Events per generated packet
    pub events_per_packet: usize,
    /// Samples per pulse (rounded up to an even count)
    pub samples_per_pulse: usize,
    /// Clock ticks between consecutive events
    pub ticks_per_event: u64,
    /// Nanoseconds per clock tick
    pub ns_per_clk: i64,
    /// Nanoseconds per sample
    pub ns_per_sample: i16,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            board_id: 0,
            channel_mask: 0b0000_0011,
            events_per_packet: 10,
            samples_per_pulse: 100,
            ticks_per_event: 100_000,
            ns_per_clk: 10,
            ns_per_sample: 10,
        }
    }
}

/// Generates a stream of synthetic data packets
pub struct PacketEmulator {
    config: EmulatorConfig,
    /// Full-width clock; the low 31 bits go on the wire
    ticks: u64,
}

impl PacketEmulator {
    pub fn new(config: EmulatorConfig) -> Self {
        Self { config, ticks: 0 }
    }

    /// Format table entry matching the generated packets
    pub fn board_format(&self) -> BoardFormat {
        BoardFormat {
            board_id: self.config.board_id,
            channel_header_words: 2,
            channel_mask_msb_idx: -1,
            channel_time_msb_idx: -1,
            ns_per_clk: self.config.ns_per_clk,
            ns_per_sample: self.config.ns_per_sample,
            channel_map: (0..16)
                .map(|ch| self.config.board_id * 16 + ch)
                .collect(),
        }
    }

    /// Rollovers of the 31-bit clock seen so far
    fn clock_counter(&self) -> u32 {
        (self.ticks >> 31) as u32
    }

    /// Build the next packet, advancing the emulated clock
    pub fn next_packet(&mut self) -> DataPacket {
        let mut rng = rand::thread_rng();
        let channels = self.config.channel_mask.count_ones() as usize;
        let payload_words = self.config.samples_per_pulse.div_ceil(2);
        let channel_words = 2 + payload_words;
        let words_in_event = 4 + channels * channel_words;

        let clock_counter = self.clock_counter();
        let header_time = (self.ticks & 0x7FFF_FFFF) as u32;

        let mut words = Vec::with_capacity(self.config.events_per_packet * words_in_event + 1);
        for _ in 0..self.config.events_per_packet {
            let event_time = (self.ticks & 0x7FFF_FFFF) as u32;
            words.push((0xA << 28) | words_in_event as u32);
            words.push(self.config.channel_mask as u32);
            words.push(0);
            words.push(event_time);

            for channel in 0..8 {
                if (self.config.channel_mask >> channel) & 1 == 0 {
                    continue;
                }
                words.push(channel_words as u32);
                words.push(event_time);
                for _ in 0..payload_words {
                    let low: u32 = rng.gen_range(15_500..16_500);
                    let high: u32 = rng.gen_range(15_500..16_500);
                    words.push(low | (high << 16));
                }
            }

            self.ticks += self.config.ticks_per_event;
        }
        words.push(BUFFER_SENTINEL);

        DataPacket::new(self.config.board_id, words, clock_counter, header_time)
    }
}
