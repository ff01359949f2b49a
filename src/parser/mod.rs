//! Event parser for raw digitizer buffers
//!
//! Walks the 32-bit little-endian word stream of one [`DataPacket`],
//! decodes the nested event / channel headers and emits one waveform pulse
//! per channel with a reconstructed 64-bit timestamp.
//!
//! # Data format
//!
//! An event is a 4-word header followed by per-channel payloads:
//! - Word 0: `[31:28]=0xA`, `[27:0]` words in event (clamped to remaining)
//! - Word 1: `[7:0]` channel mask low bits, bit 26 board-fail flag
//! - Word 2: `[31:24]` channel mask high bits (boards with >8 channels)
//! - Word 3: event time (low bits of the hardware clock)
//!
//! DPP-DAW firmware prefixes every channel with a sub-header carrying the
//! channel word count, the channel time and optionally the time MSBs and
//! baseline. Default firmware shares the event header across channels.
//!
//! Corruption ("garbling") is recovered locally: the parser emits an
//! artificial deadtime marker at the last reconstructed timestamp, abandons
//! the rest of the event and resyncs on the next header nibble.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::common::SharedCounters;
use crate::config::FormatTable;
use crate::fragment::{Pulse, SampleView};
use crate::packet::{DataPacket, BUFFER_SENTINEL};

mod constants {
    /// Top nibble marking an event header word
    pub const HEADER_NIBBLE: u32 = 0xA;
    pub const NIBBLE_SHIFT: u32 = 28;

    /// Words in the shared event header
    pub const EVENT_HEADER_WORDS: usize = 4;

    /// Word 0: event length field
    pub const WORDS_IN_EVENT_MASK: u32 = 0x0FFF_FFFF;

    /// Word 1: low 8 mask bits and the board-fail flag
    pub const CHANNEL_MASK_LOW: u32 = 0xFF;
    pub const BOARD_FAIL_BIT: u32 = 1 << 26;

    /// Channel sub-header word 0: channel word count
    pub const CHANNEL_WORDS_MASK: u32 = 0x7F_FFFF;

    /// Channel sub-header word 2: time MSBs and baseline
    pub const TIME_MSB_MASK: u32 = 0xFFFF;
    pub const BASELINE_SHIFT: u32 = 16;
    pub const BASELINE_MASK: u32 = 0x3FFF;

    /// Channels per board (sized for the V1730)
    pub const MAX_CHANNELS: usize = 16;

    /// Narrow trigger clocks are 31 bits wide
    pub const NARROW_CLOCK_SHIFT: u32 = 31;

    /// `last_times_seen` sentinel: channel not yet seen in this packet
    pub const TIME_UNSEEN: u32 = 0xFFFF_FFFF;

    /// Rollover disambiguation thresholds: a channel time in the top third
    /// of the clock range paired with a packet header time in the bottom
    /// third (or vice versa) sits across a rollover from the header.
    pub const ROLLOVER_HIGH: u32 = 1_500_000_000;
    pub const ROLLOVER_LOW: u32 = 500_000_000;
}

/// Parser errors. Both variants indicate misconfiguration rather than data
/// corruption and abort the worker.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("No format table entry for board {0}")]
    UnknownBoard(i16),

    #[error("No global channel mapped for board {board} channel {channel}")]
    UnknownChannel { board: i16, channel: usize },
}

/// One record emitted while walking a packet
#[derive(Debug, Clone, Copy)]
pub enum ParsedRecord<'a> {
    /// A decoded waveform pulse
    Waveform(Pulse<'a>),
    /// Garbled data: mark a deadtime window at the last reconstructed time
    Deadtime { time_ns: i64 },
}

/// Per-packet parse totals
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PacketSummary {
    /// Event headers seen (including board-fail events)
    pub events: u64,
    /// Events dropped on the board-fail flag
    pub board_fails: u64,
    /// Waveform pulses emitted
    pub pulses: u64,
    /// Garbled events that produced a deadtime marker
    pub garbles: u64,
}

/// Walks raw packets and emits per-channel pulses
pub struct EventParser {
    formats: Arc<FormatTable>,
    counters: Arc<SharedCounters>,
    force_quit: Arc<AtomicBool>,
}

impl EventParser {
    pub fn new(
        formats: Arc<FormatTable>,
        counters: Arc<SharedCounters>,
        force_quit: Arc<AtomicBool>,
    ) -> Self {
        Self {
            formats,
            counters,
            force_quit,
        }
    }

    /// Parse one packet, emitting records in buffer order.
    ///
    /// Returns the packet totals; board-fail counts and per-channel byte
    /// tallies are merged into the shared counters before returning.
    pub fn parse_packet<'a, F>(
        &self,
        packet: &'a DataPacket,
        mut emit: F,
    ) -> Result<PacketSummary, ParseError>
    where
        F: FnMut(ParsedRecord<'a>),
    {
        use constants::*;

        let fmt = self
            .formats
            .board(packet.board_id)
            .ok_or(ParseError::UnknownBoard(packet.board_id))?;

        let words = &packet.words;
        let total_words = words.len();
        let mut summary = PacketSummary::default();
        let mut data_per_channel: HashMap<i16, u64> = HashMap::new();

        // Per-packet clock state, seeded with the driver's rollover count
        let mut clock_counters = [packet.clock_counter; MAX_CHANNELS];
        let mut last_times_seen = [TIME_UNSEEN; MAX_CHANNELS];

        let mut idx = 0usize;
        'walk: while idx < total_words && words[idx] != BUFFER_SENTINEL {
            if words[idx] >> NIBBLE_SHIFT != HEADER_NIBBLE {
                // Garbage between events: scan to the next plausible header
                idx += 1;
                continue;
            }

            if idx + EVENT_HEADER_WORDS > total_words {
                debug!(
                    board = packet.board_id,
                    idx, "Truncated event header at end of buffer"
                );
                break;
            }

            let claimed_words = (words[idx] & WORDS_IN_EVENT_MASK) as usize;
            let words_in_event = claimed_words.min(total_words - idx);
            if words_in_event < claimed_words {
                debug!(
                    board = packet.board_id,
                    idx,
                    claimed = claimed_words,
                    remaining = total_words - idx,
                    "Garbled event header length"
                );
            }

            let mut channel_mask = words[idx + 1] & CHANNEL_MASK_LOW;
            if fmt.channel_mask_msb_idx == 2 {
                channel_mask |= ((words[idx + 2] >> 24) & 0xFF) << 8;
            }
            let board_fail = words[idx + 1] & BOARD_FAIL_BIT != 0;
            let event_time = words[idx + 3];
            summary.events += 1;

            if board_fail {
                // No trustworthy timestamp: count it and move past the header
                self.counters.add_board_fail(packet.board_id);
                summary.board_fails += 1;
                idx += EVENT_HEADER_WORDS;
                continue;
            }

            let channels_in_event = channel_mask.count_ones() as usize;
            let event_start_idx = idx;
            idx += EVENT_HEADER_WORDS;

            'channels: for channel in 0..MAX_CHANNELS {
                if (channel_mask >> channel) & 1 == 0 {
                    continue;
                }

                // Defaults for 'default' firmware where all channels share
                // the event header and split the payload evenly
                let mut channel_words =
                    words_in_event.saturating_sub(EVENT_HEADER_WORDS) / channels_in_event;
                let mut channel_time = event_time;
                let mut channel_time_msb = 0u32;
                let mut baseline: i16 = 0;

                // A channel sub-header indicates DPP-DAW firmware, override
                if fmt.channel_header_words > 0 {
                    if idx + fmt.channel_header_words > total_words {
                        debug!(
                            board = packet.board_id,
                            channel, idx, "Channel header past end of buffer"
                        );
                        break 'channels;
                    }

                    let claimed_ch = (words[idx] & CHANNEL_WORDS_MASK) as usize;
                    let available = words_in_event.saturating_sub(idx - event_start_idx);
                    channel_words = claimed_ch.min(available);
                    if channel_words < claimed_ch {
                        debug!(
                            board = packet.board_id,
                            channel,
                            idx,
                            claimed = claimed_ch,
                            available,
                            "Garbled channel header"
                        );
                        idx += fmt.channel_header_words;
                        break 'channels;
                    }
                    if channel_words <= fmt.channel_header_words {
                        debug!(
                            board = packet.board_id,
                            channel,
                            words = channel_words,
                            "Empty channel"
                        );
                        idx += fmt.channel_header_words - channel_words;
                        continue;
                    }
                    channel_words -= fmt.channel_header_words;
                    channel_time = words[idx + 1];

                    if fmt.channel_time_msb_idx == 2 {
                        channel_time_msb = words[idx + 2] & TIME_MSB_MASK;
                        baseline = ((words[idx + 2] >> BASELINE_SHIFT) & BASELINE_MASK) as i16;
                    }

                    idx += fmt.channel_header_words;

                    if fmt.has_narrow_clock() {
                        adjust_clock(
                            &mut clock_counters[channel],
                            &mut last_times_seen[channel],
                            channel_time,
                            packet.header_time,
                        );
                    }
                }

                // Sanity-check the payload: a header nibble inside it or a
                // run past the buffer means the board garbled the stream
                let mut whoops = false;
                for w in 0..channel_words {
                    if idx + w >= total_words || words[idx + w] >> NIBBLE_SHIFT == HEADER_NIBBLE {
                        debug!(
                            board = packet.board_id,
                            idx = idx + w,
                            "Header nibble inside channel payload"
                        );
                        whoops = true;
                        break;
                    }
                }
                if idx - event_start_idx >= words_in_event {
                    debug!(
                        board = packet.board_id,
                        idx, "Channel payload overruns event"
                    );
                    whoops = true;
                }

                let time64_clk = if fmt.channel_time_msb_idx == 2 {
                    ((channel_time_msb as i64) << 32) | channel_time as i64
                } else {
                    ((clock_counters[channel] as i64) << NARROW_CLOCK_SHIFT) | channel_time as i64
                };
                let time_ns = fmt.ns_per_clk * time64_clk;

                if whoops {
                    emit(ParsedRecord::Deadtime { time_ns });
                    summary.garbles += 1;
                    break 'channels;
                }

                let global_channel =
                    fmt.global_channel(channel)
                        .ok_or(ParseError::UnknownChannel {
                            board: packet.board_id,
                            channel,
                        })?;

                let samples_in_pulse = channel_words * 2;
                *data_per_channel.entry(global_channel).or_insert(0) +=
                    samples_in_pulse as u64 * 2;

                emit(ParsedRecord::Waveform(Pulse {
                    channel: global_channel,
                    time_ns,
                    sample_width_ns: fmt.ns_per_sample,
                    baseline,
                    samples: SampleView::new(&words[idx..idx + channel_words]),
                }));
                summary.pulses += 1;

                idx += channel_words;
                if self.force_quit.load(Ordering::Relaxed) {
                    break 'channels;
                }
            }

            if self.force_quit.load(Ordering::Relaxed) {
                break 'walk;
            }
        }

        self.counters.add_channel_data(&data_per_channel);
        Ok(summary)
    }
}

/// Narrow-clock rollover tracking, applied per channel.
///
/// On the first observation of a channel in a packet the channel time is
/// compared against the packet header time: a channel in the pre-rollover
/// epoch takes one rollover back, a channel past a rollover the header has
/// not seen yet takes one forward. After that, any decrease of the channel
/// time within the packet counts a rollover.
fn adjust_clock(clock_counter: &mut u32, last_time_seen: &mut u32, channel_time: u32, header_time: u32) {
    use constants::{ROLLOVER_HIGH, ROLLOVER_LOW, TIME_UNSEEN};

    if channel_time > ROLLOVER_HIGH
        && header_time < ROLLOVER_LOW
        && *last_time_seen == TIME_UNSEEN
        && *clock_counter != 0
    {
        *clock_counter -= 1;
    } else if channel_time < ROLLOVER_LOW
        && header_time > ROLLOVER_HIGH
        && *last_time_seen == TIME_UNSEEN
    {
        *clock_counter += 1;
    }

    if channel_time < *last_time_seen && *last_time_seen != TIME_UNSEEN {
        *clock_counter += 1;
    }

    *last_time_seen = channel_time;
}
