//! Per-board data format table
//!
//! Each digitizer board announces its payload layout through a format entry:
//! whether channels carry their own sub-headers (DPP-DAW firmware), where the
//! channel mask and time MSBs live, and the clock calibration. The table also
//! carries the board's channel map, translating a local channel index into
//! the experiment-wide channel id stamped on every fragment.

use serde::Deserialize;
use std::collections::HashMap;

use super::ConfigError;

/// Format entry for one board
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BoardFormat {
    /// Board id, matches `DataPacket::board_id`
    pub board_id: i16,

    /// Words in the per-channel sub-header.
    /// 0 for default firmware (all channels share the event header),
    /// >0 for DPP-DAW firmware.
    pub channel_header_words: usize,

    /// Word index of the channel-mask MSBs in the event header,
    /// -1 if the mask is only the 8 bits in word 1
    pub channel_mask_msb_idx: i32,

    /// Word index of the 16-bit time MSB (and 14-bit baseline) in the
    /// channel sub-header; 2 for wide-clock firmware, -1 for narrow clocks
    /// with software-tracked rollovers
    pub channel_time_msb_idx: i32,

    /// Nanoseconds per clock tick
    pub ns_per_clk: i64,

    /// Nanoseconds per waveform sample
    pub ns_per_sample: i16,

    /// Local channel index to global channel id
    pub channel_map: Vec<i16>,
}

impl Default for BoardFormat {
    fn default() -> Self {
        Self {
            board_id: 0,
            channel_header_words: 0,
            channel_mask_msb_idx: -1,
            channel_time_msb_idx: -1,
            ns_per_clk: 10,
            ns_per_sample: 10,
            channel_map: Vec::new(),
        }
    }
}

impl BoardFormat {
    /// Whether the hardware clock is narrow and needs software rollover
    /// tracking. Wide-clock boards ship the MSBs in the channel sub-header.
    pub fn has_narrow_clock(&self) -> bool {
        self.channel_header_words > 0 && self.channel_header_words <= 2
    }

    /// Global channel id for a local channel index, if mapped
    pub fn global_channel(&self, channel: usize) -> Option<i16> {
        self.channel_map.get(channel).copied()
    }
}

/// Board-indexed format table
#[derive(Debug, Clone, Default)]
pub struct FormatTable {
    boards: HashMap<i16, BoardFormat>,
}

impl FormatTable {
    /// Build a table from board entries, rejecting duplicate ids
    pub fn from_boards(boards: Vec<BoardFormat>) -> Result<Self, ConfigError> {
        let mut map = HashMap::with_capacity(boards.len());
        for board in boards {
            if map.insert(board.board_id, board.clone()).is_some() {
                return Err(ConfigError::DuplicateBoard(board.board_id));
            }
        }
        Ok(Self { boards: map })
    }

    /// Format entry for a board id
    pub fn board(&self, board_id: i16) -> Option<&BoardFormat> {
        self.boards.get(&board_id)
    }

    pub fn is_empty(&self) -> bool {
        self.boards.is_empty()
    }

    pub fn len(&self) -> usize {
        self.boards.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v1724_like() -> BoardFormat {
        BoardFormat {
            board_id: 170,
            channel_header_words: 2,
            channel_mask_msb_idx: -1,
            channel_time_msb_idx: -1,
            ns_per_clk: 10,
            ns_per_sample: 10,
            channel_map: vec![10, 11, 12, 13],
        }
    }

    #[test]
    fn narrow_clock_detection() {
        let mut fmt = v1724_like();
        assert!(fmt.has_narrow_clock());

        // Wide-clock firmware with a 3-word sub-header
        fmt.channel_header_words = 3;
        fmt.channel_time_msb_idx = 2;
        assert!(!fmt.has_narrow_clock());

        // Default firmware has no sub-header at all
        fmt.channel_header_words = 0;
        assert!(!fmt.has_narrow_clock());
    }

    #[test]
    fn channel_lookup() {
        let fmt = v1724_like();
        assert_eq!(fmt.global_channel(0), Some(10));
        assert_eq!(fmt.global_channel(3), Some(13));
        assert_eq!(fmt.global_channel(4), None);
    }

    #[test]
    fn table_lookup() {
        let table = FormatTable::from_boards(vec![v1724_like()]).unwrap();
        assert_eq!(table.len(), 1);
        assert!(table.board(170).is_some());
        assert!(table.board(171).is_none());
    }
}
