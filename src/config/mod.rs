//! Configuration module for the strax sink
//!
//! Supports loading configuration from TOML files:
//! - `[options]` — chunking, compression and output settings
//! - `[[board]]` — per-board data format and channel map (see [`format`])
//!
//! # Example
//! ```ignore
//! let config = Config::load("strax.toml")?;
//! let chunk_ns = config.options.chunk_length_ns();
//! ```

pub mod format;

pub use format::{BoardFormat, FormatTable};

use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Duplicate board id {0} in format table")]
    DuplicateBoard(i16),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub options: StraxOptions,

    /// Per-board format entries
    #[serde(default, rename = "board")]
    pub boards: Vec<BoardFormat>,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Load configuration from a TOML string (useful for testing)
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Build the board-indexed format table
    pub fn format_table(&self) -> Result<FormatTable, ConfigError> {
        FormatTable::from_boards(self.boards.clone())
    }
}

/// Output compressor selection
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Compressor {
    #[default]
    Lz4,
    Zstd,
}

/// Upstream dequeue mode: batched lists or one packet at a time
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BufferType {
    #[default]
    Dual,
    Single,
}

/// Chunking, compression and output settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StraxOptions {
    /// Chunk length in seconds
    pub strax_chunk_length: f64,
    /// Chunk overlap in seconds
    pub strax_chunk_overlap: f64,
    /// Fragment payload size in bytes
    pub strax_fragment_payload_bytes: usize,
    /// Output compressor
    pub compressor: Compressor,
    /// Root of the output tree
    pub strax_output_path: PathBuf,
    /// Run directory name under the output path
    pub run_identifier: String,
    /// Upstream dequeue mode
    pub buffer_type: BufferType,
    /// Width of zero-padded chunk names
    pub chunk_name_length: usize,
}

impl Default for StraxOptions {
    fn default() -> Self {
        Self {
            strax_chunk_length: 5.0,
            strax_chunk_overlap: 0.5,
            strax_fragment_payload_bytes: 110 * 2,
            compressor: Compressor::Lz4,
            strax_output_path: PathBuf::from("./"),
            run_identifier: "run".to_string(),
            buffer_type: BufferType::Dual,
            chunk_name_length: 6,
        }
    }
}

impl StraxOptions {
    /// Chunk length in nanoseconds
    pub fn chunk_length_ns(&self) -> i64 {
        (self.strax_chunk_length * 1e9) as i64
    }

    /// Chunk overlap in nanoseconds
    pub fn chunk_overlap_ns(&self) -> i64 {
        (self.strax_chunk_overlap * 1e9) as i64
    }

    /// Chunk length plus overlap, the stride used for chunk indexing
    pub fn full_chunk_length_ns(&self) -> i64 {
        self.chunk_length_ns() + self.chunk_overlap_ns()
    }

    /// Output directory for this run
    pub fn run_path(&self) -> PathBuf {
        self.strax_output_path.join(&self.run_identifier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_daq_settings() {
        let opts = StraxOptions::default();
        assert_eq!(opts.strax_chunk_length, 5.0);
        assert_eq!(opts.strax_chunk_overlap, 0.5);
        assert_eq!(opts.strax_fragment_payload_bytes, 220);
        assert_eq!(opts.compressor, Compressor::Lz4);
        assert_eq!(opts.buffer_type, BufferType::Dual);
        assert_eq!(opts.chunk_name_length, 6);
        assert_eq!(opts.chunk_length_ns(), 5_000_000_000);
        assert_eq!(opts.chunk_overlap_ns(), 500_000_000);
        assert_eq!(opts.full_chunk_length_ns(), 5_500_000_000);
    }

    #[test]
    fn empty_toml_gives_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.options.run_identifier, "run");
        assert!(config.boards.is_empty());
    }

    #[test]
    fn parse_full_config() {
        let toml = r#"
            [options]
            strax_chunk_length = 2.0
            strax_chunk_overlap = 0.25
            strax_fragment_payload_bytes = 100
            compressor = "zstd"
            strax_output_path = "/data"
            run_identifier = "run_000123"
            buffer_type = "single"

            [[board]]
            board_id = 170
            channel_header_words = 2
            ns_per_clk = 10
            ns_per_sample = 10
            channel_map = [0, 1, 2, 3]
        "#;

        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.options.strax_chunk_length, 2.0);
        assert_eq!(config.options.compressor, Compressor::Zstd);
        assert_eq!(config.options.buffer_type, BufferType::Single);
        assert_eq!(config.options.run_path(), PathBuf::from("/data/run_000123"));
        assert_eq!(config.boards.len(), 1);
        assert_eq!(config.boards[0].board_id, 170);
    }

    #[test]
    fn duplicate_board_rejected() {
        let toml = r#"
            [[board]]
            board_id = 1
            channel_map = [0]

            [[board]]
            board_id = 1
            channel_map = [1]
        "#;
        let config = Config::from_toml(toml).unwrap();
        assert!(matches!(
            config.format_table(),
            Err(ConfigError::DuplicateBoard(1))
        ));
    }
}
