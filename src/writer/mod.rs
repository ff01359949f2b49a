//! Chunk writer: compress, write-then-rename, synthesize placeholders
//!
//! Finalized chunk buffers are compressed and staged under
//! `<run>/<chunk>_temp/<hostname>_<worker_id>`, then renamed into
//! `<run>/<chunk>/` in one atomic step, so a file visible under its final
//! path is always complete. After each finalized chunk the writer back-fills
//! empty placeholder files for every older chunk that received no data, so
//! downstream readers always see a dense run directory.
//!
//! At end of run all remaining buffers are flushed and an empty sentinel is
//! dropped under `THE_END/`.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use lz4_flex::frame::{BlockMode, BlockSize, FrameDecoder, FrameEncoder, FrameInfo};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::Compressor;
use crate::router::{parse_chunk_index, ChunkRouter};

/// Name of the end-of-run sentinel directory
pub const END_DIRECTORY: &str = "THE_END";

/// zstd compression level (library default)
const ZSTD_LEVEL: i32 = 3;

/// Writer errors
#[derive(Debug, Error)]
pub enum WriterError {
    #[error("Failed to create run output directory {path}: {source}")]
    OutputInit {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Frame preferences for the lz4 codec: 256 KB linked blocks, no checksums
fn lz4_frame_info() -> FrameInfo {
    FrameInfo::new()
        .block_size(BlockSize::Max256KB)
        .block_mode(BlockMode::Linked)
}

/// Compress a chunk buffer with the selected codec
pub fn compress(compressor: Compressor, data: &[u8]) -> io::Result<Vec<u8>> {
    match compressor {
        Compressor::Lz4 => {
            let mut encoder = FrameEncoder::with_frame_info(lz4_frame_info(), Vec::new());
            encoder.write_all(data)?;
            encoder.finish().map_err(io::Error::other)
        }
        Compressor::Zstd => zstd::stream::encode_all(data, ZSTD_LEVEL),
    }
}

/// Decompress a chunk file (reader side of [`compress`])
pub fn decompress(compressor: Compressor, data: &[u8]) -> io::Result<Vec<u8>> {
    match compressor {
        Compressor::Lz4 => {
            let mut decoder = FrameDecoder::new(data);
            let mut out = Vec::new();
            decoder.read_to_end(&mut out)?;
            Ok(out)
        }
        Compressor::Zstd => zstd::stream::decode_all(data),
    }
}

/// Writes finalized chunks for one worker
pub struct ChunkWriter {
    /// `<strax_output_path>/<run_identifier>`
    run_path: PathBuf,
    /// `<hostname>_<worker_id>`, distinct per worker within a chunk directory
    filename: String,
    compressor: Compressor,
    chunk_name_length: usize,
    /// Placeholder cursor: every chunk below this has been back-filled
    missing_verified: i64,
    compression_time: Duration,
}

impl ChunkWriter {
    /// Create a writer and the run output directory.
    ///
    /// Failure to create the run directory is fatal: the worker refuses to
    /// start rather than drop every chunk later.
    pub fn new(
        run_path: PathBuf,
        compressor: Compressor,
        chunk_name_length: usize,
        hostname: &str,
        worker_id: usize,
    ) -> Result<Self, WriterError> {
        fs::create_dir_all(&run_path).map_err(|source| WriterError::OutputInit {
            path: run_path.clone(),
            source,
        })?;

        Ok(Self {
            run_path,
            filename: format!("{}_{}", hostname, worker_id),
            compressor,
            chunk_name_length,
            missing_verified: 0,
            compression_time: Duration::ZERO,
        })
    }

    /// Finalize every chunk the router reports ready.
    ///
    /// A failed chunk is logged and dropped; the run continues. When `end`
    /// is set, all remaining buffers are flushed and the end-of-run sentinel
    /// is written.
    pub fn flush(&mut self, router: &mut ChunkRouter, watermark: i64, end: bool) {
        for (key, buffer) in router.take_ready(watermark, end) {
            if let Err(e) = self.finalize_chunk(&key, &buffer) {
                warn!(chunk = %key, error = %e, "Failed to write chunk, dropping it");
            }
        }

        if end {
            if let Err(e) = self.write_end_sentinel() {
                warn!(error = %e, "Failed to write end-of-run sentinel");
            }
        }
    }

    /// Compress one buffer, stage it under the `_temp` twin directory and
    /// rename it into place, then back-fill placeholders up to this chunk.
    fn finalize_chunk(&mut self, key: &str, buffer: &[u8]) -> Result<(), WriterError> {
        let comp_start = Instant::now();
        let compressed = compress(self.compressor, buffer)?;

        let temp_dir = self.directory_path(key, true);
        fs::create_dir_all(&temp_dir)?;
        let temp_file = temp_dir.join(&self.filename);
        fs::write(&temp_file, &compressed)?;

        let final_dir = self.directory_path(key, false);
        fs::create_dir_all(&final_dir)?;
        fs::rename(&temp_file, final_dir.join(&self.filename))?;
        // Best effort: another worker may still be staging here
        let _ = fs::remove_dir(&temp_dir);

        self.compression_time += comp_start.elapsed();
        debug!(
            chunk = %key,
            raw_bytes = buffer.len(),
            compressed_bytes = compressed.len(),
            "Finalized chunk"
        );

        if let Some(n) = parse_chunk_index(key, self.chunk_name_length) {
            self.create_missing(n)?;
        }
        Ok(())
    }

    /// Create empty placeholder files for every chunk in
    /// `[missing_verified, up_to)` that has no file from this worker yet.
    fn create_missing(&mut self, up_to: i64) -> Result<(), WriterError> {
        for x in self.missing_verified..up_to {
            let key = self.chunk_key(x);
            self.create_placeholder(&key)?;
            if x != 0 {
                self.create_placeholder(&format!("{}_pre", key))?;
            }
            self.create_placeholder(&format!("{}_post", key))?;
        }
        self.missing_verified = self.missing_verified.max(up_to);
        Ok(())
    }

    fn create_placeholder(&self, key: &str) -> Result<(), WriterError> {
        let path = self.file_path(key, false);
        if path.exists() {
            return Ok(());
        }
        fs::create_dir_all(self.directory_path(key, false))?;
        File::create(&path)?;
        Ok(())
    }

    /// Drop the empty end-of-run sentinel under `THE_END/`
    fn write_end_sentinel(&self) -> Result<(), WriterError> {
        let end_dir = self.run_path.join(END_DIRECTORY);
        fs::create_dir_all(&end_dir)?;
        File::create(end_dir.join(&self.filename))?;
        info!(path = %end_dir.display(), "Wrote end-of-run sentinel");
        Ok(())
    }

    fn chunk_key(&self, chunk_id: i64) -> String {
        format!("{:0width$}", chunk_id, width = self.chunk_name_length)
    }

    fn directory_path(&self, key: &str, temp: bool) -> PathBuf {
        if temp {
            self.run_path.join(format!("{}_temp", key))
        } else {
            self.run_path.join(key)
        }
    }

    fn file_path(&self, key: &str, temp: bool) -> PathBuf {
        self.directory_path(key, temp).join(&self.filename)
    }

    /// Run output directory
    pub fn run_path(&self) -> &Path {
        &self.run_path
    }

    /// Worker file name within chunk directories
    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Time spent compressing and writing, microseconds
    pub fn compression_us(&self) -> u64 {
        self.compression_time.as_micros() as u64
    }
}
