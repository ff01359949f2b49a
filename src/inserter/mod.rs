//! Inserter worker: packet source → parser → router → writer
//!
//! Each worker owns a private parser, router and writer and runs on its own
//! OS thread. Workers share nothing but the upstream packet queue and the
//! introspection counters, so any number of them can run over disjoint
//! boards without coordination.
//!
//! Shutdown is two-staged: a soft stop lets the worker finish its current
//! batch and run a final writer pass; if the batch stops shrinking the
//! controller escalates to force-quit, the worker drops the unparsed tail
//! and the final writer pass still runs.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{info, warn};

use crate::common::{SharedCounters, WorkerReport};
use crate::config::{BufferType, FormatTable, StraxOptions};
use crate::fragment::FragmentBuilder;
use crate::packet::{DataPacket, PacketSource};
use crate::parser::{EventParser, ParseError, ParsedRecord};
use crate::router::ChunkRouter;
use crate::writer::{ChunkWriter, WriterError};

/// Sleep between dequeue attempts when the queue is empty
const DEQUEUE_SLEEP: Duration = Duration::from_micros(10);

/// Inserter errors
#[derive(Debug, Error)]
pub enum InserterError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Writer(#[from] WriterError),

    #[error("Failed to spawn worker thread: {0}")]
    Spawn(std::io::Error),

    #[error("Worker thread panicked")]
    WorkerPanic,
}

/// Handle to a running inserter worker
pub struct Inserter {
    worker_id: usize,
    active: Arc<AtomicBool>,
    force_quit: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    buffer_length: Arc<AtomicUsize>,
    handle: JoinHandle<Result<WorkerReport, InserterError>>,
}

impl Inserter {
    /// Create the run output directory and spawn a worker thread.
    ///
    /// Fails without starting the thread when the output directory cannot
    /// be created.
    pub fn spawn(
        options: &StraxOptions,
        formats: Arc<FormatTable>,
        counters: Arc<SharedCounters>,
        source: Arc<dyn PacketSource>,
        hostname: &str,
        worker_id: usize,
    ) -> Result<Self, InserterError> {
        let writer = ChunkWriter::new(
            options.run_path(),
            options.compressor,
            options.chunk_name_length,
            hostname,
            worker_id,
        )?;

        let active = Arc::new(AtomicBool::new(true));
        let force_quit = Arc::new(AtomicBool::new(false));
        let running = Arc::new(AtomicBool::new(false));
        let buffer_length = Arc::new(AtomicUsize::new(0));

        let worker = Worker {
            buffer_type: options.buffer_type,
            parser: EventParser::new(formats, counters.clone(), force_quit.clone()),
            builder: FragmentBuilder::new(options.strax_fragment_payload_bytes),
            router: ChunkRouter::new(
                options.chunk_length_ns(),
                options.chunk_overlap_ns(),
                options.chunk_name_length,
            ),
            writer,
            counters,
            source,
            active: active.clone(),
            force_quit: force_quit.clone(),
            running: running.clone(),
            buffer_length: buffer_length.clone(),
            report: WorkerReport::new(worker_id),
            processing_time: Duration::ZERO,
        };

        let handle = thread::Builder::new()
            .name(format!("inserter-{}", worker_id))
            .spawn(move || worker.run())
            .map_err(InserterError::Spawn)?;

        info!(worker = worker_id, "Spawned inserter worker");

        Ok(Self {
            worker_id,
            active,
            force_quit,
            running,
            buffer_length,
            handle,
        })
    }

    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    /// Whether the worker thread is still in its dequeue loop
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Packets of the current batch not yet parsed
    pub fn queued(&self) -> usize {
        self.buffer_length.load(Ordering::SeqCst)
    }

    /// Stop the worker and collect its report.
    ///
    /// The worker finishes its current batch and runs a final writer pass.
    /// If the batch stops shrinking for ~5 s the controller sets the
    /// force-quit flag: the unparsed tail is dropped and the final writer
    /// pass still runs.
    pub fn stop(self) -> Result<WorkerReport, InserterError> {
        let Self {
            worker_id,
            active,
            force_quit,
            running,
            buffer_length,
            handle,
        } = self;

        active.store(false, Ordering::SeqCst);
        info!(
            worker = worker_id,
            remaining = buffer_length.load(Ordering::SeqCst),
            "Waiting for inserter to stop"
        );

        let mut rounds = 0;
        loop {
            let batch_at_start = buffer_length.load(Ordering::SeqCst);
            let mut ticks = 0;
            while running.load(Ordering::SeqCst) && ticks < 500 {
                thread::sleep(Duration::from_millis(10));
                ticks += 1;
            }
            if ticks >= 500 {
                warn!(
                    worker = worker_id,
                    remaining = buffer_length.load(Ordering::SeqCst),
                    "Inserter taking a while to stop"
                );
            }

            let batch_now = buffer_length.load(Ordering::SeqCst);
            let still_draining = running.load(Ordering::SeqCst)
                && batch_now > 0
                && batch_at_start > batch_now
                && rounds < 10;
            if !still_draining {
                break;
            }
            rounds += 1;
        }

        if running.load(Ordering::SeqCst) {
            warn!(
                worker = worker_id,
                lost = buffer_length.load(Ordering::SeqCst),
                "Force-quitting inserter, unparsed packets dropped"
            );
            force_quit.store(true, Ordering::SeqCst);
        }

        match handle.join() {
            Ok(result) => result,
            Err(_) => Err(InserterError::WorkerPanic),
        }
    }
}

/// Worker state, owned by the worker thread
struct Worker {
    buffer_type: BufferType,
    parser: EventParser,
    builder: FragmentBuilder,
    router: ChunkRouter,
    writer: ChunkWriter,
    counters: Arc<SharedCounters>,
    source: Arc<dyn PacketSource>,
    active: Arc<AtomicBool>,
    force_quit: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    buffer_length: Arc<AtomicUsize>,
    report: WorkerReport,
    processing_time: Duration,
}

impl Worker {
    fn run(mut self) -> Result<WorkerReport, InserterError> {
        self.running.store(true, Ordering::SeqCst);
        let result = self.run_inner();
        self.running.store(false, Ordering::SeqCst);

        result.map(|()| {
            self.report.processing_us = self.processing_time.as_micros() as u64;
            self.report.compression_us = self.writer.compression_us();
            info!(
                worker = self.report.worker_id,
                bytes = self.report.bytes_processed,
                events = self.report.events_processed,
                fragments = self.report.fragments_processed,
                "Inserter stopped"
            );
            self.report
        })
    }

    fn run_inner(&mut self) -> Result<(), InserterError> {
        match self.buffer_type {
            BufferType::Dual => self.run_batched()?,
            BufferType::Single => self.run_single()?,
        }

        // Final pass: flush every remaining buffer and drop the sentinel
        if self.report.bytes_processed > 0 {
            self.writer.flush(&mut self.router, 0, true);
        }
        Ok(())
    }

    fn run_batched(&mut self) -> Result<(), InserterError> {
        while self.active.load(Ordering::SeqCst) {
            match self.source.try_dequeue_batch() {
                Some(batch) => {
                    self.buffer_length.store(batch.len(), Ordering::SeqCst);
                    self.report.record_batch(batch.len());
                    for packet in batch {
                        if self.force_quit.load(Ordering::SeqCst) {
                            break;
                        }
                        self.process_packet(&packet)?;
                        self.buffer_length.fetch_sub(1, Ordering::SeqCst);
                    }
                    // A force-quit leaves the unparsed tail behind; the
                    // packets are freed with the batch
                    self.buffer_length.store(0, Ordering::SeqCst);
                }
                None => thread::sleep(DEQUEUE_SLEEP),
            }
        }
        Ok(())
    }

    fn run_single(&mut self) -> Result<(), InserterError> {
        while self.active.load(Ordering::SeqCst) {
            match self.source.try_dequeue() {
                Some(packet) => {
                    self.buffer_length.store(1, Ordering::SeqCst);
                    self.report.record_batch(1);
                    self.process_packet(&packet)?;
                    self.buffer_length.store(0, Ordering::SeqCst);
                }
                None => thread::sleep(DEQUEUE_SLEEP),
            }
        }
        Ok(())
    }

    /// Parse one packet, route its fragments and trigger the writer with
    /// the packet's watermark
    fn process_packet(&mut self, packet: &DataPacket) -> Result<(), InserterError> {
        let proc_start = Instant::now();

        let router = &mut self.router;
        let builder = &self.builder;
        let force_quit = &self.force_quit;
        let mut fragments = 0u64;

        let summary = self.parser.parse_packet(packet, |record| match record {
            ParsedRecord::Waveform(pulse) => {
                for (bytes, time_ns) in builder.pulse_fragments(&pulse) {
                    router.add_fragment(&bytes, time_ns);
                    fragments += 1;
                    if force_quit.load(Ordering::Relaxed) {
                        break;
                    }
                }
            }
            ParsedRecord::Deadtime { time_ns } => {
                let bytes = builder.artificial_deadtime(time_ns);
                router.add_fragment(&bytes, time_ns);
            }
        })?;

        self.processing_time += proc_start.elapsed();
        self.report.bytes_processed += packet.size_bytes() as u64;
        self.report.events_processed += summary.events;
        self.report.fragments_processed += fragments;
        self.counters.add_events(summary.events);
        self.counters.add_fragments(fragments);
        self.counters.add_bytes(packet.size_bytes() as u64);

        if let Some(watermark) = self.router.take_watermark() {
            self.writer.flush(&mut self.router, watermark, false);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BoardFormat, Compressor};
    use crate::packet::PacketQueue;
    use std::path::PathBuf;
    use tempfile::TempDir;

    const BOARD: i16 = 10;

    fn test_options(dir: &TempDir) -> StraxOptions {
        StraxOptions {
            strax_output_path: PathBuf::from(dir.path()),
            run_identifier: "run_test".to_string(),
            compressor: Compressor::Lz4,
            ..Default::default()
        }
    }

    fn test_formats() -> Arc<FormatTable> {
        let fmt = BoardFormat {
            board_id: BOARD,
            channel_header_words: 0,
            ns_per_clk: 10,
            ns_per_sample: 10,
            channel_map: (0..16).collect(),
            ..Default::default()
        };
        Arc::new(FormatTable::from_boards(vec![fmt]).unwrap())
    }

    /// One default-firmware event on channel 0 with four payload words
    fn test_packet(event_time: u32) -> DataPacket {
        let mut words = Vec::new();
        words.push((0xA << 28) | 8);
        words.push(0b0000_0001);
        words.push(0);
        words.push(event_time);
        words.extend_from_slice(&[0x0001_0001; 4]);
        DataPacket::new(BOARD, words, 0, event_time)
    }

    /// Wait for the worker to pick up and finish everything queued
    fn wait_until(queue: &PacketQueue, inserter: &Inserter) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !inserter.is_running() && !queue.is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        while inserter.is_running()
            && (!queue.is_empty() || inserter.queued() > 0)
            && Instant::now() < deadline
        {
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn worker_processes_packets_and_writes_run() {
        let dir = TempDir::new().unwrap();
        let options = test_options(&dir);
        let counters = Arc::new(SharedCounters::new());
        let queue = Arc::new(PacketQueue::new());

        let inserter = Inserter::spawn(
            &options,
            test_formats(),
            counters.clone(),
            queue.clone(),
            "host",
            0,
        )
        .unwrap();

        queue.push(test_packet(1_000));
        queue.push(test_packet(2_000));
        wait_until(&queue, &inserter);

        let report = inserter.stop().unwrap();
        assert_eq!(report.worker_id, 0);
        assert_eq!(report.events_processed, 2);
        assert_eq!(report.fragments_processed, 2);
        assert_eq!(report.data_packets, 2);
        assert_eq!(report.bytes_processed, 2 * 8 * 4);

        // Final pass flushed chunk 0 and dropped the sentinel
        let run = dir.path().join("run_test");
        assert!(run.join("000000/host_0").is_file());
        assert!(run.join("THE_END/host_0").is_file());

        assert_eq!(counters.totals().events, 2);
    }

    #[test]
    fn unknown_board_aborts_worker() {
        let dir = TempDir::new().unwrap();
        let options = test_options(&dir);
        let queue = Arc::new(PacketQueue::new());

        let inserter = Inserter::spawn(
            &options,
            test_formats(),
            Arc::new(SharedCounters::new()),
            queue.clone(),
            "host",
            1,
        )
        .unwrap();

        queue.push(DataPacket::new(99, vec![0xA000_0004, 0, 0, 0], 0, 0));
        wait_until(&queue, &inserter);

        let result = inserter.stop();
        assert!(matches!(
            result,
            Err(InserterError::Parse(ParseError::UnknownBoard(99)))
        ));
    }

    #[test]
    fn single_buffer_mode_dequeues_one_at_a_time() {
        let dir = TempDir::new().unwrap();
        let options = StraxOptions {
            buffer_type: BufferType::Single,
            ..test_options(&dir)
        };
        let queue = Arc::new(PacketQueue::new());

        let inserter = Inserter::spawn(
            &options,
            test_formats(),
            Arc::new(SharedCounters::new()),
            queue.clone(),
            "host",
            2,
        )
        .unwrap();

        for t in [1_000u32, 2_000, 3_000] {
            queue.push(test_packet(t));
        }
        wait_until(&queue, &inserter);

        let report = inserter.stop().unwrap();
        assert_eq!(report.data_packets, 3);
        // Single mode records every dequeue as a batch of one
        assert_eq!(report.batch_size_counts.get(&1), Some(&3));
    }

    #[test]
    fn idle_worker_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let options = test_options(&dir);
        let queue = Arc::new(PacketQueue::new());

        let inserter = Inserter::spawn(
            &options,
            test_formats(),
            Arc::new(SharedCounters::new()),
            queue,
            "host",
            3,
        )
        .unwrap();

        let report = inserter.stop().unwrap();
        assert_eq!(report.bytes_processed, 0);

        // No data, no final pass: the run directory stays empty
        let run = dir.path().join("run_test");
        assert!(!run.join("THE_END").exists());
    }
}
