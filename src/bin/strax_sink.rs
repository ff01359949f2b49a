//! Strax sink binary - runs inserter workers over a packet queue
//!
//! Usage:
//!   cargo run --bin strax_sink -- --config strax.toml
//!   cargo run --bin strax_sink -- --emulate --workers 2 --output ./data
//!
//! Without `--emulate` the binary expects an external producer to feed the
//! queue; with it, a synthetic packet source drives the pipeline, which is
//! handy for soak tests and output-format checks.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use strax_sink::common::SharedCounters;
use strax_sink::config::{Config, FormatTable};
use strax_sink::emulator::{EmulatorConfig, PacketEmulator};
use strax_sink::inserter::Inserter;
use strax_sink::packet::{PacketQueue, PacketSource};

/// Command line arguments
#[derive(Parser, Debug)]
#[command(name = "strax_sink", about = "Chunked strax archival sink")]
struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long = "config", default_value = "strax.toml")]
    config_file: String,

    /// Override the output path
    #[arg(short = 'o', long = "output")]
    output: Option<PathBuf>,

    /// Override the run identifier
    #[arg(long = "run-id")]
    run_id: Option<String>,

    /// Number of inserter workers
    #[arg(long, default_value_t = 1)]
    workers: usize,

    /// Feed the queue from the built-in packet emulator
    #[arg(long, default_value_t = false)]
    emulate: bool,

    /// Emulated packets per second
    #[arg(long, default_value_t = 50)]
    emulate_rate: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("strax_sink=info".parse()?),
        )
        .init();

    let args = Args::parse();

    let mut config = if std::path::Path::new(&args.config_file).exists() {
        let config = Config::load(&args.config_file)?;
        info!(config_file = %args.config_file, "Loaded configuration");
        config
    } else {
        info!(config_file = %args.config_file, "Config file not found, using defaults");
        Config::default()
    };

    if let Some(output) = args.output {
        config.options.strax_output_path = output;
    }
    if let Some(run_id) = args.run_id {
        config.options.run_identifier = run_id;
    }

    let hostname = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string());

    let queue = Arc::new(PacketQueue::new());
    let counters = Arc::new(SharedCounters::new());

    // An emulated run synthesizes its own format table; a real run takes it
    // from the config file
    let mut emulator = args.emulate.then(|| PacketEmulator::new(EmulatorConfig::default()));
    let formats = if let Some(ref emulator) = emulator {
        Arc::new(FormatTable::from_boards(vec![emulator.board_format()])?)
    } else {
        let table = config.format_table()?;
        if table.is_empty() {
            warn!("Format table is empty, every packet will abort its worker");
        }
        Arc::new(table)
    };

    let emulator_active = Arc::new(AtomicBool::new(true));
    let emulator_handle = emulator.take().map(|mut emulator| {
        let queue = queue.clone();
        let active = emulator_active.clone();
        let interval = Duration::from_micros(1_000_000 / args.emulate_rate.max(1));
        std::thread::spawn(move || {
            while active.load(Ordering::SeqCst) {
                queue.push(emulator.next_packet());
                std::thread::sleep(interval);
            }
        })
    });

    let mut inserters = Vec::with_capacity(args.workers);
    for worker_id in 0..args.workers {
        inserters.push(Inserter::spawn(
            &config.options,
            formats.clone(),
            counters.clone(),
            queue.clone(),
            &hostname,
            worker_id,
        )?);
    }

    info!(
        workers = args.workers,
        run_path = %config.options.run_path().display(),
        emulate = args.emulate,
        "Strax sink running, press Ctrl+C to stop"
    );

    let mut stats_interval = tokio::time::interval(Duration::from_secs(10));
    stats_interval.tick().await; // first tick fires immediately
    loop {
        tokio::select! {
            biased;

            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received, shutting down");
                break;
            }

            _ = stats_interval.tick() => {
                let totals = counters.totals();
                info!(
                    events = totals.events,
                    fragments = totals.fragments,
                    bytes_mb = totals.bytes as f64 / 1_000_000.0,
                    queued = queue.len(),
                    "Progress"
                );
            }
        }
    }

    // Stop the producer first so workers can drain the queue tail
    emulator_active.store(false, Ordering::SeqCst);
    if let Some(handle) = emulator_handle {
        let _ = handle.join();
    }
    let drain_deadline = std::time::Instant::now() + Duration::from_secs(5);
    while !queue.is_empty() && std::time::Instant::now() < drain_deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    for inserter in inserters {
        let worker_id = inserter.worker_id();
        match inserter.stop() {
            Ok(report) => match serde_json::to_string(&report) {
                Ok(json) => info!(worker = worker_id, report = %json, "Worker report"),
                Err(e) => warn!(worker = worker_id, error = %e, "Failed to serialize report"),
            },
            Err(e) => error!(worker = worker_id, error = %e, "Worker failed"),
        }
    }

    let fails = counters.drain_fail_counter();
    if !fails.is_empty() {
        warn!(?fails, "Board failures during run");
    }
    let data = counters.drain_data_per_channel();
    info!(channels = data.len(), "Run finished");

    Ok(())
}
