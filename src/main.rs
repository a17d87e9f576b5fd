use clap::Parser;
use rust_watcher::runtime::{RecordStream, RecordStreamFactory};
use rust_watcher::{KprobeWatcher, ProbeDefinition, ProbeInstaller, Record, Result, Watcher, WatcherConfig};
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::{debug, info, Level};

#[derive(Parser)]
#[command(name = "rust-watcher")]
#[command(about = "Kprobe-based filesystem event engine (smoke-test binary)")]
struct Cli {
	/// Root path to watch (repeatable)
	#[arg(short, long)]
	path: Vec<PathBuf>,

	/// Enable verbose logging
	#[arg(short, long)]
	verbose: bool,
}

/// Stands in for a TraceFS facility: this crate defines the probe registry
/// and fetch-arg strings but ships no kernel-facing installer, so this
/// binary only demonstrates wiring.
struct NoopInstaller;

impl ProbeInstaller for NoopInstaller {
	fn install(&self, def: &ProbeDefinition) -> Result<()> {
		debug!(name = %def.name, symbol = def.symbol, "would install probe (stub)");
		Ok(())
	}
}

/// Stands in for the perf-ring reader: never yields a record, so the
/// watcher can be exercised end to end without a live kernel tracing
/// facility.
struct NoopStream {
	records: mpsc::Receiver<Record>,
	errors: mpsc::Receiver<String>,
	lost: mpsc::Receiver<u64>,
}

impl RecordStream for NoopStream {
	fn into_parts(self: Box<Self>) -> (mpsc::Receiver<Record>, mpsc::Receiver<String>, mpsc::Receiver<u64>) {
		(self.records, self.errors, self.lost)
	}
}

struct NoopStreamFactory;

impl RecordStreamFactory for NoopStreamFactory {
	fn open(&self, _ring_pages: usize) -> Result<Box<dyn RecordStream>> {
		let (_records_tx, records_rx) = mpsc::channel(1);
		let (_errors_tx, errors_rx) = mpsc::channel(1);
		let (_lost_tx, lost_rx) = mpsc::channel(1);
		Ok(Box::new(NoopStream { records: records_rx, errors: errors_rx, lost: lost_rx }))
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let cli = Cli::parse();

	let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
	tracing_subscriber::fmt().with_max_level(level).init();

	let roots = cli.path;
	let mut config = WatcherConfig::default();
	config.roots = roots.clone();

	let mut watcher = KprobeWatcher::new(Box::new(NoopInstaller), Box::new(NoopStreamFactory), config);

	for root in &roots {
		info!(path = %root.display(), "adding watched root");
		watcher.add(root.clone()).await?;
	}

	watcher.start().await?;
	info!("watcher started, press Ctrl+C to stop");

	loop {
		tokio::select! {
			_ = tokio::signal::ctrl_c() => {
				info!("shutting down");
				break;
			}
			maybe_event = watcher.events().recv() => {
				match maybe_event {
					Some(event) => info!(?event, "event"),
					None => break,
				}
			}
		}
	}

	watcher.close().await?;
	Ok(())
}
