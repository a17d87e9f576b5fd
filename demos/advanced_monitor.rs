use rust_watcher::runtime::{RecordStream, RecordStreamFactory};
use rust_watcher::{KprobeWatcher, ProbeDefinition, ProbeInstaller, Record, Result, Watcher, WatcherConfig};
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::{debug, info, Level};

/// Stands in for a TraceFS facility; this demo only exercises the
/// directory-entry cache and runtime wiring, not a live kernel probe.
struct NoopInstaller;

impl ProbeInstaller for NoopInstaller {
	fn install(&self, def: &ProbeDefinition) -> Result<()> {
		debug!(name = %def.name, "would install probe (stub)");
		Ok(())
	}
}

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

/// Demonstrates adding a root, starting the runtime, and draining events
/// until interrupted.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
	tracing_subscriber::fmt().with_max_level(Level::INFO).init();

	let watch_path = std::env::args().nth(1).map(PathBuf::from).unwrap_or_else(|| std::env::current_dir().unwrap());

	info!(path = %watch_path.display(), "starting filesystem monitor");

	let mut config = WatcherConfig::default();
	config.roots = vec![watch_path.clone()];

	let mut watcher = KprobeWatcher::new(Box::new(NoopInstaller), Box::new(NoopStreamFactory), config);
	watcher.add(watch_path).await?;
	watcher.start().await?;

	info!("monitor started, press Ctrl+C to stop");

	loop {
		tokio::select! {
			_ = tokio::signal::ctrl_c() => break,
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
