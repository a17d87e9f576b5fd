//! Shared scaffolding for the integration tests: a real temp directory plus
//! a controllable record stream, since the kernel-facing probe installer and
//! perf-ring reader are external collaborators this crate does not ship.

use rust_watcher::mount::{find_mount, DeviceNumber};
use rust_watcher::{ProbeDefinition, ProbeInstaller, Record, Result, WatcherError};
use std::path::Path;
use tokio::sync::mpsc;

pub fn setup_temp_dir() -> tempfile::TempDir {
	tempfile::tempdir().expect("failed to create temp dir")
}

/// Looks up the real inode of `path`, as the installed kprobes would report
/// for a live syscall touching it.
pub fn ino_of(path: &Path) -> u64 {
	nix::sys::stat::lstat(path).expect("lstat failed").st_ino
}

/// The device number of the filesystem backing `path` (tmpfs on most CI
/// sandboxes), matching what a real kprobe fetch-arg would decode.
pub fn device_of(path: &Path) -> DeviceNumber {
	find_mount(path).expect("mount lookup failed").device_number
}

/// Stands in for a TraceFS facility: a probe installer that always
/// succeeds, so `start()` can be exercised without a live kernel.
pub struct NoopInstaller;

impl ProbeInstaller for NoopInstaller {
	fn install(&self, _def: &ProbeDefinition) -> Result<()> {
		Ok(())
	}
}

/// A record stream whose three channels are fed directly by the test, in
/// place of a real perf-ring reader.
pub struct PresetStream {
	records: mpsc::Receiver<Record>,
	errors: mpsc::Receiver<String>,
	lost: mpsc::Receiver<u64>,
}

impl rust_watcher::RecordStream for PresetStream {
	fn into_parts(self: Box<Self>) -> (mpsc::Receiver<Record>, mpsc::Receiver<String>, mpsc::Receiver<u64>) {
		(self.records, self.errors, self.lost)
	}
}

/// Hands out exactly one [`PresetStream`]; the sender halves are handed back
/// to the test at construction time so it can push records once the watcher
/// has started.
pub struct PresetStreamFactory {
	inner: std::sync::Mutex<Option<PresetStream>>,
}

pub struct PresetStreamHandles {
	pub records_tx: mpsc::Sender<Record>,
	pub errors_tx: mpsc::Sender<String>,
	pub lost_tx: mpsc::Sender<u64>,
}

impl PresetStreamFactory {
	pub fn new() -> (Self, PresetStreamHandles) {
		let (records_tx, records_rx) = mpsc::channel(16);
		let (errors_tx, errors_rx) = mpsc::channel(4);
		let (lost_tx, lost_rx) = mpsc::channel(4);
		let stream = PresetStream { records: records_rx, errors: errors_rx, lost: lost_rx };
		(Self { inner: std::sync::Mutex::new(Some(stream)) }, PresetStreamHandles { records_tx, errors_tx, lost_tx })
	}
}

impl rust_watcher::RecordStreamFactory for PresetStreamFactory {
	fn open(&self, _ring_pages: usize) -> Result<Box<dyn rust_watcher::RecordStream>> {
		self.inner
			.lock()
			.unwrap()
			.take()
			.map(|s| Box::new(s) as Box<dyn rust_watcher::RecordStream>)
			.ok_or(WatcherError::StreamOpen("preset stream already opened".into()))
	}
}
