//! Watcher runtime: owns the cache and correlation map, drives the
//! cache-warming walk for newly-added roots, consumes the probe record
//! stream, and emits normalized events on a bounded output channel.
//!
//! A thin public handle hands off to a single spawned task that owns all
//! mutable state, communicating only through channels.

use crate::cache::DirEntryCache;
use crate::correlation::CorrelationMap;
use crate::error::{ErrorRecoveryConfig, Result, WatcherError};
use crate::events::FilesystemEvent;
use crate::probe::{ProbeInstaller, Symbol, ALL_SYMBOLS};
use crate::records::{EventSink, Record};
use crate::retry::RetryManager;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, Duration};
use tracing::{debug, error, info};

/// Yields already-decoded probe records plus the record stream's own error
/// and loss signals. The concrete kernel-facing implementation (perf ring
/// reader) is an external collaborator; this crate defines the shape and
/// consumes it.
///
/// `into_parts` hands the three channels to the caller as separately owned
/// receivers rather than exposing `&mut` accessors: a `tokio::select!` loop
/// needs to hold all three open at once, which a shared `&mut self`
/// accessor cannot express through a trait object.
pub trait RecordStream: Send {
	fn into_parts(
		self: Box<Self>,
	) -> (mpsc::Receiver<Record>, mpsc::Receiver<String>, mpsc::Receiver<u64>);
}

/// Opens a [`RecordStream`] for the given set of registered symbols.
/// Installation itself goes through [`ProbeInstaller`]; this factory only
/// covers opening the ring.
pub trait RecordStreamFactory: Send {
	fn open(&self, ring_pages: usize) -> Result<Box<dyn RecordStream>>;
}

/// Perf ring size: a ring of 2^10 pages.
pub const RING_PAGES: usize = 1 << 10;

/// The record stream is polled with a 100 ms timeout.
pub const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Path-exclusion predicate injection point: a timer-free
/// path-is-excluded predicate, consumed but not implemented here.
pub type ExcludePredicate = Arc<dyn Fn(&Path) -> bool + Send + Sync>;

fn no_exclusions(_: &Path) -> bool {
	false
}

/// Configuration for a [`KprobeWatcher`]: the set of roots to add before
/// `start`, the retry policy reused from
/// [`ErrorRecoveryConfig`] for probe-installation and stream-open retries,
/// and the exclusion predicate.
#[derive(Clone)]
pub struct WatcherConfig {
	pub roots: Vec<PathBuf>,
	pub retry: ErrorRecoveryConfig,
	pub excluded: ExcludePredicate,
	pub full_root_path: bool,
}

impl Default for WatcherConfig {
	fn default() -> Self {
		Self {
			roots: Vec::new(),
			retry: ErrorRecoveryConfig::default(),
			excluded: Arc::new(no_exclusions),
			full_root_path: true,
		}
	}
}

impl std::fmt::Debug for WatcherConfig {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("WatcherConfig")
			.field("roots", &self.roots)
			.field("retry", &self.retry)
			.field("full_root_path", &self.full_root_path)
			.finish_non_exhaustive()
	}
}

impl WatcherConfig {
	pub fn validate(&self) -> Result<()> {
		validate_roots(&self.roots)
	}
}

/// Shared by [`WatcherConfig::validate`] and `start()` (which validates
/// `pending_roots` after they have already been moved out of the config).
fn validate_roots(roots: &[PathBuf]) -> Result<()> {
	for root in roots {
		if !root.is_absolute() || !root.exists() {
			return Err(WatcherError::InvalidPath { path: root.display().to_string() });
		}
	}
	Ok(())
}

struct AddRequest {
	path: PathBuf,
	reply: oneshot::Sender<Result<()>>,
}

/// The backend-agnostic public surface: `add`, `start`, `close`,
/// `events`, `errors`.
pub trait Watcher: Send {
	fn add(&mut self, path: PathBuf) -> impl std::future::Future<Output = Result<()>> + Send;
	fn start(&mut self) -> impl std::future::Future<Output = Result<()>> + Send;
	fn close(&mut self) -> impl std::future::Future<Output = Result<()>> + Send;
	fn events(&mut self) -> &mut mpsc::Receiver<FilesystemEvent>;
	fn errors(&mut self) -> &mut mpsc::Receiver<WatcherError>;
}

enum State {
	/// Not yet started: the cache lives here and `add` walks synchronously.
	/// `pending_roots` holds `WatcherConfig::roots` until `start` walks them.
	Idle { cache: DirEntryCache, excluded: ExcludePredicate, full_root_path: bool, pending_roots: Vec<PathBuf> },
	Running { add_tx: mpsc::Sender<AddRequest>, close_tx: Option<oneshot::Sender<()>> },
	Closed,
}

/// The kprobe backend's `Watcher` implementation: the one concrete
/// backend this crate ships.
pub struct KprobeWatcher {
	state: State,
	installer: Box<dyn ProbeInstaller + Send>,
	stream_factory: Box<dyn RecordStreamFactory>,
	retry: ErrorRecoveryConfig,
	event_tx: mpsc::Sender<FilesystemEvent>,
	event_rx: mpsc::Receiver<FilesystemEvent>,
	error_tx: mpsc::Sender<WatcherError>,
	error_rx: mpsc::Receiver<WatcherError>,
}

impl KprobeWatcher {
	pub fn new(
		installer: Box<dyn ProbeInstaller + Send>, stream_factory: Box<dyn RecordStreamFactory>,
		config: WatcherConfig,
	) -> Self {
		let (event_tx, event_rx) = mpsc::channel(256);
		let (error_tx, error_rx) = mpsc::channel(8);
		Self {
			state: State::Idle {
				cache: DirEntryCache::new(),
				excluded: config.excluded,
				full_root_path: config.full_root_path,
				pending_roots: config.roots,
			},
			installer,
			stream_factory,
			retry: config.retry,
			event_tx,
			event_rx,
			error_tx,
			error_rx,
		}
	}

	/// Installs the entry/return probe pair for every watched symbol.
	/// Retried per the configured recovery policy since a busy tracefs
	/// mount is a transient condition.
	async fn install_probes(&self) -> Result<()> {
		for symbol in ALL_SYMBOLS {
			self.install_one(*symbol).await?;
		}
		Ok(())
	}

	async fn install_one(&self, symbol: Symbol) -> Result<()> {
		let (entry, ret) = symbol.definitions();
		let manager = RetryManager::new(self.retry.clone());
		manager
			.execute_simple(symbol.kernel_symbol(), || async {
				self.installer.install(&entry).and_then(|_| self.installer.install(&ret))
			})
			.await
	}
}

impl Watcher for KprobeWatcher {
	/// Adds a root: before `start`, walks synchronously into
	/// the locally-held cache; after `start`, forwards the request into
	/// the runtime task and awaits its reply so the walk serializes with
	/// live record processing.
	async fn add(&mut self, path: PathBuf) -> Result<()> {
		match &mut self.state {
			State::Idle { cache, excluded, full_root_path, .. } => {
				cache.walk_root(&path, *full_root_path, excluded.as_ref())?;
				Ok(())
			}
			State::Running { add_tx, .. } => {
				let (reply_tx, reply_rx) = oneshot::channel();
				add_tx
					.send(AddRequest { path, reply: reply_tx })
					.await
					.map_err(|_| WatcherError::NotInitialized)?;
				reply_rx.await.map_err(|_| WatcherError::NotInitialized)?
			}
			State::Closed => Err(WatcherError::NotInitialized),
		}
	}

	/// Opens the record stream, installs every probe pair, and spawns the
	/// runtime task.
	async fn start(&mut self) -> Result<()> {
		let (mut cache, excluded, full_root_path, pending_roots) =
			match std::mem::replace(&mut self.state, State::Closed) {
				State::Idle { cache, excluded, full_root_path, pending_roots } => {
					(cache, excluded, full_root_path, pending_roots)
				}
				other => {
					self.state = other;
					return Err(WatcherError::ConfigurationError {
						parameter: "state".into(),
						reason: "start called more than once".into(),
						expected: "idle".into(),
						actual: "already started or closed".into(),
					});
				}
			};

		// Roots carried on `WatcherConfig` (as opposed to ones added via an
		// explicit `add()` call) are validated and walked here,
		// synchronously, before the runtime task takes ownership of the
		// cache — the same add-before-start contract `add()` honors for
		// manual calls.
		validate_roots(&pending_roots)?;
		for root in &pending_roots {
			cache.walk_root(root, full_root_path, excluded.as_ref())?;
		}

		self.install_probes().await?;
		let stream = self.stream_factory.open(RING_PAGES)?;

		let (add_tx, add_rx) = mpsc::channel(32);
		let (close_tx, close_rx) = oneshot::channel();

		self.state = State::Running { add_tx, close_tx: Some(close_tx) };

		let event_tx = self.event_tx.clone();
		let error_tx = self.error_tx.clone();
		tokio::spawn(run(cache, excluded, full_root_path, stream, add_rx, close_rx, event_tx, error_tx));
		Ok(())
	}

	/// Signals the runtime task to stop: closes the output event channel
	/// and releases the record stream.
	async fn close(&mut self) -> Result<()> {
		if let State::Running { close_tx, .. } = &mut self.state {
			if let Some(tx) = close_tx.take() {
				let _ = tx.send(());
			}
		}
		self.state = State::Closed;
		Ok(())
	}

	fn events(&mut self) -> &mut mpsc::Receiver<FilesystemEvent> {
		&mut self.event_rx
	}

	fn errors(&mut self) -> &mut mpsc::Receiver<WatcherError> {
		&mut self.error_rx
	}
}

/// The runtime task body: the sole mutator of `cache` and a fresh
/// `CorrelationMap` for the process lifetime of the watcher, multiplexed
/// with `tokio::select!` over the stop, add-root, and record-stream
/// channels.
async fn run(
	mut cache: DirEntryCache, excluded: ExcludePredicate, full_root_path: bool,
	stream: Box<dyn RecordStream>, mut add_rx: mpsc::Receiver<AddRequest>,
	mut close_rx: oneshot::Receiver<()>, event_tx: mpsc::Sender<FilesystemEvent>,
	error_tx: mpsc::Sender<WatcherError>,
) {
	let mut correlation = CorrelationMap::new();
	let sink = EventSink::new(&event_tx);
	let (mut records, mut stream_errors, mut stream_lost) = stream.into_parts();

	loop {
		tokio::select! {
			_ = &mut close_rx => {
				info!("watcher close requested, flushing pending entries");
				if let Err(e) = correlation.flush(&mut cache, &sink).await {
					debug!(error = %e, "flush on close failed");
				}
				break;
			}
			Some(request) = add_rx.recv() => {
				let result = cache.walk_root(&request.path, full_root_path, excluded.as_ref());
				let _ = request.reply.send(result.map(|_| ()));
			}
			maybe_record = timeout(POLL_TIMEOUT, records.recv()) => {
				match maybe_record {
					Ok(Some(Record::Entry(entry))) => {
						if let Err(e) = correlation.handle_entry(entry, &mut cache, &sink).await {
							debug!(error = %e, "dropping entry record after emit failure");
						}
					}
					Ok(Some(Record::Return(ret))) => {
						if let Err(e) = correlation.handle_return(ret, &mut cache, &sink).await {
							debug!(error = %e, "dropping return record after emit failure");
						}
					}
					Ok(None) => {
						error!("record stream closed unexpectedly");
						let _ = error_tx.send(WatcherError::StreamError("record stream closed".into())).await;
						break;
					}
					Err(_elapsed) => {
						// Poll timeout: nothing to do, loop again.
					}
				}
			}
			Some(stream_error) = stream_errors.recv() => {
				error!(error = %stream_error, "record stream reported an error");
				let _ = error_tx.send(WatcherError::StreamError(stream_error)).await;
				break;
			}
			Some(lost) = stream_lost.recv() => {
				error!(lost, "record stream lost events");
				let _ = error_tx.send(WatcherError::EventsLost(lost)).await;
				break;
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::cache::{DirEntry, DirEntryKey};
	use crate::mount::DeviceNumber;
	use crate::probe::ProbeDefinition;
	use crate::records::{Entry, ReturnGeneric, VfsCreate};
	use std::sync::atomic::{AtomicUsize, Ordering};

	struct FakeInstaller {
		calls: AtomicUsize,
	}

	impl ProbeInstaller for FakeInstaller {
		fn install(&self, _def: &ProbeDefinition) -> Result<()> {
			self.calls.fetch_add(1, Ordering::SeqCst);
			Ok(())
		}
	}

	struct FakeStream {
		records: mpsc::Receiver<Record>,
		errors: mpsc::Receiver<String>,
		lost: mpsc::Receiver<u64>,
	}

	impl RecordStream for FakeStream {
		fn into_parts(
			self: Box<Self>,
		) -> (mpsc::Receiver<Record>, mpsc::Receiver<String>, mpsc::Receiver<u64>) {
			(self.records, self.errors, self.lost)
		}
	}

	struct EmptyStreamFactory;
	impl RecordStreamFactory for EmptyStreamFactory {
		fn open(&self, _ring_pages: usize) -> Result<Box<dyn RecordStream>> {
			let (_records_tx, records_rx) = mpsc::channel(1);
			let (_errors_tx, errors_rx) = mpsc::channel(1);
			let (_lost_tx, lost_rx) = mpsc::channel(1);
			Ok(Box::new(FakeStream { records: records_rx, errors: errors_rx, lost: lost_rx }))
		}
	}

	fn dev() -> DeviceNumber {
		DeviceNumber::from_major_minor(8, 1)
	}

	#[tokio::test]
	async fn start_installs_every_probe_pair() {
		let installer: Box<dyn ProbeInstaller + Send> = Box::new(FakeInstaller { calls: AtomicUsize::new(0) });
		let factory: Box<dyn RecordStreamFactory> = Box::new(EmptyStreamFactory);
		let mut watcher = KprobeWatcher::new(installer, factory, WatcherConfig::default());

		watcher.start().await.unwrap();
		watcher.close().await.unwrap();
	}

	#[tokio::test]
	async fn starting_twice_is_an_error() {
		let installer: Box<dyn ProbeInstaller + Send> = Box::new(FakeInstaller { calls: AtomicUsize::new(0) });
		let factory: Box<dyn RecordStreamFactory> = Box::new(EmptyStreamFactory);
		let mut watcher = KprobeWatcher::new(installer, factory, WatcherConfig::default());

		watcher.start().await.unwrap();
		assert!(watcher.start().await.is_err());
		watcher.close().await.unwrap();
	}

	#[tokio::test]
	async fn add_after_close_is_an_error() {
		let installer: Box<dyn ProbeInstaller + Send> = Box::new(FakeInstaller { calls: AtomicUsize::new(0) });
		let factory: Box<dyn RecordStreamFactory> = Box::new(EmptyStreamFactory);
		let mut watcher = KprobeWatcher::new(installer, factory, WatcherConfig::default());

		watcher.start().await.unwrap();
		watcher.close().await.unwrap();
		assert!(watcher.add(PathBuf::from("/w")).await.is_err());
	}

	/// Drives `run` directly against a hand-seeded cache, the same way
	/// `correlation.rs`'s tests bypass the kernel layer: a create entry
	/// followed by a successful return must yield exactly one event.
	#[tokio::test]
	async fn run_loop_correlates_a_create_end_to_end() {
		let mut cache = DirEntryCache::new();
		let root_key = DirEntryKey { parent_ino: 1, device: dev(), name: "/".into() };
		cache.insert(root_key, DirEntry::root("w".into()));

		let (records_tx, records_rx) = mpsc::channel(4);
		let (_errors_tx, errors_rx) = mpsc::channel(1);
		let (_lost_tx, lost_rx) = mpsc::channel(1);
		let stream: Box<dyn RecordStream> =
			Box::new(FakeStream { records: records_rx, errors: errors_rx, lost: lost_rx });

		let (_add_tx, add_rx) = mpsc::channel(1);
		let (close_tx, close_rx) = oneshot::channel();
		let (event_tx, mut event_rx) = mpsc::channel(4);
		let (error_tx, _error_rx) = mpsc::channel(1);

		let handle = tokio::spawn(run(
			cache,
			Arc::new(no_exclusions),
			true,
			stream,
			add_rx,
			close_rx,
			event_tx,
			error_tx,
		));

		records_tx
			.send(Record::Entry(Entry::Create(VfsCreate {
				address_id: Symbol::VfsCreate.address_id(),
				pid: 1,
				tid: 1,
				parent_ino: 2,
				parent_parent_ino: 1,
				parent_file_name: "/".into(),
				device: dev(),
				file_name: "a".into(),
				resolved_parent: None,
			})))
			.await
			.unwrap();
		records_tx
			.send(Record::Return(crate::records::Return::Generic(ReturnGeneric {
				address_id: Symbol::VfsCreate.address_id(),
				pid: 1,
				tid: 1,
				ret: 0,
			})))
			.await
			.unwrap();

		let ev = event_rx.recv().await.unwrap();
		assert_eq!(ev.event_type, crate::events::EventType::Created);
		assert_eq!(ev.path, PathBuf::from("w/a"));

		let _ = close_tx.send(());
		handle.await.unwrap();
	}

	/// A root named on `WatcherConfig::roots` must be walked by `start()`
	/// itself, without the caller also calling `add()`.
	#[tokio::test]
	async fn start_walks_roots_configured_up_front() {
		let dir = tempfile::tempdir().unwrap();
		std::fs::write(dir.path().join("preexisting.txt"), b"x").unwrap();

		let installer: Box<dyn ProbeInstaller + Send> = Box::new(FakeInstaller { calls: AtomicUsize::new(0) });
		let factory: Box<dyn RecordStreamFactory> = Box::new(EmptyStreamFactory);
		let mut config = WatcherConfig::default();
		config.roots = vec![dir.path().to_path_buf()];
		let mut watcher = KprobeWatcher::new(installer, factory, config);

		watcher.start().await.unwrap();
		watcher.close().await.unwrap();
	}

	#[tokio::test]
	async fn start_rejects_a_nonexistent_configured_root() {
		let installer: Box<dyn ProbeInstaller + Send> = Box::new(FakeInstaller { calls: AtomicUsize::new(0) });
		let factory: Box<dyn RecordStreamFactory> = Box::new(EmptyStreamFactory);
		let mut config = WatcherConfig::default();
		config.roots = vec![PathBuf::from("/no/such/path/anywhere")];
		let mut watcher = KprobeWatcher::new(installer, factory, config);

		assert!(watcher.start().await.is_err());
	}

	#[test]
	fn validate_rejects_relative_and_missing_roots() {
		let mut config = WatcherConfig::default();
		config.roots = vec![PathBuf::from("relative/path")];
		assert!(config.validate().is_err());

		config.roots = vec![PathBuf::from("/definitely/not/here")];
		assert!(config.validate().is_err());

		config.roots = vec![];
		assert!(config.validate().is_ok());
	}
}
