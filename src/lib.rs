//! Kprobe-based filesystem event engine: a directory-entry cache, a VFS
//! probe registry, a correlation engine, a rename handler, and a watcher
//! runtime behind a backend-agnostic [`Watcher`] trait.

pub mod cache;
pub mod correlation;
pub mod error;
pub mod events;
pub mod mount;
pub mod probe;
pub mod records;
pub mod retry;
pub mod runtime;

pub use cache::{DirEntry, DirEntryCache, DirEntryId, DirEntryKey};
pub use correlation::CorrelationMap;
pub use error::{ErrorRecoveryConfig, Result, WatcherError};
pub use events::{EventType, FilesystemEvent, Op};
pub use mount::{DeviceNumber, Mount};
pub use probe::{AddressId, ProbeDefinition, ProbeInstaller, ProbeKind, Symbol, ALL_SYMBOLS};
pub use records::{Entry, ProbeEventKey, Record, Return};
pub use runtime::{KprobeWatcher, RecordStream, RecordStreamFactory, Watcher, WatcherConfig};
