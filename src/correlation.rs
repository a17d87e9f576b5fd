//! Entry/return correlation: pairs an entry-probe record with the
//! return-probe record for the same syscall invocation, deferring the
//! cache mutation and event emission until the return confirms success.
//!
//! Keeps exactly one map between the record stream and the kernel ring:
//! one pending entry per `(address, pid, tid)` tuple, evicted either by a
//! matching return or by a colliding entry forcing an "assume".

use crate::cache::DirEntryCache;
use crate::records::{Entry, EventSink, ProbeEventKey, Return};
use crate::error::Result;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Holds every entry-probe record still waiting on its return.
#[derive(Debug, Default)]
pub struct CorrelationMap {
	pending: HashMap<ProbeEventKey, Entry>,
}

impl CorrelationMap {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn len(&self) -> usize {
		self.pending.len()
	}

	pub fn is_empty(&self) -> bool {
		self.pending.is_empty()
	}

	/// Handles one decoded entry-probe record: consults `should_intercept`,
	/// and if the record is inside
	/// the watched topology, stashes it under its key. A key collision
	/// means the previous pending entry for this `(address, pid, tid)`
	/// never received its return — most often because the kernel reused
	/// a tid before the kretprobe fired — so it is assumed to have
	/// succeeded and flushed immediately, making room for the new one.
	pub async fn handle_entry(
		&mut self, mut record: Entry, cache: &mut DirEntryCache, sink: &EventSink<'_>,
	) -> Result<()> {
		if !record.should_intercept(cache) {
			return Ok(());
		}

		let key = record.key();
		if let Some(stale) = self.pending.remove(&key) {
			debug!(?key, "assuming stale pending entry before overwrite");
			stale.assume(cache, sink).await?;
		}
		self.pending.insert(key, record);
		Ok(())
	}

	/// Handles one decoded return-probe record: pops the pending entry for
	/// this key, if any, and emits it
	/// only when the syscall's own return code indicates success. A
	/// return with no matching pending entry means the entry was dropped
	/// earlier (outside the watched topology, or already assumed away) —
	/// not an error, just nothing to do.
	pub async fn handle_return(
		&mut self, ret: Return, cache: &mut DirEntryCache, sink: &EventSink<'_>,
	) -> Result<()> {
		let key = ret.key();
		let Some(entry) = self.pending.remove(&key) else {
			return Ok(());
		};

		if ret.should_intercept() {
			entry.emit(cache, sink).await?;
		} else {
			debug!(?key, "syscall failed, dropping pending entry");
		}
		Ok(())
	}

	/// Flushes every still-pending entry by assuming it succeeded: the
	/// watcher is stopping or has detected a gap in the ring, so no more
	/// returns will ever arrive for these keys.
	pub async fn flush(&mut self, cache: &mut DirEntryCache, sink: &EventSink<'_>) -> Result<()> {
		let pending: Vec<Entry> = self.pending.drain().map(|(_, v)| v).collect();
		if !pending.is_empty() {
			warn!(count = pending.len(), "flushing pending correlation entries on shutdown");
		}
		for entry in pending {
			entry.assume(cache, sink).await?;
		}
		Ok(())
	}
}
