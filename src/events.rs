//! Normalized filesystem events emitted by a watcher backend.
//!
//! `FilesystemEvent` is the common output type: every backend (kprobe, or
//! in principle any other) reduces its raw observations to this shape
//! before handing them to a consumer.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// The kind of mutation a `FilesystemEvent` reports.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EventType {
	Created,
	Updated,
	Deleted,
	Moved,
	Attr,
	XAttr,
	Chmod,
	Chown,
}

bitflags::bitflags! {
	/// Op is the backend-agnostic bitset surface: consumers that only
	/// care about coarse categories (did *something* get written?) can
	/// test against this instead of matching on `EventType`.
	#[derive(Serialize, Deserialize)]
	pub struct Op: u8 {
		const CREATE = 0b0000_0001;
		const WRITE  = 0b0000_0010;
		const REMOVE = 0b0000_0100;
		const RENAME = 0b0000_1000;
		const CHMOD  = 0b0001_0000;
	}
}

impl From<EventType> for Op {
	fn from(kind: EventType) -> Self {
		match kind {
			EventType::Created => Op::CREATE,
			EventType::Updated | EventType::Attr | EventType::XAttr => Op::WRITE,
			EventType::Deleted => Op::REMOVE,
			EventType::Moved => Op::RENAME,
			EventType::Chmod | EventType::Chown => Op::CHMOD,
		}
	}
}

/// One normalized filesystem mutation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FilesystemEvent {
	pub event_type: EventType,
	pub path: PathBuf,
	pub pid: u32,
}

impl FilesystemEvent {
	pub fn new(event_type: EventType, path: PathBuf, pid: u32) -> Self {
		Self { event_type, path, pid }
	}

	pub fn op(&self) -> Op {
		Op::from(self.event_type)
	}

	pub fn to_json(&self) -> serde_json::Result<String> {
		serde_json::to_string(self)
	}
}
