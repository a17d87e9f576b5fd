//! The directory-entry cache (DEC): an in-memory, parent-indexed tree that
//! mirrors the inode topology of every watched subtree.
//!
//! Parent/child links are modeled as arena indices rather than
//! `Rc`/`Weak` pointers — this sidesteps cyclic-reference machinery
//! entirely and makes `wipe_with_children` a plain graph traversal over
//! `Vec` slots.

use crate::mount::{find_mount, DeviceNumber, Mount};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

/// Opaque handle to a `DirEntry` inside a `DirEntryCache`'s arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DirEntryId(usize);

/// The cache lookup key: unique across the cache, insertion
/// order irrelevant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DirEntryKey {
	pub parent_ino: u64,
	pub device: DeviceNumber,
	pub name: String,
}

/// One node of the mirrored filesystem tree.
#[derive(Debug, Clone)]
pub struct DirEntry {
	pub name: String,
	pub parent: Option<DirEntryId>,
	pub children: HashSet<DirEntryId>,
	pub parent_ino: u64,
}

impl DirEntry {
	pub(crate) fn root(name: String) -> Self {
		Self { name, parent: None, children: HashSet::new(), parent_ino: 0 }
	}

	pub(crate) fn child(name: String, parent: DirEntryId, parent_ino: u64) -> Self {
		Self { name, parent: Some(parent), children: HashSet::new(), parent_ino }
	}
}

/// Mapping from `DirEntryKey` to the owning `DirEntry`, plus the arena that
/// actually owns the nodes.
#[derive(Debug, Default)]
pub struct DirEntryCache {
	arena: Vec<Option<DirEntry>>,
	by_key: HashMap<DirEntryKey, DirEntryId>,
}

impl DirEntryCache {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn get(&self, key: &DirEntryKey) -> Option<DirEntryId> {
		self.by_key.get(key).copied()
	}

	pub fn entry(&self, id: DirEntryId) -> &DirEntry {
		self.arena[id.0].as_ref().expect("dangling DirEntryId")
	}

	fn entry_mut(&mut self, id: DirEntryId) -> &mut DirEntry {
		self.arena[id.0].as_mut().expect("dangling DirEntryId")
	}

	/// Inserts `entry` under `key`, returning its id. If the key already
	/// has an occupant, the occupant is evicted from the map (but not
	/// freed from the arena — the caller is responsible for `remove`ing
	/// the overwritten id first if it wants a clean subtree).
	pub fn insert(&mut self, key: DirEntryKey, entry: DirEntry) -> DirEntryId {
		let parent = entry.parent;
		let id = DirEntryId(self.arena.len());
		self.arena.push(Some(entry));
		if let Some(parent_id) = parent {
			self.entry_mut(parent_id).children.insert(id);
		}
		self.by_key.insert(key, id);
		id
	}

	/// Removes the entry at `key` from the map and from its parent's
	/// child set, without touching its own children.
	/// Returns the removed id, if present.
	pub fn remove(&mut self, key: &DirEntryKey) -> Option<DirEntryId> {
		let id = self.by_key.remove(key)?;
		if let Some(parent_id) = self.entry(id).parent {
			self.entry_mut(parent_id).children.remove(&id);
		}
		Some(id)
	}

	/// Recursively deletes `id` and every transitive descendant from the
	/// map and from its parent's child set. Post-condition: no
	/// descendant of `id` is reachable from the cache.
	pub fn wipe_with_children(&mut self, id: DirEntryId) {
		if let Some(parent_id) = self.entry(id).parent {
			self.entry_mut(parent_id).children.remove(&id);
		}
		self.wipe_subtree(id);
	}

	fn wipe_subtree(&mut self, id: DirEntryId) {
		let children: Vec<DirEntryId> = self.entry(id).children.iter().copied().collect();
		for child in children {
			self.wipe_subtree(child);
		}
		self.by_key.retain(|_, v| *v != id);
		self.arena[id.0] = None;
	}

	/// Ascends `Parent` links from `id`, collecting names, then reverses
	/// and joins them with the platform separator.
	pub fn build_path(&self, id: DirEntryId) -> PathBuf {
		let mut tokens = Vec::new();
		let mut current = Some(id);
		while let Some(cur) = current {
			let e = self.entry(cur);
			tokens.push(e.name.clone());
			current = e.parent;
		}
		tokens.reverse();
		let mut path = PathBuf::new();
		for (i, tok) in tokens.iter().enumerate() {
			if i == 0 {
				path.push(tok);
			} else {
				path.push(tok);
			}
		}
		path
	}

	/// Detaches `id` from `old_key`/its current parent and reattaches it
	/// under `new_parent` at `new_key` with `new_name` (in-area
	/// rename). Descendants of `id` are untouched: their `Parent` links
	/// still point at `id`, so `build_path` yields the new prefix for free.
	pub fn reparent(
		&mut self, id: DirEntryId, old_key: &DirEntryKey, new_key: DirEntryKey,
		new_parent: DirEntryId, new_parent_ino: u64, new_name: String,
	) {
		self.remove(old_key);
		{
			let e = self.entry_mut(id);
			e.parent = Some(new_parent);
			e.parent_ino = new_parent_ino;
			e.name = new_name;
		}
		self.entry_mut(new_parent).children.insert(id);
		self.by_key.insert(new_key, id);
	}

	/// Attaches every live filesystem descendant of `root_path` (already
	/// present in the cache as `root_id`) by walking it directly, without
	/// consulting a `Mount` (the move-in reconciliation walk for a rename).
	/// Per-entry stat failures are swallowed — this walk is best effort.
	pub fn graft(
		&mut self, root_id: DirEntryId, root_path: &Path, device: DeviceNumber,
	) -> Vec<(DirEntryId, PathBuf)> {
		let mut attached = Vec::new();
		for dent in walkdir::WalkDir::new(root_path).follow_links(false).min_depth(1) {
			let dent = match dent {
				Ok(d) => d,
				Err(_) => continue,
			};
			let entry_path = dent.path();
			let parent_dir = entry_path.parent().unwrap_or(entry_path);
			let name = match entry_path.file_name() {
				Some(n) => n.to_string_lossy().into_owned(),
				None => continue,
			};

			let parent_id = if parent_dir == root_path {
				Some(root_id)
			} else {
				let grandparent = parent_dir.parent().unwrap_or(parent_dir);
				let grandparent_ino = match lstat_ino(grandparent) {
					Ok(i) => i,
					Err(_) => continue,
				};
				let parent_name = match parent_dir.file_name() {
					Some(n) => n.to_string_lossy().into_owned(),
					None => continue,
				};
				self.get(&DirEntryKey { parent_ino: grandparent_ino, device, name: parent_name })
			};
			let Some(parent_id) = parent_id else { continue };

			let parent_ino = match lstat_ino(parent_dir) {
				Ok(i) => i,
				Err(_) => continue,
			};
			let key = DirEntryKey { parent_ino, device, name: name.clone() };
			if let Some(existing) = self.get(&key) {
				attached.push((existing, self.build_path(existing)));
				continue;
			}
			let entry = DirEntry::child(name, parent_id, parent_ino);
			let id = self.insert(key, entry);
			attached.push((id, self.build_path(id)));
		}
		attached
	}

	/// Post-order traversal of `id` and descendants, invoking `visitor`
	/// with each reconstructed absolute path.
	/// Used by the rename handler to emit a `Created` event for every
	/// descendant of a subtree that was just reattached by a rename.
	pub fn walk_entry<F: FnMut(DirEntryId, &Path)>(&self, id: DirEntryId, visitor: &mut F) {
		let children: Vec<DirEntryId> = self.entry(id).children.iter().copied().collect();
		for child in children {
			self.walk_entry(child, visitor);
		}
		let path = self.build_path(id);
		visitor(id, &path);
	}

	/// Populates the cache by enumerating `path` on the live filesystem
	/// (the root-walk algorithm). `full_root_path` controls
	/// whether the root node's `Name` is the full input path or its
	/// basename; `excluded` filters out paths that should not be tracked.
	pub fn walk_root(
		&mut self, path: &Path, full_root_path: bool, excluded: &dyn Fn(&Path) -> bool,
	) -> crate::error::Result<DirEntryId> {
		let mount = find_mount(path)?;
		let mut root_id = None;

		for dent in walkdir::WalkDir::new(path).follow_links(false) {
			let dent = dent.map_err(|e| {
				crate::error::WatcherError::walk_failed(
					"walk_root",
					&path.display().to_string(),
					&e.to_string(),
				)
			})?;
			let entry_path = dent.path();
			if excluded(entry_path) {
				continue;
			}

			let id = self.insert_walked_entry(entry_path, path, full_root_path, &mount)?;
			if entry_path == path {
				root_id = Some(id);
			}
		}

		root_id.ok_or_else(|| {
			crate::error::WatcherError::walk_failed(
				"walk_root",
				&path.display().to_string(),
				"root path was not visited by its own walk",
			)
		})
	}

	fn insert_walked_entry(
		&mut self, entry_path: &Path, requested_root: &Path, full_root_path: bool, mount: &Mount,
	) -> crate::error::Result<DirEntryId> {
		let display_name = |p: &Path| -> String {
			if full_root_path && p == requested_root {
				requested_root.display().to_string()
			} else {
				p.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default()
			}
		};

		if entry_path == mount.path {
			let ino = lstat_ino(entry_path)?;
			let key = DirEntryKey {
				parent_ino: ino,
				device: mount.device_number,
				name: mount.subtree.clone(),
			};
			if let Some(existing) = self.get(&key) {
				return Ok(existing);
			}
			let root = DirEntry::root(display_name(entry_path));
			return Ok(self.insert(key, root));
		}

		let parent_dir = entry_path.parent().unwrap_or(entry_path);
		let parent_ino = lstat_ino(parent_dir)?;
		let name = entry_path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();

		let parent_key = if parent_dir == mount.path {
			DirEntryKey { parent_ino, device: mount.device_number, name: mount.subtree.clone() }
		} else {
			let grandparent = parent_dir.parent().unwrap_or(parent_dir);
			let grandparent_ino = lstat_ino(grandparent)?;
			let parent_name =
				parent_dir.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
			DirEntryKey { parent_ino: grandparent_ino, device: mount.device_number, name: parent_name }
		};

		let key = DirEntryKey { parent_ino, device: mount.device_number, name };
		if let Some(existing) = self.get(&key) {
			return Ok(existing);
		}

		// A missing parent key means a race or an exclusion: still insert
		// the entry, but with no parent. BuildPath for it
		// terminates short until a later event re-links it.
		let entry = match self.get(&parent_key) {
			Some(parent_id) => DirEntry::child(display_name(entry_path), parent_id, parent_ino),
			None => {
				let mut e = DirEntry::root(display_name(entry_path));
				e.parent_ino = parent_ino;
				e
			}
		};

		Ok(self.insert(key, entry))
	}
}

fn lstat_ino(path: &Path) -> crate::error::Result<u64> {
	nix::sys::stat::lstat(path)
		.map(|st| st.st_ino)
		.map_err(|e| crate::error::WatcherError::walk_failed("lstat", &path.display().to_string(), &e.to_string()))
}
