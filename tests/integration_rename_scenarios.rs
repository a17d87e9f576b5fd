//! Integration coverage for the rename decision tree, driven end to end
//! through the public `Watcher` API rather than the handler's own unit
//! tests (which seed a cache by hand).

use rust_watcher::events::EventType;
use rust_watcher::records::{Entry, Return, ReturnGeneric, VfsRename};
use rust_watcher::{AddressId, KprobeWatcher, Record, Watcher, WatcherConfig};
use std::time::Duration;

mod common;

const VFS_RENAME: AddressId = AddressId(16);

async fn recv(watcher: &mut KprobeWatcher) -> rust_watcher::events::FilesystemEvent {
	tokio::time::timeout(Duration::from_secs(1), watcher.events().recv())
		.await
		.expect("timed out waiting for event")
		.expect("channel closed")
}

#[tokio::test]
async fn rename_within_watched_tree_moves_then_recreates_root_first() {
	let dir = common::setup_temp_dir();
	std::fs::create_dir(dir.path().join("sub1")).unwrap();
	std::fs::create_dir(dir.path().join("sub2")).unwrap();
	std::fs::create_dir(dir.path().join("sub1").join("proj")).unwrap();
	std::fs::write(dir.path().join("sub1").join("proj").join("f.txt"), b"x").unwrap();

	let device = common::device_of(dir.path());
	let root_ino = common::ino_of(dir.path());
	let sub1_ino = common::ino_of(&dir.path().join("sub1"));
	let sub2_ino = common::ino_of(&dir.path().join("sub2"));

	let mut config = WatcherConfig::default();
	config.roots = vec![dir.path().to_path_buf()];

	let (factory, handles) = common::PresetStreamFactory::new();
	let mut watcher =
		KprobeWatcher::new(Box::new(common::NoopInstaller), Box::new(factory), config);

	watcher.add(dir.path().to_path_buf()).await.unwrap();
	watcher.start().await.unwrap();

	handles
		.records_tx
		.send(Record::Entry(Entry::Rename(VfsRename::new(
			VFS_RENAME,
			10,
			10,
			sub1_ino,
			"proj".into(),
			0o040755,
			device,
			sub2_ino,
			"proj2".into(),
			root_ino,
			"sub2".into(),
			device,
		))))
		.await
		.unwrap();
	handles
		.records_tx
		.send(Record::Return(Return::Generic(ReturnGeneric {
			address_id: VFS_RENAME,
			pid: 10,
			tid: 10,
			ret: 0,
		})))
		.await
		.unwrap();

	let moved = recv(&mut watcher).await;
	assert_eq!(moved.event_type, EventType::Moved);
	assert_eq!(moved.path, dir.path().join("sub1").join("proj"));

	let created_root = recv(&mut watcher).await;
	assert_eq!(created_root.event_type, EventType::Created);
	assert_eq!(created_root.path, dir.path().join("sub2").join("proj2"));

	let created_child = recv(&mut watcher).await;
	assert_eq!(created_child.event_type, EventType::Created);
	assert_eq!(created_child.path, dir.path().join("sub2").join("proj2").join("f.txt"));

	watcher.close().await.unwrap();
}

#[tokio::test]
async fn rename_out_of_the_watched_tree_wipes_the_subtree_and_emits_one_moved() {
	let dir = common::setup_temp_dir();
	std::fs::create_dir(dir.path().join("sub")).unwrap();
	std::fs::write(dir.path().join("sub").join("leaving.txt"), b"x").unwrap();

	let device = common::device_of(dir.path());
	let sub_ino = common::ino_of(&dir.path().join("sub"));

	let mut config = WatcherConfig::default();
	config.roots = vec![dir.path().to_path_buf()];

	let (factory, handles) = common::PresetStreamFactory::new();
	let mut watcher =
		KprobeWatcher::new(Box::new(common::NoopInstaller), Box::new(factory), config);

	watcher.add(dir.path().to_path_buf()).await.unwrap();
	watcher.start().await.unwrap();

	// Destination parent key matches nothing tracked: the file left the
	// watched topology entirely (e.g. renamed out to another mounted tree).
	handles
		.records_tx
		.send(Record::Entry(Entry::Rename(VfsRename::new(
			VFS_RENAME,
			11,
			11,
			sub_ino,
			"leaving.txt".into(),
			0o100644,
			device,
			999_999,
			"leaving.txt".into(),
			999_999,
			"elsewhere".into(),
			device,
		))))
		.await
		.unwrap();
	handles
		.records_tx
		.send(Record::Return(Return::Generic(ReturnGeneric {
			address_id: VFS_RENAME,
			pid: 11,
			tid: 11,
			ret: 0,
		})))
		.await
		.unwrap();

	let moved = recv(&mut watcher).await;
	assert_eq!(moved.event_type, EventType::Moved);
	assert_eq!(moved.path, dir.path().join("sub").join("leaving.txt"));

	let no_more = tokio::time::timeout(Duration::from_millis(300), watcher.events().recv()).await;
	assert!(no_more.is_err(), "move-out must emit exactly one event");

	watcher.close().await.unwrap();
}

#[tokio::test]
async fn rename_into_the_watched_tree_grafts_the_live_directory() {
	let dir = common::setup_temp_dir();
	std::fs::create_dir(dir.path().join("sub")).unwrap();
	// The rename has already completed on the real filesystem by the time
	// the kretprobe return fires, so the moved-in directory and its child
	// must exist on disk before the record is sent.
	let moved_in = dir.path().join("sub").join("y");
	std::fs::create_dir(&moved_in).unwrap();
	std::fs::write(moved_in.join("z"), b"x").unwrap();

	let device = common::device_of(dir.path());
	let root_ino = common::ino_of(dir.path());
	let sub_ino = common::ino_of(&dir.path().join("sub"));

	let mut config = WatcherConfig::default();
	config.roots = vec![dir.path().to_path_buf()];

	let (factory, handles) = common::PresetStreamFactory::new();
	let mut watcher = KprobeWatcher::new(Box::new(common::NoopInstaller), Box::new(factory), config);

	watcher.add(dir.path().to_path_buf()).await.unwrap();
	watcher.start().await.unwrap();

	// Source parent key matches nothing tracked: the directory arrived from
	// outside the watched topology (e.g. `/tmp/y` renamed to `/w/sub/y`).
	handles
		.records_tx
		.send(Record::Entry(Entry::Rename(VfsRename::new(
			VFS_RENAME,
			12,
			12,
			999_999,
			"y".into(),
			0o040755,
			device,
			sub_ino,
			"y".into(),
			root_ino,
			"sub".into(),
			device,
		))))
		.await
		.unwrap();
	handles
		.records_tx
		.send(Record::Return(Return::Generic(ReturnGeneric {
			address_id: VFS_RENAME,
			pid: 12,
			tid: 12,
			ret: 0,
		})))
		.await
		.unwrap();

	let created_root = recv(&mut watcher).await;
	assert_eq!(created_root.event_type, EventType::Created);
	assert_eq!(created_root.path, moved_in);

	let created_child = recv(&mut watcher).await;
	assert_eq!(created_child.event_type, EventType::Created);
	assert_eq!(created_child.path, moved_in.join("z"));

	watcher.close().await.unwrap();
}
