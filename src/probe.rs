//! Probe registry & record model: a static table associating each watched
//! VFS symbol with an (entry-probe, return-probe) definition pair and a
//! stable numeric [`AddressId`], plus the fetch-argument ABI strings that
//! materialize the fields each handler needs.
//!
//! The fetch-argument strings are part of the on-kernel `kprobe_events`
//! ABI and must never be reformatted or regenerated at runtime — a kernel
//! expects these exact byte sequences.

use crate::error::Result;

/// Dense small integer identifying a watched kernel symbol. Both the
/// entry and return probe for a symbol share the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKind {
	Entry,
	Return,
}

/// A probe installation request, as consumed by a [`ProbeInstaller`].
/// `fetchargs` and `filter` are `kprobe_events` syntax and are not
/// synthesized at runtime beyond the `name`/`group` concatenation done
/// here.
#[derive(Debug, Clone)]
pub struct ProbeDefinition {
	pub kind: ProbeKind,
	pub group: &'static str,
	pub name: String,
	pub symbol: &'static str,
	pub fetchargs: &'static str,
	pub filter: Option<&'static str>,
}

/// External collaborator: binds a per-symbol record decoder by
/// installing a kprobe/kretprobe definition into tracefs. The concrete
/// kernel-facing implementation is not shipped by this crate; callers
/// supply one, or a fake for testing.
pub trait ProbeInstaller {
	fn install(&self, def: &ProbeDefinition) -> Result<()>;
}

/// Every VFS symbol the engine watches, in the fixed order their
/// [`AddressId`] is assigned. The set is closed and known at
/// compile time, so the "registry" is a plain array rather than a
/// dynamically-populated map guarded by a mutex — there is nothing to
/// register at runtime beyond handing these definitions to the installer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Symbol {
	ChmodCommon,
	ChownCommon,
	VfsFileattrSet,
	VfsSetxattr,
	VfsRemovexattr,
	VfsWrite,
	VfsWritev,
	VfsUtimes,
	VfsCreate,
	VfsFallocate,
	VfsLink,
	VfsMknod,
	VfsSymlink,
	DoOpen,
	VfsUnlink,
	VfsRmdir,
	VfsRename,
}

pub const ALL_SYMBOLS: &[Symbol] = &[
	Symbol::ChmodCommon,
	Symbol::ChownCommon,
	Symbol::VfsFileattrSet,
	Symbol::VfsSetxattr,
	Symbol::VfsRemovexattr,
	Symbol::VfsWrite,
	Symbol::VfsWritev,
	Symbol::VfsUtimes,
	Symbol::VfsCreate,
	Symbol::VfsFallocate,
	Symbol::VfsLink,
	Symbol::VfsMknod,
	Symbol::VfsSymlink,
	Symbol::DoOpen,
	Symbol::VfsUnlink,
	Symbol::VfsRmdir,
	Symbol::VfsRename,
];

impl Symbol {
	/// The `AddressId` assigned to this symbol: its position in
	/// [`ALL_SYMBOLS`]. Stable for the lifetime of the process and shared
	/// between the entry and return probe of the same symbol.
	pub fn address_id(self) -> AddressId {
		AddressId(ALL_SYMBOLS.iter().position(|s| *s == self).expect("symbol in ALL_SYMBOLS") as u32)
	}

	pub fn kernel_symbol(self) -> &'static str {
		match self {
			Symbol::ChmodCommon => "chmod_common",
			Symbol::ChownCommon => "chown_common",
			Symbol::VfsFileattrSet => "vfs_fileattr_set",
			Symbol::VfsSetxattr => "vfs_setxattr",
			Symbol::VfsRemovexattr => "vfs_removexattr",
			Symbol::VfsWrite => "vfs_write",
			Symbol::VfsWritev => "vfs_writev",
			Symbol::VfsUtimes => "vfs_utimes",
			Symbol::VfsCreate => "vfs_create",
			Symbol::VfsFallocate => "vfs_fallocate",
			Symbol::VfsLink => "vfs_link",
			Symbol::VfsMknod => "vfs_mknod",
			Symbol::VfsSymlink => "vfs_symlink",
			Symbol::DoOpen => "do_open",
			Symbol::VfsUnlink => "vfs_unlink",
			Symbol::VfsRmdir => "vfs_rmdir",
			Symbol::VfsRename => "vfs_rename",
		}
	}

	/// The entry probe's fetch-argument expression: the on-kernel ABI
	/// string a real tracefs install writes byte-for-byte.
	pub fn fetchargs(self) -> &'static str {
		match self {
			Symbol::ChmodCommon => {
				"parent_ino=+64(+48(+24(+8($arg1)))):u64 \
				 file_name=+0(+40(+8($arg1))):string \
				 dev_major=+16(+40(+48(+8($arg1)))):b12@20/32 \
				 dev_minor=+16(+40(+48(+8($arg1)))):b10@0/32"
			}
			Symbol::ChownCommon => {
				"parent_ino=+64(+48(+24(+8($arg1)))):u64 \
				 file_name=+0(+40(+8($arg1))):string \
				 dev_major=+16(+40(+48(+8($arg1)))):b12@20/32 \
				 dev_minor=+16(+40(+48(+8($arg1)))):b10@0/32"
			}
			Symbol::VfsFileattrSet => {
				"parent_ino=+64(+48(+24($arg2))):u64 \
				 file_name=+0(+40($arg2)):string \
				 dev_major=+16(+40(+48($arg2))):b12@20/32 \
				 dev_minor=+16(+40(+48($arg2))):b10@0/32"
			}
			Symbol::VfsSetxattr => {
				"parent_ino=+64(+48(+24($arg2))):u64 \
				 file_name=+0(+40($arg1)):string \
				 dev_major=+16(+40(+48($arg2))):b12@20/32 \
				 dev_minor=+16(+40(+48($arg2))):b10@0/32"
			}
			Symbol::VfsRemovexattr => {
				"file_name=+0(+40($arg2)):string \
				 parent_ino=+64(+48(+24($arg2))):u64 \
				 dev_major=+16(+40(+48($arg2))):b12@20/32 \
				 dev_minor=+16(+40(+48($arg2))):b10@0/32"
			}
			Symbol::VfsWrite | Symbol::VfsWritev => {
				"parent_ino=+64(+48(+24(+160($arg1)))):u64 \
				 file_name=+0(+40(+160($arg1))):string \
				 dev_major=+16(+40(+48(+24(+160($arg1))))):b12@20/32 \
				 dev_minor=+16(+40(+48(+24(+160($arg1))))):b10@0/32"
			}
			Symbol::VfsUtimes => {
				"file_name=+0(+40(+8($arg1))):string \
				 parent_ino=+64(+48(+24(+8($arg1)))):u64 \
				 dev_major=+16(+40(+48(+8($arg1)))):b12@20/32 \
				 dev_minor=+16(+40(+48(+8($arg1)))):b10@0/32"
			}
			Symbol::VfsCreate => {
				"file_name=+0(+40($arg3)):string \
				 parent_ino=+64(+48(+24($arg3))):u64 \
				 parent_parent_ino=+64(+48(+24(+24($arg3)))):u64 \
				 parent_file_name=+0(+40(+24($arg3))):string \
				 parent_dev_major=+16(+40(+48(+24($arg3)))):b12@20/32 \
				 parent_dev_minor=+16(+40(+48(+24($arg3)))):b10@0/32"
			}
			Symbol::VfsFallocate => {
				"file_name=+0(+40(+160($arg1))):string \
				 parent_ino=+64(+48(+24(+160($arg1)))):u64 \
				 parent_file_name=+0(+40(+24(+160($arg1)))):string \
				 parent_parent_ino=+64(+48(+24(+24(+160($arg1))))):u64 \
				 parent_dev_major=+16(+40(+48(+24(+160($arg1))))):b12@20/32 \
				 parent_dev_minor=+16(+40(+48(+24(+160($arg1))))):b10@0/32"
			}
			Symbol::VfsLink => {
				"parent_ino=+64(+48(+24($arg4))):u64 \
				 parent_parent_ino=+64(+48(+24(+24($arg4)))):u64 \
				 parent_file_name=+0(+40(+24($arg4))):string \
				 parent_dev_major=+16(+40(+48(+24($arg4)))):b12@20/32 \
				 parent_dev_minor=+16(+40(+48(+24($arg4)))):b10@0/32 \
				 file_name=+0(+40($arg1)):string"
			}
			Symbol::VfsMknod => {
				"file_name=+0(+40($arg3)):string \
				 parent_parent_ino=+64(+48(+24(+24($arg3)))):u64 \
				 parent_ino=+64(+48(+24($arg3))):u64 \
				 parent_file_name=+0(+40(+24($arg3))):string \
				 parent_dev_major=+16(+40(+48(+24($arg3)))):b12@20/32 \
				 parent_dev_minor=+16(+40(+48(+24($arg3)))):b10@0/32"
			}
			Symbol::VfsSymlink => {
				"parent_ino=+64(+48(+24($arg3))):u64 \
				 parent_parent_ino=+64(+48(+24(+24($arg3)))):u64 \
				 parent_file_name=+0(+40(+24($arg3))):string \
				 parent_dev_major=+16(+40(+48(+24($arg3)))):b12@20/32 \
				 parent_dev_minor=+16(+40(+48(+24($arg3)))):b10@0/32 \
				 file_name=+0(+40($arg3)):string"
			}
			Symbol::DoOpen => {
				"parent_ino=+64(+48(+24(+8($arg1)))):u64 \
				 created=+20($arg2):b1@20/64 \
				 file_name=+0(+40(+8($arg1))):string \
				 parent_dev_major=+16(+40(+48(+24(+8($arg1))))):b12@20/32 \
				 parent_dev_minor=+16(+40(+48(+24(+8($arg1))))):b10@0/32 \
				 parent_file_name=+0(+40(+24(+8($arg1)))):string \
				 parent_parent_ino=+64(+48(+24(+24(+8($arg1))))):u64"
			}
			Symbol::VfsUnlink => {
				"file_name=+0(+40($arg3)):string \
				 parent_ino=+64(+48(+24($arg3))):u64 \
				 dev_major=+16(+40(+48($arg3))):b12@20/32 \
				 dev_minor=+16(+40(+48($arg3))):b10@0/32"
			}
			Symbol::VfsRmdir => {
				"parent_ino=+64(+48(+24($arg3))):u64 \
				 file_name=+0(+40($arg3)):string \
				 dev_major=+16(+40(+48($arg3))):b12@20/32 \
				 dev_minor=+16(+40(+48($arg3))):b10@0/32"
			}
			Symbol::VfsRename => {
				"src_parent_ino=+64(+48(+24(+16($arg1)))):s64 \
				 src_file_name=+0(+40(+16($arg1))):string \
				 src_file_mode=+0(+48(+24(+16($arg1)))):u16 \
				 src_dev_major=+16(+40(+48(+16($arg1)))):b12@20/32 \
				 src_dev_minor=+16(+40(+48(+16($arg1)))):b10@0/32 \
				 dst_parent_ino=+64(+48(+24(+40($arg1)))):u64 \
				 dst_file_name=+0(+40(+40($arg1))):string \
				 dst_parent_parent_ino=+64(+48(+24(+24(+40($arg1))))):u64 \
				 dst_parent_file_name=+0(+40(+24(+40($arg1)))):string \
				 parent_dest_dev_major=+16(+40(+48(+24(+40($arg1))))):b12@20/32 \
				 parent_dest_dev_minor=+16(+40(+48(+24(+40($arg1))))):b10@0/32"
			}
		}
	}

	/// Entry-probe filter, consulted by the installer before the ring
	/// even delivers a record. `do_open` only intercepts calls where the
	/// created bit is set.
	pub fn filter(self) -> Option<&'static str> {
		match self {
			Symbol::DoOpen => Some("created == 1"),
			_ => None,
		}
	}

	/// Builds the (entry, return) probe definitions for this symbol,
	/// ready to hand to a [`ProbeInstaller`].
	pub fn definitions(self) -> (ProbeDefinition, ProbeDefinition) {
		let symbol = self.kernel_symbol();
		let entry = ProbeDefinition {
			kind: ProbeKind::Entry,
			group: "filewatch",
			name: format!("kprobe_{symbol}"),
			symbol,
			fetchargs: self.fetchargs(),
			filter: self.filter(),
		};
		let ret = ProbeDefinition {
			kind: ProbeKind::Return,
			group: "filewatch",
			name: format!("kretprobe_{symbol}"),
			symbol,
			fetchargs: "ret=$retval:s32",
			filter: None,
		};
		(entry, ret)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn address_ids_are_dense_and_stable() {
		for (i, symbol) in ALL_SYMBOLS.iter().enumerate() {
			assert_eq!(symbol.address_id(), AddressId(i as u32));
		}
	}

	#[test]
	fn do_open_carries_the_created_filter() {
		let (entry, ret) = Symbol::DoOpen.definitions();
		assert_eq!(entry.filter, Some("created == 1"));
		assert!(ret.filter.is_none());
	}

	#[test]
	fn return_probe_fetches_signed_retval() {
		let (_, ret) = Symbol::VfsCreate.definitions();
		assert_eq!(ret.fetchargs, "ret=$retval:s32");
	}

	#[test]
	fn every_symbol_produces_distinct_names() {
		let mut names: Vec<String> =
			ALL_SYMBOLS.iter().map(|s| s.definitions().0.name).collect();
		let before = names.len();
		names.sort();
		names.dedup();
		assert_eq!(names.len(), before);
	}
}
