//! Mount resolution for the directory-entry cache's root walk.
//!
//! Unlike the probe installer and record stream — which need a live kernel
//! tracing facility this crate does not ship — mount resolution is ordinary
//! POSIX syscalls, so this module implements it for real against
//! `/proc/self/mountinfo`.

use crate::error::{Result, WatcherError};
use nix::sys::stat::stat;
use std::fs;
use std::path::{Path, PathBuf};

/// A combined major:minor device number, as decoded from `struct
/// super_block` by the kprobe fetch-arg expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceNumber(pub u64);

impl DeviceNumber {
	pub fn from_major_minor(major: u32, minor: u32) -> Self {
		Self(nix::sys::stat::makedev(major as u64, minor as u64))
	}

	pub fn major(self) -> u32 {
		nix::sys::stat::major(self.0) as u32
	}

	pub fn minor(self) -> u32 {
		nix::sys::stat::minor(self.0) as u32
	}
}

impl std::fmt::Display for DeviceNumber {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}:{}", self.major(), self.minor())
	}
}

/// A mounted filesystem. `Subtree` is the mounted subtree ("/" for a
/// whole-filesystem mount, something else for a bind mount) and is used as
/// the `Name` of root `DirEntry` nodes so that bind mounts of the same
/// device disambiguate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
	pub path: PathBuf,
	pub filesystem_type: String,
	pub device_number: DeviceNumber,
	pub subtree: String,
	pub read_only: bool,
}

/// Finds the mount that contains `path` by walking `/proc/self/mountinfo`
/// and picking the longest matching mount point, then confirming the
/// device number against an `lstat` of `path` itself.
pub fn find_mount(path: &Path) -> Result<Mount> {
	let canonical = fs::canonicalize(path).map_err(|e| WatcherError::MountLookup {
		path: path.display().to_string(),
		cause: e.to_string(),
	})?;

	let mountinfo = fs::read_to_string("/proc/self/mountinfo").map_err(|e| {
		WatcherError::MountLookup { path: path.display().to_string(), cause: e.to_string() }
	})?;

	let mut best: Option<Mount> = None;
	for line in mountinfo.lines() {
		if let Some(candidate) = parse_mountinfo_line(line) {
			if canonical.starts_with(&candidate.path)
				&& best.as_ref().map(|b| b.path.as_os_str().len() < candidate.path.as_os_str().len())
					.unwrap_or(true)
			{
				best = Some(candidate);
			}
		}
	}

	let mut mount = best.ok_or_else(|| WatcherError::MountLookup {
		path: path.display().to_string(),
		cause: "no containing mount found in /proc/self/mountinfo".to_string(),
	})?;

	let st = stat(&canonical).map_err(|e| WatcherError::MountLookup {
		path: path.display().to_string(),
		cause: e.to_string(),
	})?;
	mount.device_number = DeviceNumber(st.st_dev);

	Ok(mount)
}

/// Parses one `/proc/self/mountinfo` line. Format (see proc(5)):
/// `ID PARENT MAJOR:MINOR ROOT MOUNTPOINT OPTIONS... - FSTYPE SOURCE SUPEROPTIONS`
fn parse_mountinfo_line(line: &str) -> Option<Mount> {
	let mut fields = line.split(' ');
	let _id = fields.next()?;
	let _parent = fields.next()?;
	let dev = fields.next()?;
	let root = fields.next()?;
	let mount_point = fields.next()?;
	let options: Vec<&str> = fields.by_ref().take_while(|f| *f != "-").collect();
	let read_only = options.first().map(|o| o.split(',').any(|f| f == "ro")).unwrap_or(false);
	let filesystem_type = fields.next()?.to_string();

	let (major, minor) = dev.split_once(':')?;
	let device_number = DeviceNumber::from_major_minor(major.parse().ok()?, minor.parse().ok()?);

	Some(Mount {
		path: PathBuf::from(unescape_octal(mount_point)),
		filesystem_type,
		device_number,
		subtree: unescape_octal(root),
		read_only,
	})
}

/// `/proc` escapes space, tab, newline and backslash as `\NNN` octal.
fn unescape_octal(s: &str) -> String {
	let bytes = s.as_bytes();
	let mut out = String::with_capacity(bytes.len());
	let mut i = 0;
	while i < bytes.len() {
		if bytes[i] == b'\\' && i + 3 < bytes.len() {
			if let Ok(code) = u8::from_str_radix(std::str::from_utf8(&bytes[i + 1..i + 4]).unwrap_or(""), 8) {
				out.push(code as char);
				i += 4;
				continue;
			}
		}
		out.push(bytes[i] as char);
		i += 1;
	}
	out
}
