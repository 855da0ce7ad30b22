//! Building the initial set of filesystem entries to observe.

use std::{
	collections::BTreeMap,
	fs::Metadata,
	io,
	path::{Path, PathBuf},
	time::SystemTime,
};

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::{
	error::CriticalError,
	matcher::Matcher,
};

/// The last-known stat data for one watched path.
#[derive(Clone, Debug)]
pub struct WatchEntry {
	pub mtime: Option<SystemTime>,
	pub size: u64,
	pub mode: u32,
	pub ino: u64,
	pub is_dir: bool,
}

impl WatchEntry {
	pub fn from_metadata(md: &Metadata) -> Self {
		Self {
			mtime: md.modified().ok(),
			size: md.len(),
			mode: mode_bits(md),
			ino: inode(md),
			is_dir: md.is_dir(),
		}
	}

	pub fn stat(path: &Path) -> io::Result<Self> {
		std::fs::metadata(path).map(|md| Self::from_metadata(&md))
	}
}

#[cfg(unix)]
fn mode_bits(md: &Metadata) -> u32 {
	use std::os::unix::fs::MetadataExt;
	md.mode()
}

#[cfg(not(unix))]
fn mode_bits(md: &Metadata) -> u32 {
	md.permissions().readonly() as u32
}

#[cfg(unix)]
fn inode(md: &Metadata) -> u64 {
	use std::os::unix::fs::MetadataExt;
	md.ino()
}

#[cfg(not(unix))]
fn inode(_md: &Metadata) -> u64 {
	0
}

/// Watched paths, keyed by absolute path.
pub type WatchSet = BTreeMap<PathBuf, WatchEntry>;

/// What the builder found, for the startup log line.
#[derive(Clone, Debug)]
pub struct WatchSummary {
	pub count: usize,
	sample: Vec<PathBuf>,
	truncated: bool,
}

impl WatchSummary {
	const SAMPLE_LEN: usize = 10;

	fn push(&mut self, path: &Path) {
		self.count += 1;
		if self.sample.len() < Self::SAMPLE_LEN {
			self.sample.push(path.to_owned());
		} else {
			self.truncated = true;
		}
	}

	/// The first ten matched paths, space-separated, with a trailing `...`
	/// when more were found.
	pub fn preview(&self) -> String {
		let mut parts: Vec<String> = self
			.sample
			.iter()
			.map(|p| p.display().to_string())
			.collect();
		if self.truncated {
			parts.push("...".into());
		}
		parts.join(" ")
	}
}

/// Walk `root` depth-first and collect every entry the matcher includes,
/// with current stat data.
///
/// Directories that are not themselves matched are still descended, unless
/// the matcher negates them by name. The parent directory of every matched
/// entry is also inserted so that file creation inside it is observed, and
/// the root always is.
pub fn build(root: &Path, matcher: &Matcher) -> Result<(WatchSet, WatchSummary), CriticalError> {
	let mut set = WatchSet::new();
	let mut summary = WatchSummary {
		count: 0,
		sample: Vec::new(),
		truncated: false,
	};

	let setup_err = |err: walkdir::Error| {
		let path = err
			.path()
			.map_or_else(|| root.to_owned(), Path::to_owned);
		CriticalError::WatchSetup {
			path,
			err: err
				.into_io_error()
				.unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "filesystem loop")),
		}
	};

	let walker = WalkDir::new(root)
		.follow_links(false)
		.into_iter()
		.filter_entry(|e| {
			e.depth() == 0
				|| !(e.file_type().is_dir() && matcher.match_path(e.path(), true).negated)
		});

	let mut matched_parents = Vec::new();
	for entry in walker {
		let entry = entry.map_err(setup_err)?;
		let md = entry.metadata().map_err(setup_err)?;
		let is_dir = md.is_dir();

		if entry.depth() == 0 {
			set.insert(entry.path().to_owned(), WatchEntry::from_metadata(&md));
			continue;
		}

		if matcher.match_path(entry.path(), is_dir).matched {
			summary.push(entry.path());
			if let Some(parent) = entry.path().parent() {
				matched_parents.push(parent.to_owned());
			}
			set.insert(entry.path().to_owned(), WatchEntry::from_metadata(&md));
		}
	}

	for parent in matched_parents {
		if set.contains_key(&parent) {
			continue;
		}
		match WatchEntry::stat(&parent) {
			Ok(watch) => {
				set.insert(parent, watch);
			}
			Err(err) => warn!(path=?parent, %err, "could not stat parent of matched entry"),
		}
	}

	debug!(root=?root, entries=%set.len(), matched=%summary.count, "built watch set");
	Ok((set, summary))
}

#[cfg(test)]
mod tests {
	use std::fs;

	use tempfile::TempDir;

	use super::*;
	use crate::matcher::{default_patterns, Matcher};

	fn patterns(list: &[&str]) -> Vec<String> {
		list.iter().map(|p| (*p).to_string()).collect()
	}

	#[test]
	fn collects_matched_files_and_root() {
		let dir = TempDir::new().unwrap();
		fs::write(dir.path().join("a.txt"), "a").unwrap();
		fs::create_dir(dir.path().join("sub")).unwrap();
		fs::write(dir.path().join("sub/b.txt"), "b").unwrap();

		let m = Matcher::new(dir.path(), &default_patterns()).unwrap();
		let (set, summary) = build(dir.path(), &m).unwrap();

		assert!(set.contains_key(dir.path()));
		assert!(set.contains_key(&dir.path().join("a.txt")));
		assert!(set.contains_key(&dir.path().join("sub")));
		assert!(set.contains_key(&dir.path().join("sub/b.txt")));
		assert_eq!(summary.count, 3); // a.txt, sub, sub/b.txt
	}

	#[test]
	fn inserts_unmatched_parent_of_matched_file() {
		let dir = TempDir::new().unwrap();
		fs::create_dir(dir.path().join("sub")).unwrap();
		fs::write(dir.path().join("sub/b.go"), "b").unwrap();
		fs::write(dir.path().join("a.go"), "a").unwrap();

		let m = Matcher::new(dir.path(), &patterns(&["sub/*.go"])).unwrap();
		let (set, summary) = build(dir.path(), &m).unwrap();

		// `sub` itself does not match the pattern, but is present so that
		// new files inside it are observed.
		assert!(set.contains_key(&dir.path().join("sub")));
		assert!(set.contains_key(&dir.path().join("sub/b.go")));
		assert!(!set.contains_key(&dir.path().join("a.go")));
		assert_eq!(summary.count, 1);
	}

	#[test]
	fn negated_directories_are_not_descended() {
		let dir = TempDir::new().unwrap();
		fs::create_dir(dir.path().join("tmp")).unwrap();
		fs::write(dir.path().join("tmp/x"), "x").unwrap();
		fs::write(dir.path().join("keep"), "k").unwrap();

		let m = Matcher::new(dir.path(), &patterns(&["**", "!tmp"])).unwrap();
		let (set, _) = build(dir.path(), &m).unwrap();

		assert!(!set.contains_key(&dir.path().join("tmp")));
		assert!(!set.contains_key(&dir.path().join("tmp/x")));
		assert!(set.contains_key(&dir.path().join("keep")));
	}

	#[test]
	fn gitignored_entries_are_excluded() {
		let dir = TempDir::new().unwrap();
		fs::write(dir.path().join(".gitignore"), "skipped\n").unwrap();
		fs::create_dir(dir.path().join("skipped")).unwrap();
		fs::write(dir.path().join("skipped/x"), "x").unwrap();
		fs::write(dir.path().join("watched"), "w").unwrap();

		let m = Matcher::new(dir.path(), &default_patterns()).unwrap();
		let (set, _) = build(dir.path(), &m).unwrap();

		assert!(!set.contains_key(&dir.path().join("skipped/x")));
		assert!(set.contains_key(&dir.path().join("watched")));
	}

	#[test]
	fn summary_preview_truncates_to_ten() {
		let dir = TempDir::new().unwrap();
		for i in 0..15 {
			fs::write(dir.path().join(format!("f{i:02}")), "x").unwrap();
		}

		let m = Matcher::new(dir.path(), &default_patterns()).unwrap();
		let (_, summary) = build(dir.path(), &m).unwrap();

		assert_eq!(summary.count, 15);
		let preview = summary.preview();
		assert!(preview.ends_with("..."));
		assert_eq!(preview.split(' ').count(), 11);
	}
}
