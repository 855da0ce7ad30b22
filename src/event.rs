//! Change events emitted by the poller.

use std::{fmt, path::PathBuf};

/// What happened to a watched path.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Op {
	Create,
	Write,
	Remove,
	Rename,
	Chmod,
}

impl Op {
	/// The lowercase name, as exposed to argv templates via `{{op}}`.
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Create => "create",
			Self::Write => "write",
			Self::Remove => "remove",
			Self::Rename => "rename",
			Self::Chmod => "chmod",
		}
	}
}

impl fmt::Display for Op {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// A single filesystem change observed during one poll cycle.
///
/// `old_path` is only set for [`Op::Rename`], where `path` is the new name.
#[derive(Clone, Debug)]
pub struct ChangeEvent {
	pub op: Op,
	pub path: PathBuf,
	pub old_path: Option<PathBuf>,
	pub is_dir: bool,
}

impl fmt::Display for ChangeEvent {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match &self.old_path {
			Some(old) => write!(f, "{} {} -> {}", self.op, old.display(), self.path.display()),
			None => write!(f, "{} {}", self.op, self.path.display()),
		}
	}
}
