//! Error types, split between errors that stop the program and errors the
//! supervisor reports and survives.

use std::{io, path::PathBuf};

use miette::Diagnostic;
use thiserror::Error;
use tokio::task::JoinError;

/// Errors which are not recoverable and stop guard execution.
///
/// These only occur during startup (configuration, pattern compilation, the
/// initial walk) or when an internal task fails to join.
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum CriticalError {
	/// A configuration problem: empty command, empty partition, and friends.
	#[error("configuration: {0}")]
	#[diagnostic(code(guard::critical::config))]
	Config(String),

	/// A flag-level parse error, as rendered by clap.
	///
	/// Also carries the `--help` and `--version` outputs, which the frontend
	/// prints and treats as a clean exit.
	#[error(transparent)]
	#[diagnostic(code(guard::critical::usage))]
	Usage(#[from] clap::Error),

	/// A watch pattern failed to compile.
	#[error("bad pattern {pattern:?}: {err}")]
	#[diagnostic(code(guard::critical::pattern))]
	Pattern {
		pattern: String,
		#[source]
		err: globset::Error,
	},

	/// The initial walk of the watched directory failed.
	#[error("setting up watches under {path:?}: {err}")]
	#[diagnostic(code(guard::critical::watch_setup))]
	WatchSetup {
		path: PathBuf,
		#[source]
		err: io::Error,
	},

	/// A supervisor task panicked or was cancelled.
	#[error("supervisor task join: {0}")]
	#[diagnostic(code(guard::critical::task_join))]
	TaskJoin(#[source] JoinError),
}

impl CriticalError {
	/// The process exit code for this error: 1 for configuration and pattern
	/// problems, 2 for everything else.
	pub fn exit_code(&self) -> u8 {
		match self {
			Self::Config(_) | Self::Usage(_) | Self::Pattern { .. } => 1,
			Self::WatchSetup { .. } | Self::TaskJoin(_) => 2,
		}
	}
}

/// Errors which are reported on the supervisor's output and do not stop it.
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum RuntimeError {
	/// An ignore file could not be read; it is treated as empty.
	#[error("reading ignore file {path:?}: {err}")]
	#[diagnostic(code(guard::runtime::ignore_read))]
	IgnoreRead {
		path: PathBuf,
		#[source]
		err: ignore::Error,
	},

	/// A stat of a watched entry failed for a reason other than removal.
	#[error("poll {path:?}: {err}")]
	#[diagnostic(code(guard::runtime::poll))]
	Poll {
		path: PathBuf,
		#[source]
		err: io::Error,
	},

	/// The child command could not be spawned.
	#[error("spawn: {0}")]
	#[diagnostic(code(guard::runtime::spawn))]
	Spawn(#[source] io::Error),

	/// The child exited unsuccessfully.
	#[error("{}", exit_message(*code, *signal))]
	#[diagnostic(code(guard::runtime::exit))]
	Exit {
		code: Option<i32>,
		signal: Option<i32>,
	},

	/// Delivering the terminate signal to the child's tree failed.
	#[error("kill: {0}")]
	#[diagnostic(code(guard::runtime::kill))]
	Kill(#[source] io::Error),

	/// Waiting on the child failed.
	#[error("wait on process: {0}")]
	#[diagnostic(code(guard::runtime::process))]
	Process(#[source] io::Error),

	/// Clearing the screen before a run failed.
	#[error("clear screen: {0}")]
	#[diagnostic(code(guard::runtime::clearscreen))]
	Clearscreen(#[from] clearscreen::Error),
}

fn exit_message(code: Option<i32>, signal: Option<i32>) -> String {
	match (code, signal) {
		(Some(code), _) => format!("exit status {code}"),
		(None, Some(signal)) => format!("killed by signal {signal}"),
		(None, None) => "exited abnormally".into(),
	}
}
