//! Guard: the library
//!
//! This is the library behind the `guard` CLI tool: a file-watching command
//! supervisor. It spawns a command, polls a set of watched files, and kills
//! and reruns the command when any of them change. Several supervisors can
//! run in parallel with prefixed, colorized output. The tool is the point
//! of the project; no semver guarantees apply to this library interface.

#![deny(rust_2018_idioms)]

pub mod args;
pub mod coordinator;
pub mod error;
pub mod event;
pub mod matcher;
pub mod output;
pub mod poller;
pub mod process;
pub mod supervisor;
pub mod template;
pub mod watchset;

pub use error::{CriticalError, RuntimeError};
pub use process::CommandSpec;
pub use supervisor::{Supervisor, SupervisorConfig, SupervisorHandle};

/// Parse a raw argv (without the program name) and run every configured
/// supervisor to completion.
pub async fn run(argv: Vec<String>) -> Result<(), CriticalError> {
	let configs = args::parse(argv)?;
	coordinator::run_all(configs).await
}
