//! Spawning, streaming, and killing child process trees.
//!
//! Children are placed in their own process group at spawn time, so killing
//! the negative of the group id takes out every descendant (a Job Object
//! serves the same purpose on Windows). The raw path instead attaches the
//! child to a freshly allocated PTY and puts the controlling terminal into
//! raw mode under a process-wide lock: at most one raw child exists
//! globally, and a second raw supervisor blocks until the first exits.

use std::{
	io::{self, Read},
	path::PathBuf,
	process::{ExitStatus, Stdio},
	sync::Arc,
};

use command_group::{AsyncCommandGroup, AsyncGroupChild};
use once_cell::sync::Lazy;
use portable_pty::{
	native_pty_system, Child as _, ChildKiller, CommandBuilder, MasterPty, PtySize,
	PtySystem as _, SlavePty as _,
};
use tokio::{
	io::AsyncReadExt,
	process::Command,
	select,
	sync::{mpsc, oneshot, Mutex},
	task::{self, JoinHandle},
};
use tracing::{debug, trace};

use crate::{
	error::RuntimeError,
	output::{red, Prefix, PrefixWriter},
};

#[cfg(unix)]
use command_group::UnixChildExt;

/// At most one raw child process-wide; the holder restores the terminal.
static RAW_TTY: Lazy<Arc<Mutex<()>>> = Lazy::new(|| Arc::new(Mutex::new(())));

/// Everything needed to launch one child, template rendering aside.
#[derive(Clone, Debug)]
pub struct CommandSpec {
	/// The command and its arguments; tokens may contain `{{path}}`/`{{op}}`.
	pub argv: Vec<String>,
	/// Working directory for the child.
	pub dir: PathBuf,
	/// Extra environment; the parent's environment is inherited regardless.
	pub env: Vec<(String, String)>,
	/// Allocate a PTY and put the terminal into raw mode.
	pub raw: bool,
	/// Prepended to every output line.
	pub prefix: Prefix,
}

impl CommandSpec {
	/// A spec with the stock `[guard] ` prefix, inheriting the environment,
	/// without a PTY.
	pub fn new(argv: Vec<String>, dir: impl Into<PathBuf>) -> Self {
		Self {
			argv,
			dir: dir.into(),
			env: Vec::new(),
			raw: false,
			prefix: Prefix::guard_default(),
		}
	}
}

/// A live child. Dropping it does not kill the process; the supervisor
/// always goes through [`kill_tree`](Self::kill_tree) and then waits.
pub struct RunningChild {
	kill: mpsc::UnboundedSender<()>,
	/// Resolves once the child has exited and its output is drained.
	pub done: oneshot::Receiver<Result<(), RuntimeError>>,
}

impl RunningChild {
	/// Deliver the terminate signal to the child's whole process tree.
	///
	/// Failures are reported on the child's own output; the exit outcome
	/// still arrives through `done`.
	pub fn kill_tree(&self) {
		let _ = self.kill.send(());
	}
}

/// Launch the command described by `spec` with an already-rendered argv.
pub async fn spawn(spec: &CommandSpec, argv: Vec<String>) -> Result<RunningChild, RuntimeError> {
	if spec.raw {
		spawn_pty(spec, argv).await
	} else {
		spawn_piped(spec, argv)
	}
}

fn empty_command() -> RuntimeError {
	RuntimeError::Spawn(io::Error::new(io::ErrorKind::InvalidInput, "empty command"))
}

fn spawn_piped(spec: &CommandSpec, argv: Vec<String>) -> Result<RunningChild, RuntimeError> {
	let (head, tail) = argv.split_first().ok_or_else(empty_command)?;

	let mut command = Command::new(head);
	command
		.args(tail)
		.current_dir(&spec.dir)
		.stdin(Stdio::inherit())
		.stdout(Stdio::piped())
		.stderr(Stdio::piped());
	for (key, value) in &spec.env {
		command.env(key, value);
	}

	let mut child = command
		.group()
		.kill_on_drop(true)
		.spawn()
		.map_err(RuntimeError::Spawn)?;
	debug!(pid=?child.id(), argv=?argv, "spawned child group");

	let out_task = child
		.inner()
		.stdout
		.take()
		.map(|stream| task::spawn(copy_stream(stream, spec.prefix.clone())));
	let err_task = child
		.inner()
		.stderr
		.take()
		.map(|stream| task::spawn(copy_stream(stream, spec.prefix.clone())));

	let (kill_tx, kill_rx) = mpsc::unbounded_channel();
	let (done_tx, done_rx) = oneshot::channel();
	let prefix = spec.prefix.clone();

	tokio::spawn(async move {
		let outcome = supervise_group(child, kill_rx, prefix).await;
		if let Some(task) = out_task {
			let _ = task.await;
		}
		if let Some(task) = err_task {
			let _ = task.await;
		}
		let _ = done_tx.send(outcome);
	});

	Ok(RunningChild {
		kill: kill_tx,
		done: done_rx,
	})
}

async fn copy_stream(
	mut stream: impl tokio::io::AsyncRead + Unpin,
	prefix: Prefix,
) -> io::Result<()> {
	let mut writer = PrefixWriter::new(&prefix, io::stdout());
	let mut buf = [0u8; 4096];
	loop {
		match stream.read(&mut buf).await {
			Ok(0) | Err(_) => break,
			Ok(n) => writer.write_chunk(&buf[..n])?,
		}
	}
	writer.finish()
}

async fn supervise_group(
	mut child: AsyncGroupChild,
	mut kill_rx: mpsc::UnboundedReceiver<()>,
	prefix: Prefix,
) -> Result<(), RuntimeError> {
	let status = loop {
		select! {
			status = child.wait() => break status,
			Some(()) = kill_rx.recv() => {
				trace!("terminating child group");
				if let Err(err) = terminate_group(&mut child) {
					prefix.line(&red(&RuntimeError::Kill(err).to_string()));
				}
			}
		}
	};

	match status {
		Err(err) => Err(RuntimeError::Process(err)),
		Ok(status) if status.success() => Ok(()),
		Ok(status) => Err(exit_error(&status)),
	}
}

#[cfg(unix)]
fn terminate_group(child: &mut AsyncGroupChild) -> io::Result<()> {
	child.signal(command_group::Signal::SIGTERM)
}

#[cfg(not(unix))]
fn terminate_group(child: &mut AsyncGroupChild) -> io::Result<()> {
	child.kill()
}

fn exit_error(status: &ExitStatus) -> RuntimeError {
	#[cfg(unix)]
	let signal = {
		use std::os::unix::process::ExitStatusExt;
		status.signal()
	};
	#[cfg(not(unix))]
	let signal = None;

	RuntimeError::Exit {
		code: status.code(),
		signal,
	}
}

fn pty_err(err: impl std::fmt::Display) -> RuntimeError {
	RuntimeError::Spawn(io::Error::new(io::ErrorKind::Other, err.to_string()))
}

fn terminal_size() -> PtySize {
	let (cols, rows) = crossterm::terminal::size().unwrap_or((80, 24));
	PtySize {
		rows,
		cols,
		pixel_width: 0,
		pixel_height: 0,
	}
}

async fn spawn_pty(spec: &CommandSpec, argv: Vec<String>) -> Result<RunningChild, RuntimeError> {
	let (head, tail) = argv.split_first().ok_or_else(empty_command)?;

	let raw_guard = RAW_TTY.clone().lock_owned().await;

	let pty = native_pty_system();
	let pair = pty.openpty(terminal_size()).map_err(pty_err)?;

	let mut builder = CommandBuilder::new(head);
	builder.args(tail);
	builder.cwd(&spec.dir);
	for (key, value) in &spec.env {
		builder.env(key, value);
	}

	let mut child = pair.slave.spawn_command(builder).map_err(pty_err)?;
	// Drop our slave handle so the master reader sees EOF on child exit.
	drop(pair.slave);
	let pid = child.process_id();
	let mut killer = child.clone_killer();
	debug!(?pid, argv=?argv, "spawned pty child");

	let raw_enabled = match crossterm::terminal::enable_raw_mode() {
		Ok(()) => true,
		Err(err) => {
			spec.prefix.line(&format!("set raw mode: {err}"));
			false
		}
	};

	let reader = pair.master.try_clone_reader().map_err(pty_err)?;
	let pty_writer = pair.master.take_writer().map_err(pty_err)?;
	let master = pair.master;

	let prefix = spec.prefix.clone();
	let read_task = task::spawn_blocking(move || {
		let mut reader = reader;
		let mut writer = PrefixWriter::new(&prefix, io::stdout());
		let mut buf = [0u8; 4096];
		loop {
			match reader.read(&mut buf) {
				// EIO here means the child went away; same as EOF.
				Ok(0) | Err(_) => break,
				Ok(n) => {
					if writer.write_chunk(&buf[..n]).is_err() {
						break;
					}
				}
			}
		}
		let _ = writer.finish();
	});

	// Forward our stdin to the child; ends when the master goes away.
	task::spawn_blocking(move || {
		let mut pty_writer = pty_writer;
		let _ = io::copy(&mut io::stdin(), &mut pty_writer);
	});

	let resize_task = spawn_resize_task(master);

	let mut wait = task::spawn_blocking(move || child.wait());
	let (kill_tx, kill_rx) = mpsc::unbounded_channel();
	let (done_tx, done_rx) = oneshot::channel();
	let prefix = spec.prefix.clone();

	tokio::spawn(async move {
		let mut kill_rx = kill_rx;
		let status = loop {
			select! {
				res = &mut wait => break res,
				Some(()) = kill_rx.recv() => {
					trace!(?pid, "terminating pty child tree");
					if let Err(err) = kill_pty_tree(pid, &mut killer) {
						prefix.line(&red(&RuntimeError::Kill(err).to_string()));
					}
				}
			}
		};

		let _ = read_task.await;
		resize_task.abort();
		if raw_enabled {
			let _ = crossterm::terminal::disable_raw_mode();
		}
		drop(raw_guard);

		let outcome = match status {
			Err(join) => Err(RuntimeError::Process(io::Error::new(
				io::ErrorKind::Other,
				join.to_string(),
			))),
			Ok(Err(err)) => Err(RuntimeError::Process(err)),
			Ok(Ok(status)) if status.success() => Ok(()),
			Ok(Ok(status)) => Err(RuntimeError::Exit {
				code: Some(status.exit_code() as i32),
				signal: None,
			}),
		};
		let _ = done_tx.send(outcome);
	});

	Ok(RunningChild {
		kill: kill_tx,
		done: done_rx,
	})
}

#[cfg(unix)]
fn spawn_resize_task(master: Box<dyn MasterPty + Send>) -> JoinHandle<()> {
	use tokio::signal::unix::{signal, SignalKind};

	tokio::spawn(async move {
		let Ok(mut winch) = signal(SignalKind::window_change()) else {
			// Still need to keep the master end alive until aborted.
			std::future::pending::<()>().await;
			return;
		};
		while winch.recv().await.is_some() {
			let _ = master.resize(terminal_size());
		}
	})
}

#[cfg(not(unix))]
fn spawn_resize_task(master: Box<dyn MasterPty + Send>) -> JoinHandle<()> {
	tokio::spawn(async move {
		let _master = master;
		std::future::pending::<()>().await;
	})
}

#[cfg(unix)]
fn kill_pty_tree(
	pid: Option<u32>,
	killer: &mut Box<dyn ChildKiller + Send + Sync>,
) -> io::Result<()> {
	use nix::{
		sys::signal::{killpg, Signal},
		unistd::Pid,
	};

	match pid {
		// The pty child leads its own session, so its pid is also its pgid.
		Some(pid) => killpg(Pid::from_raw(pid as i32), Signal::SIGTERM).map_err(io::Error::from),
		None => killer.kill(),
	}
}

#[cfg(not(unix))]
fn kill_pty_tree(
	_pid: Option<u32>,
	killer: &mut Box<dyn ChildKiller + Send + Sync>,
) -> io::Result<()> {
	killer.kill()
}
