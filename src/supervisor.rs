//! The supervisor: binds matcher, poller, and child runner into a state
//! machine.
//!
//! One supervisor owns one command. It runs it once at startup (unless told
//! not to), then watches the filesystem; a matched change kills the child's
//! whole tree, awaits its exit, and runs the command again. Bursts of
//! events are suppressed by a leading-edge debounce: the first event in a
//! quiet period fires immediately, and every suppressed event extends the
//! quiet window.

use std::{
	path::Path,
	sync::Arc,
	time::{Duration, Instant},
};

use tokio::{
	select,
	sync::{oneshot, Notify},
};
use tracing::{debug, trace, warn};

use crate::{
	error::{CriticalError, RuntimeError},
	event::{ChangeEvent, Op},
	matcher::{default_patterns, Matcher},
	output::{green, red, Prefix},
	poller::Poller,
	process::{self, CommandSpec, RunningChild},
	template,
	watchset,
};

pub const DEFAULT_POLL: Duration = Duration::from_millis(300);
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(300);

/// Everything one supervisor needs.
#[derive(Clone, Debug)]
pub struct SupervisorConfig {
	/// Watch patterns; empty means the default set (`**`, `!g`).
	pub patterns: Vec<String>,
	/// The command to run and guard; its `dir` is also the watch root.
	pub command: CommandSpec,
	pub poll: Duration,
	pub debounce: Duration,
	pub clear_screen: bool,
	pub no_init_run: bool,
}

impl SupervisorConfig {
	pub fn new(command: CommandSpec) -> Self {
		Self {
			patterns: Vec::new(),
			command,
			poll: DEFAULT_POLL,
			debounce: DEFAULT_DEBOUNCE,
			clear_screen: false,
			no_init_run: false,
		}
	}
}

/// Where the state machine is.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SupervisorState {
	Idle,
	Running,
	Restarting,
	Stopped,
}

/// Stops a running supervisor from the outside.
#[derive(Clone)]
pub struct SupervisorHandle {
	stop: Arc<Notify>,
}

impl SupervisorHandle {
	pub fn stop(&self) {
		self.stop.notify_one();
	}
}

pub struct Supervisor {
	config: SupervisorConfig,
	stop: Arc<Notify>,
}

impl Supervisor {
	pub fn new(config: SupervisorConfig) -> Self {
		Self {
			config,
			stop: Arc::new(Notify::new()),
		}
	}

	pub fn handle(&self) -> SupervisorHandle {
		SupervisorHandle {
			stop: self.stop.clone(),
		}
	}

	/// Run until stopped. Consumes the supervisor; keep a
	/// [`handle`](Self::handle) around to stop it.
	pub async fn run(self) -> Result<(), CriticalError> {
		let Self { mut config, stop } = self;

		if config.patterns.is_empty() {
			config.patterns = default_patterns();
		}

		let dir = dunce::canonicalize(&config.command.dir).map_err(|err| {
			CriticalError::WatchSetup {
				path: config.command.dir.clone(),
				err,
			}
		})?;
		config.command.dir = dir.clone();
		let prefix = config.command.prefix.clone();

		let matcher = Matcher::new(dir.clone(), &config.patterns)?;
		for err in matcher.ignore_errors() {
			prefix.line(&red(&err.to_string()));
		}
		let matcher = Arc::new(matcher);

		let (set, summary) = watchset::build(&dir, &matcher)?;
		prefix.line(&format!(
			"watched {} files: {}",
			summary.count,
			green(&summary.preview()),
		));

		let (poller, mut events, mut errors) = Poller::spawn(set, matcher.clone(), config.poll);

		let mut state = SupervisorState::Idle;
		let mut runs: u64 = 0;
		let mut child: Option<RunningChild> = None;
		let mut last_event: Option<Instant> = None;

		if !config.no_init_run {
			runs += 1;
			child = start_run(&config, &prefix, runs, None, &dir).await;
			state = if child.is_some() {
				SupervisorState::Running
			} else {
				SupervisorState::Idle
			};
		}
		trace!(?state, "supervisor started");

		loop {
			select! {
				_ = stop.notified() => {
					debug!("stop requested");
					poller.stop();
					if let Some(current) = child.take() {
						current.kill_tree();
						log_done(&prefix, &config, runs, flatten(current.done.await));
					}
					state = SupervisorState::Stopped;
					break;
				}

				maybe = events.recv() => match maybe {
					None => {
						debug!("poller closed");
						if let Some(current) = child.take() {
							current.kill_tree();
							log_done(&prefix, &config, runs, flatten(current.done.await));
						}
						state = SupervisorState::Stopped;
						break;
					}
					Some(event) => {
						if !matcher.match_path(&event.path, event.is_dir).matched {
							trace!(%event, "unmatched event");
							continue;
						}

						let now = Instant::now();
						if let Some(last) = last_event {
							if now.duration_since(last) < config.debounce {
								// Suppressed, but the quiet window extends.
								last_event = Some(now);
								trace!(%event, "debounced event");
								continue;
							}
						}
						last_event = Some(now);

						prefix.line(&event_line(&event, &dir));

						if event.op == Op::Create && event.is_dir {
							match watchset::build(&event.path, &matcher) {
								Ok((more, _)) => poller.extend(more),
								Err(err) => prefix.line(&red(&err.to_string())),
							}
						}

						if let Some(current) = child.take() {
							state = SupervisorState::Restarting;
							trace!(?state, "killing child for restart");
							current.kill_tree();
							log_done(&prefix, &config, runs, flatten(current.done.await));
						}

						runs += 1;
						child = start_run(&config, &prefix, runs, Some(&event), &dir).await;
						state = if child.is_some() {
							SupervisorState::Running
						} else {
							SupervisorState::Idle
						};
					}
				},

				Some(err) = errors.recv() => {
					prefix.line(&red(&err.to_string()));
				}

				res = await_done(&mut child), if child.is_some() => {
					child = None;
					log_done(&prefix, &config, runs, res);
					state = SupervisorState::Idle;
					trace!(?state, "child exited");
				}
			}
		}

		poller.join().await;
		debug!(?state, "supervisor stopped");
		Ok(())
	}
}

async fn await_done(child: &mut Option<RunningChild>) -> Result<(), RuntimeError> {
	match child.as_mut() {
		Some(current) => flatten((&mut current.done).await),
		None => std::future::pending().await,
	}
}

fn flatten(
	res: Result<Result<(), RuntimeError>, oneshot::error::RecvError>,
) -> Result<(), RuntimeError> {
	res.unwrap_or_else(|_| {
		Err(RuntimeError::Process(std::io::Error::new(
			std::io::ErrorKind::Other,
			"child task ended without reporting",
		)))
	})
}

async fn start_run(
	config: &SupervisorConfig,
	prefix: &Prefix,
	runs: u64,
	event: Option<&ChangeEvent>,
	dir: &Path,
) -> Option<RunningChild> {
	if config.clear_screen {
		if let Err(err) = clearscreen::clear() {
			prefix.line(&red(&RuntimeError::from(err).to_string()));
		}
	}

	prefix.line(&format!(
		"run {} {}",
		runs,
		green(&config.command.argv.join(" ")),
	));

	// On the initial run there is no triggering event and both template
	// variables render empty.
	let (path, op) = match event {
		Some(event) => (relative_to(&event.path, dir), event.op.as_str()),
		None => (String::new(), ""),
	};
	let argv = template::render_argv(&config.command.argv, &path, op);

	match process::spawn(&config.command, argv).await {
		Ok(child) => Some(child),
		Err(err) => {
			log_done(prefix, config, runs, Err(err));
			None
		}
	}
}

fn log_done(prefix: &Prefix, config: &SupervisorConfig, runs: u64, outcome: Result<(), RuntimeError>) {
	let argv = green(&config.command.argv.join(" "));
	match outcome {
		Ok(()) => prefix.line(&format!("done {runs} {argv}")),
		Err(err) => prefix.line(&format!("done {runs} {argv} {}", red(&err.to_string()))),
	}
}

fn event_line(event: &ChangeEvent, dir: &Path) -> String {
	format!("{} {}", event.op, relative_to(&event.path, dir))
}

/// The triggering path, made relative to the working directory. Failures
/// fall back to the raw path.
fn relative_to(path: &Path, dir: &Path) -> String {
	let canon = match dunce::canonicalize(path) {
		Ok(canon) => canon,
		Err(err) => {
			warn!(?path, %err, "could not canonicalize event path");
			path.to_owned()
		}
	};
	match canon.strip_prefix(dir) {
		Ok(rel) => rel.display().to_string(),
		Err(_) => canon.display().to_string(),
	}
}
