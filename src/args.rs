//! CLI argument handling.
//!
//! clap only sees one supervisor's flags at a time: the raw argv is first
//! replaced wholesale by an `@file`'s lines if one is present, then split
//! on `---` into one partition per supervisor, and each partition is split
//! at `--` into flags (for clap) and the command to run.

use std::{path::PathBuf, str::FromStr, time::Duration};

use clap::Parser;
use tracing::debug;

use crate::{
	error::CriticalError,
	output::Prefix,
	process::CommandSpec,
	supervisor::SupervisorConfig,
};

/// Separates one supervisor's arguments from the next.
pub const PARTITION_SEPARATOR: &str = "---";
/// Separates a supervisor's flags from its command.
pub const COMMAND_SEPARATOR: &str = "--";

/// Run and guard a command: kill and rerun it when watched files change.
///
/// Watching is polling-based, so it behaves the same on every platform and
/// filesystem. Argv tokens support the template variables {{path}} and
/// {{op}}.
#[derive(Clone, Debug, Parser)]
#[command(
	name = "guard",
	bin_name = "guard",
	version,
	after_help = "\
Examples:

  # everything after -- is the command to run; restart the server on change
  guard -- node server.js

  # ! negates a pattern; watch everything except the tmp dir
  guard -w '**' -w '!tmp/**' -- echo changed

  # the special !g pattern applies all gitignore rules (this is the default)
  guard -w '**' -w '!g' -- echo changed

  # template variables
  guard -n -- rsync {{path}} root@host:/app/{{path}}

  # patterns must be quoted
  guard -w '*.go' -w 'lib/**/*.go' -- go run main.go

  # prefix output with a red 'my-app | '
  guard -p 'my-app | @red' -- python test.py

  # guard several commands with --- as the separator
  guard -w 'a/*' -- ls a --- -w 'b/*' -- ls b

Use @file as an argument to read the whole argv from 'file', one token per
line.",
)]
pub struct GuardArgs {
	/// Pattern to watch; repeatable. `!` negates, `!g` loads gitignore rules
	#[arg(short = 'w', long = "watch", value_name = "PATTERN")]
	pub watch: Vec<String>,

	/// Base directory to watch and to run the command in
	#[arg(short = 'd', long = "dir", default_value = ".", value_name = "DIR")]
	pub dir: PathBuf,

	/// Prefix for command output; `auto` derives one from the command
	#[arg(short = 'p', long = "prefix", default_value = "auto")]
	pub prefix: String,

	/// Clear the screen before each run
	#[arg(short = 'c', long = "clear-screen")]
	pub clear_screen: bool,

	/// Don't execute the command on startup, only on changes
	#[arg(short = 'n', long = "no-init-run")]
	pub no_init_run: bool,

	/// Poll interval; a bare number is milliseconds
	#[arg(long, default_value = "300ms", value_name = "DURATION")]
	pub poll: TimeSpan,

	/// Suppress restarts for this long after each event
	#[arg(long, default_value = "300ms", value_name = "DURATION")]
	pub debounce: TimeSpan,

	/// Allocate a pty and put the terminal into raw mode, for interactive
	/// subprocesses
	#[arg(long)]
	pub raw: bool,
}

/// A duration in humantime syntax; bare integers are milliseconds.
#[derive(Clone, Copy, Debug)]
pub struct TimeSpan(pub Duration);

impl FromStr for TimeSpan {
	type Err = humantime::DurationError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		s.parse::<u64>()
			.map_or_else(
				|_| humantime::parse_duration(s),
				|unitless| Ok(Duration::from_millis(unitless)),
			)
			.map(TimeSpan)
	}
}

/// Turn a raw argv (without the program name) into supervisor configs.
pub fn parse(argv: Vec<String>) -> Result<Vec<SupervisorConfig>, CriticalError> {
	let argv = expand_argfile(argv);
	partition(argv).into_iter().map(parse_partition).collect()
}

/// Replace the argv with the contents of the first `@file` argument, one
/// token per line. An unreadable file leaves the argv unchanged; `@` tokens
/// in the result are literal.
fn expand_argfile(argv: Vec<String>) -> Vec<String> {
	for arg in &argv {
		let Some(path) = arg.strip_prefix('@') else {
			continue;
		};
		if path.is_empty() {
			continue;
		}

		match std::fs::read_to_string(path) {
			Ok(contents) => return split_argfile(&contents),
			Err(err) => {
				debug!(%path, %err, "could not read argfile, using argv as-is");
				return argv;
			}
		}
	}
	argv
}

/// Split argfile contents on runs of line breaks, verbatim: no shell-word
/// splitting, and tokens at the file's boundaries survive even when empty
/// (a trailing newline yields a trailing empty token).
fn split_argfile(contents: &str) -> Vec<String> {
	let mut tokens = Vec::new();
	let mut current = String::new();
	let mut in_break = false;
	for ch in contents.chars() {
		if matches!(ch, '\n' | '\r') {
			if !in_break {
				tokens.push(std::mem::take(&mut current));
				in_break = true;
			}
		} else {
			in_break = false;
			current.push(ch);
		}
	}
	tokens.push(current);
	tokens
}

/// Split the argv on `---` tokens, stable and order-preserving.
pub fn partition(argv: Vec<String>) -> Vec<Vec<String>> {
	let mut partitions = Vec::new();
	let mut current = Vec::new();
	for arg in argv {
		if arg == PARTITION_SEPARATOR {
			partitions.push(std::mem::take(&mut current));
		} else {
			current.push(arg);
		}
	}
	partitions.push(current);
	partitions
}

fn parse_partition(part: Vec<String>) -> Result<SupervisorConfig, CriticalError> {
	let (flags, command) = split_command(part);

	// Flags parse first so --help and --version work without a command.
	let mut cli = Vec::with_capacity(flags.len() + 1);
	cli.push("guard".to_string());
	cli.extend(flags);
	let args = GuardArgs::try_parse_from(cli)?;

	let command = match command {
		Some(command) if !command.is_empty() => command,
		_ => return Err(CriticalError::Config("empty command".into())),
	};

	Ok(build_config(args, command))
}

fn split_command(part: Vec<String>) -> (Vec<String>, Option<Vec<String>>) {
	match part.iter().position(|arg| arg == COMMAND_SEPARATOR) {
		Some(at) => {
			let mut flags = part;
			let mut command = flags.split_off(at);
			command.remove(0);
			(flags, Some(command))
		}
		None => (part, None),
	}
}

fn build_config(args: GuardArgs, command: Vec<String>) -> SupervisorConfig {
	let prefix = gen_prefix(&args.prefix, &command);
	let mut spec = CommandSpec::new(command, args.dir);
	spec.raw = args.raw;
	spec.prefix = prefix;
	let mut config = SupervisorConfig::new(spec);
	config.patterns = filter_empty(args.watch);
	config.poll = args.poll.0;
	config.debounce = args.debounce.0;
	config.clear_screen = args.clear_screen;
	config.no_init_run = args.no_init_run;
	config
}

fn filter_empty(list: Vec<String>) -> Vec<String> {
	list.into_iter().filter(|item| !item.is_empty()).collect()
}

/// `auto` hashes the command into a stable color; anything else is taken
/// as-is, with an optional trailing `@color` annotation.
fn gen_prefix(spec: &str, argv: &[String]) -> Prefix {
	if spec == "auto" {
		Prefix::auto(argv)
	} else {
		Prefix::parse(spec)
	}
}

#[cfg(test)]
mod tests {
	use std::io::Write;

	use super::*;

	fn argv(args: &[&str]) -> Vec<String> {
		args.iter().map(|a| (*a).to_string()).collect()
	}

	#[test]
	fn partition_splits_on_triple_dash() {
		let parts = partition(argv(&["-w", "a/*", "--", "ls", "a", "---", "--", "ls", "b"]));
		assert_eq!(parts.len(), 2);
		assert_eq!(parts[0], argv(&["-w", "a/*", "--", "ls", "a"]));
		assert_eq!(parts[1], argv(&["--", "ls", "b"]));
	}

	#[test]
	fn partition_without_separator_is_single() {
		let parts = partition(argv(&["--", "echo", "hi"]));
		assert_eq!(parts.len(), 1);
	}

	#[test]
	fn parses_multiple_supervisors() {
		let configs = parse(argv(&[
			"-w", "a/*", "--", "ls", "a", "---", "-w", "b/*", "--", "ls", "b",
		]))
		.unwrap();

		assert_eq!(configs.len(), 2);
		assert_eq!(configs[0].patterns, vec!["a/*"]);
		assert_eq!(configs[0].command.argv, vec!["ls", "a"]);
		assert_eq!(configs[1].patterns, vec!["b/*"]);
		assert_eq!(configs[1].command.argv, vec!["ls", "b"]);
	}

	#[test]
	fn missing_command_is_a_config_error() {
		let err = parse(argv(&["-w", "*.go"])).unwrap_err();
		assert!(matches!(err, CriticalError::Config(_)));

		let err = parse(argv(&["--"])).unwrap_err();
		assert!(matches!(err, CriticalError::Config(_)));
	}

	#[test]
	fn empty_partition_is_a_config_error() {
		let err = parse(argv(&["--", "ls", "---"])).unwrap_err();
		assert!(matches!(err, CriticalError::Config(_)));
	}

	#[test]
	fn bad_flag_is_a_usage_error() {
		let err = parse(argv(&["--bogus", "--", "ls"])).unwrap_err();
		assert!(matches!(err, CriticalError::Usage(_)));
	}

	#[test]
	fn durations_parse_with_units_and_bare_millis() {
		assert_eq!("300ms".parse::<TimeSpan>().unwrap().0, Duration::from_millis(300));
		assert_eq!("2s".parse::<TimeSpan>().unwrap().0, Duration::from_secs(2));
		assert_eq!("450".parse::<TimeSpan>().unwrap().0, Duration::from_millis(450));
	}

	#[test]
	fn flags_round_trip_into_config() {
		let configs = parse(argv(&[
			"-w", "src/**", "-w", "", "-c", "-n", "--poll", "50ms", "--debounce", "1s", "--",
			"make", "test",
		]))
		.unwrap();

		let config = &configs[0];
		assert_eq!(config.patterns, vec!["src/**"]); // empty pattern dropped
		assert!(config.clear_screen);
		assert!(config.no_init_run);
		assert_eq!(config.poll, Duration::from_millis(50));
		assert_eq!(config.debounce, Duration::from_secs(1));
		assert_eq!(config.command.argv, vec!["make", "test"]);
		assert!(!config.command.raw);
	}

	#[test]
	fn auto_prefix_uses_command_head() {
		let configs = parse(argv(&["--", "python", "test.py"])).unwrap();
		assert_eq!(configs[0].command.prefix.text(), "python | ");
	}

	#[test]
	fn explicit_prefix_with_color_annotation() {
		let configs = parse(argv(&["-p", "my-app | @red", "--", "ls"])).unwrap();
		assert_eq!(configs[0].command.prefix.text(), "my-app | ");
	}

	#[test]
	fn argfile_replaces_argv() {
		let mut file = tempfile::NamedTempFile::new().unwrap();
		write!(file, "-w\n*.go\n--\necho\nchanged").unwrap();

		let spec = format!("@{}", file.path().display());
		let configs = parse(argv(&[&spec, "ignored", "args"])).unwrap();

		assert_eq!(configs[0].patterns, vec!["*.go"]);
		assert_eq!(configs[0].command.argv, vec!["echo", "changed"]);
	}

	#[test]
	fn argfile_lines_split_verbatim() {
		// Runs of line breaks are one separator, but a trailing newline
		// still yields a trailing (empty) token.
		assert_eq!(
			split_argfile("--\r\necho\n\nhi there\n"),
			argv(&["--", "echo", "hi there", ""]),
		);
		assert_eq!(split_argfile(""), argv(&[""]));
	}

	#[test]
	fn unreadable_argfile_leaves_argv_alone() {
		let original = argv(&["@/definitely/not/a/file", "--", "ls"]);
		assert_eq!(expand_argfile(original.clone()), original);
	}

	#[test]
	fn only_the_first_argfile_is_honored() {
		let mut file = tempfile::NamedTempFile::new().unwrap();
		write!(file, "--\necho\n@second").unwrap();

		let spec = format!("@{}", file.path().display());
		let configs = parse(argv(&[&spec])).unwrap();

		// The @second token from the file is a literal argument.
		assert_eq!(configs[0].command.argv, vec!["echo", "@second"]);
	}
}
