//! Prefixed, colorized output.
//!
//! Every supervisor writes through a [`Prefix`]: its own log lines and the
//! child's interleaved stdout/stderr all carry it, so multiple supervisors
//! sharing one terminal stay readable. The [`PrefixWriter`] re-emits the
//! prefix after every newline and buffers one line per write so interleaved
//! output stays line-atomic.

use std::io::{self, Write};

use crossterm::style::{Color, Stylize};

/// An output prefix, optionally colorized.
#[derive(Clone, Debug)]
pub struct Prefix {
	text: String,
	painted: String,
}

impl Prefix {
	pub fn new(text: impl Into<String>, color: Option<Color>) -> Self {
		let text = text.into();
		let painted = match color {
			Some(color) => paint(&text, color),
			None => text.clone(),
		};
		Self { text, painted }
	}

	/// The prefix used when none is configured.
	pub fn guard_default() -> Self {
		Self::new("[guard] ", Some(Color::Cyan))
	}

	/// Parse a user-supplied prefix.
	///
	/// A trailing `@<color>` names the color for the text before it, e.g.
	/// `my-app | @red`. Unknown color names leave the whole string literal.
	pub fn parse(spec: &str) -> Self {
		if let Some((text, name)) = spec.rsplit_once('@') {
			if let Some(color) = color_by_name(name) {
				return Self::new(text, Some(color));
			}
		}
		Self::new(spec, None)
	}

	/// The `auto` prefix: `argv[0] | `, in an ANSI-256 color picked by
	/// hashing the joined argv, so each command gets a stable color.
	pub fn auto(argv: &[String]) -> Self {
		let head = argv.first().map(String::as_str).unwrap_or_default();
		let hash = fnv32a(argv.concat().as_bytes());
		Self::new(
			format!("{head} | "),
			Some(Color::AnsiValue((hash % 256) as u8)),
		)
	}

	pub fn text(&self) -> &str {
		&self.text
	}

	pub fn painted(&self) -> &str {
		&self.painted
	}

	/// Write one prefixed line to stdout in a single write.
	pub fn line(&self, msg: &str) {
		let mut buf = Vec::with_capacity(self.painted.len() + msg.len() + 1);
		buf.extend_from_slice(self.painted.as_bytes());
		buf.extend_from_slice(msg.as_bytes());
		buf.push(b'\n');
		let mut out = io::stdout().lock();
		let _ = out.write_all(&buf);
		let _ = out.flush();
	}
}

/// Resolve a color name: the eight ANSI base colors by name, or a decimal
/// ANSI-256 value.
pub fn color_by_name(name: &str) -> Option<Color> {
	match name {
		"black" => Some(Color::Black),
		"red" => Some(Color::Red),
		"green" => Some(Color::Green),
		"yellow" => Some(Color::Yellow),
		"blue" => Some(Color::Blue),
		"magenta" => Some(Color::Magenta),
		"cyan" => Some(Color::Cyan),
		"white" => Some(Color::White),
		_ => name.parse::<u8>().ok().map(Color::AnsiValue),
	}
}

pub fn paint(text: &str, color: Color) -> String {
	format!("{}", text.with(color))
}

pub fn green(text: &str) -> String {
	paint(text, Color::Green)
}

pub fn red(text: &str) -> String {
	paint(text, Color::Red)
}

/// 32-bit FNV-1a.
fn fnv32a(bytes: &[u8]) -> u32 {
	let mut hash: u32 = 0x811c_9dc5;
	for &b in bytes {
		hash ^= u32::from(b);
		hash = hash.wrapping_mul(0x0100_0193);
	}
	hash
}

/// A line-oriented filter that prefixes everything written through it.
///
/// Output is passed through byte by byte; the prefix is re-emitted whenever
/// the previous emitted byte was a newline. Each completed line goes to the
/// underlying writer as one write. Partial trailing output is flushed, with
/// the prefix, by [`finish`](Self::finish).
pub struct PrefixWriter<W> {
	prefix: Vec<u8>,
	out: W,
	line: Vec<u8>,
	at_line_start: bool,
}

impl<W: Write> PrefixWriter<W> {
	pub fn new(prefix: &Prefix, out: W) -> Self {
		Self {
			prefix: prefix.painted().as_bytes().to_vec(),
			out,
			line: Vec::with_capacity(256),
			at_line_start: true,
		}
	}

	pub fn write_chunk(&mut self, buf: &[u8]) -> io::Result<()> {
		for &byte in buf {
			if self.at_line_start {
				self.line.extend_from_slice(&self.prefix);
				self.at_line_start = false;
			}
			self.line.push(byte);
			if byte == b'\n' {
				self.out.write_all(&self.line)?;
				self.line.clear();
				self.at_line_start = true;
			}
		}
		Ok(())
	}

	/// Flush any partial trailing line.
	pub fn finish(&mut self) -> io::Result<()> {
		if !self.line.is_empty() {
			self.out.write_all(&self.line)?;
			self.line.clear();
		}
		self.out.flush()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn plain(text: &str) -> Prefix {
		Prefix::new(text, None)
	}

	#[test]
	fn prefixes_every_line() {
		let mut out = Vec::new();
		let mut w = PrefixWriter::new(&plain("p| "), &mut out);
		w.write_chunk(b"one\ntwo\n").unwrap();
		w.finish().unwrap();

		assert_eq!(String::from_utf8(out).unwrap(), "p| one\np| two\n");
	}

	#[test]
	fn partial_trailing_output_is_flushed_with_prefix() {
		let mut out = Vec::new();
		let mut w = PrefixWriter::new(&plain("p| "), &mut out);
		w.write_chunk(b"no newline").unwrap();
		w.finish().unwrap();

		assert_eq!(String::from_utf8(out).unwrap(), "p| no newline");
	}

	#[test]
	fn prefix_survives_chunk_boundaries() {
		let mut out = Vec::new();
		let mut w = PrefixWriter::new(&plain("> "), &mut out);
		w.write_chunk(b"split ").unwrap();
		w.write_chunk(b"line\nnext").unwrap();
		w.finish().unwrap();

		assert_eq!(String::from_utf8(out).unwrap(), "> split line\n> next");
	}

	#[test]
	fn empty_chunks_emit_nothing() {
		let mut out = Vec::new();
		let mut w = PrefixWriter::new(&plain("> "), &mut out);
		w.write_chunk(b"").unwrap();
		w.finish().unwrap();

		assert!(out.is_empty());
	}

	#[test]
	fn default_prefix_is_guard() {
		assert_eq!(Prefix::guard_default().text(), "[guard] ");
	}

	#[test]
	fn parse_color_annotation() {
		let p = Prefix::parse("my-app | @red");
		assert_eq!(p.text(), "my-app | ");
		assert_ne!(p.painted(), p.text());
	}

	#[test]
	fn parse_unknown_color_stays_literal() {
		let p = Prefix::parse("user@host ");
		assert_eq!(p.text(), "user@host ");
		assert_eq!(p.painted(), "user@host ");
	}

	#[test]
	fn parse_numeric_color() {
		let p = Prefix::parse("svc | @123");
		assert_eq!(p.text(), "svc | ");
		assert_ne!(p.painted(), p.text());
	}

	#[test]
	fn auto_prefix_uses_argv_head() {
		let argv = vec!["node".to_string(), "server.js".to_string()];
		let p = Prefix::auto(&argv);
		assert_eq!(p.text(), "node | ");
	}

	#[test]
	fn auto_prefix_color_is_stable() {
		let argv = vec!["ls".to_string(), "-la".to_string()];
		assert_eq!(Prefix::auto(&argv).painted(), Prefix::auto(&argv).painted());
	}

	#[test]
	fn fnv_reference_values() {
		assert_eq!(fnv32a(b""), 0x811c_9dc5);
		assert_eq!(fnv32a(b"a"), 0xe40c_292c);
	}
}
