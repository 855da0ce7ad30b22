//! Ordered include/exclude pattern matching over paths.
//!
//! A pattern list is evaluated left to right and the last match wins. Three
//! kinds of pattern are supported: doublestar globs (`**`, `*.go`,
//! `lib/**/*.go`), negations (`!tmp/**`), and the special token `!g` which
//! loads every `.gitignore` under the root and applies its rules as
//! negations scoped to the directory holding the ignore file. Submodule
//! roots and `.git` directories are fully negated in `!g` mode.
//!
//! All pattern compilation and ignore-file reading happens at construction;
//! evaluation is a pure function of `(path, is_dir)`.

use std::path::{Path, PathBuf};

use globset::{GlobBuilder, GlobMatcher};
use ignore::{gitignore::Gitignore, Match};
use tracing::{trace, warn};
use walkdir::WalkDir;

use crate::error::{CriticalError, RuntimeError};

/// The pattern token that expands to all reachable gitignore rules.
pub const WALK_GIT_IGNORE: &str = "!g";

/// The pattern set used when none is supplied: everything, minus whatever
/// the project's gitignore files exclude.
pub fn default_patterns() -> Vec<String> {
	vec!["**".into(), WALK_GIT_IGNORE.into()]
}

/// The verdict for one path.
///
/// `negated` records that the deciding pattern was an exclusion; the
/// watch-set builder uses it to stop descending into directories that are
/// excluded by name.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct MatchOutcome {
	pub matched: bool,
	pub negated: bool,
}

#[derive(Debug)]
enum Compiled {
	Glob { matcher: GlobMatcher, negated: bool },
	GitIgnore,
}

#[derive(Debug)]
struct IgnoreTree {
	root: PathBuf,
	rules: Gitignore,
}

/// A compiled, immutable pattern list rooted at a directory.
#[derive(Debug)]
pub struct Matcher {
	root: PathBuf,
	patterns: Vec<Compiled>,
	trees: Vec<IgnoreTree>,
	ignored_roots: Vec<PathBuf>,
	ignore_errors: Vec<RuntimeError>,
}

impl Matcher {
	/// Compile `patterns` relative to `root`.
	///
	/// Bad globs are fatal. Unreadable ignore files are not: they behave as
	/// empty files and are reported via [`ignore_errors`](Self::ignore_errors).
	pub fn new(root: impl Into<PathBuf>, patterns: &[String]) -> Result<Self, CriticalError> {
		let root = root.into();

		let mut compiled = Vec::with_capacity(patterns.len());
		let mut want_gitignore = false;
		for pattern in patterns {
			if pattern == WALK_GIT_IGNORE {
				want_gitignore = true;
				compiled.push(Compiled::GitIgnore);
				continue;
			}

			let (source, negated) = match pattern.strip_prefix('!') {
				Some(rest) => (rest, true),
				None => (pattern.as_str(), false),
			};

			let matcher = GlobBuilder::new(source)
				.literal_separator(true)
				.build()
				.map_err(|err| CriticalError::Pattern {
					pattern: pattern.clone(),
					err,
				})?
				.compile_matcher();

			compiled.push(Compiled::Glob { matcher, negated });
		}

		let (trees, ignored_roots, ignore_errors) = if want_gitignore {
			discover_ignores(&root)
		} else {
			(Vec::new(), Vec::new(), Vec::new())
		};

		Ok(Self {
			root,
			patterns: compiled,
			trees,
			ignored_roots,
			ignore_errors,
		})
	}

	/// Non-fatal problems hit while loading ignore files.
	pub fn ignore_errors(&self) -> &[RuntimeError] {
		&self.ignore_errors
	}

	/// Evaluate the pattern list for a path. Pure: depends only on the
	/// compiled patterns and the arguments.
	pub fn match_path(&self, path: &Path, is_dir: bool) -> MatchOutcome {
		let Ok(rel) = path.strip_prefix(&self.root) else {
			return MatchOutcome::default();
		};

		let mut decision = None;
		for pattern in &self.patterns {
			match pattern {
				Compiled::Glob { matcher, negated } => {
					if matcher.is_match(rel) {
						decision = Some(!*negated);
					}
				}
				Compiled::GitIgnore => {
					if rel.components().any(|c| c.as_os_str() == ".git")
						|| self.ignored_roots.iter().any(|r| path.starts_with(r))
					{
						decision = Some(false);
						continue;
					}

					for tree in &self.trees {
						if path == tree.root || !path.starts_with(&tree.root) {
							continue;
						}
						match tree.rules.matched_path_or_any_parents(path, is_dir) {
							Match::Ignore(_) => decision = Some(false),
							Match::Whitelist(_) => decision = Some(true),
							Match::None => {}
						}
					}
				}
			}
		}

		let outcome = MatchOutcome {
			matched: decision == Some(true),
			negated: decision == Some(false),
		};
		trace!(?path, is_dir, ?outcome, "matched path");
		outcome
	}
}

/// Find every `.gitignore` under `root`, plus the roots that are whole-sale
/// ignored (`.git` itself, nested repositories, submodules).
fn discover_ignores(root: &Path) -> (Vec<IgnoreTree>, Vec<PathBuf>, Vec<RuntimeError>) {
	let mut trees = Vec::new();
	let mut ignored_roots = Vec::new();
	let mut errors = Vec::new();

	let mut walker = WalkDir::new(root).follow_links(false).into_iter();
	while let Some(entry) = walker.next() {
		let entry = match entry {
			Ok(entry) => entry,
			Err(err) => {
				warn!(%err, "skipping unreadable entry during ignore discovery");
				continue;
			}
		};

		if entry.file_type().is_dir() {
			if entry.file_name() == ".git" {
				walker.skip_current_dir();
				continue;
			}

			// A .git entry below the root marks a submodule or nested
			// repository; its whole subtree is treated as ignored.
			if entry.depth() > 0 && entry.path().join(".git").exists() {
				ignored_roots.push(entry.path().to_owned());
				walker.skip_current_dir();
				continue;
			}
		} else if entry.file_name() == ".gitignore" {
			let (rules, err) = Gitignore::new(entry.path());
			if let Some(err) = err {
				errors.push(RuntimeError::IgnoreRead {
					path: entry.path().to_owned(),
					err,
				});
			}
			let tree_root = entry
				.path()
				.parent()
				.unwrap_or(root)
				.to_owned();
			trees.push(IgnoreTree {
				root: tree_root,
				rules,
			});
		}
	}

	// Shallow trees first, so the nearest ancestor's rules win.
	trees.sort_by_key(|tree| tree.root.components().count());

	(trees, ignored_roots, errors)
}

#[cfg(test)]
mod tests {
	use std::fs;

	use tempfile::TempDir;

	use super::*;

	fn matcher(root: &Path, patterns: &[&str]) -> Matcher {
		let patterns: Vec<String> = patterns.iter().map(|p| (*p).to_string()).collect();
		Matcher::new(root, &patterns).expect("test patterns invalid")
	}

	#[test]
	fn matches_everything_by_default_glob() {
		let dir = TempDir::new().unwrap();
		let m = matcher(dir.path(), &["**"]);

		assert!(m.match_path(&dir.path().join("a.txt"), false).matched);
		assert!(m.match_path(&dir.path().join("deep/inside/b.rs"), false).matched);
		assert!(m.match_path(&dir.path().join("deep"), true).matched);
	}

	#[test]
	fn star_does_not_cross_separators() {
		let dir = TempDir::new().unwrap();
		let m = matcher(dir.path(), &["*.go"]);

		assert!(m.match_path(&dir.path().join("main.go"), false).matched);
		assert!(!m.match_path(&dir.path().join("lib/util.go"), false).matched);
	}

	#[test]
	fn doublestar_matches_zero_segments() {
		let dir = TempDir::new().unwrap();
		let m = matcher(dir.path(), &["lib/**/*.go"]);

		assert!(m.match_path(&dir.path().join("lib/a.go"), false).matched);
		assert!(m.match_path(&dir.path().join("lib/x/y/b.go"), false).matched);
		assert!(!m.match_path(&dir.path().join("src/a.go"), false).matched);
	}

	#[test]
	fn last_match_wins() {
		let dir = TempDir::new().unwrap();
		let m = matcher(dir.path(), &["**", "!tmp/**"]);

		assert!(m.match_path(&dir.path().join("src/a.rs"), false).matched);

		let excluded = m.match_path(&dir.path().join("tmp/scratch"), false);
		assert!(!excluded.matched);
		assert!(excluded.negated);
	}

	#[test]
	fn later_pattern_reincludes() {
		let dir = TempDir::new().unwrap();
		let m = matcher(dir.path(), &["**", "!lib/**", "lib/keep/**"]);

		assert!(!m.match_path(&dir.path().join("lib/drop/a"), false).matched);
		assert!(m.match_path(&dir.path().join("lib/keep/a"), false).matched);
	}

	#[test]
	fn outside_root_never_matches() {
		let dir = TempDir::new().unwrap();
		let m = matcher(dir.path(), &["**"]);

		assert_eq!(
			m.match_path(Path::new("/definitely/elsewhere"), false),
			MatchOutcome::default()
		);
	}

	#[test]
	fn bad_pattern_is_fatal() {
		let dir = TempDir::new().unwrap();
		let err = Matcher::new(dir.path(), &["a[".to_string()]).unwrap_err();
		assert!(matches!(err, CriticalError::Pattern { .. }));
	}

	#[test]
	fn gitignore_rules_negate() {
		let dir = TempDir::new().unwrap();
		fs::write(dir.path().join(".gitignore"), "target\n*.log\n").unwrap();
		fs::create_dir(dir.path().join("target")).unwrap();

		let m = matcher(dir.path(), &["**", WALK_GIT_IGNORE]);

		let target = m.match_path(&dir.path().join("target"), true);
		assert!(!target.matched);
		assert!(target.negated);

		assert!(!m.match_path(&dir.path().join("target/debug/out"), false).matched);
		assert!(!m.match_path(&dir.path().join("trace.log"), false).matched);
		assert!(m.match_path(&dir.path().join("src/main.rs"), false).matched);
	}

	#[test]
	fn nested_gitignore_scopes_to_its_directory() {
		let dir = TempDir::new().unwrap();
		fs::create_dir_all(dir.path().join("sub")).unwrap();
		fs::write(dir.path().join("sub/.gitignore"), "local\n").unwrap();

		let m = matcher(dir.path(), &["**", WALK_GIT_IGNORE]);

		assert!(!m.match_path(&dir.path().join("sub/local"), false).matched);
		// The rule does not leak above the directory holding the file.
		assert!(m.match_path(&dir.path().join("local"), false).matched);
	}

	#[test]
	fn gitignore_whitelist_reincludes() {
		let dir = TempDir::new().unwrap();
		fs::write(dir.path().join(".gitignore"), "*.log\n!keep.log\n").unwrap();

		let m = matcher(dir.path(), &["**", WALK_GIT_IGNORE]);

		assert!(!m.match_path(&dir.path().join("trace.log"), false).matched);
		assert!(m.match_path(&dir.path().join("keep.log"), false).matched);
	}

	#[test]
	fn submodules_are_fully_ignored() {
		let dir = TempDir::new().unwrap();
		fs::create_dir_all(dir.path().join("vendor/dep")).unwrap();
		fs::write(dir.path().join("vendor/dep/.git"), "gitdir: ../../.git/modules/dep\n").unwrap();

		let m = matcher(dir.path(), &["**", WALK_GIT_IGNORE]);

		let inside = m.match_path(&dir.path().join("vendor/dep/src/lib.rs"), false);
		assert!(!inside.matched);
		assert!(inside.negated);
		assert!(m.match_path(&dir.path().join("vendor/other.rs"), false).matched);
	}

	#[test]
	fn git_dir_is_ignored_in_gitignore_mode() {
		let dir = TempDir::new().unwrap();
		fs::create_dir_all(dir.path().join(".git")).unwrap();

		let m = matcher(dir.path(), &["**", WALK_GIT_IGNORE]);
		assert!(!m.match_path(&dir.path().join(".git/HEAD"), false).matched);

		// Without !g there is no VCS special-casing.
		let plain = matcher(dir.path(), &["**"]);
		assert!(plain.match_path(&dir.path().join(".git/HEAD"), false).matched);
	}

	#[test]
	fn pattern_after_gitignore_overrides_it() {
		let dir = TempDir::new().unwrap();
		fs::write(dir.path().join(".gitignore"), "dist\n").unwrap();

		let m = matcher(dir.path(), &["**", WALK_GIT_IGNORE, "dist/**"]);
		assert!(m.match_path(&dir.path().join("dist/bundle.js"), false).matched);
	}

	#[test]
	fn determinism() {
		let dir = TempDir::new().unwrap();
		fs::write(dir.path().join(".gitignore"), "target\n").unwrap();
		let m = matcher(dir.path(), &["**", WALK_GIT_IGNORE]);

		let path = dir.path().join("target/out");
		let first = m.match_path(&path, false);
		for _ in 0..10 {
			assert_eq!(m.match_path(&path, false), first);
		}
	}
}
