//! The polling change detector.
//!
//! Every interval the poller re-stats each entry of its watch set and turns
//! the differences into [`ChangeEvent`]s: create, write, remove, rename,
//! chmod. It also re-reads watched directories so that newly created files
//! start being observed without any OS notification support. Consumers only
//! see the poller through its channels: events, errors, and the event
//! channel closing on stop.

use std::{fs, io, path::PathBuf, sync::Arc, time::Duration};

use tokio::{
	select,
	sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
	task::JoinHandle,
	time::MissedTickBehavior,
};
use tracing::{debug, trace};

use crate::{
	error::RuntimeError,
	event::{ChangeEvent, Op},
	matcher::Matcher,
	watchset::{WatchEntry, WatchSet},
};

enum Control {
	Extend(WatchSet),
	Stop,
}

/// Handle to a running poller task.
///
/// Dropping the handle does not stop the task; call [`stop`](Self::stop).
/// The event receiver returned by [`spawn`](Self::spawn) yields `None` once
/// the poller has stopped.
pub struct Poller {
	control: UnboundedSender<Control>,
	handle: JoinHandle<()>,
}

impl Poller {
	/// Start polling `set` every `interval`.
	///
	/// The matcher gates which newly discovered entries are added to the
	/// set between cycles.
	pub fn spawn(
		set: WatchSet,
		matcher: Arc<Matcher>,
		interval: Duration,
	) -> (
		Self,
		UnboundedReceiver<ChangeEvent>,
		UnboundedReceiver<RuntimeError>,
	) {
		let (event_tx, event_rx) = mpsc::unbounded_channel();
		let (error_tx, error_rx) = mpsc::unbounded_channel();
		let (control_tx, control_rx) = mpsc::unbounded_channel();

		let handle = tokio::spawn(run(set, matcher, interval, control_rx, event_tx, error_tx));

		(
			Self {
				control: control_tx,
				handle,
			},
			event_rx,
			error_rx,
		)
	}

	/// Merge more entries into the watch set without emitting events.
	pub fn extend(&self, set: WatchSet) {
		let _ = self.control.send(Control::Extend(set));
	}

	/// Ask the poller to stop. The event channel closes once it has.
	pub fn stop(&self) {
		let _ = self.control.send(Control::Stop);
	}

	/// Wait for the poller task to finish.
	pub async fn join(self) {
		let _ = self.handle.await;
	}
}

async fn run(
	mut set: WatchSet,
	matcher: Arc<Matcher>,
	interval: Duration,
	mut control: UnboundedReceiver<Control>,
	events: UnboundedSender<ChangeEvent>,
	errors: UnboundedSender<RuntimeError>,
) {
	debug!(entries=%set.len(), ?interval, "poller starting");

	let mut ticker = tokio::time::interval(interval);
	ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

	loop {
		select! {
			_ = ticker.tick() => {
				if cycle(&mut set, &matcher, &events, &errors).is_err() {
					debug!("event receiver gone, poller stopping");
					break;
				}
			}
			ctl = control.recv() => match ctl {
				Some(Control::Extend(more)) => {
					trace!(added=%more.len(), "extending watch set");
					set.extend(more);
				}
				Some(Control::Stop) | None => break,
			}
		}
	}

	debug!("poller stopped");
}

struct SendGone;

/// One poll cycle: stat everything, re-read directories, emit the
/// differences in the fixed order removes, renames, writes, creates,
/// chmods.
fn cycle(
	set: &mut WatchSet,
	matcher: &Matcher,
	events: &UnboundedSender<ChangeEvent>,
	errors: &UnboundedSender<RuntimeError>,
) -> Result<(), SendGone> {
	let snapshot: Vec<PathBuf> = set.keys().cloned().collect();

	let mut removes: Vec<(PathBuf, WatchEntry)> = Vec::new();
	let mut writes: Vec<(PathBuf, bool)> = Vec::new();
	let mut chmods: Vec<(PathBuf, bool)> = Vec::new();

	for path in &snapshot {
		match fs::metadata(path) {
			Err(err) if err.kind() == io::ErrorKind::NotFound => {
				if let Some(old) = set.get(path) {
					removes.push((path.clone(), old.clone()));
				}
			}
			Err(err) => {
				let _ = errors.send(RuntimeError::Poll {
					path: path.clone(),
					err,
				});
			}
			Ok(md) => {
				let new = WatchEntry::from_metadata(&md);
				if let Some(old) = set.get_mut(path) {
					if new.mtime != old.mtime || new.size != old.size {
						writes.push((path.clone(), new.is_dir));
						*old = new;
					} else if new.mode != old.mode {
						chmods.push((path.clone(), new.is_dir));
						*old = new;
					}
				}
			}
		}
	}

	for (path, _) in &removes {
		set.remove(path);
	}
	// A removed directory takes its whole subtree out of the set, including
	// entries its own stat pass already missed.
	for (path, old) in &removes {
		if old.is_dir {
			set.retain(|key, _| !key.starts_with(path));
		}
	}

	let mut creates: Vec<(PathBuf, WatchEntry)> = Vec::new();
	let dirs: Vec<PathBuf> = set
		.iter()
		.filter(|(_, entry)| entry.is_dir)
		.map(|(path, _)| path.clone())
		.collect();
	for dir in dirs {
		let read = match fs::read_dir(&dir) {
			Ok(read) => read,
			Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
			Err(err) => {
				let _ = errors.send(RuntimeError::Poll { path: dir, err });
				continue;
			}
		};

		for dent in read {
			let dent = match dent {
				Ok(dent) => dent,
				Err(err) => {
					let _ = errors.send(RuntimeError::Poll {
						path: dir.clone(),
						err,
					});
					continue;
				}
			};

			let path = dent.path();
			if set.contains_key(&path) {
				continue;
			}

			let md = match dent.metadata() {
				Ok(md) => md,
				Err(err) => {
					let _ = errors.send(RuntimeError::Poll { path, err });
					continue;
				}
			};

			let is_dir = md.is_dir();
			let outcome = matcher.match_path(&path, is_dir);
			// Matched entries are watched; so is any directory that is not
			// negated outright, since it may come to contain matches.
			if outcome.matched || (is_dir && !outcome.negated) {
				let entry = WatchEntry::from_metadata(&md);
				creates.push((path.clone(), entry.clone()));
				set.insert(path, entry);
			}
		}
	}
	creates.sort_by(|a, b| a.0.cmp(&b.0));

	// A create whose inode matches a remove from this same cycle is the two
	// halves of a rename.
	let mut renames: Vec<(PathBuf, PathBuf, bool)> = Vec::new();
	let mut renamed_from: Vec<usize> = Vec::new();
	let mut renamed_to: Vec<usize> = Vec::new();
	for (ri, (old_path, old)) in removes.iter().enumerate() {
		if old.ino == 0 {
			continue;
		}
		if let Some(ci) = creates
			.iter()
			.enumerate()
			.find(|(ci, (_, new))| new.ino == old.ino && !renamed_to.contains(ci))
			.map(|(ci, _)| ci)
		{
			renames.push((creates[ci].0.clone(), old_path.clone(), old.is_dir));
			renamed_from.push(ri);
			renamed_to.push(ci);
		}
	}

	let send = |event: ChangeEvent| {
		trace!(%event, "emitting change event");
		events.send(event).map_err(|_| SendGone)
	};

	for (i, (path, old)) in removes.iter().enumerate() {
		if renamed_from.contains(&i) {
			continue;
		}
		send(ChangeEvent {
			op: Op::Remove,
			path: path.clone(),
			old_path: None,
			is_dir: old.is_dir,
		})?;
	}
	for (path, old_path, is_dir) in renames {
		send(ChangeEvent {
			op: Op::Rename,
			path,
			old_path: Some(old_path),
			is_dir,
		})?;
	}
	for (path, is_dir) in writes {
		send(ChangeEvent {
			op: Op::Write,
			path,
			old_path: None,
			is_dir,
		})?;
	}
	for (i, (path, entry)) in creates.iter().enumerate() {
		if renamed_to.contains(&i) {
			continue;
		}
		send(ChangeEvent {
			op: Op::Create,
			path: path.clone(),
			old_path: None,
			is_dir: entry.is_dir,
		})?;
	}
	for (path, is_dir) in chmods {
		send(ChangeEvent {
			op: Op::Chmod,
			path,
			old_path: None,
			is_dir,
		})?;
	}

	Ok(())
}
