//! Running several supervisors in parallel from one invocation.

use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::{
	error::CriticalError,
	supervisor::{Supervisor, SupervisorConfig, SupervisorHandle},
};

/// Start one supervisor per config and block until they have all stopped.
///
/// A fatal signal (SIGINT/SIGTERM) broadcasts Stop to every supervisor and
/// waits for drainage; that is a clean exit. An error from one supervisor
/// also stops the others, and the first error is returned.
pub async fn run_all(configs: Vec<SupervisorConfig>) -> Result<(), CriticalError> {
	let mut set = JoinSet::new();
	let mut handles = Vec::with_capacity(configs.len());
	for config in configs {
		let supervisor = Supervisor::new(config);
		handles.push(supervisor.handle());
		set.spawn(supervisor.run());
	}
	debug!(supervisors=%handles.len(), "coordinator started");

	let signal_task = tokio::spawn(broadcast_stop_on_signal(handles.clone()));

	let mut first_err = None;
	while let Some(joined) = set.join_next().await {
		let failed = match joined {
			Ok(Ok(())) => None,
			Ok(Err(err)) => Some(err),
			Err(err) => Some(CriticalError::TaskJoin(err)),
		};
		if let Some(err) = failed {
			broadcast(&handles);
			if first_err.is_none() {
				first_err = Some(err);
			}
		}
	}

	signal_task.abort();
	debug!("coordinator finished");
	match first_err {
		Some(err) => Err(err),
		None => Ok(()),
	}
}

fn broadcast(handles: &[SupervisorHandle]) {
	for handle in handles {
		handle.stop();
	}
}

async fn broadcast_stop_on_signal(handles: Vec<SupervisorHandle>) {
	wait_for_fatal_signal().await;
	info!("fatal signal, stopping all supervisors");
	broadcast(&handles);
}

#[cfg(unix)]
async fn wait_for_fatal_signal() {
	use tokio::signal::unix::{signal, SignalKind};

	match (
		signal(SignalKind::interrupt()),
		signal(SignalKind::terminate()),
	) {
		(Ok(mut int), Ok(mut term)) => {
			tokio::select! {
				_ = int.recv() => {}
				_ = term.recv() => {}
			}
		}
		_ => {
			let _ = tokio::signal::ctrl_c().await;
		}
	}
}

#[cfg(not(unix))]
async fn wait_for_fatal_signal() {
	let _ = tokio::signal::ctrl_c().await;
}
