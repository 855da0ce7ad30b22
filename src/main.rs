use std::{env, process::ExitCode};

use guard::error::CriticalError;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
	init_logging();

	let runtime = match tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()
	{
		Ok(runtime) => runtime,
		Err(err) => {
			eprintln!("failed to start runtime: {err}");
			return ExitCode::from(2);
		}
	};

	match runtime.block_on(guard::run(env::args().skip(1).collect())) {
		Ok(()) => ExitCode::SUCCESS,
		Err(CriticalError::Usage(err))
			if matches!(
				err.kind(),
				clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion
			) =>
		{
			// --help and --version land here; print them and exit clean.
			let _ = err.print();
			ExitCode::SUCCESS
		}
		Err(err) => {
			let code = err.exit_code();
			eprintln!("{:?}", miette::Report::new(err));
			ExitCode::from(code)
		}
	}
}

/// Diagnostics are opt-in via RUST_LOG; the supervisors' own output is
/// printed regardless.
fn init_logging() {
	if env::var("RUST_LOG").is_ok() {
		if let Err(err) = tracing_subscriber::fmt()
			.with_env_filter(EnvFilter::from_default_env())
			.try_init()
		{
			eprintln!("failed to initialise logging: {err}");
		}
	}
}
