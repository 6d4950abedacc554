use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use turnpike::{app, config, telemetry};

#[derive(Parser, Debug)]
#[command(about = "TLS-terminating HTTP reverse proxy and load balancer", long_about = None)]
struct Args {
	/// Use config from file
	#[arg(short, long, value_name = "file")]
	file: Option<PathBuf>,

	/// Use config from the given string
	#[arg(short, long, value_name = "config")]
	config: Option<String>,

	/// Parse and compile the configuration, then exit
	#[arg(long)]
	validate_only: bool,
}

fn main() -> anyhow::Result<()> {
	telemetry::setup_logging();
	let args = Args::parse();

	let raw = match (&args.file, &args.config) {
		(Some(_), Some(_)) => anyhow::bail!("only one of --file or --config"),
		(Some(path), None) => config::load(path)?,
		(None, Some(contents)) => config::parse(contents)?,
		(None, None) => anyhow::bail!("a configuration is required (--file or --config)"),
	};
	let (runtime, matrices) = config::build(raw)?;
	if args.validate_only {
		config::validate(&runtime)?;
		println!("configuration is valid");
		return Ok(());
	}

	info!(version = env!("CARGO_PKG_VERSION"), "starting");
	let server = app::Server::bind(runtime, matrices, None)?;
	server.run()
}
