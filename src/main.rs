use std::path::PathBuf;

use async_shutdown::ShutdownManager;
use clap::Parser;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use stagecast::{config::Config, control::ControlServer, gateway::GatewayClient, streamer::Streamer};

#[derive(Parser, Debug)]
#[clap(version)]
struct Args {
	/// Path to configuration file.
	config: PathBuf,

	/// Show more log messages.
	#[clap(long, short)]
	#[clap(action = clap::ArgAction::Count)]
	verbose: u8,

	/// Show less log messages.
	#[clap(long, short)]
	#[clap(action = clap::ArgAction::Count)]
	quiet: u8,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), ()> {
	let args = Args::parse();

	let log_level = match i16::from(args.verbose) - i16::from(args.quiet) {
		..= -2 => tracing::Level::ERROR,
		-1 => tracing::Level::WARN,
		0 => tracing::Level::INFO,
		1 => tracing::Level::DEBUG,
		2.. => tracing::Level::TRACE,
	};

	// RUST_LOG takes precedence over the command line flags.
	let filter = EnvFilter::try_from_default_env()
		.unwrap_or_else(|_| EnvFilter::new(format!("stagecast={log_level}")));
	tracing_subscriber::fmt()
		.with_env_filter(filter)
		.init();

	stagecast::tls::install_crypto_provider();

	let config = Config::read_from_file(args.config).map_err(|_| std::process::exit(1))?;

	tracing::debug!("Using configuration:\n{:#?}", Redacted(&config));

	// Spawn a task to wait for CTRL+C and trigger a shutdown.
	let shutdown = ShutdownManager::new();
	tokio::spawn({
		let shutdown = shutdown.clone();
		async move {
			if let Err(e) = tokio::signal::ctrl_c().await {
				tracing::error!("Failed to wait for CTRL+C: {e}");
				std::process::exit(1);
			} else {
				tracing::info!("Received interrupt signal. Shutting down...");
				shutdown.trigger_shutdown(1).ok();
			}
		}
	});

	// Create the main application.
	let stagecast = Stagecast::new(config, shutdown.clone());

	// Wait until something causes a shutdown trigger.
	shutdown.wait_shutdown_triggered().await;

	// Stop any running transcoder before tearing everything down.
	stagecast.streamer.stop_stream().await;
	drop(stagecast);

	// Wait until everything was shutdown.
	let exit_code = shutdown.wait_shutdown_complete().await;
	tracing::trace!("Successfully waited for shutdown to complete.");
	std::process::exit(exit_code);
}

pub struct Stagecast {
	streamer: Streamer,
	_control_server: ControlServer,
}

impl Stagecast {
	pub fn new(config: Config, shutdown: ShutdownManager<i32>) -> Self {
		let (gateway_tx, gateway_rx) = mpsc::channel(10);
		let (event_tx, event_rx) = mpsc::channel(100);

		// Keep the gateway connected for as long as the application runs.
		let gateway = GatewayClient::new(config.gateway.clone(), config.token.clone(), event_tx);
		tokio::spawn({
			let shutdown = shutdown.clone();
			async move {
				let _ = shutdown.wrap_cancel(gateway.run(gateway_rx)).await;
				tracing::debug!("Gateway client shutting down.");
			}
		});

		let streamer = Streamer::new(config.clone(), gateway_tx, event_rx);
		let control_server = ControlServer::new(config, streamer.clone(), shutdown);

		Self {
			streamer,
			_control_server: control_server,
		}
	}
}

/// Debug view of the configuration that doesn't print the token.
struct Redacted<'a>(&'a Config);

impl std::fmt::Debug for Redacted<'_> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let mut config = self.0.clone();
		if !config.token.is_empty() {
			config.token = "<redacted>".to_string();
		}
		std::fmt::Debug::fmt(&config, f)
	}
}
