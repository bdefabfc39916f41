//! usocks client
//!
//! Listens on a local port and forwards every accepted connection through
//! one encrypted, multiplexed tunnel to the configured backend.

use anyhow::{Context, Result};
use clap::Parser;
use signal_hook::consts::{SIGINT, SIGTERM};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use usocks::client::{Outcome, Reactor};
use usocks::config::{find_config, generate_example_config, ClientConfig, Config, LoggingConfig};

/// Exit status when no configuration file exists
const EXIT_NO_CONFIG: u8 = 2;

/// usocks client - encrypted, multiplexed local tunnel
#[derive(Parser, Debug)]
#[command(name = "usocks-client")]
#[command(about = "Forward local TCP connections through an encrypted tunnel")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose logging (same as --log-level debug)
    #[arg(short, long)]
    verbose: bool,

    /// Log level (overrides the config file)
    #[arg(long)]
    log_level: Option<String>,

    /// Print an example configuration and exit
    #[arg(long)]
    example_config: bool,
}

fn init_logging(args: &Args, logging: &LoggingConfig) {
    let level = if args.verbose {
        "debug".to_string()
    } else {
        args.log_level.clone().unwrap_or_else(|| logging.level.clone())
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.format == "compact" {
        builder.compact().init();
    } else {
        builder.init();
    }
}

fn run(client: &ClientConfig) -> Result<Outcome> {
    let shutdown = Arc::new(AtomicBool::new(false));
    for signal in [SIGINT, SIGTERM] {
        signal_hook::flag::register(signal, Arc::clone(&shutdown))
            .context("Failed to register signal handler")?;
    }

    let mut reactor = Reactor::connect(client, shutdown).context("Failed to start tunnel")?;
    info!("usocks client v{}", usocks::VERSION);
    info!("Forwarding {} through the tunnel", reactor.local_addr());

    reactor.run().context("Tunnel failed")
}

fn main() -> ExitCode {
    let args = Args::parse();

    if args.example_config {
        return match toml::to_string_pretty(&generate_example_config()) {
            Ok(text) => {
                print!("{}", text);
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("Failed to render example config: {}", e);
                ExitCode::FAILURE
            }
        };
    }

    let home = std::env::var_os("HOME").map(PathBuf::from);
    let Some(path) = find_config(args.config.as_deref(), home.as_deref()) else {
        eprintln!("No configuration file found");
        return ExitCode::from(EXIT_NO_CONFIG);
    };

    let config = match Config::load(&path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}: {}", path.display(), e);
            return ExitCode::FAILURE;
        }
    };

    init_logging(&args, &config.logging);

    let Some(client) = config.client else {
        error!("No [client] section in {}", path.display());
        return ExitCode::FAILURE;
    };

    match run(&client) {
        Ok(outcome) => {
            info!("Client stopped: {:?}", outcome);
            ExitCode::from(outcome.exit_code())
        }
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
