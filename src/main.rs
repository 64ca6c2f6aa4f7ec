//! finguard main entry point
//!
//! Parses the CLI, initializes structured logging, loads configuration,
//! and runs the Supervisor until a shutdown or restart is requested.

use clap::{Parser, Subcommand};
use finguard::config::Config;
use finguard::supervisor::Supervisor;
use finguard::{APP_NAME, VERSION};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Single-node edge appliance: HTTP(S) reverse proxy, user-space WireGuard
/// tunnels, and mDNS/Jellyfin LAN discovery.
#[derive(Parser, Debug)]
#[command(name = APP_NAME, version = VERSION, about, long_about = None)]
struct Cli {
    /// Enable verbose (debug) logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file path (config.yaml); wireguard.yaml and
    /// services.yaml are read from the same directory
    #[arg(short, long, global = true, default_value = "/etc/finguard/config.yaml")]
    config: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the appliance in the foreground (default if no subcommand given)
    Run,

    /// Print version information and exit
    Version,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    info!("starting {} v{}", APP_NAME, VERSION);

    if let Err(e) = run(cli).await {
        error!(error = %e, "fatal error");
        std::process::exit(1);
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command.unwrap_or(Commands::Run) {
        Commands::Version => {
            println!("{} v{}", APP_NAME, VERSION);
            Ok(())
        }
        Commands::Run => {
            loop {
                let config = Config::from_file(&cli.config)?;
                let supervisor = Supervisor::new(config);
                let restart = supervisor.run().await?;
                if !restart {
                    break;
                }
                info!("restart requested, reloading configuration");
            }
            info!("{} shut down", APP_NAME);
            Ok(())
        }
    }
}
