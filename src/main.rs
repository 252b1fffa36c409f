//! blynk-edge - command line harness
//!
//! Runs the client against the configured broker and logs every event, or
//! validates a configuration file.

use blynk_edge::config::{find_config_file, ClientConfig};
use blynk_edge::observability::init_default_logging;
use blynk_edge::{BlynkClient, Event, EventKey};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Device-side client for the Blynk cloud protocol
#[derive(Parser)]
#[command(name = "blynk-edge")]
#[command(about = "Device-side client for the Blynk cloud protocol")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "BLYNK_EDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging (overrides LOG_LEVEL with DEBUG)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and service the broker connection until interrupted
    Run,
    /// Validate the configuration
    Config {
        /// Print the effective configuration (token redacted)
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.verbose > 0 {
        let level = if cli.verbose > 1 { "TRACE" } else { "DEBUG" };
        std::env::set_var("LOG_LEVEL", level);
    }
    init_default_logging();

    let config = match load_configuration(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_client(config).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(
    explicit: Option<&std::path::Path>,
) -> Result<ClientConfig, Box<dyn std::error::Error>> {
    let path = find_config_file(explicit)?;
    info!("Loading configuration from: {}", path.display());
    Ok(ClientConfig::load_from_file(&path)?)
}

async fn run_client(config: ClientConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        endpoint = %config.endpoint(),
        "Starting blynk-edge"
    );

    let mut client = BlynkClient::from_config(&config)?;
    register_log_handlers(&mut client);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully..."),
        }
        let _ = shutdown_tx.send(true);
    });

    client.run(shutdown_rx).await;

    let stats = client.stats();
    info!(
        frames_in = stats.frames_in,
        frames_out = stats.frames_out,
        connects = stats.connects,
        "Shutdown complete"
    );
    Ok(())
}

fn register_log_handlers(client: &mut BlynkClient) {
    client.on(EventKey::Connected, |_| {
        info!("Connected to Blynk cloud");
        Ok(())
    });
    client.on(EventKey::Disconnected, |_| {
        warn!("Disconnected from Blynk cloud");
        Ok(())
    });
    client.on(EventKey::InvalidAuth, |_| {
        error!("Auth token rejected; check cloud.auth_token");
        Ok(())
    });
    client.on(EventKey::Redirect, |event: &Event| {
        if let Event::Redirect { host, port } = event {
            info!(host = %host, port, "Redirected");
        }
        Ok(())
    });
    client.on(EventKey::AnyVirtualPin, |event: &Event| {
        if let Event::VirtualWriteAny { pin, values } = event {
            info!(pin = %pin, values = ?values, "Virtual pin write");
        }
        Ok(())
    });
}

fn handle_config_command(
    config: &ClientConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    config.auth_token()?;

    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(&config.redacted())?);
    }

    info!("Configuration validation complete");
    Ok(())
}
