//! Drive relay - OAuth-backed relay for cloud drive browsing
//!
//! Signs browser sessions in against the identity provider and proxies
//! drive listing, downloads and permission lookups on their behalf.

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use drive_relay::{
    cli::{Cli, Command},
    config::Config,
    relay::RelayServer,
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup tracing
    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Some(Command::CheckConfig) => run_check_config(&config),
        Some(Command::Serve) | None => run_server(config).await,
    }
}

/// Load configuration and apply CLI overrides
fn load_config(cli: &Cli) -> drive_relay::Result<Config> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(ref host) = cli.host {
        config.server.host.clone_from(host);
    }
    Ok(config)
}

/// Validate configuration and print it with secrets redacted
fn run_check_config(config: &Config) -> ExitCode {
    if let Err(e) = config.validate() {
        eprintln!("❌ {e}");
        return ExitCode::FAILURE;
    }
    if let Err(e) = config.resolve_identity() {
        eprintln!("❌ {e}");
        return ExitCode::FAILURE;
    }
    if config.webhook.enabled {
        if let Err(e) = config.webhook.resolve_client_state() {
            eprintln!("❌ {e}");
            return ExitCode::FAILURE;
        }
    }

    match serde_yaml::to_string(&config.redacted()) {
        Ok(yaml) => {
            println!("{yaml}");
            println!("✅ Configuration is valid");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("❌ Failed to render configuration: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Run the relay server
async fn run_server(config: Config) -> ExitCode {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        "Starting drive relay"
    );

    let server = match RelayServer::new(config) {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to create relay: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = server.run().await {
        error!("Relay error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Relay shutdown complete");
    ExitCode::SUCCESS
}
