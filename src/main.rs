use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use kstor::config::Config;
use kstor::server::{self, ServerState};
use kstor::state::Database;

#[derive(Parser)]
#[command(name = "kstor")]
#[command(about = "Multi-user secret sharing server")]
#[command(version)]
struct Cli {
    /// Configuration file.
    #[arg(short, long, default_value = "kstor.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server
    Server,
    /// Parse the configuration and print the effective values
    CheckConfig,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Server => {
            if let Err(e) = run_server(config).await {
                eprintln!("Error: {e}");
                std::process::exit(1);
            }
        }
        Commands::CheckConfig => match serde_yaml::to_string(&config) {
            Ok(rendered) => print!("{rendered}"),
            Err(e) => {
                eprintln!("Error: {e}");
                std::process::exit(1);
            }
        },
    }
}

async fn run_server(config: Config) -> kstor::error::Result<()> {
    let db = Database::connect(&config.database).await?;
    let state = Arc::new(ServerState::new(db, &config));
    server::serve(state, &config, shutdown_signal()).await
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            tracing::warn!(error = %e, "cannot install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
