//! # SlyMesh CLI Application
//!
//! Main entry point for the SlyMesh peer-to-peer shared folder utility.

use anyhow::Result;
use clap::Parser;
use colored::*;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use slymesh::cli::{self, Cli};

/// Sets up logging, parses the command line and runs the command.
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "slymesh=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    if let Err(e) = cli::run(cli.command).await {
        eprintln!("{} {}\n{}", "Error:".red().bold(), format!("{:#}", e).red(), "Tip: Run with --help for usage information.".yellow());
        std::process::exit(1);
    }
    Ok(())
}
