//! Segue CLI - Headless driver for the ad-insertion engine
//!
//! Features:
//! - Ad manifest probing and rendition selection
//! - Segment pipeline dry runs into an in-memory buffer sink
//! - Ad pod playback on a headless media element
//! - Effective configuration dump

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod output;

/// Segue CLI - Ad playback toolkit
#[derive(Parser)]
#[command(name = "segue-cli")]
#[command(version)]
#[command(about = "Headless ad-insertion playback toolkit", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Output format (text, json)
    #[arg(short, long, default_value = "text")]
    format: String,

    /// Engine configuration file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the renditions of an ad manifest and the one that would load
    Probe {
        /// URL to manifest
        manifest: String,

        /// Bandwidth estimate in bits per second
        #[arg(short, long)]
        bandwidth: Option<u64>,
    },

    /// Download and append every segment of an HLS creative
    PlayAd {
        /// URL to manifest
        manifest: String,

        /// Bandwidth estimate in bits per second
        #[arg(short, long)]
        bandwidth: Option<u64>,
    },

    /// Play an ad pod headlessly and report the outcome
    Pod {
        /// Ad-decision response (JSON file)
        response: PathBuf,

        /// Print every event as it is emitted
        #[arg(long)]
        events: bool,
    },

    /// Print the effective engine configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(level)
        .init();

    segue_core::init();
    let config = commands::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Probe { manifest, bandwidth } => {
            commands::probe(&config, &manifest, bandwidth, &cli.format).await?;
        }
        Commands::PlayAd { manifest, bandwidth } => {
            commands::play_ad(&config, &manifest, bandwidth, &cli.format).await?;
        }
        Commands::Pod { response, events } => {
            commands::pod(&config, &response, events, &cli.format).await?;
        }
        Commands::Config => {
            commands::show_config(&config, &cli.format)?;
        }
    }

    Ok(())
}
