//! Rewatch CLI - Playback core toolkit
//!
//! Features:
//! - Quality ladder resolution against a live backend
//! - Manifest synthesis
//! - Watch checkpoint lookup
//! - Offline session simulation

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod output;
mod simulate;

/// Rewatch CLI - Playback and watch-progress toolkit
#[derive(Parser)]
#[command(name = "rewatch")]
#[command(version)]
#[command(about = "Permission-aware playback and watch-progress toolkit", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Output format (text, json, table)
    #[arg(short, long, default_value = "text")]
    format: String,

    /// Playback configuration file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve permissions and print the synthesized manifest
    Manifest {
        /// Media id
        media_id: String,

        /// Episode id (defaults to the media id)
        #[arg(short, long)]
        episode: Option<String>,

        /// Resolve as the content owner
        #[arg(long)]
        owner: bool,
    },

    /// Show the per-quality permission decisions
    Ladder {
        /// Media id
        media_id: String,

        /// Episode id (defaults to the media id)
        #[arg(short, long)]
        episode: Option<String>,

        /// Resolve as the content owner
        #[arg(long)]
        owner: bool,
    },

    /// Fetch the last watch checkpoint
    Checkpoint {
        /// Media id
        media_id: String,

        /// Episode id (defaults to the media id)
        #[arg(short, long)]
        episode: Option<String>,
    },

    /// Run a playback session against an in-memory backend
    Simulate {
        /// Simulation script (JSON)
        script: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(level)
        .with_writer(std::io::stderr)
        .init();
    rewatch_core::init();

    let config = commands::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Manifest { media_id, episode, owner } => {
            commands::manifest(&config, &media_id, episode, owner, &cli.format).await?;
        }
        Commands::Ladder { media_id, episode, owner } => {
            commands::ladder(&config, &media_id, episode, owner, &cli.format).await?;
        }
        Commands::Checkpoint { media_id, episode } => {
            commands::checkpoint(&config, &media_id, episode, &cli.format).await?;
        }
        Commands::Simulate { script } => {
            simulate::run(config, &script, &cli.format).await?;
        }
    }

    Ok(())
}
