use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::prelude::*;

mod commands;
mod config;
mod sink;

use crate::config::{FileConfig, TabwatchConfig, load_config};

#[derive(Parser)]
#[command(name = "tabwatch")]
#[command(about = "Follow long-running server jobs from several terminals at once")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Custom data directory (defaults to the platform's local data dir)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Track jobs until every one of them finishes
    Track(TrackArgs),

    /// Pick up every job left in the shared pending registry
    Resume,

    /// Keep the notification inbox synced until Ctrl-C
    Inbox(InboxArgs),

    /// Drop a job from the shared registry and its cached snapshot
    Forget(ForgetArgs),

    /// Show pending jobs, lease holders and cached snapshots
    Status(StatusArgs),
}

#[derive(Parser)]
struct TrackArgs {
    /// Job ids
    #[arg(required = true)]
    ids: Vec<String>,
}

#[derive(Parser)]
struct InboxArgs {
    /// Mark every unread notification as read, then exit
    #[arg(long, conflicts_with = "clear")]
    mark_read: bool,

    /// Delete every notification, then exit
    #[arg(long)]
    clear: bool,
}

#[derive(Parser)]
struct ForgetArgs {
    id: String,
}

#[derive(Parser)]
struct StatusArgs {
    /// Output as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_directive = if cli.debug {
        "tabwatch=debug,tabwatch_cli=debug"
    } else {
        "tabwatch=info,tabwatch_cli=info"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    let config = TabwatchConfig::new(cli.data_dir)?;
    let fc: FileConfig = load_config(&config.data_dir)
        .extract()
        .context("Failed to load configuration")?;
    debug!(data_dir = ?config.data_dir, ?fc, "configuration loaded");

    match cli.command {
        Commands::Track(args) => commands::track_command(&config, &fc, args.ids).await,
        Commands::Resume => commands::resume_command(&config, &fc).await,
        Commands::Inbox(args) => {
            commands::inbox_command(&config, &fc, args.mark_read, args.clear).await
        }
        Commands::Forget(args) => commands::forget_command(&config, &fc, args.id),
        Commands::Status(args) => commands::status_command(&config, &fc, args.json),
    }
}
