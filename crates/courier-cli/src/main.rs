//! Courier - command-line front end for the outgoing message queue.

mod app;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use courier_config_and_utils::{init_logging, Config, Paths};

/// Courier command-line interface.
#[derive(Parser)]
#[command(name = "courier")]
#[command(about = "Queue and deliver room events to a homeserver")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    /// Base directory for runtime files (config, database, logs). Defaults to ~/.courier
    #[arg(long, global = true)]
    base_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Queue a text message and deliver everything pending in the room
    Send {
        /// Target room id
        #[arg(short, long)]
        room: String,
        /// Message body
        body: String,
    },
    /// Redact an event by server event id (`$...`) or local transaction id
    Redact {
        /// Target room id
        #[arg(short, long)]
        room: String,
        /// Event id or transaction id to redact
        target: String,
        /// Optional redaction reason
        #[arg(long)]
        reason: Option<String>,
    },
    /// Resume delivery of every recovered queue and wait until idle
    Flush,
    /// Show the pending queues
    Status,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let paths = match cli.base_dir {
        Some(base) => Paths::with_base_dir(base),
        None => Paths::new()?,
    };
    init_logging(&cli.log_level, &paths)?;

    let config = Config::load(&paths)?;

    match cli.command {
        Commands::Send { room, body } => app::send_text(&config, &paths, &room, &body).await?,
        Commands::Redact {
            room,
            target,
            reason,
        } => app::redact(&config, &paths, &room, &target, reason).await?,
        Commands::Flush => app::flush(&config, &paths).await?,
        Commands::Status => app::print_status(&paths).await?,
    }

    Ok(())
}
