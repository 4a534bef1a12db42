mod commands;

use std::path::PathBuf;

use at_core::settings::SettingsManager;
use clap::{Parser, Subcommand};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// auto-claude CLI: inspect agent activity and the task queue.
#[derive(Parser)]
#[command(name = "at", version, about)]
struct Cli {
    /// Config file (defaults to ~/.auto-claude/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Classify one transcript file and show the decision inputs.
    Classify {
        file: PathBuf,
        #[arg(long)]
        json: bool,
    },

    /// Watch the transcript directory and print activity changes.
    Monitor {
        /// Transcript root (defaults to the configured one).
        #[arg(long)]
        root: Option<PathBuf>,
        /// Print bridge events as JSON lines.
        #[arg(long)]
        json: bool,
    },

    /// Run one promotion pass over a JSON task file.
    Queue {
        #[arg(long)]
        tasks: PathBuf,
        /// Override the parallelism cap.
        #[arg(long)]
        max: Option<usize>,
        /// Acknowledge current failures and clear the block first.
        #[arg(long)]
        unblock: bool,
        /// Print the pass metrics in Prometheus text format.
        #[arg(long)]
        metrics: bool,
    },

    /// Print the effective configuration as TOML.
    Config {
        /// Write it back to the config file, filling in defaults.
        #[arg(long)]
        write: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    at_telemetry::logging::init("at", "warn", false);
    let settings = cli
        .config
        .map(SettingsManager::new)
        .unwrap_or_else(SettingsManager::default_path);
    let config = || commands::load_config(&settings);

    match cli.command {
        Commands::Classify { file, json } => {
            commands::classify::run(&file, &config().monitor, json).await?;
        }
        Commands::Monitor { root, json } => {
            commands::monitor::run(config().monitor, root, json).await?;
        }
        Commands::Queue {
            tasks,
            max,
            unblock,
            metrics,
        } => {
            commands::queue::run(&tasks, &config().queue, max, unblock, metrics).await?;
        }
        Commands::Config { write } => {
            commands::config::run(&settings, write)?;
        }
    }

    Ok(())
}
