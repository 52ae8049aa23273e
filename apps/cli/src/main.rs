//! bgdl CLI - Command-line front end for the background download manager
//!
//! Transfers are addressed by caller-chosen numeric ids. Interrupting a
//! running command pauses its transfers so they can be resumed later.

mod commands;
mod output;
mod progress;

use anyhow::Result;
use bgdl_types::TransferId;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// bgdl - Resumable Background Downloads
#[derive(Parser)]
#[command(name = "bgdl")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Data directory for bgdl
    #[arg(long, env = "BGDL_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "human")]
    output: OutputFormat,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    Human,
    Json,
    Table,
}

#[derive(Subcommand)]
enum Commands {
    /// Download a URL as a new transfer
    Get {
        /// Transfer ID
        id: TransferId,

        /// URL to download
        url: String,
    },

    /// Resume a paused transfer, or start it if nothing was saved
    Resume {
        /// Transfer ID
        id: TransferId,

        /// URL of the transfer
        url: String,
    },

    /// Pick up transfers interrupted by the end of an earlier run
    Recover,

    /// List stored resume tokens
    Tokens,

    /// Discard the resume token of a transfer
    Discard {
        /// Transfer ID
        id: TransferId,

        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },

    /// Show/update configuration
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show the effective configuration
    Show,

    /// Print the configuration file path
    Path,

    /// Set a config value
    Set {
        /// Config key
        key: String,

        /// Config value
        value: String,
    },

    /// Reset to defaults
    Reset,
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    // Determine data directory
    let data_dir = cli.data_dir.unwrap_or_else(|| {
        dirs::data_dir()
            .map(|d| d.join("bgdl"))
            .unwrap_or_else(|| PathBuf::from(".bgdl"))
    });

    let config = bgdl_core::load_config(&data_dir).await?;

    // Execute command
    match cli.command {
        Commands::Get { id, url } => {
            let manager = bgdl_core::DownloadManager::new(config).await?;
            commands::get(&manager, id, &url, cli.output).await?
        }

        Commands::Resume { id, url } => {
            let manager = bgdl_core::DownloadManager::new(config).await?;
            commands::resume(&manager, id, &url, cli.output).await?
        }

        Commands::Recover => {
            let manager = bgdl_core::DownloadManager::new(config).await?;
            commands::recover(&manager, cli.output).await?
        }

        Commands::Tokens => {
            let manager = bgdl_core::DownloadManager::new(config).await?;
            commands::list_tokens(&manager, cli.output).await?
        }

        Commands::Discard { id, yes } => {
            let manager = bgdl_core::DownloadManager::new(config).await?;
            commands::discard(&manager, id, yes).await?
        }

        Commands::Config { action } => {
            commands::config_action(&data_dir, config, action, cli.output).await?
        }

        Commands::Completions { shell } => {
            use clap::CommandFactory;
            clap_complete::generate(shell, &mut Cli::command(), "bgdl", &mut std::io::stdout());
        }
    }

    Ok(())
}
