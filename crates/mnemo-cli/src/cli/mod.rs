//! CLI entry and dispatch.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use mnemo_core::config::Config;
use mnemo_core::core::interrupt;

mod commands;

#[derive(Parser)]
#[command(name = "mnemo")]
#[command(version)]
#[command(about = "File-backed agent loop with a persistent shell")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Base directory; the sandbox root is resolved against it
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Config file (default: $MNEMO_HOME/config.toml)
    #[arg(long, env = "MNEMO_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Runs one turn with a prompt and prints the final answer
    Exec {
        /// The prompt to send to the agent
        #[arg(short, long)]
        prompt: String,

        /// Override the model from config
        #[arg(short, long)]
        model: Option<String>,
    },
    /// Reads prompts line by line from stdin, one turn each
    Chat,
    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(clap::Subcommand)]
enum ConfigCommands {
    /// Show the path to the config file
    Path,
    /// Initialize a default config file (if not present)
    Init,
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    // Config commands never start an agent.
    if let Commands::Config { command } = &cli.command {
        return match command {
            ConfigCommands::Path => commands::config::path(cli.config.as_deref()),
            ConfigCommands::Init => commands::config::init(cli.config.as_deref()),
        };
    }

    interrupt::init()?;

    // one tokio runtime for everything
    let rt = tokio::runtime::Runtime::new().context("create tokio runtime")?;

    let result = rt.block_on(async move { dispatch(cli).await });
    // A chat stdin read may still be parked on a blocking thread.
    rt.shutdown_background();
    result
}

async fn dispatch(cli: Cli) -> Result<()> {
    let config = match cli.config.as_deref() {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
    .context("load config")?;

    match cli.command {
        Commands::Exec { prompt, model } => {
            commands::exec::run(commands::exec::ExecRunOptions {
                root: &cli.root,
                prompt: &prompt,
                config: &config,
                model_override: model.as_deref(),
            })
            .await
        }
        Commands::Chat => commands::chat::run(&cli.root, &config).await,
        Commands::Config { .. } => Ok(()),
    }
}
