use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "taskwright")]
#[command(version, about = "Drive a coding agent from labelled issue to merged pull request")]
pub struct Cli {
    /// Configuration file (defaults to ./taskwright.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Also write logs to this file. Overrides `log_file` in the config.
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    pub fn config_path(&self) -> PathBuf {
        self.config
            .clone()
            .unwrap_or_else(|| PathBuf::from(taskwright::config::DEFAULT_CONFIG_FILE))
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Poll repositories and process labelled issues until interrupted
    Daemon {
        /// Repository to watch, as owner/name. Repeat for several.
        #[arg(long = "repo", required = true, value_parser = cmd::parse_repo)]
        repos: Vec<String>,
    },
    /// Process a single issue once, in the foreground
    Run {
        #[arg(long, value_parser = cmd::parse_repo)]
        repo: String,
        #[arg(long)]
        issue: u64,
    },
    /// Show the phase and saved state of labelled issues
    Status {
        #[arg(long, value_parser = cmd::parse_repo)]
        repo: String,
        /// Show one issue in detail
        #[arg(long)]
        issue: Option<u64>,
    },
    /// Stop processing an issue
    Abort {
        #[arg(long, value_parser = cmd::parse_repo)]
        repo: String,
        #[arg(long)]
        issue: u64,
    },
    /// View, validate, or create the configuration file
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a starter taskwright.toml
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    // Config commands must work even when the file is broken.
    if let Commands::Config { command } = &cli.command {
        return cmd::cmd_config(&cli.config_path(), command.clone());
    }

    let config = taskwright::config::Config::load_or_default(&cli.config_path())
        .with_context(|| format!("Failed to load {}", cli.config_path().display()))?;
    let log_file = cli.log_file.clone().or_else(|| config.log_file.clone());
    let _guard = taskwright::logging::init(cli.verbose, log_file.as_deref(), config.log_format)?;
    for warning in config.validate() {
        tracing::warn!("{}", warning);
    }

    match &cli.command {
        Commands::Daemon { repos } => cmd::cmd_daemon(config, repos.clone()).await?,
        Commands::Run { repo, issue } => cmd::cmd_run(config, repo, *issue).await?,
        Commands::Status { repo, issue } => cmd::cmd_status(&config, repo, *issue).await?,
        Commands::Abort { repo, issue } => cmd::cmd_abort(&config, repo, *issue).await?,
        Commands::Config { .. } => {}
    }

    Ok(())
}
