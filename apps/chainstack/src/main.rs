mod commands;
mod config;
mod stack;

use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::config::{AppConfig, CliArgs};

/// chainstack - supervisor for a local blockchain development stack
#[derive(Parser)]
#[command(name = "chainstack")]
#[command(about = "Supervise a local blockchain development stack")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print effective configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Log verbosity level (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the configured stack in dependency order
    Up {
        /// Return right after spawning, without waiting for readiness
        #[arg(long)]
        no_wait: bool,
    },
    /// Stop the running stack in reverse dependency order
    Down {
        /// Also reset on-disk state (chain data, store directories)
        #[arg(long)]
        reset: bool,
    },
    /// Show the observed state of every configured service
    Status,
    /// Correlate running stack processes into a PID table
    Pids,
    /// Validate configuration and exit
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(ref path) = cli.config {
        if !Path::new(path).is_file() {
            anyhow::bail!("config file does not exist: {}", path.display());
        }
    }

    let args = CliArgs {
        config: cli.config.as_ref().map(|p| p.to_string_lossy().into_owned()),
        print_config: cli.print_config,
        verbose: cli.verbose,
    };

    // Layered config: defaults -> YAML (if provided) -> env (CS__*) -> CLI.
    // Also normalizes + creates server.home_dir.
    let mut config = AppConfig::load_or_default(cli.config.as_deref())?;
    config.apply_cli_overrides(&args);

    init_logging(&config.logging.level);
    tracing::debug!(config = ?args.config, "chainstack starting");

    if args.print_config {
        println!("{}", config.render()?);
        return Ok(());
    }

    match cli.command.unwrap_or(Commands::Status) {
        Commands::Up { no_wait } => commands::up(&config, no_wait).await,
        Commands::Down { reset } => commands::down(&config, reset).await,
        Commands::Status => commands::status(&config).await,
        Commands::Pids => commands::pids(&config).await,
        Commands::Check => commands::check(&config),
    }
}

fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
