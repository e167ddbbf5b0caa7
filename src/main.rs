// src/main.rs
//! otad - CLI entry point

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use otad::cli::InstallOptions;
use otad::{Config, StatusCode, UpdateClient, UpdateLock};
use std::io;
use std::path::PathBuf;
use tracing::error;

#[derive(Parser)]
#[command(name = "otad")]
#[command(version)]
#[command(about = "OTA update agent for OSTree-based embedded Linux devices", long_about = None)]
struct Cli {
    /// Configuration sources (files or conf.d directories), lowest
    /// precedence first; defaults to the standard sota locations
    #[arg(short, long, global = true)]
    config: Vec<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Check in with the update server and list targets for this device
    Check,

    /// Download and stage an update
    Install {
        /// Install the target with this version number
        #[arg(long)]
        version: Option<i64>,

        /// Install the target with this exact name
        #[arg(long)]
        target: Option<String>,

        /// What the install covers: all, or delay-app-install
        #[arg(long, default_value = "all")]
        install_mode: String,

        /// Allow installing a target older than the current one
        #[arg(long)]
        force: bool,
    },

    /// Finalize a pending installation after reboot
    Complete,

    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn load_config(sources: &[PathBuf]) -> Result<Config> {
    if sources.is_empty() {
        Ok(Config::load_default()?)
    } else {
        Ok(Config::load(sources)?)
    }
}

/// Build the client under the device-wide update lock
fn locked_client(config: &Config, finalize: bool) -> Result<Option<(UpdateLock, UpdateClient)>> {
    let Some(lock) = UpdateLock::try_acquire(config.storage.lock_path())? else {
        error!("Another update operation is already running on this device");
        return Ok(None);
    };
    let client = UpdateClient::from_config(config, finalize)?;
    Ok(Some((lock, client)))
}

fn run(cli: Cli) -> Result<StatusCode> {
    match cli.command {
        Some(Commands::Check) => {
            let config = load_config(&cli.config)?;
            let client = UpdateClient::from_config(&config, true)?;
            Ok(otad::cli::check(&client, None))
        }

        Some(Commands::Install { version, target, install_mode, force }) => {
            let config = load_config(&cli.config)?;
            let Some((_lock, client)) = locked_client(&config, true)? else {
                return Ok(StatusCode::InstallationInProgress);
            };
            let opts = InstallOptions {
                version,
                target_name: target,
                install_mode: Some(install_mode),
                force_downgrade: force,
                local: None,
            };
            Ok(otad::cli::install(&client, &opts))
        }

        Some(Commands::Complete) => {
            let config = load_config(&cli.config)?;
            let Some((_lock, client)) = locked_client(&config, false)? else {
                return Ok(StatusCode::InstallationInProgress);
            };
            Ok(otad::cli::complete(&client))
        }

        Some(Commands::Completions { shell }) => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "otad", &mut io::stdout());
            Ok(StatusCode::Ok)
        }

        None => {
            println!("otad v{}", env!("CARGO_PKG_VERSION"));
            println!("Run 'otad --help' for usage information");
            Ok(StatusCode::Ok)
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let code = match run(cli) {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            StatusCode::UnknownError
        }
    };
    std::process::exit(code.exit_code());
}
