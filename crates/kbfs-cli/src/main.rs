//! # kbfs CLI
//!
//! Command-line interface for kbfs key-addressed block volumes.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kbfs_config::logging::{init_logging, LogLevel};
use kbfs_config::{log_cli_debug, log_cli_warn, Config};
use kbfs_store::{FileDevice, Key, MountOptions, Volume};

mod fsck;
mod mkfs;
mod ops;
mod stat;

/// kbfs - flat key-addressed block store with content deduplication
#[derive(Parser)]
#[command(name = "kbfs")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Block device or image file (overrides config and KBFS_DEVICE)
    #[arg(long, short = 'd', global = true, value_name = "PATH")]
    device: Option<PathBuf>,

    /// More log output (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Format a device or image file as a kbfs volume
    Mkfs(mkfs::MkfsArgs),

    /// Show superblock, usage and dedup savings
    Stat {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Check volume consistency
    Fsck {
        /// Repair what the check finds
        #[arg(long)]
        repair: bool,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Store a value (at most one block) under KEY
    Put {
        /// 40 hex digits
        key: Key,
        /// Read the value from FILE instead of stdin
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },

    /// Print the block stored under KEY
    Get {
        key: Key,
        /// Write to FILE instead of stdout
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// Delete KEY
    Rm { key: Key },

    /// Rename OLD to NEW without moving data
    Mv { old: Key, new: Key },

    /// List stored keys
    Ls {
        /// Show slot, timestamp and sharing
        #[arg(short, long)]
        long: bool,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration as TOML
    Show,
    /// Print config file locations
    Path,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let reloaded = kbfs_config::reload();
    let config = kbfs_config::config().clone();

    let level = if cli.quiet {
        LogLevel::Error
    } else {
        config.logging.level().louder(cli.verbose)
    };
    init_logging(level);
    if let Err(e) = reloaded {
        log_cli_warn!("ignoring unreadable config", error = tracing::field::display(&e));
    }

    let device = cli.device.clone().or_else(|| config.device.path.clone());
    log_cli_debug!("resolved device", device = tracing::field::debug(&device));

    match cli.command {
        Commands::Mkfs(args) => mkfs::run(require_device(&device)?, args, &config),
        Commands::Stat { json } => stat::run(require_device(&device)?, json),
        Commands::Fsck { repair, json } => fsck::run(require_device(&device)?, repair, json),
        Commands::Put { key, file } => {
            let mut volume = open_volume(require_device(&device)?, &config)?;
            ops::put(&mut volume, &key, file.as_deref())
        }
        Commands::Get { key, output } => {
            let volume = open_volume(require_device(&device)?, &config)?;
            ops::get(&volume, &key, output.as_deref())
        }
        Commands::Rm { key } => {
            let mut volume = open_volume(require_device(&device)?, &config)?;
            ops::remove(&mut volume, &key)
        }
        Commands::Mv { old, new } => {
            let mut volume = open_volume(require_device(&device)?, &config)?;
            ops::rename(&mut volume, &old, &new)
        }
        Commands::Ls { long } => {
            let volume = open_volume(require_device(&device)?, &config)?;
            ops::list(&volume, long)
        }
        Commands::Config { command } => cmd_config(command, &config),
    }
}

fn require_device(device: &Option<PathBuf>) -> Result<&Path> {
    device.as_deref().context(
        "no device given: pass --device, set KBFS_DEVICE or [device] path in the config",
    )
}

/// Mount the volume on `path`, running the consistency pass if configured.
pub(crate) fn open_volume(path: &Path, config: &Config) -> Result<Volume<FileDevice>> {
    let dev = FileDevice::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let opts = MountOptions {
        repair: config.mount.repair_on_mount,
    };
    Volume::mount(dev, &opts).with_context(|| format!("Failed to mount {}", path.display()))
}

fn cmd_config(command: ConfigCommands, config: &Config) -> Result<()> {
    match command {
        ConfigCommands::Show => {
            print!("{}", config.to_toml()?);
        }
        ConfigCommands::Path => {
            match Config::global_config_path() {
                Some(p) => println!("Global:  {}", p.display()),
                None => println!("Global:  (no home directory)"),
            }
            println!("Project: {}", Config::project_config_path().display());
        }
    }
    Ok(())
}
