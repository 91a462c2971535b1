use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use stratum_import::import::{self, Tools};
use stratum_import::{config, is_privileged};

#[derive(Parser)]
#[command(
    name = "stratum-import",
    about = "Import a directory, tarball, or VM disk image as a new stratum"
)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to config file (default: ~/.config/stratum-import/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Import a root filesystem as a new stratum
    Import {
        /// Name of the new stratum
        name: String,
        /// Source: directory, tarball (.tar, .tar.gz, .tar.bz2, .tar.xz, .tar.zst),
        /// or disk image (.qcow, .qcow2, .qcow3, .vdi, .vmdk, .raw, .img)
        source: PathBuf,
    },

    /// Manage configuration
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Show current configuration
    Get,
    /// Set a configuration value
    Set {
        /// Configuration key
        key: String,
        /// Configuration value
        value: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::new()
        .filter_level(if cli.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .format_timestamp(None)
        .format_target(false)
        .init();

    let config_path = cli.config.as_deref();
    log::debug!("config: {}", config::resolve_path(config_path)?.display());
    let cfg = config::load(config_path)?;

    match cli.command {
        Command::Config(cmd) => match cmd {
            ConfigCommand::Get => {
                cfg.display();
            }
            ConfigCommand::Set { key, value } => {
                let mut cfg = cfg;
                cfg.set(&key, &value)?;
                config::save(&cfg, config_path)?;
            }
        },
        Command::Import { name, source } => {
            if !is_privileged() {
                bail!("stratum-import requires root privileges; run with sudo");
            }
            let dest = import::destination(&cfg, &name, &source)?;
            let tools = Tools::from_config(&cfg);
            if let Err(e) = import::run(&cfg, &tools, &name, &source) {
                eprintln!("error: {e:#}");
                if std::fs::symlink_metadata(&dest).is_err() {
                    eprintln!("removed incomplete stratum {}", dest.display());
                } else {
                    eprintln!("incomplete stratum left at {}; remove it by hand", dest.display());
                }
                std::process::exit(1);
            }
            println!("{name}");
        }
    }

    Ok(())
}
