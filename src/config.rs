//! Loading, saving, and resolving the configuration file
//! (default: `~/.config/stratum-import/config.toml`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub struct Config {
    /// Directory new strata are created under.
    #[serde(default = "default_strata_dir")]
    pub strata_dir: PathBuf,

    /// Program converting disk images to raw (`qemu-img` compatible).
    #[serde(default = "default_converter")]
    pub converter: String,

    /// Program printing the partition table (`fdisk -l` compatible).
    #[serde(default = "default_inspector")]
    pub inspector: String,

    /// Delay before retrying a failed loop mount.
    #[serde(default = "default_mount_backoff_ms")]
    pub mount_backoff_ms: u64,

    /// Single-character directory that some VM exports wrap the root in.
    #[serde(default = "default_wrapper_dir")]
    pub wrapper_dir: String,
}

fn default_strata_dir() -> PathBuf {
    PathBuf::from("/bedrock/strata")
}

fn default_converter() -> String {
    "qemu-img".to_string()
}

fn default_inspector() -> String {
    "fdisk".to_string()
}

fn default_mount_backoff_ms() -> u64 {
    1000
}

fn default_wrapper_dir() -> String {
    "x".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            strata_dir: default_strata_dir(),
            converter: default_converter(),
            inspector: default_inspector(),
            mount_backoff_ms: default_mount_backoff_ms(),
            wrapper_dir: default_wrapper_dir(),
        }
    }
}

impl Config {
    pub fn display(&self) {
        println!("strata_dir = {}", self.strata_dir.display());
        println!("converter = {}", self.converter);
        println!("inspector = {}", self.inspector);
        println!("mount_backoff_ms = {}", self.mount_backoff_ms);
        println!("wrapper_dir = {}", self.wrapper_dir);
    }

    pub fn mount_backoff(&self) -> Duration {
        Duration::from_millis(self.mount_backoff_ms)
    }

    /// Update a single key from its string form, validating the value.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "strata_dir" => {
                let path = PathBuf::from(value);
                if !path.is_absolute() {
                    bail!("strata_dir must be an absolute path: {value}");
                }
                self.strata_dir = path;
            }
            "converter" | "inspector" => {
                if value.trim().is_empty() {
                    bail!("{key} cannot be empty");
                }
                if key == "converter" {
                    self.converter = value.to_string();
                } else {
                    self.inspector = value.to_string();
                }
            }
            "mount_backoff_ms" => {
                self.mount_backoff_ms = value.parse().map_err(|_| {
                    anyhow::anyhow!("mount_backoff_ms must be an integer (milliseconds)")
                })?;
            }
            "wrapper_dir" => {
                if value.chars().count() != 1 || value == "/" || value == "." {
                    bail!("wrapper_dir must be a single character directory name: {value:?}");
                }
                self.wrapper_dir = value.to_string();
            }
            _ => bail!("unknown config key: {key}"),
        }
        Ok(())
    }
}

fn sudo_user_config_path() -> Option<PathBuf> {
    let su = crate::sudo_user()?;
    Some(su.home.join(".config").join("stratum-import").join("config.toml"))
}

pub fn config_path() -> Result<PathBuf> {
    // When running under sudo, prefer the invoking user's config if it exists.
    if let Some(path) = sudo_user_config_path() {
        if path.exists() {
            return Ok(path);
        }
    }
    let base = if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(xdg)
    } else {
        let home = std::env::var("HOME").context("HOME not set")?;
        PathBuf::from(home).join(".config")
    };
    Ok(base.join("stratum-import").join("config.toml"))
}

pub fn resolve_path(path: Option<&Path>) -> Result<PathBuf> {
    match path {
        Some(p) => Ok(p.to_path_buf()),
        None => config_path(),
    }
}

pub fn load(path: Option<&Path>) -> Result<Config> {
    let path = resolve_path(path)?;
    if !path.exists() {
        return Ok(Config::default());
    }
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(config)
}

pub fn save(config: &Config, path: Option<&Path>) -> Result<()> {
    let path = resolve_path(path)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let contents = toml::to_string(config).context("failed to serialize config")?;
    std::fs::write(&path, contents)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}
