//! # kbfs-config
//!
//! Configuration management for kbfs.
//!
//! Loads configuration from:
//! 1. `~/.kbfs/config.toml` (global)
//! 2. `.kbfs/config.toml` (project-local, overrides global key by key)
//! 3. Environment variables (highest priority)
//!
//! Command-line flags override all of these; that happens in the CLI.

pub mod logging;
pub mod testing;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{debug, warn};

use crate::logging::LogLevel;

/// Environment variable naming the device or image file
pub const ENV_DEVICE: &str = "KBFS_DEVICE";
/// Environment variable enabling deduplication at format time
pub const ENV_DEDUP: &str = "KBFS_DEDUP";
/// Environment variable enabling the consistency pass at mount
pub const ENV_REPAIR_ON_MOUNT: &str = "KBFS_REPAIR_ON_MOUNT";

/// Global config instance
static CONFIG: Lazy<RwLock<Config>> = Lazy::new(|| {
    // A broken config file still leaves the environment in effect
    let config = Config::load().unwrap_or_else(|_| {
        let mut fallback = Config::default();
        fallback.apply_env_overrides();
        fallback
    });
    RwLock::new(config)
});

/// Get global config (read-only)
pub fn config() -> std::sync::RwLockReadGuard<'static, Config> {
    CONFIG.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Reload config from disk
pub fn reload() -> Result<(), ConfigError> {
    let new_config = Config::load()?;
    *CONFIG.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = new_config;
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("TOML serialize error: {0}")]
    TomlSer(#[from] toml::ser::Error),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub device: DeviceConfig,
    pub format: FormatConfig,
    pub mount: MountConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load config from standard locations
    pub fn load() -> Result<Self, ConfigError> {
        let global = Self::global_config_path();
        let mut config = Self::load_from(global.as_deref(), &Self::project_config_path())?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load and merge the two config files, without environment overrides.
    ///
    /// Missing files are skipped. Keys present in `project` replace the
    /// same keys from `global`; tables are merged recursively.
    pub fn load_from(global: Option<&Path>, project: &Path) -> Result<Self, ConfigError> {
        let mut merged = toml::Table::new();
        for path in global.into_iter().chain(std::iter::once(project)) {
            if !path.exists() {
                continue;
            }
            debug!("Loading config from {:?}", path);
            let contents = std::fs::read_to_string(path)?;
            let table: toml::Table = toml::from_str(&contents)?;
            merge_tables(&mut merged, table);
        }
        Ok(toml::Value::Table(merged).try_into()?)
    }

    /// Global config path: ~/.kbfs/config.toml
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".kbfs/config.toml"))
    }

    /// Project config path: .kbfs/config.toml in the working directory
    pub fn project_config_path() -> PathBuf {
        PathBuf::from(".kbfs/config.toml")
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Apply overrides from any variable source.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup(ENV_DEVICE) {
            self.device.path = Some(PathBuf::from(path));
        }
        if let Some(value) = lookup(ENV_DEDUP) {
            match parse_bool(&value) {
                Some(dedup) => self.format.dedup = dedup,
                None => warn!(var = ENV_DEDUP, value = %value, "ignoring non-boolean override"),
            }
        }
        if let Some(value) = lookup(ENV_REPAIR_ON_MOUNT) {
            match parse_bool(&value) {
                Some(repair) => self.mount.repair_on_mount = repair,
                None => warn!(
                    var = ENV_REPAIR_ON_MOUNT,
                    value = %value,
                    "ignoring non-boolean override"
                ),
            }
        }
    }

    /// Generate default config TOML string
    pub fn default_toml() -> Result<String, ConfigError> {
        Config::default().to_toml()
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Write this config to `path`, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_toml()?)?;
        Ok(())
    }
}

fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        if let toml::Value::Table(incoming) = value {
            if let Some(toml::Value::Table(existing)) = base.get_mut(&key) {
                merge_tables(existing, incoming);
                continue;
            }
            base.insert(key, toml::Value::Table(incoming));
        } else {
            base.insert(key, value);
        }
    }
}

/// Accepts `1/0`, `true/false`, `yes/no`, `on/off` in any case.
pub fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Device selection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Block device or image file holding the volume
    pub path: Option<PathBuf>,
}

/// Defaults for `kbfs mkfs`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FormatConfig {
    /// Format with the deduplication layer
    pub dedup: bool,
    /// Size of a newly created image file (None = use the existing device size)
    pub size_bytes: Option<u64>,
}

/// Mount behaviour
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MountConfig {
    /// Run the consistency pass with repair on every mount
    pub repair_on_mount: bool,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// error, warn, info, debug or trace
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
        }
    }
}

impl LoggingConfig {
    /// Parsed level; unknown names fall back to `warn`.
    pub fn level(&self) -> LogLevel {
        self.level.parse().unwrap_or(LogLevel::Warn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.device.path, None);
        assert!(!config.format.dedup);
        assert!(!config.mount.repair_on_mount);
        assert_eq!(config.logging.level(), LogLevel::Warn);
    }

    #[test]
    fn test_default_toml_round_trips() {
        let toml_str = Config::default_toml().unwrap();
        assert!(toml_str.contains("[format]"));
        assert!(toml_str.contains("repair_on_mount = false"));
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed, Config::default());
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: Config = toml::from_str("[format]\ndedup = true\n").unwrap();
        assert!(config.format.dedup);
        assert_eq!(config.format.size_bytes, None);
        assert_eq!(config.logging.level, "warn");
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            (ENV_DEVICE, "/dev/loop7"),
            (ENV_DEDUP, "yes"),
            (ENV_REPAIR_ON_MOUNT, "maybe"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.mount.repair_on_mount = true;
        config.apply_overrides(|name| vars.get(name).map(|v| v.to_string()));

        assert_eq!(config.device.path, Some(PathBuf::from("/dev/loop7")));
        assert!(config.format.dedup);
        // Unparseable value leaves the setting alone
        assert!(config.mount.repair_on_mount);
    }

    #[test]
    fn test_parse_bool() {
        assert_eq!(parse_bool("TRUE"), Some(true));
        assert_eq!(parse_bool(" 0 "), Some(false));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool(""), None);
    }

    #[test]
    fn test_merge_tables_is_recursive() {
        let mut base: toml::Table =
            toml::from_str("[format]\ndedup = true\nsize_bytes = 4096\n").unwrap();
        let overlay: toml::Table = toml::from_str("[format]\nsize_bytes = 8192\n").unwrap();
        merge_tables(&mut base, overlay);

        let config: Config = toml::Value::Table(base).try_into().unwrap();
        assert!(config.format.dedup);
        assert_eq!(config.format.size_bytes, Some(8192));
    }
}
