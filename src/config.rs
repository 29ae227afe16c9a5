//! Engine configuration
//!
//! Configuration is stored as TOML. Every field has a default so partial
//! files load cleanly, and [`EngineConfig::validate`] rejects values the
//! engine cannot run with. A configuration is only ever applied as a whole:
//! loading and validation happen before anything in the engine is touched.

use crate::input::{normalize, DeviceClass, ExtendedCode, Modifiers};
use chrono::format::{Item, StrftimeItems};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

const APP_DIR: &str = "kps-engine";
const CONFIG_FILE: &str = "config.toml";

pub const MIN_UPDATE_RATE_MS: u64 = 1;
pub const MAX_UPDATE_RATE_MS: u64 = 60_000;
pub const MAX_AVERAGE_PRECISION: u8 = 3;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read configuration file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write configuration file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// A key or button the engine tracks from startup
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct KeyEntry {
    pub name: String,
    pub code: ExtendedCode,
    #[serde(default = "default_visible")]
    pub visible: bool,
}

fn default_visible() -> bool {
    true
}

/// A command key as written in the config file. No `code` means unbound.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(default)]
pub struct CommandKeySpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<u32>,
    pub ctrl: bool,
    pub alt: bool,
    pub shift: bool,
}

impl CommandKeySpec {
    pub fn ctrl(code: u32) -> Self {
        Self {
            code: Some(code),
            ctrl: true,
            alt: false,
            shift: false,
        }
    }

    pub fn unbound() -> Self {
        Self::default()
    }

    /// Command keys always carry their modifiers, independent of modifier tracking
    pub fn extended_code(&self) -> Option<ExtendedCode> {
        self.code.map(|raw| {
            normalize(
                raw,
                DeviceClass::Keyboard,
                true,
                Modifiers {
                    ctrl: self.ctrl,
                    alt: self.alt,
                    shift: self.shift,
                },
            )
        })
    }
}

/// Command key bindings
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct CommandConfig {
    pub reset_stats: CommandKeySpec,
    pub exit: CommandKeySpec,
    pub reset_totals: CommandKeySpec,
    pub toggle_visibility: CommandKeySpec,
    pub toggle_pause: CommandKeySpec,
    pub reload_config: CommandKeySpec,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            reset_stats: CommandKeySpec::ctrl(0x19),       // Ctrl + P
            exit: CommandKeySpec::ctrl(0x16),              // Ctrl + U
            reset_totals: CommandKeySpec::ctrl(0x17),      // Ctrl + I
            toggle_visibility: CommandKeySpec::ctrl(0x15), // Ctrl + Y
            toggle_pause: CommandKeySpec::ctrl(0x14),      // Ctrl + T
            reload_config: CommandKeySpec::ctrl(0x13),     // Ctrl + R
        }
    }
}

/// Statistics saving on exit, loading on launch and periodic autosave
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct StatsSavingSettings {
    pub save_on_exit: bool,
    pub load_on_launch: bool,
    pub save_file: PathBuf,
    pub autosave: bool,
    pub autosave_dest: PathBuf,
    /// chrono strftime pattern for autosave file names
    pub autosave_format: String,
    pub autosave_interval_ms: u64,
}

impl Default for StatsSavingSettings {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .map(|dir| dir.join(APP_DIR))
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            save_on_exit: false,
            load_on_launch: false,
            save_file: data_dir.join("stats.toml"),
            autosave: false,
            autosave_dest: data_dir.join("autosave"),
            autosave_format: "kps-%Y-%m-%d_%H-%M-%S.toml".to_string(),
            autosave_interval_ms: 600_000,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Sampling interval of the aggregator
    pub update_rate_ms: u64,
    pub track_all_keys: bool,
    pub track_all_buttons: bool,
    pub key_modifier_tracking: bool,
    /// Decimal places shown for the average
    pub average_precision: u8,
    /// Published values kept for graphing, 0 disables
    pub graph_backlog: usize,
    /// How long cursor samples are kept, 0 disables
    pub cursor_backlog_ms: u64,
    pub keys: Vec<KeyEntry>,
    pub commands: CommandConfig,
    pub stats: StatsSavingSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            update_rate_ms: 1000,
            track_all_keys: false,
            track_all_buttons: false,
            key_modifier_tracking: false,
            average_precision: 0,
            graph_backlog: 60,
            cursor_backlog_ms: 0,
            keys: vec![
                KeyEntry {
                    name: "Z".to_string(),
                    code: ExtendedCode::from_raw(0x2C),
                    visible: true,
                },
                KeyEntry {
                    name: "X".to_string(),
                    code: ExtendedCode::from_raw(0x2D),
                    visible: true,
                },
            ],
            commands: CommandConfig::default(),
            stats: StatsSavingSettings::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_UPDATE_RATE_MS..=MAX_UPDATE_RATE_MS).contains(&self.update_rate_ms) {
            return Err(ConfigError::Invalid(format!(
                "update_rate_ms must be between {} and {}, got {}",
                MIN_UPDATE_RATE_MS, MAX_UPDATE_RATE_MS, self.update_rate_ms
            )));
        }

        if self.average_precision > MAX_AVERAGE_PRECISION {
            return Err(ConfigError::Invalid(format!(
                "average_precision must be at most {}, got {}",
                MAX_AVERAGE_PRECISION, self.average_precision
            )));
        }

        let mut seen = HashSet::new();
        for key in &self.keys {
            if !seen.insert(key.code) {
                return Err(ConfigError::Invalid(format!(
                    "key code {} ({}) is configured more than once",
                    key.code.value(),
                    key.name
                )));
            }
        }

        if self.stats.autosave {
            if self.stats.autosave_interval_ms == 0 {
                return Err(ConfigError::Invalid(
                    "autosave_interval_ms must be greater than zero".to_string(),
                ));
            }
            let format = &self.stats.autosave_format;
            if format.is_empty()
                || format.contains(['/', '\\', '?', '*', ':', '|', '"', '<', '>'])
                || StrftimeItems::new(format).any(|item| matches!(item, Item::Error))
            {
                return Err(ConfigError::Invalid(format!(
                    "autosave_format is not a valid file name pattern: {:?}",
                    format
                )));
            }
        }

        Ok(())
    }

    /// Loads the configuration at `path`, writing the defaults there first if
    /// the file does not exist yet.
    pub async fn load_or_create(path: &Path) -> Result<Self, ConfigError> {
        let exists = tokio::fs::try_exists(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;

        if !exists {
            info!("No configuration at {}, writing defaults", path.display());
            let config = EngineConfig::default();
            config.save(path).await?;
            return Ok(config);
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        let config = EngineConfig::from_toml(&content)?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|source| ConfigError::Write {
                        path: parent.to_path_buf(),
                        source,
                    })?;
            }
        }
        let content = self.to_toml()?;
        tokio::fs::write(path, content)
            .await
            .map_err(|source| ConfigError::Write {
                path: path.to_path_buf(),
                source,
            })?;
        debug!("Configuration written to {}", path.display());
        Ok(())
    }
}

pub fn default_config_path() -> PathBuf {
    match dirs::config_dir() {
        Some(dir) => dir.join(APP_DIR).join(CONFIG_FILE),
        None => {
            warn!("No user config directory, using working directory");
            PathBuf::from(CONFIG_FILE)
        }
    }
}

/// Where a reload fetches the current configuration from
pub trait ConfigSource: Send + Sync + 'static {
    /// Loads and validates a fresh configuration. Blocking.
    fn load(&self) -> Result<EngineConfig, ConfigError>;

    fn describe(&self) -> String;
}

/// TOML file on disk
#[derive(Debug, Clone)]
pub struct TomlConfigFile {
    path: PathBuf,
}

impl TomlConfigFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigSource for TomlConfigFile {
    fn load(&self) -> Result<EngineConfig, ConfigError> {
        let content = std::fs::read_to_string(&self.path).map_err(|source| ConfigError::Read {
            path: self.path.clone(),
            source,
        })?;
        EngineConfig::from_toml(&content)
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// In-memory configuration, replaced wholesale with [`MemoryConfig::set`]
#[derive(Debug, Clone, Default)]
pub struct MemoryConfig {
    inner: Arc<RwLock<EngineConfig>>,
}

impl MemoryConfig {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
        }
    }

    pub fn set(&self, config: EngineConfig) {
        match self.inner.write() {
            Ok(mut guard) => *guard = config,
            Err(poisoned) => *poisoned.into_inner() = config,
        }
    }
}

impl ConfigSource for MemoryConfig {
    fn load(&self) -> Result<EngineConfig, ConfigError> {
        let config = match self.inner.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        config.validate()?;
        Ok(config)
    }

    fn describe(&self) -> String {
        "in-memory configuration".to_string()
    }
}
