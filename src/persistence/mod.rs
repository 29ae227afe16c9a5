//! Statistics persistence
//!
//! Saves and loads the aggregate statistics and per-key totals as TOML.
//! Saving is best effort: a failed write is reported to the caller and
//! never touches the in-memory statistics.
//!
//! Three triggers exist, all driven by [`StatsSavingSettings`]:
//! - load on launch from `save_file`
//! - save on exit to `save_file`
//! - periodic autosave into `autosave_dest`, one timestamped file per save

use crate::config::StatsSavingSettings;
use crate::engine::Engine;
use crate::input::ExtendedCode;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse statistics: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize statistics: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid file name pattern: {0}")]
    InvalidFormat(String),
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct PersistedKey {
    pub code: ExtendedCode,
    pub name: String,
    pub count: u64,
    #[serde(default = "default_visible")]
    pub visible: bool,
}

fn default_visible() -> bool {
    true
}

/// Saved statistics. `seconds` is the number of non-idle samples that went
/// into `average`, `current` the presses of the interval in progress.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct PersistedStats {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub saved_at: Option<DateTime<Local>>,
    pub total: u64,
    pub average: f64,
    pub maximum: u64,
    pub seconds: u64,
    pub previous: u64,
    pub current: u64,
    pub keys: Vec<PersistedKey>,
}

impl PersistedStats {
    pub fn from_toml(content: &str) -> Result<Self, PersistenceError> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml(&self) -> Result<String, PersistenceError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

pub async fn save_stats(path: &Path, stats: &PersistedStats) -> Result<(), PersistenceError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty()
            && !tokio::fs::try_exists(parent)
                .await
                .map_err(|source| PersistenceError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| PersistenceError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }
    }

    let content = stats.to_toml()?;
    tokio::fs::write(path, content)
        .await
        .map_err(|source| PersistenceError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    debug!("Statistics written to {}", path.display());
    Ok(())
}

pub async fn load_stats(path: &Path) -> Result<PersistedStats, PersistenceError> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| PersistenceError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    PersistedStats::from_toml(&content)
}

/// File name for an autosave taken at `now`
pub fn autosave_path(dest: &Path, format: &str, now: DateTime<Local>) -> Result<PathBuf, PersistenceError> {
    let mut name = String::new();
    write!(name, "{}", now.format(format))
        .map_err(|_| PersistenceError::InvalidFormat(format.to_string()))?;
    if name.is_empty() {
        return Err(PersistenceError::InvalidFormat(format.to_string()));
    }
    Ok(dest.join(name))
}

/// Restores `save_file` into the engine when `load_on_launch` is set.
/// Returns whether anything was loaded.
pub async fn load_on_launch(engine: &Engine, settings: &StatsSavingSettings) -> Result<bool, PersistenceError> {
    if !settings.load_on_launch {
        return Ok(false);
    }
    let exists = tokio::fs::try_exists(&settings.save_file)
        .await
        .map_err(|source| PersistenceError::Io {
            path: settings.save_file.clone(),
            source,
        })?;
    if !exists {
        info!("No saved statistics at {}", settings.save_file.display());
        return Ok(false);
    }

    let stats = load_stats(&settings.save_file).await?;
    if let Err(e) = engine.restore(&stats) {
        warn!("Failed to restore saved statistics: {}", e);
        return Ok(false);
    }
    info!("Statistics loaded from {}", settings.save_file.display());
    Ok(true)
}

/// Writes the engine statistics to `save_file` when `save_on_exit` is set
pub async fn save_on_exit(engine: &Engine, settings: &StatsSavingSettings) -> Result<bool, PersistenceError> {
    if !settings.save_on_exit {
        return Ok(false);
    }
    save_stats(&settings.save_file, &engine.persisted_stats()).await?;
    info!("Statistics saved to {}", settings.save_file.display());
    Ok(true)
}

/// Periodically saves the engine statistics. Settings are re-read from the
/// engine every round so reloads take effect without a restart.
pub fn start_autosave_task(engine: Engine, cancel: CancellationToken) -> JoinHandle<()> {
    info!("Starting autosave task");

    tokio::spawn(async move {
        loop {
            let settings = engine.config().stats;
            let period = Duration::from_millis(settings.autosave_interval_ms.max(1));

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(period) => {}
            }

            if !settings.autosave {
                continue;
            }
            let path = match autosave_path(&settings.autosave_dest, &settings.autosave_format, Local::now()) {
                Ok(path) => path,
                Err(e) => {
                    error!("Failed to build autosave path: {}", e);
                    continue;
                }
            };
            if let Err(e) = save_stats(&path, &engine.persisted_stats()).await {
                error!("Failed to autosave statistics: {}", e);
            } else {
                debug!("Statistics autosaved to {}", path.display());
            }
        }
        debug!("Autosave task finished");
    })
}
