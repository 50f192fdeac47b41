//! Persisted service settings (`settings.json`).
//!
//! All defaults live here once; other modules read the current snapshot via
//! [`SettingsStore::get`]. Saving persists to disk first and refreshes the
//! in-memory copy only on success.

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};

/// Bounds on the per-task worker count.
pub const THREAD_COUNT_RANGE: std::ops::RangeInclusive<u32> = 1..=128;

/// Bounds on the global concurrent-download cap.
pub const MAX_CONCURRENT_RANGE: std::ops::RangeInclusive<u32> = 1..=10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// Directory new tasks download into when the request names none.
    pub default_output_path: String,
    /// Per-task segment worker count applied when the request names none.
    pub default_thread_count: u32,
    pub default_convert_to_mp4: bool,
    pub default_delete_ts: bool,
    /// Global cap on tasks in the Downloading state, 1..=10.
    pub max_concurrent_download: u32,
    /// Global download budget in KB/s; 0 disables the limiter.
    pub download_speed_limit: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_output_path: "./downloads".to_string(),
            default_thread_count: 25,
            default_convert_to_mp4: false,
            default_delete_ts: false,
            max_concurrent_download: 3,
            download_speed_limit: 0,
        }
    }
}

impl Settings {
    /// Clamp every numeric field into its legal range.
    pub fn clamped(mut self) -> Self {
        if !THREAD_COUNT_RANGE.contains(&self.default_thread_count) {
            self.default_thread_count = Settings::default().default_thread_count;
        }
        self.max_concurrent_download = self
            .max_concurrent_download
            .clamp(*MAX_CONCURRENT_RANGE.start(), *MAX_CONCURRENT_RANGE.end());
        self
    }
}

/// On-disk settings store with an in-memory cache.
#[derive(Debug)]
pub struct SettingsStore {
    path: PathBuf,
    current: RwLock<Settings>,
}

impl SettingsStore {
    /// Load settings from `path`, creating the file with defaults when it
    /// does not exist. A corrupt file falls back to defaults with a warning
    /// instead of refusing to start.
    pub fn load_or_create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let settings = if path.exists() {
            match Self::read_file(&path) {
                Ok(settings) => settings.clamped(),
                Err(error) => {
                    warn!(path = %path.display(), %error, "unreadable settings file, using defaults");
                    Settings::default()
                }
            }
        } else {
            let defaults = Settings::default();
            Self::write_file(&path, &defaults)?;
            defaults
        };

        Ok(Self {
            path,
            current: RwLock::new(settings),
        })
    }

    /// Current in-memory snapshot; never touches disk.
    pub fn get(&self) -> Settings {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Persist `settings` and refresh the cache.
    pub fn save(&self, settings: Settings) -> Result<()> {
        Self::write_file(&self.path, &settings)?;
        *self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = settings;
        Ok(())
    }

    fn read_file(path: &Path) -> Result<Settings> {
        let data = std::fs::read(path)?;
        Ok(serde_json::from_slice(&data)?)
    }

    fn write_file(path: &Path, settings: &Settings) -> Result<()> {
        let data = serde_json::to_vec_pretty(settings)?;
        std::fs::write(path, data).map_err(|e| {
            Error::config(format!(
                "failed to write settings file {}: {e}",
                path.display()
            ))
        })
    }
}
