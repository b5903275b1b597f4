//! Engine Settings Module
//!
//! Persistent engine configuration stored as `settings.json` in the config
//! directory. Loading never fails: a missing or unreadable file yields the
//! defaults, and every value is clamped into range before use.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::core::fs::atomic_write_json_pretty;
use crate::core::remote::{SubmitOptions, DEFAULT_BASE_URL, DEFAULT_REQUEST_TIMEOUT_SECS};
use crate::core::{CoreError, CoreResult};

/// Current settings schema version
pub const SETTINGS_VERSION: u32 = 1;

/// Settings file name
pub const SETTINGS_FILE: &str = "settings.json";

/// Advisory lock file guarding concurrent access to the settings file
pub const SETTINGS_LOCK_FILE: &str = "settings.json.lock";

/// Directory name under the platform config/data roots
pub const APP_DIR_NAME: &str = "desai";

const MIN_POLL_INTERVAL_SECS: u64 = 1;
const MAX_POLL_INTERVAL_SECS: u64 = 300;
const MAX_POLL_TIMEOUT_SECS: u64 = 86_400;
const MIN_REQUEST_TIMEOUT_SECS: u64 = 5;
const MAX_REQUEST_TIMEOUT_SECS: u64 = 3_600;

// =============================================================================
// Settings
// =============================================================================

/// Engine settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineSettings {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub remote: RemoteSettings,
    #[serde(default)]
    pub polling: PollingSettings,
    #[serde(default)]
    pub storage: StorageSettings,
    #[serde(default)]
    pub ffmpeg: FfmpegSettings,
}

fn default_version() -> u32 {
    SETTINGS_VERSION
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            version: SETTINGS_VERSION,
            remote: RemoteSettings::default(),
            polling: PollingSettings::default(),
            storage: StorageSettings::default(),
            ffmpeg: FfmpegSettings::default(),
        }
    }
}

impl EngineSettings {
    /// Corrects out-of-range values instead of failing, so an old or
    /// hand-edited file never stops the engine from starting.
    pub fn normalize(&mut self) {
        self.version = SETTINGS_VERSION;

        self.remote.base_url = self.remote.base_url.trim().trim_end_matches('/').to_string();
        if !(self.remote.base_url.starts_with("http://")
            || self.remote.base_url.starts_with("https://"))
        {
            self.remote.base_url = default_base_url();
        }
        if self.remote.app_bundle.trim().is_empty() {
            self.remote.app_bundle = default_app_bundle();
        }
        if self.remote.user_id.trim().is_empty() {
            self.remote.user_id = default_user_id();
        }
        self.remote.request_timeout_secs = self
            .remote
            .request_timeout_secs
            .clamp(MIN_REQUEST_TIMEOUT_SECS, MAX_REQUEST_TIMEOUT_SECS);
        self.remote.export_format = normalize_enum(
            &self.remote.export_format,
            &["mp3", "wav", "m4a"],
            default_export_format(),
        );

        self.polling.interval_secs = self
            .polling
            .interval_secs
            .clamp(MIN_POLL_INTERVAL_SECS, MAX_POLL_INTERVAL_SECS);
        self.polling.timeout_secs = self
            .polling
            .timeout_secs
            .clamp(self.polling.interval_secs, MAX_POLL_TIMEOUT_SECS);

        if self.storage.data_dir.as_os_str().is_empty() {
            self.storage.data_dir = default_data_dir();
        }

        self.ffmpeg.ffmpeg_path = self
            .ffmpeg
            .ffmpeg_path
            .take()
            .filter(|p| !p.as_os_str().is_empty());
        self.ffmpeg.ffprobe_path = self
            .ffmpeg
            .ffprobe_path
            .take()
            .filter(|p| !p.as_os_str().is_empty());
    }
}

fn normalize_enum(value: &str, allowed: &[&str], fallback: String) -> String {
    if allowed.iter().any(|v| v.eq_ignore_ascii_case(value)) {
        value.to_ascii_lowercase()
    } else {
        fallback
    }
}

/// Remote job processor connection
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteSettings {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_app_bundle")]
    pub app_bundle: String,
    #[serde(default = "default_user_id")]
    pub user_id: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_export_format")]
    pub export_format: String,
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_app_bundle() -> String {
    SubmitOptions::default().app_bundle
}

fn default_user_id() -> String {
    SubmitOptions::default().user_id
}

fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

fn default_export_format() -> String {
    SubmitOptions::default().export_format
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            app_bundle: default_app_bundle(),
            user_id: default_user_id(),
            request_timeout_secs: default_request_timeout_secs(),
            export_format: default_export_format(),
        }
    }
}

impl RemoteSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Status polling cadence
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollingSettings {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_interval_secs() -> u64 {
    5
}

fn default_timeout_secs() -> u64 {
    600
}

impl Default for PollingSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl PollingSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// On-disk locations
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageSettings {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl StorageSettings {
    /// SQLite job database
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("jobs.db")
    }

    /// Canonical artifact directory
    pub fn artifacts_dir(&self) -> PathBuf {
        self.data_dir.join("artifacts")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }
}

/// Explicit FFmpeg binaries; detection is used when unset
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FfmpegSettings {
    #[serde(default)]
    pub ffmpeg_path: Option<PathBuf>,
    #[serde(default)]
    pub ffprobe_path: Option<PathBuf>,
}

/// Platform data directory for the engine, falling back to the working directory
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR_NAME)
}

/// Platform config directory for the engine, falling back to the working directory
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR_NAME)
}

// =============================================================================
// Settings Manager
// =============================================================================

/// Loads, saves and resets the settings file
pub struct SettingsManager {
    settings_path: PathBuf,
}

impl SettingsManager {
    pub fn new(config_dir: PathBuf) -> Self {
        Self {
            settings_path: config_dir.join(SETTINGS_FILE),
        }
    }

    /// Manager over the platform config directory
    pub fn with_default_dir() -> Self {
        Self::new(default_config_dir())
    }

    fn lock_path(&self) -> PathBuf {
        self.settings_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(SETTINGS_LOCK_FILE)
    }

    fn with_lock<T>(&self, exclusive: bool, op: impl FnOnce() -> CoreResult<T>) -> CoreResult<T> {
        if let Some(parent) = self.settings_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let lock_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(self.lock_path())?;

        if exclusive {
            fs2::FileExt::lock_exclusive(&lock_file).map_err(|e| {
                CoreError::Internal(format!("Failed to lock settings file (exclusive): {}", e))
            })?;
        } else {
            fs2::FileExt::lock_shared(&lock_file).map_err(|e| {
                CoreError::Internal(format!("Failed to lock settings file (shared): {}", e))
            })?;
        }

        let result = op();

        if let Err(e) = fs2::FileExt::unlock(&lock_file) {
            warn!("Failed to unlock settings lock file: {}", e);
        }

        result
    }

    pub fn settings_path(&self) -> &Path {
        &self.settings_path
    }

    /// Loads settings, returning defaults if the file is missing or corrupt
    pub fn load(&self) -> EngineSettings {
        let result = self.with_lock(false, || {
            if !self.settings_path.exists() {
                info!("Settings file not found, using defaults");
                return Ok(EngineSettings::default());
            }

            let content = fs::read_to_string(&self.settings_path)?;
            let mut settings = serde_json::from_str::<EngineSettings>(&content)?;

            if settings.version < SETTINGS_VERSION {
                info!(
                    "Migrating settings from version {} to {}",
                    settings.version, SETTINGS_VERSION
                );
                settings = migrate(settings);
            }

            settings.normalize();
            Ok(settings)
        });

        match result {
            Ok(settings) => settings,
            Err(e) => {
                warn!("Failed to load settings, using defaults: {}", e);
                EngineSettings::default()
            }
        }
    }

    /// Normalizes and atomically writes `settings`, returning what was stored
    pub fn save(&self, settings: &EngineSettings) -> CoreResult<EngineSettings> {
        self.with_lock(true, || {
            let mut normalized = settings.clone();
            normalized.normalize();
            atomic_write_json_pretty(&self.settings_path, &normalized)?;
            info!("Settings saved to {:?}", self.settings_path);
            Ok(normalized)
        })
    }

    /// Deletes the settings file and returns the defaults
    pub fn reset(&self) -> CoreResult<EngineSettings> {
        self.with_lock(true, || {
            if self.settings_path.exists() {
                fs::remove_file(&self.settings_path)?;
                info!("Settings file deleted");
            }
            Ok(EngineSettings::default())
        })
    }
}

fn migrate(mut settings: EngineSettings) -> EngineSettings {
    settings.version = SETTINGS_VERSION;
    settings
}
