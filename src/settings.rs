use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::streaming::{TransportConfig, DEFAULT_SERVER_URL};

const SETTINGS_DIR_NAME: &str = "monkeyread";
const SETTINGS_FILE_NAME: &str = "settings.json";

/// Environment override for the server endpoint (read by the CLI)
pub const SERVER_URL_ENV: &str = "MONKEYREAD_SERVER_URL";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Could not determine config directory")]
    NoConfigDir,
    #[error("Settings I/O on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Serialize settings: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("Invalid setting: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// Reading-server WebSocket endpoint.
    pub server_url: String,

    /// Samples per outbound audio frame. Constant for a capture session.
    pub frame_size: usize,

    /// Capture sample rate in Hz. The server expects 16 kHz mono.
    pub sample_rate: u32,

    /// Reconnect attempts after an unexpected closure before giving up.
    pub max_reconnect_attempts: u32,

    /// Fixed spacing between reconnect attempts.
    pub reconnect_interval_ms: u64,

    /// WebSocket handshake timeout.
    pub connect_timeout_ms: u64,

    /// Frames that may wait for the socket before new ones are dropped.
    pub outbound_queue_frames: usize,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            frame_size: 1024,
            sample_rate: 16000,
            max_reconnect_attempts: 5,
            reconnect_interval_ms: 1000,
            connect_timeout_ms: 10_000,
            outbound_queue_frames: 32,
        }
    }
}

impl AppSettings {
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.frame_size == 0 {
            return Err(SettingsError::Invalid("frame_size must be > 0".to_string()));
        }
        if self.sample_rate == 0 {
            return Err(SettingsError::Invalid("sample_rate must be > 0".to_string()));
        }
        if !(self.server_url.starts_with("ws://") || self.server_url.starts_with("wss://")) {
            return Err(SettingsError::Invalid(format!(
                "server_url must be ws:// or wss://, got {:?}",
                self.server_url
            )));
        }
        Ok(())
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            url: self.server_url.clone(),
            max_reconnect_attempts: self.max_reconnect_attempts,
            reconnect_interval: Duration::from_millis(self.reconnect_interval_ms),
            outbound_queue_frames: self.outbound_queue_frames,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

pub fn default_settings_path() -> Result<PathBuf, SettingsError> {
    let dir = dirs::config_dir().ok_or(SettingsError::NoConfigDir)?;
    Ok(dir.join(SETTINGS_DIR_NAME).join(SETTINGS_FILE_NAME))
}

/// Load settings, falling back to defaults on a missing or unreadable file.
pub fn load_settings(path: &Path) -> AppSettings {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<AppSettings>(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("Settings: failed to parse {:?}: {}", path, e);
                AppSettings::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => AppSettings::default(),
        Err(e) => {
            log::warn!("Settings: failed to read {:?}: {}", path, e);
            AppSettings::default()
        }
    }
}

pub fn save_settings(path: &Path, settings: &AppSettings) -> Result<(), SettingsError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| SettingsError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let contents = serde_json::to_string_pretty(settings)?;

    // Write to a sibling temp file, then rename over the target.
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &contents).map_err(|source| SettingsError::Io {
        path: tmp_path.clone(),
        source,
    })?;

    // Windows rename fails if the destination exists.
    if cfg!(windows) && path.exists() {
        if let Err(source) = std::fs::remove_file(path) {
            if source.kind() != std::io::ErrorKind::NotFound {
                return Err(SettingsError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        }
    }

    std::fs::rename(&tmp_path, path).map_err(|source| SettingsError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(())
}
