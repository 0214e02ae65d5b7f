//! Configuration for the vidmap daemon.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use vidmap_core::SessionConfig;

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Network settings.
    pub network: NetworkConfig,
    /// Media locations.
    pub media: MediaConfig,
    /// Companion audio-bundle side channel.
    pub assets: AssetConfig,
    /// Streaming behavior.
    pub stream: StreamConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the viewer listener binds to.
    pub listen_addr: String,
}

/// Media locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// Directory `start <file>` resolves against.
    pub videos_dir: PathBuf,
    /// Palette lookup table for the native decoder.
    pub lut_path: PathBuf,
}

/// Companion audio-bundle side channel (served externally).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssetConfig {
    /// URL viewers fetch the packaged bundle from. Empty disables the
    /// first-frame announcement.
    pub bundle_url: String,
    /// Local path of the packaged bundle, hashed at startup.
    pub bundle_path: PathBuf,
}

/// Streaming behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Floor in milliseconds below which a frame delay clamps to zero.
    pub minimum_delay_ms: u64,
    /// Graceful-shutdown budget in milliseconds for session teardown.
    pub teardown_budget_ms: u64,
    /// Display id assigned to tile index 0.
    pub start_display_id: i32,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            media: MediaConfig::default(),
            assets: AssetConfig::default(),
            stream: StreamConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:25570".into(),
        }
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            videos_dir: PathBuf::from("videos"),
            lut_path: PathBuf::from("lut.dat"),
        }
    }
}

impl Default for AssetConfig {
    fn default() -> Self {
        Self {
            bundle_url: String::new(),
            bundle_path: PathBuf::from("audio-pack.zip"),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            minimum_delay_ms: 3,
            teardown_budget_ms: 5_000,
            start_display_id: 0,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl ServerConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Convert streaming settings into a `SessionConfig`.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            minimum_delay: Duration::from_millis(self.stream.minimum_delay_ms),
            teardown_budget: Duration::from_millis(self.stream.teardown_budget_ms.max(1)),
            start_display_id: self.stream.start_display_id,
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
