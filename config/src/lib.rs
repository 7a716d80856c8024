// SPDX-License-Identifier: MPL-2.0

pub mod state;

use std::{path::PathBuf, time::Duration};

use cosmic_config::{
    Config as CosmicConfig, CosmicConfigEntry, cosmic_config_derive::CosmicConfigEntry,
};
use derive_setters::Setters;
use serde::{Deserialize, Serialize};

pub const NAME: &str = "com.system76.CosmicBackgroundVideo";

/// Daemon settings, shared with the control surface through cosmic-config.
///
/// `paused` and `selection` are written by the control surface and watched by
/// the daemon; everything else tunes the playback session.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq, Setters, CosmicConfigEntry)]
#[serde(deny_unknown_fields)]
#[must_use]
pub struct Config {
    /// root directory of the video catalog
    #[setters(skip)]
    pub source: PathBuf,
    /// delay before surfaces are rebuilt after a topology or power change
    pub debounce_ms: u64,
    /// how long a stalled engine may take to recover on its own
    pub stall_grace_ms: u64,
    /// period of the frozen playback health check
    pub health_check_interval_ms: u64,
    /// local sources smaller than this are treated as incomplete downloads
    pub min_source_bytes: u64,
    /// forward seek applied when frozen playback is detected
    pub freeze_nudge_ms: u64,
    /// failed attempts in a row before the session gives up and idles
    pub max_consecutive_failures: u32,
    /// control loop period for engine events and frame presentation
    pub tick_interval_ms: u64,
    /// upper bound for the asynchronous media probe
    pub probe_timeout_ms: u64,
    /// pause requested by the control surface
    pub paused: bool,
    /// asset id selected by the control surface
    pub selection: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source: default_source(),
            debounce_ms: 1500,
            stall_grace_ms: 3000,
            health_check_interval_ms: 10_000,
            min_source_bytes: 100 * 1024,
            freeze_nudge_ms: 100,
            max_consecutive_failures: 8,
            tick_interval_ms: 16,
            probe_timeout_ms: 5000,
            paused: false,
            selection: None,
        }
    }
}

fn default_source() -> PathBuf {
    dirs::video_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join("Videos")))
        .unwrap_or_else(|| PathBuf::from("/usr/share/backgrounds"))
        .join("Wallpapers")
}

impl Config {
    pub fn version() -> u64 {
        1
    }

    /// Convenience function for cosmic-config
    ///
    /// # Errors
    ///
    /// Fails if cosmic-config paths are missing or cannot be created.
    pub fn helper() -> Result<CosmicConfig, cosmic_config::Error> {
        CosmicConfig::new(NAME, Self::version())
    }

    /// Load the config, falling back to defaults for keys that are missing or invalid.
    pub fn load(context: &CosmicConfig) -> Self {
        match Self::get_entry(context) {
            Ok(config) => config,
            Err((errors, config)) => {
                for why in errors {
                    tracing::warn!(?why, "config key could not be loaded, using default");
                }
                config
            }
        }
    }

    #[must_use]
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    #[must_use]
    pub fn stall_grace(&self) -> Duration {
        Duration::from_millis(self.stall_grace_ms)
    }

    #[must_use]
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    #[must_use]
    pub fn freeze_nudge(&self) -> Duration {
        Duration::from_millis(self.freeze_nudge_ms)
    }

    #[must_use]
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    #[must_use]
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}
