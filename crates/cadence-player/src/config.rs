//! Player configuration.
//!
//! Read from `config.toml` in the platform config directory when present.
//! Command-line flags override individual fields afterwards.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use anyhow::{Context, Result};
use cadence_audio::{CoordinatorConfig, SinkKind, StreamOptions};
use cadence_core::{AudioFormat, DataFormat};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    /// Output backend.
    pub sink: SinkKind,
    /// Device name, "default" for the system default.
    pub device: String,
    /// Requested device rate in Hz.
    pub sample_rate: u32,
    pub channels: usize,
    /// Requested device encoding; the sink may pick another.
    pub data_format: DataFormat,
    /// Overlap between consecutive files.
    pub crossfade_ms: u64,
    pub force_resample: bool,
    pub free_on_drain: bool,
    /// Open the first file paused.
    pub start_paused: bool,
    /// Upper bound between coordinator ticks.
    pub tick_interval_ms: u64,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            sink: SinkKind::Cpal,
            device: "default".to_string(),
            sample_rate: 48000,
            channels: 2,
            data_format: DataFormat::Float,
            crossfade_ms: 0,
            force_resample: false,
            free_on_drain: false,
            start_paused: false,
            tick_interval_ms: 20,
        }
    }
}

impl PlayerConfig {
    /// Default location of the config file.
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("com", "cadence", "Cadence")
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE))
    }

    /// Load `path`, or the default location when `None`.
    ///
    /// A missing default file yields the defaults; a missing explicit file
    /// is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => match Self::default_path() {
                Some(path) => (path, false),
                None => {
                    debug!("No config directory on this platform");
                    return Ok(Self::default());
                }
            },
        };

        if !explicit && !path.exists() {
            debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config = Self::from_toml(&text)
            .with_context(|| format!("Invalid config in {}", path.display()))?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            anyhow::bail!("sample_rate must be positive");
        }
        if !(1..=8).contains(&self.channels) {
            anyhow::bail!("channels must be between 1 and 8, got {}", self.channels);
        }
        if self.data_format.is_raw() {
            anyhow::bail!("data_format must be a PCM encoding");
        }
        if self.tick_interval_ms == 0 {
            anyhow::bail!("tick_interval_ms must be positive");
        }
        Ok(())
    }

    /// Format requested from the sink.
    pub const fn output_format(&self) -> AudioFormat {
        AudioFormat::new(self.data_format, self.sample_rate, self.channels)
    }

    pub const fn stream_options(&self) -> StreamOptions {
        StreamOptions {
            free_on_drain: self.free_on_drain,
            force_resample: self.force_resample,
            paused: self.start_paused,
        }
    }

    pub const fn crossfade(&self) -> Duration {
        Duration::from_millis(self.crossfade_ms)
    }

    pub const fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub const fn coordinator(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            crossfade: self.crossfade(),
            stream_options: self.stream_options(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_round_trip() {
        let config = PlayerConfig::default();
        let text = config.to_toml().unwrap();
        assert_eq!(PlayerConfig::from_toml(&text).unwrap(), config);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = PlayerConfig::from_toml(
            r#"
            sink = "null"
            crossfade_ms = 3000
            data_format = "s16le"
            "#,
        )
        .unwrap();
        assert_eq!(config.sink, SinkKind::Null);
        assert_eq!(config.crossfade(), Duration::from_secs(3));
        assert_eq!(config.data_format, DataFormat::S16Le);
        assert_eq!(config.sample_rate, 48000);
        assert_eq!(config.device, "default");
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(PlayerConfig::from_toml("channels = 0").is_err());
        assert!(PlayerConfig::from_toml("sample_rate = 0").is_err());
        assert!(PlayerConfig::from_toml(r#"data_format = "ac3""#).is_err());
        assert!(PlayerConfig::from_toml(r#"sink = "pulse""#).is_err());
    }

    #[test]
    fn test_stream_options() {
        let config = PlayerConfig {
            free_on_drain: true,
            start_paused: true,
            ..PlayerConfig::default()
        };
        let options = config.stream_options();
        assert!(options.free_on_drain);
        assert!(options.paused);
        assert!(!options.force_resample);
        assert_eq!(config.coordinator().crossfade, Duration::ZERO);
    }

    #[test]
    fn test_output_format() {
        let format = PlayerConfig::default().output_format();
        assert_eq!(format.sample_rate, 48000);
        assert_eq!(format.channel_count, 2);
        assert_eq!(format.data_format, DataFormat::Float);
    }

    #[test]
    fn test_missing_explicit_file_fails() {
        assert!(PlayerConfig::load(Some(Path::new("/nonexistent/cadence.toml"))).is_err());
    }
}
