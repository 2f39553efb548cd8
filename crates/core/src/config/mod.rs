use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::Result;

/// Longest capture a single tempo estimate may listen for.
pub const MAX_CAPTURE_SECONDS: f32 = 60.0;

/// Top-level configuration structure for the application.
///
/// Every section falls back to its defaults, so an empty file (or no file at
/// all) yields the stock behaviour: 5 second captures, a 1 BPM hysteresis
/// evaluated once per second, and a 20 ms dim / 100 ms bright pulse.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub audio: AudioConfig,
    pub tempo: TempoConfig,
    pub pulse: PulseConfig,
    pub bridge: BridgeConfig,
}

impl AppConfig {
    /// Reads a TOML configuration file. A missing file is not an error and
    /// yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(?path, "no configuration file, using defaults");
            return Ok(Self::default());
        }

        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    /// Parses configuration from TOML text.
    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }
}

/// Capture and tempo estimation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Index into the host's input device list. `None` selects the default.
    pub device: Option<usize>,
    pub capture_seconds: f32,
    /// Calibration factor applied to every estimate before it is published.
    pub bpm_multiplier: f32,
    pub min_bpm: f32,
    pub max_bpm: f32,
    pub frame_size: usize,
    pub hop_size: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            device: None,
            capture_seconds: 5.0,
            bpm_multiplier: 1.0,
            min_bpm: 60.0,
            max_bpm: 180.0,
            frame_size: 1024,
            hop_size: 512,
        }
    }
}

impl AudioConfig {
    /// Returns the length of one capture, clamped to
    /// `0..=`[`MAX_CAPTURE_SECONDS`]. `NaN` counts as zero.
    pub fn capture_window(&self) -> Duration {
        Duration::from_secs_f32(self.capture_seconds.max(0.0).min(MAX_CAPTURE_SECONDS))
    }
}

/// Hysteresis settings for the tempo stabilizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TempoConfig {
    pub hysteresis_bpm: f32,
    pub tick_ms: u64,
}

impl Default for TempoConfig {
    fn default() -> Self {
        Self {
            hysteresis_bpm: 1.0,
            tick_ms: 1000,
        }
    }
}

impl TempoConfig {
    /// Returns how often the stabilizer looks at the latest estimate.
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

/// Shape of the pulse emitted once per beat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PulseConfig {
    pub light_id: String,
    pub dim_brightness: u8,
    pub full_brightness: u8,
    pub dim_hold_ms: u64,
    /// Time the light stays at full brightness. Also the slack subtracted from
    /// the beat period when computing the inter-beat sleep.
    pub on_hold_ms: u64,
    pub transition_ticks: u16,
}

impl Default for PulseConfig {
    fn default() -> Self {
        Self {
            light_id: "1".to_string(),
            dim_brightness: 51,
            full_brightness: 254,
            dim_hold_ms: 20,
            on_hold_ms: 100,
            transition_ticks: 1,
        }
    }
}

impl PulseConfig {
    pub fn dim_hold(&self) -> Duration {
        Duration::from_millis(self.dim_hold_ms)
    }

    pub fn on_hold(&self) -> Duration {
        Duration::from_millis(self.on_hold_ms)
    }
}

/// Bridge bootstrap settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Two-line credential cache: bridge address, then username.
    pub cache_path: String,
    pub discovery_url: String,
    pub device_type: String,
    pub pairing_timeout_secs: u64,
    pub pairing_poll_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            cache_path: "hue_bridge.txt".to_string(),
            discovery_url: "https://discovery.meethue.com".to_string(),
            device_type: "hue_tempo#cli".to_string(),
            pairing_timeout_secs: 15,
            pairing_poll_ms: 250,
            request_timeout_ms: 2000,
        }
    }
}

impl BridgeConfig {
    pub fn pairing_timeout(&self) -> Duration {
        Duration::from_secs(self.pairing_timeout_secs)
    }

    pub fn pairing_poll(&self) -> Duration {
        Duration::from_millis(self.pairing_poll_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_stock_defaults() {
        let config = AppConfig::from_toml("").unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.pulse.on_hold(), Duration::from_millis(100));
        assert_eq!(config.tempo.tick(), Duration::from_secs(1));
        assert_eq!(config.audio.capture_window(), Duration::from_secs(5));
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let config = AppConfig::from_toml(
            r#"
            [pulse]
            light_id = "3"

            [audio]
            bpm_multiplier = 2.0
            "#,
        )
        .unwrap();

        assert_eq!(config.pulse.light_id, "3");
        assert_eq!(config.pulse.full_brightness, 254);
        assert_eq!(config.audio.bpm_multiplier, 2.0);
        assert_eq!(config.audio.hop_size, 512);
    }

    #[test]
    fn capture_window_is_clamped() {
        let window = |capture_seconds| {
            AudioConfig {
                capture_seconds,
                ..AudioConfig::default()
            }
            .capture_window()
        };

        assert_eq!(window(f32::INFINITY), Duration::from_secs(60));
        assert_eq!(window(1e30), Duration::from_secs(60));
        assert_eq!(window(-2.0), Duration::ZERO);
        assert_eq!(window(f32::NAN), Duration::ZERO);
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn malformed_file_reports_config_error() {
        let err = AppConfig::from_toml("[tempo]\ntick_ms = \"soon\"").unwrap_err();
        assert!(matches!(err, crate::HueTempoError::Config(_)));
    }
}
