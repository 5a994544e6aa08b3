//! Configuration management

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::clock::ClockMode;
use crate::constants::*;
use crate::format::BitDepth;

/// Application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Capture configuration
    pub audio: AudioConfig,

    /// Spectrum analysis configuration
    pub analysis: AnalysisConfig,

    /// Passthrough playback configuration
    pub playback: PlaybackConfig,
}

/// Capture configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Input device name, default device when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_device: Option<String>,

    /// Sample rates tried in order
    pub sample_rates: Vec<u32>,

    pub channels: u16,

    pub bit_depth: BitDepth,

    pub signed: bool,

    /// Ring buffer length in seconds
    pub buffer_duration_secs: u64,

    /// Bytes buffered before the capture side posts a fill notification
    pub fill_threshold_bytes: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_device: None,
            sample_rates: PRIORITIZED_SAMPLE_RATES.to_vec(),
            channels: DEFAULT_CHANNELS,
            bit_depth: BitDepth::Sixteen,
            signed: true,
            buffer_duration_secs: DEFAULT_BUFFER_DURATION_SECS,
            fill_threshold_bytes: FILL_THRESHOLD_BYTES,
        }
    }
}

impl AudioConfig {
    pub fn buffer_duration(&self) -> Duration {
        Duration::from_secs(self.buffer_duration_secs)
    }
}

/// How the analysis clock is paced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ClockConfig {
    Interval { interval_ms: u64 },
    BufferThreshold { threshold_bytes: usize, poll_ms: u64 },
}

impl Default for ClockConfig {
    fn default() -> Self {
        ClockConfig::Interval {
            interval_ms: DEFAULT_TICK_INTERVAL_MS,
        }
    }
}

impl ClockConfig {
    pub fn to_mode(self) -> ClockMode {
        match self {
            ClockConfig::Interval { interval_ms } => {
                ClockMode::Interval(Duration::from_millis(interval_ms))
            }
            ClockConfig::BufferThreshold {
                threshold_bytes,
                poll_ms,
            } => ClockMode::BufferThreshold {
                threshold_bytes,
                poll: Duration::from_millis(poll_ms),
            },
        }
    }
}

/// Spectrum analysis configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Samples per transform
    pub fft_size: usize,

    pub clock: ClockConfig,

    /// Lowest frequency reported (Hz)
    pub min_frequency: f64,

    /// Highest frequency reported (Hz), clamped to Nyquist
    pub max_frequency: f64,

    /// Number of log-spaced bands printed per snapshot
    pub bands: usize,

    /// Level reported for bands with no energy
    pub floor_db: f64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            fft_size: DEFAULT_FFT_SIZE,
            clock: ClockConfig::default(),
            min_frequency: 20.0,
            max_frequency: 20_000.0,
            bands: 16,
            floor_db: -120.0,
        }
    }
}

impl AnalysisConfig {
    /// Log-spaced band edges between the configured limits
    pub fn band_edges(&self, sample_rate: u32) -> Vec<f64> {
        let nyquist = sample_rate as f64 / 2.0;
        let low = self.min_frequency.max(1.0);
        let high = self.max_frequency.min(nyquist);
        if self.bands == 0 || high <= low {
            return Vec::new();
        }
        let ratio = (high / low).powf(1.0 / self.bands as f64);
        (0..=self.bands).map(|i| low * ratio.powi(i as i32)).collect()
    }
}

/// Passthrough playback configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Forward captured audio to an output device
    pub enabled: bool,

    /// Output device name, default device when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_device: Option<String>,

    /// Time an underflow may persist before it is reported as timed out
    pub fill_timeout_ms: u64,

    /// Maximum audio held for the output side
    pub latency_ms: u64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            output_device: None,
            fill_timeout_ms: DEFAULT_FILL_TIMEOUT_MS,
            latency_ms: DEFAULT_LATENCY_MS,
        }
    }
}

impl PlaybackConfig {
    pub fn fill_timeout(&self) -> Duration {
        Duration::from_millis(self.fill_timeout_ms)
    }

    pub fn latency(&self) -> Duration {
        Duration::from_millis(self.latency_ms)
    }
}

impl AppConfig {
    /// Load configuration from file
    pub fn load(path: &PathBuf) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(e.to_string()))?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &PathBuf) -> crate::Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get default config file path
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "spectro", "spectro")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_constants() {
        let config = AppConfig::default();
        assert_eq!(config.audio.sample_rates, vec![48000, 44100]);
        assert_eq!(config.audio.bit_depth, BitDepth::Sixteen);
        assert_eq!(config.analysis.fft_size, 1024);
        assert_eq!(
            config.analysis.clock.to_mode(),
            ClockMode::Interval(Duration::from_millis(10))
        );
        assert_eq!(config.playback.fill_timeout(), Duration::from_millis(100));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [audio]
            channels = 1
            bit_depth = 24

            [analysis.clock]
            mode = "buffer_threshold"
            threshold_bytes = 8192
            poll_ms = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.audio.channels, 1);
        assert_eq!(config.audio.bit_depth, BitDepth::TwentyFour);
        assert_eq!(config.audio.buffer_duration(), Duration::from_secs(30));
        assert_eq!(
            config.analysis.clock.to_mode(),
            ClockMode::BufferThreshold {
                threshold_bytes: 8192,
                poll: Duration::from_millis(5),
            }
        );
        assert!(!config.playback.enabled);
    }

    #[test]
    fn test_invalid_bit_depth_rejected() {
        let result: Result<AppConfig, _> = toml::from_str("[audio]\nbit_depth = 20\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_save_and_load() {
        let path = std::env::temp_dir()
            .join(format!("spectro-config-{}", std::process::id()))
            .join("config.toml");
        let mut config = AppConfig::default();
        config.playback.enabled = true;
        config.audio.input_device = Some("Line In".to_string());

        config.save(&path).unwrap();
        let loaded = AppConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_band_edges() {
        let analysis = AnalysisConfig {
            min_frequency: 100.0,
            max_frequency: 100_000.0,
            bands: 3,
            ..Default::default()
        };
        // Clamped to Nyquist of 8 kHz → 100..4000
        let edges = analysis.band_edges(8000);
        assert_eq!(edges.len(), 4);
        assert!((edges[0] - 100.0).abs() < 1e-9);
        assert!((edges[3] - 4000.0).abs() < 1e-6);
        assert!(analysis.band_edges(100).is_empty());
    }
}
