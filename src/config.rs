//! Configuration
//!
//! All sections deserialize with defaults, so a partial TOML file only
//! overrides what it names.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::*;
use crate::error::ConfigError;
use crate::media::{AudioFrame, VideoFrame};

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub catalog: CatalogConfig,
    pub pipeline: PipelineConfig,
    pub network: NetworkConfig,
    pub session: SessionConfig,
}

impl AppConfig {
    /// Default config file location (`<config dir>/media-link/config.toml`)
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        directories::ProjectDirs::from("", "", "media-link")
            .map(|dirs| dirs.config_dir().join("config.toml"))
            .ok_or(ConfigError::NoConfigDir)
    }

    /// Load and validate a config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: AppConfig = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from the default location, falling back to defaults if absent or unreadable
    pub fn load_or_default() -> Self {
        let path = match Self::default_path() {
            Ok(path) if path.exists() => path,
            _ => return Self::default(),
        };
        match Self::load(&path) {
            Ok(config) => {
                tracing::info!("Loaded config from {}", path.display());
                config
            }
            Err(e) => {
                tracing::warn!("Ignoring config {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let text = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Read {
                path: parent.display().to_string(),
                source,
            })?;
        }
        std::fs::write(path, text).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.network.max_packet_size <= FRAME_HEADER_LEN {
            return Err(ConfigError::Invalid {
                field: "network.max_packet_size",
                reason: format!("must exceed the {}-byte frame header", FRAME_HEADER_LEN),
            });
        }
        if self.network.max_frame_size < self.network.max_packet_size {
            return Err(ConfigError::Invalid {
                field: "network.max_frame_size",
                reason: "must be at least max_packet_size".into(),
            });
        }
        if self.pipeline.high_watermark_ms < self.pipeline.low_watermark_ms {
            return Err(ConfigError::Invalid {
                field: "pipeline.high_watermark_ms",
                reason: "must not be below low_watermark_ms".into(),
            });
        }
        if self.session.flow_window_bytes == 0 {
            return Err(ConfigError::Invalid {
                field: "session.flow_window_bytes",
                reason: "must be positive".into(),
            });
        }
        Ok(())
    }
}

/// Stream catalog settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// Upper bound on packets read while scanning for missing stream fields
    pub max_probe_packets: usize,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self { max_probe_packets: DEFAULT_MAX_PROBE_PACKETS }
    }
}

/// Decode pipeline settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Memory budget for decoded video frames
    pub video_queue_mb: f64,
    /// Memory budget for decoded audio chunks
    pub audio_queue_mb: f64,
    /// Compressed packets buffered per stream
    pub packet_queue_capacity: usize,
    /// Packets the producer may hold for the network before the extractor waits
    pub outbound_queue_capacity: usize,
    pub poll_interval_ms: u64,
    pub low_watermark_ms: u64,
    pub high_watermark_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            video_queue_mb: DEFAULT_VIDEO_QUEUE_MB,
            audio_queue_mb: DEFAULT_AUDIO_QUEUE_MB,
            packet_queue_capacity: DEFAULT_PACKET_QUEUE_CAPACITY,
            outbound_queue_capacity: DEFAULT_OUTBOUND_QUEUE_CAPACITY,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            low_watermark_ms: DEFAULT_LOW_WATERMARK_MS,
            high_watermark_ms: DEFAULT_HIGH_WATERMARK_MS,
        }
    }
}

impl PipelineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn low_watermark_us(&self) -> i64 {
        self.low_watermark_ms as i64 * 1_000
    }

    pub fn high_watermark_us(&self) -> i64 {
        self.high_watermark_ms as i64 * 1_000
    }

    /// Frame-count capacity of the video queue for the given picture size
    pub fn video_frame_capacity(&self, width: u32, height: u32) -> usize {
        let bytes = VideoFrame::byte_size(width.max(1), height.max(1));
        budget_to_count(self.video_queue_mb, bytes)
    }

    /// Chunk-count capacity of the audio queue for the given chunk layout
    pub fn audio_frame_capacity(&self, channels: u16, samples_per_chunk: u32) -> usize {
        let bytes = channels.max(1) as usize * samples_per_chunk.max(1) as usize * AudioFrame::BYTES_PER_SAMPLE;
        budget_to_count(self.audio_queue_mb, bytes)
    }
}

fn budget_to_count(megabytes: f64, item_bytes: usize) -> usize {
    let budget = (megabytes.max(0.0) * 1024.0 * 1024.0) as usize;
    (budget / item_bytes.max(1)).max(MIN_FRAME_QUEUE_CAPACITY)
}

/// Transport settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub bind_address: String,
    pub port: u16,
    /// Largest physical frame written to the socket; larger messages are split
    pub max_packet_size: usize,
    /// Largest physical frame accepted from the socket
    pub max_frame_size: usize,
    pub nodelay: bool,
    pub keepalive_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            nodelay: true,
            keepalive_secs: 10,
        }
    }
}

/// Streaming session settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Unacknowledged bytes allowed in flight
    pub flow_window_bytes: u64,
    /// Minimum spacing between POSITION echoes
    pub position_interval_ms: u64,
    pub poll_interval_ms: u64,
    /// Packets moved from the pipeline into the send queue per pump iteration
    pub refill_batch: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            flow_window_bytes: DEFAULT_FLOW_WINDOW_BYTES,
            position_interval_ms: DEFAULT_POSITION_INTERVAL_MS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            refill_batch: 64,
        }
    }
}

impl SessionConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn position_interval(&self) -> Duration {
        Duration::from_millis(self.position_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.network.max_packet_size, 1024);
        assert_eq!(config.pipeline.low_watermark_us(), 1_000_000);
        assert_eq!(config.pipeline.high_watermark_us(), 5_000_000);
    }

    #[test]
    fn test_partial_toml_overrides() {
        let config: AppConfig = toml::from_str(
            r#"
            [network]
            max_packet_size = 4096

            [session]
            flow_window_bytes = 65536
            "#,
        )
        .unwrap();
        assert_eq!(config.network.max_packet_size, 4096);
        assert_eq!(config.network.port, DEFAULT_PORT);
        assert_eq!(config.session.flow_window_bytes, 65536);
        assert_eq!(config.pipeline, PipelineConfig::default());
    }

    #[test]
    fn test_invalid_packet_size_rejected() {
        let mut config = AppConfig::default();
        config.network.max_packet_size = 8;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = AppConfig::default();
        config.pipeline.video_queue_mb = 12.5;
        config.save(&path).unwrap();
        assert_eq!(AppConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_queue_capacity_from_budget() {
        let config = PipelineConfig { video_queue_mb: 1.0, audio_queue_mb: 1.0, ..Default::default() };
        // 1 MiB / (64 * 64 * 4) bytes
        assert_eq!(config.video_frame_capacity(64, 64), 64);
        // 1 MiB / (2 * 1024 * 2) bytes
        assert_eq!(config.audio_frame_capacity(2, 1024), 256);
        // huge frames still get the minimum
        assert_eq!(config.video_frame_capacity(8192, 8192), MIN_FRAME_QUEUE_CAPACITY);
    }
}
