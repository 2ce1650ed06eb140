//! Application configuration
//!
//! Loaded from TOML. Every field has a default so a partial file, or no file
//! at all, is valid.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::audio::engine::{StreamSettings, TransmissionMode};
use crate::codec::{self, CodecKind};
use crate::constants::*;
use crate::error::{Error, Result};

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub audio: AudioConfig,
    pub network: NetworkConfig,
    pub opus: OpusConfig,
}

impl AppConfig {
    /// `<config dir>/lan-intercom/intercom.toml`
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "lan-intercom")
            .map(|dirs| dirs.config_dir().join("intercom.toml"))
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    /// Load the default file if it exists, defaults otherwise
    pub fn load_or_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => {
                tracing::info!("Loading config from {}", path.display());
                Self::load(&path)
            }
            _ => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.audio.sample_rate == 0 {
            return Err(Error::Config("audio.sample_rate must be positive".into()));
        }
        if !(1..=2).contains(&self.audio.channels) {
            return Err(Error::Config("audio.channels must be 1 or 2".into()));
        }
        if self.audio.period_frames == 0 {
            return Err(Error::Config("audio.period_frames must be positive".into()));
        }
        if self.audio.mode == TransmissionMode::Compressed
            && self.audio.codec == CodecKind::Opus
            && !codec::opus::is_valid_frame_size(
                self.audio.sample_rate,
                self.audio.period_frames as usize,
            )
        {
            return Err(Error::Config(format!(
                "audio.period_frames = {} is not an Opus frame size at {} Hz",
                self.audio.period_frames, self.audio.sample_rate
            )));
        }
        if self.network.send_queue_capacity == 0 {
            return Err(Error::Config("network.send_queue_capacity must be positive".into()));
        }
        if self.network.drain_batch == 0 {
            return Err(Error::Config("network.drain_batch must be positive".into()));
        }
        if self.network.drain_interval_ms == 0 || self.network.probe_interval_ms == 0 {
            return Err(Error::Config("network timer intervals must be positive".into()));
        }
        Ok(())
    }
}

/// Audio device and stream settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Capture device name; default device when unset or not found
    pub input_device: Option<String>,
    /// Playback device name; default device when unset or not found
    pub output_device: Option<String>,
    pub sample_rate: u32,
    pub channels: u16,
    pub period_frames: u32,
    pub mode: TransmissionMode,
    /// Codec used in compressed mode
    pub codec: CodecKind,
    pub level_idle_reset_ms: u64,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_device: None,
            output_device: None,
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: DEFAULT_CHANNELS,
            period_frames: DEFAULT_PERIOD_FRAMES,
            mode: TransmissionMode::Raw,
            codec: CodecKind::Opus,
            level_idle_reset_ms: LEVEL_IDLE_RESET_MS,
        }
    }
}

impl AudioConfig {
    pub fn stream_settings(&self) -> StreamSettings {
        StreamSettings {
            input_device: self.input_device.clone(),
            output_device: self.output_device.clone(),
            sample_rate: self.sample_rate,
            channels: self.channels,
            period_frames: self.period_frames,
            mode: self.mode,
        }
    }
}

/// Transport, queue and probe settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub port: u16,
    /// Peer to dial in client mode
    pub peer_address: Option<String>,
    pub probe_interval_ms: u64,
    pub drain_interval_ms: u64,
    /// Packets written per drain tick
    pub drain_batch: usize,
    /// Entries held before the oldest is dropped
    pub send_queue_capacity: usize,
    pub connect_timeout_ms: u64,
    pub write_timeout_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            peer_address: None,
            probe_interval_ms: PROBE_INTERVAL_MS,
            drain_interval_ms: DRAIN_INTERVAL_MS,
            drain_batch: DRAIN_BATCH,
            send_queue_capacity: SEND_QUEUE_CAPACITY,
            connect_timeout_ms: CONNECT_TIMEOUT_MS,
            write_timeout_ms: WRITE_TIMEOUT_MS,
        }
    }
}

impl NetworkConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

/// Opus application profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpusApplication {
    Voip,
    Audio,
    LowDelay,
}

/// Opus encoder settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpusConfig {
    pub application: OpusApplication,
    pub bitrate: u32,
    pub vbr: bool,
    pub fec: bool,
    pub packet_loss_perc: u8,
}

impl Default for OpusConfig {
    fn default() -> Self {
        Self {
            application: OpusApplication::Voip,
            bitrate: DEFAULT_BITRATE,
            vbr: true,
            fec: false,
            packet_loss_perc: 0,
        }
    }
}
