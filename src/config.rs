//! Deployment configuration.
//!
//! Endpoint URLs, audio capture parameters, the reconnect policy, and VAD
//! thresholds are deployment parameters, not user input. They load from a
//! TOML file (`~/.config/voxwire/config.toml` by default) with serde
//! defaults for every field, so an empty file is a valid config.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{CallError, Result};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub endpoints: EndpointsConfig,
    pub audio: AudioConfig,
    pub reconnect: ReconnectConfig,
    pub vad: VadConfig,
    pub relay: RelayConfig,
}

/// Remote service endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointsConfig {
    /// Streaming socket URL for the duplex audio session.
    pub socket_url: String,
    /// Upstream offer endpoint the negotiation relay forwards to.
    pub negotiate_upstream_url: String,
}

impl Default for EndpointsConfig {
    fn default() -> Self {
        Self {
            socket_url: "wss://audio.enty.services/stream".into(),
            negotiate_upstream_url: "https://audio.enty.services/offer".into(),
        }
    }
}

/// Microphone capture and outbound slice parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Capture sample rate in Hz.
    pub sample_rate: u32,
    /// Capture channel count. Anything above 1 is downmixed to mono.
    pub channels: u16,
    /// Duration of one outbound slice in milliseconds (100–200).
    pub slice_duration_ms: u32,
    /// Wire format advertised in outbound frames.
    pub format: AudioWireFormat,
    /// Prosody hints carried on every outbound frame.
    pub prosody: ProsodyConfig,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            channels: 1,
            slice_duration_ms: 100,
            format: AudioWireFormat::Opus,
            prosody: ProsodyConfig::default(),
        }
    }
}

impl AudioConfig {
    /// Number of mono samples in one outbound slice.
    pub fn samples_per_slice(&self) -> usize {
        (self.sample_rate as usize * self.slice_duration_ms as usize) / 1000
    }
}

/// Audio formats the remote service accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioWireFormat {
    Opus,
    Wav,
}

impl AudioWireFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Opus => "opus",
            Self::Wav => "wav",
        }
    }
}

/// Prosody hints for synthesized output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProsodyConfig {
    /// Speech speed multiplier.
    pub speed: f64,
    /// Volume adjustment in dB.
    pub volume: f64,
}

impl Default for ProsodyConfig {
    fn default() -> Self {
        Self {
            speed: 1.0,
            volume: 0.0,
        }
    }
}

/// Reconnection policy for the streaming socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Fixed delay between attempts, in seconds.
    pub delay_secs: u64,
    /// Attempt ceiling. `None` retries indefinitely; exhausting a ceiling
    /// leaves the session in a terminal Disconnected state.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            delay_secs: 5,
            max_attempts: Some(30),
        }
    }
}

impl ReconnectConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay_secs)
    }
}

/// Voice-activity segmentation thresholds.
///
/// The detector marks utterance boundaries for the replay list; it never
/// gates the live outbound stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// Whether utterance segmentation runs at all.
    pub enabled: bool,
    /// RMS level above which speech is considered started.
    pub start_rms: f32,
    /// RMS level below which speech is considered ending.
    pub end_rms: f32,
    /// Milliseconds of silence before an utterance is closed.
    pub hangover_ms: u64,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            start_rms: 0.015,
            end_rms: 0.008,
            hangover_ms: 600,
        }
    }
}

/// Negotiation relay server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Listen address for the relay HTTP server.
    pub listen_addr: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8787".into(),
        }
    }
}

impl Config {
    /// Load configuration from an explicit path, or from the default
    /// location when `path` is `None`. A missing file yields defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match Self::default_path() {
                Some(p) => p,
                None => return Ok(Self::default()),
            },
        };

        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(&path)
            .map_err(|e| CallError::Config(format!("failed to read {}: {e}", path.display())))?;
        toml::from_str(&raw)
            .map_err(|e| CallError::Config(format!("failed to parse {}: {e}", path.display())))
    }

    /// Default config path: `<config dir>/voxwire/config.toml`.
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "voxwire")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }
}
