//! # Configuration Management
//!
//! This module handles loading and managing client configuration from multiple sources:
//! - TOML configuration files (callshield.toml)
//! - Environment variables (with CALLSHIELD_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `API_URL` environment variable (deployment shortcut for `api.base_url`)
//! 2. Environment variables (CALLSHIELD_API__BASE_URL, CALLSHIELD_TIMING__RISK_POLL_MS, etc.)
//! 3. Configuration file (callshield.toml)
//! 4. Default values (defined in the Default impl)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Main client configuration that contains all settings.
///
/// ## Why separate config structs:
/// Breaking configuration into logical groups (api, audio, timing, slot)
/// keeps each subsystem's knobs next to each other.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub api: ApiConfig,
    pub audio: AudioSettings,
    pub timing: TimingConfig,
    pub slot: SlotConfig,
}

/// Where the risk-analysis service lives.
///
/// ## Fields:
/// - `base_url`: HTTP root of the service (e.g. "http://localhost:8000")
/// - `ws_url`: WebSocket root; when absent it is derived from `base_url`
/// - `request_timeout_secs`: per-request timeout for the HTTP client
/// - `user_id`: identity the call session is created for
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub base_url: String,
    pub ws_url: Option<String>,
    pub request_timeout_secs: u64,
    pub user_id: String,
}

impl ApiConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Capture and encoding format.
///
/// ## Fields:
/// - `sample_rate`: Rate of every outbound PCM frame (16kHz for the risk service)
/// - `frame_size`: Samples per outbound frame
/// - `fft_size`: Window length of the spectral tap (power of two)
/// - `agent_audio_format`: Format requested for scripted agent clips
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioSettings {
    pub sample_rate: u32,
    pub frame_size: usize,
    pub fft_size: usize,
    pub agent_audio_format: String,
}

/// Timer periods of the cooperative loops, in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    pub scheduler_tick_ms: u64,
    pub risk_poll_ms: u64,
    pub slot_poll_ms: u64,
}

/// Location of the cross-surface session slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotConfig {
    pub dir: PathBuf,
    pub key: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api: ApiConfig {
                base_url: "http://localhost:8000".to_string(),
                ws_url: None,
                request_timeout_secs: 10,
                user_id: "demo_user".to_string(),
            },
            audio: AudioSettings {
                sample_rate: 16000,
                frame_size: 4096,
                fft_size: 2048,
                agent_audio_format: "mp3".to_string(),
            },
            timing: TimingConfig {
                scheduler_tick_ms: 500,
                risk_poll_ms: 2000,
                slot_poll_ms: 500,
            },
            slot: SlotConfig {
                dir: default_slot_dir(),
                key: "active_session_id".to_string(),
            },
        }
    }
}

/// Platform data directory for the slot, falling back to the temp dir.
fn default_slot_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(env::temp_dir)
        .join("callshield")
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `CALLSHIELD_API__BASE_URL=http://10.0.0.5:8000`: Override the service root
    /// - `CALLSHIELD_TIMING__RISK_POLL_MS=1000`: Poll risk every second
    /// - `API_URL=http://risk.internal:8000`: Same as the first, without the prefix
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("callshield").required(false))
            .add_source(
                config::Environment::with_prefix("CALLSHIELD")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(url) = env::var("API_URL") {
            settings = settings.set_override("api.base_url", url)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    pub fn validate(&self) -> Result<()> {
        if self.api.base_url.trim().is_empty() {
            return Err(anyhow::anyhow!("API base URL cannot be empty"));
        }

        if self.audio.sample_rate == 0 {
            return Err(anyhow::anyhow!("Sample rate must be greater than 0"));
        }

        if self.audio.frame_size == 0 {
            return Err(anyhow::anyhow!("Frame size must be greater than 0"));
        }

        if !self.audio.fft_size.is_power_of_two() || self.audio.fft_size < 32 {
            return Err(anyhow::anyhow!(
                "FFT size must be a power of two of at least 32, got {}",
                self.audio.fft_size
            ));
        }

        if self.timing.scheduler_tick_ms == 0
            || self.timing.risk_poll_ms == 0
            || self.timing.slot_poll_ms == 0
        {
            return Err(anyhow::anyhow!("Timer intervals must be greater than 0"));
        }

        if self.slot.key.trim().is_empty() {
            return Err(anyhow::anyhow!("Slot key cannot be empty"));
        }

        Ok(())
    }

    /// WebSocket root, derived from the HTTP root when not configured.
    ///
    /// `http://` becomes `ws://` and `https://` becomes `wss://`.
    pub fn ws_base_url(&self) -> String {
        match &self.api.ws_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => {
                let base = self.api.base_url.trim_end_matches('/');
                match base.strip_prefix("http") {
                    Some(rest) => format!("ws{}", rest),
                    None => base.to_string(),
                }
            }
        }
    }

    /// Full URL of the duplex audio socket for one session.
    pub fn ws_audio_url(&self, session_id: &str) -> String {
        format!("{}/ws/audio?session_id={}", self.ws_base_url(), session_id)
    }

    pub fn scheduler_tick(&self) -> Duration {
        Duration::from_millis(self.timing.scheduler_tick_ms)
    }

    pub fn risk_poll_interval(&self) -> Duration {
        Duration::from_millis(self.timing.risk_poll_ms)
    }

    pub fn slot_poll_interval(&self) -> Duration {
        Duration::from_millis(self.timing.slot_poll_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Test that the default configuration is valid and has expected values.
    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.api.base_url, "http://localhost:8000");
        assert_eq!(config.audio.sample_rate, 16000);
        assert_eq!(config.timing.scheduler_tick_ms, 500);
        assert_eq!(config.timing.risk_poll_ms, 2000);
        assert_eq!(config.api.request_timeout(), Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    /// Test that validation catches invalid configurations.
    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.audio.fft_size = 1000;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.timing.risk_poll_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_ws_url_derived_from_http() {
        let mut config = AppConfig::default();
        assert_eq!(
            config.ws_audio_url("abc123"),
            "ws://localhost:8000/ws/audio?session_id=abc123"
        );

        config.api.base_url = "https://risk.example.com/".to_string();
        assert_eq!(config.ws_base_url(), "wss://risk.example.com");
    }

    #[test]
    fn test_explicit_ws_url_wins() {
        let mut config = AppConfig::default();
        config.api.ws_url = Some("ws://127.0.0.1:9000/".to_string());
        assert_eq!(
            config.ws_audio_url("s1"),
            "ws://127.0.0.1:9000/ws/audio?session_id=s1"
        );
    }
}
