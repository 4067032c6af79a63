//! Configuration management for the RTP/RTCP transport stack

use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

/// Largest MTU the stack accepts (IPv4 + UDP over Ethernet)
pub const MAX_MTU: u16 = 1500;

/// Smallest MTU that still leaves room for IP, UDP and a full RTP header
pub const MIN_MTU: u16 = 128;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Source could not be read or deserialized
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    /// Value out of range
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Output format for the tracing subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// One JSON object per line (production)
    Json,
    /// Human-readable lines (development)
    Console,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level filter, overridden by `RUST_LOG`
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
        }
    }
}

/// Per-session RTP/RTCP configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RtpConfig {
    /// Maximum transfer unit in bytes, including IP/UDP overhead
    pub mtu: u16,
    /// Number of sent packets kept for retransmission
    pub nack_history_size: u16,
    /// Mean RTCP report interval for video sessions
    pub rtcp_interval_video_ms: u32,
    /// Mean RTCP report interval for audio sessions
    pub rtcp_interval_audio_ms: u32,
    /// Cadence reported by `time_until_next_process`
    pub process_interval_ms: u32,
    /// RTP silence before `on_packet_timeout` fires (0 = disabled)
    pub rtp_packet_timeout_ms: u32,
    /// RTCP silence before `on_rtcp_packet_timeout` fires (0 = disabled)
    pub rtcp_packet_timeout_ms: u32,
    /// Maximum number of missing sequence numbers tracked for NACK
    pub nack_max_list_size: u16,
    /// Number of times a missing packet is requested before giving up
    pub nack_max_retries: u8,
    /// Age after which buffered RED/FEC packets are dropped
    pub fec_sei_timeout_ms: u32,
}

impl Default for RtpConfig {
    fn default() -> Self {
        Self {
            mtu: MAX_MTU,
            nack_history_size: 200,
            rtcp_interval_video_ms: 1000,
            rtcp_interval_audio_ms: 5000,
            process_interval_ms: 5,
            rtp_packet_timeout_ms: 0,
            rtcp_packet_timeout_ms: 0,
            nack_max_list_size: 250,
            nack_max_retries: 10,
            fec_sei_timeout_ms: 30_000,
        }
    }
}

/// Receive-side bandwidth aggregation (REMB) configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RembConfig {
    /// Regular REMB emission interval
    pub send_interval_ms: u32,
    /// Decrease, in percent, that forces an early REMB
    pub decrease_threshold_percent: u32,
}

impl Default for RembConfig {
    fn default() -> Self {
        Self {
            send_interval_ms: 1000,
            decrease_threshold_percent: 3,
        }
    }
}

impl RembConfig {
    /// Multiplier below which a new estimate counts as a decrease (0.97 by default)
    pub fn decrease_factor(&self) -> f64 {
        1.0 - f64::from(self.decrease_threshold_percent) / 100.0
    }
}

/// Render timing configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub render_delay_ms: u32,
    /// Cap on how fast the applied delay follows the target
    pub delay_max_change_ms_per_s: u32,
    /// Render times further ahead than this are treated as a timestamp discontinuity
    pub max_video_delay_ms: u32,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            render_delay_ms: 10,
            delay_max_change_ms_per_s: 100,
            max_video_delay_ms: 2000,
        }
    }
}

/// Complete stack configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StackConfig {
    pub rtp: RtpConfig,
    pub remb: RembConfig,
    pub timing: TimingConfig,
    pub logging: LoggingConfig,
}

impl StackConfig {
    /// Load configuration from environment variables
    ///
    /// Variables use the `RTCSTACK__<SECTION>__<KEY>` form, e.g.
    /// `RTCSTACK__RTP__MTU=1200`. A `.env` file is honoured if present.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if it exists
        let _ = dotenvy::dotenv();

        let settings = config::Config::builder()
            .add_source(environment())
            .build()?;

        let config: StackConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file, with environment variables layered on top
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()).required(true))
            .add_source(environment())
            .build()?;

        let config: StackConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the transport cannot operate with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rtp.mtu > MAX_MTU || self.rtp.mtu < MIN_MTU {
            return Err(ConfigError::Invalid(format!(
                "rtp.mtu must be within {}..={}, got {}",
                MIN_MTU, MAX_MTU, self.rtp.mtu
            )));
        }
        if self.rtp.nack_history_size == 0 {
            return Err(ConfigError::Invalid(
                "rtp.nack_history_size must be non-zero".to_string(),
            ));
        }
        if self.rtp.rtcp_interval_video_ms == 0 || self.rtp.rtcp_interval_audio_ms == 0 {
            return Err(ConfigError::Invalid(
                "RTCP intervals must be non-zero".to_string(),
            ));
        }
        if self.remb.decrease_threshold_percent >= 100 {
            return Err(ConfigError::Invalid(format!(
                "remb.decrease_threshold_percent must be below 100, got {}",
                self.remb.decrease_threshold_percent
            )));
        }
        if self.remb.send_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "remb.send_interval_ms must be non-zero".to_string(),
            ));
        }
        if self.timing.delay_max_change_ms_per_s == 0 {
            return Err(ConfigError::Invalid(
                "timing.delay_max_change_ms_per_s must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn environment() -> config::Environment {
    config::Environment::with_prefix("RTCSTACK")
        .separator("__")
        .try_parsing(true)
}
