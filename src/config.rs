//! Engine configuration parameters
//!
//! All tunable timing and sizing parameters for the SensorLink engine.
//! Values are fixed at startup; backoff and keep-alive intervals are never
//! adapted at runtime.

use core::fmt;

use serde::{Deserialize, Serialize};

/// Firmware version of this build, packed as `major * 100 + minor`.
pub const FIRMWARE_VERSION: u16 =
    parse_u16(env!("CARGO_PKG_VERSION_MAJOR")) * 100 + parse_u16(env!("CARGO_PKG_VERSION_MINOR"));

const fn parse_u16(s: &str) -> u16 {
    let bytes = s.as_bytes();
    let mut value: u16 = 0;
    let mut i = 0;
    while i < bytes.len() {
        value = value * 10 + (bytes[i] - b'0') as u16;
        i += 1;
    }
    value
}

/// Core engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    // --- Identity ---
    /// Board revision substituted into the update topics.
    pub board_version: u16,
    /// Version of the running firmware image, compared against update offers.
    pub firmware_version: u16,

    // --- Connection ---
    /// Keep-alive interval (seconds); no traffic for this long is a dead link.
    pub keepalive_secs: u16,
    /// Reconnect delay after a mid-session disconnect (milliseconds).
    pub reconnect_short_ms: u32,
    /// Reconnect delay after a failed connect attempt (milliseconds).
    pub reconnect_long_ms: u32,
    /// Subscribe pending topics as soon as the broker accepts the session.
    pub auto_subscribe: bool,

    // --- Delivery ---
    /// Age after which an unacknowledged publish is resent (milliseconds).
    pub retry_interval_ms: u32,
    /// Maximum wait for the publish lock before a publish is dropped (milliseconds).
    pub publish_timeout_ms: u32,

    // --- Task periods ---
    pub io_poll_period_ms: u32,
    pub sweep_period_ms: u32,
    pub keepalive_check_period_ms: u32,

    // --- Firmware update ---
    /// Largest chunk requested from the update peer (bytes).
    pub update_block_size: u32,
    /// Largest image accepted (bytes).
    pub max_firmware_size: u32,
    /// Bounded wait for peripheral tasks to acknowledge a pause (milliseconds).
    pub pause_timeout_ms: u32,
    /// Progress reports are published each time this many percent elapse.
    pub progress_step_percent: u8,

    // --- Command intake ---
    pub command_rate_per_sec: u32,
    pub command_burst: u32,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            // Identity
            board_version: 1,
            firmware_version: FIRMWARE_VERSION,

            // Connection
            keepalive_secs: 60,
            reconnect_short_ms: 3_000,
            reconnect_long_ms: 30_000,
            auto_subscribe: true,

            // Delivery
            retry_interval_ms: 5_000,
            publish_timeout_ms: 2_000,

            // Task periods
            io_poll_period_ms: 5,
            sweep_period_ms: 500,
            keepalive_check_period_ms: 1_000,

            // Firmware update
            update_block_size: 1_024,
            max_firmware_size: 4 * 1024 * 1024, // 4 MB
            pause_timeout_ms: 3_000,
            progress_step_percent: 10,

            // Command intake
            command_rate_per_sec: 10,
            command_burst: 10,
        }
    }
}

/// Errors from [`LinkConfig`] loading and validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// Override document could not be parsed.
    Corrupted,
    /// A field failed range validation.
    /// The `&'static str` describes which field and why.
    ValidationFailed(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Corrupted => write!(f, "config corrupted"),
            Self::ValidationFailed(msg) => write!(f, "validation failed: {}", msg),
        }
    }
}

impl core::error::Error for ConfigError {}

impl From<ConfigError> for crate::error::Error {
    fn from(e: ConfigError) -> Self {
        match e {
            ConfigError::Corrupted => Self::Config("config corrupted"),
            ConfigError::ValidationFailed(msg) => Self::Config(msg),
        }
    }
}

impl LinkConfig {
    /// Parse a JSON override document. Missing fields keep their defaults.
    pub fn from_json(bytes: &[u8]) -> Result<Self, ConfigError> {
        let cfg: Self = serde_json::from_slice(bytes).map_err(|_| ConfigError::Corrupted)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Range-check every field. Invalid values are rejected, never clamped.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(5..=3600).contains(&self.keepalive_secs) {
            return Err(ConfigError::ValidationFailed(
                "keepalive_secs must be 5–3600",
            ));
        }
        if self.reconnect_short_ms == 0 || self.reconnect_short_ms >= self.reconnect_long_ms {
            return Err(ConfigError::ValidationFailed(
                "reconnect_short_ms must be > 0 and < reconnect_long_ms",
            ));
        }
        if self.reconnect_long_ms > 600_000 {
            return Err(ConfigError::ValidationFailed(
                "reconnect_long_ms must be <= 600000",
            ));
        }
        if self.retry_interval_ms < 100 {
            return Err(ConfigError::ValidationFailed(
                "retry_interval_ms must be >= 100",
            ));
        }
        if self.publish_timeout_ms == 0
            || self.io_poll_period_ms == 0
            || self.sweep_period_ms == 0
            || self.keepalive_check_period_ms == 0
            || self.pause_timeout_ms == 0
        {
            return Err(ConfigError::ValidationFailed(
                "timeouts and task periods must be non-zero",
            ));
        }
        if !(16..=4096).contains(&self.update_block_size) {
            return Err(ConfigError::ValidationFailed(
                "update_block_size must be 16–4096",
            ));
        }
        if self.max_firmware_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_firmware_size must be non-zero",
            ));
        }
        if !(1..=100).contains(&self.progress_step_percent) {
            return Err(ConfigError::ValidationFailed(
                "progress_step_percent must be 1–100",
            ));
        }
        if self.command_rate_per_sec == 0 || self.command_burst == 0 {
            return Err(ConfigError::ValidationFailed(
                "command rate and burst must be non-zero",
            ));
        }
        Ok(())
    }

    /// Keep-alive interval in milliseconds.
    pub fn keepalive_ms(&self) -> u64 {
        self.keepalive_secs as u64 * 1000
    }
}
