// src/config.rs
//
// Watchdog configuration: which device to watch, at what baud rate, and how
// long the line may stay silent before a timeout fires.

use serde::{Deserialize, Serialize};

/// Default per-read poll budget in milliseconds.
/// Matches the serial driver's read timeout so a single poll never blocks the
/// monitor loop for longer than this.
pub const DEFAULT_READ_POLL_TIMEOUT_MS: u64 = 1000;

/// Configuration for one monitoring session
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Serial device path/name (e.g., "/dev/ttyUSB0", "COM3")
    pub device: String,
    pub baud_rate: u32,
    /// Per-read poll budget in milliseconds (driver read timeout)
    #[serde(default = "default_read_poll_timeout_ms")]
    pub read_poll_timeout_ms: u64,
    /// Seconds of silence before a timeout event fires
    pub idle_timeout_secs: u64,
}

fn default_read_poll_timeout_ms() -> u64 {
    DEFAULT_READ_POLL_TIMEOUT_MS
}

impl MonitorConfig {
    pub fn new(device: impl Into<String>, baud_rate: u32, idle_timeout_secs: u64) -> Self {
        Self {
            device: device.into(),
            baud_rate,
            read_poll_timeout_ms: DEFAULT_READ_POLL_TIMEOUT_MS,
            idle_timeout_secs,
        }
    }

    /// Validate the configuration. Violations are caller errors surfaced
    /// synchronously from `start()`, never as monitor events.
    pub fn validate(&self) -> Result<(), String> {
        if self.device.trim().is_empty() {
            return Err("Device must not be empty".to_string());
        }
        if self.baud_rate == 0 {
            return Err("Baud rate must be a positive integer".to_string());
        }
        if self.idle_timeout_secs == 0 {
            return Err("Idle timeout must be a positive number of seconds".to_string());
        }
        Ok(())
    }

    /// Build a config from raw user input (e.g., form fields or CLI args).
    /// Baud rate and idle timeout must parse to positive integers.
    pub fn from_user_input(device: &str, baud_rate: &str, idle_timeout_secs: &str) -> Result<Self, String> {
        let baud: u32 = baud_rate
            .trim()
            .parse()
            .map_err(|_| format!("Baud rate must be an integer, got '{}'", baud_rate))?;
        let idle: u64 = idle_timeout_secs
            .trim()
            .parse()
            .map_err(|_| format!("Idle timeout must be an integer, got '{}'", idle_timeout_secs))?;

        let config = Self::new(device, baud, idle);
        config.validate()?;
        Ok(config)
    }
}
