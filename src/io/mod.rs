// src/io/mod.rs
//
// Transport abstraction for line-oriented device sources.
// Provides the traits the watchdog controller drives, plus the shared
// event/state model delivered to consumers.

pub mod serial;

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::MonitorConfig;

// ============================================================================
// Shared Types
// ============================================================================

/// Get current time in microseconds since UNIX epoch
pub fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Event emitted by the watchdog monitor loop.
///
/// Every event carries the session `generation` it was produced under. A new
/// `start()` bumps the generation, so consumers can discard events from a
/// prior loop that was slow to exit.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MonitorEvent {
    /// A non-empty line arrived on the device
    DataReceived {
        generation: u64,
        /// Whitespace-trimmed line text
        text: String,
        /// Host UNIX timestamp in microseconds
        timestamp_us: u64,
    },
    /// The line has been silent for longer than the configured idle timeout
    TimeoutFired {
        generation: u64,
        /// When data was last received (UNIX microseconds)
        last_received_us: u64,
        /// How long the line had been silent when the timeout fired
        silent_ms: u64,
    },
    /// Unrecoverable fault — the session is over (open failure or read error)
    ErrorOccurred { generation: u64, message: String },
}

impl MonitorEvent {
    /// Session generation this event was produced under
    pub fn generation(&self) -> u64 {
        match self {
            MonitorEvent::DataReceived { generation, .. }
            | MonitorEvent::TimeoutFired { generation, .. }
            | MonitorEvent::ErrorOccurred { generation, .. } => *generation,
        }
    }
}

/// Current state of the watchdog controller
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorState {
    Idle,
    Starting,
    Running,
    Stopping,
    /// Transient: an unrecoverable error was hit; auto-transitions to Idle
    /// after the error event is emitted
    Faulted,
}

// ============================================================================
// Transport Traits
// ============================================================================

/// Outcome of one bounded poll for a line
#[derive(Clone, Debug, PartialEq)]
pub enum LineResult {
    /// A complete, non-empty, whitespace-trimmed line
    Line(String),
    /// Nothing available within the poll budget
    NoData,
}

/// Opens connections to a line-oriented device.
/// The production implementation is `serial::SerialTransport`; tests drive the
/// watchdog with scripted transports instead of hardware.
pub trait LineTransport: Send + Sync {
    fn open(&self, config: &MonitorConfig) -> Result<Box<dyn LineConnection>, String>;
}

/// An open connection owned by one monitor session.
pub trait LineConnection: Send {
    /// Poll for one newline-terminated chunk. Never blocks longer than the
    /// connection's configured read poll budget. Read failures are fatal for
    /// the session; the caller does not retry.
    fn poll_line(&mut self) -> Result<LineResult, String>;

    /// Release the OS resource. Idempotent — closing an already-closed
    /// connection is a no-op.
    fn close(&mut self);
}
