// src/lib.rs
//
// linewatch — serial line watchdog.
//
// Watches a single serial device for newline-terminated traffic and raises a
// timeout event when the line has been silent for longer than a configured
// interval. This crate is the monitoring core only: the transport reader, the
// watchdog controller, and the event/state model. Presentation (CLI, UI,
// recording) sits on top and consumes `MonitorEvent`s from a channel.

#[macro_use]
pub mod logging;

pub mod config;
pub mod io;
pub mod watchdog;

pub use config::MonitorConfig;
pub use io::serial::{list_serial_ports, SerialPortInfo, SerialTransport};
pub use io::{now_us, LineConnection, LineResult, LineTransport, MonitorEvent, MonitorState};
pub use watchdog::{EventSender, LineWatchdog};
