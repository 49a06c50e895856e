// src/io/serial/mod.rs
//
// Serial port transport for the watchdog.
// Provides cross-platform line-oriented serial reads for linewatch.
//
// Features:
// - Bounded, non-blocking line polling (newline framing with lossy decode)
// - Port enumeration (list_serial_ports)

pub mod framer;
pub mod reader;

pub use framer::LineFramer;
pub use reader::{list_serial_ports, SerialPortInfo, SerialTransport};
