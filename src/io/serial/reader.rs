// src/io/serial/reader.rs
//
// Serial port transport implementation.
// Opens the device with a bounded read timeout, polls for newline-terminated
// lines without blocking the monitor loop, and enumerates available ports.

use std::collections::VecDeque;
use std::io::Read;
use std::time::Duration;

use serde::Serialize;

use super::framer::LineFramer;
use crate::config::MonitorConfig;
use crate::io::{LineConnection, LineResult, LineTransport};

// ============================================================================
// Types
// ============================================================================

/// Information about an available serial port
#[derive(Clone, Debug, Serialize)]
pub struct SerialPortInfo {
    pub port_name: String,
    pub port_type: String,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
}

// ============================================================================
// Serial Transport
// ============================================================================

/// Opens real serial devices via the `serialport` crate.
pub struct SerialTransport;

impl LineTransport for SerialTransport {
    fn open(&self, config: &MonitorConfig) -> Result<Box<dyn LineConnection>, String> {
        let port = serialport::new(&config.device, config.baud_rate)
            .timeout(Duration::from_millis(config.read_poll_timeout_ms))
            .open()
            .map_err(|e| format!("Failed to open {}: {}", config.device, e))?;

        tlog!(
            "[serial] Opened {} at {} baud (read timeout {} ms)",
            config.device, config.baud_rate, config.read_poll_timeout_ms
        );

        Ok(Box::new(SerialConnection {
            device: config.device.clone(),
            port: Some(port),
            framer: LineFramer::new(),
            ready: VecDeque::new(),
        }))
    }
}

/// One open serial connection. Exactly one OS handle is held at a time;
/// dropped lines are not buffered beyond the current partial line.
struct SerialConnection {
    device: String,
    port: Option<Box<dyn serialport::SerialPort>>,
    framer: LineFramer,
    /// Complete lines extracted from the last read chunk, handed out one per poll
    ready: VecDeque<String>,
}

impl LineConnection for SerialConnection {
    fn poll_line(&mut self) -> Result<LineResult, String> {
        if let Some(line) = self.ready.pop_front() {
            return Ok(LineResult::Line(line));
        }

        let port = match self.port.as_mut() {
            Some(p) => p,
            // Closed connection reads as permanently silent
            None => return Ok(LineResult::NoData),
        };

        // Only read when bytes are already waiting, so a quiet line costs
        // nothing per tick instead of a full read-timeout wait.
        let waiting = port
            .bytes_to_read()
            .map_err(|e| format!("Failed to query {}: {}", self.device, e))?;
        if waiting == 0 {
            return Ok(LineResult::NoData);
        }

        let mut buf = [0u8; 256];
        match port.read(&mut buf) {
            Ok(0) => Err(format!("Device {} disconnected", self.device)),
            Ok(n) => {
                for line in self.framer.feed(&buf[..n]) {
                    self.ready.push_back(line);
                }
                match self.ready.pop_front() {
                    Some(line) => Ok(LineResult::Line(line)),
                    None => Ok(LineResult::NoData),
                }
            }
            // Timeout is expected for serial reads
            Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(LineResult::NoData),
            Err(e) => Err(format!("Read error on {}: {}", self.device, e)),
        }
    }

    fn close(&mut self) {
        if let Some(port) = self.port.take() {
            drop(port);
            tlog!("[serial] Closed {}", self.device);
        }
    }
}

impl Drop for SerialConnection {
    fn drop(&mut self) {
        self.close();
    }
}

// ============================================================================
// Port Enumeration
// ============================================================================

/// List available serial ports
///
/// On macOS, filters out /dev/tty.* devices and only shows /dev/cu.* devices.
/// The cu (calling unit) devices are non-blocking and preferred for outgoing
/// connections. The tty (terminal) devices block on open waiting for carrier
/// detect.
pub fn list_serial_ports() -> Result<Vec<SerialPortInfo>, String> {
    let ports =
        serialport::available_ports().map_err(|e| format!("Failed to enumerate ports: {}", e))?;

    Ok(ports
        .into_iter()
        .filter(|_p| {
            #[cfg(target_os = "macos")]
            {
                !_p.port_name.starts_with("/dev/tty.")
            }
            #[cfg(not(target_os = "macos"))]
            {
                true
            }
        })
        .map(|p| {
            let (port_type, manufacturer, product, serial_number, vid, pid) = match p.port_type {
                serialport::SerialPortType::UsbPort(info) => (
                    "USB".to_string(),
                    info.manufacturer,
                    info.product,
                    info.serial_number,
                    Some(info.vid),
                    Some(info.pid),
                ),
                serialport::SerialPortType::BluetoothPort => {
                    ("Bluetooth".to_string(), None, None, None, None, None)
                }
                serialport::SerialPortType::PciPort => {
                    ("PCI".to_string(), None, None, None, None, None)
                }
                serialport::SerialPortType::Unknown => {
                    ("Unknown".to_string(), None, None, None, None, None)
                }
            };
            SerialPortInfo {
                port_name: p.port_name,
                port_type,
                manufacturer,
                product,
                serial_number,
                vid,
                pid,
            }
        })
        .collect())
}
