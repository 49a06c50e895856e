// tools/watch_cli/main.rs
//
// Serial watchdog diagnostic CLI — lists ports and runs the watchdog against
// a device, printing monitor events as they arrive. Ctrl-C stops the session.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use linewatch::{list_serial_ports, LineWatchdog, MonitorConfig, MonitorEvent};

#[derive(Parser)]
#[command(name = "watch_cli", about = "Serial line watchdog")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List available serial ports
    List,
    /// Watch a serial device and report data/timeout events
    Watch {
        /// Serial device path (e.g., /dev/ttyUSB0, COM3)
        device: String,
        /// Baud rate
        #[arg(long, default_value_t = 9600)]
        baud: u32,
        /// Seconds of silence before a timeout fires
        #[arg(long, default_value_t = 600)]
        timeout: u64,
        /// Print events as JSON lines instead of human-readable text
        #[arg(long)]
        json: bool,
        /// Also write logs to a timestamped file in this directory
        #[arg(long)]
        log_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::List => list_ports(),
        Command::Watch {
            device,
            baud,
            timeout,
            json,
            log_dir,
        } => watch(device, baud, timeout, json, log_dir).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn list_ports() -> Result<(), String> {
    let ports = list_serial_ports()?;
    if ports.is_empty() {
        println!("No serial ports found");
        return Ok(());
    }

    for p in ports {
        let detail = match (p.manufacturer.as_deref(), p.product.as_deref()) {
            (Some(m), Some(prod)) => format!(" — {} {}", m, prod),
            (Some(m), None) => format!(" — {}", m),
            (None, Some(prod)) => format!(" — {}", prod),
            (None, None) => String::new(),
        };
        println!("{}  [{}]{}", p.port_name, p.port_type, detail);
    }
    Ok(())
}

async fn watch(
    device: String,
    baud: u32,
    timeout: u64,
    json: bool,
    log_dir: Option<PathBuf>,
) -> Result<(), String> {
    if let Some(dir) = log_dir {
        linewatch::logging::init_file_logging(&dir)?;
    }

    let config = MonitorConfig::new(device.clone(), baud, timeout);
    config.validate()?;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let mut watchdog = LineWatchdog::serial(tx);
    watchdog.start(config).await?;

    println!(
        "Watching {} at {} baud (timeout: {} s) — Ctrl-C to stop",
        device, baud, timeout
    );

    let mut session_failed = false;
    loop {
        tokio::select! {
            event = rx.recv() => {
                let event = match event {
                    Some(ev) => ev,
                    None => break,
                };
                if json {
                    match serde_json::to_string(&event) {
                        Ok(line) => println!("{}", line),
                        Err(e) => eprintln!("Failed to encode event: {}", e),
                    }
                } else {
                    print_event(&event);
                }
                if matches!(event, MonitorEvent::ErrorOccurred { .. }) {
                    session_failed = true;
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("Stopping...");
                break;
            }
        }
    }

    watchdog.stop().await;
    linewatch::logging::stop_file_logging();

    if session_failed {
        std::process::exit(1);
    }
    Ok(())
}

fn print_event(event: &MonitorEvent) {
    match event {
        MonitorEvent::DataReceived { text, timestamp_us, .. } => {
            println!("[{}] {}", format_local(*timestamp_us, "%H:%M:%S"), text);
        }
        MonitorEvent::TimeoutFired { last_received_us, silent_ms, .. } => {
            println!(
                "[{}] TIMEOUT — silent for {:.1} s (last data: {})",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                *silent_ms as f64 / 1000.0,
                format_local(*last_received_us, "%Y-%m-%d %H:%M:%S"),
            );
        }
        MonitorEvent::ErrorOccurred { message, .. } => {
            eprintln!(
                "[{}] ERROR — {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                message
            );
        }
    }
}

/// Format a UNIX-microseconds timestamp in local time
fn format_local(timestamp_us: u64, fmt: &str) -> String {
    chrono::DateTime::from_timestamp_micros(timestamp_us as i64)
        .map(|dt| dt.with_timezone(&chrono::Local).format(fmt).to_string())
        .unwrap_or_else(|| timestamp_us.to_string())
}
