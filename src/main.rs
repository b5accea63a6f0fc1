//! kpodd
//!
//! A daemon for Linux that drives the Elecraft K-Pod tuning knob over hidraw
//! and publishes knob turns and button presses for receiver-control software.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use kpodd::{
    hidraw::{scan_devices, HidrawTransport},
    init_dbus_service, Config, DbusSink, DeviceFilter, EventSink, JsonLinesSink, LogSink,
    SessionManager, SessionManagerHandle,
};

/// Where decoded knob events go
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Output {
    /// Emit D-Bus signals on the session bus
    Dbus,
    /// Print one JSON object per event to stdout
    Stdout,
    /// Log events only
    Log,
}

/// kpodd - Elecraft K-Pod tuning knob daemon
#[derive(Parser, Debug)]
#[command(name = "kpodd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file path (default: ~/.config/kpodd/config.json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// List all hidraw devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Event output
    #[arg(short, long, value_enum, default_value_t = Output::Dbus)]
    output: Output,

    /// Override the status poll interval in milliseconds
    #[arg(long)]
    poll_interval_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Logs go to stderr so stdout stays clean for event output
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("kpodd starting...");

    let loaded = match &args.config {
        Some(path) => Config::load(path),
        None => Config::load_default(),
    };
    let mut config = match loaded {
        Ok(config) => config,
        Err(e) => {
            warn!("Failed to load config, using defaults: {}", e);
            Config::default()
        }
    };

    if let Some(ms) = args.poll_interval_ms {
        config.polling.poll_interval_ms = ms;
        config.polling.validate();
    }

    let filter = config.device.filter();

    if args.list_devices {
        list_hidraw_devices(filter);
        return Ok(());
    }

    let transport = Arc::new(HidrawTransport::new(filter, config.hidraw.rescan_interval()));

    match args.output {
        Output::Dbus => {
            let (sink, events) = DbusSink::channel();
            let manager = SessionManager::spawn(transport, Arc::new(sink), config.polling.clone(), filter);

            let connection = match init_dbus_service(manager.clone()).await {
                Ok(conn) => conn,
                Err(e) => {
                    error!("Failed to initialize D-Bus service: {}", e);
                    manager.shutdown().await;
                    return Err(e.into());
                }
            };

            let forwarder = tokio::spawn(DbusSink::run(connection.clone(), events));
            run_until_shutdown(&manager).await;
            forwarder.abort();
        }
        Output::Stdout => {
            let sink: Arc<dyn EventSink> = Arc::new(JsonLinesSink);
            let manager = SessionManager::spawn(transport, sink, config.polling.clone(), filter);
            run_until_shutdown(&manager).await;
        }
        Output::Log => {
            let sink: Arc<dyn EventSink> = Arc::new(LogSink);
            let manager = SessionManager::spawn(transport, sink, config.polling.clone(), filter);
            run_until_shutdown(&manager).await;
        }
    }

    Ok(())
}

/// Wait for Ctrl-C, then stop all device sessions
async fn run_until_shutdown(manager: &SessionManagerHandle) {
    if manager.is_available() {
        info!("kpodd ready");
    } else {
        warn!("hidraw is not available on this system, no devices will be handled");
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }

    info!("Shutdown signal received, exiting...");
    manager.shutdown().await;
}

/// List all detected hidraw devices
fn list_hidraw_devices(filter: DeviceFilter) {
    println!("Scanning for hidraw devices...\n");

    let devices = match scan_devices() {
        Ok(devices) => devices,
        Err(e) => {
            println!("Failed to scan hidraw devices: {}", e);
            return;
        }
    };

    if devices.is_empty() {
        println!("No hidraw devices found.");
        println!("\nTroubleshooting:");
        println!("  - Ensure your K-Pod is connected");
        println!("  - Check that udev rules are installed");
        return;
    }

    println!("Found {} hidraw device(s):\n", devices.len());

    for (i, device) in devices.iter().enumerate() {
        let marker = if filter.matches(device.vendor_id, device.product_id) {
            " [K-Pod]"
        } else {
            ""
        };
        println!("{}. {}{}", i + 1, device.name, marker);
        println!("   Path:    {:?}", device.path);
        println!("   Vendor:  0x{:04X}", device.vendor_id);
        println!("   Product: 0x{:04X}", device.product_id);
        println!();
    }
}
