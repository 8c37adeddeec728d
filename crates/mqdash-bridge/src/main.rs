//! mqdash-bridge - Mirrors an MQTT broker onto the dashboard's Redis bus.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::bounded;
use log::{error, info, warn};

use mqdash_bridge::{Bridge, BrokerConnection, Config, RedisBus};

struct Args {
    config_path: String,
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = "mqdash.toml".to_string();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-c" | "--config" => {
                if i + 1 < args.len() {
                    config_path = args[i + 1].clone();
                    i += 2;
                } else {
                    eprintln!("Error: -c requires a file path");
                    std::process::exit(1);
                }
            }
            "-h" | "--help" => {
                println!("mqdash-bridge - MQTT broker to Redis bridge");
                println!();
                println!("Usage: mqdash-bridge [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -c, --config <FILE>     Config file path (default: mqdash.toml)");
                println!("  -h, --help              Show this help message");
                println!();
                println!("Configuration:");
                println!("  A missing config file falls back to defaults. Every setting can be");
                println!("  overridden with environment variables using the MQDASH__ prefix:");
                println!();
                println!("  MQDASH__BROKER__HOST=mosquitto");
                println!("  MQDASH__BUS__HOST=redis");
                println!("  MQDASH__BRIDGE__STATS_INTERVAL=10");
                println!("  MQDASH__LOG__LEVEL=debug");
                std::process::exit(0);
            }
            arg => {
                eprintln!("Unknown argument: {}", arg);
                eprintln!("Use --help for usage information");
                std::process::exit(1);
            }
        }
    }

    Args { config_path }
}

fn main() {
    let args = parse_args();

    let config = match Config::load(&args.config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(config.log.filter()))
        .init();

    info!("Loaded configuration from {}", args.config_path);
    info!(
        "Bridging {} -> {} (stats every {}s)",
        config.broker.address(),
        config.bus.address(),
        config.bridge.stats_interval
    );

    let broker = match BrokerConnection::from_config(&config.broker, &config.bridge.client_id) {
        Ok(b) => b,
        Err(e) => {
            error!("Invalid broker settings: {}", e);
            std::process::exit(1);
        }
    };

    let bus = RedisBus::new(config.bus.clone());
    if let Err(e) = bus.ping() {
        warn!("Redis at {} not reachable yet: {}", config.bus.address(), e);
    }

    let bridge = Bridge::new(
        Arc::new(broker),
        Arc::new(bus),
        Duration::from_secs(config.bridge.stats_interval),
    );

    if !bridge.start() {
        error!("Failed to start bridge");
        bridge.shutdown();
        std::process::exit(1);
    }

    let (stop_tx, stop_rx) = bounded::<()>(1);
    if let Err(e) = ctrlc::set_handler(move || {
        let _ = stop_tx.try_send(());
    }) {
        error!("Failed to install signal handler: {}", e);
        bridge.shutdown();
        std::process::exit(1);
    }

    let _ = stop_rx.recv();
    info!("Shutdown signal received");
    bridge.shutdown();
}
