mod collector;
mod config;
mod error;
mod influx;
mod meter;
mod plug;
mod window;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::collector::{Collector, CollectorSettings, Ticker};

fn main() -> Result<()> {
    let config = config::Config::parse();

    env_logger::Builder::new()
        .filter_level(config.log_level.into())
        .parse_default_env()
        .init();

    let hostname = config
        .hostname
        .clone()
        .unwrap_or_else(config::local_hostname);
    let timeout = Duration::from_secs(config.timeout_secs);

    info!("Starting plugmon");
    info!("Log level: {:?}", config.log_level);
    info!("Using IP address: {}", config.ip);
    info!("Logging from hostname: {}", hostname);
    info!("Using influx url: {}", config.influx_url);
    info!("Using influx db: {}", config.influx_database);
    info!(
        "Averaging over {} readings every {}s (zero fill: {})",
        config.window, config.interval_secs, config.zero_fill
    );

    let sink = if config.influx_url.is_empty() {
        info!("No influx url given, readings will only be logged");
        None
    } else {
        Some(influx::InfluxSink::new(
            &config.influx_url,
            &config.influx_database,
            timeout,
        )?)
    };

    let plug = plug::Hs110::new(&config.ip, config.port, timeout);

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        ctrlc::set_handler(move || running.store(false, Ordering::SeqCst))
            .context("Failed to install signal handler")?;
    }

    let settings = CollectorSettings {
        measurement: config.measurement.clone(),
        hostname,
        device_ip: config.ip.clone(),
        window: config.window as usize,
        zero_fill: config.zero_fill,
        on_read_error: config.on_read_error,
    };
    let mut collector = Collector::new(plug, sink, settings);
    let mut ticker = Ticker::new(Duration::from_secs(config.interval_secs));

    info!("Collecting data and logging...");
    collector.run(&mut ticker, &running)?;

    info!("Shutting down");
    Ok(())
}
