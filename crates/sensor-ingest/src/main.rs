// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Sensor Ingestion Service CLI
//!
//! # Usage
//!
//! ```bash
//! # Run against a local broker
//! sensor-ingest
//!
//! # Broker in docker compose, custom database
//! sensor-ingest --broker-host mosquitto --db /data/readings.db
//!
//! # Using configuration file
//! sensor-ingest --config ingest.toml
//!
//! # Generate / check a configuration file
//! sensor-ingest gen-config -o ingest.toml
//! sensor-ingest validate -c ingest.toml
//!
//! # Inspect stored readings
//! sensor-ingest stats
//! sensor-ingest recent --limit 20
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sensor_ingest::{service, IngestConfig, IngestService, MqttBroker, SqliteSink};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Sensor Ingestion Service
#[derive(Parser, Debug)]
#[command(name = "sensor-ingest")]
#[command(about = "Sensor ingestion - MQTT readings to SQLite and live WebSocket dashboards")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// MQTT broker host
    #[arg(long)]
    broker_host: Option<String>,

    /// MQTT broker port
    #[arg(long)]
    broker_port: Option<u16>,

    /// Subscriber endpoint bind address (host:port)
    #[arg(short, long)]
    bind: Option<String>,

    /// Database path (SQLite file)
    #[arg(short, long)]
    db: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate example configuration file
    GenConfig {
        /// Output file path
        #[arg(short, long, default_value = "ingest.toml")]
        output: PathBuf,
    },

    /// Validate a configuration file
    Validate {
        /// Configuration file path
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Show per-sensor reading counts from the store
    Stats,

    /// Show the most recent stored readings
    Recent {
        /// Number of readings
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Some(Commands::GenConfig { ref output }) => return cmd_gen_config(output),
        Some(Commands::Validate { ref config }) => return cmd_validate(config),
        _ => {}
    }

    let config = build_config(&args)?;

    // Initialize logging
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match args.command {
        Some(Commands::Stats) => return cmd_stats(&config),
        Some(Commands::Recent { limit }) => return cmd_recent(&config, limit),
        _ => {}
    }

    info!("Sensor Ingestion Service v{}", env!("CARGO_PKG_VERSION"));
    info!("Database: {}", config.store.path);

    let sink = SqliteSink::open(&config.store.path)
        .with_context(|| format!("Failed to open store {}", config.store.path))?;
    let listener = service::bind(&config.subscribers.bind).await?;
    let broker = MqttBroker::new(&config.broker);

    let handle = IngestService::start(&config, listener, broker, Arc::new(sink))?;

    // Stats reporting task
    let stats_task = if config.stats_interval_secs > 0 {
        let period = Duration::from_secs(config.stats_interval_secs);
        let hub = handle.hub().clone();
        let stats = handle.stats_handle();
        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                info!("{} ({} subscribers)", stats.snapshot(), hub.len());
            }
        }))
    } else {
        None
    };

    info!("Press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    if let Some(task) = stats_task {
        task.abort();
    }
    let final_stats = handle.stop().await;

    println!();
    println!("Final Statistics:");
    println!("  {}", final_stats);

    Ok(())
}

/// File (or defaults), then command-line overrides.
fn build_config(args: &Args) -> Result<IngestConfig> {
    let mut config = match args.config {
        Some(ref path) => IngestConfig::from_file(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => IngestConfig::default(),
    };

    if let Some(ref host) = args.broker_host {
        config.broker.host = host.clone();
    }
    if let Some(port) = args.broker_port {
        config.broker.port = port;
    }
    if let Some(ref bind) = args.bind {
        config.subscribers.bind = bind.clone();
    }
    if let Some(ref db) = args.db {
        config.store.path = db.clone();
    }
    if let Some(ref level) = args.log_level {
        config.log_level = level.clone();
    }

    config.validate()?;
    Ok(config)
}

fn cmd_gen_config(output: &Path) -> Result<()> {
    let mut config = IngestConfig::default();
    config.broker.host = "mosquitto".into();

    let content = format!(
        r#"# Sensor Ingestion Service Configuration
# Generated by sensor-ingest gen-config

{}
"#,
        config.to_toml()?
    );

    std::fs::write(output, content)?;
    println!("Generated configuration file: {}", output.display());
    Ok(())
}

fn cmd_validate(path: &Path) -> Result<()> {
    match IngestConfig::from_file(path) {
        Ok(config) => {
            println!("Configuration valid!");
            println!();
            println!(
                "Broker:      {}:{} (filter '{}')",
                config.broker.host, config.broker.port, config.broker.topic_filter
            );
            println!(
                "Reconnect:   {}ms .. {}ms",
                config.broker.reconnect.initial_delay_ms, config.broker.reconnect.max_delay_ms
            );
            println!("Store:       {}", config.store.path);
            println!(
                "Subscribers: ws://{}/ws (max {})",
                config.subscribers.bind, config.subscribers.max_clients
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration invalid: {}", e);
            std::process::exit(1);
        }
    }
}

fn cmd_stats(config: &IngestConfig) -> Result<()> {
    let store = SqliteSink::open(&config.store.path)?;

    println!("Store: {}", config.store.path);
    println!("Total readings: {}", store.count()?);
    println!();
    for (sensor_id, count) in store.sensors()? {
        println!("  {:<24} {:>10}", sensor_id, count);
    }
    Ok(())
}

fn cmd_recent(config: &IngestConfig, limit: usize) -> Result<()> {
    let store = SqliteSink::open(&config.store.path)?;

    println!(
        "{:<26} {:<20} {:>10} {:>8}",
        "received_at", "sensor_id", "co2_ppm", "temp_c"
    );
    for reading in store.recent(limit)? {
        println!(
            "{:<26} {:<20} {:>10.2} {:>8.2}",
            reading.received_at.format("%Y-%m-%d %H:%M:%S%.3f"),
            reading.sensor_id,
            reading.co2_ppm,
            reading.temperature_celsius
        );
    }
    Ok(())
}
