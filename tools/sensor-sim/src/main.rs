// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Sensor Simulator - publish synthetic readings to an MQTT broker.
//!
//! Each tick publishes one reading per sensor on `sensors/<id>/data`:
//!
//! ```json
//! {"co2_ppm": 415.87, "temperature": 27.42}
//! ```
//!
//! CO2 is 415 +/- 2.5 ppm, temperature 28 +/- 1 C, both rounded to two
//! decimals.
//!
//! # Usage
//!
//! ```bash
//! # One sensor, every 5 seconds
//! sensor-sim
//!
//! # Several sensors, faster, stop after 100 ticks
//! sensor-sim --sensor INDUSTRY-001 --sensor INDUSTRY-002 --interval-ms 500 --count 100
//! ```

use anyhow::Result;
use clap::Parser;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use sensor_ingest::decoder::{TOPIC_PREFIX, TOPIC_SUFFIX};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Sensor Simulator
#[derive(Parser, Debug)]
#[command(name = "sensor-sim")]
#[command(about = "Sensor simulator - publish synthetic CO2/temperature readings over MQTT")]
#[command(version)]
struct Args {
    /// MQTT broker host
    #[arg(long, default_value = "localhost")]
    host: String,

    /// MQTT broker port
    #[arg(short, long, default_value_t = 1883)]
    port: u16,

    /// Sensor id (repeat for several sensors)
    #[arg(short, long = "sensor", default_value = "INDUSTRY-001")]
    sensors: Vec<String>,

    /// Publish interval in milliseconds
    #[arg(short, long, default_value_t = 5000)]
    interval_ms: u64,

    /// Stop after this many ticks (0 = run until Ctrl+C)
    #[arg(short, long, default_value_t = 0)]
    count: u64,

    /// MQTT client id
    #[arg(long, default_value = "sensor-sim")]
    client_id: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let mut options = MqttOptions::new(&args.client_id, &args.host, args.port);
    options.set_keep_alive(Duration::from_secs(30));
    let (client, mut eventloop) = AsyncClient::new(options, 64);

    // The event loop must be polled for anything to go out.
    let endpoint = format!("mqtt://{}:{}", args.host, args.port);
    let driver = tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => info!("Connected to {}", endpoint),
                Ok(_) => {}
                Err(e) => {
                    warn!("Connection error: {} (retrying)", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    });

    info!(
        "Publishing {} sensor(s) every {} ms. Press Ctrl+C to stop.",
        args.sensors.len(),
        args.interval_ms
    );

    let mut rng = fastrand::Rng::new();
    let mut interval = tokio::time::interval(Duration::from_millis(args.interval_ms.max(1)));
    let mut ticks = 0u64;

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = tokio::signal::ctrl_c() => break,
        }

        publish_tick(&client, &args.sensors, &mut rng);

        ticks += 1;
        if args.count > 0 && ticks >= args.count {
            break;
        }
    }

    info!("Stopping after {} ticks", ticks);
    let _ = client.try_disconnect();
    // Give the event loop a moment to flush the last publishes.
    tokio::time::sleep(Duration::from_millis(200)).await;
    driver.abort();

    Ok(())
}

/// Queue one reading per sensor. Never waits: while the broker is
/// unreachable the request queue fills and readings are skipped.
/// Returns how many were queued.
fn publish_tick(client: &AsyncClient, sensors: &[String], rng: &mut fastrand::Rng) -> usize {
    let mut queued = 0;
    for sensor in sensors {
        let topic = topic_for(sensor);
        let payload = sample(rng);
        match client.try_publish(&topic, QoS::AtLeastOnce, false, payload.to_string()) {
            Ok(()) => {
                info!("Published to {}: {}", topic, payload);
                queued += 1;
            }
            Err(e) => warn!("Skipped reading for {}: {}", topic, e),
        }
    }
    queued
}

fn topic_for(sensor_id: &str) -> String {
    format!("{}/{}/{}", TOPIC_PREFIX, sensor_id, TOPIC_SUFFIX)
}

/// One synthetic reading payload.
fn sample(rng: &mut fastrand::Rng) -> Value {
    let co2 = 415.0 + (rng.f64() * 5.0 - 2.5);
    let temperature = 28.0 + (rng.f64() * 2.0 - 1.0);
    json!({
        "co2_ppm": round2(co2),
        "temperature": round2(temperature),
    })
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_samples_stay_in_range() {
        let mut rng = fastrand::Rng::with_seed(7);
        for _ in 0..1000 {
            let payload = sample(&mut rng);
            let co2 = payload["co2_ppm"].as_f64().unwrap();
            let temp = payload["temperature"].as_f64().unwrap();
            assert!((412.5..=417.5).contains(&co2), "co2 {}", co2);
            assert!((27.0..=29.0).contains(&temp), "temp {}", temp);
            assert_eq!(round2(co2), co2);
        }
    }

    #[test]
    fn test_published_messages_decode() {
        let mut rng = fastrand::Rng::with_seed(42);
        let topic = topic_for("INDUSTRY-001");
        let payload = sample(&mut rng).to_string();

        let reading = sensor_ingest::decode(&topic, payload.as_bytes(), Utc::now()).unwrap();
        assert_eq!(reading.sensor_id, "INDUSTRY-001");
    }

    #[tokio::test]
    async fn test_publish_skips_when_queue_full() {
        // Nobody polls the event loop, as when the broker is down.
        let (client, _eventloop) =
            AsyncClient::new(MqttOptions::new("sim-test", "127.0.0.1", 1883), 1);
        let sensors = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let mut rng = fastrand::Rng::with_seed(1);

        assert_eq!(publish_tick(&client, &sensors, &mut rng), 1);
        assert_eq!(publish_tick(&client, &sensors, &mut rng), 0);
    }

    #[test]
    fn test_round2() {
        assert_eq!(round2(415.876), 415.88);
        assert_eq!(round2(-1.234), -1.23);
    }
}
