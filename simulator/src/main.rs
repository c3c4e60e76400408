mod telemetry;

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use clap::Parser;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use telemetry::{Command, Device};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Emulates a two-channel power controller on the MQTT bus.
#[derive(Debug, Parser)]
#[command(name = "simulator", version)]
struct Args {
    #[arg(long, env = "MQTT_BROKER", default_value = "localhost")]
    broker: String,

    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    port: u16,

    #[arg(long, env = "MQTT_TOPIC_PREFIX", default_value = "home")]
    prefix: String,

    #[arg(long, env = "DEVICE_ID", default_value = "esp32_001")]
    device_id: String,

    /// Telemetry period
    #[arg(long, env = "INTERVAL_MS", default_value_t = 2000)]
    interval_ms: u64,

    /// Load on relay 1, in watts
    #[arg(long, default_value_t = 60.0)]
    load1_watts: f64,

    /// Load on relay 3, in watts
    #[arg(long, default_value_t = 40.0)]
    load3_watts: f64,

    /// Publish an overvoltage sample every N samples (0 = never)
    #[arg(long, default_value_t = 0)]
    spike_every: u64,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    info!("Starting device simulator");
    info!(
        "Broker: {}:{}, device: {}, interval: {}ms",
        args.broker, args.port, args.device_id, args.interval_ms
    );

    let client_id = format!("sim-{}-{}", args.device_id, uuid::Uuid::new_v4().simple());
    let mut mqtt_options = MqttOptions::new(client_id, &args.broker, args.port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    mqtt_options.set_clean_session(true);

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 100);

    let device = Arc::new(Mutex::new(Device::new(
        args.device_id.clone(),
        args.load1_watts,
        args.load3_watts,
    )));

    let cmd_topic = format!("{}/{}/cmd", args.prefix, args.device_id);
    let ack_topic = format!("{}/{}/ack", args.prefix, args.device_id);
    let telemetry_topic = format!("{}/{}/telemetry", args.prefix, args.device_id);

    // Event loop: (re)subscribe on connect, apply commands, ack them
    {
        let client = client.clone();
        let device = device.clone();
        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("Connected, subscribing to {}", cmd_topic);
                        if let Err(e) = client.try_subscribe(cmd_topic.as_str(), QoS::AtLeastOnce) {
                            error!("Failed to subscribe: {}", e);
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) if publish.topic == cmd_topic => {
                        let cmd = match serde_json::from_slice::<Command>(&publish.payload) {
                            Ok(cmd) => cmd,
                            Err(e) => {
                                warn!("Ignoring malformed command: {}", e);
                                continue;
                            }
                        };

                        let ack = device
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .apply(&cmd);
                        let Some(ack) = ack else {
                            warn!("Ignoring command for unknown channel {}", cmd.ch);
                            continue;
                        };
                        info!(
                            "Relay {} -> {} ({})",
                            cmd.ch,
                            cmd.state,
                            cmd.reason.as_deref().unwrap_or("-")
                        );

                        match serde_json::to_vec(&ack) {
                            Ok(payload) => {
                                if let Err(e) =
                                    client.try_publish(ack_topic.as_str(), QoS::AtMostOnce, false, payload)
                                {
                                    warn!("Failed to publish ack: {}", e);
                                }
                            }
                            Err(e) => error!("Failed to serialize ack: {}", e),
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("MQTT eventloop error: {}", e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });
    }

    let period = Duration::from_millis(args.interval_ms.max(100));
    let mut ticker = tokio::time::interval(period);
    let mut counter = 0u64;

    loop {
        ticker.tick().await;
        counter += 1;

        let spike = args.spike_every > 0 && counter % args.spike_every == 0;
        let sample = {
            let mut rng = rand::thread_rng();
            device
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .sample(Utc::now().timestamp(), period.as_secs_f64(), spike, &mut rng)
        };
        if spike {
            info!("Injecting overvoltage sample ({:.1} V)", sample.voltage);
        }

        let payload = match serde_json::to_string(&sample) {
            Ok(p) => p,
            Err(e) => {
                error!("Failed to serialize telemetry: {}", e);
                continue;
            }
        };

        match client
            .publish(&telemetry_topic, QoS::AtLeastOnce, false, payload)
            .await
        {
            Ok(_) => debug!(
                "Published #{}: relay={:?} e1={:.4}Wh e3={:.4}Wh",
                counter, sample.relay, sample.e1_wh, sample.e3_wh
            ),
            Err(e) => warn!("Failed to publish: {}", e),
        }

        if counter % 100 == 0 {
            info!("Published {} samples", counter);
        }
    }
}
