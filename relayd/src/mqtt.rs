use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::errors::{Error, Result};
use crate::metrics::{ACKS_TOTAL, CHANNEL_FULL_TOTAL, INVALID_MESSAGES_TOTAL, MESSAGES_TOTAL};
use crate::model::{Channel, RelayCommand, TelemetrySample};
use crate::transport::Transport;
use crate::validate::validate;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicKind {
    Telemetry,
    Ack,
}

/// Splits `{prefix}/{device}/{kind}` into the device id and the kind.
pub fn parse_topic<'a>(prefix: &str, topic: &'a str) -> Option<(&'a str, TopicKind)> {
    let rest = topic.strip_prefix(prefix)?.strip_prefix('/')?;
    let (device_id, kind) = rest.split_once('/')?;
    if device_id.is_empty() {
        return None;
    }
    match kind {
        "telemetry" => Some((device_id, TopicKind::Telemetry)),
        "ack" => Some((device_id, TopicKind::Ack)),
        _ => None,
    }
}

/// Publishes relay commands on `{prefix}/{device}/cmd`.
#[derive(Clone)]
pub struct MqttTransport {
    client: AsyncClient,
    prefix: String,
    connected: Arc<AtomicBool>,
}

impl Transport for MqttTransport {
    fn send(&self, device_id: &str, command: &RelayCommand) -> Result<()> {
        let topic = format!("{}/{}/cmd", self.prefix, device_id);
        let payload = serde_json::to_vec(&command.to_payload())?;
        // Never waits on the broker; a full request queue is a send failure
        self.client
            .try_publish(topic, QoS::AtMostOnce, false, payload)
            .map_err(Error::Mqtt)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

/// Inbound half of the broker connection.
pub struct MqttSession {
    client: AsyncClient,
    eventloop: EventLoop,
    prefix: String,
    default_device_id: String,
    connected: Arc<AtomicBool>,
}

pub fn connect(
    broker: &str,
    port: u16,
    client_id: String,
    prefix: &str,
    default_device_id: &str,
) -> (MqttTransport, MqttSession) {
    let mut mqtt_options = MqttOptions::new(client_id, broker, port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    mqtt_options.set_clean_session(true);

    let (client, eventloop) = AsyncClient::new(mqtt_options, 1000);
    let connected = Arc::new(AtomicBool::new(false));

    let transport = MqttTransport {
        client: client.clone(),
        prefix: prefix.to_string(),
        connected: connected.clone(),
    };
    let session = MqttSession {
        client,
        eventloop,
        prefix: prefix.to_string(),
        default_device_id: default_device_id.to_string(),
        connected,
    };
    (transport, session)
}

impl MqttSession {
    /// Drives the connection, forwarding valid telemetry into `tx`.
    /// Subscriptions are renewed on every (re)connect.
    pub async fn run(mut self, tx: mpsc::Sender<TelemetrySample>) -> Result<()> {
        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    self.connected.store(true, Ordering::Relaxed);
                    info!("Connected to MQTT broker");
                    self.subscribe()?;
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let Some((device_id, kind)) = parse_topic(&self.prefix, &publish.topic) else {
                        debug!("Ignoring message on {}", publish.topic);
                        continue;
                    };

                    match kind {
                        TopicKind::Telemetry => {
                            MESSAGES_TOTAL.inc();
                            if let Err(e) = process_message(
                                &publish.payload,
                                device_id,
                                &self.default_device_id,
                                &tx,
                            )
                            .await
                            {
                                if matches!(e, Error::ChannelSend) {
                                    return Err(e);
                                }
                                INVALID_MESSAGES_TOTAL.inc();
                                warn!("Rejected telemetry on {}: {}", publish.topic, e);
                            }
                        }
                        TopicKind::Ack => handle_ack(device_id, &publish.payload),
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    self.connected.store(false, Ordering::Relaxed);
                    error!("MQTT error: {}", e);
                    // rumqttc reconnects on the next poll
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    fn subscribe(&self) -> Result<()> {
        for suffix in ["telemetry", "ack"] {
            let topic = format!("{}/+/{}", self.prefix, suffix);
            self.client.try_subscribe(topic.as_str(), QoS::AtLeastOnce)?;
            info!("Subscribed to {}", topic);
        }
        Ok(())
    }
}

/// Parses and validates one telemetry payload and queues it for the engine.
pub async fn process_message(
    payload: &[u8],
    topic_device_id: &str,
    default_device_id: &str,
    tx: &mpsc::Sender<TelemetrySample>,
) -> Result<()> {
    let raw: serde_json::Value = serde_json::from_slice(payload)
        .map_err(|e| Error::Validation(format!("JSON parse error: {}", e)))?;
    let mut sample: TelemetrySample = serde_json::from_value(raw.clone())
        .map_err(|e| Error::Validation(format!("invalid telemetry: {}", e)))?;

    if sample.device_id.is_empty() {
        sample.device_id = if topic_device_id.is_empty() {
            default_device_id.to_string()
        } else {
            topic_device_id.to_string()
        };
    }
    sample.raw = raw;

    validate(&sample)?;

    match tx.try_send(sample) {
        Ok(()) => Ok(()),
        Err(mpsc::error::TrySendError::Full(sample)) => {
            CHANNEL_FULL_TOTAL.inc();
            debug!("Telemetry queue full, waiting");
            tx.send(sample).await.map_err(|_| Error::ChannelSend)
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            error!("Telemetry queue closed");
            Err(Error::ChannelSend)
        }
    }
}

fn handle_ack(device_id: &str, payload: &[u8]) {
    ACKS_TOTAL.inc();
    let Ok(ack) = serde_json::from_slice::<serde_json::Value>(payload) else {
        info!(
            "Ack from {} (non-JSON): {}",
            device_id,
            String::from_utf8_lossy(payload)
        );
        return;
    };

    match ack["ch"].as_i64().and_then(Channel::from_device_label) {
        Some(ch) => info!("Ack from {} ch={}: {}", device_id, ch, ack),
        None => info!("Ack from {}: {}", device_id, ack),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_topic() {
        assert_eq!(
            parse_topic("home", "home/esp32_001/telemetry"),
            Some(("esp32_001", TopicKind::Telemetry))
        );
        assert_eq!(parse_topic("home", "home/dev1/ack"), Some(("dev1", TopicKind::Ack)));
        assert_eq!(parse_topic("home", "home/dev1/cmd"), None);
        assert_eq!(parse_topic("home", "home//telemetry"), None);
        assert_eq!(parse_topic("home", "homes/dev1/telemetry"), None);
        assert_eq!(parse_topic("site/a", "site/a/dev1/telemetry"), Some(("dev1", TopicKind::Telemetry)));
    }

    #[test]
    fn test_process_message_valid() {
        tokio_test::block_on(async {
            let (tx, mut rx) = mpsc::channel(10);
            let payload = br#"{"deviceId":"dev1","v1":230.5,"e1Wh":1.25,"relay":[1,0]}"#;

            assert!(process_message(payload, "dev1", "esp32_001", &tx).await.is_ok());

            let received = rx.recv().await.unwrap();
            assert_eq!(received.device_id, "dev1");
            assert_eq!(received.v1, Some(230.5));
            assert_eq!(received.raw["e1Wh"], 1.25);
        });
    }

    #[test]
    fn test_process_message_takes_device_from_topic() {
        tokio_test::block_on(async {
            let (tx, mut rx) = mpsc::channel(10);

            process_message(br#"{"v1":230.0}"#, "dev7", "esp32_001", &tx)
                .await
                .unwrap();

            assert_eq!(rx.recv().await.unwrap().device_id, "dev7");
        });
    }

    #[test]
    fn test_process_message_invalid_json() {
        tokio_test::block_on(async {
            let (tx, _rx) = mpsc::channel(10);
            let result = process_message(b"invalid json", "dev1", "esp32_001", &tx).await;
            assert!(matches!(result, Err(Error::Validation(_))));
        });
    }

    #[test]
    fn test_process_message_negative_energy() {
        tokio_test::block_on(async {
            let (tx, _rx) = mpsc::channel(10);
            let payload = br#"{"deviceId":"dev1","e3Wh":-0.5}"#;
            assert!(process_message(payload, "dev1", "esp32_001", &tx).await.is_err());
        });
    }

    #[test]
    fn test_process_message_closed_queue() {
        tokio_test::block_on(async {
            let (tx, rx) = mpsc::channel(1);
            drop(rx);
            let result = process_message(br#"{"v1":230.0}"#, "dev1", "esp32_001", &tx).await;
            assert!(matches!(result, Err(Error::ChannelSend)));
        });
    }
}
