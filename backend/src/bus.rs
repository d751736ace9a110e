use crate::averager::BaselineAverager;
use crate::errors::Result;
use crate::lifecycle::{LifecycleEvent, LifecycleManager};
use crate::metrics::{INVALID_MESSAGES_TOTAL, MESSAGES_TOTAL};
use chrono::{DateTime, Utc};
use protocol::bus::Backoff;
use protocol::messages::decode;
use protocol::topics::{self, Route};
use protocol::validate::{validate_device_id, validate_hourly};
use protocol::{BridgeState, HourlyValue, ProtocolError};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const REQUEST_CHANNEL_CAPACITY: usize = 1000;

/// Inbound traffic the backend acts on, keyed by topic pattern.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Bridge {
        device_id: String,
        state: BridgeState,
    },
    HourlyEnergy {
        device_id: String,
        value: HourlyValue,
    },
}

const ROUTES: &[Route<Inbound>] = &[
    Route {
        filter: topics::BRIDGE_STATE_FILTER,
        decode: decode_bridge,
    },
    Route {
        filter: topics::HOURLY_USAGE_FILTER,
        decode: decode_hourly,
    },
];

fn device_level(levels: &[&str], suffix: &str) -> protocol::Result<String> {
    let level = levels
        .first()
        .ok_or_else(|| ProtocolError::InvalidMessage("topic has no device level".to_string()))?
        .to_lowercase();
    let device_id = level.strip_suffix(suffix).ok_or_else(|| {
        ProtocolError::InvalidMessage(format!("{:?} lacks the {:?} suffix", level, suffix))
    })?;
    validate_device_id(device_id)?;
    Ok(device_id.to_string())
}

fn decode_bridge(levels: &[&str], payload: &[u8]) -> protocol::Result<Inbound> {
    Ok(Inbound::Bridge {
        device_id: device_level(levels, topics::BRIDGE_SUFFIX)?,
        state: BridgeState::from_payload(payload)?,
    })
}

fn decode_hourly(levels: &[&str], payload: &[u8]) -> protocol::Result<Inbound> {
    let value = decode::<HourlyValue>(payload)?;
    validate_hourly(&value)?;
    Ok(Inbound::HourlyEnergy {
        device_id: device_level(levels, "")?,
        value,
    })
}

pub fn subscriptions() -> [&'static str; 2] {
    [topics::BRIDGE_STATE_FILTER, topics::HOURLY_USAGE_FILTER]
}

/// The services inbound messages are handed to.
pub struct Handlers {
    pub lifecycle: Arc<LifecycleManager>,
    pub averager: Arc<BaselineAverager>,
}

impl Handlers {
    pub async fn handle(&self, inbound: Inbound, now: DateTime<Utc>) -> Result<()> {
        match inbound {
            Inbound::Bridge { device_id, state } => {
                let event = self.lifecycle.on_bridge_state(&device_id, state, now).await?;
                if let LifecycleEvent::Registered { .. } = event {
                    info!("Device {} parked awaiting association", device_id);
                }
            }
            Inbound::HourlyEnergy { device_id, value } => {
                self.averager
                    .on_hourly_energy(&device_id, value, now)
                    .await?;
            }
        }
        Ok(())
    }
}

pub fn connect(broker: &str, port: u16, client_id: &str) -> (AsyncClient, EventLoop) {
    info!("Connecting to MQTT broker at {}:{} as {}", broker, port, client_id);

    let mut mqtt_options = MqttOptions::new(client_id, broker, port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    mqtt_options.set_clean_session(true);

    AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY)
}

/// Decodes an inbound publish and counts it. Rejected messages are logged
/// here and come back as `None`.
pub fn route_publish(topic: &str, payload: &[u8]) -> Option<Inbound> {
    MESSAGES_TOTAL.inc();
    match topics::dispatch(ROUTES, topic, payload) {
        Ok(inbound) => Some(inbound),
        Err(e) => {
            INVALID_MESSAGES_TOTAL.inc();
            warn!("Dropping message on {}: {}", topic, e);
            None
        }
    }
}

/// Drives the MQTT connection forever. Subscriptions are renewed on every
/// connect; each message is handled on its own task so a slow device record
/// never holds up the others.
pub async fn run_event_loop(client: AsyncClient, mut eventloop: EventLoop, handlers: Arc<Handlers>) {
    let mut backoff = Backoff::new();

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                backoff.reset();
                info!("Connected to MQTT broker");
                for topic in subscriptions() {
                    match client.try_subscribe(topic, QoS::AtLeastOnce) {
                        Ok(()) => info!("Subscribed to {} with QoS 1", topic),
                        Err(e) => error!("Failed to subscribe to {}: {}", topic, e),
                    }
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                debug!(
                    "Received message on topic {}, size: {} bytes",
                    publish.topic,
                    publish.payload.len()
                );
                let Some(inbound) = route_publish(&publish.topic, &publish.payload) else {
                    continue;
                };
                let handlers = handlers.clone();
                tokio::spawn(async move {
                    if let Err(e) = handlers.handle(inbound, Utc::now()).await {
                        error!("Failed to handle message on {}: {}", publish.topic, e);
                    }
                });
            }
            Ok(_) => {}
            Err(e) => {
                let delay = backoff.next_delay();
                error!("MQTT connection error: {}. Reconnecting in {:?}", e, delay);
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryDeviceStore;
    use protocol::bus::MemoryPublisher;

    #[test]
    fn test_bridge_state_decodes() {
        assert_eq!(
            route_publish("$SYS/broker/connection/B827EB01A2C3_broker/state", b"1"),
            Some(Inbound::Bridge {
                device_id: "b827eb01a2c3".to_string(),
                state: BridgeState::Up,
            })
        );
        assert_eq!(
            route_publish("$SYS/broker/connection/b827eb01a2c3_broker/state", b"0"),
            Some(Inbound::Bridge {
                device_id: "b827eb01a2c3".to_string(),
                state: BridgeState::Down,
            })
        );
    }

    #[test]
    fn test_hourly_energy_decodes() {
        assert_eq!(
            route_publish(
                "devices/b827eb01a2c3/monitor/usage/last_hour",
                br#"{"hour": 14, "wattage": 80.0}"#
            ),
            Some(Inbound::HourlyEnergy {
                device_id: "b827eb01a2c3".to_string(),
                value: HourlyValue {
                    hour: 14,
                    wattage: 80.0
                },
            })
        );
    }

    #[test]
    fn test_malformed_messages_are_dropped() {
        let cases: [(&str, &[u8]); 6] = [
            ("$SYS/broker/connection/b827eb01a2c3_broker/state", b"up"),
            ("$SYS/broker/connection/b827eb01a2c3/state", b"1"),
            ("$SYS/broker/connection/not-hex_broker/state", b"1"),
            ("devices/b827eb01a2c3/monitor/usage/last_hour", br#"{"hour": 24, "wattage": 1}"#),
            ("devices/b827eb01a2c3/monitor/usage/last_hour", br#"{"hour": 3}"#),
            ("devices/b827eb01a2c3/monitor/average", br#"{"hour": 3, "wattage": 1}"#),
        ];
        for (topic, payload) in cases {
            assert_eq!(route_publish(topic, payload), None, "{}", topic);
        }
    }

    #[tokio::test]
    async fn test_handlers_route_to_services() {
        let store = Arc::new(MemoryDeviceStore::new());
        let publisher = Arc::new(MemoryPublisher::new());
        let handlers = Handlers {
            lifecycle: Arc::new(LifecycleManager::new(store.clone(), publisher.clone())),
            averager: Arc::new(BaselineAverager::new(store.clone(), publisher.clone())),
        };
        let now = Utc::now();

        handlers
            .handle(
                Inbound::Bridge {
                    device_id: "ab12".to_string(),
                    state: BridgeState::Up,
                },
                now,
            )
            .await
            .unwrap();
        assert!(store.snapshot("ab12").is_some_and(|r| r.is_parked()));

        handlers
            .handle(
                Inbound::HourlyEnergy {
                    device_id: "ab12".to_string(),
                    value: HourlyValue {
                        hour: 2,
                        wattage: 15.0,
                    },
                },
                now,
            )
            .await
            .unwrap();
        assert_eq!(store.snapshot("ab12").unwrap().averages[2], 15.0);

        let unknown = handlers
            .handle(
                Inbound::HourlyEnergy {
                    device_id: "ffff".to_string(),
                    value: HourlyValue {
                        hour: 2,
                        wattage: 15.0,
                    },
                },
                now,
            )
            .await;
        assert!(unknown.is_err());
        assert!(store.snapshot("ffff").is_none());
    }
}
