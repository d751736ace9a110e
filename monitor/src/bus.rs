use crate::mailbox::{Inbound, Mailbox};
use chrono::Utc;
use protocol::bus::Backoff;
use protocol::messages::decode;
use protocol::topics::{self, Route};
use protocol::validate::validate_hourly;
use protocol::{HourlyValue, SetEnabled};
use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Packet, QoS};
use std::time::Duration;
use tracing::{debug, error, info, warn};

const REQUEST_CHANNEL_CAPACITY: usize = 100;

const ROUTES: &[Route<Inbound>] = &[
    Route {
        filter: topics::SET_ENABLED,
        decode: decode_set_enabled,
    },
    Route {
        filter: topics::BASELINE_FILTER,
        decode: decode_baseline,
    },
];

fn decode_set_enabled(_levels: &[&str], payload: &[u8]) -> protocol::Result<Inbound> {
    Ok(Inbound::SetEnabled(decode::<SetEnabled>(payload)?))
}

fn decode_baseline(_levels: &[&str], payload: &[u8]) -> protocol::Result<Inbound> {
    let baseline = decode::<HourlyValue>(payload)?;
    validate_hourly(&baseline)?;
    Ok(Inbound::Baseline(baseline))
}

pub struct BusSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive: Duration,
    pub device_id: String,
}

impl BusSettings {
    pub fn liveness_topic(&self) -> String {
        topics::client_state(&self.client_id)
    }

    pub fn subscriptions(&self) -> Vec<String> {
        vec![
            topics::SET_ENABLED.to_string(),
            topics::baseline(&self.device_id),
        ]
    }
}

/// Builds the client with a retained "0" last will on the liveness topic so
/// the broker announces an unclean disconnect on our behalf.
pub fn connect(settings: &BusSettings) -> (AsyncClient, EventLoop) {
    info!(
        "Connecting to MQTT broker at {}:{} as {}",
        settings.host, settings.port, settings.client_id
    );

    let mut mqtt_options = MqttOptions::new(&settings.client_id, &settings.host, settings.port);
    mqtt_options.set_keep_alive(settings.keep_alive);
    mqtt_options.set_clean_session(true);
    mqtt_options.set_last_will(LastWill::new(
        settings.liveness_topic(),
        topics::OFFLINE,
        QoS::ExactlyOnce,
        true,
    ));

    AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY)
}

/// Drives the MQTT connection forever. Every (re)connect republishes the
/// retained liveness flag and re-subscribes; errors back off exponentially
/// before the next reconnect attempt.
pub async fn run_event_loop(
    client: AsyncClient,
    mut eventloop: EventLoop,
    settings: BusSettings,
    mailbox: Mailbox,
) {
    let liveness = settings.liveness_topic();
    let subscriptions = settings.subscriptions();
    let mut backoff = Backoff::new();

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                backoff.reset();
                info!("Connected to MQTT broker");
                on_connected(&client, &liveness, &subscriptions);
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                debug!(
                    "Received message on topic {}, size: {} bytes",
                    publish.topic,
                    publish.payload.len()
                );
                if let Err(e) = handle_publish(&mailbox, &publish.topic, &publish.payload) {
                    warn!("Dropping message on {}: {}", publish.topic, e);
                }
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

fn on_connected(client: &AsyncClient, liveness: &str, subscriptions: &[String]) {
    if let Err(e) = client.try_publish(liveness, QoS::ExactlyOnce, true, topics::ONLINE) {
        error!("Failed to publish liveness: {}", e);
    }
    for topic in subscriptions {
        match client.try_subscribe(topic, QoS::AtLeastOnce) {
            Ok(()) => info!("Subscribed to {} with QoS 1", topic),
            Err(e) => error!("Failed to subscribe to {}: {}", topic, e),
        }
    }
}

/// Decodes one inbound publish through the dispatch table and hands it to the
/// poll task. Malformed payloads come back as errors for the caller to log.
pub fn handle_publish(mailbox: &Mailbox, topic: &str, payload: &[u8]) -> protocol::Result<()> {
    let inbound = topics::dispatch(ROUTES, topic, payload)?;
    mailbox.deliver(inbound, Utc::now())
}
