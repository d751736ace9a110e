use crate::errors::{ProtocolError, Result};
use crate::messages::encode;
use async_trait::async_trait;
use rumqttc::{AsyncClient, QoS};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

const INITIAL_BACKOFF_MS: u64 = 100;
const MAX_BACKOFF_MS: u64 = 30_000;

/// Outbound half of the bus. The services only need to publish, so this is
/// the capability they are constructed with.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, qos: QoS, retain: bool, payload: Vec<u8>) -> Result<()>;
}

#[async_trait]
impl Publisher for AsyncClient {
    async fn publish(&self, topic: &str, qos: QoS, retain: bool, payload: Vec<u8>) -> Result<()> {
        AsyncClient::publish(self, topic, qos, retain, payload)
            .await
            .map_err(ProtocolError::Mqtt)
    }
}

#[async_trait]
impl<T: Publisher + ?Sized> Publisher for Arc<T> {
    async fn publish(&self, topic: &str, qos: QoS, retain: bool, payload: Vec<u8>) -> Result<()> {
        (**self).publish(topic, qos, retain, payload).await
    }
}

/// Serializes `message` as JSON and publishes it.
pub async fn publish_json<P, T>(
    publisher: &P,
    topic: &str,
    qos: QoS,
    retain: bool,
    message: &T,
) -> Result<()>
where
    P: Publisher + ?Sized,
    T: Serialize + Sync,
{
    let payload = encode(message)?;
    publisher.publish(topic, qos, retain, payload).await
}

/// Exponential reconnect delay, reset once a connection is acknowledged.
#[derive(Debug, Clone)]
pub struct Backoff {
    current_ms: u64,
}

impl Backoff {
    pub fn new() -> Self {
        Self {
            current_ms: INITIAL_BACKOFF_MS,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = Duration::from_millis(self.current_ms);
        self.current_ms = (self.current_ms * 2).min(MAX_BACKOFF_MS);
        delay
    }

    pub fn reset(&mut self) {
        self.current_ms = INITIAL_BACKOFF_MS;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(any(test, feature = "test-util"))]
pub use memory::{MemoryPublisher, Published};

#[cfg(any(test, feature = "test-util"))]
mod memory {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    pub struct Published {
        pub topic: String,
        pub qos: QoS,
        pub retain: bool,
        pub payload: Vec<u8>,
    }

    impl Published {
        pub fn json(&self) -> serde_json::Value {
            serde_json::from_slice(&self.payload).unwrap_or(serde_json::Value::Null)
        }
    }

    /// Records every publish instead of sending it; optionally fails them all.
    #[derive(Debug, Default)]
    pub struct MemoryPublisher {
        published: Mutex<Vec<Published>>,
        fail: Mutex<bool>,
    }

    impl MemoryPublisher {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_failing(&self, fail: bool) {
            *self.fail.lock().unwrap() = fail;
        }

        pub fn published(&self) -> Vec<Published> {
            self.published.lock().unwrap().clone()
        }

        pub fn on_topic(&self, topic: &str) -> Vec<Published> {
            self.published()
                .into_iter()
                .filter(|p| p.topic == topic)
                .collect()
        }
    }

    #[async_trait]
    impl Publisher for MemoryPublisher {
        async fn publish(
            &self,
            topic: &str,
            qos: QoS,
            retain: bool,
            payload: Vec<u8>,
        ) -> Result<()> {
            if *self.fail.lock().unwrap() {
                return Err(ProtocolError::InvalidMessage(format!(
                    "publish to {} rejected",
                    topic
                )));
            }
            self.published.lock().unwrap().push(Published {
                topic: topic.to_string(),
                qos,
                retain,
                payload,
            });
            Ok(())
        }
    }
}
