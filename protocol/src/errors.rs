use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("No route for topic {0}")]
    UnroutedTopic(String),

    #[error("JSON encoding error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("MQTT error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
