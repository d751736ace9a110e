use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("MQTT error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("Unknown device {0}")]
    UnknownDevice(String),

    #[error("Invalid association code: {0}")]
    InvalidCode(String),

    #[error("No unclaimed device matches that association code")]
    NoMatchingDevice,

    #[error("Association code prefix matches more than one device")]
    AmbiguousCode,

    #[error("Device {0} was claimed by someone else")]
    AlreadyClaimed(String),

    #[error("Invalid owner: {0}")]
    InvalidOwner(String),

    #[error("Could not allocate a unique association code for {0}")]
    CodeAllocation(String),

    #[error("Corrupt record for device {device_id}: {reason}")]
    CorruptRecord { device_id: String, reason: String },
}

pub type Result<T> = std::result::Result<T, Error>;
