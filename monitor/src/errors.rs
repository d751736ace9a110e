use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Device {alias} unreachable: {reason}")]
    DeviceUnreachable { alias: String, reason: String },

    #[error("Unknown device {0}")]
    UnknownDevice(String),

    #[error("Discovery failed: {0}")]
    Discovery(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn unreachable(alias: &str, reason: impl ToString) -> Self {
        Error::DeviceUnreachable {
            alias: alias.to_string(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
