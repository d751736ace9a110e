use crate::errors::{ProtocolError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Energy or baseline figure for one hour of the day.
///
/// Used both for the completed-hour energy the edge reports
/// (`devices/<id>/monitor/usage/last_hour`) and the baseline the backend
/// republishes (`devices/<id>/monitor/average`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HourlyValue {
    pub hour: u32,
    pub wattage: f64,
}

/// Color as `[hue, saturation, value]`, each in `0.0..=1.0`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HsvColor(pub f64, pub f64, pub f64);

impl HsvColor {
    pub fn hue(&self) -> f64 {
        self.0
    }

    pub fn saturation(&self) -> f64 {
        self.1
    }

    pub fn value(&self) -> f64 {
        self.2
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutletStatus {
    pub enabled: bool,
    pub wattage: f64,
    /// Set when the outlet could not be read this tick and the values are
    /// carried over from the last successful read.
    #[serde(default, skip_serializing_if = "is_false")]
    pub stale: bool,
}

fn is_false(v: &bool) -> bool {
    !*v
}

/// Published retained on `monitor/usage` every poll tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub total_wattage: f64,
    pub difference: f64,
    pub diff_color: HsvColor,
    pub outlets: BTreeMap<String, OutletStatus>,
}

/// Control request on `monitor/set_enabled`, keyed by outlet alias.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetEnabled {
    pub outlets: BTreeMap<String, bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssociationNotice {
    pub associated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl AssociationNotice {
    pub fn unassociated(code: impl Into<String>) -> Self {
        Self {
            associated: false,
            code: Some(code.into()),
        }
    }

    pub fn associated() -> Self {
        Self {
            associated: true,
            code: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LampColor {
    pub h: f64,
    pub s: f64,
}

/// Configuration pushed to a co-located lamp so it renders the deviation
/// color.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LampConfig {
    pub client: String,
    pub color: LampColor,
    pub brightness: f64,
    pub on: bool,
}

impl LampConfig {
    pub fn from_color(client: impl Into<String>, color: HsvColor) -> Self {
        Self {
            client: client.into(),
            color: LampColor {
                h: color.hue(),
                s: color.saturation(),
            },
            brightness: color.value(),
            on: true,
        }
    }
}

/// Broker bridge liveness as reported on `$SYS/broker/connection/<id>_broker/state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Up,
    Down,
}

impl BridgeState {
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        match payload {
            b"1" => Ok(BridgeState::Up),
            b"0" => Ok(BridgeState::Down),
            other => Err(ProtocolError::InvalidMessage(format!(
                "unexpected bridge state payload {:?}",
                String::from_utf8_lossy(other)
            ))),
        }
    }
}

/// Parses a JSON payload; any shape mismatch is reported as an invalid message.
pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    serde_json::from_slice(payload)
        .map_err(|e| ProtocolError::InvalidMessage(format!("JSON parse error: {}", e)))
}

pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(message)?)
}
