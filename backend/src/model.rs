use crate::errors::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Owner of every device nobody has claimed yet.
pub const PARKED_OWNER: &str = "parked_device_user";
pub const DEFAULT_NAME: &str = "New Monitor";

pub const HOURS_PER_DAY: usize = 24;

const PREVIOUS_WEIGHT: f64 = 0.8;
const RECENT_WEIGHT: f64 = 0.2;

/// Exponentially recency-weighted average of a stored baseline and a new
/// sample. Always lies between the two.
pub fn erwa(previous: f64, sample: f64) -> f64 {
    previous * PREVIOUS_WEIGHT + sample * RECENT_WEIGHT
}

/// Per hour-of-day energy baseline in watt-hours. A slot at 0.0 has never
/// received a sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BaselineProfile {
    slots: [f64; HOURS_PER_DAY],
}

impl BaselineProfile {
    pub fn new() -> Self {
        Self {
            slots: [0.0; HOURS_PER_DAY],
        }
    }

    pub fn from_slots(device_id: &str, slots: &[f64]) -> Result<Self> {
        let slots: [f64; HOURS_PER_DAY] =
            slots.try_into().map_err(|_| Error::CorruptRecord {
                device_id: device_id.to_string(),
                reason: format!("baseline has {} slots, expected {}", slots.len(), HOURS_PER_DAY),
            })?;
        Ok(Self { slots })
    }

    pub fn slots(&self) -> &[f64; HOURS_PER_DAY] {
        &self.slots
    }

    pub fn slot(&self, hour: u32) -> Option<f64> {
        self.slots.get(hour as usize).copied()
    }

    /// Folds one hourly sample into its slot and returns the new value. An
    /// untouched slot takes the sample as is. Hours outside 0–23 are ignored.
    pub fn record(&mut self, hour: u32, sample: f64) -> Option<f64> {
        let slot = self.slots.get_mut(hour as usize)?;
        *slot = if *slot == 0.0 { sample } else { erwa(*slot, sample) };
        Some(*slot)
    }
}

impl Default for BaselineProfile {
    fn default() -> Self {
        Self::new()
    }
}

/// Durable record of one edge device.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct DeviceRecord {
    pub device_id: String,
    pub name: String,
    pub owner: String,
    pub association_code: String,
    pub created_at: DateTime<Utc>,
    pub averages: Vec<f64>,
}

impl DeviceRecord {
    pub fn parked(device_id: &str, association_code: String, created_at: DateTime<Utc>) -> Self {
        Self {
            device_id: device_id.to_string(),
            name: DEFAULT_NAME.to_string(),
            owner: PARKED_OWNER.to_string(),
            association_code,
            created_at,
            averages: BaselineProfile::new().slots().to_vec(),
        }
    }

    pub fn is_parked(&self) -> bool {
        self.owner == PARKED_OWNER
    }

    pub fn profile(&self) -> Result<BaselineProfile> {
        BaselineProfile::from_slots(&self.device_id, &self.averages)
    }

    pub fn state(&self) -> LifecycleState {
        if self.is_parked() {
            LifecycleState::ParkedUnassociated {
                code: self.association_code.clone(),
            }
        } else {
            LifecycleState::Associated {
                owner: self.owner.clone(),
            }
        }
    }
}

/// Where a device stands in the claim workflow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleState {
    Unregistered,
    ParkedUnassociated { code: String },
    Associated { owner: String },
}

impl LifecycleState {
    pub fn of(record: Option<&DeviceRecord>) -> Self {
        record.map_or(LifecycleState::Unregistered, DeviceRecord::state)
    }

    pub fn label(&self) -> &'static str {
        match self {
            LifecycleState::Unregistered => "unregistered",
            LifecycleState::ParkedUnassociated { .. } => "parked",
            LifecycleState::Associated { .. } => "associated",
        }
    }
}

/// REST view of a device. The association code is never exposed.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceView {
    pub device_id: String,
    pub name: String,
    pub state: &'static str,
    pub associated: bool,
    pub owner: Option<String>,
    pub created_at: DateTime<Utc>,
    pub averages: Vec<f64>,
}

impl From<DeviceRecord> for DeviceView {
    fn from(record: DeviceRecord) -> Self {
        let associated = !record.is_parked();
        let state = record.state().label();
        Self {
            device_id: record.device_id,
            name: record.name,
            state,
            associated,
            owner: associated.then_some(record.owner),
            created_at: record.created_at,
            averages: record.averages,
        }
    }
}

/// REST API response wrapper
#[derive(Debug, Serialize)]
pub struct DeviceListResponse {
    pub data: Vec<DeviceView>,
    pub total: usize,
}

#[derive(Debug, Deserialize)]
pub struct ClaimRequest {
    pub code: String,
    pub user: String,
}
