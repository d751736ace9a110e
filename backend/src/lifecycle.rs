use crate::averager::publish_baseline;
use crate::errors::{Error, Result};
use crate::metrics::{CLAIMS_TOTAL, REGISTRATIONS_TOTAL};
use crate::model::{BaselineProfile, DeviceRecord, LifecycleState, PARKED_OWNER};
use crate::store::{DeviceStore, InsertOutcome};
use chrono::{DateTime, Timelike, Utc};
use protocol::bus::{publish_json, Publisher};
use protocol::{topics, AssociationNotice, BridgeState};
use rumqttc::QoS;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Shortest association-code prefix accepted for a claim.
pub const MIN_CODE_PREFIX: usize = 6;
const MAX_CODE_ATTEMPTS: usize = 3;

/// What a bridge state change led to.
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    Registered { code: String },
    NoticeRepublished,
    BaselineRepublished { hour: u32 },
    Disconnected,
}

/// Moves devices from first sight through parking to association with a
/// user, and announces each state on the device's association topic.
pub struct LifecycleManager {
    store: Arc<dyn DeviceStore>,
    publisher: Arc<dyn Publisher>,
}

impl LifecycleManager {
    pub fn new(store: Arc<dyn DeviceStore>, publisher: Arc<dyn Publisher>) -> Self {
        Self { store, publisher }
    }

    pub async fn on_bridge_state(
        &self,
        device_id: &str,
        state: BridgeState,
        now: DateTime<Utc>,
    ) -> Result<LifecycleEvent> {
        match state {
            BridgeState::Down => {
                info!("Device {} disconnected", device_id);
                Ok(LifecycleEvent::Disconnected)
            }
            BridgeState::Up => self.on_connected(device_id, now).await,
        }
    }

    async fn on_connected(&self, device_id: &str, now: DateTime<Utc>) -> Result<LifecycleEvent> {
        let mut existing = self.store.get(device_id).await?;
        if existing.is_none() {
            if let Some(code) = self.register(device_id, now).await? {
                return Ok(LifecycleEvent::Registered { code });
            }
            // Lost a registration race; carry on with the winner's record.
            existing = self.store.get(device_id).await?;
        }

        match LifecycleState::of(existing.as_ref()) {
            LifecycleState::Unregistered => Err(Error::UnknownDevice(device_id.to_string())),
            LifecycleState::ParkedUnassociated { code } => {
                info!("Parked device {} reconnected", device_id);
                self.announce(device_id, &AssociationNotice::unassociated(code))
                    .await?;
                Ok(LifecycleEvent::NoticeRepublished)
            }
            LifecycleState::Associated { owner } => {
                let profile = existing
                    .as_ref()
                    .map_or_else(|| Ok(BaselineProfile::new()), DeviceRecord::profile)?;
                let hour = now.hour();
                publish_baseline(&*self.publisher, device_id, &profile, hour).await?;
                info!("Device {} of {} reconnected", device_id, owner);
                Ok(LifecycleEvent::BaselineRepublished { hour })
            }
        }
    }

    /// Parks a first-seen device under a fresh association code. `None` when
    /// another event registered it first.
    async fn register(&self, device_id: &str, now: DateTime<Utc>) -> Result<Option<String>> {
        for _ in 0..MAX_CODE_ATTEMPTS {
            let code = Uuid::new_v4().simple().to_string();
            let record = DeviceRecord::parked(device_id, code.clone(), now);

            match self.store.insert_parked(&record).await? {
                InsertOutcome::Inserted => {
                    REGISTRATIONS_TOTAL.inc();
                    info!("Registered new device {}", device_id);
                    self.announce(device_id, &AssociationNotice::unassociated(code.clone()))
                        .await?;
                    return Ok(Some(code));
                }
                InsertOutcome::DeviceExists => return Ok(None),
                InsertOutcome::CodeTaken => {
                    warn!("Association code collision for {}, regenerating", device_id);
                }
            }
        }
        Err(Error::CodeAllocation(device_id.to_string()))
    }

    /// Associates the single parked device whose code starts with `prefix`
    /// with `user`.
    pub async fn claim(&self, prefix: &str, user: &str) -> Result<DeviceRecord> {
        let prefix = normalize_code_prefix(prefix)?;
        let user = user.trim();
        if user.is_empty() || user == PARKED_OWNER {
            return Err(Error::InvalidOwner(user.to_string()));
        }

        let mut matches = self.store.find_parked_by_code_prefix(&prefix, 2).await?;
        let mut record = match matches.len() {
            0 => return Err(Error::NoMatchingDevice),
            1 => matches.remove(0),
            _ => return Err(Error::AmbiguousCode),
        };

        if !self
            .store
            .assign_owner(&record.device_id, PARKED_OWNER, user)
            .await?
        {
            return Err(Error::AlreadyClaimed(record.device_id));
        }
        CLAIMS_TOTAL.inc();
        info!("Device {} associated with {}", record.device_id, user);
        record.owner = user.to_string();

        // Ownership is already committed; a lost notice must not undo the claim.
        if let Err(e) = self
            .announce(&record.device_id, &AssociationNotice::associated())
            .await
        {
            error!(
                "Failed to announce association of {}: {}",
                record.device_id, e
            );
        }
        Ok(record)
    }

    async fn announce(&self, device_id: &str, notice: &AssociationNotice) -> Result<()> {
        publish_json(
            &*self.publisher,
            &topics::association(device_id),
            QoS::ExactlyOnce,
            true,
            notice,
        )
        .await?;
        Ok(())
    }
}

fn normalize_code_prefix(prefix: &str) -> Result<String> {
    let prefix = prefix.trim().to_lowercase();
    if prefix.len() < MIN_CODE_PREFIX || !prefix.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(Error::InvalidCode(format!(
            "expected at least {} hex characters",
            MIN_CODE_PREFIX
        )));
    }
    Ok(prefix)
}
