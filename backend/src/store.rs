use crate::errors::Result;
use crate::model::{BaselineProfile, DeviceRecord};
use async_trait::async_trait;
use protocol::HourlyValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// Another connection event registered the device first.
    DeviceExists,
    /// The association code collided with an existing one.
    CodeTaken,
}

/// Durable device records. Every method is scoped to a single device row so
/// concurrent traffic for different devices never contends.
#[async_trait]
pub trait DeviceStore: Send + Sync {
    async fn get(&self, device_id: &str) -> Result<Option<DeviceRecord>>;

    async fn insert_parked(&self, record: &DeviceRecord) -> Result<InsertOutcome>;

    /// Folds the samples into the device's baseline, in order, as one atomic
    /// read-modify-write. Returns `None` when the device is not registered.
    async fn record_samples(
        &self,
        device_id: &str,
        samples: &[HourlyValue],
    ) -> Result<Option<BaselineProfile>>;

    /// Parked devices whose association code starts with `prefix`.
    async fn find_parked_by_code_prefix(
        &self,
        prefix: &str,
        limit: i64,
    ) -> Result<Vec<DeviceRecord>>;

    /// Compare-and-set on the owner column. False when the owner had already
    /// changed.
    async fn assign_owner(&self, device_id: &str, from: &str, to: &str) -> Result<bool>;

    async fn list_owned_by(&self, owner: &str) -> Result<Vec<DeviceRecord>>;

    /// Every device with a real owner.
    async fn list_associated(&self) -> Result<Vec<DeviceRecord>>;
}
