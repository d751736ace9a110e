use crate::errors::{Error, Result};
use crate::metrics::{
    BASELINE_UPDATES_TOTAL, BASELINE_UPDATE_LATENCY_SECONDS, PENDING_SAMPLES,
    SWEEP_REPUBLISHES_TOTAL,
};
use crate::model::BaselineProfile;
use crate::store::DeviceStore;
use chrono::{DateTime, Timelike, Utc};
use protocol::bus::{publish_json, Publisher};
use protocol::{topics, HourlyValue};
use rumqttc::QoS;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Samples held per device while the database is unavailable. Two days of
/// hourly values; older ones are dropped first.
const MAX_PENDING_PER_DEVICE: usize = 48;

/// Publishes the baseline slot for `hour`, retained so a reconnecting edge
/// picks it up immediately.
pub async fn publish_baseline(
    publisher: &dyn Publisher,
    device_id: &str,
    profile: &BaselineProfile,
    hour: u32,
) -> Result<HourlyValue> {
    let value = HourlyValue {
        hour,
        wattage: profile.slot(hour).unwrap_or(0.0),
    };
    publish_json(
        publisher,
        &topics::baseline(device_id),
        QoS::AtLeastOnce,
        true,
        &value,
    )
    .await?;
    Ok(value)
}

/// Maintains each device's hour-of-day baseline from the completed-hour
/// energy the edge reports, and keeps the current hour's target published.
pub struct BaselineAverager {
    store: Arc<dyn DeviceStore>,
    publisher: Arc<dyn Publisher>,
    /// Samples whose write failed, re-applied ahead of the device's next one.
    pending: Mutex<HashMap<String, Vec<HourlyValue>>>,
}

impl BaselineAverager {
    pub fn new(store: Arc<dyn DeviceStore>, publisher: Arc<dyn Publisher>) -> Self {
        Self {
            store,
            publisher,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub async fn on_hourly_energy(
        &self,
        device_id: &str,
        value: HourlyValue,
        now: DateTime<Utc>,
    ) -> Result<BaselineProfile> {
        let mut samples = self.take_pending(device_id);
        samples.push(value);

        let timer = BASELINE_UPDATE_LATENCY_SECONDS.start_timer();
        let stored = self.store.record_samples(device_id, &samples).await;
        timer.observe_duration();

        let profile = match stored {
            Ok(Some(profile)) => profile,
            Ok(None) => return Err(Error::UnknownDevice(device_id.to_string())),
            Err(e) => {
                error!(
                    "Baseline update for {} failed, holding {} sample(s): {}",
                    device_id,
                    samples.len(),
                    e
                );
                self.requeue(device_id, samples);
                return Err(e);
            }
        };

        BASELINE_UPDATES_TOTAL.inc_by(samples.len() as f64);
        debug!(
            "Baseline for {} hour {} is now {:.2} Wh",
            device_id,
            value.hour,
            profile.slot(value.hour).unwrap_or(0.0)
        );

        if let Err(e) = publish_baseline(&*self.publisher, device_id, &profile, now.hour()).await {
            warn!("Failed to publish baseline for {}: {}", device_id, e);
        }
        Ok(profile)
    }

    /// Republishes the current hour's baseline for every associated device.
    /// Returns how many were published.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<usize> {
        let hour = now.hour();
        let devices = self.store.list_associated().await?;
        let mut published = 0;

        for record in &devices {
            let profile = match record.profile() {
                Ok(profile) => profile,
                Err(e) => {
                    warn!("Skipping {} in sweep: {}", record.device_id, e);
                    continue;
                }
            };
            match publish_baseline(&*self.publisher, &record.device_id, &profile, hour).await {
                Ok(_) => published += 1,
                Err(e) => warn!("Sweep publish for {} failed: {}", record.device_id, e),
            }
        }

        SWEEP_REPUBLISHES_TOTAL.inc_by(published as f64);
        Ok(published)
    }

    pub async fn run_sweeps(&self, period: Duration) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            match self.sweep(Utc::now()).await {
                Ok(count) => info!("Sweep republished {} baseline(s)", count),
                Err(e) => error!("Baseline sweep failed: {}", e),
            }
        }
    }

    #[cfg(test)]
    pub fn pending_count(&self, device_id: &str) -> usize {
        self.pending
            .lock()
            .map(|pending| pending.get(device_id).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    fn take_pending(&self, device_id: &str) -> Vec<HourlyValue> {
        let mut pending = match self.pending.lock() {
            Ok(pending) => pending,
            Err(poisoned) => poisoned.into_inner(),
        };
        let samples = pending.remove(device_id).unwrap_or_default();
        PENDING_SAMPLES.set(pending.values().map(Vec::len).sum::<usize>() as f64);
        samples
    }

    /// Puts `samples` back ahead of anything queued for the device while
    /// they were in flight.
    fn requeue(&self, device_id: &str, samples: Vec<HourlyValue>) {
        let mut pending = match self.pending.lock() {
            Ok(pending) => pending,
            Err(poisoned) => poisoned.into_inner(),
        };
        let queued = pending.entry(device_id.to_string()).or_default();
        let later = std::mem::replace(queued, samples);
        queued.extend(later);

        if queued.len() > MAX_PENDING_PER_DEVICE {
            let excess = queued.len() - MAX_PENDING_PER_DEVICE;
            warn!("Dropping {} oldest pending sample(s) for {}", excess, device_id);
            queued.drain(..excess);
        }
        PENDING_SAMPLES.set(pending.values().map(Vec::len).sum::<usize>() as f64);
    }
}
