use crate::device::OutletReading;
use crate::errors::{Error, Result};
use crate::registry::DeviceRegistry;
use chrono::{DateTime, Timelike, Utc};
use protocol::{HourlyValue, OutletStatus};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

const SECONDS_PER_HOUR: f64 = 3600.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollState {
    pub total_wattage: f64,
    /// Watt-hours drawn since the start of the current hour.
    pub energy_wh: f64,
}

pub struct UsagePoller {
    state: PollState,
    last_poll: DateTime<Utc>,
    readings: BTreeMap<String, OutletStatus>,
    device_timeout: Duration,
}

impl UsagePoller {
    pub fn new(started: DateTime<Utc>, device_timeout: Duration) -> Self {
        Self {
            state: PollState {
                total_wattage: 0.0,
                energy_wh: 0.0,
            },
            last_poll: started,
            readings: BTreeMap::new(),
            device_timeout,
        }
    }

    pub fn state(&self) -> &PollState {
        &self.state
    }

    pub fn readings(&self) -> &BTreeMap<String, OutletStatus> {
        &self.readings
    }

    /// Reads every registered outlet concurrently, each bounded by the device
    /// timeout. An outlet that fails keeps its last reading, marked stale, and
    /// is left out of the total. Returns the new total wattage.
    pub async fn sample(&mut self, registry: &DeviceRegistry) -> f64 {
        let mut reads = JoinSet::new();
        for (alias, outlet) in registry.iter() {
            let alias = alias.clone();
            let outlet = outlet.clone();
            let limit = self.device_timeout;
            reads.spawn(async move {
                let reading = match timeout(limit, outlet.read()).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::unreachable(&alias, format!("timed out after {:?}", limit))),
                };
                (alias, reading)
            });
        }

        let mut fresh: HashMap<String, Result<OutletReading>> = HashMap::new();
        while let Some(joined) = reads.join_next().await {
            match joined {
                Ok((alias, reading)) => {
                    fresh.insert(alias, reading);
                }
                Err(e) => error!("Outlet read task failed: {}", e),
            }
        }

        self.readings.retain(|alias, _| registry.contains(alias));

        for alias in registry.aliases() {
            match fresh.remove(&alias) {
                Some(Ok(reading)) => {
                    self.readings.insert(
                        alias,
                        OutletStatus {
                            enabled: reading.enabled,
                            wattage: reading.wattage,
                            stale: false,
                        },
                    );
                }
                Some(Err(e)) => {
                    warn!("{}", e);
                    self.mark_stale(&alias);
                }
                None => self.mark_stale(&alias),
            }
        }

        self.state.total_wattage = total_of(&self.readings);
        self.state.total_wattage
    }

    fn mark_stale(&mut self, alias: &str) {
        if let Some(status) = self.readings.get_mut(alias) {
            status.stale = true;
        }
    }

    /// Integrates the current total over the time since the last poll.
    ///
    /// When `now` falls in a later hour than the previous poll, the energy
    /// gathered so far, this poll's share included, is returned tagged with
    /// the previous poll's hour and the accumulator restarts from zero.
    pub fn accumulate(&mut self, now: DateTime<Utc>) -> Option<HourlyValue> {
        let previous = self.last_poll;
        let elapsed = (now - previous).num_milliseconds().max(0) as f64 / 1000.0;

        let added = self.state.total_wattage * (elapsed / SECONDS_PER_HOUR);
        self.state.energy_wh += added;
        self.last_poll = now;

        debug!(
            "Polling at {} (UTC), added {:.4} Wh",
            now.format("%H:%M:%S"),
            added
        );

        if !starts_new_hour(previous, now) {
            return None;
        }

        let finished = HourlyValue {
            hour: previous.hour(),
            wattage: self.state.energy_wh,
        };
        info!(
            "Hour {} (UTC) closed with {:.3} Wh",
            finished.hour, finished.wattage
        );
        self.state.energy_wh = 0.0;
        Some(finished)
    }
}

fn total_of(readings: &BTreeMap<String, OutletStatus>) -> f64 {
    readings
        .values()
        .filter(|status| !status.stale)
        .map(|status| status.wattage)
        .sum()
}

/// True when `now` lies in a different clock hour than `previous`, including
/// gaps of whole days that land on the same hour-of-day.
fn starts_new_hour(previous: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    previous.hour() != now.hour() || previous.date_naive() != now.date_naive()
}
