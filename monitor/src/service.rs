use crate::command::PendingCommand;
use crate::deviation::{self, Deviation};
use crate::device::Discovery;
use crate::errors::{Error, Result};
use crate::mailbox::Inbox;
use crate::poller::UsagePoller;
use crate::registry::{DeviceRegistry, RefreshOutcome};
use chrono::{DateTime, Utc};
use protocol::bus::{publish_json, Publisher};
use protocol::topics;
use protocol::{HourlyValue, LampConfig, UsageSnapshot};
use rumqttc::QoS;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub device_id: String,
    pub client_id: String,
    pub poll_interval: Duration,
    /// Discovery is rerun every this many poll ticks.
    pub discovery_every_ticks: u64,
    pub device_timeout: Duration,
    pub lamp_topic: Option<String>,
}

/// What one poll tick did.
#[derive(Debug)]
pub struct TickReport {
    pub snapshot: UsageSnapshot,
    pub completed_hour: Option<HourlyValue>,
    /// Watt-hours gathered so far in the current hour.
    pub energy_wh: f64,
    pub applied_command: Option<PendingCommand>,
    pub command_error: Option<Error>,
    pub discovery: Option<RefreshOutcome>,
}

/// Edge daemon: one task that applies pending commands, polls outlets,
/// accumulates energy and publishes the results each tick.
pub struct MonitorService<P, D> {
    config: ServiceConfig,
    publisher: P,
    discovery: D,
    inbox: Inbox,
    registry: DeviceRegistry,
    poller: UsagePoller,
    ticks_since_discovery: u64,
    /// Completed hours whose publish failed; resent ahead of newer ones.
    unsent_hours: Vec<HourlyValue>,
}

impl<P: Publisher, D: Discovery> MonitorService<P, D> {
    pub fn new(
        config: ServiceConfig,
        publisher: P,
        discovery: D,
        inbox: Inbox,
        started: DateTime<Utc>,
    ) -> Self {
        let poller = UsagePoller::new(started, config.device_timeout);
        Self {
            config,
            publisher,
            discovery,
            inbox,
            registry: DeviceRegistry::new(),
            poller,
            ticks_since_discovery: 0,
            unsent_hours: Vec::new(),
        }
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Initial discovery. The daemon keeps running with an empty registry if
    /// nothing answers; the periodic refresh will pick outlets up later.
    pub async fn discover(&mut self) -> RefreshOutcome {
        let outcome = self.registry.refresh(&self.discovery).await;
        self.inbox.publish_aliases(self.registry.aliases());
        info!("Monitoring {} outlets", self.registry.len());
        outcome
    }

    pub async fn tick(&mut self, now: DateTime<Utc>) -> Result<TickReport> {
        let (applied_command, command_error) =
            match self.inbox.gate.apply(&self.registry, self.config.device_timeout).await {
                Ok(applied) => (applied, None),
                Err(e) => {
                    error!("Failed to apply outlet command: {}", e);
                    (None, Some(e))
                }
            };

        let discovery = self.maybe_refresh().await;

        let total_wattage = self.poller.sample(&self.registry).await;
        let completed_hour = self.poller.accumulate(now);

        let Deviation { difference, color } =
            deviation::encode(total_wattage, self.inbox.baseline_wattage());
        let snapshot = UsageSnapshot {
            total_wattage,
            difference,
            diff_color: color,
            outlets: self.poller.readings().clone(),
        };

        if let Some(finished) = completed_hour {
            self.unsent_hours.push(finished);
        }
        self.flush_hours().await;

        publish_json(&self.publisher, topics::USAGE, QoS::AtLeastOnce, true, &snapshot).await?;
        debug!(
            "Published usage: {:.1} W, difference {:.1} W",
            snapshot.total_wattage, snapshot.difference
        );

        if let Some(lamp_topic) = &self.config.lamp_topic {
            let lamp = LampConfig::from_color(self.config.client_id.clone(), color);
            if let Err(e) = publish_json(&self.publisher, lamp_topic, QoS::AtLeastOnce, false, &lamp).await {
                warn!("Failed to publish lamp color: {}", e);
            }
        }

        Ok(TickReport {
            snapshot,
            completed_hour,
            energy_wh: self.poller.state().energy_wh,
            applied_command,
            command_error,
            discovery,
        })
    }

    async fn maybe_refresh(&mut self) -> Option<RefreshOutcome> {
        self.ticks_since_discovery += 1;
        if self.ticks_since_discovery < self.config.discovery_every_ticks {
            return None;
        }
        self.ticks_since_discovery = 0;

        let outcome = self.registry.refresh(&self.discovery).await;
        if outcome == RefreshOutcome::Replaced {
            self.inbox.publish_aliases(self.registry.aliases());
        }
        Some(outcome)
    }

    async fn flush_hours(&mut self) {
        let topic = topics::hourly_usage(&self.config.device_id);
        while let Some(finished) = self.unsent_hours.first().copied() {
            match publish_json(&self.publisher, &topic, QoS::AtLeastOnce, true, &finished).await {
                Ok(()) => {
                    info!(
                        "Published last hour's usage: {:.3} Wh for hour {} (UTC)",
                        finished.wattage, finished.hour
                    );
                    self.unsent_hours.remove(0);
                }
                Err(e) => {
                    warn!(
                        "Failed to publish usage for hour {}, will retry next tick: {}",
                        finished.hour, e
                    );
                    return;
                }
            }
        }
    }

    /// Ticks forever at the configured poll interval.
    pub async fn run(mut self) {
        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Polling every {:?}, rediscovering every {} ticks",
            self.config.poll_interval, self.config.discovery_every_ticks
        );

        loop {
            ticker.tick().await;
            match self.tick(Utc::now()).await {
                Ok(report) => debug!(
                    "Tick done: {:.1} W now, {:.3} Wh this hour",
                    report.snapshot.total_wattage, report.energy_wh
                ),
                Err(e) => error!("Poll tick failed: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::fakes::{FakeDiscovery, FakeOutlet};
    use crate::device::Outlet;
    use crate::mailbox::{mailbox, Inbound, Mailbox};
    use chrono::TimeZone;
    use protocol::bus::MemoryPublisher;
    use protocol::SetEnabled;
    use std::sync::Arc;

    const DEVICE_ID: &str = "b827eb01a2c3";

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 14, h, m, s).unwrap()
    }

    fn config() -> ServiceConfig {
        ServiceConfig {
            device_id: DEVICE_ID.to_string(),
            client_id: "monitor_service".to_string(),
            poll_interval: Duration::from_secs(3),
            discovery_every_ticks: 10,
            device_timeout: Duration::from_millis(100),
            lamp_topic: Some(topics::LAMP_CONFIG.to_string()),
        }
    }

    struct Harness {
        service: MonitorService<Arc<MemoryPublisher>, Arc<FakeDiscovery>>,
        publisher: Arc<MemoryPublisher>,
        discovery: Arc<FakeDiscovery>,
        mailbox: Mailbox,
    }

    async fn harness(outlets: &[Arc<FakeOutlet>], started: DateTime<Utc>) -> Harness {
        let publisher = Arc::new(MemoryPublisher::new());
        let discovery = Arc::new(FakeDiscovery::new(
            outlets.iter().map(|o| o.clone() as Arc<dyn Outlet>).collect(),
        ));
        let (mailbox, inbox) = mailbox();
        let mut service =
            MonitorService::new(config(), publisher.clone(), discovery.clone(), inbox, started);
        service.discover().await;
        Harness {
            service,
            publisher,
            discovery,
            mailbox,
        }
    }

    fn set_enabled(alias: &str, enabled: bool) -> Inbound {
        Inbound::SetEnabled(SetEnabled {
            outlets: [(alias.to_string(), enabled)].into_iter().collect(),
        })
    }

    #[tokio::test]
    async fn test_tick_publishes_retained_snapshot() {
        let desk = FakeOutlet::new("Desk", 100.0);
        let fridge = FakeOutlet::new("Fridge", 50.0);
        let mut h = harness(&[desk, fridge], at(10, 0, 0)).await;

        let report = h.service.tick(at(10, 0, 3)).await.unwrap();
        assert_eq!(report.snapshot.total_wattage, 150.0);

        let usage = h.publisher.on_topic(topics::USAGE);
        assert_eq!(usage.len(), 1);
        assert!(usage[0].retain);
        assert_eq!(usage[0].qos, QoS::AtLeastOnce);
        let json = usage[0].json();
        assert_eq!(json["total_wattage"], 150.0);
        assert_eq!(json["outlets"]["Desk"]["wattage"], 100.0);
        assert_eq!(json["diff_color"].as_array().unwrap().len(), 3);

        let lamp = h.publisher.on_topic(topics::LAMP_CONFIG);
        assert_eq!(lamp.len(), 1);
        assert!(!lamp[0].retain);
    }

    #[tokio::test]
    async fn test_deviation_uses_cached_baseline() {
        let desk = FakeOutlet::new("Desk", 150.0);
        let mut h = harness(&[desk], at(10, 0, 0)).await;
        h.mailbox
            .deliver(
                Inbound::Baseline(HourlyValue {
                    hour: 10,
                    wattage: 100.0,
                }),
                at(10, 0, 1),
            )
            .unwrap();

        let report = h.service.tick(at(10, 0, 3)).await.unwrap();
        assert_eq!(report.snapshot.difference, 50.0);
        assert!((report.snapshot.diff_color.hue() - 0.1).abs() < 1e-3);
        assert!((report.snapshot.diff_color.value() - 0.667).abs() < 1e-3);
    }

    #[tokio::test]
    async fn test_command_applied_before_readings() {
        let desk = FakeOutlet::new("Desk", 100.0);
        let mut h = harness(&[desk.clone()], at(10, 0, 0)).await;

        h.mailbox.deliver(set_enabled("Desk", true), at(10, 0, 1)).unwrap();
        h.mailbox.deliver(set_enabled("Desk", false), at(10, 0, 1)).unwrap();

        let report = h.service.tick(at(10, 0, 3)).await.unwrap();
        assert_eq!(desk.writes(), vec![false]);
        assert_eq!(report.applied_command.unwrap().alias, "Desk");
        assert!(!report.snapshot.outlets["Desk"].enabled);
        assert_eq!(report.snapshot.total_wattage, 0.0);

        h.service.tick(at(10, 0, 6)).await.unwrap();
        assert_eq!(desk.writes(), vec![false]);
    }

    #[tokio::test]
    async fn test_failed_command_is_reported_not_retried() {
        let desk = FakeOutlet::new("Desk", 100.0);
        desk.reject_writes();
        let mut h = harness(&[desk.clone()], at(10, 0, 0)).await;

        h.mailbox.deliver(set_enabled("Desk", false), at(10, 0, 1)).unwrap();
        let first = h.service.tick(at(10, 0, 3)).await.unwrap();
        assert!(first.command_error.is_some());

        let second = h.service.tick(at(10, 0, 6)).await.unwrap();
        assert!(second.command_error.is_none());
        assert!(second.applied_command.is_none());
    }

    #[tokio::test]
    async fn test_hour_boundary_publishes_last_hour() {
        let desk = FakeOutlet::new("Desk", 3600.0);
        let mut h = harness(&[desk], at(13, 59, 54)).await;

        h.service.tick(at(13, 59, 57)).await.unwrap();
        let report = h.service.tick(at(14, 0, 0)).await.unwrap();

        let finished = report.completed_hour.unwrap();
        assert_eq!(finished.hour, 13);
        assert!((finished.wattage - 6.0).abs() < 1e-9);
        assert_eq!(report.energy_wh, 0.0);

        let last_hour = h.publisher.on_topic(&topics::hourly_usage(DEVICE_ID));
        assert_eq!(last_hour.len(), 1);
        assert!(last_hour[0].retain);
        assert_eq!(last_hour[0].json()["hour"], 13);
    }

    #[tokio::test]
    async fn test_unsent_hour_is_retried() {
        let desk = FakeOutlet::new("Desk", 100.0);
        let mut h = harness(&[desk], at(13, 59, 54)).await;

        h.publisher.set_failing(true);
        assert!(h.service.tick(at(14, 0, 0)).await.is_err());

        h.publisher.set_failing(false);
        h.service.tick(at(14, 0, 3)).await.unwrap();

        let last_hour = h.publisher.on_topic(&topics::hourly_usage(DEVICE_ID));
        assert_eq!(last_hour.len(), 1);
        assert_eq!(last_hour[0].json()["hour"], 13);
    }

    #[tokio::test]
    async fn test_discovery_refresh_cadence() {
        let desk = FakeOutlet::new("Desk", 100.0);
        let mut h = harness(&[desk], at(10, 0, 0)).await;
        assert_eq!(h.discovery.calls(), 1);

        let mut refreshes = 0;
        for i in 1..=20 {
            let report = h.service.tick(at(10, 0, i)).await.unwrap();
            if report.discovery.is_some() {
                refreshes += 1;
            }
        }
        assert_eq!(refreshes, 2);
        assert_eq!(h.discovery.calls(), 3);
    }

    #[tokio::test]
    async fn test_failed_rediscovery_keeps_polling_known_outlets() {
        let desk = FakeOutlet::new("Desk", 100.0);
        let mut h = harness(&[desk], at(10, 0, 0)).await;
        h.discovery.fail();

        for i in 1..=10 {
            let report = h.service.tick(at(10, 0, i)).await.unwrap();
            assert_eq!(report.snapshot.total_wattage, 100.0);
        }
        assert!(h.service.registry().contains("Desk"));
    }
}
