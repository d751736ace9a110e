//! Simulated smart plugs, used when no real plug driver is wired in.

use crate::device::{Discovery, Outlet, OutletReading};
use crate::errors::{Error, Result};
use async_trait::async_trait;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const APPLIANCES: &[(&str, f64)] = &[
    ("Desk", 85.0),
    ("Fridge", 150.0),
    ("Television", 110.0),
    ("Kettle", 1800.0),
    ("Heater", 1200.0),
    ("Washer", 500.0),
];

pub struct SimulatedOutlet {
    alias: String,
    rated_watts: f64,
    failure_rate: f64,
    enabled: AtomicBool,
}

impl SimulatedOutlet {
    pub fn new(alias: impl Into<String>, rated_watts: f64, failure_rate: f64) -> Self {
        Self {
            alias: alias.into(),
            rated_watts,
            failure_rate,
            enabled: AtomicBool::new(true),
        }
    }

    fn sample(&self) -> Result<OutletReading> {
        let mut rng = rand::thread_rng();
        if rng.gen_bool(self.failure_rate) {
            return Err(Error::unreachable(&self.alias, "no response from plug"));
        }

        let enabled = self.enabled.load(Ordering::SeqCst);
        let wattage = if !enabled {
            0.0
        } else if rng.gen_bool(0.05) {
            self.rated_watts * rng.gen_range(1.5..3.0) // 5% inrush spikes
        } else {
            self.rated_watts * rng.gen_range(0.85..1.15)
        };

        Ok(OutletReading { enabled, wattage })
    }
}

#[async_trait]
impl Outlet for SimulatedOutlet {
    fn alias(&self) -> &str {
        &self.alias
    }

    async fn read(&self) -> Result<OutletReading> {
        self.sample()
    }

    async fn set_enabled(&self, enabled: bool) -> Result<()> {
        self.enabled.store(enabled, Ordering::SeqCst);
        Ok(())
    }
}

pub struct SimulatedDiscovery {
    outlets: Vec<Arc<SimulatedOutlet>>,
    failure_rate: f64,
}

impl SimulatedDiscovery {
    pub fn new(count: usize, failure_rate: f64) -> Self {
        let failure_rate = failure_rate.clamp(0.0, 1.0);
        let outlets = (0..count)
            .map(|i| {
                let (name, watts) = APPLIANCES[i % APPLIANCES.len()];
                let alias = if i < APPLIANCES.len() {
                    name.to_string()
                } else {
                    format!("{} {}", name, i / APPLIANCES.len() + 1)
                };
                Arc::new(SimulatedOutlet::new(alias, watts, failure_rate))
            })
            .collect();

        Self {
            outlets,
            failure_rate,
        }
    }

    fn attempt(&self) -> Result<Vec<Arc<dyn Outlet>>> {
        if rand::thread_rng().gen_bool(self.failure_rate) {
            return Err(Error::Discovery("broadcast probe timed out".to_string()));
        }
        Ok(self
            .outlets
            .iter()
            .map(|o| Arc::clone(o) as Arc<dyn Outlet>)
            .collect())
    }
}

#[async_trait]
impl Discovery for SimulatedDiscovery {
    async fn discover(&self) -> Result<Vec<Arc<dyn Outlet>>> {
        self.attempt()
    }
}
