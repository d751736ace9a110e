use crate::device::{Discovery, Outlet};
use crate::errors::{Error, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Replaced,
    Unchanged,
    /// Discovery answered with no devices; the current set is kept.
    EmptyIgnored,
    /// Discovery failed or timed out; the current set is kept.
    Failed,
}

/// Live alias → outlet map.
#[derive(Default)]
pub struct DeviceRegistry {
    outlets: BTreeMap<String, Arc<dyn Outlet>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, alias: &str) -> Option<&Arc<dyn Outlet>> {
        self.outlets.get(alias)
    }

    pub fn contains(&self, alias: &str) -> bool {
        self.outlets.contains_key(alias)
    }

    pub fn aliases(&self) -> BTreeSet<String> {
        self.outlets.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.outlets.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Arc<dyn Outlet>)> {
        self.outlets.iter()
    }

    /// Runs discovery and swaps in the result only if it succeeded, is not
    /// empty, and names a different set of aliases than the live one.
    pub async fn refresh(&mut self, discovery: &dyn Discovery) -> RefreshOutcome {
        let found = match discover_with_timeout(discovery).await {
            Ok(found) => found,
            Err(e) => {
                warn!("Discovery failed, keeping {} known outlets: {}", self.len(), e);
                return RefreshOutcome::Failed;
            }
        };

        if found.is_empty() {
            warn!(
                "Discovery returned no outlets, keeping {} known outlets",
                self.len()
            );
            return RefreshOutcome::EmptyIgnored;
        }

        let mut next = BTreeMap::new();
        for outlet in found {
            let alias = outlet.alias().to_string();
            if next.insert(alias.clone(), outlet).is_some() {
                warn!("Discovery reported alias {:?} twice, keeping the last", alias);
            }
        }

        if next.keys().eq(self.outlets.keys()) {
            debug!("Discovery found the same {} outlets", next.len());
            return RefreshOutcome::Unchanged;
        }

        info!(
            "Outlet set changed: {:?} -> {:?}",
            self.outlets.keys().collect::<Vec<_>>(),
            next.keys().collect::<Vec<_>>()
        );
        self.outlets = next;
        RefreshOutcome::Replaced
    }
}

async fn discover_with_timeout(discovery: &dyn Discovery) -> Result<Vec<Arc<dyn Outlet>>> {
    timeout(DISCOVERY_TIMEOUT, discovery.discover())
        .await
        .map_err(|_| Error::Discovery(format!("no answer within {:?}", DISCOVERY_TIMEOUT)))?
}
