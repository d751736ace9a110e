use crate::errors::{Error, Result};
use crate::registry::DeviceRegistry;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::timeout;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCommand {
    pub alias: String,
    pub enabled: bool,
}

/// Single-slot mailbox between the bus task and the poll task.
///
/// A newer request replaces an older one that has not been applied yet.
#[derive(Debug, Default)]
pub struct CommandGate {
    slot: Mutex<Option<PendingCommand>>,
}

impl CommandGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_pending(&self, alias: impl Into<String>, enabled: bool) {
        let command = PendingCommand {
            alias: alias.into(),
            enabled,
        };
        if let Some(replaced) = self.lock().replace(command) {
            info!(
                "Pending command for {} superseded before it was applied",
                replaced.alias
            );
        }
    }

    pub fn take(&self) -> Option<PendingCommand> {
        self.lock().take()
    }

    #[cfg(test)]
    pub fn peek(&self) -> Option<PendingCommand> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<PendingCommand>> {
        // The slot holds plain data; a panic elsewhere cannot leave it torn.
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Empties the slot and applies what was in it. The slot is cleared even
    /// when the outlet rejects the write; failures are returned, not retried.
    pub async fn apply(
        &self,
        registry: &DeviceRegistry,
        device_timeout: Duration,
    ) -> Result<Option<PendingCommand>> {
        let Some(command) = self.take() else {
            return Ok(None);
        };

        let outlet = registry
            .get(&command.alias)
            .ok_or_else(|| Error::UnknownDevice(command.alias.clone()))?;

        timeout(device_timeout, outlet.set_enabled(command.enabled))
            .await
            .map_err(|_| Error::unreachable(&command.alias, "timed out applying command"))??;

        info!(
            "Set {} {}",
            command.alias,
            if command.enabled { "on" } else { "off" }
        );
        Ok(Some(command))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::fakes::{FakeDiscovery, FakeOutlet};
    use crate::device::Outlet;
    use std::sync::Arc;

    const TIMEOUT: Duration = Duration::from_millis(200);

    async fn registry_with(outlet: Arc<FakeOutlet>) -> DeviceRegistry {
        let discovery = FakeDiscovery::new(vec![outlet as Arc<dyn Outlet>]);
        let mut registry = DeviceRegistry::new();
        registry.refresh(&discovery).await;
        registry
    }

    #[test]
    fn test_last_write_wins() {
        let gate = CommandGate::new();
        gate.set_pending("Desk", true);
        gate.set_pending("Desk", false);

        assert_eq!(
            gate.take(),
            Some(PendingCommand {
                alias: "Desk".to_string(),
                enabled: false
            })
        );
        assert_eq!(gate.take(), None);
    }

    #[tokio::test]
    async fn test_overwritten_command_applied_once() {
        let outlet = FakeOutlet::new("Desk", 50.0);
        let registry = registry_with(outlet.clone()).await;
        let gate = CommandGate::new();

        gate.set_pending("Desk", true);
        gate.set_pending("Desk", false);
        gate.apply(&registry, TIMEOUT).await.unwrap();
        gate.apply(&registry, TIMEOUT).await.unwrap();

        assert_eq!(outlet.writes(), vec![false]);
    }

    #[tokio::test]
    async fn test_failed_application_clears_slot() {
        let outlet = FakeOutlet::new("Desk", 50.0);
        outlet.reject_writes();
        let registry = registry_with(outlet.clone()).await;
        let gate = CommandGate::new();

        gate.set_pending("Desk", false);
        assert!(gate.apply(&registry, TIMEOUT).await.is_err());
        assert_eq!(gate.peek(), None);
        assert!(outlet.writes().is_empty());
    }

    #[tokio::test]
    async fn test_vanished_outlet_is_unknown() {
        let registry = registry_with(FakeOutlet::new("Desk", 50.0)).await;
        let gate = CommandGate::new();

        gate.set_pending("Kettle", true);
        assert!(matches!(
            gate.apply(&registry, TIMEOUT).await,
            Err(Error::UnknownDevice(_))
        ));
        assert_eq!(gate.peek(), None);
    }
}
