//! Handoff between the bus task and the poll task.
//!
//! The bus side only ever replaces whole values: the pending command slot and
//! the cached baseline. The poll task reads both at the top of each tick and
//! publishes the alias set it currently knows so control requests for unknown
//! outlets can be dropped on arrival.

use crate::command::CommandGate;
use chrono::{DateTime, Timelike, Utc};
use protocol::{HourlyValue, ProtocolError, SetEnabled};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

/// Decoded inbound message, one variant per subscribed topic.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    SetEnabled(SetEnabled),
    Baseline(HourlyValue),
}

/// Bus-task side.
pub struct Mailbox {
    gate: Arc<CommandGate>,
    baseline: watch::Sender<Option<HourlyValue>>,
    aliases: watch::Receiver<BTreeSet<String>>,
}

/// Poll-task side.
pub struct Inbox {
    pub gate: Arc<CommandGate>,
    pub baseline: watch::Receiver<Option<HourlyValue>>,
    pub aliases: watch::Sender<BTreeSet<String>>,
}

pub fn mailbox() -> (Mailbox, Inbox) {
    let gate = Arc::new(CommandGate::new());
    let (baseline_tx, baseline_rx) = watch::channel(None);
    let (aliases_tx, aliases_rx) = watch::channel(BTreeSet::new());

    (
        Mailbox {
            gate: gate.clone(),
            baseline: baseline_tx,
            aliases: aliases_rx,
        },
        Inbox {
            gate,
            baseline: baseline_rx,
            aliases: aliases_tx,
        },
    )
}

impl Mailbox {
    pub fn deliver(&self, inbound: Inbound, now: DateTime<Utc>) -> protocol::Result<()> {
        match inbound {
            Inbound::SetEnabled(request) => {
                let known = self.aliases.borrow().clone();
                for (alias, enabled) in request.outlets {
                    if known.contains(&alias) {
                        self.gate.set_pending(alias, enabled);
                    } else {
                        debug!("Ignoring control request for unknown outlet {:?}", alias);
                    }
                }
                Ok(())
            }
            Inbound::Baseline(baseline) => {
                if baseline.hour != now.hour() {
                    return Err(ProtocolError::InvalidMessage(format!(
                        "baseline is for hour {}, current hour is {}",
                        baseline.hour,
                        now.hour()
                    )));
                }
                info!(
                    "Baseline for hour {} (UTC) is {:.3} Wh",
                    baseline.hour, baseline.wattage
                );
                self.baseline.send_replace(Some(baseline));
                Ok(())
            }
        }
    }
}

impl Inbox {
    /// Baseline for the current hour, or zero if none has arrived yet.
    pub fn baseline_wattage(&self) -> f64 {
        let cached = *self.baseline.borrow();
        cached.map(|b| b.wattage).unwrap_or(0.0)
    }

    pub fn publish_aliases(&self, aliases: BTreeSet<String>) {
        self.aliases.send_replace(aliases);
    }
}
