use crate::errors::{ProtocolError, Result};

pub const USAGE: &str = "monitor/usage";
pub const SET_ENABLED: &str = "monitor/set_enabled";
pub const LAMP_CONFIG: &str = "lamp/set_config";

pub const HOURLY_USAGE_FILTER: &str = "devices/+/monitor/usage/last_hour";
pub const BASELINE_FILTER: &str = "devices/+/monitor/average";
pub const BRIDGE_STATE_FILTER: &str = "$SYS/broker/connection/+/state";

/// Suffix the broker bridge appends to the device id in its connection name.
pub const BRIDGE_SUFFIX: &str = "_broker";

pub const ONLINE: &str = "1";
pub const OFFLINE: &str = "0";

pub fn client_state(client_id: &str) -> String {
    format!("monitor/connection/{}/state", client_id)
}

pub fn hourly_usage(device_id: &str) -> String {
    format!("devices/{}/monitor/usage/last_hour", device_id)
}

pub fn baseline(device_id: &str) -> String {
    format!("devices/{}/monitor/average", device_id)
}

pub fn association(device_id: &str) -> String {
    format!("devices/{}/lamp/associated", device_id)
}

pub fn bridge_state(device_id: &str) -> String {
    format!("$SYS/broker/connection/{}{}/state", device_id, BRIDGE_SUFFIX)
}

/// Matches a topic against an MQTT filter and returns the levels captured by
/// `+` wildcards, in order. A trailing `#` captures nothing but accepts any
/// remainder.
pub fn captures<'a>(filter: &str, topic: &'a str) -> Option<Vec<&'a str>> {
    let mut captured = Vec::new();
    let mut levels = topic.split('/');

    for pattern in filter.split('/') {
        if pattern == "#" {
            return Some(captured);
        }
        let level = levels.next()?;
        match pattern {
            "+" => captured.push(level),
            literal if literal == level => {}
            _ => return None,
        }
    }

    if levels.next().is_some() {
        return None;
    }
    Some(captured)
}

/// One entry of a dispatch table: a topic filter and the decoder that turns a
/// matching publish into a typed message.
pub struct Route<T> {
    pub filter: &'static str,
    pub decode: fn(&[&str], &[u8]) -> Result<T>,
}

/// Decodes an inbound publish with the first route whose filter matches.
pub fn dispatch<T>(routes: &[Route<T>], topic: &str, payload: &[u8]) -> Result<T> {
    for route in routes {
        if let Some(levels) = captures(route.filter, topic) {
            return (route.decode)(&levels, payload);
        }
    }
    Err(ProtocolError::UnroutedTopic(topic.to_string()))
}
