use crate::bus::BusSettings;
use crate::errors::Result;
use crate::service::ServiceConfig;
use clap::Parser;
use protocol::validate::validate_device_id;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Parser)]
#[command(name = "monitor", about = "Smart-plug power monitor for the edge")]
pub struct Config {
    #[arg(long, env = "MQTT_BROKER", default_value = "localhost")]
    pub mqtt_broker: String,

    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    pub mqtt_port: u16,

    #[arg(long, env = "MQTT_KEEP_ALIVE_SECS", default_value_t = 60)]
    pub keep_alive_secs: u64,

    #[arg(long, env = "CLIENT_ID", default_value = "monitor_service")]
    pub client_id: String,

    /// Hardware id used in `devices/<id>/...` topics. Read from
    /// `--device-id-file` when not given.
    #[arg(long, env = "DEVICE_ID")]
    pub device_id: Option<String>,

    #[arg(long, env = "DEVICE_ID_FILE", default_value = "/sys/class/net/eth0/address")]
    pub device_id_file: PathBuf,

    #[arg(long, env = "POLL_INTERVAL_SECS", default_value_t = 3,
          value_parser = clap::value_parser!(u64).range(1..))]
    pub poll_interval_secs: u64,

    #[arg(long, env = "DISCOVERY_EVERY_TICKS", default_value_t = 10,
          value_parser = clap::value_parser!(u64).range(1..))]
    pub discovery_every_ticks: u64,

    #[arg(long, env = "DEVICE_TIMEOUT_MS", default_value_t = 2000)]
    pub device_timeout_ms: u64,

    /// Topic for the ambient lamp color; empty disables it.
    #[arg(long, env = "LAMP_TOPIC", default_value = protocol::topics::LAMP_CONFIG)]
    pub lamp_topic: String,

    #[arg(long, env = "SIM_OUTLETS", default_value_t = 4)]
    pub sim_outlets: usize,

    #[arg(long, env = "SIM_FAILURE_RATE", default_value_t = 0.02)]
    pub sim_failure_rate: f64,
}

impl Config {
    /// The configured id, or the MAC address from `device_id_file` with the
    /// colons stripped. Either way it must be lower-case hex.
    pub fn resolve_device_id(&self) -> Result<String> {
        let raw = match &self.device_id {
            Some(id) => id.clone(),
            None => std::fs::read_to_string(&self.device_id_file)?,
        };
        let device_id = raw.trim().replace(':', "").to_lowercase();
        validate_device_id(&device_id)?;
        Ok(device_id)
    }

    pub fn bus_settings(&self, device_id: &str) -> BusSettings {
        BusSettings {
            host: self.mqtt_broker.clone(),
            port: self.mqtt_port,
            client_id: self.client_id.clone(),
            keep_alive: Duration::from_secs(self.keep_alive_secs),
            device_id: device_id.to_string(),
        }
    }

    pub fn service_config(&self, device_id: &str) -> ServiceConfig {
        ServiceConfig {
            device_id: device_id.to_string(),
            client_id: self.client_id.clone(),
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            discovery_every_ticks: self.discovery_every_ticks,
            device_timeout: Duration::from_millis(self.device_timeout_ms),
            lamp_topic: Some(self.lamp_topic.clone()).filter(|t| !t.is_empty()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::try_parse_from(["monitor", "--device-id", "b827eb01a2c3"]).unwrap();
        let service = config.service_config("b827eb01a2c3");

        assert_eq!(service.poll_interval, Duration::from_secs(3));
        assert_eq!(service.discovery_every_ticks, 10);
        assert_eq!(service.lamp_topic.as_deref(), Some("lamp/set_config"));
    }

    #[test]
    fn test_empty_lamp_topic_disables_lamp() {
        let config = Config::try_parse_from([
            "monitor",
            "--device-id",
            "b827eb01a2c3",
            "--lamp-topic",
            "",
        ])
        .unwrap();
        assert_eq!(config.service_config("b827eb01a2c3").lamp_topic, None);
    }

    #[test]
    fn test_zero_poll_interval_rejected() {
        assert!(Config::try_parse_from(["monitor", "--poll-interval-secs", "0"]).is_err());
    }

    #[test]
    fn test_device_id_from_mac_file() {
        let path = std::env::temp_dir().join(format!("monitor-mac-{}", std::process::id()));
        std::fs::write(&path, "B8:27:EB:01:A2:C3\n").unwrap();

        let mut config = Config::try_parse_from(["monitor"]).unwrap();
        config.device_id = None;
        config.device_id_file = path.clone();
        let device_id = config.resolve_device_id();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(device_id.unwrap(), "b827eb01a2c3");
    }

    #[test]
    fn test_bad_device_id_rejected() {
        let mut config = Config::try_parse_from(["monitor"]).unwrap();
        config.device_id = Some("not-a-mac".to_string());
        assert!(config.resolve_device_id().is_err());
    }
}
