mod bus;
mod command;
mod config;
mod device;
mod deviation;
mod errors;
mod mailbox;
mod poller;
mod registry;
mod service;
mod simulated;

use chrono::Utc;
use clap::Parser;
use config::Config;
use protocol::topics;
use rumqttc::QoS;
use service::MonitorService;
use simulated::SimulatedDiscovery;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let config = Config::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let device_id = match config.resolve_device_id() {
        Ok(id) => id,
        Err(e) => {
            error!("Cannot determine device id: {}", e);
            std::process::exit(1);
        }
    };

    info!("Starting outlet monitor");
    info!(
        "Broker: {}:{}, Device: {}, Outlets (simulated): {}",
        config.mqtt_broker, config.mqtt_port, device_id, config.sim_outlets
    );

    let settings = config.bus_settings(&device_id);
    let liveness = settings.liveness_topic();
    let (client, eventloop) = bus::connect(&settings);
    let (mailbox, inbox) = mailbox::mailbox();

    let bus_client = client.clone();
    let bus_handle = tokio::spawn(async move {
        bus::run_event_loop(bus_client, eventloop, settings, mailbox).await;
    });

    let discovery = SimulatedDiscovery::new(config.sim_outlets, config.sim_failure_rate);
    let mut service = MonitorService::new(
        config.service_config(&device_id),
        client.clone(),
        discovery,
        inbox,
        Utc::now(),
    );
    service.discover().await;

    tokio::select! {
        _ = bus_handle => {
            error!("MQTT task terminated");
        }
        _ = service.run() => {
            error!("Poll loop terminated");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    // A clean disconnect suppresses the last will, so announce it ourselves.
    if let Err(e) = client.publish(&liveness, QoS::ExactlyOnce, true, topics::OFFLINE).await {
        error!("Failed to publish offline state: {}", e);
    }
    if let Err(e) = client.disconnect().await {
        error!("Failed to disconnect cleanly: {}", e);
    }
    tokio::time::sleep(Duration::from_millis(500)).await;

    info!("Shutting down");
}
