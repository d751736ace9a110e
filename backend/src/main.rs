mod averager;
mod bus;
mod config;
mod db;
mod errors;
mod lifecycle;
mod metrics;
mod model;
mod rest;
mod store;

use averager::BaselineAverager;
use axum::{routing::get, Router};
use bus::Handlers;
use clap::Parser;
use config::Config;
use db::PgDeviceStore;
use lifecycle::LifecycleManager;
use protocol::bus::Publisher;
use rest::AppState;
use std::sync::Arc;
use store::DeviceStore;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let config = Config::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting monitor backend");
    info!("MQTT broker: {}:{}", config.mqtt_broker, config.mqtt_port);
    info!("HTTP server: {}", config.http_addr);
    info!("Database: {}", config.database_host());

    if let Err(e) = metrics::init_metrics() {
        error!("Failed to register metrics: {}", e);
        std::process::exit(1);
    }

    let pool = match db::make_pool(&config.database_url).await {
        Ok(pool) => pool,
        Err(e) => {
            error!("Failed to connect to database: {}", e);
            std::process::exit(1);
        }
    };
    let store: Arc<dyn DeviceStore> = Arc::new(PgDeviceStore::new(pool));

    let client_id = format!("monitor-backend-{}", uuid::Uuid::new_v4());
    let (client, eventloop) = bus::connect(&config.mqtt_broker, config.mqtt_port, &client_id);
    let publisher: Arc<dyn Publisher> = Arc::new(client.clone());

    let lifecycle = Arc::new(LifecycleManager::new(store.clone(), publisher.clone()));
    let averager = Arc::new(BaselineAverager::new(store.clone(), publisher));

    let handlers = Arc::new(Handlers {
        lifecycle: lifecycle.clone(),
        averager: averager.clone(),
    });
    let mqtt_handle = tokio::spawn(async move {
        bus::run_event_loop(client, eventloop, handlers).await;
    });

    let sweep_interval = config.sweep_interval();
    let sweep_handle = tokio::spawn(async move {
        averager.run_sweeps(sweep_interval).await;
    });

    // Build HTTP app with REST API and metrics endpoint
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .merge(rest::create_router(AppState { store, lifecycle }));

    let listener = match tokio::net::TcpListener::bind(&config.http_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to {}: {}", config.http_addr, e);
            std::process::exit(1);
        }
    };

    info!("HTTP server listening on {}", config.http_addr);

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {}", e);
        }
    });

    tokio::select! {
        _ = mqtt_handle => {
            error!("MQTT task terminated");
        }
        _ = sweep_handle => {
            error!("Sweep task terminated");
        }
        _ = server_handle => {
            error!("HTTP server terminated");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    info!("Shutting down");
}

async fn metrics_handler() -> String {
    metrics::gather_metrics()
}
