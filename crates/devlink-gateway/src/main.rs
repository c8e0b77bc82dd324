use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use base64::{engine::general_purpose, Engine as _};
use rand::rngs::OsRng;
use rand::RngCore;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use devlink_gateway::deploy::RetryLedger;
use devlink_gateway::device_session::{Backends, DEFAULT_TICK_INTERVAL};
use devlink_gateway::endpoint::Gateway;
use devlink_gateway::ws;
use devlink_integration_sdk::memory::{LogMetrics, LogTelemetry, MemPubSub, MemStore};
use devlink_integration_sdk::{connection_string, DeviceRecord, DeviceStore};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = build_gateway_configuration();
    info!(?config, "starting gateway");

    let store = Arc::new(MemStore::new(config.self_host.clone()));
    if let Some((partition_key, row_key)) = &config.demo_device {
        seed_demo_device(&store, partition_key, row_key);
    }

    let backends = Arc::new(Backends {
        store: store.clone(),
        pubsub: Arc::new(MemPubSub::new()),
        telemetry: Arc::new(LogTelemetry::new()),
        metrics: Arc::new(LogMetrics::new()),
        retries: Arc::new(RetryLedger::new()),
        tick_interval: config.tick_interval,
    });
    let gateway = Gateway::new(store, backends);

    let listener = TcpListener::bind(&config.listen_addr).await?;
    ws::serve(listener, gateway).await?;
    Ok(())
}

/// Register a throwaway device with a fresh random key and print how to
/// connect as it. Provisioning aid for local runs only.
fn seed_demo_device(store: &MemStore, partition_key: &str, row_key: &str) {
    let mut key = [0u8; 32];
    OsRng.fill_bytes(&mut key);

    let record = DeviceRecord {
        partition_key: partition_key.to_string(),
        row_key: row_key.to_string(),
        name: "demo device".to_string(),
        key: general_purpose::STANDARD.encode(key),
        script_id: None,
        script_version: None,
        deployed_hash: None,
        last_act: 0,
        stats: Default::default(),
    };

    match connection_string(&store.self_host(), &record) {
        Ok(url) => info!(device = %record.path(), %url, "seeded demo device"),
        Err(e) => warn!(error = %e, "could not build demo connection string"),
    }
    store.insert_device(record);
}

#[derive(Debug)]
struct Config {
    listen_addr: String,
    self_host: String,
    tick_interval: Duration,
    demo_device: Option<(String, String)>,
}

fn build_gateway_configuration() -> Config {
    let listen_addr = read_listen_address();
    Config {
        self_host: read_self_host(&listen_addr),
        tick_interval: read_tick_interval(),
        demo_device: read_demo_device(),
        listen_addr,
    }
}

fn read_listen_address() -> String {
    std::env::var("DEVLINK_GATEWAY_LISTEN").unwrap_or_else(|_| String::from("127.0.0.1:8704"))
}

fn read_self_host(listen_addr: &str) -> String {
    std::env::var("DEVLINK_SELF_HOST").unwrap_or_else(|_| listen_addr.to_string())
}

fn read_tick_interval() -> Duration {
    std::env::var("DEVLINK_TICK_MS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_TICK_INTERVAL)
}

fn read_demo_device() -> Option<(String, String)> {
    let value = std::env::var("DEVLINK_DEMO_DEVICE").ok()?;
    let (partition_key, row_key) = value.split_once('/')?;
    Some((partition_key.to_string(), row_key.to_string()))
}
