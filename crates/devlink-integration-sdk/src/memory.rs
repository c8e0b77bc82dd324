//! In-process reference backends.
//!
//! These implement every collaborator trait against process memory. The
//! bundled gateway binary wires them up by default, and the test suites use
//! them to drive full sessions without external infrastructure. They record
//! what passed through so assertions can inspect it.

use std::collections::HashMap;

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::debug;

use crate::{
    AuthError, BackendError, DeviceAuth, DeviceCommand, DeviceEvent, DeviceMutation, DevicePath,
    DevicePubSub, DeviceRecord, DeviceStore, Metrics, MetricEvent, ScriptBody, Telemetry,
    TelemetryRecord,
};

/// Command channel depth per device subscription.
const SUB_CHANNEL_CAPACITY: usize = 64;

/// HashMap-backed device and script store. Doubles as the auth collaborator:
/// a connection resolves to whatever row is stored under its path.
pub struct MemStore {
    host: String,
    devices: RwLock<HashMap<DevicePath, DeviceRecord>>,
    scripts: RwLock<HashMap<(String, u32), ScriptBody>>,
}

impl MemStore {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            devices: RwLock::new(HashMap::new()),
            scripts: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert_device(&self, record: DeviceRecord) {
        self.devices.write().insert(record.path(), record);
    }

    pub fn insert_script(&self, script_id: impl Into<String>, version: u32, bytes: &[u8]) {
        self.scripts
            .write()
            .insert((script_id.into(), version), ScriptBody::from_bytes(bytes));
    }

    /// Current row snapshot, if any.
    pub fn device(&self, path: &DevicePath) -> Option<DeviceRecord> {
        self.devices.read().get(path).cloned()
    }
}

#[async_trait]
impl DeviceStore for MemStore {
    async fn get_device(&self, path: &DevicePath) -> Result<DeviceRecord, BackendError> {
        self.devices
            .read()
            .get(path)
            .cloned()
            .ok_or(BackendError::NotFound)
    }

    async fn update_device(
        &self,
        path: &DevicePath,
        mutate: DeviceMutation,
    ) -> Result<(), BackendError> {
        let mut devices = self.devices.write();
        let record = devices.get_mut(path).ok_or(BackendError::NotFound)?;
        mutate(record);
        Ok(())
    }

    async fn get_script_body(
        &self,
        script_id: &str,
        script_version: u32,
    ) -> Result<ScriptBody, BackendError> {
        self.scripts
            .read()
            .get(&(script_id.to_string(), script_version))
            .cloned()
            .ok_or(BackendError::NotFound)
    }

    fn self_host(&self) -> String {
        self.host.clone()
    }
}

#[async_trait]
impl DeviceAuth for MemStore {
    async fn resolve_device(&self, path: &DevicePath) -> Result<DeviceRecord, AuthError> {
        self.devices
            .read()
            .get(path)
            .cloned()
            .ok_or(AuthError::UnknownDevice)
    }
}

/// Per-device command channels plus a log of published events.
#[derive(Default)]
pub struct MemPubSub {
    subs: Mutex<HashMap<DevicePath, mpsc::Sender<DeviceCommand>>>,
    published: Mutex<Vec<(DevicePath, DeviceEvent)>>,
}

impl MemPubSub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inject a backend command toward a subscribed device. Returns false
    /// if nothing is subscribed or the channel is full.
    pub fn send_to_device(&self, path: &DevicePath, command: DeviceCommand) -> bool {
        let subs = self.subs.lock();
        match subs.get(path) {
            Some(tx) => tx.try_send(command).is_ok(),
            None => false,
        }
    }

    /// Drop the backend side of a subscription (simulates backend shutdown).
    pub fn drop_subscription(&self, path: &DevicePath) {
        self.subs.lock().remove(path);
    }

    /// Drain everything published so far.
    pub fn take_published(&self) -> Vec<(DevicePath, DeviceEvent)> {
        std::mem::take(&mut *self.published.lock())
    }

    /// Snapshot without draining.
    pub fn published(&self) -> Vec<(DevicePath, DeviceEvent)> {
        self.published.lock().clone()
    }
}

#[async_trait]
impl DevicePubSub for MemPubSub {
    async fn pub_from_device(
        &self,
        path: &DevicePath,
        event: DeviceEvent,
    ) -> Result<(), BackendError> {
        debug!(device = %path, ?event, "device event");
        self.published.lock().push((path.clone(), event));
        Ok(())
    }

    async fn sub_to_device(
        &self,
        path: &DevicePath,
    ) -> Result<mpsc::Receiver<DeviceCommand>, BackendError> {
        let (tx, rx) = mpsc::channel(SUB_CHANNEL_CAPACITY);
        self.subs.lock().insert(path.clone(), tx);
        Ok(rx)
    }
}

/// Telemetry sink that wraps raw records and keeps them in memory.
#[derive(Default)]
pub struct LogTelemetry {
    inserted: Mutex<Vec<(String, TelemetryRecord)>>,
}

impl LogTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inserted(&self) -> Vec<(String, TelemetryRecord)> {
        self.inserted.lock().clone()
    }
}

#[async_trait]
impl Telemetry for LogTelemetry {
    fn parse(&self, bytes: &[u8]) -> Result<TelemetryRecord, BackendError> {
        if bytes.is_empty() {
            return Err(BackendError::Invalid("empty telemetry record".into()));
        }
        Ok(TelemetryRecord {
            body: serde_json::json!({
                "len": bytes.len(),
                "payload64": general_purpose::STANDARD.encode(bytes),
            }),
        })
    }

    async fn insert(
        &self,
        partition_key: &str,
        record: TelemetryRecord,
    ) -> Result<(), BackendError> {
        debug!(partition_key, "telemetry insert");
        self.inserted.lock().push((partition_key.to_string(), record));
        Ok(())
    }
}

/// Metrics sink that logs and records every event.
#[derive(Default)]
pub struct LogMetrics {
    events: Mutex<Vec<MetricEvent>>,
}

impl LogMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<MetricEvent> {
        self.events.lock().clone()
    }
}

impl Metrics for LogMetrics {
    fn track(&self, event: MetricEvent) {
        debug!(name = %event.name, measurements = ?event.measurements, "metric");
        self.events.lock().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(part: &str, row: &str) -> DeviceRecord {
        DeviceRecord {
            partition_key: part.into(),
            row_key: row.into(),
            name: String::new(),
            key: general_purpose::STANDARD.encode([1u8; 32]),
            script_id: None,
            script_version: None,
            deployed_hash: None,
            last_act: 0,
            stats: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_store_mutation_is_applied() {
        let store = MemStore::new("localhost:8704");
        store.insert_device(record("p", "r"));
        let path = DevicePath::new("p", "r");

        store
            .update_device(&path, Box::new(|rec| rec.last_act = 1234))
            .await
            .unwrap();

        assert_eq!(store.device(&path).unwrap().last_act, 1234);
        assert_eq!(
            store.get_device(&DevicePath::new("p", "missing")).await,
            Err(BackendError::NotFound)
        );
    }

    #[tokio::test]
    async fn test_pubsub_delivery_order() {
        let bus = MemPubSub::new();
        let path = DevicePath::new("p", "r");
        let mut rx = bus.sub_to_device(&path).await.unwrap();

        assert!(bus.send_to_device(&path, DeviceCommand::Ping { payload64: "AA==".into() }));
        assert!(bus.send_to_device(&path, DeviceCommand::SetForwarding { forwarding: true }));

        assert!(matches!(rx.recv().await, Some(DeviceCommand::Ping { .. })));
        assert!(matches!(
            rx.recv().await,
            Some(DeviceCommand::SetForwarding { forwarding: true })
        ));

        bus.drop_subscription(&path);
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn test_telemetry_parse_rejects_empty() {
        let sink = LogTelemetry::new();
        assert!(sink.parse(&[]).is_err());
        assert!(sink.parse(&[1, 2, 3]).is_ok());
    }
}
