//! Connection intake.
//!
//! For each accepted transport: resolve the device, parse the protocol
//! selector, drive the responder handshake, then hand the authenticated
//! session to [`DeviceSession`]. One live session per device path; a second
//! connection for the same device is turned away.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{debug, info, warn};

use devlink_core::session::{parse_selector, Handshake, SessionCrypto};
use devlink_integration_sdk::{DeviceAuth, DevicePath, DeviceRecord};

use crate::device_session::{Backends, DeviceSession};
use crate::transport::MessageTransport;

/// An accepted transport plus its handshake-time metadata.
pub struct IncomingConnection<T> {
    /// Protocol selector the device presented (WebSocket subprotocol).
    pub selector: String,
    /// Device path from the connection URL.
    pub path: DevicePath,
    pub transport: T,
}

/// The gateway endpoint: auth collaborator, shared backends, live-session
/// registry.
pub struct Gateway {
    auth: Arc<dyn DeviceAuth>,
    backends: Arc<Backends>,
    active: Mutex<HashSet<String>>,
}

impl Gateway {
    pub fn new(auth: Arc<dyn DeviceAuth>, backends: Arc<Backends>) -> Arc<Self> {
        Arc::new(Self {
            auth,
            backends,
            active: Mutex::new(HashSet::new()),
        })
    }

    /// Serve one connection to completion.
    pub async fn handle_connection<T: MessageTransport>(&self, conn: IncomingConnection<T>) {
        let path = conn.path.clone();

        let _slot = match self.claim(&path) {
            Some(slot) => slot,
            None => {
                let mut transport = conn.transport;
                warn!(device = %path, "rejecting concurrent session");
                transport.close("already connected").await;
                return;
            }
        };

        let mut transport = conn.transport;
        match self.establish(&conn.selector, &path, &mut transport).await {
            Ok((crypto, device, session_id)) => {
                DeviceSession::new(transport, crypto, device, session_id, self.backends.clone())
                    .run()
                    .await;
            }
            Err(reason) => {
                warn!(device = %path, reason, "handshake failed");
                transport.close(reason).await;
            }
        }
    }

    /// Reserve the device path, or `None` if a session is already live.
    fn claim(&self, path: &DevicePath) -> Option<ActiveSlot<'_>> {
        let key = path.to_string();
        if !self.active.lock().insert(key.clone()) {
            return None;
        }
        Some(ActiveSlot { gateway: self, key })
    }

    async fn establish<T: MessageTransport>(
        &self,
        selector: &str,
        path: &DevicePath,
        transport: &mut T,
    ) -> Result<(SessionCrypto, DeviceRecord, String), &'static str> {
        let device = self
            .auth
            .resolve_device(path)
            .await
            .map_err(|_| "no such device")?;
        let devkey = device.key_bytes().map_err(|_| "bad device key")?;

        let (version, client_random) = parse_selector(selector).map_err(|e| e.reason())?;

        let mut server_random = [0u8; 16];
        OsRng.fill_bytes(&mut server_random);
        let mut handshake = Handshake::respond(version, &devkey, &client_random, server_random)
            .map_err(|e| e.reason())?;

        transport
            .send(&handshake.hello())
            .await
            .map_err(|_| "transport error")?;
        let auth_record = handshake.auth_record().map_err(|e| e.reason())?;
        transport
            .send(&auth_record)
            .await
            .map_err(|_| "transport error")?;

        let first = transport
            .recv()
            .await
            .map_err(|_| "transport error")?
            .ok_or("connection closed")?;
        let crypto = handshake
            .verify_first_record(&first)
            .map_err(|e| e.reason())?;

        let mut id = [0u8; 8];
        OsRng.fill_bytes(&mut id);
        let session_id = hex::encode(id);

        info!(device = %path, session = %session_id, version = version.wire_value(), "session authenticated");
        Ok((crypto, device, session_id))
    }
}

/// Registry reservation, released on drop.
struct ActiveSlot<'a> {
    gateway: &'a Gateway,
    key: String,
}

impl Drop for ActiveSlot<'_> {
    fn drop(&mut self) {
        self.gateway.active.lock().remove(&self.key);
        debug!(device = %self.key, "session slot released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use base64::{engine::general_purpose, Engine as _};
    use devlink_integration_sdk::memory::{LogMetrics, LogTelemetry, MemPubSub, MemStore};

    use crate::deploy::RetryLedger;
    use crate::device_session::DEFAULT_TICK_INTERVAL;
    use crate::transport::mem_pair;

    fn gateway() -> (Arc<Gateway>, Arc<MemStore>) {
        let store = Arc::new(MemStore::new("localhost:8704"));
        let backends = Arc::new(Backends {
            store: store.clone(),
            pubsub: Arc::new(MemPubSub::new()),
            telemetry: Arc::new(LogTelemetry::new()),
            metrics: Arc::new(LogMetrics::new()),
            retries: Arc::new(RetryLedger::new()),
            tick_interval: DEFAULT_TICK_INTERVAL,
        });
        (Gateway::new(store.clone(), backends), store)
    }

    fn seed_device(store: &MemStore) -> DevicePath {
        let record = DeviceRecord {
            partition_key: "fleet1".into(),
            row_key: "dev42".into(),
            name: String::new(),
            key: general_purpose::STANDARD.encode([1u8; 32]),
            script_id: None,
            script_version: None,
            deployed_hash: None,
            last_act: 0,
            stats: Default::default(),
        };
        let path = record.path();
        store.insert_device(record);
        path
    }

    #[tokio::test]
    async fn test_unknown_device_is_rejected() {
        let (gateway, _store) = gateway();
        let (gateway_end, mut device_end) = mem_pair(4);

        gateway
            .handle_connection(IncomingConnection {
                selector: format!("devs-key-{}", "02".repeat(16)),
                path: DevicePath::new("fleet1", "ghost"),
                transport: gateway_end,
            })
            .await;

        // No hello; the transport just ends
        assert_eq!(device_end.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_bad_selector_is_rejected() {
        let (gateway, store) = gateway();
        let path = seed_device(&store);
        let (gateway_end, mut device_end) = mem_pair(4);

        gateway
            .handle_connection(IncomingConnection {
                selector: "mqtt".into(),
                path,
                transport: gateway_end,
            })
            .await;

        assert_eq!(device_end.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_slot_released_after_failed_handshake() {
        let (gateway, store) = gateway();
        let path = seed_device(&store);

        let (gateway_end, _device_end) = mem_pair(4);
        gateway
            .handle_connection(IncomingConnection {
                selector: "mqtt".into(),
                path: path.clone(),
                transport: gateway_end,
            })
            .await;

        // The path is claimable again
        assert!(gateway.claim(&path).is_some());
    }
}
