// Copyright (c) 2025-2026 Nyx Systems LLC.
// SPDX-License-Identifier: SEE LICENSE IN ../../LICENSE
//
// This file is part of Devlink (embedded device gateway).
// Free for non-commercial use. Commercial use requires a license.
// See LICENSE and COMMERCIAL_LICENSE.md for details.

//! Devlink Integration SDK
//!
//! **Stable extension points for the backend control/telemetry plane.**
//!
//! The gateway core never talks to a database, an object store or a message
//! broker directly; it goes through the traits in this crate. Integrations
//! implement these against their own infrastructure without modifying
//! protocol behavior.
//!
//! ## Core Traits
//!
//! - [`DeviceAuth`]: map an incoming connection path to a device record
//! - [`DeviceStore`]: device rows, program bodies, single-writer mutation
//! - [`DevicePubSub`]: one inbound command subscription per device, outbound
//!   device events
//! - [`Telemetry`]: decode and persist device-uploaded binary records
//! - [`Metrics`]: operational events with per-session tag overrides
//!
//! [`memory`] ships in-process reference implementations of every trait,
//! used by the bundled binary and by the test suites.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub mod memory;

/// Expected length of the decoded device long-term key.
pub const DEVICE_KEY_LEN: usize = 32;

/// Stable device identifier: partition key plus row key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DevicePath {
    pub partition_key: String,
    pub row_key: String,
}

impl DevicePath {
    pub fn new(partition_key: impl Into<String>, row_key: impl Into<String>) -> Self {
        Self {
            partition_key: partition_key.into(),
            row_key: row_key.into(),
        }
    }
}

impl fmt::Display for DevicePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.partition_key, self.row_key)
    }
}

/// Persistent device row, as held by the auth and storage collaborators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    pub partition_key: String,
    pub row_key: String,
    /// Display name, used for metric tag overrides.
    #[serde(default)]
    pub name: String,
    /// Base64-encoded 32-byte device long-term key.
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_version: Option<u32>,
    /// Lowercase hex of the hash the device last confirmed installed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployed_hash: Option<String>,
    /// Last activity, epoch milliseconds.
    #[serde(default)]
    pub last_act: i64,
    /// Additive session stat totals.
    #[serde(default)]
    pub stats: BTreeMap<String, f64>,
}

impl DeviceRecord {
    pub fn path(&self) -> DevicePath {
        DevicePath::new(self.partition_key.clone(), self.row_key.clone())
    }

    /// Decode the base64 long-term key and check its length.
    pub fn key_bytes(&self) -> Result<[u8; DEVICE_KEY_LEN], BackendError> {
        let bytes = general_purpose::STANDARD
            .decode(&self.key)
            .map_err(|_| BackendError::Invalid("device key is not valid base64".into()))?;
        if bytes.len() != DEVICE_KEY_LEN {
            return Err(BackendError::Invalid(format!(
                "device key must be {DEVICE_KEY_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        let mut key = [0u8; DEVICE_KEY_LEN];
        key.copy_from_slice(&bytes);
        Ok(key)
    }
}

/// Per-session counters, flushed additively into the device row on tick.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    /// Commands sent to the device.
    pub c2d: u32,
    /// Command acknowledgments received from the device.
    pub c2d_resp: u32,
    /// Uploads received from the device.
    pub d2c: u32,
    /// Sessions opened.
    pub conns: u32,
}

impl SessionStats {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    fn entries(&self) -> [(&'static str, f64); 4] {
        [
            ("c2d", f64::from(self.c2d)),
            ("c2dResp", f64::from(self.c2d_resp)),
            ("d2c", f64::from(self.d2c)),
            ("conns", f64::from(self.conns)),
        ]
    }

    /// Accumulate into persistent totals.
    pub fn add_into(&self, totals: &mut BTreeMap<String, f64>) {
        for (name, value) in self.entries() {
            *totals.entry(name.to_string()).or_insert(0.0) += value;
        }
    }

    /// Counters as metric measurements.
    pub fn measurements(&self) -> BTreeMap<String, f64> {
        self.entries()
            .into_iter()
            .map(|(name, value)| (name.to_string(), value))
            .collect()
    }
}

/// Program body as returned by object storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptBody {
    pub program: ProgramBody,
}

/// Compiled program image, hex-encoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgramBody {
    pub binary: String,
}

impl ScriptBody {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            program: ProgramBody {
                binary: hex::encode(bytes),
            },
        }
    }

    pub fn decode(&self) -> Result<Vec<u8>, BackendError> {
        hex::decode(&self.program.binary)
            .map_err(|_| BackendError::Invalid("program body is not valid hex".into()))
    }
}

/// Events published from a device session to the backend plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DeviceEvent {
    /// Non-fatal protocol problem; the session stays up.
    #[serde(rename = "warning")]
    Warning { message: String },
    /// Device acknowledged a cloud method call.
    #[serde(rename = "methodRes", rename_all = "camelCase")]
    MethodRes {
        rid: u32,
        status_code: u32,
        result: Vec<f64>,
    },
    /// Labelled f64 tuple upload.
    #[serde(rename = "jacsUpload")]
    JacsUpload { label: String, values: Vec<f64> },
    /// Binary telemetry upload, base64.
    #[serde(rename = "uploadBin")]
    UploadBin { payload64: String },
    /// Forwarded bus frame, base64.
    #[serde(rename = "frame")]
    Frame { payload64: String },
    /// Ping echo from the device, base64.
    #[serde(rename = "pong")]
    Pong { payload64: String },
}

/// Commands delivered to a device session from the backend subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DeviceCommand {
    /// Invoke a device method. Arguments must all be numeric.
    #[serde(rename = "method")]
    Method {
        rid: u32,
        method: String,
        #[serde(default)]
        args: Vec<serde_json::Value>,
    },
    /// Raw bytes pushed through the record layer unwrapped, base64.
    #[serde(rename = "frameTo")]
    FrameTo { payload64: String },
    /// Toggle bus-frame forwarding.
    #[serde(rename = "setfwd")]
    SetForwarding { forwarding: bool },
    /// Ping the device, base64 payload.
    #[serde(rename = "ping")]
    Ping {
        #[serde(default)]
        payload64: String,
    },
    /// Re-sync the deployed program. Absent fields mean "re-read the row".
    #[serde(rename = "update", rename_all = "camelCase")]
    Update {
        #[serde(default)]
        script_id: Option<String>,
        #[serde(default)]
        script_version: Option<u32>,
    },
}

/// Decoded binary telemetry record. The concrete shape is owned by the
/// parser implementation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub body: serde_json::Value,
}

/// Per-session tag overrides attached to every metric event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagOverrides {
    pub session_id: Option<String>,
    /// Device row key.
    pub user_id: Option<String>,
    /// Device display name.
    pub user_auth_user_id: Option<String>,
}

/// One operational metric event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricEvent {
    pub name: String,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    #[serde(default)]
    pub measurements: BTreeMap<String, f64>,
    #[serde(default)]
    pub tags: TagOverrides,
}

impl MetricEvent {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// Authentication failures when resolving a connection to a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// No device row for this path.
    UnknownDevice,
    /// The auth backend itself failed.
    Backend(String),
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownDevice => write!(f, "no such device"),
            Self::Backend(msg) => write!(f, "auth backend failed: {msg}"),
        }
    }
}

impl std::error::Error for AuthError {}

/// Failures from storage, pub/sub and telemetry collaborators. These are
/// logged and turned into warnings by the gateway; they never end a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    NotFound,
    Unavailable(String),
    Invalid(String),
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "not found"),
            Self::Unavailable(msg) => write!(f, "backend unavailable: {msg}"),
            Self::Invalid(msg) => write!(f, "invalid data: {msg}"),
        }
    }
}

impl std::error::Error for BackendError {}

/// Mutation applied to a device row under single-writer semantics.
pub type DeviceMutation = Box<dyn FnOnce(&mut DeviceRecord) + Send>;

/// Maps an accepted connection to the device it claims to be.
#[async_trait]
pub trait DeviceAuth: Send + Sync {
    async fn resolve_device(&self, path: &DevicePath) -> Result<DeviceRecord, AuthError>;
}

/// Device rows and program bodies.
#[async_trait]
pub trait DeviceStore: Send + Sync {
    async fn get_device(&self, path: &DevicePath) -> Result<DeviceRecord, BackendError>;

    /// Read-modify-write a device row. The implementation must apply the
    /// mutation atomically with respect to other writers.
    async fn update_device(
        &self,
        path: &DevicePath,
        mutate: DeviceMutation,
    ) -> Result<(), BackendError>;

    async fn get_script_body(
        &self,
        script_id: &str,
        script_version: u32,
    ) -> Result<ScriptBody, BackendError>;

    /// Host this gateway advertises in device connection strings.
    fn self_host(&self) -> String;
}

/// Backend message plane: one inbound subscription per device plus outbound
/// event publishes.
#[async_trait]
pub trait DevicePubSub: Send + Sync {
    async fn pub_from_device(
        &self,
        path: &DevicePath,
        event: DeviceEvent,
    ) -> Result<(), BackendError>;

    /// Subscribe to commands addressed to one device. Dropping the receiver
    /// unsubscribes; a closed channel means the backend shut down.
    async fn sub_to_device(
        &self,
        path: &DevicePath,
    ) -> Result<mpsc::Receiver<DeviceCommand>, BackendError>;
}

/// Binary telemetry decoding and persistence.
#[async_trait]
pub trait Telemetry: Send + Sync {
    fn parse(&self, bytes: &[u8]) -> Result<TelemetryRecord, BackendError>;

    async fn insert(
        &self,
        partition_key: &str,
        record: TelemetryRecord,
    ) -> Result<(), BackendError>;
}

/// Operational metrics sink.
pub trait Metrics: Send + Sync {
    fn track(&self, event: MetricEvent);
}

/// Connection string a device uses to reach this gateway:
/// `ws://wssk:<hex-key>@<host>/wssk/<partitionKey>/<rowKey>`.
pub fn connection_string(host: &str, device: &DeviceRecord) -> Result<String, BackendError> {
    let key = device.key_bytes()?;
    Ok(format!(
        "ws://wssk:{}@{}/wssk/{}/{}",
        hex::encode(key),
        host,
        device.partition_key,
        device.row_key
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> DeviceRecord {
        DeviceRecord {
            partition_key: "fleet1".into(),
            row_key: "dev42".into(),
            name: "bench unit".into(),
            key: general_purpose::STANDARD.encode([0xAB; 32]),
            script_id: None,
            script_version: None,
            deployed_hash: None,
            last_act: 0,
            stats: BTreeMap::new(),
        }
    }

    #[test]
    fn test_key_bytes_roundtrip() {
        assert_eq!(record().key_bytes().unwrap(), [0xAB; 32]);

        let mut bad = record();
        bad.key = "not base64!!".into();
        assert!(bad.key_bytes().is_err());

        let mut short = record();
        short.key = general_purpose::STANDARD.encode([1u8; 16]);
        assert!(short.key_bytes().is_err());
    }

    #[test]
    fn test_connection_string_shape() {
        let s = connection_string("gw.example.com:8704", &record()).unwrap();
        assert_eq!(
            s,
            format!(
                "ws://wssk:{}@gw.example.com:8704/wssk/fleet1/dev42",
                "ab".repeat(32)
            )
        );
    }

    #[test]
    fn test_stats_accumulate() {
        let mut stats = SessionStats::default();
        assert!(stats.is_empty());
        stats.d2c = 3;
        stats.conns = 1;

        let mut totals = BTreeMap::new();
        totals.insert("d2c".to_string(), 2.0);
        stats.add_into(&mut totals);

        assert_eq!(totals["d2c"], 5.0);
        assert_eq!(totals["conns"], 1.0);
        assert_eq!(totals["c2d"], 0.0);
        assert_eq!(totals["c2dResp"], 0.0);
    }

    #[test]
    fn test_event_wire_tags() {
        let ev = DeviceEvent::JacsUpload {
            label: "hi".into(),
            values: vec![3.14],
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "jacsUpload");
        assert_eq!(json["label"], "hi");

        let ev = DeviceEvent::MethodRes {
            rid: 7,
            status_code: 200,
            result: vec![],
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "methodRes");
        assert_eq!(json["statusCode"], 200);
    }

    #[test]
    fn test_command_wire_tags() {
        let cmd: DeviceCommand =
            serde_json::from_str(r#"{"type":"method","rid":1,"method":"blink","args":[2.0]}"#)
                .unwrap();
        match cmd {
            DeviceCommand::Method { rid, method, args } => {
                assert_eq!(rid, 1);
                assert_eq!(method, "blink");
                assert_eq!(args.len(), 1);
            }
            other => panic!("unexpected command: {other:?}"),
        }

        let cmd: DeviceCommand = serde_json::from_str(r#"{"type":"setfwd","forwarding":true}"#)
            .unwrap();
        assert_eq!(cmd, DeviceCommand::SetForwarding { forwarding: true });

        let cmd: DeviceCommand = serde_json::from_str(r#"{"type":"update"}"#).unwrap();
        assert_eq!(
            cmd,
            DeviceCommand::Update {
                script_id: None,
                script_version: None
            }
        );
    }
}
