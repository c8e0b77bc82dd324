//! Per-connection device session.
//!
//! One task owns everything: the transport, the record crypto, the deploy
//! engine and the stats counters. Inbound records, backend commands and the
//! periodic flush tick are multiplexed through a single select loop, so
//! records are processed strictly in arrival order and at most one outbound
//! record is in flight at a time.

use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose, Engine as _};
use chrono::Utc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{info, warn};

use devlink_core::session::{SessionCrypto, SessionError};
use devlink_core::wire::{self, Frame};
use devlink_integration_sdk::{
    DeviceCommand, DeviceEvent, DevicePath, DevicePubSub, DeviceRecord, DeviceStore, MetricEvent,
    Metrics, SessionStats, TagOverrides, Telemetry,
};

use crate::deploy::{DeployEngine, DeployStep, RetryLedger};
use crate::transport::{MessageTransport, TransportError};

/// Default stats flush cadence.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(2);

/// Collaborator bundle shared by every session of one gateway.
pub struct Backends {
    pub store: Arc<dyn DeviceStore>,
    pub pubsub: Arc<dyn DevicePubSub>,
    pub telemetry: Arc<dyn Telemetry>,
    pub metrics: Arc<dyn Metrics>,
    pub retries: Arc<RetryLedger>,
    pub tick_interval: Duration,
}

/// What woke the session loop.
enum Wake {
    Inbound(Result<Option<Vec<u8>>, TransportError>),
    Backend(Option<DeviceCommand>),
    Tick,
}

/// An authenticated device connection.
pub struct DeviceSession<T> {
    transport: T,
    crypto: SessionCrypto,
    device: DeviceRecord,
    path: DevicePath,
    session_id: String,
    backends: Arc<Backends>,
    deploy: DeployEngine,
    stats: SessionStats,
    /// Epoch ms of the last device message; 0 means none since the flush.
    last_msg: i64,
    closed: bool,
}

impl<T: MessageTransport> DeviceSession<T> {
    pub fn new(
        transport: T,
        crypto: SessionCrypto,
        device: DeviceRecord,
        session_id: String,
        backends: Arc<Backends>,
    ) -> Self {
        let path = device.path();
        let deploy = DeployEngine::new(path.to_string(), backends.retries.clone());
        Self {
            transport,
            crypto,
            device,
            path,
            session_id,
            backends,
            deploy,
            stats: SessionStats::default(),
            last_msg: 0,
            closed: false,
        }
    }

    /// Drive the session until the transport or the backend ends it.
    pub async fn run(mut self) {
        let mut commands = match self.backends.pubsub.sub_to_device(&self.path).await {
            Ok(rx) => rx,
            Err(e) => {
                warn!(device = %self.path, error = %e, "backend subscription failed");
                self.shutdown("subscribe failed").await;
                return;
            }
        };

        self.stats.conns += 1;
        self.backends.metrics.track(self.metric("connect"));
        info!(device = %self.path, session = %self.session_id, "device session active");

        // Pick up a pending deployment right away
        if let (Some(id), Some(version)) =
            (self.device.script_id.clone(), self.device.script_version)
        {
            if let Err(reason) = self.sync_script(&id, version).await {
                self.shutdown(reason).await;
                return;
            }
        }

        let period = self.backends.tick_interval;
        let mut tick = interval_at(Instant::now() + period, period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let reason = loop {
            let wake = tokio::select! {
                record = self.transport.recv() => Wake::Inbound(record),
                command = commands.recv() => Wake::Backend(command),
                _ = tick.tick() => Wake::Tick,
            };

            match wake {
                Wake::Inbound(Ok(Some(record))) => match self.crypto.open(&record) {
                    Ok(plain) => {
                        if let Err(reason) = self.handle_frame(&plain).await {
                            break reason;
                        }
                    }
                    Err(SessionError::NonceExhausted) => break "nonce exhausted",
                    Err(_) => break "bad auth",
                },
                Wake::Inbound(Ok(None)) => break "connection closed",
                Wake::Inbound(Err(_)) => break "transport error",
                Wake::Backend(Some(command)) => {
                    if let Err(reason) = self.handle_backend(command).await {
                        break reason;
                    }
                }
                Wake::Backend(None) => break "backend shutdown",
                Wake::Tick => self.flush_stats().await,
            }
        };

        self.shutdown(reason).await;
        // Dropping `commands` here releases the backend subscription.
    }

    /// One decrypted inbound message. `Err` carries a close reason; protocol
    /// problems only produce warnings.
    async fn handle_frame(&mut self, msg: &[u8]) -> Result<(), &'static str> {
        self.last_msg = Utc::now().timestamp_millis();

        match wire::parse_frame(msg) {
            Ok(Frame::Command { cmd, payload }) => self.handle_command(cmd, payload).await,
            Ok(Frame::Forward { frame }) => {
                let payload64 = general_purpose::STANDARD.encode(frame);
                self.publish(DeviceEvent::Frame { payload64 }).await;
                Ok(())
            }
            Err(err) => {
                self.warn_event(err.to_string()).await;
                Ok(())
            }
        }
    }

    async fn handle_command(&mut self, cmd: u16, payload: &[u8]) -> Result<(), &'static str> {
        match cmd {
            wire::CMD_UPLOAD => {
                self.stats.d2c += 1;
                let (label, values) = parse_upload(payload);
                self.publish(DeviceEvent::JacsUpload { label, values }).await;
            }

            wire::CMD_UPLOAD_BIN => {
                self.stats.d2c += 1;
                match self.backends.telemetry.parse(payload) {
                    Ok(record) => {
                        if let Err(e) = self
                            .backends
                            .telemetry
                            .insert(&self.path.partition_key, record)
                            .await
                        {
                            warn!(device = %self.path, error = %e, "telemetry insert failed");
                        }
                    }
                    Err(e) => warn!(device = %self.path, error = %e, "telemetry parse failed"),
                }
                let payload64 = general_purpose::STANDARD.encode(payload);
                self.publish(DeviceEvent::UploadBin { payload64 }).await;
            }

            wire::CMD_CLOUD_METHOD => {
                self.stats.c2d_resp += 1;
                if payload.len() < 8 {
                    self.warn_event("short method response".to_string()).await;
                } else {
                    let rid =
                        u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
                    let status_code =
                        u32::from_le_bytes([payload[4], payload[5], payload[6], payload[7]]);
                    let result = f64_values(&payload[8..]);
                    self.publish(DeviceEvent::MethodRes {
                        rid,
                        status_code,
                        result,
                    })
                    .await;
                }
            }

            wire::CMD_PING => {
                let payload64 = general_purpose::STANDARD.encode(payload);
                self.publish(DeviceEvent::Pong { payload64 }).await;
            }

            wire::CMD_KEEPALIVE => {
                // Echo the identical frame back
                self.send_record(&wire::cmd_frame(wire::CMD_KEEPALIVE, payload))
                    .await?;
            }

            wire::CMD_DEPLOY_HASH..=wire::CMD_DEPLOY_FINISH | wire::CMD_NACK => {
                let step = self.deploy.on_device_msg(cmd, payload);
                self.apply_deploy_step(step).await?;
            }

            other => {
                self.warn_event(format!("unknown cmd 0x{other:02x}")).await;
            }
        }
        Ok(())
    }

    async fn handle_backend(&mut self, command: DeviceCommand) -> Result<(), &'static str> {
        match command {
            DeviceCommand::Method { rid, method, args } => {
                let mut values = Vec::with_capacity(args.len());
                for arg in &args {
                    match arg.as_f64() {
                        Some(v) => values.push(v),
                        None => {
                            self.warn_event(format!("method '{method}' requires numeric args"))
                                .await;
                            return Ok(());
                        }
                    }
                }
                self.stats.c2d += 1;
                let payload = encode_method(rid, &method, &values);
                self.send_record(&wire::cmd_frame(wire::CMD_CLOUD_METHOD, &payload))
                    .await?;
            }

            DeviceCommand::FrameTo { payload64 } => {
                match general_purpose::STANDARD.decode(&payload64) {
                    // Raw bytes straight through the record layer, unwrapped
                    Ok(bytes) => self.send_record(&bytes).await?,
                    Err(_) => {
                        self.warn_event("frameTo payload is not valid base64".to_string())
                            .await
                    }
                }
            }

            DeviceCommand::SetForwarding { forwarding } => {
                self.send_record(&wire::cmd_frame(
                    wire::CMD_SET_FORWARDING,
                    &[u8::from(forwarding)],
                ))
                .await?;
            }

            DeviceCommand::Ping { payload64 } => {
                match general_purpose::STANDARD.decode(&payload64) {
                    Ok(bytes) => {
                        self.send_record(&wire::cmd_frame(wire::CMD_PING, &bytes))
                            .await?
                    }
                    Err(_) => {
                        self.warn_event("ping payload is not valid base64".to_string())
                            .await
                    }
                }
            }

            DeviceCommand::Update {
                script_id,
                script_version,
            } => {
                let target = match (script_id, script_version) {
                    (Some(id), Some(version)) => Some((id, version)),
                    // No pointer supplied: take whatever the row says now
                    _ => match self.backends.store.get_device(&self.path).await {
                        Ok(record) => {
                            let target = record.script_id.clone().zip(record.script_version);
                            self.device = record;
                            target
                        }
                        Err(e) => {
                            warn!(device = %self.path, error = %e, "device re-read failed");
                            None
                        }
                    },
                };
                if let Some((id, version)) = target {
                    self.sync_script(&id, version).await?;
                }
            }
        }
        Ok(())
    }

    /// Load the program if it changed, then start a deploy round unless the
    /// device already confirmed this exact image.
    async fn sync_script(
        &mut self,
        script_id: &str,
        script_version: u32,
    ) -> Result<(), &'static str> {
        if !self.deploy.matches(script_id, script_version) {
            self.deploy.clear();

            let body = match self
                .backends
                .store
                .get_script_body(script_id, script_version)
                .await
            {
                Ok(body) => body,
                Err(e) => {
                    warn!(device = %self.path, script_id, script_version, error = %e, "script fetch failed");
                    return Ok(());
                }
            };
            let bytes = match body.decode() {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(device = %self.path, script_id, error = %e, "script body undecodable");
                    return Ok(());
                }
            };
            if let Err(e) = self.deploy.set_program(script_id, script_version, bytes) {
                warn!(device = %self.path, script_id, error = %e, "invalid program image");
                return Ok(());
            }
        }

        if self.deploy.deployed_matches() {
            return Ok(());
        }
        let step = self.deploy.ensure_deployed();
        self.apply_deploy_step(step).await
    }

    async fn apply_deploy_step(&mut self, step: DeployStep) -> Result<(), &'static str> {
        match step {
            DeployStep::Idle | DeployStep::Done => {}
            DeployStep::Send(frames) => {
                for frame in frames {
                    self.send_record(&frame).await?;
                }
            }
            // Logged with its backoff by the engine; the session stays up
            DeployStep::Failed(_) => {}
        }
        Ok(())
    }

    /// Persist and report accumulated activity; no-op while idle.
    async fn flush_stats(&mut self) {
        if self.last_msg == 0 && self.stats.is_empty() {
            return;
        }

        let stats = self.stats;
        let deployed_hash = self.deploy.deployed_hash_hex();
        let now_ms = Utc::now().timestamp_millis();
        let result = self
            .backends
            .store
            .update_device(
                &self.path,
                Box::new(move |record| {
                    record.last_act = now_ms;
                    stats.add_into(&mut record.stats);
                    if deployed_hash.is_some() {
                        record.deployed_hash = deployed_hash;
                    }
                }),
            )
            .await;
        if let Err(e) = result {
            warn!(device = %self.path, error = %e, "stats flush failed");
        }

        let mut event = self.metric("tick");
        event.measurements = stats.measurements();
        self.backends.metrics.track(event);

        self.stats.clear();
        self.last_msg = 0;
    }

    /// Idempotent teardown: final flush, close with reason, report.
    async fn shutdown(&mut self, reason: &'static str) {
        if self.closed {
            return;
        }
        self.closed = true;

        info!(device = %self.path, session = %self.session_id, reason, "device session closed");
        self.flush_stats().await;
        self.transport.close(reason).await;

        let mut event = self.metric("disconnect");
        event
            .properties
            .insert("reason".to_string(), reason.to_string());
        self.backends.metrics.track(event);
    }

    async fn send_record(&mut self, plaintext: &[u8]) -> Result<(), &'static str> {
        match self.crypto.seal(plaintext) {
            Ok(record) => self
                .transport
                .send(&record)
                .await
                .map_err(|_| "transport error"),
            Err(SessionError::NonceExhausted) => Err("nonce exhausted"),
            Err(_) => Err("record too long"),
        }
    }

    async fn publish(&mut self, event: DeviceEvent) {
        if let Err(e) = self.backends.pubsub.pub_from_device(&self.path, event).await {
            warn!(device = %self.path, error = %e, "publish failed");
        }
    }

    async fn warn_event(&mut self, message: String) {
        warn!(device = %self.path, warning = %message, "protocol warning");
        self.publish(DeviceEvent::Warning { message }).await;
    }

    fn metric(&self, name: &str) -> MetricEvent {
        let mut event = MetricEvent::new(name);
        event.tags = TagOverrides {
            session_id: Some(self.session_id.clone()),
            user_id: Some(self.device.row_key.clone()),
            user_auth_user_id: Some(self.device.name.clone()),
        };
        event
    }
}

/// Split an upload payload: zero-terminated UTF-8 label, then packed LE f64
/// values. A missing terminator means the whole payload is the label.
fn parse_upload(payload: &[u8]) -> (String, Vec<f64>) {
    match payload.iter().position(|b| *b == 0) {
        Some(end) => (
            String::from_utf8_lossy(&payload[..end]).into_owned(),
            f64_values(&payload[end + 1..]),
        ),
        None => (String::from_utf8_lossy(payload).into_owned(), Vec::new()),
    }
}

/// Whole little-endian f64 words; trailing bytes are dropped.
fn f64_values(bytes: &[u8]) -> Vec<f64> {
    bytes
        .chunks_exact(8)
        .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
        .collect()
}

/// Method frame payload: rid, method name, zero separator, packed f64 args.
fn encode_method(rid: u32, method: &str, args: &[f64]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(4 + method.len() + 1 + args.len() * 8);
    payload.extend_from_slice(&rid.to_le_bytes());
    payload.extend_from_slice(method.as_bytes());
    payload.push(0);
    for value in args {
        payload.extend_from_slice(&value.to_le_bytes());
    }
    payload
}
