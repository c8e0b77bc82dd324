//! Program deployment state machine.
//!
//! A deployment round asks the device for its installed hash (0x93) and, on
//! mismatch, streams the image in 192-byte chunks (0x94 begin, 0x95 write,
//! 0x96 finalize). A successful finalize is never trusted on its own: the
//! round re-enters with a second hash check, and a disagreement at that
//! stage is a hard failure instead of silent divergence.
//!
//! The machine is pure state: callers feed device messages in and transmit
//! whatever frames come back. Retry backoff lives in a process-wide ledger
//! keyed by device path so a flapping device keeps its penalty across
//! reconnects.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use devlink_core::wire;

/// Base backoff unit.
const BACKOFF_STEP_MS: u64 = 10_000;

/// Failure count beyond which the backoff stops growing.
const BACKOFF_CAP: u32 = 20;

/// Cross-session deploy retry state, keyed by device path.
#[derive(Debug, Default)]
pub struct RetryLedger {
    entries: Mutex<HashMap<String, RetryEntry>>,
}

#[derive(Debug, Clone, Copy, Default)]
struct RetryEntry {
    blocked_until: Option<Instant>,
    num_fail: u32,
}

impl RetryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// True while the device is inside its backoff window.
    pub fn is_blocked(&self, path: &str) -> bool {
        self.entries
            .lock()
            .get(path)
            .and_then(|e| e.blocked_until)
            .is_some_and(|until| Instant::now() < until)
    }

    /// Consecutive failures recorded for the device.
    pub fn failures(&self, path: &str) -> u32 {
        self.entries.lock().get(path).map_or(0, |e| e.num_fail)
    }

    /// Record one failure and start the next backoff window. Returns the
    /// window length: `(2 + min(failures, 20)) * 10s`.
    pub fn record_failure(&self, path: &str) -> Duration {
        let mut entries = self.entries.lock();
        let entry = entries.entry(path.to_string()).or_default();
        entry.num_fail += 1;
        let backoff =
            Duration::from_millis(u64::from(2 + entry.num_fail.min(BACKOFF_CAP)) * BACKOFF_STEP_MS);
        entry.blocked_until = Some(Instant::now() + backoff);
        backoff
    }

    /// Lift the current window without forgiving past failures.
    pub fn clear_timeout(&self, path: &str) {
        if let Some(entry) = self.entries.lock().get_mut(path) {
            entry.blocked_until = None;
        }
    }

    /// Verified install: forget the device entirely.
    pub fn record_success(&self, path: &str) {
        self.entries.lock().remove(path);
    }
}

/// Program image validation failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramError {
    TooShort,
    BadMagic,
}

impl std::fmt::Display for ProgramError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TooShort => write!(f, "program image too short"),
            Self::BadMagic => write!(f, "program image has wrong magic"),
        }
    }
}

impl std::error::Error for ProgramError {}

/// Why a deployment round failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployError {
    /// Device sent 0xFF.
    Rejected,
    /// Device answered with a deploy opcode we were not waiting for.
    OutOfTurn { expect: u16, got: u16 },
    /// Hash still wrong right after a finalized install.
    HashMismatchAfterInstall,
}

impl std::fmt::Display for DeployError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rejected => write!(f, "device rejected deployment"),
            Self::OutOfTurn { expect, got } => {
                write!(f, "expected deploy ack 0x{expect:02x}, got 0x{got:02x}")
            }
            Self::HashMismatchAfterInstall => {
                write!(f, "installed hash mismatch after finalize")
            }
        }
    }
}

impl std::error::Error for DeployError {}

/// Outcome of one step of the machine.
#[derive(Debug, PartialEq, Eq)]
pub enum DeployStep {
    /// Nothing to transmit.
    Idle,
    /// Frames to send to the device.
    Send(Vec<Vec<u8>>),
    /// Install verified; retry state cleared.
    Done,
    /// Round failed; backoff recorded.
    Failed(DeployError),
}

/// Per-connection deploy state. At most one round is in flight:
/// `expecting == 0` iff idle.
pub struct DeployEngine {
    path: String,
    buffer: Vec<u8>,
    hash: [u8; 32],
    /// Hash the device itself confirmed installed this connection.
    deployed_hash: Option<[u8; 32]>,
    ptr: usize,
    expecting: u16,
    script_id: String,
    script_version: u32,
    /// Set when a round starts while we already believe the install
    /// succeeded: a mismatch then is final, not a reason to re-upload.
    second_try: bool,
    ledger: Arc<RetryLedger>,
}

impl DeployEngine {
    pub fn new(path: String, ledger: Arc<RetryLedger>) -> Self {
        Self {
            path,
            buffer: Vec::new(),
            hash: [0u8; 32],
            deployed_hash: None,
            ptr: 0,
            expecting: 0,
            script_id: String::new(),
            script_version: 0,
            second_try: false,
            ledger,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.expecting == 0
    }

    /// Loaded program matches this script pointer.
    pub fn matches(&self, script_id: &str, script_version: u32) -> bool {
        !self.buffer.is_empty()
            && self.script_id == script_id
            && self.script_version == script_version
    }

    /// Device already confirmed the loaded program.
    pub fn deployed_matches(&self) -> bool {
        !self.buffer.is_empty() && self.deployed_hash == Some(self.hash)
    }

    pub fn deployed_hash_hex(&self) -> Option<String> {
        self.deployed_hash.map(hex::encode)
    }

    /// Drop the loaded program. Always called before loading a new one.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.hash = [0u8; 32];
        self.ptr = 0;
        self.script_id.clear();
        self.script_version = 0;
    }

    /// Validate and take ownership of a program image.
    pub fn set_program(
        &mut self,
        script_id: &str,
        script_version: u32,
        bytes: Vec<u8>,
    ) -> Result<(), ProgramError> {
        self.clear();

        if bytes.len() < wire::PROGRAM_MIN_LEN {
            return Err(ProgramError::TooShort);
        }
        if bytes[..8] != wire::PROGRAM_MAGIC {
            return Err(ProgramError::BadMagic);
        }

        self.hash = Sha256::digest(&bytes).into();
        self.buffer = bytes;
        self.script_id = script_id.to_string();
        self.script_version = script_version;
        Ok(())
    }

    /// Start a deployment round unless one is in flight, nothing is loaded,
    /// or the device is inside its backoff window.
    pub fn ensure_deployed(&mut self) -> DeployStep {
        if !self.is_idle() || self.buffer.is_empty() {
            return DeployStep::Idle;
        }
        if self.ledger.is_blocked(&self.path) {
            debug!(device = %self.path, "deploy blocked by backoff window");
            return DeployStep::Idle;
        }

        self.second_try = self.deployed_hash == Some(self.hash);
        self.ptr = 0;
        self.expecting = wire::CMD_DEPLOY_HASH;
        DeployStep::Send(vec![wire::cmd_frame(wire::CMD_DEPLOY_HASH, &[])])
    }

    /// Feed one deploy-range device message (0x93..0x96 or 0xFF).
    pub fn on_device_msg(&mut self, cmd: u16, payload: &[u8]) -> DeployStep {
        if self.is_idle() {
            let cmd_hex = format!("0x{cmd:02x}");
            warn!(device = %self.path, cmd = %cmd_hex, "unsolicited deploy ack");
            return DeployStep::Idle;
        }
        if cmd == wire::CMD_NACK {
            return self.fail(DeployError::Rejected);
        }
        if cmd != self.expecting {
            return self.fail(DeployError::OutOfTurn {
                expect: self.expecting,
                got: cmd,
            });
        }

        match cmd {
            wire::CMD_DEPLOY_HASH => {
                if payload.len() >= 32 && payload[..32] == self.hash {
                    self.expecting = 0;
                    self.second_try = false;
                    self.deployed_hash = Some(self.hash);
                    self.ledger.record_success(&self.path);
                    info!(device = %self.path, hash = %hex::encode(self.hash), "program verified installed");
                    DeployStep::Done
                } else if self.second_try {
                    self.fail(DeployError::HashMismatchAfterInstall)
                } else {
                    let len = self.buffer.len() as u32;
                    self.ptr = 0;
                    self.expecting = wire::CMD_DEPLOY_START;
                    debug!(device = %self.path, len, "starting program upload");
                    DeployStep::Send(vec![wire::cmd_frame(
                        wire::CMD_DEPLOY_START,
                        &len.to_le_bytes(),
                    )])
                }
            }

            wire::CMD_DEPLOY_START | wire::CMD_DEPLOY_WRITE => {
                if self.ptr < self.buffer.len() {
                    let end = (self.ptr + wire::DEPLOY_CHUNK_MAX).min(self.buffer.len());
                    let chunk = self.buffer[self.ptr..end].to_vec();
                    self.ptr = end;
                    self.expecting = wire::CMD_DEPLOY_WRITE;
                    DeployStep::Send(vec![wire::cmd_frame(wire::CMD_DEPLOY_WRITE, &chunk)])
                } else {
                    self.expecting = wire::CMD_DEPLOY_FINISH;
                    DeployStep::Send(vec![wire::cmd_frame(wire::CMD_DEPLOY_FINISH, &[])])
                }
            }

            wire::CMD_DEPLOY_FINISH => {
                // The device accepted the image; record it, then verify what
                // it actually reports before calling the round a success.
                self.deployed_hash = Some(self.hash);
                self.expecting = 0;
                self.ledger.clear_timeout(&self.path);
                self.ensure_deployed()
            }

            _ => DeployStep::Idle,
        }
    }

    fn fail(&mut self, err: DeployError) -> DeployStep {
        self.expecting = 0;
        self.second_try = false;
        let window = self.ledger.record_failure(&self.path);
        warn!(
            device = %self.path,
            error = %err,
            failures = self.ledger.failures(&self.path),
            backoff_secs = window.as_secs(),
            "deploy failed"
        );
        DeployStep::Failed(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_program(len: usize) -> Vec<u8> {
        let mut bytes = wire::PROGRAM_MAGIC.to_vec();
        bytes.resize(len, 0x11);
        bytes
    }

    fn engine_with_program(len: usize) -> (DeployEngine, Arc<RetryLedger>) {
        let ledger = Arc::new(RetryLedger::new());
        let mut engine = DeployEngine::new("p/r".to_string(), ledger.clone());
        engine.set_program("scriptA", 7, make_program(len)).unwrap();
        (engine, ledger)
    }

    fn expect_send(step: DeployStep) -> Vec<Vec<u8>> {
        match step {
            DeployStep::Send(frames) => frames,
            other => panic!("expected Send, got {other:?}"),
        }
    }

    #[test]
    fn test_program_validation() {
        let ledger = Arc::new(RetryLedger::new());
        let mut engine = DeployEngine::new("p/r".into(), ledger);

        assert_eq!(
            engine.set_program("s", 1, vec![0u8; 64]),
            Err(ProgramError::TooShort)
        );
        assert_eq!(
            engine.set_program("s", 1, vec![0u8; 256]),
            Err(ProgramError::BadMagic)
        );
        assert!(engine.set_program("s", 1, make_program(256)).is_ok());
        assert!(engine.matches("s", 1));
        assert!(!engine.matches("s", 2));
    }

    #[test]
    fn test_ensure_sends_hash_request() {
        let (mut engine, _) = engine_with_program(2048);
        let frames = expect_send(engine.ensure_deployed());
        assert_eq!(frames, vec![vec![0x93, 0x00, 0x00, 0x00]]);
        assert!(!engine.is_idle());

        // Only one round in flight
        assert_eq!(engine.ensure_deployed(), DeployStep::Idle);
    }

    #[test]
    fn test_mismatch_starts_upload_with_length() {
        let (mut engine, _) = engine_with_program(2048);
        expect_send(engine.ensure_deployed());

        let frames = expect_send(engine.on_device_msg(0x93, &[0xFF; 32]));
        assert_eq!(frames, vec![vec![0x94, 0x00, 0x00, 0x00, 0x00, 0x08, 0x00, 0x00]]);
    }

    #[test]
    fn test_matching_hash_is_immediate_success() {
        let (mut engine, ledger) = engine_with_program(512);
        ledger.record_failure("p/r");
        ledger.clear_timeout("p/r");
        expect_send(engine.ensure_deployed());

        let installed = engine.hash;
        assert_eq!(engine.on_device_msg(0x93, &installed), DeployStep::Done);
        assert!(engine.deployed_matches());
        assert_eq!(ledger.failures("p/r"), 0);
    }

    #[test]
    fn test_full_upload_then_reverify() {
        let (mut engine, _) = engine_with_program(2048);
        expect_send(engine.ensure_deployed());
        expect_send(engine.on_device_msg(0x93, &[0xFF; 32]));

        // Drive the chunk loop: 2048 bytes = 10 full chunks + one 128-byte tail
        let mut writes = Vec::new();
        let mut cmd = 0x94;
        loop {
            let frames = expect_send(engine.on_device_msg(cmd, &[]));
            assert_eq!(frames.len(), 1);
            let frame = &frames[0];
            if frame[0] == 0x96 {
                break;
            }
            assert_eq!(frame[0], 0x95);
            writes.push(frame.len() - 4);
            cmd = 0x95;
        }
        assert_eq!(writes.len(), 11);
        assert!(writes[..10].iter().all(|&n| n == 192));
        assert_eq!(writes[10], 128);

        // Finalize ack flips deployed_hash and immediately re-verifies
        let frames = expect_send(engine.on_device_msg(0x96, &[]));
        assert_eq!(frames, vec![vec![0x93, 0x00, 0x00, 0x00]]);
        assert!(engine.deployed_matches());

        // Device confirms: round complete
        let installed = engine.hash;
        assert_eq!(engine.on_device_msg(0x93, &installed), DeployStep::Done);
        assert!(engine.is_idle());
    }

    #[test]
    fn test_second_try_mismatch_is_fatal() {
        let (mut engine, ledger) = engine_with_program(256);
        expect_send(engine.ensure_deployed());
        expect_send(engine.on_device_msg(0x93, &[0xFF; 32]));
        expect_send(engine.on_device_msg(0x94, &[])); // chunk 192
        expect_send(engine.on_device_msg(0x95, &[])); // chunk 64
        expect_send(engine.on_device_msg(0x95, &[])); // finalize
        expect_send(engine.on_device_msg(0x96, &[])); // re-verify 0x93

        // Device still reports a different hash after install
        assert_eq!(
            engine.on_device_msg(0x93, &[0xFF; 32]),
            DeployStep::Failed(DeployError::HashMismatchAfterInstall)
        );
        assert!(engine.is_idle());
        assert_eq!(ledger.failures("p/r"), 1);
        assert!(ledger.is_blocked("p/r"));

        // Blocked: no new round until the window passes
        assert_eq!(engine.ensure_deployed(), DeployStep::Idle);
    }

    #[test]
    fn test_reject_and_out_of_turn_fail() {
        let (mut engine, ledger) = engine_with_program(256);
        expect_send(engine.ensure_deployed());
        assert_eq!(
            engine.on_device_msg(0xFF, &[]),
            DeployStep::Failed(DeployError::Rejected)
        );

        ledger.clear_timeout("p/r");
        expect_send(engine.ensure_deployed());
        assert_eq!(
            engine.on_device_msg(0x95, &[]),
            DeployStep::Failed(DeployError::OutOfTurn { expect: 0x93, got: 0x95 })
        );
        assert_eq!(ledger.failures("p/r"), 2);
    }

    #[test]
    fn test_unsolicited_ack_is_ignored() {
        let (mut engine, ledger) = engine_with_program(256);
        assert_eq!(engine.on_device_msg(0x93, &[0u8; 32]), DeployStep::Idle);
        assert_eq!(ledger.failures("p/r"), 0);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let ledger = RetryLedger::new();
        for k in 1..=25u32 {
            let window = ledger.record_failure("p/r");
            assert_eq!(
                window,
                Duration::from_millis(u64::from(2 + k.min(20)) * 10_000)
            );
        }
        assert!(ledger.is_blocked("p/r"));
        assert_eq!(ledger.failures("p/r"), 25);

        ledger.clear_timeout("p/r");
        assert!(!ledger.is_blocked("p/r"));
        assert_eq!(ledger.failures("p/r"), 25);

        ledger.record_success("p/r");
        assert_eq!(ledger.failures("p/r"), 0);
    }

    #[test]
    fn test_clear_before_reload() {
        let (mut engine, _) = engine_with_program(256);
        let old_hash = engine.hash;
        engine.clear();
        assert!(!engine.matches("scriptA", 7));
        assert!(!engine.deployed_matches());

        engine.set_program("scriptB", 1, make_program(384)).unwrap();
        assert_ne!(engine.hash, old_hash);
    }
}
