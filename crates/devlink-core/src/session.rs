//! Session handshake and record layer.
//!
//! The gateway is the responder: it reads the protocol selector the device
//! presented at transport setup, answers with a cleartext hello carrying its
//! 16 random bytes, then proves key possession by sending 32 encrypted zero
//! bytes. The device proves the same with its first record. After that every
//! record is AES-256-CCM under per-direction counter nonces.
//!
//! `SessionCrypto` owns the key and both counters; `Handshake` drives the
//! responder steps without touching the transport, so the endpoint decides
//! how bytes move.

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{self, KEY_LEN, NONCE_LEN};
use crate::wire;

/// Key-derivation flavor, selected by the transport selector prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVersion {
    /// Legacy AES-block KDF (`jacdac-key-...`).
    V1,
    /// HKDF-SHA256 (`devs-key-...`).
    V2,
}

impl ProtocolVersion {
    /// Value carried in the server hello.
    pub fn wire_value(self) -> u32 {
        match self {
            Self::V1 => 1,
            Self::V2 => 2,
        }
    }
}

/// Session-layer failures. `reason()` is the close reason put on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionError {
    /// Selector did not match `devs-key-*` / `jacdac-key-*`.
    NoProtoKey,
    /// Selector key part was not 32 hex digits.
    WrongProtoKeySize,
    /// Record failed authentication, or the first record was not zeros.
    BadAuth,
    /// A counter would carry into the direction byte; the session must end.
    NonceExhausted,
    /// Plaintext too large for one record.
    RecordTooLong,
    /// Key derivation failed.
    KeyDerivation,
}

impl SessionError {
    /// Short human-readable close reason.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::NoProtoKey => "no proto-key",
            Self::WrongProtoKeySize => "wrong proto-key size",
            Self::BadAuth => "bad auth",
            Self::NonceExhausted => "nonce exhausted",
            Self::RecordTooLong => "record too long",
            Self::KeyDerivation => "key derivation failed",
        }
    }
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.reason())
    }
}

impl std::error::Error for SessionError {}

/// Parse a transport selector (`devs-key-<32 hex>` or `jacdac-key-<32 hex>`)
/// into the protocol version and the device's 16 random bytes.
pub fn parse_selector(selector: &str) -> Result<(ProtocolVersion, [u8; 16]), SessionError> {
    let (version, key_hex) = if let Some(rest) = selector.strip_prefix("devs-key-") {
        (ProtocolVersion::V2, rest)
    } else if let Some(rest) = selector.strip_prefix("jacdac-key-") {
        (ProtocolVersion::V1, rest)
    } else {
        return Err(SessionError::NoProtoKey);
    };

    if key_hex.len() != 32 {
        return Err(SessionError::WrongProtoKeySize);
    }
    let bytes = hex::decode(key_hex).map_err(|_| SessionError::WrongProtoKeySize)?;

    let mut client_random = [0u8; 16];
    client_random.copy_from_slice(&bytes);
    Ok((version, client_random))
}

/// Derive the 32-byte session key from the device long-term key and both
/// sides' random bytes.
pub fn derive_session_key(
    version: ProtocolVersion,
    devkey: &[u8; KEY_LEN],
    client_random: &[u8; 16],
    server_random: &[u8; 16],
) -> Result<[u8; KEY_LEN], SessionError> {
    match version {
        ProtocolVersion::V1 => {
            let mut block = [0u8; 16];
            block[..8].copy_from_slice(&client_random[..8]);
            block[8..].copy_from_slice(&server_random[..8]);
            let lo = crypto::aes_block(devkey, &block);

            block[..8].copy_from_slice(&client_random[8..]);
            block[8..].copy_from_slice(&server_random[8..]);
            let hi = crypto::aes_block(devkey, &block);

            let mut key = [0u8; KEY_LEN];
            key[..16].copy_from_slice(&lo);
            key[16..].copy_from_slice(&hi);
            Ok(key)
        }
        ProtocolVersion::V2 => {
            let mut info = [0u8; 32];
            info[..16].copy_from_slice(client_random);
            info[16..].copy_from_slice(server_random);
            crypto::hkdf_sha256(devkey, &[], &info).map_err(|_| SessionError::KeyDerivation)
        }
    }
}

/// Session key with guaranteed wipe on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
struct SessionKey([u8; KEY_LEN]);

/// One direction's 13-byte counter nonce.
///
/// The leading byte identifies the direction and is never a legitimate
/// carry target: once an increment reaches it the direction is poisoned and
/// every further use fails with `NonceExhausted`.
#[derive(Debug, Clone, Copy)]
struct DirectionNonce {
    bytes: [u8; NONCE_LEN],
    direction: u8,
    poisoned: bool,
}

impl DirectionNonce {
    fn new(direction: u8) -> Self {
        let mut bytes = [0u8; NONCE_LEN];
        bytes[0] = direction;
        Self {
            bytes,
            direction,
            poisoned: false,
        }
    }

    fn current(&self) -> Result<[u8; NONCE_LEN], SessionError> {
        if self.poisoned {
            return Err(SessionError::NonceExhausted);
        }
        Ok(self.bytes)
    }

    fn advance(&mut self) {
        crypto::inc_nonce(&mut self.bytes);
        if self.bytes[0] != self.direction {
            self.poisoned = true;
        }
    }
}

/// Post-handshake record crypto: key plus both directional counters.
pub struct SessionCrypto {
    key: SessionKey,
    client: DirectionNonce,
    server: DirectionNonce,
}

impl SessionCrypto {
    pub fn new(key: [u8; KEY_LEN]) -> Self {
        Self {
            key: SessionKey(key),
            client: DirectionNonce::new(wire::NONCE_CLIENT),
            server: DirectionNonce::new(wire::NONCE_SERVER),
        }
    }

    /// Seal one outbound record under the server nonce, then advance it.
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, SessionError> {
        let nonce = self.server.current()?;
        let record = crypto::ccm_encrypt(&self.key.0, &nonce, plaintext)
            .map_err(|_| SessionError::RecordTooLong)?;
        self.server.advance();
        Ok(record)
    }

    /// Open one inbound record under the client nonce.
    ///
    /// The counter advances whether or not authentication succeeds, so a
    /// tampered record cannot desynchronize an honest device.
    pub fn open(&mut self, record: &[u8]) -> Result<Vec<u8>, SessionError> {
        let nonce = self.client.current()?;
        let result = crypto::ccm_decrypt(&self.key.0, &nonce, record);
        self.client.advance();
        result.map_err(|_| SessionError::BadAuth)
    }

    /// Diagnostic snapshot of both counters.
    pub fn nonce_state(&self) -> ([u8; NONCE_LEN], [u8; NONCE_LEN]) {
        (self.client.bytes, self.server.bytes)
    }
}

impl std::fmt::Debug for SessionCrypto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never the key
        f.debug_struct("SessionCrypto")
            .field("client", &self.client)
            .field("server", &self.server)
            .finish()
    }
}

/// Responder-side handshake state.
pub struct Handshake {
    version: ProtocolVersion,
    server_random: [u8; 16],
    crypto: SessionCrypto,
}

impl Handshake {
    /// Derive session keys for an accepted selector.
    pub fn respond(
        version: ProtocolVersion,
        devkey: &[u8; KEY_LEN],
        client_random: &[u8; 16],
        server_random: [u8; 16],
    ) -> Result<Self, SessionError> {
        let key = derive_session_key(version, devkey, client_random, &server_random)?;
        Ok(Self {
            version,
            server_random,
            crypto: SessionCrypto::new(key),
        })
    }

    /// Cleartext server hello: LE magic, LE version, 16 random bytes.
    pub fn hello(&self) -> [u8; wire::HELLO_LEN] {
        let mut out = [0u8; wire::HELLO_LEN];
        out[..4].copy_from_slice(&wire::HELLO_MAGIC.to_le_bytes());
        out[4..8].copy_from_slice(&self.version.wire_value().to_le_bytes());
        out[8..].copy_from_slice(&self.server_random);
        out
    }

    /// First encrypted frame: 32 zero bytes proving the server's key.
    pub fn auth_record(&mut self) -> Result<Vec<u8>, SessionError> {
        self.crypto.seal(&[0u8; wire::AUTH_PLAINTEXT_LEN])
    }

    /// Check the device's first record: at least 32 bytes of plaintext with
    /// a leading zero block. Residual bytes are discarded. On success the
    /// session is authenticated and the record crypto is handed over.
    pub fn verify_first_record(mut self, record: &[u8]) -> Result<SessionCrypto, SessionError> {
        let plain = self.crypto.open(record)?;
        if plain.len() < wire::AUTH_PLAINTEXT_LEN || plain[..16].iter().any(|b| *b != 0) {
            return Err(SessionError::BadAuth);
        }
        Ok(self.crypto)
    }
}
