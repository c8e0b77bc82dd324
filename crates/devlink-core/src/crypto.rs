//! Low-level crypto primitives for the device record layer.
//!
//! Everything on the wire after the server hello is AES-256-CCM with a
//! 4-byte tag and a 13-byte counter nonce. The single-block AES encrypt
//! exists only for the legacy v1 key derivation; v2 sessions derive keys
//! with HKDF-SHA256.

use aes::Aes256;
use aes::cipher::BlockEncrypt;
use ccm::aead::generic_array::GenericArray;
use ccm::aead::{Aead, KeyInit};
use ccm::consts::{U13, U4};
use ccm::Ccm;
use hkdf::Hkdf;
use sha2::Sha256;

/// Symmetric key length (AES-256).
pub const KEY_LEN: usize = 32;

/// CCM nonce length (N parameter).
pub const NONCE_LEN: usize = 13;

/// CCM authentication tag length.
pub const TAG_LEN: usize = 4;

/// AES-256-CCM with tag=4, L=2, N=13.
type Aes256Ccm = Ccm<Aes256, U4, U13>;

/// Errors from the crypto primitives.
///
/// `AuthFailed` is deliberately opaque: a short payload, a flipped
/// ciphertext byte and a flipped tag byte all surface identically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoError {
    /// Record failed authentication (or was too short to carry a tag).
    AuthFailed,
    /// Plaintext exceeds the CCM L=2 length field.
    MessageTooLong,
    /// Key derivation produced no output.
    KeyDerivation,
}

impl std::fmt::Display for CryptoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AuthFailed => write!(f, "authentication failed"),
            Self::MessageTooLong => write!(f, "message too long for CCM length field"),
            Self::KeyDerivation => write!(f, "key derivation failed"),
        }
    }
}

impl std::error::Error for CryptoError {}

/// Encrypt a single 16-byte block with AES-256 (v1 key derivation only).
pub fn aes_block(key: &[u8; KEY_LEN], block: &[u8; 16]) -> [u8; 16] {
    let cipher = Aes256::new(GenericArray::from_slice(key));
    let mut out = GenericArray::clone_from_slice(block);
    cipher.encrypt_block(&mut out);
    out.into()
}

/// Seal `plaintext` as `ciphertext || tag[4]` under the given counter nonce.
pub fn ccm_encrypt(
    key: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    // L=2 limits a record to 65535 plaintext bytes
    if plaintext.len() > u16::MAX as usize {
        return Err(CryptoError::MessageTooLong);
    }

    let cipher = Aes256Ccm::new(GenericArray::from_slice(key));
    cipher
        .encrypt(GenericArray::from_slice(nonce), plaintext)
        .map_err(|_| CryptoError::MessageTooLong)
}

/// Open a `ciphertext || tag[4]` record under the given counter nonce.
pub fn ccm_decrypt(
    key: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    payload: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if payload.len() < TAG_LEN {
        return Err(CryptoError::AuthFailed);
    }

    let cipher = Aes256Ccm::new(GenericArray::from_slice(key));
    cipher
        .decrypt(GenericArray::from_slice(nonce), payload)
        .map_err(|_| CryptoError::AuthFailed)
}

/// HKDF-SHA256 with a fixed 32-byte output. This system always passes an
/// empty salt.
pub fn hkdf_sha256(ikm: &[u8], salt: &[u8], info: &[u8]) -> Result<[u8; KEY_LEN], CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = [0u8; KEY_LEN];
    hk.expand(info, &mut okm)
        .map_err(|_| CryptoError::KeyDerivation)?;
    Ok(okm)
}

/// Big-endian +1 over all 13 nonce bytes; a wrapping byte carries upward.
///
/// Callers that must not wrap into the leading direction byte enforce that
/// themselves (see `session::DirectionNonce`).
pub fn inc_nonce(nonce: &mut [u8; NONCE_LEN]) {
    for b in nonce.iter_mut().rev() {
        *b = b.wrapping_add(1);
        if *b != 0 {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; KEY_LEN] = [0x42; KEY_LEN];
    const NONCE: [u8; NONCE_LEN] = [2, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];

    #[test]
    fn test_ccm_roundtrip() {
        let sealed = ccm_encrypt(&KEY, &NONCE, b"hello world").unwrap();
        assert_eq!(sealed.len(), 11 + TAG_LEN);

        let opened = ccm_decrypt(&KEY, &NONCE, &sealed).unwrap();
        assert_eq!(opened, b"hello world");
    }

    #[test]
    fn test_auth_failure_is_opaque() {
        let sealed = ccm_encrypt(&KEY, &NONCE, &[0u8; 32]).unwrap();

        // Flipped ciphertext byte
        let mut t = sealed.clone();
        t[0] ^= 0x01;
        assert_eq!(ccm_decrypt(&KEY, &NONCE, &t), Err(CryptoError::AuthFailed));

        // Flipped tag byte
        let mut t = sealed.clone();
        let last = t.len() - 1;
        t[last] ^= 0x80;
        assert_eq!(ccm_decrypt(&KEY, &NONCE, &t), Err(CryptoError::AuthFailed));

        // Truncated tag
        let t = &sealed[..sealed.len() - 1];
        assert_eq!(ccm_decrypt(&KEY, &NONCE, t), Err(CryptoError::AuthFailed));

        // Shorter than a tag at all
        assert_eq!(ccm_decrypt(&KEY, &NONCE, &[1, 2, 3]), Err(CryptoError::AuthFailed));
    }

    #[test]
    fn test_wrong_nonce_fails_auth() {
        let sealed = ccm_encrypt(&KEY, &NONCE, b"payload").unwrap();
        let mut other = NONCE;
        inc_nonce(&mut other);
        assert_eq!(ccm_decrypt(&KEY, &other, &sealed), Err(CryptoError::AuthFailed));
    }

    #[test]
    fn test_aes_block_deterministic() {
        let a = aes_block(&KEY, &[7u8; 16]);
        let b = aes_block(&KEY, &[7u8; 16]);
        assert_eq!(a, b);
        assert_ne!(a, [7u8; 16]);

        // Different key, different block
        let c = aes_block(&[0x43; KEY_LEN], &[7u8; 16]);
        assert_ne!(a, c);
    }

    #[test]
    fn test_hkdf_deterministic() {
        let a = hkdf_sha256(&[1u8; 32], &[], b"info").unwrap();
        let b = hkdf_sha256(&[1u8; 32], &[], b"info").unwrap();
        assert_eq!(a, b);

        let c = hkdf_sha256(&[1u8; 32], &[], b"other").unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_inc_nonce_carries() {
        let mut n = [0u8; NONCE_LEN];
        inc_nonce(&mut n);
        assert_eq!(n[NONCE_LEN - 1], 1);

        let mut n = [0u8; NONCE_LEN];
        n[NONCE_LEN - 1] = 0xFF;
        inc_nonce(&mut n);
        assert_eq!(n[NONCE_LEN - 2], 1);
        assert_eq!(n[NONCE_LEN - 1], 0);

        // Carry across several bytes
        let mut n = [0u8; NONCE_LEN];
        n[10] = 0xFF;
        n[11] = 0xFF;
        n[12] = 0xFF;
        inc_nonce(&mut n);
        assert_eq!(&n[9..], &[1, 0, 0, 0]);
    }

    #[test]
    fn test_message_too_long() {
        let big = vec![0u8; u16::MAX as usize + 1];
        assert_eq!(
            ccm_encrypt(&KEY, &NONCE, &big),
            Err(CryptoError::MessageTooLong)
        );
    }
}
