//! Wire-level constants and plaintext frame parsing.

/// Magic leading the cleartext server hello (little-endian on the wire).
pub const HELLO_MAGIC: u32 = 0xCEE4_28CA;

/// Server hello size: magic + version + 16 random bytes.
pub const HELLO_LEN: usize = 24;

/// Plaintext of the auth record and minimum length of the first client record.
pub const AUTH_PLAINTEXT_LEN: usize = 32;

/// Leading nonce byte for the device-to-gateway direction.
pub const NONCE_CLIENT: u8 = 1;

/// Leading nonce byte for the gateway-to-device direction.
pub const NONCE_SERVER: u8 = 2;

// Command opcodes. Device-originated unless noted.
/// Labelled f64 tuple upload.
pub const CMD_UPLOAD: u16 = 0x80;
/// Binary telemetry record upload.
pub const CMD_UPLOAD_BIN: u16 = 0x81;
/// Cloud method call (gateway to device); device acks with the same opcode.
pub const CMD_CLOUD_METHOD: u16 = 0x83;
/// Frame forwarding on/off (gateway to device).
pub const CMD_SET_FORWARDING: u16 = 0x90;
/// Ping (gateway to device); device echoes with the same opcode.
pub const CMD_PING: u16 = 0x91;
/// Keepalive echo request; the gateway answers with the identical frame.
pub const CMD_KEEPALIVE: u16 = 0x92;
/// Report the currently installed program hash.
pub const CMD_DEPLOY_HASH: u16 = 0x93;
/// Begin a program upload; payload is the image length as u32-LE.
pub const CMD_DEPLOY_START: u16 = 0x94;
/// One program chunk.
pub const CMD_DEPLOY_WRITE: u16 = 0x95;
/// Finalize a program upload.
pub const CMD_DEPLOY_FINISH: u16 = 0x96;
/// Device-side reject of the current deploy round.
pub const CMD_NACK: u16 = 0xFF;

/// Command frame header: u16-LE opcode, two zero bytes.
pub const CMD_HEADER_LEN: usize = 4;

/// A passthrough bus frame is `msg[2] + 12` bytes long in total.
pub const BUS_FRAME_OVERHEAD: usize = 12;

/// Largest program chunk carried by a single `CMD_DEPLOY_WRITE`.
pub const DEPLOY_CHUNK_MAX: usize = 192;

/// First 8 bytes of every valid program image.
pub const PROGRAM_MAGIC: [u8; 8] = [0x4A, 0x61, 0x63, 0x53, 0x0A, 0x7E, 0x6A, 0x9A];

/// Smallest valid program image.
pub const PROGRAM_MIN_LEN: usize = 128;

/// One decrypted inbound message, discriminated on `msg[2]`.
#[derive(Debug, PartialEq, Eq)]
pub enum Frame<'a> {
    /// Compressed command frame: opcode at offset 0, payload from offset 4.
    Command { cmd: u16, payload: &'a [u8] },
    /// Raw bus frame to forward to the backend verbatim.
    Forward { frame: &'a [u8] },
}

/// Frame-shape violations. These are protocol warnings, never fatal.
#[derive(Debug, PartialEq, Eq)]
pub enum FrameError {
    /// Shorter than the 4-byte command header.
    TooShort,
    /// Bus frame length field exceeds the received message.
    Truncated { expect: usize, have: usize },
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TooShort => write!(f, "frame too short"),
            Self::Truncated { expect, have } => {
                write!(f, "frame too short: expected {expect} bytes, got {have}")
            }
        }
    }
}

/// Split a decrypted message into a command frame or a passthrough bus frame.
pub fn parse_frame(msg: &[u8]) -> Result<Frame<'_>, FrameError> {
    if msg.len() < CMD_HEADER_LEN {
        return Err(FrameError::TooShort);
    }

    if msg[2] == 0 {
        let cmd = u16::from_le_bytes([msg[0], msg[1]]);
        return Ok(Frame::Command {
            cmd,
            payload: &msg[CMD_HEADER_LEN..],
        });
    }

    let flen = msg[2] as usize + BUS_FRAME_OVERHEAD;
    if flen > msg.len() {
        return Err(FrameError::Truncated {
            expect: flen,
            have: msg.len(),
        });
    }
    Ok(Frame::Forward { frame: &msg[..flen] })
}

/// Encode an outbound command frame: `[cmd-LE, 0, 0] || payload`.
pub fn cmd_frame(cmd: u16, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(CMD_HEADER_LEN + payload.len());
    out.extend_from_slice(&cmd.to_le_bytes());
    out.extend_from_slice(&[0, 0]);
    out.extend_from_slice(payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_frame_dispatch() {
        let msg = [0x80, 0x00, 0x00, 0x00, 0xAA, 0xBB];
        match parse_frame(&msg).unwrap() {
            Frame::Command { cmd, payload } => {
                assert_eq!(cmd, CMD_UPLOAD);
                assert_eq!(payload, &[0xAA, 0xBB]);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_bus_frame_dispatch() {
        // msg[2] = 2 means a 14-byte bus frame; trailing bytes are dropped
        let mut msg = vec![0u8; 16];
        msg[2] = 2;
        match parse_frame(&msg).unwrap() {
            Frame::Forward { frame } => assert_eq!(frame.len(), 14),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_bus_frame_truncated() {
        let mut msg = vec![0u8; 10];
        msg[2] = 5;
        assert_eq!(
            parse_frame(&msg),
            Err(FrameError::Truncated { expect: 17, have: 10 })
        );
    }

    #[test]
    fn test_frame_too_short() {
        assert_eq!(parse_frame(&[0x80, 0x00, 0x00]), Err(FrameError::TooShort));
    }

    #[test]
    fn test_cmd_frame_header() {
        let frame = cmd_frame(CMD_DEPLOY_START, &2048u32.to_le_bytes());
        assert_eq!(frame, [0x94, 0x00, 0x00, 0x00, 0x00, 0x08, 0x00, 0x00]);
    }
}
