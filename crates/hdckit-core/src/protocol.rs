//! Wire formats for the HDC control protocol and the uitest kit framing.
//!
//! Two independent framings live here:
//!
//! # HDC control channel (Big Endian)
//!
//! ```text
//! daemon -> host   [48-byte banner: u32 len | "OHOS HDC" padded to 12 | channel info]
//! host -> daemon   [u32 len = 268] [banner: 12 bytes] [connect key: 256 bytes]
//! command          [u32 len] [UTF-8 text] [0x00]
//! data chunk       [u32 len] [payload]            (len == 0 marks end of stream)
//! ```
//!
//! # uitest kit channel (Big Endian)
//!
//! ```text
//! [header sentinel] [u32 session id] [u32 payload len] [payload] [tail sentinel]
//! ```
//!
//! Both sentinels are fixed ASCII strings and must match byte for byte.
//!
//! # Example
//!
//! ```
//! use hdckit_core::protocol::{encode_kit_frame, decode_kit_prefix, KIT_PREFIX_LEN};
//!
//! let wire = encode_kit_frame(0x0100_0001, b"{}");
//! let prefix: [u8; KIT_PREFIX_LEN] = wire[..KIT_PREFIX_LEN].try_into().unwrap();
//! let (session_id, len) = decode_kit_prefix(&prefix).unwrap();
//! assert_eq!(session_id, 0x0100_0001);
//! assert_eq!(len, 2);
//! ```

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use thiserror::Error;

// ---------------------------------------------------------------------------
// HDC constants
// ---------------------------------------------------------------------------

/// Magic string the daemon places at the start of its banner.
pub const HANDSHAKE_MAGIC: &[u8] = b"OHOS HDC";

/// Size of the banner field in both the daemon greeting and the connect packet.
pub const BANNER_SIZE: usize = 12;

/// Total size of the greeting the daemon sends on every new connection.
pub const DAEMON_GREETING_SIZE: usize = 48;

/// Offset of the banner inside the daemon greeting (after its length prefix).
pub const BANNER_OFFSET: usize = 4;

/// Size of the identity token ("connect key") field in the connect packet.
pub const CONNECT_KEY_SIZE: usize = 256;

/// Upper bound for one data chunk. Anything larger is treated as corruption.
pub const MAX_CHUNK_SIZE: usize = 64 * 1024 * 1024;

/// Marker the daemon embeds in a response when a command failed.
pub const FAIL_MARKER: &str = "[Fail]";

/// Response body of `list targets` when no device is attached.
pub const EMPTY_MARKER: &str = "[Empty]";

/// Command that marks a control connection as long-lived.
pub const ALIVE_COMMAND: &str = "alive";

// ---------------------------------------------------------------------------
// Kit constants
// ---------------------------------------------------------------------------

/// Sentinel that opens every uitest kit frame.
pub const KIT_HEADER: &[u8] = b"_uitestkit_rpc_message_head_";

/// Sentinel that closes every uitest kit frame.
pub const KIT_TAIL: &[u8] = b"_uitestkit_rpc_message_tail_";

/// Bytes preceding the payload: header sentinel + session id + length.
pub const KIT_PREFIX_LEN: usize = KIT_HEADER.len() + 8;

/// Session ids below this value are reserved by the device agent.
pub const MIN_SESSION_ID: u32 = 1 << 24;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur while encoding or validating wire data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The daemon greeting does not carry the expected magic.
    #[error("bad handshake banner: {0}")]
    BadBanner(String),

    /// A kit frame did not start with the header sentinel.
    #[error("kit frame header sentinel mismatch")]
    BadHeader,

    /// A kit frame did not end with the tail sentinel.
    #[error("kit frame tail sentinel mismatch")]
    BadTail,

    /// A length field exceeds [`MAX_CHUNK_SIZE`].
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),

    /// A buffer is shorter than the structure it should contain.
    #[error("insufficient data in buffer")]
    InsufficientData,
}

// ---------------------------------------------------------------------------
// HDC framing
// ---------------------------------------------------------------------------

/// Wrap a payload with the 4-byte BE length header.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Read the payload length from a 4-byte BE header.
pub fn read_frame_length(header: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*header)
}

/// Encode a text command: length prefix, the text, and a NUL terminator.
///
/// The length covers the terminator.
pub fn encode_command(text: &str) -> Vec<u8> {
    let mut body = Vec::with_capacity(text.len() + 1);
    body.extend_from_slice(text.as_bytes());
    body.push(0);
    encode_frame(&body)
}

/// Decode a command frame payload back into text, dropping the terminator.
pub fn decode_command(payload: &[u8]) -> String {
    let body = payload.strip_suffix(&[0]).unwrap_or(payload);
    String::from_utf8_lossy(body).into_owned()
}

/// Verify the greeting the daemon sends on connect.
pub fn verify_banner(greeting: &[u8]) -> Result<(), ProtocolError> {
    if greeting.len() < DAEMON_GREETING_SIZE {
        return Err(ProtocolError::BadBanner(format!(
            "expected {DAEMON_GREETING_SIZE} bytes, got {}",
            greeting.len()
        )));
    }
    let magic = &greeting[BANNER_OFFSET..BANNER_OFFSET + HANDSHAKE_MAGIC.len()];
    if magic != HANDSHAKE_MAGIC {
        return Err(ProtocolError::BadBanner(format!("magic mismatch: {magic:02X?}")));
    }
    Ok(())
}

/// Build the greeting a daemon sends. Used by mock daemons in tests.
pub fn encode_daemon_greeting(channel_id: u32) -> [u8; DAEMON_GREETING_SIZE] {
    let mut greeting = [0u8; DAEMON_GREETING_SIZE];
    greeting[..4].copy_from_slice(&((DAEMON_GREETING_SIZE - 4) as u32).to_be_bytes());
    greeting[BANNER_OFFSET..BANNER_OFFSET + HANDSHAKE_MAGIC.len()].copy_from_slice(HANDSHAKE_MAGIC);
    let id_offset = BANNER_OFFSET + BANNER_SIZE;
    greeting[id_offset..id_offset + 4].copy_from_slice(&channel_id.to_be_bytes());
    greeting
}

/// Build the connect packet answering the daemon greeting.
///
/// The identity token is the target device serial (empty for host-level
/// commands). Tokens longer than [`CONNECT_KEY_SIZE`] are truncated.
pub fn encode_connect_packet(identity: &str) -> Vec<u8> {
    let mut body = vec![0u8; BANNER_SIZE + CONNECT_KEY_SIZE];
    body[..HANDSHAKE_MAGIC.len()].copy_from_slice(HANDSHAKE_MAGIC);
    let key = identity.as_bytes();
    let n = key.len().min(CONNECT_KEY_SIZE);
    body[BANNER_SIZE..BANNER_SIZE + n].copy_from_slice(&key[..n]);
    encode_frame(&body)
}

/// Extract the identity token from a connect packet payload (without the
/// length header). Used by mock daemons in tests.
pub fn decode_connect_identity(payload: &[u8]) -> Result<String, ProtocolError> {
    if payload.len() < BANNER_SIZE + CONNECT_KEY_SIZE {
        return Err(ProtocolError::InsufficientData);
    }
    let key = &payload[BANNER_SIZE..BANNER_SIZE + CONNECT_KEY_SIZE];
    let end = key.iter().position(|b| *b == 0).unwrap_or(key.len());
    Ok(String::from_utf8_lossy(&key[..end]).into_owned())
}

// ---------------------------------------------------------------------------
// Kit framing
// ---------------------------------------------------------------------------

/// Encode one kit frame.
pub fn encode_kit_frame(session_id: u32, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(KIT_PREFIX_LEN + payload.len() + KIT_TAIL.len());
    frame.extend_from_slice(KIT_HEADER);
    frame.extend_from_slice(&session_id.to_be_bytes());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    frame.extend_from_slice(KIT_TAIL);
    frame
}

/// Validate the header sentinel and return `(session_id, payload_len)`.
pub fn decode_kit_prefix(prefix: &[u8; KIT_PREFIX_LEN]) -> Result<(u32, u32), ProtocolError> {
    let (sentinel, rest) = prefix.split_at(KIT_HEADER.len());
    if sentinel != KIT_HEADER {
        return Err(ProtocolError::BadHeader);
    }
    let session_id = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]);
    let len = u32::from_be_bytes([rest[4], rest[5], rest[6], rest[7]]);
    if len as usize > MAX_CHUNK_SIZE {
        return Err(ProtocolError::FrameTooLarge(len as usize));
    }
    Ok((session_id, len))
}

/// Validate the tail sentinel.
pub fn verify_kit_tail(tail: &[u8]) -> Result<(), ProtocolError> {
    if tail != KIT_TAIL {
        return Err(ProtocolError::BadTail);
    }
    Ok(())
}

/// Derive a session id from a request body, a coarse timestamp and a salt.
///
/// The result is always at least [`MIN_SESSION_ID`].
pub fn session_id(payload: &[u8], coarse_secs: u64, salt: u64) -> u32 {
    let mut hasher = DefaultHasher::new();
    payload.hash(&mut hasher);
    coarse_secs.hash(&mut hasher);
    salt.hash(&mut hasher);
    let id = hasher.finish() as u32;
    if id < MIN_SESSION_ID {
        id + MIN_SESSION_ID
    } else {
        id
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
