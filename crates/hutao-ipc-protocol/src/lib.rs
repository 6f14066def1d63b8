//! Hutao IPC Protocol -- wire types and packet codec for single-instance
//! activation redirection.
//!
//! One duplex local stream per session. Every packet is an 8-byte header
//! (version, type, command, content type, big-endian payload length)
//! followed by an optional JSON payload.

pub mod activation;
pub mod codec;
pub mod endpoint;
pub mod packet;

pub use activation::{ActivationKind, HutaoActivationArguments};
pub use codec::{decode_packet, encode_packet, PacketCodec};
pub use endpoint::{Endpoint, DEFAULT_ENDPOINT_NAME, PROTOCOL_VERSION};
pub use packet::*;

/// Header size in bytes.
pub const HEADER_SIZE: usize = 8;

/// Maximum payload size: 1 MB (activation arguments are a few hundred bytes).
pub const MAX_PACKET_PAYLOAD: usize = 1024 * 1024;

pub type Result<T> = std::result::Result<T, ProtocolError>;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("protocol version mismatch: expected {expected}, got {got}")]
    VersionMismatch { expected: u8, got: u8 },
    #[error("truncated payload: header declares {declared} bytes, {available} available")]
    TruncatedPayload { declared: usize, available: usize },
    #[error("unsupported operation: type {packet_type:#04x}, command {command:#04x}")]
    UnsupportedOperation { packet_type: u8, command: u8 },
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },
    #[error("channel timed out after {duration_ms} ms")]
    ChannelTimeout { duration_ms: u64 },
    #[error("channel closed")]
    ChannelClosed,
    #[error("endpoint {0} is already in use")]
    EndpointInUse(String),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

