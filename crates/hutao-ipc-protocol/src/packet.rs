//! Packet model: header tags, payload types, and the `(type, command)`
//! lookup table that decides which payload a packet carries.

use serde::{Deserialize, Serialize};

use crate::activation::HutaoActivationArguments;
use crate::ProtocolError;

// ============================================================================
// Header tags
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    None = 0,
    Request = 1,
    Response = 2,
    SessionTermination = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketCommand {
    None = 0,
    RequestElevationStatus = 1,
    RedirectActivation = 2,
    Exit = 3,
}

/// Encoding of the payload section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ContentType {
    None = 0,
    Json = 1,
}

impl PacketType {
    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::None),
            1 => Some(Self::Request),
            2 => Some(Self::Response),
            3 => Some(Self::SessionTermination),
            _ => None,
        }
    }
}

impl PacketCommand {
    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::None),
            1 => Some(Self::RequestElevationStatus),
            2 => Some(Self::RedirectActivation),
            3 => Some(Self::Exit),
            _ => None,
        }
    }
}

impl ContentType {
    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::None),
            1 => Some(Self::Json),
            _ => None,
        }
    }
}

/// Fixed-layout packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub version: u8,
    pub packet_type: PacketType,
    pub command: PacketCommand,
    pub content_type: ContentType,
    /// Number of payload bytes following the header. Zero means no payload.
    pub payload_length: u32,
}

// ============================================================================
// Payloads
// ============================================================================

/// Server reply to `Request/RequestElevationStatus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElevationStatusResponse {
    pub is_elevated: bool,
}

/// Payload shape selected by a `(type, command)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Empty,
    ElevationStatus,
    Activation,
}

impl PayloadKind {
    pub fn content_type(self) -> ContentType {
        match self {
            PayloadKind::Empty => ContentType::None,
            PayloadKind::ElevationStatus | PayloadKind::Activation => ContentType::Json,
        }
    }
}

/// The lookup table. Every supported pair is listed; everything else is an
/// unsupported operation.
const PAYLOAD_TABLE: &[(PacketType, PacketCommand, PayloadKind)] = &[
    (
        PacketType::Request,
        PacketCommand::RequestElevationStatus,
        PayloadKind::Empty,
    ),
    (
        PacketType::Response,
        PacketCommand::RequestElevationStatus,
        PayloadKind::ElevationStatus,
    ),
    (
        PacketType::Request,
        PacketCommand::RedirectActivation,
        PayloadKind::Activation,
    ),
    (
        PacketType::SessionTermination,
        PacketCommand::None,
        PayloadKind::Empty,
    ),
    (
        PacketType::SessionTermination,
        PacketCommand::Exit,
        PayloadKind::Empty,
    ),
];

/// Resolve the payload kind for a header pair.
pub fn payload_kind(
    packet_type: PacketType,
    command: PacketCommand,
) -> Result<PayloadKind, ProtocolError> {
    PAYLOAD_TABLE
        .iter()
        .find(|(t, c, _)| *t == packet_type && *c == command)
        .map(|(_, _, kind)| *kind)
        .ok_or(ProtocolError::UnsupportedOperation {
            packet_type: packet_type as u8,
            command: command as u8,
        })
}

// ============================================================================
// Packet
// ============================================================================

/// A decoded packet, one variant per row of the lookup table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// `Request/RequestElevationStatus`, no payload.
    ElevationStatusRequest,
    /// `Response/RequestElevationStatus`.
    ElevationStatusResponse(ElevationStatusResponse),
    /// `Request/RedirectActivation`.
    RedirectActivation(HutaoActivationArguments),
    /// `SessionTermination/None`: the session ends normally.
    EndSession,
    /// `SessionTermination/Exit`: the receiving server must shut down.
    Exit,
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::ElevationStatusRequest | Packet::RedirectActivation(_) => PacketType::Request,
            Packet::ElevationStatusResponse(_) => PacketType::Response,
            Packet::EndSession | Packet::Exit => PacketType::SessionTermination,
        }
    }

    pub fn command(&self) -> PacketCommand {
        match self {
            Packet::ElevationStatusRequest | Packet::ElevationStatusResponse(_) => {
                PacketCommand::RequestElevationStatus
            }
            Packet::RedirectActivation(_) => PacketCommand::RedirectActivation,
            Packet::EndSession => PacketCommand::None,
            Packet::Exit => PacketCommand::Exit,
        }
    }

    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Packet::ElevationStatusRequest => "elevation-status-request",
            Packet::ElevationStatusResponse(_) => "elevation-status-response",
            Packet::RedirectActivation(_) => "redirect-activation",
            Packet::EndSession => "end-session",
            Packet::Exit => "exit",
        }
    }

    /// Serialize the payload section (empty for payload-less packets).
    pub(crate) fn payload_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(match self {
            Packet::ElevationStatusResponse(status) => serde_json::to_vec(status)?,
            Packet::RedirectActivation(args) => serde_json::to_vec(args)?,
            Packet::ElevationStatusRequest | Packet::EndSession | Packet::Exit => Vec::new(),
        })
    }

    /// Build a packet from a validated header and its payload bytes.
    pub(crate) fn from_parts(header: &PacketHeader, payload: &[u8]) -> Result<Self, ProtocolError> {
        let kind = payload_kind(header.packet_type, header.command)?;

        if header.content_type != kind.content_type() {
            return Err(ProtocolError::ProtocolViolation(format!(
                "{:?}/{:?} expects content type {:?}, got {:?}",
                header.packet_type,
                header.command,
                kind.content_type(),
                header.content_type
            )));
        }

        match kind {
            PayloadKind::Empty => {
                if !payload.is_empty() {
                    return Err(ProtocolError::ProtocolViolation(format!(
                        "{:?}/{:?} carries no payload, got {} bytes",
                        header.packet_type,
                        header.command,
                        payload.len()
                    )));
                }
                Ok(match (header.packet_type, header.command) {
                    (PacketType::Request, PacketCommand::RequestElevationStatus) => {
                        Packet::ElevationStatusRequest
                    }
                    (PacketType::SessionTermination, PacketCommand::Exit) => Packet::Exit,
                    _ => Packet::EndSession,
                })
            }
            PayloadKind::ElevationStatus => Ok(Packet::ElevationStatusResponse(
                parse_json(payload, "ElevationStatusResponse")?,
            )),
            PayloadKind::Activation => Ok(Packet::RedirectActivation(parse_json(
                payload,
                "HutaoActivationArguments",
            )?)),
        }
    }
}

fn parse_json<T: serde::de::DeserializeOwned>(
    payload: &[u8],
    what: &str,
) -> Result<T, ProtocolError> {
    if payload.is_empty() {
        return Err(ProtocolError::ProtocolViolation(format!(
            "missing {what} payload"
        )));
    }
    serde_json::from_slice(payload)
        .map_err(|e| ProtocolError::ProtocolViolation(format!("malformed {what}: {e}")))
}
