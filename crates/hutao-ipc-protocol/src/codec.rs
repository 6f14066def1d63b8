//! Packet codec for local duplex streams.
//!
//! Wire format: 8-byte header + payload.
//!
//! ```text
//! +---------+------+---------+--------------+----------------------+---------+
//! | version | type | command | content type | payload length (BE)  | payload |
//! |   u8    |  u8  |   u8    |      u8      |         u32          |  bytes  |
//! +---------+------+---------+--------------+----------------------+---------+
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::packet::{
    payload_kind, ContentType, Packet, PacketCommand, PacketHeader, PacketType,
};
use crate::{ProtocolError, HEADER_SIZE, MAX_PACKET_PAYLOAD};

/// Codec for framing [`Packet`] values over a byte stream.
///
/// Carries the protocol version it writes and expects; any header with a
/// different version is rejected before its payload is looked at.
#[derive(Debug, Clone, Copy)]
pub struct PacketCodec {
    version: u8,
}

impl PacketCodec {
    pub fn new(version: u8) -> Self {
        Self { version }
    }

    pub fn version(&self) -> u8 {
        self.version
    }
}

/// Parse the header prefix of `src`.
///
/// Returns `Ok(None)` while fewer than [`HEADER_SIZE`] bytes are available.
/// The version byte is checked as soon as it arrives.
fn parse_header(expected_version: u8, src: &[u8]) -> Result<Option<PacketHeader>, ProtocolError> {
    let Some(&version) = src.first() else {
        return Ok(None);
    };
    if version != expected_version {
        return Err(ProtocolError::VersionMismatch {
            expected: expected_version,
            got: version,
        });
    }

    if src.len() < HEADER_SIZE {
        return Ok(None);
    }

    let unsupported = ProtocolError::UnsupportedOperation {
        packet_type: src[1],
        command: src[2],
    };
    let Some(packet_type) = PacketType::from_u8(src[1]) else {
        return Err(unsupported);
    };
    let Some(command) = PacketCommand::from_u8(src[2]) else {
        return Err(unsupported);
    };
    let Some(content_type) = ContentType::from_u8(src[3]) else {
        return Err(unsupported);
    };

    let payload_length = u32::from_be_bytes([src[4], src[5], src[6], src[7]]);
    if payload_length as usize > MAX_PACKET_PAYLOAD {
        return Err(ProtocolError::PayloadTooLarge {
            size: payload_length as usize,
            max: MAX_PACKET_PAYLOAD,
        });
    }

    // Reject unknown pairs before waiting for (or reading) a payload
    payload_kind(packet_type, command)?;

    Ok(Some(PacketHeader {
        version,
        packet_type,
        command,
        content_type,
        payload_length,
    }))
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(header) = parse_header(self.version, &src[..])? else {
            return Ok(None);
        };

        // Check if we have the full packet
        let length = header.payload_length as usize;
        let total = HEADER_SIZE + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(HEADER_SIZE);
        let payload = src.split_to(length);

        Packet::from_parts(&header, &payload).map(Some)
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(packet) = self.decode(buf)? {
            return Ok(Some(packet));
        }
        if buf.is_empty() {
            return Ok(None);
        }
        Err(truncation_error(self.version, &buf[..]))
    }
}

/// Error for a buffer that ended in the middle of a packet.
fn truncation_error(version: u8, buf: &[u8]) -> ProtocolError {
    match parse_header(version, buf) {
        Ok(Some(header)) => ProtocolError::TruncatedPayload {
            declared: header.payload_length as usize,
            available: buf.len() - HEADER_SIZE,
        },
        Ok(None) => ProtocolError::ProtocolViolation(format!(
            "truncated header: {} of {HEADER_SIZE} bytes",
            buf.len()
        )),
        Err(e) => e,
    }
}

impl Encoder<&Packet> for PacketCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: &Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let content_type = payload_kind(item.packet_type(), item.command())?.content_type();
        let payload = item.payload_bytes()?;

        if payload.len() > MAX_PACKET_PAYLOAD {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PACKET_PAYLOAD,
            });
        }

        dst.reserve(HEADER_SIZE + payload.len());
        dst.put_u8(self.version);
        dst.put_u8(item.packet_type() as u8);
        dst.put_u8(item.command() as u8);
        dst.put_u8(content_type as u8);
        dst.put_u32(payload.len() as u32);
        dst.extend_from_slice(&payload);

        Ok(())
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        Encoder::<&Packet>::encode(self, &item, dst)
    }
}

/// Encode one packet into a standalone buffer.
pub fn encode_packet(version: u8, packet: &Packet) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    PacketCodec::new(version).encode(packet, &mut buf)?;
    Ok(buf.freeze())
}

/// Decode exactly one packet from a complete buffer.
pub fn decode_packet(
    expected_version: u8,
    bytes: &[u8],
) -> Result<(PacketHeader, Packet), ProtocolError> {
    let header = parse_header(expected_version, bytes)?.ok_or_else(|| {
        ProtocolError::ProtocolViolation(format!(
            "truncated header: {} of {HEADER_SIZE} bytes",
            bytes.len()
        ))
    })?;

    let declared = header.payload_length as usize;
    let available = bytes.len() - HEADER_SIZE;
    if available < declared {
        return Err(ProtocolError::TruncatedPayload {
            declared,
            available,
        });
    }
    if available > declared {
        return Err(ProtocolError::ProtocolViolation(format!(
            "{} trailing bytes after payload",
            available - declared
        )));
    }

    let packet = Packet::from_parts(&header, &bytes[HEADER_SIZE..])?;
    Ok((header, packet))
}
