//! Wire protocol framing
//!
//! Every packet on the stream is
//!
//! ```text
//! ┌──────────┬──────────────────┬─────────────────────┐
//! │ type (1) │ length (4, u32)  │ payload (length)    │
//! └──────────┴──────────────────┴─────────────────────┘
//! ```
//!
//! All multi-byte integers on the wire are little-endian, including the
//! 8-byte probe timestamps. Decoding works against an accumulating receive
//! buffer: it never consumes bytes until a whole frame is present.

use bytes::Bytes;
use crate::error::ProtocolError;

/// Size of the type tag plus length prefix
pub const HEADER_LEN: usize = 5;

/// Size of a probe payload (i64 milliseconds)
pub const PROBE_PAYLOAD_LEN: usize = 8;

/// Packet type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Encoded or raw PCM block
    Audio = b'A',
    /// Latency probe carrying the sender's timestamp
    ProbeRequest = b'P',
    /// Echo of a probe request, payload untouched
    ProbeReply = b'O',
}

impl PacketType {
    pub fn tag(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for PacketType {
    type Error = ProtocolError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            b'A' => Ok(PacketType::Audio),
            b'P' => Ok(PacketType::ProbeRequest),
            b'O' => Ok(PacketType::ProbeReply),
            other => Err(ProtocolError::UnknownPacketType(other)),
        }
    }
}

/// An owned packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub packet_type: PacketType,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(packet_type: PacketType, payload: impl Into<Bytes>) -> Self {
        Self {
            packet_type,
            payload: payload.into(),
        }
    }

    /// Probe request carrying a millisecond timestamp
    pub fn probe_request(timestamp_ms: i64) -> Self {
        Self::new(
            PacketType::ProbeRequest,
            Bytes::copy_from_slice(&timestamp_ms.to_le_bytes()),
        )
    }

    /// Reply echoing a request payload verbatim
    pub fn probe_reply(request_payload: &[u8]) -> Self {
        Self::new(PacketType::ProbeReply, Bytes::copy_from_slice(request_payload))
    }

    /// Frame this packet for the wire
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_frame(self.packet_type, &self.payload)
    }
}

/// A frame borrowed from a receive buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    pub packet_type: PacketType,
    pub payload: &'a [u8],
    /// Bytes to drop from the front of the buffer
    pub consumed: usize,
}

/// Why a frame could not be decoded
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Header or payload incomplete; retry when more bytes arrive
    NeedMoreData,
    /// The header is not a valid frame header
    Malformed(ProtocolError),
}

/// Frame a payload into a new buffer
pub fn encode_frame(packet_type: PacketType, payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    encode_frame_into(packet_type, payload, &mut out)?;
    Ok(out)
}

/// Append a framed payload to `out`
///
/// Does not allocate when `out` already has room, which is what the
/// capture path relies on.
pub fn encode_frame_into(
    packet_type: PacketType,
    payload: &[u8],
    out: &mut Vec<u8>,
) -> Result<(), ProtocolError> {
    let len = u32::try_from(payload.len())
        .map_err(|_| ProtocolError::PayloadTooLarge(payload.len()))?;

    out.push(packet_type.tag());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(payload);
    Ok(())
}

/// Decode the first frame in `buf`
///
/// The declared length is only checked against the bytes present, so an
/// absurd length simply waits for more data. An unknown tag is reported as
/// `Malformed`; callers drop one byte and retry to find the next header.
pub fn decode_frame(buf: &[u8]) -> Result<Frame<'_>, DecodeError> {
    if buf.len() < HEADER_LEN {
        return Err(DecodeError::NeedMoreData);
    }

    // Tag first: a stray byte must not be read as a header with a huge length
    let packet_type = PacketType::try_from(buf[0]).map_err(DecodeError::Malformed)?;

    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&buf[1..HEADER_LEN]);
    let len = u32::from_le_bytes(len_bytes) as u64;

    let available = (buf.len() - HEADER_LEN) as u64;
    if len > available {
        return Err(DecodeError::NeedMoreData);
    }

    let end = HEADER_LEN + len as usize;

    Ok(Frame {
        packet_type,
        payload: &buf[HEADER_LEN..end],
        consumed: end,
    })
}

/// Read the timestamp out of a probe payload
pub fn probe_timestamp(payload: &[u8]) -> Result<i64, ProtocolError> {
    let bytes: [u8; PROBE_PAYLOAD_LEN] = payload
        .try_into()
        .map_err(|_| ProtocolError::MalformedProbe(payload.len()))?;
    Ok(i64::from_le_bytes(bytes))
}
