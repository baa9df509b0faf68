//! Generic DoIP header codec (ISO 13400-2, Table 16).
//!
//! Every frame on the wire, UDP or TCP, starts with the same 8 bytes:
//! protocol version, its bitwise complement, a 16-bit payload type and a
//! 32-bit payload length counting only the body.

use crate::constants::DOIP_HEADER_SIZE;
use crate::error::DoipError;
use crate::payload::PayloadType;
use bytes::{Bytes, BytesMut};
use num_enum::{FromPrimitive, IntoPrimitive};
use strum_macros::Display;
use zerocopy::byteorder::big_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// DoIP protocol versions the entity understands. Requests carrying other
/// versions (with a valid inverse byte) are still parsed; replies echo
/// whatever version the request used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoPrimitive, FromPrimitive)]
#[repr(u8)]
pub enum ProtocolVersion {
    #[strum(to_string = "ISO 13400-2:2012")]
    Iso13400_2012 = 0x02,
    #[strum(to_string = "ISO 13400-2:2019")]
    Iso13400_2019 = 0x03,
    #[num_enum(catch_all)]
    Other(u8),
}

/// Wire layout of the generic header.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct HeaderRaw {
    protocol_version: u8,
    inverse_protocol_version: u8,
    payload_type: U16,
    payload_length: U32,
}

/// A decoded generic header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DoipHeader {
    pub protocol_version: u8,
    pub payload_type: u16,
    pub payload_length: u32,
}

impl DoipHeader {
    /// Decode the 8 header bytes, validating the inverse-version byte.
    ///
    /// On mismatch the error carries both offending bytes so the caller can
    /// decide how to resynchronize (UDP drops the datagram, the TCP stream
    /// parser slides forward one byte).
    pub fn parse(bytes: &[u8; DOIP_HEADER_SIZE]) -> Result<Self, DoipError> {
        let raw = HeaderRaw::ref_from_bytes(bytes.as_slice())
            .map_err(|_| DoipError::TruncatedPayload {
                expected: DOIP_HEADER_SIZE,
                actual: bytes.len(),
            })?;
        if raw.inverse_protocol_version != 0xFF ^ raw.protocol_version {
            return Err(DoipError::InverseVersionMismatch {
                version: raw.protocol_version,
                inverse: raw.inverse_protocol_version,
            });
        }
        Ok(DoipHeader {
            protocol_version: raw.protocol_version,
            payload_type: raw.payload_type.get(),
            payload_length: raw.payload_length.get(),
        })
    }
}

/// Serialize a complete frame: 8-byte header followed by `body`.
pub fn encode_frame(protocol_version: u8, payload_type: PayloadType, body: &[u8]) -> Bytes {
    let raw = HeaderRaw {
        protocol_version,
        inverse_protocol_version: 0xFF ^ protocol_version,
        payload_type: U16::new(payload_type.into()),
        payload_length: U32::new(body.len() as u32),
    };
    let mut frame = BytesMut::with_capacity(DOIP_HEADER_SIZE + body.len());
    frame.extend_from_slice(raw.as_bytes());
    frame.extend_from_slice(body);
    frame.freeze()
}
