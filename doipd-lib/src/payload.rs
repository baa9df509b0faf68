//! Typed DoIP payloads and their byte-exact codecs (ISO 13400-2 §7).
//!
//! Each payload type maps to one variant of [`DoipPayload`]. Unknown types
//! in the reserved ranges round-trip as [`DoipPayload::Reserved`] with the
//! body preserved so they can be logged instead of silently dropped.

use crate::error::DoipError;
use crate::header::encode_frame;
use bytes::{BufMut, Bytes, BytesMut};
use num_enum::{FromPrimitive, IntoPrimitive};
use strum_macros::Display;

/// The 16-bit payload type of the generic DoIP header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoPrimitive, FromPrimitive)]
#[repr(u16)]
pub enum PayloadType {
    GenericNegativeAcknowledge = 0x0000,
    VehicleIdentificationRequest = 0x0001,
    VehicleIdentificationRequestWithEid = 0x0002,
    VehicleIdentificationRequestWithVin = 0x0003,
    VehicleIdentificationResponse = 0x0004,
    RoutingActivationRequest = 0x0005,
    RoutingActivationResponse = 0x0006,
    AliveCheckRequest = 0x0007,
    AliveCheckResponse = 0x0008,
    EntityStatusRequest = 0x4001,
    EntityStatusResponse = 0x4002,
    PowerModeInfoRequest = 0x4003,
    PowerModeInfoResponse = 0x4004,
    DiagnosticMessage = 0x8001,
    DiagnosticMessagePositiveAck = 0x8002,
    DiagnosticMessageNegativeAck = 0x8003,
    #[num_enum(catch_all)]
    Reserved(u16),
}

/// Negative acknowledge codes of the generic DoIP header (payload type
/// 0x0000).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoPrimitive, FromPrimitive)]
#[repr(u8)]
pub enum HeaderNackCode {
    IncorrectPatternFormat = 0x00,
    UnknownPayloadType = 0x01,
    MessageTooLarge = 0x02,
    OutOfMemory = 0x03,
    InvalidPayloadLength = 0x04,
    #[num_enum(catch_all)]
    Reserved(u8),
}

/// Response codes of the routing activation response (ISO 13400-2
/// Table 49).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoPrimitive, FromPrimitive)]
#[repr(u8)]
pub enum ActivationCode {
    UnknownSourceAddress = 0x00,
    NoSocketAvailable = 0x01,
    SourceAddressMismatch = 0x02,
    SourceAddressInUse = 0x03,
    RegisteredElsewhere = 0x04,
    AuthenticationMissing = 0x05,
    ConfirmationRejected = 0x06,
    UnsupportedActivationType = 0x07,
    Success = 0x10,
    SuccessPendingConfirmation = 0x11,
    #[num_enum(catch_all)]
    Reserved(u8),
}

/// Negative acknowledge codes of a diagnostic message (payload type
/// 0x8003).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoPrimitive, FromPrimitive)]
#[repr(u8)]
pub enum DiagnosticNackCode {
    InvalidSourceAddress = 0x02,
    UnknownTargetAddress = 0x03,
    DiagnosticMessageTooLarge = 0x04,
    OutOfMemory = 0x05,
    TargetUnreachable = 0x06,
    UnknownNetwork = 0x07,
    TransportProtocolError = 0x08,
    #[num_enum(catch_all)]
    Reserved(u8),
}

/// Ack code of a diagnostic message positive acknowledgement; 0x00 is the
/// only value ISO defines.
pub const DIAGNOSTIC_ACK: u8 = 0x00;

/// Body of a vehicle identification response / vehicle announcement.
///
/// The two are the same payload type (0x0004); announcements are simply
/// unsolicited. 32-byte bodies (without the sync status byte) are accepted
/// on input; output is always the 33-byte form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VehicleIdentification {
    pub vin: [u8; 17],
    pub logical_address: u16,
    pub eid: [u8; 6],
    pub gid: [u8; 6],
    pub further_action_required: u8,
    pub vin_gid_sync_status: Option<u8>,
}

/// A typed DoIP payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DoipPayload {
    GenericNack {
        code: HeaderNackCode,
    },
    VehicleIdentificationRequest,
    VehicleIdentificationRequestWithEid {
        eid: [u8; 6],
    },
    VehicleIdentificationRequestWithVin {
        vin: [u8; 17],
    },
    VehicleIdentificationResponse(VehicleIdentification),
    RoutingActivationRequest {
        source_address: u16,
        activation_type: u8,
        reserved_iso: [u8; 4],
        reserved_oem: Option<[u8; 4]>,
    },
    RoutingActivationResponse {
        client_address: u16,
        logical_address: u16,
        code: ActivationCode,
        reserved_iso: [u8; 4],
        reserved_oem: Option<[u8; 4]>,
    },
    AliveCheckRequest,
    AliveCheckResponse {
        source_address: u16,
    },
    EntityStatusRequest,
    EntityStatusResponse {
        node_type: u8,
        max_open_sockets: u8,
        open_sockets: u8,
        max_data_size: Option<u32>,
    },
    PowerModeInfoRequest,
    PowerModeInfoResponse {
        power_mode: u8,
    },
    DiagnosticMessage {
        source_address: u16,
        target_address: u16,
        user_data: Bytes,
    },
    DiagnosticAck {
        source_address: u16,
        target_address: u16,
        ack_code: u8,
        previous: Bytes,
    },
    DiagnosticNack {
        source_address: u16,
        target_address: u16,
        nack_code: DiagnosticNackCode,
        previous: Bytes,
    },
    /// Payload type in a reserved range; body preserved for logging.
    Reserved {
        payload_type: u16,
        raw: Bytes,
    },
}

fn need(payload_type: PayloadType, body: &Bytes, expected: usize) -> Result<(), DoipError> {
    if body.len() < expected {
        return Err(DoipError::MalformedPayload {
            payload_type: payload_type.into(),
            reason: format!("expected at least {expected} bytes, got {}", body.len()),
        });
    }
    Ok(())
}

fn u16_be(body: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([body[offset], body[offset + 1]])
}

impl DoipPayload {
    /// The payload type this variant serializes as.
    pub fn payload_type(&self) -> PayloadType {
        match self {
            DoipPayload::GenericNack { .. } => PayloadType::GenericNegativeAcknowledge,
            DoipPayload::VehicleIdentificationRequest => PayloadType::VehicleIdentificationRequest,
            DoipPayload::VehicleIdentificationRequestWithEid { .. } => {
                PayloadType::VehicleIdentificationRequestWithEid
            }
            DoipPayload::VehicleIdentificationRequestWithVin { .. } => {
                PayloadType::VehicleIdentificationRequestWithVin
            }
            DoipPayload::VehicleIdentificationResponse(_) => PayloadType::VehicleIdentificationResponse,
            DoipPayload::RoutingActivationRequest { .. } => PayloadType::RoutingActivationRequest,
            DoipPayload::RoutingActivationResponse { .. } => PayloadType::RoutingActivationResponse,
            DoipPayload::AliveCheckRequest => PayloadType::AliveCheckRequest,
            DoipPayload::AliveCheckResponse { .. } => PayloadType::AliveCheckResponse,
            DoipPayload::EntityStatusRequest => PayloadType::EntityStatusRequest,
            DoipPayload::EntityStatusResponse { .. } => PayloadType::EntityStatusResponse,
            DoipPayload::PowerModeInfoRequest => PayloadType::PowerModeInfoRequest,
            DoipPayload::PowerModeInfoResponse { .. } => PayloadType::PowerModeInfoResponse,
            DoipPayload::DiagnosticMessage { .. } => PayloadType::DiagnosticMessage,
            DoipPayload::DiagnosticAck { .. } => PayloadType::DiagnosticMessagePositiveAck,
            DoipPayload::DiagnosticNack { .. } => PayloadType::DiagnosticMessageNegativeAck,
            DoipPayload::Reserved { payload_type, .. } => PayloadType::from_primitive(*payload_type),
        }
    }

    /// Serialize the payload body (without the generic header).
    pub fn pack(&self) -> Bytes {
        let mut body = BytesMut::new();
        match self {
            DoipPayload::GenericNack { code } => body.put_u8((*code).into()),
            DoipPayload::VehicleIdentificationRequest
            | DoipPayload::AliveCheckRequest
            | DoipPayload::EntityStatusRequest
            | DoipPayload::PowerModeInfoRequest => {}
            DoipPayload::VehicleIdentificationRequestWithEid { eid } => {
                body.put_slice(eid);
            }
            DoipPayload::VehicleIdentificationRequestWithVin { vin } => {
                body.put_slice(vin);
            }
            DoipPayload::VehicleIdentificationResponse(ident) => {
                body.put_slice(&ident.vin);
                body.put_u16(ident.logical_address);
                body.put_slice(&ident.eid);
                body.put_slice(&ident.gid);
                body.put_u8(ident.further_action_required);
                body.put_u8(ident.vin_gid_sync_status.unwrap_or(0x00));
            }
            DoipPayload::RoutingActivationRequest {
                source_address,
                activation_type,
                reserved_iso,
                reserved_oem,
            } => {
                body.put_u16(*source_address);
                body.put_u8(*activation_type);
                body.put_slice(reserved_iso);
                if let Some(oem) = reserved_oem {
                    body.put_slice(oem);
                }
            }
            DoipPayload::RoutingActivationResponse {
                client_address,
                logical_address,
                code,
                reserved_iso,
                reserved_oem,
            } => {
                body.put_u16(*client_address);
                body.put_u16(*logical_address);
                body.put_u8((*code).into());
                body.put_slice(reserved_iso);
                if let Some(oem) = reserved_oem {
                    body.put_slice(oem);
                }
            }
            DoipPayload::AliveCheckResponse { source_address } => {
                body.put_u16(*source_address);
            }
            DoipPayload::EntityStatusResponse {
                node_type,
                max_open_sockets,
                open_sockets,
                max_data_size,
            } => {
                body.put_u8(*node_type);
                body.put_u8(*max_open_sockets);
                body.put_u8(*open_sockets);
                if let Some(size) = max_data_size {
                    body.put_u32(*size);
                }
            }
            DoipPayload::PowerModeInfoResponse { power_mode } => body.put_u8(*power_mode),
            DoipPayload::DiagnosticMessage {
                source_address,
                target_address,
                user_data,
            } => {
                body.put_u16(*source_address);
                body.put_u16(*target_address);
                body.put_slice(user_data);
            }
            DoipPayload::DiagnosticAck {
                source_address,
                target_address,
                ack_code,
                previous,
            } => {
                body.put_u16(*source_address);
                body.put_u16(*target_address);
                body.put_u8(*ack_code);
                body.put_slice(previous);
            }
            DoipPayload::DiagnosticNack {
                source_address,
                target_address,
                nack_code,
                previous,
            } => {
                body.put_u16(*source_address);
                body.put_u16(*target_address);
                body.put_u8((*nack_code).into());
                body.put_slice(previous);
            }
            DoipPayload::Reserved { raw, .. } => body.put_slice(raw),
        }
        body.freeze()
    }

    /// Deserialize a payload body for `payload_type`. The declared length is
    /// `body.len()`; the stream parser has already matched it against the
    /// header.
    pub fn unpack(payload_type: PayloadType, body: Bytes) -> Result<Self, DoipError> {
        match payload_type {
            PayloadType::GenericNegativeAcknowledge => {
                need(payload_type, &body, 1)?;
                Ok(DoipPayload::GenericNack {
                    code: HeaderNackCode::from_primitive(body[0]),
                })
            }
            PayloadType::VehicleIdentificationRequest => Ok(DoipPayload::VehicleIdentificationRequest),
            PayloadType::VehicleIdentificationRequestWithEid => {
                need(payload_type, &body, 6)?;
                let mut eid = [0u8; 6];
                eid.copy_from_slice(&body[..6]);
                Ok(DoipPayload::VehicleIdentificationRequestWithEid { eid })
            }
            PayloadType::VehicleIdentificationRequestWithVin => {
                need(payload_type, &body, 17)?;
                let mut vin = [0u8; 17];
                vin.copy_from_slice(&body[..17]);
                Ok(DoipPayload::VehicleIdentificationRequestWithVin { vin })
            }
            PayloadType::VehicleIdentificationResponse => {
                need(payload_type, &body, 32)?;
                let mut vin = [0u8; 17];
                vin.copy_from_slice(&body[..17]);
                let mut eid = [0u8; 6];
                eid.copy_from_slice(&body[19..25]);
                let mut gid = [0u8; 6];
                gid.copy_from_slice(&body[25..31]);
                Ok(DoipPayload::VehicleIdentificationResponse(VehicleIdentification {
                    vin,
                    logical_address: u16_be(&body, 17),
                    eid,
                    gid,
                    further_action_required: body[31],
                    vin_gid_sync_status: body.get(32).copied(),
                }))
            }
            PayloadType::RoutingActivationRequest => {
                need(payload_type, &body, 7)?;
                let mut reserved_iso = [0u8; 4];
                reserved_iso.copy_from_slice(&body[3..7]);
                let reserved_oem = if body.len() >= 11 {
                    let mut oem = [0u8; 4];
                    oem.copy_from_slice(&body[7..11]);
                    Some(oem)
                } else {
                    None
                };
                Ok(DoipPayload::RoutingActivationRequest {
                    source_address: u16_be(&body, 0),
                    activation_type: body[2],
                    reserved_iso,
                    reserved_oem,
                })
            }
            PayloadType::RoutingActivationResponse => {
                need(payload_type, &body, 9)?;
                let mut reserved_iso = [0u8; 4];
                reserved_iso.copy_from_slice(&body[5..9]);
                let reserved_oem = if body.len() >= 13 {
                    let mut oem = [0u8; 4];
                    oem.copy_from_slice(&body[9..13]);
                    Some(oem)
                } else {
                    None
                };
                Ok(DoipPayload::RoutingActivationResponse {
                    client_address: u16_be(&body, 0),
                    logical_address: u16_be(&body, 2),
                    code: ActivationCode::from_primitive(body[4]),
                    reserved_iso,
                    reserved_oem,
                })
            }
            PayloadType::AliveCheckRequest => Ok(DoipPayload::AliveCheckRequest),
            PayloadType::AliveCheckResponse => {
                need(payload_type, &body, 2)?;
                Ok(DoipPayload::AliveCheckResponse {
                    source_address: u16_be(&body, 0),
                })
            }
            PayloadType::EntityStatusRequest => Ok(DoipPayload::EntityStatusRequest),
            PayloadType::EntityStatusResponse => {
                need(payload_type, &body, 3)?;
                let max_data_size = if body.len() >= 7 {
                    Some(u32::from_be_bytes([body[3], body[4], body[5], body[6]]))
                } else {
                    None
                };
                Ok(DoipPayload::EntityStatusResponse {
                    node_type: body[0],
                    max_open_sockets: body[1],
                    open_sockets: body[2],
                    max_data_size,
                })
            }
            PayloadType::PowerModeInfoRequest => Ok(DoipPayload::PowerModeInfoRequest),
            PayloadType::PowerModeInfoResponse => {
                need(payload_type, &body, 1)?;
                Ok(DoipPayload::PowerModeInfoResponse { power_mode: body[0] })
            }
            PayloadType::DiagnosticMessage => {
                need(payload_type, &body, 4)?;
                Ok(DoipPayload::DiagnosticMessage {
                    source_address: u16_be(&body, 0),
                    target_address: u16_be(&body, 2),
                    user_data: body.slice(4..),
                })
            }
            PayloadType::DiagnosticMessagePositiveAck => {
                need(payload_type, &body, 5)?;
                Ok(DoipPayload::DiagnosticAck {
                    source_address: u16_be(&body, 0),
                    target_address: u16_be(&body, 2),
                    ack_code: body[4],
                    previous: body.slice(5..),
                })
            }
            PayloadType::DiagnosticMessageNegativeAck => {
                need(payload_type, &body, 5)?;
                Ok(DoipPayload::DiagnosticNack {
                    source_address: u16_be(&body, 0),
                    target_address: u16_be(&body, 2),
                    nack_code: DiagnosticNackCode::from_primitive(body[4]),
                    previous: body.slice(5..),
                })
            }
            PayloadType::Reserved(value) => Ok(DoipPayload::Reserved {
                payload_type: value,
                raw: body,
            }),
        }
    }

    /// Serialize the payload as a complete frame with the generic header.
    pub fn to_frame(&self, protocol_version: u8) -> Bytes {
        encode_frame(protocol_version, self.payload_type(), &self.pack())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ident() -> VehicleIdentification {
        VehicleIdentification {
            vin: *b"WAUZZZ8V9KA000001",
            logical_address: 0xE400,
            eid: [0x00, 0x1A, 0x2B, 0x3C, 0x4D, 0x5E],
            gid: [0x00, 0x1A, 0x2B, 0x3C, 0x4D, 0x5F],
            further_action_required: 0x00,
            vin_gid_sync_status: None,
        }
    }

    #[test]
    fn identification_response_emits_33_bytes() {
        let packed = DoipPayload::VehicleIdentificationResponse(ident()).pack();
        assert_eq!(packed.len(), 33);
        assert_eq!(&packed[..17], b"WAUZZZ8V9KA000001");
        assert_eq!(&packed[17..19], &[0xE4, 0x00]);
        assert_eq!(packed[32], 0x00);
    }

    #[test]
    fn identification_response_accepts_32_byte_form() {
        let mut packed = DoipPayload::VehicleIdentificationResponse(ident()).pack().to_vec();
        packed.truncate(32);
        let unpacked =
            DoipPayload::unpack(PayloadType::VehicleIdentificationResponse, Bytes::from(packed)).unwrap();
        match unpacked {
            DoipPayload::VehicleIdentificationResponse(v) => {
                assert_eq!(v.logical_address, 0xE400);
                assert_eq!(v.vin_gid_sync_status, None);
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn routing_activation_request_accepts_short_and_oem_forms() {
        let short = Bytes::from_static(&[0x0E, 0x80, 0x00, 0, 0, 0, 0]);
        match DoipPayload::unpack(PayloadType::RoutingActivationRequest, short).unwrap() {
            DoipPayload::RoutingActivationRequest {
                source_address,
                activation_type,
                reserved_oem,
                ..
            } => {
                assert_eq!(source_address, 0x0E80);
                assert_eq!(activation_type, 0x00);
                assert_eq!(reserved_oem, None);
            }
            other => panic!("unexpected payload {other:?}"),
        }

        let with_oem = Bytes::from_static(&[0x0E, 0x80, 0xE0, 0, 0, 0, 0, 1, 2, 3, 4]);
        match DoipPayload::unpack(PayloadType::RoutingActivationRequest, with_oem).unwrap() {
            DoipPayload::RoutingActivationRequest { reserved_oem, .. } => {
                assert_eq!(reserved_oem, Some([1, 2, 3, 4]));
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn reserved_payload_preserves_body() {
        let raw = Bytes::from_static(&[0xDE, 0xAD, 0xBE, 0xEF]);
        let payload = DoipPayload::unpack(PayloadType::from_primitive(0x7777), raw.clone()).unwrap();
        assert_eq!(
            payload,
            DoipPayload::Reserved {
                payload_type: 0x7777,
                raw,
            }
        );
        assert_eq!(payload.pack(), Bytes::from_static(&[0xDE, 0xAD, 0xBE, 0xEF]));
    }

    #[test]
    fn diagnostic_message_roundtrip() {
        let payload = DoipPayload::DiagnosticMessage {
            source_address: 0x0E80,
            target_address: 0xE400,
            user_data: Bytes::from_static(&[0x22, 0xF1, 0x90]),
        };
        let unpacked = DoipPayload::unpack(PayloadType::DiagnosticMessage, payload.pack()).unwrap();
        assert_eq!(unpacked, payload);
    }
}
