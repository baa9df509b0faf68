//! Incremental decoder for the DoIP transport layer.
//!
//! TCP reads are not aligned to message boundaries, so the parser keeps a
//! running buffer across reads and walks a five-state machine over it:
//! version, inverse version, payload type, payload length, payload. UDP
//! broadcasts are unreliable on top of that, which is why a bad inverse
//! byte only slides the buffer forward one byte instead of flushing it:
//! desynchronization is bounded to a single lost frame.

use crate::constants::MAX_DOIP_PAYLOAD;
use crate::error::DoipError;
use crate::payload::{DoipPayload, PayloadType};
use bytes::{Buf, BytesMut};
use num_enum::FromPrimitive;

/// A fully decoded frame: the request's protocol version plus its typed
/// payload. Replies echo `protocol_version`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DoipMessage {
    pub protocol_version: u8,
    pub payload: DoipPayload,
}

/// One outcome of [`StreamParser::poll`].
#[derive(Debug)]
pub enum ParserEvent {
    /// A complete, well-formed message.
    Message(DoipMessage),
    /// The inverse-version byte did not match; one byte was discarded and
    /// parsing continues with the next byte as candidate version.
    BadInverseByte { version: u8, inverse: u8 },
    /// The header announced a payload larger than the configured cap. The
    /// caller must negative-acknowledge and, on TCP, close the connection.
    Oversized { payload_type: u16, payload_length: u32 },
    /// The payload type is known but its body failed to decode.
    Malformed { payload_type: u16, error: DoipError },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    ProtocolVersion,
    InverseProtocolVersion,
    PayloadType,
    PayloadLength,
    Payload,
}

/// The per-connection stream parser. One instance lives for the lifetime
/// of a TCP connection; its buffer carries partial frames across reads.
#[derive(Debug)]
pub struct StreamParser {
    buf: BytesMut,
    state: ParseState,
    protocol_version: u8,
    payload_type: u16,
    payload_length: u32,
    max_payload: u32,
}

impl Default for StreamParser {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamParser {
    pub fn new() -> Self {
        Self::with_max_payload(MAX_DOIP_PAYLOAD)
    }

    pub fn with_max_payload(max_payload: u32) -> Self {
        StreamParser {
            buf: BytesMut::new(),
            state: ParseState::ProtocolVersion,
            protocol_version: 0,
            payload_type: 0,
            payload_length: 0,
            max_payload,
        }
    }

    /// Append raw bytes from the transport.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Advance the state machine. Returns `None` when more bytes are
    /// needed; call again after every event until it does.
    pub fn poll(&mut self) -> Option<ParserEvent> {
        loop {
            match self.state {
                ParseState::ProtocolVersion => {
                    if self.buf.is_empty() {
                        return None;
                    }
                    self.protocol_version = self.buf.get_u8();
                    self.state = ParseState::InverseProtocolVersion;
                }
                ParseState::InverseProtocolVersion => {
                    if self.buf.is_empty() {
                        return None;
                    }
                    let inverse = self.buf.get_u8();
                    if inverse != 0xFF ^ self.protocol_version {
                        let event = ParserEvent::BadInverseByte {
                            version: self.protocol_version,
                            inverse,
                        };
                        // Slide forward: the byte just read becomes the next
                        // candidate version.
                        self.protocol_version = inverse;
                        return Some(event);
                    }
                    self.state = ParseState::PayloadType;
                }
                ParseState::PayloadType => {
                    if self.buf.len() < 2 {
                        return None;
                    }
                    self.payload_type = self.buf.get_u16();
                    self.state = ParseState::PayloadLength;
                }
                ParseState::PayloadLength => {
                    if self.buf.len() < 4 {
                        return None;
                    }
                    self.payload_length = self.buf.get_u32();
                    if self.payload_length > self.max_payload {
                        let event = ParserEvent::Oversized {
                            payload_type: self.payload_type,
                            payload_length: self.payload_length,
                        };
                        self.reset();
                        return Some(event);
                    }
                    self.state = ParseState::Payload;
                }
                ParseState::Payload => {
                    let length = self.payload_length as usize;
                    if self.buf.len() < length {
                        return None;
                    }
                    let body = self.buf.split_to(length).freeze();
                    self.state = ParseState::ProtocolVersion;
                    let payload_type = PayloadType::from_primitive(self.payload_type);
                    return Some(match DoipPayload::unpack(payload_type, body) {
                        Ok(payload) => ParserEvent::Message(DoipMessage {
                            protocol_version: self.protocol_version,
                            payload,
                        }),
                        Err(error) => ParserEvent::Malformed {
                            payload_type: self.payload_type,
                            error,
                        },
                    });
                }
            }
        }
    }

    /// Drop all buffered bytes and return to the initial state.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.state = ParseState::ProtocolVersion;
    }
}

/// Decode a single UDP datagram. Discovery traffic is one frame per
/// datagram; trailing bytes after the first frame are ignored.
pub fn parse_datagram(data: &[u8]) -> Option<ParserEvent> {
    let mut parser = StreamParser::new();
    parser.feed(data);
    parser.poll()
}
