//! Per-connection TCP session engine.
//!
//! [`Connection`] is the socket-free state machine: routing-activation
//! gate, diagnostic message exchange and the DoIP-level acknowledgement
//! ordering all live here, which keeps them unit-testable.
//! [`run_connection`] is the tokio task wrapping it: reads, writes and
//! the three connection timers. One task owns one connection; writes on
//! a connection are serialized by that ownership.

use crate::identity::EntityIdentity;
use crate::parser::{DoipMessage, ParserEvent, StreamParser};
use crate::payload::{
    ActivationCode, DIAGNOSTIC_ACK, DiagnosticNackCode, DoipPayload, HeaderNackCode,
};
use crate::server::{ServerConfig, SharedState};
use crate::uds::{NEGATIVE_RESPONSE_SID, Nrc, ServiceId, UdsDispatcher, UdsSession};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

/// Lifecycle phase of a TCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Accepted, no successful routing activation yet.
    Unactivated,
    /// Routing activation succeeded; diagnostic messages are accepted.
    Activated,
    /// The socket is to be closed; no further input is processed.
    Closing,
}

/// State machine for one TCP connection.
pub struct Connection {
    identity: Arc<EntityIdentity>,
    dispatcher: Arc<UdsDispatcher>,
    state: Arc<SharedState>,
    phase: Phase,
    source_address: Option<u16>,
    uds: UdsSession,
    protocol_version: u8,
    alive_check_pending: bool,
}

impl Connection {
    pub fn new(
        identity: Arc<EntityIdentity>,
        dispatcher: Arc<UdsDispatcher>,
        state: Arc<SharedState>,
    ) -> Self {
        Connection {
            identity,
            dispatcher,
            state,
            phase: Phase::Unactivated,
            source_address: None,
            uds: UdsSession::new(),
            protocol_version: 0x02,
            alive_check_pending: false,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Protocol version of the most recent inbound frame; replies echo it.
    pub fn protocol_version(&self) -> u8 {
        self.protocol_version
    }

    pub fn alive_check_pending(&self) -> bool {
        self.alive_check_pending
    }

    /// Called by the socket task after it wrote an AliveCheckRequest.
    pub fn mark_alive_check_sent(&mut self) {
        self.alive_check_pending = true;
    }

    /// Feed one parser event through the state machine. The returned
    /// payloads must be written in order; [`Connection::phase`] is
    /// `Closing` afterwards when the socket must be torn down.
    pub fn process_event(&mut self, event: ParserEvent) -> Vec<DoipPayload> {
        match event {
            ParserEvent::Message(msg) => self.process_message(msg),
            ParserEvent::BadInverseByte { version, inverse } => {
                warn!(
                    "bad DoIP header: inverse 0x{inverse:02X} for version 0x{version:02X}, resyncing"
                );
                Vec::new()
            }
            ParserEvent::Oversized {
                payload_type,
                payload_length,
            } => {
                warn!(
                    "payload type 0x{payload_type:04X} announces {payload_length} bytes, closing"
                );
                self.phase = Phase::Closing;
                vec![DoipPayload::GenericNack {
                    code: HeaderNackCode::MessageTooLarge,
                }]
            }
            ParserEvent::Malformed { payload_type, error } => {
                warn!("malformed payload of type 0x{payload_type:04X}: {error}");
                vec![DoipPayload::GenericNack {
                    code: HeaderNackCode::InvalidPayloadLength,
                }]
            }
        }
    }

    fn process_message(&mut self, msg: DoipMessage) -> Vec<DoipPayload> {
        self.protocol_version = msg.protocol_version;
        match msg.payload {
            DoipPayload::RoutingActivationRequest {
                source_address,
                activation_type,
                ..
            } => self.handle_activation(source_address, activation_type),
            DoipPayload::DiagnosticMessage {
                source_address,
                target_address,
                user_data,
            } => self.handle_diagnostic(source_address, target_address, user_data),
            DoipPayload::AliveCheckRequest => vec![DoipPayload::AliveCheckResponse {
                source_address: self.identity.logical_address,
            }],
            DoipPayload::AliveCheckResponse { source_address } => {
                debug!("alive check answered by 0x{source_address:04X}");
                self.alive_check_pending = false;
                Vec::new()
            }
            DoipPayload::Reserved { payload_type, raw } => {
                debug!(
                    "reserved payload type 0x{payload_type:04X} ({} bytes): {:02x?}",
                    raw.len(),
                    raw.as_ref()
                );
                vec![DoipPayload::GenericNack {
                    code: HeaderNackCode::UnknownPayloadType,
                }]
            }
            DoipPayload::GenericNack { code } => {
                debug!("peer sent generic negative acknowledge {code}");
                Vec::new()
            }
            other => {
                // Discovery traffic and response types have no business on
                // the diagnostic TCP channel.
                debug!("ignoring {} on TCP", other.payload_type());
                Vec::new()
            }
        }
    }

    fn activation_response(&self, client: u16, code: ActivationCode) -> DoipPayload {
        DoipPayload::RoutingActivationResponse {
            client_address: client,
            logical_address: self.identity.logical_address,
            code,
            reserved_iso: [0; 4],
            reserved_oem: None,
        }
    }

    fn handle_activation(&mut self, source_address: u16, activation_type: u8) -> Vec<DoipPayload> {
        if activation_type != 0x00 && activation_type != 0xE0 {
            debug!("unsupported activation type 0x{activation_type:02X}");
            self.phase = Phase::Closing;
            return vec![
                self.activation_response(source_address, ActivationCode::UnsupportedActivationType),
            ];
        }
        match self.source_address {
            // Re-activation with the registered address re-authenticates.
            Some(registered) if registered == source_address => {
                vec![self.activation_response(source_address, ActivationCode::Success)]
            }
            Some(registered) => {
                debug!(
                    "activation for 0x{source_address:04X} on a connection registered to 0x{registered:04X}"
                );
                self.phase = Phase::Closing;
                vec![self.activation_response(source_address, ActivationCode::SourceAddressMismatch)]
            }
            None => {
                if !self.state.try_register_source(source_address) {
                    debug!("source address 0x{source_address:04X} already in use");
                    self.phase = Phase::Closing;
                    return vec![
                        self.activation_response(source_address, ActivationCode::SourceAddressInUse),
                    ];
                }
                info!("routing activated for source address 0x{source_address:04X}");
                self.source_address = Some(source_address);
                self.phase = Phase::Activated;
                vec![self.activation_response(source_address, ActivationCode::Success)]
            }
        }
    }

    fn diagnostic_nack(&self, target: u16, nack_code: DiagnosticNackCode) -> DoipPayload {
        DoipPayload::DiagnosticNack {
            source_address: self.identity.logical_address,
            target_address: target,
            nack_code,
            previous: Bytes::new(),
        }
    }

    fn handle_diagnostic(
        &mut self,
        source_address: u16,
        target_address: u16,
        user_data: Bytes,
    ) -> Vec<DoipPayload> {
        if self.phase != Phase::Activated || self.source_address != Some(source_address) {
            debug!("diagnostic message from unregistered source 0x{source_address:04X}");
            return vec![self.diagnostic_nack(source_address, DiagnosticNackCode::InvalidSourceAddress)];
        }
        if target_address != self.identity.logical_address {
            debug!("diagnostic message for unknown target 0x{target_address:04X}");
            return vec![self.diagnostic_nack(source_address, DiagnosticNackCode::UnknownTargetAddress)];
        }

        // The DoIP-level positive acknowledgement always precedes the UDS
        // response on the wire.
        let mut replies = vec![DoipPayload::DiagnosticAck {
            source_address: self.identity.logical_address,
            target_address: source_address,
            ack_code: DIAGNOSTIC_ACK,
            previous: Bytes::new(),
        }];
        if let Some(response) = self.dispatcher.handle(&mut self.uds, &user_data) {
            if security_access_exhausted(&response) {
                // Exhausted send-key attempts tear the connection down.
                self.phase = Phase::Closing;
            }
            replies.push(DoipPayload::DiagnosticMessage {
                source_address: self.identity.logical_address,
                target_address: source_address,
                user_data: Bytes::from(response),
            });
        }
        replies
    }
}

fn security_access_exhausted(response: &[u8]) -> bool {
    let exhausted: [u8; 3] = [
        NEGATIVE_RESPONSE_SID,
        ServiceId::SecurityAccess.into(),
        Nrc::ExceededNumberOfAttempts.into(),
    ];
    response == exhausted.as_slice()
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(source_address) = self.source_address.take() {
            self.state.release_source(source_address);
        }
    }
}

/// Drive one accepted TCP connection until it closes.
pub async fn run_connection(stream: TcpStream, mut conn: Connection, config: Arc<ServerConfig>) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "<unknown>".into());
    info!("TCP connection from {peer}");

    let (mut reader, mut writer) = stream.into_split();
    let mut parser = StreamParser::new();
    let mut buf = vec![0u8; 4096];
    let accepted_at = Instant::now();
    let mut last_activity = Instant::now();
    let mut alive_sent_at: Option<Instant> = None;

    'connection: loop {
        let deadline = match conn.phase() {
            Phase::Unactivated => accepted_at + config.activation_timeout,
            Phase::Activated => match alive_sent_at {
                Some(sent_at) => sent_at + config.alive_check_timeout,
                None => last_activity + config.inactivity_timeout,
            },
            Phase::Closing => break,
        };
        let window = deadline.saturating_duration_since(Instant::now());

        match timeout(window, reader.read(&mut buf)).await {
            Ok(Ok(0)) => {
                debug!("{peer} closed the connection");
                break;
            }
            Ok(Ok(n)) => {
                trace!("RX [{n} bytes]: {:02x?}", &buf[..n]);
                last_activity = Instant::now();
                parser.feed(&buf[..n]);
                while let Some(event) = parser.poll() {
                    let replies = conn.process_event(event);
                    if !conn.alive_check_pending() {
                        alive_sent_at = None;
                    }
                    for reply in replies {
                        let frame = reply.to_frame(conn.protocol_version());
                        trace!("TX [{} bytes]: {:02x?}", frame.len(), frame.as_ref());
                        if let Err(e) = writer.write_all(&frame).await {
                            warn!("write to {peer} failed: {e}");
                            break 'connection;
                        }
                        last_activity = Instant::now();
                    }
                    if conn.phase() == Phase::Closing {
                        break 'connection;
                    }
                }
            }
            Ok(Err(e)) => {
                warn!("read from {peer} failed: {e}");
                break;
            }
            Err(_) => match conn.phase() {
                Phase::Unactivated => {
                    debug!("{peer} sent no routing activation in time");
                    break;
                }
                Phase::Activated if alive_sent_at.is_none() => {
                    debug!("{peer} inactive, sending alive check");
                    let frame =
                        DoipPayload::AliveCheckRequest.to_frame(conn.protocol_version());
                    if writer.write_all(&frame).await.is_err() {
                        break;
                    }
                    conn.mark_alive_check_sent();
                    alive_sent_at = Some(Instant::now());
                }
                _ => {
                    debug!("{peer} did not answer the alive check");
                    break;
                }
            },
        }
    }
    info!("TCP connection from {peer} closed");
}
