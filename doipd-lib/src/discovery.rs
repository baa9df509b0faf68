//! UDP discovery: the vehicle identification / entity status responder
//! and the periodic vehicle announcement task.
//!
//! One socket bound to the DoIP port serves both directions. It joins
//! the link-local multicast group and has SO_BROADCAST set so the
//! announcer can reuse it, which also gives announcements the
//! IANA-assigned source port.

use crate::constants::{
    ANNOUNCE_BROADCAST, ANNOUNCE_WAIT_MAX, LINK_LOCAL_MULTICAST, MAX_DOIP_PAYLOAD,
};
use crate::error::DoipError;
use crate::identity::EntityIdentity;
use crate::parser::{ParserEvent, parse_datagram};
use crate::payload::{DoipPayload, HeaderNackCode};
use crate::server::{ServerConfig, SharedState};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{debug, info, trace, warn};

/// Bind the discovery socket: broadcast-capable and joined to 224.0.0.1.
pub async fn bind_discovery_socket(port: u16) -> Result<UdpSocket, DoipError> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)).await?;
    socket.set_broadcast(true)?;
    if let Err(e) = socket.join_multicast_v4(LINK_LOCAL_MULTICAST, Ipv4Addr::UNSPECIFIED) {
        // Discovery still works over unicast and broadcast without the
        // multicast membership.
        warn!("could not join {LINK_LOCAL_MULTICAST}: {e}");
    }
    Ok(socket)
}

/// The address this host routes external traffic from, used to drop our
/// own announcements when they loop back in via broadcast.
fn detect_host_ip() -> Option<IpAddr> {
    let socket = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect((Ipv4Addr::new(10, 255, 255, 255), 1)).ok()?;
    socket.local_addr().ok().map(|addr| addr.ip())
}

/// Stateless handler for discovery datagrams.
pub struct DiscoveryResponder {
    identity: Arc<EntityIdentity>,
    state: Arc<SharedState>,
}

impl DiscoveryResponder {
    pub fn new(identity: Arc<EntityIdentity>, state: Arc<SharedState>) -> Self {
        DiscoveryResponder { identity, state }
    }

    /// Compute the reply for one inbound payload. `None` means silent
    /// drop (mismatching EID/VIN selectors must not reveal the entity).
    pub fn respond(&self, payload: &DoipPayload) -> Option<DoipPayload> {
        match payload {
            DoipPayload::VehicleIdentificationRequest => {
                Some(self.identity.identification_response())
            }
            DoipPayload::VehicleIdentificationRequestWithEid { eid } => {
                (*eid == self.identity.eid).then(|| self.identity.identification_response())
            }
            DoipPayload::VehicleIdentificationRequestWithVin { vin } => {
                (*vin == self.identity.vin).then(|| self.identity.identification_response())
            }
            DoipPayload::EntityStatusRequest => Some(DoipPayload::EntityStatusResponse {
                node_type: 0x01,
                max_open_sockets: self.state.max_sockets,
                open_sockets: self.state.open_socket_count().min(255) as u8,
                max_data_size: Some(MAX_DOIP_PAYLOAD),
            }),
            DoipPayload::PowerModeInfoRequest => Some(DoipPayload::PowerModeInfoResponse {
                // Always ready: this entity has no power management.
                power_mode: 0x01,
            }),
            other => {
                debug!("unhandled discovery payload {}", other.payload_type());
                Some(DoipPayload::GenericNack {
                    code: HeaderNackCode::UnknownPayloadType,
                })
            }
        }
    }
}

/// Receive loop of the discovery socket.
pub async fn run_discovery(socket: Arc<UdpSocket>, responder: DiscoveryResponder) {
    let host_ip = detect_host_ip();
    if let Some(ip) = host_ip {
        info!("discovery ignoring datagrams from host address {ip}");
    }
    let mut buf = [0u8; 2048];
    loop {
        let (n, peer) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                warn!("discovery receive failed: {e}");
                continue;
            }
        };
        if host_ip == Some(peer.ip()) {
            continue;
        }
        trace!("UDP RX from {peer} [{n} bytes]: {:02x?}", &buf[..n]);

        let (version, reply) = match parse_datagram(&buf[..n]) {
            Some(ParserEvent::Message(msg)) => {
                (msg.protocol_version, responder.respond(&msg.payload))
            }
            Some(ParserEvent::BadInverseByte { version, inverse }) => {
                // Unreliable transport: a corrupt header is dropped, not
                // answered.
                debug!(
                    "dropping datagram from {peer} with bad inverse 0x{inverse:02X} for version 0x{version:02X}"
                );
                continue;
            }
            Some(ParserEvent::Oversized { .. }) => (
                0x02,
                Some(DoipPayload::GenericNack {
                    code: HeaderNackCode::MessageTooLarge,
                }),
            ),
            Some(ParserEvent::Malformed { .. }) => (
                0x02,
                Some(DoipPayload::GenericNack {
                    code: HeaderNackCode::InvalidPayloadLength,
                }),
            ),
            None => (
                0x02,
                Some(DoipPayload::GenericNack {
                    code: HeaderNackCode::IncorrectPatternFormat,
                }),
            ),
        };
        if let Some(reply) = reply {
            let frame = reply.to_frame(version);
            trace!("UDP TX to {peer} [{} bytes]: {:02x?}", frame.len(), frame.as_ref());
            if let Err(e) = socket.send_to(&frame, peer).await {
                warn!("discovery reply to {peer} failed: {e}");
            }
        }
    }
}

/// Periodic vehicle announcement task: three jittered announcements at
/// startup, then one per interval.
pub async fn run_announcer(
    socket: Arc<UdpSocket>,
    identity: Arc<EntityIdentity>,
    config: Arc<ServerConfig>,
) {
    let frame = identity
        .identification_response()
        .to_frame(config.protocol_version);
    let targets = [
        SocketAddr::from((ANNOUNCE_BROADCAST, config.port)),
        SocketAddr::from((LINK_LOCAL_MULTICAST, config.port)),
    ];

    for _ in 0..config.announce_count {
        tokio::time::sleep(ANNOUNCE_WAIT_MAX.mul_f64(rand::random::<f64>())).await;
        announce(&socket, &frame, &targets).await;
    }
    loop {
        tokio::time::sleep(config.announce_interval).await;
        announce(&socket, &frame, &targets).await;
    }
}

async fn announce(socket: &UdpSocket, frame: &[u8], targets: &[SocketAddr]) {
    for &target in targets {
        if let Err(e) = socket.send_to(frame, target).await {
            debug!("vehicle announcement to {target} failed: {e}");
        }
    }
}
