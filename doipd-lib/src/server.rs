//! The DoIP entity server: TCP accept loop, UDP discovery and the
//! periodic vehicle announcement task, all driven by one tokio runtime.

use crate::connection::{Connection, run_connection};
use crate::constants::{
    ALIVE_CHECK_TIMEOUT, ANNOUNCE_COUNT, ANNOUNCE_INTERVAL, DOIP_PORT, INACTIVITY_TIMEOUT,
    INITIAL_ACTIVATION_TIMEOUT, MAX_CONCURRENT_SOCKETS,
};
use crate::discovery::{DiscoveryResponder, bind_discovery_socket, run_announcer, run_discovery};
use crate::error::DoipError;
use crate::header::ProtocolVersion;
use crate::identity::EntityIdentity;
use crate::uds::UdsDispatcher;
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// Tunables of the entity server. Defaults are the ISO timing values.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub max_sockets: u8,
    pub announce_interval: Duration,
    pub announce_count: u8,
    pub activation_timeout: Duration,
    pub inactivity_timeout: Duration,
    pub alive_check_timeout: Duration,
    /// Version used for unsolicited frames (announcements, alive checks).
    pub protocol_version: u8,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            port: DOIP_PORT,
            max_sockets: MAX_CONCURRENT_SOCKETS,
            announce_interval: ANNOUNCE_INTERVAL,
            announce_count: ANNOUNCE_COUNT,
            activation_timeout: INITIAL_ACTIVATION_TIMEOUT,
            inactivity_timeout: INACTIVITY_TIMEOUT,
            alive_check_timeout: ALIVE_CHECK_TIMEOUT,
            protocol_version: 0x02,
        }
    }
}

/// State shared between the TCP sessions and the discovery responder:
/// the set of registered source addresses and the live socket count.
/// The mutex is held only for the duration of a lookup/insert/remove.
#[derive(Debug)]
pub struct SharedState {
    source_addresses: Mutex<HashSet<u16>>,
    open_sockets: AtomicUsize,
    pub max_sockets: u8,
}

impl SharedState {
    pub fn new(max_sockets: u8) -> Self {
        SharedState {
            source_addresses: Mutex::new(HashSet::new()),
            open_sockets: AtomicUsize::new(0),
            max_sockets,
        }
    }

    /// Claim a tester source address. `false` when another live
    /// connection already registered it.
    pub fn try_register_source(&self, source_address: u16) -> bool {
        self.source_addresses
            .lock()
            .expect("registry poisoned")
            .insert(source_address)
    }

    pub fn release_source(&self, source_address: u16) {
        self.source_addresses
            .lock()
            .expect("registry poisoned")
            .remove(&source_address);
    }

    pub fn socket_opened(&self) {
        self.open_sockets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn socket_closed(&self) {
        self.open_sockets.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn open_socket_count(&self) -> usize {
        self.open_sockets.load(Ordering::Relaxed)
    }
}

/// The DoIP entity server.
pub struct DoipServer {
    identity: Arc<EntityIdentity>,
    config: Arc<ServerConfig>,
    dispatcher: Arc<UdsDispatcher>,
    state: Arc<SharedState>,
}

impl DoipServer {
    pub fn new(identity: EntityIdentity, config: ServerConfig) -> Self {
        let state = Arc::new(SharedState::new(config.max_sockets));
        DoipServer {
            identity: Arc::new(identity),
            config: Arc::new(config),
            dispatcher: Arc::new(UdsDispatcher::new()),
            state,
        }
    }

    /// Replace the default UDS dispatcher (custom policy, key algorithm
    /// or transfer sink).
    pub fn with_dispatcher(mut self, dispatcher: UdsDispatcher) -> Self {
        self.dispatcher = Arc::new(dispatcher);
        self
    }

    /// Bind both sockets and serve until the task is cancelled. Bind
    /// failures are fatal and surfaced to the caller.
    pub async fn run(self) -> Result<(), DoipError> {
        info!(
            "starting DoIP entity, announcing as {}",
            ProtocolVersion::from(self.config.protocol_version)
        );
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, self.config.port)).await?;
        info!("listening on TCP port {}", self.config.port);

        let udp = Arc::new(bind_discovery_socket(self.config.port).await?);
        info!("listening on UDP port {}", self.config.port);

        tokio::spawn(run_announcer(
            Arc::clone(&udp),
            Arc::clone(&self.identity),
            Arc::clone(&self.config),
        ));
        let responder = DiscoveryResponder::new(Arc::clone(&self.identity), Arc::clone(&self.state));
        tokio::spawn(run_discovery(udp, responder));

        loop {
            let (stream, peer) = listener.accept().await?;
            if self.state.open_socket_count() >= usize::from(self.config.max_sockets) {
                warn!("socket limit reached, rejecting {peer}");
                drop(stream);
                continue;
            }
            self.state.socket_opened();
            let conn = Connection::new(
                Arc::clone(&self.identity),
                Arc::clone(&self.dispatcher),
                Arc::clone(&self.state),
            );
            let config = Arc::clone(&self.config);
            let state = Arc::clone(&self.state);
            tokio::spawn(async move {
                run_connection(stream, conn, config).await;
                state.socket_closed();
            });
        }
    }
}
