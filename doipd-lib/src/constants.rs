// Protocol constants for ISO 13400-2 / ISO 14229-1

use std::net::Ipv4Addr;
use std::time::Duration;

/// IANA-assigned port for DoIP, both UDP discovery and TCP diagnostics
pub const DOIP_PORT: u16 = 13400;

/// Size of the generic DoIP header (8 bytes)
pub const DOIP_HEADER_SIZE: usize = 8;

/// Largest payload accepted before the connection is torn down with a
/// "message too large" negative acknowledge
pub const MAX_DOIP_PAYLOAD: u32 = 64 * 1024;

/// Link-local multicast group the discovery socket joins
pub const LINK_LOCAL_MULTICAST: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 1);

/// Limited broadcast destination for vehicle announcements
pub const ANNOUNCE_BROADCAST: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 255);

/// Number of vehicle announcements sent at startup (A_DoIP_Announce_Num)
pub const ANNOUNCE_COUNT: u8 = 3;

/// Upper bound of the random delay between startup announcements
/// (A_DoIP_Announce_Wait)
pub const ANNOUNCE_WAIT_MAX: Duration = Duration::from_millis(500);

/// Steady-state interval between vehicle announcements
pub const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(2);

/// Time a freshly accepted TCP connection has to complete routing
/// activation (T_TCP_Initial_Inactivity)
pub const INITIAL_ACTIVATION_TIMEOUT: Duration = Duration::from_secs(2);

/// General inactivity window on an activated connection
/// (T_TCP_General_Inactivity); an alive check is sent on expiry
pub const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(5);

/// Window the peer has to answer an alive check before the connection
/// is closed
pub const ALIVE_CHECK_TIMEOUT: Duration = Duration::from_secs(2);

/// Default cap on concurrently open TCP diagnostic sockets
pub const MAX_CONCURRENT_SOCKETS: u8 = 16;

/// P2_server_max in milliseconds: deadline to begin a UDS response
pub const P2_SERVER_MAX_MS: u16 = 50;

/// P2*_server_max in milliseconds: extended deadline after a
/// response-pending negative response
pub const P2_STAR_SERVER_MAX_MS: u16 = 5000;

/// maxNumberOfBlockLength granted by RequestDownload: block sequence
/// counter byte plus data per TransferData request
pub const MAX_BLOCK_LENGTH: u16 = 4096;

/// SecurityAccess send-key attempts before the delay timer starts
pub const SECURITY_ACCESS_ATTEMPTS: u8 = 3;

/// Lockout enforced once the attempt counter is exhausted
pub const SECURITY_ACCESS_LOCKOUT: Duration = Duration::from_secs(10);

/// Length of the seed returned by a SecurityAccess request-seed
pub const SECURITY_ACCESS_SEED_LEN: usize = 4;
