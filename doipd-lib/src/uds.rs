//! Server-side UDS (ISO 14229-1) service handling.
//!
//! The dispatcher parses the service byte of an incoming diagnostic
//! request, applies the session/security policy, and routes to the
//! matching handler. Every handler is synchronous and answers well
//! inside P2_server_max, so no response-pending placeholder is ever
//! emitted.

use crate::constants::{
    MAX_BLOCK_LENGTH, P2_SERVER_MAX_MS, P2_STAR_SERVER_MAX_MS, SECURITY_ACCESS_ATTEMPTS,
    SECURITY_ACCESS_LOCKOUT,
};
use crate::transfer::{
    BlockOutcome, DownloadContext, DownloadRequestError, MemorySink, SinkFactory, TransferExitPolicy,
    parse_download_request,
};
use num_enum::{FromPrimitive, IntoPrimitive, TryFromPrimitive};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use strum_macros::Display;
use tracing::debug;

/// UDS service identifiers the entity exposes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoPrimitive, FromPrimitive)]
#[repr(u8)]
pub enum ServiceId {
    DiagnosticSessionControl = 0x10,
    EcuReset = 0x11,
    SecurityAccess = 0x27,
    RoutineControl = 0x31,
    RequestDownload = 0x34,
    TransferData = 0x36,
    RequestTransferExit = 0x37,
    TesterPresent = 0x3E,
    #[num_enum(catch_all)]
    Unsupported(u8),
}

/// Service byte of every negative response.
pub const NEGATIVE_RESPONSE_SID: u8 = 0x7F;

/// Bit 7 of the subfunction byte: suppress the positive response.
const SUPPRESS_POSITIVE_RESPONSE: u8 = 0x80;

/// UDS negative response codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoPrimitive)]
#[repr(u8)]
pub enum Nrc {
    ServiceNotSupported = 0x11,
    SubFunctionNotSupported = 0x12,
    IncorrectMessageLength = 0x13,
    ConditionsNotCorrect = 0x22,
    RequestSequenceError = 0x24,
    RequestOutOfRange = 0x31,
    SecurityAccessDenied = 0x33,
    InvalidKey = 0x35,
    ExceededNumberOfAttempts = 0x36,
    RequiredTimeDelayNotExpired = 0x37,
    TransferDataSuspended = 0x71,
    GeneralProgrammingFailure = 0x72,
    WrongBlockSequenceCounter = 0x73,
    ResponsePending = 0x78,
    SubFunctionNotSupportedInActiveSession = 0x7E,
    ServiceNotSupportedInActiveSession = 0x7F,
}

/// Diagnostic session types of DiagnosticSessionControl.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum SessionType {
    #[default]
    Default = 0x01,
    Programming = 0x02,
    Extended = 0x03,
}

/// Pluggable key derivation for SecurityAccess. The shipped default
/// echoes the seed; a real algorithm is deliberately out of scope.
pub trait KeyAlgorithm: Send + Sync {
    fn compute_key(&self, level: u8, seed: &[u8]) -> Vec<u8>;
}

/// Placeholder key function: key == seed.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityKey;

impl KeyAlgorithm for IdentityKey {
    fn compute_key(&self, _level: u8, seed: &[u8]) -> Vec<u8> {
        seed.to_vec()
    }
}

/// Which sessions and security levels each service demands. The default
/// is permissive (every service in every session, no security), matching
/// the simulator the stack was built against; gates are enforced when
/// configured.
#[derive(Debug, Clone, Default)]
pub struct ServicePolicy {
    session_gates: HashMap<u8, Vec<SessionType>>,
    security_gates: HashSet<u8>,
}

impl ServicePolicy {
    pub fn permissive() -> Self {
        Self::default()
    }

    /// Restrict `service` to the given sessions.
    pub fn require_session(mut self, service: ServiceId, sessions: &[SessionType]) -> Self {
        self.session_gates.insert(service.into(), sessions.to_vec());
        self
    }

    /// Require an unlocked security level for `service`.
    pub fn require_security(mut self, service: ServiceId) -> Self {
        self.security_gates.insert(service.into());
        self
    }

    fn session_permits(&self, service: u8, session: SessionType) -> bool {
        self.session_gates
            .get(&service)
            .is_none_or(|allowed| allowed.contains(&session))
    }

    fn security_permits(&self, service: u8, unlocked: bool) -> bool {
        unlocked || !self.security_gates.contains(&service)
    }
}

/// SecurityAccess progress on one session.
#[derive(Debug)]
pub struct SecurityAccess {
    unlocked_level: Option<u8>,
    pending_seed: Option<(u8, [u8; 4])>,
    attempts_remaining: u8,
    locked_until: Option<Instant>,
}

impl Default for SecurityAccess {
    fn default() -> Self {
        SecurityAccess {
            unlocked_level: None,
            pending_seed: None,
            attempts_remaining: SECURITY_ACCESS_ATTEMPTS,
            locked_until: None,
        }
    }
}

impl SecurityAccess {
    pub fn unlocked_level(&self) -> Option<u8> {
        self.unlocked_level
    }
}

/// Per-connection UDS state, owned by the TCP session engine.
#[derive(Debug, Default)]
pub struct UdsSession {
    pub session_type: SessionType,
    pub security: SecurityAccess,
    pub download: Option<DownloadContext>,
}

impl UdsSession {
    pub fn new() -> Self {
        Self::default()
    }
}

fn positive(service: u8, data: &[u8]) -> Vec<u8> {
    let mut response = Vec::with_capacity(1 + data.len());
    response.push(service | 0x40);
    response.extend_from_slice(data);
    response
}

fn negative(service: u8, nrc: Nrc) -> Vec<u8> {
    vec![NEGATIVE_RESPONSE_SID, service, nrc.into()]
}

/// Split a subfunction byte into (subfunction, suppress-positive-response).
fn subfunction_of(request: &[u8]) -> Option<(u8, bool)> {
    request.get(1).map(|byte| {
        (
            byte & !SUPPRESS_POSITIVE_RESPONSE,
            byte & SUPPRESS_POSITIVE_RESPONSE != 0,
        )
    })
}

/// The UDS request dispatcher. Shared by every TCP session; all mutable
/// state lives in the per-session [`UdsSession`].
pub struct UdsDispatcher {
    policy: ServicePolicy,
    key_algorithm: Arc<dyn KeyAlgorithm>,
    sink_factory: SinkFactory,
    max_block_length: u16,
    exit_policy: TransferExitPolicy,
}

impl Default for UdsDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl UdsDispatcher {
    pub fn new() -> Self {
        UdsDispatcher {
            policy: ServicePolicy::permissive(),
            key_algorithm: Arc::new(IdentityKey),
            sink_factory: Arc::new(|_, _| Box::new(MemorySink::new())),
            max_block_length: MAX_BLOCK_LENGTH,
            exit_policy: TransferExitPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: ServicePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_key_algorithm(mut self, key_algorithm: Arc<dyn KeyAlgorithm>) -> Self {
        self.key_algorithm = key_algorithm;
        self
    }

    pub fn with_sink_factory(mut self, sink_factory: SinkFactory) -> Self {
        self.sink_factory = sink_factory;
        self
    }

    pub fn with_max_block_length(mut self, max_block_length: u16) -> Self {
        self.max_block_length = max_block_length;
        self
    }

    pub fn with_exit_policy(mut self, exit_policy: TransferExitPolicy) -> Self {
        self.exit_policy = exit_policy;
        self
    }

    /// Handle one UDS request. `None` means the positive response was
    /// suppressed; negative responses are never suppressed.
    pub fn handle(&self, session: &mut UdsSession, request: &[u8]) -> Option<Vec<u8>> {
        let Some(&sid) = request.first() else {
            return Some(negative(0x00, Nrc::IncorrectMessageLength));
        };
        let service = ServiceId::from_primitive(sid);
        debug!("UDS request {service} ({} bytes)", request.len());

        if let ServiceId::Unsupported(_) = service {
            return Some(negative(sid, Nrc::ServiceNotSupported));
        }
        if !self.policy.session_permits(sid, session.session_type) {
            return Some(negative(sid, Nrc::ServiceNotSupportedInActiveSession));
        }
        if !self
            .policy
            .security_permits(sid, session.security.unlocked_level.is_some())
        {
            return Some(negative(sid, Nrc::SecurityAccessDenied));
        }

        match service {
            ServiceId::DiagnosticSessionControl => self.session_control(session, sid, request),
            ServiceId::EcuReset => self.ecu_reset(sid, request),
            ServiceId::SecurityAccess => self.security_access(session, sid, request),
            ServiceId::RoutineControl => self.routine_control(sid, request),
            ServiceId::RequestDownload => self.request_download(session, sid, request),
            ServiceId::TransferData => self.transfer_data(session, sid, request),
            ServiceId::RequestTransferExit => self.transfer_exit(session, sid, request),
            ServiceId::TesterPresent => self.tester_present(sid, request),
            ServiceId::Unsupported(_) => unreachable!("handled above"),
        }
    }

    fn session_control(&self, session: &mut UdsSession, sid: u8, request: &[u8]) -> Option<Vec<u8>> {
        let Some((sub, suppress)) = subfunction_of(request) else {
            return Some(negative(sid, Nrc::IncorrectMessageLength));
        };
        let Ok(session_type) = SessionType::try_from_primitive(sub) else {
            return Some(negative(sid, Nrc::SubFunctionNotSupported));
        };
        session.session_type = session_type;
        debug!("session changed to {session_type}");
        let p2_star_10ms = P2_STAR_SERVER_MAX_MS / 10;
        let mut data = vec![sub];
        data.extend_from_slice(&P2_SERVER_MAX_MS.to_be_bytes());
        data.extend_from_slice(&p2_star_10ms.to_be_bytes());
        (!suppress).then(|| positive(sid, &data))
    }

    fn ecu_reset(&self, sid: u8, request: &[u8]) -> Option<Vec<u8>> {
        let Some((sub, suppress)) = subfunction_of(request) else {
            return Some(negative(sid, Nrc::IncorrectMessageLength));
        };
        if !(0x01..=0x03).contains(&sub) {
            return Some(negative(sid, Nrc::SubFunctionNotSupported));
        }
        (!suppress).then(|| positive(sid, &[sub]))
    }

    fn tester_present(&self, sid: u8, request: &[u8]) -> Option<Vec<u8>> {
        let Some((sub, suppress)) = subfunction_of(request) else {
            return Some(negative(sid, Nrc::IncorrectMessageLength));
        };
        if sub != 0x00 {
            return Some(negative(sid, Nrc::SubFunctionNotSupported));
        }
        (!suppress).then(|| positive(sid, &[0x00]))
    }

    fn security_access(&self, session: &mut UdsSession, sid: u8, request: &[u8]) -> Option<Vec<u8>> {
        let Some((sub, suppress)) = subfunction_of(request) else {
            return Some(negative(sid, Nrc::IncorrectMessageLength));
        };
        if sub == 0x00 {
            return Some(negative(sid, Nrc::SubFunctionNotSupported));
        }
        let security = &mut session.security;
        if let Some(until) = security.locked_until {
            if Instant::now() < until {
                return Some(negative(sid, Nrc::RequiredTimeDelayNotExpired));
            }
            security.locked_until = None;
        }

        if sub % 2 == 1 {
            // Request seed; level n is the pair (2n-1, 2n).
            let level = sub.div_ceil(2);
            if security.unlocked_level == Some(level) {
                // Already unlocked: an all-zero seed signals no challenge
                // is needed.
                return (!suppress).then(|| positive(sid, &[sub, 0, 0, 0, 0]));
            }
            let seed: [u8; 4] = rand::random();
            security.pending_seed = Some((level, seed));
            let mut data = vec![sub];
            data.extend_from_slice(&seed);
            (!suppress).then(|| positive(sid, &data))
        } else {
            let level = sub / 2;
            let Some((pending_level, seed)) = security.pending_seed else {
                return Some(negative(sid, Nrc::RequestSequenceError));
            };
            if pending_level != level {
                return Some(negative(sid, Nrc::RequestSequenceError));
            }
            let key = &request[2..];
            if key == self.key_algorithm.compute_key(level, &seed) {
                security.unlocked_level = Some(level);
                security.pending_seed = None;
                security.attempts_remaining = SECURITY_ACCESS_ATTEMPTS;
                debug!("security level {level} unlocked");
                return (!suppress).then(|| positive(sid, &[sub]));
            }
            security.attempts_remaining -= 1;
            if security.attempts_remaining == 0 {
                security.pending_seed = None;
                security.attempts_remaining = SECURITY_ACCESS_ATTEMPTS;
                security.locked_until = Some(Instant::now() + SECURITY_ACCESS_LOCKOUT);
                return Some(negative(sid, Nrc::ExceededNumberOfAttempts));
            }
            Some(negative(sid, Nrc::InvalidKey))
        }
    }

    fn routine_control(&self, sid: u8, request: &[u8]) -> Option<Vec<u8>> {
        let Some((sub, suppress)) = subfunction_of(request) else {
            return Some(negative(sid, Nrc::IncorrectMessageLength));
        };
        if !(0x01..=0x03).contains(&sub) {
            return Some(negative(sid, Nrc::SubFunctionNotSupported));
        }
        if request.len() < 4 {
            return Some(negative(sid, Nrc::IncorrectMessageLength));
        }
        let routine_id = [request[2], request[3]];
        debug!(
            "routine control sub 0x{sub:02X} for routine 0x{:02X}{:02X}",
            routine_id[0], routine_id[1]
        );
        // routineStatusRecord: one byte, routine completed without error
        let data = [sub, routine_id[0], routine_id[1], 0x00];
        (!suppress).then(|| positive(sid, &data))
    }

    fn request_download(&self, session: &mut UdsSession, sid: u8, request: &[u8]) -> Option<Vec<u8>> {
        if session.download.is_some() {
            return Some(negative(sid, Nrc::RequestSequenceError));
        }
        let download = match parse_download_request(&request[1..]) {
            Ok(download) => download,
            Err(DownloadRequestError::Truncated) => {
                return Some(negative(sid, Nrc::IncorrectMessageLength));
            }
            Err(DownloadRequestError::BadFieldLength { .. }) => {
                return Some(negative(sid, Nrc::RequestOutOfRange));
            }
        };
        debug!(
            "download accepted: address 0x{:X}, {} bytes",
            download.address, download.size
        );
        let sink = (self.sink_factory)(download.address, download.size);
        session.download = Some(DownloadContext::new(download, sink));
        // lengthFormatIdentifier 0x20: maxNumberOfBlockLength in 2 bytes
        let mut data = vec![0x20];
        data.extend_from_slice(&self.max_block_length.to_be_bytes());
        Some(positive(sid, &data))
    }

    fn transfer_data(&self, session: &mut UdsSession, sid: u8, request: &[u8]) -> Option<Vec<u8>> {
        if request.len() < 2 {
            return Some(negative(sid, Nrc::IncorrectMessageLength));
        }
        let counter = request[1];
        let block = &request[2..];
        let Some(context) = session.download.as_mut() else {
            return Some(negative(sid, Nrc::RequestSequenceError));
        };
        if block.len() > usize::from(self.max_block_length).saturating_sub(1) {
            return Some(negative(sid, Nrc::TransferDataSuspended));
        }
        match context.submit_block(counter, block) {
            BlockOutcome::Accepted | BlockOutcome::Retransmitted => Some(positive(sid, &[counter])),
            BlockOutcome::WrongCounter { expected } => {
                debug!("wrong block counter 0x{counter:02X}, expected 0x{expected:02X}");
                Some(negative(sid, Nrc::WrongBlockSequenceCounter))
            }
        }
    }

    fn transfer_exit(&self, session: &mut UdsSession, sid: u8, _request: &[u8]) -> Option<Vec<u8>> {
        let Some(context) = session.download.as_ref() else {
            return Some(negative(sid, Nrc::RequestSequenceError));
        };
        if self.exit_policy == TransferExitPolicy::Strict && context.remaining > 0 {
            return Some(negative(sid, Nrc::RequestSequenceError));
        }
        session.download = None;
        Some(positive(sid, &[]))
    }
}
