//! Common test utilities and shared imports

// Allow unused imports and dead code since this is a shared module
// used across multiple test files - not all items are used in every test file
#[allow(unused_imports)]
pub use bytes::Bytes;
#[allow(unused_imports)]
pub use doipd_lib::connection::{Connection, Phase};
#[allow(unused_imports)]
pub use doipd_lib::identity::EntityIdentity;
#[allow(unused_imports)]
pub use doipd_lib::parser::{DoipMessage, ParserEvent, StreamParser};
#[allow(unused_imports)]
pub use doipd_lib::payload::{
    ActivationCode, DiagnosticNackCode, DoipPayload, HeaderNackCode, PayloadType,
};
#[allow(unused_imports)]
pub use doipd_lib::server::{ServerConfig, SharedState};
#[allow(unused_imports)]
pub use doipd_lib::uds::{UdsDispatcher, UdsSession};
#[allow(unused_imports)]
pub use num_enum::FromPrimitive;

use std::sync::Arc;

/// Decode hex string to bytes for testing
#[allow(dead_code)]
pub fn hex_to_bytes(hex_data: &str) -> Bytes {
    Bytes::from(hex::decode(hex_data).expect("Failed to decode hex"))
}

/// Identity used across the integration tests.
#[allow(dead_code)]
pub fn test_identity() -> EntityIdentity {
    EntityIdentity {
        vin: *b"WAUZZZ8V9KA000001",
        logical_address: 0xE400,
        eid: [0x00, 0x1A, 0x2B, 0x3C, 0x4D, 0x5E],
        gid: [0x00, 0x1A, 0x2B, 0x3C, 0x4D, 0x5F],
        further_action_required: 0x00,
    }
}

/// Tester source address most scenarios use.
#[allow(dead_code)]
pub const TESTER_SA: u16 = 0x0E80;

/// A connection wired to fresh shared state and a default dispatcher.
#[allow(dead_code)]
pub fn test_connection() -> (Connection, Arc<SharedState>) {
    let state = Arc::new(SharedState::new(16));
    let conn = Connection::new(
        Arc::new(test_identity()),
        Arc::new(UdsDispatcher::new()),
        Arc::clone(&state),
    );
    (conn, state)
}

/// A connection sharing `state` (for source-address collision tests).
#[allow(dead_code)]
pub fn test_connection_with_state(state: &Arc<SharedState>) -> Connection {
    Connection::new(
        Arc::new(test_identity()),
        Arc::new(UdsDispatcher::new()),
        Arc::clone(state),
    )
}

/// Feed one payload into the connection as a parsed message.
#[allow(dead_code)]
pub fn deliver(conn: &mut Connection, payload: DoipPayload) -> Vec<DoipPayload> {
    conn.process_event(ParserEvent::Message(DoipMessage {
        protocol_version: 0x02,
        payload,
    }))
}

/// Activate routing for `TESTER_SA` and assert success.
#[allow(dead_code)]
pub fn activate(conn: &mut Connection) {
    let replies = deliver(
        conn,
        DoipPayload::RoutingActivationRequest {
            source_address: TESTER_SA,
            activation_type: 0x00,
            reserved_iso: [0; 4],
            reserved_oem: None,
        },
    );
    match replies.as_slice() {
        [DoipPayload::RoutingActivationResponse { code, .. }] => {
            assert_eq!(*code, ActivationCode::Success)
        }
        other => panic!("activation failed: {other:?}"),
    }
    assert_eq!(conn.phase(), Phase::Activated);
}

/// Send a UDS request over an activated connection; returns the replies
/// (positive ack first, then any UDS response).
#[allow(dead_code)]
pub fn diagnose(conn: &mut Connection, uds_request: &[u8]) -> Vec<DoipPayload> {
    deliver(
        conn,
        DoipPayload::DiagnosticMessage {
            source_address: TESTER_SA,
            target_address: test_identity().logical_address,
            user_data: Bytes::copy_from_slice(uds_request),
        },
    )
}

/// Extract the UDS bytes of a diagnostic message reply.
#[allow(dead_code)]
pub fn uds_bytes(reply: &DoipPayload) -> &[u8] {
    match reply {
        DoipPayload::DiagnosticMessage { user_data, .. } => user_data.as_ref(),
        other => panic!("expected a diagnostic message, got {other:?}"),
    }
}
