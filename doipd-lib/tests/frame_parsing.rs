//! Tests for header framing and the incremental stream parser

mod common;

use common::*;
use doipd_lib::header::DoipHeader;

fn sample_frames() -> Vec<DoipPayload> {
    vec![
        DoipPayload::VehicleIdentificationRequest,
        DoipPayload::RoutingActivationRequest {
            source_address: TESTER_SA,
            activation_type: 0x00,
            reserved_iso: [0; 4],
            reserved_oem: None,
        },
        DoipPayload::DiagnosticMessage {
            source_address: TESTER_SA,
            target_address: 0xE400,
            user_data: Bytes::from_static(&[0x10, 0x03]),
        },
        DoipPayload::AliveCheckResponse {
            source_address: TESTER_SA,
        },
    ]
}

#[test]
fn header_roundtrip_over_versions_and_body_lengths() {
    for version in [0x02u8, 0x03] {
        for body_len in [0usize, 1, 7, 255, 4096] {
            let body = vec![0x5A; body_len];
            let frame = doipd_lib::encode_frame(version, PayloadType::DiagnosticMessage, &body);
            let header = DoipHeader::parse(frame[..8].try_into().unwrap()).unwrap();
            assert_eq!(header.protocol_version, version);
            assert_eq!(header.payload_type, 0x8001);
            assert_eq!(header.payload_length as usize, body_len);
            assert_eq!(&frame[8..], body.as_slice());
        }
    }
}

#[test]
fn vehicle_identification_request_wire_bytes() {
    // The discovery frame every tester opens with.
    let frame = DoipPayload::VehicleIdentificationRequest.to_frame(0x02);
    assert_eq!(frame.as_ref(), hex_to_bytes("02fd000100000000").as_ref());
}

#[test]
fn any_fragmentation_yields_the_same_messages() {
    let payloads = sample_frames();
    let mut stream = Vec::new();
    for payload in &payloads {
        stream.extend_from_slice(&payload.to_frame(0x02));
    }

    for chunk_size in [1usize, 2, 3, 5, 8, 13, stream.len()] {
        let mut parser = StreamParser::new();
        let mut decoded = Vec::new();
        for chunk in stream.chunks(chunk_size) {
            parser.feed(chunk);
            while let Some(event) = parser.poll() {
                match event {
                    ParserEvent::Message(msg) => decoded.push(msg.payload),
                    other => panic!("unexpected event at chunk size {chunk_size}: {other:?}"),
                }
            }
        }
        assert_eq!(decoded, payloads, "chunk size {chunk_size}");
    }
}

#[test]
fn one_spurious_byte_costs_at_most_one_frame() {
    let first = DoipPayload::VehicleIdentificationRequest.to_frame(0x02);
    let second = DoipPayload::AliveCheckRequest.to_frame(0x02);

    let mut stream = vec![0xA5];
    stream.extend_from_slice(&first);
    stream.extend_from_slice(&second);

    let mut parser = StreamParser::new();
    parser.feed(&stream);
    let mut messages = Vec::new();
    let mut resyncs = 0;
    while let Some(event) = parser.poll() {
        match event {
            ParserEvent::Message(msg) => messages.push(msg.payload),
            ParserEvent::BadInverseByte { .. } => resyncs += 1,
            other => panic!("unexpected event {other:?}"),
        }
    }
    assert!(resyncs >= 1);
    // Both frames survive: the spurious byte alone cannot consume more
    // than the frame it collided with, and here it collides with none.
    assert_eq!(
        messages,
        vec![
            DoipPayload::VehicleIdentificationRequest,
            DoipPayload::AliveCheckRequest
        ]
    );
}

#[test]
fn corrupted_version_byte_loses_at_most_that_frame() {
    let first = DoipPayload::VehicleIdentificationRequest.to_frame(0x02);
    let second = DoipPayload::AliveCheckRequest.to_frame(0x02);

    // Corrupt the first frame's version byte; its inverse no longer
    // matches, so the parser slides until it locks onto the second frame.
    let mut stream = first.to_vec();
    stream[0] = 0x77;
    stream.extend_from_slice(&second);

    let mut parser = StreamParser::new();
    parser.feed(&stream);
    let mut messages = Vec::new();
    while let Some(event) = parser.poll() {
        if let ParserEvent::Message(msg) = event {
            messages.push(msg.payload);
        }
    }
    assert_eq!(messages, vec![DoipPayload::AliveCheckRequest]);
}

#[test]
fn oversized_payload_is_fatal_not_buffered() {
    let mut parser = StreamParser::new();
    // DiagnosticMessage announcing 1 MiB.
    parser.feed(&hex_to_bytes("02fd800100100000"));
    match parser.poll() {
        Some(ParserEvent::Oversized {
            payload_type,
            payload_length,
        }) => {
            assert_eq!(payload_type, 0x8001);
            assert_eq!(payload_length, 0x0010_0000);
        }
        other => panic!("expected oversized, got {other:?}"),
    }
}

#[test]
fn truncated_known_payload_is_reported_malformed() {
    // RoutingActivationRequest with a 2-byte body.
    let mut parser = StreamParser::new();
    parser.feed(&hex_to_bytes("02fd0005000000020e80"));
    match parser.poll() {
        Some(ParserEvent::Malformed { payload_type, .. }) => assert_eq!(payload_type, 0x0005),
        other => panic!("expected malformed, got {other:?}"),
    }
}

#[test]
fn reserved_payload_type_is_preserved_not_dropped() {
    let frame = doipd_lib::encode_frame(
        0x02,
        PayloadType::from_primitive(0x7FFF),
        &[0xCA, 0xFE],
    );
    let mut parser = StreamParser::new();
    parser.feed(&frame);
    match parser.poll() {
        Some(ParserEvent::Message(msg)) => assert_eq!(
            msg.payload,
            DoipPayload::Reserved {
                payload_type: 0x7FFF,
                raw: Bytes::from_static(&[0xCA, 0xFE]),
            }
        ),
        other => panic!("expected reserved message, got {other:?}"),
    }
}
