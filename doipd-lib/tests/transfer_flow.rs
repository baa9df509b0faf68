//! Tests for the RequestDownload / TransferData / RequestTransferExit flow

mod common;

use common::*;
use doipd_lib::transfer::{MemorySink, TransferExitPolicy, TransferSink};
use doipd_lib::uds::{UdsDispatcher, UdsSession};
use std::sync::{Arc, Mutex};

/// Dispatcher whose transfer sink is observable from the test.
fn dispatcher_with_sink() -> (UdsDispatcher, Arc<Mutex<Vec<u8>>>) {
    let sink = MemorySink::new();
    let handle = sink.handle();
    let dispatcher = UdsDispatcher::new().with_sink_factory(Arc::new(
        move |_address, _size| -> Box<dyn TransferSink> { Box::new(sink.clone()) },
    ));
    (dispatcher, handle)
}

const DOWNLOAD_10_BYTES: [u8; 11] = [0x34, 0x00, 0x44, 0x00, 0x00, 0x12, 0x34, 0x00, 0x00, 0x00, 0x0A];

#[test]
fn ten_bytes_in_two_blocks() {
    let (dispatcher, sink) = dispatcher_with_sink();
    let mut session = UdsSession::new();

    assert_eq!(
        dispatcher.handle(&mut session, &DOWNLOAD_10_BYTES).unwrap(),
        vec![0x74, 0x20, 0x10, 0x00]
    );

    assert_eq!(
        dispatcher
            .handle(&mut session, &[0x36, 0x01, 0x11, 0x22, 0x33, 0x44, 0x55])
            .unwrap(),
        vec![0x76, 0x01]
    );
    assert_eq!(
        dispatcher
            .handle(&mut session, &[0x36, 0x02, 0x66, 0x77, 0x88, 0x99, 0xAA])
            .unwrap(),
        vec![0x76, 0x02]
    );

    assert_eq!(dispatcher.handle(&mut session, &[0x37]).unwrap(), vec![0x77]);
    assert!(session.download.is_none());

    let received = sink.lock().unwrap();
    assert_eq!(
        received.as_slice(),
        &[0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xAA]
    );
}

#[test]
fn wrong_counter_keeps_the_download_resumable() {
    let (dispatcher, _sink) = dispatcher_with_sink();
    let mut session = UdsSession::new();
    dispatcher.handle(&mut session, &DOWNLOAD_10_BYTES).unwrap();
    dispatcher
        .handle(&mut session, &[0x36, 0x01, 0x11, 0x22, 0x33, 0x44, 0x55])
        .unwrap();

    // Skipping ahead to block 3 is rejected and changes nothing.
    assert_eq!(
        dispatcher
            .handle(&mut session, &[0x36, 0x03, 0x66, 0x77, 0x88, 0x99, 0xAA])
            .unwrap(),
        vec![0x7F, 0x36, 0x73]
    );
    assert!(session.download.is_some());

    // The expected block still goes through.
    assert_eq!(
        dispatcher
            .handle(&mut session, &[0x36, 0x02, 0x66, 0x77, 0x88, 0x99, 0xAA])
            .unwrap(),
        vec![0x76, 0x02]
    );
}

#[test]
fn retransmitted_block_is_idempotent() {
    let (dispatcher, sink) = dispatcher_with_sink();
    let mut session = UdsSession::new();
    dispatcher.handle(&mut session, &DOWNLOAD_10_BYTES).unwrap();

    let block = [0x36, 0x01, 0x11, 0x22, 0x33, 0x44, 0x55];
    assert_eq!(dispatcher.handle(&mut session, &block).unwrap(), vec![0x76, 0x01]);
    assert_eq!(dispatcher.handle(&mut session, &block).unwrap(), vec![0x76, 0x01]);

    let context = session.download.as_ref().unwrap();
    assert_eq!(context.remaining, 5);
    assert_eq!(sink.lock().unwrap().len(), 5);
}

#[test]
fn at_most_one_download_per_session() {
    let (dispatcher, _sink) = dispatcher_with_sink();
    let mut session = UdsSession::new();
    dispatcher.handle(&mut session, &DOWNLOAD_10_BYTES).unwrap();
    assert_eq!(
        dispatcher.handle(&mut session, &DOWNLOAD_10_BYTES).unwrap(),
        vec![0x7F, 0x34, 0x24]
    );
}

#[test]
fn transfer_services_require_an_active_download() {
    let dispatcher = UdsDispatcher::new();
    let mut session = UdsSession::new();
    assert_eq!(
        dispatcher.handle(&mut session, &[0x36, 0x01, 0xAA]).unwrap(),
        vec![0x7F, 0x36, 0x24]
    );
    assert_eq!(
        dispatcher.handle(&mut session, &[0x37]).unwrap(),
        vec![0x7F, 0x37, 0x24]
    );
}

#[test]
fn oversized_block_is_suspended() {
    let dispatcher = UdsDispatcher::new().with_max_block_length(8);
    let mut session = UdsSession::new();
    dispatcher.handle(&mut session, &DOWNLOAD_10_BYTES).unwrap();

    // 8 data bytes exceed maxNumberOfBlockLength - 1 = 7.
    let mut request = vec![0x36, 0x01];
    request.extend_from_slice(&[0u8; 8]);
    assert_eq!(
        dispatcher.handle(&mut session, &request).unwrap(),
        vec![0x7F, 0x36, 0x71]
    );
}

#[test]
fn strict_exit_policy_demands_the_full_budget() {
    let dispatcher = UdsDispatcher::new().with_exit_policy(TransferExitPolicy::Strict);
    let mut session = UdsSession::new();
    dispatcher.handle(&mut session, &DOWNLOAD_10_BYTES).unwrap();
    dispatcher
        .handle(&mut session, &[0x36, 0x01, 0x11, 0x22, 0x33, 0x44, 0x55])
        .unwrap();

    assert_eq!(
        dispatcher.handle(&mut session, &[0x37]).unwrap(),
        vec![0x7F, 0x37, 0x24]
    );
    assert!(session.download.is_some());

    dispatcher
        .handle(&mut session, &[0x36, 0x02, 0x66, 0x77, 0x88, 0x99, 0xAA])
        .unwrap();
    assert_eq!(dispatcher.handle(&mut session, &[0x37]).unwrap(), vec![0x77]);
}

#[test]
fn malformed_download_requests_are_rejected() {
    let dispatcher = UdsDispatcher::new();
    let mut session = UdsSession::new();

    // Too short for the announced field widths.
    assert_eq!(
        dispatcher.handle(&mut session, &[0x34, 0x00, 0x44, 0x00]).unwrap(),
        vec![0x7F, 0x34, 0x13]
    );
    // Zero-byte address field.
    assert_eq!(
        dispatcher
            .handle(&mut session, &[0x34, 0x00, 0x40, 0x00, 0x00, 0x00, 0x00])
            .unwrap(),
        vec![0x7F, 0x34, 0x31]
    );
    assert!(session.download.is_none());
}
