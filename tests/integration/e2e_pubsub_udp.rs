//! End-to-end UDP publish/subscribe through a full in-process driver.
//!
//! # Coverage
//! - Single-fragment delivery: one message, one frame, positions advance
//!   by the aligned frame length.
//! - Fragmentation: a message larger than the MTU is split into BEGIN /
//!   middle / END fragments and reassembled byte-identically.

use std::time::{Duration, Instant};

use conduit::{Client, FragmentAssembler, OfferOutcome};
use conduit_driver::{DriverConfig, MediaDriver, ThreadingMode};

const DEADLINE: Duration = Duration::from_secs(10);

fn test_config(dir: &std::path::Path) -> DriverConfig {
    DriverConfig {
        dir: dir.to_path_buf(),
        threading_mode: ThreadingMode::Shared,
        term_buffer_length: 64 * 1024,
        ipc_term_buffer_length: 64 * 1024,
        initial_window_length: 16 * 1024,
        timer_interval_ns: 50_000_000,
        ..DriverConfig::default()
    }
}

/// Retry an offer until the stream connects and accepts the message.
fn offer_until_accepted(
    client: &mut Client,
    publication: &mut conduit::Publication,
    msg: &[u8],
) -> i64 {
    let deadline = Instant::now() + DEADLINE;
    loop {
        client.do_work();
        match publication.offer(msg) {
            Ok(position) => return position,
            Err(OfferOutcome::NotConnected)
            | Err(OfferOutcome::BackPressured)
            | Err(OfferOutcome::AdminAction) => {
                assert!(Instant::now() < deadline, "offer never accepted");
                std::thread::sleep(Duration::from_millis(1));
            }
            Err(other) => panic!("offer failed: {other:?}"),
        }
    }
}

#[test]
fn single_fragment_message_is_delivered() {
    let tmp = tempfile::tempdir().unwrap();
    let driver = MediaDriver::launch(test_config(&tmp.path().join("driver"))).unwrap();

    let mut client = Client::connect(driver.dir()).unwrap();
    let mut subscription = client
        .add_subscription("aeron:udp?endpoint=127.0.0.1:24325", 42)
        .unwrap();
    let mut publication = client
        .add_publication("aeron:udp?endpoint=127.0.0.1:24325", 42)
        .unwrap();

    let position = offer_until_accepted(&mut client, &mut publication, b"hello");
    assert_eq!(position % 32, 0, "positions are frame aligned");

    let mut received = Vec::new();
    let deadline = Instant::now() + DEADLINE;
    while received.is_empty() {
        client.do_work();
        subscription.poll(
            &mut |payload: &[u8], header| {
                assert!(header.is_unfragmented());
                received.push(payload.to_vec());
            },
            10,
        );
        assert!(Instant::now() < deadline, "message never arrived");
        std::thread::sleep(Duration::from_millis(1));
    }

    assert_eq!(received, vec![b"hello".to_vec()]);
    // "hello" in one frame: align(32 + 5, 32) = 64 bytes of stream.
    assert_eq!(publication.position(), 64);

    driver.shutdown();
}

#[test]
fn oversize_message_fragments_and_reassembles() {
    let tmp = tempfile::tempdir().unwrap();
    let driver = MediaDriver::launch(test_config(&tmp.path().join("driver"))).unwrap();

    let mut client = Client::connect(driver.dir()).unwrap();
    let mut subscription = client
        .add_subscription("aeron:udp?endpoint=127.0.0.1:24326", 43)
        .unwrap();
    let mut publication = client
        .add_publication("aeron:udp?endpoint=127.0.0.1:24326", 43)
        .unwrap();

    // 4000 bytes over a 1408 MTU: fragments of 1376 + 1376 + 1248 payload.
    let message: Vec<u8> = (0..4000u32).map(|i| (i % 251) as u8).collect();
    offer_until_accepted(&mut client, &mut publication, &message);

    let mut assembler = FragmentAssembler::new();
    let mut complete: Option<Vec<u8>> = None;
    let mut fragment_flags = Vec::new();
    let deadline = Instant::now() + DEADLINE;
    while complete.is_none() {
        client.do_work();
        subscription.poll(
            &mut |payload: &[u8], header| {
                fragment_flags.push((header.is_begin(), header.is_end()));
                if let Some(message) = assembler.on_fragment(payload, header) {
                    complete = Some(message);
                }
            },
            10,
        );
        assert!(Instant::now() < deadline, "fragments never arrived");
        std::thread::sleep(Duration::from_millis(1));
    }

    assert_eq!(complete.unwrap(), message);
    assert_eq!(
        fragment_flags,
        vec![(true, false), (false, false), (false, true)],
        "BEGIN, middle, END"
    );
    // Three aligned frames: 1408 + 1408 + align(1248 + 32, 32).
    assert_eq!(publication.position(), 1408 + 1408 + 1280);

    driver.shutdown();
}
