//! Back-pressure: a stalled subscriber caps the publisher at its position
//! plus the term window, and draining one message frees exactly one
//! message worth of space.

use std::time::{Duration, Instant};

use conduit::{Client, OfferOutcome};
use conduit_driver::{DriverConfig, MediaDriver, ThreadingMode};

const DEADLINE: Duration = Duration::from_secs(10);
const TERM_LENGTH: usize = 64 * 1024;
const STREAM_ID: i32 = 10;

#[test]
fn stalled_subscriber_back_pressures_publisher() {
    let tmp = tempfile::tempdir().unwrap();
    let config = DriverConfig {
        dir: tmp.path().join("driver"),
        threading_mode: ThreadingMode::Shared,
        term_buffer_length: TERM_LENGTH,
        ipc_term_buffer_length: TERM_LENGTH,
        initial_window_length: 16 * 1024,
        timer_interval_ns: 50_000_000,
        ..DriverConfig::default()
    };
    let driver = MediaDriver::launch(config).unwrap();

    let mut client = Client::connect(driver.dir()).unwrap();
    let mut subscription = client.add_subscription("aeron:ipc", STREAM_ID).unwrap();
    let mut publication = client.add_publication("aeron:ipc", STREAM_ID).unwrap();

    // Wait for the image to land so the subscriber position exists.
    let deadline = Instant::now() + DEADLINE;
    while subscription.image_count() == 0 {
        client.do_work();
        assert!(Instant::now() < deadline, "ipc image never arrived");
        std::thread::sleep(Duration::from_millis(1));
    }

    // The subscriber never polls: the publisher may write at most the
    // term window (half the term = 32 KiB) ahead.
    let payload = vec![7u8; 1408];
    let frame_length = 32 + payload.len(); // 1440, already 32-aligned
    let mut accepted = 0usize;
    let deadline = Instant::now() + DEADLINE;
    loop {
        client.do_work();
        match publication.offer(&payload) {
            Ok(_) => accepted += 1,
            Err(OfferOutcome::BackPressured) => break,
            Err(OfferOutcome::AdminAction) | Err(OfferOutcome::NotConnected) => {}
            Err(other) => panic!("unexpected offer outcome: {other:?}"),
        }
        assert!(Instant::now() < deadline, "back-pressure never engaged");
    }

    // The limit check happens before the append, so the last accepted
    // message may straddle the window edge.
    assert_eq!(
        accepted,
        (TERM_LENGTH / 2 + frame_length - 1) / frame_length,
        "window-full count of 1440-byte messages"
    );
    assert!(matches!(
        publication.offer(&payload),
        Err(OfferOutcome::BackPressured)
    ));

    // Drain exactly one message; exactly one more offer fits.
    let polled = {
        let mut count = 0;
        let deadline = Instant::now() + DEADLINE;
        while count == 0 {
            count = subscription.poll(&mut |_: &[u8], _| {}, 1);
            assert!(Instant::now() < deadline, "poll returned nothing");
        }
        count
    };
    assert_eq!(polled, 1);

    let deadline = Instant::now() + DEADLINE;
    loop {
        client.do_work();
        match publication.offer(&payload) {
            Ok(_) => break,
            Err(OfferOutcome::BackPressured) => {
                assert!(Instant::now() < deadline, "window never reopened");
                std::thread::sleep(Duration::from_millis(1));
            }
            Err(other) => panic!("unexpected offer outcome: {other:?}"),
        }
    }
    assert!(
        matches!(publication.offer(&payload), Err(OfferOutcome::BackPressured)),
        "only one message worth of window was freed"
    );

    driver.shutdown();
}
