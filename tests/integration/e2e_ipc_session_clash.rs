//! Session-id clash refusal on the IPC medium.
//!
//! A non-exclusive publication claims session 5 on stream 10; an
//! exclusive publication then demanding the same session must be refused
//! with an invalid-channel error naming the clash.

use conduit::protocol::ErrorCode;
use conduit::{Client, ClientError};
use conduit_driver::{DriverConfig, MediaDriver, ThreadingMode};

#[test]
fn exclusive_publication_with_clashing_session_id_is_refused() {
    let tmp = tempfile::tempdir().unwrap();
    let config = DriverConfig {
        dir: tmp.path().join("driver"),
        threading_mode: ThreadingMode::Shared,
        term_buffer_length: 64 * 1024,
        ipc_term_buffer_length: 64 * 1024,
        initial_window_length: 16 * 1024,
        timer_interval_ns: 50_000_000,
        ..DriverConfig::default()
    };
    let driver = MediaDriver::launch(config).unwrap();

    let mut first = Client::connect(driver.dir()).unwrap();
    let publication = first
        .add_publication("aeron:ipc?session-id=5", 10)
        .unwrap();
    assert_eq!(publication.session_id, 5);

    let mut second = Client::connect(driver.dir()).unwrap();
    let result = second.add_exclusive_publication("aeron:ipc?session-id=5", 10);

    match result {
        Err(ClientError::Rejected { code, message }) => {
            assert_eq!(code, ErrorCode::InvalidChannel);
            assert!(
                message.contains("clashing sessionId=5"),
                "unexpected reason: {message}"
            );
        }
        Err(other) => panic!("expected rejection, got {other}"),
        Ok(_) => panic!("clashing exclusive publication was accepted"),
    }

    // A different session id on the same stream is fine.
    second
        .add_exclusive_publication("aeron:ipc?session-id=6", 10)
        .unwrap();

    driver.shutdown();
}

#[test]
fn non_exclusive_publications_share_a_session() {
    let tmp = tempfile::tempdir().unwrap();
    let config = DriverConfig {
        dir: tmp.path().join("driver"),
        threading_mode: ThreadingMode::Shared,
        term_buffer_length: 64 * 1024,
        ipc_term_buffer_length: 64 * 1024,
        initial_window_length: 16 * 1024,
        timer_interval_ns: 50_000_000,
        ..DriverConfig::default()
    };
    let driver = MediaDriver::launch(config).unwrap();

    let mut client = Client::connect(driver.dir()).unwrap();
    let a = client.add_publication("aeron:ipc", 20).unwrap();
    let b = client.add_publication("aeron:ipc", 20).unwrap();

    assert_eq!(a.session_id, b.session_id, "shared stream, shared session");
    assert_eq!(a.registration_id, b.registration_id);

    driver.shutdown();
}
