//! Loss recovery: a dropped frame elicits a NAK and a retransmit fills
//! the gap in place.
//!
//! The test plays the remote publisher against a real driver: it sends
//! SETUP and DATA frames straight into the subscription endpoint from a
//! plain UDP socket, withholds the middle frame, reads back the NAK the
//! driver emits, then retransmits the missing frame and watches the
//! subscriber deliver everything in order.

use std::net::UdpSocket;
use std::time::{Duration, Instant};

use conduit::protocol::frame::{
    DataHeader, FrameHeader, NakFrame, SetupFrame, DATA_HEADER_LENGTH, HDR_TYPE_DATA,
    HDR_TYPE_NAK, UNFRAGMENTED,
};
use conduit::Client;
use conduit_driver::{DriverConfig, MediaDriver, ThreadingMode};

const DEADLINE: Duration = Duration::from_secs(10);
const SESSION_ID: i32 = 100;
const STREAM_ID: i32 = 42;
const INITIAL_TERM_ID: i32 = 7;
const TERM_LENGTH: usize = 64 * 1024;
const ENDPOINT: &str = "127.0.0.1:24327";

fn data_frame(term_offset: i32, payload: &[u8]) -> Vec<u8> {
    let frame_length = DATA_HEADER_LENGTH + payload.len();
    let aligned = (frame_length + 31) & !31;
    let mut buf = vec![0u8; aligned];
    DataHeader {
        frame_length: frame_length as i32,
        flags: UNFRAGMENTED,
        frame_type: HDR_TYPE_DATA,
        term_offset,
        session_id: SESSION_ID,
        stream_id: STREAM_ID,
        term_id: INITIAL_TERM_ID,
        reserved_value: 0,
    }
    .encode(&mut buf);
    buf[DATA_HEADER_LENGTH..DATA_HEADER_LENGTH + payload.len()].copy_from_slice(payload);
    buf
}

/// Receive frames on the publisher socket until one matches, skipping
/// status messages and RTT probes.
fn await_frame(socket: &UdpSocket, wanted_type: u16) -> Vec<u8> {
    let deadline = Instant::now() + DEADLINE;
    let mut buf = [0u8; 2048];
    loop {
        assert!(Instant::now() < deadline, "frame {wanted_type:#x} never arrived");
        match socket.recv_from(&mut buf) {
            Ok((length, _)) => {
                if let Ok(header) = FrameHeader::decode(&buf[..length]) {
                    if header.frame_type == wanted_type {
                        return buf[..length].to_vec();
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(1));
            }
            Err(e) => panic!("publisher socket error: {e}"),
        }
    }
}

#[test]
fn dropped_frame_is_nacked_and_recovered() {
    let tmp = tempfile::tempdir().unwrap();
    let config = DriverConfig {
        dir: tmp.path().join("driver"),
        threading_mode: ThreadingMode::Shared,
        term_buffer_length: TERM_LENGTH,
        ipc_term_buffer_length: TERM_LENGTH,
        initial_window_length: 16 * 1024,
        timer_interval_ns: 50_000_000,
        nak_unicast_delay_ns: 1_000_000,
        nak_unicast_retry_delay_ns: 20_000_000,
        ..DriverConfig::default()
    };
    let driver = MediaDriver::launch(config).unwrap();

    let mut client = Client::connect(driver.dir()).unwrap();
    let mut subscription = client
        .add_subscription(&format!("aeron:udp?endpoint={ENDPOINT}"), STREAM_ID)
        .unwrap();

    // The test is the remote publisher.
    let publisher = UdpSocket::bind("127.0.0.1:0").unwrap();
    publisher.set_nonblocking(true).unwrap();

    let mut setup = vec![0u8; 40];
    SetupFrame {
        flags: 0,
        term_offset: 0,
        session_id: SESSION_ID,
        stream_id: STREAM_ID,
        initial_term_id: INITIAL_TERM_ID,
        active_term_id: INITIAL_TERM_ID,
        term_length: TERM_LENGTH as i32,
        mtu: 1408,
        ttl: 0,
    }
    .encode(&mut setup);

    // Keep sending SETUP until the image comes up.
    let deadline = Instant::now() + DEADLINE;
    while subscription.image_count() == 0 {
        publisher.send_to(&setup, ENDPOINT).unwrap();
        client.do_work();
        assert!(Instant::now() < deadline, "image was never created");
        std::thread::sleep(Duration::from_millis(5));
    }

    // Frames A (offset 0) and C (offset 128); B (offset 64) is "lost".
    publisher.send_to(&data_frame(0, &[b'A'; 32]), ENDPOINT).unwrap();
    publisher.send_to(&data_frame(128, &[b'C'; 32]), ENDPOINT).unwrap();

    // Only A is deliverable while the gap holds.
    let mut delivered: Vec<u8> = Vec::new();
    let deadline = Instant::now() + DEADLINE;
    while delivered.is_empty() {
        client.do_work();
        subscription.poll(
            &mut |payload: &[u8], _| delivered.push(payload[0]),
            10,
        );
        assert!(Instant::now() < deadline, "frame A never delivered");
        std::thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(delivered, vec![b'A']);

    // The driver must NAK exactly the missing frame.
    let nak_frame = await_frame(&publisher, HDR_TYPE_NAK);
    let nak = NakFrame::decode(&nak_frame).unwrap();
    assert_eq!(nak.session_id, SESSION_ID);
    assert_eq!(nak.stream_id, STREAM_ID);
    assert_eq!(nak.term_id, INITIAL_TERM_ID);
    assert_eq!(nak.term_offset, 64);
    assert_eq!(nak.length, 64);

    // Retransmit B; delivery resumes in order.
    publisher.send_to(&data_frame(64, &[b'B'; 32]), ENDPOINT).unwrap();
    let deadline = Instant::now() + DEADLINE;
    while delivered.len() < 3 {
        client.do_work();
        subscription.poll(
            &mut |payload: &[u8], _| delivered.push(payload[0]),
            10,
        );
        assert!(Instant::now() < deadline, "gap never recovered");
        std::thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(delivered, vec![b'A', b'B', b'C']);

    driver.shutdown();
}
