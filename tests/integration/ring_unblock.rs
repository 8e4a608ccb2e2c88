//! To-driver ring unblock: a client that dies between claiming ring space
//! and committing its command must not wedge the Conductor.  The driver
//! detects the stall and converts the claim to padding so the consumer
//! position advances past it.

use std::time::{Duration, Instant};

use cn_concurrent::cnc::CncFile;
use cn_concurrent::ring_buffer::{
    ManyToOneRingBuffer, TAIL_POSITION_OFFSET, TRAILER_LENGTH,
};
use cn_concurrent::CountersReader;
use conduit::Client;
use conduit_driver::{DriverConfig, MediaDriver, ThreadingMode};

const DEADLINE: Duration = Duration::from_secs(10);

#[test]
fn abandoned_claim_is_unblocked_and_commands_flow_again() {
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

    let cnc = CncFile::open(driver.dir()).unwrap();
    let ring_buffer = cnc.to_driver_buffer();
    let ring = ManyToOneRingBuffer::new(ring_buffer).unwrap();
    let counters = CountersReader::new(
        cnc.counters_metadata_buffer(),
        cnc.counters_values_buffer(),
    );
    let unblocked_id = {
        let mut found = None;
        counters.for_each(|id, _, label| {
            if label == "unblocked-commands" {
                found = Some(id);
            }
        });
        found.expect("system counter must exist")
    };

    // Simulate a producer dying mid-claim: advance the tail and leave the
    // record header as a negative (claimed, uncommitted) length.
    let capacity = ring_buffer.capacity() - TRAILER_LENGTH;
    let mask = capacity as u64 - 1;
    let claim_length = 64i32;
    let tail_offset = capacity + TAIL_POSITION_OFFSET;
    loop {
        let tail = ring_buffer.get_i64_volatile(tail_offset);
        let tail_index = (tail as u64 & mask) as usize;
        ring_buffer.put_i32_ordered(tail_index, -claim_length);
        if ring_buffer.compare_and_set_i64(tail_offset, tail, tail + claim_length as i64) {
            break;
        }
    }
    let stuck_consumer = ring.consumer_position();

    // The driver's unblock tick must move the consumer past the claim.
    let deadline = Instant::now() + DEADLINE;
    while ring.consumer_position() < stuck_consumer + claim_length as i64 {
        assert!(Instant::now() < deadline, "ring never unblocked");
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(counters.counter_value(unblocked_id) >= 1);

    // The ring is healthy again: a real client command round-trips.
    let mut client = Client::connect(driver.dir()).unwrap();
    let publication = client.add_publication("aeron:ipc", 77).unwrap();
    assert_eq!(publication.stream_id, 77);

    driver.shutdown();
}
