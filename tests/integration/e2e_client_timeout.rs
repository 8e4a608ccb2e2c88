//! Client liveness: a client that stops sending keepalives has all of its
//! resources cascade-closed and the timeout is announced and counted.

use std::time::{Duration, Instant};

use cn_concurrent::broadcast::{BroadcastReceiver, CopyBroadcastReceiver};
use cn_concurrent::cnc::CncFile;
use cn_concurrent::CountersReader;
use cn_protocol::control;
use conduit::Client;
use conduit_driver::{DriverConfig, MediaDriver, ThreadingMode};

const DEADLINE: Duration = Duration::from_secs(10);

#[test]
fn silent_client_is_timed_out_and_resources_cascade() {
    let tmp = tempfile::tempdir().unwrap();
    let config = DriverConfig {
        dir: tmp.path().join("driver"),
        threading_mode: ThreadingMode::Shared,
        term_buffer_length: 64 * 1024,
        ipc_term_buffer_length: 64 * 1024,
        initial_window_length: 16 * 1024,
        timer_interval_ns: 50_000_000,
        client_liveness_timeout_ns: 400_000_000,
        publication_linger_timeout_ns: 100_000_000,
        ..DriverConfig::default()
    };
    let driver = MediaDriver::launch(config).unwrap();

    // Observe driver events and counters independently of any client.
    let cnc = CncFile::open(driver.dir()).unwrap();
    let mut events =
        CopyBroadcastReceiver::new(BroadcastReceiver::new(cnc.to_clients_buffer()).unwrap());
    let counters = CountersReader::new(
        cnc.counters_metadata_buffer(),
        cnc.counters_values_buffer(),
    );
    let client_timeouts_id = {
        let mut found = None;
        counters.for_each(|id, _, label| {
            if label == "client-timeouts" {
                found = Some(id);
            }
        });
        found.expect("system counter must exist")
    };

    let mut doomed = Client::connect(driver.dir()).unwrap();
    let doomed_id = doomed.client_id();
    let _pub_a = doomed.add_publication("aeron:ipc", 30).unwrap();
    let _pub_b = doomed.add_publication("aeron:ipc", 31).unwrap();
    let _sub = doomed.add_subscription("aeron:ipc", 32).unwrap();
    let counter_id = doomed.add_counter(1001, b"k", "user-counter").unwrap();
    assert!(counter_id >= 0);

    let publications_dir = driver.dir().join("publications");
    assert!(
        std::fs::read_dir(&publications_dir).unwrap().count() >= 2,
        "publication logs exist while the client is alive"
    );

    // Stop calling do_work: no more keepalives.  The driver must time the
    // client out and publish the event.
    let mut saw_timeout_event = false;
    let deadline = Instant::now() + DEADLINE;
    while !saw_timeout_event {
        let _ = events.receive(|event_type, bytes| {
            if event_type == control::ON_CLIENT_TIMEOUT {
                let event = control::ClientTimeout::decode(bytes).unwrap();
                assert_eq!(event.client_id, doomed_id);
                saw_timeout_event = true;
            }
        });
        assert!(Instant::now() < deadline, "client was never timed out");
        std::thread::sleep(Duration::from_millis(5));
    }

    assert_eq!(counters.counter_value(client_timeouts_id), 1);

    // Cascade: publication logs linger briefly, then are deleted.
    let deadline = Instant::now() + DEADLINE;
    loop {
        let remaining = std::fs::read_dir(&publications_dir).unwrap().count();
        if remaining == 0 {
            break;
        }
        assert!(
            Instant::now() < deadline,
            "publication logs were never freed ({remaining} left)"
        );
        std::thread::sleep(Duration::from_millis(10));
    }

    driver.shutdown();
}
