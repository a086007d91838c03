//! Black-box scenario and invariant tests driving the conductor only
//! through its public command/response surface, the way the teacher
//! crate's `tests/round_trip.rs` and `tests/retention_cleanup.rs` drive
//! `chronicle` only through its public writer/reader API.
//!
//! These complement (not duplicate) the in-crate `conductor::tests`
//! module, which has access to private registry fields for finer
//! assertions; everything here is observable from outside the crate.

use std::path::Path;
use std::time::Duration;

use media_conductor::command::{encode, ClientCommand, DriverResponse};
use media_conductor::config::DriverConfig;
use media_conductor::conductor::Conductor;
use media_conductor::ingress::{ClientCommandSource, InMemoryCommandSource, InMemoryResponseSink, ResponseSink};

fn test_config(dir: &Path) -> DriverConfig {
    DriverConfig {
        counters_dir: dir.join("counters"),
        log_buffers_dir: dir.join("logs"),
        timer_interval: Duration::from_millis(1),
        client_liveness_timeout: Duration::from_millis(50),
        publication_linger_timeout: Duration::from_millis(10),
        image_linger_timeout: Duration::from_millis(10),
        ..DriverConfig::default()
    }
}

struct SharedSource(std::rc::Rc<std::cell::RefCell<InMemoryCommandSource>>);
struct SharedSink(std::rc::Rc<std::cell::RefCell<InMemoryResponseSink>>);

impl ClientCommandSource for SharedSource {
    fn poll(&mut self, max: usize) -> Vec<Vec<u8>> {
        self.0.borrow_mut().poll(max)
    }
    fn producer_position(&self) -> i64 {
        self.0.borrow().producer_position()
    }
    fn consumer_position(&self) -> i64 {
        self.0.borrow().consumer_position()
    }
    fn unblock(&mut self) {
        self.0.borrow_mut().unblock()
    }
}

impl ResponseSink for SharedSink {
    fn send(&mut self, client_id: i64, response: DriverResponse) {
        self.0.borrow_mut().send(client_id, response)
    }
}

struct Harness {
    conductor: Conductor,
    source: std::rc::Rc<std::cell::RefCell<InMemoryCommandSource>>,
    sink: std::rc::Rc<std::cell::RefCell<InMemoryResponseSink>>,
}

impl Harness {
    fn new(dir: &Path) -> Self {
        let source = std::rc::Rc::new(std::cell::RefCell::new(InMemoryCommandSource::new()));
        let sink = std::rc::Rc::new(std::cell::RefCell::new(InMemoryResponseSink::new()));
        let conductor = Conductor::new(
            test_config(dir),
            Box::new(SharedSource(source.clone())),
            Box::new(SharedSink(sink.clone())),
        )
        .unwrap();
        Self { conductor, source, sink }
    }

    fn push(&mut self, client_id: i64, command: ClientCommand) {
        let frame = encode(0, client_id, &command);
        self.source.borrow_mut().push(frame);
    }

    fn ticks(&mut self, n: usize) {
        for _ in 0..n {
            self.conductor.do_work();
        }
    }

    fn responses(&self) -> Vec<(i64, DriverResponse)> {
        self.sink.borrow().sent.clone()
    }
}

fn add_publication(channel: &str, stream_id: i32) -> ClientCommand {
    ClientCommand::AddPublication {
        correlation_id: 0,
        client_id: 1,
        channel: channel.to_string(),
        stream_id,
        exclusive: false,
    }
}

/// AddCounter/RemoveCounter round-trip: `CounterReady` then
/// `OperationSucceeded`, and the allocation is visible on disk as part
/// of the counters file (spec §4.2 "AddCounter, RemoveCounter").
#[test]
fn add_then_remove_counter_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let mut h = Harness::new(dir.path());

    h.push(
        1,
        ClientCommand::AddCounter {
            correlation_id: 1,
            client_id: 1,
            type_id: 42,
            key_bytes: b"my-key".to_vec(),
            label: "custom-counter".to_string(),
        },
    );
    h.ticks(3);

    let registration_id = h
        .responses()
        .into_iter()
        .find_map(|(_, r)| match r {
            DriverResponse::CounterReady { registration_id, .. } => Some(registration_id),
            _ => None,
        })
        .expect("CounterReady was emitted");

    h.push(2, ClientCommand::RemoveCounter { correlation_id: 2, client_id: 1, registration_id });
    h.ticks(3);

    let succeeded = h
        .responses()
        .into_iter()
        .filter(|(_, r)| matches!(r, DriverResponse::OperationSucceeded { .. }))
        .count();
    assert_eq!(succeeded, 1);
}

/// RemoveCounter against an id that was never allocated is rejected
/// rather than silently acknowledged.
#[test]
fn remove_unknown_counter_errors() {
    let dir = tempfile::tempdir().unwrap();
    let mut h = Harness::new(dir.path());

    h.push(1, ClientCommand::RemoveCounter { correlation_id: 1, client_id: 1, registration_id: 777 });
    h.ticks(3);

    assert_eq!(h.conductor.error_count(), 1);
}

/// `TerminateDriver` with an empty token is rejected; a non-empty token
/// authorizes shutdown (spec §4.2 "TerminateDriver", §5 "externally
/// supplied validator").
#[test]
fn terminate_driver_requires_a_nonempty_token() {
    let dir = tempfile::tempdir().unwrap();
    let mut h = Harness::new(dir.path());

    h.push(1, ClientCommand::TerminateDriver { client_id: 1, token: Vec::new() });
    h.ticks(3);
    assert!(!h.conductor.is_terminated());
    assert_eq!(h.conductor.error_count(), 1);

    h.push(2, ClientCommand::TerminateDriver { client_id: 1, token: vec![1, 2, 3] });
    h.ticks(3);
    assert!(h.conductor.is_terminated());
}

/// Spec §4.7 / S6: an explicit `ClientClose` releases the client's links
/// without emitting `ClientTimeout` — that notification is reserved for
/// a liveness-timeout expiry, not a graceful close.
#[test]
fn explicit_client_close_does_not_emit_client_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let mut h = Harness::new(dir.path());

    h.push(1, add_publication("aeron:udp?endpoint=127.0.0.1:41100", 3));
    h.ticks(3);
    h.push(1, ClientCommand::ClientClose { client_id: 1 });
    h.ticks(5);

    let timeouts = h
        .responses()
        .into_iter()
        .filter(|(_, r)| matches!(r, DriverResponse::ClientTimeout { .. }))
        .count();
    assert_eq!(timeouts, 0);
}

/// Spec invariant 4 / §4.3 "Done": a publication's log file exists for
/// its entire lifecycle including linger, and is only unlinked once
/// fully freed.
#[test]
fn publication_log_file_is_deleted_only_after_full_release() {
    let dir = tempfile::tempdir().unwrap();
    let mut h = Harness::new(dir.path());

    h.push(1, add_publication("aeron:udp?endpoint=127.0.0.1:41101", 5));
    h.ticks(3);

    let (registration_id, _) = h
        .responses()
        .into_iter()
        .find_map(|(_, r)| match r {
            DriverResponse::PublicationReady { registration_id, session_id, .. } => Some((registration_id, session_id)),
            _ => None,
        })
        .expect("PublicationReady was emitted");

    let log_path = dir.path().join("logs").join(format!("{registration_id}.logbuffer"));
    assert!(log_path.exists(), "log file should exist while publication is active");

    h.push(
        2,
        ClientCommand::RemovePublication { correlation_id: 2, client_id: 1, registration_id },
    );
    h.ticks(3);
    assert!(log_path.exists(), "log file must still exist through the linger period");

    std::thread::sleep(Duration::from_millis(30));
    h.ticks(5);
    assert!(!log_path.exists(), "log file should be unlinked once the publication is fully freed");
}

/// Spec §4.6 MDC: adding then removing a unicast destination on a
/// network publication round-trips through `OperationSucceeded`.
#[test]
fn add_then_remove_destination_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let mut h = Harness::new(dir.path());

    h.push(1, add_publication("aeron:udp?endpoint=127.0.0.1:41102|control-mode=manual", 9));
    h.ticks(3);
    let registration_id = h
        .responses()
        .into_iter()
        .find_map(|(_, r)| match r {
            DriverResponse::PublicationReady { registration_id, .. } => Some(registration_id),
            _ => None,
        })
        .unwrap();

    h.push(
        2,
        ClientCommand::AddDestination {
            correlation_id: 2,
            client_id: 1,
            registration_id,
            channel: "aeron:udp?endpoint=127.0.0.1:41103".to_string(),
        },
    );
    h.ticks(3);
    h.push(
        3,
        ClientCommand::RemoveDestination {
            correlation_id: 3,
            client_id: 1,
            registration_id,
            channel: "aeron:udp?endpoint=127.0.0.1:41103".to_string(),
        },
    );
    h.ticks(3);

    let succeeded = h
        .responses()
        .into_iter()
        .filter(|(_, r)| matches!(r, DriverResponse::OperationSucceeded { .. }))
        .count();
    assert_eq!(succeeded, 2);
    assert_eq!(h.conductor.error_count(), 0);
}

/// Invariant I6: every registration id the conductor hands back
/// (publication, subscription, counter) is strictly increasing across
/// the driver's lifetime.
#[test]
fn registration_ids_are_strictly_increasing() {
    let dir = tempfile::tempdir().unwrap();
    let mut h = Harness::new(dir.path());

    h.push(1, add_publication("aeron:udp?endpoint=127.0.0.1:41104", 11));
    h.ticks(2);
    h.push(
        2,
        ClientCommand::AddSubscription {
            correlation_id: 2,
            client_id: 2,
            channel: "aeron:udp?endpoint=127.0.0.1:41105".to_string(),
            stream_id: 12,
        },
    );
    h.ticks(2);
    h.push(
        3,
        ClientCommand::AddCounter {
            correlation_id: 3,
            client_id: 3,
            type_id: 1,
            key_bytes: b"k".to_vec(),
            label: "l".to_string(),
        },
    );
    h.ticks(2);

    let mut registration_ids = Vec::new();
    for (_, response) in h.responses() {
        match response {
            DriverResponse::PublicationReady { registration_id, .. }
            | DriverResponse::SubscriptionReady { registration_id, .. }
            | DriverResponse::CounterReady { registration_id, .. } => registration_ids.push(registration_id),
            _ => {}
        }
    }

    assert_eq!(registration_ids.len(), 3);
    let mut sorted = registration_ids.clone();
    sorted.sort_unstable();
    assert_eq!(registration_ids, sorted, "registration ids must be emitted in increasing order");
    assert!(registration_ids.windows(2).all(|w| w[0] < w[1]));
}

/// Spec §4.6 MDS: `RemoveRcvDestination` must tear down exactly the
/// sub-subscription the client named, leaving any other destination on
/// the same anchor untouched.
#[test]
fn remove_rcv_destination_drops_only_the_named_child() {
    let dir = tempfile::tempdir().unwrap();
    let mut h = Harness::new(dir.path());

    h.push(
        1,
        ClientCommand::AddSubscription {
            correlation_id: 1,
            client_id: 1,
            channel: "aeron:udp?endpoint=127.0.0.1:41200|control-mode=manual|control=127.0.0.1:41200".to_string(),
            stream_id: 20,
        },
    );
    h.ticks(2);
    let anchor_registration_id = h
        .responses()
        .into_iter()
        .find_map(|(_, r)| match r {
            DriverResponse::SubscriptionReady { registration_id, .. } => Some(registration_id),
            _ => None,
        })
        .expect("SubscriptionReady was emitted");

    h.push(
        2,
        ClientCommand::AddRcvDestination {
            correlation_id: 2,
            client_id: 1,
            registration_id: anchor_registration_id,
            channel: "aeron-spy:aeron:udp?endpoint=127.0.0.1:41201".to_string(),
        },
    );
    h.ticks(2);
    h.push(
        3,
        ClientCommand::AddRcvDestination {
            correlation_id: 3,
            client_id: 1,
            registration_id: anchor_registration_id,
            channel: "aeron-spy:aeron:udp?endpoint=127.0.0.1:41202".to_string(),
        },
    );
    h.ticks(2);
    assert_eq!(h.conductor.error_count(), 0);

    // Remove the second destination; the first must survive.
    h.push(
        4,
        ClientCommand::RemoveRcvDestination {
            correlation_id: 4,
            client_id: 1,
            registration_id: anchor_registration_id,
            channel: "aeron-spy:aeron:udp?endpoint=127.0.0.1:41202".to_string(),
        },
    );
    h.ticks(2);
    assert_eq!(h.conductor.error_count(), 0, "removing the named destination must succeed");

    // Removing it again must fail — it is already gone.
    h.push(
        5,
        ClientCommand::RemoveRcvDestination {
            correlation_id: 5,
            client_id: 1,
            registration_id: anchor_registration_id,
            channel: "aeron-spy:aeron:udp?endpoint=127.0.0.1:41202".to_string(),
        },
    );
    h.ticks(2);
    assert_eq!(h.conductor.error_count(), 1, "the second destination is already removed");

    // The first destination must still be there to remove.
    h.push(
        6,
        ClientCommand::RemoveRcvDestination {
            correlation_id: 6,
            client_id: 1,
            registration_id: anchor_registration_id,
            channel: "aeron-spy:aeron:udp?endpoint=127.0.0.1:41201".to_string(),
        },
    );
    h.ticks(2);
    assert_eq!(h.conductor.error_count(), 1, "the first destination was never touched by the earlier remove");
}
