//! Conductor-level integration tests exercising the scenarios and
//! invariants from spec §8 end to end, through the same command
//! encode/decode path a real client would use.

use std::cell::RefCell;
use std::rc::Rc;

use tempfile::tempdir;

use super::Conductor;
use crate::command::{encode, ClientCommand, DriverResponse};
use crate::config::DriverConfig;
use crate::ingress::{ClientCommandSource, InMemoryCommandSource, InMemoryResponseSink, ResponseSink};

fn test_config(dir: &std::path::Path) -> DriverConfig {
    DriverConfig {
        counters_dir: dir.join("counters"),
        log_buffers_dir: dir.join("logs"),
        timer_interval: std::time::Duration::from_millis(1),
        client_liveness_timeout: std::time::Duration::from_millis(50),
        publication_linger_timeout: std::time::Duration::from_millis(10),
        image_linger_timeout: std::time::Duration::from_millis(10),
        ..DriverConfig::default()
    }
}

/// Forwards to a shared `InMemoryCommandSource`/`InMemoryResponseSink` so
/// the test harness can keep pushing frames and inspecting responses
/// after ownership of the boxed trait object has moved into the
/// conductor.
struct SharedSource(Rc<RefCell<InMemoryCommandSource>>);
struct SharedSink(Rc<RefCell<InMemoryResponseSink>>);

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
    source: Rc<RefCell<InMemoryCommandSource>>,
    sink: Rc<RefCell<InMemoryResponseSink>>,
}

impl Harness {
    fn new(dir: &std::path::Path) -> Self {
        let source = Rc::new(RefCell::new(InMemoryCommandSource::new()));
        let sink = Rc::new(RefCell::new(InMemoryResponseSink::new()));
        let conductor = Conductor::new(
            test_config(dir),
            Box::new(SharedSource(source.clone())),
            Box::new(SharedSink(sink.clone())),
        )
        .unwrap();
        Self { conductor, source, sink }
    }

    fn push(&mut self, correlation_id: i64, client_id: i64, command: ClientCommand) {
        let frame = encode(correlation_id, client_id, &command);
        self.source.borrow_mut().push(frame);
    }

    fn tick(&mut self) {
        self.conductor.do_work();
    }

    fn ticks(&mut self, n: usize) {
        for _ in 0..n {
            self.tick();
        }
    }

    fn responses(&self) -> Vec<(i64, DriverResponse)> {
        self.sink.borrow().sent.clone()
    }
}

fn add_publication(channel: &str, stream_id: i32, exclusive: bool) -> ClientCommand {
    ClientCommand::AddPublication {
        correlation_id: 0,
        client_id: 1,
        channel: channel.to_string(),
        stream_id,
        exclusive,
    }
}

fn add_subscription(channel: &str, stream_id: i32, client_id: i64) -> ClientCommand {
    ClientCommand::AddSubscription {
        correlation_id: 0,
        client_id,
        channel: channel.to_string(),
        stream_id,
    }
}

/// S2: two clients sharing an identical publication both get
/// `PublicationReady` with the same session id and log file, and only
/// one log file is actually created (invariant I7).
#[test]
fn shared_publication_returns_same_session_id_to_both_clients() {
    let dir = tempdir().unwrap();
    let mut h = Harness::new(dir.path());

    h.push(1, 1, add_publication("aeron:udp?endpoint=127.0.0.1:40124", 7, false));
    h.ticks(3);
    h.push(2, 2, add_publication("aeron:udp?endpoint=127.0.0.1:40124", 7, false));
    h.ticks(3);

    assert_eq!(h.conductor.network_publications.len(), 1);

    let ready: Vec<_> = h
        .responses()
        .into_iter()
        .filter_map(|(_, r)| match r {
            DriverResponse::PublicationReady { session_id, log_file, .. } => Some((session_id, log_file)),
            _ => None,
        })
        .collect();
    assert_eq!(ready.len(), 2);
    assert_eq!(ready[0], ready[1]);
}

/// Regression: `link_count` must track the exact number of live
/// `PublicationLink`s. Two clients sharing a publication, then one of
/// them removing its link, must leave the publication Active — not
/// Draining — while the second client is still publishing (spec §4.3
/// "Draining: last link removed").
#[test]
fn shared_publication_link_count_matches_live_links() {
    let dir = tempdir().unwrap();
    let mut h = Harness::new(dir.path());

    h.push(1, 1, add_publication("aeron:udp?endpoint=127.0.0.1:40199", 11, false));
    h.ticks(3);
    h.push(2, 2, add_publication("aeron:udp?endpoint=127.0.0.1:40199", 11, false));
    h.ticks(3);

    let registration_id = h
        .responses()
        .into_iter()
        .find_map(|(_, r)| match r {
            DriverResponse::PublicationReady { registration_id, .. } => Some(registration_id),
            _ => None,
        })
        .expect("PublicationReady was emitted");

    {
        let (_, publication) = h.conductor.network_publications.iter().next().expect("publication exists");
        assert_eq!(publication.link_count, 2);
    }

    h.push(3, 1, ClientCommand::RemovePublication { correlation_id: 3, client_id: 1, registration_id });
    h.ticks(3);

    let (_, publication) = h.conductor.network_publications.iter().next().expect("publication still exists");
    assert_eq!(publication.link_count, 1);
    assert_eq!(publication.state(), crate::entities::LifecycleState::Active);
}

/// Regression: the IPC counterpart of the test above — a second client
/// sharing an existing IPC publication must bump `link_count` by
/// exactly one, not two.
#[test]
fn shared_ipc_publication_link_count_matches_live_links() {
    let dir = tempdir().unwrap();
    let mut h = Harness::new(dir.path());

    h.push(1, 1, add_publication("aeron:ipc", 12, false));
    h.ticks(3);
    h.push(2, 2, add_publication("aeron:ipc", 12, false));
    h.ticks(3);

    let (_, publication) = h.conductor.ipc_publications.iter().next().expect("ipc publication exists");
    assert_eq!(publication.link_count, 2);
}

/// S3: a second exclusive publication with an identical
/// `(session, stream, channel)` fails with a session clash instead of
/// being shared.
#[test]
fn exclusive_session_clash_is_rejected() {
    let dir = tempdir().unwrap();
    let mut h = Harness::new(dir.path());

    h.push(1, 1, add_publication("aeron:udp?endpoint=127.0.0.1:40125|session-id=42", 5, true));
    h.ticks(3);
    h.push(2, 1, add_publication("aeron:udp?endpoint=127.0.0.1:40125|session-id=42", 5, true));
    h.ticks(3);

    assert_eq!(h.conductor.network_publications.len(), 1);
    let errors = h
        .responses()
        .into_iter()
        .filter(|(_, r)| matches!(r, DriverResponse::Error { .. }))
        .count();
    assert_eq!(errors, 1);
}

/// S5: `AddDestination` against an unknown publication fails with
/// `UnknownPublication` and increments the error counter, instead of
/// panicking or silently dropping the command.
#[test]
fn add_destination_on_unknown_publication_errors() {
    let dir = tempdir().unwrap();
    let mut h = Harness::new(dir.path());

    h.push(
        1,
        1,
        ClientCommand::AddDestination {
            correlation_id: 1,
            client_id: 1,
            registration_id: 999,
            channel: "aeron:udp?endpoint=127.0.0.1:40200".to_string(),
        },
    );
    h.ticks(3);

    assert_eq!(h.conductor.error_count(), 1);
}

/// S6: a client whose keepalive stops is timed out, and its publication
/// link is released rather than left dangling (invariant I5).
#[test]
fn expired_client_is_timed_out_and_releases_links() {
    let dir = tempdir().unwrap();
    let mut h = Harness::new(dir.path());

    h.push(1, 1, add_publication("aeron:udp?endpoint=127.0.0.1:40126", 9, false));
    h.ticks(3);
    assert_eq!(h.conductor.network_publications.len(), 1);
    assert_eq!(h.conductor.publication_links.len(), 1);

    std::thread::sleep(std::time::Duration::from_millis(80));
    h.ticks(5);

    let timeouts = h
        .responses()
        .into_iter()
        .filter(|(_, r)| matches!(r, DriverResponse::ClientTimeout { .. }))
        .count();
    assert_eq!(timeouts, 1);
    assert_eq!(h.conductor.publication_links.len(), 0);
}

/// R1: add then remove a subscription leaves the registry empty again
/// and acknowledges both commands.
#[test]
fn add_then_remove_subscription_round_trips() {
    let dir = tempdir().unwrap();
    let mut h = Harness::new(dir.path());

    h.push(1, 1, add_subscription("aeron:udp?endpoint=127.0.0.1:40127", 11, 1));
    h.ticks(3);
    assert_eq!(h.conductor.subscription_links.len(), 1);

    let registration_id = h
        .responses()
        .into_iter()
        .find_map(|(_, r)| match r {
            DriverResponse::SubscriptionReady { registration_id, .. } => Some(registration_id),
            _ => None,
        })
        .unwrap();

    h.push(2, 1, ClientCommand::RemoveSubscription { correlation_id: 2, client_id: 1, registration_id });
    h.ticks(3);
    assert_eq!(h.conductor.subscription_links.len(), 0);
}

/// S1: a second subscription to the same endpoint with a conflicting
/// `reliable` flag is rejected with `InvalidChannel`; the first
/// subscription is unaffected.
#[test]
fn conflicting_reliable_flag_on_shared_endpoint_is_rejected() {
    let dir = tempdir().unwrap();
    let mut h = Harness::new(dir.path());

    h.push(1, 1, add_subscription("aeron:udp?endpoint=127.0.0.1:40123|stream-id=1001|reliable=true", 1001, 1));
    h.ticks(3);
    let ready_count = h
        .responses()
        .into_iter()
        .filter(|(_, r)| matches!(r, DriverResponse::SubscriptionReady { .. }))
        .count();
    assert_eq!(ready_count, 1);

    h.push(2, 2, add_subscription("aeron:udp?endpoint=127.0.0.1:40123|stream-id=1001|reliable=false", 1001, 2));
    h.ticks(3);

    let errors = h
        .responses()
        .into_iter()
        .filter(|(_, r)| matches!(r, DriverResponse::Error { .. }))
        .count();
    assert_eq!(errors, 1);
    assert_eq!(h.conductor.subscription_links.len(), 1);
}

/// Spec §4.4 step 6: an IPC subscription added after an IPC publication
/// links directly against it (no received image involved) and gets
/// `AvailableImage`.
#[test]
fn ipc_subscription_links_to_existing_ipc_publication() {
    let dir = tempdir().unwrap();
    let mut h = Harness::new(dir.path());

    h.push(1, 1, add_publication("aeron:ipc", 21, false));
    h.ticks(3);
    h.push(2, 2, add_subscription("aeron:ipc", 21, 2));
    h.ticks(3);

    let images: Vec<_> = h
        .responses()
        .into_iter()
        .filter(|(_, r)| matches!(r, DriverResponse::AvailableImage { .. }))
        .collect();
    assert_eq!(images.len(), 1);
}

/// Spec §4.3 step 10: an IPC publication created after a matching IPC
/// subscription already exists links to it too (the reverse ordering of
/// the test above).
#[test]
fn ipc_publication_links_to_existing_ipc_subscription() {
    let dir = tempdir().unwrap();
    let mut h = Harness::new(dir.path());

    h.push(1, 1, add_subscription("aeron:ipc", 22, 1));
    h.ticks(3);
    h.push(2, 2, add_publication("aeron:ipc", 22, false));
    h.ticks(3);

    let images: Vec<_> = h
        .responses()
        .into_iter()
        .filter(|(_, r)| matches!(r, DriverResponse::AvailableImage { .. }))
        .collect();
    assert_eq!(images.len(), 1);
}

/// A spy subscription on a network channel links directly against the
/// matching `NetworkPublication` rather than requiring a receiver-side
/// image (spec §4.4 step 6, GLOSSARY "Spy").
#[test]
fn spy_subscription_links_to_matching_network_publication() {
    let dir = tempdir().unwrap();
    let mut h = Harness::new(dir.path());

    h.push(1, 1, add_publication("aeron:udp?endpoint=127.0.0.1:40129", 31, false));
    h.ticks(3);
    h.push(2, 2, add_subscription("aeron-spy:aeron:udp?endpoint=127.0.0.1:40129", 31, 2));
    h.ticks(3);

    let images: Vec<_> = h
        .responses()
        .into_iter()
        .filter(|(_, r)| matches!(r, DriverResponse::AvailableImage { .. }))
        .collect();
    assert_eq!(images.len(), 1);
}

/// Two subscriptions on the same stream and channel share one receive
/// endpoint registration rather than creating two.
#[test]
fn subscriptions_on_same_stream_share_receive_endpoint() {
    let dir = tempdir().unwrap();
    let mut h = Harness::new(dir.path());

    h.push(1, 1, add_subscription("aeron:udp?endpoint=127.0.0.1:40128", 13, 1));
    h.ticks(3);
    h.push(2, 2, add_subscription("aeron:udp?endpoint=127.0.0.1:40128", 13, 2));
    h.ticks(3);

    assert_eq!(h.conductor.subscription_links.len(), 2);
    assert_eq!(h.conductor.receive_endpoints.len(), 1);
}
