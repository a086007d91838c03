//! Client command ingress and response egress interfaces (spec §2 items
//! 5–6). The ring buffer and broadcast channel themselves are the client
//! IPC transport, an external collaborator out of scope for the
//! conductor (spec §1); these traits are the boundary the conductor
//! depends on, with an in-memory double used by tests standing in for
//! the real cross-process transport.

use std::collections::VecDeque;

use crate::command::DriverResponse;

/// Source of raw client command frames (spec §5 "Client command ring
/// buffer"): multi-producer single-consumer, producer position written
/// by clients, consumer position by the conductor.
pub trait ClientCommandSource {
    /// Pops up to `max` raw frames in arrival order.
    fn poll(&mut self, max: usize) -> Vec<Vec<u8>>;
    fn producer_position(&self) -> i64;
    fn consumer_position(&self) -> i64;
    /// Spec §4.7 step 3: called when the consumer position is found
    /// stuck behind the producer past the liveness timeout.
    fn unblock(&mut self);
}

/// Sink for responses and asynchronous notifications (spec §2 item 6
/// "Egress to clients"). Spec invariant 7: delivery order must match
/// emission order, so implementations must not reorder.
pub trait ResponseSink {
    fn send(&mut self, client_id: i64, response: DriverResponse);
}

/// In-memory stand-in for the real ring buffer, used by tests and by
/// any embedder that wants the conductor without the cross-process
/// transport.
#[derive(Default)]
pub struct InMemoryCommandSource {
    frames: VecDeque<Vec<u8>>,
    producer_position: i64,
    consumer_position: i64,
}

impl InMemoryCommandSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, frame: Vec<u8>) {
        self.frames.push_back(frame);
        self.producer_position += 1;
    }
}

impl ClientCommandSource for InMemoryCommandSource {
    fn poll(&mut self, max: usize) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        while out.len() < max {
            match self.frames.pop_front() {
                Some(frame) => {
                    self.consumer_position += 1;
                    out.push(frame);
                }
                None => break,
            }
        }
        out
    }

    fn producer_position(&self) -> i64 {
        self.producer_position
    }

    fn consumer_position(&self) -> i64 {
        self.consumer_position
    }

    fn unblock(&mut self) {
        if let Some(_stuck) = self.frames.pop_front() {
            self.consumer_position += 1;
        }
    }
}

/// In-memory stand-in for the broadcast channel to clients, recording
/// every response in emission order.
#[derive(Default)]
pub struct InMemoryResponseSink {
    pub sent: Vec<(i64, DriverResponse)>,
}

impl InMemoryResponseSink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ResponseSink for InMemoryResponseSink {
    fn send(&mut self, client_id: i64, response: DriverResponse) {
        self.sent.push((client_id, response));
    }
}
