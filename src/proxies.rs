//! Sender/receiver proxies and the internal driver command queue
//! (spec §5 "Cross-thread interfaces", §9 "Cross-agent callbacks via
//! proxy objects posting closures").
//!
//! The closure-of-arbitrary-captures pattern becomes an explicit message
//! enum over a bounded `std::sync::mpsc` channel: the sender/receiver
//! agents post `DriverCommand`s from their own threads, the conductor
//! drains them on its own thread once per tick (spec §4.1 step 3),
//! non-reentrantly.

use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};

use crate::registry::Handle;

/// Work the sender/receiver agents schedule onto the conductor thread
/// (spec §9: `CreateImage{...}`, `ReResolveEndpoint{...}`,
/// `ChannelEndpointError{...}`, plus the matching control-flow variants).
#[derive(Debug, Clone)]
pub enum DriverCommand {
    CreateImage {
        channel_endpoint_handle: Handle,
        session_id: i32,
        stream_id: i32,
        correlation_id: i64,
        initial_term_id: i32,
        active_term_id: i32,
        term_offset: u32,
    },
    ChannelEndpointError {
        channel_endpoint_handle: Handle,
        message: String,
    },
    ReResolveEndpoint {
        channel_endpoint_handle: Handle,
        resolved_address: String,
    },
    ReResolveControl {
        channel_endpoint_handle: Handle,
        resolved_address: String,
    },
}

/// Bounded, multi-producer single-consumer channel carrying
/// `DriverCommand`s from the sender/receiver agents to the conductor.
pub struct InternalCommandQueue {
    sender: SyncSender<DriverCommand>,
    receiver: Receiver<DriverCommand>,
}

impl InternalCommandQueue {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = sync_channel(capacity);
        Self { sender, receiver }
    }

    pub fn sender(&self) -> SyncSender<DriverCommand> {
        self.sender.clone()
    }

    /// Drains up to `max` commands (spec §4.1 step 3: "up to a bounded
    /// limit"). Returns how many were drained.
    pub fn drain_into(&self, max: usize, out: &mut Vec<DriverCommand>) -> usize {
        let mut drained = 0;
        while drained < max {
            match self.receiver.try_recv() {
                Ok(command) => {
                    out.push(command);
                    drained += 1;
                }
                Err(_) => break,
            }
        }
        drained
    }
}

/// A non-blocking handle the conductor uses to post work to a data-plane
/// agent without ever blocking its own thread (spec §5: "non-blocking
/// submit of closures to another agent's queue").
pub struct AgentProxy {
    sender: SyncSender<DriverCommand>,
    backpressure: bool,
}

impl AgentProxy {
    pub fn new(sender: SyncSender<DriverCommand>) -> Self {
        Self { sender, backpressure: false }
    }

    /// Attempts to post `command`. On a full queue this sets
    /// `is_applying_backpressure` and drops the command rather than
    /// blocking; callers are expected to retry on a later tick.
    pub fn try_post(&mut self, command: DriverCommand) -> bool {
        match self.sender.try_send(command) {
            Ok(()) => {
                self.backpressure = false;
                true
            }
            Err(TrySendError::Full(_)) => {
                self.backpressure = true;
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                self.backpressure = false;
                false
            }
        }
    }

    /// Spec §4.2: "If back-pressure is being applied by either data-plane
    /// proxy, the dispatcher suspends polling client commands this tick."
    pub fn is_applying_backpressure(&self) -> bool {
        self.backpressure
    }
}

pub type SenderProxy = AgentProxy;
pub type ReceiverProxy = AgentProxy;
