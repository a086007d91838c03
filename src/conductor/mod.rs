//! The conductor agent loop (spec §4.1) and the registries it owns
//! (spec §2 item 4, §3). This is the single-threaded control-plane
//! entity: command dispatch, lifecycle registries, session allocation,
//! and the timer/heartbeat pass all live here, the way the teacher
//! crate's `core::writer::Queue`/`core::reader` own their registries
//! and run a single-threaded per-call state machine.

mod dispatcher;
mod image;

use std::collections::{HashMap, VecDeque};

use log::{debug, info, warn};

use crate::channel_uri::{ChannelUri, ControlMode, Media};
use crate::clock::{CachedEpochClock, CachedNanoClock, QuantaNanoClock, SystemEpochClock};
use crate::command::DriverResponse;
use crate::config::DriverConfig;
use crate::counters::CountersManager;
use crate::destination::{ManualReceiveDestinations, ManualSendDestinations};
use crate::entities::{
    AeronClient, CounterLink, IpcPublication, NetworkPublication, PublicationImage, PublicationKind, PublicationLink,
    ReceiveChannelEndpoint, SendChannelEndpoint, SubscriptionLink,
};
use crate::error::{Error, ErrorCode};
use crate::ingress::{ClientCommandSource, ResponseSink};
use crate::log_buffer::LogFactory;
use crate::proxies::{AgentProxy, InternalCommandQueue};
use crate::registry::{Handle, Registry};
use crate::session::SessionAllocator;

const DUTY_CYCLE_SAMPLE_CAPACITY: usize = 64;

/// The conductor's owned state. Generic over neither source nor sink:
/// both are boxed trait objects so the production embedder and tests
/// can swap in different transports without infecting every call site
/// with type parameters.
pub struct Conductor {
    config: DriverConfig,
    nano_clock: CachedNanoClock<QuantaNanoClock>,
    epoch_clock: CachedEpochClock<SystemEpochClock>,
    timer_deadline_ns: u64,

    counters: CountersManager,
    log_factory: LogFactory,

    clients: Registry<AeronClient>,
    client_handles_by_id: HashMap<i64, Handle>,
    publication_links: Registry<PublicationLink>,
    subscription_links: Registry<SubscriptionLink>,
    network_publications: Registry<NetworkPublication>,
    ipc_publications: Registry<IpcPublication>,
    publication_images: Registry<PublicationImage>,
    send_endpoints: Registry<SendChannelEndpoint>,
    send_endpoints_by_channel: HashMap<String, Handle>,
    receive_endpoints: Registry<ReceiveChannelEndpoint>,
    receive_endpoints_by_channel: HashMap<String, Handle>,
    counter_links: Registry<CounterLink>,
    send_destinations: HashMap<i64, ManualSendDestinations>,
    receive_destinations: HashMap<i64, ManualReceiveDestinations>,

    session_allocator: SessionAllocator,
    next_correlation_id: i64,

    internal_queue: InternalCommandQueue,
    sender_proxy: AgentProxy,
    receiver_proxy: AgentProxy,

    command_source: Box<dyn ClientCommandSource>,
    response_sink: Box<dyn ResponseSink>,

    error_count: u64,
    unblocked_commands: u64,
    last_seen_consumer_position: i64,
    last_ingress_advance_ns: u64,

    duty_cycle_samples: VecDeque<u64>,
    name_resolver_ticks: u64,
    terminate_requested: bool,
    terminated: bool,
}

impl Conductor {
    pub fn new(
        config: DriverConfig,
        command_source: Box<dyn ClientCommandSource>,
        response_sink: Box<dyn ResponseSink>,
    ) -> Result<Self, Error> {
        let counters = CountersManager::create(&config.counters_dir.join("counters.dat"), config.max_counters)?;
        let log_factory = LogFactory::new(config.log_buffers_dir.clone());
        let nano_clock = CachedNanoClock::new(QuantaNanoClock::new());
        let now_ns = nano_clock.cached_ns();
        let epoch_clock = CachedEpochClock::new(SystemEpochClock, now_ns);
        let internal_queue = InternalCommandQueue::new(config.internal_queue_capacity);
        let sender_proxy = AgentProxy::new(internal_queue.sender());
        let receiver_proxy = AgentProxy::new(internal_queue.sender());
        let session_allocator = SessionAllocator::new(config.reserved_session_id_range.clone());
        let timer_deadline_ns = now_ns + config.timer_interval.as_nanos() as u64;

        Ok(Self {
            counters,
            log_factory,
            nano_clock,
            epoch_clock,
            timer_deadline_ns,
            clients: Registry::new(),
            client_handles_by_id: HashMap::new(),
            publication_links: Registry::new(),
            subscription_links: Registry::new(),
            network_publications: Registry::new(),
            ipc_publications: Registry::new(),
            publication_images: Registry::new(),
            send_endpoints: Registry::new(),
            send_endpoints_by_channel: HashMap::new(),
            receive_endpoints: Registry::new(),
            receive_endpoints_by_channel: HashMap::new(),
            counter_links: Registry::new(),
            send_destinations: HashMap::new(),
            receive_destinations: HashMap::new(),
            session_allocator,
            next_correlation_id: 1,
            internal_queue,
            sender_proxy,
            receiver_proxy,
            command_source,
            response_sink,
            error_count: 0,
            unblocked_commands: 0,
            last_seen_consumer_position: 0,
            last_ingress_advance_ns: now_ns,
            duty_cycle_samples: VecDeque::with_capacity(DUTY_CYCLE_SAMPLE_CAPACITY),
            name_resolver_ticks: 0,
            terminate_requested: false,
            terminated: false,
            config,
        })
    }

    pub fn role_name(&self) -> &'static str {
        "conductor"
    }

    pub fn on_start(&mut self) {
        info!("conductor starting");
    }

    pub fn on_close(&mut self) {
        info!("conductor closing");
    }

    pub fn error_count(&self) -> u64 {
        self.error_count
    }

    pub fn unblocked_commands(&self) -> u64 {
        self.unblocked_commands
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    fn next_correlation_id(&mut self) -> i64 {
        let id = self.next_correlation_id;
        self.next_correlation_id += 1;
        id
    }

    fn emit(&mut self, client_id: i64, response: DriverResponse) {
        self.response_sink.send(client_id, response);
    }

    fn emit_error(&mut self, client_id: i64, correlation_id: i64, err: &Error) {
        self.error_count += 1;
        warn!("command failed: {err}");
        self.emit(
            client_id,
            DriverResponse::Error {
                correlation_id,
                code: err.code(),
                message: err.to_string(),
            },
        );
    }

    /// One `do_work` round (spec §4.1). Non-blocking, bounded; returns the
    /// number of units of work performed.
    pub fn do_work(&mut self) -> usize {
        let mut work_units = 0;

        // Step 1: clocks + duty-cycle sample.
        let now_ns = self.nano_clock.refresh();
        if self.duty_cycle_samples.len() == DUTY_CYCLE_SAMPLE_CAPACITY {
            self.duty_cycle_samples.pop_front();
        }
        self.duty_cycle_samples.push_back(now_ns);
        let now_ms = self.epoch_clock.maybe_refresh(now_ns) as i64;

        // Step 2: heartbeat pass.
        if now_ns >= self.timer_deadline_ns {
            self.run_heartbeat(now_ns, now_ms);
            self.timer_deadline_ns += self.config.timer_interval.as_nanos() as u64;
            work_units += 1;
        }

        // Step 3: drain internal queue.
        work_units += self.drain_internal_queue(now_ns);

        // Step 4: poll client commands (unless back-pressured).
        work_units += self.poll_client_commands(now_ns, now_ms);

        // Step 5: update stream positions.
        work_units += self.update_stream_positions();

        // Step 6: advance the name resolver by one quantum.
        self.name_resolver_ticks += 1;

        work_units
    }

    fn run_heartbeat(&mut self, now_ns: u64, now_ms: i64) {
        // Step 1: publish the heartbeat timestamp (the consumer-heartbeat
        // slot on the client command ring buffer is owned by the ingress
        // transport, out of scope here; we still advance our own view of
        // liveness below).
        debug!("heartbeat pass at now_ms={now_ms}");

        // A client's `free()` is a no-op, so it is only removed from the
        // registry by this call; capture it by value here (rather than
        // in a second pass over the registry, which would already be
        // empty of it) so its notification and link releases can still
        // run below (spec §4.7: "Expired clients release every link they
        // own").
        let mut expired_clients = Vec::new();
        self.clients.run_heartbeat_with(now_ns, now_ms as u64, |_, client| expired_clients.push(client));
        for client in expired_clients {
            self.release_expired_client(client);
        }

        self.publication_links.run_heartbeat(now_ns, now_ms as u64);

        // Spec §4.3 state "Done": free counters, unmap and delete the
        // log, remove the `SessionKey`, and decref the owning endpoint
        // (tearing it down too if this was its last reference).
        let partition_count = self.config.partition_count;
        {
            let (session_allocator, counters, log_factory, send_endpoints, subscription_links, response_sink) = (
                &mut self.session_allocator,
                &mut self.counters,
                &self.log_factory,
                &mut self.send_endpoints,
                &mut self.subscription_links,
                &mut self.response_sink,
            );
            self.network_publications.run_heartbeat_with(now_ns, now_ms as u64, |handle, publication| {
                notify_and_unlink_local(subscription_links, counters, response_sink, PublicationKind::Network, handle);
                let _ = counters.free(&publication.publisher_position);
                let _ = counters.free(&publication.publisher_limit);
                let _ = counters.free(&publication.sender_position);
                let _ = counters.free(&publication.sender_limit);
                let _ = counters.free(&publication.sender_backpressure_events);
                let _ = log_factory.delete(publication.registration_id, partition_count);
                session_allocator.remove(&crate::session::SessionKey::new(
                    publication.session_id,
                    publication.stream_id,
                    publication.canonical_channel.clone(),
                ));
                if let Some(endpoint) = send_endpoints.get_mut(publication.channel_endpoint_handle) {
                    endpoint.dec_ref();
                }
            });
        }

        self.subscription_links.run_heartbeat(now_ns, now_ms as u64);

        {
            let (counters, log_factory, receive_endpoints, subscription_links, response_sink) = (
                &mut self.counters,
                &self.log_factory,
                &mut self.receive_endpoints,
                &mut self.subscription_links,
                &mut self.response_sink,
            );
            self.publication_images.run_heartbeat_with(now_ns, now_ms as u64, |image_handle, image| {
                // Invariant I4 / spec §5 ordering guarantee (b): every
                // `onAvailableImage` is followed by `onUnavailableImage`
                // before the image's resources are freed.
                for (_, link) in subscription_links.iter_mut() {
                    if let Some(image_link) = link.unlink_image(image_handle) {
                        let _ = counters.free(&image_link.subscriber_position);
                        response_sink.send(
                            link.client_id,
                            DriverResponse::UnavailableImage {
                                correlation_id: link.registration_id,
                                subscription_registration_id: link.registration_id,
                            },
                        );
                    }
                }
                let _ = counters.free(&image.receiver_hwm);
                let _ = counters.free(&image.receiver_position);
                let _ = log_factory.delete(image.correlation_id, partition_count);
                if let Some(endpoint) = receive_endpoints.get_mut(image.channel_endpoint_handle) {
                    endpoint.dec_image_ref();
                }
            });
        }

        {
            let (session_allocator, counters, log_factory, subscription_links, response_sink) = (
                &mut self.session_allocator,
                &mut self.counters,
                &self.log_factory,
                &mut self.subscription_links,
                &mut self.response_sink,
            );
            self.ipc_publications.run_heartbeat_with(now_ns, now_ms as u64, |handle, publication| {
                notify_and_unlink_local(subscription_links, counters, response_sink, PublicationKind::Ipc, handle);
                let _ = counters.free(&publication.publisher_position);
                let _ = counters.free(&publication.publisher_limit);
                let _ = log_factory.delete(publication.registration_id, partition_count);
                session_allocator.remove(&crate::session::SessionKey::new(
                    publication.session_id,
                    publication.stream_id,
                    publication.canonical_channel.clone(),
                ));
            });
        }

        {
            let counters = &mut self.counters;
            self.counter_links.run_heartbeat_with(now_ns, now_ms as u64, |_, link| {
                let _ = counters.free(&link.counter);
            });
        }

        {
            let counters = &mut self.counters;
            self.send_endpoints.run_heartbeat_with(now_ns, now_ms as u64, |_, endpoint| {
                let _ = counters.free(&endpoint.status_counter);
                let _ = counters.free(&endpoint.local_address_counter);
            });
        }
        {
            let counters = &mut self.counters;
            self.receive_endpoints.run_heartbeat_with(now_ns, now_ms as u64, |_, endpoint| {
                if let Some(status) = &endpoint.status_counter {
                    let _ = counters.free(status);
                }
                if let Some(local_address) = &endpoint.local_address_counter {
                    let _ = counters.free(local_address);
                }
            });
        }
        self.send_endpoints_by_channel.retain(|_, handle| self.send_endpoints.get(*handle).is_some());
        self.receive_endpoints_by_channel.retain(|_, handle| self.receive_endpoints.get(*handle).is_some());

        // Step 3: blocked-ingress check.
        let consumer_position = self.command_source.consumer_position();
        let producer_position = self.command_source.producer_position();
        if consumer_position != self.last_seen_consumer_position {
            self.last_seen_consumer_position = consumer_position;
            self.last_ingress_advance_ns = now_ns;
        } else if producer_position > consumer_position
            && now_ns.saturating_sub(self.last_ingress_advance_ns) > self.config.client_liveness_timeout.as_nanos() as u64
        {
            self.command_source.unblock();
            self.unblocked_commands += 1;
        }
    }

    /// A client that has timed out or closed releases every link it owns
    /// (spec §4.7: "Expired clients release every link they own"). Only
    /// a liveness timeout (not an explicit close) is reported to the
    /// client set via `ClientTimeout` (spec §6 response ids, S6).
    fn release_expired_client(&mut self, client: AeronClient) {
        let client_id = client.client_id;
        let timed_out = client.timed_out();
        let liveness_counter = client.liveness_counter().clone();
        if timed_out {
            self.emit(client_id, DriverResponse::ClientTimeout { client_id });
        }

        for link_handle in client.publication_links {
            self.release_publication_link(link_handle);
        }
        for link_handle in client.subscription_links {
            self.release_subscription(link_handle);
        }
        for link_handle in client.counter_links {
            if let Some(link) = self.counter_links.get_mut(link_handle) {
                link.release();
            }
        }
        let _ = self.counters.free(&liveness_counter);
        self.client_handles_by_id.remove(&client_id);
    }

    fn drain_internal_queue(&mut self, now_ns: u64) -> usize {
        let mut commands = Vec::new();
        let drained = self
            .internal_queue
            .drain_into(self.config.max_internal_commands_per_tick, &mut commands);
        for command in commands {
            self.handle_internal_command(command, now_ns);
        }
        drained
    }

    fn poll_client_commands(&mut self, now_ns: u64, now_ms: i64) -> usize {
        if self.sender_proxy.is_applying_backpressure() || self.receiver_proxy.is_applying_backpressure() {
            return 0;
        }
        let frames = self.command_source.poll(self.config.max_commands_per_tick);
        let count = frames.len();
        for frame in frames {
            match crate::command::decode(&frame) {
                Ok(command) => self.dispatch(command, now_ns, now_ms),
                Err(err) => {
                    self.error_count += 1;
                    warn!("failed to decode client command frame: {err}");
                }
            }
        }
        count
    }

    fn update_stream_positions(&mut self) -> usize {
        let mut updated = 0;
        for (_, image) in self.publication_images.iter_mut() {
            let hwm = image.receiver_hwm.get();
            let completed = image.receiver_position.get();
            image.congestion_control.on_track_rebuild(0, hwm, completed);
            updated += 1;
        }
        for (_, publication) in self.network_publications.iter_mut() {
            let window = publication.log_buffer.metadata().term_length as i64;
            let limit = publication.sender_position.get() + window;
            publication.publisher_limit.set(limit);
            updated += 1;
        }
        for (_, publication) in self.ipc_publications.iter_mut() {
            let window = publication.log_buffer.metadata().term_length as i64;
            let limit = publication.publisher_position.get() + window;
            publication.publisher_limit.set(limit);
            updated += 1;
        }
        updated
    }

    fn canonical_channel_and_media(uri: &ChannelUri) -> (String, Media) {
        (uri.canonical_form(), uri.media)
    }
}

/// Before an IPC/Network publication reaching Done state is freed, unlink
/// it from every IPC/Spy subscription still holding a [`LocalLink`] to it
/// and emit `UnavailableImage`, mirroring the image-teardown notification
/// above (invariant I4, spec §5 ordering guarantee (b)).
fn notify_and_unlink_local(
    subscription_links: &mut Registry<SubscriptionLink>,
    counters: &mut CountersManager,
    response_sink: &mut Box<dyn ResponseSink>,
    kind: PublicationKind,
    publication_handle: Handle,
) {
    for (_, link) in subscription_links.iter_mut() {
        if let Some(local_link) = link.unlink_local(kind, publication_handle) {
            let _ = counters.free(&local_link.subscriber_position);
            response_sink.send(
                link.client_id,
                DriverResponse::UnavailableImage {
                    correlation_id: link.registration_id,
                    subscription_registration_id: link.registration_id,
                },
            );
        }
    }
}

#[cfg(test)]
mod tests;
