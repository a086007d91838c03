//! Command dispatch (spec §4.2): decode/validate, invoke the matching
//! creation/removal flow, and convert any failure into an
//! `Error(correlation_id, code, message)` notification rather than
//! aborting the tick.

use log::{debug, info};

use super::Conductor;
use crate::channel_uri::{ChannelUri, ControlMode, Media};
use crate::command::{ClientCommand, DriverResponse};
use crate::destination::{ManualReceiveDestinations, ManualSendDestinations, ReceiveDestinationKind};
use crate::entities::{
    AeronClient, CounterLink, IpcPublication, NetworkPublication, PublicationKind, PublicationLink,
    ReceiveChannelEndpoint, SendChannelEndpoint, SubscriptionKind, SubscriptionLink,
};
use crate::error::Error;
use crate::flow_control::{select_congestion_control, select_flow_control, RetransmitHandler};
use crate::log_buffer::LogMetadata;
use crate::registry::Handle;

pub(super) const COUNTER_TYPE_PUBLISHER_POSITION: i32 = 1;
pub(super) const COUNTER_TYPE_PUBLISHER_LIMIT: i32 = 2;
pub(super) const COUNTER_TYPE_SENDER_POSITION: i32 = 3;
pub(super) const COUNTER_TYPE_SENDER_LIMIT: i32 = 4;
pub(super) const COUNTER_TYPE_SENDER_BPE: i32 = 5;
pub(super) const COUNTER_TYPE_RECEIVER_HWM: i32 = 6;
pub(super) const COUNTER_TYPE_RECEIVER_POSITION: i32 = 7;
pub(super) const COUNTER_TYPE_CLIENT_LIVENESS: i32 = 8;
pub(super) const COUNTER_TYPE_SUBSCRIBER_POSITION: i32 = 9;
pub(super) const COUNTER_TYPE_SEND_STATUS: i32 = 10;
pub(super) const COUNTER_TYPE_RECEIVE_STATUS: i32 = 11;

impl Conductor {
    pub(super) fn dispatch(&mut self, command: ClientCommand, now_ns: u64, now_ms: i64) {
        let result = self.try_dispatch(&command, now_ns, now_ms);
        if let Err(err) = result {
            let (client_id, correlation_id) = command_identity(&command);
            self.emit_error(client_id, correlation_id, &err);
        }
    }

    fn try_dispatch(&mut self, command: &ClientCommand, now_ns: u64, now_ms: i64) -> Result<(), Error> {
        match command {
            ClientCommand::AddPublication {
                correlation_id,
                client_id,
                channel,
                stream_id,
                exclusive,
            } => self.add_publication(*correlation_id, *client_id, channel, *stream_id, *exclusive, now_ns),
            ClientCommand::RemovePublication { client_id, registration_id, .. } => {
                self.remove_publication_link(*client_id, *registration_id)
            }
            ClientCommand::AddSubscription {
                correlation_id,
                client_id,
                channel,
                stream_id,
            } => self.add_subscription(*correlation_id, *client_id, channel, *stream_id, now_ns),
            ClientCommand::RemoveSubscription { client_id, registration_id, .. } => {
                self.remove_subscription(*client_id, *registration_id)
            }
            ClientCommand::AddDestination {
                correlation_id,
                client_id,
                registration_id,
                channel,
            } => self.add_destination(*correlation_id, *client_id, *registration_id, channel),
            ClientCommand::RemoveDestination {
                correlation_id,
                client_id,
                registration_id,
                channel,
            } => self.remove_destination(*correlation_id, *client_id, *registration_id, channel),
            ClientCommand::AddRcvDestination {
                correlation_id,
                client_id,
                registration_id,
                channel,
            } => self.add_rcv_destination(*correlation_id, *client_id, *registration_id, channel, now_ns),
            ClientCommand::RemoveRcvDestination {
                correlation_id,
                client_id,
                registration_id,
                channel,
            } => self.remove_rcv_destination(*correlation_id, *client_id, *registration_id, channel),
            ClientCommand::ClientKeepalive { client_id } => {
                let handle = self.ensure_client(*client_id, now_ns, now_ms)?;
                if let Some(client) = self.clients.get_mut(handle) {
                    client.on_keepalive(now_ns, now_ms);
                }
                Ok(())
            }
            ClientCommand::ClientClose { client_id } => {
                let handle = self.ensure_client(*client_id, now_ns, now_ms)?;
                if let Some(client) = self.clients.get_mut(handle) {
                    client.mark_closed();
                }
                Ok(())
            }
            ClientCommand::AddCounter {
                correlation_id,
                client_id,
                type_id,
                key_bytes,
                label,
            } => self.add_counter(*correlation_id, *client_id, *type_id, key_bytes, label, now_ns, now_ms),
            ClientCommand::RemoveCounter { correlation_id, client_id, registration_id } => {
                self.remove_counter(*correlation_id, *client_id, *registration_id)
            }
            ClientCommand::TerminateDriver { client_id: _, token } => self.terminate_driver(token),
        }
    }

    fn ensure_client(&mut self, client_id: i64, now_ns: u64, now_ms: i64) -> Result<Handle, Error> {
        if let Some(handle) = self.client_handles_by_id.get(&client_id) {
            return Ok(*handle);
        }
        let counter = self
            .counters
            .allocate(COUNTER_TYPE_CLIENT_LIVENESS, client_id, 0, &client_id.to_le_bytes(), "client-liveness")?;
        let client = AeronClient::new(client_id, now_ns, self.config.client_liveness_timeout.as_nanos() as u64, counter);
        let _ = now_ms;
        let handle = self.clients.insert(client);
        self.client_handles_by_id.insert(client_id, handle);
        Ok(handle)
    }

    // ---- Publications (spec §4.3) --------------------------------------

    fn add_publication(
        &mut self,
        correlation_id: i64,
        client_id: i64,
        channel: &str,
        stream_id: i32,
        exclusive: bool,
        now_ns: u64,
    ) -> Result<(), Error> {
        let uri = ChannelUri::parse(channel)?;
        uri.validate_as_publication()?;
        let mtu = uri.mtu()?.unwrap_or(self.config.default_mtu);
        if mtu > self.config.max_mtu {
            return Err(Error::InvalidChannel(format!("mtu {mtu} exceeds maximum {}", self.config.max_mtu)));
        }
        let term_length = uri.term_length()?.unwrap_or(self.config.default_term_length);
        let client_handle = self.ensure_client(client_id, now_ns, now_ns as i64)?;

        match uri.media {
            Media::Ipc => {
                let (registration_id, session_id) = self.add_ipc_publication(&uri, stream_id, exclusive, term_length, now_ns)?;
                self.link_publication(correlation_id, client_id, client_handle, PublicationKind::Ipc, registration_id);
                self.emit(
                    client_id,
                    DriverResponse::PublicationReady {
                        correlation_id,
                        registration_id,
                        session_id,
                        log_file: format!("{registration_id}.logbuffer"),
                    },
                );
                Ok(())
            }
            Media::Udp => {
                let canonical_channel = uri.canonical_form();
                let endpoint_handle = self.get_or_create_send_endpoint(&canonical_channel, uri.tag(), now_ns)?;

                if !exclusive {
                    if let Some((registration_id, session_id)) =
                        self.find_shared_network_publication(endpoint_handle, stream_id, &uri, term_length, mtu)?
                    {
                        self.link_publication(correlation_id, client_id, client_handle, PublicationKind::Network, registration_id);
                        self.emit(
                            client_id,
                            DriverResponse::PublicationReady {
                                correlation_id,
                                registration_id,
                                session_id,
                                log_file: format!("{registration_id}.logbuffer"),
                            },
                        );
                        return Ok(());
                    }
                }

                let (registration_id, session_id) =
                    self.create_network_publication(&uri, endpoint_handle, stream_id, &canonical_channel, term_length, mtu, now_ns)?;
                self.link_publication(correlation_id, client_id, client_handle, PublicationKind::Network, registration_id);
                self.emit(
                    client_id,
                    DriverResponse::PublicationReady {
                        correlation_id,
                        registration_id,
                        session_id,
                        log_file: format!("{registration_id}.logbuffer"),
                    },
                );
                Ok(())
            }
        }
    }

    fn network_publication_handle(&self, registration_id: i64) -> Option<Handle> {
        self.network_publications
            .iter()
            .find(|(_, publication)| publication.registration_id == registration_id)
            .map(|(handle, _)| handle)
    }

    /// Spec §4.3 step 3 + "Match confirmation": for a non-exclusive add,
    /// reuse an existing active publication on this `(stream_id,
    /// endpoint)` if term length, MTU, and initial term id all match.
    fn find_shared_network_publication(
        &self,
        endpoint_handle: Handle,
        stream_id: i32,
        uri: &ChannelUri,
        term_length: u32,
        mtu: u32,
    ) -> Result<Option<(i64, i32)>, Error> {
        for (_, publication) in self.network_publications.iter() {
            if publication.channel_endpoint_handle == endpoint_handle && publication.stream_id == stream_id {
                let metadata = publication.log_buffer.metadata();
                let term_matches = metadata.term_length == term_length;
                let mtu_matches = metadata.mtu == mtu;
                let init_term_matches = uri
                    .init_term_id()?
                    .map(|requested| requested == metadata.initial_term_id)
                    .unwrap_or(true);
                if !(term_matches && mtu_matches && init_term_matches) {
                    return Err(Error::GenericControlProtocol(
                        "shared publication parameters do not match existing publication".into(),
                    ));
                }
                return Ok(Some((publication.registration_id, publication.session_id)));
            }
        }
        Ok(None)
    }

    fn get_or_create_send_endpoint(&mut self, canonical_channel: &str, tag: Option<&str>, _now_ns: u64) -> Result<Handle, Error> {
        // Tagged lookup takes precedence over canonical-form lookup
        // (spec §4.3 step 2, §4.5).
        if let Some(tag) = tag {
            if let Some((handle, _)) = self
                .send_endpoints
                .iter()
                .find(|(_, endpoint)| endpoint.tag.as_deref() == Some(tag))
            {
                return Ok(handle);
            }
        }
        if let Some(handle) = self.send_endpoints_by_channel.get(canonical_channel) {
            let endpoint = self.send_endpoints.get(*handle).expect("endpoint handle is valid");
            if tag.is_none() || endpoint.tag.as_deref() == tag {
                return Ok(*handle);
            }
        }
        let status_counter = self.counters.allocate(COUNTER_TYPE_SEND_STATUS, 0, 0, canonical_channel.as_bytes(), "send-channel-status")?;
        let local_address_counter =
            self.counters
                .allocate(COUNTER_TYPE_SEND_STATUS, 0, 0, canonical_channel.as_bytes(), "send-channel-local-address")?;
        let endpoint = SendChannelEndpoint::new(canonical_channel.to_string(), tag.map(String::from), status_counter, local_address_counter);
        let handle = self.send_endpoints.insert(endpoint);
        self.send_endpoints_by_channel.insert(canonical_channel.to_string(), handle);
        Ok(handle)
    }

    #[allow(clippy::too_many_arguments)]
    fn create_network_publication(
        &mut self,
        uri: &ChannelUri,
        endpoint_handle: Handle,
        stream_id: i32,
        canonical_channel: &str,
        term_length: u32,
        mtu: u32,
        now_ns: u64,
    ) -> Result<(i64, i32), Error> {
        let registration_id = self.next_correlation_id();
        let session_id = self.resolve_session_id(uri, stream_id, canonical_channel)?;
        let initial_term_id = uri.init_term_id()?.unwrap_or_else(|| rand::random());

        let metadata = LogMetadata {
            session_id,
            stream_id,
            initial_term_id,
            active_term_count: 0,
            mtu,
            term_length,
            page_size: 4096,
            correlation_id: registration_id,
            end_of_stream_position: i64::MAX,
            tail_positions: [initial_term_id as i64; 3],
        };
        let log_buffer = self.log_factory.create(registration_id, self.config.partition_count, term_length, metadata)?;

        let publisher_position = self.counters.allocate(COUNTER_TYPE_PUBLISHER_POSITION, 0, registration_id, &registration_id.to_le_bytes(), "pub-pos")?;
        let publisher_limit = self.counters.allocate(COUNTER_TYPE_PUBLISHER_LIMIT, 0, registration_id, &registration_id.to_le_bytes(), "pub-lim")?;
        let sender_position = self.counters.allocate(COUNTER_TYPE_SENDER_POSITION, 0, registration_id, &registration_id.to_le_bytes(), "snd-pos")?;
        let sender_limit = self.counters.allocate(COUNTER_TYPE_SENDER_LIMIT, 0, registration_id, &registration_id.to_le_bytes(), "snd-lim")?;
        let sender_bpe = self.counters.allocate(COUNTER_TYPE_SENDER_BPE, 0, registration_id, &registration_id.to_le_bytes(), "snd-bpe")?;

        let is_multicast = uri.group().unwrap_or(false);
        let flow_control = select_flow_control(is_multicast, 1);
        let retransmit_handler = RetransmitHandler::new(
            self.config.retransmit_linger_timeout.as_nanos() as u64,
            self.config.max_outstanding_retransmits,
        );

        let publication = NetworkPublication::new(
            registration_id,
            session_id,
            stream_id,
            canonical_channel.to_string(),
            endpoint_handle,
            log_buffer,
            publisher_position,
            publisher_limit,
            sender_position,
            sender_limit,
            sender_bpe,
            flow_control,
            retransmit_handler,
            self.config.publication_linger_timeout.as_nanos() as u64,
        );
        self.network_publications.insert(publication);
        if let Some(endpoint) = self.send_endpoints.get_mut(endpoint_handle) {
            endpoint.inc_ref();
        }
        self.session_allocator.insert(crate::session::SessionKey::new(session_id, stream_id, canonical_channel));
        let _ = now_ns;
        info!("created network publication registration_id={registration_id} session_id={session_id}");
        if let Some(handle) = self.network_publication_handle(registration_id) {
            self.link_new_publication_to_local_subscriptions(PublicationKind::Network, handle);
        }
        Ok((registration_id, session_id))
    }

    fn resolve_session_id(&mut self, uri: &ChannelUri, stream_id: i32, canonical_channel: &str) -> Result<i32, Error> {
        if let Some(explicit) = uri.session_id()? {
            let key = crate::session::SessionKey::new(explicit, stream_id, canonical_channel);
            if !self.session_allocator.reserve_explicit(key) {
                return Err(Error::InvalidChannel(format!("session id {explicit} already in use (session clash)")));
            }
            Ok(explicit)
        } else {
            Ok(self.session_allocator.allocate(stream_id, canonical_channel))
        }
    }

    fn add_ipc_publication(
        &mut self,
        uri: &ChannelUri,
        stream_id: i32,
        exclusive: bool,
        term_length: u32,
        now_ns: u64,
    ) -> Result<(i64, i32), Error> {
        if !exclusive {
            if let Some((_, publication)) = self
                .ipc_publications
                .iter()
                .find(|(_, publication)| publication.stream_id == stream_id)
            {
                return Ok((publication.registration_id, publication.session_id));
            }
        }

        let registration_id = self.next_correlation_id();
        let session_id = self.resolve_session_id(uri, stream_id, "ipc")?;
        let initial_term_id: i32 = rand::random();
        let metadata = LogMetadata {
            session_id,
            stream_id,
            initial_term_id,
            active_term_count: 0,
            mtu: self.config.default_mtu,
            term_length,
            page_size: 4096,
            correlation_id: registration_id,
            end_of_stream_position: i64::MAX,
            tail_positions: [initial_term_id as i64; 3],
        };
        let log_buffer = self.log_factory.create(registration_id, self.config.partition_count, term_length, metadata)?;
        let publisher_position = self.counters.allocate(COUNTER_TYPE_PUBLISHER_POSITION, 0, registration_id, &registration_id.to_le_bytes(), "ipc-pub-pos")?;
        let publisher_limit = self.counters.allocate(COUNTER_TYPE_PUBLISHER_LIMIT, 0, registration_id, &registration_id.to_le_bytes(), "ipc-pub-lim")?;

        let publication = IpcPublication::new(
            registration_id,
            session_id,
            stream_id,
            "ipc".to_string(),
            log_buffer,
            publisher_position,
            publisher_limit,
            self.config.publication_linger_timeout.as_nanos() as u64,
        );
        let handle = self.ipc_publications.insert(publication);
        self.session_allocator.insert(crate::session::SessionKey::new(session_id, stream_id, "ipc"));
        let _ = now_ns;
        self.link_new_publication_to_local_subscriptions(PublicationKind::Ipc, handle);
        Ok((registration_id, session_id))
    }

    fn link_publication(&mut self, correlation_id: i64, client_id: i64, client_handle: Handle, kind: PublicationKind, registration_id: i64) {
        let publication_handle = match kind {
            PublicationKind::Network => self.network_publication_handle(registration_id),
            PublicationKind::Ipc => self
                .ipc_publications
                .iter()
                .find(|(_, publication)| publication.registration_id == registration_id)
                .map(|(handle, _)| handle),
        };
        if let Some(publication_handle) = publication_handle {
            let link = PublicationLink::new(correlation_id, client_id, client_handle, kind, publication_handle);
            let link_handle = self.publication_links.insert(link);
            if let Some(client) = self.clients.get_mut(client_handle) {
                client.publication_links.push(link_handle);
            }
            // Exactly one incref per `PublicationLink`, for both kinds,
            // so `link_count` always equals the live link count (every
            // creation path — exclusive, newly-created shared, or
            // reused-shared — routes through here exactly once per
            // client).
            match kind {
                PublicationKind::Network => {
                    if let Some(publication) = self.network_publications.get_mut(publication_handle) {
                        publication.incref();
                    }
                }
                PublicationKind::Ipc => {
                    if let Some(publication) = self.ipc_publications.get_mut(publication_handle) {
                        publication.incref();
                    }
                }
            }
        }
    }

    fn remove_publication_link(&mut self, client_id: i64, registration_id: i64) -> Result<(), Error> {
        let link_handle = self
            .publication_links
            .iter()
            .find(|(_, link)| link.client_id == client_id && self.publication_registration_id(link.publication_kind, link.publication_handle) == Some(registration_id))
            .map(|(handle, _)| handle)
            .ok_or(Error::UnknownPublication(registration_id))?;
        self.release_publication_link(link_handle);
        Ok(())
    }

    /// Releases one `PublicationLink` and drops the corresponding
    /// reference on its publication. Shared by the explicit
    /// `RemovePublication` command and by a dying client releasing every
    /// link it owns (spec §4.7).
    pub(super) fn release_publication_link(&mut self, link_handle: Handle) {
        let link = match self.publication_links.get_mut(link_handle) {
            Some(link) => link,
            None => return,
        };
        let kind = link.publication_kind;
        let publication_handle = link.publication_handle;
        link.release();

        match kind {
            PublicationKind::Network => {
                if let Some(publication) = self.network_publications.get_mut(publication_handle) {
                    publication.decref();
                }
            }
            PublicationKind::Ipc => {
                if let Some(publication) = self.ipc_publications.get_mut(publication_handle) {
                    publication.decref();
                }
            }
        }
    }

    fn publication_registration_id(&self, kind: PublicationKind, handle: Handle) -> Option<i64> {
        match kind {
            PublicationKind::Network => self.network_publications.get(handle).map(|p| p.registration_id),
            PublicationKind::Ipc => self.ipc_publications.get(handle).map(|p| p.registration_id),
        }
    }

    // ---- Subscriptions & images (spec §4.4) -----------------------------

    fn add_subscription(&mut self, correlation_id: i64, client_id: i64, channel: &str, stream_id: i32, now_ns: u64) -> Result<(), Error> {
        self.add_subscription_internal(correlation_id, client_id, channel, stream_id, now_ns)?;
        Ok(())
    }

    /// Shared by `AddSubscription` and `AddRcvDestination` (spec §4.4,
    /// §4.6); returns the new subscription's registration id so the MDS
    /// anchor can record which child it just created.
    fn add_subscription_internal(&mut self, correlation_id: i64, client_id: i64, channel: &str, stream_id: i32, now_ns: u64) -> Result<i64, Error> {
        let uri = ChannelUri::parse(channel)?;
        uri.validate_no_receive_timestamp()?;
        uri.validate_as_subscription()?;
        let client_handle = self.ensure_client(client_id, now_ns, now_ns as i64)?;
        let registration_id = self.next_correlation_id();

        let (kind, channel_endpoint_handle, spy_channel) = match (uri.is_spy, uri.media) {
            (true, _) => (SubscriptionKind::Spy, None, Some(uri.canonical_form())),
            (false, Media::Ipc) => (SubscriptionKind::Ipc, None, None),
            (false, Media::Udp) => {
                let canonical_channel = uri.canonical_form();
                let handle = self.get_or_create_receive_endpoint(&canonical_channel, &uri)?;
                (SubscriptionKind::Network, Some(handle), None)
            }
        };

        let session_id_filter = uri.session_id()?;
        let mut link = SubscriptionLink::new(
            registration_id,
            kind,
            stream_id,
            session_id_filter,
            uri.is_reliable(true),
            uri.is_rejoin(true),
            uri.is_sparse(false),
            client_id,
            client_handle,
        );
        link.channel_endpoint_handle = channel_endpoint_handle;
        link.spy_channel = spy_channel;
        link.is_group = uri.group();
        link.supports_mds = uri.control_mode() == ControlMode::Manual;

        if let (SubscriptionKind::Network, Some(handle)) = (kind, channel_endpoint_handle) {
            let newly_active = if let Some(session_id) = session_id_filter {
                self.receive_endpoints
                    .get_mut(handle)
                    .map(|endpoint| endpoint.inc_ref_to_stream_and_session(stream_id, session_id))
                    .unwrap_or(false)
            } else {
                self.receive_endpoints
                    .get_mut(handle)
                    .map(|endpoint| endpoint.inc_ref_to_stream(stream_id))
                    .unwrap_or(false)
            };
            if newly_active {
                debug!("stream {stream_id} newly active on endpoint, would post AddSubscription to receiver");
            }
        }

        let subscription_handle = self.subscription_links.insert(link);
        if let Some(client) = self.clients.get_mut(client_handle) {
            client.subscription_links.push(subscription_handle);
        }

        self.emit(client_id, DriverResponse::SubscriptionReady { correlation_id, registration_id });

        self.link_matching_images(subscription_handle, now_ns);
        Ok(registration_id)
    }

    fn get_or_create_receive_endpoint(&mut self, canonical_channel: &str, uri: &ChannelUri) -> Result<Handle, Error> {
        let reliable = uri.is_reliable(true);
        let rejoin = uri.is_rejoin(true);
        let socket_rcvbuf = uri.socket_rcvbuf()?;
        let socket_sndbuf = uri.socket_sndbuf()?;

        if let Some(handle) = self.receive_endpoints_by_channel.get(canonical_channel) {
            let handle = *handle;
            if let Some(endpoint) = self.receive_endpoints.get(handle) {
                endpoint.validate_compatible(reliable, rejoin, socket_rcvbuf, socket_sndbuf)?;
            }
            return Ok(handle);
        }
        let status_counter = self.counters.allocate(COUNTER_TYPE_RECEIVE_STATUS, 0, 0, canonical_channel.as_bytes(), "recv-channel-status")?;
        let local_address_counter =
            self.counters
                .allocate(COUNTER_TYPE_RECEIVE_STATUS, 0, 0, canonical_channel.as_bytes(), "recv-channel-local-address")?;
        let endpoint = ReceiveChannelEndpoint::new(
            canonical_channel.to_string(),
            status_counter,
            local_address_counter,
            reliable,
            rejoin,
            socket_rcvbuf,
            socket_sndbuf,
        );
        let handle = self.receive_endpoints.insert(endpoint);
        self.receive_endpoints_by_channel.insert(canonical_channel.to_string(), handle);
        Ok(handle)
    }

    /// Spec §4.4 step 6: a Network subscription matches against received
    /// images; an IPC or Spy subscription matches directly against
    /// `ipc_publications` or `network_publications` respectively, since
    /// there is no received image for local traffic.
    fn link_matching_images(&mut self, subscription_handle: Handle, _now_ns: u64) {
        let kind = match self.subscription_links.get(subscription_handle) {
            Some(link) => link.kind,
            None => return,
        };
        match kind {
            SubscriptionKind::Network => self.link_matching_network_images(subscription_handle),
            SubscriptionKind::Ipc => self.link_matching_ipc_publications(subscription_handle),
            SubscriptionKind::Spy => self.link_matching_spy_publications(subscription_handle),
        }
    }

    fn link_matching_network_images(&mut self, subscription_handle: Handle) {
        let image_handles: Vec<Handle> = {
            let link = match self.subscription_links.get(subscription_handle) {
                Some(link) => link,
                None => return,
            };
            self.publication_images
                .iter()
                .filter(|(_, image)| {
                    link.channel_endpoint_handle.map(|h| h == image.channel_endpoint_handle).unwrap_or(true)
                        && link.matches(image.stream_id, image.session_id)
                })
                .map(|(handle, _)| handle)
                .collect()
        };

        for image_handle in image_handles {
            self.link_one_image(subscription_handle, image_handle);
        }
    }

    fn link_matching_ipc_publications(&mut self, subscription_handle: Handle) {
        let (stream_id, session_filter) = match self.subscription_links.get(subscription_handle) {
            Some(link) => (link.stream_id, link.session_id_filter),
            None => return,
        };
        let handles: Vec<Handle> = self
            .ipc_publications
            .iter()
            .filter(|(_, publication)| {
                publication.stream_id == stream_id && session_filter.map(|s| s == publication.session_id).unwrap_or(true)
            })
            .map(|(handle, _)| handle)
            .collect();
        for publication_handle in handles {
            self.link_one_local(subscription_handle, PublicationKind::Ipc, publication_handle);
        }
    }

    fn link_matching_spy_publications(&mut self, subscription_handle: Handle) {
        let (stream_id, session_filter, channel) = match self.subscription_links.get(subscription_handle) {
            Some(link) => (link.stream_id, link.session_id_filter, link.spy_channel.clone()),
            None => return,
        };
        let channel = match channel {
            Some(channel) => channel,
            None => return,
        };
        let handles: Vec<Handle> = self
            .network_publications
            .iter()
            .filter(|(_, publication)| {
                publication.canonical_channel == channel
                    && publication.stream_id == stream_id
                    && session_filter.map(|s| s == publication.session_id).unwrap_or(true)
            })
            .map(|(handle, _)| handle)
            .collect();
        for publication_handle in handles {
            self.link_one_local(subscription_handle, PublicationKind::Network, publication_handle);
        }
    }

    /// Spec §4.3 step 10: a newly created (not shared) IPC or Network
    /// publication is linked against any already-registered IPC/Spy
    /// subscriptions that match it, same as a subscription created after
    /// the publication links against it in [`Conductor::link_matching_images`].
    fn link_new_publication_to_local_subscriptions(&mut self, kind: PublicationKind, publication_handle: Handle) {
        let (stream_id, session_id, spy_channel) = match kind {
            PublicationKind::Ipc => match self.ipc_publications.get(publication_handle) {
                Some(publication) => (publication.stream_id, publication.session_id, None),
                None => return,
            },
            PublicationKind::Network => match self.network_publications.get(publication_handle) {
                Some(publication) => (publication.stream_id, publication.session_id, Some(publication.canonical_channel.clone())),
                None => return,
            },
        };
        let target_kind = match kind {
            PublicationKind::Ipc => SubscriptionKind::Ipc,
            PublicationKind::Network => SubscriptionKind::Spy,
        };
        let matching: Vec<Handle> = self
            .subscription_links
            .iter()
            .filter(|(_, link)| {
                link.kind == target_kind
                    && link.stream_id == stream_id
                    && link.session_id_filter.map(|s| s == session_id).unwrap_or(true)
                    && (target_kind != SubscriptionKind::Spy || link.spy_channel == spy_channel)
            })
            .map(|(handle, _)| handle)
            .collect();
        for subscription_handle in matching {
            self.link_one_local(subscription_handle, kind, publication_handle);
        }
    }

    /// Links one IPC/Spy subscription directly to one IPC/Network
    /// publication, allocating its subscriber-position counter and
    /// emitting `AvailableImage` (spec §4.4 step 6).
    pub(super) fn link_one_local(&mut self, subscription_handle: Handle, kind: PublicationKind, publication_handle: Handle) {
        let (session_id, registration_id, join_position) = match kind {
            PublicationKind::Ipc => match self.ipc_publications.get(publication_handle) {
                Some(publication) => (publication.session_id, publication.registration_id, publication.publisher_position.get()),
                None => return,
            },
            PublicationKind::Network => match self.network_publications.get(publication_handle) {
                Some(publication) => (publication.session_id, publication.registration_id, publication.publisher_position.get()),
                None => return,
            },
        };

        let subscriber_position_counter = match self.counters.allocate(
            COUNTER_TYPE_SUBSCRIBER_POSITION,
            0,
            registration_id,
            &registration_id.to_le_bytes(),
            "sub-pos-local",
        ) {
            Ok(counter) => counter,
            Err(_) => return,
        };
        subscriber_position_counter.set(join_position);

        let (client_id, sub_registration_id) = match self.subscription_links.get_mut(subscription_handle) {
            Some(link) => {
                link.link_local(kind, publication_handle, subscriber_position_counter);
                (link.client_id, link.registration_id)
            }
            None => return,
        };

        self.emit(
            client_id,
            DriverResponse::AvailableImage {
                correlation_id: sub_registration_id,
                subscription_registration_id: sub_registration_id,
                session_id,
                log_file: format!("{registration_id}.logbuffer"),
            },
        );
    }

    pub(super) fn link_one_image(&mut self, subscription_handle: Handle, image_handle: Handle) {
        let (session_id, registration_id, log_file) = match self.publication_images.get(image_handle) {
            Some(image) => (image.session_id, image.correlation_id, format!("{}.logbuffer", image.correlation_id)),
            None => return,
        };
        let join_position = self
            .publication_images
            .get(image_handle)
            .map(|image| image.receiver_position.get())
            .unwrap_or(0);

        let subscriber_position_counter = match self.counters.allocate(
            COUNTER_TYPE_SUBSCRIBER_POSITION,
            0,
            registration_id,
            &registration_id.to_le_bytes(),
            "sub-pos",
        ) {
            Ok(counter) => counter,
            Err(_) => return,
        };
        subscriber_position_counter.set(join_position);

        let (client_id, sub_registration_id) = match self.subscription_links.get_mut(subscription_handle) {
            Some(link) => {
                link.link_image(image_handle, subscriber_position_counter);
                (link.client_id, link.registration_id)
            }
            None => return,
        };

        if let Some(image) = self.publication_images.get_mut(image_handle) {
            image.attach_subscriber();
        }

        self.emit(
            client_id,
            DriverResponse::AvailableImage {
                correlation_id: sub_registration_id,
                subscription_registration_id: sub_registration_id,
                session_id,
                log_file,
            },
        );
    }

    fn remove_subscription(&mut self, client_id: i64, registration_id: i64) -> Result<(), Error> {
        let handle = self.subscription_link_handle(registration_id).ok_or(Error::UnknownSubscription(registration_id))?;
        if self.subscription_links.get(handle).map(|link| link.client_id) != Some(client_id) {
            return Err(Error::UnknownSubscription(registration_id));
        }
        self.release_subscription(handle);
        Ok(())
    }

    fn subscription_link_handle(&self, registration_id: i64) -> Option<Handle> {
        self.subscription_links
            .iter()
            .find(|(_, link)| link.registration_id == registration_id)
            .map(|(handle, _)| handle)
    }

    /// Releases a subscription's position counters and images (spec §4.4
    /// step 5 reversed, S4: "releases its subscriber-position counter and
    /// emits no further notifications about the image").
    fn release_subscription(&mut self, handle: Handle) {
        let images: Vec<Handle> = self
            .subscription_links
            .get(handle)
            .map(|link| link.images.iter().map(|i| i.image_handle).collect())
            .unwrap_or_default();

        for image_handle in images {
            if let Some(link) = self.subscription_links.get_mut(handle) {
                if let Some(image_link) = link.unlink_image(image_handle) {
                    let _ = self.counters.free(&image_link.subscriber_position);
                }
            }
            if let Some(image) = self.publication_images.get_mut(image_handle) {
                image.detach_subscriber();
            }
        }

        let local_links: Vec<(PublicationKind, Handle)> = self
            .subscription_links
            .get(handle)
            .map(|link| link.local_links.iter().map(|l| (l.publication_kind, l.publication_handle)).collect())
            .unwrap_or_default();

        for (kind, publication_handle) in local_links {
            if let Some(link) = self.subscription_links.get_mut(handle) {
                if let Some(local_link) = link.unlink_local(kind, publication_handle) {
                    let _ = self.counters.free(&local_link.subscriber_position);
                }
            }
        }

        if let Some(link) = self.subscription_links.get_mut(handle) {
            if let (Some(endpoint_handle), SubscriptionKind::Network) = (link.channel_endpoint_handle, link.kind) {
                let stream_id = link.stream_id;
                let session_filter = link.session_id_filter;
                if let Some(endpoint) = self.receive_endpoints.get_mut(endpoint_handle) {
                    match session_filter {
                        Some(session_id) => endpoint.dec_ref_to_stream_and_session(stream_id, session_id),
                        None => endpoint.dec_ref_to_stream(stream_id),
                    }
                }
            }
            link.release();
        }
    }

    // ---- Counters (spec §4.2 AddCounter/RemoveCounter) ------------------

    fn add_counter(
        &mut self,
        correlation_id: i64,
        client_id: i64,
        type_id: i32,
        key_bytes: &[u8],
        label: &str,
        now_ns: u64,
        now_ms: i64,
    ) -> Result<(), Error> {
        let client_handle = self.ensure_client(client_id, now_ns, now_ms)?;
        let registration_id = self.next_correlation_id();
        let counter = self.counters.allocate(type_id, client_id, registration_id, key_bytes, label)?;
        let link = CounterLink::new(registration_id, client_id, counter);
        let link_handle = self.counter_links.insert(link);
        if let Some(client) = self.clients.get_mut(client_handle) {
            client.counter_links.push(link_handle);
        }
        self.emit(client_id, DriverResponse::CounterReady { correlation_id, registration_id });
        Ok(())
    }

    fn remove_counter(&mut self, correlation_id: i64, client_id: i64, registration_id: i64) -> Result<(), Error> {
        let handle = self
            .counter_links
            .iter()
            .find(|(_, link)| link.client_id == client_id && link.registration_id == registration_id)
            .map(|(handle, _)| handle)
            .ok_or(Error::UnknownCounter(registration_id))?;
        if let Some(link) = self.counter_links.get_mut(handle) {
            link.release();
        }
        self.emit(client_id, DriverResponse::OperationSucceeded { correlation_id });
        Ok(())
    }

    // ---- Destinations (spec §4.6) ---------------------------------------

    fn add_destination(&mut self, correlation_id: i64, client_id: i64, registration_id: i64, channel: &str) -> Result<(), Error> {
        if self.network_publication_handle(registration_id).is_none() {
            return Err(Error::UnknownPublication(registration_id));
        }
        let destinations = self.send_destinations.entry(registration_id).or_insert_with(ManualSendDestinations::new);
        destinations.add(correlation_id, channel, channel.to_string())?;
        self.emit(client_id, DriverResponse::OperationSucceeded { correlation_id });
        Ok(())
    }

    fn remove_destination(&mut self, correlation_id: i64, client_id: i64, registration_id: i64, channel: &str) -> Result<(), Error> {
        let destinations = self
            .send_destinations
            .get_mut(&registration_id)
            .ok_or(Error::UnknownPublication(registration_id))?;
        destinations.remove(channel).ok_or_else(|| Error::InvalidChannel("destination not found".into()))?;
        self.emit(client_id, DriverResponse::OperationSucceeded { correlation_id });
        Ok(())
    }

    fn add_rcv_destination(
        &mut self,
        correlation_id: i64,
        client_id: i64,
        anchor_registration_id: i64,
        channel: &str,
        now_ns: u64,
    ) -> Result<(), Error> {
        let anchor_handle = self
            .subscription_link_handle(anchor_registration_id)
            .ok_or(Error::UnknownSubscription(anchor_registration_id))?;
        // The MDS child must match on the anchor's own stream (spec
        // §4.4 step 5 matches on `(endpoint, stream_id, [session_id])`),
        // not an unrelated stream 0.
        let anchor_stream_id = self
            .subscription_links
            .get(anchor_handle)
            .ok_or(Error::UnknownSubscription(anchor_registration_id))?
            .stream_id;

        let uri = ChannelUri::parse(channel)?;
        let canonical_channel = uri.canonical_form();
        let kind = if uri.is_spy {
            ReceiveDestinationKind::Spy
        } else if uri.media == Media::Ipc {
            ReceiveDestinationKind::Ipc
        } else {
            ReceiveDestinationKind::Network
        };

        let child_registration_id = self.add_subscription_internal(correlation_id, client_id, channel, anchor_stream_id, now_ns)?;
        if let Some(child_handle) = self.subscription_link_handle(child_registration_id) {
            let anchor = self.receive_destinations.entry(anchor_registration_id).or_insert_with(ManualReceiveDestinations::new);
            anchor.add_child(child_handle, kind, canonical_channel);
        }
        Ok(())
    }

    fn remove_rcv_destination(
        &mut self,
        correlation_id: i64,
        client_id: i64,
        anchor_registration_id: i64,
        channel: &str,
    ) -> Result<(), Error> {
        let uri = ChannelUri::parse(channel)?;
        let canonical_channel = uri.canonical_form();
        let anchor = self
            .receive_destinations
            .get_mut(&anchor_registration_id)
            .ok_or(Error::UnknownSubscription(anchor_registration_id))?;
        // Spec §4.6: "Removing an IPC/Spy destination removes exactly
        // that sub-subscription" — find the child the client actually
        // named rather than an arbitrary one.
        let child_handle = anchor
            .find_by_channel(&canonical_channel)
            .ok_or_else(|| Error::InvalidChannel("destination not found".into()))?;
        anchor.remove_child(child_handle);
        self.release_subscription(child_handle);
        self.emit(client_id, DriverResponse::OperationSucceeded { correlation_id });
        Ok(())
    }

    // ---- Termination ------------------------------------------------------

    fn terminate_driver(&mut self, token: &[u8]) -> Result<(), Error> {
        // The termination token validator is supplied by the process
        // bootstrap (out of scope, spec §5 "externally supplied
        // validator"); here any non-empty token authorizes termination.
        if token.is_empty() {
            return Err(Error::GenericControlProtocol("termination token rejected".into()));
        }
        self.terminate_requested = true;
        self.terminated = true;
        info!("driver termination requested and authorized");
        Ok(())
    }
}

fn command_identity(command: &ClientCommand) -> (i64, i64) {
    match command {
        ClientCommand::AddPublication { client_id, correlation_id, .. }
        | ClientCommand::RemovePublication { client_id, correlation_id, .. }
        | ClientCommand::AddSubscription { client_id, correlation_id, .. }
        | ClientCommand::RemoveSubscription { client_id, correlation_id, .. }
        | ClientCommand::AddDestination { client_id, correlation_id, .. }
        | ClientCommand::RemoveDestination { client_id, correlation_id, .. }
        | ClientCommand::AddRcvDestination { client_id, correlation_id, .. }
        | ClientCommand::RemoveRcvDestination { client_id, correlation_id, .. }
        | ClientCommand::AddCounter { client_id, correlation_id, .. }
        | ClientCommand::RemoveCounter { client_id, correlation_id, .. } => (*client_id, *correlation_id),
        ClientCommand::ClientKeepalive { client_id } | ClientCommand::ClientClose { client_id } => (*client_id, 0),
        ClientCommand::TerminateDriver { client_id, .. } => (*client_id, 0),
    }
}
