//! Internal-queue command handling (spec §4.1 step 3, §9 "Cross-agent
//! callbacks via proxy objects posting closures") and image creation
//! (spec §4.4 "Creating an image (called by the receiver when a new
//! publisher is first seen)").

use log::{info, warn};

use super::Conductor;
use crate::entities::{PublicationImage, SubscriptionKind};
use crate::flow_control::select_congestion_control;
use crate::log_buffer::LogMetadata;
use crate::proxies::DriverCommand;
use crate::registry::Handle;

use super::dispatcher::{COUNTER_TYPE_RECEIVER_HWM, COUNTER_TYPE_RECEIVER_POSITION};

impl Conductor {
    /// Drains one closure posted by the sender/receiver (spec §5
    /// "Internal driver command queue"). Dispatch here never re-enters
    /// client command handling; it runs strictly after the tick's
    /// client-command poll has been scheduled for the *next* tick.
    pub(super) fn handle_internal_command(&mut self, command: DriverCommand, now_ns: u64) {
        match command {
            DriverCommand::CreateImage {
                channel_endpoint_handle,
                session_id,
                stream_id,
                correlation_id,
                initial_term_id,
                active_term_id,
                term_offset,
            } => self.create_image(
                channel_endpoint_handle,
                session_id,
                stream_id,
                correlation_id,
                initial_term_id,
                active_term_id,
                term_offset,
                now_ns,
            ),
            DriverCommand::ChannelEndpointError { channel_endpoint_handle, message } => {
                self.on_channel_endpoint_error(channel_endpoint_handle, message);
            }
            DriverCommand::ReResolveEndpoint { channel_endpoint_handle, resolved_address } => {
                self.on_re_resolve_send_endpoint(channel_endpoint_handle, resolved_address);
            }
            DriverCommand::ReResolveControl { channel_endpoint_handle, resolved_address } => {
                self.on_re_resolve_receive_endpoint(channel_endpoint_handle, resolved_address);
            }
        }
    }

    /// Spec §4.4 "Creating an image", steps 2-7. The MTU/window
    /// validation of step 1 is the receiver's responsibility before it
    /// ever posts this command; by the time it reaches the conductor
    /// thread the only remaining work is allocation and subscriber
    /// linking.
    #[allow(clippy::too_many_arguments)]
    fn create_image(
        &mut self,
        channel_endpoint_handle: Handle,
        session_id: i32,
        stream_id: i32,
        correlation_id: i64,
        initial_term_id: i32,
        active_term_id: i32,
        term_offset: u32,
        now_ns: u64,
    ) {
        if self.receive_endpoints.get(channel_endpoint_handle).is_none() {
            warn!("create_image: channel endpoint {channel_endpoint_handle} no longer exists");
            return;
        }

        // Step 3: build the subscriber list up front; an image superseded
        // before the receiver's notification landed has no subscribers
        // left to serve, so the creation is dropped (spec §4.4 step 3).
        let matching_subscriptions: Vec<Handle> = self
            .subscription_links
            .iter()
            .filter(|(_, link)| {
                link.kind == SubscriptionKind::Network
                    && link.channel_endpoint_handle == Some(channel_endpoint_handle)
                    && link.matches(stream_id, session_id)
            })
            .map(|(handle, _)| handle)
            .collect();

        if matching_subscriptions.is_empty() {
            info!("create_image: no matching subscriptions for stream={stream_id} session={session_id}, dropping");
            return;
        }

        // Step 5: "oldest" subscriber is the smallest registration_id
        // (spec §9 open question, preserved as observed).
        let is_sparse = matching_subscriptions
            .iter()
            .filter_map(|handle| self.subscription_links.get(*handle))
            .min_by_key(|link| link.registration_id)
            .map(|link| link.is_sparse)
            .unwrap_or(false);

        // Group-inferable rule (spec §9 open question): INFER resolves to
        // the first matching transport's multicast-ness, fixed at image
        // creation time and never revisited for later MDS destinations.
        let is_multicast = matching_subscriptions
            .iter()
            .filter_map(|handle| self.subscription_links.get(*handle))
            .find_map(|link| link.is_group)
            .unwrap_or(false);

        let term_length = self.config.default_term_length;
        let join_position = join_position(initial_term_id, active_term_id, term_offset, term_length);

        let result = self.allocate_image(
            channel_endpoint_handle,
            session_id,
            stream_id,
            correlation_id,
            initial_term_id,
            term_length,
            is_sparse,
            is_multicast,
            join_position,
            now_ns,
        );

        let image_handle = match result {
            Ok(handle) => handle,
            Err(err) => {
                warn!("create_image: failed to allocate image resources: {err}");
                return;
            }
        };

        if let Some(endpoint) = self.receive_endpoints.get_mut(channel_endpoint_handle) {
            endpoint.inc_image_ref();
        }

        for subscription_handle in matching_subscriptions {
            self.link_one_image(subscription_handle, image_handle);
        }
    }

    /// Allocates the image's log buffer, HWM/position counters, and
    /// congestion-control strategy (spec §4.4 step 4). On any failure,
    /// releases whatever was already allocated before propagating, per
    /// spec §4.4 step 7 / §7 "Failures during creation ... must free any
    /// partially acquired resource before surfacing."
    #[allow(clippy::too_many_arguments)]
    fn allocate_image(
        &mut self,
        channel_endpoint_handle: Handle,
        session_id: i32,
        stream_id: i32,
        correlation_id: i64,
        initial_term_id: i32,
        term_length: u32,
        is_sparse: bool,
        is_multicast: bool,
        join_position: i64,
        _now_ns: u64,
    ) -> Result<Handle, crate::error::Error> {
        let metadata = LogMetadata {
            session_id,
            stream_id,
            initial_term_id,
            active_term_count: 0,
            mtu: self.config.default_mtu,
            term_length,
            page_size: 4096,
            correlation_id,
            end_of_stream_position: i64::MAX,
            tail_positions: [initial_term_id as i64; 3],
        };
        let log_buffer = self
            .log_factory
            .create(correlation_id, self.config.partition_count, term_length, metadata)?;

        let receiver_hwm = match self.counters.allocate(
            COUNTER_TYPE_RECEIVER_HWM,
            0,
            correlation_id,
            &correlation_id.to_le_bytes(),
            "rcv-hwm",
        ) {
            Ok(counter) => counter,
            Err(err) => {
                let _ = self.log_factory.delete(correlation_id, self.config.partition_count);
                return Err(err);
            }
        };

        let receiver_position = match self.counters.allocate(
            COUNTER_TYPE_RECEIVER_POSITION,
            0,
            correlation_id,
            &correlation_id.to_le_bytes(),
            "rcv-pos",
        ) {
            Ok(counter) => counter,
            Err(err) => {
                let _ = self.counters.free(&receiver_hwm);
                let _ = self.log_factory.delete(correlation_id, self.config.partition_count);
                return Err(err);
            }
        };

        receiver_hwm.set(join_position);
        receiver_position.set(join_position);

        let congestion_control = select_congestion_control(is_multicast);
        let image = PublicationImage::new(
            correlation_id,
            channel_endpoint_handle,
            session_id,
            stream_id,
            log_buffer,
            receiver_hwm,
            receiver_position,
            congestion_control,
            is_sparse,
            self.config.image_linger_timeout.as_nanos() as u64,
        );
        Ok(self.publication_images.insert(image))
    }

    fn on_channel_endpoint_error(&mut self, channel_endpoint_handle: Handle, message: String) {
        warn!("channel endpoint error on handle {channel_endpoint_handle}: {message}");
        if let Some(endpoint) = self.send_endpoints.get_mut(channel_endpoint_handle) {
            endpoint.status_counter.set(-1);
        }
        if let Some(endpoint) = self.receive_endpoints.get_mut(channel_endpoint_handle) {
            if let Some(status) = &endpoint.status_counter {
                status.set(-1);
            }
        }
        self.error_count += 1;
    }

    /// Spec R2: re-resolving to an unchanged address is a no-op; a
    /// changed address is recorded (posting to the sender is out of
    /// scope for the conductor's own responsibilities here, since the
    /// sender owns the socket).
    fn on_re_resolve_send_endpoint(&mut self, handle: Handle, resolved_address: String) {
        if let Some(endpoint) = self.send_endpoints.get_mut(handle) {
            if endpoint.resolved_address.as_deref() != Some(resolved_address.as_str()) {
                info!("send endpoint {handle} re-resolved to {resolved_address}");
                endpoint.resolved_address = Some(resolved_address);
            }
        }
    }

    fn on_re_resolve_receive_endpoint(&mut self, handle: Handle, resolved_address: String) {
        if let Some(endpoint) = self.receive_endpoints.get_mut(handle) {
            if endpoint.resolved_address.as_deref() != Some(resolved_address.as_str()) {
                info!("receive endpoint {handle} re-resolved to {resolved_address}");
                endpoint.resolved_address = Some(resolved_address);
            }
        }
    }
}

fn join_position(initial_term_id: i32, active_term_id: i32, term_offset: u32, term_length: u32) -> i64 {
    let term_count = active_term_id.wrapping_sub(initial_term_id) as i64;
    term_count * term_length as i64 + term_offset as i64
}
