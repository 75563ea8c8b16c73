/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
The client's protocol state: a sans-I/O model of one MQTT session.

Nothing in here touches a socket or a clock.  The owning client feeds in network events, user
requests and the current time, and pulls out bytes to write, the next time it wants to be
serviced, and a queue of events for the user.
 */

use crate::alias::{InboundAliasResolver, OutboundAliasResolution, OutboundAliasResolver};
use crate::config::*;
use crate::decode::Decoder;
use crate::encode::{encode_packet_with_context, EncodingContext};
use crate::error::{MqttifyError, MqttifyResult};
use crate::logging::log_packet;
use crate::mqtt::*;
use crate::qos::*;
use crate::subscription::*;
use crate::validate::*;

use log::*;
use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

/// Largest packet, in bytes, the MQTT wire format can express
pub(crate) const MAXIMUM_PACKET_SIZE : u32 = 268_435_460;

/// Connection properties that result from combining the client's CONNECT with the broker's
/// CONNACK.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NegotiatedSettings {

    /// The maximum QoS the broker accepts on publishes from this client.
    pub maximum_qos : QualityOfService,

    /// The amount of time in seconds the server will retain the session after a disconnect.
    pub session_expiry_interval : u32,

    /// The number of QoS 1 and QoS 2 publications the server is willing to process concurrently.
    pub receive_maximum_from_server : u16,

    /// The maximum packet size the server is willing to accept.
    pub maximum_packet_size_to_server : u32,

    /// The highest value that the server will accept as a Topic Alias sent by the client.
    pub topic_alias_maximum_to_server : u16,

    /// The amount of time in seconds before the server will disconnect the client for inactivity.
    pub server_keep_alive : u16,

    /// Whether or not the server supports retained messages.
    pub retain_available : bool,

    /// Whether or not the server supports wildcard subscriptions.
    pub wildcard_subscriptions_available : bool,

    /// Whether or not the server supports subscription identifiers.
    pub subscription_identifiers_available : bool,

    /// Whether or not the server supports shared subscriptions.
    pub shared_subscriptions_available : bool,

    /// Whether or not the client has rejoined an existing session.
    pub rejoined_session : bool,

    /// Client id in use for the current connection
    pub client_id : String,
}

impl Default for NegotiatedSettings {

    /// The most permissive settings a broker can grant
    fn default() -> Self {
        NegotiatedSettings {
            maximum_qos: QualityOfService::ExactlyOnce,
            session_expiry_interval: 0,
            receive_maximum_from_server: 65535,
            maximum_packet_size_to_server: MAXIMUM_PACKET_SIZE,
            topic_alias_maximum_to_server: 0,
            server_keep_alive: 0,
            retain_available: true,
            wildcard_subscriptions_available: true,
            subscription_identifiers_available: true,
            shared_subscriptions_available: true,
            rejoined_session: false,
            client_id: String::new(),
        }
    }
}

impl fmt::Display for NegotiatedSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "NegotiatedSettings {{")?;
        writeln!(f, "  maximum_qos: {:?}", self.maximum_qos)?;
        writeln!(f, "  session_expiry_interval: {}", self.session_expiry_interval)?;
        writeln!(f, "  receive_maximum_from_server: {}", self.receive_maximum_from_server)?;
        writeln!(f, "  maximum_packet_size_to_server: {}", self.maximum_packet_size_to_server)?;
        writeln!(f, "  topic_alias_maximum_to_server: {}", self.topic_alias_maximum_to_server)?;
        writeln!(f, "  server_keep_alive: {}", self.server_keep_alive)?;
        writeln!(f, "  retain_available: {}", self.retain_available)?;
        writeln!(f, "  wildcard_subscriptions_available: {}", self.wildcard_subscriptions_available)?;
        writeln!(f, "  subscription_identifiers_available: {}", self.subscription_identifiers_available)?;
        writeln!(f, "  shared_subscriptions_available: {}", self.shared_subscriptions_available)?;
        writeln!(f, "  rejoined_session: {}", self.rejoined_session)?;
        writeln!(f, "  client_id: {}", self.client_id)?;
        write!(f, "}}")
    }
}

// Things that happened inside the protocol state that the client needs to react to or surface.
pub(crate) enum ProtocolEvent {
    ConnectionSuccess {
        connack: ConnackPacket,
        settings: NegotiatedSettings,
    },

    // always followed by an error result from the call that received it
    ConnackRejected(ConnackPacket),

    SessionReset {
        abandoned_operations: Vec<u64>,
    },

    ServerDisconnect(DisconnectPacket),

    MessageReceived {
        publish: PublishPacket,
        handlers: Vec<MessageHandler>,
    },

    PublishComplete {
        operation_id: u64,
        result: MqttifyResult<PublishResponse>,
    },

    SubscribeComplete {
        operation_id: u64,
        result: MqttifyResult<SubackPacket>,
    },

    UnsubscribeComplete {
        operation_id: u64,
        result: MqttifyResult<UnsubackPacket>,
    },
}

impl fmt::Debug for ProtocolEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolEvent::ConnectionSuccess { connack, .. } => { write!(f, "ConnectionSuccess ( {} )", connack) }
            ProtocolEvent::ConnackRejected(connack) => { write!(f, "ConnackRejected ( {} )", connack) }
            ProtocolEvent::SessionReset { abandoned_operations } => { write!(f, "SessionReset ( {:?} )", abandoned_operations) }
            ProtocolEvent::ServerDisconnect(disconnect) => { write!(f, "ServerDisconnect ( {} )", disconnect) }
            ProtocolEvent::MessageReceived { publish, handlers } => { write!(f, "MessageReceived ( {}, {} handlers )", publish, handlers.len()) }
            ProtocolEvent::PublishComplete { operation_id, result } => { write!(f, "PublishComplete ( {}, {:?} )", operation_id, result) }
            ProtocolEvent::SubscribeComplete { operation_id, result } => { write!(f, "SubscribeComplete ( {}, {:?} )", operation_id, result) }
            ProtocolEvent::UnsubscribeComplete { operation_id, result } => { write!(f, "UnsubscribeComplete ( {}, {:?} )", operation_id, result) }
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) enum ProtocolStateType {
    Disconnected,
    PendingConnack,
    Connected,
    PendingDisconnect,
    Halted
}

impl fmt::Display for ProtocolStateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolStateType::Disconnected => { write!(f, "Disconnected") }
            ProtocolStateType::PendingConnack => { write!(f, "PendingConnack") }
            ProtocolStateType::Connected => { write!(f, "Connected") }
            ProtocolStateType::PendingDisconnect => { write!(f, "PendingDisconnect") }
            ProtocolStateType::Halted => { write!(f, "Halted") }
        }
    }
}

pub(crate) struct ProtocolStateConfig {
    pub(crate) connect_options: ConnectOptions,

    pub(crate) client_options: ClientOptions,

    pub(crate) base_timestamp: Instant,
}

// The client's protocol state is completely uncoupled from networking data types.  We offer
// a simple interface that models and handles all relevant events.
pub(crate) enum NetworkEvent<'a> {
    ConnectionOpened,
    ConnectionClosed,
    IncomingData(&'a [u8]),
}

pub(crate) struct NetworkEventContext<'a> {
    pub(crate) event: NetworkEvent<'a>,
    pub(crate) current_time: Instant,
}

pub(crate) enum UserEvent {
    Publish(PublishPacket),
    Subscribe(SubscribePacket, Option<MessageHandler>),
    Unsubscribe(UnsubscribePacket),
    Disconnect(DisconnectPacket),
}

pub(crate) struct UserEventContext {
    pub(crate) event: UserEvent,
    pub(crate) current_time: Instant,
}

pub(crate) struct ServiceContext<'a> {
    // output field for all data that should be written to the socket
    pub(crate) to_socket: &'a mut Vec<u8>,
    pub(crate) current_time: Instant,
}

pub(crate) struct ProtocolState {
    config: ProtocolStateConfig,
    protocol_version: ProtocolVersion,

    state: ProtocolStateType,
    current_time: Instant,
    elapsed_time_ms: u128,

    next_operation_id: u64,

    qos: QosTracker,
    subscriptions: SubscriptionRegistry,

    // connect, acks, pings, auth
    high_priority_queue: VecDeque<MqttPacket>,

    qos0_queue: VecDeque<(u64, PublishPacket)>,

    pending_disconnect: Option<DisconnectPacket>,

    decoder: Decoder,
    inbound_alias_resolver: InboundAliasResolver,
    outbound_alias_resolver: Box<dyn OutboundAliasResolver>,

    current_connect: Option<ConnectPacket>,
    current_settings: Option<NegotiatedSettings>,
    last_client_id: Option<String>,
    has_connected_successfully: bool,

    connack_timeout_timepoint: Option<Instant>,
    next_ping_timepoint: Option<Instant>,
    ping_timeout_timepoint: Option<Instant>,

    events: VecDeque<ProtocolEvent>,
}

impl fmt::Display for ProtocolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProtocolState {{ state: {}, in_flight: {}, subscriptions: {}, high_priority_queue: {}, qos0_queue: {}, has_connected_successfully: {} }}",
            self.state,
            self.qos.in_flight_count(),
            self.subscriptions.len(),
            self.high_priority_queue.len(),
            self.qos0_queue.len(),
            self.has_connected_successfully)
    }
}

impl ProtocolState {

    // Crate-public API

    pub(crate) fn new(config: ProtocolStateConfig) -> ProtocolState {
        let protocol_version = config.client_options.protocol_version;
        let outbound_alias_resolver = config.client_options.create_outbound_alias_resolver();
        let inbound_alias_resolver = InboundAliasResolver::new(config.connect_options.topic_alias_maximum.unwrap_or(0));
        let maximum_in_flight = config.client_options.maximum_in_flight;
        let base_time = config.base_timestamp;

        ProtocolState {
            config,
            protocol_version,
            state: ProtocolStateType::Disconnected,
            current_time: base_time,
            elapsed_time_ms: 0,
            next_operation_id: 1,
            qos: QosTracker::new(maximum_in_flight),
            subscriptions: SubscriptionRegistry::new(),
            high_priority_queue: VecDeque::new(),
            qos0_queue: VecDeque::new(),
            pending_disconnect: None,
            decoder: Decoder::new(protocol_version),
            inbound_alias_resolver,
            outbound_alias_resolver,
            current_connect: None,
            current_settings: None,
            last_client_id: None,
            has_connected_successfully: false,
            connack_timeout_timepoint: None,
            next_ping_timepoint: None,
            ping_timeout_timepoint: None,
            events: VecDeque::new(),
        }
    }

    pub(crate) fn state(&self) -> ProtocolStateType {
        self.state
    }

    pub(crate) fn protocol_version(&self) -> ProtocolVersion {
        self.protocol_version
    }

    pub(crate) fn negotiated_settings(&self) -> Option<&NegotiatedSettings> {
        self.current_settings.as_ref()
    }

    pub(crate) fn drain_events(&mut self, dest: &mut VecDeque<ProtocolEvent>) {
        dest.append(&mut self.events);
    }

    pub(crate) fn handle_network_event(&mut self, context: NetworkEventContext) -> MqttifyResult<()> {
        self.update_internal_clock(&context.current_time);

        let result =
            match context.event {
                NetworkEvent::ConnectionOpened => { self.handle_network_event_connection_opened() }
                NetworkEvent::ConnectionClosed => { self.handle_network_event_connection_closed() }
                NetworkEvent::IncomingData(data) => { self.handle_network_event_incoming_data(data) }
            };

        self.log_state();

        // Any error returned from an event handler halts the current connection.
        if result.is_err() {
            error!("[{} ms] handle_network_event - final result: {:?}", self.elapsed_time_ms, result);
            self.change_state(ProtocolStateType::Halted);
        } else {
            debug!("[{} ms] handle_network_event - final result: {:?}", self.elapsed_time_ms, result);
        }

        result
    }

    pub(crate) fn service(&mut self, context: &mut ServiceContext) -> MqttifyResult<()> {
        self.update_internal_clock(&context.current_time);

        let result =
            match self.state {
                ProtocolStateType::Disconnected => { Ok(()) }
                ProtocolStateType::PendingConnack => { self.service_pending_connack(context) }
                ProtocolStateType::Connected => { self.service_connected(context) }
                ProtocolStateType::PendingDisconnect => { self.service_pending_disconnect(context) }
                ProtocolStateType::Halted => { Err(MqttifyError::new_internal_state_error("protocol state previously halted")) }
            };

        self.log_state();

        // Not always an ERROR-error: writing a user's disconnect ends the connection this way too.
        if result.is_err() {
            info!("[{} ms] service - final result: {:?}", self.elapsed_time_ms, result);
            self.change_state(ProtocolStateType::Halted);
        } else {
            trace!("[{} ms] service - final result: {:?}", self.elapsed_time_ms, result);
        }

        result
    }

    /// Submits a user request.  Invalid requests are rejected before any state changes.
    /// Returns the id of the created operation.
    pub(crate) fn handle_user_event(&mut self, context: UserEventContext) -> MqttifyResult<u64> {
        self.update_internal_clock(&context.current_time);

        let result =
            match context.event {
                UserEvent::Publish(publish) => { self.handle_user_event_publish(publish) }
                UserEvent::Subscribe(subscribe, handler) => { self.handle_user_event_subscribe(subscribe, handler) }
                UserEvent::Unsubscribe(unsubscribe) => { self.handle_user_event_unsubscribe(unsubscribe) }
                UserEvent::Disconnect(disconnect) => { self.handle_user_event_disconnect(disconnect).map(|_| 0) }
            };

        match &result {
            Ok(id) => { debug!("[{} ms] handle_user_event - accepted as operation {}", self.elapsed_time_ms, id); }
            Err(error) => { warn!("[{} ms] handle_user_event - rejected: {}", self.elapsed_time_ms, error); }
        }

        self.log_state();

        result
    }

    pub(crate) fn get_next_service_timepoint(&mut self, current_time: &Instant) -> Option<Instant> {
        self.update_internal_clock(current_time);

        let next_service_time =
            match self.state {
                ProtocolStateType::Disconnected | ProtocolStateType::Halted => { None }
                ProtocolStateType::PendingConnack => { self.get_next_service_timepoint_pending_connack() }
                ProtocolStateType::Connected => { self.get_next_service_timepoint_connected() }
                ProtocolStateType::PendingDisconnect => { Some(self.current_time) }
            };

        if let Some(next_timepoint) = &next_service_time {
            trace!("[{} ms] get_next_service_timepoint - state {}, target_elapsed_time: {} ms", self.elapsed_time_ms, self.state, self.get_elapsed_millis(next_timepoint));
        } else {
            trace!("[{} ms] get_next_service_timepoint - state {}, target_elapsed_time: NEVER", self.elapsed_time_ms, self.state);
        }

        next_service_time
    }

    /// Fails every outstanding operation and forgets all session state.
    pub(crate) fn shutdown(&mut self, current_time: &Instant) {
        self.update_internal_clock(current_time);
        info!("[{} ms] shutdown - failing all outstanding operations", self.elapsed_time_ms);

        for exchange in self.qos.drain() {
            self.complete_exchange_with_error(exchange, MqttifyError::new_engine_destroyed());
        }

        self.fail_qos0_queue(MqttifyError::new_engine_destroyed);

        self.subscriptions = SubscriptionRegistry::new();
        self.high_priority_queue.clear();
        self.pending_disconnect = None;
        self.current_settings = None;
        self.clear_timers();
        self.change_state(ProtocolStateType::Halted);
    }

    // Private Implementation

    fn log_state(&self) {
        trace!("[{} ms] {}", self.elapsed_time_ms, self);
    }

    fn update_internal_clock(&mut self, current_time: &Instant) {
        self.current_time = *current_time;
        self.elapsed_time_ms = self.get_elapsed_millis(current_time);
    }

    fn get_elapsed_millis(&self, timepoint: &Instant) -> u128 {
        timepoint.saturating_duration_since(self.config.base_timestamp).as_millis()
    }

    fn change_state(&mut self, next_state: ProtocolStateType) {
        if self.state != next_state {
            debug!("[{} ms] change_state - transitioning from {} to {}", self.elapsed_time_ms, self.state, next_state);
        }

        self.state = next_state;
    }

    fn clear_timers(&mut self) {
        self.connack_timeout_timepoint = None;
        self.next_ping_timepoint = None;
        self.ping_timeout_timepoint = None;
    }

    fn allocate_operation_id(&mut self) -> u64 {
        let id = self.next_operation_id;
        self.next_operation_id += 1;
        id
    }

    fn keep_alive_seconds(&self) -> u16 {
        self.current_settings.as_ref().map(|settings| settings.server_keep_alive).unwrap_or(0)
    }

    fn schedule_next_ping(&mut self) {
        let keep_alive = self.keep_alive_seconds();
        self.next_ping_timepoint =
            if keep_alive > 0 {
                Some(self.current_time + Duration::from_secs(keep_alive as u64))
            } else {
                None
            };
    }

    fn handle_network_event_connection_opened(&mut self) -> MqttifyResult<()> {
        if self.state != ProtocolStateType::Disconnected {
            error!("[{} ms] handle_network_event_connection_opened - called in invalid state {}", self.elapsed_time_ms, self.state);
            return Err(MqttifyError::new_internal_state_error("connection opened in an invalid state"));
        }

        let mut connect = self.config.connect_options.to_connect_packet(self.has_connected_successfully)?;
        if connect.client_id.is_empty() {
            if let Some(client_id) = &self.last_client_id {
                connect.client_id = client_id.clone();
            }
        }

        validate_connect_outbound(&connect, self.protocol_version)?;

        info!("[{} ms] handle_network_event_connection_opened - transitioning to PendingConnack state", self.elapsed_time_ms);

        self.decoder.reset_for_new_connection(self.protocol_version, connect.maximum_packet_size_bytes);
        self.inbound_alias_resolver.reset_for_new_connection(connect.topic_alias_maximum.unwrap_or(0));

        self.high_priority_queue.clear();
        self.high_priority_queue.push_back(MqttPacket::Connect(connect.clone()));
        self.current_connect = Some(connect);

        self.connack_timeout_timepoint = Some(self.current_time + self.config.client_options.connack_timeout);
        self.change_state(ProtocolStateType::PendingConnack);

        Ok(())
    }

    fn handle_network_event_connection_closed(&mut self) -> MqttifyResult<()> {
        info!("[{} ms] handle_network_event_connection_closed - transitioning from {} to Disconnected", self.elapsed_time_ms, self.state);

        self.change_state(ProtocolStateType::Disconnected);
        self.clear_timers();
        self.high_priority_queue.clear();
        self.pending_disconnect = None;
        self.current_connect = None;
        self.current_settings = None;

        self.qos.on_connection_interrupted();
        self.fail_qos0_queue(|| MqttifyError::new_connection_closed("connection closed before the publish was written"));

        Ok(())
    }

    fn handle_network_event_incoming_data(&mut self, data: &[u8]) -> MqttifyResult<()> {
        match self.state {
            ProtocolStateType::PendingConnack | ProtocolStateType::Connected => {}
            ProtocolStateType::PendingDisconnect => {
                debug!("[{} ms] handle_network_event_incoming_data - ignoring {} bytes while disconnecting", self.elapsed_time_ms, data.len());
                return Ok(());
            }
            _ => {
                error!("[{} ms] handle_network_event_incoming_data - data received in invalid state {}", self.elapsed_time_ms, self.state);
                return Err(MqttifyError::new_internal_state_error("incoming data received while no connection is open"));
            }
        }

        let mut decoded_packets = VecDeque::new();
        self.decoder.decode_bytes(data, &mut decoded_packets)?;

        while let Some(packet) = decoded_packets.pop_front() {
            self.handle_packet(packet)?;
        }

        Ok(())
    }

    fn handle_user_event_publish(&mut self, publish: PublishPacket) -> MqttifyResult<u64> {
        validate_publish_outbound(&publish, self.protocol_version, self.current_settings.as_ref())?;

        if publish.qos == QualityOfService::AtMostOnce {
            if self.state != ProtocolStateType::Connected {
                return Err(MqttifyError::new_not_connected());
            }

            let id = self.allocate_operation_id();
            self.qos0_queue.push_back((id, publish));
            return Ok(id);
        }

        let id = self.allocate_operation_id();
        self.qos.begin_publish(id, publish)?;

        Ok(id)
    }

    fn handle_user_event_subscribe(&mut self, subscribe: SubscribePacket, handler: Option<MessageHandler>) -> MqttifyResult<u64> {
        validate_subscribe_outbound(&subscribe, self.protocol_version, self.current_settings.as_ref())?;

        let id = self.allocate_operation_id();
        self.qos.begin_subscribe(id, subscribe.clone())?;
        self.subscriptions.begin_subscribe(id, &subscribe, handler);

        Ok(id)
    }

    fn handle_user_event_unsubscribe(&mut self, unsubscribe: UnsubscribePacket) -> MqttifyResult<u64> {
        validate_unsubscribe_outbound(&unsubscribe, self.protocol_version, self.current_settings.as_ref())?;

        let id = self.allocate_operation_id();
        self.qos.begin_unsubscribe(id, unsubscribe.clone())?;
        self.subscriptions.unsubscribe(&unsubscribe.topic_filters);

        Ok(id)
    }

    fn handle_user_event_disconnect(&mut self, disconnect: DisconnectPacket) -> MqttifyResult<()> {
        if self.state != ProtocolStateType::Connected {
            return Err(MqttifyError::new_not_connected());
        }

        validate_disconnect_outbound(&disconnect, self.protocol_version, self.current_settings.as_ref())?;

        // nothing but the disconnect is written from here on
        self.high_priority_queue.clear();
        self.pending_disconnect = Some(disconnect);
        self.change_state(ProtocolStateType::PendingDisconnect);

        Ok(())
    }

    fn service_pending_connack(&mut self, context: &mut ServiceContext) -> MqttifyResult<()> {
        if let Some(connack_timeout) = &self.connack_timeout_timepoint {
            if &self.current_time >= connack_timeout {
                error!("[{} ms] service_pending_connack - connack timeout exceeded", self.elapsed_time_ms);
                return Err(MqttifyError::new_connection_establishment_failure("connack timeout exceeded"));
            }
        }

        self.write_high_priority_packets(context.to_socket)
    }

    fn service_keep_alive(&mut self) -> MqttifyResult<()> {
        if let Some(ping_timeout) = &self.ping_timeout_timepoint {
            if &self.current_time >= ping_timeout {
                error!("[{} ms] service_keep_alive - keep alive timeout exceeded", self.elapsed_time_ms);
                return Err(MqttifyError::new_connection_closed("keep alive timeout exceeded"));
            }

            return Ok(());
        }

        if let Some(next_ping) = &self.next_ping_timepoint {
            if &self.current_time >= next_ping {
                debug!("[{} ms] service_keep_alive - sending pingreq", self.elapsed_time_ms);
                self.high_priority_queue.push_back(MqttPacket::Pingreq(PingreqPacket {}));

                let ping_timeout = self.config.client_options.effective_ping_timeout(self.keep_alive_seconds());
                self.ping_timeout_timepoint = Some(self.current_time + ping_timeout);
                self.schedule_next_ping();
            }
        }

        Ok(())
    }

    fn service_packet_retry(&mut self) {
        let Some(retry) = self.config.client_options.packet_retry_options else {
            return;
        };

        for exchange in self.qos.apply_retry_policy(self.current_time, &retry) {
            warn!("[{} ms] service_packet_retry - operation {} abandoned after {} attempts", self.elapsed_time_ms, exchange.operation_id, exchange.transmissions);
            self.complete_exchange_with_error(exchange, MqttifyError::new_ack_timeout());
        }
    }

    fn service_connected(&mut self, context: &mut ServiceContext) -> MqttifyResult<()> {
        self.service_keep_alive()?;
        self.service_packet_retry();

        let mut wrote_packets = !self.high_priority_queue.is_empty();
        self.write_high_priority_packets(context.to_socket)?;

        let receive_maximum = self.current_settings.as_ref().map(|settings| settings.receive_maximum_from_server).unwrap_or(65535);
        let mut exchange_packets = VecDeque::new();
        self.qos.take_transmissions(self.current_time, receive_maximum, &mut exchange_packets);
        while let Some(packet) = exchange_packets.pop_front() {
            self.write_packet(&packet, context.to_socket)?;
            wrote_packets = true;
        }

        while let Some((id, publish)) = self.qos0_queue.pop_front() {
            let packet = MqttPacket::Publish(publish);
            self.write_packet(&packet, context.to_socket)?;
            wrote_packets = true;

            self.events.push_back(ProtocolEvent::PublishComplete {
                operation_id: id,
                result: Ok(PublishResponse::Qos0),
            });
        }

        if wrote_packets && self.ping_timeout_timepoint.is_none() {
            self.schedule_next_ping();
        }

        Ok(())
    }

    fn service_pending_disconnect(&mut self, context: &mut ServiceContext) -> MqttifyResult<()> {
        if let Some(disconnect) = self.pending_disconnect.take() {
            self.write_packet(&MqttPacket::Disconnect(disconnect), context.to_socket)?;
        }

        Err(MqttifyError::new_user_initiated_disconnect())
    }

    fn get_next_service_timepoint_pending_connack(&self) -> Option<Instant> {
        if !self.high_priority_queue.is_empty() {
            return Some(self.current_time);
        }

        self.connack_timeout_timepoint
    }

    fn get_next_service_timepoint_connected(&self) -> Option<Instant> {
        let receive_maximum = self.current_settings.as_ref().map(|settings| settings.receive_maximum_from_server).unwrap_or(65535);
        if !self.high_priority_queue.is_empty() || !self.qos0_queue.is_empty() || self.qos.has_transmittable(receive_maximum) {
            return Some(self.current_time);
        }

        let mut next_service_time = self.ping_timeout_timepoint.or(self.next_ping_timepoint);

        if let Some(retry) = &self.config.client_options.packet_retry_options {
            next_service_time = fold_optional_timepoint_min(&next_service_time, &self.qos.next_retry_timepoint(retry));
        }

        next_service_time
    }

    fn write_high_priority_packets(&mut self, to_socket: &mut Vec<u8>) -> MqttifyResult<()> {
        while let Some(packet) = self.high_priority_queue.pop_front() {
            self.write_packet(&packet, to_socket)?;
        }

        Ok(())
    }

    fn compute_outbound_alias_resolution(&mut self, packet: &MqttPacket) -> OutboundAliasResolution {
        if self.protocol_version != ProtocolVersion::Mqtt5 {
            return OutboundAliasResolution::default();
        }

        if let MqttPacket::Publish(publish) = packet {
            return self.outbound_alias_resolver.resolve_and_apply_topic_alias(&publish.topic);
        }

        OutboundAliasResolution::default()
    }

    fn write_packet(&mut self, packet: &MqttPacket, to_socket: &mut Vec<u8>) -> MqttifyResult<()> {
        log_packet(&format!("[{} ms] Writing packet: ", self.elapsed_time_ms), packet);

        let context = EncodingContext {
            protocol_version: self.protocol_version,
            outbound_alias_resolution: self.compute_outbound_alias_resolution(packet),
        };

        encode_packet_with_context(packet, &context, to_socket)
    }

    fn fail_qos0_queue(&mut self, error_fn: impl Fn() -> MqttifyError) {
        while let Some((id, _)) = self.qos0_queue.pop_front() {
            self.events.push_back(ProtocolEvent::PublishComplete {
                operation_id: id,
                result: Err(error_fn()),
            });
        }
    }

    fn complete_exchange_with_error(&mut self, exchange: InFlightExchange, error: MqttifyError) {
        let operation_id = exchange.operation_id;
        let event =
            match exchange.request {
                ExchangeRequest::Publish(..) => {
                    ProtocolEvent::PublishComplete { operation_id, result: Err(error) }
                }
                ExchangeRequest::Subscribe(_) => {
                    self.subscriptions.fail_subscribe(operation_id);
                    ProtocolEvent::SubscribeComplete { operation_id, result: Err(error) }
                }
                ExchangeRequest::Unsubscribe(_) => {
                    ProtocolEvent::UnsubscribeComplete { operation_id, result: Err(error) }
                }
            };

        self.events.push_back(event);
    }

    fn apply_session_present_to_connection(&mut self, session_present: bool) {
        if session_present {
            info!("[{} ms] apply_session_present_to_connection - session resumed, {} exchanges pending", self.elapsed_time_ms, self.qos.in_flight_count());
            return;
        }

        if !self.has_connected_successfully {
            return;
        }

        info!("[{} ms] apply_session_present_to_connection - broker discarded the session", self.elapsed_time_ms);

        let abandoned = self.qos.on_session_reset();
        let abandoned_operations : Vec<u64> = abandoned.iter().map(|exchange| exchange.operation_id).collect();
        for exchange in abandoned {
            self.complete_exchange_with_error(exchange, MqttifyError::new_session_reset());
        }

        self.subscriptions.clear_granted();
        self.events.push_back(ProtocolEvent::SessionReset { abandoned_operations });
    }

    fn handle_connack(&mut self, connack: ConnackPacket) -> MqttifyResult<()> {
        if self.state != ProtocolStateType::PendingConnack {
            error!("[{} ms] handle_connack - invalid state to receive a connack", self.elapsed_time_ms);
            return Err(MqttifyError::new_protocol_violation("connack received on an established connection"));
        }

        self.connack_timeout_timepoint = None;

        if !connack.reason_code.is_success() {
            error!("[{} ms] handle_connack - connection rejected with reason code {:?}", self.elapsed_time_ms, connack.reason_code);
            let error = MqttifyError::new_connection_establishment_failure(format!("connection rejected with reason code {:?}", connack.reason_code));
            self.events.push_back(ProtocolEvent::ConnackRejected(connack));
            return Err(error);
        }

        let settings =
            match &self.current_connect {
                Some(connect) => { build_negotiated_settings(connect, &connack, self.last_client_id.as_deref()) }
                None => { return Err(MqttifyError::new_internal_state_error("connack received without a connect")); }
            };

        info!("[{} ms] handle_connack - connection established with settings {}", self.elapsed_time_ms, settings);

        self.apply_session_present_to_connection(connack.session_present);

        self.outbound_alias_resolver.reset_for_new_connection(settings.topic_alias_maximum_to_server);
        self.last_client_id = Some(settings.client_id.clone());
        self.current_settings = Some(settings.clone());
        self.has_connected_successfully = true;

        self.change_state(ProtocolStateType::Connected);
        self.schedule_next_ping();

        self.events.push_back(ProtocolEvent::ConnectionSuccess { connack, settings });

        Ok(())
    }

    fn handle_pingresp(&mut self) -> MqttifyResult<()> {
        if self.ping_timeout_timepoint.take().is_some() {
            debug!("[{} ms] handle_pingresp - pingresp received", self.elapsed_time_ms);
        } else {
            warn!("[{} ms] handle_pingresp - unexpected pingresp", self.elapsed_time_ms);
        }

        Ok(())
    }

    fn handle_ack(&mut self, packet: MqttPacket) -> MqttifyResult<()> {
        match self.qos.on_ack(packet) {
            AckOutcome::PublishComplete { operation_id, response } => {
                debug!("[{} ms] handle_ack - publish operation {} complete", self.elapsed_time_ms, operation_id);
                self.events.push_back(ProtocolEvent::PublishComplete { operation_id, result: Ok(response) });
            }
            AckOutcome::PubrelQueued => {}
            AckOutcome::SubscribeComplete { operation_id, subscribe, suback } => {
                if let Err(error) = self.subscriptions.apply_suback(operation_id, &subscribe, &suback) {
                    self.subscriptions.fail_subscribe(operation_id);
                    self.events.push_back(ProtocolEvent::SubscribeComplete {
                        operation_id,
                        result: Err(MqttifyError::new_protocol_violation("suback reason code count mismatch")),
                    });
                    return Err(error);
                }

                self.events.push_back(ProtocolEvent::SubscribeComplete { operation_id, result: Ok(suback) });
            }
            AckOutcome::UnsubscribeComplete { operation_id, unsubscribe, mut unsuback } => {
                if self.protocol_version == ProtocolVersion::Mqtt311 {
                    unsuback.reason_codes = vec![UnsubackReasonCode::Success; unsubscribe.topic_filters.len()];
                } else if unsuback.reason_codes.len() != unsubscribe.topic_filters.len() {
                    error!("[{} ms] handle_ack - unsuback reason code count does not match", self.elapsed_time_ms);
                    self.events.push_back(ProtocolEvent::UnsubscribeComplete {
                        operation_id,
                        result: Err(MqttifyError::new_protocol_violation("unsuback reason code count mismatch")),
                    });
                    return Err(MqttifyError::new_protocol_violation("unsuback reason code count does not match the topic filter count"));
                }

                self.events.push_back(ProtocolEvent::UnsubscribeComplete { operation_id, result: Ok(unsuback) });
            }
            AckOutcome::UnknownPubrec(packet_id) => {
                let reason_code =
                    if self.protocol_version == ProtocolVersion::Mqtt5 {
                        PubrelReasonCode::PacketIdentifierNotFound
                    } else {
                        PubrelReasonCode::Success
                    };

                self.high_priority_queue.push_back(MqttPacket::Pubrel(PubrelPacket {
                    packet_id,
                    reason_code,
                    ..Default::default()
                }));
            }
            AckOutcome::Ignored => {}
        }

        Ok(())
    }

    fn handle_pubrel(&mut self, pubrel: PubrelPacket) -> MqttifyResult<()> {
        let released = self.qos.on_inbound_pubrel(pubrel.packet_id);

        let reason_code =
            if released || self.protocol_version == ProtocolVersion::Mqtt311 {
                PubcompReasonCode::Success
            } else {
                PubcompReasonCode::PacketIdentifierNotFound
            };

        self.high_priority_queue.push_back(MqttPacket::Pubcomp(PubcompPacket {
            packet_id: pubrel.packet_id,
            reason_code,
            ..Default::default()
        }));

        Ok(())
    }

    fn deliver_publish(&mut self, publish: PublishPacket) {
        match self.subscriptions.route(&publish.topic) {
            Some(matched) => {
                self.events.push_back(ProtocolEvent::MessageReceived { publish, handlers: matched.handlers });
            }
            None => {
                debug!("[{} ms] deliver_publish - no subscription matches topic \"{}\", dropping", self.elapsed_time_ms, publish.topic);
            }
        }
    }

    fn handle_publish(&mut self, mut publish: PublishPacket) -> MqttifyResult<()> {
        if self.protocol_version == ProtocolVersion::Mqtt5 {
            self.inbound_alias_resolver.resolve_topic_alias(&publish.topic_alias, &mut publish.topic)?;
        }

        match publish.qos {
            QualityOfService::AtMostOnce => {
                self.deliver_publish(publish);
            }
            QualityOfService::AtLeastOnce => {
                self.high_priority_queue.push_back(MqttPacket::Puback(PubackPacket {
                    packet_id: publish.packet_id,
                    ..Default::default()
                }));
                self.deliver_publish(publish);
            }
            QualityOfService::ExactlyOnce => {
                let action = self.qos.on_inbound_publish(publish.packet_id, publish.qos);

                self.high_priority_queue.push_back(MqttPacket::Pubrec(PubrecPacket {
                    packet_id: publish.packet_id,
                    ..Default::default()
                }));

                if action.deliver {
                    self.deliver_publish(publish);
                }
            }
        }

        Ok(())
    }

    fn handle_disconnect(&mut self, disconnect: DisconnectPacket) -> MqttifyResult<()> {
        if self.protocol_version == ProtocolVersion::Mqtt311 {
            error!("[{} ms] handle_disconnect - server disconnect on an MQTT 3.1.1 connection", self.elapsed_time_ms);
            return Err(MqttifyError::new_protocol_violation("brokers may not send DISCONNECT on MQTT 3.1.1 connections"));
        }

        info!("[{} ms] handle_disconnect - server disconnected with reason code {:?}", self.elapsed_time_ms, disconnect.reason_code);
        let error = MqttifyError::new_connection_closed(format!("server disconnected with reason code {:?}", disconnect.reason_code));
        self.events.push_back(ProtocolEvent::ServerDisconnect(disconnect));

        Err(error)
    }

    fn handle_auth(&mut self, auth: AuthPacket) -> MqttifyResult<()> {
        if self.protocol_version == ProtocolVersion::Mqtt311 {
            error!("[{} ms] handle_auth - auth packet on an MQTT 3.1.1 connection", self.elapsed_time_ms);
            return Err(MqttifyError::new_protocol_violation("AUTH packets do not exist in MQTT 3.1.1"));
        }

        let Some(provider) = self.config.connect_options.credentials_provider.clone() else {
            return Err(MqttifyError::new_protocol_violation("broker sent AUTH but no enhanced authentication is configured"));
        };

        let method = provider.auth_method();
        if method.is_none() || method != auth.authentication_method {
            return Err(MqttifyError::new_protocol_violation("AUTH packet authentication method does not match the connection's"));
        }

        match auth.reason_code {
            AuthenticateReasonCode::ContinueAuthentication | AuthenticateReasonCode::ReAuthenticate => {
                let response_data = provider.on_auth_challenge(auth.authentication_data.as_deref())?;
                debug!("[{} ms] handle_auth - answering authentication challenge", self.elapsed_time_ms);

                self.high_priority_queue.push_back(MqttPacket::Auth(AuthPacket {
                    reason_code: AuthenticateReasonCode::ContinueAuthentication,
                    authentication_method: method,
                    authentication_data: response_data,
                    ..Default::default()
                }));
            }
            AuthenticateReasonCode::Success => {
                if self.state != ProtocolStateType::Connected {
                    return Err(MqttifyError::new_protocol_violation("AUTH success is only valid after connection establishment"));
                }

                info!("[{} ms] handle_auth - re-authentication complete", self.elapsed_time_ms);
            }
        }

        Ok(())
    }

    fn handle_packet(&mut self, packet: MqttPacket) -> MqttifyResult<()> {
        log_packet(&format!("[{} ms] Received packet: ", self.elapsed_time_ms), &packet);

        if self.state == ProtocolStateType::PendingConnack {
            return match packet {
                MqttPacket::Connack(connack) => { self.handle_connack(connack) }
                MqttPacket::Auth(auth) => { self.handle_auth(auth) }
                MqttPacket::Disconnect(disconnect) => { self.handle_disconnect(disconnect) }
                _ => {
                    error!("[{} ms] handle_packet - {} received before connack", self.elapsed_time_ms, packet.packet_type());
                    Err(MqttifyError::new_protocol_violation(format!("{} received before connack", packet.packet_type())))
                }
            };
        }

        match packet {
            MqttPacket::Connack(connack) => { self.handle_connack(connack) }
            MqttPacket::Publish(publish) => { self.handle_publish(publish) }
            MqttPacket::Pubrel(pubrel) => { self.handle_pubrel(pubrel) }
            MqttPacket::Puback(_) | MqttPacket::Pubrec(_) | MqttPacket::Pubcomp(_) | MqttPacket::Suback(_) | MqttPacket::Unsuback(_) => {
                self.handle_ack(packet)
            }
            MqttPacket::Pingresp(_) => { self.handle_pingresp() }
            MqttPacket::Disconnect(disconnect) => { self.handle_disconnect(disconnect) }
            MqttPacket::Auth(auth) => { self.handle_auth(auth) }
            MqttPacket::Connect(_) | MqttPacket::Subscribe(_) | MqttPacket::Unsubscribe(_) | MqttPacket::Pingreq(_) => {
                error!("[{} ms] handle_packet - invalid packet type for client received", self.elapsed_time_ms);
                Err(MqttifyError::new_protocol_violation(format!("client received a {}", packet.packet_type())))
            }
        }
    }
}

fn build_negotiated_settings(connect: &ConnectPacket, connack: &ConnackPacket, previous_client_id: Option<&str>) -> NegotiatedSettings {
    let final_client_id =
        if let Some(assigned_client_id) = &connack.assigned_client_identifier {
            assigned_client_id.clone()
        } else if !connect.client_id.is_empty() {
            connect.client_id.clone()
        } else {
            // MQTT311 brokers may assign a client id without telling us what it is
            previous_client_id.unwrap_or_default().to_string()
        };

    NegotiatedSettings {
        maximum_qos : connack.maximum_qos.unwrap_or(QualityOfService::ExactlyOnce),
        session_expiry_interval : connack.session_expiry_interval.unwrap_or(connect.session_expiry_interval_seconds.unwrap_or(0)),
        receive_maximum_from_server : connack.receive_maximum.unwrap_or(65535),
        maximum_packet_size_to_server : connack.maximum_packet_size.unwrap_or(MAXIMUM_PACKET_SIZE),
        topic_alias_maximum_to_server : connack.topic_alias_maximum.unwrap_or(0),
        server_keep_alive : connack.server_keep_alive.unwrap_or(connect.keep_alive_interval_seconds),
        retain_available : connack.retain_available.unwrap_or(true),
        wildcard_subscriptions_available : connack.wildcard_subscriptions_available.unwrap_or(true),
        subscription_identifiers_available : connack.subscription_identifiers_available.unwrap_or(true),
        shared_subscriptions_available : connack.shared_subscriptions_available.unwrap_or(true),
        rejoined_session : connack.session_present,
        client_id : final_client_id
    }
}

pub(crate) fn fold_optional_timepoint_min(base: &Option<Instant>, new: &Option<Instant>) -> Option<Instant> {
    match (base, new) {
        (Some(base_timepoint), Some(new_timepoint)) => { Some(*base_timepoint.min(new_timepoint)) }
        (Some(_), None) => { *base }
        (None, _) => { *new }
    }
}
