/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
The public MQTT client, the events it emits, and the connection lifecycle that drives both.

An [`MqttClient`] owns one protocol session, one transport adapter and a reconnect policy.  It
performs no I/O of its own and never spawns threads: the host calls [`MqttClient::service`]
periodically (or at the time [`MqttClient::next_service_time`] asks for), and everything
observable happens on that call.  Transport adapters report back through a channel that the
service call drains.
 */

use crate::config::*;
use crate::dispatch::*;
use crate::error::{MqttifyError, MqttifyResult};
use crate::mqtt::*;
use crate::protocol::*;
use crate::qos::PublishResponse;
use crate::reconnect::{ReconnectController, ReconnectDecision};
use crate::subscription::MessageHandler;
use crate::transport::{TaggedTransportEvent, TransportAdapter, TransportEvent, TransportEventSink};

use log::*;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::{mpsc, Arc};
use std::time::Instant;

/// Externally visible connection lifecycle of a client
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ConnectionState {

    /// No connection and none wanted
    Disconnected,

    /// A user-requested or reconnect attempt is in progress
    Connecting,

    /// The broker accepted the connection
    Connected,

    /// A user-requested DISCONNECT is being flushed
    Disconnecting,

    /// Waiting out the backoff before the next attempt
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => { write!(f, "Disconnected") }
            ConnectionState::Connecting => { write!(f, "Connecting") }
            ConnectionState::Connected => { write!(f, "Connected") }
            ConnectionState::Disconnecting => { write!(f, "Disconnecting") }
            ConnectionState::Reconnecting => { write!(f, "Reconnecting") }
        }
    }
}

/// The client moved between two lifecycle states
#[derive(Debug)]
pub struct ConnectionStateChangedEvent {
    pub previous: ConnectionState,
    pub current: ConnectionState,
}

/// A connection attempt was accepted by the broker
#[derive(Debug)]
pub struct ConnectionSuccessEvent {

    /// The broker's CONNACK
    pub connack: ConnackPacket,

    /// What the connection actually runs with after combining CONNECT and CONNACK
    pub settings: NegotiatedSettings,
}

/// A connection attempt failed before reaching the Connected state
#[derive(Debug)]
pub struct ConnectFailedEvent {
    pub error: MqttifyError,

    /// Present when the broker answered with a failing CONNACK
    pub connack: Option<ConnackPacket>,
}

/// An established connection ended without the user asking for it
#[derive(Debug)]
pub struct ConnectionLostEvent {
    pub error: MqttifyError,

    /// Present when the broker sent a DISCONNECT first
    pub disconnect: Option<DisconnectPacket>,
}

/// The broker did not resume the session; the listed operations were failed with `SessionReset`
#[derive(Debug)]
pub struct SessionResetEvent {
    pub abandoned_operations: Vec<u64>,
}

/// The reconnect policy ran out of attempts and the client stopped trying
#[derive(Debug)]
pub struct ReconnectionAbandonedEvent {
    pub attempts: u32,
}

/// A publish arrived on a subscribed topic
#[derive(Debug)]
pub struct MessageReceivedEvent {
    pub publish: PublishPacket,
}

/// A publish submitted by the user finished, one way or the other
#[derive(Debug)]
pub struct PublishCompleteEvent {
    pub operation_id: u64,
    pub result: MqttifyResult<PublishResponse>,
}

#[derive(Debug)]
pub struct SubscribeResultEvent {
    pub operation_id: u64,
    pub result: MqttifyResult<SubackPacket>,
}

#[derive(Debug)]
pub struct UnsubscribeResultEvent {
    pub operation_id: u64,
    pub result: MqttifyResult<UnsubackPacket>,
}

/// An error that no other event reports
#[derive(Debug)]
pub struct ErrorEvent {
    pub error: MqttifyError,
}

/// Everything a client reports to its listeners
#[derive(Debug)]
pub enum ClientEvent {
    ConnectionStateChanged(ConnectionStateChangedEvent),
    ConnectionSuccess(ConnectionSuccessEvent),
    ConnectFailed(ConnectFailedEvent),
    ConnectionLost(ConnectionLostEvent),
    SessionReset(SessionResetEvent),
    ReconnectionAbandoned(ReconnectionAbandonedEvent),
    MessageReceived(MessageReceivedEvent),
    PublishComplete(PublishCompleteEvent),
    SubscribeResult(SubscribeResultEvent),
    UnsubscribeResult(UnsubscribeResultEvent),
    Error(ErrorEvent),
}

impl fmt::Display for ClientEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientEvent::ConnectionStateChanged(event) => { write!(f, "ConnectionStateChanged {{ {} -> {} }}", event.previous, event.current) }
            ClientEvent::ConnectionSuccess(event) => { write!(f, "ConnectionSuccess {{ {} }}", event.connack) }
            ClientEvent::ConnectFailed(event) => { write!(f, "ConnectFailed {{ {} }}", event.error) }
            ClientEvent::ConnectionLost(event) => { write!(f, "ConnectionLost {{ {} }}", event.error) }
            ClientEvent::SessionReset(event) => { write!(f, "SessionReset {{ {} abandoned operations }}", event.abandoned_operations.len()) }
            ClientEvent::ReconnectionAbandoned(event) => { write!(f, "ReconnectionAbandoned {{ {} attempts }}", event.attempts) }
            ClientEvent::MessageReceived(event) => { write!(f, "MessageReceived {{ {} }}", event.publish) }
            ClientEvent::PublishComplete(event) => { write!(f, "PublishComplete {{ {}, success: {} }}", event.operation_id, event.result.is_ok()) }
            ClientEvent::SubscribeResult(event) => { write!(f, "SubscribeResult {{ {}, success: {} }}", event.operation_id, event.result.is_ok()) }
            ClientEvent::UnsubscribeResult(event) => { write!(f, "UnsubscribeResult {{ {}, success: {} }}", event.operation_id, event.result.is_ok()) }
            ClientEvent::Error(event) => { write!(f, "Error {{ {} }}", event.error) }
        }
    }
}

/// Callback invoked with every client event
pub type ClientEventListener = Arc<dyn Fn(Arc<ClientEvent>) + Send + Sync>;

/// Identifies a registered listener so it can be removed later
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ListenerHandle {
    id: u64,
}

/// Everything besides the options that a client is built from.  Engines supply their own.
pub(crate) struct ClientContext {
    pub(crate) instance_id: u64,
    pub(crate) base_timestamp: Instant,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) event_pump: Option<EventPump>,
}

/// An MQTT client for one broker connection.
pub struct MqttClient {
    instance_id: u64,
    settings: ConnectionSettings,
    client_options: ClientOptions,

    state: ConnectionState,
    destroyed: bool,

    // whether the user wants a connection; reconnects only happen while true
    desired_connected: bool,

    protocol_state: ProtocolState,
    reconnect: ReconnectController,

    dispatcher: Dispatcher,
    event_pump: Option<EventPump>,
    listeners: BTreeMap<ListenerHandle, ClientEventListener>,
    next_listener_id: u64,

    transport: Box<dyn TransportAdapter>,
    transport_sender: mpsc::Sender<TaggedTransportEvent>,
    transport_receiver: mpsc::Receiver<TaggedTransportEvent>,

    // events tagged with anything else come from abandoned connections
    connection_id: u64,
    transport_connect_deadline: Option<Instant>,

    last_connack_rejection: Option<ConnackPacket>,
    last_server_disconnect: Option<DisconnectPacket>,
}

impl MqttClient {

    /// Creates a disconnected client.
    ///
    /// Credentials embedded in the connection settings are used when the connect options
    /// carry no credentials provider of their own.
    pub fn new(settings: ConnectionSettings, connect_options: ConnectOptions, client_options: ClientOptions, transport: Box<dyn TransportAdapter>) -> MqttClient {
        let (dispatcher, event_pump) = Dispatcher::new(client_options.dispatch_mode);
        let context = ClientContext {
            instance_id: 0,
            base_timestamp: Instant::now(),
            dispatcher,
            event_pump,
        };

        MqttClient::new_with_context(settings, connect_options, client_options, transport, context)
    }

    pub(crate) fn new_with_context(settings: ConnectionSettings, mut connect_options: ConnectOptions, client_options: ClientOptions, transport: Box<dyn TransportAdapter>, context: ClientContext) -> MqttClient {
        if connect_options.credentials_provider.is_none() {
            connect_options.credentials_provider = settings.credentials_provider();
        }

        let protocol_config = ProtocolStateConfig {
            connect_options,
            client_options: client_options.clone(),
            base_timestamp: context.base_timestamp,
        };

        let (transport_sender, transport_receiver) = mpsc::channel();

        info!("MqttClient {} - created for endpoint {}", context.instance_id, settings.endpoint);

        MqttClient {
            instance_id: context.instance_id,
            reconnect: ReconnectController::new(client_options.reconnect_options.clone()),
            settings,
            client_options,
            state: ConnectionState::Disconnected,
            destroyed: false,
            desired_connected: false,
            protocol_state: ProtocolState::new(protocol_config),
            dispatcher: context.dispatcher,
            event_pump: context.event_pump,
            listeners: BTreeMap::new(),
            next_listener_id: 1,
            transport,
            transport_sender,
            transport_receiver,
            connection_id: 0,
            transport_connect_deadline: None,
            last_connack_rejection: None,
            last_server_disconnect: None,
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Where this client connects
    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    /// Settings of the current connection, if the client is connected
    pub fn negotiated_settings(&self) -> Option<&NegotiatedSettings> {
        self.protocol_state.negotiated_settings()
    }

    /// Hands out the pump for marshalled events.  Only the first call returns one, and only in
    /// `Marshalled` dispatch mode.
    pub fn take_event_pump(&mut self) -> Option<EventPump> {
        self.event_pump.take()
    }

    pub fn add_event_listener(&mut self, listener: ClientEventListener) -> ListenerHandle {
        let handle = ListenerHandle { id: self.next_listener_id };
        self.next_listener_id += 1;
        self.listeners.insert(handle, listener);

        handle
    }

    /// Returns false if the listener was not registered
    pub fn remove_event_listener(&mut self, handle: ListenerHandle) -> bool {
        self.listeners.remove(&handle).is_some()
    }

    /// Starts connecting.  Fails with `AlreadyConnected` unless the client is Disconnected.
    pub fn connect(&mut self, now: Instant) -> MqttifyResult<()> {
        self.check_alive()?;
        if self.state != ConnectionState::Disconnected {
            return Err(MqttifyError::new_already_connected());
        }

        info!("MqttClient {} - connect requested", self.instance_id);
        self.desired_connected = true;
        self.reconnect.reset();
        self.begin_connection_attempt(now);

        Ok(())
    }

    /// Ends the connection and stops reconnecting.
    ///
    /// A connected client flushes the DISCONNECT on the next service call.  A connection
    /// attempt in progress is abandoned immediately.
    pub fn disconnect(&mut self, now: Instant, packet: Option<DisconnectPacket>) -> MqttifyResult<()> {
        self.check_alive()?;
        info!("MqttClient {} - disconnect requested in state {}", self.instance_id, self.state);

        match self.state {
            ConnectionState::Disconnected => { Err(MqttifyError::new_not_connected()) }
            ConnectionState::Disconnecting => { Ok(()) }
            ConnectionState::Connected => {
                let disconnect = packet.unwrap_or_default();
                self.protocol_state.handle_user_event(UserEventContext {
                    event: UserEvent::Disconnect(disconnect),
                    current_time: now,
                })?;

                self.desired_connected = false;
                self.reconnect.cancel();
                self.change_state(ConnectionState::Disconnecting);
                Ok(())
            }
            ConnectionState::Connecting | ConnectionState::Reconnecting => {
                self.desired_connected = false;
                self.reconnect.cancel();
                self.close_connection(now);
                self.change_state(ConnectionState::Disconnected);
                Ok(())
            }
        }
    }

    /// Submits a publish and returns its operation id.  Completion is reported by a
    /// `PublishComplete` event carrying the same id.
    ///
    /// QoS 1 and 2 publishes submitted while the client is reconnecting are held until the
    /// next connection.
    pub fn publish(&mut self, now: Instant, packet: PublishPacket) -> MqttifyResult<u64> {
        self.submit(now, UserEvent::Publish(packet))
    }

    /// Submits a subscribe.  A handler, if given, receives every message matching any of the
    /// packet's filters until they are unsubscribed.
    pub fn subscribe(&mut self, now: Instant, packet: SubscribePacket, handler: Option<MessageHandler>) -> MqttifyResult<u64> {
        self.submit(now, UserEvent::Subscribe(packet, handler))
    }

    pub fn unsubscribe(&mut self, now: Instant, packet: UnsubscribePacket) -> MqttifyResult<u64> {
        self.submit(now, UserEvent::Unsubscribe(packet))
    }

    /// Does all pending work: drains transport events, runs timers, writes queued packets and
    /// starts due reconnect attempts.  Events are dispatched from inside this call.
    pub fn service(&mut self, now: Instant) -> MqttifyResult<()> {
        self.check_alive()?;

        self.process_transport_events(now);
        self.service_transport_connect_timeout(now);
        self.service_protocol(now);
        self.service_reconnect(now);

        Ok(())
    }

    /// The latest time the host should call `service` by.  Transport events arriving earlier
    /// also want a service call.
    pub fn next_service_time(&mut self, now: Instant) -> Option<Instant> {
        if self.destroyed {
            return None;
        }

        let mut next_time = None;
        if self.is_protocol_active() {
            next_time = self.protocol_state.get_next_service_timepoint(&now);
        }

        if self.state == ConnectionState::Connecting {
            next_time = fold_optional_timepoint_min(&next_time, &self.transport_connect_deadline);
        }

        fold_optional_timepoint_min(&next_time, &self.reconnect.next_service_timepoint())
    }

    /// Closes the connection and fails every outstanding operation with `EngineDestroyed`.  The
    /// client is unusable afterwards.
    pub fn destroy(&mut self, now: Instant) {
        if self.destroyed {
            return;
        }

        info!("MqttClient {} - destroying", self.instance_id);
        self.desired_connected = false;
        self.reconnect.cancel();
        self.transport.close();
        self.connection_id += 1;
        self.transport_connect_deadline = None;

        self.protocol_state.shutdown(&now);
        self.process_protocol_events(now);
        self.change_state(ConnectionState::Disconnected);
        self.destroyed = true;
    }

    fn check_alive(&self) -> MqttifyResult<()> {
        if self.destroyed {
            return Err(MqttifyError::new_engine_destroyed());
        }

        Ok(())
    }

    fn submit(&mut self, now: Instant, event: UserEvent) -> MqttifyResult<u64> {
        self.check_alive()?;
        if self.state == ConnectionState::Disconnected {
            return Err(MqttifyError::new_not_connected());
        }

        self.protocol_state.handle_user_event(UserEventContext {
            event,
            current_time: now,
        })
    }

    fn is_protocol_active(&self) -> bool {
        matches!(self.protocol_state.state(), ProtocolStateType::PendingConnack | ProtocolStateType::Connected | ProtocolStateType::PendingDisconnect)
    }

    fn begin_connection_attempt(&mut self, now: Instant) {
        self.connection_id += 1;
        self.last_connack_rejection = None;
        self.last_server_disconnect = None;
        self.change_state(ConnectionState::Connecting);

        debug!("MqttClient {} - starting connection attempt {} to {}", self.instance_id, self.connection_id, self.settings.endpoint);

        let sink = TransportEventSink::new(self.connection_id, self.transport_sender.clone());
        match self.transport.connect(&self.settings.endpoint, sink) {
            Ok(()) => {
                self.transport_connect_deadline = Some(now + self.client_options.connect_timeout);
            }
            Err(error) => {
                self.fail_connection(now, error);
            }
        }
    }

    fn process_transport_events(&mut self, now: Instant) {
        while let Ok(tagged) = self.transport_receiver.try_recv() {
            if tagged.connection_id != self.connection_id {
                debug!("MqttClient {} - dropping transport event from stale connection {}", self.instance_id, tagged.connection_id);
                continue;
            }

            match tagged.event {
                TransportEvent::Connected => { self.on_transport_connected(now); }
                TransportEvent::ConnectFailed(error) => { self.fail_connection(now, error); }
                TransportEvent::BytesReceived(bytes) => { self.on_bytes_received(now, &bytes); }
                TransportEvent::Closed(error) => {
                    let error = error.unwrap_or_else(|| MqttifyError::new_connection_closed("connection closed by remote endpoint"));
                    self.fail_connection(now, error);
                }
            }
        }
    }

    fn on_transport_connected(&mut self, now: Instant) {
        if self.state != ConnectionState::Connecting {
            return;
        }

        debug!("MqttClient {} - transport connected", self.instance_id);
        self.transport_connect_deadline = None;

        let result = self.protocol_state.handle_network_event(NetworkEventContext {
            event: NetworkEvent::ConnectionOpened,
            current_time: now,
        });

        if let Err(error) = result {
            self.fail_connection(now, error);
        }
    }

    fn on_bytes_received(&mut self, now: Instant, bytes: &[u8]) {
        if !self.is_protocol_active() {
            return;
        }

        let result = self.protocol_state.handle_network_event(NetworkEventContext {
            event: NetworkEvent::IncomingData(bytes),
            current_time: now,
        });

        self.process_protocol_events(now);
        if let Err(error) = result {
            self.fail_connection(now, error);
        }
    }

    fn service_transport_connect_timeout(&mut self, now: Instant) {
        if self.state != ConnectionState::Connecting {
            return;
        }

        if let Some(deadline) = self.transport_connect_deadline {
            if now >= deadline {
                warn!("MqttClient {} - transport connect timed out", self.instance_id);
                self.fail_connection(now, MqttifyError::new_connection_establishment_failure("transport connect timeout exceeded"));
            }
        }
    }

    fn service_protocol(&mut self, now: Instant) {
        if !self.is_protocol_active() {
            return;
        }

        let mut to_socket = Vec::new();
        let result = self.protocol_state.service(&mut ServiceContext {
            to_socket: &mut to_socket,
            current_time: now,
        });

        if !to_socket.is_empty() {
            if let Err(error) = self.transport.send(&to_socket) {
                self.process_protocol_events(now);
                self.fail_connection(now, error);
                return;
            }
        }

        self.process_protocol_events(now);

        match result {
            Ok(()) => {}
            Err(MqttifyError::UserInitiatedDisconnect(_)) => { self.finish_user_disconnect(now); }
            Err(error) => { self.fail_connection(now, error); }
        }
    }

    fn service_reconnect(&mut self, now: Instant) {
        let attempt_due = self.reconnect.service(now);
        if attempt_due && self.state == ConnectionState::Reconnecting && self.desired_connected {
            self.begin_connection_attempt(now);
        }
    }

    // Tears down the transport and the connection-scoped protocol state.  Session state survives.
    fn close_connection(&mut self, now: Instant) {
        self.transport.close();
        self.connection_id += 1;
        self.transport_connect_deadline = None;

        if self.protocol_state.state() != ProtocolStateType::Disconnected {
            let result = self.protocol_state.handle_network_event(NetworkEventContext {
                event: NetworkEvent::ConnectionClosed,
                current_time: now,
            });

            if let Err(error) = result {
                error!("MqttClient {} - protocol state rejected connection closure: {}", self.instance_id, error);
            }
        }

        self.process_protocol_events(now);
    }

    fn finish_user_disconnect(&mut self, now: Instant) {
        info!("MqttClient {} - disconnect complete", self.instance_id);
        self.close_connection(now);
        self.change_state(ConnectionState::Disconnected);
    }

    fn fail_connection(&mut self, now: Instant, error: MqttifyError) {
        let previous_state = self.state;
        warn!("MqttClient {} - connection failed in state {}: {}", self.instance_id, previous_state, error);

        self.close_connection(now);

        match previous_state {
            ConnectionState::Connecting => {
                let connack = self.last_connack_rejection.take();
                self.emit_event(ClientEvent::ConnectFailed(ConnectFailedEvent { error, connack }));
                self.change_state(ConnectionState::Disconnected);
                self.schedule_reconnect(now);
            }
            ConnectionState::Connected => {
                let disconnect = self.last_server_disconnect.take();
                self.emit_event(ClientEvent::ConnectionLost(ConnectionLostEvent { error, disconnect }));
                self.change_state(ConnectionState::Disconnected);
                self.schedule_reconnect(now);
            }
            _ => {
                self.emit_event(ClientEvent::Error(ErrorEvent { error }));
                self.change_state(ConnectionState::Disconnected);
            }
        }
    }

    fn schedule_reconnect(&mut self, now: Instant) {
        if !self.desired_connected {
            return;
        }

        match self.reconnect.on_connection_failed(now) {
            ReconnectDecision::RetryAt(_) => {
                self.change_state(ConnectionState::Reconnecting);
            }
            ReconnectDecision::Abandon(attempts) => {
                self.desired_connected = false;
                self.emit_event(ClientEvent::ReconnectionAbandoned(ReconnectionAbandonedEvent { attempts }));
            }
        }
    }

    fn process_protocol_events(&mut self, now: Instant) {
        let mut events = VecDeque::new();
        self.protocol_state.drain_events(&mut events);

        for event in events {
            match event {
                ProtocolEvent::ConnectionSuccess { connack, settings } => {
                    self.reconnect.on_connection_established(now, settings.server_keep_alive);
                    self.change_state(ConnectionState::Connected);
                    self.emit_event(ClientEvent::ConnectionSuccess(ConnectionSuccessEvent { connack, settings }));
                }
                ProtocolEvent::ConnackRejected(connack) => {
                    self.last_connack_rejection = Some(connack);
                }
                ProtocolEvent::SessionReset { abandoned_operations } => {
                    self.emit_event(ClientEvent::SessionReset(SessionResetEvent { abandoned_operations }));
                }
                ProtocolEvent::ServerDisconnect(disconnect) => {
                    self.last_server_disconnect = Some(disconnect);
                }
                ProtocolEvent::MessageReceived { publish, handlers } => {
                    self.dispatch(ClientEvent::MessageReceived(MessageReceivedEvent { publish }), handlers);
                }
                ProtocolEvent::PublishComplete { operation_id, result } => {
                    self.emit_event(ClientEvent::PublishComplete(PublishCompleteEvent { operation_id, result }));
                }
                ProtocolEvent::SubscribeComplete { operation_id, result } => {
                    self.emit_event(ClientEvent::SubscribeResult(SubscribeResultEvent { operation_id, result }));
                }
                ProtocolEvent::UnsubscribeComplete { operation_id, result } => {
                    self.emit_event(ClientEvent::UnsubscribeResult(UnsubscribeResultEvent { operation_id, result }));
                }
            }
        }
    }

    fn change_state(&mut self, next_state: ConnectionState) {
        if next_state == self.state {
            return;
        }

        let previous = self.state;
        info!("MqttClient {} - transitioning from {} to {}", self.instance_id, previous, next_state);
        self.state = next_state;

        self.emit_event(ClientEvent::ConnectionStateChanged(ConnectionStateChangedEvent {
            previous,
            current: next_state,
        }));
    }

    fn emit_event(&self, event: ClientEvent) {
        self.dispatch(event, Vec::new());
    }

    fn dispatch(&self, event: ClientEvent, message_handlers: Vec<MessageHandler>) {
        debug!("MqttClient {} - emitting {}", self.instance_id, event);

        self.dispatcher.dispatch(DispatchItem {
            event: Arc::new(event),
            listeners: self.listeners.values().cloned().collect(),
            message_handlers,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::Credentials;
    use crate::transport::testing::*;
    use assert_matches::assert_matches;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct ClientFixture {
        client: MqttClient,
        network: MockTransportHandle,
        events: Arc<Mutex<Vec<Arc<ClientEvent>>>>,
        start: Instant,
        version: ProtocolVersion,
    }

    fn test_reconnect_options(policy: MaxRetriesPolicy) -> ReconnectOptions {
        ReconnectOptions::builder()
            .with_reconnect_period_jitter(ExponentialBackoffJitterType::None)
            .with_base_reconnect_period(Duration::from_secs(1))
            .with_max_reconnect_period(Duration::from_secs(8))
            .with_max_retries_policy(policy)
            .build()
    }

    impl ClientFixture {
        fn new_with(settings: ConnectionSettings, version: ProtocolVersion, policy: MaxRetriesPolicy) -> Self {
            let connect_options = ConnectOptions::builder()
                .with_client_id("fixture-client")
                .with_keep_alive_interval_seconds(60)
                .build();

            let client_options = ClientOptions::builder()
                .with_protocol_version(version)
                .with_dispatch_mode(DispatchMode::Direct)
                .with_connect_timeout(Duration::from_secs(5))
                .with_reconnect_options(test_reconnect_options(policy))
                .build();

            let (transport, network) = new_mock_transport();
            let mut client = MqttClient::new(settings, connect_options, client_options, Box::new(transport));

            let events = Arc::new(Mutex::new(Vec::new()));
            let listener_events = events.clone();
            client.add_event_listener(Arc::new(move |event: Arc<ClientEvent>| {
                listener_events.lock().unwrap().push(event);
            }));

            ClientFixture {
                client,
                network,
                events,
                start: Instant::now(),
                version,
            }
        }

        fn new(version: ProtocolVersion) -> Self {
            ClientFixture::new_with(default_settings(), version, MaxRetriesPolicy::Forever)
        }

        fn at(&self, elapsed_millis: u64) -> Instant {
            self.start + Duration::from_millis(elapsed_millis)
        }

        fn service(&mut self, elapsed_millis: u64) {
            let now = self.at(elapsed_millis);
            self.client.service(now).unwrap();
        }

        fn take_events(&self) -> Vec<Arc<ClientEvent>> {
            std::mem::take(&mut *self.events.lock().unwrap())
        }

        fn state_changes(&self) -> Vec<(ConnectionState, ConnectionState)> {
            self.events.lock().unwrap().iter().filter_map(|event| {
                match event.as_ref() {
                    ClientEvent::ConnectionStateChanged(change) => { Some((change.previous, change.current)) }
                    _ => { None }
                }
            }).collect()
        }

        fn written(&self) -> Vec<MqttPacket> {
            self.network.take_written_packets(self.version)
        }

        fn deliver(&self, packet: MqttPacket) {
            self.network.deliver(&packet, self.version);
        }

        // Drives a full handshake starting at the given time.
        fn establish(&mut self, elapsed_millis: u64, session_present: bool) {
            self.network.complete_connect();
            self.service(elapsed_millis);
            assert_matches!(self.written().as_slice(), [MqttPacket::Connect(_)]);

            self.deliver(MqttPacket::Connack(ConnackPacket {
                session_present,
                ..Default::default()
            }));
            self.service(elapsed_millis);
            assert_eq!(ConnectionState::Connected, self.client.state());
        }

        fn connect(&mut self) {
            let now = self.at(0);
            self.client.connect(now).unwrap();
            self.establish(0, false);
        }
    }

    fn default_settings() -> ConnectionSettings {
        ConnectionSettings::new(Endpoint::new(ConnectionProtocol::Mqtt, "broker.local", 1883))
    }

    fn qos1_publish(topic: &str) -> PublishPacket {
        PublishPacket::new(topic, "payload".as_bytes(), QualityOfService::AtLeastOnce, false)
    }

    #[test]
    fn connect_reaches_connected() {
        let mut fixture = ClientFixture::new(ProtocolVersion::Mqtt5);
        fixture.connect();

        assert_eq!(1, fixture.network.connect_count());
        assert_eq!(Some(default_settings().endpoint().clone()), fixture.network.last_endpoint());
        assert_eq!(vec!((ConnectionState::Disconnected, ConnectionState::Connecting), (ConnectionState::Connecting, ConnectionState::Connected)), fixture.state_changes());
        assert!(fixture.take_events().iter().any(|event| matches!(event.as_ref(), ClientEvent::ConnectionSuccess(_))));
        assert!(fixture.client.negotiated_settings().is_some());
    }

    #[test]
    fn connect_twice_is_rejected() {
        let mut fixture = ClientFixture::new(ProtocolVersion::Mqtt5);
        fixture.client.connect(fixture.at(0)).unwrap();

        assert_matches!(fixture.client.connect(fixture.at(0)), Err(MqttifyError::AlreadyConnected(_)));
        fixture.establish(0, false);
        assert_matches!(fixture.client.connect(fixture.at(0)), Err(MqttifyError::AlreadyConnected(_)));
    }

    #[test]
    fn operations_before_connect_fail() {
        let mut fixture = ClientFixture::new(ProtocolVersion::Mqtt311);
        let now = fixture.at(0);

        assert_matches!(fixture.client.publish(now, qos1_publish("a/b")), Err(MqttifyError::NotConnected(_)));
        assert_matches!(fixture.client.subscribe(now, SubscribePacket::default(), None), Err(MqttifyError::NotConnected(_)));
        assert_matches!(fixture.client.disconnect(now, None), Err(MqttifyError::NotConnected(_)));
    }

    #[test]
    fn publish_completes_on_puback() {
        let mut fixture = ClientFixture::new(ProtocolVersion::Mqtt5);
        fixture.connect();
        fixture.take_events();

        let operation_id = fixture.client.publish(fixture.at(10), qos1_publish("a/b")).unwrap();
        fixture.service(10);

        let packet_id =
            match fixture.written().as_slice() {
                [MqttPacket::Publish(publish)] => { publish.packet_id }
                other => { panic!("unexpected writes {:?}", other) }
            };

        fixture.deliver(MqttPacket::Puback(PubackPacket { packet_id, ..Default::default() }));
        fixture.service(20);

        let events = fixture.take_events();
        assert_matches!(events.as_slice(), [event] if matches!(event.as_ref(),
            ClientEvent::PublishComplete(PublishCompleteEvent { operation_id: id, result: Ok(PublishResponse::Qos1(_)) }) if *id == operation_id));
    }

    #[test]
    fn rejected_connack_reports_failure_and_retries() {
        let mut fixture = ClientFixture::new(ProtocolVersion::Mqtt5);
        fixture.client.connect(fixture.at(0)).unwrap();
        fixture.network.complete_connect();
        fixture.service(0);
        fixture.written();

        fixture.deliver(MqttPacket::Connack(ConnackPacket {
            reason_code: ConnectReasonCode::NotAuthorized,
            ..Default::default()
        }));
        fixture.service(5);

        let failure = fixture.take_events().into_iter().find(|event| matches!(event.as_ref(), ClientEvent::ConnectFailed(_))).unwrap();
        assert_matches!(failure.as_ref(), ClientEvent::ConnectFailed(ConnectFailedEvent { error: MqttifyError::ConnectionEstablishmentFailure(_), connack: Some(connack) }) if connack.reason_code == ConnectReasonCode::NotAuthorized);
        assert_eq!(ConnectionState::Reconnecting, fixture.client.state());
        assert_eq!(1, fixture.network.close_count());

        // no jitter, base period of one second
        fixture.service(900);
        assert_eq!(1, fixture.network.connect_count());
        fixture.service(1005);
        assert_eq!(2, fixture.network.connect_count());
        assert_eq!(ConnectionState::Connecting, fixture.client.state());
    }

    #[test]
    fn transport_connect_timeout() {
        let mut fixture = ClientFixture::new(ProtocolVersion::Mqtt5);
        fixture.client.connect(fixture.at(0)).unwrap();
        assert_eq!(Some(fixture.at(5000)), fixture.client.next_service_time(fixture.at(0)));

        fixture.service(4999);
        assert_eq!(ConnectionState::Connecting, fixture.client.state());

        fixture.service(5000);
        assert!(fixture.take_events().iter().any(|event| matches!(event.as_ref(), ClientEvent::ConnectFailed(ConnectFailedEvent { connack: None, .. }))));
        assert_eq!(ConnectionState::Reconnecting, fixture.client.state());
    }

    #[test]
    fn immediate_transport_failure_goes_through_backoff() {
        let mut fixture = ClientFixture::new(ProtocolVersion::Mqtt311);
        fixture.network.set_reject_connect(true);

        fixture.client.connect(fixture.at(0)).unwrap();
        assert_eq!(ConnectionState::Reconnecting, fixture.client.state());
        assert_eq!(vec!(
            (ConnectionState::Disconnected, ConnectionState::Connecting),
            (ConnectionState::Connecting, ConnectionState::Disconnected),
            (ConnectionState::Disconnected, ConnectionState::Reconnecting)), fixture.state_changes());
    }

    #[test]
    fn limited_retries_abandon_reconnection() {
        let settings = default_settings();
        let mut fixture = ClientFixture::new_with(settings, ProtocolVersion::Mqtt5, MaxRetriesPolicy::Limited(2));
        fixture.client.connect(fixture.at(0)).unwrap();

        // first failure schedules attempt 1 at +1s, second schedules attempt 2 at +2s
        fixture.network.fail_connect();
        fixture.service(0);
        fixture.service(1000);
        fixture.network.fail_connect();
        fixture.service(1000);
        fixture.service(3000);
        fixture.network.fail_connect();
        fixture.service(3000);

        assert_eq!(3, fixture.network.connect_count());
        assert_eq!(ConnectionState::Disconnected, fixture.client.state());
        assert!(fixture.take_events().iter().any(|event| matches!(event.as_ref(), ClientEvent::ReconnectionAbandoned(ReconnectionAbandonedEvent { attempts: 2 }))));
        assert_eq!(None, fixture.client.next_service_time(fixture.at(3000)));

        // a user connect starts over
        fixture.client.connect(fixture.at(4000)).unwrap();
        assert_eq!(4, fixture.network.connect_count());
    }

    #[test]
    fn lost_connection_resumes_session_and_retransmits() {
        let mut fixture = ClientFixture::new(ProtocolVersion::Mqtt5);
        fixture.connect();

        let operation_id = fixture.client.publish(fixture.at(10), qos1_publish("a/b")).unwrap();
        fixture.service(10);
        assert_eq!(1, fixture.written().len());
        fixture.take_events();

        fixture.network.remote_close();
        fixture.service(20);
        let events = fixture.take_events();
        assert!(events.iter().any(|event| matches!(event.as_ref(), ClientEvent::ConnectionLost(ConnectionLostEvent { disconnect: None, .. }))));
        assert!(!events.iter().any(|event| matches!(event.as_ref(), ClientEvent::PublishComplete(_))));
        assert_eq!(ConnectionState::Reconnecting, fixture.client.state());

        fixture.service(1020);
        assert_eq!(2, fixture.network.connect_count());
        fixture.network.complete_connect();
        fixture.service(1020);
        fixture.written();
        fixture.deliver(MqttPacket::Connack(ConnackPacket { session_present: true, ..Default::default() }));
        fixture.service(1030);

        let packet_id =
            match fixture.written().as_slice() {
                [MqttPacket::Publish(publish)] => {
                    assert!(publish.duplicate);
                    publish.packet_id
                }
                other => { panic!("unexpected writes {:?}", other) }
            };

        fixture.deliver(MqttPacket::Puback(PubackPacket { packet_id, ..Default::default() }));
        fixture.service(1040);

        let completions : Vec<u64> = fixture.take_events().iter().filter_map(|event| {
            match event.as_ref() {
                ClientEvent::PublishComplete(complete) => { Some(complete.operation_id) }
                _ => { None }
            }
        }).collect();
        assert_eq!(vec!(operation_id), completions);
    }

    #[test]
    fn session_reset_is_reported() {
        let mut fixture = ClientFixture::new(ProtocolVersion::Mqtt5);
        fixture.connect();

        let operation_id = fixture.client.publish(fixture.at(10), qos1_publish("a/b")).unwrap();
        fixture.service(10);
        fixture.network.remote_close();
        fixture.service(20);
        fixture.service(1020);
        fixture.take_events();

        fixture.network.complete_connect();
        fixture.service(1020);
        fixture.written();
        fixture.deliver(MqttPacket::Connack(ConnackPacket { session_present: false, ..Default::default() }));
        fixture.service(1030);

        let events = fixture.take_events();
        assert!(events.iter().any(|event| matches!(event.as_ref(),
            ClientEvent::PublishComplete(PublishCompleteEvent { operation_id: id, result: Err(MqttifyError::SessionReset(_)) }) if *id == operation_id)));
        assert!(events.iter().any(|event| matches!(event.as_ref(), ClientEvent::SessionReset(reset) if reset.abandoned_operations == vec!(operation_id))));
    }

    #[test]
    fn server_disconnect_is_attached_to_connection_lost() {
        let mut fixture = ClientFixture::new(ProtocolVersion::Mqtt5);
        fixture.connect();
        fixture.take_events();

        fixture.deliver(MqttPacket::Disconnect(DisconnectPacket {
            reason_code: DisconnectReasonCode::ServerShuttingDown,
            ..Default::default()
        }));
        fixture.service(10);

        let events = fixture.take_events();
        assert!(events.iter().any(|event| matches!(event.as_ref(),
            ClientEvent::ConnectionLost(ConnectionLostEvent { disconnect: Some(disconnect), .. }) if disconnect.reason_code == DisconnectReasonCode::ServerShuttingDown)));
        assert_eq!(ConnectionState::Reconnecting, fixture.client.state());
    }

    #[test]
    fn user_disconnect_flushes_and_stays_down() {
        let mut fixture = ClientFixture::new(ProtocolVersion::Mqtt311);
        fixture.connect();

        fixture.client.disconnect(fixture.at(10), None).unwrap();
        assert_eq!(ConnectionState::Disconnecting, fixture.client.state());
        assert_eq!(Some(fixture.at(10)), fixture.client.next_service_time(fixture.at(10)));

        fixture.service(10);
        assert_matches!(fixture.written().as_slice(), [MqttPacket::Disconnect(_)]);
        assert_eq!(ConnectionState::Disconnected, fixture.client.state());
        assert_eq!(1, fixture.network.close_count());
        assert!(!fixture.network.has_connection());

        fixture.service(60_000);
        assert_eq!(1, fixture.network.connect_count());
        assert_eq!(None, fixture.client.next_service_time(fixture.at(60_000)));
    }

    #[test]
    fn disconnect_abandons_connection_attempt() {
        let mut fixture = ClientFixture::new(ProtocolVersion::Mqtt5);
        fixture.client.connect(fixture.at(0)).unwrap();
        let stale_sink = fixture.network.sink();

        fixture.client.disconnect(fixture.at(5), None).unwrap();
        assert_eq!(ConnectionState::Disconnected, fixture.client.state());

        stale_sink.on_connected();
        fixture.service(10);
        assert_eq!(ConnectionState::Disconnected, fixture.client.state());
        assert!(fixture.written().is_empty());
    }

    #[test]
    fn failed_send_drops_connection() {
        let mut fixture = ClientFixture::new(ProtocolVersion::Mqtt5);
        fixture.connect();

        fixture.network.set_fail_sends(true);
        fixture.client.publish(fixture.at(10), qos1_publish("a/b")).unwrap();
        fixture.service(10);

        assert!(fixture.take_events().iter().any(|event| matches!(event.as_ref(), ClientEvent::ConnectionLost(ConnectionLostEvent { error: MqttifyError::TransportError(_), .. }))));
        assert_eq!(ConnectionState::Reconnecting, fixture.client.state());
    }

    #[test]
    fn subscription_handler_receives_messages() {
        let mut fixture = ClientFixture::new(ProtocolVersion::Mqtt5);
        fixture.connect();

        let received = Arc::new(AtomicUsize::new(0));
        let handler_received = received.clone();
        let handler : MessageHandler = Arc::new(move |_: &MessageReceivedEvent| { handler_received.fetch_add(1, Ordering::SeqCst); });

        let subscribe = SubscribePacket {
            subscriptions: vec!(Subscription::new("sensors/+", QualityOfService::AtMostOnce)),
            ..Default::default()
        };
        fixture.client.subscribe(fixture.at(10), subscribe, Some(handler)).unwrap();
        fixture.service(10);
        fixture.written();
        fixture.take_events();

        fixture.deliver(MqttPacket::Publish(PublishPacket::new("sensors/1", "21.5".as_bytes(), QualityOfService::AtMostOnce, false)));
        fixture.service(20);

        assert_eq!(1, received.load(Ordering::SeqCst));
        assert!(fixture.take_events().iter().any(|event| matches!(event.as_ref(), ClientEvent::MessageReceived(message) if message.publish.topic == "sensors/1")));
    }

    #[test]
    fn destroy_fails_outstanding_operations() {
        let mut fixture = ClientFixture::new(ProtocolVersion::Mqtt5);
        fixture.connect();

        let operation_id = fixture.client.publish(fixture.at(10), qos1_publish("a/b")).unwrap();
        fixture.service(10);
        fixture.take_events();

        fixture.client.destroy(fixture.at(20));
        assert!(fixture.take_events().iter().any(|event| matches!(event.as_ref(),
            ClientEvent::PublishComplete(PublishCompleteEvent { operation_id: id, result: Err(MqttifyError::EngineDestroyed(_)) }) if *id == operation_id)));
        assert_eq!(ConnectionState::Disconnected, fixture.client.state());

        assert_matches!(fixture.client.service(fixture.at(30)), Err(MqttifyError::EngineDestroyed(_)));
        assert_matches!(fixture.client.connect(fixture.at(30)), Err(MqttifyError::EngineDestroyed(_)));
        assert_matches!(fixture.client.publish(fixture.at(30), qos1_publish("a/b")), Err(MqttifyError::EngineDestroyed(_)));
    }

    #[test]
    fn url_credentials_reach_the_connect_packet() {
        let settings = default_settings().with_credentials(Credentials::new("user", Some("secret".as_bytes())));
        let mut fixture = ClientFixture::new_with(settings, ProtocolVersion::Mqtt311, MaxRetriesPolicy::Forever);

        fixture.client.connect(fixture.at(0)).unwrap();
        fixture.network.complete_connect();
        fixture.service(0);

        assert_matches!(fixture.written().as_slice(), [MqttPacket::Connect(connect)]
            if connect.username.as_deref() == Some("user") && connect.password.as_deref() == Some("secret".as_bytes()));
    }

    #[test]
    fn removed_listener_sees_nothing() {
        let mut fixture = ClientFixture::new(ProtocolVersion::Mqtt5);
        let counter = Arc::new(AtomicUsize::new(0));
        let listener_counter = counter.clone();
        let handle = fixture.client.add_event_listener(Arc::new(move |_: Arc<ClientEvent>| { listener_counter.fetch_add(1, Ordering::SeqCst); }));

        assert!(fixture.client.remove_event_listener(handle));
        assert!(!fixture.client.remove_event_listener(handle));

        fixture.connect();
        assert_eq!(0, counter.load(Ordering::SeqCst));
    }

    #[test]
    fn marshalled_events_wait_for_the_pump() {
        let client_options = ClientOptions::builder()
            .with_dispatch_mode(DispatchMode::Marshalled)
            .build();
        let (transport, _network) = new_mock_transport();
        let mut client = MqttClient::new(default_settings(), ConnectOptions::builder().build(), client_options, Box::new(transport));

        let counter = Arc::new(AtomicUsize::new(0));
        let listener_counter = counter.clone();
        client.add_event_listener(Arc::new(move |_: Arc<ClientEvent>| { listener_counter.fetch_add(1, Ordering::SeqCst); }));

        let pump = client.take_event_pump().unwrap();
        assert!(client.take_event_pump().is_none());

        client.connect(Instant::now()).unwrap();
        assert_eq!(0, counter.load(Ordering::SeqCst));
        assert_eq!(1, pump.pump());
        assert_eq!(1, counter.load(Ordering::SeqCst));
    }
}
