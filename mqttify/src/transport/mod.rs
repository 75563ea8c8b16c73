/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
The boundary between the protocol engine and the byte stream it runs over.

A [`TransportAdapter`] opens connections asynchronously and reports everything that happens to
them through the [`TransportEventSink`] it was handed at connect time.  Each sink is tagged with
the id of the connection attempt it belongs to; the client drops events from attempts it has
already abandoned, so an adapter never needs to worry about reporting late.
 */

#[cfg(feature = "tokio-rustls")]
pub mod tls;

#[cfg(feature = "tokio")]
pub mod tokio_impl;

use crate::config::Endpoint;
use crate::error::{MqttifyError, MqttifyResult};

use log::*;
use std::sync::mpsc;

#[derive(Debug)]
pub(crate) enum TransportEvent {
    Connected,
    ConnectFailed(MqttifyError),
    BytesReceived(Vec<u8>),
    Closed(Option<MqttifyError>),
}

pub(crate) struct TaggedTransportEvent {
    pub(crate) connection_id: u64,
    pub(crate) event: TransportEvent,
}

/// Where a transport adapter reports the progress of one connection.
///
/// Sinks are cheap to clone and may be used from any thread.
#[derive(Clone)]
pub struct TransportEventSink {
    connection_id: u64,
    sender: mpsc::Sender<TaggedTransportEvent>,
}

impl TransportEventSink {

    pub(crate) fn new(connection_id: u64, sender: mpsc::Sender<TaggedTransportEvent>) -> Self {
        TransportEventSink {
            connection_id,
            sender,
        }
    }

    /// Id of the connection attempt this sink reports for
    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    fn send(&self, event: TransportEvent) {
        let tagged = TaggedTransportEvent {
            connection_id: self.connection_id,
            event,
        };

        if self.sender.send(tagged).is_err() {
            debug!("TransportEventSink - client for connection {} is gone, dropping event", self.connection_id);
        }
    }

    /// The connection is established and ready to carry MQTT traffic.
    pub fn on_connected(&self) {
        self.send(TransportEvent::Connected);
    }

    /// The connection could not be established.
    pub fn on_connect_failed(&self, error: MqttifyError) {
        self.send(TransportEvent::ConnectFailed(error));
    }

    /// Bytes arrived, in stream order.  Fragment boundaries carry no meaning.
    pub fn on_bytes_received(&self, bytes: &[u8]) {
        self.send(TransportEvent::BytesReceived(bytes.to_vec()));
    }

    /// An established connection ended.  `None` means the remote end closed cleanly.
    pub fn on_transport_closed(&self, error: Option<MqttifyError>) {
        self.send(TransportEvent::Closed(error));
    }
}

/// An ordered, reliable byte stream the client can open, write to and close.
///
/// No method may block for the duration of a network operation.  `connect` starts an attempt
/// and returns; the outcome arrives later through the sink.
pub trait TransportAdapter : Send {

    /// Starts connecting to an endpoint.  Any previous connection is closed first.
    fn connect(&mut self, endpoint: &Endpoint, sink: TransportEventSink) -> MqttifyResult<()>;

    /// Queues bytes for writing on the current connection.
    fn send(&mut self, bytes: &[u8]) -> MqttifyResult<()>;

    /// Ends the current connection or connection attempt.  Bytes already passed to `send` are
    /// flushed when the connection is established.  No further events are required.
    fn close(&mut self);
}

/// Adapter for clients whose transport is driven entirely by the host.  Every connect fails.
#[derive(Default)]
pub struct NullTransport {}

impl TransportAdapter for NullTransport {
    fn connect(&mut self, endpoint: &Endpoint, _: TransportEventSink) -> MqttifyResult<()> {
        Err(MqttifyError::new_transport_error(format!("no transport configured for {}", endpoint)))
    }

    fn send(&mut self, _: &[u8]) -> MqttifyResult<()> {
        Err(MqttifyError::new_transport_error("no transport configured"))
    }

    fn close(&mut self) {}
}
