/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
A module containing the core crate error enumeration, context structures, the error category
taxonomy, and conversion definitions.
 */

use crate::mqtt::PacketType;

use std::error::Error;
use std::fmt;

type BoxedSource = Box<dyn Error + Send + Sync + 'static>;

/// Additional details about a MalformedPacket error variant
#[derive(Debug)]
pub struct MalformedPacketContext {
    source: BoxedSource
}

/// Additional details about a ProtocolViolation error variant
#[derive(Debug)]
pub struct ProtocolViolationContext {
    source: BoxedSource
}

/// Additional details about an EncodingFailure error variant
#[derive(Debug)]
pub struct EncodingFailureContext {
    source: BoxedSource
}

/// Additional details about a ConnectionEstablishmentFailure error variant
#[derive(Debug)]
pub struct ConnectionEstablishmentFailureContext {
    source: BoxedSource
}

/// Additional details about a ConnectionClosed error variant
#[derive(Debug)]
pub struct ConnectionClosedContext {
    source: BoxedSource
}

/// Additional details about a TransportError error variant
#[derive(Debug)]
pub struct TransportErrorContext {
    source: BoxedSource
}

/// Additional details about an AlreadyConnected error variant
#[derive(Debug)]
pub struct AlreadyConnectedContext {
}

/// Additional details about a NotConnected error variant
#[derive(Debug)]
pub struct NotConnectedContext {
}

/// Additional details about an InvalidArgument error variant
#[derive(Debug)]
pub struct InvalidArgumentContext {

    /// type of packet the invalid argument was bound for, if any
    pub packet_type: Option<PacketType>,

    source: BoxedSource
}

/// Additional details about an IdentifierSpaceExhausted error variant
#[derive(Debug)]
pub struct IdentifierSpaceExhaustedContext {
}

/// Additional details about an InFlightLimitExceeded error variant
#[derive(Debug)]
pub struct InFlightLimitExceededContext {

    /// the in-flight cap that was hit
    pub limit: usize,
}

/// Additional details about an AckTimeout error variant
#[derive(Debug)]
pub struct AckTimeoutContext {
}

/// Additional details about a SessionReset error variant
#[derive(Debug)]
pub struct SessionResetContext {
}

/// Additional details about a UserInitiatedDisconnect error variant
#[derive(Debug)]
pub struct UserInitiatedDisconnectContext {
}

/// Additional details about an EngineDestroyed error variant
#[derive(Debug)]
pub struct EngineDestroyedContext {
}

/// Additional details about a StdIoError error variant
#[derive(Debug)]
pub struct StdIoErrorContext {
    source: BoxedSource
}

/// Additional details about a TlsError error variant
#[derive(Debug)]
pub struct TlsErrorContext {
    source: BoxedSource
}

/// Additional details about an OperationChannelFailure error variant
#[derive(Debug)]
pub struct OperationChannelFailureContext {
    source: BoxedSource
}

/// Additional details about an InternalStateError error variant
#[derive(Debug)]
pub struct InternalStateErrorContext {
    source: BoxedSource
}

/// Basic error type for the entire mqttify crate.
#[derive(Debug)]
#[non_exhaustive]
pub enum MqttifyError {

    /// Inbound bytes could not be decoded into a valid MQTT packet.  Bad header flags, an
    /// overlong variable length integer, unknown properties, wildcards in a publish topic, or
    /// a null character in a string all land here.  Always connection-fatal.
    MalformedPacket(MalformedPacketContext),

    /// The broker did something the MQTT protocol does not allow in the current state, for
    /// example a Suback with the wrong number of reason codes or an unexpected packet type.
    /// Always connection-fatal.
    ProtocolViolation(ProtocolViolationContext),

    /// A packet could not be encoded for the negotiated protocol version, typically because an
    /// MQTT5-only field was set on a packet bound for an MQTT 3.1.1 connection.
    EncodingFailure(EncodingFailureContext),

    /// A connection attempt finished, for any reason, before a successful Connack arrived.
    ConnectionEstablishmentFailure(ConnectionEstablishmentFailureContext),

    /// An established connection was closed.
    ConnectionClosed(ConnectionClosedContext),

    /// Error surfacing from the transport layer, including send failures.
    TransportError(TransportErrorContext),

    /// A connect was requested while the client was already connecting or connected.
    AlreadyConnected(AlreadyConnectedContext),

    /// An operation was submitted that requires a connection (or a pending one) and there is none.
    NotConnected(NotConnectedContext),

    /// An operation was submitted with arguments that can never succeed.
    InvalidArgument(InvalidArgumentContext),

    /// All 65535 packet identifiers are currently in use.
    IdentifierSpaceExhausted(IdentifierSpaceExhaustedContext),

    /// The configured (or broker-negotiated) cap on in-flight operations has been reached.
    InFlightLimitExceeded(InFlightLimitExceededContext),

    /// An operation was retransmitted the maximum number of times without being acknowledged.
    AckTimeout(AckTimeoutContext),

    /// Applied to operations that had been transmitted when the broker discarded the session.
    SessionReset(SessionResetContext),

    /// Applied to the connection when it was shut down by a user disconnect.
    UserInitiatedDisconnect(UserInitiatedDisconnectContext),

    /// Applied to every unfinished operation when the client is destroyed.
    EngineDestroyed(EngineDestroyedContext),

    /// Generic error wrapping std::io::Error
    StdIoError(StdIoErrorContext),

    /// Error associated with building TLS configuration or applying it to a connection.
    TlsError(TlsErrorContext),

    /// Failure sending or receiving on an internal channel.
    OperationChannelFailure(OperationChannelFailureContext),

    /// Something happened that should never happen.  Always indicates a bug in the client.
    InternalStateError(InternalStateErrorContext),
}

/// Coarse classification of errors by how callers should react to them.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorCategory {

    /// The peer violated the wire protocol.  The connection is always torn down.
    ProtocolViolation,

    /// The transport failed.  Recoverable through reconnection unless the user disconnected.
    TransportError,

    /// The caller made an invalid request.  Returned synchronously with no state change.
    ApplicationError,

    /// A resource limit was hit.  The request may succeed if retried later.
    ResourceExhaustion,

    /// A packet could not be encoded for the negotiated protocol version.
    EncodingError,

    /// Client-internal failure.
    Internal,
}

impl MqttifyError {

    pub(crate) fn new_malformed_packet(source: impl Into<BoxedSource>) -> Self {
        MqttifyError::MalformedPacket(
            MalformedPacketContext {
                source : source.into()
            }
        )
    }

    pub(crate) fn new_protocol_violation(source: impl Into<BoxedSource>) -> Self {
        MqttifyError::ProtocolViolation(
            ProtocolViolationContext {
                source : source.into()
            }
        )
    }

    pub(crate) fn new_encoding_failure(source: impl Into<BoxedSource>) -> Self {
        MqttifyError::EncodingFailure(
            EncodingFailureContext {
                source : source.into()
            }
        )
    }

    pub(crate) fn new_connection_establishment_failure(source: impl Into<BoxedSource>) -> Self {
        MqttifyError::ConnectionEstablishmentFailure(
            ConnectionEstablishmentFailureContext {
                source : source.into()
            }
        )
    }

    pub(crate) fn new_connection_closed(source: impl Into<BoxedSource>) -> Self {
        MqttifyError::ConnectionClosed(
            ConnectionClosedContext {
                source : source.into()
            }
        )
    }

    /// Constructs a new TransportError variant from an existing error.  Typically this should be
    /// an error surfacing from a third-party transport library.
    pub fn new_transport_error(source: impl Into<BoxedSource>) -> Self {
        MqttifyError::TransportError(
            TransportErrorContext {
                source : source.into()
            }
        )
    }

    pub(crate) fn new_already_connected() -> Self {
        MqttifyError::AlreadyConnected(AlreadyConnectedContext {})
    }

    pub(crate) fn new_not_connected() -> Self {
        MqttifyError::NotConnected(NotConnectedContext {})
    }

    pub(crate) fn new_invalid_argument(packet_type: Option<PacketType>, source: impl Into<BoxedSource>) -> Self {
        MqttifyError::InvalidArgument(
            InvalidArgumentContext {
                packet_type,
                source : source.into()
            }
        )
    }

    pub(crate) fn new_identifier_space_exhausted() -> Self {
        MqttifyError::IdentifierSpaceExhausted(IdentifierSpaceExhaustedContext {})
    }

    pub(crate) fn new_in_flight_limit_exceeded(limit: usize) -> Self {
        MqttifyError::InFlightLimitExceeded(InFlightLimitExceededContext { limit })
    }

    pub(crate) fn new_ack_timeout() -> Self {
        MqttifyError::AckTimeout(AckTimeoutContext {})
    }

    pub(crate) fn new_session_reset() -> Self {
        MqttifyError::SessionReset(SessionResetContext {})
    }

    pub(crate) fn new_user_initiated_disconnect() -> Self {
        MqttifyError::UserInitiatedDisconnect(UserInitiatedDisconnectContext {})
    }

    pub(crate) fn new_engine_destroyed() -> Self {
        MqttifyError::EngineDestroyed(EngineDestroyedContext {})
    }

    /// Constructs a StdIoError variant from an existing error.  Typically this should be a
    /// std::io::Error
    pub fn new_std_io_error(source: impl Into<BoxedSource>) -> Self {
        MqttifyError::StdIoError(
            StdIoErrorContext {
                source : source.into()
            }
        )
    }

    /// Constructs a new TlsError variant from an existing error.
    pub fn new_tls_error(source: impl Into<BoxedSource>) -> Self {
        MqttifyError::TlsError(
            TlsErrorContext {
                source : source.into()
            }
        )
    }

    pub(crate) fn new_operation_channel_failure(source: impl Into<BoxedSource>) -> Self {
        MqttifyError::OperationChannelFailure(
            OperationChannelFailureContext {
                source : source.into()
            }
        )
    }

    pub(crate) fn new_internal_state_error(source: impl Into<BoxedSource>) -> Self {
        MqttifyError::InternalStateError(
            InternalStateErrorContext {
                source : source.into()
            }
        )
    }

    /// Maps the error onto the category that determines how it is handled.
    pub fn category(&self) -> ErrorCategory {
        match self {
            MqttifyError::MalformedPacket(_) | MqttifyError::ProtocolViolation(_) => {
                ErrorCategory::ProtocolViolation
            }
            MqttifyError::EncodingFailure(_) => { ErrorCategory::EncodingError }
            MqttifyError::ConnectionEstablishmentFailure(_) |
            MqttifyError::ConnectionClosed(_) |
            MqttifyError::TransportError(_) |
            MqttifyError::StdIoError(_) |
            MqttifyError::TlsError(_) => {
                ErrorCategory::TransportError
            }
            MqttifyError::AlreadyConnected(_) |
            MqttifyError::NotConnected(_) |
            MqttifyError::InvalidArgument(_) |
            MqttifyError::AckTimeout(_) |
            MqttifyError::SessionReset(_) |
            MqttifyError::UserInitiatedDisconnect(_) |
            MqttifyError::EngineDestroyed(_) => {
                ErrorCategory::ApplicationError
            }
            MqttifyError::IdentifierSpaceExhausted(_) | MqttifyError::InFlightLimitExceeded(_) => {
                ErrorCategory::ResourceExhaustion
            }
            MqttifyError::OperationChannelFailure(_) | MqttifyError::InternalStateError(_) => {
                ErrorCategory::Internal
            }
        }
    }

    /// Returns true if resubmitting the same request later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self.category(), ErrorCategory::ResourceExhaustion | ErrorCategory::TransportError)
    }
}

impl Error for MqttifyError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            MqttifyError::MalformedPacket(context) => { Some(context.source.as_ref()) }
            MqttifyError::ProtocolViolation(context) => { Some(context.source.as_ref()) }
            MqttifyError::EncodingFailure(context) => { Some(context.source.as_ref()) }
            MqttifyError::ConnectionEstablishmentFailure(context) => { Some(context.source.as_ref()) }
            MqttifyError::ConnectionClosed(context) => { Some(context.source.as_ref()) }
            MqttifyError::TransportError(context) => { Some(context.source.as_ref()) }
            MqttifyError::InvalidArgument(context) => { Some(context.source.as_ref()) }
            MqttifyError::StdIoError(context) => { Some(context.source.as_ref()) }
            MqttifyError::TlsError(context) => { Some(context.source.as_ref()) }
            MqttifyError::OperationChannelFailure(context) => { Some(context.source.as_ref()) }
            MqttifyError::InternalStateError(context) => { Some(context.source.as_ref()) }
            _ => { None }
        }
    }
}

impl fmt::Display for MqttifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MqttifyError::MalformedPacket(context) => {
                write!(f, "malformed MQTT packet received: {}", context.source)
            }
            MqttifyError::ProtocolViolation(context) => {
                write!(f, "broker behavior disallowed by the MQTT protocol: {}", context.source)
            }
            MqttifyError::EncodingFailure(context) => {
                write!(f, "failed to encode outbound packet: {}", context.source)
            }
            MqttifyError::ConnectionEstablishmentFailure(context) => {
                write!(f, "failed to establish an MQTT connection to the broker: {}", context.source)
            }
            MqttifyError::ConnectionClosed(context) => {
                write!(f, "client connection was closed: {}", context.source)
            }
            MqttifyError::TransportError(context) => {
                write!(f, "transport error: {}", context.source)
            }
            MqttifyError::AlreadyConnected(_) => {
                write!(f, "client is already connecting or connected")
            }
            MqttifyError::NotConnected(_) => {
                write!(f, "operation requires a connection and the client is not connected")
            }
            MqttifyError::InvalidArgument(context) => {
                match context.packet_type {
                    Some(packet_type) => { write!(f, "invalid {} request: {}", packet_type, context.source) }
                    None => { write!(f, "invalid request: {}", context.source) }
                }
            }
            MqttifyError::IdentifierSpaceExhausted(_) => {
                write!(f, "all packet identifiers are currently in use")
            }
            MqttifyError::InFlightLimitExceeded(context) => {
                write!(f, "in-flight operation limit ({}) reached", context.limit)
            }
            MqttifyError::AckTimeout(_) => {
                write!(f, "the operation was retried the maximum number of times without an ack from the broker")
            }
            MqttifyError::SessionReset(_) => {
                write!(f, "the broker discarded the session before the operation completed")
            }
            MqttifyError::UserInitiatedDisconnect(_) => {
                write!(f, "connection was shut down by user action")
            }
            MqttifyError::EngineDestroyed(_) => {
                write!(f, "the operation was incomplete when the client was destroyed")
            }
            MqttifyError::StdIoError(context) => {
                write!(f, "io error: {}", context.source)
            }
            MqttifyError::TlsError(context) => {
                write!(f, "tls error: {}", context.source)
            }
            MqttifyError::OperationChannelFailure(context) => {
                write!(f, "failure on an internal channel: {}", context.source)
            }
            MqttifyError::InternalStateError(context) => {
                write!(f, "client reached an invalid internal state; almost certainly a client bug: {}", context.source)
            }
        }
    }
}

impl From<std::io::Error> for MqttifyError {
    fn from(error: std::io::Error) -> Self {
        MqttifyError::new_std_io_error(error)
    }
}

impl From<core::str::Utf8Error> for MqttifyError {
    fn from(err: core::str::Utf8Error) -> Self {
        MqttifyError::new_malformed_packet(err)
    }
}

#[cfg(feature = "tokio-rustls")]
impl From<rustls_pki_types::InvalidDnsNameError> for MqttifyError {
    fn from(err: rustls_pki_types::InvalidDnsNameError) -> Self {
        MqttifyError::new_connection_establishment_failure(err)
    }
}

#[cfg(feature = "tokio-rustls")]
impl From<rustls::Error> for MqttifyError {
    fn from(err: rustls::Error) -> Self {
        MqttifyError::new_tls_error(err)
    }
}

#[cfg(feature = "tokio-websockets")]
impl From<tungstenite::error::Error> for MqttifyError {
    fn from(err: tungstenite::error::Error) -> Self {
        MqttifyError::new_transport_error(err)
    }
}

impl <T> From<std::sync::mpsc::SendError<T>> for MqttifyError
where T : Send + Sync + 'static {
    fn from(err: std::sync::mpsc::SendError<T>) -> Self {
        MqttifyError::new_operation_channel_failure(err)
    }
}

impl From<std::sync::mpsc::RecvError> for MqttifyError {
    fn from(err: std::sync::mpsc::RecvError) -> Self {
        MqttifyError::new_operation_channel_failure(err)
    }
}

impl From<std::sync::mpsc::TryRecvError> for MqttifyError {
    fn from(err: std::sync::mpsc::TryRecvError) -> Self {
        MqttifyError::new_operation_channel_failure(err)
    }
}

/// Crate-wide result type for functions that can fail
pub type MqttifyResult<T> = Result<T, MqttifyError>;

pub(crate) fn fold_mqtt_result<T>(base: MqttifyResult<T>, new_result: MqttifyResult<T>) -> MqttifyResult<T> {
    new_result?;
    base
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories_follow_taxonomy() {
        assert_eq!(ErrorCategory::ProtocolViolation, MqttifyError::new_malformed_packet("bad").category());
        assert_eq!(ErrorCategory::ProtocolViolation, MqttifyError::new_protocol_violation("bad").category());
        assert_eq!(ErrorCategory::EncodingError, MqttifyError::new_encoding_failure("bad").category());
        assert_eq!(ErrorCategory::TransportError, MqttifyError::new_transport_error("bad").category());
        assert_eq!(ErrorCategory::ApplicationError, MqttifyError::new_not_connected().category());
        assert_eq!(ErrorCategory::ResourceExhaustion, MqttifyError::new_identifier_space_exhausted().category());
    }

    #[test]
    fn resource_exhaustion_is_retryable() {
        assert!(MqttifyError::new_in_flight_limit_exceeded(10).is_retryable());
        assert!(MqttifyError::new_identifier_space_exhausted().is_retryable());
        assert!(!MqttifyError::new_already_connected().is_retryable());
        assert!(!MqttifyError::new_malformed_packet("nope").is_retryable());
    }

    #[test]
    fn fold_keeps_first_error() {
        let base : MqttifyResult<()> = Err(MqttifyError::new_ack_timeout());
        assert!(matches!(fold_mqtt_result(base, Ok(())), Err(MqttifyError::AckTimeout(_))));

        let base : MqttifyResult<()> = Ok(());
        assert!(matches!(fold_mqtt_result(base, Err(MqttifyError::new_session_reset())), Err(MqttifyError::SessionReset(_))));
    }
}
