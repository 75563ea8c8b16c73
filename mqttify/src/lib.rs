/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
An MQTT 3.1.1 and MQTT 5 client protocol engine.

The engine is sans-I/O at its core: [`MqttClient`] drives one broker session through a
pluggable [`TransportAdapter`] and is serviced by the host, either directly or through an
[`EngineInstance`] worker.  Tokio-based TCP, TLS and websocket adapters are available behind the
`tokio`, `tokio-rustls` and `tokio-websockets` features.
 */

pub mod alias;
pub mod client;
pub mod config;
pub mod credentials;
mod decode;
pub mod dispatch;
mod encode;
pub mod engine;
pub mod error;
mod logging;
pub mod mqtt;
mod protocol;
mod qos;
mod reconnect;
pub mod subscription;
pub mod transport;
mod validate;

/* Re-export the packet model at the root level */
pub use mqtt::{
    ProtocolVersion,
    QualityOfService,
    PayloadFormatIndicator,
    RetainHandlingType,
    ConnectReasonCode,
    PubackReasonCode,
    PubrecReasonCode,
    PubrelReasonCode,
    PubcompReasonCode,
    DisconnectReasonCode,
    SubackReasonCode,
    UnsubackReasonCode,
    AuthenticateReasonCode,
    UserProperty,
    Subscription,
    AuthPacket,
    ConnackPacket,
    ConnectPacket,
    DisconnectPacket,
    PingreqPacket,
    PingrespPacket,
    PubackPacket,
    PubcompPacket,
    PublishPacket,
    PubrecPacket,
    PubrelPacket,
    SubackPacket,
    SubscribePacket,
    UnsubackPacket,
    UnsubscribePacket,
    MqttPacket,
    PacketType,
};

pub use client::*;
pub use config::*;
pub use credentials::{BasicCredentialsProvider, Credentials, CredentialsProvider};
pub use dispatch::{DispatchMode, EventPump};
pub use decode::{decode_packet, DecodeResult, Decoder};
pub use encode::encode_packet;
pub use engine::{EngineInstance, SharedClient, WorkerHandle};
pub use error::{ErrorCategory, MqttifyError, MqttifyResult};
pub use protocol::NegotiatedSettings;
pub use qos::{PublishResponse, Qos2Response};
pub use subscription::{topic_matches_filter, MessageHandler};
pub use transport::{NullTransport, TransportAdapter, TransportEventSink};
pub use validate::{is_valid_topic, is_valid_topic_filter};
