/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Module containing a set of structured data types that model MQTT 3.1.1 and MQTT 5 control packets.

A single data model covers both protocol versions.  Fields that only exist in MQTT5 are modeled
as `Option`s (or default-valued reason codes) and must be left unset when the packet is bound for
an MQTT 3.1.1 connection; the encoder fails otherwise.
 */

use crate::error::{MqttifyError, MqttifyResult};

use std::fmt;

pub(crate) mod auth;
pub(crate) mod connack;
pub(crate) mod connect;
pub(crate) mod disconnect;
pub(crate) mod pingreq;
pub(crate) mod pingresp;
pub(crate) mod puback;
pub(crate) mod pubcomp;
pub(crate) mod publish;
pub(crate) mod pubrec;
pub(crate) mod pubrel;
pub(crate) mod suback;
pub(crate) mod subscribe;
pub(crate) mod unsuback;
pub(crate) mod unsubscribe;
pub mod utils;

/// Wire protocol version used by a connection.  Selected at runtime; every codec entry point
/// takes it explicitly.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub enum ProtocolVersion {

    /// MQTT 3.1.1, protocol level 4
    Mqtt311,

    /// MQTT 5.0, protocol level 5
    #[default]
    Mqtt5,
}

impl ProtocolVersion {

    /// Protocol level byte written into the CONNECT variable header
    pub fn protocol_level(&self) -> u8 {
        match self {
            ProtocolVersion::Mqtt311 => { 4 }
            ProtocolVersion::Mqtt5 => { 5 }
        }
    }

    pub(crate) fn from_protocol_level(level: u8) -> MqttifyResult<ProtocolVersion> {
        match level {
            4 => { Ok(ProtocolVersion::Mqtt311) }
            5 => { Ok(ProtocolVersion::Mqtt5) }
            _ => { Err(MqttifyError::new_malformed_packet(format!("unsupported protocol level {}", level))) }
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolVersion::Mqtt311 => { write!(f, "MQTT 3.1.1") }
            ProtocolVersion::Mqtt5 => { write!(f, "MQTT 5") }
        }
    }
}

/// MQTT message delivery quality of service.
///
/// Enum values match [MQTT5 spec](https://docs.oasis-open.org/mqtt/mqtt/v5.0/os/mqtt-v5.0-os.html#_Toc3901234) encoding values.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub enum QualityOfService {

    /// Delivered at most once.  No acknowledgement, no retransmission.
    #[default]
    AtMostOnce = 0,

    /// Delivered at least once, acknowledged with PUBACK.
    AtLeastOnce = 1,

    /// Delivered exactly once via the PUBREC/PUBREL/PUBCOMP handshake.
    ExactlyOnce = 2,
}

/// Optional property describing a PUBLISH payload's format.
///
/// Enum values match [MQTT5 spec](https://docs.oasis-open.org/mqtt/mqtt/v5.0/os/mqtt-v5.0-os.html#_Toc3901111) encoding values.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum PayloadFormatIndicator {

    /// The payload is arbitrary binary data
    #[default]
    Bytes = 0,

    /// The payload is a well-formed utf-8 string value.
    Utf8 = 1,
}

/// Configures how retained messages should be handled when subscribing with a topic filter that matches topics with
/// associated retained messages.
///
/// Enum values match [MQTT5 spec](https://docs.oasis-open.org/mqtt/mqtt/v5.0/os/mqtt-v5.0-os.html#_Toc3901169) encoding values.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum RetainHandlingType {

    /// Always send matching retained messages on subscribe.
    #[default]
    SendOnSubscribe = 0,

    /// Send matching retained messages only if the subscription did not already exist.
    SendOnSubscribeIfNew = 1,

    /// Never send retained messages in reaction to the subscribe.
    DontSend = 2,
}

/// Server return code for connection attempts.
///
/// MQTT 3.1.1 return codes 1 through 5 are mapped onto their MQTT5 equivalents.
///
/// Enum values match [MQTT5 spec](https://docs.oasis-open.org/mqtt/mqtt/v5.0/os/mqtt-v5.0-os.html#_Toc3901079) encoding values.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ConnectReasonCode {
    #[default]
    Success = 0,
    UnspecifiedError = 128,
    MalformedPacket = 129,
    ProtocolError = 130,
    ImplementationSpecificError = 131,
    UnsupportedProtocolVersion = 132,
    ClientIdentifierNotValid = 133,
    BadUsernameOrPassword = 134,
    NotAuthorized = 135,
    ServerUnavailable = 136,
    ServerBusy = 137,
    Banned = 138,
    BadAuthenticationMethod = 140,
    TopicNameInvalid = 144,
    PacketTooLarge = 149,
    QuotaExceeded = 151,
    PayloadFormatInvalid = 153,
    RetainNotSupported = 154,
    QosNotSupported = 155,
    UseAnotherServer = 156,
    ServerMoved = 157,
    ConnectionRateExceeded = 159,
}

impl ConnectReasonCode {
    /// Returns whether or not the reason code represents a successful connect
    pub fn is_success(&self) -> bool {
        matches!(self, ConnectReasonCode::Success)
    }
}

/// Reason code inside PUBACK packets that indicates the result of the associated PUBLISH request.
///
/// Enum values match [MQTT5 spec](https://docs.oasis-open.org/mqtt/mqtt/v5.0/os/mqtt-v5.0-os.html#_Toc3901124) encoding values.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum PubackReasonCode {
    #[default]
    Success = 0,
    NoMatchingSubscribers = 16,
    UnspecifiedError = 128,
    ImplementationSpecificError = 131,
    NotAuthorized = 135,
    TopicNameInvalid = 144,
    PacketIdentifierInUse = 145,
    QuotaExceeded = 151,
    PayloadFormatInvalid = 153,
}

impl PubackReasonCode {
    /// Returns whether or not the reason code represents a successful publish
    pub fn is_success(&self) -> bool {
        matches!(self, PubackReasonCode::Success | PubackReasonCode::NoMatchingSubscribers)
    }
}

/// Reason code inside PUBREC packets that indicates the result of the associated QoS 2 PUBLISH request.
///
/// Enum values match [MQTT5 spec](https://docs.oasis-open.org/mqtt/mqtt/v5.0/os/mqtt-v5.0-os.html#_Toc3901134) encoding values.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum PubrecReasonCode {
    #[default]
    Success = 0,
    NoMatchingSubscribers = 16,
    UnspecifiedError = 128,
    ImplementationSpecificError = 131,
    NotAuthorized = 135,
    TopicNameInvalid = 144,
    PacketIdentifierInUse = 145,
    QuotaExceeded = 151,
    PayloadFormatInvalid = 153,
}

impl PubrecReasonCode {
    /// Returns whether or not the reason code represents a successful publish
    pub fn is_success(&self) -> bool {
        matches!(self, PubrecReasonCode::Success | PubrecReasonCode::NoMatchingSubscribers)
    }
}

/// Reason code inside PUBREL packets.
///
/// Enum values match [MQTT5 spec](https://docs.oasis-open.org/mqtt/mqtt/v5.0/os/mqtt-v5.0-os.html#_Toc3901144) encoding values.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum PubrelReasonCode {
    #[default]
    Success = 0,
    PacketIdentifierNotFound = 146,
}

/// Reason code inside PUBCOMP packets.  Success concludes a QoS 2 delivery.
///
/// Enum values match [MQTT5 spec](https://docs.oasis-open.org/mqtt/mqtt/v5.0/os/mqtt-v5.0-os.html#_Toc3901154) encoding values.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum PubcompReasonCode {
    #[default]
    Success = 0,
    PacketIdentifierNotFound = 146,
}

impl PubcompReasonCode {
    /// Returns whether the reason code represents a successful QoS 2 delivery
    pub fn is_success(&self) -> bool {
        matches!(self, PubcompReasonCode::Success)
    }
}

/// Reason code inside DISCONNECT packets.  Helps determine why a connection was terminated.
///
/// Enum values match [MQTT5 spec](https://docs.oasis-open.org/mqtt/mqtt/v5.0/os/mqtt-v5.0-os.html#_Toc3901208) encoding values.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum DisconnectReasonCode {
    #[default]
    NormalDisconnection = 0,
    DisconnectWithWillMessage = 4,
    UnspecifiedError = 128,
    MalformedPacket = 129,
    ProtocolError = 130,
    ImplementationSpecificError = 131,
    NotAuthorized = 135,
    ServerBusy = 137,
    ServerShuttingDown = 139,
    KeepAliveTimeout = 141,
    SessionTakenOver = 142,
    TopicFilterInvalid = 143,
    TopicNameInvalid = 144,
    ReceiveMaximumExceeded = 147,
    TopicAliasInvalid = 148,
    PacketTooLarge = 149,
    MessageRateTooHigh = 150,
    QuotaExceeded = 151,
    AdministrativeAction = 152,
    PayloadFormatInvalid = 153,
    RetainNotSupported = 154,
    QosNotSupported = 155,
    UseAnotherServer = 156,
    ServerMoved = 157,
    SharedSubscriptionsNotSupported = 158,
    ConnectionRateExceeded = 159,
    MaximumConnectTime = 160,
    SubscriptionIdentifiersNotSupported = 161,
    WildcardSubscriptionsNotSupported = 162,
}

/// Per-subscription result codes inside SUBACK packets.
///
/// The MQTT 3.1.1 failure code (0x80) maps onto `UnspecifiedError`.
///
/// Enum values match [MQTT5 spec](https://docs.oasis-open.org/mqtt/mqtt/v5.0/os/mqtt-v5.0-os.html#_Toc3901178) encoding values.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum SubackReasonCode {
    #[default]
    GrantedQos0 = 0,
    GrantedQos1 = 1,
    GrantedQos2 = 2,
    UnspecifiedError = 128,
    ImplementationSpecificError = 131,
    NotAuthorized = 135,
    TopicFilterInvalid = 143,
    PacketIdentifierInUse = 145,
    QuotaExceeded = 151,
    SharedSubscriptionsNotSupported = 158,
    SubscriptionIdentifiersNotSupported = 161,
    WildcardSubscriptionsNotSupported = 162,
}

impl SubackReasonCode {
    /// Returns whether or not the reason code represents a successful subscription
    pub fn is_success(&self) -> bool {
        matches!(self, SubackReasonCode::GrantedQos0 | SubackReasonCode::GrantedQos1 | SubackReasonCode::GrantedQos2)
    }
}

/// Per-filter result codes inside UNSUBACK packets.  MQTT 3.1.1 UNSUBACKs carry none.
///
/// Enum values match [MQTT5 spec](https://docs.oasis-open.org/mqtt/mqtt/v5.0/os/mqtt-v5.0-os.html#_Toc3901194) encoding values.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum UnsubackReasonCode {
    #[default]
    Success = 0,
    NoSubscriptionExisted = 17,
    UnspecifiedError = 128,
    ImplementationSpecificError = 131,
    NotAuthorized = 135,
    TopicNameInvalid = 144,
    PacketIdentifierInUse = 145,
}

impl UnsubackReasonCode {
    /// Returns whether or not the reason code represents a successful unsubscribe
    pub fn is_success(&self) -> bool {
        matches!(self, UnsubackReasonCode::Success | UnsubackReasonCode::NoSubscriptionExisted)
    }
}

/// Reason code that specifies the response to a received AUTH packet.
///
/// Enum values match [MQTT5 spec](https://docs.oasis-open.org/mqtt/mqtt/v5.0/os/mqtt-v5.0-os.html#_Toc3901220) encoding values.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum AuthenticateReasonCode {

    /// The authentication exchange is complete and successful.  Server only.
    #[default]
    Success = 0,

    /// The recipient should continue the authentication exchange.
    ContinueAuthentication = 24,

    /// The client is starting a re-authentication of an established connection.
    ReAuthenticate = 25,
}

/// A name-value pair of utf-8 strings that can be attached to MQTT5 packets.  Names are not unique.
///
/// See [MQTT5 User Property](https://docs.oasis-open.org/mqtt/mqtt/v5.0/os/mqtt-v5.0-os.html#_Toc3901013).
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct UserProperty {

    /// User property name
    pub name: String,

    /// User property value
    pub value: String,
}

impl UserProperty {

    /// Creates a new user property from a name and a value
    pub fn new(name: &str, value: &str) -> Self {
        UserProperty {
            name: name.to_string(),
            value: value.to_string(),
        }
    }
}

/// A single topic filter entry within a SUBSCRIBE packet.
///
/// See [MQTT5 Subscription Options](https://docs.oasis-open.org/mqtt/mqtt/v5.0/os/mqtt-v5.0-os.html#_Toc3901169)
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Subscription {

    /// Topic filter to subscribe to.  May contain `+` and `#` wildcards.
    pub topic_filter: String,

    /// Maximum QoS the subscriber will accept on matching messages.
    pub qos: QualityOfService,

    /// MQTT5 only.  Server should not echo this client's own publishes back to it.
    pub no_local: bool,

    /// MQTT5 only.  Forwarded messages keep the retain flag they were published with.
    pub retain_as_published: bool,

    /// MQTT5 only.  Controls whether retained messages are sent in reaction to the subscribe.
    pub retain_handling_type: RetainHandlingType,
}

impl Subscription {

    /// Creates a subscription with default MQTT5 options
    pub fn new(topic_filter: &str, qos: QualityOfService) -> Self {
        Subscription {
            topic_filter: topic_filter.to_string(),
            qos,
            ..Default::default()
        }
    }

    /// Sets the no-local subscription option
    pub fn with_no_local(mut self, no_local: bool) -> Self {
        self.no_local = no_local;
        self
    }

    /// Sets the retain-as-published subscription option
    pub fn with_retain_as_published(mut self, retain_as_published: bool) -> Self {
        self.retain_as_published = retain_as_published;
        self
    }

    /// Sets the retain handling subscription option
    pub fn with_retain_handling_type(mut self, retain_handling_type: RetainHandlingType) -> Self {
        self.retain_handling_type = retain_handling_type;
        self
    }

    pub(crate) fn has_mqtt5_options(&self) -> bool {
        self.no_local || self.retain_as_published || self.retain_handling_type != RetainHandlingType::SendOnSubscribe
    }
}

/// Data model of an [MQTT AUTH](https://docs.oasis-open.org/mqtt/mqtt/v5.0/os/mqtt-v5.0-os.html#_Toc3901217) packet.
/// MQTT5 only.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct AuthPacket {
    pub reason_code: AuthenticateReasonCode,
    pub authentication_method: Option<String>,
    pub authentication_data: Option<Vec<u8>>,
    pub reason_string: Option<String>,
    pub user_properties: Option<Vec<UserProperty>>,
}

/// Data model of an [MQTT CONNACK](https://docs.oasis-open.org/mqtt/mqtt/v5.0/os/mqtt-v5.0-os.html#_Toc3901074) packet.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ConnackPacket {
    pub session_present: bool,
    pub reason_code: ConnectReasonCode,
    pub session_expiry_interval: Option<u32>,
    pub receive_maximum: Option<u16>,
    pub maximum_qos: Option<QualityOfService>,
    pub retain_available: Option<bool>,
    pub maximum_packet_size: Option<u32>,
    pub assigned_client_identifier: Option<String>,
    pub topic_alias_maximum: Option<u16>,
    pub reason_string: Option<String>,
    pub user_properties: Option<Vec<UserProperty>>,
    pub wildcard_subscriptions_available: Option<bool>,
    pub subscription_identifiers_available: Option<bool>,
    pub shared_subscriptions_available: Option<bool>,
    pub server_keep_alive: Option<u16>,
    pub response_information: Option<String>,
    pub server_reference: Option<String>,
    pub authentication_method: Option<String>,
    pub authentication_data: Option<Vec<u8>>,
}

/// Data model of an [MQTT CONNECT](https://docs.oasis-open.org/mqtt/mqtt/v5.0/os/mqtt-v5.0-os.html#_Toc3901033) packet.
///
/// The will message is modeled as a publish packet; only its topic, payload, qos, retain flag and
/// (MQTT5) publish properties are encoded.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ConnectPacket {
    pub keep_alive_interval_seconds: u16,
    pub clean_start: bool,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
    pub session_expiry_interval_seconds: Option<u32>,
    pub request_response_information: Option<bool>,
    pub request_problem_information: Option<bool>,
    pub receive_maximum: Option<u16>,
    pub topic_alias_maximum: Option<u16>,
    pub maximum_packet_size_bytes: Option<u32>,
    pub authentication_method: Option<String>,
    pub authentication_data: Option<Vec<u8>>,
    pub will_delay_interval_seconds: Option<u32>,
    pub will: Option<PublishPacket>,
    pub user_properties: Option<Vec<UserProperty>>,
}

/// Data model of an [MQTT DISCONNECT](https://docs.oasis-open.org/mqtt/mqtt/v5.0/os/mqtt-v5.0-os.html#_Toc3901205) packet.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DisconnectPacket {
    pub reason_code: DisconnectReasonCode,
    pub session_expiry_interval_seconds: Option<u32>,
    pub reason_string: Option<String>,
    pub user_properties: Option<Vec<UserProperty>>,
    pub server_reference: Option<String>,
}

/// Data model of an [MQTT PINGREQ](https://docs.oasis-open.org/mqtt/mqtt/v5.0/os/mqtt-v5.0-os.html#_Toc3901195) packet.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PingreqPacket {}

/// Data model of an [MQTT PINGRESP](https://docs.oasis-open.org/mqtt/mqtt/v5.0/os/mqtt-v5.0-os.html#_Toc3901200) packet.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PingrespPacket {}

/// Data model of an [MQTT PUBACK](https://docs.oasis-open.org/mqtt/mqtt/v5.0/os/mqtt-v5.0-os.html#_Toc3901121) packet.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PubackPacket {
    pub packet_id: u16,
    pub reason_code: PubackReasonCode,
    pub reason_string: Option<String>,
    pub user_properties: Option<Vec<UserProperty>>,
}

/// Data model of an [MQTT PUBREC](https://docs.oasis-open.org/mqtt/mqtt/v5.0/os/mqtt-v5.0-os.html#_Toc3901131) packet.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PubrecPacket {
    pub packet_id: u16,
    pub reason_code: PubrecReasonCode,
    pub reason_string: Option<String>,
    pub user_properties: Option<Vec<UserProperty>>,
}

/// Data model of an [MQTT PUBREL](https://docs.oasis-open.org/mqtt/mqtt/v5.0/os/mqtt-v5.0-os.html#_Toc3901141) packet.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PubrelPacket {
    pub packet_id: u16,
    pub reason_code: PubrelReasonCode,
    pub reason_string: Option<String>,
    pub user_properties: Option<Vec<UserProperty>>,
}

/// Data model of an [MQTT PUBCOMP](https://docs.oasis-open.org/mqtt/mqtt/v5.0/os/mqtt-v5.0-os.html#_Toc3901151) packet.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PubcompPacket {
    pub packet_id: u16,
    pub reason_code: PubcompReasonCode,
    pub reason_string: Option<String>,
    pub user_properties: Option<Vec<UserProperty>>,
}

/// Data model of an [MQTT PUBLISH](https://docs.oasis-open.org/mqtt/mqtt/v5.0/os/mqtt-v5.0-os.html#_Toc3901100) packet.
///
/// `packet_id` is only encoded when `qos` is greater than zero.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PublishPacket {
    pub packet_id: u16,
    pub topic: String,
    pub qos: QualityOfService,
    pub duplicate: bool,
    pub retain: bool,
    pub payload: Vec<u8>,
    pub payload_format: Option<PayloadFormatIndicator>,
    pub message_expiry_interval_seconds: Option<u32>,
    pub topic_alias: Option<u16>,
    pub response_topic: Option<String>,
    pub correlation_data: Option<Vec<u8>>,
    pub subscription_identifiers: Option<Vec<u32>>,
    pub content_type: Option<String>,
    pub user_properties: Option<Vec<UserProperty>>,
}

impl PublishPacket {

    /// Creates a publish packet with no MQTT5 properties
    pub fn new(topic: &str, payload: &[u8], qos: QualityOfService, retain: bool) -> Self {
        PublishPacket {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            qos,
            retain,
            ..Default::default()
        }
    }
}

/// Data model of an [MQTT SUBACK](https://docs.oasis-open.org/mqtt/mqtt/v5.0/os/mqtt-v5.0-os.html#_Toc3901171) packet.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SubackPacket {
    pub packet_id: u16,
    pub reason_string: Option<String>,
    pub user_properties: Option<Vec<UserProperty>>,
    pub reason_codes: Vec<SubackReasonCode>,
}

/// Data model of an [MQTT SUBSCRIBE](https://docs.oasis-open.org/mqtt/mqtt/v5.0/os/mqtt-v5.0-os.html#_Toc3901161) packet.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SubscribePacket {
    pub packet_id: u16,
    pub subscriptions: Vec<Subscription>,
    pub subscription_identifier: Option<u32>,
    pub user_properties: Option<Vec<UserProperty>>,
}

/// Data model of an [MQTT UNSUBACK](https://docs.oasis-open.org/mqtt/mqtt/v5.0/os/mqtt-v5.0-os.html#_Toc3901187) packet.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct UnsubackPacket {
    pub packet_id: u16,
    pub reason_string: Option<String>,
    pub user_properties: Option<Vec<UserProperty>>,
    pub reason_codes: Vec<UnsubackReasonCode>,
}

/// Data model of an [MQTT UNSUBSCRIBE](https://docs.oasis-open.org/mqtt/mqtt/v5.0/os/mqtt-v5.0-os.html#_Toc3901179) packet.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct UnsubscribePacket {
    pub packet_id: u16,
    pub topic_filters: Vec<String>,
    pub user_properties: Option<Vec<UserProperty>>,
}

/// Closed set of all MQTT control packets.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MqttPacket {
    Connect(ConnectPacket),
    Connack(ConnackPacket),
    Publish(PublishPacket),
    Puback(PubackPacket),
    Pubrec(PubrecPacket),
    Pubrel(PubrelPacket),
    Pubcomp(PubcompPacket),
    Subscribe(SubscribePacket),
    Suback(SubackPacket),
    Unsubscribe(UnsubscribePacket),
    Unsuback(UnsubackPacket),
    Pingreq(PingreqPacket),
    Pingresp(PingrespPacket),
    Disconnect(DisconnectPacket),
    Auth(AuthPacket),
}

impl MqttPacket {

    /// Returns the packet's type
    pub fn packet_type(&self) -> PacketType {
        utils::mqtt_packet_to_packet_type(self)
    }
}

/// An enum indicating the kind of MQTT packet
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum PacketType {
    Connect,
    Connack,
    Publish,
    Puback,
    Pubrec,
    Pubrel,
    Pubcomp,
    Subscribe,
    Suback,
    Unsubscribe,
    Unsuback,
    Pingreq,
    Pingresp,
    Disconnect,
    Auth,
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PacketType::Connect => { "ConnectPacket" }
            PacketType::Connack => { "ConnackPacket" }
            PacketType::Publish => { "PublishPacket" }
            PacketType::Puback => { "PubackPacket" }
            PacketType::Pubrec => { "PubrecPacket" }
            PacketType::Pubrel => { "PubrelPacket" }
            PacketType::Pubcomp => { "PubcompPacket" }
            PacketType::Subscribe => { "SubscribePacket" }
            PacketType::Suback => { "SubackPacket" }
            PacketType::Unsubscribe => { "UnsubscribePacket" }
            PacketType::Unsuback => { "UnsubackPacket" }
            PacketType::Pingreq => { "PingreqPacket" }
            PacketType::Pingresp => { "PingrespPacket" }
            PacketType::Disconnect => { "DisconnectPacket" }
            PacketType::Auth => { "AuthPacket" }
        };

        write!(f, "{}", name)
    }
}
