/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Module containing miscellaneous constants and integer to protocol enum conversion functions.
 */

use crate::error::{MqttifyError, MqttifyResult};
use crate::mqtt::*;

pub(crate) const PACKET_TYPE_CONNECT: u8 = 1;
pub(crate) const PACKET_TYPE_CONNACK: u8 = 2;
pub(crate) const PACKET_TYPE_PUBLISH: u8 = 3;
pub(crate) const PACKET_TYPE_PUBACK: u8 = 4;
pub(crate) const PACKET_TYPE_PUBREC: u8 = 5;
pub(crate) const PACKET_TYPE_PUBREL: u8 = 6;
pub(crate) const PACKET_TYPE_PUBCOMP: u8 = 7;
pub(crate) const PACKET_TYPE_SUBSCRIBE: u8 = 8;
pub(crate) const PACKET_TYPE_SUBACK: u8 = 9;
pub(crate) const PACKET_TYPE_UNSUBSCRIBE: u8 = 10;
pub(crate) const PACKET_TYPE_UNSUBACK: u8 = 11;
pub(crate) const PACKET_TYPE_PINGREQ: u8 = 12;
pub(crate) const PACKET_TYPE_PINGRESP: u8 = 13;
pub(crate) const PACKET_TYPE_DISCONNECT: u8 = 14;
pub(crate) const PACKET_TYPE_AUTH: u8 = 15;

pub(crate) const PROPERTY_KEY_PAYLOAD_FORMAT_INDICATOR: u8 = 1;
pub(crate) const PROPERTY_KEY_MESSAGE_EXPIRY_INTERVAL: u8 = 2;
pub(crate) const PROPERTY_KEY_CONTENT_TYPE: u8 = 3;
pub(crate) const PROPERTY_KEY_RESPONSE_TOPIC: u8 = 8;
pub(crate) const PROPERTY_KEY_CORRELATION_DATA: u8 = 9;
pub(crate) const PROPERTY_KEY_SUBSCRIPTION_IDENTIFIER: u8 = 11;
pub(crate) const PROPERTY_KEY_SESSION_EXPIRY_INTERVAL: u8 = 17;
pub(crate) const PROPERTY_KEY_ASSIGNED_CLIENT_IDENTIFIER: u8 = 18;
pub(crate) const PROPERTY_KEY_SERVER_KEEP_ALIVE: u8 = 19;
pub(crate) const PROPERTY_KEY_AUTHENTICATION_METHOD: u8 = 21;
pub(crate) const PROPERTY_KEY_AUTHENTICATION_DATA: u8 = 22;
pub(crate) const PROPERTY_KEY_REQUEST_PROBLEM_INFORMATION: u8 = 23;
pub(crate) const PROPERTY_KEY_WILL_DELAY_INTERVAL: u8 = 24;
pub(crate) const PROPERTY_KEY_REQUEST_RESPONSE_INFORMATION: u8 = 25;
pub(crate) const PROPERTY_KEY_RESPONSE_INFORMATION: u8 = 26;
pub(crate) const PROPERTY_KEY_SERVER_REFERENCE: u8 = 28;
pub(crate) const PROPERTY_KEY_REASON_STRING: u8 = 31;
pub(crate) const PROPERTY_KEY_RECEIVE_MAXIMUM: u8 = 33;
pub(crate) const PROPERTY_KEY_TOPIC_ALIAS_MAXIMUM: u8 = 34;
pub(crate) const PROPERTY_KEY_TOPIC_ALIAS: u8 = 35;
pub(crate) const PROPERTY_KEY_MAXIMUM_QOS: u8 = 36;
pub(crate) const PROPERTY_KEY_RETAIN_AVAILABLE: u8 = 37;
pub(crate) const PROPERTY_KEY_USER_PROPERTY: u8 = 38;
pub(crate) const PROPERTY_KEY_MAXIMUM_PACKET_SIZE: u8 = 39;
pub(crate) const PROPERTY_KEY_WILDCARD_SUBSCRIPTIONS_AVAILABLE: u8 = 40;
pub(crate) const PROPERTY_KEY_SUBSCRIPTION_IDENTIFIERS_AVAILABLE: u8 = 41;
pub(crate) const PROPERTY_KEY_SHARED_SUBSCRIPTIONS_AVAILABLE: u8 = 42;

/// Largest value representable by a four byte variable length integer
pub const MAXIMUM_VARIABLE_LENGTH_INTEGER: usize = (1 << 28) - 1;

/// Largest length-prefixed string or binary blob
pub(crate) const MAXIMUM_STRING_LENGTH: usize = 65535;

pub(crate) const PUBLISH_PACKET_FIXED_HEADER_DUPLICATE_FLAG : u8 = 8;
pub(crate) const PUBLISH_PACKET_FIXED_HEADER_RETAIN_FLAG : u8 = 1;
pub(crate) const QOS_MASK : u8 = 3;

pub(crate) const CONNECT_PACKET_CLEAN_START_FLAG_MASK : u8 = 1 << 1;
pub(crate) const CONNECT_PACKET_HAS_WILL_FLAG_MASK : u8 = 1 << 2;
pub(crate) const CONNECT_PACKET_WILL_QOS_FLAG_SHIFT : u8 = 3;
pub(crate) const CONNECT_PACKET_WILL_RETAIN_FLAG_MASK : u8 = 1 << 5;
pub(crate) const CONNECT_PACKET_HAS_PASSWORD_FLAG_MASK : u8 = 1 << 6;
pub(crate) const CONNECT_PACKET_HAS_USERNAME_FLAG_MASK : u8 = 1 << 7;

pub(crate) const CONNECT_FIRST_BYTE : u8 = PACKET_TYPE_CONNECT << 4;
pub(crate) const CONNACK_FIRST_BYTE : u8 = PACKET_TYPE_CONNACK << 4;
pub(crate) const PUBACK_FIRST_BYTE : u8 = PACKET_TYPE_PUBACK << 4;
pub(crate) const PUBREC_FIRST_BYTE : u8 = PACKET_TYPE_PUBREC << 4;
pub(crate) const PUBREL_FIRST_BYTE : u8 = (PACKET_TYPE_PUBREL << 4) | (0x02u8);
pub(crate) const PUBCOMP_FIRST_BYTE : u8 = PACKET_TYPE_PUBCOMP << 4;
pub(crate) const SUBSCRIBE_FIRST_BYTE : u8 = (PACKET_TYPE_SUBSCRIBE << 4) | (0x02u8);
pub(crate) const SUBACK_FIRST_BYTE : u8 = PACKET_TYPE_SUBACK << 4;
pub(crate) const UNSUBSCRIBE_FIRST_BYTE : u8 = (PACKET_TYPE_UNSUBSCRIBE << 4) | (0x02u8);
pub(crate) const UNSUBACK_FIRST_BYTE : u8 = PACKET_TYPE_UNSUBACK << 4;
pub(crate) const PINGREQ_FIRST_BYTE : u8 = PACKET_TYPE_PINGREQ << 4;
pub(crate) const PINGRESP_FIRST_BYTE : u8 = PACKET_TYPE_PINGRESP << 4;
pub(crate) const DISCONNECT_FIRST_BYTE : u8 = PACKET_TYPE_DISCONNECT << 4;
pub(crate) const AUTH_FIRST_BYTE : u8 = PACKET_TYPE_AUTH << 4;

pub(crate) const SUBSCRIPTION_OPTIONS_NO_LOCAL_MASK : u8 = 1u8 << 2;
pub(crate) const SUBSCRIPTION_OPTIONS_RETAIN_AS_PUBLISHED_MASK : u8 = 1u8 << 3;
pub(crate) const SUBSCRIPTION_OPTIONS_RETAIN_HANDLING_SHIFT : u8 = 4;
pub(crate) const SUBSCRIPTION_OPTIONS_RESERVED_MASK5 : u8 = 192;
pub(crate) const SUBSCRIPTION_OPTIONS_RESERVED_MASK311 : u8 = 252;

pub(crate) const CONNECT_PROTOCOL_NAME : &str = "MQTT";

macro_rules! define_u8_enum_conversion {
    ($function_name: ident, $enum_type: ident, $($variant: ident),+) => {
        #[doc = concat!("Converts a u8 into a ", stringify!($enum_type), ", failing on values with no variant.")]
        pub fn $function_name(value: u8) -> MqttifyResult<$enum_type> {
            $(
                if value == $enum_type::$variant as u8 {
                    return Ok($enum_type::$variant);
                }
            )+

            Err(MqttifyError::new_malformed_packet(format!("invalid {} value: {}", stringify!($enum_type), value)))
        }

        impl TryFrom<u8> for $enum_type {
            type Error = MqttifyError;

            fn try_from(value: u8) -> Result<Self, Self::Error> {
                $function_name(value)
            }
        }
    };
}

define_u8_enum_conversion!(convert_u8_to_quality_of_service, QualityOfService,
    AtMostOnce, AtLeastOnce, ExactlyOnce);

define_u8_enum_conversion!(convert_u8_to_payload_format_indicator, PayloadFormatIndicator,
    Bytes, Utf8);

define_u8_enum_conversion!(convert_u8_to_retain_handling_type, RetainHandlingType,
    SendOnSubscribe, SendOnSubscribeIfNew, DontSend);

define_u8_enum_conversion!(convert_u8_to_connect_reason_code, ConnectReasonCode,
    Success, UnspecifiedError, MalformedPacket, ProtocolError, ImplementationSpecificError,
    UnsupportedProtocolVersion, ClientIdentifierNotValid, BadUsernameOrPassword, NotAuthorized,
    ServerUnavailable, ServerBusy, Banned, BadAuthenticationMethod, TopicNameInvalid, PacketTooLarge,
    QuotaExceeded, PayloadFormatInvalid, RetainNotSupported, QosNotSupported, UseAnotherServer,
    ServerMoved, ConnectionRateExceeded);

define_u8_enum_conversion!(convert_u8_to_puback_reason_code, PubackReasonCode,
    Success, NoMatchingSubscribers, UnspecifiedError, ImplementationSpecificError, NotAuthorized,
    TopicNameInvalid, PacketIdentifierInUse, QuotaExceeded, PayloadFormatInvalid);

define_u8_enum_conversion!(convert_u8_to_pubrec_reason_code, PubrecReasonCode,
    Success, NoMatchingSubscribers, UnspecifiedError, ImplementationSpecificError, NotAuthorized,
    TopicNameInvalid, PacketIdentifierInUse, QuotaExceeded, PayloadFormatInvalid);

define_u8_enum_conversion!(convert_u8_to_pubrel_reason_code, PubrelReasonCode,
    Success, PacketIdentifierNotFound);

define_u8_enum_conversion!(convert_u8_to_pubcomp_reason_code, PubcompReasonCode,
    Success, PacketIdentifierNotFound);

define_u8_enum_conversion!(convert_u8_to_disconnect_reason_code, DisconnectReasonCode,
    NormalDisconnection, DisconnectWithWillMessage, UnspecifiedError, MalformedPacket, ProtocolError,
    ImplementationSpecificError, NotAuthorized, ServerBusy, ServerShuttingDown, KeepAliveTimeout,
    SessionTakenOver, TopicFilterInvalid, TopicNameInvalid, ReceiveMaximumExceeded, TopicAliasInvalid,
    PacketTooLarge, MessageRateTooHigh, QuotaExceeded, AdministrativeAction, PayloadFormatInvalid,
    RetainNotSupported, QosNotSupported, UseAnotherServer, ServerMoved, SharedSubscriptionsNotSupported,
    ConnectionRateExceeded, MaximumConnectTime, SubscriptionIdentifiersNotSupported,
    WildcardSubscriptionsNotSupported);

define_u8_enum_conversion!(convert_u8_to_suback_reason_code, SubackReasonCode,
    GrantedQos0, GrantedQos1, GrantedQos2, UnspecifiedError, ImplementationSpecificError,
    NotAuthorized, TopicFilterInvalid, PacketIdentifierInUse, QuotaExceeded,
    SharedSubscriptionsNotSupported, SubscriptionIdentifiersNotSupported,
    WildcardSubscriptionsNotSupported);

define_u8_enum_conversion!(convert_u8_to_unsuback_reason_code, UnsubackReasonCode,
    Success, NoSubscriptionExisted, UnspecifiedError, ImplementationSpecificError, NotAuthorized,
    TopicNameInvalid, PacketIdentifierInUse);

define_u8_enum_conversion!(convert_u8_to_authenticate_reason_code, AuthenticateReasonCode,
    Success, ContinueAuthentication, ReAuthenticate);

/// MQTT 3.1.1 CONNACK return codes, mapped onto the MQTT5 reason code set
pub(crate) fn convert_u8_to_connect_return_code311(value: u8) -> MqttifyResult<ConnectReasonCode> {
    match value {
        0 => { Ok(ConnectReasonCode::Success) }
        1 => { Ok(ConnectReasonCode::UnsupportedProtocolVersion) }
        2 => { Ok(ConnectReasonCode::ClientIdentifierNotValid) }
        3 => { Ok(ConnectReasonCode::ServerUnavailable) }
        4 => { Ok(ConnectReasonCode::BadUsernameOrPassword) }
        5 => { Ok(ConnectReasonCode::NotAuthorized) }
        _ => { Err(MqttifyError::new_malformed_packet(format!("invalid MQTT 3.1.1 connack return code: {}", value))) }
    }
}

pub(crate) fn convert_connect_reason_code_to_return_code311(reason_code: ConnectReasonCode) -> Option<u8> {
    match reason_code {
        ConnectReasonCode::Success => { Some(0) }
        ConnectReasonCode::UnsupportedProtocolVersion => { Some(1) }
        ConnectReasonCode::ClientIdentifierNotValid => { Some(2) }
        ConnectReasonCode::ServerUnavailable => { Some(3) }
        ConnectReasonCode::BadUsernameOrPassword => { Some(4) }
        ConnectReasonCode::NotAuthorized => { Some(5) }
        _ => { None }
    }
}

/// MQTT 3.1.1 SUBACK return codes; 0x80 is the single failure value
pub(crate) fn convert_u8_to_suback_return_code311(value: u8) -> MqttifyResult<SubackReasonCode> {
    match value {
        0 => { Ok(SubackReasonCode::GrantedQos0) }
        1 => { Ok(SubackReasonCode::GrantedQos1) }
        2 => { Ok(SubackReasonCode::GrantedQos2) }
        128 => { Ok(SubackReasonCode::UnspecifiedError) }
        _ => { Err(MqttifyError::new_malformed_packet(format!("invalid MQTT 3.1.1 suback return code: {}", value))) }
    }
}

pub(crate) fn mqtt_packet_to_packet_type(packet: &MqttPacket) -> PacketType {
    match packet {
        MqttPacket::Connect(_) => { PacketType::Connect }
        MqttPacket::Connack(_) => { PacketType::Connack }
        MqttPacket::Publish(_) => { PacketType::Publish }
        MqttPacket::Puback(_) => { PacketType::Puback }
        MqttPacket::Pubrec(_) => { PacketType::Pubrec }
        MqttPacket::Pubrel(_) => { PacketType::Pubrel }
        MqttPacket::Pubcomp(_) => { PacketType::Pubcomp }
        MqttPacket::Subscribe(_) => { PacketType::Subscribe }
        MqttPacket::Suback(_) => { PacketType::Suback }
        MqttPacket::Unsubscribe(_) => { PacketType::Unsubscribe }
        MqttPacket::Unsuback(_) => { PacketType::Unsuback }
        MqttPacket::Pingreq(_) => { PacketType::Pingreq }
        MqttPacket::Pingresp(_) => { PacketType::Pingresp }
        MqttPacket::Disconnect(_) => { PacketType::Disconnect }
        MqttPacket::Auth(_) => { PacketType::Auth }
    }
}

pub(crate) fn packet_type_to_str(packet_type: u8) -> &'static str {
    match packet_type {
        PACKET_TYPE_CONNECT => { "Connect" }
        PACKET_TYPE_CONNACK => { "Connack" }
        PACKET_TYPE_PUBLISH => { "Publish" }
        PACKET_TYPE_PUBACK => { "Puback" }
        PACKET_TYPE_PUBREC => { "Pubrec" }
        PACKET_TYPE_PUBREL => { "Pubrel" }
        PACKET_TYPE_PUBCOMP => { "Pubcomp" }
        PACKET_TYPE_SUBSCRIBE => { "Subscribe" }
        PACKET_TYPE_SUBACK => { "Suback" }
        PACKET_TYPE_UNSUBSCRIBE => { "Unsubscribe" }
        PACKET_TYPE_UNSUBACK => { "Unsuback" }
        PACKET_TYPE_PINGREQ => { "Pingreq" }
        PACKET_TYPE_PINGRESP => { "Pingresp" }
        PACKET_TYPE_DISCONNECT => { "Disconnect" }
        PACKET_TYPE_AUTH => { "Auth" }
        _ => { "Unknown" }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn reason_code_conversion_round_trips_known_values() {
        assert_eq!(PubackReasonCode::QuotaExceeded, convert_u8_to_puback_reason_code(151).unwrap());
        assert_eq!(DisconnectReasonCode::WildcardSubscriptionsNotSupported, DisconnectReasonCode::try_from(162).unwrap());
        assert_eq!(QualityOfService::ExactlyOnce, QualityOfService::try_from(2).unwrap());
    }

    #[test]
    fn reason_code_conversion_rejects_unknown_values() {
        assert_matches!(convert_u8_to_puback_reason_code(241), Err(MqttifyError::MalformedPacket(_)));
        assert_matches!(QualityOfService::try_from(3), Err(MqttifyError::MalformedPacket(_)));
        assert_matches!(convert_u8_to_suback_return_code311(131), Err(MqttifyError::MalformedPacket(_)));
    }

    #[test]
    fn connect_return_codes311_map_both_ways() {
        for code in 0..6u8 {
            let reason_code = convert_u8_to_connect_return_code311(code).unwrap();
            assert_eq!(Some(code), convert_connect_reason_code_to_return_code311(reason_code));
        }

        assert_eq!(None, convert_connect_reason_code_to_return_code311(ConnectReasonCode::Banned));
    }
}
