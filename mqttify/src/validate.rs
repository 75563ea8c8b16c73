/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Topic name and topic filter rules, plus the checks applied to user-submitted packets before the
client accepts them.

Outbound checks run before any client state is touched, so a rejected operation leaves no trace.
Once a connection has been established, operations are also checked against the limits the broker
advertised in its Connack.
 */

use crate::encode::*;
use crate::error::{MqttifyError, MqttifyResult};
use crate::mqtt::*;
use crate::mqtt::utils::*;
use crate::protocol::NegotiatedSettings;

use log::*;

/// Returns true if `topic` is a valid MQTT topic name: non-empty, short enough to be encoded, and
/// free of wildcards and null characters.
pub fn is_valid_topic(topic: &str) -> bool {
    if topic.is_empty() || topic.len() > MAXIMUM_STRING_LENGTH {
        return false;
    }

    !topic.contains(['#', '+', '\0'])
}

/// Returns true if `filter` is a syntactically valid MQTT topic filter.
pub fn is_valid_topic_filter(filter: &str) -> bool {
    compute_topic_filter_properties(filter).is_valid
}

// if the topic filter is not valid, then the other fields are not to be trusted
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub(crate) struct TopicFilterProperties {
    pub is_valid: bool,
    pub is_shared: bool,
    pub has_wildcard: bool
}

pub(crate) fn compute_topic_filter_properties(filter: &str) -> TopicFilterProperties {
    let mut properties = TopicFilterProperties {
        is_valid: true,
        ..Default::default()
    };

    if filter.is_empty() || filter.len() > MAXIMUM_STRING_LENGTH || filter.contains('\0') {
        properties.is_valid = false;
        return properties;
    }

    let mut has_share_prefix = false;
    let mut has_share_name = false;
    let mut seen_multi_level_wildcard = false;
    for (index, segment) in filter.split('/').enumerate() {
        if seen_multi_level_wildcard {
            properties.is_valid = false;
            break;
        }

        let has_wildcard = segment.contains(['#', '+']);
        properties.has_wildcard |= has_wildcard;

        if index == 0 && segment == "$share" {
            has_share_prefix = true;
        }

        if index == 1 && has_share_prefix && !segment.is_empty() && !has_wildcard {
            has_share_name = true;
        }

        if has_share_name && ((index == 2 && !segment.is_empty()) || index > 2) {
            properties.is_shared = true;
        }

        if segment.len() == 1 {
            if segment == "#" {
                seen_multi_level_wildcard = true;
            }
        } else if has_wildcard {
            properties.is_valid = false;
            break;
        }
    }

    // "$share/group" with nothing after the group name is neither a valid share nor a sensible filter
    if has_share_prefix && !properties.is_shared && has_share_name {
        properties.is_valid = false;
    }

    properties
}

fn invalid(packet_type: PacketType, message: &str) -> MqttifyError {
    error!("{} Outbound Validation - {}", packet_type, message);
    MqttifyError::new_invalid_argument(Some(packet_type), message.to_string())
}

fn validate_encoded_size(packet: &MqttPacket, protocol_version: ProtocolVersion, settings: Option<&NegotiatedSettings>) -> MqttifyResult<()> {
    let encoded = encode_packet(packet, protocol_version)?;

    if let Some(settings) = settings {
        if encoded.len() > settings.maximum_packet_size_to_server as usize {
            return Err(invalid(packet.packet_type(), "encoded packet exceeds the broker's maximum packet size"));
        }
    }

    Ok(())
}

/// Checks a user publish.  Topic aliases are chosen by the client's alias resolver, never by the
/// caller.
pub(crate) fn validate_publish_outbound(packet: &PublishPacket, protocol_version: ProtocolVersion, settings: Option<&NegotiatedSettings>) -> MqttifyResult<()> {
    if !is_valid_topic(&packet.topic) {
        return Err(invalid(PacketType::Publish, "invalid topic"));
    }

    if packet.topic_alias.is_some() {
        return Err(invalid(PacketType::Publish, "topic aliases are assigned by the client's alias resolver"));
    }

    if packet.subscription_identifiers.is_some() {
        return Err(invalid(PacketType::Publish, "subscription identifiers may only be sent by the broker"));
    }

    if packet.duplicate {
        return Err(invalid(PacketType::Publish, "the duplicate flag is managed by the client"));
    }

    if let Some(settings) = settings {
        if packet.qos > settings.maximum_qos {
            return Err(invalid(PacketType::Publish, "qos exceeds the broker's maximum qos"));
        }

        if packet.retain && !settings.retain_available {
            return Err(invalid(PacketType::Publish, "the broker does not support retained messages"));
        }
    }

    let mut sized = packet.clone();
    if sized.qos != QualityOfService::AtMostOnce {
        sized.packet_id = 1;
    }

    validate_encoded_size(&MqttPacket::Publish(sized), protocol_version, settings)
}

/// Checks a user subscribe.  Duplicate filters within one request must agree on qos.
pub(crate) fn validate_subscribe_outbound(packet: &SubscribePacket, protocol_version: ProtocolVersion, settings: Option<&NegotiatedSettings>) -> MqttifyResult<()> {
    if packet.subscriptions.is_empty() {
        return Err(invalid(PacketType::Subscribe, "at least one subscription is required"));
    }

    if let Some(subscription_identifier) = packet.subscription_identifier {
        if subscription_identifier == 0 || subscription_identifier as usize > MAXIMUM_VARIABLE_LENGTH_INTEGER {
            return Err(invalid(PacketType::Subscribe, "subscription identifier out of range"));
        }

        if let Some(settings) = settings {
            if !settings.subscription_identifiers_available {
                return Err(invalid(PacketType::Subscribe, "the broker does not support subscription identifiers"));
            }
        }
    }

    for (index, subscription) in packet.subscriptions.iter().enumerate() {
        let properties = compute_topic_filter_properties(&subscription.topic_filter);
        if !properties.is_valid {
            return Err(invalid(PacketType::Subscribe, "invalid topic filter"));
        }

        if properties.is_shared && subscription.no_local {
            return Err(invalid(PacketType::Subscribe, "no_local may not be set on a shared subscription"));
        }

        if let Some(settings) = settings {
            if properties.is_shared && !settings.shared_subscriptions_available {
                return Err(invalid(PacketType::Subscribe, "the broker does not support shared subscriptions"));
            }

            if properties.has_wildcard && !settings.wildcard_subscriptions_available {
                return Err(invalid(PacketType::Subscribe, "the broker does not support wildcard subscriptions"));
            }
        }

        let conflicting = packet.subscriptions[..index].iter()
            .any(|earlier| earlier.topic_filter == subscription.topic_filter && earlier.qos != subscription.qos);
        if conflicting {
            return Err(invalid(PacketType::Subscribe, "the same topic filter appears with conflicting qos values"));
        }
    }

    let sized = SubscribePacket {
        packet_id: 1,
        ..packet.clone()
    };

    validate_encoded_size(&MqttPacket::Subscribe(sized), protocol_version, settings)
}

pub(crate) fn validate_unsubscribe_outbound(packet: &UnsubscribePacket, protocol_version: ProtocolVersion, settings: Option<&NegotiatedSettings>) -> MqttifyResult<()> {
    if packet.topic_filters.is_empty() {
        return Err(invalid(PacketType::Unsubscribe, "at least one topic filter is required"));
    }

    if packet.topic_filters.iter().any(|filter| !is_valid_topic_filter(filter)) {
        return Err(invalid(PacketType::Unsubscribe, "invalid topic filter"));
    }

    let sized = UnsubscribePacket {
        packet_id: 1,
        ..packet.clone()
    };

    validate_encoded_size(&MqttPacket::Unsubscribe(sized), protocol_version, settings)
}

pub(crate) fn validate_disconnect_outbound(packet: &DisconnectPacket, protocol_version: ProtocolVersion, settings: Option<&NegotiatedSettings>) -> MqttifyResult<()> {
    if let Some(settings) = settings {
        // a zero session expiry on connect may not be raised on disconnect
        if settings.session_expiry_interval == 0 {
            if let Some(session_expiry) = packet.session_expiry_interval_seconds {
                if session_expiry > 0 {
                    return Err(invalid(PacketType::Disconnect, "session expiry cannot be raised from zero on disconnect"));
                }
            }
        }
    }

    validate_encoded_size(&MqttPacket::Disconnect(packet.clone()), protocol_version, settings)
}

/// Checks the packet built from connect options.
pub(crate) fn validate_connect_outbound(packet: &ConnectPacket, protocol_version: ProtocolVersion) -> MqttifyResult<()> {
    if let Some(will) = &packet.will {
        if !is_valid_topic(&will.topic) {
            return Err(invalid(PacketType::Connect, "invalid will topic"));
        }
    }

    if packet.receive_maximum == Some(0) {
        return Err(invalid(PacketType::Connect, "receive maximum must be greater than zero"));
    }

    if packet.maximum_packet_size_bytes == Some(0) {
        return Err(invalid(PacketType::Connect, "maximum packet size must be greater than zero"));
    }

    validate_encoded_size(&MqttPacket::Connect(packet.clone()), protocol_version, None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn topic_names_valid() {
        assert!(is_valid_topic("/"));
        assert!(is_valid_topic("a/"));
        assert!(is_valid_topic("/b"));
        assert!(is_valid_topic("a/b/c"));
        assert!(is_valid_topic("$SYS/broker/uptime"));
    }

    #[test]
    fn topic_names_invalid() {
        assert!(!is_valid_topic("#"));
        assert!(!is_valid_topic("sport/tennis#"));
        assert!(!is_valid_topic("+"));
        assert!(!is_valid_topic("a/+/c"));
        assert!(!is_valid_topic(""));
        assert!(!is_valid_topic("a/\0/c"));

        let too_long = "a".repeat(70000);
        assert!(!is_valid_topic(&too_long));
    }

    #[test]
    fn topic_filters_valid() {
        assert!(is_valid_topic_filter("#"));
        assert!(is_valid_topic_filter("/#"));
        assert!(is_valid_topic_filter("a/#"));
        assert!(is_valid_topic_filter("+/tennis/#"));
        assert!(is_valid_topic_filter("sport/+/player1"));
        assert!(is_valid_topic_filter("+"));
        assert!(is_valid_topic_filter("$share/derp/derp"));
    }

    #[test]
    fn topic_filters_invalid() {
        assert!(!is_valid_topic_filter(""));
        assert!(!is_valid_topic_filter("derp+"));
        assert!(!is_valid_topic_filter("derp+/"));
        assert!(!is_valid_topic_filter("#/a"));
        assert!(!is_valid_topic_filter("sport/tennis/#/ranking"));
        assert!(!is_valid_topic_filter("sport/tennis#"));
        assert!(!is_valid_topic_filter("a/\0"));
        assert!(!is_valid_topic_filter("$share/group"));
    }

    #[test]
    fn topic_filter_share_properties() {
        assert!(!compute_topic_filter_properties("$share//c").is_shared);
        assert!(!compute_topic_filter_properties("$share/a").is_shared);
        assert!(!compute_topic_filter_properties("$share/+/a").is_shared);
        assert!(!compute_topic_filter_properties("a/$share/b/c").is_shared);

        assert!(compute_topic_filter_properties("$share/b//").is_shared);
        assert!(compute_topic_filter_properties("$share/a/b").is_shared);
        assert!(compute_topic_filter_properties("$share/a/#").is_shared);
        assert!(compute_topic_filter_properties("$share/a/#").has_wildcard);
    }

    fn restrictive_settings() -> NegotiatedSettings {
        NegotiatedSettings {
            maximum_qos: QualityOfService::AtLeastOnce,
            retain_available: false,
            wildcard_subscriptions_available: false,
            subscription_identifiers_available: false,
            shared_subscriptions_available: false,
            maximum_packet_size_to_server: 64,
            ..Default::default()
        }
    }

    #[test]
    fn publish_validation_without_settings() {
        let good = PublishPacket::new("a/b", "hello".as_bytes(), QualityOfService::ExactlyOnce, true);
        assert!(validate_publish_outbound(&good, ProtocolVersion::Mqtt5, None).is_ok());
        assert!(validate_publish_outbound(&good, ProtocolVersion::Mqtt311, None).is_ok());

        let wildcard = PublishPacket::new("a/+", "hello".as_bytes(), QualityOfService::AtMostOnce, false);
        assert_matches!(validate_publish_outbound(&wildcard, ProtocolVersion::Mqtt5, None), Err(MqttifyError::InvalidArgument(_)));

        let aliased = PublishPacket {
            topic_alias: Some(2),
            ..good.clone()
        };
        assert_matches!(validate_publish_outbound(&aliased, ProtocolVersion::Mqtt5, None), Err(MqttifyError::InvalidArgument(_)));

        let duplicate = PublishPacket {
            duplicate: true,
            ..good.clone()
        };
        assert_matches!(validate_publish_outbound(&duplicate, ProtocolVersion::Mqtt5, None), Err(MqttifyError::InvalidArgument(_)));
    }

    #[test]
    fn publish_validation_mqtt5_fields_on_mqtt311() {
        let packet = PublishPacket {
            content_type: Some("application/json".to_string()),
            ..PublishPacket::new("a/b", "hello".as_bytes(), QualityOfService::AtLeastOnce, false)
        };

        assert!(validate_publish_outbound(&packet, ProtocolVersion::Mqtt5, None).is_ok());
        assert_matches!(validate_publish_outbound(&packet, ProtocolVersion::Mqtt311, None), Err(MqttifyError::EncodingFailure(_)));
    }

    #[test]
    fn publish_validation_against_negotiated_settings() {
        let settings = restrictive_settings();

        let qos2 = PublishPacket::new("a/b", "hello".as_bytes(), QualityOfService::ExactlyOnce, false);
        assert_matches!(validate_publish_outbound(&qos2, ProtocolVersion::Mqtt5, Some(&settings)), Err(MqttifyError::InvalidArgument(_)));

        let retained = PublishPacket::new("a/b", "hello".as_bytes(), QualityOfService::AtLeastOnce, true);
        assert_matches!(validate_publish_outbound(&retained, ProtocolVersion::Mqtt5, Some(&settings)), Err(MqttifyError::InvalidArgument(_)));

        let oversized = PublishPacket::new("a/b", &[0u8; 100], QualityOfService::AtLeastOnce, false);
        assert_matches!(validate_publish_outbound(&oversized, ProtocolVersion::Mqtt5, Some(&settings)), Err(MqttifyError::InvalidArgument(_)));

        let fine = PublishPacket::new("a/b", "hello".as_bytes(), QualityOfService::AtLeastOnce, false);
        assert!(validate_publish_outbound(&fine, ProtocolVersion::Mqtt5, Some(&settings)).is_ok());
    }

    #[test]
    fn subscribe_validation() {
        let settings = restrictive_settings();

        let wildcard = SubscribePacket {
            subscriptions: vec!(Subscription::new("a/+", QualityOfService::AtLeastOnce)),
            ..Default::default()
        };
        assert!(validate_subscribe_outbound(&wildcard, ProtocolVersion::Mqtt5, None).is_ok());
        assert_matches!(validate_subscribe_outbound(&wildcard, ProtocolVersion::Mqtt5, Some(&settings)), Err(MqttifyError::InvalidArgument(_)));

        let shared_no_local = SubscribePacket {
            subscriptions: vec!(Subscription::new("$share/g/a", QualityOfService::AtLeastOnce).with_no_local(true)),
            ..Default::default()
        };
        assert_matches!(validate_subscribe_outbound(&shared_no_local, ProtocolVersion::Mqtt5, None), Err(MqttifyError::InvalidArgument(_)));

        let with_id = SubscribePacket {
            subscriptions: vec!(Subscription::new("a/b", QualityOfService::AtLeastOnce)),
            subscription_identifier: Some(7),
            ..Default::default()
        };
        assert!(validate_subscribe_outbound(&with_id, ProtocolVersion::Mqtt5, None).is_ok());
        assert_matches!(validate_subscribe_outbound(&with_id, ProtocolVersion::Mqtt5, Some(&settings)), Err(MqttifyError::InvalidArgument(_)));
        assert_matches!(validate_subscribe_outbound(&with_id, ProtocolVersion::Mqtt311, None), Err(MqttifyError::EncodingFailure(_)));

        let empty = SubscribePacket::default();
        assert_matches!(validate_subscribe_outbound(&empty, ProtocolVersion::Mqtt5, None), Err(MqttifyError::InvalidArgument(_)));
    }

    #[test]
    fn subscribe_validation_conflicting_duplicate_filters() {
        let conflicting = SubscribePacket {
            subscriptions: vec!(
                Subscription::new("a/b", QualityOfService::AtLeastOnce),
                Subscription::new("c", QualityOfService::AtLeastOnce),
                Subscription::new("a/b", QualityOfService::ExactlyOnce),
            ),
            ..Default::default()
        };
        assert_matches!(validate_subscribe_outbound(&conflicting, ProtocolVersion::Mqtt5, None), Err(MqttifyError::InvalidArgument(_)));

        let agreeing = SubscribePacket {
            subscriptions: vec!(
                Subscription::new("a/b", QualityOfService::AtLeastOnce),
                Subscription::new("a/b", QualityOfService::AtLeastOnce),
            ),
            ..Default::default()
        };
        assert!(validate_subscribe_outbound(&agreeing, ProtocolVersion::Mqtt5, None).is_ok());
    }

    #[test]
    fn unsubscribe_validation() {
        let good = UnsubscribePacket {
            topic_filters: vec!("a/#".to_string(), "b/+/c".to_string()),
            ..Default::default()
        };
        assert!(validate_unsubscribe_outbound(&good, ProtocolVersion::Mqtt311, None).is_ok());

        let bad = UnsubscribePacket {
            topic_filters: vec!("a/#/b".to_string()),
            ..Default::default()
        };
        assert_matches!(validate_unsubscribe_outbound(&bad, ProtocolVersion::Mqtt5, None), Err(MqttifyError::InvalidArgument(_)));

        assert_matches!(validate_unsubscribe_outbound(&UnsubscribePacket::default(), ProtocolVersion::Mqtt5, None), Err(MqttifyError::InvalidArgument(_)));
    }

    #[test]
    fn disconnect_validation_session_expiry() {
        let settings = NegotiatedSettings {
            session_expiry_interval: 0,
            ..Default::default()
        };

        let raise = DisconnectPacket {
            session_expiry_interval_seconds: Some(30),
            ..Default::default()
        };
        assert_matches!(validate_disconnect_outbound(&raise, ProtocolVersion::Mqtt5, Some(&settings)), Err(MqttifyError::InvalidArgument(_)));
        assert!(validate_disconnect_outbound(&DisconnectPacket::default(), ProtocolVersion::Mqtt5, Some(&settings)).is_ok());
    }

    #[test]
    fn connect_validation() {
        let bad_will = ConnectPacket {
            will: Some(PublishPacket::new("will/#", &[], QualityOfService::AtMostOnce, false)),
            ..Default::default()
        };
        assert_matches!(validate_connect_outbound(&bad_will, ProtocolVersion::Mqtt5), Err(MqttifyError::InvalidArgument(_)));

        let zero_receive_maximum = ConnectPacket {
            receive_maximum: Some(0),
            ..Default::default()
        };
        assert_matches!(validate_connect_outbound(&zero_receive_maximum, ProtocolVersion::Mqtt5), Err(MqttifyError::InvalidArgument(_)));

        let mqtt5_only = ConnectPacket {
            session_expiry_interval_seconds: Some(3600),
            ..Default::default()
        };
        assert!(validate_connect_outbound(&mqtt5_only, ProtocolVersion::Mqtt5).is_ok());
        assert_matches!(validate_connect_outbound(&mqtt5_only, ProtocolVersion::Mqtt311), Err(MqttifyError::EncodingFailure(_)));
    }
}
