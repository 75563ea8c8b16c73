/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

use crate::decode::*;
use crate::encode::*;
use crate::error::{MqttifyError, MqttifyResult};
use crate::logging::*;
use crate::mqtt::*;
use crate::mqtt::utils::*;

use log::*;
use std::fmt;

fn compute_subscription_options_byte(subscription: &Subscription) -> u8 {
    let mut options_byte = subscription.qos as u8;

    if subscription.no_local {
        options_byte |= SUBSCRIPTION_OPTIONS_NO_LOCAL_MASK;
    }

    if subscription.retain_as_published {
        options_byte |= SUBSCRIPTION_OPTIONS_RETAIN_AS_PUBLISHED_MASK;
    }

    options_byte |= (subscription.retain_handling_type as u8) << SUBSCRIPTION_OPTIONS_RETAIN_HANDLING_SHIFT;

    options_byte
}

pub(crate) fn write_subscribe_packet(packet: &SubscribePacket, context: &EncodingContext, dest: &mut Vec<u8>) -> MqttifyResult<()> {
    if packet.subscriptions.is_empty() {
        return Err(MqttifyError::new_encoding_failure("subscribe packet must contain at least one subscription"));
    }

    let mut body = Vec::with_capacity(32);
    encode_u16(packet.packet_id, &mut body);

    if context.protocol_version == ProtocolVersion::Mqtt311 {
        ensure_absent_for_mqtt311(context, PacketType::Subscribe, "subscription_identifier", packet.subscription_identifier.is_some())?;
        ensure_absent_for_mqtt311(context, PacketType::Subscribe, "user_properties", packet.user_properties.is_some())?;

        let has_mqtt5_options = packet.subscriptions.iter().any(|subscription| subscription.has_mqtt5_options());
        ensure_absent_for_mqtt311(context, PacketType::Subscribe, "subscription options", has_mqtt5_options)?;
    } else {
        let mut properties = Vec::new();
        if let Some(subscription_identifier) = packet.subscription_identifier {
            encode_vli_property(PROPERTY_KEY_SUBSCRIPTION_IDENTIFIER, subscription_identifier, &mut properties)?;
        }
        encode_user_properties(&packet.user_properties, &mut properties)?;

        encode_properties_block(&properties, &mut body)?;
    }

    for subscription in &packet.subscriptions {
        encode_length_prefixed_string(&subscription.topic_filter, &mut body)?;
        encode_u8(compute_subscription_options_byte(subscription), &mut body);
    }

    encode_fixed_header_and_body(SUBSCRIBE_FIRST_BYTE, &body, dest)
}

fn decode_subscribe_properties(property_bytes: &[u8], packet: &mut SubscribePacket) -> MqttifyResult<()> {
    let mut mutable_property_bytes = property_bytes;

    while !mutable_property_bytes.is_empty() {
        let property_key = mutable_property_bytes[0];
        mutable_property_bytes = &mutable_property_bytes[1..];

        match property_key {
            PROPERTY_KEY_SUBSCRIPTION_IDENTIFIER => {
                if packet.subscription_identifier.is_some() {
                    error!("SubscribePacket Decode - duplicate subscription identifier");
                    return Err(MqttifyError::new_malformed_packet("subscribe packet has more than one subscription identifier"));
                }

                let mut subscription_identifier : usize = 0;
                mutable_property_bytes = decode_vli_into_mutable(mutable_property_bytes, &mut subscription_identifier)?;
                if subscription_identifier == 0 {
                    error!("SubscribePacket Decode - subscription identifier of zero");
                    return Err(MqttifyError::new_malformed_packet("subscribe subscription identifier may not be zero"));
                }

                packet.subscription_identifier = Some(subscription_identifier as u32);
            }
            PROPERTY_KEY_USER_PROPERTY => { mutable_property_bytes = decode_user_property(mutable_property_bytes, &mut packet.user_properties)?; }
            _ => { return Err(unknown_property_error(PacketType::Subscribe, property_key)); }
        }
    }

    Ok(())
}

pub(crate) fn decode_subscribe_packet(first_byte: u8, packet_body: &[u8], protocol_version: ProtocolVersion) -> MqttifyResult<MqttPacket> {
    validate_fixed_header_flags(PacketType::Subscribe, first_byte, SUBSCRIBE_FIRST_BYTE)?;

    let mut packet = SubscribePacket::default();
    let mut mutable_body = decode_u16(packet_body, &mut packet.packet_id)?;

    let reserved_mask =
        if protocol_version == ProtocolVersion::Mqtt5 {
            let (property_bytes, remaining_body) = decode_properties_block(mutable_body)?;
            decode_subscribe_properties(property_bytes, &mut packet)?;
            mutable_body = remaining_body;

            SUBSCRIPTION_OPTIONS_RESERVED_MASK5
        } else {
            SUBSCRIPTION_OPTIONS_RESERVED_MASK311
        };

    while !mutable_body.is_empty() {
        let mut subscription = Subscription::default();
        mutable_body = decode_length_prefixed_string(mutable_body, &mut subscription.topic_filter)?;

        let mut options_byte : u8 = 0;
        mutable_body = decode_u8(mutable_body, &mut options_byte)?;
        if (options_byte & reserved_mask) != 0 {
            error!("SubscribePacket Decode - reserved subscription option bits set");
            return Err(MqttifyError::new_malformed_packet("subscribe packet has reserved subscription option bits set"));
        }

        subscription.qos = convert_u8_to_quality_of_service(options_byte & QOS_MASK)?;
        subscription.no_local = (options_byte & SUBSCRIPTION_OPTIONS_NO_LOCAL_MASK) != 0;
        subscription.retain_as_published = (options_byte & SUBSCRIPTION_OPTIONS_RETAIN_AS_PUBLISHED_MASK) != 0;
        subscription.retain_handling_type = convert_u8_to_retain_handling_type((options_byte >> SUBSCRIPTION_OPTIONS_RETAIN_HANDLING_SHIFT) & QOS_MASK)?;

        packet.subscriptions.push(subscription);
    }

    if packet.subscriptions.is_empty() {
        error!("SubscribePacket Decode - no subscriptions");
        return Err(MqttifyError::new_malformed_packet("subscribe packet contains no subscriptions"));
    }

    Ok(MqttPacket::Subscribe(packet))
}

impl fmt::Display for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "(")?;
        log_string!(self.topic_filter, f, "topic_filter");
        log_enum!(self.qos, f, "qos");
        log_primitive_value!(self.no_local, f, "no_local");
        log_primitive_value!(self.retain_as_published, f, "retain_as_published");
        log_enum!(self.retain_handling_type, f, "retain_handling_type");
        write!(f, " )")
    }
}

impl fmt::Display for SubscribePacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "SubscribePacket {{")?;
        log_primitive_value!(self.packet_id, f, "packet_id");
        log_optional_primitive_value!(self.subscription_identifier, f, "subscription_identifier");

        write!(f, " subscriptions:[")?;
        for subscription in &self.subscriptions {
            write!(f, " {}", subscription)?;
        }
        write!(f, " ]")?;

        log_user_properties!(self.user_properties, f, "user_properties");
        write!(f, " }}")
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::decode::testing::*;
    use assert_matches::assert_matches;

    #[test]
    fn subscribe_round_trip_encode_decode_basic() {
        let packet = SubscribePacket {
            packet_id: 123,
            subscriptions: vec!(
                Subscription::new("hello/world", QualityOfService::AtLeastOnce),
                Subscription::new("a/+/c", QualityOfService::ExactlyOnce),
                Subscription::new("a/#", QualityOfService::AtMostOnce),
            ),
            ..Default::default()
        };

        assert!(do_round_trip_encode_decode_test(&MqttPacket::Subscribe(packet.clone()), ProtocolVersion::Mqtt5));
        assert!(do_round_trip_encode_decode_test(&MqttPacket::Subscribe(packet), ProtocolVersion::Mqtt311));
    }

    fn create_subscribe_with_all_fields() -> SubscribePacket {
        SubscribePacket {
            packet_id: 1023,
            subscriptions: vec!(
                Subscription::new("hello/world", QualityOfService::AtLeastOnce)
                    .with_no_local(true)
                    .with_retain_handling_type(RetainHandlingType::DontSend),
                Subscription::new("$share/group/a/b", QualityOfService::ExactlyOnce)
                    .with_retain_as_published(true)
                    .with_retain_handling_type(RetainHandlingType::SendOnSubscribeIfNew),
            ),
            subscription_identifier: Some(47),
            user_properties: Some(vec!(
                UserProperty::new("subscribe", "stuff"),
            )),
        }
    }

    #[test]
    fn subscribe_round_trip_encode_decode_all_fields() {
        let packet = create_subscribe_with_all_fields();
        assert!(do_round_trip_encode_decode_test(&MqttPacket::Subscribe(packet), ProtocolVersion::Mqtt5));
    }

    #[test]
    fn subscribe_encode_failure_mqtt5_fields_on_mqtt311() {
        let packet = create_subscribe_with_all_fields();
        assert_matches!(encode_packet(&MqttPacket::Subscribe(packet), ProtocolVersion::Mqtt311), Err(MqttifyError::EncodingFailure(_)));

        let packet = SubscribePacket {
            packet_id: 5,
            subscriptions: vec!(Subscription::new("a", QualityOfService::AtMostOnce).with_no_local(true)),
            ..Default::default()
        };
        assert_matches!(encode_packet(&MqttPacket::Subscribe(packet), ProtocolVersion::Mqtt311), Err(MqttifyError::EncodingFailure(_)));
    }

    #[test]
    fn subscribe_encode_failure_no_subscriptions() {
        let packet = SubscribePacket {
            packet_id: 5,
            ..Default::default()
        };

        assert_matches!(encode_packet(&MqttPacket::Subscribe(packet), ProtocolVersion::Mqtt5), Err(MqttifyError::EncodingFailure(_)));
    }

    #[test]
    fn subscribe_decode_failure_bad_fixed_header() {
        let packet = create_subscribe_with_all_fields();
        do_fixed_header_flag_decode_failure_test(&MqttPacket::Subscribe(packet), ProtocolVersion::Mqtt5, 4);
    }

    #[test]
    fn subscribe_decode_failure_reserved_option_bits() {
        let packet = SubscribePacket {
            packet_id: 5,
            subscriptions: vec!(Subscription::new("a", QualityOfService::AtLeastOnce)),
            ..Default::default()
        };

        let set_reserved_bits = | bytes: &[u8] | -> Vec<u8> {
            let mut clone = bytes.to_vec();
            let last = clone.len() - 1;
            clone[last] |= 0x40;
            clone
        };

        do_mutated_decode_failure_test(&MqttPacket::Subscribe(packet.clone()), ProtocolVersion::Mqtt5, set_reserved_bits);

        // no-local is a reserved bit in 3.1.1
        let set_no_local = | bytes: &[u8] | -> Vec<u8> {
            let mut clone = bytes.to_vec();
            let last = clone.len() - 1;
            clone[last] |= SUBSCRIPTION_OPTIONS_NO_LOCAL_MASK;
            clone
        };

        do_mutated_decode_failure_test(&MqttPacket::Subscribe(packet), ProtocolVersion::Mqtt311, set_no_local);
    }

    #[test]
    fn subscribe_decode_failure_bad_qos() {
        let packet = SubscribePacket {
            packet_id: 5,
            subscriptions: vec!(Subscription::new("a", QualityOfService::AtLeastOnce)),
            ..Default::default()
        };

        let set_qos_three = | bytes: &[u8] | -> Vec<u8> {
            let mut clone = bytes.to_vec();
            let last = clone.len() - 1;
            clone[last] |= 0x03;
            clone
        };

        do_mutated_decode_failure_test(&MqttPacket::Subscribe(packet), ProtocolVersion::Mqtt5, set_qos_three);
    }

    #[test]
    fn subscribe_decode_failure_no_subscriptions() {
        let packet = SubscribePacket {
            packet_id: 5,
            subscriptions: vec!(Subscription::new("a", QualityOfService::AtLeastOnce)),
            ..Default::default()
        };

        let remove_subscriptions = | bytes: &[u8] | -> Vec<u8> {
            let mut clone = bytes.to_vec();

            // drop the single four byte topic filter entry
            clone.truncate(clone.len() - 4);
            clone[1] -= 4;

            clone
        };

        do_mutated_decode_failure_test(&MqttPacket::Subscribe(packet), ProtocolVersion::Mqtt5, remove_subscriptions);
    }

    #[test]
    fn subscribe_decode_failure_duplicate_subscription_identifier() {
        let packet = SubscribePacket {
            packet_id: 5,
            subscriptions: vec!(Subscription::new("a", QualityOfService::AtLeastOnce)),
            subscription_identifier: Some(3),
            ..Default::default()
        };

        let duplicate_subscription_identifier = | bytes: &[u8] | -> Vec<u8> {
            let mut clone = bytes.to_vec();

            clone[1] += 2;
            clone[4] += 2;
            clone.splice(5..5, [PROPERTY_KEY_SUBSCRIPTION_IDENTIFIER, 4]);

            clone
        };

        do_mutated_decode_failure_test(&MqttPacket::Subscribe(packet), ProtocolVersion::Mqtt5, duplicate_subscription_identifier);
    }

    #[test]
    fn subscribe_decode_failure_packet_size() {
        let packet = create_subscribe_with_all_fields();
        do_inbound_size_decode_failure_test(&MqttPacket::Subscribe(packet), ProtocolVersion::Mqtt5);
    }
}
