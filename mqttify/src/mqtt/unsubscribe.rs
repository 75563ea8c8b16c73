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

pub(crate) fn write_unsubscribe_packet(packet: &UnsubscribePacket, context: &EncodingContext, dest: &mut Vec<u8>) -> MqttifyResult<()> {
    if packet.topic_filters.is_empty() {
        return Err(MqttifyError::new_encoding_failure("unsubscribe packet must contain at least one topic filter"));
    }

    let mut body = Vec::with_capacity(32);
    encode_u16(packet.packet_id, &mut body);

    if context.protocol_version == ProtocolVersion::Mqtt311 {
        ensure_absent_for_mqtt311(context, PacketType::Unsubscribe, "user_properties", packet.user_properties.is_some())?;
    } else {
        let mut properties = Vec::new();
        encode_user_properties(&packet.user_properties, &mut properties)?;
        encode_properties_block(&properties, &mut body)?;
    }

    for topic_filter in &packet.topic_filters {
        encode_length_prefixed_string(topic_filter, &mut body)?;
    }

    encode_fixed_header_and_body(UNSUBSCRIBE_FIRST_BYTE, &body, dest)
}

fn decode_unsubscribe_properties(property_bytes: &[u8], packet: &mut UnsubscribePacket) -> MqttifyResult<()> {
    let mut mutable_property_bytes = property_bytes;

    while !mutable_property_bytes.is_empty() {
        let property_key = mutable_property_bytes[0];
        mutable_property_bytes = &mutable_property_bytes[1..];

        match property_key {
            PROPERTY_KEY_USER_PROPERTY => { mutable_property_bytes = decode_user_property(mutable_property_bytes, &mut packet.user_properties)?; }
            _ => { return Err(unknown_property_error(PacketType::Unsubscribe, property_key)); }
        }
    }

    Ok(())
}

pub(crate) fn decode_unsubscribe_packet(first_byte: u8, packet_body: &[u8], protocol_version: ProtocolVersion) -> MqttifyResult<MqttPacket> {
    validate_fixed_header_flags(PacketType::Unsubscribe, first_byte, UNSUBSCRIBE_FIRST_BYTE)?;

    let mut packet = UnsubscribePacket::default();
    let mut mutable_body = decode_u16(packet_body, &mut packet.packet_id)?;

    if protocol_version == ProtocolVersion::Mqtt5 {
        let (property_bytes, remaining_body) = decode_properties_block(mutable_body)?;
        decode_unsubscribe_properties(property_bytes, &mut packet)?;
        mutable_body = remaining_body;
    }

    while !mutable_body.is_empty() {
        let mut topic_filter = String::new();
        mutable_body = decode_length_prefixed_string(mutable_body, &mut topic_filter)?;
        packet.topic_filters.push(topic_filter);
    }

    if packet.topic_filters.is_empty() {
        error!("UnsubscribePacket Decode - no topic filters");
        return Err(MqttifyError::new_malformed_packet("unsubscribe packet contains no topic filters"));
    }

    Ok(MqttPacket::Unsubscribe(packet))
}

impl fmt::Display for UnsubscribePacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "UnsubscribePacket {{")?;
        log_primitive_value!(self.packet_id, f, "packet_id");

        write!(f, " topic_filters:[")?;
        for topic_filter in &self.topic_filters {
            write!(f, " \"{}\"", topic_filter)?;
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
    fn unsubscribe_round_trip_encode_decode_basic() {
        let packet = UnsubscribePacket {
            packet_id: 123,
            topic_filters: vec!("hello/world".to_string(), "a/+/c".to_string(), "#".to_string()),
            ..Default::default()
        };

        assert!(do_round_trip_encode_decode_test(&MqttPacket::Unsubscribe(packet.clone()), ProtocolVersion::Mqtt5));
        assert!(do_round_trip_encode_decode_test(&MqttPacket::Unsubscribe(packet), ProtocolVersion::Mqtt311));
    }

    fn create_unsubscribe_with_all_fields() -> UnsubscribePacket {
        UnsubscribePacket {
            packet_id: 123,
            topic_filters: vec!("hello/world".to_string(), "calvin/is/a/goof".to_string()),
            user_properties: Some(vec!(
                UserProperty::new("unsubscribe", "property"),
                UserProperty::new("unsubscribe", "another"),
            )),
        }
    }

    #[test]
    fn unsubscribe_round_trip_encode_decode_all_fields() {
        let packet = create_unsubscribe_with_all_fields();
        assert!(do_round_trip_encode_decode_test(&MqttPacket::Unsubscribe(packet), ProtocolVersion::Mqtt5));
    }

    #[test]
    fn unsubscribe_encode_failures() {
        let packet = create_unsubscribe_with_all_fields();
        assert_matches!(encode_packet(&MqttPacket::Unsubscribe(packet), ProtocolVersion::Mqtt311), Err(MqttifyError::EncodingFailure(_)));

        let packet = UnsubscribePacket {
            packet_id: 5,
            ..Default::default()
        };
        assert_matches!(encode_packet(&MqttPacket::Unsubscribe(packet), ProtocolVersion::Mqtt5), Err(MqttifyError::EncodingFailure(_)));
    }

    #[test]
    fn unsubscribe_decode_failure_bad_fixed_header() {
        let packet = create_unsubscribe_with_all_fields();
        do_fixed_header_flag_decode_failure_test(&MqttPacket::Unsubscribe(packet), ProtocolVersion::Mqtt5, 9);
    }

    #[test]
    fn unsubscribe_decode_failure_no_topic_filters() {
        let packet = UnsubscribePacket {
            packet_id: 5,
            topic_filters: vec!("a".to_string()),
            ..Default::default()
        };

        let remove_topic_filter = | bytes: &[u8] | -> Vec<u8> {
            let mut clone = bytes.to_vec();
            clone.truncate(clone.len() - 3);
            clone[1] -= 3;
            clone
        };

        do_mutated_decode_failure_test(&MqttPacket::Unsubscribe(packet.clone()), ProtocolVersion::Mqtt5, remove_topic_filter);
        do_mutated_decode_failure_test(&MqttPacket::Unsubscribe(packet), ProtocolVersion::Mqtt311, remove_topic_filter);
    }

    #[test]
    fn unsubscribe_decode_failure_truncated_topic_filter() {
        let packet = UnsubscribePacket {
            packet_id: 5,
            topic_filters: vec!("abc".to_string()),
            ..Default::default()
        };

        let truncate_topic_filter = | bytes: &[u8] | -> Vec<u8> {
            let mut clone = bytes.to_vec();
            clone.pop();
            clone[1] -= 1;
            clone
        };

        do_mutated_decode_failure_test(&MqttPacket::Unsubscribe(packet), ProtocolVersion::Mqtt5, truncate_topic_filter);
    }

    #[test]
    fn unsubscribe_decode_failure_unknown_property() {
        let packet = UnsubscribePacket {
            packet_id: 5,
            topic_filters: vec!("a".to_string()),
            ..Default::default()
        };

        let add_reason_string = | bytes: &[u8] | -> Vec<u8> {
            let mut clone = bytes.to_vec();

            clone[1] += 4;
            clone[4] += 4;
            clone.splice(5..5, [PROPERTY_KEY_REASON_STRING, 0, 1, 65]);

            clone
        };

        do_mutated_decode_failure_test(&MqttPacket::Unsubscribe(packet), ProtocolVersion::Mqtt5, add_reason_string);
    }

    #[test]
    fn unsubscribe_decode_failure_packet_size() {
        let packet = create_unsubscribe_with_all_fields();
        do_inbound_size_decode_failure_test(&MqttPacket::Unsubscribe(packet), ProtocolVersion::Mqtt5);
    }
}
