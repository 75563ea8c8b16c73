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

pub(crate) fn write_unsuback_packet(packet: &UnsubackPacket, context: &EncodingContext, dest: &mut Vec<u8>) -> MqttifyResult<()> {
    let mut body = Vec::with_capacity(16);
    encode_u16(packet.packet_id, &mut body);

    if context.protocol_version == ProtocolVersion::Mqtt311 {
        ensure_absent_for_mqtt311(context, PacketType::Unsuback, "reason_string", packet.reason_string.is_some())?;
        ensure_absent_for_mqtt311(context, PacketType::Unsuback, "user_properties", packet.user_properties.is_some())?;
        ensure_absent_for_mqtt311(context, PacketType::Unsuback, "reason_codes", !packet.reason_codes.is_empty())?;
    } else {
        if packet.reason_codes.is_empty() {
            return Err(MqttifyError::new_encoding_failure("unsuback packet must contain at least one reason code"));
        }

        let mut properties = Vec::new();
        encode_optional_string_property(PROPERTY_KEY_REASON_STRING, &packet.reason_string, &mut properties)?;
        encode_user_properties(&packet.user_properties, &mut properties)?;
        encode_properties_block(&properties, &mut body)?;

        for reason_code in &packet.reason_codes {
            encode_u8(*reason_code as u8, &mut body);
        }
    }

    encode_fixed_header_and_body(UNSUBACK_FIRST_BYTE, &body, dest)
}

fn decode_unsuback_properties(property_bytes: &[u8], packet: &mut UnsubackPacket) -> MqttifyResult<()> {
    let mut mutable_property_bytes = property_bytes;

    while !mutable_property_bytes.is_empty() {
        let property_key = mutable_property_bytes[0];
        mutable_property_bytes = &mutable_property_bytes[1..];

        match property_key {
            PROPERTY_KEY_REASON_STRING => { mutable_property_bytes = decode_optional_length_prefixed_string(mutable_property_bytes, &mut packet.reason_string)?; }
            PROPERTY_KEY_USER_PROPERTY => { mutable_property_bytes = decode_user_property(mutable_property_bytes, &mut packet.user_properties)?; }
            _ => { return Err(unknown_property_error(PacketType::Unsuback, property_key)); }
        }
    }

    Ok(())
}

/// MQTT 3.1.1 UNSUBACKs carry no reason codes; the decoded packet's list is left empty.
pub(crate) fn decode_unsuback_packet(first_byte: u8, packet_body: &[u8], protocol_version: ProtocolVersion) -> MqttifyResult<MqttPacket> {
    validate_fixed_header_flags(PacketType::Unsuback, first_byte, UNSUBACK_FIRST_BYTE)?;

    let mut packet = UnsubackPacket::default();
    let mut mutable_body = decode_u16(packet_body, &mut packet.packet_id)?;

    if protocol_version == ProtocolVersion::Mqtt311 {
        validate_fully_consumed(PacketType::Unsuback, mutable_body)?;
        return Ok(MqttPacket::Unsuback(packet));
    }

    let (property_bytes, remaining_body) = decode_properties_block(mutable_body)?;
    decode_unsuback_properties(property_bytes, &mut packet)?;
    mutable_body = remaining_body;

    packet.reason_codes.reserve(mutable_body.len());
    for reason_code_byte in mutable_body {
        packet.reason_codes.push(convert_u8_to_unsuback_reason_code(*reason_code_byte)?);
    }

    if packet.reason_codes.is_empty() {
        error!("UnsubackPacket Decode - no reason codes");
        return Err(MqttifyError::new_malformed_packet("unsuback packet contains no reason codes"));
    }

    Ok(MqttPacket::Unsuback(packet))
}

impl fmt::Display for UnsubackPacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "UnsubackPacket {{")?;
        log_primitive_value!(self.packet_id, f, "packet_id");
        log_optional_string!(self.reason_string, f, "reason_string");
        log_user_properties!(self.user_properties, f, "user_properties");

        write!(f, " reason_codes:[")?;
        for reason_code in &self.reason_codes {
            write!(f, " {:?}", reason_code)?;
        }
        write!(f, " ] }}")
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::decode::testing::*;
    use assert_matches::assert_matches;

    #[test]
    fn unsuback_round_trip_encode_decode_mqtt311() {
        let packet = UnsubackPacket {
            packet_id: 1023,
            ..Default::default()
        };

        assert!(do_round_trip_encode_decode_test(&MqttPacket::Unsuback(packet), ProtocolVersion::Mqtt311));
    }

    #[test]
    fn unsuback_round_trip_encode_decode_basic() {
        let packet = UnsubackPacket {
            packet_id: 1023,
            reason_codes: vec!(
                UnsubackReasonCode::ImplementationSpecificError,
                UnsubackReasonCode::Success,
                UnsubackReasonCode::TopicNameInvalid,
            ),
            ..Default::default()
        };

        assert!(do_round_trip_encode_decode_test(&MqttPacket::Unsuback(packet), ProtocolVersion::Mqtt5));
    }

    fn create_unsuback_with_all_fields() -> UnsubackPacket {
        UnsubackPacket {
            packet_id: 1023,
            reason_string: Some("Didn't feel like it".to_string()),
            user_properties: Some(vec!(
                UserProperty::new("unsuback", "property"),
            )),
            reason_codes: vec!(
                UnsubackReasonCode::NoSubscriptionExisted,
                UnsubackReasonCode::NotAuthorized,
                UnsubackReasonCode::PacketIdentifierInUse,
            ),
        }
    }

    #[test]
    fn unsuback_round_trip_encode_decode_all_fields() {
        let packet = create_unsuback_with_all_fields();
        assert!(do_round_trip_encode_decode_test(&MqttPacket::Unsuback(packet), ProtocolVersion::Mqtt5));
    }

    #[test]
    fn unsuback_encode_failures() {
        let packet = create_unsuback_with_all_fields();
        assert_matches!(encode_packet(&MqttPacket::Unsuback(packet), ProtocolVersion::Mqtt311), Err(MqttifyError::EncodingFailure(_)));

        let packet = UnsubackPacket {
            packet_id: 5,
            ..Default::default()
        };
        assert_matches!(encode_packet(&MqttPacket::Unsuback(packet), ProtocolVersion::Mqtt5), Err(MqttifyError::EncodingFailure(_)));
    }

    #[test]
    fn unsuback_decode_failure_bad_fixed_header() {
        let packet = create_unsuback_with_all_fields();
        do_fixed_header_flag_decode_failure_test(&MqttPacket::Unsuback(packet), ProtocolVersion::Mqtt5, 15);
    }

    #[test]
    fn unsuback_decode_failure_bad_reason_code() {
        let packet = create_unsuback_with_all_fields();

        let corrupt_reason_code = | bytes: &[u8] | -> Vec<u8> {
            let mut clone = bytes.to_vec();
            let last = clone.len() - 1;
            clone[last] = 200;
            clone
        };

        do_mutated_decode_failure_test(&MqttPacket::Unsuback(packet), ProtocolVersion::Mqtt5, corrupt_reason_code);
    }

    #[test]
    fn unsuback_decode_failure_trailing_bytes_mqtt311() {
        let packet = UnsubackPacket {
            packet_id: 5,
            ..Default::default()
        };

        let add_reason_code = | bytes: &[u8] | -> Vec<u8> {
            let mut clone = bytes.to_vec();
            clone[1] += 1;
            clone.push(0);
            clone
        };

        do_mutated_decode_failure_test(&MqttPacket::Unsuback(packet), ProtocolVersion::Mqtt311, add_reason_code);
    }

    #[test]
    fn unsuback_decode_failure_duplicate_reason_string() {
        let packet = create_unsuback_with_all_fields();

        let duplicate_reason_string = | bytes: &[u8] | -> Vec<u8> {
            let mut clone = bytes.to_vec();

            clone[1] += 5;
            clone[4] += 5;
            clone.splice(5..5, [PROPERTY_KEY_REASON_STRING, 0, 2, 67, 67]);

            clone
        };

        do_mutated_decode_failure_test(&MqttPacket::Unsuback(packet), ProtocolVersion::Mqtt5, duplicate_reason_string);
    }

    #[test]
    fn unsuback_decode_failure_packet_size() {
        let packet = create_unsuback_with_all_fields();
        do_inbound_size_decode_failure_test(&MqttPacket::Unsuback(packet), ProtocolVersion::Mqtt5);
    }
}
