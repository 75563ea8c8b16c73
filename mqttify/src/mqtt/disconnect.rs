/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

use crate::decode::*;
use crate::encode::*;
use crate::error::MqttifyResult;
use crate::logging::*;
use crate::mqtt::*;
use crate::mqtt::utils::*;

use std::fmt;

pub(crate) fn write_disconnect_packet(packet: &DisconnectPacket, context: &EncodingContext, dest: &mut Vec<u8>) -> MqttifyResult<()> {
    let mut body = Vec::new();

    if context.protocol_version == ProtocolVersion::Mqtt311 {
        ensure_absent_for_mqtt311(context, PacketType::Disconnect, "reason_code", packet.reason_code != DisconnectReasonCode::NormalDisconnection)?;
        ensure_absent_for_mqtt311(context, PacketType::Disconnect, "session_expiry_interval_seconds", packet.session_expiry_interval_seconds.is_some())?;
        ensure_absent_for_mqtt311(context, PacketType::Disconnect, "reason_string", packet.reason_string.is_some())?;
        ensure_absent_for_mqtt311(context, PacketType::Disconnect, "user_properties", packet.user_properties.is_some())?;
        ensure_absent_for_mqtt311(context, PacketType::Disconnect, "server_reference", packet.server_reference.is_some())?;
    } else {
        let mut properties = Vec::new();
        encode_optional_u32_property(PROPERTY_KEY_SESSION_EXPIRY_INTERVAL, packet.session_expiry_interval_seconds, &mut properties);
        encode_optional_string_property(PROPERTY_KEY_REASON_STRING, &packet.reason_string, &mut properties)?;
        encode_user_properties(&packet.user_properties, &mut properties)?;
        encode_optional_string_property(PROPERTY_KEY_SERVER_REFERENCE, &packet.server_reference, &mut properties)?;

        if !properties.is_empty() {
            encode_u8(packet.reason_code as u8, &mut body);
            encode_properties_block(&properties, &mut body)?;
        } else if packet.reason_code != DisconnectReasonCode::NormalDisconnection {
            encode_u8(packet.reason_code as u8, &mut body);
        }
    }

    encode_fixed_header_and_body(DISCONNECT_FIRST_BYTE, &body, dest)
}

fn decode_disconnect_properties(property_bytes: &[u8], packet: &mut DisconnectPacket) -> MqttifyResult<()> {
    let mut mutable_property_bytes = property_bytes;

    while !mutable_property_bytes.is_empty() {
        let property_key = mutable_property_bytes[0];
        mutable_property_bytes = &mutable_property_bytes[1..];

        match property_key {
            PROPERTY_KEY_SESSION_EXPIRY_INTERVAL => { mutable_property_bytes = decode_optional_u32(mutable_property_bytes, &mut packet.session_expiry_interval_seconds)?; }
            PROPERTY_KEY_REASON_STRING => { mutable_property_bytes = decode_optional_length_prefixed_string(mutable_property_bytes, &mut packet.reason_string)?; }
            PROPERTY_KEY_USER_PROPERTY => { mutable_property_bytes = decode_user_property(mutable_property_bytes, &mut packet.user_properties)?; }
            PROPERTY_KEY_SERVER_REFERENCE => { mutable_property_bytes = decode_optional_length_prefixed_string(mutable_property_bytes, &mut packet.server_reference)?; }
            _ => { return Err(unknown_property_error(PacketType::Disconnect, property_key)); }
        }
    }

    Ok(())
}

pub(crate) fn decode_disconnect_packet(first_byte: u8, packet_body: &[u8], protocol_version: ProtocolVersion) -> MqttifyResult<MqttPacket> {
    validate_fixed_header_flags(PacketType::Disconnect, first_byte, DISCONNECT_FIRST_BYTE)?;

    let mut packet = DisconnectPacket::default();
    let mut mutable_body = packet_body;

    if protocol_version == ProtocolVersion::Mqtt5 && !mutable_body.is_empty() {
        mutable_body = decode_u8_as_enum(mutable_body, &mut packet.reason_code, convert_u8_to_disconnect_reason_code)?;

        if !mutable_body.is_empty() {
            let (property_bytes, remaining_body) = decode_properties_block(mutable_body)?;
            decode_disconnect_properties(property_bytes, &mut packet)?;
            mutable_body = remaining_body;
        }
    }

    validate_fully_consumed(PacketType::Disconnect, mutable_body)?;

    Ok(MqttPacket::Disconnect(packet))
}

impl fmt::Display for DisconnectPacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "DisconnectPacket {{")?;
        log_enum!(self.reason_code, f, "reason_code");
        log_optional_primitive_value!(self.session_expiry_interval_seconds, f, "session_expiry_interval_seconds");
        log_optional_string!(self.reason_string, f, "reason_string");
        log_user_properties!(self.user_properties, f, "user_properties");
        log_optional_string!(self.server_reference, f, "server_reference");
        write!(f, " }}")
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::decode::testing::*;
    use crate::error::MqttifyError;
    use assert_matches::assert_matches;

    #[test]
    fn disconnect_round_trip_encode_decode_default() {
        let packet = DisconnectPacket {
            ..Default::default()
        };

        assert!(do_round_trip_encode_decode_test(&MqttPacket::Disconnect(packet.clone()), ProtocolVersion::Mqtt5));
        assert!(do_round_trip_encode_decode_test(&MqttPacket::Disconnect(packet), ProtocolVersion::Mqtt311));
    }

    #[test]
    fn disconnect_round_trip_encode_decode_reason_code_only() {
        let packet = DisconnectPacket {
            reason_code: DisconnectReasonCode::KeepAliveTimeout,
            ..Default::default()
        };

        assert!(do_round_trip_encode_decode_test(&MqttPacket::Disconnect(packet.clone()), ProtocolVersion::Mqtt5));
        assert_eq!(vec!(DISCONNECT_FIRST_BYTE, 1, DisconnectReasonCode::KeepAliveTimeout as u8), encode_packet_for_test(&MqttPacket::Disconnect(packet), ProtocolVersion::Mqtt5));
    }

    fn create_disconnect_with_all_fields() -> DisconnectPacket {
        DisconnectPacket {
            reason_code: DisconnectReasonCode::ServerMoved,
            session_expiry_interval_seconds: Some(3600),
            reason_string: Some("Move along".to_string()),
            user_properties: Some(vec!(
                UserProperty::new("disconnect", "property"),
            )),
            server_reference: Some("somewhere.else.com".to_string()),
        }
    }

    #[test]
    fn disconnect_round_trip_encode_decode_all_fields() {
        let packet = create_disconnect_with_all_fields();
        assert!(do_round_trip_encode_decode_test(&MqttPacket::Disconnect(packet), ProtocolVersion::Mqtt5));
    }

    #[test]
    fn disconnect_encode_failure_mqtt5_fields_on_mqtt311() {
        let packet = create_disconnect_with_all_fields();
        assert_matches!(encode_packet(&MqttPacket::Disconnect(packet), ProtocolVersion::Mqtt311), Err(MqttifyError::EncodingFailure(_)));

        let packet = DisconnectPacket {
            reason_code: DisconnectReasonCode::DisconnectWithWillMessage,
            ..Default::default()
        };
        assert_matches!(encode_packet(&MqttPacket::Disconnect(packet), ProtocolVersion::Mqtt311), Err(MqttifyError::EncodingFailure(_)));
    }

    #[test]
    fn disconnect_decode_failure_bad_fixed_header() {
        let packet = create_disconnect_with_all_fields();
        do_fixed_header_flag_decode_failure_test(&MqttPacket::Disconnect(packet), ProtocolVersion::Mqtt5, 1);
    }

    #[test]
    fn disconnect_decode_failure_bad_reason_code() {
        let packet = create_disconnect_with_all_fields();

        let corrupt_reason_code = | bytes: &[u8] | -> Vec<u8> {
            let mut clone = bytes.to_vec();
            clone[2] = 3;
            clone
        };

        do_mutated_decode_failure_test(&MqttPacket::Disconnect(packet), ProtocolVersion::Mqtt5, corrupt_reason_code);
    }

    #[test]
    fn disconnect_decode_failure_body_on_mqtt311() {
        let packet = DisconnectPacket {
            ..Default::default()
        };

        let add_reason_code = | bytes: &[u8] | -> Vec<u8> {
            let mut clone = bytes.to_vec();
            clone[1] = 1;
            clone.push(0);
            clone
        };

        do_mutated_decode_failure_test(&MqttPacket::Disconnect(packet), ProtocolVersion::Mqtt311, add_reason_code);
    }

    #[test]
    fn disconnect_decode_failure_duplicate_session_expiry() {
        let packet = create_disconnect_with_all_fields();

        let duplicate_session_expiry = | bytes: &[u8] | -> Vec<u8> {
            let mut clone = bytes.to_vec();

            clone[1] += 5;
            clone[3] += 5;
            clone.splice(4..4, [PROPERTY_KEY_SESSION_EXPIRY_INTERVAL, 0, 0, 0, 9]);

            clone
        };

        do_mutated_decode_failure_test(&MqttPacket::Disconnect(packet), ProtocolVersion::Mqtt5, duplicate_session_expiry);
    }

    #[test]
    fn disconnect_decode_failure_packet_size() {
        let packet = create_disconnect_with_all_fields();
        do_inbound_size_decode_failure_test(&MqttPacket::Disconnect(packet), ProtocolVersion::Mqtt5);
    }
}
