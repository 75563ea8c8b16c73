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

define_ack_packet_encode_function!(write_puback_packet, PubackPacket, PacketType::Puback, PUBACK_FIRST_BYTE, PubackReasonCode::Success);
define_ack_packet_decode_function!(decode_puback_packet, Puback, PubackPacket, PacketType::Puback, PUBACK_FIRST_BYTE, convert_u8_to_puback_reason_code);

define_ack_packet_display_trait!(PubackPacket, "PubackPacket");

#[cfg(test)]
mod tests {

    use super::*;
    use crate::decode::testing::*;
    use crate::error::MqttifyError;
    use assert_matches::assert_matches;

    #[test]
    fn puback_round_trip_encode_decode_default() {
        let packet = PubackPacket {
            ..Default::default()
        };

        assert!(do_round_trip_encode_decode_test(&MqttPacket::Puback(packet.clone()), ProtocolVersion::Mqtt5));
        assert!(do_round_trip_encode_decode_test(&MqttPacket::Puback(packet), ProtocolVersion::Mqtt311));
    }

    #[test]
    fn puback_round_trip_encode_decode_success_no_props() {
        let packet = PubackPacket {
            packet_id: 123,
            reason_code: PubackReasonCode::Success,
            ..Default::default()
        };

        assert!(do_round_trip_encode_decode_test(&MqttPacket::Puback(packet.clone()), ProtocolVersion::Mqtt5));
        assert!(do_round_trip_encode_decode_test(&MqttPacket::Puback(packet), ProtocolVersion::Mqtt311));
    }

    #[test]
    fn puback_round_trip_encode_decode_failure_no_props() {
        let packet = PubackPacket {
            packet_id: 16384,
            reason_code: PubackReasonCode::NotAuthorized,
            ..Default::default()
        };

        assert!(do_round_trip_encode_decode_test(&MqttPacket::Puback(packet), ProtocolVersion::Mqtt5));
    }

    fn create_puback_with_all_properties() -> PubackPacket {
         PubackPacket {
            packet_id: 1025,
            reason_code: PubackReasonCode::ImplementationSpecificError,
            reason_string: Some("That publish was not welcome here.".to_string()),
            user_properties: Some(vec!(
                UserProperty::new("puback1", "value1"),
                UserProperty::new("puback2", "value2"),
                UserProperty::new("puback2", "value3"),
            ))
        }
    }

    #[test]
    fn puback_round_trip_encode_decode_failure_with_props() {
        let packet = create_puback_with_all_properties();
        assert!(do_round_trip_encode_decode_test(&MqttPacket::Puback(packet), ProtocolVersion::Mqtt5));
    }

    #[test]
    fn puback_encode_failure_mqtt5_fields_on_mqtt311() {
        let packet = create_puback_with_all_properties();
        assert_matches!(encode_packet(&MqttPacket::Puback(packet), ProtocolVersion::Mqtt311), Err(MqttifyError::EncodingFailure(_)));

        let packet = PubackPacket {
            packet_id: 3,
            reason_code: PubackReasonCode::QuotaExceeded,
            ..Default::default()
        };
        assert_matches!(encode_packet(&MqttPacket::Puback(packet), ProtocolVersion::Mqtt311), Err(MqttifyError::EncodingFailure(_)));
    }

    #[test]
    fn puback_decode_failure_bad_fixed_header() {
        let packet = create_puback_with_all_properties();
        do_fixed_header_flag_decode_failure_test(&MqttPacket::Puback(packet), ProtocolVersion::Mqtt5, 7);
    }

    #[test]
    fn puback_decode_failure_bad_reason_code() {
        let packet = create_puback_with_all_properties();

        let corrupt_reason_code = | bytes: &[u8] | -> Vec<u8> {
            let mut clone = bytes.to_vec();

            // for acks, the reason code is in byte 4
            clone[4] = 241;

            clone
        };

        do_mutated_decode_failure_test(&MqttPacket::Puback(packet), ProtocolVersion::Mqtt5, corrupt_reason_code);
    }

    #[test]
    fn puback_decode_failure_duplicate_reason_string() {
        let packet = create_puback_with_all_properties();

        let duplicate_reason_string = | bytes: &[u8] | -> Vec<u8> {
            let mut clone = bytes.to_vec();

            // increase total remaining length
            clone[1] += 5;

            // increase property section length
            clone[5] += 5;

            // add the duplicate property
            clone.push(PROPERTY_KEY_REASON_STRING);
            clone.push(0);
            clone.push(2);
            clone.push(68);
            clone.push(68);

            clone
        };

        do_mutated_decode_failure_test(&MqttPacket::Puback(packet), ProtocolVersion::Mqtt5, duplicate_reason_string);
    }

    #[test]
    fn puback_decode_failure_unknown_property() {
        let packet = create_puback_with_all_properties();

        let add_unknown_property = | bytes: &[u8] | -> Vec<u8> {
            let mut clone = bytes.to_vec();

            clone[1] += 2;
            clone[5] += 2;

            // 0x30 is not a defined property identifier
            clone.push(0x30);
            clone.push(1);

            clone
        };

        do_mutated_decode_failure_test(&MqttPacket::Puback(packet), ProtocolVersion::Mqtt5, add_unknown_property);
    }

    #[test]
    fn puback_decode_failure_trailing_bytes_mqtt311() {
        let packet = PubackPacket {
            packet_id: 9,
            ..Default::default()
        };

        let add_trailing_byte = | bytes: &[u8] | -> Vec<u8> {
            let mut clone = bytes.to_vec();
            clone[1] += 1;
            clone.push(0);
            clone
        };

        do_mutated_decode_failure_test(&MqttPacket::Puback(packet), ProtocolVersion::Mqtt311, add_trailing_byte);
    }

    #[test]
    fn puback_decode_failure_packet_size() {
        let packet = create_puback_with_all_properties();
        do_inbound_size_decode_failure_test(&MqttPacket::Puback(packet), ProtocolVersion::Mqtt5);
    }
}
