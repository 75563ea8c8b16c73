/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

use crate::decode::*;
use crate::encode::*;
use crate::error::MqttifyResult;
use crate::mqtt::*;
use crate::mqtt::utils::*;

use std::fmt;

pub(crate) fn write_pingresp_packet(_: &PingrespPacket, _: &EncodingContext, dest: &mut Vec<u8>) -> MqttifyResult<()> {
    encode_fixed_header_and_body(PINGRESP_FIRST_BYTE, &[], dest)
}

pub(crate) fn decode_pingresp_packet(first_byte: u8, packet_body: &[u8]) -> MqttifyResult<MqttPacket> {
    validate_fixed_header_flags(PacketType::Pingresp, first_byte, PINGRESP_FIRST_BYTE)?;
    validate_fully_consumed(PacketType::Pingresp, packet_body)?;

    Ok(MqttPacket::Pingresp(PingrespPacket {}))
}

impl fmt::Display for PingrespPacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PingrespPacket {{ }}")
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::decode::testing::*;

    #[test]
    fn pingresp_round_trip_encode_decode() {
        let packet = PingrespPacket {};
        assert!(do_round_trip_encode_decode_test(&MqttPacket::Pingresp(packet.clone()), ProtocolVersion::Mqtt5));
        assert!(do_round_trip_encode_decode_test(&MqttPacket::Pingresp(packet), ProtocolVersion::Mqtt311));
    }

    #[test]
    fn pingresp_encoding_is_two_bytes() {
        assert_eq!(vec!(PINGRESP_FIRST_BYTE, 0), encode_packet_for_test(&MqttPacket::Pingresp(PingrespPacket {}), ProtocolVersion::Mqtt5));
    }

    #[test]
    fn pingresp_decode_failure_bad_fixed_header() {
        let packet = PingrespPacket {};
        do_fixed_header_flag_decode_failure_test(&MqttPacket::Pingresp(packet), ProtocolVersion::Mqtt5, 2);
    }

    #[test]
    fn pingresp_decode_failure_non_empty_body() {
        let packet = PingrespPacket {};

        let add_body_byte = | bytes: &[u8] | -> Vec<u8> {
            let mut clone = bytes.to_vec();
            clone[1] = 1;
            clone.push(0);
            clone
        };

        do_mutated_decode_failure_test(&MqttPacket::Pingresp(packet), ProtocolVersion::Mqtt311, add_body_byte);
    }
}
