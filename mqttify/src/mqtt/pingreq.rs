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

pub(crate) fn write_pingreq_packet(_: &PingreqPacket, _: &EncodingContext, dest: &mut Vec<u8>) -> MqttifyResult<()> {
    encode_fixed_header_and_body(PINGREQ_FIRST_BYTE, &[], dest)
}

pub(crate) fn decode_pingreq_packet(first_byte: u8, packet_body: &[u8]) -> MqttifyResult<MqttPacket> {
    validate_fixed_header_flags(PacketType::Pingreq, first_byte, PINGREQ_FIRST_BYTE)?;
    validate_fully_consumed(PacketType::Pingreq, packet_body)?;

    Ok(MqttPacket::Pingreq(PingreqPacket {}))
}

impl fmt::Display for PingreqPacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PingreqPacket {{ }}")
    }
}
