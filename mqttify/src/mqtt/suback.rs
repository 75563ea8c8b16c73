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

fn is_mqtt311_suback_reason_code(reason_code: SubackReasonCode) -> bool {
    matches!(reason_code, SubackReasonCode::GrantedQos0 | SubackReasonCode::GrantedQos1 | SubackReasonCode::GrantedQos2 | SubackReasonCode::UnspecifiedError)
}

pub(crate) fn write_suback_packet(packet: &SubackPacket, context: &EncodingContext, dest: &mut Vec<u8>) -> MqttifyResult<()> {
    if packet.reason_codes.is_empty() {
        return Err(MqttifyError::new_encoding_failure("suback packet must contain at least one reason code"));
    }

    let mut body = Vec::with_capacity(16);
    encode_u16(packet.packet_id, &mut body);

    if context.protocol_version == ProtocolVersion::Mqtt311 {
        ensure_absent_for_mqtt311(context, PacketType::Suback, "reason_string", packet.reason_string.is_some())?;
        ensure_absent_for_mqtt311(context, PacketType::Suback, "user_properties", packet.user_properties.is_some())?;

        if let Some(reason_code) = packet.reason_codes.iter().find(|reason_code| !is_mqtt311_suback_reason_code(**reason_code)) {
            return Err(MqttifyError::new_encoding_failure(format!("suback reason code {:?} has no MQTT 3.1.1 return code", reason_code)));
        }
    } else {
        let mut properties = Vec::new();
        encode_optional_string_property(PROPERTY_KEY_REASON_STRING, &packet.reason_string, &mut properties)?;
        encode_user_properties(&packet.user_properties, &mut properties)?;

        encode_properties_block(&properties, &mut body)?;
    }

    for reason_code in &packet.reason_codes {
        encode_u8(*reason_code as u8, &mut body);
    }

    encode_fixed_header_and_body(SUBACK_FIRST_BYTE, &body, dest)
}

fn decode_suback_properties(property_bytes: &[u8], packet: &mut SubackPacket) -> MqttifyResult<()> {
    let mut mutable_property_bytes = property_bytes;

    while !mutable_property_bytes.is_empty() {
        let property_key = mutable_property_bytes[0];
        mutable_property_bytes = &mutable_property_bytes[1..];

        match property_key {
            PROPERTY_KEY_REASON_STRING => { mutable_property_bytes = decode_optional_length_prefixed_string(mutable_property_bytes, &mut packet.reason_string)?; }
            PROPERTY_KEY_USER_PROPERTY => { mutable_property_bytes = decode_user_property(mutable_property_bytes, &mut packet.user_properties)?; }
            _ => { return Err(unknown_property_error(PacketType::Suback, property_key)); }
        }
    }

    Ok(())
}

pub(crate) fn decode_suback_packet(first_byte: u8, packet_body: &[u8], protocol_version: ProtocolVersion) -> MqttifyResult<MqttPacket> {
    validate_fixed_header_flags(PacketType::Suback, first_byte, SUBACK_FIRST_BYTE)?;

    let mut packet = SubackPacket::default();
    let mut mutable_body = decode_u16(packet_body, &mut packet.packet_id)?;

    let converter : fn(u8) -> MqttifyResult<SubackReasonCode> =
        if protocol_version == ProtocolVersion::Mqtt5 {
            let (property_bytes, remaining_body) = decode_properties_block(mutable_body)?;
            decode_suback_properties(property_bytes, &mut packet)?;
            mutable_body = remaining_body;

            convert_u8_to_suback_reason_code
        } else {
            convert_u8_to_suback_return_code311
        };

    packet.reason_codes.reserve(mutable_body.len());
    for reason_code_byte in mutable_body {
        packet.reason_codes.push(converter(*reason_code_byte)?);
    }

    if packet.reason_codes.is_empty() {
        error!("SubackPacket Decode - no reason codes");
        return Err(MqttifyError::new_malformed_packet("suback packet contains no reason codes"));
    }

    Ok(MqttPacket::Suback(packet))
}

impl fmt::Display for SubackPacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "SubackPacket {{")?;
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
