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

pub(crate) fn write_auth_packet(packet: &AuthPacket, context: &EncodingContext, dest: &mut Vec<u8>) -> MqttifyResult<()> {
    if context.protocol_version == ProtocolVersion::Mqtt311 {
        return Err(MqttifyError::new_encoding_failure("AUTH packets do not exist in MQTT 3.1.1"));
    }

    let mut properties = Vec::new();
    encode_optional_string_property(PROPERTY_KEY_AUTHENTICATION_METHOD, &packet.authentication_method, &mut properties)?;
    encode_optional_bytes_property(PROPERTY_KEY_AUTHENTICATION_DATA, &packet.authentication_data, &mut properties)?;
    encode_optional_string_property(PROPERTY_KEY_REASON_STRING, &packet.reason_string, &mut properties)?;
    encode_user_properties(&packet.user_properties, &mut properties)?;

    let mut body = Vec::new();
    if packet.reason_code != AuthenticateReasonCode::Success || !properties.is_empty() {
        encode_u8(packet.reason_code as u8, &mut body);
        encode_properties_block(&properties, &mut body)?;
    }

    encode_fixed_header_and_body(AUTH_FIRST_BYTE, &body, dest)
}

fn decode_auth_properties(property_bytes: &[u8], packet: &mut AuthPacket) -> MqttifyResult<()> {
    let mut mutable_property_bytes = property_bytes;

    while !mutable_property_bytes.is_empty() {
        let property_key = mutable_property_bytes[0];
        mutable_property_bytes = &mutable_property_bytes[1..];

        match property_key {
            PROPERTY_KEY_AUTHENTICATION_METHOD => { mutable_property_bytes = decode_optional_length_prefixed_string(mutable_property_bytes, &mut packet.authentication_method)?; }
            PROPERTY_KEY_AUTHENTICATION_DATA => { mutable_property_bytes = decode_optional_length_prefixed_bytes(mutable_property_bytes, &mut packet.authentication_data)?; }
            PROPERTY_KEY_REASON_STRING => { mutable_property_bytes = decode_optional_length_prefixed_string(mutable_property_bytes, &mut packet.reason_string)?; }
            PROPERTY_KEY_USER_PROPERTY => { mutable_property_bytes = decode_user_property(mutable_property_bytes, &mut packet.user_properties)?; }
            _ => { return Err(unknown_property_error(PacketType::Auth, property_key)); }
        }
    }

    Ok(())
}

pub(crate) fn decode_auth_packet(first_byte: u8, packet_body: &[u8], protocol_version: ProtocolVersion) -> MqttifyResult<MqttPacket> {
    if protocol_version == ProtocolVersion::Mqtt311 {
        error!("AuthPacket Decode - AUTH received on an MQTT 3.1.1 connection");
        return Err(MqttifyError::new_malformed_packet("AUTH packets do not exist in MQTT 3.1.1"));
    }

    validate_fixed_header_flags(PacketType::Auth, first_byte, AUTH_FIRST_BYTE)?;

    let mut packet = AuthPacket::default();
    let mut mutable_body = packet_body;

    if !mutable_body.is_empty() {
        mutable_body = decode_u8_as_enum(mutable_body, &mut packet.reason_code, convert_u8_to_authenticate_reason_code)?;

        let (property_bytes, remaining_body) = decode_properties_block(mutable_body)?;
        decode_auth_properties(property_bytes, &mut packet)?;
        mutable_body = remaining_body;
    }

    validate_fully_consumed(PacketType::Auth, mutable_body)?;

    Ok(MqttPacket::Auth(packet))
}

impl fmt::Display for AuthPacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "AuthPacket {{")?;
        log_enum!(self.reason_code, f, "reason_code");
        log_optional_string!(self.authentication_method, f, "authentication_method");
        log_optional_binary_data_sensitive!(self.authentication_data, f, "authentication_data");
        log_optional_string!(self.reason_string, f, "reason_string");
        log_user_properties!(self.user_properties, f, "user_properties");
        write!(f, " }}")
    }
}
