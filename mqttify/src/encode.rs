/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Packet encoding.

Every packet is encoded in two passes: the variable header and payload are written into a body
buffer, then the fixed header (first byte plus remaining length) is written ahead of it.
 */

use crate::alias::OutboundAliasResolution;
use crate::error::{MqttifyError, MqttifyResult};
use crate::mqtt::*;
use crate::mqtt::utils::*;

use crate::mqtt::auth::*;
use crate::mqtt::connack::*;
use crate::mqtt::connect::*;
use crate::mqtt::disconnect::*;
use crate::mqtt::pingreq::*;
use crate::mqtt::pingresp::*;
use crate::mqtt::puback::*;
use crate::mqtt::pubcomp::*;
use crate::mqtt::publish::*;
use crate::mqtt::pubrec::*;
use crate::mqtt::pubrel::*;
use crate::mqtt::suback::*;
use crate::mqtt::subscribe::*;
use crate::mqtt::unsuback::*;
use crate::mqtt::unsubscribe::*;

use log::*;

/// Per-packet encoding parameters that are not part of the packet itself
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct EncodingContext {
    pub(crate) protocol_version: ProtocolVersion,

    pub(crate) outbound_alias_resolution: OutboundAliasResolution,
}

/// Encodes a packet for a connection using the given protocol version.
///
/// Fails with `EncodingFailure` if the packet sets fields that do not exist in the target
/// protocol version or if a field exceeds its wire-format limits.
pub fn encode_packet(packet: &MqttPacket, protocol_version: ProtocolVersion) -> MqttifyResult<Vec<u8>> {
    let context = EncodingContext {
        protocol_version,
        ..Default::default()
    };

    let mut encoded = Vec::new();
    encode_packet_with_context(packet, &context, &mut encoded)?;

    Ok(encoded)
}

pub(crate) fn encode_packet_with_context(packet: &MqttPacket, context: &EncodingContext, dest: &mut Vec<u8>) -> MqttifyResult<()> {
    let result = match packet {
        MqttPacket::Connect(connect) => { write_connect_packet(connect, context, dest) }
        MqttPacket::Connack(connack) => { write_connack_packet(connack, context, dest) }
        MqttPacket::Publish(publish) => { write_publish_packet(publish, context, dest) }
        MqttPacket::Puback(puback) => { write_puback_packet(puback, context, dest) }
        MqttPacket::Pubrec(pubrec) => { write_pubrec_packet(pubrec, context, dest) }
        MqttPacket::Pubrel(pubrel) => { write_pubrel_packet(pubrel, context, dest) }
        MqttPacket::Pubcomp(pubcomp) => { write_pubcomp_packet(pubcomp, context, dest) }
        MqttPacket::Subscribe(subscribe) => { write_subscribe_packet(subscribe, context, dest) }
        MqttPacket::Suback(suback) => { write_suback_packet(suback, context, dest) }
        MqttPacket::Unsubscribe(unsubscribe) => { write_unsubscribe_packet(unsubscribe, context, dest) }
        MqttPacket::Unsuback(unsuback) => { write_unsuback_packet(unsuback, context, dest) }
        MqttPacket::Pingreq(pingreq) => { write_pingreq_packet(pingreq, context, dest) }
        MqttPacket::Pingresp(pingresp) => { write_pingresp_packet(pingresp, context, dest) }
        MqttPacket::Disconnect(disconnect) => { write_disconnect_packet(disconnect, context, dest) }
        MqttPacket::Auth(auth) => { write_auth_packet(auth, context, dest) }
    };

    if let Err(error) = &result {
        error!("{} Encode - {}", packet.packet_type(), error);
    }

    result
}

pub(crate) fn compute_variable_length_integer_encode_size(value: usize) -> MqttifyResult<usize> {
    if value < 1usize << 7 {
        Ok(1)
    } else if value < 1usize << 14 {
        Ok(2)
    } else if value < 1usize << 21 {
        Ok(3)
    } else if value < 1usize << 28 {
        Ok(4)
    } else {
        Err(MqttifyError::new_encoding_failure("vli value exceeds the protocol maximum (2 ^ 28 - 1)"))
    }
}

pub(crate) fn encode_vli(value: usize, dest: &mut Vec<u8>) -> MqttifyResult<()> {
    if value > MAXIMUM_VARIABLE_LENGTH_INTEGER {
        return Err(MqttifyError::new_encoding_failure("vli value exceeds the protocol maximum (2 ^ 28 - 1)"));
    }

    let mut remaining = value;
    loop {
        let mut encoded_byte = (remaining & 0x7F) as u8;
        remaining >>= 7;
        if remaining > 0 {
            encoded_byte |= 0x80;
        }

        dest.push(encoded_byte);

        if remaining == 0 {
            return Ok(());
        }
    }
}

pub(crate) fn encode_u8(value: u8, dest: &mut Vec<u8>) {
    dest.push(value);
}

pub(crate) fn encode_u16(value: u16, dest: &mut Vec<u8>) {
    dest.extend_from_slice(&value.to_be_bytes());
}

pub(crate) fn encode_u32(value: u32, dest: &mut Vec<u8>) {
    dest.extend_from_slice(&value.to_be_bytes());
}

pub(crate) fn encode_length_prefixed_string(value: &str, dest: &mut Vec<u8>) -> MqttifyResult<()> {
    if value.contains('\0') {
        return Err(MqttifyError::new_encoding_failure("utf-8 string value contains a null character"));
    }

    encode_length_prefixed_bytes(value.as_bytes(), dest)
}

pub(crate) fn encode_length_prefixed_bytes(value: &[u8], dest: &mut Vec<u8>) -> MqttifyResult<()> {
    if value.len() > MAXIMUM_STRING_LENGTH {
        return Err(MqttifyError::new_encoding_failure("length-prefixed value longer than 65535 bytes"));
    }

    encode_u16(value.len() as u16, dest);
    dest.extend_from_slice(value);

    Ok(())
}

pub(crate) fn encode_optional_u8_property(key: u8, value: Option<u8>, dest: &mut Vec<u8>) {
    if let Some(val) = value {
        encode_u8(key, dest);
        encode_u8(val, dest);
    }
}

pub(crate) fn encode_optional_bool_property(key: u8, value: Option<bool>, dest: &mut Vec<u8>) {
    encode_optional_u8_property(key, value.map(|val| val as u8), dest);
}

pub(crate) fn encode_optional_u16_property(key: u8, value: Option<u16>, dest: &mut Vec<u8>) {
    if let Some(val) = value {
        encode_u8(key, dest);
        encode_u16(val, dest);
    }
}

pub(crate) fn encode_optional_u32_property(key: u8, value: Option<u32>, dest: &mut Vec<u8>) {
    if let Some(val) = value {
        encode_u8(key, dest);
        encode_u32(val, dest);
    }
}

pub(crate) fn encode_vli_property(key: u8, value: u32, dest: &mut Vec<u8>) -> MqttifyResult<()> {
    encode_u8(key, dest);
    encode_vli(value as usize, dest)
}

pub(crate) fn encode_optional_string_property(key: u8, value: &Option<String>, dest: &mut Vec<u8>) -> MqttifyResult<()> {
    if let Some(val) = value {
        encode_u8(key, dest);
        encode_length_prefixed_string(val, dest)?;
    }

    Ok(())
}

pub(crate) fn encode_optional_bytes_property(key: u8, value: &Option<Vec<u8>>, dest: &mut Vec<u8>) -> MqttifyResult<()> {
    if let Some(val) = value {
        encode_u8(key, dest);
        encode_length_prefixed_bytes(val, dest)?;
    }

    Ok(())
}

pub(crate) fn encode_user_properties(user_properties: &Option<Vec<UserProperty>>, dest: &mut Vec<u8>) -> MqttifyResult<()> {
    if let Some(properties) = user_properties {
        for property in properties {
            encode_u8(PROPERTY_KEY_USER_PROPERTY, dest);
            encode_length_prefixed_string(&property.name, dest)?;
            encode_length_prefixed_string(&property.value, dest)?;
        }
    }

    Ok(())
}

/// Writes a properties block (vli length followed by the already-encoded properties)
pub(crate) fn encode_properties_block(properties: &[u8], dest: &mut Vec<u8>) -> MqttifyResult<()> {
    encode_vli(properties.len(), dest)?;
    dest.extend_from_slice(properties);

    Ok(())
}

/// Writes the fixed header for an encoded body, then the body
pub(crate) fn encode_fixed_header_and_body(first_byte: u8, body: &[u8], dest: &mut Vec<u8>) -> MqttifyResult<()> {
    let header_size = 1 + compute_variable_length_integer_encode_size(body.len())?;
    dest.reserve(header_size + body.len());

    encode_u8(first_byte, dest);
    encode_vli(body.len(), dest)?;
    dest.extend_from_slice(body);

    Ok(())
}

/// Fails the encode if an MQTT5-only field is set on a packet bound for an MQTT 3.1.1 connection
pub(crate) fn ensure_absent_for_mqtt311(context: &EncodingContext, packet_type: PacketType, field_name: &str, present: bool) -> MqttifyResult<()> {
    if present && context.protocol_version == ProtocolVersion::Mqtt311 {
        return Err(MqttifyError::new_encoding_failure(format!("{} field '{}' is not supported by MQTT 3.1.1", packet_type, field_name)));
    }

    Ok(())
}

macro_rules! define_ack_packet_encode_function {
    ($function_name: ident, $packet_type: ident, $packet_type_enum: expr, $first_byte: expr, $success_reason_code: expr) => {
        pub(crate) fn $function_name(packet: &$packet_type, context: &EncodingContext, dest: &mut Vec<u8>) -> MqttifyResult<()> {
            let mut body = Vec::with_capacity(16);
            encode_u16(packet.packet_id, &mut body);

            if context.protocol_version == ProtocolVersion::Mqtt311 {
                ensure_absent_for_mqtt311(context, $packet_type_enum, "reason_code", packet.reason_code != $success_reason_code)?;
                ensure_absent_for_mqtt311(context, $packet_type_enum, "reason_string", packet.reason_string.is_some())?;
                ensure_absent_for_mqtt311(context, $packet_type_enum, "user_properties", packet.user_properties.is_some())?;
            } else {
                let mut properties = Vec::new();
                encode_optional_string_property(PROPERTY_KEY_REASON_STRING, &packet.reason_string, &mut properties)?;
                encode_user_properties(&packet.user_properties, &mut properties)?;

                // success with no properties uses the two byte short form
                if packet.reason_code != $success_reason_code || !properties.is_empty() {
                    encode_u8(packet.reason_code as u8, &mut body);
                    encode_properties_block(&properties, &mut body)?;
                }
            }

            encode_fixed_header_and_body($first_byte, &body, dest)
        }
    };
}

pub(crate) use define_ack_packet_encode_function;
