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

const CONNACK_SESSION_PRESENT_FLAG : u8 = 0x01;

fn ensure_connack_packet_fits_mqtt311(packet: &ConnackPacket, context: &EncodingContext) -> MqttifyResult<()> {
    let checks = [
        ("session_expiry_interval", packet.session_expiry_interval.is_some()),
        ("receive_maximum", packet.receive_maximum.is_some()),
        ("maximum_qos", packet.maximum_qos.is_some()),
        ("retain_available", packet.retain_available.is_some()),
        ("maximum_packet_size", packet.maximum_packet_size.is_some()),
        ("assigned_client_identifier", packet.assigned_client_identifier.is_some()),
        ("topic_alias_maximum", packet.topic_alias_maximum.is_some()),
        ("reason_string", packet.reason_string.is_some()),
        ("user_properties", packet.user_properties.is_some()),
        ("wildcard_subscriptions_available", packet.wildcard_subscriptions_available.is_some()),
        ("subscription_identifiers_available", packet.subscription_identifiers_available.is_some()),
        ("shared_subscriptions_available", packet.shared_subscriptions_available.is_some()),
        ("server_keep_alive", packet.server_keep_alive.is_some()),
        ("response_information", packet.response_information.is_some()),
        ("server_reference", packet.server_reference.is_some()),
        ("authentication_method", packet.authentication_method.is_some()),
        ("authentication_data", packet.authentication_data.is_some()),
    ];

    for (field_name, present) in checks {
        ensure_absent_for_mqtt311(context, PacketType::Connack, field_name, present)?;
    }

    Ok(())
}

fn write_connack_properties(packet: &ConnackPacket, dest: &mut Vec<u8>) -> MqttifyResult<()> {
    let mut properties = Vec::new();

    encode_optional_u32_property(PROPERTY_KEY_SESSION_EXPIRY_INTERVAL, packet.session_expiry_interval, &mut properties);
    encode_optional_u16_property(PROPERTY_KEY_RECEIVE_MAXIMUM, packet.receive_maximum, &mut properties);
    encode_optional_u8_property(PROPERTY_KEY_MAXIMUM_QOS, packet.maximum_qos.map(|qos| qos as u8), &mut properties);
    encode_optional_bool_property(PROPERTY_KEY_RETAIN_AVAILABLE, packet.retain_available, &mut properties);
    encode_optional_u32_property(PROPERTY_KEY_MAXIMUM_PACKET_SIZE, packet.maximum_packet_size, &mut properties);
    encode_optional_string_property(PROPERTY_KEY_ASSIGNED_CLIENT_IDENTIFIER, &packet.assigned_client_identifier, &mut properties)?;
    encode_optional_u16_property(PROPERTY_KEY_TOPIC_ALIAS_MAXIMUM, packet.topic_alias_maximum, &mut properties);
    encode_optional_string_property(PROPERTY_KEY_REASON_STRING, &packet.reason_string, &mut properties)?;
    encode_user_properties(&packet.user_properties, &mut properties)?;
    encode_optional_bool_property(PROPERTY_KEY_WILDCARD_SUBSCRIPTIONS_AVAILABLE, packet.wildcard_subscriptions_available, &mut properties);
    encode_optional_bool_property(PROPERTY_KEY_SUBSCRIPTION_IDENTIFIERS_AVAILABLE, packet.subscription_identifiers_available, &mut properties);
    encode_optional_bool_property(PROPERTY_KEY_SHARED_SUBSCRIPTIONS_AVAILABLE, packet.shared_subscriptions_available, &mut properties);
    encode_optional_u16_property(PROPERTY_KEY_SERVER_KEEP_ALIVE, packet.server_keep_alive, &mut properties);
    encode_optional_string_property(PROPERTY_KEY_RESPONSE_INFORMATION, &packet.response_information, &mut properties)?;
    encode_optional_string_property(PROPERTY_KEY_SERVER_REFERENCE, &packet.server_reference, &mut properties)?;
    encode_optional_string_property(PROPERTY_KEY_AUTHENTICATION_METHOD, &packet.authentication_method, &mut properties)?;
    encode_optional_bytes_property(PROPERTY_KEY_AUTHENTICATION_DATA, &packet.authentication_data, &mut properties)?;

    encode_properties_block(&properties, dest)
}

pub(crate) fn write_connack_packet(packet: &ConnackPacket, context: &EncodingContext, dest: &mut Vec<u8>) -> MqttifyResult<()> {
    let mut body = Vec::with_capacity(32);
    encode_u8(if packet.session_present { CONNACK_SESSION_PRESENT_FLAG } else { 0 }, &mut body);

    if context.protocol_version == ProtocolVersion::Mqtt311 {
        ensure_connack_packet_fits_mqtt311(packet, context)?;

        let Some(return_code) = convert_connect_reason_code_to_return_code311(packet.reason_code) else {
            return Err(MqttifyError::new_encoding_failure(format!("connack reason code {:?} has no MQTT 3.1.1 return code", packet.reason_code)));
        };

        encode_u8(return_code, &mut body);
    } else {
        encode_u8(packet.reason_code as u8, &mut body);
        write_connack_properties(packet, &mut body)?;
    }

    encode_fixed_header_and_body(CONNACK_FIRST_BYTE, &body, dest)
}

fn decode_connack_properties(property_bytes: &[u8], packet: &mut ConnackPacket) -> MqttifyResult<()> {
    let mut mutable_property_bytes = property_bytes;

    while !mutable_property_bytes.is_empty() {
        let property_key = mutable_property_bytes[0];
        mutable_property_bytes = &mutable_property_bytes[1..];

        match property_key {
            PROPERTY_KEY_SESSION_EXPIRY_INTERVAL => { mutable_property_bytes = decode_optional_u32(mutable_property_bytes, &mut packet.session_expiry_interval)?; }
            PROPERTY_KEY_RECEIVE_MAXIMUM => { mutable_property_bytes = decode_optional_u16(mutable_property_bytes, &mut packet.receive_maximum)?; }
            PROPERTY_KEY_MAXIMUM_QOS => { mutable_property_bytes = decode_optional_u8_as_enum(mutable_property_bytes, &mut packet.maximum_qos, convert_u8_to_quality_of_service)?; }
            PROPERTY_KEY_RETAIN_AVAILABLE => { mutable_property_bytes = decode_optional_u8_as_bool(mutable_property_bytes, &mut packet.retain_available)?; }
            PROPERTY_KEY_MAXIMUM_PACKET_SIZE => { mutable_property_bytes = decode_optional_u32(mutable_property_bytes, &mut packet.maximum_packet_size)?; }
            PROPERTY_KEY_ASSIGNED_CLIENT_IDENTIFIER => { mutable_property_bytes = decode_optional_length_prefixed_string(mutable_property_bytes, &mut packet.assigned_client_identifier)?; }
            PROPERTY_KEY_TOPIC_ALIAS_MAXIMUM => { mutable_property_bytes = decode_optional_u16(mutable_property_bytes, &mut packet.topic_alias_maximum)?; }
            PROPERTY_KEY_REASON_STRING => { mutable_property_bytes = decode_optional_length_prefixed_string(mutable_property_bytes, &mut packet.reason_string)?; }
            PROPERTY_KEY_USER_PROPERTY => { mutable_property_bytes = decode_user_property(mutable_property_bytes, &mut packet.user_properties)?; }
            PROPERTY_KEY_WILDCARD_SUBSCRIPTIONS_AVAILABLE => { mutable_property_bytes = decode_optional_u8_as_bool(mutable_property_bytes, &mut packet.wildcard_subscriptions_available)?; }
            PROPERTY_KEY_SUBSCRIPTION_IDENTIFIERS_AVAILABLE => { mutable_property_bytes = decode_optional_u8_as_bool(mutable_property_bytes, &mut packet.subscription_identifiers_available)?; }
            PROPERTY_KEY_SHARED_SUBSCRIPTIONS_AVAILABLE => { mutable_property_bytes = decode_optional_u8_as_bool(mutable_property_bytes, &mut packet.shared_subscriptions_available)?; }
            PROPERTY_KEY_SERVER_KEEP_ALIVE => { mutable_property_bytes = decode_optional_u16(mutable_property_bytes, &mut packet.server_keep_alive)?; }
            PROPERTY_KEY_RESPONSE_INFORMATION => { mutable_property_bytes = decode_optional_length_prefixed_string(mutable_property_bytes, &mut packet.response_information)?; }
            PROPERTY_KEY_SERVER_REFERENCE => { mutable_property_bytes = decode_optional_length_prefixed_string(mutable_property_bytes, &mut packet.server_reference)?; }
            PROPERTY_KEY_AUTHENTICATION_METHOD => { mutable_property_bytes = decode_optional_length_prefixed_string(mutable_property_bytes, &mut packet.authentication_method)?; }
            PROPERTY_KEY_AUTHENTICATION_DATA => { mutable_property_bytes = decode_optional_length_prefixed_bytes(mutable_property_bytes, &mut packet.authentication_data)?; }
            _ => { return Err(unknown_property_error(PacketType::Connack, property_key)); }
        }
    }

    if packet.maximum_qos == Some(QualityOfService::ExactlyOnce) {
        error!("ConnackPacket Decode - maximum qos property may not be 2");
        return Err(MqttifyError::new_malformed_packet("connack maximum qos property may not be 2"));
    }

    if packet.receive_maximum == Some(0) {
        error!("ConnackPacket Decode - receive maximum of zero");
        return Err(MqttifyError::new_malformed_packet("connack receive maximum may not be zero"));
    }

    if packet.maximum_packet_size == Some(0) {
        error!("ConnackPacket Decode - maximum packet size of zero");
        return Err(MqttifyError::new_malformed_packet("connack maximum packet size may not be zero"));
    }

    Ok(())
}

pub(crate) fn decode_connack_packet(first_byte: u8, packet_body: &[u8], protocol_version: ProtocolVersion) -> MqttifyResult<MqttPacket> {
    validate_fixed_header_flags(PacketType::Connack, first_byte, CONNACK_FIRST_BYTE)?;

    let mut packet = ConnackPacket::default();

    let mut flags : u8 = 0;
    let mut mutable_body = decode_u8(packet_body, &mut flags)?;
    if (flags & !CONNACK_SESSION_PRESENT_FLAG) != 0 {
        error!("ConnackPacket Decode - reserved acknowledge flags set");
        return Err(MqttifyError::new_malformed_packet("connack packet has reserved acknowledge flags set"));
    }

    packet.session_present = flags == CONNACK_SESSION_PRESENT_FLAG;

    if protocol_version == ProtocolVersion::Mqtt311 {
        mutable_body = decode_u8_as_enum(mutable_body, &mut packet.reason_code, convert_u8_to_connect_return_code311)?;
    } else {
        mutable_body = decode_u8_as_enum(mutable_body, &mut packet.reason_code, convert_u8_to_connect_reason_code)?;

        let (property_bytes, remaining_body) = decode_properties_block(mutable_body)?;
        decode_connack_properties(property_bytes, &mut packet)?;
        mutable_body = remaining_body;
    }

    if packet.session_present && !packet.reason_code.is_success() {
        error!("ConnackPacket Decode - session present on a failed connack");
        return Err(MqttifyError::new_malformed_packet("failed connack may not set session present"));
    }

    validate_fully_consumed(PacketType::Connack, mutable_body)?;

    Ok(MqttPacket::Connack(packet))
}

impl fmt::Display for ConnackPacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ConnackPacket {{")?;
        log_primitive_value!(self.session_present, f, "session_present");
        log_enum!(self.reason_code, f, "reason_code");
        log_optional_primitive_value!(self.session_expiry_interval, f, "session_expiry_interval");
        log_optional_primitive_value!(self.receive_maximum, f, "receive_maximum");
        log_optional_enum!(self.maximum_qos, f, "maximum_qos");
        log_optional_primitive_value!(self.retain_available, f, "retain_available");
        log_optional_primitive_value!(self.maximum_packet_size, f, "maximum_packet_size");
        log_optional_string!(self.assigned_client_identifier, f, "assigned_client_identifier");
        log_optional_primitive_value!(self.topic_alias_maximum, f, "topic_alias_maximum");
        log_optional_string!(self.reason_string, f, "reason_string");
        log_user_properties!(self.user_properties, f, "user_properties");
        log_optional_primitive_value!(self.wildcard_subscriptions_available, f, "wildcard_subscriptions_available");
        log_optional_primitive_value!(self.subscription_identifiers_available, f, "subscription_identifiers_available");
        log_optional_primitive_value!(self.shared_subscriptions_available, f, "shared_subscriptions_available");
        log_optional_primitive_value!(self.server_keep_alive, f, "server_keep_alive");
        log_optional_string!(self.response_information, f, "response_information");
        log_optional_string!(self.server_reference, f, "server_reference");
        log_optional_string!(self.authentication_method, f, "authentication_method");
        log_optional_binary_data_sensitive!(self.authentication_data, f, "authentication_data");
        write!(f, " }}")
    }
}
