/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

use crate::decode::*;
use crate::encode::*;
use crate::error::{MqttifyError, MqttifyResult};
use crate::logging::*;
use crate::mqtt::*;
use crate::mqtt::publish::*;
use crate::mqtt::utils::*;

use log::*;
use std::fmt;

const CONNECT_PACKET_RESERVED_FLAG_MASK : u8 = 1;

fn compute_connect_flags(packet: &ConnectPacket) -> u8 {
    let mut flags: u8 = 0;
    if packet.clean_start {
        flags |= CONNECT_PACKET_CLEAN_START_FLAG_MASK;
    }

    if let Some(will) = &packet.will {
        flags |= CONNECT_PACKET_HAS_WILL_FLAG_MASK;
        flags |= (will.qos as u8) << CONNECT_PACKET_WILL_QOS_FLAG_SHIFT;
        if will.retain {
            flags |= CONNECT_PACKET_WILL_RETAIN_FLAG_MASK;
        }
    }

    if packet.password.is_some() {
        flags |= CONNECT_PACKET_HAS_PASSWORD_FLAG_MASK;
    }

    if packet.username.is_some() {
        flags |= CONNECT_PACKET_HAS_USERNAME_FLAG_MASK;
    }

    flags
}

fn ensure_connect_packet_fits_mqtt311(packet: &ConnectPacket, context: &EncodingContext) -> MqttifyResult<()> {
    ensure_absent_for_mqtt311(context, PacketType::Connect, "session_expiry_interval_seconds", packet.session_expiry_interval_seconds.is_some())?;
    ensure_absent_for_mqtt311(context, PacketType::Connect, "request_response_information", packet.request_response_information.is_some())?;
    ensure_absent_for_mqtt311(context, PacketType::Connect, "request_problem_information", packet.request_problem_information.is_some())?;
    ensure_absent_for_mqtt311(context, PacketType::Connect, "receive_maximum", packet.receive_maximum.is_some())?;
    ensure_absent_for_mqtt311(context, PacketType::Connect, "topic_alias_maximum", packet.topic_alias_maximum.is_some())?;
    ensure_absent_for_mqtt311(context, PacketType::Connect, "maximum_packet_size_bytes", packet.maximum_packet_size_bytes.is_some())?;
    ensure_absent_for_mqtt311(context, PacketType::Connect, "authentication_method", packet.authentication_method.is_some())?;
    ensure_absent_for_mqtt311(context, PacketType::Connect, "authentication_data", packet.authentication_data.is_some())?;
    ensure_absent_for_mqtt311(context, PacketType::Connect, "will_delay_interval_seconds", packet.will_delay_interval_seconds.is_some())?;
    ensure_absent_for_mqtt311(context, PacketType::Connect, "user_properties", packet.user_properties.is_some())?;

    if packet.password.is_some() && packet.username.is_none() {
        return Err(MqttifyError::new_encoding_failure("MQTT 3.1.1 connect may not carry a password without a username"));
    }

    Ok(())
}

fn write_connect_properties(packet: &ConnectPacket, dest: &mut Vec<u8>) -> MqttifyResult<()> {
    let mut properties = Vec::new();

    encode_optional_u32_property(PROPERTY_KEY_SESSION_EXPIRY_INTERVAL, packet.session_expiry_interval_seconds, &mut properties);
    encode_optional_u16_property(PROPERTY_KEY_RECEIVE_MAXIMUM, packet.receive_maximum, &mut properties);
    encode_optional_u32_property(PROPERTY_KEY_MAXIMUM_PACKET_SIZE, packet.maximum_packet_size_bytes, &mut properties);
    encode_optional_u16_property(PROPERTY_KEY_TOPIC_ALIAS_MAXIMUM, packet.topic_alias_maximum, &mut properties);
    encode_optional_bool_property(PROPERTY_KEY_REQUEST_RESPONSE_INFORMATION, packet.request_response_information, &mut properties);
    encode_optional_bool_property(PROPERTY_KEY_REQUEST_PROBLEM_INFORMATION, packet.request_problem_information, &mut properties);
    encode_optional_string_property(PROPERTY_KEY_AUTHENTICATION_METHOD, &packet.authentication_method, &mut properties)?;
    encode_optional_bytes_property(PROPERTY_KEY_AUTHENTICATION_DATA, &packet.authentication_data, &mut properties)?;
    encode_user_properties(&packet.user_properties, &mut properties)?;

    encode_properties_block(&properties, dest)
}

pub(crate) fn write_connect_packet(packet: &ConnectPacket, context: &EncodingContext, dest: &mut Vec<u8>) -> MqttifyResult<()> {
    if context.protocol_version == ProtocolVersion::Mqtt311 {
        ensure_connect_packet_fits_mqtt311(packet, context)?;
    } else if packet.authentication_data.is_some() && packet.authentication_method.is_none() {
        return Err(MqttifyError::new_encoding_failure("connect authentication data requires an authentication method"));
    }

    let mut body = Vec::with_capacity(64);
    encode_length_prefixed_string(CONNECT_PROTOCOL_NAME, &mut body)?;
    encode_u8(context.protocol_version.protocol_level(), &mut body);
    encode_u8(compute_connect_flags(packet), &mut body);
    encode_u16(packet.keep_alive_interval_seconds, &mut body);

    if context.protocol_version == ProtocolVersion::Mqtt5 {
        write_connect_properties(packet, &mut body)?;
    }

    encode_length_prefixed_string(&packet.client_id, &mut body)?;

    if let Some(will) = &packet.will {
        if will.topic_alias.is_some() || will.subscription_identifiers.is_some() {
            return Err(MqttifyError::new_encoding_failure("will messages may not carry a topic alias or subscription identifiers"));
        }

        let will_properties = write_will_properties(will, context)?;
        if context.protocol_version == ProtocolVersion::Mqtt5 {
            let mut properties = Vec::new();
            encode_optional_u32_property(PROPERTY_KEY_WILL_DELAY_INTERVAL, packet.will_delay_interval_seconds, &mut properties);
            properties.extend_from_slice(&will_properties);
            encode_properties_block(&properties, &mut body)?;
        }

        encode_length_prefixed_string(&will.topic, &mut body)?;
        encode_length_prefixed_bytes(&will.payload, &mut body)?;
    } else if packet.will_delay_interval_seconds.is_some() {
        return Err(MqttifyError::new_encoding_failure("connect will delay interval set without a will"));
    }

    if let Some(username) = &packet.username {
        encode_length_prefixed_string(username, &mut body)?;
    }

    if let Some(password) = &packet.password {
        encode_length_prefixed_bytes(password, &mut body)?;
    }

    encode_fixed_header_and_body(CONNECT_FIRST_BYTE, &body, dest)
}

fn decode_connect_properties(property_bytes: &[u8], packet: &mut ConnectPacket) -> MqttifyResult<()> {
    let mut mutable_property_bytes = property_bytes;

    while !mutable_property_bytes.is_empty() {
        let property_key = mutable_property_bytes[0];
        mutable_property_bytes = &mutable_property_bytes[1..];

        match property_key {
            PROPERTY_KEY_SESSION_EXPIRY_INTERVAL => { mutable_property_bytes = decode_optional_u32(mutable_property_bytes, &mut packet.session_expiry_interval_seconds)?; }
            PROPERTY_KEY_RECEIVE_MAXIMUM => { mutable_property_bytes = decode_optional_u16(mutable_property_bytes, &mut packet.receive_maximum)?; }
            PROPERTY_KEY_MAXIMUM_PACKET_SIZE => { mutable_property_bytes = decode_optional_u32(mutable_property_bytes, &mut packet.maximum_packet_size_bytes)?; }
            PROPERTY_KEY_TOPIC_ALIAS_MAXIMUM => { mutable_property_bytes = decode_optional_u16(mutable_property_bytes, &mut packet.topic_alias_maximum)?; }
            PROPERTY_KEY_REQUEST_RESPONSE_INFORMATION => { mutable_property_bytes = decode_optional_u8_as_bool(mutable_property_bytes, &mut packet.request_response_information)?; }
            PROPERTY_KEY_REQUEST_PROBLEM_INFORMATION => { mutable_property_bytes = decode_optional_u8_as_bool(mutable_property_bytes, &mut packet.request_problem_information)?; }
            PROPERTY_KEY_AUTHENTICATION_METHOD => { mutable_property_bytes = decode_optional_length_prefixed_string(mutable_property_bytes, &mut packet.authentication_method)?; }
            PROPERTY_KEY_AUTHENTICATION_DATA => { mutable_property_bytes = decode_optional_length_prefixed_bytes(mutable_property_bytes, &mut packet.authentication_data)?; }
            PROPERTY_KEY_USER_PROPERTY => { mutable_property_bytes = decode_user_property(mutable_property_bytes, &mut packet.user_properties)?; }
            _ => { return Err(unknown_property_error(PacketType::Connect, property_key)); }
        }
    }

    Ok(())
}

fn decode_will_properties(property_bytes: &[u8], will: &mut PublishPacket, connect: &mut ConnectPacket) -> MqttifyResult<()> {
    let mut mutable_property_bytes = property_bytes;

    while !mutable_property_bytes.is_empty() {
        let property_key = mutable_property_bytes[0];
        mutable_property_bytes = &mutable_property_bytes[1..];

        if let Some(remaining) = decode_message_property(property_key, mutable_property_bytes, will)? {
            mutable_property_bytes = remaining;
            continue;
        }

        match property_key {
            PROPERTY_KEY_WILL_DELAY_INTERVAL => { mutable_property_bytes = decode_optional_u32(mutable_property_bytes, &mut connect.will_delay_interval_seconds)?; }
            _ => { return Err(unknown_property_error(PacketType::Connect, property_key)); }
        }
    }

    Ok(())
}

/// CONNECT carries its own protocol level, so decoding does not depend on the connection's version
pub(crate) fn decode_connect_packet(first_byte: u8, packet_body: &[u8]) -> MqttifyResult<MqttPacket> {
    validate_fixed_header_flags(PacketType::Connect, first_byte, CONNECT_FIRST_BYTE)?;

    let mut packet = ConnectPacket::default();

    let mut protocol_name = String::new();
    let mut mutable_body = decode_length_prefixed_string(packet_body, &mut protocol_name)?;
    if protocol_name != CONNECT_PROTOCOL_NAME {
        error!("ConnectPacket Decode - invalid protocol name \"{}\"", protocol_name);
        return Err(MqttifyError::new_malformed_packet("connect packet has an invalid protocol name"));
    }

    let mut protocol_level : u8 = 0;
    mutable_body = decode_u8(mutable_body, &mut protocol_level)?;
    let protocol_version = ProtocolVersion::from_protocol_level(protocol_level)?;

    let mut connect_flags : u8 = 0;
    mutable_body = decode_u8(mutable_body, &mut connect_flags)?;
    if (connect_flags & CONNECT_PACKET_RESERVED_FLAG_MASK) != 0 {
        error!("ConnectPacket Decode - reserved connect flag set");
        return Err(MqttifyError::new_malformed_packet("connect packet has the reserved flag set"));
    }

    packet.clean_start = (connect_flags & CONNECT_PACKET_CLEAN_START_FLAG_MASK) != 0;
    let has_will = (connect_flags & CONNECT_PACKET_HAS_WILL_FLAG_MASK) != 0;
    let will_qos = convert_u8_to_quality_of_service((connect_flags >> CONNECT_PACKET_WILL_QOS_FLAG_SHIFT) & QOS_MASK)?;
    let will_retain = (connect_flags & CONNECT_PACKET_WILL_RETAIN_FLAG_MASK) != 0;
    let has_username = (connect_flags & CONNECT_PACKET_HAS_USERNAME_FLAG_MASK) != 0;
    let has_password = (connect_flags & CONNECT_PACKET_HAS_PASSWORD_FLAG_MASK) != 0;

    if !has_will && (will_qos != QualityOfService::AtMostOnce || will_retain) {
        error!("ConnectPacket Decode - will flags set without a will");
        return Err(MqttifyError::new_malformed_packet("connect packet sets will qos or retain without a will"));
    }

    if protocol_version == ProtocolVersion::Mqtt311 && has_password && !has_username {
        error!("ConnectPacket Decode - password without username");
        return Err(MqttifyError::new_malformed_packet("MQTT 3.1.1 connect packet has a password but no username"));
    }

    mutable_body = decode_u16(mutable_body, &mut packet.keep_alive_interval_seconds)?;

    if protocol_version == ProtocolVersion::Mqtt5 {
        let (property_bytes, remaining_body) = decode_properties_block(mutable_body)?;
        decode_connect_properties(property_bytes, &mut packet)?;
        mutable_body = remaining_body;
    }

    mutable_body = decode_length_prefixed_string(mutable_body, &mut packet.client_id)?;

    if has_will {
        let mut will = PublishPacket {
            qos: will_qos,
            retain: will_retain,
            ..Default::default()
        };

        if protocol_version == ProtocolVersion::Mqtt5 {
            let (property_bytes, remaining_body) = decode_properties_block(mutable_body)?;
            decode_will_properties(property_bytes, &mut will, &mut packet)?;
            mutable_body = remaining_body;
        }

        mutable_body = decode_length_prefixed_string(mutable_body, &mut will.topic)?;
        if will.topic.contains(['+', '#']) {
            error!("ConnectPacket Decode - will topic contains wildcard characters");
            return Err(MqttifyError::new_malformed_packet("connect will topic contains wildcard characters"));
        }

        mutable_body = decode_length_prefixed_bytes(mutable_body, &mut will.payload)?;
        packet.will = Some(will);
    }

    if has_username {
        mutable_body = decode_optional_length_prefixed_string(mutable_body, &mut packet.username)?;
    }

    if has_password {
        mutable_body = decode_optional_length_prefixed_bytes(mutable_body, &mut packet.password)?;
    }

    validate_fully_consumed(PacketType::Connect, mutable_body)?;

    Ok(MqttPacket::Connect(packet))
}

impl fmt::Display for ConnectPacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ConnectPacket {{")?;
        log_primitive_value!(self.keep_alive_interval_seconds, f, "keep_alive_interval_seconds");
        log_primitive_value!(self.clean_start, f, "clean_start");
        log_string!(self.client_id, f, "client_id");
        log_optional_string_sensitive!(self.username, f, "username");
        log_optional_binary_data_sensitive!(self.password, f, "password");
        log_optional_primitive_value!(self.session_expiry_interval_seconds, f, "session_expiry_interval_seconds");
        log_optional_primitive_value!(self.request_response_information, f, "request_response_information");
        log_optional_primitive_value!(self.request_problem_information, f, "request_problem_information");
        log_optional_primitive_value!(self.receive_maximum, f, "receive_maximum");
        log_optional_primitive_value!(self.topic_alias_maximum, f, "topic_alias_maximum");
        log_optional_primitive_value!(self.maximum_packet_size_bytes, f, "maximum_packet_size_bytes");
        log_optional_string!(self.authentication_method, f, "authentication_method");
        log_optional_binary_data_sensitive!(self.authentication_data, f, "authentication_data");
        log_optional_primitive_value!(self.will_delay_interval_seconds, f, "will_delay_interval_seconds");

        if let Some(will) = &self.will {
            write!(f, " will:{}", will)?;
        }

        log_user_properties!(self.user_properties, f, "user_properties");
        write!(f, " }}")
    }
}
