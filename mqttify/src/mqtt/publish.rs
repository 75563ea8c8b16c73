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

fn compute_publish_fixed_header_first_byte(packet: &PublishPacket) -> u8 {
    let mut first_byte: u8 = PACKET_TYPE_PUBLISH << 4;

    if packet.duplicate {
        first_byte |= PUBLISH_PACKET_FIXED_HEADER_DUPLICATE_FLAG;
    }

    first_byte |= (packet.qos as u8) << 1;

    if packet.retain {
        first_byte |= PUBLISH_PACKET_FIXED_HEADER_RETAIN_FLAG;
    }

    first_byte
}

fn ensure_no_mqtt5_publish_properties(packet: &PublishPacket, context: &EncodingContext, packet_type: PacketType) -> MqttifyResult<()> {
    ensure_absent_for_mqtt311(context, packet_type, "payload_format", packet.payload_format.is_some())?;
    ensure_absent_for_mqtt311(context, packet_type, "message_expiry_interval_seconds", packet.message_expiry_interval_seconds.is_some())?;
    ensure_absent_for_mqtt311(context, packet_type, "topic_alias", packet.topic_alias.is_some())?;
    ensure_absent_for_mqtt311(context, packet_type, "response_topic", packet.response_topic.is_some())?;
    ensure_absent_for_mqtt311(context, packet_type, "correlation_data", packet.correlation_data.is_some())?;
    ensure_absent_for_mqtt311(context, packet_type, "subscription_identifiers", packet.subscription_identifiers.is_some())?;
    ensure_absent_for_mqtt311(context, packet_type, "content_type", packet.content_type.is_some())?;
    ensure_absent_for_mqtt311(context, packet_type, "user_properties", packet.user_properties.is_some())?;

    Ok(())
}

/// Writes the message properties shared by PUBLISH packets and CONNECT will messages.
pub(crate) fn encode_message_properties(packet: &PublishPacket, dest: &mut Vec<u8>) -> MqttifyResult<()> {
    encode_optional_u8_property(PROPERTY_KEY_PAYLOAD_FORMAT_INDICATOR, packet.payload_format.map(|format| format as u8), dest);
    encode_optional_u32_property(PROPERTY_KEY_MESSAGE_EXPIRY_INTERVAL, packet.message_expiry_interval_seconds, dest);
    encode_optional_string_property(PROPERTY_KEY_CONTENT_TYPE, &packet.content_type, dest)?;
    encode_optional_string_property(PROPERTY_KEY_RESPONSE_TOPIC, &packet.response_topic, dest)?;
    encode_optional_bytes_property(PROPERTY_KEY_CORRELATION_DATA, &packet.correlation_data, dest)?;
    encode_user_properties(&packet.user_properties, dest)?;

    Ok(())
}

pub(crate) fn write_will_properties(will: &PublishPacket, context: &EncodingContext) -> MqttifyResult<Vec<u8>> {
    ensure_no_mqtt5_publish_properties(will, context, PacketType::Connect)?;

    let mut properties = Vec::new();
    encode_message_properties(will, &mut properties)?;

    Ok(properties)
}

pub(crate) fn write_publish_packet(packet: &PublishPacket, context: &EncodingContext, dest: &mut Vec<u8>) -> MqttifyResult<()> {
    if packet.qos == QualityOfService::AtMostOnce && packet.duplicate {
        return Err(MqttifyError::new_encoding_failure("qos 0 publish may not set the duplicate flag"));
    }

    let alias_resolution = &context.outbound_alias_resolution;

    let mut body = Vec::with_capacity(packet.topic.len() + packet.payload.len() + 16);
    if alias_resolution.skip_topic {
        encode_length_prefixed_string("", &mut body)?;
    } else {
        encode_length_prefixed_string(&packet.topic, &mut body)?;
    }

    if packet.qos != QualityOfService::AtMostOnce {
        encode_u16(packet.packet_id, &mut body);
    }

    if context.protocol_version == ProtocolVersion::Mqtt311 {
        ensure_no_mqtt5_publish_properties(packet, context, PacketType::Publish)?;
        ensure_absent_for_mqtt311(context, PacketType::Publish, "topic_alias", alias_resolution.alias.is_some())?;
    } else {
        let mut properties = Vec::new();
        encode_message_properties(packet, &mut properties)?;
        encode_optional_u16_property(PROPERTY_KEY_TOPIC_ALIAS, alias_resolution.alias.or(packet.topic_alias), &mut properties);
        if let Some(subscription_identifiers) = &packet.subscription_identifiers {
            for subscription_identifier in subscription_identifiers {
                encode_vli_property(PROPERTY_KEY_SUBSCRIPTION_IDENTIFIER, *subscription_identifier, &mut properties)?;
            }
        }

        encode_properties_block(&properties, &mut body)?;
    }

    body.extend_from_slice(&packet.payload);

    encode_fixed_header_and_body(compute_publish_fixed_header_first_byte(packet), &body, dest)
}

/// Decodes one of the message properties shared by PUBLISH packets and CONNECT will messages.
/// Yields `None` for property keys that are not message properties.
pub(crate) fn decode_message_property<'a>(property_key: u8, property_bytes: &'a[u8], packet: &mut PublishPacket) -> MqttifyResult<Option<&'a[u8]>> {
    let remaining = match property_key {
        PROPERTY_KEY_PAYLOAD_FORMAT_INDICATOR => { decode_optional_u8_as_enum(property_bytes, &mut packet.payload_format, convert_u8_to_payload_format_indicator)? }
        PROPERTY_KEY_MESSAGE_EXPIRY_INTERVAL => { decode_optional_u32(property_bytes, &mut packet.message_expiry_interval_seconds)? }
        PROPERTY_KEY_CONTENT_TYPE => { decode_optional_length_prefixed_string(property_bytes, &mut packet.content_type)? }
        PROPERTY_KEY_RESPONSE_TOPIC => { decode_optional_length_prefixed_string(property_bytes, &mut packet.response_topic)? }
        PROPERTY_KEY_CORRELATION_DATA => { decode_optional_length_prefixed_bytes(property_bytes, &mut packet.correlation_data)? }
        PROPERTY_KEY_USER_PROPERTY => { decode_user_property(property_bytes, &mut packet.user_properties)? }
        _ => { return Ok(None); }
    };

    Ok(Some(remaining))
}

fn decode_publish_properties(property_bytes: &[u8], packet: &mut PublishPacket) -> MqttifyResult<()> {
    let mut mutable_property_bytes = property_bytes;

    while !mutable_property_bytes.is_empty() {
        let property_key = mutable_property_bytes[0];
        mutable_property_bytes = &mutable_property_bytes[1..];

        if let Some(remaining) = decode_message_property(property_key, mutable_property_bytes, packet)? {
            mutable_property_bytes = remaining;
            continue;
        }

        match property_key {
            PROPERTY_KEY_TOPIC_ALIAS => { mutable_property_bytes = decode_optional_u16(mutable_property_bytes, &mut packet.topic_alias)?; }
            PROPERTY_KEY_SUBSCRIPTION_IDENTIFIER => {
                let mut subscription_identifier : usize = 0;
                mutable_property_bytes = decode_vli_into_mutable(mutable_property_bytes, &mut subscription_identifier)?;
                if subscription_identifier == 0 {
                    error!("PublishPacket Decode - subscription identifier of zero");
                    return Err(MqttifyError::new_malformed_packet("publish subscription identifier may not be zero"));
                }

                packet.subscription_identifiers.get_or_insert_with(Vec::new).push(subscription_identifier as u32);
            }
            _ => { return Err(unknown_property_error(PacketType::Publish, property_key)); }
        }
    }

    Ok(())
}

pub(crate) fn decode_publish_packet(first_byte: u8, packet_body: &[u8], protocol_version: ProtocolVersion) -> MqttifyResult<MqttPacket> {
    let mut packet = PublishPacket {
        duplicate: (first_byte & PUBLISH_PACKET_FIXED_HEADER_DUPLICATE_FLAG) != 0,
        retain: (first_byte & PUBLISH_PACKET_FIXED_HEADER_RETAIN_FLAG) != 0,
        qos: convert_u8_to_quality_of_service((first_byte >> 1) & QOS_MASK)?,
        ..Default::default()
    };

    if packet.qos == QualityOfService::AtMostOnce && packet.duplicate {
        error!("PublishPacket Decode - qos 0 publish with the duplicate flag set");
        return Err(MqttifyError::new_malformed_packet("qos 0 publish has the duplicate flag set"));
    }

    let mut mutable_body = decode_length_prefixed_string(packet_body, &mut packet.topic)?;
    if packet.topic.contains(['+', '#']) {
        error!("PublishPacket Decode - topic contains wildcard characters");
        return Err(MqttifyError::new_malformed_packet("publish topic contains wildcard characters"));
    }

    if packet.qos != QualityOfService::AtMostOnce {
        mutable_body = decode_u16(mutable_body, &mut packet.packet_id)?;
        if packet.packet_id == 0 {
            error!("PublishPacket Decode - qos 1+ publish with a zero packet id");
            return Err(MqttifyError::new_malformed_packet("qos 1+ publish has a zero packet id"));
        }
    }

    if protocol_version == ProtocolVersion::Mqtt5 {
        let (property_bytes, payload_bytes) = decode_properties_block(mutable_body)?;
        decode_publish_properties(property_bytes, &mut packet)?;
        mutable_body = payload_bytes;
    }

    // an empty topic is only legal when an alias stands in for it
    if packet.topic.is_empty() && packet.topic_alias.is_none() {
        error!("PublishPacket Decode - empty topic without a topic alias");
        return Err(MqttifyError::new_malformed_packet("publish has an empty topic and no topic alias"));
    }

    packet.payload = mutable_body.to_vec();

    Ok(MqttPacket::Publish(packet))
}

impl fmt::Display for PublishPacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PublishPacket {{")?;
        log_primitive_value!(self.packet_id, f, "packet_id");
        log_string!(self.topic, f, "topic");
        log_enum!(self.qos, f, "qos");
        log_primitive_value!(self.duplicate, f, "duplicate");
        log_primitive_value!(self.retain, f, "retain");
        log_binary_data!(self.payload, f, "payload");
        log_optional_enum!(self.payload_format, f, "payload_format");
        log_optional_primitive_value!(self.message_expiry_interval_seconds, f, "message_expiry_interval_seconds");
        log_optional_primitive_value!(self.topic_alias, f, "topic_alias");
        log_optional_string!(self.response_topic, f, "response_topic");
        log_optional_binary_data!(self.correlation_data, f, "correlation_data");

        if let Some(ids) = &self.subscription_identifiers {
            write!(f, " subscription_identifiers:[")?;
            for id in ids {
                write!(f, " {}", id)?;
            }
            write!(f, " ]")?;
        }

        log_optional_string!(self.content_type, f, "content_type");
        log_user_properties!(self.user_properties, f, "user_properties");
        write!(f, " }}")
    }
}
