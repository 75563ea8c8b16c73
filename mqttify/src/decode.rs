/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Packet decoding.

`decode_packet` is a pure function over a byte prefix: it either produces one packet and the
number of bytes it used, or reports that more bytes are needed.  `Decoder` layers connection
framing on top, accumulating transport fragments and splitting them into packets.  Any decode
failure is terminal for the connection; a decoder never tries to resynchronize.
 */

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

use std::collections::VecDeque;

const DECODE_BUFFER_DEFAULT_SIZE : usize = 16 * 1024;

/// Result of attempting to decode a single packet from the front of a byte sequence
#[derive(Debug, Eq, PartialEq)]
pub enum DecodeResult {

    /// A full packet was decoded from the first `consumed` bytes
    Complete {
        packet: MqttPacket,
        consumed: usize,
    },

    /// The bytes are a valid prefix of a packet; more are needed
    Incomplete,
}

#[derive(Debug)]
pub(crate) enum DecodeVliResult<'a> {
    InsufficientData,
    Value(u32, &'a[u8]), /* (decoded value, remaining bytes) */
}

pub(crate) fn decode_vli(buffer: &[u8]) -> MqttifyResult<DecodeVliResult> {
    let mut value: u32 = 0;
    let mut shift: u32 = 0;
    let data_len = buffer.len();

    for i in 0..4 {
        if i >= data_len {
            return Ok(DecodeVliResult::InsufficientData);
        }

        let byte = buffer[i];
        value |= ((byte & 0x7F) as u32) << shift;
        shift += 7;

        if (byte & 0x80) == 0 {
            return Ok(DecodeVliResult::Value(value, &buffer[(i + 1)..]));
        }
    }

    error!("Packet Decode - variable length integer uses more than four bytes");
    Err(MqttifyError::new_malformed_packet("variable length integer uses more than four bytes"))
}

pub(crate) fn decode_vli_into_mutable<'a>(buffer: &'a[u8], value: &mut usize) -> MqttifyResult<&'a[u8]> {
    match decode_vli(buffer)? {
        DecodeVliResult::InsufficientData => {
            error!("Packet Decode - truncated variable length integer");
            Err(MqttifyError::new_malformed_packet("truncated variable length integer"))
        }
        DecodeVliResult::Value(vli, remaining_slice) => {
            *value = vli as usize;
            Ok(remaining_slice)
        }
    }
}

/// Splits a properties block into (property bytes, bytes after the block)
pub(crate) fn decode_properties_block(bytes: &[u8]) -> MqttifyResult<(&[u8], &[u8])> {
    let mut properties_length : usize = 0;
    let mutable_bytes = decode_vli_into_mutable(bytes, &mut properties_length)?;
    if properties_length > mutable_bytes.len() {
        error!("Packet Decode - property block length exceeds remaining packet bytes");
        return Err(MqttifyError::new_malformed_packet("property block length exceeds remaining packet bytes"));
    }

    Ok(mutable_bytes.split_at(properties_length))
}

pub(crate) fn unknown_property_error(packet_type: PacketType, property_key: u8) -> MqttifyError {
    error!("{} Decode - Invalid property type ({})", packet_type, property_key);
    MqttifyError::new_malformed_packet(format!("{} contains unknown property type {}", packet_type, property_key))
}

fn split_length_prefix(bytes: &[u8]) -> MqttifyResult<(usize, &[u8])> {
    if bytes.len() < 2 {
        error!("Packet Decode - length-prefixed value does not have a full length prefix");
        return Err(MqttifyError::new_malformed_packet("length-prefixed value does not have a full length prefix"));
    }

    let value_length = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
    let mutable_bytes = &bytes[2..];
    if value_length > mutable_bytes.len() {
        error!("Packet Decode - length-prefixed value is longer than the remaining packet bytes");
        return Err(MqttifyError::new_malformed_packet("length-prefixed value is longer than the remaining packet bytes"));
    }

    Ok((value_length, mutable_bytes))
}

fn decode_utf8_string(bytes: &[u8]) -> MqttifyResult<String> {
    let value = std::str::from_utf8(bytes)?;
    if value.contains('\0') {
        error!("Packet Decode - utf-8 string contains a null character");
        return Err(MqttifyError::new_malformed_packet("utf-8 string contains a null character"));
    }

    Ok(value.to_string())
}

pub(crate) fn decode_length_prefixed_string<'a>(bytes: &'a[u8], value: &mut String) -> MqttifyResult<&'a[u8]> {
    let (value_length, mutable_bytes) = split_length_prefix(bytes)?;

    *value = decode_utf8_string(&mutable_bytes[..value_length])?;
    Ok(&mutable_bytes[value_length..])
}

pub(crate) fn decode_optional_length_prefixed_string<'a>(bytes: &'a[u8], value: &mut Option<String>) -> MqttifyResult<&'a[u8]> {
    if value.is_some() {
        error!("Packet Decode - Invalid duplicate optional string property");
        return Err(MqttifyError::new_malformed_packet("optional string property already set earlier"));
    }

    let mut decoded = String::new();
    let mutable_bytes = decode_length_prefixed_string(bytes, &mut decoded)?;
    *value = Some(decoded);

    Ok(mutable_bytes)
}

pub(crate) fn decode_length_prefixed_bytes<'a>(bytes: &'a[u8], value: &mut Vec<u8>) -> MqttifyResult<&'a[u8]> {
    let (value_length, mutable_bytes) = split_length_prefix(bytes)?;

    *value = mutable_bytes[..value_length].to_vec();
    Ok(&mutable_bytes[value_length..])
}

pub(crate) fn decode_optional_length_prefixed_bytes<'a>(bytes: &'a[u8], value: &mut Option<Vec<u8>>) -> MqttifyResult<&'a[u8]> {
    if value.is_some() {
        error!("Packet Decode - Invalid duplicate optional binary data property");
        return Err(MqttifyError::new_malformed_packet("optional binary property already set earlier"));
    }

    let mut decoded = Vec::new();
    let mutable_bytes = decode_length_prefixed_bytes(bytes, &mut decoded)?;
    *value = Some(decoded);

    Ok(mutable_bytes)
}

pub(crate) fn decode_user_property<'a>(bytes: &'a[u8], properties: &mut Option<Vec<UserProperty>>) -> MqttifyResult<&'a[u8]> {
    let mut property = UserProperty::default();

    let mut mutable_bytes = bytes;
    mutable_bytes = decode_length_prefixed_string(mutable_bytes, &mut property.name)?;
    mutable_bytes = decode_length_prefixed_string(mutable_bytes, &mut property.value)?;

    properties.get_or_insert_with(Vec::new).push(property);

    Ok(mutable_bytes)
}

pub(crate) fn decode_u8<'a>(bytes: &'a[u8], value: &mut u8) -> MqttifyResult<&'a[u8]> {
    if bytes.is_empty() {
        error!("Packet Decode - Insufficent packet bytes for u8 field");
        return Err(MqttifyError::new_malformed_packet("insufficient packet data for u8 field"));
    }

    *value = bytes[0];

    Ok(&bytes[1..])
}

pub(crate) fn decode_optional_u8_as_bool<'a>(bytes: &'a[u8], value: &mut Option<bool>) -> MqttifyResult<&'a[u8]> {
    if value.is_some() {
        error!("Packet Decode - Invalid duplicate optional boolean property");
        return Err(MqttifyError::new_malformed_packet("optional boolean property already set earlier"));
    }

    let mut raw_value : u8 = 0;
    let mutable_bytes = decode_u8(bytes, &mut raw_value)?;
    match raw_value {
        0 => { *value = Some(false); }
        1 => { *value = Some(true); }
        _ => {
            error!("Packet Decode - Invalid byte value for boolean property");
            return Err(MqttifyError::new_malformed_packet("invalid value for boolean property"));
        }
    }

    Ok(mutable_bytes)
}

pub(crate) fn decode_u8_as_enum<'a, T>(bytes: &'a[u8], value: &mut T, converter: fn(u8) -> MqttifyResult<T>) -> MqttifyResult<&'a[u8]> {
    let mut raw_value : u8 = 0;
    let mutable_bytes = decode_u8(bytes, &mut raw_value)?;
    *value = converter(raw_value)?;

    Ok(mutable_bytes)
}

pub(crate) fn decode_optional_u8_as_enum<'a, T>(bytes: &'a[u8], value: &mut Option<T>, converter: fn(u8) -> MqttifyResult<T>) -> MqttifyResult<&'a[u8]> {
    if value.is_some() {
        error!("Packet Decode - Invalid duplicate optional enum property");
        return Err(MqttifyError::new_malformed_packet("optional enum property already set earlier"));
    }

    let mut raw_value : u8 = 0;
    let mutable_bytes = decode_u8(bytes, &mut raw_value)?;
    *value = Some(converter(raw_value)?);

    Ok(mutable_bytes)
}

pub(crate) fn decode_u16<'a>(bytes: &'a[u8], value: &mut u16) -> MqttifyResult<&'a[u8]> {
    if bytes.len() < 2 {
        error!("Packet Decode - Insufficent packet bytes for u16 field");
        return Err(MqttifyError::new_malformed_packet("insufficient packet data for u16 field"));
    }

    *value = u16::from_be_bytes([bytes[0], bytes[1]]);

    Ok(&bytes[2..])
}

pub(crate) fn decode_optional_u16<'a>(bytes: &'a[u8], value: &mut Option<u16>) -> MqttifyResult<&'a[u8]> {
    if value.is_some() {
        error!("Packet Decode - Invalid duplicate optional u16 property");
        return Err(MqttifyError::new_malformed_packet("optional u16 property already set earlier"));
    }

    let mut raw_value : u16 = 0;
    let mutable_bytes = decode_u16(bytes, &mut raw_value)?;
    *value = Some(raw_value);

    Ok(mutable_bytes)
}

pub(crate) fn decode_optional_u32<'a>(bytes: &'a[u8], value: &mut Option<u32>) -> MqttifyResult<&'a[u8]> {
    if bytes.len() < 4 {
        error!("Packet Decode - Insufficent packet bytes for u32 property");
        return Err(MqttifyError::new_malformed_packet("insufficient packet data for u32 property"));
    }

    if value.is_some() {
        error!("Packet Decode - Invalid duplicate optional u32 property");
        return Err(MqttifyError::new_malformed_packet("optional u32 property already set earlier"));
    }

    *value = Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]));

    Ok(&bytes[4..])
}

/// Fails unless the fixed header's low nibble matches the flags the protocol mandates
pub(crate) fn validate_fixed_header_flags(packet_type: PacketType, first_byte: u8, expected_first_byte: u8) -> MqttifyResult<()> {
    if first_byte != expected_first_byte {
        error!("{} Decode - invalid fixed header flags", packet_type);
        return Err(MqttifyError::new_malformed_packet(format!("{} has invalid fixed header flags", packet_type)));
    }

    Ok(())
}

/// Fails if a packet body has bytes left over after all of its fields were decoded
pub(crate) fn validate_fully_consumed(packet_type: PacketType, remaining: &[u8]) -> MqttifyResult<()> {
    if !remaining.is_empty() {
        error!("{} Decode - packet body has {} unexpected trailing bytes", packet_type, remaining.len());
        return Err(MqttifyError::new_malformed_packet(format!("{} has unexpected trailing bytes", packet_type)));
    }

    Ok(())
}

fn decode_packet_body(first_byte: u8, body: &[u8], protocol_version: ProtocolVersion) -> MqttifyResult<MqttPacket> {
    let packet_type = first_byte >> 4;

    match packet_type {
        PACKET_TYPE_CONNECT => { decode_connect_packet(first_byte, body) }
        PACKET_TYPE_CONNACK => { decode_connack_packet(first_byte, body, protocol_version) }
        PACKET_TYPE_PUBLISH => { decode_publish_packet(first_byte, body, protocol_version) }
        PACKET_TYPE_PUBACK => { decode_puback_packet(first_byte, body, protocol_version) }
        PACKET_TYPE_PUBREC => { decode_pubrec_packet(first_byte, body, protocol_version) }
        PACKET_TYPE_PUBREL => { decode_pubrel_packet(first_byte, body, protocol_version) }
        PACKET_TYPE_PUBCOMP => { decode_pubcomp_packet(first_byte, body, protocol_version) }
        PACKET_TYPE_SUBSCRIBE => { decode_subscribe_packet(first_byte, body, protocol_version) }
        PACKET_TYPE_SUBACK => { decode_suback_packet(first_byte, body, protocol_version) }
        PACKET_TYPE_UNSUBSCRIBE => { decode_unsubscribe_packet(first_byte, body, protocol_version) }
        PACKET_TYPE_UNSUBACK => { decode_unsuback_packet(first_byte, body, protocol_version) }
        PACKET_TYPE_PINGREQ => { decode_pingreq_packet(first_byte, body) }
        PACKET_TYPE_PINGRESP => { decode_pingresp_packet(first_byte, body) }
        PACKET_TYPE_DISCONNECT => { decode_disconnect_packet(first_byte, body, protocol_version) }
        PACKET_TYPE_AUTH => { decode_auth_packet(first_byte, body, protocol_version) }
        _ => {
            error!("Packet Decode - invalid packet type ({})", packet_type);
            Err(MqttifyError::new_malformed_packet(format!("invalid packet type {}", packet_type)))
        }
    }
}

/// Attempts to decode one packet from the front of `bytes`.
///
/// Returns `Incomplete` for any strict prefix of a well-formed packet and `Complete` once every
/// byte of the packet is present.  `maximum_packet_size` bounds the total encoded size,
/// including the fixed header; larger packets are malformed.
pub fn decode_packet(bytes: &[u8], protocol_version: ProtocolVersion, maximum_packet_size: Option<u32>) -> MqttifyResult<DecodeResult> {
    if bytes.is_empty() {
        return Ok(DecodeResult::Incomplete);
    }

    let first_byte = bytes[0];
    let (remaining_length, body_and_beyond) =
        match decode_vli(&bytes[1..])? {
            DecodeVliResult::InsufficientData => {
                return Ok(DecodeResult::Incomplete);
            }
            DecodeVliResult::Value(remaining_length, remaining_slice) => {
                (remaining_length as usize, remaining_slice)
            }
        };

    let header_length = bytes.len() - body_and_beyond.len();
    let total_length = header_length + remaining_length;
    if let Some(maximum) = maximum_packet_size {
        if total_length > maximum as usize {
            error!("{} Decode - packet size {} exceeds maximum of {}", packet_type_to_str(first_byte >> 4), total_length, maximum);
            return Err(MqttifyError::new_malformed_packet("inbound packet size exceeds the maximum packet size"));
        }
    }

    if body_and_beyond.len() < remaining_length {
        return Ok(DecodeResult::Incomplete);
    }

    let packet = decode_packet_body(first_byte, &body_and_beyond[..remaining_length], protocol_version)?;

    Ok(DecodeResult::Complete {
        packet,
        consumed: total_length,
    })
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum DecoderState {
    ReadingPackets,
    TerminalError,
}

/// Streaming packet decoder for a single connection.
pub struct Decoder {
    state: DecoderState,

    protocol_version: ProtocolVersion,

    maximum_packet_size: Option<u32>,

    pending: Vec<u8>,
}

impl Decoder {

    /// Creates a new decoder with no packet size limit
    pub fn new(protocol_version: ProtocolVersion) -> Decoder {
        Decoder {
            state: DecoderState::ReadingPackets,
            protocol_version,
            maximum_packet_size: None,
            pending: Vec::with_capacity(DECODE_BUFFER_DEFAULT_SIZE),
        }
    }

    /// Discards all framing state so the decoder can serve a fresh connection
    pub fn reset_for_new_connection(&mut self, protocol_version: ProtocolVersion, maximum_packet_size: Option<u32>) {
        self.state = DecoderState::ReadingPackets;
        self.protocol_version = protocol_version;
        self.maximum_packet_size = maximum_packet_size;
        self.pending.clear();
    }

    /// Number of buffered bytes belonging to a packet that has not fully arrived
    pub fn pending_byte_count(&self) -> usize {
        self.pending.len()
    }

    /// Appends a transport fragment and decodes every packet it completes.
    ///
    /// On failure the decoder discards all buffered bytes and refuses further input until
    /// reset.
    pub fn decode_bytes(&mut self, bytes: &[u8], decoded_packets: &mut VecDeque<MqttPacket>) -> MqttifyResult<()> {
        if self.state == DecoderState::TerminalError {
            error!("Decoder - decode_bytes called after a previous decode failure");
            return Err(MqttifyError::new_malformed_packet("decoder is in a terminal error state"));
        }

        self.pending.extend_from_slice(bytes);

        let mut offset = 0;
        while offset < self.pending.len() {
            match decode_packet(&self.pending[offset..], self.protocol_version, self.maximum_packet_size) {
                Ok(DecodeResult::Complete { packet, consumed }) => {
                    decoded_packets.push_back(packet);
                    offset += consumed;
                }
                Ok(DecodeResult::Incomplete) => {
                    break;
                }
                Err(error) => {
                    self.state = DecoderState::TerminalError;
                    self.pending.clear();
                    return Err(error);
                }
            }
        }

        self.pending.drain(..offset);

        Ok(())
    }
}

macro_rules! define_ack_packet_decode_function {
    ($function_name: ident, $mqtt_packet_variant: ident, $packet_type: ident, $packet_type_enum: expr, $first_byte: expr, $reason_code_converter: expr) => {
        pub(crate) fn $function_name(first_byte: u8, packet_body: &[u8], protocol_version: ProtocolVersion) -> MqttifyResult<MqttPacket> {
            validate_fixed_header_flags($packet_type_enum, first_byte, $first_byte)?;

            let mut packet = $packet_type::default();
            let mut mutable_body = decode_u16(packet_body, &mut packet.packet_id)?;

            if protocol_version == ProtocolVersion::Mqtt5 && !mutable_body.is_empty() {
                mutable_body = decode_u8_as_enum(mutable_body, &mut packet.reason_code, $reason_code_converter)?;

                if !mutable_body.is_empty() {
                    let (mut property_bytes, remaining_body) = decode_properties_block(mutable_body)?;
                    mutable_body = remaining_body;

                    while !property_bytes.is_empty() {
                        let property_key = property_bytes[0];
                        property_bytes = &property_bytes[1..];

                        match property_key {
                            PROPERTY_KEY_REASON_STRING => { property_bytes = decode_optional_length_prefixed_string(property_bytes, &mut packet.reason_string)?; }
                            PROPERTY_KEY_USER_PROPERTY => { property_bytes = decode_user_property(property_bytes, &mut packet.user_properties)?; }
                            _ => { return Err(unknown_property_error($packet_type_enum, property_key)); }
                        }
                    }
                }
            }

            validate_fully_consumed($packet_type_enum, mutable_body)?;

            Ok(MqttPacket::$mqtt_packet_variant(packet))
        }
    };
}

pub(crate) use define_ack_packet_decode_function;
