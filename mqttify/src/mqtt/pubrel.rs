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

define_ack_packet_encode_function!(write_pubrel_packet, PubrelPacket, PacketType::Pubrel, PUBREL_FIRST_BYTE, PubrelReasonCode::Success);
define_ack_packet_decode_function!(decode_pubrel_packet, Pubrel, PubrelPacket, PacketType::Pubrel, PUBREL_FIRST_BYTE, convert_u8_to_pubrel_reason_code);

define_ack_packet_display_trait!(PubrelPacket, "PubrelPacket");
