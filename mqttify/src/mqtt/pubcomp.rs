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

define_ack_packet_encode_function!(write_pubcomp_packet, PubcompPacket, PacketType::Pubcomp, PUBCOMP_FIRST_BYTE, PubcompReasonCode::Success);
define_ack_packet_decode_function!(decode_pubcomp_packet, Pubcomp, PubcompPacket, PacketType::Pubcomp, PUBCOMP_FIRST_BYTE, convert_u8_to_pubcomp_reason_code);

define_ack_packet_display_trait!(PubcompPacket, "PubcompPacket");
