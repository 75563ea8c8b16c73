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

define_ack_packet_encode_function!(write_pubrec_packet, PubrecPacket, PacketType::Pubrec, PUBREC_FIRST_BYTE, PubrecReasonCode::Success);
define_ack_packet_decode_function!(decode_pubrec_packet, Pubrec, PubrecPacket, PacketType::Pubrec, PUBREC_FIRST_BYTE, convert_u8_to_pubrec_reason_code);

define_ack_packet_display_trait!(PubrecPacket, "PubrecPacket");
