/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Acknowledgement tracking for every outbound operation that needs a packet id (QoS 1 and 2
publishes, subscribes, unsubscribes), plus the set of inbound QoS 2 packet ids that have been
received but not yet released.

The tracker never touches the network.  The protocol state asks it which packets to write and
feeds it every acknowledgement it receives.
 */

use crate::config::PacketRetryOptions;
use crate::error::{MqttifyError, MqttifyResult};
use crate::mqtt::*;

use log::*;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use std::time::Instant;

/// Final broker response to a QoS 2 publish.  A failing Pubrec ends the exchange early.
#[derive(Debug, Eq, PartialEq)]
pub enum Qos2Response {
    Pubrec(PubrecPacket),
    Pubcomp(PubcompPacket),
}

impl fmt::Display for Qos2Response {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Qos2Response::Pubrec(pubrec) => {
                write!(f, "Pubrec ( {} )", pubrec)
            }
            Qos2Response::Pubcomp(pubcomp) => {
                write!(f, "Pubcomp ( {} )", pubcomp)
            }
        }
    }
}

/// Successful completion of a publish, by QoS level
#[derive(Debug, Eq, PartialEq)]
pub enum PublishResponse {
    Qos0,
    Qos1(PubackPacket),
    Qos2(Qos2Response),
}

impl fmt::Display for PublishResponse {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PublishResponse::Qos0 => {
                write!(f, "PublishResponse Qos0")
            }
            PublishResponse::Qos1(puback) => {
                write!(f, "PublishResponse Qos1 ( {} )", puback)
            }
            PublishResponse::Qos2(qos2response) => {
                write!(f, "PublishResponse Qos2 ( {} )", qos2response)
            }
        }
    }
}

/// Where an outbound QoS 1 or 2 publish currently is in its acknowledgement handshake
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum PublishStep {
    AwaitingPuback,
    AwaitingPubrec,
    AwaitingPubcomp,
}

pub(crate) enum ExchangeRequest {
    Publish(PublishPacket, PublishStep),
    Subscribe(SubscribePacket),
    Unsubscribe(UnsubscribePacket),
}

/// One outbound operation waiting on an acknowledgement.
pub(crate) struct InFlightExchange {
    pub(crate) operation_id: u64,
    pub(crate) packet_id: u16,

    // submission order; retransmission on resume follows it
    pub(crate) sequence: u64,

    pub(crate) request: ExchangeRequest,

    // writes of the current step; reset when the exchange moves on to PUBREL
    pub(crate) transmissions: u32,

    // set by the first write and never cleared
    pub(crate) sent: bool,
    pub(crate) last_transmission: Option<Instant>,
    pub(crate) needs_transmission: bool,
}

impl InFlightExchange {
    fn is_publish(&self) -> bool {
        matches!(self.request, ExchangeRequest::Publish(_, _))
    }

    fn was_sent(&self) -> bool {
        self.sent
    }

    fn build_packet(&self) -> MqttPacket {
        match &self.request {
            ExchangeRequest::Publish(publish, PublishStep::AwaitingPubcomp) => {
                MqttPacket::Pubrel(PubrelPacket {
                    packet_id: publish.packet_id,
                    ..Default::default()
                })
            }
            ExchangeRequest::Publish(publish, _) => {
                let mut packet = publish.clone();
                packet.duplicate = self.was_sent();
                MqttPacket::Publish(packet)
            }
            ExchangeRequest::Subscribe(subscribe) => { MqttPacket::Subscribe(subscribe.clone()) }
            ExchangeRequest::Unsubscribe(unsubscribe) => { MqttPacket::Unsubscribe(unsubscribe.clone()) }
        }
    }
}

impl fmt::Debug for InFlightExchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let request = match &self.request {
            ExchangeRequest::Publish(_, step) => { format!("Publish({:?})", step) }
            ExchangeRequest::Subscribe(_) => { "Subscribe".to_string() }
            ExchangeRequest::Unsubscribe(_) => { "Unsubscribe".to_string() }
        };

        write!(f, "InFlightExchange {{ operation_id: {}, packet_id: {}, sequence: {}, request: {}, transmissions: {}, sent: {}, needs_transmission: {} }}",
            self.operation_id, self.packet_id, self.sequence, request, self.transmissions, self.sent, self.needs_transmission)
    }
}

/// What the protocol state should do in reaction to an acknowledgement
#[derive(Debug)]
pub(crate) enum AckOutcome {
    PublishComplete {
        operation_id: u64,
        response: PublishResponse,
    },

    /// A successful Pubrec moved the exchange on; the Pubrel is queued for transmission
    PubrelQueued,

    SubscribeComplete {
        operation_id: u64,
        subscribe: SubscribePacket,
        suback: SubackPacket,
    },

    UnsubscribeComplete {
        operation_id: u64,
        unsubscribe: UnsubscribePacket,
        unsuback: UnsubackPacket,
    },

    /// Pubrec for a packet id with no matching QoS 2 exchange
    UnknownPubrec(u16),

    /// Any other acknowledgement that matches nothing
    Ignored,
}

/// Reaction to an inbound QoS 1 or 2 publish
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) struct InboundPublishAction {

    /// Whether the publish should reach the application
    pub(crate) deliver: bool,
}

// Hands out the lowest free packet id.  Every id below `watermark` is in use except those in
// `released`; every id at or above it is free.
struct PacketIdAllocator {
    watermark: u32,
    released: BTreeSet<u16>,
}

impl PacketIdAllocator {
    fn new() -> Self {
        PacketIdAllocator {
            watermark: 1,
            released: BTreeSet::new(),
        }
    }

    fn allocate(&mut self) -> MqttifyResult<u16> {
        if let Some(packet_id) = self.released.pop_first() {
            return Ok(packet_id);
        }

        if self.watermark > u16::MAX as u32 {
            warn!("QosTracker - packet id space exhausted");
            return Err(MqttifyError::new_identifier_space_exhausted());
        }

        let packet_id = self.watermark as u16;
        self.watermark += 1;

        Ok(packet_id)
    }

    fn release(&mut self, packet_id: u16) {
        if packet_id as u32 + 1 != self.watermark {
            self.released.insert(packet_id);
            return;
        }

        self.watermark -= 1;
        while let Some(highest) = self.released.last().copied() {
            if highest as u32 + 1 != self.watermark {
                break;
            }

            self.released.pop_last();
            self.watermark -= 1;
        }
    }
}

pub(crate) struct QosTracker {
    exchanges: HashMap<u16, InFlightExchange>,

    // sequence -> packet id
    submission_order: BTreeMap<u64, u16>,

    packet_ids: PacketIdAllocator,

    next_sequence: u64,

    maximum_in_flight: usize,

    // inbound qos2 publishes received but not yet released by a Pubrel
    unreleased_inbound_qos2: HashSet<u16>,
}

impl QosTracker {

    pub(crate) fn new(maximum_in_flight: usize) -> Self {
        QosTracker {
            exchanges: HashMap::new(),
            submission_order: BTreeMap::new(),
            packet_ids: PacketIdAllocator::new(),
            next_sequence: 1,
            maximum_in_flight,
            unreleased_inbound_qos2: HashSet::new(),
        }
    }

    pub(crate) fn in_flight_count(&self) -> usize {
        self.exchanges.len()
    }

    pub(crate) fn exchange(&self, packet_id: u16) -> Option<&InFlightExchange> {
        self.exchanges.get(&packet_id)
    }

    pub(crate) fn has_pending_transmissions(&self) -> bool {
        self.exchanges.values().any(|exchange| exchange.needs_transmission)
    }

    /// True if `take_transmissions` with the same receive maximum would write anything.
    pub(crate) fn has_transmittable(&self, receive_maximum: u16) -> bool {
        let mut unacknowledged_publishes = 0;
        let mut has_new_publish = false;

        for exchange in self.exchanges.values() {
            if exchange.is_publish() && exchange.was_sent() {
                unacknowledged_publishes += 1;
            }

            if exchange.needs_transmission {
                if exchange.is_publish() && !exchange.was_sent() {
                    has_new_publish = true;
                } else {
                    return true;
                }
            }
        }

        has_new_publish && unacknowledged_publishes < receive_maximum as usize
    }

    fn begin_exchange(&mut self, operation_id: u64, build: impl FnOnce(u16) -> ExchangeRequest) -> MqttifyResult<u16> {
        if self.exchanges.len() >= self.maximum_in_flight {
            warn!("QosTracker - in-flight limit of {} reached", self.maximum_in_flight);
            return Err(MqttifyError::new_in_flight_limit_exceeded(self.maximum_in_flight));
        }

        let packet_id = self.packet_ids.allocate()?;
        let sequence = self.next_sequence;
        self.next_sequence += 1;

        debug!("QosTracker - operation {} bound to packet id {}", operation_id, packet_id);

        self.exchanges.insert(packet_id, InFlightExchange {
            operation_id,
            packet_id,
            sequence,
            request: build(packet_id),
            transmissions: 0,
            sent: false,
            last_transmission: None,
            needs_transmission: true,
        });
        self.submission_order.insert(sequence, packet_id);

        Ok(packet_id)
    }

    /// Opens an exchange for a QoS 1 or 2 publish and binds its packet id.
    pub(crate) fn begin_publish(&mut self, operation_id: u64, mut publish: PublishPacket) -> MqttifyResult<u16> {
        let step = match publish.qos {
            QualityOfService::AtMostOnce => {
                return Err(MqttifyError::new_internal_state_error("qos 0 publishes are not tracked"));
            }
            QualityOfService::AtLeastOnce => { PublishStep::AwaitingPuback }
            QualityOfService::ExactlyOnce => { PublishStep::AwaitingPubrec }
        };

        self.begin_exchange(operation_id, move |packet_id| {
            publish.packet_id = packet_id;
            ExchangeRequest::Publish(publish, step)
        })
    }

    pub(crate) fn begin_subscribe(&mut self, operation_id: u64, mut subscribe: SubscribePacket) -> MqttifyResult<u16> {
        self.begin_exchange(operation_id, move |packet_id| {
            subscribe.packet_id = packet_id;
            ExchangeRequest::Subscribe(subscribe)
        })
    }

    pub(crate) fn begin_unsubscribe(&mut self, operation_id: u64, mut unsubscribe: UnsubscribePacket) -> MqttifyResult<u16> {
        self.begin_exchange(operation_id, move |packet_id| {
            unsubscribe.packet_id = packet_id;
            ExchangeRequest::Unsubscribe(unsubscribe)
        })
    }

    fn release(&mut self, packet_id: u16) -> Option<InFlightExchange> {
        let exchange = self.exchanges.remove(&packet_id)?;
        self.submission_order.remove(&exchange.sequence);
        self.packet_ids.release(packet_id);

        Some(exchange)
    }

    /// Advances the exchange an acknowledgement refers to.  Terminal acknowledgements release the
    /// packet id and the retained request.
    pub(crate) fn on_ack(&mut self, packet: MqttPacket) -> AckOutcome {
        match packet {
            MqttPacket::Puback(puback) => {
                let packet_id = puback.packet_id;
                if !matches!(self.exchanges.get(&packet_id), Some(InFlightExchange { request: ExchangeRequest::Publish(_, PublishStep::AwaitingPuback), .. })) {
                    warn!("QosTracker - puback for packet id {} matches no qos 1 exchange", packet_id);
                    return AckOutcome::Ignored;
                }

                match self.release(packet_id) {
                    Some(exchange) => {
                        AckOutcome::PublishComplete {
                            operation_id: exchange.operation_id,
                            response: PublishResponse::Qos1(puback),
                        }
                    }
                    None => { AckOutcome::Ignored }
                }
            }
            MqttPacket::Pubrec(pubrec) => {
                let packet_id = pubrec.packet_id;
                let Some(exchange) = self.exchanges.get_mut(&packet_id) else {
                    return AckOutcome::UnknownPubrec(packet_id);
                };

                match &mut exchange.request {
                    ExchangeRequest::Publish(_, step @ PublishStep::AwaitingPubrec) => {
                        if pubrec.reason_code.is_success() {
                            *step = PublishStep::AwaitingPubcomp;
                            exchange.needs_transmission = true;
                            exchange.transmissions = 0;
                            return AckOutcome::PubrelQueued;
                        }
                    }
                    ExchangeRequest::Publish(_, PublishStep::AwaitingPubcomp) => {
                        // a resent pubrec; answer it with another pubrel
                        exchange.needs_transmission = true;
                        return AckOutcome::PubrelQueued;
                    }
                    _ => {
                        return AckOutcome::UnknownPubrec(packet_id);
                    }
                }

                match self.release(packet_id) {
                    Some(exchange) => {
                        AckOutcome::PublishComplete {
                            operation_id: exchange.operation_id,
                            response: PublishResponse::Qos2(Qos2Response::Pubrec(pubrec)),
                        }
                    }
                    None => { AckOutcome::Ignored }
                }
            }
            MqttPacket::Pubcomp(pubcomp) => {
                let packet_id = pubcomp.packet_id;
                if !matches!(self.exchanges.get(&packet_id), Some(InFlightExchange { request: ExchangeRequest::Publish(_, PublishStep::AwaitingPubcomp), .. })) {
                    warn!("QosTracker - pubcomp for packet id {} matches no released qos 2 exchange", packet_id);
                    return AckOutcome::Ignored;
                }

                match self.release(packet_id) {
                    Some(exchange) => {
                        AckOutcome::PublishComplete {
                            operation_id: exchange.operation_id,
                            response: PublishResponse::Qos2(Qos2Response::Pubcomp(pubcomp)),
                        }
                    }
                    None => { AckOutcome::Ignored }
                }
            }
            MqttPacket::Suback(suback) => {
                let packet_id = suback.packet_id;
                if !matches!(self.exchanges.get(&packet_id), Some(InFlightExchange { request: ExchangeRequest::Subscribe(_), .. })) {
                    warn!("QosTracker - suback for packet id {} matches no subscribe", packet_id);
                    return AckOutcome::Ignored;
                }

                match self.release(packet_id) {
                    Some(InFlightExchange { operation_id, request: ExchangeRequest::Subscribe(subscribe), .. }) => {
                        AckOutcome::SubscribeComplete { operation_id, subscribe, suback }
                    }
                    _ => { AckOutcome::Ignored }
                }
            }
            MqttPacket::Unsuback(unsuback) => {
                let packet_id = unsuback.packet_id;
                if !matches!(self.exchanges.get(&packet_id), Some(InFlightExchange { request: ExchangeRequest::Unsubscribe(_), .. })) {
                    warn!("QosTracker - unsuback for packet id {} matches no unsubscribe", packet_id);
                    return AckOutcome::Ignored;
                }

                match self.release(packet_id) {
                    Some(InFlightExchange { operation_id, request: ExchangeRequest::Unsubscribe(unsubscribe), .. }) => {
                        AckOutcome::UnsubscribeComplete { operation_id, unsubscribe, unsuback }
                    }
                    _ => { AckOutcome::Ignored }
                }
            }
            _ => { AckOutcome::Ignored }
        }
    }

    /// Records an inbound QoS 1 or 2 publish.  A QoS 2 publish whose packet id is still
    /// unreleased is a redelivery and must not reach the application again.
    pub(crate) fn on_inbound_publish(&mut self, packet_id: u16, qos: QualityOfService) -> InboundPublishAction {
        match qos {
            QualityOfService::ExactlyOnce => {
                let first_delivery = self.unreleased_inbound_qos2.insert(packet_id);
                if !first_delivery {
                    debug!("QosTracker - duplicate qos 2 publish with packet id {}", packet_id);
                }

                InboundPublishAction { deliver: first_delivery }
            }
            _ => { InboundPublishAction { deliver: true } }
        }
    }

    /// Releases an inbound QoS 2 packet id.  Returns false if the id was not being held.
    pub(crate) fn on_inbound_pubrel(&mut self, packet_id: u16) -> bool {
        self.unreleased_inbound_qos2.remove(&packet_id)
    }

    /// Moves every exchange that needs a write into `dest`, in submission order.
    ///
    /// At most `receive_maximum` publishes are unacknowledged at any time; a publish that would
    /// exceed it holds back every later first-time publish so their order is kept.
    pub(crate) fn take_transmissions(&mut self, now: Instant, receive_maximum: u16, dest: &mut VecDeque<MqttPacket>) {
        let mut unacknowledged_publishes = self.exchanges.values()
            .filter(|exchange| exchange.is_publish() && exchange.was_sent())
            .count();
        let mut publishes_blocked = false;

        for packet_id in self.submission_order.values() {
            let Some(exchange) = self.exchanges.get_mut(packet_id) else {
                continue;
            };

            if !exchange.needs_transmission {
                continue;
            }

            if exchange.is_publish() && !exchange.was_sent() {
                if publishes_blocked || unacknowledged_publishes >= receive_maximum as usize {
                    publishes_blocked = true;
                    continue;
                }

                unacknowledged_publishes += 1;
            }

            dest.push_back(exchange.build_packet());
            exchange.needs_transmission = false;
            exchange.transmissions += 1;
            exchange.sent = true;
            exchange.last_transmission = Some(now);
        }
    }

    /// The connection carrying the current exchanges is gone; anything that was written will
    /// have to be written again if the session survives.
    pub(crate) fn on_connection_interrupted(&mut self) {
        for exchange in self.exchanges.values_mut() {
            if exchange.was_sent() {
                exchange.needs_transmission = true;
            }
        }
    }

    /// The broker discarded the session.  Exchanges that were ever written are removed and
    /// returned; exchanges that never left the client stay queued for the new session.
    pub(crate) fn on_session_reset(&mut self) -> Vec<InFlightExchange> {
        self.unreleased_inbound_qos2.clear();

        let sent : Vec<u16> = self.submission_order.values()
            .copied()
            .filter(|packet_id| self.exchanges.get(packet_id).map(|exchange| exchange.was_sent()).unwrap_or(false))
            .collect();

        sent.into_iter().filter_map(|packet_id| self.release(packet_id)).collect()
    }

    /// Marks exchanges whose last write is older than the retry interval for another write.
    /// Exchanges that already used every attempt are removed and returned.
    pub(crate) fn apply_retry_policy(&mut self, now: Instant, retry: &PacketRetryOptions) -> Vec<InFlightExchange> {
        let mut exhausted = Vec::new();

        for exchange in self.exchanges.values_mut() {
            if exchange.needs_transmission {
                continue;
            }

            let Some(last_transmission) = exchange.last_transmission else {
                continue;
            };

            if now < last_transmission + retry.retry_interval {
                continue;
            }

            if exchange.transmissions >= retry.max_attempts {
                exhausted.push(exchange.packet_id);
            } else {
                debug!("QosTracker - retrying packet id {} (attempt {})", exchange.packet_id, exchange.transmissions + 1);
                exchange.needs_transmission = true;
            }
        }

        exhausted.sort_by_key(|packet_id| self.exchanges.get(packet_id).map(|exchange| exchange.sequence));
        exhausted.into_iter().filter_map(|packet_id| self.release(packet_id)).collect()
    }

    pub(crate) fn next_retry_timepoint(&self, retry: &PacketRetryOptions) -> Option<Instant> {
        self.exchanges.values()
            .filter(|exchange| !exchange.needs_transmission)
            .filter_map(|exchange| exchange.last_transmission)
            .map(|timepoint| timepoint + retry.retry_interval)
            .min()
    }

    /// Removes everything, in submission order.
    pub(crate) fn drain(&mut self) -> Vec<InFlightExchange> {
        self.unreleased_inbound_qos2.clear();

        let order : Vec<u16> = self.submission_order.values().copied().collect();
        order.into_iter().filter_map(|packet_id| self.release(packet_id)).collect()
    }
}
