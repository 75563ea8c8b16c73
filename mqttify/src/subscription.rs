/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Client-side record of the topic filters the session is subscribed to, used to route inbound
publishes to the handlers registered alongside each subscribe.

Entries are added when a subscribe is submitted and confirmed (or dropped) by the matching Suback.
Unsubscribing removes entries immediately, before the broker acknowledges it.
 */

use crate::client::MessageReceivedEvent;
use crate::error::{MqttifyError, MqttifyResult};
use crate::mqtt::*;

use log::*;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Callback invoked for every inbound publish that matches the subscription it was registered with.
pub type MessageHandler = Arc<dyn Fn(&MessageReceivedEvent) + Send + Sync>;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum SubscriptionEntryState {

    /// Submitted by the operation with the given id; no Suback yet
    Pending(u64),

    /// Granted by the broker
    Active,
}

pub(crate) struct SubscriptionEntry {
    pub(crate) subscription: Subscription,
    pub(crate) handler: Option<MessageHandler>,
    pub(crate) state: SubscriptionEntryState,
}

impl fmt::Debug for SubscriptionEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubscriptionEntry {{ subscription: {}, handler: {}, state: {:?} }}",
               self.subscription,
               if self.handler.is_some() { "Some(...)" } else { "None" },
               self.state)
    }
}

/// Result of routing a topic through the registry
pub(crate) struct SubscriptionMatch {
    pub(crate) handlers: Vec<MessageHandler>,
}

#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    entries: HashMap<String, SubscriptionEntry>,
}

impl SubscriptionRegistry {

    pub(crate) fn new() -> Self {
        SubscriptionRegistry {
            entries: HashMap::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn get(&self, topic_filter: &str) -> Option<&SubscriptionEntry> {
        self.entries.get(topic_filter)
    }

    /// Records every filter in a submitted subscribe.  An existing entry for the same filter is
    /// replaced, qos and handler together.
    pub(crate) fn begin_subscribe(&mut self, operation_id: u64, packet: &SubscribePacket, handler: Option<MessageHandler>) {
        for subscription in &packet.subscriptions {
            debug!("SubscriptionRegistry - adding pending entry for \"{}\" from operation {}", subscription.topic_filter, operation_id);

            self.entries.insert(subscription.topic_filter.clone(), SubscriptionEntry {
                subscription: subscription.clone(),
                handler: handler.clone(),
                state: SubscriptionEntryState::Pending(operation_id),
            });
        }
    }

    /// Applies a Suback to the entries created by the subscribe it answers.  A reason code count
    /// that differs from the subscription count is a protocol violation.
    pub(crate) fn apply_suback(&mut self, operation_id: u64, subscribe: &SubscribePacket, suback: &SubackPacket) -> MqttifyResult<()> {
        if subscribe.subscriptions.len() != suback.reason_codes.len() {
            error!("SubscriptionRegistry - suback for operation {} has {} reason codes but the subscribe had {} subscriptions",
                operation_id, suback.reason_codes.len(), subscribe.subscriptions.len());
            return Err(MqttifyError::new_protocol_violation("suback reason code count does not match the subscription count"));
        }

        for (subscription, reason_code) in subscribe.subscriptions.iter().zip(suback.reason_codes.iter()) {
            let filter = &subscription.topic_filter;
            let Some(entry) = self.entries.get_mut(filter) else {
                continue;
            };

            // a later subscribe or unsubscribe to the same filter takes precedence
            if entry.state != SubscriptionEntryState::Pending(operation_id) {
                continue;
            }

            if reason_code.is_success() {
                entry.state = SubscriptionEntryState::Active;
            } else {
                info!("SubscriptionRegistry - subscription to \"{}\" rejected with {:?}", filter, reason_code);
                self.entries.remove(filter);
            }
        }

        Ok(())
    }

    /// Drops the entries of a subscribe that will never be acknowledged.
    pub(crate) fn fail_subscribe(&mut self, operation_id: u64) {
        self.entries.retain(|_, entry| entry.state != SubscriptionEntryState::Pending(operation_id));
    }

    /// Removes filters immediately; matching publishes are discarded from this point on.
    pub(crate) fn unsubscribe(&mut self, topic_filters: &[String]) {
        for filter in topic_filters {
            if self.entries.remove(filter).is_some() {
                debug!("SubscriptionRegistry - removed entry for \"{}\"", filter);
            }
        }
    }

    /// The broker discarded the session.  Granted subscriptions are gone; entries whose
    /// subscribe has not been answered are kept, since their subscribe may still be sent on the
    /// new session.
    pub(crate) fn clear_granted(&mut self) {
        self.entries.retain(|_, entry| entry.state != SubscriptionEntryState::Active);
    }

    /// Finds the handlers for an inbound topic.  None means no registered filter matches.
    pub(crate) fn route(&self, topic: &str) -> Option<SubscriptionMatch> {
        let mut matched = false;
        let mut handlers = Vec::new();

        for (filter, entry) in &self.entries {
            if topic_matches_filter(topic, filter) {
                matched = true;
                if let Some(handler) = &entry.handler {
                    handlers.push(handler.clone());
                }
            }
        }

        if matched {
            Some(SubscriptionMatch { handlers })
        } else {
            None
        }
    }
}

fn strip_share_prefix(filter: &str) -> &str {
    let Some(remainder) = filter.strip_prefix("$share/") else {
        return filter;
    };

    match remainder.split_once('/') {
        Some((_, inner_filter)) => { inner_filter }
        None => { filter }
    }
}

/// Returns true if `topic` matches `filter` under MQTT wildcard rules.
///
/// `+` matches exactly one level and `#` matches any number of trailing levels, including none.
/// Topics beginning with `$` only match filters that begin with a literal (non-wildcard) first
/// level.  Shared subscription filters (`$share/<group>/<filter>`) match on `<filter>`.
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    let filter = strip_share_prefix(filter);

    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut topic_segments = topic.split('/');
    for filter_segment in filter.split('/') {
        if filter_segment == "#" {
            return true;
        }

        match topic_segments.next() {
            Some(topic_segment) => {
                if filter_segment != "+" && filter_segment != topic_segment {
                    return false;
                }
            }
            None => { return false; }
        }
    }

    topic_segments.next().is_none()
}
