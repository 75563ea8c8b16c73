/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Topic alias resolution for MQTT5 connections.

Inbound resolution is mandatory once the client advertises a topic alias maximum.  Outbound
resolution is a pluggable strategy; the client never aliases unless configured to.
*/

use crate::error::{MqttifyError, MqttifyResult};

use log::*;
use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;

/// Outcome of resolving an outbound publish's topic against the alias table.
#[derive(Default, Copy, Clone, Debug, Eq, PartialEq)]
pub struct OutboundAliasResolution {

    /// Encode an empty topic; the broker already knows the alias binding
    pub skip_topic : bool,

    /// Topic alias to encode, if any
    pub alias : Option<u16>,
}

/// Strategy for choosing topic aliases on outbound publishes.
pub trait OutboundAliasResolver : Send {

    /// Invoked after every successful Connack with the broker's topic alias maximum.  Zero
    /// forbids aliasing.
    fn reset_for_new_connection(&mut self, maximum_alias_value : u16);

    /// Picks the alias treatment for a publish to `topic` and records the binding.
    fn resolve_and_apply_topic_alias(&mut self, topic: &str) -> OutboundAliasResolution;
}

/// Built-in outbound aliasing strategies
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum TopicAliasStrategy {

    /// Never alias outbound topics
    #[default]
    Disabled,

    /// Alias the most recently used topics, up to the smaller of the given maximum and the
    /// broker's topic alias maximum
    Lru(u16),
}

impl TopicAliasStrategy {
    pub(crate) fn create_resolver(&self) -> Box<dyn OutboundAliasResolver> {
        match self {
            TopicAliasStrategy::Disabled => { Box::new(NullOutboundAliasResolver {}) }
            TopicAliasStrategy::Lru(maximum) => { Box::new(LruOutboundAliasResolver::new(*maximum)) }
        }
    }
}

struct NullOutboundAliasResolver {
}

impl OutboundAliasResolver for NullOutboundAliasResolver {

    fn reset_for_new_connection(&mut self, _ : u16) {}

    fn resolve_and_apply_topic_alias(&mut self, _: &str) -> OutboundAliasResolution {
        OutboundAliasResolution::default()
    }
}

struct LruOutboundAliasResolver {
    configured_maximum : u16,
    active_maximum : u16,

    cache : LruCache<String, u16>,
}

impl LruOutboundAliasResolver {
    fn new(configured_maximum : u16) -> LruOutboundAliasResolver {
        let capacity = NonZeroUsize::new(configured_maximum as usize).unwrap_or(NonZeroUsize::MIN);

        LruOutboundAliasResolver {
            configured_maximum,
            active_maximum: 0,
            cache : LruCache::new(capacity),
        }
    }
}

impl OutboundAliasResolver for LruOutboundAliasResolver {

    fn reset_for_new_connection(&mut self, maximum_alias_value : u16) {
        self.active_maximum = u16::min(self.configured_maximum, maximum_alias_value);
        self.cache.clear();
    }

    fn resolve_and_apply_topic_alias(&mut self, topic: &str) -> OutboundAliasResolution {
        if self.active_maximum == 0 {
            return OutboundAliasResolution::default();
        }

        if let Some(alias) = self.cache.get(topic) {
            return OutboundAliasResolution {
                skip_topic: true,
                alias: Some(*alias),
            };
        }

        let alias =
            if self.cache.len() < self.active_maximum as usize {
                (self.cache.len() + 1) as u16
            } else {
                match self.cache.pop_lru() {
                    Some((_, recycled)) => { recycled }
                    None => { return OutboundAliasResolution::default(); }
                }
            };

        self.cache.push(topic.to_string(), alias);

        OutboundAliasResolution {
            skip_topic: false,
            alias: Some(alias),
        }
    }
}

/// Tracks alias bindings established by the broker on inbound publishes.
pub(crate) struct InboundAliasResolver {
    maximum_alias_value: u16,

    current_aliases : HashMap<u16, String>
}

impl InboundAliasResolver {
    pub(crate) fn new(maximum_alias_value: u16) -> InboundAliasResolver {
        InboundAliasResolver {
            maximum_alias_value,
            current_aliases : HashMap::new()
        }
    }

    pub(crate) fn reset_for_new_connection(&mut self, maximum_alias_value: u16) {
        self.maximum_alias_value = maximum_alias_value;
        self.current_aliases.clear();
    }

    /// Registers or applies an alias binding, rewriting `topic` in place for alias-only publishes.
    pub(crate) fn resolve_topic_alias(&mut self, alias: &Option<u16>, topic: &mut String) -> MqttifyResult<()> {
        let Some(alias_value) = alias else {
            return Ok(());
        };

        if *alias_value == 0 || *alias_value > self.maximum_alias_value {
            error!("Topic Alias Resolution - inbound alias {} out of range", alias_value);
            return Err(MqttifyError::new_protocol_violation("publish topic alias value outside of negotiated range"));
        }

        if topic.is_empty() {
            if let Some(existing_topic) = self.current_aliases.get(alias_value) {
                *topic = existing_topic.clone();
                return Ok(());
            }

            error!("Topic Alias Resolution - no binding for alias {}", alias_value);
            return Err(MqttifyError::new_protocol_violation("no alias binding exists for topic-less publish"));
        }

        self.current_aliases.insert(*alias_value, topic.clone());

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn resolution(skip_topic: bool, alias: Option<u16>) -> OutboundAliasResolution {
        OutboundAliasResolution { skip_topic, alias }
    }

    #[test]
    fn outbound_disabled_never_aliases() {
        let mut resolver = TopicAliasStrategy::Disabled.create_resolver();
        resolver.reset_for_new_connection(20);

        assert_eq!(resolver.resolve_and_apply_topic_alias("a/b"), resolution(false, None));
        assert_eq!(resolver.resolve_and_apply_topic_alias("a/b"), resolution(false, None));
    }

    #[test]
    fn outbound_lru_binds_then_reuses() {
        let mut resolver = TopicAliasStrategy::Lru(2).create_resolver();
        resolver.reset_for_new_connection(10);

        assert_eq!(resolver.resolve_and_apply_topic_alias("a"), resolution(false, Some(1)));
        assert_eq!(resolver.resolve_and_apply_topic_alias("a"), resolution(true, Some(1)));
        assert_eq!(resolver.resolve_and_apply_topic_alias("b"), resolution(false, Some(2)));
        assert_eq!(resolver.resolve_and_apply_topic_alias("b"), resolution(true, Some(2)));
    }

    #[test]
    fn outbound_lru_recycles_least_recently_used() {
        let mut resolver = TopicAliasStrategy::Lru(2).create_resolver();
        resolver.reset_for_new_connection(10);

        resolver.resolve_and_apply_topic_alias("a");
        resolver.resolve_and_apply_topic_alias("b");
        resolver.resolve_and_apply_topic_alias("a");

        // "b" is now least recently used, so "c" takes its alias
        assert_eq!(resolver.resolve_and_apply_topic_alias("c"), resolution(false, Some(2)));
        assert_eq!(resolver.resolve_and_apply_topic_alias("a"), resolution(true, Some(1)));
        assert_eq!(resolver.resolve_and_apply_topic_alias("b"), resolution(false, Some(2)));
    }

    #[test]
    fn outbound_lru_respects_broker_maximum() {
        let mut resolver = TopicAliasStrategy::Lru(20).create_resolver();
        resolver.reset_for_new_connection(0);
        assert_eq!(resolver.resolve_and_apply_topic_alias("a"), resolution(false, None));

        resolver.reset_for_new_connection(1);
        assert_eq!(resolver.resolve_and_apply_topic_alias("a"), resolution(false, Some(1)));
        assert_eq!(resolver.resolve_and_apply_topic_alias("b"), resolution(false, Some(1)));
    }

    #[test]
    fn inbound_register_then_resolve() {
        let mut resolver = InboundAliasResolver::new(5);

        let mut topic = "some/topic".to_string();
        assert!(resolver.resolve_topic_alias(&Some(3), &mut topic).is_ok());

        let mut empty = String::new();
        assert!(resolver.resolve_topic_alias(&Some(3), &mut empty).is_ok());
        assert_eq!("some/topic", empty);
    }

    #[test]
    fn inbound_failures() {
        let mut resolver = InboundAliasResolver::new(5);

        let mut topic = "some/topic".to_string();
        assert_matches!(resolver.resolve_topic_alias(&Some(0), &mut topic), Err(MqttifyError::ProtocolViolation(_)));
        assert_matches!(resolver.resolve_topic_alias(&Some(6), &mut topic), Err(MqttifyError::ProtocolViolation(_)));

        let mut empty = String::new();
        assert_matches!(resolver.resolve_topic_alias(&Some(2), &mut empty), Err(MqttifyError::ProtocolViolation(_)));
    }

    #[test]
    fn inbound_reset_clears_bindings() {
        let mut resolver = InboundAliasResolver::new(5);

        let mut topic = "some/topic".to_string();
        assert!(resolver.resolve_topic_alias(&Some(1), &mut topic).is_ok());

        resolver.reset_for_new_connection(5);

        let mut empty = String::new();
        assert_matches!(resolver.resolve_topic_alias(&Some(1), &mut empty), Err(MqttifyError::ProtocolViolation(_)));
    }
}
