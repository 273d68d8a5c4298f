//! Real-time channel registry.
//!
//! Channels subscribe to facility topics (or the `*` wildcard) and receive
//! `ChangeEvent`s over an unbounded queue. Subscriptions requested before
//! a channel connects are queued and replayed once on connect.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use common::config::FanOut;
use common::ChangeEvent;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info};

/// Topic matching every facility.
pub const WILDCARD_TOPIC: &str = "*";

/// Addressing for a published event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    /// Every connected channel.
    All,
    /// Channels subscribed to this facility or to the wildcard.
    Facility(String),
}

impl Scope {
    /// Addressing for a change to `facility_id` under `fan_out`.
    pub fn for_change(fan_out: FanOut, facility_id: &str) -> Self {
        match fan_out {
            FanOut::All => Scope::All,
            FanOut::Subscribed => Scope::Facility(facility_id.to_string()),
        }
    }
}

/// Sink for change events.
#[async_trait]
pub trait Broadcaster: Send + Sync {
    /// Deliver `event`; returns the number of channels reached.
    async fn publish(&self, event: &ChangeEvent, scope: Scope) -> usize;
}

/// Result of a subscribe call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    Active,
    /// Channel not connected yet; replayed on connect.
    Queued,
}

#[derive(Debug)]
struct ChannelState {
    tx: UnboundedSender<ChangeEvent>,
    topics: HashSet<String>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    channels: HashMap<String, ChannelState>,
    pending: HashMap<String, Vec<String>>,
}

impl RegistryInner {
    fn targets(&self, scope: &Scope) -> Vec<(String, UnboundedSender<ChangeEvent>)> {
        self.channels
            .iter()
            .filter(|(_, state)| match scope {
                Scope::All => true,
                Scope::Facility(id) => {
                    state.topics.contains(id) || state.topics.contains(WILDCARD_TOPIC)
                }
            })
            .map(|(channel, state)| (channel.clone(), state.tx.clone()))
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    inner: Mutex<RegistryInner>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a channel and replay its queued subscriptions.
    ///
    /// Reconnecting an existing channel replaces its queue and topics.
    pub fn connect(&self, channel: &str) -> UnboundedReceiver<ChangeEvent> {
        let (tx, rx) = unbounded_channel();
        let mut inner = self.lock();
        let topics: HashSet<String> = inner
            .pending
            .remove(channel)
            .unwrap_or_default()
            .into_iter()
            .collect();

        info!(
            "Channel {} connected ({} queued subscriptions replayed)",
            channel,
            topics.len()
        );
        inner
            .channels
            .insert(channel.to_string(), ChannelState { tx, topics });
        rx
    }

    pub fn disconnect(&self, channel: &str) -> bool {
        let mut inner = self.lock();
        inner.pending.remove(channel);
        let removed = inner.channels.remove(channel).is_some();
        if removed {
            info!("Channel {} disconnected", channel);
        }
        removed
    }

    pub fn subscribe(&self, channel: &str, facility_id: &str) -> SubscribeOutcome {
        let mut inner = self.lock();
        if let Some(state) = inner.channels.get_mut(channel) {
            state.topics.insert(facility_id.to_string());
            debug!("{} subscribed to {}", channel, facility_id);
            return SubscribeOutcome::Active;
        }

        let queue = inner.pending.entry(channel.to_string()).or_default();
        if !queue.iter().any(|t| t == facility_id) {
            queue.push(facility_id.to_string());
        }
        debug!("{} not connected; queued subscription to {}", channel, facility_id);
        SubscribeOutcome::Queued
    }

    /// No-op for unconnected channels.
    pub fn unsubscribe(&self, channel: &str, facility_id: &str) -> bool {
        let mut inner = self.lock();
        match inner.channels.get_mut(channel) {
            Some(state) => state.topics.remove(facility_id),
            None => false,
        }
    }

    pub fn is_connected(&self, channel: &str) -> bool {
        self.lock().channels.contains_key(channel)
    }

    pub fn connected_count(&self) -> usize {
        self.lock().channels.len()
    }

    pub fn pending_count(&self, channel: &str) -> usize {
        self.lock().pending.get(channel).map_or(0, Vec::len)
    }

    /// Connected channels that would receive an event for `facility_id`.
    pub fn subscribers(&self, facility_id: &str) -> Vec<String> {
        let mut channels: Vec<String> = self
            .lock()
            .targets(&Scope::Facility(facility_id.to_string()))
            .into_iter()
            .map(|(channel, _)| channel)
            .collect();
        channels.sort();
        channels
    }

    /// Deliver to matching channels, dropping those whose receiver is gone.
    pub fn deliver(&self, event: &ChangeEvent, scope: &Scope) -> usize {
        let targets = self.lock().targets(scope);

        let mut delivered = 0;
        let mut closed = Vec::new();
        for (channel, tx) in targets {
            if tx.send(event.clone()).is_ok() {
                delivered += 1;
            } else {
                closed.push(channel);
            }
        }

        if !closed.is_empty() {
            self.prune_closed(&closed);
        }
        delivered
    }

    /// Drop the named channels whose current sender is closed. A channel
    /// that reconnected since its old sender failed keeps its new state.
    fn prune_closed(&self, channels: &[String]) {
        let mut inner = self.lock();
        for channel in channels {
            if inner
                .channels
                .get(channel)
                .is_some_and(|state| state.tx.is_closed())
            {
                debug!("Pruning closed channel {}", channel);
                inner.channels.remove(channel);
            }
        }
    }
}

#[async_trait]
impl Broadcaster for SubscriptionRegistry {
    async fn publish(&self, event: &ChangeEvent, scope: Scope) -> usize {
        self.deliver(event, &scope)
    }
}
