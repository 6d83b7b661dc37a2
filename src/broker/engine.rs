//! Broker engine
//!
//! `Engine` is the state owned by the broker processor: the topic registry and
//! every subscription. It is plain synchronous code; the processor in
//! `service.rs` is the only caller, which is what serializes all mutations.
//!
//! Fan-out never waits on a subscriber. Each subscription has a bounded
//! buffer; a subscriber that lets it fill up is disconnected and receives
//! `BrokerError::SubscriberOverflow` as its final event.

use std::collections::HashMap;

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::broker::message::{
    Command, Registration, SubscriptionId, published_ack, subscribed_ack,
};
use crate::broker::topic::{Offer, Subscriber, Topic};
use crate::client::ClientId;
use crate::utils::BrokerError;

/// Outcome of delivering one payload to a topic's subscribers.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FanOut {
    pub delivered: usize,
    pub closed: usize,
    pub overflowed: usize,
}

/// Topic registry and subscription state of the broker processor.
#[derive(Debug)]
pub struct Engine {
    pub(crate) topics: HashMap<String, Topic>,
    next_id: u64,
    subscriber_buffer: usize,
}

impl Engine {
    /// Creates an empty engine whose subscriptions buffer up to
    /// `subscriber_buffer` deliveries each.
    pub fn new(subscriber_buffer: usize) -> Self {
        Self {
            topics: HashMap::new(),
            next_id: 0,
            subscriber_buffer,
        }
    }

    /// Runs one request to completion.
    pub fn handle(&mut self, command: Command) {
        match command {
            Command::Publish {
                topic,
                payload,
                reply,
            } => {
                let ack = self.record(&topic, payload.clone());
                // the publisher does not wait for fan-out
                let _ = reply.send(ack);
                self.fan_out(&topic, &payload);
            }
            Command::Subscribe {
                topic,
                owner,
                reply,
            } => {
                let registration = self.subscribe(&topic, owner);
                let id = registration.id;
                if reply.send(registration).is_err() {
                    self.unsubscribe(id);
                }
            }
            Command::Unsubscribe { id, reply } => {
                let removed = self.unsubscribe(id);
                if let Some(reply) = reply {
                    let _ = reply.send(removed);
                }
            }
            Command::Disconnect { owner, reply } => {
                let _ = reply.send(self.disconnect(owner));
            }
            Command::TopicCount { reply } => {
                let _ = reply.send(self.topics.len());
            }
            Command::Latest { topic, reply } => {
                let _ = reply.send(self.latest(&topic));
            }
            Command::SubscriberCount { topic, reply } => {
                let _ = reply.send(self.subscriber_count(&topic));
            }
        }
    }

    /// Stores `payload` as the topic's latest value, creating the topic if
    /// needed, and returns the publisher's acknowledgement.
    pub fn record(&mut self, topic: &str, payload: Bytes) -> Bytes {
        let entry = self
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| Topic::new(topic));
        entry.latest = Some(payload);
        trace!(topic, "payload recorded");
        published_ack(topic)
    }

    /// Offers `payload` to every current subscriber of `topic`, reaping the
    /// ones that are gone or overflowed.
    pub fn fan_out(&mut self, topic: &str, payload: &Bytes) -> FanOut {
        let mut result = FanOut::default();
        let Some(entry) = self.topics.get_mut(topic) else {
            return result;
        };

        entry.subscribers.retain(|sub| match sub.offer(topic, payload) {
            Offer::Delivered => {
                result.delivered += 1;
                true
            }
            Offer::Closed => {
                debug!(topic, subscription = %sub.id, client = %sub.owner, "reaped closed subscription");
                result.closed += 1;
                false
            }
            Offer::Overflowed => {
                warn!(topic, subscription = %sub.id, client = %sub.owner, "subscriber overflowed, disconnecting");
                result.overflowed += 1;
                false
            }
        });

        result
    }

    /// Registers a new subscription. Its first event is the subscribe
    /// acknowledgement; the stored payload is not replayed.
    pub fn subscribe(&mut self, topic: &str, owner: ClientId) -> Registration {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        let (subscriber, deliveries) = Subscriber::new(id, owner, self.subscriber_buffer);
        subscriber.push_ack(subscribed_ack(topic));

        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| Topic::new(topic))
            .subscribe(subscriber);
        debug!(topic, subscription = %id, client = %owner, "subscribed");

        Registration { id, deliveries }
    }

    /// Removes the subscription `id`, sending it `Unsubscribed`. Returns
    /// whether it was registered.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.topics.values_mut().any(|topic| topic.unsubscribe(id))
    }

    /// Drops every subscription owned by `owner`.
    pub fn disconnect(&mut self, owner: ClientId) -> usize {
        let removed: usize = self
            .topics
            .values_mut()
            .map(|topic| topic.remove_owner(owner))
            .sum();
        if removed > 0 {
            debug!(client = %owner, removed, "client subscriptions removed");
        }
        removed
    }

    /// The stored payload of `topic`, `None` for an unknown topic or one that
    /// was only subscribed to.
    pub fn latest(&self, topic: &str) -> Option<Bytes> {
        self.topics.get(topic).and_then(|t| t.latest.clone())
    }

    /// Number of live subscriptions on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map_or(0, |t| t.subscribers.len())
    }

    /// Ends every subscription with `BrokerError::Stopped`.
    pub fn close_all(&mut self) {
        for topic in self.topics.values_mut() {
            for sub in topic.subscribers.drain(..) {
                sub.terminate(BrokerError::Stopped);
            }
        }
    }
}
