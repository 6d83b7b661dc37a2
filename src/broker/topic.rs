//! Topic management
//!
//! A `Topic` holds the latest payload published to it and its subscribers in
//! registration order. Topics are only touched by the broker processor, so
//! nothing here is synchronized.

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::broker::message::{Delivery, SubscriptionId};
use crate::client::ClientId;
use crate::utils::BrokerError;

/// Result of offering one payload to one subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    Delivered,
    /// The receiving side is gone.
    Closed,
    /// The buffer was full; the subscriber has been sent a terminal error.
    Overflowed,
}

/// One subscription's sending side, as held by its topic.
#[derive(Debug)]
pub struct Subscriber {
    pub id: SubscriptionId,
    pub owner: ClientId,
    sink: mpsc::Sender<Delivery>,
    capacity: usize,
}

impl Subscriber {
    /// Creates a subscriber able to buffer `capacity` deliveries. One extra
    /// slot is kept free for the terminal error.
    pub fn new(
        id: SubscriptionId,
        owner: ClientId,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<Delivery>) {
        let capacity = capacity.max(1);
        let (sink, deliveries) = mpsc::channel(capacity + 1);
        (
            Self {
                id,
                owner,
                sink,
                capacity,
            },
            deliveries,
        )
    }

    /// Pushes `payload` without waiting.
    pub fn offer(&self, topic: &str, payload: &Bytes) -> Offer {
        if self.sink.is_closed() {
            return Offer::Closed;
        }
        if self.sink.capacity() <= 1 {
            let _ = self.sink.try_send(Err(BrokerError::SubscriberOverflow {
                topic: topic.to_string(),
                capacity: self.capacity,
            }));
            return Offer::Overflowed;
        }
        match self.sink.try_send(Ok(payload.clone())) {
            Ok(()) => Offer::Delivered,
            Err(mpsc::error::TrySendError::Closed(_)) => Offer::Closed,
            Err(mpsc::error::TrySendError::Full(_)) => Offer::Overflowed,
        }
    }

    /// Sends `err` as the last event. Uses the reserved slot, so it only
    /// fails when the receiver is gone.
    pub fn terminate(&self, err: BrokerError) {
        let _ = self.sink.try_send(Err(err));
    }

    /// Queues the subscribe acknowledgement as the first event.
    pub(crate) fn push_ack(&self, ack: Bytes) {
        let _ = self.sink.try_send(Ok(ack));
    }
}

/// A named topic: its latest payload and current subscribers.
#[derive(Debug, Default)]
pub struct Topic {
    pub name: String,
    pub latest: Option<Bytes>,
    pub subscribers: Vec<Subscriber>,
}

impl Topic {
    /// Create a new topic with the given name and no stored payload.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            latest: None,
            subscribers: Vec::new(),
        }
    }

    /// Add a subscriber to the topic.
    pub fn subscribe(&mut self, subscriber: Subscriber) {
        self.subscribers.push(subscriber);
    }

    /// Remove a subscriber from the topic. Returns whether it was present.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|s| keep_or_close(s, s.id != id));
        self.subscribers.len() != before
    }

    /// Remove every subscriber owned by `owner`, returning how many went.
    pub fn remove_owner(&mut self, owner: ClientId) -> usize {
        let before = self.subscribers.len();
        self.subscribers.retain(|s| keep_or_close(s, s.owner != owner));
        before - self.subscribers.len()
    }
}

fn keep_or_close(subscriber: &Subscriber, keep: bool) -> bool {
    if !keep {
        subscriber.terminate(BrokerError::Unsubscribed);
    }
    keep
}
