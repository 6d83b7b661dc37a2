//! Messages exchanged with the broker processor.
//!
//! Every request carries its own `oneshot` reply channel. Deliveries flow the
//! other way through a per-subscription bounded channel and are either a
//! payload or a terminal error.

use bytes::Bytes;
use std::fmt;
use tokio::sync::{mpsc, oneshot};

use crate::client::ClientId;
use crate::utils::BrokerError;

/// One event on a subscription: a payload, or the error that ended it.
pub type Delivery = Result<Bytes, BrokerError>;

/// Broker-assigned identifier of one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub(crate) u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// What the processor hands back for a registered subscription.
#[derive(Debug)]
pub struct Registration {
    pub id: SubscriptionId,
    pub deliveries: mpsc::Receiver<Delivery>,
}

/// A request to the broker processor.
#[derive(Debug)]
pub enum Command {
    Publish {
        topic: String,
        payload: Bytes,
        reply: oneshot::Sender<Bytes>,
    },
    Subscribe {
        topic: String,
        owner: ClientId,
        reply: oneshot::Sender<Registration>,
    },
    Unsubscribe {
        id: SubscriptionId,
        reply: Option<oneshot::Sender<bool>>,
    },
    Disconnect {
        owner: ClientId,
        reply: oneshot::Sender<usize>,
    },
    TopicCount {
        reply: oneshot::Sender<usize>,
    },
    Latest {
        topic: String,
        reply: oneshot::Sender<Option<Bytes>>,
    },
    SubscriberCount {
        topic: String,
        reply: oneshot::Sender<usize>,
    },
}

pub(crate) fn published_ack(topic: &str) -> Bytes {
    Bytes::from(format!("Published message to: {topic}\n"))
}

pub(crate) fn subscribed_ack(topic: &str) -> Bytes {
    Bytes::from(format!("Subscribed to: {topic}\n"))
}
