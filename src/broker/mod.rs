//! The broker core: topic state, subscriptions and fan-out.
//!
//! All state lives in an [`Engine`] owned by a single processor task. The
//! rest of the crate only ever holds a [`Broker`] handle and talks to the
//! processor by message passing.

pub mod engine;
pub mod message;
pub mod service;
pub mod topic;

pub use engine::Engine;
pub use message::{Delivery, SubscriptionId};
pub use service::{Broker, BrokerService, Subscription};
