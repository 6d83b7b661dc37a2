//! The `error` module defines the error types used within `msgbroker`.
//!
//! Each layer has its own enum: the broker core reports `BrokerError`, the
//! request grammar reports `ProtocolError` and the network front ends report
//! `TransportError`. Per-request errors are turned into a reply to the client
//! at the boundary where they occur; only `TransportError::Bind` travels up to
//! the supervisor.

use std::io;

/// Usage text sent back to clients for any request the grammar rejects.
pub const USAGE: &str = "Please provide request in the format 'Pub:Topic:Message' || Sub:Topic\n";

/// Errors returned by the broker core.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    /// The request queue is closed; the broker no longer accepts work.
    #[error("broker stopped")]
    Stopped,

    /// The subscription was removed by an unsubscribe or disconnect.
    #[error("subscription closed")]
    Unsubscribed,

    #[error("topic name must not be empty")]
    EmptyTopic,

    /// The subscriber fell too far behind and was disconnected.
    #[error("subscription to {topic} dropped: subscriber fell {capacity} messages behind")]
    SubscriberOverflow { topic: String, capacity: usize },
}

/// A request line that does not follow the wire grammar.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("{}", USAGE)]
    Usage,
}

/// Errors raised by the stream and datagram servers.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("error starting listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl TransportError {
    pub(crate) fn bind(addr: impl Into<String>, source: io::Error) -> Self {
        Self::Bind {
            addr: addr.into(),
            source,
        }
    }
}
