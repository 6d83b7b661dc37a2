//! Client identity
//!
//! Every stream connection and every datagram peer gets a `ClientId`. The
//! broker tags subscriptions with it so that all of a client's subscriptions
//! can be dropped in one step when the client goes away.

use std::fmt;
use std::net::SocketAddr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(Uuid);

impl ClientId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// A peer talking to one of the transports.
#[derive(Debug, Clone)]
pub struct Client {
    pub id: ClientId,
    pub peer: SocketAddr,
}

impl Client {
    /// Create a client for `peer` with a fresh id.
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            id: ClientId::new(),
            peer,
        }
    }
}
