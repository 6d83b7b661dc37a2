//! Request handling shared by the stream and datagram servers.
//!
//! Parsing errors and broker errors both become a reply for the client; no
//! request can end the session that sent it.

use bytes::Bytes;
use tracing::debug;

use crate::broker::{Broker, Subscription};
use crate::client::ClientId;
use crate::transport::message::ClientMessage;
use crate::utils::ProtocolError;

/// What the transport has to do after handling one request.
#[derive(Debug)]
pub enum Reply {
    /// Send these bytes back to the requester.
    Respond(Bytes),
    /// Send the acknowledgement, then keep delivering from the subscription.
    Subscribed {
        ack: Bytes,
        subscription: Subscription,
    },
}

/// Parses `line` and runs it against the broker on behalf of `owner`.
///
/// A subscription is registered before this returns, so a later request from
/// the same client is always ordered after it.
pub async fn dispatch(broker: &Broker, owner: ClientId, line: &str) -> Reply {
    let request = match ClientMessage::parse(line) {
        Ok(request) => request,
        Err(err) => {
            debug!(client = %owner, request = %line.trim_end(), "rejected malformed request");
            return Reply::Respond(Bytes::from(err.to_string()));
        }
    };

    match request {
        ClientMessage::Publish { topic, payload } => match broker.publish(&topic, payload).await {
            Ok(ack) => {
                debug!(client = %owner, topic = %topic, "published");
                Reply::Respond(ack)
            }
            Err(err) => Reply::Respond(error_line(&err)),
        },
        ClientMessage::Subscribe { topic } => {
            let mut subscription = match broker.subscribe(&topic, owner).await {
                Ok(subscription) => subscription,
                Err(err) => return Reply::Respond(error_line(&err)),
            };
            match subscription.recv().await {
                Ok(ack) => Reply::Subscribed { ack, subscription },
                Err(err) => Reply::Respond(error_line(&err)),
            }
        }
    }
}

/// Reply for a request that is not valid UTF-8.
pub fn usage() -> Bytes {
    Bytes::from(ProtocolError::Usage.to_string())
}

/// Renders an error as a newline-terminated line for the client.
pub fn error_line(err: &dyn std::error::Error) -> Bytes {
    Bytes::from(format!("{err}\n"))
}
