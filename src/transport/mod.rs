//! The `transport` module holds the two network front ends of the broker.
//!
//! `tcp` serves long-lived stream connections and `udp` serves one request
//! per datagram. Both parse the same grammar (`message`) and hand requests to
//! the same `dispatch` stage.

pub mod dispatch;
pub mod message;
pub mod tcp;
pub mod udp;

pub use message::ClientMessage;
pub use tcp::StreamServer;
pub use udp::DatagramServer;

use tokio::sync::watch;

/// Resolves once `flag` is set, or once its sender is gone.
pub(crate) async fn signalled(flag: &mut watch::Receiver<bool>) {
    let _ = flag.wait_for(|set| *set).await;
}

#[cfg(test)]
mod tests;
