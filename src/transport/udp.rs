//! Datagram transport
//!
//! Every datagram is one complete request. Replies go back to the sender's
//! address, and a subscription pushes each delivery to that address as an
//! unsolicited datagram. A source address with live subscriptions is treated
//! as one client so its subscriptions can be released together when the
//! server stops.
//!
//! A datagram reading `STOP` ends the receive loop; this is a local
//! convenience for tests and scripts.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, info, warn};

use crate::broker::{Broker, Subscription};
use crate::client::ClientId;
use crate::config::DatagramSettings;
use crate::transport::dispatch::{self, Reply};
use crate::transport::signalled;
use crate::utils::TransportError;

/// Control word that ends the receive loop.
pub const STOP_WORD: &str = "STOP";

/// A running datagram server.
#[derive(Debug)]
pub struct DatagramServer {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    finished: watch::Receiver<bool>,
}

impl DatagramServer {
    /// Binds the socket and starts the receive loop in the background.
    pub async fn start(settings: &DatagramSettings, broker: Broker) -> Result<Self, TransportError> {
        let addr = format!("{}:{}", settings.host, settings.port);
        let socket = UdpSocket::bind(&addr)
            .await
            .map_err(|err| TransportError::bind(&addr, err))?;
        let local_addr = socket.local_addr()?;
        info!(addr = %local_addr, "datagram transport listening");

        let (shutdown, shutdown_rx) = watch::channel(false);
        let (finished_tx, finished) = watch::channel(false);
        let max = settings.max_datagram_size.max(1);

        tokio::spawn(async move {
            serve(Arc::new(socket), broker, max, shutdown_rx).await;
            let _ = finished_tx.send(true);
        });

        Ok(Self {
            local_addr,
            shutdown,
            finished,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Waits until the receive loop has ended on its own (after `STOP`) or
    /// because of [`DatagramServer::stop`].
    pub async fn stopped(&self) {
        let mut finished = self.finished.clone();
        signalled(&mut finished).await;
    }

    /// Ends the receive loop and every datagram subscription, then waits for
    /// them to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        self.stopped().await;
        info!("datagram server stopped");
    }
}

/// Maps each source address to the `ClientId` that owns its subscriptions.
///
/// A peer is only tracked while it has at least one live subscription; plain
/// publishes never create an entry.
#[derive(Debug, Default)]
pub(crate) struct PeerTable {
    peers: HashMap<SocketAddr, Peer>,
}

#[derive(Debug)]
struct Peer {
    id: ClientId,
    subscriptions: usize,
}

impl PeerTable {
    /// The id requests from `peer` run under. A peer without live
    /// subscriptions gets a fresh id.
    pub(crate) fn owner(&self, peer: SocketAddr) -> ClientId {
        self.peers.get(&peer).map_or_else(ClientId::new, |p| p.id)
    }

    /// Records a new subscription made by `peer` under `owner`.
    pub(crate) fn subscribed(&mut self, peer: SocketAddr, owner: ClientId) {
        self.peers
            .entry(peer)
            .or_insert(Peer {
                id: owner,
                subscriptions: 0,
            })
            .subscriptions += 1;
    }

    /// Records that one of `peer`'s subscriptions ended, forgetting the peer
    /// when it was the last.
    pub(crate) fn released(&mut self, peer: SocketAddr) {
        if let Some(entry) = self.peers.get_mut(&peer) {
            entry.subscriptions = entry.subscriptions.saturating_sub(1);
            if entry.subscriptions == 0 {
                self.peers.remove(&peer);
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.peers.len()
    }

    fn owners(&self) -> impl Iterator<Item = ClientId> + '_ {
        self.peers.values().map(|p| p.id)
    }
}

enum Event {
    Shutdown,
    Received(std::io::Result<(usize, SocketAddr)>),
    Finished(Result<SocketAddr, JoinError>),
}

async fn serve(
    socket: Arc<UdpSocket>,
    broker: Broker,
    max_datagram_size: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; max_datagram_size];
    let mut peers = PeerTable::default();
    let (closed, closed_rx) = watch::channel(false);
    let mut deliveries: JoinSet<SocketAddr> = JoinSet::new();

    loop {
        let event = tokio::select! {
            _ = signalled(&mut shutdown) => Event::Shutdown,
            received = socket.recv_from(&mut buf) => Event::Received(received),
            Some(finished) = deliveries.join_next(), if !deliveries.is_empty() => {
                Event::Finished(finished)
            }
        };

        let (len, peer) = match event {
            Event::Shutdown => break,
            Event::Received(Ok(received)) => received,
            Event::Received(Err(err)) => {
                warn!(error = %err, "datagram receive failed");
                continue;
            }
            Event::Finished(Ok(peer)) => {
                peers.released(peer);
                debug!(%peer, tracked = peers.len(), "datagram subscription finished");
                continue;
            }
            Event::Finished(Err(err)) => {
                warn!(error = %err, "datagram delivery task failed");
                continue;
            }
        };

        let Ok(request) = std::str::from_utf8(&buf[..len]) else {
            send_to(&socket, &dispatch::usage(), peer).await;
            continue;
        };
        if request.trim() == STOP_WORD {
            info!(%peer, "exiting datagram server");
            break;
        }

        let owner = peers.owner(peer);
        match dispatch::dispatch(&broker, owner, request).await {
            Reply::Respond(reply) => {
                send_to(&socket, &reply, peer).await;
            }
            Reply::Subscribed { ack, subscription } => {
                send_to(&socket, &ack, peer).await;
                peers.subscribed(peer, owner);
                deliveries.spawn(deliver(
                    subscription,
                    socket.clone(),
                    peer,
                    closed_rx.clone(),
                ));
            }
        }
    }

    let _ = closed.send(true);
    for owner in peers.owners() {
        if let Err(err) = broker.disconnect(owner).await {
            debug!(client = %owner, error = %err, "could not release subscriptions");
            break;
        }
    }
    while deliveries.join_next().await.is_some() {}
}

async fn send_to(socket: &UdpSocket, datagram: &Bytes, peer: SocketAddr) -> bool {
    match socket.send_to(datagram, peer).await {
        Ok(_) => true,
        Err(err) => {
            warn!(%peer, error = %err, "datagram send failed");
            false
        }
    }
}

/// Pushes one subscription's payloads to `peer`, one datagram each. Returns
/// `peer` once the subscription is over.
async fn deliver(
    mut subscription: Subscription,
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    mut closed: watch::Receiver<bool>,
) -> SocketAddr {
    loop {
        let event = tokio::select! {
            biased;
            _ = signalled(&mut closed) => break,
            event = subscription.recv() => event,
        };

        match event {
            Ok(payload) => {
                if !send_to(&socket, &payload, peer).await {
                    break;
                }
            }
            Err(err) => {
                debug!(%peer, topic = subscription.topic(), error = %err, "subscription ended");
                send_to(&socket, &dispatch::error_line(&err), peer).await;
                break;
            }
        }
    }
    peer
}
