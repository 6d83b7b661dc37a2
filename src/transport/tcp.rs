//! Stream transport
//!
//! A TCP server speaking the newline-delimited request grammar. Each accepted
//! socket gets:
//! - a read loop that parses lines and dispatches them to the broker
//! - a writer task draining an outbound queue into the socket, so responses and
//!   deliveries from several tasks never interleave mid-frame
//! - one delivery task per subscription made on the connection
//!
//! Request lines are capped at `max_line_len` bytes; a longer line is
//! answered with the usage text and the connection is closed.
//!
//! The number of live connections is owned by a tracker task fed with
//! open/close events. `StreamServer::stop` closes the listener, signals every
//! connection and waits for the tracker to report zero. Every wait inside a
//! connection also watches the shutdown signal, so a client that stops
//! reading cannot hold `stop` up.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::broker::{Broker, Subscription};
use crate::client::{Client, ClientId};
use crate::config::StreamSettings;
use crate::transport::dispatch::{self, Reply};
use crate::transport::signalled;
use crate::utils::TransportError;

/// Frames queued per connection ahead of the socket writer.
const OUTBOUND_CAPACITY: usize = 64;

/// How long a closing connection may spend flushing queued frames.
const FLUSH_GRACE: Duration = Duration::from_secs(1);

/// Pause after a failed accept so a persistent error does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// A running stream server.
#[derive(Debug)]
pub struct StreamServer {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
    tracker: ConnectionTracker,
}

impl StreamServer {
    /// Binds the listener and starts accepting connections in the
    /// background. Failing to bind is the only error reported.
    pub async fn start(settings: &StreamSettings, broker: Broker) -> Result<Self, TransportError> {
        let addr = format!("{}:{}", settings.host, settings.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|err| TransportError::bind(&addr, err))?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "stream transport listening");

        let (shutdown, shutdown_rx) = watch::channel(false);
        let tracker = ConnectionTracker::spawn();
        let accept_task = tokio::spawn(accept_loop(
            listener,
            broker,
            settings.max_line_len.max(1),
            tracker.clone(),
            shutdown_rx,
        ));

        Ok(Self {
            local_addr,
            shutdown,
            accept_task,
            tracker,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn live_connections(&self) -> usize {
        self.tracker.count().await
    }

    /// Stops accepting, tells every connection to finish and waits until the
    /// last one has closed.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.accept_task.await;
        info!("stream listener stopped");

        self.tracker.drained().await;
        info!("stream connections drained");
    }
}

async fn accept_loop(
    listener: TcpListener,
    broker: Broker,
    max_line_len: usize,
    tracker: ConnectionTracker,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let accepted = tokio::select! {
            _ = signalled(&mut shutdown) => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((socket, peer)) => {
                let client = Client::new(peer);
                info!(client = %client.id, %peer, "socket established with client");
                let guard = tracker.open();
                tokio::spawn(handle_connection(
                    socket,
                    client,
                    broker.clone(),
                    max_line_len,
                    shutdown.clone(),
                    guard,
                ));
            }
            Err(err) => {
                warn!(error = %err, "accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

async fn handle_connection(
    socket: TcpStream,
    client: Client,
    broker: Broker,
    max_line_len: usize,
    mut shutdown: watch::Receiver<bool>,
    _guard: ConnectionGuard,
) {
    let (read, write) = socket.into_split();
    let (outbound, outbound_rx) = mpsc::channel::<Bytes>(OUTBOUND_CAPACITY);
    let writer = tokio::spawn(write_loop(write, outbound_rx, client.id));

    // tells this connection's delivery tasks to finish
    let (closed, closed_rx) = watch::channel(false);
    let mut deliveries = JoinSet::new();

    let mut reader = BufReader::new(read);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        let mut limited = (&mut reader).take(max_line_len as u64);
        let read = tokio::select! {
            _ = signalled(&mut shutdown) => {
                debug!(client = %client.id, "server shutting down, closing connection");
                break;
            }
            read = limited.read_until(b'\n', &mut buf) => read,
        };

        match read {
            Ok(0) => {
                info!(client = %client.id, peer = %client.peer, "closing connection with client");
                break;
            }
            Ok(len) if len == max_line_len && buf.last() != Some(&b'\n') => {
                warn!(client = %client.id, limit = max_line_len, "request line too long, closing connection");
                queue(&outbound, dispatch::usage(), &mut shutdown).await;
                break;
            }
            Ok(_) => {
                let reply = match std::str::from_utf8(&buf) {
                    Ok(line) => dispatch::dispatch(&broker, client.id, line).await,
                    Err(_) => Reply::Respond(dispatch::usage()),
                };
                let (frame, subscription) = match reply {
                    Reply::Respond(bytes) => (bytes, None),
                    Reply::Subscribed { ack, subscription } => (ack, Some(subscription)),
                };
                // the ack is queued before the first delivery can be
                if !queue(&outbound, frame, &mut shutdown).await {
                    break;
                }
                if let Some(subscription) = subscription {
                    deliveries.spawn(deliver(subscription, outbound.clone(), closed_rx.clone()));
                }
            }
            Err(err) => {
                warn!(client = %client.id, error = %err, "read failed");
                let _ = outbound.try_send(dispatch::error_line(&err));
                break;
            }
        }
    }

    let _ = closed.send(true);
    match broker.disconnect(client.id).await {
        Ok(removed) if removed > 0 => debug!(client = %client.id, removed, "subscriptions released"),
        Ok(_) => {}
        Err(err) => debug!(client = %client.id, error = %err, "could not release subscriptions"),
    }
    while deliveries.join_next().await.is_some() {}

    drop(outbound);
    let mut writer = writer;
    if tokio::time::timeout(FLUSH_GRACE, &mut writer).await.is_err() {
        writer.abort();
    }
    debug!(client = %client.id, "connection closed");
}

/// Hands `frame` to the writer task. Returns `false` if the writer is gone or
/// the server started shutting down while the queue was full.
async fn queue(
    outbound: &mpsc::Sender<Bytes>,
    frame: Bytes,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    tokio::select! {
        biased;
        _ = signalled(shutdown) => false,
        sent = outbound.send(frame) => sent.is_ok(),
    }
}

async fn write_loop(
    mut write: OwnedWriteHalf,
    mut outbound: mpsc::Receiver<Bytes>,
    client: ClientId,
) {
    while let Some(frame) = outbound.recv().await {
        if let Err(err) = write.write_all(&frame).await {
            warn!(%client, error = %err, "write failed");
            break;
        }
    }
    let _ = write.shutdown().await;
}

/// Forwards one subscription's payloads to the connection, one line each.
async fn deliver(
    mut subscription: Subscription,
    outbound: mpsc::Sender<Bytes>,
    mut closed: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = signalled(&mut closed) => break,
            event = subscription.recv() => event,
        };

        let (frame, last) = match event {
            Ok(payload) => (line_frame(&payload), false),
            Err(err) => {
                debug!(topic = subscription.topic(), error = %err, "subscription ended");
                (dispatch::error_line(&err), true)
            }
        };

        tokio::select! {
            biased;
            _ = signalled(&mut closed) => break,
            sent = outbound.send(frame) => {
                if sent.is_err() {
                    break;
                }
            }
        }
        if last {
            break;
        }
    }
}

fn line_frame(payload: &Bytes) -> Bytes {
    let mut frame = BytesMut::with_capacity(payload.len() + 1);
    frame.put_slice(payload);
    frame.put_u8(b'\n');
    frame.freeze()
}

enum TrackerEvent {
    Opened,
    Closed,
    Count(oneshot::Sender<usize>),
    Drained(oneshot::Sender<()>),
}

/// Handle to the task that owns the live-connection count.
#[derive(Debug, Clone)]
struct ConnectionTracker {
    events: mpsc::UnboundedSender<TrackerEvent>,
}

/// Counts one connection for as long as it is alive.
struct ConnectionGuard {
    events: mpsc::UnboundedSender<TrackerEvent>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let _ = self.events.send(TrackerEvent::Closed);
    }
}

impl ConnectionTracker {
    fn spawn() -> Self {
        let (events, rx) = mpsc::unbounded_channel();
        tokio::spawn(track(rx));
        Self { events }
    }

    fn open(&self) -> ConnectionGuard {
        let _ = self.events.send(TrackerEvent::Opened);
        ConnectionGuard {
            events: self.events.clone(),
        }
    }

    async fn count(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        let _ = self.events.send(TrackerEvent::Count(reply));
        rx.await.unwrap_or(0)
    }

    /// Resolves once no connection is open. Events sent before this call
    /// are accounted for first.
    async fn drained(&self) {
        let (reply, rx) = oneshot::channel();
        let _ = self.events.send(TrackerEvent::Drained(reply));
        let _ = rx.await;
    }
}

async fn track(mut events: mpsc::UnboundedReceiver<TrackerEvent>) {
    let mut live = 0usize;
    let mut waiters: Vec<oneshot::Sender<()>> = Vec::new();

    while let Some(event) = events.recv().await {
        match event {
            TrackerEvent::Opened => live += 1,
            TrackerEvent::Closed => {
                live = live.saturating_sub(1);
                if live == 0 {
                    for waiter in waiters.drain(..) {
                        let _ = waiter.send(());
                    }
                }
            }
            TrackerEvent::Count(reply) => {
                let _ = reply.send(live);
            }
            TrackerEvent::Drained(reply) if live == 0 => {
                let _ = reply.send(());
            }
            TrackerEvent::Drained(reply) => waiters.push(reply),
        }
    }
}
