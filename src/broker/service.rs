//! The broker processor and its handle.
//!
//! `BrokerService::start` spawns a single task that owns the [`Engine`] and
//! consumes a bounded request queue in FIFO order. Every other component talks
//! to it through a cloneable [`Broker`] handle; each call enqueues a
//! [`Command`] and waits on a `oneshot` reply.
//!
//! Stopping closes the queue to new requests, lets the processor drain what was
//! already queued, and then ends every live subscription with
//! `BrokerError::Stopped`. Calls made after that fail with the same error.

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::broker::engine::Engine;
use crate::broker::message::{Command, Delivery, SubscriptionId};
use crate::client::ClientId;
use crate::config::BrokerSettings;
use crate::utils::BrokerError;

/// Cloneable handle used to submit requests to the broker processor.
#[derive(Debug, Clone)]
pub struct Broker {
    commands: mpsc::Sender<Command>,
}

/// Owns the processor task. Dropping it without calling [`stop`] also stops
/// the processor.
///
/// [`stop`]: BrokerService::stop
#[derive(Debug)]
pub struct BrokerService {
    broker: Broker,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl BrokerService {
    /// Spawns the processor on the current tokio runtime.
    pub fn start(settings: &BrokerSettings) -> Self {
        let (commands, requests) = mpsc::channel(settings.request_queue_capacity.max(1));
        let (shutdown, shutdown_rx) = oneshot::channel();
        let engine = Engine::new(settings.subscriber_buffer);
        let task = tokio::spawn(run(engine, requests, shutdown_rx));
        info!(
            queue = settings.request_queue_capacity,
            subscriber_buffer = settings.subscriber_buffer,
            "broker started"
        );

        Self {
            broker: Broker { commands },
            shutdown,
            task,
        }
    }

    /// A new handle to the processor.
    pub fn handle(&self) -> Broker {
        self.broker.clone()
    }

    /// Closes the request queue and waits until every queued request has been
    /// processed.
    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        let _ = self.task.await;
        info!("broker stopped");
    }
}

async fn run(
    mut engine: Engine,
    mut requests: mpsc::Receiver<Command>,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => break,
            command = requests.recv() => match command {
                Some(command) => engine.handle(command),
                None => break,
            },
        }
    }

    requests.close();
    let mut drained = 0usize;
    while let Some(command) = requests.recv().await {
        engine.handle(command);
        drained += 1;
    }
    debug!(drained, "request queue drained");
    engine.close_all();
}

impl Broker {
    /// Records `payload` as the latest value of `topic` and starts delivery
    /// to its current subscribers. Returns the acknowledgement for the
    /// publisher once the value is stored.
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
    ) -> Result<Bytes, BrokerError> {
        check_topic(topic)?;
        let payload = payload.into();
        self.request(|reply| Command::Publish {
            topic: topic.to_string(),
            payload,
            reply,
        })
        .await
    }

    /// Registers a subscription owned by `owner`. The subscription is live by
    /// the time this returns; its first event is the acknowledgement.
    pub async fn subscribe(&self, topic: &str, owner: ClientId) -> Result<Subscription, BrokerError> {
        check_topic(topic)?;
        let registration = self
            .request(|reply| Command::Subscribe {
                topic: topic.to_string(),
                owner,
                reply,
            })
            .await?;

        Ok(Subscription {
            id: registration.id,
            topic: topic.to_string(),
            deliveries: registration.deliveries,
            commands: Some(self.commands.clone()),
        })
    }

    /// Removes one subscription. Returns whether it was still registered.
    pub async fn unsubscribe(&self, id: SubscriptionId) -> Result<bool, BrokerError> {
        self.request(|reply| Command::Unsubscribe {
            id,
            reply: Some(reply),
        })
        .await
    }

    /// Removes every subscription owned by `owner`.
    pub async fn disconnect(&self, owner: ClientId) -> Result<usize, BrokerError> {
        self.request(|reply| Command::Disconnect { owner, reply })
            .await
    }

    /// Number of topics created so far.
    pub async fn topic_count(&self) -> Result<usize, BrokerError> {
        self.request(|reply| Command::TopicCount { reply }).await
    }

    /// The latest payload stored for `topic`, if any.
    pub async fn latest(&self, topic: &str) -> Result<Option<Bytes>, BrokerError> {
        self.request(|reply| Command::Latest {
            topic: topic.to_string(),
            reply,
        })
        .await
    }

    /// Number of live subscriptions on `topic`.
    pub async fn subscriber_count(&self, topic: &str) -> Result<usize, BrokerError> {
        self.request(|reply| Command::SubscriberCount {
            topic: topic.to_string(),
            reply,
        })
        .await
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, BrokerError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| BrokerError::Stopped)?;
        response.await.map_err(|_| BrokerError::Stopped)
    }
}

fn check_topic(topic: &str) -> Result<(), BrokerError> {
    if topic.is_empty() {
        return Err(BrokerError::EmptyTopic);
    }
    Ok(())
}

/// Receiving end of a subscription.
///
/// Dropping it deregisters the subscription on a best-effort basis; the
/// broker also reaps it on the next publish to the topic.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    topic: String,
    deliveries: mpsc::Receiver<Delivery>,
    commands: Option<mpsc::Sender<Command>>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Waits for the next event. After an `Err` the subscription is over.
    pub async fn recv(&mut self) -> Delivery {
        match self.deliveries.recv().await {
            Some(delivery) => delivery,
            None => Err(BrokerError::Stopped),
        }
    }

    /// Deregisters the subscription and waits for the broker to confirm.
    pub async fn unsubscribe(mut self) -> Result<bool, BrokerError> {
        let Some(commands) = self.commands.take() else {
            return Ok(false);
        };
        Broker { commands }.unsubscribe(self.id).await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(commands) = self.commands.take() {
            let _ = commands.try_send(Command::Unsubscribe {
                id: self.id,
                reply: None,
            });
        }
    }
}
