use std::sync::Arc;

use async_trait::async_trait;
use common::{RetryPolicy, retry_async};
use tokio::sync::{Mutex, RwLock};

use crate::{
    Broker, InMemoryBroker, Message, QueueSpec,
    error::{BusError, Result},
};

/// Opens broker channels.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Broker: Broker;

    async fn connect(&self) -> Result<Arc<Self::Broker>>;
}

/// Connects to a shared [`InMemoryBroker`]. Fails while the broker is offline.
#[derive(Clone, Default)]
pub struct InMemoryConnector {
    broker: InMemoryBroker,
}

impl InMemoryConnector {
    pub fn new(broker: InMemoryBroker) -> Self {
        Self { broker }
    }

    pub fn broker(&self) -> &InMemoryBroker {
        &self.broker
    }
}

#[async_trait]
impl Connector for InMemoryConnector {
    type Broker = InMemoryBroker;

    async fn connect(&self) -> Result<Arc<InMemoryBroker>> {
        self.broker.ping().await?;
        Ok(Arc::new(self.broker.open_channel()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

/// A lazily (re)established broker connection shared by publishers and consumers.
///
/// The connection remembers every declared queue and re-declares them after a
/// reconnect, so workers never run against a broker that lost its topology.
pub struct Connection<C: Connector> {
    connector: C,
    channel: RwLock<Option<Arc<C::Broker>>>,
    topology: Mutex<Vec<QueueSpec>>,
    reconnect: RetryPolicy,
}

impl<C: Connector> Connection<C> {
    pub fn new(connector: C, reconnect: RetryPolicy) -> Self {
        Self {
            connector,
            channel: RwLock::new(None),
            topology: Mutex::new(Vec::new()),
            reconnect,
        }
    }

    pub async fn state(&self) -> ConnectionState {
        if self.channel.read().await.is_some() {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    /// Returns the live channel, connecting first if needed.
    pub async fn channel(&self) -> Result<Arc<C::Broker>> {
        if let Some(channel) = self.channel.read().await.as_ref() {
            return Ok(channel.clone());
        }

        let mut slot = self.channel.write().await;
        if let Some(channel) = slot.as_ref() {
            return Ok(channel.clone());
        }

        let channel = retry_async(&self.reconnect, "bus.connect", BusError::is_transient, || {
            self.connector.connect()
        })
        .await?;

        for spec in self.topology.lock().await.iter() {
            channel.declare_queue(spec.clone()).await?;
        }

        metrics::counter!("bus_connections_opened_total").increment(1);
        tracing::info!("event bus connection established");
        *slot = Some(channel.clone());
        Ok(channel)
    }

    /// Closes the current channel; the next call to [`channel`](Self::channel)
    /// reconnects. Deliveries still unsettled on the old channel are redelivered.
    pub async fn invalidate(&self) {
        let dropped = self.channel.write().await.take();
        if let Some(channel) = dropped {
            Self::close_lost(&channel).await;
        }
    }

    /// Like [`invalidate`](Self::invalidate), for a channel that just failed. A channel
    /// already replaced by a reconnect is closed without touching the new one.
    pub async fn discard(&self, channel: &Arc<C::Broker>) {
        let was_current = {
            let mut slot = self.channel.write().await;
            let current = slot.as_ref().is_some_and(|live| Arc::ptr_eq(live, channel));
            if current {
                slot.take();
            }
            current
        };
        if was_current {
            Self::close_lost(channel).await;
        } else if let Err(err) = channel.close().await {
            tracing::error!(error = %err, "failed to close stale event bus channel");
        }
    }

    async fn close_lost(channel: &Arc<C::Broker>) {
        metrics::counter!("bus_reconnects_total").increment(1);
        tracing::warn!("event bus connection lost, will reconnect");
        if let Err(err) = channel.close().await {
            tracing::error!(error = %err, "failed to close event bus channel");
        }
    }

    pub async fn declare_queue(&self, spec: QueueSpec) -> Result<()> {
        {
            let mut topology = self.topology.lock().await;
            topology.retain(|s| s.name != spec.name);
            topology.push(spec.clone());
        }
        self.channel().await?.declare_queue(spec).await
    }

    /// Publishes with reconnect-and-retry on transient failures.
    pub async fn publish(&self, message: Message) -> Result<usize> {
        retry_async(&self.reconnect, "bus.publish", BusError::is_transient, || {
            let message = message.clone();
            async move {
                let channel = self.channel().await?;
                match channel.publish(message).await {
                    Err(err) if err.is_transient() => {
                        self.discard(&channel).await;
                        Err(err)
                    }
                    other => other,
                }
            }
        })
        .await
    }

    /// Health check that never triggers a reconnect.
    pub async fn ping(&self) -> Result<()> {
        match self.channel.read().await.as_ref() {
            Some(channel) => channel.ping().await,
            None => Err(BusError::Unavailable("not connected".into())),
        }
    }
}
