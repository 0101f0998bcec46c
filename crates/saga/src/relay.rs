//! Outbox relay: publishes committed integration messages to the bus.

use std::sync::Arc;
use std::time::Duration;

use event_bus::{Connection, Connector, Message};
use event_store::{EventStore, OutboxMessage};
use tokio::sync::{Mutex, Notify, watch};

use crate::Result;

const DEFAULT_BATCH_SIZE: usize = 100;

/// Moves outbox messages to the bus.
///
/// A message is marked dispatched only after the broker accepted it, so a crash in
/// between publishes it again on the next pass. Consumers are idempotent.
pub struct OutboxRelay<S: EventStore, C: Connector> {
    store: S,
    connection: Arc<Connection<C>>,
    batch_size: usize,
    wake: Arc<Notify>,
    // One pass at a time, or two passes could publish the same batch.
    pass: Mutex<()>,
}

impl<S: EventStore, C: Connector> OutboxRelay<S, C> {
    pub fn new(store: S, connection: Arc<Connection<C>>) -> Self {
        Self {
            store,
            connection,
            batch_size: DEFAULT_BATCH_SIZE,
            wake: Arc::new(Notify::new()),
            pass: Mutex::new(()),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Handle for waking the background loop right after a command committed.
    pub fn waker(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    /// Publishes everything pending. Returns the number of messages dispatched.
    pub async fn dispatch_pending(&self) -> Result<usize> {
        let _pass = self.pass.lock().await;
        let mut dispatched = 0;

        loop {
            let batch = self.store.pending_outbox(self.batch_size).await?;
            if batch.is_empty() {
                break;
            }
            let full = batch.len() == self.batch_size;

            let mut sent = Vec::with_capacity(batch.len());
            let mut failure = None;
            for outbox in batch {
                let id = outbox.id;
                match self.connection.publish(to_message(outbox)?).await {
                    Ok(_) => sent.push(id),
                    Err(err) => {
                        failure = Some(err);
                        break;
                    }
                }
            }

            if !sent.is_empty() {
                self.store.mark_outbox_dispatched(&sent).await?;
                metrics::counter!("outbox_messages_dispatched_total").increment(sent.len() as u64);
                dispatched += sent.len();
            }
            if let Some(err) = failure {
                return Err(err.into());
            }
            if !full {
                break;
            }
        }

        if dispatched > 0 {
            tracing::debug!(dispatched, "outbox messages published");
        }
        Ok(dispatched)
    }

    /// Dispatches every `interval` and whenever woken, until `shutdown` flips to true.
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(interval_ms = interval.as_millis() as u64, "outbox relay started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.wake.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            if let Err(err) = self.dispatch_pending().await {
                tracing::warn!(error = %err, "outbox dispatch failed, will retry");
            }
        }

        // Last pass so nothing committed before shutdown waits for the next start.
        if let Err(err) = self.dispatch_pending().await {
            tracing::warn!(error = %err, "final outbox dispatch failed");
        }
        tracing::info!("outbox relay stopped");
    }
}

fn to_message(outbox: OutboxMessage) -> Result<Message> {
    Ok(Message::builder()
        .id(outbox.id)
        .message_type(outbox.message_type)
        .topic(outbox.topic)
        .payload_raw(outbox.payload)
        .headers(outbox.headers)
        .build()?)
}

#[cfg(test)]
mod tests {
    use common::RetryPolicy;
    use event_bus::{Broker, InMemoryBroker, InMemoryConnector, QueueSpec};
    use event_store::{AppendOptions, EventEnvelope, InMemoryEventStore, Version};

    use super::*;

    async fn store_with_outbox(count: usize) -> InMemoryEventStore {
        let store = InMemoryEventStore::new();
        for i in 0..count {
            let aggregate_id = common::AggregateId::new();
            let envelope = EventEnvelope::builder()
                .aggregate_id(aggregate_id)
                .aggregate_type("Order")
                .event_type("Noted")
                .version(Version::first())
                .payload(&serde_json::json!({ "n": i }))
                .unwrap()
                .build()
                .unwrap();
            let outbox =
                OutboxMessage::new("order.confirmed", "OrderConfirmed", &serde_json::json!({ "n": i }))
                    .unwrap();
            store
                .append_with_outbox(vec![envelope], AppendOptions::expect_new(), vec![outbox])
                .await
                .unwrap();
        }
        store
    }

    async fn relay(
        store: InMemoryEventStore,
        broker: &InMemoryBroker,
    ) -> OutboxRelay<InMemoryEventStore, InMemoryConnector> {
        broker
            .declare_queue(QueueSpec::new("orders").bind("order.#"))
            .await
            .unwrap();
        let connection = Arc::new(Connection::new(
            InMemoryConnector::new(broker.clone()),
            RetryPolicy::no_retry(),
        ));
        OutboxRelay::new(store, connection).with_batch_size(2)
    }

    #[tokio::test]
    async fn dispatches_in_batches_and_marks_messages() {
        let store = store_with_outbox(5).await;
        let broker = InMemoryBroker::new();
        let relay = relay(store.clone(), &broker).await;

        assert_eq!(relay.dispatch_pending().await.unwrap(), 5);
        assert_eq!(relay.dispatch_pending().await.unwrap(), 0);
        assert_eq!(broker.queue_depth("orders").await.unwrap(), 5);
        assert!(store.pending_outbox(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn outage_leaves_messages_pending() {
        let store = store_with_outbox(3).await;
        let broker = InMemoryBroker::new();
        let relay = relay(store.clone(), &broker).await;

        broker.set_available(false).await;
        assert!(relay.dispatch_pending().await.is_err());
        assert_eq!(store.pending_outbox(10).await.unwrap().len(), 3);

        broker.set_available(true).await;
        assert_eq!(relay.dispatch_pending().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn published_message_keeps_outbox_id() {
        let store = store_with_outbox(1).await;
        let pending = store.pending_outbox(1).await.unwrap();
        let broker = InMemoryBroker::new();
        let relay = relay(store, &broker).await;

        relay.dispatch_pending().await.unwrap();

        let delivery = broker.try_receive("orders").await.unwrap().unwrap();
        assert_eq!(delivery.message.id, pending[0].id);
    }
}
