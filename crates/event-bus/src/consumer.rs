use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use common::RetryPolicy;
use tokio::{
    sync::{Semaphore, watch},
    task::JoinSet,
};

use crate::{
    Broker, Connection, Connector, Delivery, HandlerError, HandlerRegistry,
    error::Result,
};

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub queue: String,
    /// Maximum number of deliveries handled concurrently.
    pub prefetch: usize,
    /// Deliveries (first one included) before a transient failure is dead-lettered.
    pub max_attempts: u32,
    /// Delay before requeueing after a transient failure.
    pub redelivery: RetryPolicy,
    /// Pause before reconnecting after a failed receive.
    pub reconnect_delay: Duration,
}

impl ConsumerConfig {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            prefetch: 10,
            max_attempts: 5,
            redelivery: RetryPolicy::exponential(
                5,
                Duration::from_millis(200),
                Duration::from_secs(10),
            ),
            reconnect_delay: Duration::from_secs(1),
        }
    }

    pub fn with_prefetch(mut self, prefetch: usize) -> Self {
        self.prefetch = prefetch.max(1);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_redelivery(mut self, redelivery: RetryPolicy) -> Self {
        self.redelivery = redelivery;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }
}

/// What happened to a delivery after its handler ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Acked,
    Requeued,
    DeadLettered,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainSummary {
    pub acked: usize,
    pub requeued: usize,
    pub dead_lettered: usize,
}

impl DrainSummary {
    fn record(&mut self, settlement: Settlement) {
        match settlement {
            Settlement::Acked => self.acked += 1,
            Settlement::Requeued => self.requeued += 1,
            Settlement::DeadLettered => self.dead_lettered += 1,
        }
    }
}

/// Pulls deliveries from one queue and runs them through a [`HandlerRegistry`].
///
/// At most `prefetch` deliveries are in flight. A delivery is acked only after its
/// handler succeeded. Transient failures are requeued with an incremented attempt
/// counter until `max_attempts`; every other failure goes straight to the
/// dead-letter queue.
pub struct Consumer<C: Connector> {
    connection: Arc<Connection<C>>,
    registry: Arc<HandlerRegistry>,
    config: Arc<ConsumerConfig>,
}

impl<C: Connector> Clone for Consumer<C> {
    fn clone(&self) -> Self {
        Self {
            connection: self.connection.clone(),
            registry: self.registry.clone(),
            config: self.config.clone(),
        }
    }
}

impl<C: Connector> Consumer<C> {
    pub fn new(
        connection: Arc<Connection<C>>,
        registry: Arc<HandlerRegistry>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            connection,
            registry,
            config: Arc::new(config),
        }
    }

    pub fn queue(&self) -> &str {
        &self.config.queue
    }

    /// Runs until `shutdown` flips to true, then waits for in-flight handlers.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let queue = self.config.queue.clone();
        let semaphore = Arc::new(Semaphore::new(self.config.prefetch));
        let mut in_flight = JoinSet::new();

        tracing::info!(%queue, prefetch = self.config.prefetch, "consumer started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            while let Some(joined) = in_flight.try_join_next() {
                self.reap(joined).await;
            }

            let permit = tokio::select! {
                _ = shutdown.changed() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let received = tokio::select! {
                _ = shutdown.changed() => break,
                Some(joined) = in_flight.join_next() => {
                    self.reap(joined).await;
                    continue;
                }
                received = self.next_delivery() => received,
            };

            let (channel, delivery) = match received {
                Ok(received) => received,
                Err(err) => {
                    tracing::warn!(%queue, error = %err, "receive failed");
                    self.connection.invalidate().await;
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(self.config.reconnect_delay) => continue,
                    }
                }
            };

            let worker = self.clone();
            in_flight.spawn(async move {
                let _permit = permit;
                if let Err(err) = worker.process(&channel, delivery).await {
                    tracing::warn!(error = %err, "failed to settle delivery");
                }
            });
        }

        tracing::info!(%queue, in_flight = in_flight.len(), "consumer draining");
        while let Some(joined) = in_flight.join_next().await {
            self.reap(joined).await;
        }
        tracing::info!(%queue, "consumer stopped");
    }

    /// Processes everything currently queued, one delivery at a time, including
    /// redeliveries produced along the way. Returns once the queue is empty.
    pub async fn drain(&self) -> Result<DrainSummary> {
        let mut summary = DrainSummary::default();
        while let Some(settlement) = self.poll_once().await? {
            summary.record(settlement);
        }
        Ok(summary)
    }

    /// Processes at most one delivery. `None` when the queue is empty.
    pub async fn poll_once(&self) -> Result<Option<Settlement>> {
        let channel = self.connection.channel().await?;
        let received = match channel.try_receive(&self.config.queue).await {
            Ok(received) => received,
            Err(err) => {
                if err.is_transient() {
                    self.connection.discard(&channel).await;
                }
                return Err(err);
            }
        };
        match received {
            Some(delivery) => self.process(&channel, delivery).await.map(Some),
            None => Ok(None),
        }
    }

    async fn next_delivery(&self) -> Result<(Arc<C::Broker>, Delivery)> {
        let channel = self.connection.channel().await?;
        let delivery = channel.receive(&self.config.queue).await?;
        Ok((channel, delivery))
    }

    /// A panicked delivery task never settled its delivery; dropping the connection
    /// hands it back to the queue.
    async fn reap(&self, joined: std::result::Result<(), tokio::task::JoinError>) {
        if let Err(err) = joined {
            tracing::error!(queue = %self.config.queue, error = %err, "delivery task panicked");
            self.connection.invalidate().await;
        }
    }

    /// Runs the handler and settles on the channel the delivery came from. When
    /// settling fails the channel is discarded, which requeues the delivery.
    async fn process(&self, channel: &Arc<C::Broker>, delivery: Delivery) -> Result<Settlement> {
        let result = self.handle(channel, delivery).await;
        if let Err(err) = &result {
            tracing::warn!(queue = %self.config.queue, error = %err, "settlement failed, dropping channel");
            self.connection.discard(channel).await;
        }
        result
    }

    #[tracing::instrument(
        skip(self, channel, delivery),
        fields(
            queue = %delivery.queue,
            message_id = %delivery.message.id,
            message_type = %delivery.message.message_type,
            attempt = delivery.attempt(),
        )
    )]
    async fn handle(&self, channel: &Arc<C::Broker>, delivery: Delivery) -> Result<Settlement> {
        let started = Instant::now();
        let outcome = self
            .registry
            .dispatch(&delivery.message, &delivery.queue)
            .await;
        metrics::histogram!("bus_handler_duration_seconds", "queue" => self.config.queue.clone())
            .record(started.elapsed().as_secs_f64());

        let attempt = delivery.attempt();

        let settlement = match outcome {
            Ok(()) => {
                channel.ack(&delivery).await?;
                Settlement::Acked
            }
            Err(HandlerError::Transient(reason)) if attempt < self.config.max_attempts => {
                let delay = self.config.redelivery.delay_for_attempt(attempt);
                tracing::warn!(
                    %reason,
                    delay_ms = delay.as_millis() as u64,
                    "handler failed transiently, scheduling redelivery"
                );
                tokio::time::sleep(delay).await;
                channel.requeue(delivery).await?;
                Settlement::Requeued
            }
            Err(HandlerError::Transient(reason)) => {
                tracing::error!(
                    fatal_inconsistency = true,
                    %reason,
                    max_attempts = self.config.max_attempts,
                    "delivery attempts exhausted, moving message to dead-letter queue"
                );
                channel
                    .dead_letter(delivery, &format!("attempts exhausted: {reason}"))
                    .await?;
                Settlement::DeadLettered
            }
            Err(err) => {
                tracing::error!(error = %err, "message cannot be processed, moving to dead-letter queue");
                channel.dead_letter(delivery, &err.to_string()).await?;
                Settlement::DeadLettered
            }
        };

        let outcome = match settlement {
            Settlement::Acked => "acked",
            Settlement::Requeued => "requeued",
            Settlement::DeadLettered => "dead_lettered",
        };
        metrics::counter!(
            "bus_deliveries_total",
            "queue" => self.config.queue.clone(),
            "outcome" => outcome
        )
        .increment(1);

        Ok(settlement)
    }
}
