use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};

use crate::{
    Message,
    broker::{Broker, DeadLetter, Delivery, QueueSpec, dead_letter_queue_name},
    error::{BusError, Result},
    message::{DEAD_LETTER_REASON_HEADER, DEAD_LETTERED_AT_HEADER},
};

#[derive(Default)]
struct Queue {
    spec: Option<QueueSpec>,
    ready: VecDeque<Message>,
    /// Delivery tag to (owning channel, message).
    unacked: HashMap<u64, (u64, Message)>,
    notify: Arc<Notify>,
}

#[derive(Default)]
struct State {
    queues: HashMap<String, Queue>,
    next_tag: u64,
}

impl State {
    fn queue_mut(&mut self, name: &str) -> Result<&mut Queue> {
        self.queues
            .get_mut(name)
            .ok_or_else(|| BusError::QueueNotFound(name.to_string()))
    }

    fn take_next(&mut self, name: &str, channel: u64) -> Result<Option<Delivery>> {
        let tag = self.next_tag + 1;
        let queue = self.queue_mut(name)?;
        let Some(message) = queue.ready.pop_front() else {
            return Ok(None);
        };
        queue.unacked.insert(tag, (channel, message.clone()));
        self.next_tag = tag;
        Ok(Some(Delivery {
            tag,
            queue: name.to_string(),
            message,
        }))
    }

    /// Moves the unacked deliveries selected by `owned` back to the front of their
    /// queues, oldest first, with the attempt counter bumped.
    fn recover(&mut self, queue_name: Option<&str>, owned: impl Fn(u64) -> bool) -> usize {
        let mut count = 0;
        for (name, queue) in self.queues.iter_mut() {
            if queue_name.is_some_and(|wanted| wanted != name.as_str()) {
                continue;
            }
            let tags: Vec<u64> = queue
                .unacked
                .iter()
                .filter(|(_, (channel, _))| owned(*channel))
                .map(|(tag, _)| *tag)
                .collect();
            let mut recovered: Vec<(u64, Message)> = tags
                .into_iter()
                .filter_map(|tag| queue.unacked.remove(&tag).map(|(_, msg)| (tag, msg)))
                .collect();
            recovered.sort_by_key(|(tag, _)| *tag);
            for (_, mut message) in recovered.into_iter().rev() {
                message.bump_attempt();
                queue.ready.push_front(message);
                count += 1;
            }
            if !queue.ready.is_empty() {
                queue.notify.notify_one();
            }
        }
        count
    }
}

/// In-process broker with AMQP-like semantics.
///
/// Useful for tests and for running the whole system in one process. Outages can be
/// simulated with [`set_available`](Self::set_available): while unavailable, every
/// operation fails with [`BusError::Unavailable`] and blocked receivers wake up.
///
/// Each handle is a channel. Deliveries belong to the channel that received them, and
/// [`close`](Broker::close) hands the unsettled ones back to their queues.
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<Mutex<State>>,
    available: Arc<AtomicBool>,
    channels: Arc<AtomicU64>,
    channel: u64,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            available: Arc::new(AtomicBool::new(true)),
            channels: Arc::new(AtomicU64::new(0)),
            channel: 0,
        }
    }

    /// A new channel on the same broker.
    pub fn open_channel(&self) -> Self {
        Self {
            channel: self.channels.fetch_add(1, Ordering::SeqCst) + 1,
            ..self.clone()
        }
    }

    pub async fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        if !available {
            let state = self.state.lock().await;
            for queue in state.queues.values() {
                queue.notify.notify_waiters();
                queue.notify.notify_one();
            }
        }
    }

    /// Puts every unacknowledged delivery of a queue back in front of it, as a broker
    /// does when a consumer dies mid-flight. Returns the number of messages recovered.
    pub async fn recover_unacked(&self, queue: &str) -> Result<usize> {
        let mut state = self.state.lock().await;
        state.queue_mut(queue)?;
        Ok(state.recover(Some(queue), |_| true))
    }

    /// Deliveries handed out and not yet settled.
    pub async fn unacked_count(&self, queue: &str) -> Result<usize> {
        let mut state = self.state.lock().await;
        Ok(state.queue_mut(queue)?.unacked.len())
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BusError::Unavailable("in-memory broker is offline".into()))
        }
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn ping(&self) -> Result<()> {
        self.ensure_available()
    }

    async fn declare_queue(&self, spec: QueueSpec) -> Result<()> {
        self.ensure_available()?;
        let mut state = self.state.lock().await;
        state.queues.entry(spec.dead_letter_queue()).or_default();
        let queue = state.queues.entry(spec.name.clone()).or_default();
        tracing::debug!(queue = %spec.name, bindings = ?spec.bindings, "queue declared");
        queue.spec = Some(spec);
        Ok(())
    }

    async fn publish(&self, message: Message) -> Result<usize> {
        self.ensure_available()?;
        let mut state = self.state.lock().await;

        let mut routed = 0;
        for queue in state.queues.values_mut() {
            if queue.spec.as_ref().is_some_and(|s| s.accepts(&message.topic)) {
                queue.ready.push_back(message.clone());
                queue.notify.notify_one();
                routed += 1;
            }
        }

        metrics::counter!("bus_messages_published_total").increment(1);
        if routed == 0 {
            tracing::debug!(topic = %message.topic, message_type = %message.message_type, "message matched no queue");
        }
        Ok(routed)
    }

    async fn receive(&self, queue: &str) -> Result<Delivery> {
        loop {
            self.ensure_available()?;
            let notify = {
                let mut state = self.state.lock().await;
                if let Some(delivery) = state.take_next(queue, self.channel)? {
                    return Ok(delivery);
                }
                state.queue_mut(queue)?.notify.clone()
            };
            notify.notified().await;
        }
    }

    async fn try_receive(&self, queue: &str) -> Result<Option<Delivery>> {
        self.ensure_available()?;
        self.state.lock().await.take_next(queue, self.channel)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        self.ensure_available()?;
        let mut state = self.state.lock().await;
        if state
            .queue_mut(&delivery.queue)?
            .unacked
            .remove(&delivery.tag)
            .is_none()
        {
            tracing::debug!(tag = delivery.tag, queue = %delivery.queue, "ack for unknown delivery tag");
        }
        Ok(())
    }

    async fn requeue(&self, delivery: Delivery) -> Result<()> {
        self.ensure_available()?;
        let mut state = self.state.lock().await;
        let queue = state.queue_mut(&delivery.queue)?;
        if queue.unacked.remove(&delivery.tag).is_none() {
            // Already recovered after a connection loss; the broker owns it again.
            return Ok(());
        }
        let mut message = delivery.message;
        message.bump_attempt();
        queue.ready.push_back(message);
        queue.notify.notify_one();
        metrics::counter!("bus_messages_redelivered_total").increment(1);
        Ok(())
    }

    async fn dead_letter(&self, delivery: Delivery, reason: &str) -> Result<()> {
        self.ensure_available()?;
        let mut state = self.state.lock().await;
        if state
            .queue_mut(&delivery.queue)?
            .unacked
            .remove(&delivery.tag)
            .is_none()
        {
            return Ok(());
        }

        let message = delivery
            .message
            .with_header(DEAD_LETTER_REASON_HEADER, reason)
            .with_header(DEAD_LETTERED_AT_HEADER, Utc::now().to_rfc3339());
        let dlq = dead_letter_queue_name(&delivery.queue);
        state.queues.entry(dlq).or_default().ready.push_back(message);
        metrics::counter!("bus_messages_dead_lettered_total", "queue" => delivery.queue)
            .increment(1);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let channel = self.channel;
        let recovered = self.state.lock().await.recover(None, |owner| owner == channel);
        if recovered > 0 {
            metrics::counter!("bus_messages_redelivered_total").increment(recovered as u64);
            tracing::warn!(channel, recovered, "channel closed with unsettled deliveries, requeued");
        }
        Ok(())
    }

    async fn queue_depth(&self, queue: &str) -> Result<usize> {
        let mut state = self.state.lock().await;
        Ok(state.queue_mut(queue)?.ready.len())
    }

    async fn dead_letters(&self, queue: &str) -> Result<Vec<DeadLetter>> {
        let mut state = self.state.lock().await;
        let dlq = state.queue_mut(&dead_letter_queue_name(queue))?;
        Ok(dlq
            .ready
            .iter()
            .map(|message| DeadLetter {
                queue: queue.to_string(),
                reason: message
                    .header(DEAD_LETTER_REASON_HEADER)
                    .unwrap_or_default()
                    .to_string(),
                dead_lettered_at: message
                    .header(DEAD_LETTERED_AT_HEADER)
                    .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                    .map(|t| t.with_timezone(&Utc)),
                message: message.clone(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn message(topic: &str) -> Message {
        Message::builder()
            .message_type("Test")
            .topic(topic)
            .payload_raw(serde_json::json!({"topic": topic}))
            .build()
            .unwrap()
    }

    async fn broker_with_queue() -> InMemoryBroker {
        let broker = InMemoryBroker::new();
        broker
            .declare_queue(QueueSpec::new("inventory").bind("order.*"))
            .await
            .unwrap();
        broker
    }

    #[tokio::test]
    async fn publish_routes_by_binding() {
        let broker = broker_with_queue().await;
        broker
            .declare_queue(QueueSpec::new("audit").bind("#"))
            .await
            .unwrap();

        assert_eq!(broker.publish(message("order.confirmed")).await.unwrap(), 2);
        assert_eq!(broker.publish(message("payment.failed")).await.unwrap(), 1);
        assert_eq!(broker.queue_depth("inventory").await.unwrap(), 1);
        assert_eq!(broker.queue_depth("audit").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn unacked_delivery_is_not_visible_until_recovered() {
        let broker = broker_with_queue().await;
        broker.publish(message("order.confirmed")).await.unwrap();

        let delivery = broker.try_receive("inventory").await.unwrap().unwrap();
        assert_eq!(delivery.attempt(), 1);
        assert!(broker.try_receive("inventory").await.unwrap().is_none());

        assert_eq!(broker.recover_unacked("inventory").await.unwrap(), 1);
        let again = broker.try_receive("inventory").await.unwrap().unwrap();
        assert_eq!(again.message.id, delivery.message.id);
        assert!(again.is_redelivery());

        // The stale tag no longer settles anything.
        broker.requeue(delivery).await.unwrap();
        assert_eq!(broker.queue_depth("inventory").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn closing_a_channel_returns_only_its_deliveries() {
        let broker = broker_with_queue().await;
        broker.publish(message("order.confirmed")).await.unwrap();
        broker.publish(message("order.cancelled")).await.unwrap();

        let first = broker.open_channel();
        let second = broker.open_channel();
        let taken = first.try_receive("inventory").await.unwrap().unwrap();
        let kept = second.try_receive("inventory").await.unwrap().unwrap();

        // Works while offline, like a broker noticing a dropped connection.
        broker.set_available(false).await;
        first.close().await.unwrap();
        broker.set_available(true).await;

        assert_eq!(broker.unacked_count("inventory").await.unwrap(), 1);
        let again = broker.try_receive("inventory").await.unwrap().unwrap();
        assert_eq!(again.message.id, taken.message.id);
        assert_eq!(again.attempt(), 2);

        second.ack(&kept).await.unwrap();
        broker.ack(&again).await.unwrap();
        assert_eq!(broker.unacked_count("inventory").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn requeue_increments_attempt_and_dead_letter_records_reason() {
        let broker = broker_with_queue().await;
        broker.publish(message("order.cancelled")).await.unwrap();

        let first = broker.try_receive("inventory").await.unwrap().unwrap();
        broker.requeue(first).await.unwrap();
        let second = broker.try_receive("inventory").await.unwrap().unwrap();
        assert_eq!(second.attempt(), 2);

        broker.dead_letter(second, "poison").await.unwrap();
        assert_eq!(broker.queue_depth("inventory").await.unwrap(), 0);
        assert_eq!(broker.unacked_count("inventory").await.unwrap(), 0);

        let dead = broker.dead_letters("inventory").await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].reason, "poison");
        assert!(dead[0].dead_lettered_at.is_some());
        assert_eq!(dead[0].message.attempt(), 2);
    }

    #[tokio::test]
    async fn receive_waits_for_publish() {
        let broker = broker_with_queue().await;
        let receiver = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.receive("inventory").await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        broker.publish(message("order.confirmed")).await.unwrap();

        let delivery = tokio::time::timeout(Duration::from_secs(1), receiver)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(delivery.message.topic, "order.confirmed");
    }

    #[tokio::test]
    async fn outage_fails_operations_and_wakes_receivers() {
        let broker = broker_with_queue().await;
        let receiver = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.receive("inventory").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        broker.set_available(false).await;
        let result = tokio::time::timeout(Duration::from_secs(1), receiver)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(BusError::Unavailable(_))));
        assert!(broker.publish(message("order.confirmed")).await.is_err());
        assert!(broker.ping().await.is_err());

        broker.set_available(true).await;
        assert!(broker.ping().await.is_ok());
    }

    #[tokio::test]
    async fn unknown_queue_is_an_error() {
        let broker = InMemoryBroker::new();
        assert!(matches!(
            broker.try_receive("missing").await,
            Err(BusError::QueueNotFound(_))
        ));
    }
}
