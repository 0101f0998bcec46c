//! Core aggregate and domain event traits.

use common::AggregateId;
use event_bus::BusEvent;
use event_store::{OutboxMessage, Version};
use serde::{Serialize, de::DeserializeOwned};

/// A fact recorded on an aggregate's stream. Named in past tense.
pub trait DomainEvent: Serialize + DeserializeOwned + Send + Sync + Clone {
    /// Stored as the envelope's `event_type`.
    fn event_type(&self) -> &'static str;
}

/// An event-sourced aggregate.
///
/// State is rebuilt by replaying events through [`apply`](Aggregate::apply); commands
/// are plain methods that inspect the current state and return new events or an error.
pub trait Aggregate: Default + Clone + Send + Sync + Sized {
    type Event: DomainEvent;

    type Error: std::error::Error + Send + Sync;

    fn aggregate_type() -> &'static str;

    /// None until the first event has been applied.
    fn id(&self) -> Option<AggregateId>;

    fn version(&self) -> Version;

    fn set_version(&mut self, version: Version);

    /// Must be pure and must not fail: events are facts that already happened.
    fn apply(&mut self, event: Self::Event);

    fn apply_events(&mut self, events: impl IntoIterator<Item = Self::Event>) {
        for event in events {
            self.apply(event);
        }
    }

    /// Integration messages to publish once `event` is stored.
    ///
    /// Called after `event` has been applied, so `self` already reflects it. The
    /// messages are written to the outbox in the same atomic append as the event.
    fn integration_messages(
        &self,
        _event: &Self::Event,
    ) -> Result<Vec<OutboxMessage>, serde_json::Error> {
        Ok(Vec::new())
    }
}

/// Builds the outbox entry for a typed bus contract.
pub fn outbox_message<E: BusEvent>(event: &E) -> Result<OutboxMessage, serde_json::Error> {
    OutboxMessage::new(E::TOPIC, E::MESSAGE_TYPE, event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    enum CounterEvent {
        Opened { id: AggregateId },
        Incremented { by: i32 },
    }

    impl DomainEvent for CounterEvent {
        fn event_type(&self) -> &'static str {
            match self {
                CounterEvent::Opened { .. } => "CounterOpened",
                CounterEvent::Incremented { .. } => "CounterIncremented",
            }
        }
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Milestone {
        value: i32,
    }

    impl BusEvent for Milestone {
        const MESSAGE_TYPE: &'static str = "Milestone";
        const TOPIC: &'static str = "counter.milestone";
    }

    #[derive(Debug, Default, Clone)]
    struct Counter {
        id: Option<AggregateId>,
        value: i32,
        version: Version,
    }

    #[derive(Debug, thiserror::Error)]
    #[error("counter error")]
    struct CounterError;

    impl Aggregate for Counter {
        type Event = CounterEvent;
        type Error = CounterError;

        fn aggregate_type() -> &'static str {
            "Counter"
        }

        fn id(&self) -> Option<AggregateId> {
            self.id
        }

        fn version(&self) -> Version {
            self.version
        }

        fn set_version(&mut self, version: Version) {
            self.version = version;
        }

        fn apply(&mut self, event: Self::Event) {
            match event {
                CounterEvent::Opened { id } => self.id = Some(id),
                CounterEvent::Incremented { by } => self.value += by,
            }
        }

        fn integration_messages(
            &self,
            event: &Self::Event,
        ) -> Result<Vec<OutboxMessage>, serde_json::Error> {
            match event {
                CounterEvent::Incremented { .. } if self.value >= 10 => {
                    Ok(vec![outbox_message(&Milestone { value: self.value })?])
                }
                _ => Ok(Vec::new()),
            }
        }
    }

    #[test]
    fn apply_events_in_order() {
        let mut counter = Counter::default();
        let id = AggregateId::new();
        counter.apply_events(vec![
            CounterEvent::Opened { id },
            CounterEvent::Incremented { by: 4 },
            CounterEvent::Incremented { by: 3 },
        ]);

        assert_eq!(counter.id(), Some(id));
        assert_eq!(counter.value, 7);
    }

    #[test]
    fn integration_messages_see_post_event_state() {
        let mut counter = Counter::default();
        let event = CounterEvent::Incremented { by: 12 };
        assert!(counter.integration_messages(&event).unwrap().is_empty());

        counter.apply(event.clone());
        let messages = counter.integration_messages(&event).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].topic, "counter.milestone");
        assert_eq!(messages[0].payload["value"], 12);
    }
}
