//! Payment outcome adapter: turns provider callbacks into bus events.

use std::sync::Arc;

use common::MessageId;
use domain::OrderId;
use domain::contracts::{PaymentFailed, PaymentSuccess};
use event_bus::{CORRELATION_HEADER, Connection, Connector, Message};
use serde::{Deserialize, Serialize};

use crate::Result;

/// Result reported by the payment provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum PaymentOutcome {
    #[serde(rename_all = "camelCase")]
    Succeeded { transaction_id: String },
    #[serde(rename_all = "camelCase")]
    Failed {
        error_message: String,
        failure_reason: String,
    },
}

/// Provider callback payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentCallback {
    pub order_id: OrderId,
    #[serde(flatten)]
    pub outcome: PaymentOutcome,
}

impl PaymentCallback {
    pub fn succeeded(order_id: OrderId, transaction_id: impl Into<String>) -> Self {
        Self {
            order_id,
            outcome: PaymentOutcome::Succeeded {
                transaction_id: transaction_id.into(),
            },
        }
    }

    pub fn failed(
        order_id: OrderId,
        error_message: impl Into<String>,
        failure_reason: impl Into<String>,
    ) -> Self {
        Self {
            order_id,
            outcome: PaymentOutcome::Failed {
                error_message: error_message.into(),
                failure_reason: failure_reason.into(),
            },
        }
    }

    /// The bus message announcing this outcome.
    pub fn to_message(&self) -> Result<Message> {
        let message = match &self.outcome {
            PaymentOutcome::Succeeded { transaction_id } => Message::from_event(&PaymentSuccess {
                order_id: self.order_id,
                transaction_id: transaction_id.clone(),
            })?,
            PaymentOutcome::Failed {
                error_message,
                failure_reason,
            } => Message::from_event(&PaymentFailed {
                order_id: self.order_id,
                error_message: error_message.clone(),
                failure_reason: failure_reason.clone(),
            })?,
        };
        Ok(message.with_header(CORRELATION_HEADER, self.order_id.to_string()))
    }
}

/// Publishes payment outcomes for the orchestrator to pick up.
pub struct PaymentOutcomeAdapter<C: Connector> {
    connection: Arc<Connection<C>>,
}

impl<C: Connector> PaymentOutcomeAdapter<C> {
    pub fn new(connection: Arc<Connection<C>>) -> Self {
        Self { connection }
    }

    #[tracing::instrument(skip(self, callback), fields(order_id = %callback.order_id))]
    pub async fn publish(&self, callback: &PaymentCallback) -> Result<MessageId> {
        let message = callback.to_message()?;
        let id = message.id;
        let message_type = message.message_type.clone();
        self.connection.publish(message).await?;

        tracing::info!(%message_type, message_id = %id, "payment outcome published");
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use common::RetryPolicy;
    use event_bus::{Broker, InMemoryBroker, InMemoryConnector, QueueSpec};

    use super::*;

    #[test]
    fn callback_json_shape() {
        let order_id = OrderId::new();
        let callback: PaymentCallback = serde_json::from_value(serde_json::json!({
            "orderId": order_id,
            "status": "failed",
            "errorMessage": "insufficient funds",
            "failureReason": "card_declined",
        }))
        .unwrap();

        assert_eq!(
            callback,
            PaymentCallback::failed(order_id, "insufficient funds", "card_declined")
        );
    }

    #[tokio::test]
    async fn outcomes_are_published_as_payment_events() {
        let broker = InMemoryBroker::new();
        broker
            .declare_queue(QueueSpec::new("orders").bind("payment.*"))
            .await
            .unwrap();
        let connection = Arc::new(Connection::new(
            InMemoryConnector::new(broker.clone()),
            RetryPolicy::no_retry(),
        ));
        let adapter = PaymentOutcomeAdapter::new(connection);
        let order_id = OrderId::new();

        adapter
            .publish(&PaymentCallback::succeeded(order_id, "txn-1"))
            .await
            .unwrap();
        adapter
            .publish(&PaymentCallback::failed(order_id, "declined", "card_declined"))
            .await
            .unwrap();

        let first = broker.try_receive("orders").await.unwrap().unwrap();
        assert_eq!(first.message.message_type, "PaymentSuccess");
        let event: PaymentSuccess = first.message.decode().unwrap();
        assert_eq!(event.transaction_id, "txn-1");
        assert_eq!(
            first.message.correlation_id(),
            Some(order_id.to_string().as_str())
        );

        let second = broker.try_receive("orders").await.unwrap().unwrap();
        assert_eq!(second.message.message_type, "PaymentFailed");
    }
}
