//! Backend selection and the services shared by routes and workers.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use common::RetryPolicy;
use discount::{DiscountStore, DiscountTracker, InMemoryDiscountStore, PostgresDiscountStore};
use event_bus::{BusError, Connection, InMemoryBroker, InMemoryConnector, QueueSpec};
use event_store::{EventStore, EventStoreError, InMemoryEventStore, PostgresEventStore};
use inventory::{InMemoryLedger, PostgresLedger, ReservationEngine, StockLedger};
use saga::{InMemoryPaymentGateway, OrderOrchestrator, OutboxRelay, PaymentOutcomeAdapter};
use sqlx::postgres::PgPoolOptions;
use thiserror::Error;

use crate::config::Config;

/// The storage implementations a process runs on.
pub trait Backend: Send + Sync + 'static {
    type Store: EventStore + Clone + 'static;
    type Ledger: StockLedger;
    type Discounts: DiscountStore;
}

pub struct InMemoryBackend;

impl Backend for InMemoryBackend {
    type Store = InMemoryEventStore;
    type Ledger = InMemoryLedger;
    type Discounts = InMemoryDiscountStore;
}

pub struct PostgresBackend;

impl Backend for PostgresBackend {
    type Store = PostgresEventStore;
    type Ledger = PostgresLedger;
    type Discounts = PostgresDiscountStore;
}

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("database connection failed: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migrations failed: {0}")]
    Migrations(#[from] EventStoreError),

    #[error("event bus setup failed: {0}")]
    Bus(#[from] BusError),
}

pub struct Stores<B: Backend> {
    pub events: B::Store,
    pub ledger: B::Ledger,
    pub discounts: B::Discounts,
    _backend: PhantomData<B>,
}

impl Stores<InMemoryBackend> {
    pub fn in_memory() -> Self {
        Self {
            events: InMemoryEventStore::new(),
            ledger: InMemoryLedger::new(),
            discounts: InMemoryDiscountStore::new(),
            _backend: PhantomData,
        }
    }
}

impl Stores<PostgresBackend> {
    /// Connects to PostgreSQL and applies the workspace migrations.
    pub async fn connect(database_url: &str) -> Result<Self, StartupError> {
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;
        let events = PostgresEventStore::new(pool.clone());
        events.run_migrations().await?;
        tracing::info!("database migrations applied");

        Ok(Self {
            events,
            ledger: PostgresLedger::new(pool.clone()),
            discounts: PostgresDiscountStore::new(pool),
            _backend: PhantomData,
        })
    }
}

pub type Orchestrator<B> = OrderOrchestrator<
    <B as Backend>::Store,
    ReservationEngine<<B as Backend>::Ledger>,
    DiscountTracker<<B as Backend>::Discounts>,
    InMemoryPaymentGateway,
>;

/// Queues the process consumes, with their bindings.
pub fn queue_specs() -> Vec<QueueSpec> {
    vec![
        saga::handlers::queue_spec(),
        saga::handlers::refund_queue_spec(),
        inventory::handlers::queue_spec(),
        discount::handlers::queue_spec(),
    ]
}

/// Shared application state accessible from all handlers and workers.
pub struct AppState<B: Backend> {
    pub orchestrator: Arc<Orchestrator<B>>,
    pub inventory: Arc<ReservationEngine<B::Ledger>>,
    pub discounts: Arc<DiscountTracker<B::Discounts>>,
    pub payments: Arc<InMemoryPaymentGateway>,
    pub payment_outcomes: PaymentOutcomeAdapter<InMemoryConnector>,
    pub relay: Arc<OutboxRelay<B::Store, InMemoryConnector>>,
    pub connection: Arc<Connection<InMemoryConnector>>,
    pub broker: InMemoryBroker,
}

impl<B: Backend> AppState<B> {
    /// Wires the services together and declares every queue on the broker.
    pub async fn new(
        stores: Stores<B>,
        broker: InMemoryBroker,
        config: &Config,
    ) -> Result<Arc<Self>, StartupError> {
        let connection = Arc::new(Connection::new(
            InMemoryConnector::new(broker.clone()),
            RetryPolicy::exponential(5, Duration::from_millis(100), Duration::from_secs(5)),
        ));
        for spec in queue_specs() {
            connection.declare_queue(spec).await?;
        }

        let inventory = Arc::new(ReservationEngine::new(stores.ledger, config.engine_config()));
        let discounts = Arc::new(DiscountTracker::new(stores.discounts));
        let payments = Arc::new(InMemoryPaymentGateway::new());
        let relay = Arc::new(OutboxRelay::new(stores.events.clone(), connection.clone()));
        let orchestrator = Arc::new(
            OrderOrchestrator::new(
                stores.events,
                inventory.clone(),
                discounts.clone(),
                payments.clone(),
                config.orchestrator_config(),
            )
            .with_outbox_waker(relay.waker()),
        );

        Ok(Arc::new(Self {
            orchestrator,
            inventory,
            discounts,
            payments,
            payment_outcomes: PaymentOutcomeAdapter::new(connection.clone()),
            relay,
            connection,
            broker,
        }))
    }
}
