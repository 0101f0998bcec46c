//! Background workers: bus consumers, the outbox relay and the expiration sweeper.

use std::sync::Arc;

use event_bus::{Consumer, HandlerRegistry};
use inventory::ExpirationSweeper;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::state::{AppState, Backend};

/// Handler registries, one per consuming queue.
pub fn registries<B: Backend>(state: &AppState<B>) -> Vec<(&'static str, HandlerRegistry)> {
    let mut orders = HandlerRegistry::new();
    saga::handlers::register_handlers(&mut orders, state.orchestrator.clone());

    let mut refunds = HandlerRegistry::new();
    saga::handlers::register_refund_handler(&mut refunds, state.payments.clone());

    let mut inventory = HandlerRegistry::new();
    inventory::handlers::register_handlers(&mut inventory, state.inventory.clone());

    let mut discounts = HandlerRegistry::new();
    discount::handlers::register_handlers(&mut discounts, state.discounts.clone());

    vec![
        (saga::handlers::QUEUE, orders),
        (saga::handlers::REFUND_QUEUE, refunds),
        (inventory::handlers::QUEUE, inventory),
        (discount::handlers::QUEUE, discounts),
    ]
}

/// Spawns every worker. Each one stops once `shutdown` flips to true.
pub fn spawn_workers<B: Backend>(
    state: &Arc<AppState<B>>,
    config: &Config,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();

    for (queue, registry) in registries(state) {
        let consumer = Consumer::new(
            state.connection.clone(),
            Arc::new(registry),
            config.consumer_config(queue),
        );
        handles.push(tokio::spawn(consumer.run(shutdown.clone())));
    }

    handles.push(tokio::spawn(
        state
            .relay
            .clone()
            .run(config.outbox_poll_interval, shutdown.clone()),
    ));

    let sweeper = ExpirationSweeper::new(state.inventory.clone(), config.sweep_interval);
    handles.push(tokio::spawn(sweeper.run(shutdown)));

    tracing::info!(workers = handles.len(), "background workers started");
    handles
}
