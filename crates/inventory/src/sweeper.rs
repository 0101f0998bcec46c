use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::Result;
use crate::engine::ReservationEngine;
use crate::ledger::StockLedger;

/// Periodically expires Pending reservations whose TTL ran out.
pub struct ExpirationSweeper<L: StockLedger> {
    engine: Arc<ReservationEngine<L>>,
    interval: Duration,
}

impl<L: StockLedger> ExpirationSweeper<L> {
    pub fn new(engine: Arc<ReservationEngine<L>>, interval: Duration) -> Self {
        Self { engine, interval }
    }

    /// Runs one pass and returns the number of reservations expired.
    pub async fn sweep_once(&self) -> Result<usize> {
        Ok(self.engine.expire_due().await?.len())
    }

    /// Sweeps every `interval` until `shutdown` flips to true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(interval_secs = self.interval.as_secs(), "expiration sweeper started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.sweep_once().await {
                        Ok(0) => {}
                        Ok(expired) => tracing::info!(expired, "expired stale reservations"),
                        Err(err) => tracing::warn!(error = %err, "expiration sweep failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("expiration sweeper stopped");
    }
}
