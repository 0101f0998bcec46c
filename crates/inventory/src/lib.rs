//! Inventory reservation engine.
//!
//! Owns the stock ledger. Reservations hold stock for an order without touching
//! on-hand quantity; commit turns the hold into a deduction, release and expiry
//! drop it, and return puts committed stock back on hand. Every quantity change
//! leaves an [`InventoryTransaction`] behind.
//!
//! Available stock never goes negative: check-and-reserve is a single atomic write
//! against the item version that was read, retried a bounded number of times when
//! another reservation got in first.

pub mod engine;
pub mod error;
pub mod handlers;
pub mod ledger;
pub mod model;
pub mod sweeper;

pub use engine::{EngineConfig, ReservationEngine};
pub use error::{InventoryError, Result};
pub use ledger::{InMemoryLedger, PostgresLedger, StockLedger};
pub use model::{
    Allocation, InventoryTransaction, ItemAvailability, OperationOutcome, ReservationLine,
    ReservationReceipt, ReservationStatus, Reserved, ReturnLine, Shortfall, StockCheck, StockItem,
    StockKey, StockReservation, TransactionKind,
};
pub use sweeper::ExpirationSweeper;
