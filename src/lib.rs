//! OpenSASE Fulfillment
//!
//! Stock-consistent order fulfillment with bus notifications.
//!
//! ## Features
//! - Stock ledger keeping product stock and inventory counters in lockstep
//! - All-or-nothing fulfillment with per-product row locking (no oversell)
//! - Append-only sale records and sales/revenue reporting
//! - Best-effort event notification over a reconnecting message bus

pub mod config;
pub mod domain;
pub mod fulfillment;
pub mod messaging;
pub mod store;

pub use config::Config;
pub use domain::aggregates::{InventoryRecord, Order, OrderError, OrderLine, OrderStatus, Product, Sale, StockLedger, StockLevels};
pub use domain::events::{DomainEvent, Topic};
pub use domain::value_objects::Money;
pub use fulfillment::{FulfillmentService, FulfillmentSummary, SaleRecorder, StockReconciler};
pub use messaging::{ConnectionManager, ConnectionState, NotificationPublisher};
pub use store::{InMemoryStore, PgStore, Store, StoreTransaction};

use thiserror::Error;
use uuid::Uuid;

use domain::aggregates::StockError;

// =============================================================================
// Error Types
// =============================================================================

/// Unified failure surfaced by every stock, order and sale operation.
#[derive(Error, Debug)]
pub enum FulfillmentError {
    #[error("product {0} not found")]
    ProductNotFound(Uuid),

    #[error("inventory record for product {0} not found")]
    InventoryNotFound(Uuid),

    #[error("order {0} not found")]
    OrderNotFound(Uuid),

    #[error("insufficient stock for product {product_id}: requested {requested}, available {available}")]
    InsufficientStock { product_id: Uuid, requested: i64, available: i64 },

    #[error("inventory record for product {0} already exists")]
    InventoryExists(Uuid),

    #[error("invalid quantity: {0}")]
    InvalidQuantity(String),

    #[error("invalid order: {0}")]
    InvalidOrder(#[from] OrderError),

    #[error("payment failed: {0}")]
    Payment(String),

    #[error("storage error: {0}")]
    Persistence(String),
}

impl FulfillmentError {
    /// True when the caller sent something wrong, as opposed to a store failure.
    pub fn is_client_error(&self) -> bool {
        !matches!(self, Self::Persistence(_) | Self::Payment(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::ProductNotFound(_) | Self::InventoryNotFound(_) | Self::OrderNotFound(_))
    }
}

impl From<StockError> for FulfillmentError {
    fn from(e: StockError) -> Self {
        match e {
            StockError::ProductDeleted(id) => Self::ProductNotFound(id),
            StockError::InventoryMissing(id) => Self::InventoryNotFound(id),
            StockError::InventoryExists(id) => Self::InventoryExists(id),
            StockError::Insufficient { product_id, requested, available } => {
                Self::InsufficientStock { product_id, requested, available }
            }
            e @ StockError::InvalidDelta { .. } => Self::InvalidQuantity(e.to_string()),
        }
    }
}

impl From<sqlx::Error> for FulfillmentError {
    fn from(e: sqlx::Error) -> Self { Self::Persistence(e.to_string()) }
}

pub type Result<T> = std::result::Result<T, FulfillmentError>;
