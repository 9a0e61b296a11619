//! Transactional store port.
//!
//! The fulfillment core reads and writes products, inventory records, orders
//! and sales through [`Store`]. Anything that mutates stock goes through a
//! [`StoreTransaction`]: rows are locked on read (`lock_*`), writes are staged,
//! and nothing becomes visible until [`StoreTransaction::commit`]. Dropping a
//! transaction without committing rolls it back.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::aggregates::{InventoryRecord, Order, Product, Sale, StockLedger};
use crate::Result;

pub mod memory;
pub mod postgres;

pub use memory::InMemoryStore;
pub use postgres::PgStore;

#[async_trait]
pub trait Store: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>>;

    async fn insert_product(&self, product: &Product, inventory: Option<&InventoryRecord>) -> Result<()>;

    async fn find_products(&self, ids: &[Uuid]) -> Result<Vec<Product>>;

    /// Unlocked snapshot of a product's ledger.
    async fn stock_ledger(&self, product_id: Uuid) -> Result<Option<StockLedger>>;

    /// Unlocked snapshots of every live product that has an inventory
    /// record, ordered by product id.
    async fn inventories(&self) -> Result<Vec<StockLedger>>;

    /// Marks a product deleted. `false` when there is no live product with
    /// that id. Takes the product's row lock, so it waits for in-flight
    /// stock changes.
    async fn soft_delete_product(&self, product_id: Uuid) -> Result<bool>;

    async fn insert_order(&self, order: &Order) -> Result<()>;

    async fn find_order(&self, order_id: Uuid) -> Result<Option<Order>>;

    /// Sales with `start <= sale_date <= end`, oldest first.
    async fn sales_between(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<Sale>>;

    async fn sales_for_order(&self, order_id: Uuid) -> Result<Vec<Sale>>;
}

#[async_trait]
pub trait StoreTransaction: Send {
    /// Locks the order row for the rest of the transaction.
    async fn lock_order(&mut self, order_id: Uuid) -> Result<Option<Order>>;

    /// Locks the product row (and with it, its inventory record). `None` when
    /// the product does not exist.
    async fn lock_ledger(&mut self, product_id: Uuid) -> Result<Option<StockLedger>>;

    /// Stages both projections of a ledger locked by this transaction.
    async fn save_ledger(&mut self, ledger: &StockLedger) -> Result<()>;

    async fn insert_sale(&mut self, sale: &Sale) -> Result<()>;

    /// Stages status and transaction id of an order locked by this transaction.
    async fn save_order(&mut self, order: &Order) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;
}
