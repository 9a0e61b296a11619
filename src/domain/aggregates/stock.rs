//! Stock Ledger
//!
//! A product's stock lives in two stored projections: the canonical
//! `Product.stock` and the inventory record's `stock_available` / `stock_sold`
//! counters. [`StockLedger`] holds both and is the only place either changes,
//! so they always move in lockstep.
//!
//! Counters after any sequence of sales and restocks satisfy:
//! - `product_stock == stock_available`
//! - `stock_available + stock_sold == everything ever received`
//! - no counter is ever negative

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryRecord {
    pub product_id: Uuid,
    pub stock_available: i64,
    pub stock_sold: i64,
}

/// Post-mutation snapshot of both projections.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockLevels {
    pub product_id: Uuid,
    pub product_stock: i64,
    pub stock_available: i64,
    pub stock_sold: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StockError {
    #[error("product {0} is deleted")]
    ProductDeleted(Uuid),
    #[error("no inventory record for product {0}")]
    InventoryMissing(Uuid),
    #[error("inventory record for product {0} already exists")]
    InventoryExists(Uuid),
    #[error("insufficient stock for product {product_id}: requested {requested}, available {available}")]
    Insufficient { product_id: Uuid, requested: i64, available: i64 },
    #[error("invalid stock delta {delta} for product {product_id}")]
    InvalidDelta { product_id: Uuid, delta: i64 },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StockLedger {
    product_id: Uuid,
    product_stock: i64,
    inventory: Option<InventoryRecord>,
    deleted: bool,
}

impl StockLedger {
    pub fn new(product_id: Uuid, product_stock: i64, inventory: Option<InventoryRecord>, deleted: bool) -> Self {
        Self { product_id, product_stock, inventory, deleted }
    }

    pub fn product_id(&self) -> Uuid { self.product_id }
    pub fn product_stock(&self) -> i64 { self.product_stock }
    pub fn inventory(&self) -> Option<&InventoryRecord> { self.inventory.as_ref() }
    pub fn is_deleted(&self) -> bool { self.deleted }

    /// Quantity that may be sold right now. The stricter projection wins.
    pub fn sellable(&self) -> i64 {
        match &self.inventory {
            Some(inv) => self.product_stock.min(inv.stock_available).max(0),
            None => 0,
        }
    }

    pub fn levels(&self) -> Option<StockLevels> {
        self.inventory.as_ref().map(|inv| StockLevels {
            product_id: self.product_id,
            product_stock: self.product_stock,
            stock_available: inv.stock_available,
            stock_sold: inv.stock_sold,
        })
    }

    /// Validates `delta` without mutating anything.
    pub fn check(&self, delta: i64) -> Result<(), StockError> {
        if self.deleted {
            return Err(StockError::ProductDeleted(self.product_id));
        }
        if delta == 0 || delta == i64::MIN {
            return Err(StockError::InvalidDelta { product_id: self.product_id, delta });
        }
        if delta > 0 {
            return match self.product_stock.checked_add(delta) {
                Some(_) => Ok(()),
                None => Err(StockError::InvalidDelta { product_id: self.product_id, delta }),
            };
        }
        if self.inventory.is_none() {
            return Err(StockError::InventoryMissing(self.product_id));
        }
        let requested = -delta;
        let available = self.sellable();
        if available < requested {
            return Err(StockError::Insufficient { product_id: self.product_id, requested, available });
        }
        Ok(())
    }

    /// Applies `delta` to both projections. Negative deltas are sales, positive
    /// deltas are restocks. A restock on a product without an inventory record
    /// opens one seeded from the product stock.
    pub fn apply(&mut self, delta: i64) -> Result<StockLevels, StockError> {
        self.check(delta)?;
        self.product_stock += delta;
        match self.inventory.as_mut() {
            Some(inv) if delta < 0 => {
                inv.stock_available += delta;
                inv.stock_sold -= delta;
            }
            Some(inv) => inv.stock_available += delta,
            None => {
                self.inventory = Some(InventoryRecord {
                    product_id: self.product_id,
                    stock_available: self.product_stock,
                    stock_sold: 0,
                })
            }
        }
        self.levels().ok_or(StockError::InventoryMissing(self.product_id))
    }

    /// Opens the inventory record for this product from its current stock.
    pub fn open_inventory(&mut self) -> Result<StockLevels, StockError> {
        if self.deleted {
            return Err(StockError::ProductDeleted(self.product_id));
        }
        if self.inventory.is_some() {
            return Err(StockError::InventoryExists(self.product_id));
        }
        self.inventory = Some(InventoryRecord {
            product_id: self.product_id,
            stock_available: self.product_stock,
            stock_sold: 0,
        });
        self.levels().ok_or(StockError::InventoryMissing(self.product_id))
    }
}
