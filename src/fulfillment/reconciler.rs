//! Stock Reconciler
//!
//! Every stock mutation goes through here. Products are always locked in
//! ascending id order so two transactions touching overlapping products
//! cannot deadlock.

use std::collections::BTreeMap;
use std::sync::Arc;

use uuid::Uuid;

use crate::domain::aggregates::{StockLedger, StockLevels};
use crate::store::{Store, StoreTransaction};
use crate::{FulfillmentError, Result};

#[derive(Clone)]
pub struct StockReconciler {
    store: Arc<dyn Store>,
}

impl StockReconciler {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Applies one delta in its own transaction. Negative deltas are sales.
    pub async fn reconcile(&self, product_id: Uuid, delta: i64) -> Result<StockLevels> {
        let mut tx = self.store.begin().await?;
        let mut levels = self.apply_all(tx.as_mut(), &BTreeMap::from([(product_id, delta)])).await?;
        tx.commit().await?;
        let levels = levels.remove(&product_id).ok_or(FulfillmentError::ProductNotFound(product_id))?;
        tracing::info!(
            product_id = %product_id,
            delta,
            stock = levels.product_stock,
            available = levels.stock_available,
            sold = levels.stock_sold,
            "stock reconciled"
        );
        Ok(levels)
    }

    pub async fn restock(&self, product_id: Uuid, quantity: u32) -> Result<StockLevels> {
        if quantity == 0 {
            return Err(FulfillmentError::InvalidQuantity("restock quantity must be positive".into()));
        }
        self.reconcile(product_id, i64::from(quantity)).await
    }

    /// Opens the inventory record for a product from its current stock.
    /// Fails if one already exists.
    pub async fn create_inventory_record(&self, product_id: Uuid) -> Result<StockLevels> {
        let mut tx = self.store.begin().await?;
        let mut ledger = lock(tx.as_mut(), product_id).await?;
        let levels = ledger.open_inventory()?;
        tx.save_ledger(&ledger).await?;
        tx.commit().await?;
        tracing::info!(product_id = %product_id, stock = levels.product_stock, "inventory record created");
        Ok(levels)
    }

    pub async fn levels(&self, product_id: Uuid) -> Result<StockLevels> {
        let ledger = self
            .store
            .stock_ledger(product_id)
            .await?
            .filter(|l| !l.is_deleted())
            .ok_or(FulfillmentError::ProductNotFound(product_id))?;
        ledger.levels().ok_or(FulfillmentError::InventoryNotFound(product_id))
    }

    /// Levels of every live product with an inventory record.
    pub async fn all_levels(&self) -> Result<Vec<StockLevels>> {
        Ok(self.store.inventories().await?.iter().filter_map(StockLedger::levels).collect())
    }

    /// Locks and validates every product in `deltas` before applying any of
    /// them, then stages the results in `tx`. Nothing is staged when a single
    /// product fails.
    pub async fn apply_all(
        &self,
        tx: &mut dyn StoreTransaction,
        deltas: &BTreeMap<Uuid, i64>,
    ) -> Result<BTreeMap<Uuid, StockLevels>> {
        let mut ledgers = Vec::with_capacity(deltas.len());
        for (&product_id, &delta) in deltas {
            let ledger = lock(tx, product_id).await?;
            if let Err(e) = ledger.check(delta) {
                tracing::warn!(product_id = %product_id, delta, error = %e, "stock check failed");
                return Err(e.into());
            }
            ledgers.push((ledger, delta));
        }

        let mut levels = BTreeMap::new();
        for (mut ledger, delta) in ledgers {
            let after = ledger.apply(delta)?;
            tx.save_ledger(&ledger).await?;
            levels.insert(ledger.product_id(), after);
        }
        Ok(levels)
    }
}

async fn lock(tx: &mut dyn StoreTransaction, product_id: Uuid) -> Result<StockLedger> {
    tx.lock_ledger(product_id)
        .await?
        .filter(|l| !l.is_deleted())
        .ok_or(FulfillmentError::ProductNotFound(product_id))
}
