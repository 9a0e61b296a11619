//! In-memory store.
//!
//! Every product and order row sits behind its own `tokio::sync::Mutex`. A
//! transaction holds the owned guards of the rows it locked until it commits
//! or is dropped, which gives the same read-then-conditionally-write
//! semantics as `SELECT ... FOR UPDATE`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex as RowLock, OwnedMutexGuard};
use uuid::Uuid;

use crate::domain::aggregates::{InventoryRecord, Order, Product, Sale, StockLedger};
use crate::{FulfillmentError, Result};

use super::{Store, StoreTransaction};

type Row<T> = Arc<RowLock<T>>;

#[derive(Debug)]
struct ProductRow {
    product: Product,
    inventory: Option<InventoryRecord>,
}

impl ProductRow {
    fn ledger(&self) -> StockLedger {
        StockLedger::new(self.product.id(), self.product.stock(), self.inventory.clone(), self.product.is_deleted())
    }
}

#[derive(Debug, Default)]
struct Tables {
    products: RwLock<HashMap<Uuid, Row<ProductRow>>>,
    orders: RwLock<HashMap<Uuid, Row<Order>>>,
    sales: Mutex<Vec<Sale>>,
    fail_next_commit: AtomicBool,
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    tables: Arc<Tables>,
}

fn poisoned<E>(_: E) -> FulfillmentError {
    FulfillmentError::Persistence("in-memory table lock poisoned".to_string())
}

fn row<T>(table: &RwLock<HashMap<Uuid, Row<T>>>, id: Uuid) -> Result<Option<Row<T>>> {
    Ok(table.read().map_err(poisoned)?.get(&id).cloned())
}

impl InMemoryStore {
    pub fn new() -> Self { Self::default() }

    /// Makes the next commit fail with a persistence error.
    pub fn fail_next_commit(&self) {
        self.tables.fail_next_commit.store(true, Ordering::SeqCst);
    }

    pub fn order_count(&self) -> usize {
        self.tables.orders.read().map(|o| o.len()).unwrap_or_default()
    }

    /// Number of committed sale rows.
    pub fn sale_count(&self) -> usize {
        self.tables.sales.lock().map(|s| s.len()).unwrap_or_default()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>> {
        Ok(Box::new(MemoryTransaction {
            tables: Arc::clone(&self.tables),
            products: HashMap::new(),
            orders: HashMap::new(),
            ledgers: HashMap::new(),
            staged_orders: HashMap::new(),
            sales: Vec::new(),
        }))
    }

    async fn insert_product(&self, product: &Product, inventory: Option<&InventoryRecord>) -> Result<()> {
        let mut products = self.tables.products.write().map_err(poisoned)?;
        if products.contains_key(&product.id()) {
            return Err(FulfillmentError::Persistence(format!("duplicate product {}", product.id())));
        }
        let row = ProductRow { product: product.clone(), inventory: inventory.cloned() };
        products.insert(product.id(), Arc::new(RowLock::new(row)));
        Ok(())
    }

    async fn find_products(&self, ids: &[Uuid]) -> Result<Vec<Product>> {
        let mut found = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(r) = row(&self.tables.products, *id)? {
                found.push(r.lock().await.product.clone());
            }
        }
        Ok(found)
    }

    async fn stock_ledger(&self, product_id: Uuid) -> Result<Option<StockLedger>> {
        match row(&self.tables.products, product_id)? {
            Some(r) => Ok(Some(r.lock().await.ledger())),
            None => Ok(None),
        }
    }

    async fn inventories(&self) -> Result<Vec<StockLedger>> {
        let rows: Vec<Row<ProductRow>> = self.tables.products.read().map_err(poisoned)?.values().cloned().collect();
        let mut ledgers = Vec::new();
        for r in rows {
            let row = r.lock().await;
            if row.inventory.is_some() && !row.product.is_deleted() {
                ledgers.push(row.ledger());
            }
        }
        ledgers.sort_by_key(StockLedger::product_id);
        Ok(ledgers)
    }

    async fn soft_delete_product(&self, product_id: Uuid) -> Result<bool> {
        let Some(r) = row(&self.tables.products, product_id)? else { return Ok(false) };
        let mut row = r.lock().await;
        if row.product.is_deleted() {
            return Ok(false);
        }
        row.product.soft_delete();
        Ok(true)
    }

    async fn insert_order(&self, order: &Order) -> Result<()> {
        let mut orders = self.tables.orders.write().map_err(poisoned)?;
        if orders.contains_key(&order.id()) {
            return Err(FulfillmentError::Persistence(format!("duplicate order {}", order.id())));
        }
        orders.insert(order.id(), Arc::new(RowLock::new(order.clone())));
        Ok(())
    }

    async fn find_order(&self, order_id: Uuid) -> Result<Option<Order>> {
        match row(&self.tables.orders, order_id)? {
            Some(r) => Ok(Some(r.lock().await.clone())),
            None => Ok(None),
        }
    }

    async fn sales_between(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<Sale>> {
        let sales = self.tables.sales.lock().map_err(poisoned)?;
        let mut hits: Vec<Sale> = sales.iter().filter(|s| s.sale_date >= start && s.sale_date <= end).cloned().collect();
        hits.sort_by_key(|s| s.sale_date);
        Ok(hits)
    }

    async fn sales_for_order(&self, order_id: Uuid) -> Result<Vec<Sale>> {
        let sales = self.tables.sales.lock().map_err(poisoned)?;
        Ok(sales.iter().filter(|s| s.order_id == order_id).cloned().collect())
    }
}

struct MemoryTransaction {
    tables: Arc<Tables>,
    products: HashMap<Uuid, OwnedMutexGuard<ProductRow>>,
    orders: HashMap<Uuid, OwnedMutexGuard<Order>>,
    ledgers: HashMap<Uuid, StockLedger>,
    staged_orders: HashMap<Uuid, Order>,
    sales: Vec<Sale>,
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn lock_order(&mut self, order_id: Uuid) -> Result<Option<Order>> {
        if let Some(staged) = self.staged_orders.get(&order_id) {
            return Ok(Some(staged.clone()));
        }
        if let Some(guard) = self.orders.get(&order_id) {
            return Ok(Some((**guard).clone()));
        }
        let Some(r) = row(&self.tables.orders, order_id)? else { return Ok(None) };
        let guard = r.lock_owned().await;
        let order = (*guard).clone();
        self.orders.insert(order_id, guard);
        Ok(Some(order))
    }

    async fn lock_ledger(&mut self, product_id: Uuid) -> Result<Option<StockLedger>> {
        if let Some(staged) = self.ledgers.get(&product_id) {
            return Ok(Some(staged.clone()));
        }
        if let Some(guard) = self.products.get(&product_id) {
            return Ok(Some(guard.ledger()));
        }
        let Some(r) = row(&self.tables.products, product_id)? else { return Ok(None) };
        let guard = r.lock_owned().await;
        let ledger = guard.ledger();
        self.products.insert(product_id, guard);
        Ok(Some(ledger))
    }

    async fn save_ledger(&mut self, ledger: &StockLedger) -> Result<()> {
        if !self.products.contains_key(&ledger.product_id()) {
            return Err(FulfillmentError::Persistence(format!("product {} not locked by transaction", ledger.product_id())));
        }
        self.ledgers.insert(ledger.product_id(), ledger.clone());
        Ok(())
    }

    async fn insert_sale(&mut self, sale: &Sale) -> Result<()> {
        self.sales.push(sale.clone());
        Ok(())
    }

    async fn save_order(&mut self, order: &Order) -> Result<()> {
        if !self.orders.contains_key(&order.id()) {
            return Err(FulfillmentError::Persistence(format!("order {} not locked by transaction", order.id())));
        }
        self.staged_orders.insert(order.id(), order.clone());
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        if self.tables.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(FulfillmentError::Persistence("commit rejected by store".to_string()));
        }
        // Take the sale table lock first so a poisoned table aborts before any row changes.
        let mut sales = self.tables.sales.lock().map_err(poisoned)?;
        for (id, ledger) in self.ledgers.drain() {
            if let Some(guard) = self.products.get_mut(&id) {
                guard.product.sync_stock(&ledger);
                guard.inventory = ledger.inventory().cloned();
            }
        }
        for (id, order) in self.staged_orders.drain() {
            if let Some(guard) = self.orders.get_mut(&id) {
                **guard = order;
            }
        }
        sales.append(&mut self.sales);
        Ok(())
    }
}
