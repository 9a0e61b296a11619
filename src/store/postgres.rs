//! Postgres store (sqlx).
//!
//! Product rows are locked with `FOR UPDATE OF p`; the inventory record is
//! only ever written while its product row is locked, so one lock guards both
//! projections.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, Postgres};
use sqlx::Transaction;
use uuid::Uuid;

use crate::domain::aggregates::{InventoryRecord, Order, OrderLine, OrderStatus, Product, Sale, StockLedger};
use crate::domain::value_objects::Money;
use crate::{FulfillmentError, Result};

use super::{Store, StoreTransaction};

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self { Self { pool } }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| FulfillmentError::Persistence(e.to_string()))
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ProductRow {
    id: Uuid,
    name: String,
    stock: i64,
    cost_price: Decimal,
    selling_price: Decimal,
    currency: String,
    is_deleted: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<ProductRow> for Product {
    fn from(r: ProductRow) -> Self {
        Product::restore(
            r.id, r.name, r.stock,
            Money::new(r.cost_price, &r.currency), Money::new(r.selling_price, &r.currency),
            r.is_deleted, r.created_at, r.updated_at,
        )
    }
}

#[derive(Debug, sqlx::FromRow)]
struct LedgerRow {
    stock: i64,
    is_deleted: bool,
    stock_available: Option<i64>,
    stock_sold: Option<i64>,
}

impl LedgerRow {
    fn into_ledger(self, product_id: Uuid) -> StockLedger {
        let inventory = match (self.stock_available, self.stock_sold) {
            (Some(stock_available), Some(stock_sold)) => Some(InventoryRecord { product_id, stock_available, stock_sold }),
            _ => None,
        };
        StockLedger::new(product_id, self.stock, inventory, self.is_deleted)
    }
}

#[derive(Debug, sqlx::FromRow)]
struct OrderRow {
    id: Uuid,
    user_id: Uuid,
    status: String,
    total: Decimal,
    currency: String,
    transaction_id: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
struct OrderLineRow {
    product_id: Uuid,
    quantity: i32,
    unit_price: Decimal,
    currency: String,
}

impl OrderRow {
    fn into_order(self, lines: Vec<OrderLineRow>) -> Result<Order> {
        let status = OrderStatus::parse(&self.status)
            .ok_or_else(|| FulfillmentError::Persistence(format!("unknown order status {}", self.status)))?;
        let lines = lines
            .into_iter()
            .map(|l| {
                let quantity = u32::try_from(l.quantity)
                    .map_err(|_| FulfillmentError::Persistence(format!("negative quantity on order {}", self.id)))?;
                Ok(OrderLine::new(l.product_id, quantity, Money::new(l.unit_price, &l.currency)))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Order::restore(
            self.id, self.user_id, status, lines, Money::new(self.total, &self.currency),
            self.transaction_id, self.created_at, self.updated_at,
        ))
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SaleRow {
    id: Uuid,
    order_id: Uuid,
    user_id: Uuid,
    product_id: Uuid,
    quantity: i32,
    sale_date: DateTime<Utc>,
    start_date: DateTime<Utc>,
    end_date: DateTime<Utc>,
    total_amount: Decimal,
    currency: String,
}

impl TryFrom<SaleRow> for Sale {
    type Error = FulfillmentError;

    fn try_from(r: SaleRow) -> Result<Self> {
        let quantity = u32::try_from(r.quantity)
            .map_err(|_| FulfillmentError::Persistence(format!("negative quantity {} on sale {}", r.quantity, r.id)))?;
        Ok(Sale {
            id: r.id,
            order_id: r.order_id,
            user_id: r.user_id,
            product_id: r.product_id,
            quantity,
            sale_date: r.sale_date,
            start_date: r.start_date,
            end_date: r.end_date,
            total_amount: Money::new(r.total_amount, &r.currency),
        })
    }
}

/// Quantities are stored as `INTEGER`.
fn storable_quantity(quantity: u32) -> Result<i32> {
    i32::try_from(quantity).map_err(|_| FulfillmentError::InvalidQuantity(format!("{quantity} exceeds storable range")))
}

#[derive(Debug, sqlx::FromRow)]
struct InventoryRow {
    product_id: Uuid,
    stock: i64,
    stock_available: i64,
    stock_sold: i64,
}

impl From<InventoryRow> for StockLedger {
    fn from(r: InventoryRow) -> Self {
        let inventory = InventoryRecord { product_id: r.product_id, stock_available: r.stock_available, stock_sold: r.stock_sold };
        StockLedger::new(r.product_id, r.stock, Some(inventory), false)
    }
}

const LEDGER_SQL: &str = "SELECT p.stock, p.is_deleted, i.stock_available, i.stock_sold \
    FROM products p LEFT JOIN inventories i ON i.product_id = p.id WHERE p.id = $1";
const SALE_COLUMNS: &str = "id, order_id, user_id, product_id, quantity, sale_date, start_date, end_date, total_amount, currency";

#[async_trait]
impl Store for PgStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTransaction { tx }))
    }

    async fn insert_product(&self, product: &Product, inventory: Option<&InventoryRecord>) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT INTO products (id, name, stock, cost_price, selling_price, currency, is_deleted, created_at, updated_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)")
            .bind(product.id()).bind(product.name()).bind(product.stock())
            .bind(product.cost_price().amount()).bind(product.selling_price().amount()).bind(product.selling_price().currency())
            .bind(product.is_deleted()).bind(product.created_at()).bind(product.updated_at())
            .execute(&mut *tx).await?;
        if let Some(inv) = inventory {
            sqlx::query("INSERT INTO inventories (product_id, stock_available, stock_sold) VALUES ($1, $2, $3)")
                .bind(inv.product_id).bind(inv.stock_available).bind(inv.stock_sold)
                .execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn find_products(&self, ids: &[Uuid]) -> Result<Vec<Product>> {
        let rows = sqlx::query_as::<_, ProductRow>("SELECT id, name, stock, cost_price, selling_price, currency, is_deleted, created_at, updated_at FROM products WHERE id = ANY($1)")
            .bind(ids).fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(Product::from).collect())
    }

    async fn stock_ledger(&self, product_id: Uuid) -> Result<Option<StockLedger>> {
        let row = sqlx::query_as::<_, LedgerRow>(LEDGER_SQL).bind(product_id).fetch_optional(&self.pool).await?;
        Ok(row.map(|r| r.into_ledger(product_id)))
    }

    async fn inventories(&self) -> Result<Vec<StockLedger>> {
        let rows = sqlx::query_as::<_, InventoryRow>("SELECT p.id AS product_id, p.stock, i.stock_available, i.stock_sold FROM products p JOIN inventories i ON i.product_id = p.id WHERE NOT p.is_deleted ORDER BY p.id")
            .fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(StockLedger::from).collect())
    }

    async fn soft_delete_product(&self, product_id: Uuid) -> Result<bool> {
        let done = sqlx::query("UPDATE products SET is_deleted = TRUE, updated_at = NOW() WHERE id = $1 AND NOT is_deleted")
            .bind(product_id).execute(&self.pool).await?;
        Ok(done.rows_affected() == 1)
    }

    async fn insert_order(&self, order: &Order) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT INTO orders (id, user_id, status, total, currency, transaction_id, created_at, updated_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)")
            .bind(order.id()).bind(order.user_id()).bind(order.status().as_str())
            .bind(order.total().amount()).bind(order.total().currency()).bind(order.transaction_id())
            .bind(order.created_at()).bind(order.updated_at())
            .execute(&mut *tx).await?;
        for (position, line) in order.lines().iter().enumerate() {
            let quantity = storable_quantity(line.quantity)?;
            sqlx::query("INSERT INTO order_lines (order_id, position, product_id, quantity, unit_price, currency) VALUES ($1, $2, $3, $4, $5, $6)")
                .bind(order.id()).bind(position as i32).bind(line.product_id).bind(quantity)
                .bind(line.unit_price.amount()).bind(line.unit_price.currency())
                .execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn find_order(&self, order_id: Uuid) -> Result<Option<Order>> {
        let Some(row) = sqlx::query_as::<_, OrderRow>("SELECT id, user_id, status, total, currency, transaction_id, created_at, updated_at FROM orders WHERE id = $1")
            .bind(order_id).fetch_optional(&self.pool).await?
        else {
            return Ok(None);
        };
        let lines = sqlx::query_as::<_, OrderLineRow>("SELECT product_id, quantity, unit_price, currency FROM order_lines WHERE order_id = $1 ORDER BY position")
            .bind(order_id).fetch_all(&self.pool).await?;
        row.into_order(lines).map(Some)
    }

    async fn sales_between(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<Sale>> {
        let sql = format!("SELECT {SALE_COLUMNS} FROM sales WHERE sale_date >= $1 AND sale_date <= $2 ORDER BY sale_date");
        let rows = sqlx::query_as::<_, SaleRow>(&sql).bind(start).bind(end).fetch_all(&self.pool).await?;
        rows.into_iter().map(Sale::try_from).collect()
    }

    async fn sales_for_order(&self, order_id: Uuid) -> Result<Vec<Sale>> {
        let sql = format!("SELECT {SALE_COLUMNS} FROM sales WHERE order_id = $1 ORDER BY sale_date");
        let rows = sqlx::query_as::<_, SaleRow>(&sql).bind(order_id).fetch_all(&self.pool).await?;
        rows.into_iter().map(Sale::try_from).collect()
    }
}

struct PgTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTransaction for PgTransaction {
    async fn lock_order(&mut self, order_id: Uuid) -> Result<Option<Order>> {
        let Some(row) = sqlx::query_as::<_, OrderRow>("SELECT id, user_id, status, total, currency, transaction_id, created_at, updated_at FROM orders WHERE id = $1 FOR UPDATE")
            .bind(order_id).fetch_optional(&mut *self.tx).await?
        else {
            return Ok(None);
        };
        let lines = sqlx::query_as::<_, OrderLineRow>("SELECT product_id, quantity, unit_price, currency FROM order_lines WHERE order_id = $1 ORDER BY position")
            .bind(order_id).fetch_all(&mut *self.tx).await?;
        row.into_order(lines).map(Some)
    }

    async fn lock_ledger(&mut self, product_id: Uuid) -> Result<Option<StockLedger>> {
        let sql = format!("{LEDGER_SQL} FOR UPDATE OF p");
        let row = sqlx::query_as::<_, LedgerRow>(&sql).bind(product_id).fetch_optional(&mut *self.tx).await?;
        Ok(row.map(|r| r.into_ledger(product_id)))
    }

    async fn save_ledger(&mut self, ledger: &StockLedger) -> Result<()> {
        sqlx::query("UPDATE products SET stock = $2, updated_at = NOW() WHERE id = $1")
            .bind(ledger.product_id()).bind(ledger.product_stock())
            .execute(&mut *self.tx).await?;
        if let Some(inv) = ledger.inventory() {
            sqlx::query("INSERT INTO inventories (product_id, stock_available, stock_sold) VALUES ($1, $2, $3) ON CONFLICT (product_id) DO UPDATE SET stock_available = EXCLUDED.stock_available, stock_sold = EXCLUDED.stock_sold")
                .bind(inv.product_id).bind(inv.stock_available).bind(inv.stock_sold)
                .execute(&mut *self.tx).await?;
        }
        Ok(())
    }

    async fn insert_sale(&mut self, sale: &Sale) -> Result<()> {
        let quantity = storable_quantity(sale.quantity)?;
        let sql = format!("INSERT INTO sales ({SALE_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)");
        sqlx::query(&sql)
            .bind(sale.id).bind(sale.order_id).bind(sale.user_id).bind(sale.product_id)
            .bind(quantity)
            .bind(sale.sale_date).bind(sale.start_date).bind(sale.end_date)
            .bind(sale.total_amount.amount()).bind(sale.total_amount.currency())
            .execute(&mut *self.tx).await?;
        Ok(())
    }

    async fn save_order(&mut self, order: &Order) -> Result<()> {
        sqlx::query("UPDATE orders SET status = $2, transaction_id = $3, updated_at = $4 WHERE id = $1")
            .bind(order.id()).bind(order.status().as_str()).bind(order.transaction_id()).bind(order.updated_at())
            .execute(&mut *self.tx).await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sale_row(quantity: i32) -> SaleRow {
        let now = Utc::now();
        SaleRow {
            id: Uuid::new_v4(),
            order_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            product_id: Uuid::new_v4(),
            quantity,
            sale_date: now,
            start_date: now,
            end_date: now,
            total_amount: Decimal::new(1500, 2),
            currency: "USD".to_string(),
        }
    }

    #[test]
    fn test_sale_row_keeps_quantity() {
        let sale = Sale::try_from(sale_row(3)).unwrap();
        assert_eq!(sale.quantity, 3);
        assert_eq!(sale.total_amount.amount(), Decimal::new(1500, 2));
    }

    #[test]
    fn test_negative_sale_quantity_is_rejected() {
        let err = Sale::try_from(sale_row(-2)).unwrap_err();
        assert!(matches!(err, FulfillmentError::Persistence(ref msg) if msg.contains("-2")));
    }

    #[test]
    fn test_oversized_quantity_is_not_clamped() {
        assert_eq!(storable_quantity(7).unwrap(), 7);
        let err = storable_quantity(u32::MAX).unwrap_err();
        assert!(matches!(err, FulfillmentError::InvalidQuantity(_)));
    }

    #[test]
    fn test_negative_line_quantity_is_rejected() {
        let now = Utc::now();
        let order = OrderRow {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            status: "Pending".to_string(),
            total: Decimal::ZERO,
            currency: "USD".to_string(),
            transaction_id: None,
            created_at: now,
            updated_at: now,
        };
        let line = OrderLineRow { product_id: Uuid::new_v4(), quantity: -1, unit_price: Decimal::ONE, currency: "USD".to_string() };
        assert!(matches!(order.into_order(vec![line]), Err(FulfillmentError::Persistence(_))));
    }
}
