//! Sale Recorder and sales reporting.
//!
//! Recording only appends; reporting only reads. Neither touches stock.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::aggregates::{Order, OrderLine, Sale};
use crate::store::{Store, StoreTransaction};
use crate::Result;

/// Inclusive reporting period.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Period {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SalesComparison {
    pub total_sales_this_period: usize,
    pub total_sales_previous_period: usize,
    pub revenue_this_period: Decimal,
    pub revenue_previous_period: Decimal,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyRevenue {
    pub date: NaiveDate,
    pub total_revenue: Decimal,
}

/// Per-day totals priced from the product catalog.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DailySales {
    pub date: NaiveDate,
    pub total_amount: Decimal,
    pub cost_price: Decimal,
    pub selling_price: Decimal,
    pub total_profit: Decimal,
    pub total_products_sold: u64,
}

#[derive(Clone)]
pub struct SaleRecorder {
    store: Arc<dyn Store>,
}

impl SaleRecorder {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Stages the sale for one fulfilled line. The caller has already
    /// committed to the stock mutation in the same transaction.
    pub async fn record_sale(
        &self,
        tx: &mut dyn StoreTransaction,
        order: &Order,
        line: &OrderLine,
        now: DateTime<Utc>,
    ) -> Result<Sale> {
        let sale = Sale::record(order.id(), order.user_id(), line.product_id, line.quantity, line.line_total(), now);
        tx.insert_sale(&sale).await?;
        tracing::debug!(sale_id = %sale.id, order_id = %sale.order_id, amount = %sale.total_amount, "sale staged");
        Ok(sale)
    }

    pub async fn sales_between(&self, period: Period) -> Result<Vec<Sale>> {
        self.store.sales_between(period.start, period.end).await
    }

    pub async fn sales_for_order(&self, order_id: Uuid) -> Result<Vec<Sale>> {
        self.store.sales_for_order(order_id).await
    }

    pub async fn compare_periods(&self, current: Period, previous: Period) -> Result<SalesComparison> {
        let this = self.sales_between(current).await?;
        let prev = self.sales_between(previous).await?;
        Ok(SalesComparison {
            total_sales_this_period: this.len(),
            total_sales_previous_period: prev.len(),
            revenue_this_period: revenue(&this),
            revenue_previous_period: revenue(&prev),
        })
    }

    pub async fn revenue_between(&self, period: Period) -> Result<Decimal> {
        Ok(revenue(&self.sales_between(period).await?))
    }

    pub async fn daily_revenue(&self, period: Period) -> Result<Vec<DailyRevenue>> {
        let mut days: BTreeMap<NaiveDate, Decimal> = BTreeMap::new();
        for sale in self.sales_between(period).await? {
            *days.entry(sale.sale_date.date_naive()).or_default() += sale.total_amount.amount();
        }
        Ok(days.into_iter().map(|(date, total_revenue)| DailyRevenue { date, total_revenue }).collect())
    }

    /// Daily cost, selling value and profit using current product prices.
    /// Sales whose product no longer exists count toward revenue only.
    pub async fn daily_sales(&self, period: Period) -> Result<Vec<DailySales>> {
        let sales = self.sales_between(period).await?;
        let mut ids: Vec<Uuid> = sales.iter().map(|s| s.product_id).collect();
        ids.sort_unstable();
        ids.dedup();
        let prices: HashMap<Uuid, (Decimal, Decimal)> = self
            .store
            .find_products(&ids)
            .await?
            .into_iter()
            .map(|p| (p.id(), (p.cost_price().amount(), p.selling_price().amount())))
            .collect();

        let mut days: BTreeMap<NaiveDate, DailySales> = BTreeMap::new();
        for sale in &sales {
            let date = sale.sale_date.date_naive();
            let day = days.entry(date).or_insert_with(|| DailySales {
                date,
                total_amount: Decimal::ZERO,
                cost_price: Decimal::ZERO,
                selling_price: Decimal::ZERO,
                total_profit: Decimal::ZERO,
                total_products_sold: 0,
            });
            let qty = Decimal::from(sale.quantity);
            day.total_amount += sale.total_amount.amount();
            day.total_products_sold += u64::from(sale.quantity);
            if let Some(&(cost, selling)) = prices.get(&sale.product_id) {
                day.cost_price += cost * qty;
                day.selling_price += selling * qty;
                day.total_profit += (selling - cost) * qty;
            }
        }
        Ok(days.into_values().collect())
    }
}

fn revenue(sales: &[Sale]) -> Decimal {
    sales.iter().map(|s| s.total_amount.amount()).sum()
}
