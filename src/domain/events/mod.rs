//! Domain events
//!
//! Transient payloads describing post-mutation state. They are never
//! persisted; the notification publisher serializes them onto the bus.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::domain::aggregates::{OrderStatus, StockLevels};

/// Fixed topic set on the message bus.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Topic {
    InventoryUpdates,
    SalesUpdates,
    OrderUpdates,
    ProductNew,
}

impl Topic {
    pub const ALL: [Topic; 4] = [Topic::InventoryUpdates, Topic::SalesUpdates, Topic::OrderUpdates, Topic::ProductNew];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InventoryUpdates => "inventory-updates",
            Self::SalesUpdates => "sales-updates",
            Self::OrderUpdates => "order-updates",
            Self::ProductNew => "product-new",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DomainEvent {
    Stock(StockEvent),
    Sale(SaleEvent),
    Order(OrderEvent),
    Product(ProductEvent),
}

impl DomainEvent {
    pub fn topic(&self) -> Topic {
        match self {
            Self::Stock(_) => Topic::InventoryUpdates,
            Self::Sale(_) => Topic::SalesUpdates,
            Self::Order(_) => Topic::OrderUpdates,
            Self::Product(_) => Topic::ProductNew,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockEvent {
    pub product_id: Uuid,
    pub product_stock: i64,
    pub stock_available: i64,
    pub stock_sold: i64,
}

impl From<StockLevels> for StockEvent {
    fn from(l: StockLevels) -> Self {
        Self {
            product_id: l.product_id,
            product_stock: l.product_stock,
            stock_available: l.stock_available,
            stock_sold: l.stock_sold,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaleEvent {
    pub sale_id: Uuid,
    pub order_id: Uuid,
    pub user_id: Uuid,
    pub product_id: Uuid,
    pub sale_date: DateTime<Utc>,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub total_amount: Decimal,
    pub currency: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderEvent {
    pub order_id: Uuid,
    pub status: OrderStatus,
    pub line_count: usize,
    pub total_amount: Decimal,
    pub currency: String,
    pub transaction_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductEvent {
    pub product_id: Uuid,
    pub name: String,
    pub stock: i64,
    pub selling_price: Decimal,
}
