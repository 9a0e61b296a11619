//! Sale record
//!
//! Append-only. One row per fulfilled order line; never mutated after creation.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use crate::domain::value_objects::Money;
use crate::domain::events::SaleEvent;

/// Length of the comparison window opened by each sale.
pub const REPORTING_WINDOW_DAYS: i64 = 3;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sale {
    pub id: Uuid,
    pub order_id: Uuid,
    pub user_id: Uuid,
    pub product_id: Uuid,
    pub quantity: u32,
    pub sale_date: DateTime<Utc>,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub total_amount: Money,
}

impl Sale {
    pub fn record(order_id: Uuid, user_id: Uuid, product_id: Uuid, quantity: u32, total_amount: Money, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            order_id,
            user_id,
            product_id,
            quantity,
            sale_date: now,
            start_date: now,
            end_date: now + Duration::days(REPORTING_WINDOW_DAYS),
            total_amount,
        }
    }

    pub fn to_event(&self) -> SaleEvent {
        SaleEvent {
            sale_id: self.id,
            order_id: self.order_id,
            user_id: self.user_id,
            product_id: self.product_id,
            sale_date: self.sale_date,
            start_date: self.start_date,
            end_date: self.end_date,
            total_amount: self.total_amount.amount(),
            currency: self.total_amount.currency().to_string(),
        }
    }
}
