//! Order Aggregate

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use crate::domain::value_objects::{Money, MoneyError};
use crate::domain::events::{DomainEvent, OrderEvent};

#[derive(Clone, Debug, PartialEq)]
pub struct Order {
    id: Uuid,
    user_id: Uuid,
    status: OrderStatus,
    lines: Vec<OrderLine>,
    total: Money,
    transaction_id: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    events: Vec<DomainEvent>,
}

/// Immutable once the order exists.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    pub product_id: Uuid,
    pub quantity: u32,
    pub unit_price: Money,
}

impl OrderLine {
    pub fn new(product_id: Uuid, quantity: u32, unit_price: Money) -> Self {
        Self { product_id, quantity, unit_price }
    }
    pub fn line_total(&self) -> Money { self.unit_price.multiply(self.quantity) }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderStatus { #[default] Pending, Paid, Fulfilled, Cancelled }

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Paid => "Paid",
            Self::Fulfilled => "Fulfilled",
            Self::Cancelled => "Cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        [Self::Pending, Self::Paid, Self::Fulfilled, Self::Cancelled]
            .into_iter()
            .find(|st| st.as_str().eq_ignore_ascii_case(s))
    }

    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        if self.is_terminal() {
            return false;
        }
        matches!((self, next), (Pending, Paid) | (_, Cancelled) | (_, Fulfilled))
    }

    pub fn is_terminal(&self) -> bool { matches!(self, Self::Fulfilled | Self::Cancelled) }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OrderError {
    #[error("order has no lines")]
    NoItems,
    #[error("line for product {0} has zero quantity")]
    ZeroQuantity(Uuid),
    #[error("order {order_id} cannot move from {from:?} to {to:?}")]
    InvalidTransition { order_id: Uuid, from: OrderStatus, to: OrderStatus },
    #[error(transparent)]
    Money(#[from] MoneyError),
}

impl Order {
    pub fn place(user_id: Uuid, lines: Vec<OrderLine>) -> Result<Self, OrderError> {
        let first = lines.first().ok_or(OrderError::NoItems)?;
        if let Some(line) = lines.iter().find(|l| l.quantity == 0) {
            return Err(OrderError::ZeroQuantity(line.product_id));
        }
        let totals: Vec<Money> = lines.iter().map(OrderLine::line_total).collect();
        let total = Money::sum(first.unit_price.currency(), &totals)?;
        let now = Utc::now();
        Ok(Self {
            id: Uuid::now_v7(), user_id, status: OrderStatus::Pending, lines, total,
            transaction_id: None, created_at: now, updated_at: now, events: vec![],
        })
    }

    /// Rebuilds an order from storage; raises no events.
    #[allow(clippy::too_many_arguments)]
    pub fn restore(
        id: Uuid, user_id: Uuid, status: OrderStatus, lines: Vec<OrderLine>, total: Money,
        transaction_id: Option<String>, created_at: DateTime<Utc>, updated_at: DateTime<Utc>,
    ) -> Self {
        Self { id, user_id, status, lines, total, transaction_id, created_at, updated_at, events: vec![] }
    }

    pub fn id(&self) -> Uuid { self.id }
    pub fn user_id(&self) -> Uuid { self.user_id }
    pub fn status(&self) -> OrderStatus { self.status }
    pub fn lines(&self) -> &[OrderLine] { &self.lines }
    pub fn total(&self) -> &Money { &self.total }
    pub fn transaction_id(&self) -> Option<&str> { self.transaction_id.as_deref() }
    pub fn created_at(&self) -> DateTime<Utc> { self.created_at }
    pub fn updated_at(&self) -> DateTime<Utc> { self.updated_at }

    pub fn attach_transaction(&mut self, transaction_id: impl Into<String>) {
        self.transaction_id = Some(transaction_id.into());
        self.touch();
    }

    pub fn transition(&mut self, next: OrderStatus) -> Result<(), OrderError> {
        if !self.status.can_transition_to(next) {
            return Err(OrderError::InvalidTransition { order_id: self.id, from: self.status, to: next });
        }
        self.status = next;
        self.touch();
        self.raise_event(DomainEvent::Order(self.summary_event()));
        Ok(())
    }

    pub fn summary_event(&self) -> OrderEvent {
        OrderEvent {
            order_id: self.id,
            status: self.status,
            line_count: self.lines.len(),
            total_amount: self.total.amount(),
            currency: self.total.currency().to_string(),
            transaction_id: self.transaction_id.clone(),
        }
    }

    pub fn take_events(&mut self) -> Vec<DomainEvent> { std::mem::take(&mut self.events) }
    fn raise_event(&mut self, e: DomainEvent) { self.events.push(e); }
    fn touch(&mut self) { self.updated_at = Utc::now(); }
}
