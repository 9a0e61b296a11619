//! Product Aggregate

use chrono::{DateTime, Utc};
use uuid::Uuid;
use crate::domain::value_objects::Money;
use crate::domain::events::{DomainEvent, ProductEvent};
use super::StockLedger;

#[derive(Clone, Debug, PartialEq)]
pub struct Product {
    id: Uuid,
    name: String,
    stock: i64,
    cost_price: Money,
    selling_price: Money,
    deleted: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    events: Vec<DomainEvent>,
}

impl Product {
    pub fn create(name: impl Into<String>, stock: u32, cost_price: Money, selling_price: Money) -> Self {
        let now = Utc::now();
        let mut product = Self {
            id: Uuid::now_v7(), name: name.into(), stock: i64::from(stock),
            cost_price, selling_price, deleted: false, created_at: now, updated_at: now, events: vec![],
        };
        product.raise_event(DomainEvent::Product(ProductEvent {
            product_id: product.id,
            name: product.name.clone(),
            stock: product.stock,
            selling_price: product.selling_price.amount(),
        }));
        product
    }

    /// Rebuilds a product from storage; raises no events.
    #[allow(clippy::too_many_arguments)]
    pub fn restore(
        id: Uuid, name: String, stock: i64, cost_price: Money, selling_price: Money,
        deleted: bool, created_at: DateTime<Utc>, updated_at: DateTime<Utc>,
    ) -> Self {
        Self { id, name, stock, cost_price, selling_price, deleted, created_at, updated_at, events: vec![] }
    }

    pub fn id(&self) -> Uuid { self.id }
    pub fn name(&self) -> &str { &self.name }
    pub fn stock(&self) -> i64 { self.stock }
    pub fn cost_price(&self) -> &Money { &self.cost_price }
    pub fn selling_price(&self) -> &Money { &self.selling_price }
    pub fn is_deleted(&self) -> bool { self.deleted }
    pub fn created_at(&self) -> DateTime<Utc> { self.created_at }
    pub fn updated_at(&self) -> DateTime<Utc> { self.updated_at }

    pub fn soft_delete(&mut self) { self.deleted = true; self.touch(); }

    /// Writes back the canonical stock projection of `ledger`.
    pub fn sync_stock(&mut self, ledger: &StockLedger) {
        if ledger.product_id() == self.id {
            self.stock = ledger.product_stock();
            self.touch();
        }
    }

    pub fn take_events(&mut self) -> Vec<DomainEvent> { std::mem::take(&mut self.events) }
    fn raise_event(&mut self, e: DomainEvent) { self.events.push(e); }
    fn touch(&mut self) { self.updated_at = Utc::now(); }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    #[test]
    fn test_product_create_raises_event() {
        let mut p = Product::create("Widget", 10, Money::usd(Decimal::new(5, 0)), Money::usd(Decimal::new(8, 0)));
        assert_eq!(p.stock(), 10);
        let events = p.take_events();
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], DomainEvent::Product(e) if e.product_id == p.id() && e.stock == 10));
        assert!(p.take_events().is_empty());
    }

    #[test]
    fn test_soft_delete() {
        let mut p = Product::create("Widget", 1, Money::default(), Money::default());
        p.soft_delete();
        assert!(p.is_deleted());
    }
}
