//! Order Fulfillment Orchestrator
//!
//! Runs one order through stock reconciliation and sale recording inside a
//! single store transaction, then notifies subscribers once the commit has
//! landed. Lock order inside the transaction is: the order row first, then
//! product rows by ascending id.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use crate::domain::aggregates::{InventoryRecord, Order, OrderError, OrderLine, OrderStatus, Product, StockLevels};
use crate::domain::events::DomainEvent;
use crate::messaging::NotificationPublisher;
use crate::store::Store;
use crate::{FulfillmentError, Result};

use super::payment::PaymentGateway;
use super::reconciler::StockReconciler;
use super::sales::SaleRecorder;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FulfilledLine {
    pub product_id: Uuid,
    pub quantity: u32,
    pub sale_id: Uuid,
    pub stock: StockLevels,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FulfillmentSummary {
    pub order_id: Uuid,
    pub status: OrderStatus,
    pub lines: Vec<FulfilledLine>,
    /// Events the bus accepted. Zero while disconnected.
    pub notifications_sent: usize,
}

#[derive(Clone)]
pub struct FulfillmentService {
    store: Arc<dyn Store>,
    reconciler: StockReconciler,
    recorder: SaleRecorder,
    publisher: NotificationPublisher,
    payments: Arc<dyn PaymentGateway>,
}

impl FulfillmentService {
    pub fn new(store: Arc<dyn Store>, publisher: NotificationPublisher, payments: Arc<dyn PaymentGateway>) -> Self {
        Self {
            reconciler: StockReconciler::new(Arc::clone(&store)),
            recorder: SaleRecorder::new(Arc::clone(&store)),
            store,
            publisher,
            payments,
        }
    }

    pub fn reconciler(&self) -> &StockReconciler { &self.reconciler }
    pub fn sales(&self) -> &SaleRecorder { &self.recorder }
    pub fn publisher(&self) -> &NotificationPublisher { &self.publisher }

    /// Fulfills `lines` against `order_id`: every line's stock moves and
    /// every line's sale is written, or nothing is.
    pub async fn fulfill(&self, order_id: Uuid, lines: &[OrderLine]) -> Result<FulfillmentSummary> {
        if lines.is_empty() {
            return Err(OrderError::NoItems.into());
        }
        if let Some(line) = lines.iter().find(|l| l.quantity == 0) {
            return Err(OrderError::ZeroQuantity(line.product_id).into());
        }

        let mut tx = self.store.begin().await?;
        let mut order = tx.lock_order(order_id).await?.ok_or(FulfillmentError::OrderNotFound(order_id))?;
        order.transition(OrderStatus::Fulfilled)?;

        let mut deltas: BTreeMap<Uuid, i64> = BTreeMap::new();
        for line in lines {
            *deltas.entry(line.product_id).or_default() -= i64::from(line.quantity);
        }
        let levels = self.reconciler.apply_all(tx.as_mut(), &deltas).await.map_err(|e| {
            tracing::warn!(order_id = %order_id, error = %e, "fulfillment rejected");
            e
        })?;

        let now = Utc::now();
        let mut sales = Vec::with_capacity(lines.len());
        for line in lines {
            sales.push(self.recorder.record_sale(tx.as_mut(), &order, line, now).await?);
        }
        tx.save_order(&order).await?;
        if let Err(e) = tx.commit().await {
            tracing::error!(order_id = %order_id, error = %e, "fulfillment commit failed");
            return Err(e);
        }
        tracing::info!(order_id = %order_id, lines = lines.len(), total = %order.total(), "order fulfilled");

        let mut fulfilled = Vec::with_capacity(lines.len());
        let mut events = Vec::with_capacity(lines.len() * 2 + 1);
        for (line, sale) in lines.iter().zip(&sales) {
            let stock = levels.get(&line.product_id).copied().ok_or(FulfillmentError::ProductNotFound(line.product_id))?;
            events.push(DomainEvent::Stock(stock.into()));
            events.push(DomainEvent::Sale(sale.to_event()));
            fulfilled.push(FulfilledLine { product_id: line.product_id, quantity: line.quantity, sale_id: sale.id, stock });
        }
        events.extend(order.take_events());
        let notifications_sent = self.publisher.publish_all(events.iter()).await;

        Ok(FulfillmentSummary { order_id, status: order.status(), lines: fulfilled, notifications_sent })
    }

    /// Fulfills an order with the lines it was placed with.
    pub async fn fulfill_order(&self, order_id: Uuid) -> Result<FulfillmentSummary> {
        let order = self.store.find_order(order_id).await?.ok_or(FulfillmentError::OrderNotFound(order_id))?;
        self.fulfill(order_id, order.lines()).await
    }

    /// Validates lines against the catalog, takes payment, then persists the
    /// order as `Pending`. A payment failure persists nothing.
    pub async fn place_order(&self, user_id: Uuid, lines: Vec<OrderLine>) -> Result<Order> {
        let mut order = Order::place(user_id, lines)?;

        let mut ids: Vec<Uuid> = order.lines().iter().map(|l| l.product_id).collect();
        ids.sort_unstable();
        ids.dedup();
        let found = self.store.find_products(&ids).await?;
        if let Some(missing) = ids.iter().find(|id| !found.iter().any(|p| p.id() == **id && !p.is_deleted())) {
            return Err(FulfillmentError::ProductNotFound(*missing));
        }

        let transaction_id = self.payments.authorize(&order).await.map_err(|e| {
            tracing::warn!(order_id = %order.id(), error = %e, "payment failed");
            FulfillmentError::Payment(e.to_string())
        })?;
        order.attach_transaction(transaction_id);
        self.store.insert_order(&order).await?;
        tracing::info!(order_id = %order.id(), user_id = %user_id, total = %order.total(), "order placed");

        self.publisher.publish(&DomainEvent::Order(order.summary_event())).await;
        Ok(order)
    }

    /// Moves an order to `status`. Moving to `Fulfilled` runs fulfillment
    /// with the stored lines.
    pub async fn update_status(&self, order_id: Uuid, status: OrderStatus) -> Result<Order> {
        if status == OrderStatus::Fulfilled {
            self.fulfill_order(order_id).await?;
            return self.store.find_order(order_id).await?.ok_or(FulfillmentError::OrderNotFound(order_id));
        }

        let mut tx = self.store.begin().await?;
        let mut order = tx.lock_order(order_id).await?.ok_or(FulfillmentError::OrderNotFound(order_id))?;
        let from = order.status();
        order.transition(status)?;
        tx.save_order(&order).await?;
        tx.commit().await?;
        tracing::info!(order_id = %order_id, from = from.as_str(), to = status.as_str(), "order status updated");

        let events = order.take_events();
        self.publisher.publish_all(events.iter()).await;
        Ok(order)
    }

    /// Registers a catalog product, optionally opening its inventory record.
    pub async fn add_product(&self, mut product: Product, with_inventory: bool) -> Result<Product> {
        let inventory = with_inventory.then(|| InventoryRecord {
            product_id: product.id(),
            stock_available: product.stock(),
            stock_sold: 0,
        });
        self.store.insert_product(&product, inventory.as_ref()).await?;
        tracing::info!(product_id = %product.id(), name = product.name(), stock = product.stock(), "product added");

        let events = product.take_events();
        self.publisher.publish_all(events.iter()).await;
        Ok(product)
    }

    pub async fn restock(&self, product_id: Uuid, quantity: u32) -> Result<StockLevels> {
        let levels = self.reconciler.restock(product_id, quantity).await?;
        self.publisher.publish(&DomainEvent::Stock(levels.into())).await;
        Ok(levels)
    }

    pub async fn create_inventory_record(&self, product_id: Uuid) -> Result<StockLevels> {
        let levels = self.reconciler.create_inventory_record(product_id).await?;
        self.publisher.publish(&DomainEvent::Stock(levels.into())).await;
        Ok(levels)
    }

    pub async fn stock_levels(&self, product_id: Uuid) -> Result<StockLevels> {
        self.reconciler.levels(product_id).await
    }

    pub async fn inventories(&self) -> Result<Vec<StockLevels>> {
        self.reconciler.all_levels().await
    }

    /// Withdraws a product from sale. Its rows stay for reporting; stock
    /// changes and fulfillment treat it as missing from then on.
    pub async fn delete_product(&self, product_id: Uuid) -> Result<()> {
        if !self.store.soft_delete_product(product_id).await? {
            return Err(FulfillmentError::ProductNotFound(product_id));
        }
        tracing::info!(product_id = %product_id, "product deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::value_objects::Money;
    use crate::fulfillment::payment::{OfflinePayments, PaymentError};
    use crate::messaging::fake::FakeTransport;
    use crate::messaging::{BackoffPolicy, BusTransport, ConnectionManager, HandlerRegistry, DEFAULT_PUBLISH_TIMEOUT};
    use crate::store::InMemoryStore;
    use async_trait::async_trait;
    use rust_decimal::Decimal;

    struct Harness {
        service: FulfillmentService,
        store: InMemoryStore,
        transport: Arc<FakeTransport>,
    }

    impl Harness {
        async fn new(bus_up: bool) -> Self {
            Self::with_payments(bus_up, Arc::new(OfflinePayments)).await
        }

        async fn with_payments(bus_up: bool, payments: Arc<dyn PaymentGateway>) -> Self {
            let store = InMemoryStore::new();
            let transport = Arc::new(FakeTransport::new([bus_up]));
            let dyn_transport: Arc<dyn BusTransport> = transport.clone();
            let connection =
                ConnectionManager::new("nats://bus:4222", dyn_transport, BackoffPolicy::default(), HandlerRegistry::new());
            connection.start().await;
            let service = FulfillmentService::new(Arc::new(store.clone()), NotificationPublisher::new(connection), payments);
            Self { service, store, transport }
        }

        async fn product(&self, stock: u32, price: i64) -> Product {
            let p = Product::create("Widget", stock, Money::usd(Decimal::new(price / 2, 0)), Money::usd(Decimal::new(price, 0)));
            self.service.add_product(p, true).await.unwrap()
        }

        async fn order(&self, lines: &[(&Product, u32)]) -> Order {
            let lines = lines
                .iter()
                .map(|(p, qty)| OrderLine::new(p.id(), *qty, p.selling_price().clone()))
                .collect();
            self.service.place_order(Uuid::new_v4(), lines).await.unwrap()
        }

        fn published_topics(&self) -> Vec<String> {
            self.transport.link(0).published().into_iter().map(|(topic, _)| topic).collect()
        }
    }

    #[tokio::test]
    async fn fulfills_single_line_order() {
        let h = Harness::new(true).await;
        let p = h.product(10, 12).await;
        let order = h.order(&[(&p, 3)]).await;

        let summary = h.service.fulfill(order.id(), order.lines()).await.unwrap();

        assert_eq!(summary.status, OrderStatus::Fulfilled);
        let stock = summary.lines[0].stock;
        assert_eq!((stock.product_stock, stock.stock_available, stock.stock_sold), (7, 7, 3));
        let sales = h.service.sales().sales_for_order(order.id()).await.unwrap();
        assert_eq!(sales.len(), 1);
        assert_eq!(sales[0].total_amount.amount(), Decimal::new(36, 0));
        assert_eq!(summary.notifications_sent, 3);
        assert_eq!(
            h.published_topics()[2..],
            ["inventory-updates", "sales-updates", "order-updates"].map(String::from)
        );
    }

    #[tokio::test]
    async fn insufficient_line_aborts_whole_order() {
        let h = Harness::new(true).await;
        let plenty = h.product(10, 4).await;
        let scarce = h.product(1, 4).await;
        let order = h.order(&[(&plenty, 2), (&scarce, 2)]).await;

        let err = h.service.fulfill(order.id(), order.lines()).await.unwrap_err();

        assert!(matches!(err, FulfillmentError::InsufficientStock { product_id, .. } if product_id == scarce.id()));
        assert_eq!(h.service.stock_levels(plenty.id()).await.unwrap().product_stock, 10);
        assert_eq!(h.service.stock_levels(scarce.id()).await.unwrap().product_stock, 1);
        assert_eq!(h.store.sale_count(), 0);
        assert_eq!(h.store.find_order(order.id()).await.unwrap().unwrap().status(), OrderStatus::Pending);
    }

    #[tokio::test]
    async fn repeated_product_lines_are_checked_together() {
        let h = Harness::new(false).await;
        let p = h.product(5, 4).await;
        let order = h.order(&[(&p, 3), (&p, 3)]).await;

        let err = h.service.fulfill(order.id(), order.lines()).await.unwrap_err();
        assert!(matches!(err, FulfillmentError::InsufficientStock { requested: 6, available: 5, .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_orders_never_oversell() {
        let h = Harness::new(true).await;
        let p = h.product(5, 4).await;
        let first = h.order(&[(&p, 3)]).await;
        let second = h.order(&[(&p, 3)]).await;

        let tasks: Vec<_> = [first, second]
            .into_iter()
            .map(|order| {
                let service = h.service.clone();
                tokio::spawn(async move { service.fulfill(order.id(), order.lines()).await })
            })
            .collect();
        let mut results = Vec::new();
        for task in tasks {
            results.push(task.await.unwrap());
        }

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results.iter().any(|r| matches!(r, Err(FulfillmentError::InsufficientStock { .. }))));
        let levels = h.service.stock_levels(p.id()).await.unwrap();
        assert_eq!((levels.product_stock, levels.stock_available, levels.stock_sold), (2, 2, 3));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn many_concurrent_orders_drain_stock_exactly() {
        let h = Harness::new(false).await;
        let p = h.product(10, 2).await;
        let mut orders = Vec::new();
        for _ in 0..25 {
            orders.push(h.order(&[(&p, 1)]).await);
        }

        let tasks: Vec<_> = orders
            .into_iter()
            .map(|order| {
                let service = h.service.clone();
                tokio::spawn(async move { service.fulfill(order.id(), order.lines()).await.is_ok() })
            })
            .collect();
        let mut succeeded = 0;
        for task in tasks {
            if task.await.unwrap() {
                succeeded += 1;
            }
        }

        assert_eq!(succeeded, 10);
        let levels = h.service.stock_levels(p.id()).await.unwrap();
        assert_eq!((levels.product_stock, levels.stock_available, levels.stock_sold), (0, 0, 10));
        assert_eq!(h.store.sale_count(), 10);
    }

    #[tokio::test]
    async fn fulfillment_succeeds_with_bus_down() {
        let h = Harness::new(false).await;
        let p = h.product(4, 3).await;
        let order = h.order(&[(&p, 4)]).await;

        let summary = h.service.fulfill(order.id(), order.lines()).await.unwrap();

        assert_eq!(summary.notifications_sent, 0);
        assert_eq!(summary.lines[0].stock.product_stock, 0);
        assert_eq!(h.store.sale_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_bus_does_not_hold_up_fulfillment() {
        let h = Harness::new(true).await;
        let p = h.product(5, 3).await;
        let q = h.product(5, 3).await;
        let order = h.order(&[(&p, 1), (&q, 2)]).await;
        h.transport.link(0).stall_publishes();

        let started = tokio::time::Instant::now();
        let summary = tokio::time::timeout(DEFAULT_PUBLISH_TIMEOUT * 2, h.service.fulfill(order.id(), order.lines()))
            .await
            .expect("fulfillment returned while the bus was stalled")
            .unwrap();

        assert!(started.elapsed() < DEFAULT_PUBLISH_TIMEOUT * 2);
        assert_eq!(summary.notifications_sent, 0);
        assert_eq!(summary.status, OrderStatus::Fulfilled);
        assert_eq!(h.store.sale_count(), 2);
        assert_eq!(h.service.stock_levels(q.id()).await.unwrap().product_stock, 3);
    }

    #[tokio::test]
    async fn deleted_product_cannot_be_sold() {
        let h = Harness::new(false).await;
        let keep = h.product(5, 3).await;
        let gone = h.product(5, 3).await;
        let order = h.order(&[(&keep, 1), (&gone, 1)]).await;
        assert_eq!(h.service.inventories().await.unwrap().len(), 2);

        h.service.delete_product(gone.id()).await.unwrap();

        let err = h.service.fulfill(order.id(), order.lines()).await.unwrap_err();
        assert!(matches!(err, FulfillmentError::ProductNotFound(id) if id == gone.id()));
        assert_eq!(h.service.stock_levels(keep.id()).await.unwrap().product_stock, 5);
        assert!(h.service.stock_levels(gone.id()).await.unwrap_err().is_not_found());
        assert!(matches!(h.service.restock(gone.id(), 1).await, Err(FulfillmentError::ProductNotFound(_))));
        let listed: Vec<Uuid> = h.service.inventories().await.unwrap().iter().map(|l| l.product_id).collect();
        assert_eq!(listed, vec![keep.id()]);
        assert!(h.service.delete_product(gone.id()).await.unwrap_err().is_not_found());
        assert_eq!(h.store.sale_count(), 0);
    }

    #[tokio::test]
    async fn failed_commit_leaves_nothing_behind() {
        let h = Harness::new(true).await;
        let p = h.product(10, 3).await;
        let order = h.order(&[(&p, 2)]).await;
        let published_before = h.published_topics().len();

        h.store.fail_next_commit();
        let err = h.service.fulfill(order.id(), order.lines()).await.unwrap_err();

        assert!(matches!(err, FulfillmentError::Persistence(_)));
        assert!(!err.is_client_error());
        assert_eq!(h.service.stock_levels(p.id()).await.unwrap().product_stock, 10);
        assert_eq!(h.store.sale_count(), 0);
        assert_eq!(h.store.find_order(order.id()).await.unwrap().unwrap().status(), OrderStatus::Pending);
        assert_eq!(h.published_topics().len(), published_before);
    }

    #[tokio::test]
    async fn second_fulfillment_is_rejected() {
        let h = Harness::new(false).await;
        let p = h.product(10, 3).await;
        let order = h.order(&[(&p, 2)]).await;

        h.service.fulfill(order.id(), order.lines()).await.unwrap();
        let err = h.service.fulfill(order.id(), order.lines()).await.unwrap_err();

        assert!(matches!(err, FulfillmentError::InvalidOrder(OrderError::InvalidTransition { .. })));
        assert_eq!(h.service.stock_levels(p.id()).await.unwrap().product_stock, 8);
        assert_eq!(h.store.sale_count(), 1);
    }

    #[tokio::test]
    async fn missing_entities_are_not_found() {
        let h = Harness::new(false).await;
        let p = h.product(10, 3).await;
        let order = h.order(&[(&p, 1)]).await;

        let err = h.service.fulfill(Uuid::new_v4(), order.lines()).await.unwrap_err();
        assert!(matches!(err, FulfillmentError::OrderNotFound(_)));
        assert!(err.is_not_found());

        let ghost = OrderLine::new(Uuid::new_v4(), 1, Money::usd(Decimal::ONE));
        let err = h.service.fulfill(order.id(), &[ghost.clone()]).await.unwrap_err();
        assert!(matches!(err, FulfillmentError::ProductNotFound(id) if id == ghost.product_id));

        let err = h.service.place_order(Uuid::new_v4(), vec![ghost]).await.unwrap_err();
        assert!(matches!(err, FulfillmentError::ProductNotFound(_)));
    }

    struct Declining;

    #[async_trait]
    impl PaymentGateway for Declining {
        async fn authorize(&self, _order: &Order) -> std::result::Result<String, PaymentError> {
            Err(PaymentError::Declined("card expired".into()))
        }
    }

    #[tokio::test]
    async fn payment_failure_persists_nothing() {
        let h = Harness::with_payments(true, Arc::new(Declining)).await;
        let p = h.product(10, 3).await;
        let line = OrderLine::new(p.id(), 1, p.selling_price().clone());

        let err = h.service.place_order(Uuid::new_v4(), vec![line]).await.unwrap_err();

        assert!(matches!(err, FulfillmentError::Payment(_)));
        assert_eq!(h.store.order_count(), 0);
        assert_eq!(h.published_topics(), vec!["product-new".to_string()]);
    }

    #[tokio::test]
    async fn status_updates_follow_transitions() {
        let h = Harness::new(true).await;
        let p = h.product(10, 3).await;
        let order = h.order(&[(&p, 4)]).await;
        assert!(order.transaction_id().is_some_and(|t| t.starts_with("offline-")));

        let paid = h.service.update_status(order.id(), OrderStatus::Paid).await.unwrap();
        assert_eq!(paid.status(), OrderStatus::Paid);

        let fulfilled = h.service.update_status(order.id(), OrderStatus::Fulfilled).await.unwrap();
        assert_eq!(fulfilled.status(), OrderStatus::Fulfilled);
        assert_eq!(h.service.stock_levels(p.id()).await.unwrap().stock_sold, 4);

        let err = h.service.update_status(order.id(), OrderStatus::Cancelled).await.unwrap_err();
        assert!(matches!(err, FulfillmentError::InvalidOrder(_)));
        assert!(err.is_client_error());
    }

    #[tokio::test]
    async fn restock_and_catalog_changes_are_announced() {
        let h = Harness::new(true).await;
        let p = h.product(2, 3).await;
        let bare = Product::create("Gizmo", 6, Money::default(), Money::default());
        let bare = h.service.add_product(bare, false).await.unwrap();

        let levels = h.service.restock(p.id(), 3).await.unwrap();
        assert_eq!((levels.product_stock, levels.stock_available), (5, 5));
        assert!(matches!(h.service.stock_levels(bare.id()).await, Err(FulfillmentError::InventoryNotFound(_))));
        assert_eq!(h.service.create_inventory_record(bare.id()).await.unwrap().stock_available, 6);

        assert_eq!(h.published_topics(), ["product-new", "product-new", "inventory-updates", "inventory-updates"].map(String::from));
    }
}
