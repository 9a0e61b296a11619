//! Fulfillment services: stock reconciliation, sale recording and the
//! orchestrator tying them to notifications.

pub mod orchestrator;
pub mod payment;
pub mod reconciler;
pub mod sales;

pub use orchestrator::{FulfilledLine, FulfillmentService, FulfillmentSummary};
pub use payment::{OfflinePayments, PaymentError, PaymentGateway};
pub use reconciler::StockReconciler;
pub use sales::{DailyRevenue, DailySales, Period, SaleRecorder, SalesComparison};
