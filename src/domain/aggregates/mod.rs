//! Aggregates module
pub mod product;
pub mod order;
pub mod sale;
pub mod stock;

pub use product::Product;
pub use order::{Order, OrderError, OrderLine, OrderStatus};
pub use sale::{Sale, REPORTING_WINDOW_DAYS};
pub use stock::{InventoryRecord, StockError, StockLedger, StockLevels};
