//! Payment collaborator port.

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::aggregates::Order;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PaymentError {
    #[error("payment declined: {0}")]
    Declined(String),
    #[error("payment provider unavailable: {0}")]
    Unavailable(String),
}

/// Authorizes an order and hands back an opaque transaction id.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn authorize(&self, order: &Order) -> Result<String, PaymentError>;
}

/// Approves every order with a locally generated id. For deployments
/// that settle payment outside this service.
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflinePayments;

#[async_trait]
impl PaymentGateway for OfflinePayments {
    async fn authorize(&self, order: &Order) -> Result<String, PaymentError> {
        if order.total().is_negative() {
            return Err(PaymentError::Declined(format!("negative total {}", order.total())));
        }
        Ok(format!("offline-{}", Uuid::now_v7()))
    }
}
