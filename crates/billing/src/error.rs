//! Billing error types

use proxypanel_shared::types::OrderStatus;
use thiserror::Error;

/// Billing-specific errors
///
/// One variant per failure kind the engine can produce. The HTTP layer maps
/// variants to status codes by matching on the variant, never on message text.
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid order status transition: {from} -> {to}")]
    InvalidTransition {
        from: OrderStatus,
        to: OrderStatus,
    },

    #[error("Plan is not open for purchase: {0}")]
    PlanInactive(String),

    #[error("Target plan is the same as the current plan")]
    SamePlan,

    #[error("Change is an upgrade; it cannot be scheduled as a downgrade")]
    UpgradeNotAllowed,

    #[error("Change is a downgrade; it cannot be executed as an upgrade")]
    DowngradeNotAllowed,

    #[error("A downgrade is already scheduled for this user")]
    PendingDowngrade,

    #[error("No downgrade is scheduled for this user")]
    NoPendingDowngrade,

    #[error("No active subscription")]
    NoActiveSubscription,

    #[error("Insufficient balance: need {required}, have {available}")]
    InsufficientBalance { required: i64, available: i64 },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Ledger error: {0}")]
    Ledger(String),
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Ledger(err.to_string())
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
