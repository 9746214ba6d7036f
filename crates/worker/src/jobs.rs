//! Scheduled job bodies
//!
//! Thin wrappers over the billing services: jobs log failures and return,
//! the scheduler fires them again on the next tick. No job retries inside a
//! tick; per-record error isolation lives in the services themselves.

use proxypanel_billing::{OrderService, PlanChangeService};
use time::{Duration, OffsetDateTime};

/// Apply every pending downgrade whose billing-cycle boundary has passed
pub async fn apply_due_downgrades(service: &PlanChangeService, as_of: OffsetDateTime) {
    if let Err(e) = service.apply_scheduled_downgrades(as_of).await {
        tracing::error!(error = %e, "Scheduled downgrade batch failed");
    }
}

/// Cancel pending orders that were never paid
pub async fn expire_stale_orders(service: &OrderService, as_of: OffsetDateTime, max_age_hours: i64) {
    if let Err(e) = service
        .expire_overdue_pending(as_of, Duration::hours(max_age_hours))
        .await
    {
        tracing::error!(error = %e, "Pending-order expiry failed");
    }
}
