//! Order lifecycle service
//!
//! Owns order creation and the order status state machine, plus the balance
//! side-effects of transitions that move money (refunds). Creating an order
//! never moves money; charging is orchestrated by the plan-change engine so
//! there is no hidden double-charge path through this module.

use std::sync::Arc;

use proxypanel_shared::types::{Order, OrderStatus, PaginatedResponse, Plan};
use sqlx::{PgConnection, PgPool};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{BillingError, BillingResult};
use crate::ledger;

/// Order lifecycle service
#[derive(Clone)]
pub struct OrderService {
    pool: PgPool,
    clock: Arc<dyn Clock>,
}

impl OrderService {
    pub fn new(pool: PgPool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }

    /// Create a `pending` order for an active plan
    ///
    /// Sets `original_amount = pay_amount = plan.price` and
    /// `expired_at = now + plan.duration_days`. Moves no money.
    pub async fn create(&self, user_id: Uuid, plan_id: Uuid) -> BillingResult<Order> {
        let plan = fetch_active_plan(&self.pool, plan_id).await?;

        let mut conn = self.pool.acquire().await?;
        let order = create_order_in_tx(
            &mut conn,
            user_id,
            &plan,
            plan.price,
            self.clock.now(),
        )
        .await?;

        tracing::info!(
            order_id = %order.id,
            order_no = %order.order_no,
            user_id = %user_id,
            plan_code = %plan.code,
            amount = order.pay_amount,
            "Order created"
        );

        Ok(order)
    }

    /// Get an order by ID
    pub async fn get(&self, order_id: Uuid) -> BillingResult<Order> {
        let order: Option<Order> = sqlx::query_as(
            "SELECT id, user_id, plan_id, order_no, original_amount, pay_amount,
                    status, expired_at, created_at, updated_at
             FROM orders WHERE id = $1",
        )
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;

        order.ok_or_else(|| BillingError::NotFound(format!("order {}", order_id)))
    }

    /// Paginated orders for one user, newest first
    ///
    /// Strict ownership filter: no flag or join can surface another user's
    /// orders through this listing.
    pub async fn list_by_user(
        &self,
        user_id: Uuid,
        page: i64,
        per_page: i64,
    ) -> BillingResult<PaginatedResponse<Order>> {
        let page = page.max(1);
        let per_page = per_page.clamp(1, 200);
        let offset = (page - 1) * per_page;

        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM orders WHERE user_id = $1")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;

        let items: Vec<Order> = sqlx::query_as(
            r#"
            SELECT id, user_id, plan_id, order_no, original_amount, pay_amount,
                   status, expired_at, created_at, updated_at
            FROM orders
            WHERE user_id = $1
            ORDER BY created_at DESC, id DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(user_id)
        .bind(per_page)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(PaginatedResponse::new(items, total, page, per_page))
    }

    /// Move an order to `target` if the state machine allows it
    ///
    /// This method only flips status. On `pending -> paid` the caller must
    /// already have charged the ledger; on `paid -> refunded` use [`refund`]
    /// (or credit the ledger in the same transaction yourself).
    ///
    /// [`refund`]: OrderService::refund
    pub async fn update_status(
        &self,
        order_id: Uuid,
        target: OrderStatus,
    ) -> BillingResult<Order> {
        let order = self.get(order_id).await?;

        let mut conn = self.pool.acquire().await?;
        update_status_in_tx(&mut conn, &order, target).await
    }

    /// Cancel a `pending` order
    pub async fn cancel(&self, order_id: Uuid) -> BillingResult<Order> {
        self.update_status(order_id, OrderStatus::Cancelled).await
    }

    /// Refund a `paid` order: credit the ledger and flip to `refunded`
    ///
    /// Both writes run in one transaction so a credited-but-not-refunded (or
    /// refunded-but-not-credited) order is never observable.
    pub async fn refund(&self, order_id: Uuid, reason: &str) -> BillingResult<Order> {
        let order = self.get(order_id).await?;
        if !order.status.can_transition(OrderStatus::Refunded) {
            return Err(BillingError::InvalidTransition {
                from: order.status,
                to: OrderStatus::Refunded,
            });
        }

        let mut tx = self.pool.begin().await?;

        if order.pay_amount > 0 {
            ledger::credit_in_tx(&mut tx, order.user_id, order.pay_amount, Some(order.id), reason)
                .await?;
        }
        let order = update_status_in_tx(&mut tx, &order, OrderStatus::Refunded).await?;

        tx.commit().await?;

        tracing::info!(
            order_id = %order.id,
            order_no = %order.order_no,
            user_id = %order.user_id,
            amount = order.pay_amount,
            "Order refunded"
        );

        Ok(order)
    }

    /// Cancel pending orders older than `max_age` (worker upkeep)
    ///
    /// Abandoned purchase intents would otherwise accumulate forever. Uses
    /// the ordinary `pending -> cancelled` transition, applied in bulk.
    pub async fn expire_overdue_pending(
        &self,
        as_of: OffsetDateTime,
        max_age: Duration,
    ) -> BillingResult<u64> {
        let cutoff = as_of - max_age;
        let result = sqlx::query(
            "UPDATE orders SET status = $1, updated_at = NOW()
             WHERE status = $2 AND created_at <= $3",
        )
        .bind(OrderStatus::Cancelled)
        .bind(OrderStatus::Pending)
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        let cancelled = result.rows_affected();
        if cancelled > 0 {
            tracing::info!(cancelled = cancelled, cutoff = %cutoff, "Expired overdue pending orders");
        }

        Ok(cancelled)
    }
}

// =============================================================================
// In-transaction building blocks (shared with the plan-change engine)
// =============================================================================

/// Insert a `pending` order inside an open transaction
///
/// `pay_amount` may be below the plan price (prorated upgrades, free
/// downgrade materialization); the `pay_amount <= original_amount` invariant
/// is also enforced by a DB CHECK.
pub(crate) async fn create_order_in_tx(
    conn: &mut PgConnection,
    user_id: Uuid,
    plan: &Plan,
    pay_amount: i64,
    now: OffsetDateTime,
) -> BillingResult<Order> {
    if pay_amount < 0 || pay_amount > plan.price {
        return Err(BillingError::InvalidInput(format!(
            "Pay amount {} outside [0, {}]",
            pay_amount, plan.price
        )));
    }

    let expired_at = now + Duration::days(i64::from(plan.duration_days));

    let order: Order = sqlx::query_as(
        r#"
        INSERT INTO orders
            (id, user_id, plan_id, order_no, original_amount, pay_amount, status,
             expired_at, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW(), NOW())
        RETURNING id, user_id, plan_id, order_no, original_amount, pay_amount,
                  status, expired_at, created_at, updated_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(user_id)
    .bind(plan.id)
    .bind(generate_order_no(now))
    .bind(plan.price)
    .bind(pay_amount)
    .bind(OrderStatus::Pending)
    .bind(expired_at)
    .fetch_one(&mut *conn)
    .await?;

    Ok(order)
}

/// Compare-and-swap the status column inside an open transaction
///
/// The WHERE clause re-checks the status this call validated against, so a
/// concurrent transition loses cleanly instead of overwriting: zero rows
/// affected means another writer got there first.
pub(crate) async fn update_status_in_tx(
    conn: &mut PgConnection,
    order: &Order,
    target: OrderStatus,
) -> BillingResult<Order> {
    if !order.status.can_transition(target) {
        return Err(BillingError::InvalidTransition {
            from: order.status,
            to: target,
        });
    }

    let updated: Option<Order> = sqlx::query_as(
        r#"
        UPDATE orders
        SET status = $2, updated_at = NOW()
        WHERE id = $1 AND status = $3
        RETURNING id, user_id, plan_id, order_no, original_amount, pay_amount,
                  status, expired_at, created_at, updated_at
        "#,
    )
    .bind(order.id)
    .bind(target)
    .bind(order.status)
    .fetch_optional(&mut *conn)
    .await?;

    let updated = updated.ok_or_else(|| {
        BillingError::Ledger(format!(
            "Concurrent modification of order {} (expected status {})",
            order.id, order.status
        ))
    })?;

    tracing::info!(
        order_id = %updated.id,
        order_no = %updated.order_no,
        from = %order.status,
        to = %target,
        "Order status updated"
    );

    Ok(updated)
}

/// Fetch a plan that is open for purchase
pub(crate) async fn fetch_active_plan(pool: &PgPool, plan_id: Uuid) -> BillingResult<Plan> {
    let plan: Option<Plan> = sqlx::query_as(
        "SELECT id, code, name, price, duration_days, active, created_at
         FROM plans WHERE id = $1",
    )
    .bind(plan_id)
    .fetch_optional(pool)
    .await?;

    let plan = plan.ok_or_else(|| BillingError::NotFound(format!("plan {}", plan_id)))?;
    if !plan.active {
        return Err(BillingError::PlanInactive(plan.code));
    }
    Ok(plan)
}

/// Generate a globally unique, human-presentable order number
///
/// `ORD-<yyyymmdd>-<12 hex>`; the random token carries uniqueness and the
/// DB unique index on `order_no` backs it.
pub(crate) fn generate_order_no(now: OffsetDateTime) -> String {
    let token = Uuid::new_v4().simple().to_string();
    format!(
        "ORD-{:04}{:02}{:02}-{}",
        now.year(),
        u8::from(now.month()),
        now.day(),
        token[..12].to_uppercase()
    )
}
