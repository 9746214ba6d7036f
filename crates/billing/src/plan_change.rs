//! Plan-change engine
//!
//! Computes and executes transitions between a user's current plan and a new
//! plan. Upgrades settle immediately: credit for the unused remainder of the
//! current plan is applied against the new plan's price, and the order plus
//! its charge commit in one transaction. Downgrades never settle early: they
//! are persisted as a pending record and materialize at the current order's
//! expiration (the billing-cycle boundary), with no refund of remaining value.
//!
//! Proration rounding: the unused-time credit is `price * remaining_days /
//! duration_days` in integer arithmetic, floored. That is the single rounding
//! rule in the engine; fractional remainders always resolve against the
//! credit, never the charge.

use std::sync::Arc;

use serde::Serialize;
use sqlx::{PgConnection, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use proxypanel_shared::types::{ChangeDirection, Order, OrderStatus, PendingDowngrade, Plan};

use crate::clock::Clock;
use crate::error::{BillingError, BillingResult};
use crate::ledger;
use crate::orders::{create_order_in_tx, fetch_active_plan, update_status_in_tx};

/// Quote for a plan change
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ChangeQuote {
    pub direction: ChangeDirection,
    /// Whole days left on the current plan, clamped to its duration
    pub remaining_days: i64,
    /// Credit for unused time on the current plan, in minor units
    pub prorated_credit: i64,
    /// Amount the ledger will be charged (zero for downgrades)
    pub charge_amount: i64,
}

/// Plan-change service
#[derive(Clone)]
pub struct PlanChangeService {
    pool: PgPool,
    clock: Arc<dyn Clock>,
}

impl PlanChangeService {
    pub fn new(pool: PgPool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }

    /// Quote the change from `current_plan_id` to `new_plan_id` for a user
    ///
    /// Pure computation over the user's active subscription; no side effects.
    pub async fn calculate_change(
        &self,
        user_id: Uuid,
        current_plan_id: Uuid,
        new_plan_id: Uuid,
    ) -> BillingResult<ChangeQuote> {
        let current = fetch_plan(&self.pool, current_plan_id).await?;
        let target = fetch_plan(&self.pool, new_plan_id).await?;

        let now = self.clock.now();
        let active = self.active_subscription(user_id, now).await?;
        if active.plan_id != current.id {
            return Err(BillingError::NoActiveSubscription);
        }

        quote(&current, &target, remaining_whole_days(active.expired_at, now))
    }

    /// Execute an immediate upgrade: new order + prorated charge, atomically
    ///
    /// Creates a `paid` order for the new plan and debits the ledger for the
    /// quoted charge inside one transaction. `InsufficientBalance` aborts the
    /// whole unit: no order is created and no ledger entry is appended.
    pub async fn execute_upgrade(
        &self,
        user_id: Uuid,
        current_plan_id: Uuid,
        new_plan_id: Uuid,
    ) -> BillingResult<Order> {
        let current = fetch_plan(&self.pool, current_plan_id).await?;
        let target = fetch_active_plan(&self.pool, new_plan_id).await?;

        let now = self.clock.now();
        let mut tx = self.pool.begin().await?;

        // Lock the active order row so concurrent upgrades for the same user
        // serialize here instead of both quoting against the same balance.
        let active = lock_active_subscription(&mut tx, user_id, now).await?;
        if active.plan_id != current.id {
            return Err(BillingError::NoActiveSubscription);
        }

        let change = quote(&current, &target, remaining_whole_days(active.expired_at, now))?;
        if change.direction != ChangeDirection::Upgrade {
            return Err(BillingError::DowngradeNotAllowed);
        }

        let order = create_order_in_tx(&mut tx, user_id, &target, change.charge_amount, now).await?;

        if change.charge_amount > 0 {
            let description = format!("Upgrade to {} ({})", target.name, order.order_no);
            ledger::charge_in_tx(
                &mut tx,
                user_id,
                change.charge_amount,
                Some(order.id),
                &description,
            )
            .await?;
        }

        let order = update_status_in_tx(&mut tx, &order, OrderStatus::Paid).await?;

        tx.commit().await?;

        tracing::info!(
            user_id = %user_id,
            order_no = %order.order_no,
            from_plan = %current.code,
            to_plan = %target.code,
            prorated_credit = change.prorated_credit,
            charge_amount = change.charge_amount,
            "Upgrade executed"
        );

        Ok(order)
    }

    /// Schedule a downgrade for the next billing-cycle boundary
    ///
    /// No proration, no order, no charge: only a pending record effective at
    /// the current order's expiration. The UNIQUE constraint on `user_id`
    /// makes the at-most-one rule race-free; a concurrent duplicate loses the
    /// insert and surfaces as `PendingDowngrade`.
    pub async fn schedule_downgrade(
        &self,
        user_id: Uuid,
        current_plan_id: Uuid,
        new_plan_id: Uuid,
    ) -> BillingResult<PendingDowngrade> {
        let current = fetch_plan(&self.pool, current_plan_id).await?;
        let target = fetch_active_plan(&self.pool, new_plan_id).await?;

        if target.price == current.price {
            return Err(BillingError::SamePlan);
        }
        if target.price > current.price {
            return Err(BillingError::UpgradeNotAllowed);
        }

        let now = self.clock.now();
        let active = self.active_subscription(user_id, now).await?;
        if active.plan_id != current.id {
            return Err(BillingError::NoActiveSubscription);
        }

        let record: Option<PendingDowngrade> = sqlx::query_as(
            r#"
            INSERT INTO pending_downgrades (id, user_id, from_plan_id, to_plan_id, effective_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (user_id) DO NOTHING
            RETURNING id, user_id, from_plan_id, to_plan_id, effective_at, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(current.id)
        .bind(target.id)
        .bind(active.expired_at)
        .fetch_optional(&self.pool)
        .await?;

        let record = record.ok_or(BillingError::PendingDowngrade)?;

        tracing::info!(
            user_id = %user_id,
            from_plan = %current.code,
            to_plan = %target.code,
            effective_at = %record.effective_at,
            "Downgrade scheduled"
        );

        Ok(record)
    }

    /// The user's pending downgrade, if any
    pub async fn get_pending_downgrade(&self, user_id: Uuid) -> BillingResult<PendingDowngrade> {
        let record: Option<PendingDowngrade> = sqlx::query_as(
            "SELECT id, user_id, from_plan_id, to_plan_id, effective_at, created_at
             FROM pending_downgrades WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        record.ok_or(BillingError::NoPendingDowngrade)
    }

    /// Remove the user's pending downgrade
    pub async fn cancel_pending_downgrade(&self, user_id: Uuid) -> BillingResult<()> {
        let deleted: Option<Uuid> =
            sqlx::query_scalar("DELETE FROM pending_downgrades WHERE user_id = $1 RETURNING id")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;

        if deleted.is_none() {
            return Err(BillingError::NoPendingDowngrade);
        }

        tracing::info!(user_id = %user_id, "Pending downgrade cancelled");
        Ok(())
    }

    /// Materialize every pending downgrade whose boundary has passed
    ///
    /// Invoked by the scheduler. Each record is processed in its own
    /// transaction: the target-plan order is created and flipped to `paid`
    /// (free: `pay_amount = 0`, no ledger movement) and the pending record
    /// is deleted together. A failure on one record is logged and skipped;
    /// it never blocks the rest of the batch.
    pub async fn apply_scheduled_downgrades(&self, as_of: OffsetDateTime) -> BillingResult<u64> {
        let due: Vec<Uuid> = sqlx::query_scalar(
            "SELECT id FROM pending_downgrades WHERE effective_at <= $1 ORDER BY effective_at, id",
        )
        .bind(as_of)
        .fetch_all(&self.pool)
        .await?;

        let mut applied = 0u64;
        for record_id in due {
            match self.apply_one_downgrade(record_id, as_of).await {
                Ok(true) => applied += 1,
                Ok(false) => {} // claimed by a concurrent worker
                Err(e) => {
                    tracing::error!(
                        record_id = %record_id,
                        error = %e,
                        "Failed to apply scheduled downgrade"
                    );
                }
            }
        }

        if applied > 0 {
            tracing::info!(applied = applied, as_of = %as_of, "Applied scheduled downgrades");
        }

        Ok(applied)
    }

    /// Apply a single due downgrade in its own transaction
    async fn apply_one_downgrade(&self, record_id: Uuid, as_of: OffsetDateTime) -> BillingResult<bool> {
        let mut tx = self.pool.begin().await?;

        let record: Option<PendingDowngrade> = sqlx::query_as(
            r#"
            SELECT id, user_id, from_plan_id, to_plan_id, effective_at, created_at
            FROM pending_downgrades
            WHERE id = $1 AND effective_at <= $2
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(record_id)
        .bind(as_of)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(record) = record else {
            return Ok(false);
        };

        // The target may have been deactivated since scheduling; the user
        // already committed to it, so the downgrade still applies.
        let target = fetch_plan_in_tx(&mut tx, record.to_plan_id).await?;

        // New cycle starts at the boundary, not at worker wake-up time, so
        // back-to-back cycles line up even when the scheduler runs late.
        let order = create_order_in_tx(&mut tx, record.user_id, &target, 0, record.effective_at)
            .await?;
        let order = update_status_in_tx(&mut tx, &order, OrderStatus::Paid).await?;

        sqlx::query("DELETE FROM pending_downgrades WHERE id = $1")
            .bind(record.id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        tracing::info!(
            user_id = %record.user_id,
            order_no = %order.order_no,
            to_plan = %target.code,
            effective_at = %record.effective_at,
            "Scheduled downgrade applied"
        );

        Ok(true)
    }

    /// The user's newest unexpired `paid`/`completed` order
    async fn active_subscription(
        &self,
        user_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<Order> {
        let order: Option<Order> = sqlx::query_as(
            r#"
            SELECT id, user_id, plan_id, order_no, original_amount, pay_amount,
                   status, expired_at, created_at, updated_at
            FROM orders
            WHERE user_id = $1 AND status IN ($2, $3) AND expired_at > $4
            ORDER BY created_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .bind(OrderStatus::Paid)
        .bind(OrderStatus::Completed)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        order.ok_or(BillingError::NoActiveSubscription)
    }
}

/// Same as [`PlanChangeService::active_subscription`], but row-locked
async fn lock_active_subscription(
    conn: &mut PgConnection,
    user_id: Uuid,
    now: OffsetDateTime,
) -> BillingResult<Order> {
    let order: Option<Order> = sqlx::query_as(
        r#"
        SELECT id, user_id, plan_id, order_no, original_amount, pay_amount,
               status, expired_at, created_at, updated_at
        FROM orders
        WHERE user_id = $1 AND status IN ($2, $3) AND expired_at > $4
        ORDER BY created_at DESC, id DESC
        LIMIT 1
        FOR UPDATE
        "#,
    )
    .bind(user_id)
    .bind(OrderStatus::Paid)
    .bind(OrderStatus::Completed)
    .bind(now)
    .fetch_optional(&mut *conn)
    .await?;

    order.ok_or(BillingError::NoActiveSubscription)
}

/// Pure proration math over two plans and the remaining whole days
///
/// Direction comes from the price delta; equal prices are rejected as
/// `SamePlan`. The credit can never exceed the current plan's price (the
/// remaining days are clamped to the plan duration), so an upgrade charge is
/// always positive.
pub(crate) fn quote(current: &Plan, target: &Plan, remaining_days: i64) -> BillingResult<ChangeQuote> {
    if target.price == current.price {
        return Err(BillingError::SamePlan);
    }

    let duration = i64::from(current.duration_days);
    let remaining = remaining_days.clamp(0, duration);
    let prorated_credit = current.price * remaining / duration;

    if target.price > current.price {
        Ok(ChangeQuote {
            direction: ChangeDirection::Upgrade,
            remaining_days: remaining,
            prorated_credit,
            charge_amount: (target.price - prorated_credit).max(0),
        })
    } else {
        Ok(ChangeQuote {
            direction: ChangeDirection::Downgrade,
            remaining_days: remaining,
            prorated_credit,
            charge_amount: 0,
        })
    }
}

/// Whole days between `now` and `expired_at`, floored, never negative
fn remaining_whole_days(expired_at: OffsetDateTime, now: OffsetDateTime) -> i64 {
    (expired_at - now).whole_days().max(0)
}

/// Fetch a plan row, active or not
async fn fetch_plan(pool: &PgPool, plan_id: Uuid) -> BillingResult<Plan> {
    let plan: Option<Plan> = sqlx::query_as(
        "SELECT id, code, name, price, duration_days, active, created_at
         FROM plans WHERE id = $1",
    )
    .bind(plan_id)
    .fetch_optional(pool)
    .await?;

    plan.ok_or_else(|| BillingError::NotFound(format!("plan {}", plan_id)))
}

/// Fetch a plan row inside an open transaction
async fn fetch_plan_in_tx(conn: &mut PgConnection, plan_id: Uuid) -> BillingResult<Plan> {
    let plan: Option<Plan> = sqlx::query_as(
        "SELECT id, code, name, price, duration_days, active, created_at
         FROM plans WHERE id = $1",
    )
    .bind(plan_id)
    .fetch_optional(&mut *conn)
    .await?;

    plan.ok_or_else(|| BillingError::NotFound(format!("plan {}", plan_id)))
}
