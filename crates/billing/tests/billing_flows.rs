//! Integration tests for the billing engine
//!
//! These tests verify the money-safety invariants against a real Postgres:
//! ledger conservation, upgrade atomicity, the order state machine, and the
//! at-most-one pending downgrade rule.
//!
//! ## Running Tests
//! ```bash
//! export DATABASE_URL="postgres://localhost/proxypanel_test"
//! cargo test -p proxypanel-billing -- --ignored --test-threads=1
//! ```

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;

use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use proxypanel_billing::{
    BillingError, Clock, CreatePlanRequest, FixedClock, LedgerService, OrderService,
    PlanChangeService, PlanService,
};
use proxypanel_shared::types::{OrderStatus, Plan, TransactionType};

// ============================================================================
// Test Utilities
// ============================================================================

/// Connect to the test database and run migrations
async fn setup_pool() -> PgPool {
    let database_url =
        std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for integration tests");

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .expect("Failed to connect to test database");

    proxypanel_shared::db::run_migrations(&pool)
        .await
        .expect("Failed to run migrations");

    pool
}

fn services_at(pool: &PgPool, now: OffsetDateTime) -> (OrderService, LedgerService, PlanChangeService) {
    let clock: Arc<dyn Clock> = Arc::new(FixedClock(now));
    (
        OrderService::new(pool.clone(), clock.clone()),
        LedgerService::new(pool.clone()),
        PlanChangeService::new(pool.clone(), clock),
    )
}

/// Create a plan with a unique code
async fn create_test_plan(pool: &PgPool, price: i64, duration_days: i32) -> Plan {
    let plans = PlanService::new(pool.clone());
    plans
        .create_plan(CreatePlanRequest {
            code: format!("test-plan-{}", Uuid::new_v4()),
            name: "Test Plan".to_string(),
            price,
            duration_days,
        })
        .await
        .expect("Failed to create test plan")
}

/// Fund the user and move a fresh order for `plan` to `paid`, simulating a
/// completed purchase at `now`
async fn create_paid_order(
    pool: &PgPool,
    user_id: Uuid,
    plan: &Plan,
    now: OffsetDateTime,
) -> proxypanel_shared::types::Order {
    let (orders, ledger, _) = services_at(pool, now);

    ledger
        .recharge(user_id, plan.price, "test top-up")
        .await
        .expect("Failed to fund test user");

    let order = orders
        .create(user_id, plan.id)
        .await
        .expect("Failed to create test order");

    ledger
        .charge(user_id, plan.price, order.id, "test purchase")
        .await
        .expect("Failed to charge test user");

    orders
        .update_status(order.id, OrderStatus::Paid)
        .await
        .expect("Failed to mark test order paid")
}

/// Cleanup test data after test completion
async fn cleanup_test_data(pool: &PgPool, user_id: Uuid) {
    // Delete in order to respect foreign key constraints

    sqlx::query("DELETE FROM balance_transactions WHERE user_id = $1")
        .bind(user_id)
        .execute(pool)
        .await
        .ok(); // Ignore errors during cleanup

    sqlx::query("DELETE FROM pending_downgrades WHERE user_id = $1")
        .bind(user_id)
        .execute(pool)
        .await
        .ok();

    sqlx::query("DELETE FROM orders WHERE user_id = $1")
        .bind(user_id)
        .execute(pool)
        .await
        .ok();

    sqlx::query("DELETE FROM balance_accounts WHERE user_id = $1")
        .bind(user_id)
        .execute(pool)
        .await
        .ok();
}

async fn order_count(pool: &PgPool, user_id: Uuid) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM orders WHERE user_id = $1")
        .bind(user_id)
        .fetch_one(pool)
        .await
        .expect("Failed to count orders")
}

async fn transaction_count(pool: &PgPool, user_id: Uuid) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM balance_transactions WHERE user_id = $1")
        .bind(user_id)
        .fetch_one(pool)
        .await
        .expect("Failed to count transactions")
}

// ============================================================================
// Test Cases: Ledger
// ============================================================================

#[tokio::test]
#[ignore] // Requires database
async fn test_ledger_conservation() {
    // Given: A user with a mixed sequence of ledger mutations
    let pool = setup_pool().await;
    let user_id = Uuid::new_v4();
    let now = OffsetDateTime::now_utc();
    let (orders, ledger, _) = services_at(&pool, now);
    let plan = create_test_plan(&pool, 1_000, 30).await;

    ledger.recharge(user_id, 5_000, "top-up").await.unwrap();
    ledger
        .adjust(user_id, -300, "manual correction", "admin@test")
        .await
        .unwrap();
    let order = orders.create(user_id, plan.id).await.unwrap();
    ledger
        .charge(user_id, 1_000, order.id, "plan purchase")
        .await
        .unwrap();
    ledger
        .credit(user_id, 250, order.id, "partial refund")
        .await
        .unwrap();

    // When: The full transaction log is replayed in creation order
    let page = ledger.list_transactions(user_id, 1, 50).await.unwrap();
    let mut entries = page.data.clone();
    entries.reverse(); // list is newest-first

    // Then: Every snapshot matches the running sum, and the cached balance
    // equals the total
    let mut running = 0i64;
    for entry in &entries {
        running += entry.amount;
        assert_eq!(
            entry.balance_after, running,
            "Snapshot must equal replayed sum at entry {}",
            entry.id
        );
    }
    assert_eq!(running, 5_000 - 300 - 1_000 + 250);
    assert_eq!(ledger.get_balance(user_id).await.unwrap(), running);
    assert_eq!(page.total, 4);

    cleanup_test_data(&pool, user_id).await;
}

#[tokio::test]
#[ignore]
async fn test_adjust_may_push_balance_negative() {
    // Given: A user with no balance row yet
    let pool = setup_pool().await;
    let user_id = Uuid::new_v4();
    let now = OffsetDateTime::now_utc();
    let (_, ledger, _) = services_at(&pool, now);

    // When: An administrative adjustment debits more than the balance
    let entry = ledger
        .adjust(user_id, -500, "chargeback penalty", "admin@test")
        .await
        .unwrap();

    // Then: The balance goes negative and the operator is on record
    assert_eq!(entry.balance_after, -500);
    assert_eq!(entry.tx_type, TransactionType::Adjust);
    assert_eq!(entry.operator.as_deref(), Some("admin@test"));
    assert_eq!(ledger.get_balance(user_id).await.unwrap(), -500);

    cleanup_test_data(&pool, user_id).await;
}

#[tokio::test]
#[ignore]
async fn test_charge_insufficient_balance_changes_nothing() {
    // Given: A user holding 100
    let pool = setup_pool().await;
    let user_id = Uuid::new_v4();
    let now = OffsetDateTime::now_utc();
    let (orders, ledger, _) = services_at(&pool, now);
    let plan = create_test_plan(&pool, 1_000, 30).await;

    ledger.recharge(user_id, 100, "small top-up").await.unwrap();
    let order = orders.create(user_id, plan.id).await.unwrap();
    let tx_before = transaction_count(&pool, user_id).await;

    // When: A charge exceeds the balance
    let result = ledger.charge(user_id, 1_000, order.id, "purchase").await;

    // Then: InsufficientBalance, and neither balance nor log moved
    match result {
        Err(BillingError::InsufficientBalance {
            required,
            available,
        }) => {
            assert_eq!(required, 1_000);
            assert_eq!(available, 100);
        }
        other => panic!("Expected InsufficientBalance, got: {:?}", other),
    }
    assert_eq!(ledger.get_balance(user_id).await.unwrap(), 100);
    assert_eq!(transaction_count(&pool, user_id).await, tx_before);

    cleanup_test_data(&pool, user_id).await;
}

// ============================================================================
// Test Cases: Order Lifecycle
// ============================================================================

#[tokio::test]
#[ignore]
async fn test_order_creation_invariant() {
    // Given: An active plan
    let pool = setup_pool().await;
    let user_id = Uuid::new_v4();
    let now = OffsetDateTime::now_utc();
    let (orders, _, _) = services_at(&pool, now);
    let plan = create_test_plan(&pool, 2_500, 30).await;

    // When: Two orders are created
    let first = orders.create(user_id, plan.id).await.unwrap();
    let second = orders.create(user_id, plan.id).await.unwrap();

    // Then: Both are pending at full price, expire in the future, and carry
    // distinct non-empty order numbers
    for order in [&first, &second] {
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.original_amount, 2_500);
        assert_eq!(order.pay_amount, 2_500);
        assert!(order.expired_at > now);
        assert!(!order.order_no.is_empty());
    }
    assert_ne!(first.order_no, second.order_no);

    cleanup_test_data(&pool, user_id).await;
}

#[tokio::test]
#[ignore]
async fn test_inactive_plan_rejected_at_creation() {
    // Given: A deactivated plan
    let pool = setup_pool().await;
    let user_id = Uuid::new_v4();
    let now = OffsetDateTime::now_utc();
    let (orders, _, _) = services_at(&pool, now);
    let plans = PlanService::new(pool.clone());
    let plan = create_test_plan(&pool, 1_000, 30).await;
    plans.deactivate_plan(plan.id).await.unwrap();

    // When: An order is created against it
    let result = orders.create(user_id, plan.id).await;

    // Then: PlanInactive
    assert!(matches!(result, Err(BillingError::PlanInactive(_))));

    cleanup_test_data(&pool, user_id).await;
}

#[tokio::test]
#[ignore]
async fn test_status_transition_legality() {
    // Given: A pending order
    let pool = setup_pool().await;
    let user_id = Uuid::new_v4();
    let now = OffsetDateTime::now_utc();
    let (orders, _, _) = services_at(&pool, now);
    let plan = create_test_plan(&pool, 1_000, 30).await;
    let order = orders.create(user_id, plan.id).await.unwrap();

    // Then: pending accepts only paid/cancelled
    for target in [OrderStatus::Completed, OrderStatus::Refunded] {
        let result = orders.update_status(order.id, target).await;
        assert!(
            matches!(result, Err(BillingError::InvalidTransition { .. })),
            "pending -> {} must be rejected",
            target
        );
    }

    let order = orders.update_status(order.id, OrderStatus::Paid).await.unwrap();
    assert_eq!(order.status, OrderStatus::Paid);

    // And: paid accepts only completed/refunded
    for target in [OrderStatus::Paid, OrderStatus::Cancelled, OrderStatus::Pending] {
        let result = orders.update_status(order.id, target).await;
        assert!(
            matches!(result, Err(BillingError::InvalidTransition { .. })),
            "paid -> {} must be rejected",
            target
        );
    }

    let order = orders
        .update_status(order.id, OrderStatus::Completed)
        .await
        .unwrap();
    assert_eq!(order.status, OrderStatus::Completed);

    // And: completed is terminal
    let result = orders.update_status(order.id, OrderStatus::Refunded).await;
    assert!(matches!(result, Err(BillingError::InvalidTransition { .. })));

    cleanup_test_data(&pool, user_id).await;
}

#[tokio::test]
#[ignore]
async fn test_cancel_only_from_pending() {
    let pool = setup_pool().await;
    let user_id = Uuid::new_v4();
    let now = OffsetDateTime::now_utc();
    let (orders, _, _) = services_at(&pool, now);
    let plan = create_test_plan(&pool, 1_000, 30).await;

    // Given: A pending order, where cancel succeeds
    let order = orders.create(user_id, plan.id).await.unwrap();
    let cancelled = orders.cancel(order.id).await.unwrap();
    assert_eq!(cancelled.status, OrderStatus::Cancelled);

    // Given: A paid order, where cancel is rejected
    let paid = create_paid_order(&pool, user_id, &plan, now).await;
    let result = orders.cancel(paid.id).await;
    assert!(matches!(result, Err(BillingError::InvalidTransition { .. })));

    cleanup_test_data(&pool, user_id).await;
}

#[tokio::test]
#[ignore]
async fn test_refund_credits_ledger_and_flips_status() {
    // Given: A paid order (balance drained back to zero by the purchase)
    let pool = setup_pool().await;
    let user_id = Uuid::new_v4();
    let now = OffsetDateTime::now_utc();
    let (orders, ledger, _) = services_at(&pool, now);
    let plan = create_test_plan(&pool, 1_000, 30).await;
    let order = create_paid_order(&pool, user_id, &plan, now).await;
    assert_eq!(ledger.get_balance(user_id).await.unwrap(), 0);

    // When: The order is refunded
    let refunded = orders.refund(order.id, "service unavailable").await.unwrap();

    // Then: Status flips and the pay amount comes back as a refund entry
    assert_eq!(refunded.status, OrderStatus::Refunded);
    assert_eq!(ledger.get_balance(user_id).await.unwrap(), 1_000);

    let page = ledger.list_transactions(user_id, 1, 10).await.unwrap();
    let newest = &page.data[0];
    assert_eq!(newest.tx_type, TransactionType::Refund);
    assert_eq!(newest.amount, 1_000);
    assert_eq!(newest.order_id, Some(order.id));

    cleanup_test_data(&pool, user_id).await;
}

#[tokio::test]
#[ignore]
async fn test_ownership_isolation() {
    // Given: Orders for two distinct users
    let pool = setup_pool().await;
    let user_a = Uuid::new_v4();
    let user_b = Uuid::new_v4();
    let now = OffsetDateTime::now_utc();
    let (orders, _, _) = services_at(&pool, now);
    let plan = create_test_plan(&pool, 1_000, 30).await;

    orders.create(user_a, plan.id).await.unwrap();
    orders.create(user_b, plan.id).await.unwrap();
    orders.create(user_b, plan.id).await.unwrap();

    // When: Each user's listing is fetched
    let listing_a = orders.list_by_user(user_a, 1, 50).await.unwrap();
    let listing_b = orders.list_by_user(user_b, 1, 50).await.unwrap();

    // Then: No order crosses the ownership boundary
    assert_eq!(listing_a.total, 1);
    assert!(listing_a.data.iter().all(|o| o.user_id == user_a));
    assert_eq!(listing_b.total, 2);
    assert!(listing_b.data.iter().all(|o| o.user_id == user_b));

    cleanup_test_data(&pool, user_a).await;
    cleanup_test_data(&pool, user_b).await;
}

// ============================================================================
// Test Cases: Plan Changes
// ============================================================================

#[tokio::test]
#[ignore]
async fn test_upgrade_flow_charges_prorated_amount() {
    // Given: Basic (1000/30d) active with exactly 15 days remaining and a
    // balance of 5000
    let pool = setup_pool().await;
    let user_id = Uuid::new_v4();
    let t0 = OffsetDateTime::now_utc();
    let basic = create_test_plan(&pool, 1_000, 30).await;
    let pro = create_test_plan(&pool, 3_000, 30).await;

    create_paid_order(&pool, user_id, &basic, t0).await;

    let mid_cycle = t0 + Duration::days(15);
    let (_, ledger, plan_changes) = services_at(&pool, mid_cycle);
    ledger.recharge(user_id, 5_000, "top-up").await.unwrap();

    // When: The change is quoted and then executed
    let change = plan_changes
        .calculate_change(user_id, basic.id, pro.id)
        .await
        .unwrap();
    assert_eq!(change.prorated_credit, 500); // 1000 * 15 / 30
    assert_eq!(change.charge_amount, 2_500);

    let order = plan_changes
        .execute_upgrade(user_id, basic.id, pro.id)
        .await
        .unwrap();

    // Then: A paid order for Pro at the prorated amount, and one consume
    // entry of -2500 on the ledger
    assert_eq!(order.status, OrderStatus::Paid);
    assert_eq!(order.plan_id, pro.id);
    assert_eq!(order.original_amount, 3_000);
    assert_eq!(order.pay_amount, 2_500);
    assert_eq!(ledger.get_balance(user_id).await.unwrap(), 2_500);

    let page = ledger.list_transactions(user_id, 1, 10).await.unwrap();
    let newest = &page.data[0];
    assert_eq!(newest.tx_type, TransactionType::Consume);
    assert_eq!(newest.amount, -2_500);
    assert_eq!(newest.order_id, Some(order.id));

    cleanup_test_data(&pool, user_id).await;
}

#[tokio::test]
#[ignore]
async fn test_upgrade_atomicity_on_insufficient_balance() {
    // Given: An active Basic subscription and a balance far below the
    // prorated upgrade charge
    let pool = setup_pool().await;
    let user_id = Uuid::new_v4();
    let t0 = OffsetDateTime::now_utc();
    let basic = create_test_plan(&pool, 1_000, 30).await;
    let pro = create_test_plan(&pool, 3_000, 30).await;

    create_paid_order(&pool, user_id, &basic, t0).await;

    let mid_cycle = t0 + Duration::days(15);
    let (_, ledger, plan_changes) = services_at(&pool, mid_cycle);
    ledger.recharge(user_id, 100, "small top-up").await.unwrap();

    let orders_before = order_count(&pool, user_id).await;
    let tx_before = transaction_count(&pool, user_id).await;
    let balance_before = ledger.get_balance(user_id).await.unwrap();

    // When: The upgrade is attempted
    let result = plan_changes.execute_upgrade(user_id, basic.id, pro.id).await;

    // Then: InsufficientBalance, and no order, ledger entry, or balance
    // change is observable
    assert!(matches!(
        result,
        Err(BillingError::InsufficientBalance { .. })
    ));
    assert_eq!(order_count(&pool, user_id).await, orders_before);
    assert_eq!(transaction_count(&pool, user_id).await, tx_before);
    assert_eq!(ledger.get_balance(user_id).await.unwrap(), balance_before);

    cleanup_test_data(&pool, user_id).await;
}

#[tokio::test]
#[ignore]
async fn test_upgrade_rejects_downgrade_direction() {
    // Given: An active Pro subscription
    let pool = setup_pool().await;
    let user_id = Uuid::new_v4();
    let t0 = OffsetDateTime::now_utc();
    let basic = create_test_plan(&pool, 1_000, 30).await;
    let pro = create_test_plan(&pool, 3_000, 30).await;

    create_paid_order(&pool, user_id, &pro, t0).await;

    let (_, _, plan_changes) = services_at(&pool, t0 + Duration::days(5));

    // When/Then: Executing Pro -> Basic as an upgrade is refused
    let result = plan_changes.execute_upgrade(user_id, pro.id, basic.id).await;
    assert!(matches!(result, Err(BillingError::DowngradeNotAllowed)));

    cleanup_test_data(&pool, user_id).await;
}

#[tokio::test]
#[ignore]
async fn test_upgrade_requires_active_subscription() {
    // Given: A user with no orders at all
    let pool = setup_pool().await;
    let user_id = Uuid::new_v4();
    let now = OffsetDateTime::now_utc();
    let basic = create_test_plan(&pool, 1_000, 30).await;
    let pro = create_test_plan(&pool, 3_000, 30).await;
    let (_, _, plan_changes) = services_at(&pool, now);

    // When/Then: The upgrade is refused outright
    let result = plan_changes.execute_upgrade(user_id, basic.id, pro.id).await;
    assert!(matches!(result, Err(BillingError::NoActiveSubscription)));

    cleanup_test_data(&pool, user_id).await;
}

#[tokio::test]
#[ignore]
async fn test_at_most_one_pending_downgrade() {
    // Given: An active Pro subscription
    let pool = setup_pool().await;
    let user_id = Uuid::new_v4();
    let t0 = OffsetDateTime::now_utc();
    let basic = create_test_plan(&pool, 1_000, 30).await;
    let pro = create_test_plan(&pool, 3_000, 30).await;

    let pro_order = create_paid_order(&pool, user_id, &pro, t0).await;

    let (_, _, plan_changes) = services_at(&pool, t0 + Duration::days(5));

    // When: A downgrade is scheduled
    let record = plan_changes
        .schedule_downgrade(user_id, pro.id, basic.id)
        .await
        .unwrap();

    // Then: It lands on the billing-cycle boundary
    assert_eq!(record.effective_at, pro_order.expired_at);
    assert_eq!(record.to_plan_id, basic.id);

    // And: A second schedule attempt is rejected while one is outstanding
    let second = plan_changes.schedule_downgrade(user_id, pro.id, basic.id).await;
    assert!(matches!(second, Err(BillingError::PendingDowngrade)));

    // And: Cancel-then-reschedule succeeds
    plan_changes.cancel_pending_downgrade(user_id).await.unwrap();
    plan_changes
        .schedule_downgrade(user_id, pro.id, basic.id)
        .await
        .unwrap();

    cleanup_test_data(&pool, user_id).await;
}

#[tokio::test]
#[ignore]
async fn test_schedule_downgrade_rejects_upgrade_direction() {
    // Given: An active Basic subscription
    let pool = setup_pool().await;
    let user_id = Uuid::new_v4();
    let t0 = OffsetDateTime::now_utc();
    let basic = create_test_plan(&pool, 1_000, 30).await;
    let pro = create_test_plan(&pool, 3_000, 30).await;

    create_paid_order(&pool, user_id, &basic, t0).await;

    let (_, _, plan_changes) = services_at(&pool, t0 + Duration::days(5));

    // When/Then: Scheduling Basic -> Pro as a downgrade is refused
    let result = plan_changes.schedule_downgrade(user_id, basic.id, pro.id).await;
    assert!(matches!(result, Err(BillingError::UpgradeNotAllowed)));

    cleanup_test_data(&pool, user_id).await;
}

#[tokio::test]
#[ignore]
async fn test_cancel_pending_downgrade_without_one() {
    let pool = setup_pool().await;
    let user_id = Uuid::new_v4();
    let (_, _, plan_changes) = services_at(&pool, OffsetDateTime::now_utc());

    let result = plan_changes.cancel_pending_downgrade(user_id).await;
    assert!(matches!(result, Err(BillingError::NoPendingDowngrade)));

    let result = plan_changes.get_pending_downgrade(user_id).await;
    assert!(matches!(result, Err(BillingError::NoPendingDowngrade)));
}

#[tokio::test]
#[ignore]
async fn test_apply_scheduled_downgrades_materializes_order() {
    // Given: A scheduled Pro -> Basic downgrade whose boundary has passed
    let pool = setup_pool().await;
    let user_id = Uuid::new_v4();
    let t0 = OffsetDateTime::now_utc();
    let basic = create_test_plan(&pool, 1_000, 30).await;
    let pro = create_test_plan(&pool, 3_000, 30).await;

    let pro_order = create_paid_order(&pool, user_id, &pro, t0).await;

    let (_, ledger, plan_changes) = services_at(&pool, t0 + Duration::days(5));
    plan_changes
        .schedule_downgrade(user_id, pro.id, basic.id)
        .await
        .unwrap();

    let balance_before = ledger.get_balance(user_id).await.unwrap();
    let tx_before = transaction_count(&pool, user_id).await;

    // When: The scheduler sweeps past the boundary
    let applied = plan_changes
        .apply_scheduled_downgrades(pro_order.expired_at + Duration::minutes(1))
        .await
        .unwrap();

    // Then: Exactly one free paid order for Basic exists, the pending record
    // is gone, and the ledger never moved
    assert_eq!(applied, 1);

    let (orders, _, _) = services_at(&pool, t0);
    let listing = orders.list_by_user(user_id, 1, 10).await.unwrap();
    let downgrade_order = listing
        .data
        .iter()
        .find(|o| o.plan_id == basic.id)
        .expect("Downgrade order should exist");
    assert_eq!(downgrade_order.status, OrderStatus::Paid);
    assert_eq!(downgrade_order.original_amount, 1_000);
    assert_eq!(downgrade_order.pay_amount, 0);
    assert_eq!(
        downgrade_order.expired_at,
        pro_order.expired_at + Duration::days(30)
    );

    let pending = plan_changes.get_pending_downgrade(user_id).await;
    assert!(matches!(pending, Err(BillingError::NoPendingDowngrade)));

    assert_eq!(ledger.get_balance(user_id).await.unwrap(), balance_before);
    assert_eq!(transaction_count(&pool, user_id).await, tx_before);

    cleanup_test_data(&pool, user_id).await;
}

#[tokio::test]
#[ignore]
async fn test_apply_scheduled_downgrades_skips_future_boundaries() {
    // Given: A downgrade scheduled for a boundary still weeks away
    let pool = setup_pool().await;
    let user_id = Uuid::new_v4();
    let t0 = OffsetDateTime::now_utc();
    let basic = create_test_plan(&pool, 1_000, 30).await;
    let pro = create_test_plan(&pool, 3_000, 30).await;

    create_paid_order(&pool, user_id, &pro, t0).await;

    let (_, _, plan_changes) = services_at(&pool, t0 + Duration::days(5));
    plan_changes
        .schedule_downgrade(user_id, pro.id, basic.id)
        .await
        .unwrap();

    // When: The scheduler sweeps before the boundary
    let applied = plan_changes
        .apply_scheduled_downgrades(t0 + Duration::days(6))
        .await
        .unwrap();

    // Then: Nothing happens and the record survives
    assert_eq!(applied, 0);
    assert!(plan_changes.get_pending_downgrade(user_id).await.is_ok());

    cleanup_test_data(&pool, user_id).await;
}

// ============================================================================
// Test Cases: Worker Upkeep
// ============================================================================

#[tokio::test]
#[ignore]
async fn test_expire_overdue_pending_orders() {
    // Given: One stale pending order and one fresh pending order
    let pool = setup_pool().await;
    let user_id = Uuid::new_v4();
    let now = OffsetDateTime::now_utc();
    let (orders, _, _) = services_at(&pool, now);
    let plan = create_test_plan(&pool, 1_000, 30).await;

    let stale = orders.create(user_id, plan.id).await.unwrap();
    sqlx::query("UPDATE orders SET created_at = $2 WHERE id = $1")
        .bind(stale.id)
        .bind(now - Duration::hours(48))
        .execute(&pool)
        .await
        .unwrap();
    let fresh = orders.create(user_id, plan.id).await.unwrap();

    // When: The expiry sweep runs with a 24h cutoff
    let cancelled = orders
        .expire_overdue_pending(now, Duration::hours(24))
        .await
        .unwrap();

    // Then: Only the stale order was cancelled
    assert_eq!(cancelled, 1);
    assert_eq!(orders.get(stale.id).await.unwrap().status, OrderStatus::Cancelled);
    assert_eq!(orders.get(fresh.id).await.unwrap().status, OrderStatus::Pending);

    cleanup_test_data(&pool, user_id).await;
}
