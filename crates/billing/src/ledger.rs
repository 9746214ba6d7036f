//! Balance ledger service
//!
//! Authoritative, race-free accounting of user funds. Every mutation appends
//! one row to the transaction log and moves the cached balance in the same
//! database transaction; the log is the source of truth and replays to every
//! stored balance snapshot.
//!
//! Concurrency: mutations serialize per account through a single guarded
//! UPDATE on the balance row (`rows_affected` is the race arbiter). Unrelated
//! accounts never contend; there is no global lock anywhere in this module.

use proxypanel_shared::types::{BalanceTransaction, PaginatedResponse, TransactionType};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Balance ledger service
#[derive(Clone)]
pub struct LedgerService {
    pool: PgPool,
}

impl LedgerService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Current balance for a user
    ///
    /// Users without a ledger row simply have a zero balance; the row is
    /// created lazily on first mutation.
    pub async fn get_balance(&self, user_id: Uuid) -> BillingResult<i64> {
        let balance: Option<i64> =
            sqlx::query_scalar("SELECT balance FROM balance_accounts WHERE user_id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(balance.unwrap_or(0))
    }

    /// Administrative balance adjustment
    ///
    /// The only path that may push a balance negative. `operator` and
    /// `reason` are recorded on the ledger entry for the audit trail.
    pub async fn adjust(
        &self,
        user_id: Uuid,
        amount: i64,
        reason: &str,
        operator: &str,
    ) -> BillingResult<BalanceTransaction> {
        if amount == 0 {
            return Err(BillingError::InvalidInput(
                "Adjustment amount must not be zero".to_string(),
            ));
        }

        let mut tx = self.pool.begin().await?;

        ensure_account(&mut tx, user_id).await?;
        let balance_after = apply_delta_unchecked(&mut tx, user_id, amount).await?;
        let entry = record_entry(
            &mut tx,
            user_id,
            TransactionType::Adjust,
            amount,
            balance_after,
            None,
            reason,
            Some(operator),
        )
        .await?;

        tx.commit().await?;

        tracing::info!(
            user_id = %user_id,
            amount = amount,
            balance_after = balance_after,
            operator = %operator,
            "Balance adjusted"
        );

        Ok(entry)
    }

    /// Record a captured top-up
    ///
    /// Invoked by the payment-gateway collaborator after an external payment
    /// has been captured; the gateway itself is outside this crate.
    pub async fn recharge(
        &self,
        user_id: Uuid,
        amount: i64,
        description: &str,
    ) -> BillingResult<BalanceTransaction> {
        if amount <= 0 {
            return Err(BillingError::InvalidInput(
                "Recharge amount must be positive".to_string(),
            ));
        }

        let mut tx = self.pool.begin().await?;

        ensure_account(&mut tx, user_id).await?;
        let balance_after = apply_delta_unchecked(&mut tx, user_id, amount).await?;
        let entry = record_entry(
            &mut tx,
            user_id,
            TransactionType::Recharge,
            amount,
            balance_after,
            None,
            description,
            None,
        )
        .await?;

        tx.commit().await?;

        tracing::info!(
            user_id = %user_id,
            amount = amount,
            balance_after = balance_after,
            "Balance recharged"
        );

        Ok(entry)
    }

    /// Debit a user for an order
    ///
    /// Fails with `InsufficientBalance` and leaves all state unchanged when
    /// the current balance cannot cover `amount`.
    pub async fn charge(
        &self,
        user_id: Uuid,
        amount: i64,
        order_id: Uuid,
        description: &str,
    ) -> BillingResult<BalanceTransaction> {
        let mut tx = self.pool.begin().await?;
        let entry = charge_in_tx(&mut tx, user_id, amount, Some(order_id), description).await?;
        tx.commit().await?;
        Ok(entry)
    }

    /// Credit a user for an order (refunds, prorated discounts)
    ///
    /// Always succeeds for a positive amount.
    pub async fn credit(
        &self,
        user_id: Uuid,
        amount: i64,
        order_id: Uuid,
        description: &str,
    ) -> BillingResult<BalanceTransaction> {
        let mut tx = self.pool.begin().await?;
        let entry = credit_in_tx(&mut tx, user_id, amount, Some(order_id), description).await?;
        tx.commit().await?;
        Ok(entry)
    }

    /// Paginated transaction log for a user, newest first
    pub async fn list_transactions(
        &self,
        user_id: Uuid,
        page: i64,
        per_page: i64,
    ) -> BillingResult<PaginatedResponse<BalanceTransaction>> {
        let page = page.max(1);
        let per_page = per_page.clamp(1, 200);
        let offset = (page - 1) * per_page;

        let total: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM balance_transactions WHERE user_id = $1")
                .bind(user_id)
                .fetch_one(&self.pool)
                .await?;

        let items: Vec<BalanceTransaction> = sqlx::query_as(
            r#"
            SELECT id, seq, user_id, tx_type, amount, balance_after, order_id,
                   description, operator, created_at
            FROM balance_transactions
            WHERE user_id = $1
            ORDER BY seq DESC
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
}

// =============================================================================
// In-transaction building blocks
//
// These take an open connection so callers (the plan-change engine) can span
// ledger and order writes in one unit of work. Both succeed or neither does.
// =============================================================================

/// Debit `amount` from a user inside an open transaction
///
/// The guarded UPDATE is the whole race story: two concurrent charges on one
/// account serialize on the row, and the loser re-evaluates `balance >= $2`
/// against the committed value. `rows_affected == 0` means the funds are not
/// there, reported as `InsufficientBalance` with the observed balance.
pub(crate) async fn charge_in_tx(
    conn: &mut PgConnection,
    user_id: Uuid,
    amount: i64,
    order_id: Option<Uuid>,
    description: &str,
) -> BillingResult<BalanceTransaction> {
    if amount <= 0 {
        return Err(BillingError::InvalidInput(
            "Charge amount must be positive".to_string(),
        ));
    }

    ensure_account(conn, user_id).await?;

    let balance_after: Option<i64> = sqlx::query_scalar(
        r#"
        UPDATE balance_accounts
        SET balance = balance - $2, version = version + 1, updated_at = NOW()
        WHERE user_id = $1 AND balance >= $2
        RETURNING balance
        "#,
    )
    .bind(user_id)
    .bind(amount)
    .fetch_optional(&mut *conn)
    .await?;

    let Some(balance_after) = balance_after else {
        let available: i64 =
            sqlx::query_scalar("SELECT balance FROM balance_accounts WHERE user_id = $1")
                .bind(user_id)
                .fetch_one(&mut *conn)
                .await?;
        return Err(BillingError::InsufficientBalance {
            required: amount,
            available,
        });
    };

    let entry = record_entry(
        conn,
        user_id,
        TransactionType::Consume,
        -amount,
        balance_after,
        order_id,
        description,
        None,
    )
    .await?;

    tracing::info!(
        user_id = %user_id,
        amount = amount,
        balance_after = balance_after,
        order_id = ?order_id,
        "Balance charged"
    );

    Ok(entry)
}

/// Credit `amount` to a user inside an open transaction
pub(crate) async fn credit_in_tx(
    conn: &mut PgConnection,
    user_id: Uuid,
    amount: i64,
    order_id: Option<Uuid>,
    description: &str,
) -> BillingResult<BalanceTransaction> {
    if amount <= 0 {
        return Err(BillingError::InvalidInput(
            "Credit amount must be positive".to_string(),
        ));
    }

    ensure_account(conn, user_id).await?;
    let balance_after = apply_delta_unchecked(conn, user_id, amount).await?;
    let entry = record_entry(
        conn,
        user_id,
        TransactionType::Refund,
        amount,
        balance_after,
        order_id,
        description,
        None,
    )
    .await?;

    tracing::info!(
        user_id = %user_id,
        amount = amount,
        balance_after = balance_after,
        order_id = ?order_id,
        "Balance credited"
    );

    Ok(entry)
}

/// Create the balance row at zero if the user has never been touched
async fn ensure_account(conn: &mut PgConnection, user_id: Uuid) -> BillingResult<()> {
    sqlx::query(
        "INSERT INTO balance_accounts (user_id, balance) VALUES ($1, 0)
         ON CONFLICT (user_id) DO NOTHING",
    )
    .bind(user_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Apply a signed delta with no funds guard (adjust/credit paths)
async fn apply_delta_unchecked(
    conn: &mut PgConnection,
    user_id: Uuid,
    delta: i64,
) -> BillingResult<i64> {
    let balance_after: i64 = sqlx::query_scalar(
        r#"
        UPDATE balance_accounts
        SET balance = balance + $2, version = version + 1, updated_at = NOW()
        WHERE user_id = $1
        RETURNING balance
        "#,
    )
    .bind(user_id)
    .bind(delta)
    .fetch_one(&mut *conn)
    .await?;

    Ok(balance_after)
}

/// Append one ledger entry carrying the post-mutation balance snapshot
#[allow(clippy::too_many_arguments)]
async fn record_entry(
    conn: &mut PgConnection,
    user_id: Uuid,
    tx_type: TransactionType,
    amount: i64,
    balance_after: i64,
    order_id: Option<Uuid>,
    description: &str,
    operator: Option<&str>,
) -> BillingResult<BalanceTransaction> {
    let entry: BalanceTransaction = sqlx::query_as(
        r#"
        INSERT INTO balance_transactions
            (id, user_id, tx_type, amount, balance_after, order_id, description, operator)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        RETURNING id, seq, user_id, tx_type, amount, balance_after, order_id,
                  description, operator, created_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(user_id)
    .bind(tx_type)
    .bind(amount)
    .bind(balance_after)
    .bind(order_id)
    .bind(description)
    .bind(operator)
    .fetch_one(&mut *conn)
    .await?;

    Ok(entry)
}
