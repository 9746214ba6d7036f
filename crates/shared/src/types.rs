//! Common types used across ProxyPanel

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

// =============================================================================
// ID Wrappers
// =============================================================================

/// User ID wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub Uuid);

impl UserId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for UserId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Plan ID wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlanId(pub Uuid);

impl PlanId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PlanId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for PlanId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for PlanId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Order ID wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(pub Uuid);

impl OrderId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for OrderId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for OrderId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for OrderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

// =============================================================================
// Enums
// =============================================================================

/// Order lifecycle status
///
/// Legal transitions:
/// - `pending` → `paid` | `cancelled`
/// - `paid` → `completed` | `refunded`
///
/// `completed`, `cancelled`, and `refunded` are terminal. Everything else,
/// including a transition to the current status, is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Paid,
    Completed,
    Cancelled,
    Refunded,
}

impl OrderStatus {
    /// Check whether this status accepts no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Refunded)
    }

    /// Statuses reachable from this one
    pub fn allowed_transitions(&self) -> &'static [OrderStatus] {
        match self {
            Self::Pending => &[Self::Paid, Self::Cancelled],
            Self::Paid => &[Self::Completed, Self::Refunded],
            Self::Completed | Self::Cancelled | Self::Refunded => &[],
        }
    }

    /// Check whether `self → to` is a legal transition
    pub fn can_transition(&self, to: OrderStatus) -> bool {
        self.allowed_transitions().contains(&to)
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Paid => write!(f, "paid"),
            Self::Completed => write!(f, "completed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Refunded => write!(f, "refunded"),
        }
    }
}

impl std::str::FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "paid" => Ok(Self::Paid),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            "refunded" => Ok(Self::Refunded),
            _ => Err(format!("Invalid order status: {}", s)),
        }
    }
}

/// Ledger transaction type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TransactionType {
    Recharge,
    Consume,
    Refund,
    Adjust,
}

impl std::fmt::Display for TransactionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Recharge => write!(f, "recharge"),
            Self::Consume => write!(f, "consume"),
            Self::Refund => write!(f, "refund"),
            Self::Adjust => write!(f, "adjust"),
        }
    }
}

impl std::str::FromStr for TransactionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "recharge" => Ok(Self::Recharge),
            "consume" => Ok(Self::Consume),
            "refund" => Ok(Self::Refund),
            "adjust" => Ok(Self::Adjust),
            _ => Err(format!("Invalid transaction type: {}", s)),
        }
    }
}

/// Direction of a plan change, derived from the price delta
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeDirection {
    Upgrade,
    Downgrade,
}

impl std::fmt::Display for ChangeDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Upgrade => write!(f, "upgrade"),
            Self::Downgrade => write!(f, "downgrade"),
        }
    }
}

// =============================================================================
// Database Models
// =============================================================================

/// Subscription plan catalog entry
///
/// Immutable once referenced by an order; deactivation only hides the plan
/// from new purchases.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Plan {
    pub id: Uuid,
    /// Human-stable identifier (e.g., "basic-30d")
    pub code: String,
    pub name: String,
    /// Price in minor currency units
    pub price: i64,
    pub duration_days: i32,
    pub active: bool,
    pub created_at: OffsetDateTime,
}

/// Purchase intent for a plan
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Order {
    pub id: Uuid,
    pub user_id: Uuid,
    pub plan_id: Uuid,
    /// Globally unique, human-presentable order number
    pub order_no: String,
    /// Plan price at creation time, in minor units
    pub original_amount: i64,
    /// Amount actually charged (<= original_amount)
    pub pay_amount: i64,
    pub status: OrderStatus,
    pub expired_at: OffsetDateTime,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Cached per-user balance, derived from the transaction log
///
/// `version` increments on every mutation and backs the optimistic guard in
/// the ledger; the transaction log is the source of truth, this row is cache.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BalanceAccount {
    pub user_id: Uuid,
    pub balance: i64,
    pub version: i64,
    pub updated_at: OffsetDateTime,
}

/// Append-only ledger entry
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BalanceTransaction {
    pub id: Uuid,
    /// Strict creation order within the whole ledger (replay key)
    pub seq: i64,
    pub user_id: Uuid,
    pub tx_type: TransactionType,
    /// Signed delta in minor units (negative for consume)
    pub amount: i64,
    /// Account balance immediately after this entry was applied
    pub balance_after: i64,
    pub order_id: Option<Uuid>,
    pub description: String,
    /// Operator identity for admin-initiated entries
    pub operator: Option<String>,
    pub created_at: OffsetDateTime,
}

/// Deferred plan downgrade awaiting its billing-cycle boundary
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PendingDowngrade {
    pub id: Uuid,
    pub user_id: Uuid,
    pub from_plan_id: Uuid,
    pub to_plan_id: Uuid,
    pub effective_at: OffsetDateTime,
    pub created_at: OffsetDateTime,
}

// =============================================================================
// API Envelope Types
// =============================================================================

/// Paginated response wrapper
#[derive(Debug, Clone, Serialize)]
pub struct PaginatedResponse<T> {
    pub data: Vec<T>,
    pub total: i64,
    pub page: i64,
    pub per_page: i64,
    pub total_pages: i64,
}

impl<T> PaginatedResponse<T> {
    pub fn new(data: Vec<T>, total: i64, page: i64, per_page: i64) -> Self {
        let total_pages = (total + per_page - 1) / per_page;
        Self {
            data,
            total,
            page,
            per_page,
            total_pages,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
