//! Billing & plan-change engine for ProxyPanel
//!
//! Three components, composed bottom-up:
//! - [`ledger::LedgerService`]: authoritative, race-free accounting of user
//!   funds (cached balance plus an append-only transaction log)
//! - [`orders::OrderService`]: order creation and the order status state
//!   machine; never moves money itself
//! - [`plan_change::PlanChangeService`]: proration math, immediate upgrades
//!   (order + charge in one transaction), deferred downgrades
//!
//! Every money-moving path runs inside a single database transaction so that
//! partial application (order without charge, charge without order) is never
//! observable. Callers outside this crate (HTTP handlers, the worker) only
//! see the service methods re-exported here.

pub mod clock;
pub mod error;
pub mod ledger;
pub mod orders;
pub mod plan_change;
pub mod plans;

pub use clock::{Clock, FixedClock, SystemClock};
pub use error::{BillingError, BillingResult};
pub use ledger::LedgerService;
pub use orders::OrderService;
pub use plan_change::{ChangeQuote, PlanChangeService};
pub use plans::{CreatePlanRequest, PlanService};
