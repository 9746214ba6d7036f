//! Plan catalog service
//!
//! Plans are immutable once referenced by an order; deactivation only hides
//! them from new purchases. Orders created against a later-deactivated plan
//! keep working until they expire.

use proxypanel_shared::types::Plan;
use serde::Deserialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Request to create a catalog plan
#[derive(Debug, Clone, Deserialize)]
pub struct CreatePlanRequest {
    pub code: String,
    pub name: String,
    /// Price in minor currency units
    pub price: i64,
    pub duration_days: i32,
}

/// Plan catalog service
#[derive(Clone)]
pub struct PlanService {
    pool: PgPool,
}

impl PlanService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create a new plan, active and open for purchase
    pub async fn create_plan(&self, req: CreatePlanRequest) -> BillingResult<Plan> {
        if req.code.trim().is_empty() {
            return Err(BillingError::InvalidInput(
                "Plan code must not be empty".to_string(),
            ));
        }
        if req.price < 0 {
            return Err(BillingError::InvalidInput(
                "Plan price must not be negative".to_string(),
            ));
        }
        if req.duration_days <= 0 {
            return Err(BillingError::InvalidInput(
                "Plan duration must be at least one day".to_string(),
            ));
        }

        let plan: Plan = sqlx::query_as(
            r#"
            INSERT INTO plans (id, code, name, price, duration_days, active)
            VALUES ($1, $2, $3, $4, $5, TRUE)
            RETURNING id, code, name, price, duration_days, active, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(req.code.trim())
        .bind(&req.name)
        .bind(req.price)
        .bind(req.duration_days)
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(
            plan_id = %plan.id,
            code = %plan.code,
            price = plan.price,
            duration_days = plan.duration_days,
            "Plan created"
        );

        Ok(plan)
    }

    /// Get a plan by ID, active or not
    pub async fn get_plan(&self, plan_id: Uuid) -> BillingResult<Plan> {
        let plan: Option<Plan> = sqlx::query_as(
            "SELECT id, code, name, price, duration_days, active, created_at
             FROM plans WHERE id = $1",
        )
        .bind(plan_id)
        .fetch_optional(&self.pool)
        .await?;

        plan.ok_or_else(|| BillingError::NotFound(format!("plan {}", plan_id)))
    }

    /// Get a plan that is open for purchase
    ///
    /// Returns `PlanInactive` when the plan exists but has been deactivated.
    pub async fn get_active_plan(&self, plan_id: Uuid) -> BillingResult<Plan> {
        let plan = self.get_plan(plan_id).await?;
        if !plan.active {
            return Err(BillingError::PlanInactive(plan.code));
        }
        Ok(plan)
    }

    /// List all plans open for purchase, cheapest first
    pub async fn list_active_plans(&self) -> BillingResult<Vec<Plan>> {
        let plans: Vec<Plan> = sqlx::query_as(
            "SELECT id, code, name, price, duration_days, active, created_at
             FROM plans WHERE active = TRUE ORDER BY price ASC, code ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(plans)
    }

    /// Hide a plan from new purchases
    ///
    /// Existing orders referencing the plan are unaffected.
    pub async fn deactivate_plan(&self, plan_id: Uuid) -> BillingResult<()> {
        let result = sqlx::query("UPDATE plans SET active = FALSE WHERE id = $1")
            .bind(plan_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::NotFound(format!("plan {}", plan_id)));
        }

        tracing::info!(plan_id = %plan_id, "Plan deactivated");
        Ok(())
    }
}
