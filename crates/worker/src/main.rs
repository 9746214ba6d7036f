//! ProxyPanel billing worker
//!
//! Plays the scheduler collaborator for the billing engine: applies due plan
//! downgrades at billing-cycle boundaries and cancels overdue pending orders.
//! All semantics live in `proxypanel-billing`; this binary only wires config,
//! the pool, and the cron cadence.

use std::sync::Arc;

use anyhow::Context;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing_subscriber::EnvFilter;

use proxypanel_billing::{Clock, OrderService, PlanChangeService, SystemClock};

mod config;
mod jobs;

use config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env()?;

    let pool = proxypanel_shared::db::create_pool(
        &config.database_url,
        config.database_max_connections,
    )
    .await
    .context("Failed to create database pool")?;

    proxypanel_shared::db::run_migrations(&pool)
        .await
        .context("Failed to run migrations")?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let plan_changes = PlanChangeService::new(pool.clone(), clock.clone());
    let orders = OrderService::new(pool.clone(), clock.clone());

    let scheduler = JobScheduler::new().await?;

    {
        let plan_changes = plan_changes.clone();
        let clock = clock.clone();
        let job = Job::new_async(config.downgrade_schedule.as_str(), move |_id, _sched| {
            let plan_changes = plan_changes.clone();
            let clock = clock.clone();
            Box::pin(async move {
                jobs::apply_due_downgrades(&plan_changes, clock.now()).await;
            })
        })?;
        scheduler.add(job).await?;
    }

    {
        let orders = orders.clone();
        let clock = clock.clone();
        let max_age_hours = config.pending_order_max_age_hours;
        let job = Job::new_async(config.order_expiry_schedule.as_str(), move |_id, _sched| {
            let orders = orders.clone();
            let clock = clock.clone();
            Box::pin(async move {
                jobs::expire_stale_orders(&orders, clock.now(), max_age_hours).await;
            })
        })?;
        scheduler.add(job).await?;
    }

    scheduler.start().await?;

    tracing::info!(
        downgrade_schedule = %config.downgrade_schedule,
        order_expiry_schedule = %config.order_expiry_schedule,
        "Billing worker started"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    tracing::info!("Billing worker shutting down");
    Ok(())
}
