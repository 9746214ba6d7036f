#!/usr/bin/env rust-script
//! Ledger Consistency Verification Script
//!
//! Replays the balance transaction log and flags any account whose stored
//! snapshots or cached balance disagree with the replayed sums.
//!
//! ## Usage
//! ```bash
//! cargo run --bin verify_ledger_consistency > drift_report.csv
//! ```
//!
//! ## Environment Variables
//! - DATABASE_URL: PostgreSQL connection string
//!
//! ## Output
//! CSV report with columns:
//! - user_id, issue_type, expected, actual, detail

use std::env;
use std::error::Error;

use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    println!("ProxyPanel Ledger Consistency Verification");
    println!("==========================================\n");

    dotenvy::dotenv().ok();

    let database_url = env::var("DATABASE_URL").expect("DATABASE_URL must be set");

    let pool = sqlx::postgres::PgPool::connect(&database_url).await?;

    println!("✓ Connected to database\n");

    let mut issues = 0usize;
    println!("user_id,issue_type,expected,actual,detail");

    // ========================================================================
    // Check 1: Every snapshot equals the replayed running sum
    // ========================================================================
    eprintln!("Check 1: Replaying transaction logs against stored snapshots...");

    let users: Vec<(Uuid,)> =
        sqlx::query_as("SELECT DISTINCT user_id FROM balance_transactions")
            .fetch_all(&pool)
            .await?;

    for (user_id,) in &users {
        let entries: Vec<(Uuid, i64, i64)> = sqlx::query_as(
            r#"
            SELECT id, amount, balance_after
            FROM balance_transactions
            WHERE user_id = $1
            ORDER BY seq ASC
            "#,
        )
        .bind(user_id)
        .fetch_all(&pool)
        .await?;

        let mut running = 0i64;
        for (entry_id, amount, balance_after) in &entries {
            running += amount;
            if running != *balance_after {
                issues += 1;
                println!(
                    "{},snapshot_drift,{},{},entry {}",
                    user_id, running, balance_after, entry_id
                );
            }
        }

        // ====================================================================
        // Check 2: Cached balance equals the full replayed sum
        // ====================================================================
        let cached: Option<i64> =
            sqlx::query_scalar("SELECT balance FROM balance_accounts WHERE user_id = $1")
                .bind(user_id)
                .fetch_optional(&pool)
                .await?;

        match cached {
            Some(balance) if balance != running => {
                issues += 1;
                println!(
                    "{},cached_balance_drift,{},{},{} log entries",
                    user_id,
                    running,
                    balance,
                    entries.len()
                );
            }
            None if running != 0 => {
                issues += 1;
                println!(
                    "{},missing_account_row,{},,{} log entries",
                    user_id,
                    running,
                    entries.len()
                );
            }
            _ => {}
        }
    }

    // ========================================================================
    // Check 3: Consume entries reference an order
    // ========================================================================
    eprintln!("Check 3: Verifying consume entries are linked to orders...");

    let unlinked: Vec<(Uuid, Uuid)> = sqlx::query_as(
        "SELECT id, user_id FROM balance_transactions
         WHERE tx_type = 'consume' AND order_id IS NULL",
    )
    .fetch_all(&pool)
    .await?;

    for (entry_id, user_id) in &unlinked {
        issues += 1;
        println!("{},unlinked_consume,,,entry {}", user_id, entry_id);
    }

    eprintln!(
        "\nScanned {} account(s); found {} issue(s)",
        users.len(),
        issues
    );

    if issues > 0 {
        std::process::exit(1);
    }
    Ok(())
}
