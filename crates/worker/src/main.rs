//! Tenantry Background Worker
//!
//! Runs the billing lifecycle sweeps on independent cadences:
//! - Checkout expiry (every 5 minutes)
//! - Scheduled plan changes (hourly)
//! - Ended subscription / trial flagging (hourly)
//! - Renewal, trial, and addon reminders (daily at 9:00 UTC)
//! - Usage cycle resets (hourly)
//! - Expired addon deactivation (daily at 1:00 UTC)
//! - Retention sweep (daily at 3:00 UTC)
//! - Invariant checks (daily at 5:00 UTC)
//!
//! Every sweep is idempotent, so overlapping or repeated runs are safe.

use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use tenantry_billing::{BillingService, InvariantChecker, SweepSummary};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

/// Create a database connection pool
async fn create_db_pool() -> anyhow::Result<sqlx::PgPool> {
    #[allow(clippy::expect_used)] // Fail-fast on startup if required config is missing
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&database_url)
        .await?;

    info!("Database pool created");
    Ok(pool)
}

/// Log the outcome counters of a sweep run
fn log_sweep(job: &str, result: Result<SweepSummary, tenantry_billing::BillingError>) {
    match result {
        Ok(summary) => info!(
            job = job,
            processed = summary.processed,
            errors = summary.errors,
            "Sweep complete"
        ),
        Err(e) => error!(job = job, error = %e, "Sweep failed"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    info!("Starting Tenantry Worker");

    // Create database pool
    let pool = create_db_pool().await?;

    // Create billing service
    let billing = match BillingService::from_env(pool.clone()) {
        Ok(b) => Arc::new(b),
        Err(e) => {
            // If the payment gateway isn't configured, run in minimal mode
            warn!(error = %e, "Failed to create billing service - running in minimal mode");

            loop {
                tokio::time::sleep(Duration::from_secs(60)).await;
                info!("Worker heartbeat (minimal mode)");
            }
        }
    };

    // Create scheduler
    let scheduler = JobScheduler::new().await?;

    // Job 1: Expire abandoned checkouts (every 5 minutes)
    let expiry_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 */5 * * * *", move |_uuid, _l| {
            let billing = expiry_billing.clone();
            Box::pin(async move {
                log_sweep("expire_checkouts", billing.lifecycle.expire_checkouts().await);
            })
        })?)
        .await?;
    info!("Scheduled: Checkout expiry (every 5 minutes)");

    // Job 2: Apply scheduled plan changes (hourly at :05)
    // Runs after the hour boundary so period ends landing exactly on the hour
    // are already in the past.
    let changes_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 5 * * * *", move |_uuid, _l| {
            let billing = changes_billing.clone();
            Box::pin(async move {
                match billing.lifecycle.apply_scheduled_changes().await {
                    Ok(summary) => info!(
                        applied = summary.applied,
                        skipped = summary.skipped,
                        errors = summary.errors,
                        "Scheduled plan changes complete"
                    ),
                    Err(e) => error!(error = %e, "Scheduled plan changes failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Plan change application (hourly)");

    // Job 3: Flag subscriptions whose paid period ended (hourly at :10)
    let ended_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 10 * * * *", move |_uuid, _l| {
            let billing = ended_billing.clone();
            Box::pin(async move {
                log_sweep(
                    "flag_ended_subscriptions",
                    billing.lifecycle.flag_ended_subscriptions().await,
                );
                log_sweep("flag_ended_trials", billing.lifecycle.flag_ended_trials().await);
            })
        })?)
        .await?;
    info!("Scheduled: Ended subscription/trial flagging (hourly)");

    // Job 4: Renewal, trial-end, and addon reminders (daily at 9:00 UTC)
    let reminder_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 0 9 * * *", move |_uuid, _l| {
            let billing = reminder_billing.clone();
            Box::pin(async move {
                log_sweep("send_reminders", billing.lifecycle.send_reminders().await);
            })
        })?)
        .await?;
    info!("Scheduled: Reminder dispatch (daily at 9:00 UTC)");

    // Job 5: Reset metered usage cycles (hourly at :15)
    let usage_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 15 * * * *", move |_uuid, _l| {
            let billing = usage_billing.clone();
            Box::pin(async move {
                match billing.lifecycle.reset_usage_cycles().await {
                    Ok(summary) => info!(
                        reset = summary.reset,
                        skipped = summary.skipped,
                        errors = summary.errors,
                        "Usage cycle reset complete"
                    ),
                    Err(e) => error!(error = %e, "Usage cycle reset failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Usage cycle resets (hourly)");

    // Job 6: Deactivate expired addons (daily at 1:00 UTC)
    let addon_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 0 1 * * *", move |_uuid, _l| {
            let billing = addon_billing.clone();
            Box::pin(async move {
                log_sweep(
                    "deactivate_expired_addons",
                    billing.lifecycle.deactivate_expired_addons().await,
                );
            })
        })?)
        .await?;
    info!("Scheduled: Addon deactivation (daily at 1:00 UTC)");

    // Job 7: Retention sweep (daily at 3:00 UTC)
    let retention_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 0 3 * * *", move |_uuid, _l| {
            let billing = retention_billing.clone();
            Box::pin(async move {
                match billing.lifecycle.retention_sweep().await {
                    Ok(summary) => info!(
                        events_anonymized = summary.events_anonymized,
                        ledger_rows_pruned = summary.ledger_rows_pruned,
                        "Retention sweep complete"
                    ),
                    Err(e) => error!(error = %e, "Retention sweep failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Retention sweep (daily at 3:00 UTC)");

    // Job 8: Data invariant checks (daily at 5:00 UTC)
    let invariant_pool = pool.clone();
    scheduler
        .add(Job::new_async("0 0 5 * * *", move |_uuid, _l| {
            let pool = invariant_pool.clone();
            Box::pin(async move {
                let checker = InvariantChecker::new(pool);
                match checker.check_all().await {
                    Ok(summary) => {
                        if summary.healthy {
                            info!(checks_run = summary.checks_run, "Invariant checks passed");
                        } else {
                            for violation in &summary.violations {
                                warn!(
                                    invariant = %violation.invariant,
                                    affected = violation.subject_ids.len(),
                                    description = %violation.description,
                                    "Invariant violation detected"
                                );
                            }
                            error!(
                                checks_run = summary.checks_run,
                                checks_passed = summary.checks_passed,
                                violations = summary.violations.len(),
                                "Invariant checks found violations"
                            );
                        }
                    }
                    Err(e) => error!(error = %e, "Invariant checks failed to run"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Invariant checks (daily at 5:00 UTC)");

    // Job 9: Heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Heartbeat (every 5 minutes)");

    // Start the scheduler
    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("Tenantry Worker started successfully with {} scheduled jobs", 9);

    // Keep the main task running
    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
