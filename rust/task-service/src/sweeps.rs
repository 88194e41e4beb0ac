/*
 * Workhive - Task coordination service for autonomous agent fleets
 * Copyright (C) 2025–2026 Neven Kordic <neven@broodlink.ai>
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Background control loops: heartbeat liveness, stuck-task reclamation,
//! idempotency GC, and soft-delete GC. Each loop runs on its own interval,
//! observes the shutdown watch channel, and finishes any in-flight cycle
//! before exiting so the pool can be torn down safely afterwards.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use sqlx::{FromRow, Row};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::TaskServiceError;
use crate::lifecycle::{reclaim_or_fail, refresh_agent_presence};
use crate::model::TaskRow;
use crate::AppState;

const IDEMPOTENCY_GC_BATCH: i64 = 1000;

/// Tables that participate in soft delete and its compaction.
pub const SOFT_DELETE_TABLES: [&str; 3] = ["tasks", "agents", "projects"];

/// Spawn every control loop. The returned handles complete once the watch
/// channel signals shutdown and the current cycle (if any) has finished.
pub fn spawn_all(
    state: Arc<AppState>,
    shutdown: &watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    vec![
        tokio::spawn(heartbeat_sweep(Arc::clone(&state), shutdown.clone())),
        tokio::spawn(stuck_sweep(Arc::clone(&state), shutdown.clone())),
        tokio::spawn(idempotency_gc(Arc::clone(&state), shutdown.clone())),
        tokio::spawn(soft_delete_gc(state, shutdown.clone())),
    ]
}

// ---------------------------------------------------------------------------
// Heartbeat sweep
// ---------------------------------------------------------------------------

async fn heartbeat_sweep(state: Arc<AppState>, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(Duration::from_secs(
        state.config.sweeps.heartbeat_interval_secs,
    ));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                match workhive_runtime::with_db_retries("heartbeat_cycle", 3, || heartbeat_cycle(&state)).await {
                    Ok(n) => {
                        state.db.note_success();
                        if n > 0 {
                            warn!(agents_offline = n, "marked silent agents offline");
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "heartbeat sweep failed");
                        state.db.note_failure().await;
                    }
                }
            }
            _ = shutdown.changed() => {
                info!("heartbeat sweep stopping");
                break;
            }
        }
    }
}

/// Mark agents whose last heartbeat is older than the offline threshold.
/// Running tasks held by a freshly offline agent are left alone here: the
/// stuck sweep reclaims on time-in-state, not agent presence, which avoids
/// oscillation when heartbeats flap.
async fn heartbeat_cycle(state: &AppState) -> Result<u64, TaskServiceError> {
    let pool = state.db.pool().await?;
    let threshold = i32::try_from(state.config.sweeps.offline_threshold_minutes).unwrap_or(5);
    let result = sqlx::query(
        "UPDATE agents
         SET status = 'offline', updated_at = NOW()
         WHERE status IN ('online', 'busy')
           AND deleted_at IS NULL
           AND last_heartbeat IS NOT NULL
           AND last_heartbeat < NOW() - make_interval(mins => $1)",
    )
    .bind(threshold)
    .execute(&pool)
    .await?;
    Ok(result.rows_affected())
}

// ---------------------------------------------------------------------------
// Stuck-task sweep
// ---------------------------------------------------------------------------

async fn stuck_sweep(state: Arc<AppState>, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(Duration::from_secs(
        state.config.sweeps.stuck_interval_secs,
    ));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                match workhive_runtime::with_db_retries("stuck_cycle", 3, || stuck_cycle(&state)).await {
                    Ok(n) => {
                        state.db.note_success();
                        if n > 0 {
                            info!(tasks_swept = n, "stuck sweep reclaimed tasks");
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "stuck sweep failed");
                        state.db.note_failure().await;
                    }
                }
            }
            _ = shutdown.changed() => {
                info!("stuck sweep stopping");
                break;
            }
        }
    }
}

/// Find running tasks past their effective timeout (task override, else
/// type default, else the global default) and take them out of `running`:
/// back to the pool while the retry budget lasts, terminally failed after.
async fn stuck_cycle(state: &AppState) -> Result<u64, TaskServiceError> {
    let pool = state.db.pool().await?;
    let global_default = i32::try_from(state.config.tasks.default_timeout_minutes).unwrap_or(120);

    let rows = sqlx::query(
        "SELECT t.*,
                COALESCE(t.timeout_minutes, ttd.timeout_minutes, $1) AS effective_timeout_minutes
         FROM tasks t
         LEFT JOIN task_type_defaults ttd ON t.task_type = ttd.task_type
         WHERE t.status = 'running'
           AND t.deleted_at IS NULL
           AND t.started_at < NOW() - make_interval(
               mins => COALESCE(t.timeout_minutes, ttd.timeout_minutes, $1))",
    )
    .bind(global_default)
    .fetch_all(&pool)
    .await?;

    let mut swept = 0;
    for row in rows {
        let task = TaskRow::from_row(&row)?;
        let timeout: i32 = row.get("effective_timeout_minutes");

        let mut tx = pool.begin().await?;
        let reclaimed = reclaim_or_fail(
            tx.as_mut(),
            &task,
            "system",
            &format!("task exceeded {timeout} minute timeout"),
        )
        .await?;

        match reclaimed {
            Some(updated) => {
                if let Some(ref agent) = task.assignee {
                    refresh_agent_presence(tx.as_mut(), agent).await?;
                }
                tx.commit().await?;
                swept += 1;
                state.tasks_reclaimed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    task_id = task.id,
                    agent = task.assignee.as_deref().unwrap_or(""),
                    timeout_minutes = timeout,
                    status = %updated.status,
                    "stuck task swept"
                );
            }
            // Task left `running` between the select and the guarded update
            None => drop(tx),
        }
    }
    Ok(swept)
}

// ---------------------------------------------------------------------------
// Idempotency GC
// ---------------------------------------------------------------------------

async fn idempotency_gc(state: Arc<AppState>, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(Duration::from_secs(
        state.config.sweeps.idempotency_gc_interval_secs,
    ));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                match workhive_runtime::with_db_retries("idempotency_gc_cycle", 3, || idempotency_gc_cycle(&state)).await {
                    Ok(n) => {
                        state.db.note_success();
                        if n > 0 {
                            info!(keys_deleted = n, "expired idempotency keys removed");
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "idempotency gc failed");
                        state.db.note_failure().await;
                    }
                }
            }
            _ = shutdown.changed() => {
                info!("idempotency gc stopping");
                break;
            }
        }
    }
}

/// Delete expired idempotency records in bounded batches so the sweep never
/// holds long locks. This is the only place expired keys are removed; the
/// lookup path never purges.
async fn idempotency_gc_cycle(state: &AppState) -> Result<u64, TaskServiceError> {
    let pool = state.db.pool().await?;
    let ttl = i32::try_from(state.config.sweeps.idempotency_ttl_hours).unwrap_or(24);

    let mut total = 0u64;
    loop {
        let result = sqlx::query(
            "DELETE FROM idempotency_keys
             WHERE key IN (
                 SELECT key FROM idempotency_keys
                 WHERE created_at < NOW() - make_interval(hours => $1)
                 LIMIT $2
             )",
        )
        .bind(ttl)
        .bind(IDEMPOTENCY_GC_BATCH)
        .execute(&pool)
        .await?;

        total += result.rows_affected();
        if result.rows_affected() < IDEMPOTENCY_GC_BATCH.unsigned_abs() {
            break;
        }
    }
    Ok(total)
}

// ---------------------------------------------------------------------------
// Soft-delete GC
// ---------------------------------------------------------------------------

async fn soft_delete_gc(state: Arc<AppState>, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(Duration::from_secs(
        state.config.sweeps.soft_delete_gc_interval_secs,
    ));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                match workhive_runtime::with_db_retries("soft_delete_gc_cycle", 3, || soft_delete_gc_cycle(&state)).await {
                    Ok(n) => {
                        state.db.note_success();
                        if n > 0 {
                            info!(rows_deleted = n, "soft-deleted rows compacted");
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "soft-delete gc failed");
                        state.db.note_failure().await;
                    }
                }
            }
            _ = shutdown.changed() => {
                info!("soft-delete gc stopping");
                break;
            }
        }
    }
}

/// Physically remove rows soft-deleted longer ago than the retention window.
async fn soft_delete_gc_cycle(state: &AppState) -> Result<u64, TaskServiceError> {
    let pool = state.db.pool().await?;
    let retention = i32::try_from(state.config.sweeps.soft_delete_retention_days).unwrap_or(30);

    let mut total = 0u64;
    for table in SOFT_DELETE_TABLES {
        // Table names come from the compile-time whitelist above, never
        // from input.
        let sql = format!(
            "DELETE FROM {table}
             WHERE deleted_at IS NOT NULL
               AND deleted_at < NOW() - make_interval(days => $1)"
        );
        let result = sqlx::query(&sql).bind(retention).execute(&pool).await?;
        total += result.rows_affected();
    }
    Ok(total)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_soft_delete_whitelist_is_closed() {
        assert_eq!(SOFT_DELETE_TABLES, ["tasks", "agents", "projects"]);
        assert!(!SOFT_DELETE_TABLES.contains(&"task_logs"), "audit log is never compacted");
        assert!(!SOFT_DELETE_TABLES.contains(&"idempotency_keys"));
    }

    #[test]
    fn test_gc_batch_is_bounded() {
        assert!(IDEMPOTENCY_GC_BATCH > 0);
        assert!(IDEMPOTENCY_GC_BATCH <= 10_000, "batches stay small enough to avoid long locks");
    }
}
