/*
 * Workhive - Task coordination service for autonomous agent fleets
 * Copyright (C) 2025–2026 Neven Kordic <neven@broodlink.ai>
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Dispatcher: eligible-task enumeration and the atomic claim.
//!
//! The claim is a single guarded `UPDATE … RETURNING`: status and assignee
//! preconditions, the dependency anti-join, and the per-agent cap are all
//! evaluated inside one statement, so N racing claims commit at most one
//! winner and the cap cannot be exceeded by concurrent claims from the same
//! agent.

use std::sync::atomic::Ordering;

use tracing::info;

use crate::error::TaskServiceError;
use crate::guard::{check_idempotency, store_idempotency};
use crate::lifecycle::{log_task_action, reclaim_or_fail, refresh_agent_presence};
use crate::model::{AgentRow, TaskRow};
use crate::AppState;

/// Tasks claimable by anyone: pending, unassigned, all dependencies
/// completed. Ordered by priority (descending), FIFO within a tie.
pub async fn available_tasks(state: &AppState) -> Result<Vec<TaskRow>, TaskServiceError> {
    let pool = state.db.pool().await?;
    let rows = sqlx::query_as::<_, TaskRow>(
        "SELECT t.* FROM tasks t
         WHERE t.status = 'pending'
           AND t.assignee IS NULL
           AND t.deleted_at IS NULL
           AND NOT EXISTS (
               SELECT 1 FROM tasks dep
               WHERE dep.id = ANY(t.dependencies)
                 AND dep.status != 'completed'
                 AND dep.deleted_at IS NULL
           )
         ORDER BY t.priority DESC, t.created_at ASC",
    )
    .fetch_all(&pool)
    .await?;
    Ok(rows)
}

/// Tasks claimable by a specific agent. With `skill_match` and a non-empty
/// skill set, only tasks whose tags overlap the agent's skills are returned.
pub async fn available_tasks_for_agent(
    state: &AppState,
    agent_name: &str,
    skill_match: bool,
) -> Result<Vec<TaskRow>, TaskServiceError> {
    let pool = state.db.pool().await?;

    let agent: Option<AgentRow> =
        sqlx::query_as("SELECT * FROM agents WHERE name = $1 AND deleted_at IS NULL")
            .bind(agent_name)
            .fetch_optional(&pool)
            .await?;
    let agent = agent.ok_or_else(|| TaskServiceError::NotFound(format!("agent {agent_name}")))?;

    if skill_match && !agent.skills.is_empty() {
        let rows = sqlx::query_as::<_, TaskRow>(
            "SELECT t.* FROM tasks t
             WHERE t.status = 'pending'
               AND t.assignee IS NULL
               AND t.deleted_at IS NULL
               AND t.task_tags && $1
               AND NOT EXISTS (
                   SELECT 1 FROM tasks dep
                   WHERE dep.id = ANY(t.dependencies)
                     AND dep.status != 'completed'
                     AND dep.deleted_at IS NULL
               )
             ORDER BY t.priority DESC, t.created_at ASC",
        )
        .bind(&agent.skills)
        .fetch_all(&pool)
        .await?;
        Ok(rows)
    } else {
        available_tasks(state).await
    }
}

/// Atomically claim `task_id` for `agent_name`.
///
/// An agent already at its concurrency cap is turned away up front with
/// `cap-exceeded`. Past that check, the empty result set of the guarded
/// update covers its causes without distinguishing: the task vanished, it
/// was already claimed, a dependency regressed, or racing claims filled the
/// cap first — all surface as `claim-unavailable`. The update re-evaluates
/// the cap itself, so the pre-check is advisory and the statement stays the
/// race-freedom anchor.
///
/// With an idempotency key, a replay inside the TTL returns the recorded
/// response and performs no writes.
pub async fn claim_task(
    state: &AppState,
    task_id: i64,
    agent_name: &str,
    idempotency_key: Option<&str>,
) -> Result<serde_json::Value, TaskServiceError> {
    let pool = state.db.pool().await?;
    let mut tx = pool.begin().await?;

    let ttl = state.config.sweeps.idempotency_ttl_hours;
    if let Some(cached) = check_idempotency(tx.as_mut(), idempotency_key, ttl).await? {
        tx.commit().await?;
        return Ok(cached);
    }

    let cap = i64::from(state.config.tasks.max_concurrent_per_agent);
    let (held,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM tasks
         WHERE assignee = $1
           AND status IN ('assigned', 'running', 'reviewing')
           AND deleted_at IS NULL",
    )
    .bind(agent_name)
    .fetch_one(tx.as_mut())
    .await?;
    if held >= cap {
        return Err(TaskServiceError::CapExceeded {
            agent: agent_name.to_string(),
            cap,
        });
    }

    let claimed: Option<TaskRow> = sqlx::query_as(
        "UPDATE tasks
         SET assignee = $1, status = 'assigned', assigned_at = NOW(), updated_at = NOW()
         WHERE id = $2
           AND status = 'pending'
           AND assignee IS NULL
           AND deleted_at IS NULL
           AND NOT EXISTS (
               SELECT 1 FROM tasks dep
               WHERE dep.id = ANY(tasks.dependencies)
                 AND dep.status != 'completed'
                 AND dep.deleted_at IS NULL
           )
           AND (SELECT COUNT(*) FROM tasks held
                WHERE held.assignee = $1
                  AND held.status IN ('assigned', 'running', 'reviewing')
                  AND held.deleted_at IS NULL) < $3
         RETURNING *",
    )
    .bind(agent_name)
    .bind(task_id)
    .bind(cap)
    .fetch_optional(tx.as_mut())
    .await?;

    let Some(task) = claimed else {
        return Err(TaskServiceError::ClaimUnavailable {
            task_id,
            agent: agent_name.to_string(),
        });
    };

    refresh_agent_presence(tx.as_mut(), agent_name).await?;
    log_task_action(
        tx.as_mut(),
        task_id,
        "claimed",
        Some("pending"),
        Some("assigned"),
        &format!("task claimed by {agent_name}"),
        agent_name,
    )
    .await?;

    let response = serde_json::to_value(&task)
        .map_err(|e| TaskServiceError::Internal(format!("failed to serialize task row: {e}")))?;
    store_idempotency(tx.as_mut(), idempotency_key, &response).await?;

    tx.commit().await?;
    state.tasks_claimed.fetch_add(1, Ordering::Relaxed);
    info!(task_id = task_id, agent = %agent_name, "task claimed");
    Ok(response)
}

/// Release a held task. Only the holder may release. An `assigned` task
/// returns to the pool untouched; a `running` task follows the reclaim
/// path: its retry budget is spent and an exhausted budget fails it
/// terminally.
pub async fn release_task(
    state: &AppState,
    task_id: i64,
    agent_name: &str,
) -> Result<TaskRow, TaskServiceError> {
    let pool = state.db.pool().await?;
    let mut tx = pool.begin().await?;

    let task: Option<TaskRow> =
        sqlx::query_as("SELECT * FROM tasks WHERE id = $1 AND deleted_at IS NULL FOR UPDATE")
            .bind(task_id)
            .fetch_optional(tx.as_mut())
            .await?;
    let task = task.ok_or_else(|| TaskServiceError::NotFound(format!("task {task_id}")))?;

    if task.assignee.as_deref() != Some(agent_name) {
        return Err(TaskServiceError::Forbidden(format!(
            "task {task_id} is not held by {agent_name}"
        )));
    }

    let updated = match task.status.as_str() {
        "assigned" => {
            let row: TaskRow = sqlx::query_as(
                "UPDATE tasks
                 SET status = 'pending', assignee = NULL, assigned_at = NULL, updated_at = NOW()
                 WHERE id = $1
                 RETURNING *",
            )
            .bind(task_id)
            .fetch_one(tx.as_mut())
            .await?;
            log_task_action(
                tx.as_mut(),
                task_id,
                "released",
                Some("assigned"),
                Some("pending"),
                &format!("task released by {agent_name}"),
                agent_name,
            )
            .await?;
            row
        }
        "running" => {
            let row = reclaim_or_fail(
                tx.as_mut(),
                &task,
                agent_name,
                &format!("released by holder {agent_name}"),
            )
            .await?
            .ok_or_else(|| {
                TaskServiceError::StateConflict(format!("task {task_id} changed state during release"))
            })?;
            row
        }
        other => {
            return Err(TaskServiceError::StateConflict(format!(
                "cannot release task in status {other}"
            )));
        }
    };

    refresh_agent_presence(tx.as_mut(), agent_name).await?;
    tx.commit().await?;
    info!(task_id = task_id, agent = %agent_name, status = %updated.status, "task released");
    Ok(updated)
}

