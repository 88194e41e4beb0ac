/*
 * Workhive - Task coordination service for autonomous agent fleets
 * Copyright (C) 2025–2026 Neven Kordic <neven@broodlink.ai>
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Lifecycle engine: every status transition runs inside one transaction
//! that checks the precondition, verifies the actor where the transition is
//! holder-only, appends exactly one task log entry, and updates the agent
//! rollup counters on terminal transitions.

use sqlx::PgConnection;
use tracing::info;

use crate::error::TaskServiceError;
use crate::guard::{check_idempotency, store_idempotency};
use crate::model::{CreateTaskRequest, TaskRow, TaskStatus};
use crate::validate::{
    sanitize_string, validate_dependency_graph, validate_new_dependencies, validate_nonempty,
    validate_priority,
};
use crate::AppState;

// ---------------------------------------------------------------------------
// Audit log
// ---------------------------------------------------------------------------

/// Append one task log entry. Called inside the transaction of the status
/// change it records, so log order is commit order.
pub async fn log_task_action(
    conn: &mut PgConnection,
    task_id: i64,
    action: &str,
    old_status: Option<&str>,
    new_status: Option<&str>,
    message: &str,
    actor: &str,
) -> Result<(), TaskServiceError> {
    sqlx::query(
        "INSERT INTO task_logs (task_id, action, old_status, new_status, message, actor)
         VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(task_id)
    .bind(action)
    .bind(old_status)
    .bind(new_status)
    .bind(message)
    .bind(actor)
    .execute(conn)
    .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Agent presence and rollup counters
// ---------------------------------------------------------------------------

/// Recompute an agent's presence after a task change: `busy` while it holds
/// active tasks, `online` otherwise, `offline` left untouched (the heartbeat
/// sweep owns that state). `current_task_id` points at the running task if
/// one exists and is cleared otherwise.
pub async fn refresh_agent_presence(
    conn: &mut PgConnection,
    agent_name: &str,
) -> Result<(), TaskServiceError> {
    sqlx::query(
        "UPDATE agents SET
             status = CASE
                 WHEN status = 'offline' THEN 'offline'
                 WHEN EXISTS (
                     SELECT 1 FROM tasks
                     WHERE assignee = $1
                       AND status IN ('assigned', 'running', 'reviewing')
                       AND deleted_at IS NULL
                 ) THEN 'busy'
                 ELSE 'online'
             END,
             current_task_id = (
                 SELECT id FROM tasks
                 WHERE assignee = $1 AND status = 'running' AND deleted_at IS NULL
                 LIMIT 1
             ),
             updated_at = NOW()
         WHERE name = $1",
    )
    .bind(agent_name)
    .execute(conn)
    .await?;
    Ok(())
}

/// Outcome of a terminal transition, for the rollup counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    Failed,
    Cancelled,
}

/// Laplace-smoothed success rate over post-increment counters: never 0/0,
/// and an untested agent starts below a proven one.
#[must_use]
pub fn laplace_success_rate(completed_tasks: i64, total_tasks: i64) -> f64 {
    #[allow(clippy::cast_precision_loss)]
    {
        (completed_tasks as f64 + 1.0) / (total_tasks as f64 + 1.0)
    }
}

/// Update the agent counters for one terminal transition, in the same
/// transaction as the status change. The success-rate expressions reference
/// pre-increment column values, so `+ 2` is the post-increment `+ 1`.
pub async fn update_agent_stats(
    conn: &mut PgConnection,
    agent_name: &str,
    outcome: TaskOutcome,
) -> Result<(), TaskServiceError> {
    let sql = match outcome {
        TaskOutcome::Completed => {
            "UPDATE agents SET
                 completed_tasks = completed_tasks + 1,
                 total_tasks = total_tasks + 1,
                 success_rate = (completed_tasks + 2)::float8 / (total_tasks + 2),
                 updated_at = NOW()
             WHERE name = $1"
        }
        TaskOutcome::Failed => {
            "UPDATE agents SET
                 failed_tasks = failed_tasks + 1,
                 total_tasks = total_tasks + 1,
                 success_rate = (completed_tasks + 1)::float8 / (total_tasks + 2),
                 updated_at = NOW()
             WHERE name = $1"
        }
        TaskOutcome::Cancelled => {
            "UPDATE agents SET
                 total_tasks = total_tasks + 1,
                 success_rate = (completed_tasks + 1)::float8 / (total_tasks + 2),
                 updated_at = NOW()
             WHERE name = $1"
        }
    };
    sqlx::query(sql).bind(agent_name).execute(conn).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Task creation
// ---------------------------------------------------------------------------

/// Insert a new `pending` task. Dependency validation runs inside the same
/// transaction with the freshly assigned id, so a rejected graph leaves no
/// row behind.
pub async fn create_task(
    state: &AppState,
    req: CreateTaskRequest,
) -> Result<TaskRow, TaskServiceError> {
    validate_nonempty("title", &req.title)?;
    if let Some(p) = req.priority {
        validate_priority(p)?;
    }
    let deps = req.dependencies.clone().unwrap_or_default();
    validate_new_dependencies(&deps)?;

    let pool = state.db.pool().await?;
    let mut tx = pool.begin().await?;

    let project: Option<(i64,)> =
        sqlx::query_as("SELECT id FROM projects WHERE id = $1 AND deleted_at IS NULL")
            .bind(req.project_id)
            .fetch_optional(tx.as_mut())
            .await?;
    if project.is_none() {
        return Err(TaskServiceError::NotFound(format!(
            "project {}",
            req.project_id
        )));
    }

    let defaults: Option<(Option<i32>, Option<i32>, Option<i32>)> = sqlx::query_as(
        "SELECT timeout_minutes, max_retries, priority FROM task_type_defaults WHERE task_type = $1",
    )
    .bind(req.task_type.as_str())
    .fetch_optional(tx.as_mut())
    .await?;
    let (default_timeout, default_retries, default_priority) =
        defaults.unwrap_or((None, None, None));

    let priority = req.priority.or(default_priority).unwrap_or(5);
    let timeout_minutes = req.timeout_minutes.or(default_timeout);
    let max_retries = req
        .max_retries
        .or(default_retries)
        .unwrap_or_else(|| i32::try_from(state.config.tasks.default_max_retries).unwrap_or(3));

    let task: TaskRow = sqlx::query_as(
        "INSERT INTO tasks (
             project_id, title, description, task_type, priority,
             reviewer, acceptance_criteria, parent_task_id, dependencies,
             task_tags, estimated_hours, timeout_minutes, max_retries,
             created_by, due_at
         ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
         RETURNING *",
    )
    .bind(req.project_id)
    .bind(req.title.trim())
    .bind(sanitize_string(req.description))
    .bind(req.task_type.as_str())
    .bind(priority)
    .bind(sanitize_string(req.reviewer))
    .bind(req.acceptance_criteria)
    .bind(req.parent_task_id)
    .bind(&deps)
    .bind(req.task_tags.unwrap_or_default())
    .bind(req.estimated_hours)
    .bind(timeout_minutes)
    .bind(max_retries)
    .bind(sanitize_string(req.created_by))
    .bind(req.due_at)
    .fetch_one(tx.as_mut())
    .await?;

    validate_dependency_graph(tx.as_mut(), task.id, task.project_id, &deps).await?;

    log_task_action(
        tx.as_mut(),
        task.id,
        "created",
        None,
        Some("pending"),
        &format!("task created: {}", task.title),
        task.created_by.as_deref().unwrap_or("system"),
    )
    .await?;

    tx.commit().await?;
    info!(task_id = task.id, project_id = task.project_id, task_type = %task.task_type, "task created");
    Ok(task)
}

// ---------------------------------------------------------------------------
// assigned → running
// ---------------------------------------------------------------------------

/// Start an assigned task. The guarded update additionally requires that the
/// agent has no other running task, enforcing at most one `running` per
/// agent.
pub async fn start_task(
    state: &AppState,
    task_id: i64,
    agent_name: &str,
) -> Result<TaskRow, TaskServiceError> {
    let pool = state.db.pool().await?;
    let mut tx = pool.begin().await?;

    let started: Option<TaskRow> = sqlx::query_as(
        "UPDATE tasks
         SET status = 'running', started_at = NOW(), updated_at = NOW()
         WHERE id = $1
           AND assignee = $2
           AND status = 'assigned'
           AND deleted_at IS NULL
           AND NOT EXISTS (
               SELECT 1 FROM tasks running
               WHERE running.assignee = $2
                 AND running.status = 'running'
                 AND running.deleted_at IS NULL
           )
         RETURNING *",
    )
    .bind(task_id)
    .bind(agent_name)
    .fetch_optional(tx.as_mut())
    .await?;

    let Some(task) = started else {
        return Err(diagnose_start_failure(tx.as_mut(), task_id, agent_name).await?);
    };

    refresh_agent_presence(tx.as_mut(), agent_name).await?;
    log_task_action(
        tx.as_mut(),
        task_id,
        "started",
        Some("assigned"),
        Some("running"),
        &format!("task started by {agent_name}"),
        agent_name,
    )
    .await?;

    tx.commit().await?;
    info!(task_id = task_id, agent = %agent_name, "task started");
    Ok(task)
}

/// Re-read the row to attribute a failed guarded start to the right error.
/// Race-benign: only the error message depends on this read.
async fn diagnose_start_failure(
    conn: &mut PgConnection,
    task_id: i64,
    agent_name: &str,
) -> Result<TaskServiceError, TaskServiceError> {
    let row: Option<TaskRow> =
        sqlx::query_as("SELECT * FROM tasks WHERE id = $1 AND deleted_at IS NULL")
            .bind(task_id)
            .fetch_optional(conn)
            .await?;
    Ok(match row {
        None => TaskServiceError::NotFound(format!("task {task_id}")),
        Some(t) if t.assignee.as_deref() != Some(agent_name) => TaskServiceError::Forbidden(
            format!("task {task_id} is not assigned to {agent_name}"),
        ),
        Some(t) if t.status != "assigned" => TaskServiceError::StateConflict(format!(
            "cannot start task in status {}",
            t.status
        )),
        Some(_) => TaskServiceError::StateConflict(format!(
            "agent {agent_name} already has a running task"
        )),
    })
}

// ---------------------------------------------------------------------------
// running → reviewing
// ---------------------------------------------------------------------------

/// Submit a running task for review, writing the result. At-most-once under
/// an idempotency key: a replay returns the recorded response and leaves the
/// stored result untouched.
pub async fn submit_task(
    state: &AppState,
    task_id: i64,
    agent_name: &str,
    result: serde_json::Value,
    idempotency_key: Option<&str>,
) -> Result<serde_json::Value, TaskServiceError> {
    let pool = state.db.pool().await?;
    let mut tx = pool.begin().await?;

    let ttl = state.config.sweeps.idempotency_ttl_hours;
    if let Some(cached) = check_idempotency(tx.as_mut(), idempotency_key, ttl).await? {
        tx.commit().await?;
        return Ok(cached);
    }

    let submitted: Option<TaskRow> = sqlx::query_as(
        "UPDATE tasks
         SET status = 'reviewing', result = $3, updated_at = NOW()
         WHERE id = $1
           AND assignee = $2
           AND status = 'running'
           AND deleted_at IS NULL
         RETURNING *",
    )
    .bind(task_id)
    .bind(agent_name)
    .bind(&result)
    .fetch_optional(tx.as_mut())
    .await?;

    let Some(task) = submitted else {
        let row: Option<TaskRow> =
            sqlx::query_as("SELECT * FROM tasks WHERE id = $1 AND deleted_at IS NULL")
                .bind(task_id)
                .fetch_optional(tx.as_mut())
                .await?;
        return Err(match row {
            None => TaskServiceError::NotFound(format!("task {task_id}")),
            Some(t) if t.assignee.as_deref() != Some(agent_name) => TaskServiceError::Forbidden(
                format!("task {task_id} is not assigned to {agent_name}"),
            ),
            Some(t) => TaskServiceError::StateConflict(format!(
                "cannot submit task in status {}",
                t.status
            )),
        });
    };

    refresh_agent_presence(tx.as_mut(), agent_name).await?;
    log_task_action(
        tx.as_mut(),
        task_id,
        "submitted",
        Some("running"),
        Some("reviewing"),
        &format!("task submitted for review by {agent_name}"),
        agent_name,
    )
    .await?;

    let response = serde_json::to_value(&task)
        .map_err(|e| TaskServiceError::Internal(format!("failed to serialize task row: {e}")))?;
    store_idempotency(tx.as_mut(), idempotency_key, &response).await?;

    tx.commit().await?;
    info!(task_id = task_id, agent = %agent_name, "task submitted for review");
    Ok(response)
}

// ---------------------------------------------------------------------------
// reviewing → completed | rejected
// ---------------------------------------------------------------------------

/// Review a submitted task. Approval completes it (terminal, counters
/// updated); rejection parks it in `rejected` with the reviewer's feedback
/// until `retry` returns it to the pool.
pub async fn review_task(
    state: &AppState,
    task_id: i64,
    reviewer: &str,
    approved: bool,
    feedback: Option<String>,
) -> Result<TaskRow, TaskServiceError> {
    let pool = state.db.pool().await?;
    let mut tx = pool.begin().await?;

    let task: Option<TaskRow> =
        sqlx::query_as("SELECT * FROM tasks WHERE id = $1 AND deleted_at IS NULL FOR UPDATE")
            .bind(task_id)
            .fetch_optional(tx.as_mut())
            .await?;
    let task = task.ok_or_else(|| TaskServiceError::NotFound(format!("task {task_id}")))?;

    if task.status != "reviewing" {
        return Err(TaskServiceError::StateConflict(format!(
            "cannot review task in status {}",
            task.status
        )));
    }

    let assignee = task.assignee.clone();
    let new_status = if approved {
        TaskStatus::Completed
    } else {
        TaskStatus::Rejected
    };

    let updated: TaskRow = sqlx::query_as(
        "UPDATE tasks
         SET status = $2,
             assignee = NULL,
             reviewer = $3,
             feedback = COALESCE($4, feedback),
             completed_at = CASE WHEN $2 = 'completed' THEN NOW() ELSE completed_at END,
             updated_at = NOW()
         WHERE id = $1
         RETURNING *",
    )
    .bind(task_id)
    .bind(new_status.as_str())
    .bind(reviewer)
    .bind(feedback.as_deref())
    .fetch_one(tx.as_mut())
    .await?;

    if let Some(ref agent) = assignee {
        if approved {
            update_agent_stats(tx.as_mut(), agent, TaskOutcome::Completed).await?;
        }
        refresh_agent_presence(tx.as_mut(), agent).await?;
    }

    log_task_action(
        tx.as_mut(),
        task_id,
        "reviewed",
        Some("reviewing"),
        Some(new_status.as_str()),
        &format!(
            "reviewed by {reviewer}: {}",
            if approved { "approved" } else { "rejected" }
        ),
        reviewer,
    )
    .await?;

    tx.commit().await?;
    info!(task_id = task_id, reviewer = %reviewer, approved = approved, "task reviewed");
    Ok(updated)
}

// ---------------------------------------------------------------------------
// failed | rejected → pending
// ---------------------------------------------------------------------------

/// Return a recoverable task to the pool. Bounded by `max_retries`;
/// reviewer feedback is preserved for the next attempt.
pub async fn retry_task(state: &AppState, task_id: i64) -> Result<TaskRow, TaskServiceError> {
    let pool = state.db.pool().await?;
    let mut tx = pool.begin().await?;

    let task: Option<TaskRow> =
        sqlx::query_as("SELECT * FROM tasks WHERE id = $1 AND deleted_at IS NULL FOR UPDATE")
            .bind(task_id)
            .fetch_optional(tx.as_mut())
            .await?;
    let task = task.ok_or_else(|| TaskServiceError::NotFound(format!("task {task_id}")))?;

    if task.status != "failed" && task.status != "rejected" {
        return Err(TaskServiceError::StateConflict(format!(
            "cannot retry task in status {}",
            task.status
        )));
    }
    if task.retry_count >= task.max_retries {
        return Err(TaskServiceError::StateConflict(format!(
            "max retries ({}) exhausted",
            task.max_retries
        )));
    }

    let updated: TaskRow = sqlx::query_as(
        "UPDATE tasks
         SET status = 'pending', assignee = NULL, assigned_at = NULL,
             retry_count = retry_count + 1, updated_at = NOW()
         WHERE id = $1
         RETURNING *",
    )
    .bind(task_id)
    .fetch_one(tx.as_mut())
    .await?;

    log_task_action(
        tx.as_mut(),
        task_id,
        "retry",
        Some(&task.status),
        Some("pending"),
        &format!("task returned to pool (attempt {})", updated.retry_count),
        "system",
    )
    .await?;

    tx.commit().await?;
    info!(task_id = task_id, retry_count = updated.retry_count, "task retried");
    Ok(updated)
}

// ---------------------------------------------------------------------------
// * → cancelled
// ---------------------------------------------------------------------------

/// Administratively cancel any non-terminal task. Terminal and counted
/// against the holder's totals when one exists.
pub async fn cancel_task(state: &AppState, task_id: i64) -> Result<TaskRow, TaskServiceError> {
    let pool = state.db.pool().await?;
    let mut tx = pool.begin().await?;

    let task: Option<TaskRow> =
        sqlx::query_as("SELECT * FROM tasks WHERE id = $1 AND deleted_at IS NULL FOR UPDATE")
            .bind(task_id)
            .fetch_optional(tx.as_mut())
            .await?;
    let task = task.ok_or_else(|| TaskServiceError::NotFound(format!("task {task_id}")))?;

    let old_status: TaskStatus = task
        .status
        .parse()
        .map_err(TaskServiceError::Internal)?;
    if old_status.is_terminal() {
        return Err(TaskServiceError::StateConflict(format!(
            "cannot cancel task in terminal status {}",
            task.status
        )));
    }

    let updated: TaskRow = sqlx::query_as(
        "UPDATE tasks
         SET status = 'cancelled', assignee = NULL, updated_at = NOW()
         WHERE id = $1
         RETURNING *",
    )
    .bind(task_id)
    .fetch_one(tx.as_mut())
    .await?;

    if let Some(ref agent) = task.assignee {
        update_agent_stats(tx.as_mut(), agent, TaskOutcome::Cancelled).await?;
        refresh_agent_presence(tx.as_mut(), agent).await?;
    }

    log_task_action(
        tx.as_mut(),
        task_id,
        "cancelled",
        Some(&task.status),
        Some("cancelled"),
        "task cancelled",
        "system",
    )
    .await?;

    tx.commit().await?;
    info!(task_id = task_id, old_status = %task.status, "task cancelled");
    Ok(updated)
}

// ---------------------------------------------------------------------------
// running → pending | failed (reclaim path)
// ---------------------------------------------------------------------------

/// Take a running task away from its holder: back to the pool while the
/// retry budget lasts, terminally `failed` once it is spent. The guarded
/// update tolerates races (a concurrent submit wins); `None` means the task
/// left `running` first.
pub async fn reclaim_or_fail(
    conn: &mut PgConnection,
    task: &TaskRow,
    actor: &str,
    cause: &str,
) -> Result<Option<TaskRow>, TaskServiceError> {
    if task.retry_count < task.max_retries {
        let row: Option<TaskRow> = sqlx::query_as(
            "UPDATE tasks
             SET status = 'pending', assignee = NULL, assigned_at = NULL,
                 retry_count = retry_count + 1, updated_at = NOW()
             WHERE id = $1 AND status = 'running'
             RETURNING *",
        )
        .bind(task.id)
        .fetch_optional(&mut *conn)
        .await?;
        if let Some(ref updated) = row {
            log_task_action(
                conn,
                task.id,
                "reclaimed",
                Some("running"),
                Some("pending"),
                &format!("{cause} (attempt {})", updated.retry_count),
                actor,
            )
            .await?;
        }
        Ok(row)
    } else {
        let row: Option<TaskRow> = sqlx::query_as(
            "UPDATE tasks
             SET status = 'failed', assignee = NULL, updated_at = NOW()
             WHERE id = $1 AND status = 'running'
             RETURNING *",
        )
        .bind(task.id)
        .fetch_optional(&mut *conn)
        .await?;
        if row.is_some() {
            if let Some(ref agent) = task.assignee {
                update_agent_stats(&mut *conn, agent, TaskOutcome::Failed).await?;
            }
            log_task_action(
                conn,
                task.id,
                "failed",
                Some("running"),
                Some("failed"),
                &format!("{cause}; retry budget exhausted ({})", task.max_retries),
                actor,
            )
            .await?;
        }
        Ok(row)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_laplace_rate_never_divides_by_zero() {
        let rate = laplace_success_rate(0, 0);
        assert!((rate - 1.0).abs() < f64::EPSILON, "fresh agent starts at 1.0");
    }

    #[test]
    fn test_laplace_rate_penalizes_untested_agents_mildly() {
        // 1/1 observed success scores below a 99/100 veteran
        let fresh = laplace_success_rate(1, 1);
        let veteran = laplace_success_rate(99, 100);
        assert!(fresh > 0.9 && fresh < 1.0);
        assert!(veteran > fresh, "track record beats a single success");
    }

    #[test]
    fn test_laplace_rate_matches_sql_arithmetic() {
        // The SQL uses pre-increment columns: completed' = c+1, total' = t+1,
        // rate = (c+2)/(t+2). Spot-check the equivalence.
        let (c, t) = (4_i64, 9_i64);
        let sql_rate = f64::from(u32::try_from(c + 2).unwrap())
            / f64::from(u32::try_from(t + 2).unwrap());
        assert!((laplace_success_rate(c + 1, t + 1) - sql_rate).abs() < 1e-12);
    }

    #[test]
    fn test_outcome_is_copy_eq() {
        let a = TaskOutcome::Completed;
        let b = a;
        assert_eq!(a, b);
        assert_ne!(TaskOutcome::Failed, TaskOutcome::Cancelled);
    }
}
