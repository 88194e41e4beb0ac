/*
 * Workhive - Task coordination service for autonomous agent fleets
 * Copyright (C) 2025–2026 Neven Kordic <neven@broodlink.ai>
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! HTTP surface: thin axum handlers over the dispatcher and lifecycle
//! engine. Reads are rate-limited only; mutations additionally require the
//! API key when one is configured.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use chrono::Utc;
use sqlx::{QueryBuilder, Row};
use tracing::info;

use crate::error::TaskServiceError;
use crate::model::{
    AgentChannelRow, AgentRow, AgentStatus, AvailableQuery, BindChannelRequest,
    BreakdownTaskRequest, ClaimTaskRequest, CreateProjectRequest, CreateTaskRequest, DeleteQuery,
    HeartbeatRequest, ListAgentsQuery, ListProjectsQuery, ListTasksQuery, ProjectRow,
    ProjectStatus, RegisterAgentRequest, ReleaseTaskRequest, ReviewTaskRequest, StartTaskRequest,
    SubmitTaskRequest, TaskLogRow, TaskRow, TaskStatus, TaskType, UpdateTaskRequest,
};
use crate::validate::{
    sanitize_string, validate_batch_dependencies, validate_dependency_graph,
    validate_new_dependencies, validate_nonempty, validate_priority,
};
use crate::{dispatcher, lifecycle, AppState, API_KEY_HEADER, SERVICE_NAME, SERVICE_VERSION};

// ---------------------------------------------------------------------------
// Auth helper
// ---------------------------------------------------------------------------

/// Constant-time byte comparison to prevent timing side-channels on secret
/// comparison.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Verify the API key on a mutating call. When no key is configured the
/// check is skipped (dev mode); reads never call this.
fn require_api_key(state: &AppState, headers: &HeaderMap) -> Result<(), TaskServiceError> {
    let Some(ref expected) = state.api_key else {
        return Ok(());
    };

    let provided = headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| TaskServiceError::Auth(format!("missing {API_KEY_HEADER} header")))?;

    if constant_time_eq(provided.as_bytes(), expected.as_bytes()) {
        Ok(())
    } else {
        Err(TaskServiceError::Auth("invalid API key".into()))
    }
}

fn unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

// ---------------------------------------------------------------------------
// Root + health
// ---------------------------------------------------------------------------

pub async fn root() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": SERVICE_NAME,
        "version": SERVICE_VERSION,
    }))
}

pub async fn health(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, TaskServiceError> {
    let pool = state.db.pool().await?;
    sqlx::query("SELECT 1").execute(&pool).await?;

    Ok(Json(serde_json::json!({
        "status": "healthy",
        "service": SERVICE_NAME,
        "version": SERVICE_VERSION,
        "timestamp": Utc::now().to_rfc3339(),
        "database": "connected",
        "uptime_seconds": state.start_time.elapsed().as_secs(),
        "tasks_claimed": state.tasks_claimed.load(Ordering::Relaxed),
        "tasks_reclaimed": state.tasks_reclaimed.load(Ordering::Relaxed),
    })))
}

// ---------------------------------------------------------------------------
// Projects
// ---------------------------------------------------------------------------

pub async fn create_project(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CreateProjectRequest>,
) -> Result<Json<ProjectRow>, TaskServiceError> {
    require_api_key(&state, &headers)?;
    validate_nonempty("name", &req.name)?;

    let pool = state.db.pool().await?;
    let row: ProjectRow = sqlx::query_as(
        "INSERT INTO projects (name, channel_id, description)
         VALUES ($1, $2, $3)
         RETURNING *",
    )
    .bind(req.name.trim())
    .bind(sanitize_string(req.channel_id))
    .bind(req.description)
    .fetch_one(&pool)
    .await
    .map_err(|e| {
        if unique_violation(&e) {
            TaskServiceError::Conflict(format!("project name '{}' already exists", req.name.trim()))
        } else {
            e.into()
        }
    })?;

    info!(project_id = row.id, name = %row.name, "project created");
    Ok(Json(row))
}

pub async fn list_projects(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ListProjectsQuery>,
) -> Result<Json<Vec<ProjectRow>>, TaskServiceError> {
    let pool = state.db.pool().await?;
    let rows = if let Some(status) = q.status {
        let status: ProjectStatus = status.parse().map_err(|e: String| {
            TaskServiceError::Validation {
                field: "status".into(),
                message: e,
            }
        })?;
        sqlx::query_as(
            "SELECT * FROM projects WHERE status = $1 AND deleted_at IS NULL
             ORDER BY created_at DESC",
        )
        .bind(status.as_str())
        .fetch_all(&pool)
        .await?
    } else {
        sqlx::query_as("SELECT * FROM projects WHERE deleted_at IS NULL ORDER BY created_at DESC")
            .fetch_all(&pool)
            .await?
    };
    Ok(Json(rows))
}

pub async fn get_project(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<i64>,
) -> Result<Json<ProjectRow>, TaskServiceError> {
    let pool = state.db.pool().await?;
    let row: Option<ProjectRow> =
        sqlx::query_as("SELECT * FROM projects WHERE id = $1 AND deleted_at IS NULL")
            .bind(project_id)
            .fetch_optional(&pool)
            .await?;
    row.map(Json)
        .ok_or_else(|| TaskServiceError::NotFound(format!("project {project_id}")))
}

pub async fn project_progress(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<i64>,
) -> Result<Json<serde_json::Value>, TaskServiceError> {
    let pool = state.db.pool().await?;
    let project: Option<ProjectRow> =
        sqlx::query_as("SELECT * FROM projects WHERE id = $1 AND deleted_at IS NULL")
            .bind(project_id)
            .fetch_optional(&pool)
            .await?;
    let project =
        project.ok_or_else(|| TaskServiceError::NotFound(format!("project {project_id}")))?;

    let stats = sqlx::query(
        "SELECT
             COUNT(*) AS total,
             COUNT(*) FILTER (WHERE status = 'pending') AS pending,
             COUNT(*) FILTER (WHERE status = 'assigned') AS assigned,
             COUNT(*) FILTER (WHERE status = 'running') AS running,
             COUNT(*) FILTER (WHERE status = 'reviewing') AS reviewing,
             COUNT(*) FILTER (WHERE status = 'completed') AS completed,
             COUNT(*) FILTER (WHERE status = 'failed') AS failed,
             COUNT(*) FILTER (WHERE status = 'cancelled') AS cancelled,
             COUNT(*) FILTER (WHERE status = 'rejected') AS rejected
         FROM tasks WHERE project_id = $1 AND deleted_at IS NULL",
    )
    .bind(project_id)
    .fetch_one(&pool)
    .await?;

    let total: i64 = stats.get("total");
    let completed: i64 = stats.get("completed");
    #[allow(clippy::cast_precision_loss)]
    let progress = if total > 0 {
        (completed as f64 / total as f64 * 1000.0).round() / 10.0
    } else {
        0.0
    };

    Ok(Json(serde_json::json!({
        "project_id": project_id,
        "project_name": project.name,
        "total_tasks": total,
        "stats": {
            "total": total,
            "pending": stats.get::<i64, _>("pending"),
            "assigned": stats.get::<i64, _>("assigned"),
            "running": stats.get::<i64, _>("running"),
            "reviewing": stats.get::<i64, _>("reviewing"),
            "completed": completed,
            "failed": stats.get::<i64, _>("failed"),
            "cancelled": stats.get::<i64, _>("cancelled"),
            "rejected": stats.get::<i64, _>("rejected"),
        },
        "progress_percent": progress,
    })))
}

pub async fn project_tasks(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<i64>,
) -> Result<Json<Vec<TaskRow>>, TaskServiceError> {
    let pool = state.db.pool().await?;
    let rows = sqlx::query_as(
        "SELECT * FROM tasks WHERE project_id = $1 AND deleted_at IS NULL
         ORDER BY priority DESC, created_at DESC",
    )
    .bind(project_id)
    .fetch_all(&pool)
    .await?;
    Ok(Json(rows))
}

/// Batch task creation. Dependencies reference batch indices and are
/// remapped to the inserted ids; the topological order from validation
/// guarantees every dependency id exists before its dependent is inserted.
pub async fn breakdown_project(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<i64>,
    headers: HeaderMap,
    Json(tasks): Json<Vec<BreakdownTaskRequest>>,
) -> Result<Json<serde_json::Value>, TaskServiceError> {
    require_api_key(&state, &headers)?;
    let order = validate_batch_dependencies(&tasks)?;
    for task in &tasks {
        validate_nonempty("title", &task.title)?;
        if let Some(p) = task.priority {
            validate_priority(p)?;
        }
    }

    let pool = state.db.pool().await?;
    let mut tx = pool.begin().await?;

    let project: Option<(i64,)> =
        sqlx::query_as("SELECT id FROM projects WHERE id = $1 AND deleted_at IS NULL")
            .bind(project_id)
            .fetch_optional(tx.as_mut())
            .await?;
    if project.is_none() {
        return Err(TaskServiceError::NotFound(format!("project {project_id}")));
    }

    let default_retries =
        i32::try_from(state.config.tasks.default_max_retries).unwrap_or(3);
    let mut ids: Vec<Option<i64>> = vec![None; tasks.len()];
    let mut created: Vec<(usize, TaskRow)> = Vec::with_capacity(tasks.len());

    for idx in order {
        let task = &tasks[idx];
        let deps: Vec<i64> = task
            .dependencies
            .as_ref()
            .map(|v| v.iter().filter_map(|&i| ids[i]).collect())
            .unwrap_or_default();

        let row: TaskRow = sqlx::query_as(
            "INSERT INTO tasks (
                 project_id, title, description, task_type, priority,
                 dependencies, task_tags, estimated_hours, timeout_minutes,
                 max_retries, created_by
             ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
             RETURNING *",
        )
        .bind(project_id)
        .bind(task.title.trim())
        .bind(task.description.clone())
        .bind(task.task_type.as_str())
        .bind(task.priority.unwrap_or(5))
        .bind(&deps)
        .bind(task.task_tags.clone().unwrap_or_default())
        .bind(task.estimated_hours)
        .bind(task.timeout_minutes)
        .bind(default_retries)
        .bind(task.created_by.clone())
        .fetch_one(tx.as_mut())
        .await?;

        lifecycle::log_task_action(
            tx.as_mut(),
            row.id,
            "created",
            None,
            Some("pending"),
            &format!("task created via breakdown: {}", row.title),
            task.created_by.as_deref().unwrap_or("system"),
        )
        .await?;

        ids[idx] = Some(row.id);
        created.push((idx, row));
    }

    tx.commit().await?;

    created.sort_by_key(|(idx, _)| *idx);
    let rows: Vec<TaskRow> = created.into_iter().map(|(_, row)| row).collect();
    info!(project_id = project_id, tasks_created = rows.len(), "project breakdown");
    Ok(Json(serde_json::json!({
        "project_id": project_id,
        "tasks_created": rows.len(),
        "tasks": rows,
    })))
}

pub async fn delete_project(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<i64>,
    headers: HeaderMap,
    Query(q): Query<DeleteQuery>,
) -> Result<Json<serde_json::Value>, TaskServiceError> {
    require_api_key(&state, &headers)?;
    let pool = state.db.pool().await?;
    let affected = if q.hard {
        sqlx::query("DELETE FROM projects WHERE id = $1")
            .bind(project_id)
            .execute(&pool)
            .await?
            .rows_affected()
    } else {
        sqlx::query(
            "UPDATE projects SET deleted_at = NOW(), updated_at = NOW()
             WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(project_id)
        .execute(&pool)
        .await?
        .rows_affected()
    };

    if affected == 0 {
        return Err(TaskServiceError::NotFound(format!(
            "project {project_id} (or already deleted)"
        )));
    }
    Ok(Json(serde_json::json!({ "deleted": project_id, "hard": q.hard })))
}

pub async fn restore_project(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, TaskServiceError> {
    require_api_key(&state, &headers)?;
    let pool = state.db.pool().await?;
    let affected = sqlx::query(
        "UPDATE projects SET deleted_at = NULL, updated_at = NOW()
         WHERE id = $1 AND deleted_at IS NOT NULL",
    )
    .bind(project_id)
    .execute(&pool)
    .await?
    .rows_affected();

    if affected == 0 {
        return Err(TaskServiceError::NotFound(format!(
            "project {project_id} (or not deleted)"
        )));
    }
    Ok(Json(serde_json::json!({ "restored": project_id })))
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

pub async fn create_task(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CreateTaskRequest>,
) -> Result<Json<TaskRow>, TaskServiceError> {
    require_api_key(&state, &headers)?;
    let task = lifecycle::create_task(&state, req).await?;
    Ok(Json(task))
}

pub async fn list_tasks(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ListTasksQuery>,
) -> Result<Json<Vec<TaskRow>>, TaskServiceError> {
    let pool = state.db.pool().await?;
    let mut qb: QueryBuilder<sqlx::Postgres> =
        QueryBuilder::new("SELECT * FROM tasks WHERE deleted_at IS NULL");

    if let Some(project_id) = q.project_id {
        qb.push(" AND project_id = ").push_bind(project_id);
    }
    if let Some(status) = q.status {
        let status: TaskStatus =
            status
                .parse()
                .map_err(|e: String| TaskServiceError::Validation {
                    field: "status".into(),
                    message: e,
                })?;
        qb.push(" AND status = ").push_bind(status.as_str());
    }
    if let Some(assignee) = q.assignee {
        qb.push(" AND assignee = ").push_bind(assignee);
    }
    if let Some(task_type) = q.task_type {
        let task_type: TaskType =
            task_type
                .parse()
                .map_err(|e: String| TaskServiceError::Validation {
                    field: "task_type".into(),
                    message: e,
                })?;
        qb.push(" AND task_type = ").push_bind(task_type.as_str());
    }
    if let Some(tags) = q.tags {
        let list: Vec<String> = tags
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
            .collect();
        if !list.is_empty() {
            qb.push(" AND task_tags && ").push_bind(list);
        }
    }
    qb.push(" ORDER BY priority DESC, created_at DESC");

    let rows = qb.build_query_as::<TaskRow>().fetch_all(&pool).await?;
    Ok(Json(rows))
}

pub async fn available_tasks(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<TaskRow>>, TaskServiceError> {
    let rows = dispatcher::available_tasks(&state).await?;
    Ok(Json(rows))
}

pub async fn available_tasks_for_agent(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(q): Query<AvailableQuery>,
) -> Result<Json<Vec<TaskRow>>, TaskServiceError> {
    let rows = dispatcher::available_tasks_for_agent(&state, &name, q.skill_match).await?;
    Ok(Json(rows))
}

pub async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<i64>,
) -> Result<Json<serde_json::Value>, TaskServiceError> {
    let pool = state.db.pool().await?;
    let task: Option<TaskRow> =
        sqlx::query_as("SELECT * FROM tasks WHERE id = $1 AND deleted_at IS NULL")
            .bind(task_id)
            .fetch_optional(&pool)
            .await?;
    let task = task.ok_or_else(|| TaskServiceError::NotFound(format!("task {task_id}")))?;

    let logs: Vec<TaskLogRow> = sqlx::query_as(
        "SELECT * FROM task_logs WHERE task_id = $1 ORDER BY created_at DESC",
    )
    .bind(task_id)
    .fetch_all(&pool)
    .await?;

    Ok(Json(serde_json::json!({ "task": task, "logs": logs })))
}

/// Metadata-only updates. Status and assignee moves go through the explicit
/// lifecycle operations so the state machine owns every transition.
pub async fn update_task(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<i64>,
    headers: HeaderMap,
    Json(req): Json<UpdateTaskRequest>,
) -> Result<Json<TaskRow>, TaskServiceError> {
    require_api_key(&state, &headers)?;
    if let Some(p) = req.priority {
        validate_priority(p)?;
    }

    let pool = state.db.pool().await?;
    let mut tx = pool.begin().await?;

    let current: Option<TaskRow> =
        sqlx::query_as("SELECT * FROM tasks WHERE id = $1 AND deleted_at IS NULL FOR UPDATE")
            .bind(task_id)
            .fetch_optional(tx.as_mut())
            .await?;
    let current = current.ok_or_else(|| TaskServiceError::NotFound(format!("task {task_id}")))?;

    if req.is_empty() {
        return Ok(Json(current));
    }

    if let Some(ref deps) = req.dependencies {
        validate_new_dependencies(deps)?;
        validate_dependency_graph(tx.as_mut(), task_id, current.project_id, deps).await?;
    }

    let updated: TaskRow = sqlx::query_as(
        "UPDATE tasks SET
             priority = COALESCE($2, priority),
             description = COALESCE($3, description),
             result = COALESCE($4, result),
             feedback = COALESCE($5, feedback),
             dependencies = COALESCE($6, dependencies),
             updated_at = NOW()
         WHERE id = $1
         RETURNING *",
    )
    .bind(task_id)
    .bind(req.priority)
    .bind(req.description)
    .bind(req.result)
    .bind(req.feedback)
    .bind(req.dependencies)
    .fetch_one(tx.as_mut())
    .await?;

    lifecycle::log_task_action(
        tx.as_mut(),
        task_id,
        "updated",
        Some(&current.status),
        Some(&current.status),
        "task metadata updated",
        "system",
    )
    .await?;

    tx.commit().await?;
    Ok(Json(updated))
}

pub async fn claim_task(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<i64>,
    headers: HeaderMap,
    Json(req): Json<ClaimTaskRequest>,
) -> Result<Json<serde_json::Value>, TaskServiceError> {
    require_api_key(&state, &headers)?;
    let response =
        dispatcher::claim_task(&state, task_id, &req.agent_name, req.idempotency_key.as_deref())
            .await?;
    Ok(Json(response))
}

pub async fn start_task(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<i64>,
    headers: HeaderMap,
    Json(req): Json<StartTaskRequest>,
) -> Result<Json<TaskRow>, TaskServiceError> {
    require_api_key(&state, &headers)?;
    let task = lifecycle::start_task(&state, task_id, &req.agent_name).await?;
    Ok(Json(task))
}

pub async fn submit_task(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<i64>,
    headers: HeaderMap,
    Json(req): Json<SubmitTaskRequest>,
) -> Result<Json<serde_json::Value>, TaskServiceError> {
    require_api_key(&state, &headers)?;
    let response = lifecycle::submit_task(
        &state,
        task_id,
        &req.agent_name,
        req.result,
        req.idempotency_key.as_deref(),
    )
    .await?;
    Ok(Json(response))
}

pub async fn release_task(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<i64>,
    headers: HeaderMap,
    Json(req): Json<ReleaseTaskRequest>,
) -> Result<Json<TaskRow>, TaskServiceError> {
    require_api_key(&state, &headers)?;
    let task = dispatcher::release_task(&state, task_id, &req.agent_name).await?;
    Ok(Json(task))
}

pub async fn retry_task(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<TaskRow>, TaskServiceError> {
    require_api_key(&state, &headers)?;
    let task = lifecycle::retry_task(&state, task_id).await?;
    Ok(Json(task))
}

pub async fn review_task(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<i64>,
    headers: HeaderMap,
    Json(req): Json<ReviewTaskRequest>,
) -> Result<Json<TaskRow>, TaskServiceError> {
    require_api_key(&state, &headers)?;
    let task =
        lifecycle::review_task(&state, task_id, &req.reviewer, req.approved, req.feedback).await?;
    Ok(Json(task))
}

pub async fn cancel_task(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<TaskRow>, TaskServiceError> {
    require_api_key(&state, &headers)?;
    let task = lifecycle::cancel_task(&state, task_id).await?;
    Ok(Json(task))
}

pub async fn delete_task(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<i64>,
    headers: HeaderMap,
    Query(q): Query<DeleteQuery>,
) -> Result<Json<serde_json::Value>, TaskServiceError> {
    require_api_key(&state, &headers)?;
    let pool = state.db.pool().await?;
    let affected = if q.hard {
        sqlx::query("DELETE FROM tasks WHERE id = $1")
            .bind(task_id)
            .execute(&pool)
            .await?
            .rows_affected()
    } else {
        sqlx::query(
            "UPDATE tasks SET deleted_at = NOW(), updated_at = NOW()
             WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(task_id)
        .execute(&pool)
        .await?
        .rows_affected()
    };

    if affected == 0 {
        return Err(TaskServiceError::NotFound(format!(
            "task {task_id} (or already deleted)"
        )));
    }
    Ok(Json(serde_json::json!({ "deleted": task_id, "hard": q.hard })))
}

pub async fn restore_task(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, TaskServiceError> {
    require_api_key(&state, &headers)?;
    let pool = state.db.pool().await?;
    let affected = sqlx::query(
        "UPDATE tasks SET deleted_at = NULL, updated_at = NOW()
         WHERE id = $1 AND deleted_at IS NOT NULL",
    )
    .bind(task_id)
    .execute(&pool)
    .await?
    .rows_affected();

    if affected == 0 {
        return Err(TaskServiceError::NotFound(format!(
            "task {task_id} (or not deleted)"
        )));
    }
    Ok(Json(serde_json::json!({ "restored": task_id })))
}

// ---------------------------------------------------------------------------
// Agents
// ---------------------------------------------------------------------------

/// Upsert by name. Re-registering resurrects a soft-deleted agent and
/// refreshes its heartbeat.
pub async fn register_agent(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<RegisterAgentRequest>,
) -> Result<Json<AgentRow>, TaskServiceError> {
    require_api_key(&state, &headers)?;
    validate_nonempty("name", &req.name)?;

    let pool = state.db.pool().await?;
    let row: AgentRow = sqlx::query_as(
        "INSERT INTO agents (name, role, capabilities, skills, status, success_rate, last_heartbeat)
         VALUES ($1, $2, $3, $4, 'online', $5, NOW())
         ON CONFLICT (name) DO UPDATE SET
             role = EXCLUDED.role,
             capabilities = EXCLUDED.capabilities,
             skills = EXCLUDED.skills,
             status = 'online',
             last_heartbeat = NOW(),
             updated_at = NOW(),
             deleted_at = NULL
         RETURNING *",
    )
    .bind(req.name.trim())
    .bind(req.role.as_str())
    .bind(req.capabilities)
    .bind(req.skills.unwrap_or_default())
    .bind(lifecycle::laplace_success_rate(0, 0))
    .fetch_one(&pool)
    .await?;

    info!(agent = %row.name, role = %row.role, "agent registered");
    Ok(Json(row))
}

pub async fn heartbeat(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(req): Json<HeartbeatRequest>,
) -> Result<Json<AgentRow>, TaskServiceError> {
    let pool = state.db.pool().await?;
    let row: Option<AgentRow> = sqlx::query_as(
        "UPDATE agents SET
             last_heartbeat = NOW(),
             current_task_id = COALESCE($2, current_task_id),
             status = CASE WHEN status = 'offline' THEN 'online' ELSE status END,
             updated_at = NOW()
         WHERE name = $1 AND deleted_at IS NULL
         RETURNING *",
    )
    .bind(&name)
    .bind(req.current_task_id)
    .fetch_optional(&pool)
    .await?;

    row.map(Json)
        .ok_or_else(|| TaskServiceError::NotFound(format!("agent {name}")))
}

pub async fn list_agents(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ListAgentsQuery>,
) -> Result<Json<Vec<AgentRow>>, TaskServiceError> {
    let pool = state.db.pool().await?;
    let rows = if let Some(skill) = q.skill {
        sqlx::query_as(
            "SELECT * FROM agents WHERE $1 = ANY(skills) AND deleted_at IS NULL ORDER BY name",
        )
        .bind(skill)
        .fetch_all(&pool)
        .await?
    } else if let Some(status) = q.status {
        let status: AgentStatus =
            status
                .parse()
                .map_err(|e: String| TaskServiceError::Validation {
                    field: "status".into(),
                    message: e,
                })?;
        sqlx::query_as(
            "SELECT * FROM agents WHERE status = $1 AND deleted_at IS NULL ORDER BY name",
        )
        .bind(status.as_str())
        .fetch_all(&pool)
        .await?
    } else {
        sqlx::query_as("SELECT * FROM agents WHERE deleted_at IS NULL ORDER BY name")
            .fetch_all(&pool)
            .await?
    };
    Ok(Json(rows))
}

pub async fn get_agent(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<AgentRow>, TaskServiceError> {
    let pool = state.db.pool().await?;
    let row: Option<AgentRow> =
        sqlx::query_as("SELECT * FROM agents WHERE name = $1 AND deleted_at IS NULL")
            .bind(&name)
            .fetch_optional(&pool)
            .await?;
    row.map(Json)
        .ok_or_else(|| TaskServiceError::NotFound(format!("agent {name}")))
}

pub async fn unregister_agent(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Query(q): Query<DeleteQuery>,
) -> Result<Json<serde_json::Value>, TaskServiceError> {
    require_api_key(&state, &headers)?;
    let pool = state.db.pool().await?;
    let affected = if q.hard {
        sqlx::query("DELETE FROM agents WHERE name = $1")
            .bind(&name)
            .execute(&pool)
            .await?
            .rows_affected()
    } else {
        sqlx::query(
            "UPDATE agents SET deleted_at = NOW(), status = 'offline', updated_at = NOW()
             WHERE name = $1 AND deleted_at IS NULL",
        )
        .bind(&name)
        .execute(&pool)
        .await?
        .rows_affected()
    };

    if affected == 0 {
        return Err(TaskServiceError::NotFound(format!("agent {name}")));
    }
    Ok(Json(serde_json::json!({ "unregistered": name, "hard": q.hard })))
}

pub async fn agent_channels(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<Vec<AgentChannelRow>>, TaskServiceError> {
    let pool = state.db.pool().await?;
    let rows = sqlx::query_as(
        "SELECT * FROM agent_channels WHERE agent_name = $1 ORDER BY last_seen DESC",
    )
    .bind(&name)
    .fetch_all(&pool)
    .await?;
    Ok(Json(rows))
}

// ---------------------------------------------------------------------------
// Channels
// ---------------------------------------------------------------------------

pub async fn bind_channel(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<BindChannelRequest>,
) -> Result<Json<AgentChannelRow>, TaskServiceError> {
    require_api_key(&state, &headers)?;
    let pool = state.db.pool().await?;

    let agent: Option<(i64,)> =
        sqlx::query_as("SELECT id FROM agents WHERE name = $1 AND deleted_at IS NULL")
            .bind(&req.agent_name)
            .fetch_optional(&pool)
            .await?;
    if agent.is_none() {
        return Err(TaskServiceError::NotFound(format!(
            "agent {}",
            req.agent_name
        )));
    }

    let row: AgentChannelRow = sqlx::query_as(
        "INSERT INTO agent_channels (agent_name, channel_id, last_seen)
         VALUES ($1, $2, NOW())
         ON CONFLICT (agent_name, channel_id) DO UPDATE SET last_seen = NOW()
         RETURNING *",
    )
    .bind(&req.agent_name)
    .bind(&req.channel_id)
    .fetch_one(&pool)
    .await?;
    Ok(Json(row))
}

pub async fn unbind_channel(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<BindChannelRequest>,
) -> Result<Json<serde_json::Value>, TaskServiceError> {
    require_api_key(&state, &headers)?;
    let pool = state.db.pool().await?;
    let affected = sqlx::query(
        "DELETE FROM agent_channels WHERE agent_name = $1 AND channel_id = $2",
    )
    .bind(&req.agent_name)
    .bind(&req.channel_id)
    .execute(&pool)
    .await?
    .rows_affected();

    if affected == 0 {
        return Err(TaskServiceError::NotFound(format!(
            "binding ({}, {})",
            req.agent_name, req.channel_id
        )));
    }
    Ok(Json(serde_json::json!({
        "unbound": { "agent_name": req.agent_name, "channel_id": req.channel_id }
    })))
}

pub async fn channel_agents(
    State(state): State<Arc<AppState>>,
    Path(channel_id): Path<String>,
) -> Result<Json<Vec<AgentRow>>, TaskServiceError> {
    let pool = state.db.pool().await?;
    let rows = sqlx::query_as(
        "SELECT a.* FROM agents a
         JOIN agent_channels ac ON a.name = ac.agent_name
         WHERE ac.channel_id = $1
           AND a.status IN ('online', 'busy')
           AND a.deleted_at IS NULL
         ORDER BY ac.last_seen DESC",
    )
    .bind(&channel_id)
    .fetch_all(&pool)
    .await?;
    Ok(Json(rows))
}

// ---------------------------------------------------------------------------
// Dashboard
// ---------------------------------------------------------------------------

pub async fn dashboard_stats(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, TaskServiceError> {
    let pool = state.db.pool().await?;

    let projects = sqlx::query(
        "SELECT COUNT(*) AS total,
                COUNT(*) FILTER (WHERE status = 'active') AS active
         FROM projects WHERE deleted_at IS NULL",
    )
    .fetch_one(&pool)
    .await?;

    let tasks = sqlx::query(
        "SELECT COUNT(*) AS total,
                COUNT(*) FILTER (WHERE status = 'pending') AS pending,
                COUNT(*) FILTER (WHERE status = 'assigned') AS assigned,
                COUNT(*) FILTER (WHERE status = 'running') AS running,
                COUNT(*) FILTER (WHERE status = 'reviewing') AS reviewing,
                COUNT(*) FILTER (WHERE status = 'completed') AS completed,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed,
                COUNT(*) FILTER (WHERE status = 'rejected') AS rejected
         FROM tasks WHERE deleted_at IS NULL",
    )
    .fetch_one(&pool)
    .await?;

    let agents = sqlx::query(
        "SELECT COUNT(*) AS total,
                COUNT(*) FILTER (WHERE status = 'online') AS online,
                COUNT(*) FILTER (WHERE status = 'offline') AS offline,
                COUNT(*) FILTER (WHERE status = 'busy') AS busy
         FROM agents WHERE deleted_at IS NULL",
    )
    .fetch_one(&pool)
    .await?;

    let recent: Vec<TaskLogRow> =
        sqlx::query_as("SELECT * FROM task_logs ORDER BY created_at DESC LIMIT 10")
            .fetch_all(&pool)
            .await?;

    Ok(Json(serde_json::json!({
        "projects": {
            "total": projects.get::<i64, _>("total"),
            "active": projects.get::<i64, _>("active"),
        },
        "tasks": {
            "total": tasks.get::<i64, _>("total"),
            "pending": tasks.get::<i64, _>("pending"),
            "assigned": tasks.get::<i64, _>("assigned"),
            "running": tasks.get::<i64, _>("running"),
            "reviewing": tasks.get::<i64, _>("reviewing"),
            "completed": tasks.get::<i64, _>("completed"),
            "failed": tasks.get::<i64, _>("failed"),
            "rejected": tasks.get::<i64, _>("rejected"),
        },
        "agents": {
            "total": agents.get::<i64, _>("total"),
            "online": agents.get::<i64, _>("online"),
            "offline": agents.get::<i64, _>("offline"),
            "busy": agents.get::<i64, _>("busy"),
        },
        "recent_activity": recent,
    })))
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secreT"));
        assert!(!constant_time_eq(b"secret", b"secre"));
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn test_tag_list_parsing() {
        let tags = " rust, backend ,,api ";
        let list: Vec<String> = tags
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
            .collect();
        assert_eq!(list, vec!["rust", "backend", "api"]);
    }
}
