/*
 * Workhive - Task coordination service for autonomous agent fleets
 * Copyright (C) 2025–2026 Neven Kordic <neven@broodlink.ai>
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Error taxonomy shared by every operation. Each variant carries a stable
//! machine-readable code; full detail is logged server-side and a generic
//! message plus trace id goes to the client.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(thiserror::Error, Debug)]
pub enum TaskServiceError {
    #[error("validation error: {field} — {message}")]
    Validation { field: String, message: String },
    #[error("dependency invalid: {0}")]
    DependencyInvalid(String),
    #[error("state conflict: {0}")]
    StateConflict(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("claim unavailable for task {task_id} by agent {agent}")]
    ClaimUnavailable { task_id: i64, agent: String },
    #[error("cap exceeded: agent {agent} already holds {cap} active tasks")]
    CapExceeded { agent: String, cap: i64 },
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("auth error: {0}")]
    Auth(String),
    #[error("transient store failure: {0}")]
    Transient(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("internal error: {0}")]
    Internal(String),
}

/// Store-level failures that are safe to retry with the same idempotency key.
fn is_transient(e: &sqlx::Error) -> bool {
    matches!(
        e,
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed
    )
}

impl TaskServiceError {
    /// Stable machine-readable code surfaced to callers.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation",
            Self::DependencyInvalid(_) => "dependency-invalid",
            Self::StateConflict(_) => "state-conflict",
            Self::Conflict(_) => "conflict",
            Self::Forbidden(_) => "forbidden",
            Self::ClaimUnavailable { .. } => "claim-unavailable",
            Self::CapExceeded { .. } => "cap-exceeded",
            Self::RateLimited(_) => "rate-limited",
            Self::NotFound(_) => "not-found",
            Self::Auth(_) => "auth",
            Self::Transient(_) => "transient",
            Self::Database(e) if is_transient(e) => "transient",
            Self::Database(_) | Self::Internal(_) => "internal",
        }
    }
}

impl IntoResponse for TaskServiceError {
    fn into_response(self) -> Response {
        let trace_id = Uuid::new_v4().to_string();
        let (status, message) = match &self {
            Self::Validation { field, message } => {
                warn!(field = %field, message = %message, trace_id = %trace_id, "validation error");
                (StatusCode::BAD_REQUEST, self.to_string())
            }
            Self::DependencyInvalid(msg) => {
                warn!(msg = %msg, trace_id = %trace_id, "dependency invalid");
                (StatusCode::BAD_REQUEST, self.to_string())
            }
            Self::StateConflict(msg) => {
                info!(msg = %msg, trace_id = %trace_id, "state conflict");
                (StatusCode::CONFLICT, self.to_string())
            }
            Self::Conflict(msg) => {
                info!(msg = %msg, trace_id = %trace_id, "conflict");
                (StatusCode::CONFLICT, self.to_string())
            }
            Self::Forbidden(msg) => {
                warn!(msg = %msg, trace_id = %trace_id, "forbidden");
                (StatusCode::FORBIDDEN, "actor is not the holder".to_string())
            }
            Self::ClaimUnavailable { task_id, agent } => {
                info!(task_id = task_id, agent = %agent, trace_id = %trace_id, "claim unavailable");
                (
                    StatusCode::CONFLICT,
                    "task is not claimable by this agent right now".to_string(),
                )
            }
            Self::CapExceeded { agent, cap } => {
                info!(agent = %agent, cap = cap, trace_id = %trace_id, "cap exceeded");
                (StatusCode::TOO_MANY_REQUESTS, self.to_string())
            }
            Self::RateLimited(msg) => {
                warn!(msg = %msg, trace_id = %trace_id, "rate limited");
                (StatusCode::TOO_MANY_REQUESTS, self.to_string())
            }
            Self::NotFound(what) => {
                info!(entity = %what, trace_id = %trace_id, "not found");
                (StatusCode::NOT_FOUND, "not found".to_string())
            }
            Self::Auth(msg) => {
                warn!(msg = %msg, trace_id = %trace_id, "auth failure");
                (StatusCode::FORBIDDEN, "authentication required".to_string())
            }
            Self::Transient(msg) => {
                warn!(msg = %msg, trace_id = %trace_id, "transient store failure");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "store temporarily unavailable, retry with the same idempotency key"
                        .to_string(),
                )
            }
            Self::Database(e) if is_transient(e) => {
                warn!(error = %e, trace_id = %trace_id, "transient store failure");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "store temporarily unavailable, retry with the same idempotency key"
                        .to_string(),
                )
            }
            Self::Database(e) => {
                error!(error = %e, trace_id = %trace_id, "database error");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
            Self::Internal(msg) => {
                error!(msg = %msg, trace_id = %trace_id, "internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };

        let body = serde_json::json!({
            "error": self.code(),
            "message": message,
            "trace_id": trace_id,
        });

        (status, Json(body)).into_response()
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
    fn test_codes_are_stable() {
        assert_eq!(
            TaskServiceError::Validation {
                field: "priority".into(),
                message: "out of range".into()
            }
            .code(),
            "validation"
        );
        assert_eq!(
            TaskServiceError::DependencyInvalid("cycle".into()).code(),
            "dependency-invalid"
        );
        assert_eq!(
            TaskServiceError::StateConflict("not pending".into()).code(),
            "state-conflict"
        );
        assert_eq!(
            TaskServiceError::ClaimUnavailable {
                task_id: 10,
                agent: "r1".into()
            }
            .code(),
            "claim-unavailable"
        );
        assert_eq!(
            TaskServiceError::CapExceeded {
                agent: "r1".into(),
                cap: 3
            }
            .code(),
            "cap-exceeded"
        );
        assert_eq!(
            TaskServiceError::NotFound("task 5".into()).code(),
            "not-found"
        );
    }

    #[test]
    fn test_pool_timeout_is_transient() {
        let err = TaskServiceError::Database(sqlx::Error::PoolTimedOut);
        assert_eq!(err.code(), "transient");
    }

    #[test]
    fn test_row_not_found_is_internal_not_transient() {
        let err = TaskServiceError::Database(sqlx::Error::RowNotFound);
        assert_eq!(err.code(), "internal");
    }

    #[test]
    fn test_display_includes_context() {
        let err = TaskServiceError::ClaimUnavailable {
            task_id: 7,
            agent: "r2".into(),
        };
        assert!(err.to_string().contains("task 7"));
        assert!(err.to_string().contains("r2"));
    }
}
