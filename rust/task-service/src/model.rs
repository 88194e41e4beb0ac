/*
 * Workhive - Task coordination service for autonomous agent fleets
 * Copyright (C) 2025–2026 Neven Kordic <neven@broodlink.ai>
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Closed-set domain types, persistent row shapes, and request payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Task status
// ---------------------------------------------------------------------------

/// Task lifecycle states. `rejected` is transient: it carries reviewer
/// feedback until `retry` returns the task to the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Running,
    Reviewing,
    Completed,
    Failed,
    Cancelled,
    Rejected,
}

impl TaskStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Assigned => "assigned",
            Self::Running => "running",
            Self::Reviewing => "reviewing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Rejected => "rejected",
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "assigned" => Ok(Self::Assigned),
            "running" => Ok(Self::Running),
            "reviewing" => Ok(Self::Reviewing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "rejected" => Ok(Self::Rejected),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Task type
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    Research,
    Copywrite,
    Video,
    Review,
    Publish,
    Analysis,
    Design,
    Development,
    Testing,
    Deployment,
    Coordination,
}

impl TaskType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Research => "research",
            Self::Copywrite => "copywrite",
            Self::Video => "video",
            Self::Review => "review",
            Self::Publish => "publish",
            Self::Analysis => "analysis",
            Self::Design => "design",
            Self::Development => "development",
            Self::Testing => "testing",
            Self::Deployment => "deployment",
            Self::Coordination => "coordination",
        }
    }
}

impl std::str::FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "research" => Ok(Self::Research),
            "copywrite" => Ok(Self::Copywrite),
            "video" => Ok(Self::Video),
            "review" => Ok(Self::Review),
            "publish" => Ok(Self::Publish),
            "analysis" => Ok(Self::Analysis),
            "design" => Ok(Self::Design),
            "development" => Ok(Self::Development),
            "testing" => Ok(Self::Testing),
            "deployment" => Ok(Self::Deployment),
            "coordination" => Ok(Self::Coordination),
            other => Err(format!("unknown task type: {other}")),
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Agent role / status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Research,
    Copywrite,
    Video,
    Coordinator,
    Reviewer,
    Developer,
    Designer,
    Tester,
    ProjectManager,
}

impl AgentRole {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Research => "research",
            Self::Copywrite => "copywrite",
            Self::Video => "video",
            Self::Coordinator => "coordinator",
            Self::Reviewer => "reviewer",
            Self::Developer => "developer",
            Self::Designer => "designer",
            Self::Tester => "tester",
            Self::ProjectManager => "project_manager",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Online,
    Offline,
    Busy,
}

impl AgentStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Busy => "busy",
        }
    }
}

impl std::str::FromStr for AgentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(Self::Online),
            "offline" => Ok(Self::Offline),
            "busy" => Ok(Self::Busy),
            other => Err(format!("unknown agent status: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Project status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectStatus {
    Active,
    Paused,
    Completed,
    Cancelled,
}

impl ProjectStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::str::FromStr for ProjectStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown project status: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Row shapes (Postgres)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct TaskRow {
    pub id: i64,
    pub project_id: i64,
    pub title: String,
    pub description: Option<String>,
    pub task_type: String,
    pub status: String,
    pub priority: i32,
    pub assignee: Option<String>,
    pub reviewer: Option<String>,
    pub acceptance_criteria: Option<String>,
    pub parent_task_id: Option<i64>,
    pub dependencies: Vec<i64>,
    pub task_tags: Vec<String>,
    pub estimated_hours: Option<f64>,
    pub timeout_minutes: Option<i32>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub result: Option<serde_json::Value>,
    pub feedback: Option<String>,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub due_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct AgentRow {
    pub id: i64,
    pub name: String,
    pub role: String,
    pub status: String,
    pub capabilities: Option<serde_json::Value>,
    pub skills: Vec<String>,
    pub total_tasks: i64,
    pub completed_tasks: i64,
    pub failed_tasks: i64,
    pub success_rate: f64,
    pub current_task_id: Option<i64>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ProjectRow {
    pub id: i64,
    pub name: String,
    pub channel_id: Option<String>,
    pub description: Option<String>,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct TaskLogRow {
    pub id: i64,
    pub task_id: i64,
    pub action: String,
    pub old_status: Option<String>,
    pub new_status: Option<String>,
    pub message: String,
    pub actor: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct AgentChannelRow {
    pub id: i64,
    pub agent_name: String,
    pub channel_id: String,
    pub last_seen: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Request payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct RegisterAgentRequest {
    pub name: String,
    pub role: AgentRole,
    #[serde(default)]
    pub capabilities: Option<serde_json::Value>,
    #[serde(default)]
    pub skills: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub struct HeartbeatRequest {
    #[serde(default)]
    pub current_task_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct CreateProjectRequest {
    pub name: String,
    #[serde(default)]
    pub channel_id: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    pub project_id: i64,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub task_type: TaskType,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub reviewer: Option<String>,
    #[serde(default)]
    pub acceptance_criteria: Option<String>,
    #[serde(default)]
    pub parent_task_id: Option<i64>,
    #[serde(default)]
    pub dependencies: Option<Vec<i64>>,
    #[serde(default)]
    pub task_tags: Option<Vec<String>>,
    #[serde(default)]
    pub estimated_hours: Option<f64>,
    #[serde(default)]
    pub timeout_minutes: Option<i32>,
    #[serde(default)]
    pub max_retries: Option<i32>,
    #[serde(default)]
    pub created_by: Option<String>,
    #[serde(default)]
    pub due_at: Option<DateTime<Utc>>,
}

/// Batch-creation payload for project breakdown. `dependencies` are indices
/// into the batch, remapped to real task ids at insert time.
#[derive(Debug, Deserialize)]
pub struct BreakdownTaskRequest {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub task_type: TaskType,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub dependencies: Option<Vec<usize>>,
    #[serde(default)]
    pub task_tags: Option<Vec<String>>,
    #[serde(default)]
    pub estimated_hours: Option<f64>,
    #[serde(default)]
    pub timeout_minutes: Option<i32>,
    #[serde(default)]
    pub created_by: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateTaskRequest {
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub feedback: Option<String>,
    #[serde(default)]
    pub dependencies: Option<Vec<i64>>,
}

impl UpdateTaskRequest {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.priority.is_none()
            && self.description.is_none()
            && self.result.is_none()
            && self.feedback.is_none()
            && self.dependencies.is_none()
    }
}

#[derive(Debug, Deserialize)]
pub struct ClaimTaskRequest {
    pub agent_name: String,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StartTaskRequest {
    pub agent_name: String,
}

#[derive(Debug, Deserialize)]
pub struct SubmitTaskRequest {
    pub agent_name: String,
    pub result: serde_json::Value,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ReleaseTaskRequest {
    pub agent_name: String,
}

#[derive(Debug, Deserialize)]
pub struct ReviewTaskRequest {
    pub reviewer: String,
    pub approved: bool,
    #[serde(default)]
    pub feedback: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BindChannelRequest {
    pub agent_name: String,
    pub channel_id: String,
}

// ---------------------------------------------------------------------------
// Query parameter structs
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ListTasksQuery {
    pub project_id: Option<i64>,
    pub status: Option<String>,
    pub assignee: Option<String>,
    pub task_type: Option<String>,
    /// Comma-separated tag list; matches tasks whose tags overlap.
    pub tags: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ListProjectsQuery {
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ListAgentsQuery {
    pub status: Option<String>,
    pub skill: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AvailableQuery {
    #[serde(default = "default_true")]
    pub skill_match: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct DeleteQuery {
    #[serde(default)]
    pub hard: bool,
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_task_status_round_trip() {
        for s in [
            "pending",
            "assigned",
            "running",
            "reviewing",
            "completed",
            "failed",
            "cancelled",
            "rejected",
        ] {
            let parsed = TaskStatus::from_str(s).unwrap();
            assert_eq!(parsed.as_str(), s);
        }
        assert!(TaskStatus::from_str("paused").is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(
            !TaskStatus::Rejected.is_terminal(),
            "rejected is transient, not terminal"
        );
        assert!(!TaskStatus::Reviewing.is_terminal());
    }

    #[test]
    fn test_task_type_serde_lowercase() {
        let t: TaskType = serde_json::from_str("\"development\"").unwrap();
        assert_eq!(t, TaskType::Development);
        assert_eq!(serde_json::to_string(&t).unwrap(), "\"development\"");
        assert!(serde_json::from_str::<TaskType>("\"gardening\"").is_err());
    }

    #[test]
    fn test_task_type_from_str_round_trip() {
        for s in [
            "research",
            "copywrite",
            "video",
            "review",
            "publish",
            "analysis",
            "design",
            "development",
            "testing",
            "deployment",
            "coordination",
        ] {
            let parsed = TaskType::from_str(s).unwrap();
            assert_eq!(parsed.as_str(), s);
        }
        assert!(TaskType::from_str("gardening").is_err());
    }

    #[test]
    fn test_agent_role_snake_case() {
        let r: AgentRole = serde_json::from_str("\"project_manager\"").unwrap();
        assert_eq!(r, AgentRole::ProjectManager);
        assert_eq!(r.as_str(), "project_manager");
    }

    #[test]
    fn test_agent_status_from_str() {
        assert_eq!(AgentStatus::from_str("busy").unwrap(), AgentStatus::Busy);
        assert!(AgentStatus::from_str("idle").is_err());
    }

    #[test]
    fn test_project_status_from_str() {
        assert_eq!(
            ProjectStatus::from_str("paused").unwrap(),
            ProjectStatus::Paused
        );
        assert!(ProjectStatus::from_str("archived").is_err());
    }

    #[test]
    fn test_create_task_request_minimal() {
        let json = r#"{"project_id": 1, "title": "write docs", "task_type": "copywrite"}"#;
        let req: CreateTaskRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.project_id, 1);
        assert!(req.priority.is_none());
        assert!(req.dependencies.is_none());
        assert!(req.due_at.is_none());
    }

    #[test]
    fn test_create_task_request_ignores_unknown_fields() {
        let json = r#"{"project_id": 1, "title": "t", "task_type": "review", "assignee": "r1"}"#;
        let req: CreateTaskRequest = serde_json::from_str(json).unwrap();
        // Pre-assignment is not part of the contract; unknown fields are dropped
        assert_eq!(req.title, "t");
    }

    #[test]
    fn test_update_request_is_empty() {
        let req: UpdateTaskRequest = serde_json::from_str("{}").unwrap();
        assert!(req.is_empty());
        let req: UpdateTaskRequest = serde_json::from_str(r#"{"priority": 7}"#).unwrap();
        assert!(!req.is_empty());
    }

    #[test]
    fn test_available_query_defaults_to_skill_match() {
        let q: AvailableQuery = serde_json::from_str("{}").unwrap();
        assert!(q.skill_match);
    }
}
