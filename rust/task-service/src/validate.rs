/*
 * Workhive - Task coordination service for autonomous agent fleets
 * Copyright (C) 2025–2026 Neven Kordic <neven@broodlink.ai>
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Input validation: field constraints, dependency list rules, and the
//! cycle check over the persisted dependency graph.

use std::collections::{HashMap, HashSet, VecDeque};

use sqlx::{PgConnection, Row};

use crate::error::TaskServiceError;
use crate::model::BreakdownTaskRequest;

pub const MAX_STRING_LEN: usize = 255;

/// Trim and truncate free-form string input.
#[must_use]
pub fn sanitize_string(value: Option<String>) -> Option<String> {
    value.map(|v| {
        let trimmed = v.trim();
        if trimmed.len() > MAX_STRING_LEN {
            // Truncate on a char boundary
            let mut end = MAX_STRING_LEN;
            while !trimmed.is_char_boundary(end) {
                end -= 1;
            }
            trimmed[..end].to_string()
        } else {
            trimmed.to_string()
        }
    })
}

pub fn validate_nonempty(field: &str, value: &str) -> Result<(), TaskServiceError> {
    if value.trim().is_empty() {
        return Err(TaskServiceError::Validation {
            field: field.into(),
            message: "must not be empty".into(),
        });
    }
    Ok(())
}

pub fn validate_priority(priority: i32) -> Result<(), TaskServiceError> {
    if !(1..=10).contains(&priority) {
        return Err(TaskServiceError::Validation {
            field: "priority".into(),
            message: format!("must be in 1..=10, got {priority}"),
        });
    }
    Ok(())
}

/// Static checks on a proposed dependency list: no duplicates, no
/// non-positive ids. Self-reference and existence need the task row and the
/// store; see [`validate_dependency_graph`].
pub fn validate_new_dependencies(deps: &[i64]) -> Result<(), TaskServiceError> {
    let mut seen = HashSet::with_capacity(deps.len());
    for &dep in deps {
        if dep <= 0 {
            return Err(TaskServiceError::DependencyInvalid(format!(
                "invalid dependency id: {dep}"
            )));
        }
        if !seen.insert(dep) {
            return Err(TaskServiceError::DependencyInvalid(format!(
                "duplicate dependency: {dep}"
            )));
        }
    }
    Ok(())
}

/// Does any dependency path starting at `start` lead back to `target`?
///
/// The traversal carries a per-branch path set, not a global visited set:
/// shared dependencies (diamond shapes) are legal and must not be flagged.
/// The path set also bounds descent if the stored graph already contains a
/// loop that does not involve `target`.
#[must_use]
pub fn path_reaches(adjacency: &HashMap<i64, Vec<i64>>, start: i64, target: i64) -> bool {
    fn dfs(
        adjacency: &HashMap<i64, Vec<i64>>,
        node: i64,
        target: i64,
        path: &mut Vec<i64>,
    ) -> bool {
        if node == target {
            return true;
        }
        if path.contains(&node) {
            return false;
        }
        path.push(node);
        let reached = adjacency
            .get(&node)
            .is_some_and(|deps| deps.iter().any(|&d| dfs(adjacency, d, target, path)));
        path.pop();
        reached
    }

    let mut path = Vec::new();
    dfs(adjacency, start, target, &mut path)
}

/// Full dependency validation against the store, run inside the caller's
/// transaction so rejection leaves no partial writes.
///
/// Checks, in order: self-reference (eagerly, before any traversal),
/// existence and same-project membership of every referenced task, then the
/// cycle check over the reachable subgraph.
pub async fn validate_dependency_graph(
    conn: &mut PgConnection,
    task_id: i64,
    project_id: i64,
    deps: &[i64],
) -> Result<(), TaskServiceError> {
    if deps.is_empty() {
        return Ok(());
    }

    if deps.contains(&task_id) {
        return Err(TaskServiceError::DependencyInvalid(
            "task cannot depend on itself".into(),
        ));
    }

    // Load the reachable subgraph breadth-first, one round-trip per frontier.
    let mut adjacency: HashMap<i64, Vec<i64>> = HashMap::new();
    let mut frontier: Vec<i64> = deps.to_vec();
    let mut direct_checked = false;

    while !frontier.is_empty() {
        let rows = sqlx::query(
            "SELECT id, project_id, dependencies FROM tasks
             WHERE id = ANY($1) AND deleted_at IS NULL",
        )
        .bind(&frontier)
        .fetch_all(&mut *conn)
        .await?;

        let found: HashMap<i64, (i64, Vec<i64>)> = rows
            .into_iter()
            .map(|r| {
                let id: i64 = r.get("id");
                let pid: i64 = r.get("project_id");
                let d: Vec<i64> = r.get("dependencies");
                (id, (pid, d))
            })
            .collect();

        if !direct_checked {
            // Existence and project membership apply to the direct
            // dependencies only; transitive tasks were validated when they
            // were created.
            for &dep in deps {
                match found.get(&dep) {
                    None => {
                        return Err(TaskServiceError::DependencyInvalid(format!(
                            "dependency {dep} does not exist"
                        )));
                    }
                    Some((pid, _)) if *pid != project_id => {
                        return Err(TaskServiceError::DependencyInvalid(format!(
                            "dependency {dep} belongs to another project"
                        )));
                    }
                    Some(_) => {}
                }
            }
            direct_checked = true;
        }

        let mut next = Vec::new();
        for (id, (_, dep_ids)) in found {
            next.extend(dep_ids.iter().copied().filter(|&d| d != task_id));
            adjacency.insert(id, dep_ids);
        }
        next.retain(|d| !adjacency.contains_key(d));
        next.sort_unstable();
        next.dedup();
        frontier = next;
    }

    for &dep in deps {
        if path_reaches(&adjacency, dep, task_id) {
            return Err(TaskServiceError::DependencyInvalid(format!(
                "dependency {dep} creates a cycle back to task {task_id}"
            )));
        }
    }

    Ok(())
}

/// Validate a breakdown batch where dependencies are indices into the batch.
/// Index bounds and self-references are rejected first, then Kahn's
/// algorithm proves the batch is acyclic. Returns a topological order of the
/// batch so callers can insert dependencies before their dependents.
pub fn validate_batch_dependencies(
    tasks: &[BreakdownTaskRequest],
) -> Result<Vec<usize>, TaskServiceError> {
    let n = tasks.len();
    let mut graph: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut in_degree = vec![0usize; n];

    for (i, task) in tasks.iter().enumerate() {
        if let Some(ref deps) = task.dependencies {
            for &dep_idx in deps {
                if dep_idx >= n {
                    return Err(TaskServiceError::DependencyInvalid(format!(
                        "invalid dependency index: {dep_idx}"
                    )));
                }
                if dep_idx == i {
                    return Err(TaskServiceError::DependencyInvalid(
                        "task cannot depend on itself".into(),
                    ));
                }
                graph[dep_idx].push(i);
                in_degree[i] += 1;
            }
        }
    }

    let mut queue: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(n);

    while let Some(node) = queue.pop_front() {
        order.push(node);
        for &next in &graph[node] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                queue.push_back(next);
            }
        }
    }

    if order.len() != n {
        return Err(TaskServiceError::DependencyInvalid(
            "circular dependency detected in batch".into(),
        ));
    }

    Ok(order)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::TaskType;

    fn adjacency(edges: &[(i64, &[i64])]) -> HashMap<i64, Vec<i64>> {
        edges
            .iter()
            .map(|(id, deps)| (*id, deps.to_vec()))
            .collect()
    }

    #[test]
    fn test_sanitize_trims_and_truncates() {
        assert_eq!(
            sanitize_string(Some("  hello  ".into())),
            Some("hello".to_string())
        );
        let long = "x".repeat(400);
        assert_eq!(sanitize_string(Some(long)).unwrap().len(), MAX_STRING_LEN);
        assert_eq!(sanitize_string(None), None);
    }

    #[test]
    fn test_priority_bounds() {
        assert!(validate_priority(1).is_ok());
        assert!(validate_priority(10).is_ok());
        assert!(validate_priority(0).is_err());
        assert!(validate_priority(11).is_err());
        assert!(validate_priority(-3).is_err());
    }

    #[test]
    fn test_duplicate_dependencies_rejected() {
        let err = validate_new_dependencies(&[2, 2]).unwrap_err();
        assert_eq!(err.code(), "dependency-invalid");
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_non_positive_dependency_rejected() {
        assert!(validate_new_dependencies(&[0]).is_err());
        assert!(validate_new_dependencies(&[-1]).is_err());
        assert!(validate_new_dependencies(&[1, 2, 3]).is_ok());
    }

    #[test]
    fn test_diamond_is_not_a_cycle() {
        // C(1) <- A(2), C(1) <- B(3); D depends on [2, 3].
        // Both branches share 1; neither reaches the new task 4.
        let adj = adjacency(&[(1, &[]), (2, &[1]), (3, &[1])]);
        assert!(!path_reaches(&adj, 2, 4), "diamond must not be flagged");
        assert!(!path_reaches(&adj, 3, 4));
    }

    #[test]
    fn test_cycle_back_to_target_detected() {
        // 2 -> 3 -> 4(target)
        let adj = adjacency(&[(2, &[3]), (3, &[4])]);
        assert!(path_reaches(&adj, 2, 4));
    }

    #[test]
    fn test_preexisting_loop_elsewhere_terminates() {
        // 2 <-> 3 loop that never reaches 9; traversal must not hang.
        let adj = adjacency(&[(2, &[3]), (3, &[2])]);
        assert!(!path_reaches(&adj, 2, 9));
    }

    #[test]
    fn test_direct_self_edge() {
        let adj = adjacency(&[]);
        assert!(path_reaches(&adj, 5, 5), "start == target is a cycle");
    }

    fn breakdown(title: &str, deps: Option<Vec<usize>>) -> BreakdownTaskRequest {
        BreakdownTaskRequest {
            title: title.into(),
            description: None,
            task_type: TaskType::Development,
            priority: None,
            dependencies: deps,
            task_tags: None,
            estimated_hours: None,
            timeout_minutes: None,
            created_by: None,
        }
    }

    #[test]
    fn test_batch_linear_chain_in_order() {
        let tasks = vec![
            breakdown("a", None),
            breakdown("b", Some(vec![0])),
            breakdown("c", Some(vec![1])),
        ];
        let order = validate_batch_dependencies(&tasks).unwrap();
        assert_eq!(order, vec![0, 1, 2], "dependencies come before dependents");
    }

    #[test]
    fn test_batch_diamond_ok() {
        let tasks = vec![
            breakdown("root", None),
            breakdown("left", Some(vec![0])),
            breakdown("right", Some(vec![0])),
            breakdown("join", Some(vec![1, 2])),
        ];
        let order = validate_batch_dependencies(&tasks).unwrap();
        assert_eq!(order.len(), 4);
        assert_eq!(order[0], 0, "root first");
        assert_eq!(order[3], 3, "join last");
    }

    #[test]
    fn test_batch_cycle_rejected() {
        let tasks = vec![breakdown("a", Some(vec![1])), breakdown("b", Some(vec![0]))];
        let err = validate_batch_dependencies(&tasks).unwrap_err();
        assert!(err.to_string().contains("circular"));
    }

    #[test]
    fn test_batch_self_reference_rejected() {
        let tasks = vec![breakdown("a", Some(vec![0]))];
        assert!(validate_batch_dependencies(&tasks).is_err());
    }

    #[test]
    fn test_batch_out_of_range_index_rejected() {
        let tasks = vec![breakdown("a", Some(vec![7]))];
        let err = validate_batch_dependencies(&tasks).unwrap_err();
        assert!(err.to_string().contains("invalid dependency index"));
    }
}
