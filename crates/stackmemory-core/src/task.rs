//! Task Store
//!
//! Small companion store for caller-managed work items: CRUD, dependency
//! links, and aggregate metrics. Tasks live beside frames but have their own
//! lifecycle; nothing in the tier layer touches them.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::storage::Store;

// ============================================================================
// TYPES
// ============================================================================

/// Task lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Blocked,
    Completed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Completed => "completed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse_name(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "in_progress" => Some(TaskStatus::InProgress),
            "blocked" => Some(TaskStatus::Blocked),
            "completed" => Some(TaskStatus::Completed),
            "cancelled" => Some(TaskStatus::Cancelled),
            _ => None,
        }
    }

    /// Completed and cancelled tasks accept no further updates.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Cancelled)
    }
}

/// Task priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

impl TaskPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPriority::Low => "low",
            TaskPriority::Medium => "medium",
            TaskPriority::High => "high",
            TaskPriority::Urgent => "urgent",
        }
    }

    pub fn parse_name(s: &str) -> Option<Self> {
        match s {
            "low" => Some(TaskPriority::Low),
            "medium" => Some(TaskPriority::Medium),
            "high" => Some(TaskPriority::High),
            "urgent" => Some(TaskPriority::Urgent),
            _ => None,
        }
    }
}

/// Link to an external ticket system
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalLink {
    pub system: String,
    pub id: String,
}

/// A task row
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub task_id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<String>,
    /// 0..=100
    pub progress: u8,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external: Option<ExternalLink>,
}

/// Input for `create_task`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NewTask {
    pub title: String,
    pub description: Option<String>,
    pub priority: Option<TaskPriority>,
    pub tags: Vec<String>,
    pub parent_task_id: Option<String>,
    pub external: Option<ExternalLink>,
}

/// Aggregate task counters
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMetrics {
    pub total: u64,
    pub pending: u64,
    pub in_progress: u64,
    pub blocked: u64,
    pub completed: u64,
    pub cancelled: u64,
    pub urgent_open: u64,
    /// completed / (total - cancelled), 0.0 when empty
    pub completion_rate: f64,
    /// Mean progress of non-terminal tasks
    pub avg_open_progress: f64,
}

fn task_from_row(row: &Row) -> rusqlite::Result<Task> {
    let status_raw: String = row.get(3)?;
    let priority_raw: String = row.get(4)?;
    let tags_raw: String = row.get(5)?;
    let tags = serde_json::from_str(&tags_raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let external_system: Option<String> = row.get(11)?;
    let external_id: Option<String> = row.get(12)?;
    let external = match (external_system, external_id) {
        (Some(system), Some(id)) => Some(ExternalLink { system, id }),
        _ => None,
    };
    Ok(Task {
        task_id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        status: TaskStatus::parse_name(&status_raw).unwrap_or_default(),
        priority: TaskPriority::parse_name(&priority_raw).unwrap_or_default(),
        tags,
        parent_task_id: row.get(6)?,
        progress: row.get::<_, i64>(7)?.clamp(0, 100) as u8,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
        completed_at: row.get(10)?,
        external,
    })
}

const TASK_COLUMNS: &str = "task_id, title, description, status, priority, tags, parent_task_id, \
     progress, created_at, updated_at, completed_at, external_system, external_id";

// ============================================================================
// STORE OPERATIONS
// ============================================================================

impl Store {
    pub fn create_task(&self, input: NewTask) -> Result<Task> {
        let title = input.title.trim().to_string();
        if title.is_empty() {
            return Err(EngineError::InvalidArgument("task title is empty".to_string()));
        }
        if let Some(parent) = &input.parent_task_id {
            if self.get_task(parent)?.is_none() {
                return Err(EngineError::NotFound(format!("parent task {}", parent)));
            }
        }

        let now = Utc::now();
        let task = Task {
            task_id: uuid::Uuid::new_v4().to_string(),
            title,
            description: input.description,
            status: TaskStatus::Pending,
            priority: input.priority.unwrap_or_default(),
            tags: input.tags,
            parent_task_id: input.parent_task_id,
            progress: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
            external: input.external,
        };

        self.with_task_writer(|conn| {
            conn.execute(
                &format!(
                    "INSERT INTO tasks ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                    TASK_COLUMNS
                ),
                params![
                    task.task_id,
                    task.title,
                    task.description,
                    task.status.as_str(),
                    task.priority.as_str(),
                    serde_json::to_string(&task.tags).unwrap_or_else(|_| "[]".to_string()),
                    task.parent_task_id,
                    task.progress as i64,
                    task.created_at,
                    task.updated_at,
                    task.completed_at,
                    task.external.as_ref().map(|e| e.system.clone()),
                    task.external.as_ref().map(|e| e.id.clone()),
                ],
            )?;
            Ok(())
        })?;
        Ok(task)
    }

    pub fn get_task(&self, task_id: &str) -> Result<Option<Task>> {
        self.with_task_reader(|conn| {
            let task = conn
                .query_row(
                    &format!("SELECT {} FROM tasks WHERE task_id = ?1", TASK_COLUMNS),
                    params![task_id],
                    task_from_row,
                )
                .optional()?;
            Ok(task)
        })
    }

    /// Move a task through its lifecycle, optionally updating progress.
    /// Terminal tasks reject further updates.
    pub fn update_task_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        progress: Option<u8>,
    ) -> Result<Task> {
        let task = self
            .get_task(task_id)?
            .ok_or_else(|| EngineError::NotFound(format!("task {}", task_id)))?;
        if task.status.is_terminal() {
            return Err(EngineError::Conflict(format!(
                "task {} is {}",
                task_id,
                task.status.as_str()
            )));
        }
        if let Some(progress) = progress {
            if progress > 100 {
                return Err(EngineError::InvalidArgument(format!(
                    "progress {} outside 0..=100",
                    progress
                )));
            }
        }

        let now = Utc::now();
        let progress = match (status, progress) {
            (TaskStatus::Completed, _) => 100,
            (_, Some(p)) => p,
            (_, None) => task.progress,
        };
        let completed_at = if status.is_terminal() { Some(now) } else { None };

        self.with_task_writer(|conn| {
            conn.execute(
                "UPDATE tasks SET status = ?2, progress = ?3, updated_at = ?4, completed_at = ?5
                 WHERE task_id = ?1",
                params![task_id, status.as_str(), progress as i64, now, completed_at],
            )?;
            Ok(())
        })?;

        self.get_task(task_id)?
            .ok_or_else(|| EngineError::NotFound(format!("task {}", task_id)))
    }

    /// Open tasks, most urgent first.
    pub fn get_active_tasks(&self, limit: usize) -> Result<Vec<Task>> {
        self.with_task_reader(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM tasks
                 WHERE status IN ('pending', 'in_progress', 'blocked')
                 ORDER BY CASE priority
                     WHEN 'urgent' THEN 0 WHEN 'high' THEN 1 WHEN 'medium' THEN 2 ELSE 3
                 END, created_at ASC
                 LIMIT ?1",
                TASK_COLUMNS
            ))?;
            let tasks = stmt
                .query_map(params![limit as i64], task_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(tasks)
        })
    }

    /// A dependency edge: `task_id` depends on `depends_on`. Self-links,
    /// unknown ids, duplicates, and direct two-task cycles are rejected.
    pub fn add_task_dependency(&self, task_id: &str, depends_on: &str) -> Result<()> {
        if task_id == depends_on {
            return Err(EngineError::InvalidArgument(
                "a task cannot depend on itself".to_string(),
            ));
        }
        if self.get_task(task_id)?.is_none() {
            return Err(EngineError::NotFound(format!("task {}", task_id)));
        }
        if self.get_task(depends_on)?.is_none() {
            return Err(EngineError::NotFound(format!("task {}", depends_on)));
        }

        self.with_task_writer(|conn| {
            let reverse: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM task_links WHERE task_id = ?1 AND depends_on = ?2",
                    params![depends_on, task_id],
                    |row| row.get(0),
                )
                .optional()?;
            if reverse.is_some() {
                return Err(EngineError::Conflict(format!(
                    "dependency cycle between {} and {}",
                    task_id, depends_on
                )));
            }

            let inserted = conn.execute(
                "INSERT OR IGNORE INTO task_links (task_id, depends_on, created_at) VALUES (?1, ?2, ?3)",
                params![task_id, depends_on, Utc::now()],
            )?;
            if inserted == 0 {
                return Err(EngineError::Conflict(format!(
                    "dependency {} -> {} already exists",
                    task_id, depends_on
                )));
            }
            Ok(())
        })
    }

    pub fn task_dependencies(&self, task_id: &str) -> Result<Vec<String>> {
        self.with_task_reader(|conn| {
            let mut stmt =
                conn.prepare("SELECT depends_on FROM task_links WHERE task_id = ?1 ORDER BY created_at")?;
            let ids = stmt
                .query_map(params![task_id], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(ids)
        })
    }

    pub fn get_task_metrics(&self) -> Result<TaskMetrics> {
        self.with_task_reader(|conn| {
            let mut metrics = TaskMetrics::default();
            let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM tasks GROUP BY status")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            for (status, count) in rows {
                let count = count as u64;
                metrics.total += count;
                match TaskStatus::parse_name(&status) {
                    Some(TaskStatus::Pending) => metrics.pending = count,
                    Some(TaskStatus::InProgress) => metrics.in_progress = count,
                    Some(TaskStatus::Blocked) => metrics.blocked = count,
                    Some(TaskStatus::Completed) => metrics.completed = count,
                    Some(TaskStatus::Cancelled) => metrics.cancelled = count,
                    None => {}
                }
            }

            metrics.urgent_open = conn.query_row(
                "SELECT COUNT(*) FROM tasks WHERE priority = 'urgent'
                 AND status IN ('pending', 'in_progress', 'blocked')",
                [],
                |row| row.get::<_, i64>(0),
            )? as u64;

            let denominator = metrics.total.saturating_sub(metrics.cancelled);
            metrics.completion_rate = if denominator > 0 {
                metrics.completed as f64 / denominator as f64
            } else {
                0.0
            };

            metrics.avg_open_progress = conn
                .query_row(
                    "SELECT AVG(progress) FROM tasks WHERE status IN ('pending', 'in_progress', 'blocked')",
                    [],
                    |row| row.get::<_, Option<f64>>(0),
                )?
                .unwrap_or(0.0);

            Ok(metrics)
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (Store, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(&dir.path().join("context.db")).unwrap();
        (store, dir)
    }

    fn new_task(title: &str) -> NewTask {
        NewTask {
            title: title.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_create_and_fetch() {
        let (store, _dir) = store();
        let task = store
            .create_task(NewTask {
                title: "Ship retrieval".to_string(),
                description: Some("token budgets".to_string()),
                priority: Some(TaskPriority::High),
                tags: vec!["retrieval".to_string()],
                parent_task_id: None,
                external: Some(ExternalLink {
                    system: "linear".to_string(),
                    id: "ENG-42".to_string(),
                }),
            })
            .unwrap();

        let loaded = store.get_task(&task.task_id).unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Pending);
        assert_eq!(loaded.priority, TaskPriority::High);
        assert_eq!(loaded.external.unwrap().id, "ENG-42");
        assert_eq!(loaded.progress, 0);
    }

    #[test]
    fn test_empty_title_rejected() {
        let (store, _dir) = store();
        assert!(store.create_task(new_task("  ")).is_err());
    }

    #[test]
    fn test_unknown_parent_rejected() {
        let (store, _dir) = store();
        let mut input = new_task("child");
        input.parent_task_id = Some("ghost".to_string());
        let err = store.create_task(input).unwrap_err();
        assert_eq!(err.error_code(), "NotFound");
    }

    #[test]
    fn test_status_transitions_and_terminal_lock() {
        let (store, _dir) = store();
        let task = store.create_task(new_task("progress")).unwrap();

        let task = store
            .update_task_status(&task.task_id, TaskStatus::InProgress, Some(40))
            .unwrap();
        assert_eq!(task.progress, 40);
        assert!(task.completed_at.is_none());

        let task = store
            .update_task_status(&task.task_id, TaskStatus::Completed, None)
            .unwrap();
        assert_eq!(task.progress, 100);
        assert!(task.completed_at.is_some());

        let err = store
            .update_task_status(&task.task_id, TaskStatus::Pending, None)
            .unwrap_err();
        assert_eq!(err.error_code(), "Conflict");
    }

    #[test]
    fn test_progress_bounds() {
        let (store, _dir) = store();
        let task = store.create_task(new_task("bounds")).unwrap();
        let err = store
            .update_task_status(&task.task_id, TaskStatus::InProgress, Some(101))
            .unwrap_err();
        assert_eq!(err.error_code(), "InvalidArgument");
    }

    #[test]
    fn test_active_tasks_order_by_priority() {
        let (store, _dir) = store();
        let mut low = new_task("low");
        low.priority = Some(TaskPriority::Low);
        store.create_task(low).unwrap();
        let mut urgent = new_task("urgent");
        urgent.priority = Some(TaskPriority::Urgent);
        store.create_task(urgent).unwrap();
        let done = store.create_task(new_task("done")).unwrap();
        store
            .update_task_status(&done.task_id, TaskStatus::Completed, None)
            .unwrap();

        let active = store.get_active_tasks(10).unwrap();
        assert_eq!(active.len(), 2);
        assert_eq!(active[0].title, "urgent");
    }

    #[test]
    fn test_dependencies_validate() {
        let (store, _dir) = store();
        let a = store.create_task(new_task("a")).unwrap();
        let b = store.create_task(new_task("b")).unwrap();

        store.add_task_dependency(&a.task_id, &b.task_id).unwrap();
        assert_eq!(store.task_dependencies(&a.task_id).unwrap(), vec![b.task_id.clone()]);

        // Self, duplicate, reverse (cycle), unknown.
        assert!(store.add_task_dependency(&a.task_id, &a.task_id).is_err());
        assert_eq!(
            store.add_task_dependency(&a.task_id, &b.task_id).unwrap_err().error_code(),
            "Conflict"
        );
        assert_eq!(
            store.add_task_dependency(&b.task_id, &a.task_id).unwrap_err().error_code(),
            "Conflict"
        );
        assert_eq!(
            store.add_task_dependency(&a.task_id, "ghost").unwrap_err().error_code(),
            "NotFound"
        );
    }

    #[test]
    fn test_metrics() {
        let (store, _dir) = store();
        for i in 0..4 {
            let task = store.create_task(new_task(&format!("t{}", i))).unwrap();
            if i == 0 {
                store
                    .update_task_status(&task.task_id, TaskStatus::Completed, None)
                    .unwrap();
            } else if i == 1 {
                store
                    .update_task_status(&task.task_id, TaskStatus::Cancelled, None)
                    .unwrap();
            } else if i == 2 {
                store
                    .update_task_status(&task.task_id, TaskStatus::InProgress, Some(50))
                    .unwrap();
            }
        }

        let metrics = store.get_task_metrics().unwrap();
        assert_eq!(metrics.total, 4);
        assert_eq!(metrics.completed, 1);
        assert_eq!(metrics.cancelled, 1);
        assert_eq!(metrics.in_progress, 1);
        assert!((metrics.completion_rate - 1.0 / 3.0).abs() < 1e-9);
        assert!((metrics.avg_open_progress - 25.0).abs() < 1e-9);
    }
}
