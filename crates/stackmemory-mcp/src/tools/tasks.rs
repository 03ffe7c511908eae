//! Task Tools
//!
//! CRUD over the companion task store: `create_task`, `update_task_status`,
//! `get_active_tasks`, `get_task_metrics`, `add_task_dependency`.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use stackmemory_core::{EngineError, ExternalLink, MemoryEngine, NewTask, TaskPriority, TaskStatus};

use super::{deadline_from, optional_args, required_args, ToolResult};

pub fn create_task_schema() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "title": { "type": "string", "description": "Task title" },
            "description": { "type": "string" },
            "priority": {
                "type": "string",
                "enum": ["low", "medium", "high", "urgent"],
                "default": "medium"
            },
            "tags": { "type": "array", "items": { "type": "string" } },
            "parent_task_id": { "type": "string" },
            "external": {
                "type": "object",
                "properties": {
                    "system": { "type": "string" },
                    "id": { "type": "string" }
                },
                "description": "Link to an external ticket system"
            },
            "deadline_ms": { "type": "integer" }
        },
        "required": ["title"]
    })
}

#[derive(Debug, Deserialize)]
struct CreateTaskArgs {
    title: String,
    description: Option<String>,
    priority: Option<String>,
    tags: Option<Vec<String>>,
    parent_task_id: Option<String>,
    external: Option<ExternalLink>,
    deadline_ms: Option<u64>,
}

pub fn create_task(engine: &Arc<MemoryEngine>, args: Option<Value>) -> ToolResult {
    let args: CreateTaskArgs = required_args(args)?;
    MemoryEngine::check_deadline(deadline_from(args.deadline_ms))?;
    let priority = match args.priority.as_deref() {
        None => None,
        Some(raw) => Some(TaskPriority::parse_name(raw).ok_or_else(|| {
            EngineError::InvalidArgument(format!("unknown priority '{}'", raw))
        })?),
    };
    let task = engine.create_task(NewTask {
        title: args.title,
        description: args.description,
        priority,
        tags: args.tags.unwrap_or_default(),
        parent_task_id: args.parent_task_id,
        external: args.external,
    })?;
    Ok(serde_json::to_value(task).unwrap_or(Value::Null).into())
}

pub fn update_task_status_schema() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "task_id": { "type": "string" },
            "status": {
                "type": "string",
                "enum": ["pending", "in_progress", "blocked", "completed", "cancelled"]
            },
            "progress": { "type": "integer", "minimum": 0, "maximum": 100 },
            "deadline_ms": { "type": "integer" }
        },
        "required": ["task_id", "status"]
    })
}

#[derive(Debug, Deserialize)]
struct UpdateTaskStatusArgs {
    task_id: String,
    status: String,
    progress: Option<u8>,
    deadline_ms: Option<u64>,
}

pub fn update_task_status(engine: &Arc<MemoryEngine>, args: Option<Value>) -> ToolResult {
    let args: UpdateTaskStatusArgs = required_args(args)?;
    MemoryEngine::check_deadline(deadline_from(args.deadline_ms))?;
    let status = TaskStatus::parse_name(&args.status)
        .ok_or_else(|| EngineError::InvalidArgument(format!("unknown status '{}'", args.status)))?;
    let task = engine.update_task_status(&args.task_id, status, args.progress)?;
    Ok(serde_json::to_value(task).unwrap_or(Value::Null).into())
}

pub fn get_active_tasks_schema() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "limit": { "type": "integer", "default": 50 },
            "deadline_ms": { "type": "integer" }
        }
    })
}

#[derive(Debug, Default, Deserialize)]
struct GetActiveTasksArgs {
    limit: Option<usize>,
    deadline_ms: Option<u64>,
}

pub fn get_active_tasks(engine: &Arc<MemoryEngine>, args: Option<Value>) -> ToolResult {
    let args: GetActiveTasksArgs = optional_args(args)?;
    MemoryEngine::check_deadline(deadline_from(args.deadline_ms))?;
    let tasks = engine.get_active_tasks(args.limit.unwrap_or(50))?;
    let count = tasks.len();
    Ok(serde_json::json!({"tasks": tasks, "count": count}).into())
}

pub fn get_task_metrics_schema() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "deadline_ms": { "type": "integer" }
        }
    })
}

#[derive(Debug, Default, Deserialize)]
struct GetTaskMetricsArgs {
    deadline_ms: Option<u64>,
}

pub fn get_task_metrics(engine: &Arc<MemoryEngine>, args: Option<Value>) -> ToolResult {
    let args: GetTaskMetricsArgs = optional_args(args)?;
    MemoryEngine::check_deadline(deadline_from(args.deadline_ms))?;
    let metrics = engine.get_task_metrics()?;
    Ok(serde_json::to_value(metrics).unwrap_or(Value::Null).into())
}

pub fn add_task_dependency_schema() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "task_id": { "type": "string", "description": "The dependent task" },
            "depends_on": { "type": "string", "description": "The prerequisite task" },
            "deadline_ms": { "type": "integer" }
        },
        "required": ["task_id", "depends_on"]
    })
}

#[derive(Debug, Deserialize)]
struct AddTaskDependencyArgs {
    task_id: String,
    depends_on: String,
    deadline_ms: Option<u64>,
}

pub fn add_task_dependency(engine: &Arc<MemoryEngine>, args: Option<Value>) -> ToolResult {
    let args: AddTaskDependencyArgs = required_args(args)?;
    MemoryEngine::check_deadline(deadline_from(args.deadline_ms))?;
    engine.add_task_dependency(&args.task_id, &args.depends_on)?;
    Ok(serde_json::json!({"linked": true}).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn engine() -> (Arc<MemoryEngine>, TempDir) {
        let dir = TempDir::new().unwrap();
        let engine =
            MemoryEngine::init_at(dir.path().join("proj"), dir.path().join("home")).unwrap();
        (Arc::new(engine), dir)
    }

    #[test]
    fn test_create_update_metrics_flow() {
        let (engine, _dir) = engine();
        let created = create_task(
            &engine,
            Some(serde_json::json!({
                "title": "Ship retrieval",
                "priority": "urgent",
                "external": {"system": "linear", "id": "ENG-42"},
            })),
        )
        .unwrap();
        let task_id = created.value["taskId"].as_str().unwrap().to_string();

        let updated = update_task_status(
            &engine,
            Some(serde_json::json!({"task_id": task_id, "status": "in_progress", "progress": 30})),
        )
        .unwrap();
        assert_eq!(updated.value["progress"], 30);

        let active = get_active_tasks(&engine, None).unwrap();
        assert_eq!(active.value["count"], 1);

        let metrics = get_task_metrics(&engine, None).unwrap();
        assert_eq!(metrics.value["inProgress"], 1);
        assert_eq!(metrics.value["urgentOpen"], 1);
    }

    #[test]
    fn test_dependency_tool() {
        let (engine, _dir) = engine();
        let a = create_task(&engine, Some(serde_json::json!({"title": "a"}))).unwrap();
        let b = create_task(&engine, Some(serde_json::json!({"title": "b"}))).unwrap();
        let out = add_task_dependency(
            &engine,
            Some(serde_json::json!({
                "task_id": a.value["taskId"],
                "depends_on": b.value["taskId"],
            })),
        )
        .unwrap();
        assert_eq!(out.value["linked"], true);
    }

    #[test]
    fn test_unknown_status_is_invalid() {
        let (engine, _dir) = engine();
        let task = create_task(&engine, Some(serde_json::json!({"title": "x"}))).unwrap();
        let err = update_task_status(
            &engine,
            Some(serde_json::json!({"task_id": task.value["taskId"], "status": "paused"})),
        )
        .unwrap_err();
        assert_eq!(err.error_code(), "InvalidArgument");
    }
}
