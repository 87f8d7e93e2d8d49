// Task & Execution Stores
// Contracts for the external persistence collaborators, a file-backed
// reference implementation, and in-memory stores for tests and embedders
// that persist elsewhere.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tether_types::{NewTask, TaskRecord, TaskUpdates};

/// Persistent task storage. Must support a `session_id` field so a resumed
/// task can be tied back to its server-side context.
pub trait TaskStore: Send + Sync {
    fn get_task(&self, id: &str) -> Result<Option<TaskRecord>>;
    fn create_task(&self, input: NewTask) -> Result<TaskRecord>;
    fn update_task(&self, id: &str, updates: TaskUpdates) -> Result<TaskRecord>;
}

/// Status of one execution unit. The engine only ever moves records from
/// running to completed; nothing may stay running forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Completed,
}

/// One execution unit of a task (a planning-approved run, a direct run, or a
/// continuation turn).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: String,
    pub task_id: String,
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub started_at: chrono::DateTime<chrono::Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Execution-record storage.
pub trait ExecutionStore: Send + Sync {
    /// Create a new execution unit for the task with status running and
    /// return its id.
    fn begin_execution(&self, task_id: &str) -> Result<String>;
    /// Resolve the current (most recent running) execution unit for a task.
    fn current_execution(&self, task_id: &str) -> Result<Option<String>>;
    /// Mark an execution completed, recording cost and duration when known.
    /// Idempotent: completing an already-completed record keeps the first
    /// recorded cost/duration.
    fn mark_completed(
        &self,
        execution_id: &str,
        cost_usd: Option<f64>,
        duration_ms: Option<u64>,
    ) -> Result<()>;
    /// Look up a record, mainly for inspection and tests.
    fn get_execution(&self, execution_id: &str) -> Result<Option<ExecutionRecord>>;
}

// ============================================================================
// File-backed store
// ============================================================================

/// File-backed store: one directory per task holding `task.json` and an
/// append-friendly `executions.json`.
pub struct FsStore {
    base_dir: PathBuf,
}

impl FsStore {
    pub fn new(base_dir: &Path) -> Result<Self> {
        fs::create_dir_all(base_dir)
            .map_err(|e| EngineError::Store(format!("Failed to create store directory: {}", e)))?;
        Ok(Self {
            base_dir: base_dir.to_path_buf(),
        })
    }

    fn task_dir(&self, task_id: &str) -> PathBuf {
        self.base_dir.join(task_id)
    }

    fn task_path(&self, task_id: &str) -> PathBuf {
        self.task_dir(task_id).join("task.json")
    }

    fn executions_path(&self, task_id: &str) -> PathBuf {
        self.task_dir(task_id).join("executions.json")
    }

    fn load_executions(&self, task_id: &str) -> Result<Vec<ExecutionRecord>> {
        let path = self.executions_path(task_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&path)
            .map_err(|e| EngineError::Store(format!("Failed to read executions: {}", e)))?;
        serde_json::from_str(&content)
            .map_err(|e| EngineError::Store(format!("Failed to parse executions: {}", e)))
    }

    fn save_executions(&self, task_id: &str, records: &[ExecutionRecord]) -> Result<()> {
        let content = serde_json::to_string_pretty(records)
            .map_err(|e| EngineError::Store(format!("Failed to serialize executions: {}", e)))?;
        atomic_write(&self.executions_path(task_id), &content)
    }

    /// Scan every task directory for the execution record. Execution ids are
    /// unique, so the first hit wins.
    fn find_execution(&self, execution_id: &str) -> Result<Option<(String, Vec<ExecutionRecord>)>> {
        if !self.base_dir.exists() {
            return Ok(None);
        }
        for entry in fs::read_dir(&self.base_dir)
            .map_err(|e| EngineError::Store(format!("Failed to read store directory: {}", e)))?
        {
            let entry =
                entry.map_err(|e| EngineError::Store(format!("Failed to read entry: {}", e)))?;
            if !entry.path().is_dir() {
                continue;
            }
            let Some(task_id) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let records = self.load_executions(&task_id)?;
            if records.iter().any(|r| r.id == execution_id) {
                return Ok(Some((task_id, records)));
            }
        }
        Ok(None)
    }
}

impl TaskStore for FsStore {
    fn get_task(&self, id: &str) -> Result<Option<TaskRecord>> {
        let path = self.task_path(id);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)
            .map_err(|e| EngineError::Store(format!("Failed to read task: {}", e)))?;
        let task = serde_json::from_str(&content)
            .map_err(|e| EngineError::Store(format!("Failed to parse task: {}", e)))?;
        Ok(Some(task))
    }

    fn create_task(&self, input: NewTask) -> Result<TaskRecord> {
        let task = TaskRecord::new(input.prompt, input.work_dir);
        let dir = self.task_dir(&task.id);
        fs::create_dir_all(&dir)
            .map_err(|e| EngineError::Store(format!("Failed to create task directory: {}", e)))?;
        let content = serde_json::to_string_pretty(&task)
            .map_err(|e| EngineError::Store(format!("Failed to serialize task: {}", e)))?;
        atomic_write(&self.task_path(&task.id), &content)?;
        Ok(task)
    }

    fn update_task(&self, id: &str, updates: TaskUpdates) -> Result<TaskRecord> {
        let mut task = self
            .get_task(id)?
            .ok_or_else(|| EngineError::NotFound(format!("task {id}")))?;
        if let Some(session_id) = updates.session_id {
            task.session_id = Some(session_id);
        }
        if let Some(work_dir) = updates.work_dir {
            task.work_dir = Some(work_dir);
        }
        if let Some(plan) = updates.plan {
            task.plan = Some(plan);
        }
        task.updated_at = chrono::Utc::now();
        let content = serde_json::to_string_pretty(&task)
            .map_err(|e| EngineError::Store(format!("Failed to serialize task: {}", e)))?;
        atomic_write(&self.task_path(id), &content)?;
        Ok(task)
    }
}

impl ExecutionStore for FsStore {
    fn begin_execution(&self, task_id: &str) -> Result<String> {
        let dir = self.task_dir(task_id);
        fs::create_dir_all(&dir)
            .map_err(|e| EngineError::Store(format!("Failed to create task directory: {}", e)))?;
        let mut records = self.load_executions(task_id)?;
        let record = ExecutionRecord {
            id: uuid::Uuid::new_v4().to_string(),
            task_id: task_id.to_string(),
            status: ExecutionStatus::Running,
            cost_usd: None,
            duration_ms: None,
            started_at: chrono::Utc::now(),
            ended_at: None,
        };
        let id = record.id.clone();
        records.push(record);
        self.save_executions(task_id, &records)?;
        Ok(id)
    }

    fn current_execution(&self, task_id: &str) -> Result<Option<String>> {
        let records = self.load_executions(task_id)?;
        Ok(records
            .iter()
            .rev()
            .find(|r| r.status == ExecutionStatus::Running)
            .map(|r| r.id.clone()))
    }

    fn mark_completed(
        &self,
        execution_id: &str,
        cost_usd: Option<f64>,
        duration_ms: Option<u64>,
    ) -> Result<()> {
        let Some((task_id, mut records)) = self.find_execution(execution_id)? else {
            return Err(EngineError::NotFound(format!("execution {execution_id}")));
        };
        for record in &mut records {
            if record.id == execution_id && record.status == ExecutionStatus::Running {
                record.status = ExecutionStatus::Completed;
                record.cost_usd = record.cost_usd.or(cost_usd);
                record.duration_ms = record.duration_ms.or(duration_ms);
                record.ended_at = Some(chrono::Utc::now());
            }
        }
        self.save_executions(&task_id, &records)
    }

    fn get_execution(&self, execution_id: &str) -> Result<Option<ExecutionRecord>> {
        Ok(self
            .find_execution(execution_id)?
            .and_then(|(_, records)| records.into_iter().find(|r| r.id == execution_id)))
    }
}

/// Atomic write using temp file and rename.
fn atomic_write(path: &Path, content: &str) -> Result<()> {
    let temp_path = path.with_extension("tmp");
    fs::write(&temp_path, content)
        .map_err(|e| EngineError::Store(format!("Failed to write temp file: {}", e)))?;
    fs::rename(&temp_path, path)
        .map_err(|e| EngineError::Store(format!("Failed to rename temp file: {}", e)))?;
    Ok(())
}

// ============================================================================
// In-memory store
// ============================================================================

/// In-memory store for tests and embedders that persist elsewhere.
#[derive(Default)]
pub struct MemoryStore {
    tasks: Mutex<HashMap<String, TaskRecord>>,
    executions: Mutex<Vec<ExecutionRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TaskStore for MemoryStore {
    fn get_task(&self, id: &str) -> Result<Option<TaskRecord>> {
        Ok(self.tasks.lock().expect("store lock").get(id).cloned())
    }

    fn create_task(&self, input: NewTask) -> Result<TaskRecord> {
        let task = TaskRecord::new(input.prompt, input.work_dir);
        self.tasks
            .lock()
            .expect("store lock")
            .insert(task.id.clone(), task.clone());
        Ok(task)
    }

    fn update_task(&self, id: &str, updates: TaskUpdates) -> Result<TaskRecord> {
        let mut tasks = self.tasks.lock().expect("store lock");
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| EngineError::NotFound(format!("task {id}")))?;
        if let Some(session_id) = updates.session_id {
            task.session_id = Some(session_id);
        }
        if let Some(work_dir) = updates.work_dir {
            task.work_dir = Some(work_dir);
        }
        if let Some(plan) = updates.plan {
            task.plan = Some(plan);
        }
        task.updated_at = chrono::Utc::now();
        Ok(task.clone())
    }
}

impl ExecutionStore for MemoryStore {
    fn begin_execution(&self, task_id: &str) -> Result<String> {
        let record = ExecutionRecord {
            id: uuid::Uuid::new_v4().to_string(),
            task_id: task_id.to_string(),
            status: ExecutionStatus::Running,
            cost_usd: None,
            duration_ms: None,
            started_at: chrono::Utc::now(),
            ended_at: None,
        };
        let id = record.id.clone();
        self.executions.lock().expect("store lock").push(record);
        Ok(id)
    }

    fn current_execution(&self, task_id: &str) -> Result<Option<String>> {
        Ok(self
            .executions
            .lock()
            .expect("store lock")
            .iter()
            .rev()
            .find(|r| r.task_id == task_id && r.status == ExecutionStatus::Running)
            .map(|r| r.id.clone()))
    }

    fn mark_completed(
        &self,
        execution_id: &str,
        cost_usd: Option<f64>,
        duration_ms: Option<u64>,
    ) -> Result<()> {
        let mut executions = self.executions.lock().expect("store lock");
        let Some(record) = executions.iter_mut().find(|r| r.id == execution_id) else {
            return Err(EngineError::NotFound(format!("execution {execution_id}")));
        };
        if record.status == ExecutionStatus::Running {
            record.status = ExecutionStatus::Completed;
            record.cost_usd = record.cost_usd.or(cost_usd);
            record.duration_ms = record.duration_ms.or(duration_ms);
            record.ended_at = Some(chrono::Utc::now());
        }
        Ok(())
    }

    fn get_execution(&self, execution_id: &str) -> Result<Option<ExecutionRecord>> {
        Ok(self
            .executions
            .lock()
            .expect("store lock")
            .iter()
            .find(|r| r.id == execution_id)
            .cloned())
    }
}

// ============================================================================
// Tests
// ============================================================================
