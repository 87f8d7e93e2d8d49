use crate::plan::TaskPlan;
use serde::{Deserialize, Serialize};

/// One user-initiated unit of agent work.
///
/// Owned by the orchestrator for its lifetime; deletion is an external
/// concern and never happens here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Stable task identifier
    pub id: String,
    /// Initiating prompt
    pub prompt: String,
    /// Backend correlation id, reassigned when the task resumes with a
    /// different stored session
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Workspace directory override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<String>,
    /// Most recent plan, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<TaskPlan>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl TaskRecord {
    pub fn new(prompt: String, work_dir: Option<String>) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            prompt,
            session_id: None,
            work_dir,
            plan: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Input for creating a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<String>,
}

/// Partial update applied to a stored task. `None` fields are untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskUpdates {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<TaskPlan>,
}
