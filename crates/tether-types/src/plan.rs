use serde::{Deserialize, Serialize};

/// High-level state of the orchestrator for the active task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// No request in flight
    Idle,
    /// Planning request streaming
    Planning,
    /// Plan received, awaiting user approval
    AwaitingApproval,
    /// Execution request streaming
    Executing,
}

/// Status of a single plan step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl Default for StepStatus {
    fn default() -> Self {
        StepStatus::Pending
    }
}

/// One step of a proposed plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub status: StepStatus,
}

/// A plan proposed by the agent service before execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPlan {
    /// Plan identifier, echoed back on the execution request
    #[serde(default = "default_plan_id")]
    pub id: String,
    /// What the plan is trying to achieve
    pub goal: String,
    /// Ordered steps
    pub steps: Vec<PlanStep>,
    /// Free-form notes from the planner
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

fn default_plan_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl TaskPlan {
    /// Reset every step back to pending (used when a plan is approved and
    /// execution starts from scratch).
    pub fn reset_steps(&mut self) {
        for step in &mut self.steps {
            step.status = StepStatus::Pending;
        }
    }
}
