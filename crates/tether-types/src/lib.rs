pub mod message;
pub mod plan;
pub mod task;

pub use message::{
    AgentMessage, Attachment, PermissionRequest, QuestionAnswer, QuestionChoice, QuestionInfo,
    QuestionRequest,
};
pub use plan::{Phase, PlanStep, StepStatus, TaskPlan};
pub use task::{NewTask, TaskRecord, TaskUpdates};
