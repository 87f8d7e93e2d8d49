// Tether Engine
// Client-side orchestration for remote agent runs: the plan/approve/execute
// protocol, streamed event consumption, and multi-task bookkeeping.

pub mod config;
pub mod error;
pub mod net;
pub mod normalize;
pub mod orchestrator;
pub mod progress;
pub mod registry;
pub mod store;
pub mod stream;

pub use config::{ConfigProvider, FixedWorkDir, StaticConfig, WorkDirResolver};
pub use error::{EngineError, Result};
pub use net::{AgentClient, DEFAULT_BASE_DELAY, DEFAULT_MAX_RETRIES};
pub use orchestrator::{OrchestratorSnapshot, TaskOrchestrator, UiEvent};
pub use progress::PlanProgressEstimator;
pub use registry::{BackgroundTask, BackgroundTaskRegistry, RegistryChange, RegistryChangeKind};
pub use store::{
    ExecutionRecord, ExecutionStatus, ExecutionStore, FsStore, MemoryStore, TaskStore,
};
pub use stream::QUESTION_TOOL;
