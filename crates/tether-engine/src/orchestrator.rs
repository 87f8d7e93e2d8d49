// Task Orchestrator
// Top-level coordinator: owns phase state, active-task identity, the
// plan/approval flow, and permission/question pausing. All mutable trackers
// live on an explicit shared context injected into the stream processor.

use crate::config::{ConfigProvider, WorkDirResolver};
use crate::error::{EngineError, Result};
use crate::net::AgentClient;
use crate::progress::PlanProgressEstimator;
use crate::registry::{BackgroundTask, BackgroundTaskRegistry, RegistryChange};
use crate::store::{ExecutionStore, TaskStore};
use crate::stream::{StreamContext, StreamKind, StreamProcessor};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tether_types::{
    AgentMessage, Attachment, NewTask, PermissionRequest, Phase, QuestionAnswer, QuestionRequest,
    TaskPlan, TaskUpdates,
};
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;

/// Event pushed to UI subscribers. Fired only for the active task; background
/// streams make progress silently and persist through the stores.
#[derive(Debug, Clone)]
pub enum UiEvent {
    Message { task_id: String, message: AgentMessage },
    PhaseChanged { task_id: String, phase: Phase },
    PlanUpdated { task_id: String, plan: TaskPlan },
    QuestionAsked { task_id: String, question: QuestionRequest },
    PermissionAsked { task_id: String, permission: PermissionRequest },
}

/// Point-in-time view of the active task for callers that poll.
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorSnapshot {
    pub task_id: Option<String>,
    pub session_id: Option<String>,
    pub phase: Phase,
    pub is_running: bool,
    pub plan: Option<TaskPlan>,
    pub pending_permission: Option<PermissionRequest>,
    pub pending_question: Option<QuestionRequest>,
}

/// Which endpoint a stream request goes to.
pub(crate) enum StreamRequest {
    /// POST /agent/plan
    Plan,
    /// POST /agent/execute
    Execute,
    /// POST /agent (image-bearing and continuation turns)
    Direct,
}

/// State of the task currently presented to the user.
#[derive(Debug)]
pub(crate) struct ActiveState {
    pub task_id: Option<String>,
    pub prompt: String,
    pub session_id: Option<String>,
    pub phase: Phase,
    pub plan: Option<TaskPlan>,
    pub pending_permission: Option<PermissionRequest>,
    pub pending_question: Option<QuestionRequest>,
    /// Cancellation handle for the in-flight stream, if any
    pub cancel: Option<CancellationToken>,
    pub is_running: bool,
}

impl Default for ActiveState {
    fn default() -> Self {
        Self {
            task_id: None,
            prompt: String::new(),
            session_id: None,
            phase: Phase::Idle,
            plan: None,
            pending_permission: None,
            pending_question: None,
            cancel: None,
            is_running: false,
        }
    }
}

/// Orchestrator-owned context shared with stream processors. Constructed once
/// per application session.
pub(crate) struct EngineShared {
    pub(crate) client: AgentClient,
    pub(crate) tasks: Arc<dyn TaskStore>,
    pub(crate) executions: Arc<dyn ExecutionStore>,
    pub(crate) configs: Arc<dyn ConfigProvider>,
    pub(crate) workdir: Arc<dyn WorkDirResolver>,
    pub(crate) registry: BackgroundTaskRegistry,
    pub(crate) state: RwLock<ActiveState>,
    /// Per-task message sequences, append-only, in arrival order.
    pub(crate) messages: RwLock<HashMap<String, Vec<AgentMessage>>>,
    pub(crate) ui_tx: broadcast::Sender<UiEvent>,
}

impl EngineShared {
    pub(crate) fn emit(&self, event: UiEvent) {
        // No receivers is fine.
        let _ = self.ui_tx.send(event);
    }

    /// Active-task check, evaluated at dispatch time.
    pub(crate) async fn is_active(&self, task_id: &str) -> bool {
        self.state.read().await.task_id.as_deref() == Some(task_id)
    }

    /// Append a message to the owning task's sequence. The UI callback fires
    /// only when that task is active.
    pub(crate) async fn append_message(&self, task_id: &str, message: AgentMessage) {
        {
            let mut messages = self.messages.write().await;
            messages
                .entry(task_id.to_string())
                .or_default()
                .push(message.clone());
        }
        if self.is_active(task_id).await {
            self.emit(UiEvent::Message {
                task_id: task_id.to_string(),
                message,
            });
        }
    }

    /// Record a session id for a task: active state, any backgrounded entry,
    /// and the task store all learn about it, whichever task is active.
    pub(crate) async fn capture_session(&self, task_id: &str, session_id: String) {
        {
            let mut st = self.state.write().await;
            if st.task_id.as_deref() == Some(task_id) {
                st.session_id = Some(session_id.clone());
            }
        }
        if let Some(mut entry) = self.registry.get(task_id) {
            entry.session_id = Some(session_id.clone());
            self.registry.add(entry);
        }
        if let Err(e) = self.tasks.update_task(
            task_id,
            TaskUpdates {
                session_id: Some(session_id),
                ..Default::default()
            },
        ) {
            tracing::warn!("Failed to persist session id for task {}: {}", task_id, e);
        }
    }

    /// Install a freshly received plan: persist it, and move the active task
    /// to awaiting_approval when it owns the stream.
    pub(crate) async fn install_plan(&self, task_id: &str, plan: TaskPlan) {
        if let Err(e) = self.tasks.update_task(
            task_id,
            TaskUpdates {
                plan: Some(plan.clone()),
                ..Default::default()
            },
        ) {
            tracing::warn!("Failed to persist plan for task {}: {}", task_id, e);
        }
        self.append_message(task_id, AgentMessage::Plan { plan: plan.clone() })
            .await;

        let mut st = self.state.write().await;
        if st.task_id.as_deref() == Some(task_id) {
            st.plan = Some(plan.clone());
            st.phase = Phase::AwaitingApproval;
            drop(st);
            self.emit(UiEvent::PlanUpdated {
                task_id: task_id.to_string(),
                plan,
            });
            self.emit(UiEvent::PhaseChanged {
                task_id: task_id.to_string(),
                phase: Phase::AwaitingApproval,
            });
        }
    }

    /// A direct answer ends a planning cycle without a plan.
    pub(crate) async fn direct_answer_received(&self, task_id: &str, content: String) {
        self.append_message(task_id, AgentMessage::Text { content })
            .await;
        let mut st = self.state.write().await;
        if st.task_id.as_deref() == Some(task_id) {
            st.plan = None;
            st.phase = Phase::Idle;
            drop(st);
            self.emit(UiEvent::PhaseChanged {
                task_id: task_id.to_string(),
                phase: Phase::Idle,
            });
        }
    }

    /// Re-estimate plan progress for the active task. The estimate is
    /// UI-only and is deliberately not written to the task store.
    pub(crate) async fn apply_progress(&self, task_id: &str, estimator: &PlanProgressEstimator) {
        let mut st = self.state.write().await;
        if st.task_id.as_deref() != Some(task_id) {
            return;
        }
        let Some(plan) = st.plan.as_mut() else {
            return;
        };
        estimator.apply(plan);
        let plan = plan.clone();
        drop(st);
        self.emit(UiEvent::PlanUpdated {
            task_id: task_id.to_string(),
            plan,
        });
    }

    pub(crate) async fn set_pending_permission(
        &self,
        task_id: &str,
        permission: PermissionRequest,
    ) {
        self.append_message(
            task_id,
            AgentMessage::PermissionRequest {
                permission: permission.clone(),
            },
        )
        .await;
        let mut st = self.state.write().await;
        if st.task_id.as_deref() == Some(task_id) {
            st.pending_permission = Some(permission.clone());
            drop(st);
            self.emit(UiEvent::PermissionAsked {
                task_id: task_id.to_string(),
                permission,
            });
        }
    }

    /// Pause for an interactive question: the stream is being cancelled by
    /// the processor, so the current execution unit is closed out and the
    /// task stops running without a done record.
    pub(crate) async fn pause_for_question(&self, task_id: &str, question: QuestionRequest) {
        self.complete_execution(task_id, None, None).await;
        let mut st = self.state.write().await;
        if st.task_id.as_deref() == Some(task_id) {
            st.pending_question = Some(question.clone());
            st.is_running = false;
            st.cancel = None;
            drop(st);
            self.emit(UiEvent::QuestionAsked {
                task_id: task_id.to_string(),
                question,
            });
        } else {
            drop(st);
            self.registry.set_running(task_id, false);
        }
    }

    /// Best-effort completion of the task's current execution unit. Must be
    /// reachable from every path that could otherwise leave a record stuck
    /// in running.
    pub(crate) async fn complete_execution(
        &self,
        task_id: &str,
        cost_usd: Option<f64>,
        duration_ms: Option<u64>,
    ) {
        match self.executions.current_execution(task_id) {
            Ok(Some(execution_id)) => {
                if let Err(e) = self
                    .executions
                    .mark_completed(&execution_id, cost_usd, duration_ms)
                {
                    tracing::warn!(
                        "Failed to mark execution {} completed: {}",
                        execution_id,
                        e
                    );
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!("Failed to resolve execution for task {}: {}", task_id, e);
            }
        }
    }

    /// Terminal bookkeeping for a stream: optional error message, execution
    /// completion, and active/background cleanup. awaiting_approval is
    /// preserved so a finished planning stream does not clobber it.
    pub(crate) async fn finish_stream(&self, task_id: &str, error: Option<String>) {
        if let Some(message) = error {
            tracing::warn!("Stream for task {} failed: {}", task_id, message);
            self.append_message(task_id, AgentMessage::Error { message })
                .await;
        }
        self.complete_execution(task_id, None, None).await;

        let mut st = self.state.write().await;
        if st.task_id.as_deref() == Some(task_id) {
            st.is_running = false;
            st.cancel = None;
            let back_to_idle = matches!(st.phase, Phase::Planning | Phase::Executing);
            if back_to_idle {
                st.phase = Phase::Idle;
            }
            drop(st);
            if back_to_idle {
                self.emit(UiEvent::PhaseChanged {
                    task_id: task_id.to_string(),
                    phase: Phase::Idle,
                });
            }
        } else {
            drop(st);
            self.registry.remove(task_id);
        }
    }

    pub(crate) async fn fail_stream(&self, task_id: &str, message: String) {
        self.finish_stream(task_id, Some(message)).await;
    }

    /// Issue a stream request in a detached task and consume the response.
    /// The handle passed in is the only way to stop it.
    pub(crate) fn spawn_stream(
        self: &Arc<Self>,
        task_id: String,
        request: StreamRequest,
        body: Value,
        cancel: CancellationToken,
        kind: StreamKind,
    ) {
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            let result = match request {
                StreamRequest::Plan => shared.client.start_plan(&body, &cancel).await,
                StreamRequest::Execute => shared.client.start_execution(&body, &cancel).await,
                StreamRequest::Direct => shared.client.start_direct(&body, &cancel).await,
            };
            match result {
                Err(e) if e.is_cancelled() => {
                    tracing::debug!("Request for task {} cancelled", task_id);
                }
                Err(e) => {
                    shared.fail_stream(&task_id, e.to_string()).await;
                }
                Ok(response) if !response.status().is_success() => {
                    let status = response.status();
                    let text = response.text().await.unwrap_or_default();
                    shared
                        .fail_stream(
                            &task_id,
                            format!("Agent service error: {} {}", status, text.trim()),
                        )
                        .await;
                }
                Ok(response) => {
                    let ctx = StreamContext {
                        task_id,
                        kind,
                        cancel,
                        progress: PlanProgressEstimator::new(),
                    };
                    StreamProcessor::new(shared.clone()).consume(ctx, response).await;
                }
            }
        });
    }
}

/// The public orchestration engine.
#[derive(Clone)]
pub struct TaskOrchestrator {
    shared: Arc<EngineShared>,
}

impl TaskOrchestrator {
    pub fn new(
        client: AgentClient,
        tasks: Arc<dyn TaskStore>,
        executions: Arc<dyn ExecutionStore>,
        configs: Arc<dyn ConfigProvider>,
        workdir: Arc<dyn WorkDirResolver>,
    ) -> Self {
        let (ui_tx, _) = broadcast::channel(2048);
        Self {
            shared: Arc::new(EngineShared {
                client,
                tasks,
                executions,
                configs,
                workdir,
                registry: BackgroundTaskRegistry::new(),
                state: RwLock::new(ActiveState::default()),
                messages: RwLock::new(HashMap::new()),
                ui_tx,
            }),
        }
    }

    /// Subscribe to UI events for the active task.
    pub fn subscribe(&self) -> broadcast::Receiver<UiEvent> {
        self.shared.ui_tx.subscribe()
    }

    /// Subscribe to background-registry changes (badge counters and the
    /// like).
    pub fn subscribe_registry(&self) -> broadcast::Receiver<RegistryChange> {
        self.shared.registry.subscribe()
    }

    pub fn registry(&self) -> &BackgroundTaskRegistry {
        &self.shared.registry
    }

    pub async fn snapshot(&self) -> OrchestratorSnapshot {
        let st = self.shared.state.read().await;
        OrchestratorSnapshot {
            task_id: st.task_id.clone(),
            session_id: st.session_id.clone(),
            phase: st.phase,
            is_running: st.is_running,
            plan: st.plan.clone(),
            pending_permission: st.pending_permission.clone(),
            pending_question: st.pending_question.clone(),
        }
    }

    /// The task's message sequence so far, in arrival order.
    pub async fn messages(&self, task_id: &str) -> Vec<AgentMessage> {
        self.shared
            .messages
            .read()
            .await
            .get(task_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Start a new agent run.
    ///
    /// A still-running active task is handed off to the background registry,
    /// never cancelled. Re-running the task that is currently active and
    /// running is rejected: it must be stopped first, otherwise the same id
    /// would be tracked as active and backgrounded at once. Image-bearing
    /// attachments skip planning entirely: images must be interpreted during
    /// execution, not plan synthesis. Returns the task id.
    pub async fn run_agent(
        &self,
        prompt: &str,
        existing_task_id: Option<&str>,
        attachments: Vec<Attachment>,
    ) -> Result<String> {
        if let Some(id) = existing_task_id {
            {
                let st = self.shared.state.read().await;
                if st.is_running && st.task_id.as_deref() == Some(id) {
                    return Err(EngineError::InvalidOperation(format!(
                        "task {id} is already running"
                    )));
                }
            }
            if let Some(entry) = self.shared.registry.get(id) {
                if entry.is_running {
                    return Err(EngineError::InvalidOperation(format!(
                        "task {id} is already running in the background"
                    )));
                }
                // A paused background entry is superseded by the new run.
                self.shared.registry.remove(id);
            }
        }
        self.background_active().await;

        let task = match existing_task_id {
            Some(id) => self
                .shared
                .tasks
                .get_task(id)?
                .ok_or_else(|| EngineError::NotFound(format!("task {id}")))?,
            None => self.shared.tasks.create_task(NewTask {
                prompt: prompt.to_string(),
                work_dir: None,
            })?,
        };

        let has_images = attachments.iter().any(Attachment::is_image);
        let cancel = CancellationToken::new();
        let phase = if has_images {
            Phase::Executing
        } else {
            Phase::Planning
        };
        {
            let mut st = self.shared.state.write().await;
            st.task_id = Some(task.id.clone());
            st.prompt = prompt.to_string();
            st.session_id = task.session_id.clone();
            st.phase = phase;
            st.plan = None;
            st.pending_permission = None;
            st.pending_question = None;
            st.cancel = Some(cancel.clone());
            st.is_running = true;
        }
        self.shared.emit(UiEvent::PhaseChanged {
            task_id: task.id.clone(),
            phase,
        });
        self.shared
            .append_message(
                &task.id,
                AgentMessage::User {
                    content: prompt.to_string(),
                    attachments: attachments.clone(),
                },
            )
            .await;

        if has_images {
            let work_dir = self
                .shared
                .workdir
                .resolve(&task.id, task.work_dir.as_deref());
            let images: Vec<Value> = attachments
                .iter()
                .filter(|a| a.is_image())
                .map(|a| serde_json::to_value(a).unwrap_or(Value::Null))
                .collect();
            let mut body = json!({
                "prompt": prompt,
                "taskId": task.id,
                "workDir": work_dir,
                "images": images,
            });
            self.attach_configs(&mut body);
            if let Err(e) = self.shared.executions.begin_execution(&task.id) {
                tracing::warn!("Failed to open execution record for {}: {}", task.id, e);
            }
            self.shared.spawn_stream(
                task.id.clone(),
                StreamRequest::Direct,
                body,
                cancel,
                StreamKind::Execution,
            );
        } else {
            let mut body = json!({ "prompt": prompt });
            if let Some(model) = self.shared.configs.model_config() {
                body["modelConfig"] = model;
            }
            self.shared.spawn_stream(
                task.id.clone(),
                StreamRequest::Plan,
                body,
                cancel,
                StreamKind::Planning,
            );
        }

        Ok(task.id)
    }

    /// Approve the pending plan and start execution. A no-op unless the
    /// active task is awaiting approval.
    pub async fn approve_plan(&self) -> Result<()> {
        let (task_id, plan, prompt, cancel) = {
            let mut st = self.shared.state.write().await;
            if st.phase != Phase::AwaitingApproval {
                tracing::warn!(
                    "approve_plan called in phase {:?}; ignoring",
                    st.phase
                );
                return Ok(());
            }
            let Some(plan) = st.plan.as_mut() else {
                tracing::warn!("approve_plan with no plan; ignoring");
                return Ok(());
            };
            plan.reset_steps();
            let plan = plan.clone();
            let task_id = st
                .task_id
                .clone()
                .ok_or_else(|| EngineError::InvalidOperation("no active task".to_string()))?;
            let cancel = CancellationToken::new();
            st.phase = Phase::Executing;
            st.is_running = true;
            st.cancel = Some(cancel.clone());
            (task_id, plan, st.prompt.clone(), cancel)
        };

        self.shared.emit(UiEvent::PlanUpdated {
            task_id: task_id.clone(),
            plan: plan.clone(),
        });
        self.shared.emit(UiEvent::PhaseChanged {
            task_id: task_id.clone(),
            phase: Phase::Executing,
        });

        let stored = self.shared.tasks.get_task(&task_id).ok().flatten();
        let work_dir = self.shared.workdir.resolve(
            &task_id,
            stored.as_ref().and_then(|t| t.work_dir.as_deref()),
        );
        let mut body = json!({
            "planId": plan.id,
            "prompt": prompt,
            "workDir": work_dir,
            "taskId": task_id,
        });
        self.attach_configs(&mut body);

        if let Err(e) = self.shared.executions.begin_execution(&task_id) {
            tracing::warn!("Failed to open execution record for {}: {}", task_id, e);
        }
        self.shared.spawn_stream(
            task_id,
            StreamRequest::Execute,
            body,
            cancel,
            StreamKind::Execution,
        );
        Ok(())
    }

    /// Discard the pending plan without any network call.
    pub async fn reject_plan(&self) -> Result<()> {
        let task_id = {
            let mut st = self.shared.state.write().await;
            if st.phase != Phase::AwaitingApproval {
                tracing::warn!("reject_plan called in phase {:?}; ignoring", st.phase);
                return Ok(());
            }
            st.plan = None;
            st.phase = Phase::Idle;
            st.task_id.clone()
        };
        let Some(task_id) = task_id else {
            return Ok(());
        };
        self.shared
            .append_message(
                &task_id,
                AgentMessage::Text {
                    content: "Plan rejected; execution cancelled.".to_string(),
                },
            )
            .await;
        self.shared.emit(UiEvent::PhaseChanged {
            task_id,
            phase: Phase::Idle,
        });
        Ok(())
    }

    /// Send a follow-up turn on the active task. Valid only while nothing is
    /// running; the full conversation history is rebuilt and sent along.
    pub async fn continue_conversation(
        &self,
        reply: &str,
        attachments: Vec<Attachment>,
    ) -> Result<()> {
        let (task_id, cancel) = {
            let mut st = self.shared.state.write().await;
            if st.is_running {
                return Err(EngineError::InvalidOperation(
                    "a task is currently running".to_string(),
                ));
            }
            let task_id = st
                .task_id
                .clone()
                .ok_or_else(|| EngineError::InvalidOperation("no active task".to_string()))?;
            let cancel = CancellationToken::new();
            st.phase = Phase::Executing;
            st.is_running = true;
            st.pending_question = None;
            st.cancel = Some(cancel.clone());
            (task_id, cancel)
        };

        // History first, then the new turn: the reply rides in `prompt`.
        let (conversation, mut images) = self.build_conversation(&task_id).await;
        self.shared
            .append_message(
                &task_id,
                AgentMessage::User {
                    content: reply.to_string(),
                    attachments: attachments.clone(),
                },
            )
            .await;
        images.extend(
            attachments
                .iter()
                .filter_map(|a| a.path.clone()),
        );

        let stored = self.shared.tasks.get_task(&task_id).ok().flatten();
        let work_dir = self.shared.workdir.resolve(
            &task_id,
            stored.as_ref().and_then(|t| t.work_dir.as_deref()),
        );
        let mut body = json!({
            "prompt": reply,
            "taskId": task_id,
            "workDir": work_dir,
            "conversation": conversation,
        });
        if !images.is_empty() {
            body["images"] = json!(images);
        }
        self.attach_configs(&mut body);

        self.shared.emit(UiEvent::PhaseChanged {
            task_id: task_id.clone(),
            phase: Phase::Executing,
        });
        if let Err(e) = self.shared.executions.begin_execution(&task_id) {
            tracing::warn!("Failed to open execution record for {}: {}", task_id, e);
        }
        self.shared.spawn_stream(
            task_id,
            StreamRequest::Direct,
            body,
            cancel,
            StreamKind::Execution,
        );
        Ok(())
    }

    /// Stop the active task: cancel its stream, tell the service
    /// best-effort, and close out the execution record so nothing is left
    /// running forever.
    pub async fn stop_agent(&self) -> Result<()> {
        let (task_id, session_id, cancel) = {
            let mut st = self.shared.state.write().await;
            let task_id = st.task_id.clone();
            let session_id = st.session_id.clone();
            let cancel = st.cancel.take();
            st.is_running = false;
            st.phase = Phase::Idle;
            st.pending_permission = None;
            st.pending_question = None;
            (task_id, session_id, cancel)
        };

        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        match session_id {
            Some(session_id) => {
                let client = self.shared.client.clone();
                tokio::spawn(async move {
                    client.stop_session(&session_id).await;
                });
            }
            None => {
                tracing::debug!("stop_agent with no active session id");
            }
        }
        if let Some(task_id) = task_id {
            self.shared.complete_execution(&task_id, None, None).await;
            self.shared.emit(UiEvent::PhaseChanged {
                task_id,
                phase: Phase::Idle,
            });
        }
        Ok(())
    }

    /// Answer a pending interactive question. The formatted answer continues
    /// the conversation on the same task. The pending question is cleared
    /// only once the continuation actually starts; on failure it stays
    /// answerable.
    pub async fn answer_question(&self, answers: Vec<QuestionAnswer>) -> Result<()> {
        {
            let st = self.shared.state.read().await;
            if st.pending_question.is_none() {
                return Err(EngineError::InvalidOperation(
                    "no pending question".to_string(),
                ));
            }
        }
        let formatted = answers
            .iter()
            .map(|a| format!("{}: {}", a.header, a.answer))
            .collect::<Vec<_>>()
            .join("\n");
        self.continue_conversation(&formatted, Vec::new()).await
    }

    /// Post a permission decision on the current session. Without a session
    /// id this logs and returns without error.
    pub async fn respond_to_permission(&self, permission_id: &str, approved: bool) -> Result<()> {
        let (task_id, session_id) = {
            let st = self.shared.state.read().await;
            (st.task_id.clone(), st.session_id.clone())
        };
        let Some(session_id) = session_id else {
            tracing::warn!(
                "respond_to_permission for {} without an active session; ignoring",
                permission_id
            );
            return Ok(());
        };
        self.shared
            .client
            .respond_permission(&session_id, permission_id, approved)
            .await?;
        {
            let mut st = self.shared.state.write().await;
            st.pending_permission = None;
        }
        if let Some(task_id) = task_id {
            let verdict = if approved { "approved" } else { "denied" };
            self.shared
                .append_message(
                    &task_id,
                    AgentMessage::Text {
                        content: format!("Permission {permission_id} {verdict}."),
                    },
                )
                .await;
        }
        Ok(())
    }

    /// Make a task the active one. A backgrounded entry hands its
    /// cancellation handle back and restores is_running/phase only — message
    /// history is never replayed.
    pub async fn activate_task(&self, task_id: &str) -> Result<()> {
        self.background_active().await;

        if let Some(entry) = self.shared.registry.remove(task_id) {
            let stored_plan = self
                .shared
                .tasks
                .get_task(task_id)
                .ok()
                .flatten()
                .and_then(|t| t.plan);
            let phase = if entry.is_running {
                Phase::Executing
            } else {
                Phase::Idle
            };
            {
                let mut st = self.shared.state.write().await;
                st.task_id = Some(entry.task_id);
                st.prompt = entry.prompt;
                st.session_id = entry.session_id;
                st.cancel = Some(entry.cancel);
                st.is_running = entry.is_running;
                st.phase = phase;
                st.plan = stored_plan;
                st.pending_permission = None;
                st.pending_question = None;
            }
            self.shared.emit(UiEvent::PhaseChanged {
                task_id: task_id.to_string(),
                phase,
            });
            return Ok(());
        }

        let task = self
            .shared
            .tasks
            .get_task(task_id)?
            .ok_or_else(|| EngineError::NotFound(format!("task {task_id}")))?;
        {
            let mut st = self.shared.state.write().await;
            st.task_id = Some(task.id.clone());
            st.prompt = task.prompt;
            st.session_id = task.session_id;
            st.plan = task.plan;
            st.phase = Phase::Idle;
            st.is_running = false;
            st.cancel = None;
            st.pending_permission = None;
            st.pending_question = None;
        }
        self.shared.emit(UiEvent::PhaseChanged {
            task_id: task_id.to_string(),
            phase: Phase::Idle,
        });
        Ok(())
    }

    /// Hand the active task's in-flight stream to the background registry.
    /// Switching away is a hand-off, never a cancellation.
    async fn background_active(&self) {
        let mut st = self.shared.state.write().await;
        if !st.is_running {
            return;
        }
        let (Some(task_id), Some(cancel)) = (st.task_id.clone(), st.cancel.take()) else {
            return;
        };
        self.shared.registry.add(BackgroundTask {
            task_id,
            session_id: st.session_id.clone(),
            cancel,
            is_running: true,
            prompt: st.prompt.clone(),
        });
        st.is_running = false;
    }

    /// Rebuild the conversation so far: initial prompt plus every prior
    /// turn, with user images referenced by path.
    async fn build_conversation(&self, task_id: &str) -> (Vec<Value>, Vec<String>) {
        let messages = self.shared.messages.read().await;
        let mut conversation = Vec::new();
        let mut images = Vec::new();
        for message in messages.get(task_id).map(Vec::as_slice).unwrap_or(&[]) {
            match message {
                AgentMessage::User {
                    content,
                    attachments,
                } => {
                    conversation.push(json!({ "role": "user", "content": content }));
                    images.extend(attachments.iter().filter_map(|a| a.path.clone()));
                }
                AgentMessage::Text { content } | AgentMessage::DirectAnswer { content } => {
                    conversation.push(json!({ "role": "assistant", "content": content }));
                }
                AgentMessage::Result { message, .. } => {
                    conversation.push(json!({ "role": "assistant", "content": message }));
                }
                _ => {}
            }
        }
        (conversation, images)
    }

    fn attach_configs(&self, body: &mut Value) {
        if let Some(model) = self.shared.configs.model_config() {
            body["modelConfig"] = model;
        }
        if let Some(sandbox) = self.shared.configs.sandbox_config() {
            body["sandboxConfig"] = sandbox;
        }
        if let Some(skills) = self.shared.configs.skills_config() {
            body["skillsConfig"] = skills;
        }
        if let Some(mcp) = self.shared.configs.mcp_config() {
            body["mcpConfig"] = mcp;
        }
    }
}
