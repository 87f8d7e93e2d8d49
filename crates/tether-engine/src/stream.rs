// Stream Processor
// Consumes the line-delimited event stream of an agent run and routes each
// record to engine state. Records are JSON objects behind a "data:" prefix;
// anything else on the wire is ignored.

use crate::normalize::normalize_record;
use crate::orchestrator::EngineShared;
use crate::progress::PlanProgressEstimator;
use futures::StreamExt;
use serde_json::Value;
use std::sync::Arc;
use tether_types::{AgentMessage, PermissionRequest, QuestionInfo, QuestionRequest, TaskPlan};
use tokio_util::sync::CancellationToken;

/// Tool name that pauses the stream for user input instead of running.
pub const QUESTION_TOOL: &str = "AskUserQuestion";

/// Whether a stream was started for plan synthesis or for execution.
/// Planning streams carry no execution record and no progress estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamKind {
    Planning,
    Execution,
}

/// Per-stream mutable context. The progress estimator lives here so two
/// concurrent streams never share counters.
pub(crate) struct StreamContext {
    pub task_id: String,
    pub kind: StreamKind,
    pub cancel: CancellationToken,
    pub progress: PlanProgressEstimator,
}

enum Dispatch {
    Continue,
    Done,
    /// The stream pauses for a user question; the token has to be cancelled
    /// and no terminal bookkeeping run.
    QuestionPause,
}

pub(crate) struct StreamProcessor {
    shared: Arc<EngineShared>,
}

impl StreamProcessor {
    pub(crate) fn new(shared: Arc<EngineShared>) -> Self {
        Self { shared }
    }

    /// Drive a streamed response to completion.
    ///
    /// Bytes are buffered until a newline; a record split across chunk
    /// boundaries is reassembled before parsing. Terminal bookkeeping runs
    /// exactly once, on done, stream end, or stream error. Cancellation exits
    /// without bookkeeping: whoever cancelled already did it.
    pub(crate) async fn consume(self, mut ctx: StreamContext, response: reqwest::Response) {
        let mut stream = response.bytes_stream();
        // Raw bytes, decoded per complete line: a multibyte character split
        // across chunk boundaries must not be mangled.
        let mut buffer: Vec<u8> = Vec::new();

        loop {
            let chunk = tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    tracing::debug!("Stream for task {} cancelled", ctx.task_id);
                    return;
                }
                chunk = stream.next() => chunk,
            };
            match chunk {
                None => break,
                Some(Err(e)) => {
                    if ctx.cancel.is_cancelled() {
                        // Aborted connections surface as transport errors.
                        return;
                    }
                    self.shared
                        .fail_stream(&ctx.task_id, format!("Stream error: {e}"))
                        .await;
                    return;
                }
                Some(Ok(bytes)) => {
                    buffer.extend_from_slice(&bytes);
                    while let Some(line) = take_line(&mut buffer) {
                        match self.handle_line(&mut ctx, &line).await {
                            Dispatch::Continue => {}
                            Dispatch::Done => {
                                self.shared.finish_stream(&ctx.task_id, None).await;
                                return;
                            }
                            Dispatch::QuestionPause => {
                                ctx.cancel.cancel();
                                return;
                            }
                        }
                    }
                }
            }
        }

        // A final record may arrive without a trailing newline.
        let trailing = String::from_utf8_lossy(&std::mem::take(&mut buffer)).to_string();
        if !trailing.trim().is_empty() {
            match self.handle_line(&mut ctx, trailing.trim()).await {
                Dispatch::QuestionPause => {
                    ctx.cancel.cancel();
                    return;
                }
                Dispatch::Continue | Dispatch::Done => {}
            }
        }
        self.shared.finish_stream(&ctx.task_id, None).await;
    }

    async fn handle_line(&self, ctx: &mut StreamContext, line: &str) -> Dispatch {
        match parse_data_line(line) {
            Some(record) => self.dispatch(ctx, record).await,
            None => Dispatch::Continue,
        }
    }

    /// Route one record. A record missing a required field for its kind is
    /// dropped; unknown kinds are ignored so the wire vocabulary can grow.
    async fn dispatch(&self, ctx: &mut StreamContext, mut record: Value) -> Dispatch {
        normalize_record(&mut record);
        let Some(kind) = record.get("type").and_then(Value::as_str).map(str::to_owned) else {
            return Dispatch::Continue;
        };
        let task_id = ctx.task_id.clone();

        match kind.as_str() {
            "session" => {
                let Some(session_id) = record.get("session_id").and_then(Value::as_str) else {
                    return Dispatch::Continue;
                };
                let session_id = session_id.to_string();
                self.shared
                    .append_message(
                        &task_id,
                        AgentMessage::Session {
                            session_id: session_id.clone(),
                        },
                    )
                    .await;
                self.shared.capture_session(&task_id, session_id).await;
            }
            "text" => {
                let Some(content) = record.get("content").and_then(Value::as_str) else {
                    return Dispatch::Continue;
                };
                self.shared
                    .append_message(
                        &task_id,
                        AgentMessage::Text {
                            content: content.to_string(),
                        },
                    )
                    .await;
            }
            "tool_use" => {
                let Some(tool) = record.get("tool").and_then(Value::as_str) else {
                    return Dispatch::Continue;
                };
                let tool = tool.to_string();
                let tool_id = record
                    .get("tool_id")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                let input = record.get("input").cloned().filter(|v| !v.is_null());

                if tool == QUESTION_TOOL {
                    if let Some(question) = parse_question(tool_id.as_deref(), input.as_ref()) {
                        self.shared
                            .append_message(
                                &task_id,
                                AgentMessage::ToolUse {
                                    tool,
                                    tool_id,
                                    input,
                                },
                            )
                            .await;
                        self.shared.pause_for_question(&task_id, question).await;
                        return Dispatch::QuestionPause;
                    }
                    // No parseable questions: fall through as an ordinary
                    // tool call rather than pausing on nothing.
                }

                self.shared
                    .append_message(
                        &task_id,
                        AgentMessage::ToolUse {
                            tool,
                            tool_id,
                            input,
                        },
                    )
                    .await;
                if ctx.kind == StreamKind::Execution {
                    ctx.progress.record_tool_use();
                    self.shared.apply_progress(&task_id, &ctx.progress).await;
                }
            }
            "tool_result" => {
                let output = record
                    .get("output")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let tool_id = record
                    .get("tool_id")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                self.shared
                    .append_message(&task_id, AgentMessage::ToolResult { tool_id, output })
                    .await;
                if ctx.kind == StreamKind::Execution {
                    ctx.progress.record_tool_result();
                    self.shared.apply_progress(&task_id, &ctx.progress).await;
                }
            }
            "result" => {
                let Some(message) = record.get("message").and_then(Value::as_str) else {
                    return Dispatch::Continue;
                };
                let cost_usd = record.get("cost_usd").and_then(Value::as_f64);
                let duration_ms = record.get("duration_ms").and_then(Value::as_u64);
                self.shared
                    .append_message(
                        &task_id,
                        AgentMessage::Result {
                            message: message.to_string(),
                            cost_usd,
                            duration_ms,
                        },
                    )
                    .await;
                // Cost accounting happens whichever task is active.
                self.shared
                    .complete_execution(&task_id, cost_usd, duration_ms)
                    .await;
            }
            "error" => {
                let Some(message) = record.get("message").and_then(Value::as_str) else {
                    return Dispatch::Continue;
                };
                self.shared
                    .append_message(
                        &task_id,
                        AgentMessage::Error {
                            message: message.to_string(),
                        },
                    )
                    .await;
            }
            "done" => {
                self.shared.append_message(&task_id, AgentMessage::Done).await;
                return Dispatch::Done;
            }
            "plan" => {
                let Some(plan) = record
                    .get("plan")
                    .and_then(|v| serde_json::from_value::<TaskPlan>(v.clone()).ok())
                else {
                    tracing::warn!("Dropping unparseable plan record for task {}", task_id);
                    return Dispatch::Continue;
                };
                self.shared.install_plan(&task_id, plan).await;
            }
            "direct_answer" => {
                let Some(content) = record.get("content").and_then(Value::as_str) else {
                    return Dispatch::Continue;
                };
                self.shared
                    .direct_answer_received(&task_id, content.to_string())
                    .await;
            }
            "permission_request" => {
                let Some(permission) = record
                    .get("permission")
                    .and_then(|v| serde_json::from_value::<PermissionRequest>(v.clone()).ok())
                else {
                    return Dispatch::Continue;
                };
                self.shared
                    .set_pending_permission(&task_id, permission)
                    .await;
            }
            other => {
                tracing::debug!("Ignoring unknown record kind: {}", other);
            }
        }
        Dispatch::Continue
    }
}

/// Pop one complete line off the byte buffer, stripping the terminator.
/// Returns `None` while the buffer holds only a partial line. Decoding
/// happens here, after the line is complete, so chunk boundaries cannot
/// fall inside a UTF-8 sequence at decode time.
fn take_line(buffer: &mut Vec<u8>) -> Option<String> {
    let idx = buffer.iter().position(|&b| b == b'\n')?;
    let line: Vec<u8> = buffer.drain(..=idx).collect();
    let line = String::from_utf8_lossy(&line);
    Some(line.trim_end_matches(['\n', '\r']).to_string())
}

/// Extract the JSON record from a `data:`-prefixed line. Lines without the
/// prefix, empty payloads, and malformed JSON all yield `None`.
fn parse_data_line(line: &str) -> Option<Value> {
    let payload = line.strip_prefix("data:")?.trim();
    if payload.is_empty() {
        return None;
    }
    match serde_json::from_str(payload) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::debug!("Skipping malformed record: {}", e);
            None
        }
    }
}

/// Build a question request from an AskUserQuestion invocation. Returns
/// `None` when the input carries no parseable questions.
fn parse_question(tool_id: Option<&str>, input: Option<&Value>) -> Option<QuestionRequest> {
    let questions: Vec<QuestionInfo> =
        serde_json::from_value(input?.get("questions")?.clone()).ok()?;
    if questions.is_empty() {
        return None;
    }
    let id = tool_id
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    Some(QuestionRequest { id, questions })
}

// ============================================================================
// Tests
// ============================================================================
