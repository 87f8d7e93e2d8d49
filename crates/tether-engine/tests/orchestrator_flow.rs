// End-to-end orchestrator flows against mock streaming servers.

use serde_json::json;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tether_engine::{AgentClient, FixedWorkDir, MemoryStore, StaticConfig, TaskOrchestrator};
use tether_types::{AgentMessage, Attachment, Phase, QuestionAnswer};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Server that answers each request with the scripted record lines for its
/// path, then closes the connection. Unknown paths get an empty stream.
async fn spawn_script_server(
    routes: Vec<(&'static str, Vec<serde_json::Value>)>,
) -> (String, Arc<AtomicUsize>) {
    spawn_script_server_with_hold(
        routes
            .into_iter()
            .map(|(path, lines)| (path, lines, false))
            .collect(),
    )
    .await
}

/// Like [`spawn_script_server`], but routes flagged with `hold` keep the
/// connection open after writing their lines.
async fn spawn_script_server_with_hold(
    routes: Vec<(&'static str, Vec<serde_json::Value>, bool)>,
) -> (String, Arc<AtomicUsize>) {
    let routes: HashMap<String, (Vec<serde_json::Value>, bool)> = routes
        .into_iter()
        .map(|(path, lines, hold)| (path.to_string(), (lines, hold)))
        .collect();
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local_addr");
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    tokio::spawn(async move {
        loop {
            let (mut socket, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => return,
            };
            counter.fetch_add(1, Ordering::SeqCst);
            let routes = routes.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 65536];
                let n = socket.read(&mut buf).await.unwrap_or(0);
                let request = String::from_utf8_lossy(&buf[..n]).to_string();
                let path = request
                    .lines()
                    .next()
                    .and_then(|l| l.split_whitespace().nth(1))
                    .unwrap_or("/")
                    .to_string();
                let (lines, hold) = routes
                    .get(&path)
                    .cloned()
                    .unwrap_or_else(|| (Vec::new(), false));
                let body: String = lines
                    .iter()
                    .map(|record| format!("data: {record}\n"))
                    .collect();
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nConnection: close\r\n\r\n{body}"
                );
                let _ = socket.write_all(response.as_bytes()).await;
                if hold {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                }
            });
        }
    });
    (format!("http://{}", addr), hits)
}

/// Server that writes the given records, then holds every connection open
/// without sending more, simulating a long-running agent stream.
async fn spawn_holding_server(lines: Vec<serde_json::Value>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local_addr");
    tokio::spawn(async move {
        loop {
            let (mut socket, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => return,
            };
            let lines = lines.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 65536];
                let _ = socket.read(&mut buf).await;
                let body: String = lines
                    .iter()
                    .map(|record| format!("data: {record}\n"))
                    .collect();
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nConnection: close\r\n\r\n{body}"
                );
                let _ = socket.write_all(response.as_bytes()).await;
                tokio::time::sleep(Duration::from_secs(60)).await;
            });
        }
    });
    format!("http://{}", addr)
}

fn orchestrator(base_url: &str) -> (TaskOrchestrator, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let orch = TaskOrchestrator::new(
        AgentClient::new(base_url),
        store.clone(),
        store.clone(),
        Arc::new(StaticConfig::default()),
        Arc::new(FixedWorkDir("/tmp/work".to_string())),
    );
    (orch, store)
}

async fn wait_for<F, Fut>(what: &str, mut cond: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if cond().await {
            return;
        }
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn png_attachment() -> Attachment {
    Attachment {
        path: None,
        media_type: Some("image/png".to_string()),
        data: Some("aGVsbG8=".to_string()),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn plan_approve_execute_round_trip() {
    let (base, hits) = spawn_script_server(vec![
        (
            "/agent/plan",
            vec![
                json!({"type": "session", "session_id": "sess_1"}),
                json!({"type": "plan", "plan": {
                    "id": "plan_1",
                    "goal": "add a feature",
                    "steps": [
                        {"id": "s1", "description": "read the code"},
                        {"id": "s2", "description": "write the change"}
                    ]
                }}),
                json!({"type": "done"}),
            ],
        ),
        (
            "/agent/execute",
            vec![
                json!({"type": "tool_use", "tool": "Edit", "tool_id": "t1"}),
                json!({"type": "tool_result", "tool_id": "t1", "output": "ok"}),
                json!({"type": "result", "message": "feature added", "cost_usd": 0.02, "duration_ms": 1500}),
                json!({"type": "done"}),
            ],
        ),
    ])
    .await;
    let (orch, store) = orchestrator(&base);

    let task_id = orch
        .run_agent("add a feature", None, Vec::new())
        .await
        .expect("run starts");

    wait_for("plan awaiting approval", || async {
        orch.snapshot().await.phase == Phase::AwaitingApproval
    })
    .await;
    let snapshot = orch.snapshot().await;
    assert_eq!(snapshot.session_id.as_deref(), Some("sess_1"));
    assert!(!snapshot.is_running);
    let plan = snapshot.plan.expect("plan installed");
    assert_eq!(plan.goal, "add a feature");
    assert_eq!(plan.steps.len(), 2);

    orch.approve_plan().await.expect("approval accepted");

    wait_for("execution back to idle", || async {
        let s = orch.snapshot().await;
        s.phase == Phase::Idle && !s.is_running
    })
    .await;

    let messages = orch.messages(&task_id).await;
    assert!(messages
        .iter()
        .any(|m| matches!(m, AgentMessage::ToolUse { tool, .. } if tool == "Edit")));
    assert!(messages.iter().any(|m| matches!(
        m,
        AgentMessage::Result { cost_usd: Some(c), .. } if (*c - 0.02).abs() < f64::EPSILON
    )));
    assert!(messages.iter().any(|m| matches!(m, AgentMessage::Done)));

    // No execution record left running.
    use tether_engine::ExecutionStore;
    assert_eq!(store.current_execution(&task_id).unwrap(), None);
    assert_eq!(hits.load(Ordering::SeqCst), 2);

    // The session id and plan reached the task store too.
    use tether_engine::TaskStore;
    let stored = store.get_task(&task_id).unwrap().unwrap();
    assert_eq!(stored.session_id.as_deref(), Some("sess_1"));
    let stored_plan = stored.plan.expect("plan persisted");
    assert_eq!(stored_plan.id, "plan_1");
}

#[tokio::test(flavor = "multi_thread")]
async fn approve_and_reject_outside_awaiting_approval_are_noops() {
    let (base, hits) = spawn_script_server(vec![]).await;
    let (orch, _) = orchestrator(&base);

    orch.approve_plan().await.expect("no-op");
    orch.reject_plan().await.expect("no-op");

    let snapshot = orch.snapshot().await;
    assert_eq!(snapshot.phase, Phase::Idle);
    assert!(!snapshot.is_running);
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn rejecting_a_plan_discards_it_without_network() {
    let (base, hits) = spawn_script_server(vec![(
        "/agent/plan",
        vec![
            json!({"type": "plan", "plan": {"goal": "g", "steps": [{"id": "s1", "description": "d"}]}}),
            json!({"type": "done"}),
        ],
    )])
    .await;
    let (orch, _) = orchestrator(&base);

    let task_id = orch.run_agent("do it", None, Vec::new()).await.unwrap();
    wait_for("awaiting approval", || async {
        orch.snapshot().await.phase == Phase::AwaitingApproval
    })
    .await;

    orch.reject_plan().await.expect("rejection accepted");

    let snapshot = orch.snapshot().await;
    assert_eq!(snapshot.phase, Phase::Idle);
    assert!(snapshot.plan.is_none());
    let messages = orch.messages(&task_id).await;
    assert!(messages
        .iter()
        .any(|m| matches!(m, AgentMessage::Text { content } if content.contains("rejected"))));
    // Only the planning request went out.
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn starting_a_second_task_backgrounds_the_first() {
    // Task A runs a direct (image) execution that never finishes; task B
    // plans normally on the same service.
    let base = spawn_holding_server(vec![
        json!({"type": "session", "session_id": "sess_a"}),
        json!({"type": "text", "content": "working"}),
    ])
    .await;
    let (orch, store) = orchestrator(&base);

    let a = orch
        .run_agent("describe this screenshot", None, vec![png_attachment()])
        .await
        .unwrap();
    wait_for("task A session", || async {
        orch.snapshot().await.session_id.as_deref() == Some("sess_a")
    })
    .await;

    let b = orch.run_agent("plan something", None, Vec::new()).await.unwrap();
    assert_ne!(a, b);

    // A moved to the registry with its stream intact.
    let entry = orch.registry().get(&a).expect("A backgrounded");
    assert!(entry.is_running);
    assert!(!entry.cancel.is_cancelled());
    assert_eq!(entry.session_id.as_deref(), Some("sess_a"));
    assert_eq!(orch.registry().running_count(), 1);

    let snapshot = orch.snapshot().await;
    assert_eq!(snapshot.task_id.as_deref(), Some(b.as_str()));

    // A's execution record is still open: nothing was cancelled.
    use tether_engine::ExecutionStore;
    assert!(store.current_execution(&a).unwrap().is_some());

    // Switching back restores the running state without replaying history.
    orch.activate_task(&a).await.expect("activation");
    let snapshot = orch.snapshot().await;
    assert_eq!(snapshot.task_id.as_deref(), Some(a.as_str()));
    assert_eq!(snapshot.phase, Phase::Executing);
    assert!(snapshot.is_running);
    assert!(orch.registry().get(&a).is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn ask_user_question_pauses_the_stream() {
    let base = spawn_holding_server(vec![
        json!({"type": "session", "session_id": "sess_q"}),
        json!({"type": "tool_use", "tool": "AskUserQuestion", "tool_id": "toolu_q1", "input": {
            "questions": [{
                "header": "Scope",
                "question": "Which modules should change?",
                "options": [{"label": "All"}, {"label": "Core only"}]
            }]
        }}),
        json!({"type": "text", "content": "should never be dispatched"}),
        json!({"type": "done"}),
    ])
    .await;
    let (orch, store) = orchestrator(&base);

    let task_id = orch
        .run_agent("migrate the code", None, vec![png_attachment()])
        .await
        .unwrap();

    wait_for("question pause", || async {
        orch.snapshot().await.pending_question.is_some()
    })
    .await;

    let snapshot = orch.snapshot().await;
    assert!(!snapshot.is_running);
    assert_eq!(snapshot.phase, Phase::Executing);
    let question = snapshot.pending_question.expect("question");
    assert_eq!(question.id, "toolu_q1");
    assert_eq!(question.questions[0].header, "Scope");

    // Nothing after the question was dispatched, and the execution unit was
    // closed so it cannot linger as running.
    let messages = orch.messages(&task_id).await;
    assert!(!messages.iter().any(|m| matches!(m, AgentMessage::Done)));
    assert!(!messages
        .iter()
        .any(|m| matches!(m, AgentMessage::Text { content } if content.contains("never"))));
    use tether_engine::ExecutionStore;
    assert_eq!(store.current_execution(&task_id).unwrap(), None);

    // Answering resumes the conversation with the formatted reply.
    orch.answer_question(vec![QuestionAnswer {
        header: "Scope".to_string(),
        answer: "All".to_string(),
    }])
    .await
    .expect("answer accepted");

    wait_for("answer turn appended", || async {
        orch.messages(&task_id).await.iter().any(|m| {
            matches!(m, AgentMessage::User { content, .. } if content == "Scope: All")
        })
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn answer_question_without_a_pending_question_fails() {
    let (base, _) = spawn_script_server(vec![]).await;
    let (orch, _) = orchestrator(&base);

    let err = orch
        .answer_question(vec![QuestionAnswer {
            header: "H".to_string(),
            answer: "A".to_string(),
        }])
        .await
        .expect_err("nothing pending");
    assert!(err.to_string().contains("no pending question"));
}

#[tokio::test(flavor = "multi_thread")]
async fn continue_conversation_is_rejected_while_running() {
    let base = spawn_holding_server(vec![
        json!({"type": "session", "session_id": "sess_r"}),
    ])
    .await;
    let (orch, _) = orchestrator(&base);

    orch.run_agent("look at this", None, vec![png_attachment()])
        .await
        .unwrap();
    wait_for("stream running", || async {
        orch.snapshot().await.session_id.is_some()
    })
    .await;

    let err = orch
        .continue_conversation("and also this", Vec::new())
        .await
        .expect_err("busy");
    assert!(err.to_string().contains("currently running"));
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_agent_without_a_session_clears_state() {
    // The server never assigns a session id.
    let base = spawn_holding_server(vec![
        json!({"type": "text", "content": "starting"}),
    ])
    .await;
    let (orch, store) = orchestrator(&base);

    let task_id = orch
        .run_agent("long job", None, vec![png_attachment()])
        .await
        .unwrap();
    wait_for("first output", || async {
        !orch.messages(&task_id).await.is_empty()
    })
    .await;

    orch.stop_agent().await.expect("stop accepted");

    let snapshot = orch.snapshot().await;
    assert_eq!(snapshot.phase, Phase::Idle);
    assert!(!snapshot.is_running);
    use tether_engine::ExecutionStore;
    assert_eq!(store.current_execution(&task_id).unwrap(), None);
}

#[tokio::test(flavor = "multi_thread")]
async fn http_error_status_fails_the_run() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local_addr");
    tokio::spawn(async move {
        loop {
            let (mut socket, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => return,
            };
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await;
            let response =
                "HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
            let _ = socket.write_all(response.as_bytes()).await;
        }
    });

    let (orch, _) = orchestrator(&format!("http://{}", addr));
    let task_id = orch.run_agent("plan it", None, Vec::new()).await.unwrap();

    wait_for("failure surfaces", || async {
        let s = orch.snapshot().await;
        s.phase == Phase::Idle && !s.is_running
    })
    .await;

    let messages = orch.messages(&task_id).await;
    assert!(messages
        .iter()
        .any(|m| matches!(m, AgentMessage::Error { message } if message.contains("503"))));
}

#[tokio::test(flavor = "multi_thread")]
async fn direct_answer_ends_planning_without_a_plan() {
    let (base, _) = spawn_script_server(vec![(
        "/agent/plan",
        vec![
            json!({"type": "direct_answer", "content": "2 + 2 = 4"}),
            json!({"type": "done"}),
        ],
    )])
    .await;
    let (orch, _) = orchestrator(&base);

    let task_id = orch.run_agent("what is 2+2", None, Vec::new()).await.unwrap();

    wait_for("direct answer", || async {
        let s = orch.snapshot().await;
        s.phase == Phase::Idle && !s.is_running
    })
    .await;

    let snapshot = orch.snapshot().await;
    assert!(snapshot.plan.is_none());
    let messages = orch.messages(&task_id).await;
    assert!(messages
        .iter()
        .any(|m| matches!(m, AgentMessage::Text { content } if content == "2 + 2 = 4")));
}

#[tokio::test(flavor = "multi_thread")]
async fn rerunning_the_active_running_task_is_rejected() {
    let base = spawn_holding_server(vec![
        json!({"type": "session", "session_id": "sess_busy"}),
    ])
    .await;
    let (orch, _) = orchestrator(&base);

    let task_id = orch
        .run_agent("look at this", None, vec![png_attachment()])
        .await
        .unwrap();
    wait_for("stream running", || async {
        orch.snapshot().await.session_id.is_some()
    })
    .await;

    let err = orch
        .run_agent("run it again", Some(&task_id), Vec::new())
        .await
        .expect_err("re-run of a running task must be rejected");
    assert!(err.to_string().contains("already running"));

    // The original run is untouched: still active, still running, and never
    // duplicated into the background registry.
    let snapshot = orch.snapshot().await;
    assert_eq!(snapshot.task_id.as_deref(), Some(task_id.as_str()));
    assert!(snapshot.is_running);
    assert!(orch.registry().is_empty());

    // The same holds once the task is backgrounded by a newer run.
    let other = orch.run_agent("something else", None, Vec::new()).await.unwrap();
    assert_ne!(other, task_id);
    assert!(orch.registry().get(&task_id).is_some_and(|e| e.is_running));

    let err = orch
        .run_agent("run it again", Some(&task_id), Vec::new())
        .await
        .expect_err("re-run of a backgrounded running task must be rejected");
    assert!(err.to_string().contains("already running"));
    assert!(orch.registry().get(&task_id).is_some_and(|e| e.is_running));
}

#[tokio::test(flavor = "multi_thread")]
async fn permission_request_round_trip() {
    let (base, hits) = spawn_script_server(vec![
        (
            "/agent",
            vec![
                json!({"type": "session", "session_id": "sess_perm"}),
                json!({"type": "permission_request", "permission": {
                    "id": "perm_1",
                    "tool": "Bash",
                    "description": "run ls in the project root"
                }}),
                json!({"type": "done"}),
            ],
        ),
        ("/agent/permission", vec![]),
    ])
    .await;
    let (orch, _) = orchestrator(&base);

    let task_id = orch
        .run_agent("list the files", None, vec![png_attachment()])
        .await
        .unwrap();

    wait_for("pending permission", || async {
        orch.snapshot().await.pending_permission.is_some()
    })
    .await;
    let permission = orch.snapshot().await.pending_permission.expect("pending");
    assert_eq!(permission.id, "perm_1");
    assert_eq!(permission.tool.as_deref(), Some("Bash"));
    let messages = orch.messages(&task_id).await;
    assert!(messages
        .iter()
        .any(|m| matches!(m, AgentMessage::PermissionRequest { permission } if permission.id == "perm_1")));

    orch.respond_to_permission("perm_1", true)
        .await
        .expect("decision posted");

    let snapshot = orch.snapshot().await;
    assert!(snapshot.pending_permission.is_none());
    let messages = orch.messages(&task_id).await;
    assert!(messages.iter().any(|m| {
        matches!(m, AgentMessage::Text { content } if content.contains("perm_1") && content.contains("approved"))
    }));
    // The stream request plus the permission decision.
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn respond_to_permission_without_a_session_is_a_logged_noop() {
    let (base, hits) = spawn_script_server(vec![]).await;
    let (orch, _) = orchestrator(&base);

    orch.respond_to_permission("perm_ghost", false)
        .await
        .expect("silent no-op");
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_answer_keeps_the_question_pending() {
    // The planning stream proposes a plan and then immediately asks a
    // question, so the pause lands while the task is awaiting approval.
    // Approving starts a held-open execution; answering during it must fail
    // without losing the question.
    let (base, _) = spawn_script_server_with_hold(vec![
        (
            "/agent/plan",
            vec![
                json!({"type": "plan", "plan": {
                    "id": "plan_q",
                    "goal": "refactor",
                    "steps": [{"id": "s1", "description": "survey"}]
                }}),
                json!({"type": "tool_use", "tool": "AskUserQuestion", "tool_id": "toolu_hold", "input": {
                    "questions": [{"header": "Depth", "question": "How far should the refactor go?"}]
                }}),
            ],
            false,
        ),
        (
            "/agent/execute",
            vec![json!({"type": "text", "content": "executing"})],
            true,
        ),
    ])
    .await;
    let (orch, _) = orchestrator(&base);

    orch.run_agent("refactor the module", None, Vec::new())
        .await
        .unwrap();
    wait_for("question pause", || async {
        orch.snapshot().await.pending_question.is_some()
    })
    .await;
    assert_eq!(orch.snapshot().await.phase, Phase::AwaitingApproval);

    orch.approve_plan().await.expect("approval accepted");
    assert!(orch.snapshot().await.is_running);

    let err = orch
        .answer_question(vec![QuestionAnswer {
            header: "Depth".to_string(),
            answer: "Everything".to_string(),
        }])
        .await
        .expect_err("cannot continue while running");
    assert!(err.to_string().contains("currently running"));

    // The question survives the failed attempt.
    let snapshot = orch.snapshot().await;
    let question = snapshot.pending_question.expect("question still pending");
    assert_eq!(question.id, "toolu_hold");
}
