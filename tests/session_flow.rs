//! Session integration tests
//!
//! Drives a `SessionController` against a scripted backend over a framed
//! in-memory duplex, so envelopes cross the same wire format a socket uses.
//! Covers launch, ordering, permissions, tool results, interrupt and
//! transport loss.

use a3s_agent_runtime::permission::PermissionDecision;
use a3s_agent_runtime::session::TranscriptEntry;
use a3s_agent_runtime::tools::ToolExecutor;
use a3s_agent_runtime::types::ResponsePayload;
use a3s_agent_runtime::{
    AgentEvent, ChannelId, ChannelTransport, Envelope, FramedTransport, PermissionArbiter,
    RuntimeConfig, RuntimeError, SessionController, SessionEvent, SessionState, Transport,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct Backend {
    wire: Arc<FramedTransport>,
    requests: mpsc::UnboundedReceiver<Value>,
}

impl Backend {
    async fn emit(&self, channel_id: &ChannelId, seq: u64, event: AgentEvent, done: bool) {
        self.wire
            .send(Envelope::stream_event(channel_id.clone(), seq, event, done))
            .await
            .unwrap();
    }

    async fn next_request(&mut self) -> Value {
        tokio::time::timeout(Duration::from_secs(5), self.requests.recv())
            .await
            .expect("backend saw no request")
            .expect("backend stopped")
    }
}

fn connect(config: &RuntimeConfig) -> (SessionController, Backend) {
    init_tracing();
    let (client_io, backend_io) = tokio::io::duplex(256 * 1024);
    let client = FramedTransport::from_stream(client_io);
    let wire = Arc::new(FramedTransport::from_stream(backend_io));

    let (tx, requests) = mpsc::unbounded_channel();
    let reader = wire.clone();
    tokio::spawn(async move {
        while let Ok(Some(envelope)) = reader.recv().await {
            if let Envelope::Request {
                request_id,
                payload,
                ..
            } = envelope
            {
                if payload["type"] == "launch" {
                    let _ = reader
                        .send(Envelope::Response {
                            request_id,
                            payload: ResponsePayload::ok(json!({"accepted": true})),
                        })
                        .await;
                }
                let _ = tx.send(payload);
            }
        }
    });

    let bus = Arc::new(ChannelTransport::new(Arc::new(client)));
    let session = SessionController::new(bus, Arc::new(PermissionArbiter::new()), config);
    (session, Backend { wire, requests })
}

async fn wait_for(session: &SessionController, state: SessionState) {
    let reached = tokio::time::timeout(Duration::from_secs(5), async {
        while session.state().await != state {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "session never reached {}", state);
}

fn text(s: &str) -> AgentEvent {
    AgentEvent::AssistantText {
        text: s.to_string(),
    }
}

fn done() -> AgentEvent {
    AgentEvent::Result {
        is_error: false,
        summary: None,
    }
}

// ─── Launch & Ordering ──────────────────────────────────────────

#[tokio::test]
async fn test_out_of_order_events_applied_in_seq_order() {
    let (session, mut backend) = connect(&RuntimeConfig::default());
    let ch = session.send("count").await.unwrap();
    assert_eq!(backend.next_request().await["type"], "launch");

    backend.emit(&ch, 2, text("C"), false).await;
    backend.emit(&ch, 0, text("A"), false).await;
    backend.emit(&ch, 3, done(), true).await;
    backend.emit(&ch, 1, text("B"), false).await;
    backend.emit(&ch, 1, text("B"), false).await;

    wait_for(&session, SessionState::Idle).await;
    let transcript = session.transcript().await;
    assert_eq!(
        transcript.last(),
        Some(&TranscriptEntry::AssistantText {
            text: "ABC".to_string()
        })
    );
}

#[tokio::test]
async fn test_state_changes_are_published() {
    let (session, mut backend) = connect(&RuntimeConfig::default());
    let mut events = session.subscribe();

    let ch = session.send("hi").await.unwrap();
    let _ = backend.next_request().await;
    backend.emit(&ch, 0, done(), true).await;
    wait_for(&session, SessionState::Idle).await;

    let mut states = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let SessionEvent::StateChanged(change) = event {
            states.push(change.to);
        }
    }
    assert_eq!(
        states,
        vec![
            SessionState::Launching,
            SessionState::Streaming,
            SessionState::Idle
        ]
    );
}

// ─── Permissions & Tools ────────────────────────────────────────

#[cfg(unix)]
#[tokio::test]
async fn test_permission_then_tool_result() {
    let dir = tempfile::tempdir().unwrap();
    let tools = ToolExecutor::new(dir.path(), &RuntimeConfig::default());
    let (session, mut backend) = connect(&RuntimeConfig::default());

    let ch = session.send("make a file").await.unwrap();
    let _ = backend.next_request().await;

    let inputs = json!({"command": "echo hi > out.txt && cat out.txt"});
    backend
        .emit(
            &ch,
            0,
            AgentEvent::PermissionRequest {
                tool_use_id: "toolu_1".to_string(),
                tool_name: "bash".to_string(),
                inputs: inputs.clone(),
                suggestions: vec![],
            },
            false,
        )
        .await;
    wait_for(&session, SessionState::AwaitingPermission).await;

    let pending = session.visible_permissions().await;
    assert_eq!(pending.len(), 1);
    session
        .resolve_permission(&pending[0].id, PermissionDecision::accept())
        .await
        .unwrap();

    let answer = backend.next_request().await;
    assert_eq!(answer["type"], "permission_response");
    assert_eq!(answer["result"]["behavior"], "allow");

    // Approved: run the tool and stream its result back
    let result = tools
        .execute("toolu_1", "bash", &answer["result"]["updatedInput"])
        .await;
    assert!(!result.is_error);
    assert_eq!(result.output["stdout"], "hi\n");

    backend.emit(&ch, 1, AgentEvent::ToolResult(result.clone()), false).await;
    backend.emit(&ch, 2, AgentEvent::ToolResult(result), false).await;
    backend.emit(&ch, 3, done(), true).await;
    wait_for(&session, SessionState::Idle).await;

    let results: Vec<_> = session
        .transcript()
        .await
        .into_iter()
        .filter(|e| matches!(e, TranscriptEntry::ToolResult { .. }))
        .collect();
    assert_eq!(results.len(), 1);
}

#[tokio::test]
async fn test_requests_visible_unfiltered_without_live_channel() {
    let (session, _backend) = connect(&RuntimeConfig::default());
    let arbiter = session.arbiter().clone();

    arbiter
        .register(a3s_agent_runtime::PermissionRequest::new(
            ChannelId::from("ch-early"),
            "toolu_9",
            "write",
            json!({"path": "a.txt"}),
            vec![],
        ))
        .await;

    assert_eq!(session.visible_permissions().await.len(), 1);
}

// ─── Interrupt & Failure ────────────────────────────────────────

#[tokio::test]
async fn test_interrupt_orphans_old_channel() {
    let (session, mut backend) = connect(&RuntimeConfig::default());
    let first = session.send("long task").await.unwrap();
    let _ = backend.next_request().await;

    backend
        .emit(
            &first,
            0,
            AgentEvent::PermissionRequest {
                tool_use_id: "toolu_1".to_string(),
                tool_name: "edit".to_string(),
                inputs: json!({"path": "a.rs"}),
                suggestions: vec![],
            },
            false,
        )
        .await;
    wait_for(&session, SessionState::AwaitingPermission).await;

    assert!(session.interrupt().await);
    assert_eq!(session.state().await, SessionState::Idle);
    assert!(session.visible_permissions().await.is_empty());
    assert_eq!(backend.next_request().await["type"], "interrupt");

    let second = session.send("new task").await.unwrap();
    assert_ne!(first, second);
    assert_eq!(backend.next_request().await["channelId"], second.as_str());

    // A late event on the old channel is ignored
    backend.emit(&first, 1, text("stale"), true).await;
    backend.emit(&second, 0, text("fresh"), false).await;
    backend.emit(&second, 1, done(), true).await;
    wait_for(&session, SessionState::Idle).await;

    let texts: Vec<String> = session
        .transcript()
        .await
        .into_iter()
        .filter_map(|e| match e {
            TranscriptEntry::AssistantText { text } => Some(text),
            _ => None,
        })
        .collect();
    assert_eq!(texts, vec!["fresh".to_string()]);
}

#[tokio::test]
async fn test_transport_loss_moves_to_error() {
    let (session, mut backend) = connect(&RuntimeConfig::default());
    let _ch = session.send("hi").await.unwrap();
    let _ = backend.next_request().await;

    backend.wire.close().await.unwrap();
    wait_for(&session, SessionState::Error).await;
    assert!(session.channel().await.is_none());

    let err = session.send("again").await.unwrap_err();
    assert!(matches!(err, RuntimeError::TransportClosed));
    assert_eq!(session.state().await, SessionState::Error);
}
