//! Session controller
//!
//! Owns one conversation: launches a channel per turn, consumes its event
//! stream in order, routes permission requests through the arbiter, and runs
//! the stall timer. All session state sits behind one lock; network sends
//! happen after it is released.

use super::stall::StallDetector;
use super::state::{SessionState, StateChange, StateMachine, Transition};
use super::transcript::{Transcript, TranscriptEntry};
use crate::config::{RuntimeConfig, SessionConfig};
use crate::error::Result;
use crate::permission::{
    ConfirmationPolicy, PermissionArbiter, PermissionDecision, PermissionRequest,
    PermissionResult, Resolution,
};
use crate::transport::{ChannelTransport, EventStream};
use crate::types::{AgentEvent, ChannelId, ControlMessage, StreamEvent};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, Mutex};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;

/// Observable session activity
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged(StateChange),
    Transcript(TranscriptEntry),
    /// Registered with the arbiter and now visible to the UI
    PermissionRequested(PermissionRequest),
    PermissionAutoApproved {
        tool_use_id: String,
        tool_name: String,
    },
    PermissionResolved {
        id: String,
        allowed: bool,
    },
    StallRecovered {
        channel_id: ChannelId,
        idle_ms: u64,
    },
    Error {
        message: String,
    },
}

/// The live channel of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelInfo {
    pub id: ChannelId,
    pub created_at: DateTime<Utc>,
}

struct LiveChannel {
    info: ChannelInfo,
    /// Stops the stream consumer
    cancel: CancellationToken,
}

struct Core {
    machine: StateMachine,
    channel: Option<LiveChannel>,
    transcript: Transcript,
    stall: StallDetector,
    compacting: bool,
}

impl Core {
    fn live_id(&self) -> Option<ChannelId> {
        self.channel.as_ref().map(|c| c.info.id.clone())
    }

    fn is_live(&self, channel_id: &ChannelId) -> bool {
        self.channel
            .as_ref()
            .is_some_and(|c| &c.info.id == channel_id)
    }
}

type Outbound = Vec<(ChannelId, ControlMessage)>;

struct Inner {
    bus: Arc<ChannelTransport>,
    arbiter: Arc<PermissionArbiter>,
    config: SessionConfig,
    policy: ConfirmationPolicy,
    core: Mutex<Core>,
    /// Serializes launches so concurrent senders share one channel
    launch: Mutex<()>,
    events: broadcast::Sender<SessionEvent>,
    shutdown: CancellationToken,
}

impl Inner {
    fn publish(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn record(&self, entry: TranscriptEntry) {
        self.publish(SessionEvent::Transcript(entry));
    }

    fn transition(&self, core: &mut Core, transition: Transition) -> Result<StateChange> {
        let change = core.machine.apply(transition)?;
        tracing::debug!(
            from = %change.from,
            to = %change.to,
            transition = transition.label(),
            "Session state changed"
        );
        self.publish(SessionEvent::StateChanged(change));
        Ok(change)
    }

    /// Transition implied by the event flow; a mismatch is logged and skipped
    fn advance(&self, core: &mut Core, transition: Transition) {
        if let Err(e) = self.transition(core, transition) {
            tracing::debug!(error = %e, "Skipping transition");
        }
    }

    async fn dispatch(&self, channel_id: &ChannelId, message: ControlMessage) -> Result<()> {
        let payload = message.to_value()?;
        self.bus.notify(Some(channel_id.clone()), payload).await
    }

    async fn dispatch_all(&self, outbound: Outbound) {
        for (channel_id, message) in outbound {
            if let Err(e) = self.dispatch(&channel_id, message).await {
                tracing::warn!(channel_id = %channel_id, error = %e, "Failed to send control message");
            }
        }
    }

    /// Drop what still references a channel that is no longer live
    async fn release(&self, channel_id: &ChannelId) {
        self.arbiter.discard_channel(channel_id).await;
        self.bus.detach_stream(channel_id).await;
    }

    fn finish_turn(&self, core: &mut Core) -> Option<ChannelId> {
        let live = core.channel.take()?;
        live.cancel.cancel();
        core.compacting = false;
        self.advance(core, Transition::TurnCompleted);
        tracing::debug!(channel_id = %live.info.id, "Turn finished");
        Some(live.info.id)
    }

    async fn end_compaction(&self, core: &mut Core) {
        if !core.compacting {
            return;
        }
        core.compacting = false;
        self.advance(core, Transition::CompactionFinished);
        if let Some(channel_id) = core.live_id() {
            if !self.arbiter.requests_for(Some(&channel_id)).await.is_empty() {
                self.advance(core, Transition::PermissionRequested);
            }
        }
    }

    /// Apply one in-order event; returns true once the turn is over
    async fn apply_event(&self, channel_id: &ChannelId, event: StreamEvent) -> bool {
        let mut outbound: Outbound = Vec::new();
        let finished = {
            let mut core = self.core.lock().await;
            if !core.is_live(channel_id) {
                tracing::debug!(channel_id = %channel_id, seq = event.seq, "Dropping event for stale channel");
                return true;
            }
            core.stall.observe(Instant::now());

            let mut terminal = false;
            match event.event {
                AgentEvent::AssistantText { text } => {
                    self.end_compaction(&mut core).await;
                    let entry = core.transcript.push_assistant_text(&text);
                    self.record(entry);
                }
                AgentEvent::ToolUse {
                    tool_use_id,
                    tool_name,
                    input,
                } => {
                    self.end_compaction(&mut core).await;
                    if let Some(entry) =
                        core.transcript
                            .push_tool_use(&tool_use_id, &tool_name, &input)
                    {
                        self.record(entry);
                    }
                }
                AgentEvent::ToolResult(result) => {
                    self.end_compaction(&mut core).await;
                    if let Some(entry) = core.transcript.push_tool_result(&result) {
                        self.record(entry);
                    }
                }
                AgentEvent::PermissionRequest {
                    tool_use_id,
                    tool_name,
                    inputs,
                    suggestions,
                } => {
                    self.end_compaction(&mut core).await;
                    if let Some(entry) =
                        core.transcript
                            .push_tool_use(&tool_use_id, &tool_name, &inputs)
                    {
                        self.record(entry);
                    }

                    if self.policy.auto_approves(&tool_name) {
                        tracing::debug!(tool = %tool_name, tool_use_id = %tool_use_id, "Permission auto-approved");
                        outbound.push((
                            channel_id.clone(),
                            ControlMessage::PermissionResponse {
                                channel_id: channel_id.clone(),
                                tool_use_id: tool_use_id.clone(),
                                result: PermissionResult::Allow {
                                    updated_input: inputs,
                                    updated_permissions: Vec::new(),
                                },
                            },
                        ));
                        self.publish(SessionEvent::PermissionAutoApproved {
                            tool_use_id,
                            tool_name,
                        });
                    } else {
                        let request = PermissionRequest::new(
                            channel_id.clone(),
                            tool_use_id,
                            tool_name,
                            inputs,
                            suggestions,
                        );
                        // Registered before anyone can see it
                        let registration = self.arbiter.register(request.clone()).await;
                        self.advance(&mut core, Transition::PermissionRequested);
                        if registration.created {
                            self.publish(SessionEvent::PermissionRequested(request));
                        }
                    }
                }
                AgentEvent::Compacting => {
                    if !core.compacting {
                        core.compacting = true;
                        self.advance(&mut core, Transition::CompactionStarted);
                        let entry = core.transcript.push_system("Compacting conversation");
                        self.record(entry);
                        if self.config.continue_after_compaction {
                            let text = self.config.compaction_message.clone();
                            let entry = core.transcript.push_user(text.clone(), true);
                            self.record(entry);
                            outbound.push((
                                channel_id.clone(),
                                ControlMessage::UserMessage {
                                    channel_id: channel_id.clone(),
                                    text,
                                    synthetic: true,
                                },
                            ));
                        }
                    }
                }
                AgentEvent::Compacted => {
                    self.end_compaction(&mut core).await;
                    let entry = core.transcript.push_system("Conversation compacted");
                    self.record(entry);
                }
                AgentEvent::Result { is_error, summary } => {
                    if is_error || summary.is_some() {
                        let note =
                            summary.unwrap_or_else(|| "Turn ended with an error".to_string());
                        let entry = core.transcript.push_system(note);
                        self.record(entry);
                    }
                    terminal = true;
                }
                AgentEvent::Error { message } => {
                    tracing::warn!(channel_id = %channel_id, message = %message, "Backend reported error");
                    let entry = core.transcript.push_system(format!("Error: {}", message));
                    self.record(entry);
                    self.publish(SessionEvent::Error { message });
                }
            }

            if terminal || event.done {
                self.finish_turn(&mut core)
            } else {
                None
            }
        };

        self.dispatch_all(outbound).await;
        match finished {
            Some(channel_id) => {
                self.release(&channel_id).await;
                true
            }
            None => false,
        }
    }

    /// The stream ended without a terminal event
    async fn end_turn(&self, channel_id: &ChannelId) {
        let finished = {
            let mut core = self.core.lock().await;
            if !core.is_live(channel_id) {
                return;
            }
            self.finish_turn(&mut core)
        };
        if let Some(channel_id) = finished {
            self.release(&channel_id).await;
        }
    }

    async fn fail_channel(&self, channel_id: &ChannelId, reason: String) {
        {
            let mut core = self.core.lock().await;
            if !core.is_live(channel_id) {
                return;
            }
            if let Some(live) = core.channel.take() {
                live.cancel.cancel();
            }
            core.compacting = false;
            self.advance(&mut core, Transition::Fail);
            let entry = core.transcript.push_system(format!("Channel failed: {}", reason));
            self.record(entry);
        }
        tracing::warn!(channel_id = %channel_id, reason = %reason, "Channel failed");
        self.publish(SessionEvent::Error { message: reason });
        self.release(channel_id).await;
    }

    async fn consume(
        self: Arc<Self>,
        channel_id: ChannelId,
        mut stream: EventStream,
        cancel: CancellationToken,
    ) {
        loop {
            let item = tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.shutdown.cancelled() => break,
                item = stream.next() => item,
            };
            match item {
                Some(Ok(event)) => {
                    if self.apply_event(&channel_id, event).await {
                        break;
                    }
                }
                Some(Err(e)) => {
                    self.fail_channel(&channel_id, e.to_string()).await;
                    break;
                }
                None => {
                    self.end_turn(&channel_id).await;
                    break;
                }
            }
        }
        tracing::debug!(channel_id = %channel_id, "Stream consumer stopped");
    }

    /// Send the resolution to the backend and leave awaiting-permission once
    /// nothing of the channel is pending
    async fn deliver(&self, resolution: &Resolution) -> Result<()> {
        let request = &resolution.request;
        self.publish(SessionEvent::PermissionResolved {
            id: request.id.clone(),
            allowed: resolution.result.is_allow(),
        });

        // One response per tool use merged into the request
        let mut sent = Ok(());
        for tool_use_id in request.tool_use_ids() {
            let outcome = self
                .dispatch(
                    &request.channel_id,
                    ControlMessage::PermissionResponse {
                        channel_id: request.channel_id.clone(),
                        tool_use_id: tool_use_id.to_string(),
                        result: resolution.result.clone(),
                    },
                )
                .await;
            if sent.is_ok() {
                sent = outcome;
            }
        }

        let mut core = self.core.lock().await;
        if core.is_live(&request.channel_id)
            && core.machine.state() == SessionState::AwaitingPermission
            && self
                .arbiter
                .requests_for(Some(&request.channel_id))
                .await
                .is_empty()
        {
            self.advance(&mut core, Transition::PermissionsSettled);
        }
        sent
    }

    async fn on_tick(&self) {
        let mut outbound: Outbound = Vec::new();
        {
            let mut core = self.core.lock().await;
            let now = Instant::now();
            let waiting = core.channel.is_some() && core.machine.state().awaits_backend();
            if self.config.stall_recovery && core.stall.check(now, waiting) {
                if let Some(channel_id) = core.live_id() {
                    let idle_ms = core.stall.idle_for(now).as_millis() as u64;
                    tracing::info!(channel_id = %channel_id, idle_ms, "Turn stalled, sending continuation");
                    let text = self.config.continuation_message.clone();
                    let entry = core.transcript.push_user(text.clone(), true);
                    self.record(entry);
                    outbound.push((
                        channel_id.clone(),
                        ControlMessage::UserMessage {
                            channel_id: channel_id.clone(),
                            text,
                            synthetic: true,
                        },
                    ));
                    self.publish(SessionEvent::StallRecovered {
                        channel_id,
                        idle_ms,
                    });
                }
            }
        }
        self.dispatch_all(outbound).await;

        if let Some(timeout) = self.policy.timeout() {
            for resolution in self.arbiter.expire(timeout, self.policy.timeout_action).await {
                if let Err(e) = self.deliver(&resolution).await {
                    tracing::warn!(id = %resolution.request.id, error = %e, "Failed to send expired permission");
                }
            }
        }
    }
}

/// One conversation's lifecycle
///
/// Must be created inside a Tokio runtime: the stall timer starts
/// immediately and stops when the controller is dropped.
pub struct SessionController {
    inner: Arc<Inner>,
}

impl SessionController {
    pub fn new(
        bus: Arc<ChannelTransport>,
        arbiter: Arc<PermissionArbiter>,
        config: &RuntimeConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(1024);
        let inner = Arc::new(Inner {
            bus,
            arbiter,
            config: config.session.clone(),
            policy: config.confirmation.clone(),
            core: Mutex::new(Core {
                machine: StateMachine::new(),
                channel: None,
                transcript: Transcript::new(),
                stall: StallDetector::new(config.session.stall_threshold(), Instant::now()),
                compacting: false,
            }),
            launch: Mutex::new(()),
            events,
            shutdown: CancellationToken::new(),
        });
        Self::spawn_stall_timer(&inner);
        Self { inner }
    }

    fn spawn_stall_timer(inner: &Arc<Inner>) {
        let weak: Weak<Inner> = Arc::downgrade(inner);
        let shutdown = inner.shutdown.clone();
        let period = inner.config.stall_poll_interval();

        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.on_tick().await;
            }
            tracing::debug!("Stall timer stopped");
        });
    }

    /// Send user input, launching a fresh channel when none is live
    ///
    /// Returns the channel the message went to.
    pub async fn send(&self, text: impl Into<String>) -> Result<ChannelId> {
        let text = text.into();
        let inner = &self.inner;
        let _launch = inner.launch.lock().await;

        let live = {
            let mut core = inner.core.lock().await;
            match core.live_id() {
                Some(channel_id) => {
                    let entry = core.transcript.push_user(text.clone(), false);
                    inner.record(entry);
                    core.stall.observe(Instant::now());
                    Some(channel_id)
                }
                None => None,
            }
        };

        match live {
            Some(channel_id) => {
                inner
                    .dispatch(
                        &channel_id,
                        ControlMessage::UserMessage {
                            channel_id: channel_id.clone(),
                            text,
                            synthetic: false,
                        },
                    )
                    .await?;
                Ok(channel_id)
            }
            None => self.launch(text).await,
        }
    }

    async fn launch(&self, prompt: String) -> Result<ChannelId> {
        let inner = &self.inner;
        let channel_id = ChannelId::generate();
        let cancel = inner.shutdown.child_token();
        {
            let mut core = inner.core.lock().await;
            inner.transition(&mut core, Transition::Launch)?;
            core.channel = Some(LiveChannel {
                info: ChannelInfo {
                    id: channel_id.clone(),
                    created_at: Utc::now(),
                },
                cancel: cancel.clone(),
            });
            core.compacting = false;
            let entry = core.transcript.push_user(prompt.clone(), false);
            inner.record(entry);
        }
        tracing::info!(channel_id = %channel_id, "Launching channel");

        // Open before launching so no early event is missed
        let stream = match inner.bus.open_stream(channel_id.clone()).await {
            Ok(stream) => stream,
            Err(e) => {
                inner.fail_channel(&channel_id, e.to_string()).await;
                return Err(e);
            }
        };

        let launched = match (ControlMessage::Launch {
            channel_id: channel_id.clone(),
            prompt,
        })
        .to_value()
        {
            Ok(payload) => {
                inner
                    .bus
                    .call_with_timeout(
                        Some(channel_id.clone()),
                        payload,
                        inner.config.launch_timeout(),
                    )
                    .await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = launched {
            inner
                .fail_channel(&channel_id, format!("Launch failed: {}", e))
                .await;
            return Err(e);
        }

        {
            let mut core = inner.core.lock().await;
            if !core.is_live(&channel_id) {
                drop(core);
                tracing::debug!(channel_id = %channel_id, "Interrupted while launching");
                inner.bus.detach_stream(&channel_id).await;
                return Ok(channel_id);
            }
            inner.transition(&mut core, Transition::Launched)?;
            core.stall.observe(Instant::now());
        }

        tokio::spawn(inner.clone().consume(channel_id.clone(), stream, cancel));
        Ok(channel_id)
    }

    /// Stop the running turn
    ///
    /// Local state is cleared first; the backend is told afterwards and its
    /// acknowledgement is not awaited. Returns false when nothing was live.
    pub async fn interrupt(&self) -> bool {
        let inner = &self.inner;
        let channel_id = {
            let mut core = inner.core.lock().await;
            let Some(live) = core.channel.take() else {
                return false;
            };
            live.cancel.cancel();
            core.compacting = false;
            inner.advance(&mut core, Transition::Interrupt);
            let entry = core.transcript.push_system("Interrupted");
            inner.record(entry);
            live.info.id
        };
        tracing::info!(channel_id = %channel_id, "Session interrupted");

        inner.release(&channel_id).await;
        if let Err(e) = inner
            .dispatch(
                &channel_id,
                ControlMessage::Interrupt {
                    channel_id: channel_id.clone(),
                },
            )
            .await
        {
            tracing::debug!(channel_id = %channel_id, error = %e, "Interrupt not delivered");
        }
        true
    }

    /// Resolve a pending permission request and send the answer back
    ///
    /// A deny with `interrupt` also interrupts the turn.
    pub async fn resolve_permission(
        &self,
        id: &str,
        decision: PermissionDecision,
    ) -> Result<Resolution> {
        let resolution = self.inner.arbiter.resolve(id, decision).await?;
        self.inner.deliver(&resolution).await?;
        if let PermissionResult::Deny {
            interrupt: true, ..
        } = resolution.result
        {
            self.interrupt().await;
        }
        Ok(resolution)
    }

    /// Requests the UI should show
    ///
    /// Filtered to the live channel; all pending requests while none is live.
    pub async fn visible_permissions(&self) -> Vec<PermissionRequest> {
        let channel_id = self.inner.core.lock().await.live_id();
        self.inner.arbiter.requests_for(channel_id.as_ref()).await
    }

    pub async fn state(&self) -> SessionState {
        self.inner.core.lock().await.machine.state()
    }

    pub async fn is_busy(&self) -> bool {
        self.state().await.is_busy()
    }

    pub async fn is_compacting(&self) -> bool {
        self.inner.core.lock().await.compacting
    }

    pub async fn channel(&self) -> Option<ChannelInfo> {
        self.inner
            .core
            .lock()
            .await
            .channel
            .as_ref()
            .map(|c| c.info.clone())
    }

    pub async fn transcript(&self) -> Vec<TranscriptEntry> {
        self.inner.core.lock().await.transcript.entries().to_vec()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Session events as a stream; lagging receivers see `Err` items
    pub fn events(&self) -> BroadcastStream<SessionEvent> {
        BroadcastStream::new(self.subscribe())
    }

    pub fn arbiter(&self) -> &Arc<PermissionArbiter> {
        &self.inner.arbiter
    }

    /// Interrupt any live turn and stop background tasks
    pub async fn shutdown(&self) {
        self.interrupt().await;
        self.inner.shutdown.cancel();
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permission::ConfirmationPolicy;
    use crate::tools::ToolResult;
    use crate::transport::{MemoryTransport, Transport};
    use crate::types::{Envelope, ResponsePayload};
    use serde_json::{json, Value};
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Answers launch calls and records every request payload
    fn spawn_backend(
        remote: Arc<MemoryTransport>,
        accept_launch: bool,
    ) -> mpsc::UnboundedReceiver<Value> {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok(Some(envelope)) = remote.recv().await {
                if let Envelope::Request {
                    request_id,
                    payload,
                    ..
                } = envelope
                {
                    if payload["type"] == "launch" {
                        let reply = if accept_launch {
                            ResponsePayload::ok(json!({"ok": true}))
                        } else {
                            ResponsePayload::error("backend unavailable")
                        };
                        let _ = remote
                            .send(Envelope::Response {
                                request_id,
                                payload: reply,
                            })
                            .await;
                    }
                    let _ = tx.send(payload);
                }
            }
        });
        rx
    }

    struct Harness {
        session: SessionController,
        remote: Arc<MemoryTransport>,
        seen: mpsc::UnboundedReceiver<Value>,
    }

    fn harness_with(config: RuntimeConfig, accept_launch: bool) -> Harness {
        let (local, remote) = MemoryTransport::pair();
        let remote = Arc::new(remote);
        let bus = Arc::new(ChannelTransport::new(Arc::new(local)));
        let seen = spawn_backend(remote.clone(), accept_launch);
        let session = SessionController::new(bus, Arc::new(PermissionArbiter::new()), &config);
        Harness {
            session,
            remote,
            seen,
        }
    }

    fn harness() -> Harness {
        harness_with(RuntimeConfig::default(), true)
    }

    impl Harness {
        async fn emit(&self, channel_id: &ChannelId, seq: u64, event: AgentEvent, done: bool) {
            self.remote
                .send(Envelope::stream_event(channel_id.clone(), seq, event, done))
                .await
                .unwrap();
        }

        async fn next_payload(&mut self) -> Value {
            tokio::time::timeout(Duration::from_secs(5), self.seen.recv())
                .await
                .expect("no request reached the backend")
                .unwrap()
        }

        async fn wait_for(&self, state: SessionState) {
            let reached = tokio::time::timeout(Duration::from_secs(5), async {
                while self.session.state().await != state {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await;
            assert!(reached.is_ok(), "state {} not reached", state);
        }
    }

    fn text(s: &str) -> AgentEvent {
        AgentEvent::AssistantText {
            text: s.to_string(),
        }
    }

    fn result() -> AgentEvent {
        AgentEvent::Result {
            is_error: false,
            summary: None,
        }
    }

    fn permission(tool_use_id: &str, tool_name: &str) -> AgentEvent {
        AgentEvent::PermissionRequest {
            tool_use_id: tool_use_id.to_string(),
            tool_name: tool_name.to_string(),
            inputs: json!({"command": "rm -rf build"}),
            suggestions: vec![],
        }
    }

    // ========================================================================
    // Launch and streaming
    // ========================================================================

    #[tokio::test]
    async fn test_turn_round_trip() {
        let mut h = harness();
        let ch = h.session.send("hello").await.unwrap();
        assert_eq!(h.session.state().await, SessionState::Streaming);
        assert_eq!(h.session.channel().await.unwrap().id, ch);

        let launch = h.next_payload().await;
        assert_eq!(launch["type"], "launch");
        assert_eq!(launch["prompt"], "hello");
        assert_eq!(launch["channelId"], ch.as_str());

        h.emit(&ch, 0, text("Hi "), false).await;
        h.emit(&ch, 1, text("there"), false).await;
        h.emit(&ch, 2, result(), true).await;
        h.wait_for(SessionState::Idle).await;

        assert!(h.session.channel().await.is_none());
        let transcript = h.session.transcript().await;
        assert_eq!(
            transcript,
            vec![
                TranscriptEntry::User {
                    text: "hello".to_string(),
                    synthetic: false
                },
                TranscriptEntry::AssistantText {
                    text: "Hi there".to_string()
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_follow_up_uses_live_channel() {
        let mut h = harness();
        let ch = h.session.send("first").await.unwrap();
        let _ = h.next_payload().await;

        let again = h.session.send("second").await.unwrap();
        assert_eq!(again, ch);
        let msg = h.next_payload().await;
        assert_eq!(msg["type"], "user_message");
        assert_eq!(msg["text"], "second");
        assert_eq!(msg["synthetic"], false);
    }

    #[tokio::test]
    async fn test_concurrent_sends_share_launch() {
        let h = harness();
        let session = Arc::new(h.session);
        let a = tokio::spawn({
            let s = session.clone();
            async move { s.send("a").await.unwrap() }
        });
        let b = tokio::spawn({
            let s = session.clone();
            async move { s.send("b").await.unwrap() }
        });
        assert_eq!(a.await.unwrap(), b.await.unwrap());
    }

    #[tokio::test]
    async fn test_launch_rejected_enters_error() {
        let h = harness_with(RuntimeConfig::default(), false);
        let err = h.session.send("hello").await.unwrap_err();
        assert!(matches!(err, crate::error::RuntimeError::Remote(_)));
        assert_eq!(h.session.state().await, SessionState::Error);
        assert!(h.session.channel().await.is_none());
    }

    #[tokio::test]
    async fn test_stream_error_enters_error() {
        let mut h = harness();
        let mut events = h.session.subscribe();
        let ch = h.session.send("hello").await.unwrap();
        let _ = h.next_payload().await;

        h.remote
            .send(Envelope::Close {
                channel_id: ch.clone(),
                error: Some("backend crashed".to_string()),
            })
            .await
            .unwrap();
        h.wait_for(SessionState::Error).await;
        assert!(h.session.channel().await.is_none());

        let mut saw_error = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, SessionEvent::Error { ref message } if message.contains("backend crashed")) {
                saw_error = true;
            }
        }
        assert!(saw_error);
    }

    #[tokio::test]
    async fn test_duplicate_tool_result_applied_once() {
        let mut h = harness();
        let ch = h.session.send("go").await.unwrap();
        let _ = h.next_payload().await;

        let tool_result = ToolResult::success("t1", "read", json!({"content": "x"}));
        h.emit(&ch, 0, AgentEvent::ToolResult(tool_result.clone()), false).await;
        h.emit(&ch, 1, AgentEvent::ToolResult(tool_result), false).await;
        h.emit(&ch, 2, result(), true).await;
        h.wait_for(SessionState::Idle).await;

        let results = h
            .session
            .transcript()
            .await
            .into_iter()
            .filter(|e| matches!(e, TranscriptEntry::ToolResult { .. }))
            .count();
        assert_eq!(results, 1);
    }

    // ========================================================================
    // Permissions
    // ========================================================================

    #[tokio::test]
    async fn test_permission_round_trip() {
        let mut h = harness();
        let ch = h.session.send("clean up").await.unwrap();
        let _ = h.next_payload().await;

        h.emit(&ch, 0, permission("t1", "bash"), false).await;
        h.wait_for(SessionState::AwaitingPermission).await;

        let visible = h.session.visible_permissions().await;
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].tool_use_id, "t1");
        assert_eq!(visible[0].channel_id, ch);

        h.session
            .resolve_permission(&visible[0].id, PermissionDecision::accept())
            .await
            .unwrap();
        assert_eq!(h.session.state().await, SessionState::Streaming);

        let response = h.next_payload().await;
        assert_eq!(response["type"], "permission_response");
        assert_eq!(response["toolUseId"], "t1");
        assert_eq!(response["result"]["behavior"], "allow");
        assert_eq!(response["result"]["updatedInput"]["command"], "rm -rf build");

        // Exactly one resolution
        assert!(h
            .session
            .resolve_permission(&visible[0].id, PermissionDecision::accept())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_identical_requests_answer_every_tool_use() {
        let mut h = harness();
        let ch = h.session.send("clean up twice").await.unwrap();
        let _ = h.next_payload().await;

        h.emit(&ch, 0, permission("t1", "bash"), false).await;
        h.emit(&ch, 1, permission("t2", "bash"), false).await;

        let merged = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let visible = h.session.visible_permissions().await;
                if visible.len() == 1 && visible[0].merged_tool_use_ids == vec!["t2"] {
                    return visible;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("second tool use not merged");

        h.session
            .resolve_permission(&merged[0].id, PermissionDecision::accept())
            .await
            .unwrap();

        let mut answered = Vec::new();
        for _ in 0..2 {
            let response = h.next_payload().await;
            assert_eq!(response["type"], "permission_response");
            assert_eq!(response["result"]["behavior"], "allow");
            answered.push(response["toolUseId"].as_str().unwrap().to_string());
        }
        assert_eq!(answered, vec!["t1", "t2"]);
        assert_eq!(h.session.state().await, SessionState::Streaming);
    }

    #[tokio::test]
    async fn test_deny_with_interrupt_stops_turn() {
        let mut h = harness();
        let ch = h.session.send("go").await.unwrap();
        let _ = h.next_payload().await;
        h.emit(&ch, 0, permission("t1", "bash"), false).await;
        h.wait_for(SessionState::AwaitingPermission).await;

        let id = h.session.visible_permissions().await[0].id.clone();
        h.session
            .resolve_permission(
                &id,
                PermissionDecision::Deny {
                    message: "no".to_string(),
                    interrupt: true,
                },
            )
            .await
            .unwrap();

        assert_eq!(h.session.state().await, SessionState::Idle);
        let response = h.next_payload().await;
        assert_eq!(response["result"]["behavior"], "deny");
        assert_eq!(response["result"]["interrupt"], true);
        assert_eq!(h.next_payload().await["type"], "interrupt");
    }

    #[tokio::test]
    async fn test_policy_auto_approves_read_only() {
        let config = RuntimeConfig::default().with_confirmation_policy(ConfirmationPolicy::enabled());
        let mut h = harness_with(config, true);
        let ch = h.session.send("look").await.unwrap();
        let _ = h.next_payload().await;

        h.emit(&ch, 0, permission("t1", "grep"), false).await;
        let response = h.next_payload().await;
        assert_eq!(response["type"], "permission_response");
        assert_eq!(response["result"]["behavior"], "allow");

        assert_eq!(h.session.state().await, SessionState::Streaming);
        assert!(h.session.visible_permissions().await.is_empty());
    }

    #[tokio::test]
    async fn test_permission_timeout_rejects() {
        let mut config = RuntimeConfig::default().with_confirmation_policy(
            ConfirmationPolicy::default().with_timeout(20, crate::permission::TimeoutAction::Reject),
        );
        config.session.stall_poll_interval_ms = 10;
        let mut h = harness_with(config, true);
        let ch = h.session.send("go").await.unwrap();
        let _ = h.next_payload().await;

        h.emit(&ch, 0, permission("t1", "bash"), false).await;
        let response = h.next_payload().await;
        assert_eq!(response["result"]["behavior"], "deny");
        assert_eq!(response["result"]["message"], "Permission request timed out");
        h.wait_for(SessionState::Streaming).await;
    }

    // ========================================================================
    // Interrupt, compaction, stall
    // ========================================================================

    #[tokio::test]
    async fn test_interrupt_clears_and_relaunches() {
        let mut h = harness();
        let ch = h.session.send("go").await.unwrap();
        let _ = h.next_payload().await;
        h.emit(&ch, 0, permission("t1", "bash"), false).await;
        h.wait_for(SessionState::AwaitingPermission).await;

        assert!(h.session.interrupt().await);
        assert_eq!(h.session.state().await, SessionState::Idle);
        assert!(!h.session.is_busy().await);
        assert!(h.session.channel().await.is_none());
        assert_eq!(h.session.arbiter().pending_count().await, 0);
        assert_eq!(h.next_payload().await["type"], "interrupt");
        assert!(!h.session.interrupt().await);

        // Late events of the old channel change nothing
        h.emit(&ch, 1, text("late"), false).await;

        let fresh = h.session.send("again").await.unwrap();
        assert_ne!(fresh, ch);
        assert_eq!(h.next_payload().await["type"], "launch");
        assert!(!h
            .session
            .transcript()
            .await
            .iter()
            .any(|e| matches!(e, TranscriptEntry::AssistantText { text } if text == "late")));
    }

    #[tokio::test]
    async fn test_compaction_sends_continuation() {
        let mut h = harness();
        let ch = h.session.send("go").await.unwrap();
        let _ = h.next_payload().await;

        h.emit(&ch, 0, AgentEvent::Compacting, false).await;
        h.wait_for(SessionState::Compacting).await;
        assert!(h.session.is_compacting().await);

        let msg = h.next_payload().await;
        assert_eq!(msg["type"], "user_message");
        assert_eq!(msg["synthetic"], true);
        assert_eq!(msg["text"], SessionConfig::default().compaction_message);

        // Assistant activity clears the flag
        h.emit(&ch, 1, text("resuming"), false).await;
        h.wait_for(SessionState::Streaming).await;
        assert!(!h.session.is_compacting().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stall_sends_one_continuation() {
        let mut h = harness();
        let ch = h.session.send("go").await.unwrap();
        assert_eq!(h.next_payload().await["type"], "launch");

        tokio::time::sleep(Duration::from_secs(50)).await;
        let msg = h.next_payload().await;
        assert_eq!(msg["type"], "user_message");
        assert_eq!(msg["text"], "Continue.");
        assert_eq!(msg["synthetic"], true);
        assert_eq!(msg["channelId"], ch.as_str());

        // Same episode: nothing more
        tokio::time::sleep(Duration::from_secs(50)).await;
        assert!(tokio::time::timeout(Duration::from_millis(10), h.seen.recv())
            .await
            .is_err());

        // Activity starts a new episode
        h.emit(&ch, 0, text("working"), false).await;
        tokio::time::sleep(Duration::from_secs(40)).await;
        assert_eq!(h.next_payload().await["text"], "Continue.");
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_stall_while_idle() {
        let mut h = harness();
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(tokio::time::timeout(Duration::from_millis(10), h.seen.recv())
            .await
            .is_err());
        assert_eq!(h.session.state().await, SessionState::Idle);
    }
}
