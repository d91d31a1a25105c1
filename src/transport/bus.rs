//! Multiplexed request/response and stream bus over a [`Transport`]
//!
//! One reader task owns the inbound side of the transport and routes every
//! envelope:
//! - `response` → the waiter registered under its request id (exactly once)
//! - `cancel` → rejects the matching local waiter, or is surfaced to handlers
//! - `stream-event` / `close` → the open stream of that channel
//! - `request` → the registered message handlers
//!
//! When the transport goes away every pending call rejects with
//! [`RuntimeError::TransportClosed`] and every open stream ends with an error.

use super::Transport;
use crate::error::{Result, RuntimeError};
use crate::types::{ChannelId, Envelope, RequestId, ResponsePayload, StreamEvent};
use futures::Stream;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Inbound traffic that is not a reply to one of our calls
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// The peer calls us; answer with [`ChannelTransport::respond`]
    Request {
        request_id: RequestId,
        channel_id: Option<ChannelId>,
        payload: serde_json::Value,
    },
    /// The peer abandoned one of its requests
    Cancel { request_id: RequestId },
}

/// Handlers run on the reader task and must not block
pub type MessageHandler = Arc<dyn Fn(InboundMessage) + Send + Sync>;

enum StreamItem {
    Event(StreamEvent),
    Closed(Option<String>),
}

struct Shared {
    transport: Arc<dyn Transport>,
    next_id: AtomicU64,
    pending: Mutex<HashMap<RequestId, oneshot::Sender<Result<serde_json::Value>>>>,
    streams: Mutex<HashMap<ChannelId, mpsc::UnboundedSender<StreamItem>>>,
    handlers: RwLock<Vec<MessageHandler>>,
    shutdown: CancellationToken,
}

impl Shared {
    async fn dispatch(&self, envelope: Envelope) {
        match envelope {
            Envelope::Response {
                request_id,
                payload,
            } => {
                let waiter = self.pending.lock().await.remove(&request_id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(payload.into_result());
                    }
                    None => {
                        tracing::debug!(request_id, "Dropping response for unknown request");
                    }
                }
            }
            Envelope::Cancel { target_request_id } => {
                let waiter = self.pending.lock().await.remove(&target_request_id);
                match waiter {
                    Some(tx) => {
                        tracing::debug!(request_id = target_request_id, "Call cancelled by peer");
                        let _ = tx.send(Err(RuntimeError::Cancelled {
                            request_id: target_request_id,
                        }));
                    }
                    None => {
                        self.notify_handlers(InboundMessage::Cancel {
                            request_id: target_request_id,
                        })
                        .await;
                    }
                }
            }
            Envelope::StreamEvent {
                channel_id,
                seq,
                event,
                done,
            } => {
                let mut streams = self.streams.lock().await;
                let Some(tx) = streams.get(&channel_id) else {
                    tracing::debug!(channel_id = %channel_id, seq, "Discarding event for channel without stream");
                    return;
                };
                let item = StreamItem::Event(StreamEvent {
                    channel_id: channel_id.clone(),
                    seq,
                    event,
                    done,
                });
                if tx.send(item).is_err() {
                    // Consumer dropped its stream
                    streams.remove(&channel_id);
                }
            }
            Envelope::Close { channel_id, error } => {
                let tx = self.streams.lock().await.remove(&channel_id);
                match tx {
                    Some(tx) => {
                        tracing::debug!(channel_id = %channel_id, error = ?error, "Channel closed by peer");
                        let _ = tx.send(StreamItem::Closed(error));
                    }
                    None => {
                        tracing::debug!(channel_id = %channel_id, "Close for channel without stream");
                    }
                }
            }
            Envelope::Request {
                request_id,
                channel_id,
                payload,
            } => {
                let handled = self
                    .notify_handlers(InboundMessage::Request {
                        request_id,
                        channel_id,
                        payload,
                    })
                    .await;
                if !handled {
                    tracing::debug!(request_id, "No handler for inbound request");
                    let _ = self
                        .transport
                        .send(Envelope::Response {
                            request_id,
                            payload: ResponsePayload::error("No handler for request"),
                        })
                        .await;
                }
            }
        }
    }

    async fn notify_handlers(&self, message: InboundMessage) -> bool {
        let handlers = self.handlers.read().await;
        for handler in handlers.iter() {
            handler(message.clone());
        }
        !handlers.is_empty()
    }

    /// Reject everything outstanding; called once the transport is gone
    async fn fail_all(&self, reason: &str) {
        let pending: Vec<_> = self.pending.lock().await.drain().collect();
        if !pending.is_empty() {
            tracing::debug!(count = pending.len(), "Rejecting pending calls");
        }
        for (_, tx) in pending {
            let _ = tx.send(Err(RuntimeError::TransportClosed));
        }

        let streams: Vec<_> = self.streams.lock().await.drain().collect();
        for (_, tx) in streams {
            let _ = tx.send(StreamItem::Closed(Some(reason.to_string())));
        }
    }
}

/// A call whose response has not arrived yet
#[derive(Debug)]
pub struct PendingCall {
    request_id: RequestId,
    rx: oneshot::Receiver<Result<serde_json::Value>>,
}

impl PendingCall {
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Wait for the response
    pub async fn wait(self) -> Result<serde_json::Value> {
        match self.rx.await {
            Ok(result) => result,
            // Waiter removed without an answer: local cancel
            Err(_) => Err(RuntimeError::Cancelled {
                request_id: self.request_id,
            }),
        }
    }
}

/// Multiplexes calls and per-channel event streams over one transport
pub struct ChannelTransport {
    shared: Arc<Shared>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl ChannelTransport {
    /// Wrap a transport and start the reader task
    ///
    /// Must be called inside a Tokio runtime.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        let shared = Arc::new(Shared {
            transport,
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            streams: Mutex::new(HashMap::new()),
            handlers: RwLock::new(Vec::new()),
            shutdown: CancellationToken::new(),
        });

        let reader = tokio::spawn(Self::read_loop(shared.clone()));
        Self {
            shared,
            reader: Mutex::new(Some(reader)),
        }
    }

    async fn read_loop(shared: Arc<Shared>) {
        loop {
            let next = tokio::select! {
                _ = shared.shutdown.cancelled() => break,
                next = shared.transport.recv() => next,
            };
            match next {
                Ok(Some(envelope)) => {
                    tracing::trace!(kind = envelope.kind(), "Inbound envelope");
                    shared.dispatch(envelope).await;
                }
                Ok(None) => {
                    tracing::debug!("Transport closed by peer");
                    break;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Transport receive failed");
                    break;
                }
            }
        }
        shared.shutdown.cancel();
        shared.fail_all("Transport closed").await;
    }

    /// Whether the bus can still send
    pub fn is_closed(&self) -> bool {
        self.shared.shutdown.is_cancelled() || !self.shared.transport.is_connected()
    }

    /// Send a raw envelope
    pub async fn send(&self, envelope: Envelope) -> Result<()> {
        if self.is_closed() {
            return Err(RuntimeError::TransportClosed);
        }
        self.shared.transport.send(envelope).await
    }

    /// Register a handler for inbound requests and unmatched cancels
    pub async fn on_message<F>(&self, handler: F)
    where
        F: Fn(InboundMessage) + Send + Sync + 'static,
    {
        self.shared.handlers.write().await.push(Arc::new(handler));
    }

    /// Send a request and return a handle to await (or cancel) its response
    pub async fn start_call(
        &self,
        channel_id: Option<ChannelId>,
        payload: serde_json::Value,
    ) -> Result<PendingCall> {
        if self.is_closed() {
            return Err(RuntimeError::TransportClosed);
        }
        let request_id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.shared.pending.lock().await;
            if pending.contains_key(&request_id) {
                return Err(RuntimeError::DuplicateRequest(request_id));
            }
            pending.insert(request_id, tx);
        }

        let envelope = Envelope::Request {
            request_id,
            channel_id,
            payload,
        };
        if let Err(e) = self.shared.transport.send(envelope).await {
            self.shared.pending.lock().await.remove(&request_id);
            return Err(e);
        }
        tracing::trace!(request_id, "Call started");
        Ok(PendingCall { request_id, rx })
    }

    /// Send a request and wait for its response
    pub async fn call(
        &self,
        channel_id: Option<ChannelId>,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value> {
        self.start_call(channel_id, payload).await?.wait().await
    }

    /// [`call`](Self::call) with a deadline; on expiry the call is cancelled
    pub async fn call_with_timeout(
        &self,
        channel_id: Option<ChannelId>,
        payload: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value> {
        let call = self.start_call(channel_id, payload).await?;
        let request_id = call.request_id();
        match tokio::time::timeout(timeout, call.wait()).await {
            Ok(result) => result,
            Err(_) => {
                self.cancel(request_id).await;
                Err(RuntimeError::Transport(format!(
                    "Request {} timed out after {}ms",
                    request_id,
                    timeout.as_millis()
                )))
            }
        }
    }

    /// Abandon a pending call
    ///
    /// Only the local waiter is removed; the peer is told best-effort and may
    /// still finish the work. Returns false if the call was not pending.
    pub async fn cancel(&self, request_id: RequestId) -> bool {
        let removed = self.shared.pending.lock().await.remove(&request_id).is_some();
        if removed {
            tracing::debug!(request_id, "Call cancelled locally");
            if let Err(e) = self
                .shared
                .transport
                .send(Envelope::Cancel {
                    target_request_id: request_id,
                })
                .await
            {
                tracing::debug!(request_id, error = %e, "Failed to send cancel");
            }
        }
        removed
    }

    /// Fire-and-forget request
    pub async fn notify(
        &self,
        channel_id: Option<ChannelId>,
        payload: serde_json::Value,
    ) -> Result<()> {
        let request_id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        self.send(Envelope::Request {
            request_id,
            channel_id,
            payload,
        })
        .await
    }

    /// Answer a request the peer sent us
    pub async fn respond(
        &self,
        request_id: RequestId,
        result: std::result::Result<serde_json::Value, String>,
    ) -> Result<()> {
        let payload = match result {
            Ok(value) => ResponsePayload::ok(value),
            Err(message) => ResponsePayload::error(message),
        };
        self.send(Envelope::Response {
            request_id,
            payload,
        })
        .await
    }

    /// Start receiving the events of a channel
    ///
    /// Opening a channel that already has a stream replaces it; the old
    /// stream ends.
    pub async fn open_stream(&self, channel_id: ChannelId) -> Result<EventStream> {
        if self.is_closed() {
            return Err(RuntimeError::TransportClosed);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        if self
            .shared
            .streams
            .lock()
            .await
            .insert(channel_id.clone(), tx)
            .is_some()
        {
            tracing::debug!(channel_id = %channel_id, "Replaced existing stream");
        }
        Ok(EventStream::new(channel_id, rx))
    }

    /// End a channel locally and tell the peer
    pub async fn close_stream(&self, channel_id: &ChannelId, error: Option<String>) -> Result<()> {
        if let Some(tx) = self.shared.streams.lock().await.remove(channel_id) {
            let _ = tx.send(StreamItem::Closed(error.clone()));
        }
        self.send(Envelope::Close {
            channel_id: channel_id.clone(),
            error,
        })
        .await
    }

    /// Drop the local stream of a channel without telling the peer
    pub async fn detach_stream(&self, channel_id: &ChannelId) -> bool {
        self.shared.streams.lock().await.remove(channel_id).is_some()
    }

    /// Stop the reader, close the transport and reject everything pending
    pub async fn shutdown(&self) {
        self.shared.shutdown.cancel();
        if let Err(e) = self.shared.transport.close().await {
            tracing::debug!(error = %e, "Transport close failed");
        }
        if let Some(reader) = self.reader.lock().await.take() {
            let _ = reader.await;
        }
        // The reader already failed everything; this covers a reader that died early
        self.shared.fail_all("Transport shut down").await;
    }

    pub async fn pending_calls(&self) -> usize {
        self.shared.pending.lock().await.len()
    }
}

/// Ordered events of one channel
///
/// Events are yielded strictly by `seq` starting at 0. Early arrivals are
/// held back until the gap is filled, and a seq that was already delivered
/// or is already buffered is dropped. The stream ends after the `done`
/// event or when the channel is closed.
pub struct EventStream {
    channel_id: ChannelId,
    rx: mpsc::UnboundedReceiver<StreamItem>,
    next_seq: u64,
    buffer: BTreeMap<u64, StreamEvent>,
    /// Close seen; flush what is buffered, then end
    draining: bool,
    finished: bool,
}

impl EventStream {
    fn new(channel_id: ChannelId, rx: mpsc::UnboundedReceiver<StreamItem>) -> Self {
        Self {
            channel_id,
            rx,
            next_seq: 0,
            buffer: BTreeMap::new(),
            draining: false,
            finished: false,
        }
    }

    pub fn channel_id(&self) -> &ChannelId {
        &self.channel_id
    }

    fn yield_event(&mut self, event: StreamEvent) -> Option<Result<StreamEvent>> {
        self.next_seq = event.seq + 1;
        if event.done {
            self.finished = true;
        }
        Some(Ok(event))
    }

    /// Next event in seq order; `None` once the stream has ended
    pub async fn next(&mut self) -> Option<Result<StreamEvent>> {
        loop {
            if self.finished {
                return None;
            }

            if let Some(event) = self.buffer.remove(&self.next_seq) {
                return self.yield_event(event);
            }

            if self.draining {
                // Gaps can no longer be filled after a clean close
                return match self.buffer.pop_first() {
                    Some((_, event)) => self.yield_event(event),
                    None => {
                        self.finished = true;
                        None
                    }
                };
            }

            match self.rx.recv().await {
                Some(StreamItem::Event(event)) => {
                    if event.seq < self.next_seq || self.buffer.contains_key(&event.seq) {
                        tracing::debug!(channel_id = %self.channel_id, seq = event.seq, "Dropping duplicate event");
                        continue;
                    }
                    self.buffer.insert(event.seq, event);
                }
                Some(StreamItem::Closed(None)) => {
                    self.draining = true;
                }
                Some(StreamItem::Closed(Some(reason))) => {
                    self.finished = true;
                    return Some(Err(RuntimeError::ChannelClosed {
                        channel_id: self.channel_id.to_string(),
                        reason,
                    }));
                }
                None => {
                    self.draining = true;
                }
            }
        }
    }

    /// Adapt into a [`futures::Stream`]
    pub fn into_stream(self) -> impl Stream<Item = Result<StreamEvent>> + Send {
        futures::stream::unfold(self, |mut stream| async move {
            stream.next().await.map(|item| (item, stream))
        })
    }
}
