//! Reliable messaging between the orchestrator and its workers.
//!
//! Messages are framed, checksummed, and sequenced. Sends are at-least-once:
//! a pending send is re-emitted on a doubling timer until a reply with the
//! same id arrives or retries are exhausted. Receivers validate, expire,
//! deduplicate, unwrap batch and compression envelopes, and dispatch to a
//! typed handler, serializing handler invocations per source.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::events::{EventBus, OrchestratorEvent};
use crate::{hash, now_ms, OrchestratorError};

pub const PROTOCOL_VERSION: &str = "1.0";
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;
const DEDUP_WINDOW: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Handshake,
    Heartbeat,
    Disconnect,
    TaskRequest,
    TaskAssign,
    TaskAccept,
    TaskReject,
    TaskProgress,
    TaskComplete,
    TaskFail,
    CapabilityUpdate,
    LoadReport,
    RecoveryRequest,
    RecoveryResponse,
    MetricsReport,
    LatencyProbe,
    LatencyResponse,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Handshake => "HANDSHAKE",
            MessageType::Heartbeat => "HEARTBEAT",
            MessageType::Disconnect => "DISCONNECT",
            MessageType::TaskRequest => "TASK_REQUEST",
            MessageType::TaskAssign => "TASK_ASSIGN",
            MessageType::TaskAccept => "TASK_ACCEPT",
            MessageType::TaskReject => "TASK_REJECT",
            MessageType::TaskProgress => "TASK_PROGRESS",
            MessageType::TaskComplete => "TASK_COMPLETE",
            MessageType::TaskFail => "TASK_FAIL",
            MessageType::CapabilityUpdate => "CAPABILITY_UPDATE",
            MessageType::LoadReport => "LOAD_REPORT",
            MessageType::RecoveryRequest => "RECOVERY_REQUEST",
            MessageType::RecoveryResponse => "RECOVERY_RESPONSE",
            MessageType::MetricsReport => "METRICS_REPORT",
            MessageType::LatencyProbe => "LATENCY_PROBE",
            MessageType::LatencyResponse => "LATENCY_RESPONSE",
        }
    }

    /// Message type carried by a handler-produced reply.
    fn reply_type(&self) -> MessageType {
        match self {
            MessageType::LatencyProbe => MessageType::LatencyResponse,
            MessageType::RecoveryRequest => MessageType::RecoveryResponse,
            MessageType::TaskAssign => MessageType::TaskAccept,
            other => *other,
        }
    }
}

/// Broadcast target accepted by every worker.
pub const BROADCAST: &str = "*";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub version: String,
    pub source: String,
    pub target: String,
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    pub payload: Value,
    pub timestamp_ms: i64,
    pub sequence_number: u64,
    pub priority: u8,
    /// Absolute expiry in epoch milliseconds.
    pub ttl_ms: i64,
    pub checksum: u64,
}

impl Message {
    pub fn new(
        source: &str,
        target: &str,
        msg_type: MessageType,
        payload: Value,
        priority: u8,
        sequence_number: u64,
        ttl_ms: i64,
    ) -> Self {
        let mut message = Self {
            id: format!("msg-{}", Uuid::new_v4()),
            version: PROTOCOL_VERSION.to_string(),
            source: source.to_string(),
            target: target.to_string(),
            msg_type,
            payload,
            timestamp_ms: now_ms(),
            sequence_number,
            priority,
            ttl_ms,
            checksum: 0,
        };
        message.checksum = message.compute_checksum();
        message
    }

    /// Content hash over the identifying fields; integrity only, not an
    /// authentication mechanism.
    pub fn compute_checksum(&self) -> u64 {
        let payload_json = self.payload.to_string();
        hash::content_hash64(&format!(
            "{}:{}:{}:{}:{}:{}:{}",
            self.id,
            self.source,
            self.target,
            self.msg_type.as_str(),
            self.timestamp_ms,
            self.sequence_number,
            payload_json
        ))
    }

    /// Build a reply resolving this message's pending send on the peer.
    /// The reply reuses the original id.
    pub fn reply(&self, source: &str, payload: Value) -> Message {
        let mut message = Message::new(
            source,
            &self.source,
            self.msg_type.reply_type(),
            payload,
            self.priority,
            self.sequence_number,
            now_ms() + 30_000,
        );
        message.id = self.id.clone();
        message.checksum = message.compute_checksum();
        message
    }

    pub fn is_expired(&self, now: i64) -> bool {
        now > self.ttl_ms
    }

    fn serialized_size(&self) -> usize {
        serde_json::to_string(self).map(|s| s.len()).unwrap_or(0)
    }
}

/// Typed receiver for one message type.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process a validated inbound message. A `Some` return is sent back to
    /// the source as a reply resolving its pending send.
    async fn handle(&self, message: &Message) -> Result<Option<Value>, OrchestratorError>;
}

#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    pub message_timeout_ms: u64,
    pub max_retries: u32,
    pub compression_threshold: usize,
    pub enable_compression: bool,
    pub batch_size: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            message_timeout_ms: 30_000,
            max_retries: 3,
            compression_threshold: 1024,
            enable_compression: true,
            batch_size: 10,
        }
    }
}

struct PendingSend {
    reply: oneshot::Sender<Result<Value, OrchestratorError>>,
}

#[derive(Default)]
struct DedupWindow {
    order: VecDeque<String>,
    seen: HashSet<String>,
}

impl DedupWindow {
    /// Returns true when the id was already present.
    fn check_and_insert(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return true;
        }
        self.seen.insert(id.to_string());
        self.order.push_back(id.to_string());
        if self.order.len() > DEDUP_WINDOW {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        false
    }
}

pub struct MessageProtocol {
    node_id: String,
    config: ProtocolConfig,
    sequence: AtomicU64,
    pending: Arc<DashMap<String, PendingSend>>,
    dedup: Mutex<DedupWindow>,
    handlers: RwLock<HashMap<MessageType, Arc<dyn MessageHandler>>>,
    outbound: mpsc::UnboundedSender<Message>,
    source_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    events: EventBus,
}

impl MessageProtocol {
    /// Create the protocol endpoint. The returned receiver is the outbound
    /// wire: whatever owns the transport drains it.
    pub fn new(
        node_id: &str,
        config: ProtocolConfig,
        events: EventBus,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Message>) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let protocol = Arc::new(Self {
            node_id: node_id.to_string(),
            config,
            sequence: AtomicU64::new(0),
            pending: Arc::new(DashMap::new()),
            dedup: Mutex::new(DedupWindow::default()),
            handlers: RwLock::new(HashMap::new()),
            outbound,
            source_locks: DashMap::new(),
            events,
        });
        (protocol, outbound_rx)
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn register_handler(&self, msg_type: MessageType, handler: Arc<dyn MessageHandler>) {
        self.handlers.write().insert(msg_type, handler);
    }

    /// Stamp a new outbound message from this endpoint.
    pub fn create_message(
        &self,
        target: &str,
        msg_type: MessageType,
        payload: Value,
        priority: u8,
    ) -> Message {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let ttl = now_ms() + self.config.message_timeout_ms as i64;
        Message::new(&self.node_id, target, msg_type, payload, priority, sequence, ttl)
    }

    /// Send a message and await its reply.
    ///
    /// The message is re-emitted with a doubling timer until the reply
    /// arrives; after `max_retries` re-emissions the send fails with
    /// [`OrchestratorError::Timeout`].
    pub async fn send(&self, message: Message) -> Result<Value, OrchestratorError> {
        let message = self.prepare_outbound(message)?;
        let (tx, rx) = oneshot::channel();
        self.pending
            .insert(message.id.clone(), PendingSend { reply: tx });

        self.emit(&message);
        self.spawn_retry_driver(message);

        rx.await
            .unwrap_or(Err(OrchestratorError::Timeout(self.config.max_retries)))
    }

    /// Fire-and-forget emission: no pending entry, no retries. Used for
    /// assignments and broadcasts whose outcome arrives as a separate
    /// message.
    pub fn notify(&self, message: Message) -> Result<(), OrchestratorError> {
        let message = self.prepare_outbound(message)?;
        self.emit(&message);
        Ok(())
    }

    /// Wrap up to `batch_size` same-source, same-target messages in one
    /// carrier. The carrier's priority is the max of its children.
    pub fn batch(&self, messages: Vec<Message>) -> Result<Message, OrchestratorError> {
        if messages.is_empty() {
            return Err(OrchestratorError::InvalidMessage("empty batch".into()));
        }
        if messages.len() > self.config.batch_size {
            return Err(OrchestratorError::InvalidMessage(format!(
                "batch of {} exceeds limit {}",
                messages.len(),
                self.config.batch_size
            )));
        }
        let source = messages[0].source.clone();
        let target = messages[0].target.clone();
        if messages
            .iter()
            .any(|m| m.source != source || m.target != target)
        {
            return Err(OrchestratorError::InvalidMessage(
                "batch members must share source and target".into(),
            ));
        }
        let priority = messages.iter().map(|m| m.priority).max().unwrap_or(0);
        let children: Vec<Value> = messages
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<_, _>>()
            .map_err(|e| OrchestratorError::InvalidMessage(e.to_string()))?;

        Ok(self.create_message(
            &target,
            MessageType::MetricsReport,
            json!({ "_batch": true, "messages": children }),
            priority,
        ))
    }

    /// Ingest one inbound message. Returns whether it was accepted
    /// (validation passed); duplicates are accepted silently with no side
    /// effect.
    pub async fn receive(&self, message: Message) -> bool {
        if message.id.is_empty() || message.source.is_empty() || message.target.is_empty() {
            self.reject(&message, "missing required field");
            return false;
        }
        if message.version != PROTOCOL_VERSION {
            self.reject(
                &message,
                &format!("version mismatch: {}", message.version),
            );
            return false;
        }
        if message.is_expired(now_ms()) {
            tracing::debug!(
                message_id = %message.id,
                source = %message.source,
                "Dropping expired message"
            );
            self.events.publish(OrchestratorEvent::MessageExpired {
                message_id: message.id.clone(),
                source: message.source.clone(),
            });
            return false;
        }
        if message.compute_checksum() != message.checksum {
            self.reject(&message, "checksum mismatch");
            return false;
        }

        if self.dedup.lock().check_and_insert(&message.id) {
            tracing::trace!(message_id = %message.id, "Duplicate message discarded");
            return true;
        }

        // A reply to one of our pending sends resolves the send future and
        // is not dispatched further.
        if let Some((_, pending)) = self.pending.remove(&message.id) {
            let payload = unwrap_compression(&message.payload);
            let _ = pending.reply.send(Ok(payload));
            return true;
        }

        if message
            .payload
            .get("_batch")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            return self.receive_batch(&message).await;
        }

        self.dispatch(message).await;
        true
    }

    fn receive_batch<'a>(&'a self, carrier: &'a Message) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            let children = carrier
                .payload
                .get("messages")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            let mut all_accepted = true;
            for child in children {
                match serde_json::from_value::<Message>(child) {
                    Ok(inner) => {
                        all_accepted &= self.receive(inner).await;
                    }
                    Err(e) => {
                        tracing::warn!(
                            carrier_id = %carrier.id,
                            error = %e,
                            "Malformed message inside batch carrier"
                        );
                        all_accepted = false;
                    }
                }
            }
            all_accepted
        })
    }

    async fn dispatch(&self, mut message: Message) {
        message.payload = unwrap_compression(&message.payload);

        let handler = self.handlers.read().get(&message.msg_type).cloned();
        let handler = match handler {
            Some(h) => h,
            None => {
                tracing::trace!(
                    message_type = %message.msg_type.as_str(),
                    "No handler registered, message dropped"
                );
                return;
            }
        };

        // Handler invocations are serialized per source so per-node state
        // mutations never interleave for the same worker.
        let lock = self
            .source_locks
            .entry(message.source.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        match handler.handle(&message).await {
            Ok(Some(reply_payload)) => {
                let reply = message.reply(&self.node_id, reply_payload);
                self.emit(&reply);
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(
                    message_id = %message.id,
                    message_type = %message.msg_type.as_str(),
                    error = %e,
                    "Message handler failed"
                );
            }
        }
    }

    fn prepare_outbound(&self, mut message: Message) -> Result<Message, OrchestratorError> {
        if self.config.enable_compression {
            let payload_size = message.payload.to_string().len();
            if payload_size > self.config.compression_threshold
                && message.payload.get("_compressed").is_none()
            {
                message.payload = json!({
                    "_compressed": true,
                    "_original_size": payload_size,
                    "data": message.payload,
                });
                message.checksum = message.compute_checksum();
            }
        }
        let size = message.serialized_size();
        if size > MAX_MESSAGE_SIZE {
            return Err(OrchestratorError::MessageTooLarge(size));
        }
        Ok(message)
    }

    fn spawn_retry_driver(&self, message: Message) {
        let pending = Arc::clone(&self.pending);
        let outbound = self.outbound.clone();
        let timeout = Duration::from_millis(self.config.message_timeout_ms);
        let max_retries = self.config.max_retries;

        tokio::spawn(async move {
            for attempt in 0..=max_retries {
                tokio::time::sleep(timeout * 2u32.saturating_pow(attempt)).await;
                if !pending.contains_key(&message.id) {
                    return;
                }
                if attempt < max_retries {
                    tracing::debug!(
                        message_id = %message.id,
                        attempt = %(attempt + 1),
                        "Retrying unacknowledged message"
                    );
                    let _ = outbound.send(message.clone());
                }
            }
            if let Some((_, entry)) = pending.remove(&message.id) {
                tracing::warn!(
                    message_id = %message.id,
                    retries = %max_retries,
                    "Send exhausted retries"
                );
                let _ = entry.reply.send(Err(OrchestratorError::Timeout(max_retries)));
            }
        });
    }

    fn emit(&self, message: &Message) {
        tracing::trace!(
            message_id = %message.id,
            target = %message.target,
            message_type = %message.msg_type.as_str(),
            "Message outgoing"
        );
        let _ = self.outbound.send(message.clone());
    }

    fn reject(&self, message: &Message, reason: &str) {
        tracing::warn!(
            message_id = %message.id,
            source = %message.source,
            reason = %reason,
            "Message rejected"
        );
        self.events.publish(OrchestratorEvent::MessageRejected {
            message_id: message.id.clone(),
            reason: reason.to_string(),
        });
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

/// Recognize and unwrap the compression envelope.
///
/// The codec is frozen as identity: the envelope marks payloads above the
/// threshold and carries the body verbatim under `data`.
fn unwrap_compression(payload: &Value) -> Value {
    if payload
        .get("_compressed")
        .and_then(Value::as_bool)
        .unwrap_or(false)
    {
        payload.get("data").cloned().unwrap_or(Value::Null)
    } else {
        payload.clone()
    }
}
