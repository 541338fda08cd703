//! Messaging protocol behavior: validation order, dedup, expiry, batching,
//! compression envelope, and retry exhaustion.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use fleet_orchestrator::events::EventBus;
use fleet_orchestrator::protocol::{
    Message, MessageHandler, MessageProtocol, MessageType, ProtocolConfig, MAX_MESSAGE_SIZE,
};
use fleet_orchestrator::{OrchestratorError, OrchestratorEvent};
use serde_json::{json, Value};

#[tokio::test]
async fn duplicate_message_is_discarded_silently() {
    let (protocol, _outbound, _events) = test_protocol(ProtocolConfig::default());
    let counter = Arc::new(CountingHandler::default());
    protocol.register_handler(MessageType::TaskProgress, counter.clone());

    let message = worker_message(
        "w1",
        MessageType::TaskProgress,
        json!({ "taskId": "t1", "progress": 0.5 }),
    );

    assert!(protocol.receive(message.clone()).await);
    assert!(protocol.receive(message).await);
    assert_eq!(counter.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn expired_message_is_dropped_without_dispatch() {
    let (protocol, _outbound, events) = test_protocol(ProtocolConfig::default());
    let counter = Arc::new(CountingHandler::default());
    protocol.register_handler(MessageType::TaskProgress, counter.clone());
    let mut rx = events.subscribe();

    let mut message = worker_message(
        "w1",
        MessageType::TaskProgress,
        json!({ "taskId": "t1", "progress": 1.0 }),
    );
    message.ttl_ms = chrono::Utc::now().timestamp_millis() - 1;

    assert!(!protocol.receive(message).await);
    assert_eq!(counter.calls.load(Ordering::SeqCst), 0);
    assert!(drain(&mut rx)
        .iter()
        .any(|e| matches!(e, OrchestratorEvent::MessageExpired { .. })));
}

#[tokio::test]
async fn tampered_payload_fails_checksum() {
    let (protocol, _outbound, events) = test_protocol(ProtocolConfig::default());
    let counter = Arc::new(CountingHandler::default());
    protocol.register_handler(MessageType::Heartbeat, counter.clone());
    let mut rx = events.subscribe();

    let mut message = worker_message("w1", MessageType::Heartbeat, json!({ "status": "ok" }));
    message.payload = json!({ "status": "forged" });

    assert!(!protocol.receive(message).await);
    assert_eq!(counter.calls.load(Ordering::SeqCst), 0);
    let rejected = drain(&mut rx).into_iter().find_map(|e| match e {
        OrchestratorEvent::MessageRejected { reason, .. } => Some(reason),
        _ => None,
    });
    assert!(rejected.unwrap().contains("checksum"));
}

#[tokio::test]
async fn wrong_version_is_rejected() {
    let (protocol, _outbound, _events) = test_protocol(ProtocolConfig::default());
    let mut message = worker_message("w1", MessageType::Heartbeat, json!({}));
    message.version = "0.9".to_string();
    message.checksum = message.compute_checksum();

    assert!(!protocol.receive(message).await);
}

#[tokio::test]
async fn batch_carrier_dispatches_each_inner_message() {
    let (protocol, _outbound, _events) = test_protocol(ProtocolConfig::default());
    let counter = Arc::new(CountingHandler::default());
    protocol.register_handler(MessageType::TaskProgress, counter.clone());

    let children: Vec<Value> = (0..3)
        .map(|i| {
            serde_json::to_value(worker_message(
                "w1",
                MessageType::TaskProgress,
                json!({ "taskId": format!("t{i}"), "progress": 0.1 }),
            ))
            .unwrap()
        })
        .collect();
    let carrier = worker_message(
        "w1",
        MessageType::MetricsReport,
        json!({ "_batch": true, "messages": children }),
    );

    assert!(protocol.receive(carrier).await);
    assert_eq!(counter.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn batch_rejects_mixed_targets() {
    let (protocol, _outbound, _events) = test_protocol(ProtocolConfig::default());
    let a = protocol.create_message("w1", MessageType::LoadReport, json!({}), 1);
    let b = protocol.create_message("w2", MessageType::LoadReport, json!({}), 3);

    assert!(protocol.batch(vec![a, b]).is_err());
}

#[tokio::test]
async fn batch_priority_is_max_of_children() {
    let (protocol, _outbound, _events) = test_protocol(ProtocolConfig::default());
    let a = protocol.create_message("w1", MessageType::LoadReport, json!({}), 1);
    let b = protocol.create_message("w1", MessageType::LoadReport, json!({}), 7);

    let carrier = protocol.batch(vec![a, b]).unwrap();
    assert_eq!(carrier.priority, 7);
    assert_eq!(carrier.msg_type, MessageType::MetricsReport);
}

#[tokio::test]
async fn large_payload_gets_compression_envelope_and_receiver_unwraps_it() {
    let (protocol, mut outbound, _events) = test_protocol(ProtocolConfig {
        compression_threshold: 64,
        ..Default::default()
    });

    let body = json!({ "blob": "x".repeat(512) });
    let message = protocol.create_message("w1", MessageType::TaskAssign, body.clone(), 5);
    protocol.notify(message).unwrap();

    let sent = outbound.recv().await.unwrap();
    assert_eq!(sent.payload.get("_compressed"), Some(&json!(true)));
    assert!(sent.payload.get("_original_size").and_then(Value::as_u64).unwrap() > 64);
    assert_eq!(sent.payload.get("data"), Some(&body));
}

#[tokio::test]
async fn message_size_boundary_is_exact() {
    let (protocol, _outbound, _events) = test_protocol(ProtocolConfig {
        enable_compression: false,
        ..Default::default()
    });

    // Pin the checksum to a fixed-width value so the serialized size is a
    // pure function of the payload length; notify only validates size.
    let ttl = chrono::Utc::now().timestamp_millis() + 30_000;
    let mut message = Message::new(
        "orchestrator",
        "w1",
        MessageType::TaskAssign,
        json!(""),
        5,
        1,
        ttl,
    );
    message.checksum = u64::MAX;
    let base = serde_json::to_string(&message).unwrap().len() - 2;

    message.payload = json!("x".repeat(MAX_MESSAGE_SIZE - base - 2));
    assert!(protocol.notify(message.clone()).is_ok());

    message.payload = json!("x".repeat(MAX_MESSAGE_SIZE - base - 1));
    match protocol.notify(message) {
        Err(OrchestratorError::MessageTooLarge(size)) => assert_eq!(size, MAX_MESSAGE_SIZE + 1),
        other => panic!("expected MessageTooLarge, got {other:?}"),
    }
}

#[tokio::test]
async fn reply_with_matching_id_resolves_pending_send() {
    let (protocol, mut outbound, _events) = test_protocol(ProtocolConfig::default());

    let message =
        protocol.create_message("w1", MessageType::LatencyProbe, json!({ "probeId": 7 }), 5);
    let send = {
        let protocol = protocol.clone();
        tokio::spawn(async move { protocol.send(message).await })
    };

    let sent = outbound.recv().await.unwrap();
    let reply = sent.reply("w1", json!({ "probeId": 7, "echo": true }));
    assert!(protocol.receive(reply).await);

    let resolved = send.await.unwrap().unwrap();
    assert_eq!(resolved.get("echo"), Some(&json!(true)));
}

#[tokio::test]
async fn send_retries_then_times_out() {
    let (protocol, mut outbound, _events) = test_protocol(ProtocolConfig {
        message_timeout_ms: 20,
        max_retries: 2,
        ..Default::default()
    });

    let message = protocol.create_message("w1", MessageType::TaskRequest, json!({}), 5);
    let result = protocol.send(message).await;
    assert!(matches!(result, Err(OrchestratorError::Timeout(2))));

    // Initial emission plus two retries.
    let mut emissions = 0;
    while outbound.try_recv().is_ok() {
        emissions += 1;
    }
    assert_eq!(emissions, 3);
    assert_eq!(protocol.pending_count(), 0);
}

// --- helpers ---

fn test_protocol(
    config: ProtocolConfig,
) -> (
    Arc<MessageProtocol>,
    tokio::sync::mpsc::UnboundedReceiver<Message>,
    EventBus,
) {
    let events = EventBus::new();
    let (protocol, outbound) = MessageProtocol::new("orchestrator", config, events.clone());
    (protocol, outbound, events)
}

fn drain(
    rx: &mut tokio::sync::broadcast::Receiver<OrchestratorEvent>,
) -> Vec<OrchestratorEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn worker_message(source: &str, msg_type: MessageType, payload: Value) -> Message {
    Message::new(
        source,
        "orchestrator",
        msg_type,
        payload,
        5,
        1,
        chrono::Utc::now().timestamp_millis() + 30_000,
    )
}

#[derive(Default)]
struct CountingHandler {
    calls: AtomicUsize,
}

#[async_trait]
impl MessageHandler for CountingHandler {
    async fn handle(&self, _message: &Message) -> Result<Option<Value>, OrchestratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(None)
    }
}
