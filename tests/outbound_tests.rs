// ABOUTME: Integration tests for the outbound gateway
// ABOUTME: Retries, idempotency, load shed, queue bounds, FIFO under retry

mod support;

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use switchboard::core::config::{DeadLetterConfig, OutboundConfig, RetryConfig};
use switchboard::core::delivery::{ErrorCategory, Priority, Route};
use switchboard::core::failure::FailureReason;
use switchboard::bridge::AdapterBridge;
use switchboard::dead_letter::DeadLetterStore;
use switchboard::outbound::{BridgeSource, OutboundGateway, OutboundReason};
use switchboard::session_route::SessionRouteStore;
use switchboard::{DeliveryRequest, Telemetry};

use support::{MockAdapter, SendBehavior};

struct TestBridges(HashMap<String, AdapterBridge>);

impl BridgeSource for TestBridges {
    fn bridge(&self, bridge_id: &str) -> Option<AdapterBridge> {
        self.0.get(bridge_id).cloned()
    }
}

struct Harness {
    gateway: Arc<OutboundGateway>,
    dead_letters: Arc<DeadLetterStore>,
    adapter: Arc<MockAdapter>,
}

fn harness(config: OutboundConfig) -> Harness {
    let adapter = Arc::new(MockAdapter::new("mock"));
    let bridge = AdapterBridge::new("b1", adapter.clone());
    let bridges = Arc::new(TestBridges(HashMap::from([("b1".to_string(), bridge)])));
    let sessions = Arc::new(SessionRouteStore::new(&Default::default()));
    let telemetry = Telemetry::new("outbound-test");
    let dead_letters = DeadLetterStore::new(
        DeadLetterConfig { capacity: 100, replay_partitions: 2 },
        telemetry.clone(),
    );
    let gateway = OutboundGateway::new(
        config,
        bridges,
        sessions,
        Arc::clone(&dead_letters),
        telemetry,
    );
    dead_letters.start_replay_workers(Arc::clone(&gateway));
    Harness { gateway, dead_letters, adapter }
}

fn fast_retry() -> RetryConfig {
    RetryConfig { max_attempts: 3, base_ms: 1, max_ms: 5, jitter: 0.0 }
}

fn request(message_id: &str, text: &str) -> DeliveryRequest {
    DeliveryRequest::send_text(message_id, Route::new("b1", "room-ext"), text)
}

// =============================================================================
// SCENARIO: Two timeouts then success; the idempotency cache absorbs a 4th call
// =============================================================================
#[tokio::test]
async fn scenario_outbound_retry_then_idempotent_replay() {
    let h = harness(OutboundConfig { retry: fast_retry(), ..Default::default() });
    h.adapter.script([
        SendBehavior::Fail(FailureReason::Timeout),
        SendBehavior::Fail(FailureReason::Timeout),
        SendBehavior::Ok("x9".into()),
    ]);

    let response = h.gateway.enqueue(request("m1", "hello")).await.unwrap();
    assert_eq!(response.attempts, 3);
    assert_eq!(response.message_id, "x9");
    assert!(!response.idempotent);
    assert_eq!(h.adapter.send_calls.load(Ordering::SeqCst), 3);

    // 4th identical enqueue: cached result, no adapter call
    let replay = h.gateway.enqueue(request("m1", "hello")).await.unwrap();
    assert_eq!(replay.message_id, "x9");
    assert!(replay.idempotent);
    assert_eq!(replay.attempts, 0);
    assert_eq!(h.adapter.send_calls.load(Ordering::SeqCst), 3);
}

// =============================================================================
// SCENARIO: Shed drops low priority at high fill but admits normal priority
// =============================================================================
#[tokio::test]
async fn scenario_load_shed_drops_low_priority() {
    let h = harness(OutboundConfig {
        queue_capacity: 4,
        retry: fast_retry(),
        ..Default::default()
    });
    h.adapter.block();

    let mut pending = Vec::new();
    for i in 0..4 {
        let gateway = Arc::clone(&h.gateway);
        let mut req = request(&format!("m{i}"), "low job");
        req.priority = Priority::Low;
        pending.push(tokio::spawn(async move { gateway.enqueue(req).await }));
        // Let the worker pull the first job so fill includes in-flight
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    // 5th low-priority job is shed with a terminal error
    let mut shed_req = request("m-shed", "shed me");
    shed_req.priority = Priority::Low;
    let shed = h.gateway.enqueue(shed_req).await.unwrap_err();
    assert_eq!(shed.category, ErrorCategory::Terminal);
    assert!(matches!(shed.reason, OutboundReason::LoadShed));

    // Same fill, normal priority: accepted (stays pending until unblock)
    let gateway = Arc::clone(&h.gateway);
    let normal = tokio::spawn(async move {
        gateway.enqueue(request("m-normal", "normal job")).await
    });
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    assert!(!normal.is_finished(), "normal-priority enqueue was admitted, not rejected");

    h.adapter.unblock();
    for handle in pending {
        assert!(handle.await.unwrap().is_ok());
    }
    assert!(normal.await.unwrap().is_ok());
}

// =============================================================================
// Queue capacity: enqueue above capacity is rejected terminally
// =============================================================================
#[tokio::test]
async fn test_queue_full_rejects_normal_priority() {
    let h = harness(OutboundConfig {
        queue_capacity: 2,
        retry: fast_retry(),
        ..Default::default()
    });
    h.adapter.block();

    let mut pending = Vec::new();
    for i in 0..3 {
        let gateway = Arc::clone(&h.gateway);
        let req = request(&format!("m{i}"), "job");
        pending.push(tokio::spawn(async move { gateway.enqueue(req).await }));
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    // 1 in flight + 2 queued = queue at capacity
    let full = h.gateway.enqueue(request("m-full", "job")).await.unwrap_err();
    assert_eq!(full.category, ErrorCategory::Terminal);
    assert!(matches!(full.reason, OutboundReason::QueueFull));

    h.adapter.unblock();
    for handle in pending {
        assert!(handle.await.unwrap().is_ok());
    }
}

// =============================================================================
// PROPERTY: Retry budget is exact and exhaustion dead-letters
// =============================================================================
#[tokio::test]
async fn test_retry_budget_and_dead_letter() {
    let h = harness(OutboundConfig { retry: fast_retry(), ..Default::default() });
    h.adapter.script([
        SendBehavior::Fail(FailureReason::Timeout),
        SendBehavior::Fail(FailureReason::Timeout),
        SendBehavior::Fail(FailureReason::Timeout),
        // Would succeed on a 4th call, which must never happen
        SendBehavior::Ok("never".into()),
    ]);

    let error = h.gateway.enqueue(request("m1", "doomed")).await.unwrap_err();
    assert_eq!(error.category, ErrorCategory::Retryable);
    assert_eq!(error.attempt, 3);
    assert_eq!(error.max_attempts, 3);
    assert!(error.retryable);
    assert_eq!(h.adapter.send_calls.load(Ordering::SeqCst), 3, "adapter called exactly N times");

    let records = h.dead_letters.list();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].attempt, 3);
    assert_eq!(records[0].request.message_id, "m1");
}

// =============================================================================
// PROPERTY: Terminal adapter failures never retry
// =============================================================================
#[tokio::test]
async fn test_degraded_failure_is_terminal_without_retry() {
    let h = harness(OutboundConfig { retry: fast_retry(), ..Default::default() });
    h.adapter.script([SendBehavior::Fail(FailureReason::Unsupported)]);

    let error = h.gateway.enqueue(request("m1", "nope")).await.unwrap_err();
    assert_eq!(error.category, ErrorCategory::Terminal);
    assert_eq!(error.attempt, 1);
    assert_eq!(h.adapter.send_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.dead_letters.len(), 1);
}

// =============================================================================
// PROPERTY: Partition pinning is stable; FIFO survives retries
// =============================================================================
#[tokio::test]
async fn test_partition_stability() {
    let h = harness(OutboundConfig::default());
    let key = "b1:room-ext";
    let first = h.gateway.partition_index(key);
    for _ in 0..100 {
        assert_eq!(h.gateway.partition_index(key), first);
    }
    let response = h.gateway.enqueue(request("m1", "x")).await.unwrap();
    assert_eq!(response.partition, first);
}

#[tokio::test]
async fn test_fifo_preserved_across_retries() {
    let h = harness(OutboundConfig { retry: fast_retry(), ..Default::default() });
    // First job fails once then succeeds; second job would succeed
    // immediately but must wait for the first job's retry
    h.adapter.script([
        SendBehavior::Fail(FailureReason::Timeout),
        SendBehavior::Ok("a".into()),
        SendBehavior::Ok("b".into()),
    ]);

    let g1 = Arc::clone(&h.gateway);
    let first = tokio::spawn(async move { g1.enqueue(request("m1", "first")).await });
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let g2 = Arc::clone(&h.gateway);
    let second = tokio::spawn(async move { g2.enqueue(request("m2", "second")).await });

    assert!(first.await.unwrap().is_ok());
    assert!(second.await.unwrap().is_ok());

    let texts = h.adapter.sent_texts();
    assert_eq!(texts, vec!["first", "first", "second"], "retry dispatched before later job");
}

// =============================================================================
// Chunk-suffixed idempotency keys stay distinct within a partition
// =============================================================================
#[tokio::test]
async fn test_chunk_keys_do_not_collide() {
    let h = harness(OutboundConfig::default());

    // The router keys a chunked send as base, base:chunk:1, ... — every
    // chunk must reach the adapter even though all share one partition
    let mut second = request("m1", "part two");
    second.idempotency_key = "m1:chunk:1".into();
    let first = h.gateway.enqueue(request("m1", "part one")).await.unwrap();
    let follow = h.gateway.enqueue(second).await.unwrap();

    assert!(!first.idempotent);
    assert!(!follow.idempotent, "chunk key must not hit the base key's cache entry");
    assert_eq!(h.adapter.sent_texts(), vec!["part one", "part two"]);

    // Replaying the same chunk key is deduplicated as usual
    let mut replay = request("m1", "part two again");
    replay.idempotency_key = "m1:chunk:1".into();
    let replayed = h.gateway.enqueue(replay).await.unwrap();
    assert!(replayed.idempotent);
    assert_eq!(replayed.message_id, follow.message_id);
    assert_eq!(h.adapter.send_calls.load(Ordering::SeqCst), 2);
}

// =============================================================================
// Capability gating: edits against a text-only bridge fail fast
// =============================================================================
#[tokio::test]
async fn test_missing_edit_capability_is_terminal() {
    let adapter = Arc::new(
        MockAdapter::new("mock")
            .with_capabilities(vec![switchboard::core::adapter::Capability::Text]),
    );
    let bridge = AdapterBridge::new("b1", adapter.clone());
    let bridges = Arc::new(TestBridges(HashMap::from([("b1".to_string(), bridge)])));
    let sessions = Arc::new(SessionRouteStore::new(&Default::default()));
    let telemetry = Telemetry::new("outbound-test");
    let dead_letters = DeadLetterStore::new(DeadLetterConfig::default(), telemetry.clone());
    let gateway = OutboundGateway::new(
        OutboundConfig::default(),
        bridges,
        sessions,
        Arc::clone(&dead_letters),
        telemetry,
    );

    let mut req = request("m1", "new text");
    req.operation = switchboard::core::delivery::Operation::Edit;
    req.payload.external_message_id = Some("ext-1".into());
    let error = gateway.enqueue(req).await.unwrap_err();
    assert_eq!(error.category, ErrorCategory::Terminal);
    assert_eq!(adapter.send_calls.load(Ordering::SeqCst), 0, "adapter never called");
}

// =============================================================================
// Edit without an external message id is terminal
// =============================================================================
#[tokio::test]
async fn test_edit_without_external_id() {
    let h = harness(OutboundConfig::default());
    let mut req = request("m1", "new text");
    req.operation = switchboard::core::delivery::Operation::Edit;
    let error = h.gateway.enqueue(req).await.unwrap_err();
    assert!(matches!(error.reason, OutboundReason::MissingExternalMessageId));
    assert_eq!(error.category, ErrorCategory::Terminal);
}

// =============================================================================
// Dead-letter replay: fixed adapter, replayed to success exactly once
// =============================================================================
#[tokio::test]
async fn test_dead_letter_replay_roundtrip() {
    let h = harness(OutboundConfig { retry: fast_retry(), ..Default::default() });
    h.adapter.script([
        SendBehavior::Fail(FailureReason::Timeout),
        SendBehavior::Fail(FailureReason::Timeout),
        SendBehavior::Fail(FailureReason::Timeout),
    ]);
    h.gateway.enqueue(request("m1", "flaky")).await.unwrap_err();
    let record_id = h.dead_letters.list()[0].id.clone();

    // Adapter recovered: the empty script auto-succeeds now
    let replayed = h
        .dead_letters
        .replay(&record_id, Default::default())
        .await
        .expect("replay dispatched");
    assert!(replayed.is_ok());

    let record = h.dead_letters.get(&record_id).unwrap();
    assert_eq!(
        record.replay.status,
        switchboard::dead_letter::ReplayStatus::Succeeded
    );

    // A second replay without force is rejected
    let again = h.dead_letters.replay(&record_id, Default::default()).await;
    assert!(matches!(
        again,
        Err(switchboard::dead_letter::ReplayError::AlreadySucceeded)
    ));
}
