// ABOUTME: Integration tests for the inbound ingest pipeline
// ABOUTME: Round trips, duplicate suppression, policy short-circuits, security denials

mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use switchboard::core::error::{Error, PolicyStage};
use switchboard::core::events::names;
use switchboard::core::model::{MessageStatus, Role};
use switchboard::core::Storage;
use switchboard::ingest::{GateDecision, Gater, ModerationDecision, Moderator, PolicyPipeline};
use switchboard::{IngestOpts, IngestOutcome, ReadOpts};

use support::{instance_with_mock, instance_with_policy, raw_incoming, VerifyBehavior};

// =============================================================================
// SCENARIO: Inbound round-trip for a plain text message
// =============================================================================
#[tokio::test]
async fn scenario_inbound_text_round_trip() {
    let (instance, _adapter) = instance_with_mock("mock-main", Default::default()).await;
    let mut signals = instance.signals();

    let outcome = instance
        .ingest_incoming(
            "mock-main",
            raw_incoming("c1", "u1", "hi", "m1"),
            IngestOpts::default(),
        )
        .await
        .unwrap();

    let (message, context) = match outcome {
        IngestOutcome::Accepted { message, context } => (message, context),
        other => panic!("expected acceptance, got {other:?}"),
    };
    assert_eq!(message.role, Role::User);
    assert_eq!(message.status, MessageStatus::Sent);
    assert_eq!(message.concatenated_text(), "hi");
    assert_eq!(message.external_id.as_deref(), Some("m1"));

    // The mapped room actor holds the message
    let history = instance
        .room_messages(&context.room.id, ReadOpts::default())
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].id, message.id);

    // messaging.message.received fired, correlated to the message id
    let received = loop {
        let signal = signals.recv().await.unwrap();
        if signal.signal_type.ends_with(names::MESSAGE_RECEIVED) {
            break signal;
        }
    };
    assert_eq!(received.correlation_id, message.id);
    assert_eq!(received.subject.as_deref(), Some(context.room.id.as_str()));
}

// =============================================================================
// SCENARIO: Replaying the same raw payload is suppressed
// =============================================================================
#[tokio::test]
async fn scenario_duplicate_suppression() {
    let (instance, _adapter) = instance_with_mock("mock-main", Default::default()).await;
    let mut signals = instance.signals();

    let raw = raw_incoming("c1", "u1", "hi", "m1");
    let first = instance
        .ingest_incoming("mock-main", raw.clone(), IngestOpts::default())
        .await
        .unwrap();
    let room_id = match &first {
        IngestOutcome::Accepted { context, .. } => context.room.id.clone(),
        other => panic!("expected acceptance, got {other:?}"),
    };

    let second = instance
        .ingest_incoming("mock-main", raw, IngestOpts::default())
        .await
        .unwrap();
    assert!(matches!(second, IngestOutcome::Duplicate));

    let history = instance.room_messages(&room_id, ReadOpts::default()).await.unwrap();
    assert_eq!(history.len(), 1, "room history unchanged by the duplicate");

    // Exactly one message.received in the signal stream
    let mut received = 0;
    while let Ok(signal) = signals.try_recv() {
        if signal.signal_type.ends_with(names::MESSAGE_RECEIVED) {
            received += 1;
        }
    }
    assert_eq!(received, 1);
}

// =============================================================================
// PROPERTY: Dedup idempotence until eviction
// =============================================================================
#[tokio::test]
async fn test_every_replay_is_duplicate() {
    let (instance, _adapter) = instance_with_mock("mock-main", Default::default()).await;
    let raw = raw_incoming("c1", "u1", "hi", "m1");
    let first = instance
        .ingest_incoming("mock-main", raw.clone(), IngestOpts::default())
        .await
        .unwrap();
    assert!(matches!(first, IngestOutcome::Accepted { .. }));
    for _ in 0..5 {
        let outcome = instance
            .ingest_incoming("mock-main", raw.clone(), IngestOpts::default())
            .await
            .unwrap();
        assert!(matches!(outcome, IngestOutcome::Duplicate));
    }
}

#[tokio::test]
async fn test_missing_external_id_bypasses_dedup() {
    let (instance, _adapter) = instance_with_mock("mock-main", Default::default()).await;
    let raw = serde_json::json!({
        "external_room_id": "c1",
        "external_user_id": "u1",
        "text": "no id",
    });
    for _ in 0..2 {
        let outcome = instance
            .ingest_incoming("mock-main", raw.clone(), IngestOpts::default())
            .await
            .unwrap();
        assert!(matches!(outcome, IngestOutcome::Accepted { .. }));
    }
}

// =============================================================================
// PROPERTY: A gating deny stops every later hook; a reject stops persistence
// =============================================================================

struct CountingGater {
    name: &'static str,
    calls: Arc<AtomicUsize>,
    deny: bool,
}

#[async_trait]
impl Gater for CountingGater {
    fn name(&self) -> &str {
        self.name
    }
    async fn check(&self, _message: &switchboard::core::model::Message) -> GateDecision {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.deny {
            GateDecision::Deny { reason: "blocked".into(), description: "test".into() }
        } else {
            GateDecision::Allow
        }
    }
}

struct CountingModerator {
    calls: Arc<AtomicUsize>,
    reject: bool,
}

#[async_trait]
impl Moderator for CountingModerator {
    fn name(&self) -> &str {
        "counting_moderator"
    }
    async fn review(
        &self,
        _message: &switchboard::core::model::Message,
    ) -> ModerationDecision {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.reject {
            ModerationDecision::Reject { reason: "rejected".into(), description: "test".into() }
        } else {
            ModerationDecision::Allow
        }
    }
}

#[tokio::test]
async fn test_gating_deny_short_circuits_later_hooks() {
    let later_gater = Arc::new(AtomicUsize::new(0));
    let moderator = Arc::new(AtomicUsize::new(0));
    let policy = PolicyPipeline::new()
        .with_gater(Arc::new(CountingGater {
            name: "denier",
            calls: Arc::new(AtomicUsize::new(0)),
            deny: true,
        }))
        .with_gater(Arc::new(CountingGater {
            name: "later",
            calls: Arc::clone(&later_gater),
            deny: false,
        }))
        .with_moderator(Arc::new(CountingModerator {
            calls: Arc::clone(&moderator),
            reject: false,
        }));
    let (instance, _adapter) =
        instance_with_policy("mock-main", Default::default(), policy).await;

    let err = instance
        .ingest_incoming(
            "mock-main",
            raw_incoming("c1", "u1", "hi", "m1"),
            IngestOpts::default(),
        )
        .await
        .unwrap_err();
    match err {
        Error::PolicyDenied { stage, reason, .. } => {
            assert_eq!(stage, PolicyStage::Gating);
            assert_eq!(reason, "blocked");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(later_gater.load(Ordering::SeqCst), 0, "later gater never ran");
    assert_eq!(moderator.load(Ordering::SeqCst), 0, "moderator never ran");
}

#[tokio::test]
async fn test_moderation_reject_prevents_persistence_and_fanout() {
    let policy = PolicyPipeline::new().with_moderator(Arc::new(CountingModerator {
        calls: Arc::new(AtomicUsize::new(0)),
        reject: true,
    }));
    let (instance, _adapter) =
        instance_with_policy("mock-main", Default::default(), policy).await;

    let err = instance
        .ingest_incoming(
            "mock-main",
            raw_incoming("c1", "u1", "hi", "m1"),
            IngestOpts::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PolicyDenied { stage: PolicyStage::Moderation, .. }));

    // The room was created by resolution, but nothing was persisted or
    // fanned out
    let rooms = instance.storage().list_rooms().await.unwrap();
    assert_eq!(rooms.len(), 1);
    let history = instance
        .room_messages(&rooms[0].id, ReadOpts::default())
        .await
        .unwrap();
    assert!(history.is_empty());
}

// =============================================================================
// Security: explicit verify denial short-circuits
// =============================================================================
#[tokio::test]
async fn test_verify_denial_blocks_ingest() {
    let (instance, adapter) = instance_with_mock("mock-main", Default::default()).await;
    adapter.set_verify(VerifyBehavior::Deny("spoofed_sender".into()));

    let err = instance
        .ingest_incoming(
            "mock-main",
            raw_incoming("c1", "u1", "hi", "m1"),
            IngestOpts::default(),
        )
        .await
        .unwrap_err();
    match err {
        Error::SecurityDenied { stage, reason, .. } => {
            assert_eq!(stage, "verify");
            assert_eq!(reason, "spoofed_sender");
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn test_verify_error_falls_back_permissively() {
    let (instance, adapter) = instance_with_mock("mock-main", Default::default()).await;
    adapter.set_verify(VerifyBehavior::Fail(
        switchboard::core::failure::FailureReason::Timeout,
    ));

    // Default config is permissive: the message proceeds flagged
    let outcome = instance
        .ingest_incoming(
            "mock-main",
            raw_incoming("c1", "u1", "hi", "m1"),
            IngestOpts::default(),
        )
        .await
        .unwrap();
    match outcome {
        IngestOutcome::Accepted { message, context } => {
            assert!(context.verification_fallback);
            assert_eq!(message.metadata["fallback"], serde_json::Value::Bool(true));
        }
        other => panic!("expected acceptance, got {other:?}"),
    }
}

// =============================================================================
// Media: normalized into content blocks, or rejected end-to-end
// =============================================================================
#[tokio::test]
async fn test_media_round_trip() {
    let (instance, _adapter) = instance_with_mock("mock-main", Default::default()).await;
    let raw = serde_json::json!({
        "external_room_id": "c1",
        "external_user_id": "u1",
        "text": "see attached",
        "external_message_id": "m1",
        "media": [{
            "kind": "image",
            "media_type": "image/png",
            "payload": [137, 80, 78, 71],
            "filename": "shot.png",
            "caption": null,
        }],
    });
    let outcome = instance
        .ingest_incoming("mock-main", raw, IngestOpts::default())
        .await
        .unwrap();
    match outcome {
        IngestOutcome::Accepted { message, .. } => {
            assert_eq!(message.content.len(), 2, "text block plus image block");
            assert!(matches!(
                message.content[1],
                switchboard::core::ContentBlock::Image { .. }
            ));
        }
        other => panic!("expected acceptance, got {other:?}"),
    }
}

#[tokio::test]
async fn test_media_policy_rejection_end_to_end() {
    let mut config = switchboard::core::config::RuntimeConfig::default();
    config.media.max_item_bytes = 2;
    let (instance, _adapter) = instance_with_mock("mock-main", config).await;
    let raw = serde_json::json!({
        "external_room_id": "c1",
        "external_user_id": "u1",
        "external_message_id": "m1",
        "media": [{
            "kind": "image",
            "media_type": "image/png",
            "payload": [1, 2, 3, 4],
            "filename": null,
            "caption": null,
        }],
    });
    let err = instance
        .ingest_incoming("mock-main", raw, IngestOpts::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::MediaPolicyDenied {
            reason: switchboard::core::MediaViolation::MaxItemBytesExceeded,
            ..
        }
    ));
}

#[tokio::test]
async fn test_strict_verify_error_denies() {
    let mut config = switchboard::core::config::RuntimeConfig::default();
    config.ingest.strict_verification = true;
    let (instance, adapter) = instance_with_mock("mock-main", config).await;
    adapter.set_verify(VerifyBehavior::Fail(
        switchboard::core::failure::FailureReason::Timeout,
    ));

    let err = instance
        .ingest_incoming(
            "mock-main",
            raw_incoming("c1", "u1", "hi", "m1"),
            IngestOpts::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::SecurityDenied { .. }));
}
