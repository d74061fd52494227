// ABOUTME: Shared mock adapter and instance builders for integration tests
// ABOUTME: Scripted send outcomes, call capture, and a blockable worker gate

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use switchboard::core::adapter::{
    Capability, ChannelAdapter, Incoming, SendOpts, SendReceipt, VerifyOutcome,
};
use switchboard::core::config::RuntimeConfig;
use switchboard::core::failure::FailureReason;
use switchboard::ingest::PolicyPipeline;
use switchboard::{MemoryStorage, MessagingInstance};

/// One scripted outcome for a send-family call.
#[derive(Debug, Clone)]
pub enum SendBehavior {
    Ok(String),
    Fail(FailureReason),
}

/// What verify_sender should do.
#[derive(Debug, Clone)]
pub enum VerifyBehavior {
    Allow,
    Deny(String),
    Fail(FailureReason),
}

/// A captured outbound call.
#[derive(Debug, Clone, PartialEq)]
pub struct SentRecord {
    pub external_room_id: String,
    pub text: String,
}

/// Configurable mock platform adapter. Send outcomes pop off a script;
/// an empty script auto-succeeds with generated external ids.
pub struct MockAdapter {
    channel: String,
    capabilities: Vec<Capability>,
    max_message_length: Option<usize>,
    pub sent: Arc<Mutex<Vec<SentRecord>>>,
    pub send_calls: Arc<AtomicUsize>,
    script: Arc<Mutex<VecDeque<SendBehavior>>>,
    blocked: Arc<AtomicBool>,
    verify: Arc<Mutex<VerifyBehavior>>,
    auto_id: AtomicUsize,
}

impl MockAdapter {
    pub fn new(channel: &str) -> Self {
        Self {
            channel: channel.to_string(),
            capabilities: vec![
                Capability::Text,
                Capability::SenderVerification,
                Capability::MessageEdit,
            ],
            max_message_length: None,
            sent: Arc::new(Mutex::new(Vec::new())),
            send_calls: Arc::new(AtomicUsize::new(0)),
            script: Arc::new(Mutex::new(VecDeque::new())),
            blocked: Arc::new(AtomicBool::new(false)),
            verify: Arc::new(Mutex::new(VerifyBehavior::Allow)),
            auto_id: AtomicUsize::new(0),
        }
    }

    pub fn with_capabilities(mut self, capabilities: Vec<Capability>) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Advertise a platform length limit so the router auto-chunks.
    pub fn with_max_message_length(mut self, max: usize) -> Self {
        self.max_message_length = Some(max);
        self
    }

    /// Queue outcomes for upcoming send calls, in order.
    pub fn script(&self, behaviors: impl IntoIterator<Item = SendBehavior>) {
        let mut script = self.script.lock().unwrap();
        script.extend(behaviors);
    }

    pub fn set_verify(&self, behavior: VerifyBehavior) {
        *self.verify.lock().unwrap() = behavior;
    }

    /// Park the worker inside send_message until unblocked.
    pub fn block(&self) {
        self.blocked.store(true, Ordering::SeqCst);
    }

    pub fn unblock(&self) {
        self.blocked.store(false, Ordering::SeqCst);
    }

    pub fn sent_texts(&self) -> Vec<String> {
        self.sent.lock().unwrap().iter().map(|r| r.text.clone()).collect()
    }

    async fn run_send(&self, external_room_id: &str, text: &str) -> Result<SendReceipt, FailureReason> {
        while self.blocked.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        self.send_calls.fetch_add(1, Ordering::SeqCst);
        self.sent.lock().unwrap().push(SentRecord {
            external_room_id: external_room_id.to_string(),
            text: text.to_string(),
        });
        let behavior = self.script.lock().unwrap().pop_front();
        match behavior {
            Some(SendBehavior::Ok(id)) => Ok(SendReceipt::new(id)),
            Some(SendBehavior::Fail(reason)) => Err(reason),
            None => {
                let n = self.auto_id.fetch_add(1, Ordering::SeqCst);
                Ok(SendReceipt::new(format!("ext-{n}")))
            }
        }
    }
}

#[async_trait]
impl ChannelAdapter for MockAdapter {
    fn channel_type(&self) -> &str {
        &self.channel
    }

    fn capabilities(&self) -> Vec<Capability> {
        self.capabilities.clone()
    }

    fn transform_incoming(&self, raw: serde_json::Value) -> Result<Incoming, FailureReason> {
        serde_json::from_value(raw).map_err(|_| FailureReason::InvalidReturn)
    }

    async fn send_message(
        &self,
        external_room_id: &str,
        text: &str,
        _opts: &SendOpts,
    ) -> Result<SendReceipt, FailureReason> {
        self.run_send(external_room_id, text).await
    }

    async fn edit_message(
        &self,
        external_room_id: &str,
        _external_message_id: &str,
        text: &str,
        _opts: &SendOpts,
    ) -> Result<SendReceipt, FailureReason> {
        self.run_send(external_room_id, text).await
    }

    async fn verify_sender(&self, _incoming: &Incoming) -> Result<VerifyOutcome, FailureReason> {
        match self.verify.lock().unwrap().clone() {
            VerifyBehavior::Allow => Ok(VerifyOutcome::Allow),
            VerifyBehavior::Deny(reason) => Ok(VerifyOutcome::Deny {
                reason,
                description: "mock denial".into(),
            }),
            VerifyBehavior::Fail(reason) => Err(reason),
        }
    }

    fn max_message_length(&self) -> Option<usize> {
        self.max_message_length
    }
}

/// Instance with one mock bridge installed and an enabled bridge config,
/// ready for inbound and outbound traffic.
pub async fn instance_with_mock(
    bridge_id: &str,
    config: RuntimeConfig,
) -> (Arc<MessagingInstance>, Arc<MockAdapter>) {
    let (instance, adapter) = instance_with_policy(bridge_id, config, PolicyPipeline::new()).await;
    (instance, adapter)
}

/// Same as `instance_with_mock` with a caller-supplied policy pipeline.
pub async fn instance_with_policy(
    bridge_id: &str,
    config: RuntimeConfig,
    policy: PolicyPipeline,
) -> (Arc<MessagingInstance>, Arc<MockAdapter>) {
    let adapter = Arc::new(MockAdapter::new("mock"));
    let instance = instance_with_adapter(bridge_id, adapter.clone(), config, policy).await;
    (instance, adapter)
}

/// Instance wired around a caller-built mock adapter.
pub async fn instance_with_adapter(
    bridge_id: &str,
    adapter: Arc<MockAdapter>,
    config: RuntimeConfig,
    policy: PolicyPipeline,
) -> Arc<MessagingInstance> {
    let instance = MessagingInstance::new(
        format!("test-{bridge_id}"),
        config,
        Arc::new(MemoryStorage::new()),
        policy,
    );
    instance.register_adapter(bridge_id, adapter);
    instance
        .config_store()
        .put_bridge_config(
            switchboard::core::routing::BridgeConfig::new(bridge_id, "mock"),
            None,
        )
        .await
        .expect("bridge config write");
    instance
}

/// Raw inbound payload in the shape the mock adapter understands.
pub fn raw_incoming(external_room: &str, external_user: &str, text: &str, message_id: &str) -> serde_json::Value {
    serde_json::json!({
        "external_room_id": external_room,
        "external_user_id": external_user,
        "text": text,
        "external_message_id": message_id,
    })
}
