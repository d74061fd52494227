// ABOUTME: Ordered gater/moderator pipeline with per-hook time budgets
// ABOUTME: A gating deny or moderating reject short-circuits the whole ingest

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use switchboard_core::config::{IngestConfig, PolicyFallback};
use switchboard_core::error::{Error, PolicyStage, Result};
use switchboard_core::events::names;
use switchboard_core::model::Message;

use crate::telemetry::Telemetry;

/// First-line allow/deny hook. Gaters run before moderators and cannot
/// alter the message.
#[async_trait]
pub trait Gater: Send + Sync {
    fn name(&self) -> &str;
    async fn check(&self, message: &Message) -> GateDecision;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Allow,
    Deny { reason: String, description: String },
}

/// Content review hook. May flag, rewrite or reject the message.
#[async_trait]
pub trait Moderator: Send + Sync {
    fn name(&self) -> &str;
    async fn review(&self, message: &Message) -> ModerationDecision;
}

#[derive(Debug, Clone)]
pub enum ModerationDecision {
    Allow,
    Flag { reason: String, description: String },
    Modify(Box<Message>),
    Reject { reason: String, description: String },
}

/// A flag accumulated while the pipeline ran.
#[derive(Debug, Clone)]
pub struct PolicyFlag {
    pub source: String,
    pub reason: String,
    pub description: String,
}

/// Output of a pipeline run that allowed the message through.
#[derive(Debug)]
pub struct PolicyOutcome {
    pub message: Message,
    pub flags: Vec<PolicyFlag>,
}

/// Ordered gaters then ordered moderators, each under its own deadline.
/// Hook crashes and deadline overruns map through the configured
/// fallbacks instead of taking the pipeline down.
pub struct PolicyPipeline {
    gaters: Vec<Arc<dyn Gater>>,
    moderators: Vec<Arc<dyn Moderator>>,
}

impl PolicyPipeline {
    pub fn new() -> Self {
        Self { gaters: Vec::new(), moderators: Vec::new() }
    }

    pub fn with_gater(mut self, gater: Arc<dyn Gater>) -> Self {
        self.gaters.push(gater);
        self
    }

    pub fn with_moderator(mut self, moderator: Arc<dyn Moderator>) -> Self {
        self.moderators.push(moderator);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.gaters.is_empty() && self.moderators.is_empty()
    }

    pub async fn run(
        &self,
        message: Message,
        config: &IngestConfig,
        telemetry: &Telemetry,
    ) -> Result<PolicyOutcome> {
        let budget = Duration::from_millis(config.policy_timeout_ms);
        let mut flags = Vec::new();

        for gater in &self.gaters {
            let decision = run_gater(gater, &message, budget).await;
            match decision {
                HookRun::Done(GateDecision::Allow) => {
                    emit_decision(telemetry, &message, gater.name(), "allow", None);
                }
                HookRun::Done(GateDecision::Deny { reason, description }) => {
                    emit_decision(telemetry, &message, gater.name(), "deny", Some(&reason));
                    return Err(Error::PolicyDenied {
                        stage: PolicyStage::Gating,
                        reason,
                        description,
                    });
                }
                HookRun::TimedOut => {
                    if let Some(denied) = apply_fallback(
                        config.policy_timeout_fallback,
                        telemetry,
                        &message,
                        gater.name(),
                        "timeout",
                        PolicyStage::Gating,
                        &mut flags,
                    ) {
                        return Err(denied);
                    }
                }
                HookRun::Crashed => {
                    if let Some(denied) = apply_fallback(
                        config.policy_error_fallback,
                        telemetry,
                        &message,
                        gater.name(),
                        "crash",
                        PolicyStage::Gating,
                        &mut flags,
                    ) {
                        return Err(denied);
                    }
                }
            }
        }

        let mut message = message;
        for moderator in &self.moderators {
            let decision = run_moderator(moderator, &message, budget).await;
            match decision {
                HookRun::Done(ModerationDecision::Allow) => {
                    emit_decision(telemetry, &message, moderator.name(), "allow", None);
                }
                HookRun::Done(ModerationDecision::Flag { reason, description }) => {
                    emit_decision(telemetry, &message, moderator.name(), "flag", Some(&reason));
                    flags.push(PolicyFlag {
                        source: moderator.name().to_string(),
                        reason,
                        description,
                    });
                }
                HookRun::Done(ModerationDecision::Modify(modified)) => {
                    emit_decision(telemetry, &message, moderator.name(), "modify", None);
                    message = *modified;
                }
                HookRun::Done(ModerationDecision::Reject { reason, description }) => {
                    emit_decision(telemetry, &message, moderator.name(), "reject", Some(&reason));
                    return Err(Error::PolicyDenied {
                        stage: PolicyStage::Moderation,
                        reason,
                        description,
                    });
                }
                HookRun::TimedOut => {
                    if let Some(denied) = apply_fallback(
                        config.policy_timeout_fallback,
                        telemetry,
                        &message,
                        moderator.name(),
                        "timeout",
                        PolicyStage::Moderation,
                        &mut flags,
                    ) {
                        return Err(denied);
                    }
                }
                HookRun::Crashed => {
                    if let Some(denied) = apply_fallback(
                        config.policy_error_fallback,
                        telemetry,
                        &message,
                        moderator.name(),
                        "crash",
                        PolicyStage::Moderation,
                        &mut flags,
                    ) {
                        return Err(denied);
                    }
                }
            }
        }

        Ok(PolicyOutcome { message, flags })
    }
}

impl Default for PolicyPipeline {
    fn default() -> Self {
        Self::new()
    }
}

enum HookRun<T> {
    Done(T),
    TimedOut,
    Crashed,
}

/// Run a gater on its own task so a panic maps to the error fallback
/// instead of unwinding the pipeline.
async fn run_gater(
    gater: &Arc<dyn Gater>,
    message: &Message,
    budget: Duration,
) -> HookRun<GateDecision> {
    let gater = Arc::clone(gater);
    let message = message.clone();
    let handle = tokio::spawn(async move { gater.check(&message).await });
    match tokio::time::timeout(budget, handle).await {
        Ok(Ok(decision)) => HookRun::Done(decision),
        Ok(Err(_)) => HookRun::Crashed,
        Err(_) => HookRun::TimedOut,
    }
}

async fn run_moderator(
    moderator: &Arc<dyn Moderator>,
    message: &Message,
    budget: Duration,
) -> HookRun<ModerationDecision> {
    let moderator = Arc::clone(moderator);
    let message = message.clone();
    let handle = tokio::spawn(async move { moderator.review(&message).await });
    match tokio::time::timeout(budget, handle).await {
        Ok(Ok(decision)) => HookRun::Done(decision),
        Ok(Err(_)) => HookRun::Crashed,
        Err(_) => HookRun::TimedOut,
    }
}

/// Returns the denial to surface, or records a flag and returns None.
fn apply_fallback(
    fallback: PolicyFallback,
    telemetry: &Telemetry,
    message: &Message,
    hook: &str,
    cause: &str,
    stage: PolicyStage,
    flags: &mut Vec<PolicyFlag>,
) -> Option<Error> {
    match fallback {
        PolicyFallback::Deny => {
            emit_decision(telemetry, message, hook, "deny", Some(cause));
            Some(Error::PolicyDenied {
                stage,
                reason: format!("policy_{cause}"),
                description: format!("hook '{hook}' {cause}"),
            })
        }
        PolicyFallback::AllowWithFlag => {
            emit_decision(telemetry, message, hook, "allow_with_flag", Some(cause));
            flags.push(PolicyFlag {
                source: hook.to_string(),
                reason: format!("policy_{cause}"),
                description: format!("hook '{hook}' {cause}, allowed by fallback"),
            });
            None
        }
    }
}

fn emit_decision(
    telemetry: &Telemetry,
    message: &Message,
    hook: &str,
    decision: &str,
    reason: Option<&str>,
) {
    telemetry.emit_correlated(
        names::POLICY_DECISION,
        Some(&message.room_id),
        &message.id,
        serde_json::json!({"hook": hook, "decision": decision, "reason": reason}),
    );
}
