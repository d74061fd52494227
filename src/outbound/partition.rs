// ABOUTME: One outbound partition: bounded FIFO queue, worker, inline retries
// ABOUTME: A routing key never leaves its partition, so per-key order is total

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio::sync::{oneshot, Notify};

use switchboard_core::adapter::{SanitizeOutcome, SendReceipt};
use switchboard_core::config::{DegradedAction, OutboundConfig, ShedAction};
use switchboard_core::delivery::{ErrorCategory, Operation, Route};
use switchboard_core::events::names;

use crate::dead_letter::{CaptureRequest, DeadLetterStore};
use crate::outbound::idempotency::IdempotencyCache;
use crate::outbound::pressure::{PressureLevel, PressureTracker};
use crate::outbound::{
    BridgeSource, DeliveryRequest, DeliveryResult, ErrorResponse, FailureDisposition,
    OutboundReason, RouteResolutionInfo, SuccessResponse,
};
use crate::session_route::{FallbackReason, RouteSource, SessionRouteStore};
use crate::telemetry::Telemetry;

const SANITIZE_TIMEOUT: Duration = Duration::from_millis(50);

struct Job {
    request: DeliveryRequest,
    respond: oneshot::Sender<DeliveryResult>,
}

struct PartitionState {
    queue: VecDeque<Job>,
    idempotency: IdempotencyCache,
    pressure: PressureTracker,
    in_flight: usize,
}

struct PartitionInner {
    index: usize,
    config: OutboundConfig,
    state: Mutex<PartitionState>,
    notify: Notify,
    bridges: Arc<dyn BridgeSource>,
    sessions: Arc<SessionRouteStore>,
    dead_letters: Arc<DeadLetterStore>,
    telemetry: Telemetry,
}

/// Handle to one running partition worker.
#[derive(Clone)]
pub struct PartitionHandle {
    inner: Arc<PartitionInner>,
    worker: Arc<tokio::task::JoinHandle<()>>,
}

impl PartitionHandle {
    pub fn start(
        index: usize,
        config: OutboundConfig,
        bridges: Arc<dyn BridgeSource>,
        sessions: Arc<SessionRouteStore>,
        dead_letters: Arc<DeadLetterStore>,
        telemetry: Telemetry,
    ) -> Self {
        let inner = Arc::new(PartitionInner {
            index,
            state: Mutex::new(PartitionState {
                queue: VecDeque::new(),
                idempotency: IdempotencyCache::new(config.idempotency_capacity),
                pressure: PressureTracker::new(config.pressure.clone()),
                in_flight: 0,
            }),
            config,
            notify: Notify::new(),
            bridges,
            sessions,
            dead_letters,
            telemetry,
        });
        let worker = tokio::spawn(run_worker(Arc::clone(&inner)));
        Self { inner, worker: Arc::new(worker) }
    }

    /// Queued plus in-flight jobs on this partition.
    pub fn depth(&self) -> usize {
        self.inner
            .state
            .lock()
            .map(|s| s.queue.len() + s.in_flight)
            .unwrap_or(0)
    }

    pub fn pressure_level(&self) -> PressureLevel {
        self.inner
            .state
            .lock()
            .map(|s| s.pressure.level())
            .unwrap_or(PressureLevel::Normal)
    }

    /// Admit a request: idempotency short-circuit, pressure decisions,
    /// capacity bound, then FIFO queue. The returned future resolves with
    /// the job's final outcome after all retries.
    pub async fn enqueue(&self, request: DeliveryRequest) -> DeliveryResult {
        let (tx, rx) = oneshot::channel();
        {
            let Ok(mut state) = self.inner.state.lock() else {
                return Err(self.reject(&request, OutboundReason::PartitionUnavailable, 0));
            };

            if let Some(external_id) = state.idempotency.lookup(&request.idempotency_key) {
                self.inner.telemetry.emit_correlated(
                    names::DELIVERY_SKIPPED_DUPLICATE,
                    None,
                    &request.message_id,
                    serde_json::json!({
                        "idempotency_key": request.idempotency_key,
                        "partition": self.inner.index,
                    }),
                );
                return Ok(SuccessResponse {
                    operation: request.operation,
                    message_id: external_id,
                    partition: self.inner.index,
                    attempts: 0,
                    routing_key: request.routing_key(),
                    pressure_level: state.pressure.level(),
                    idempotent: true,
                    route_resolution: None,
                    security: None,
                    media: None,
                });
            }

            if self.worker.is_finished() {
                return Err(self.reject(&request, OutboundReason::PartitionUnavailable, 0));
            }

            let backlog = state.queue.len();
            let capacity = self.inner.config.queue_capacity.max(1);
            let fill = (backlog + state.in_flight) as f64 / capacity as f64;
            if let Some((from, to)) = state.pressure.observe(fill) {
                self.emit_pressure(from, to, fill);
            }

            let level = state.pressure.level();
            if level >= PressureLevel::Shed
                && state.pressure.config().shed_action == ShedAction::DropLow
                && state
                    .pressure
                    .config()
                    .shed_drop_priorities
                    .contains(&request.priority)
            {
                return Err(self.reject(&request, OutboundReason::LoadShed, 0));
            }

            if backlog >= capacity {
                return Err(self.reject(&request, OutboundReason::QueueFull, 0));
            }

            self.inner.telemetry.emit_correlated(
                names::DELIVERY_QUEUED,
                None,
                &request.message_id,
                serde_json::json!({
                    "partition": self.inner.index,
                    "routing_key": request.routing_key(),
                    "priority": format!("{:?}", request.priority).to_lowercase(),
                }),
            );
            state.queue.push_back(Job { request, respond: tx });
        }
        self.inner.notify.notify_one();

        rx.await.unwrap_or_else(|_| {
            Err(ErrorResponse {
                category: ErrorCategory::Fatal,
                disposition: FailureDisposition::Terminal,
                reason: OutboundReason::PartitionUnavailable,
                attempt: 0,
                max_attempts: 0,
                partition: self.inner.index,
                routing_key: String::new(),
                retryable: false,
            })
        })
    }

    fn reject(
        &self,
        request: &DeliveryRequest,
        reason: OutboundReason,
        attempt: u32,
    ) -> ErrorResponse {
        let category = reason.category();
        ErrorResponse {
            category,
            disposition: FailureDisposition::Terminal,
            reason,
            attempt,
            max_attempts: self.inner.config.retry.max_attempts,
            partition: self.inner.index,
            routing_key: request.routing_key(),
            retryable: false,
        }
    }

    fn emit_pressure(&self, from: PressureLevel, to: PressureLevel, fill: f64) {
        emit_pressure(&self.inner, from, to, fill);
    }
}

fn emit_pressure(inner: &PartitionInner, from: PressureLevel, to: PressureLevel, fill: f64) {
    tracing::debug!(partition = inner.index, ?from, ?to, fill, "outbound pressure transition");
    inner.telemetry.emit(
        names::GATEWAY_PRESSURE,
        serde_json::json!({
            "partition": inner.index,
            "from": format!("{from:?}").to_lowercase(),
            "to": format!("{to:?}").to_lowercase(),
            "fill": fill,
        }),
    );
}

async fn run_worker(inner: Arc<PartitionInner>) {
    loop {
        let job = {
            let Ok(mut state) = inner.state.lock() else { return };
            let job = state.queue.pop_front();
            if job.is_some() {
                state.in_flight = 1;
            }
            job
        };
        match job {
            Some(job) => {
                process_job(&inner, job).await;
                let Ok(mut state) = inner.state.lock() else { return };
                state.in_flight = 0;
                let capacity = inner.config.queue_capacity.max(1);
                let fill = state.queue.len() as f64 / capacity as f64;
                if let Some((from, to)) = state.pressure.observe(fill) {
                    drop(state);
                    emit_pressure(&inner, from, to, fill);
                }
            }
            None => inner.notify.notified().await,
        }
    }
}

/// Run one job to its final outcome, retrying in place so partition FIFO
/// survives retries.
async fn process_job(inner: &Arc<PartitionInner>, job: Job) {
    let Job { request, respond } = job;
    let max_attempts = inner.config.retry.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        let (level, throttle) = {
            match inner.state.lock() {
                Ok(state) => (
                    state.pressure.level(),
                    state.pressure.config().degraded_action == DegradedAction::Throttle,
                ),
                Err(_) => (PressureLevel::Normal, false),
            }
        };
        if level >= PressureLevel::Degraded && throttle {
            tokio::time::sleep(Duration::from_millis(inner.config.pressure.throttle_ms)).await;
        }

        inner.telemetry.emit_correlated(
            names::DELIVERY_ATTEMPT,
            None,
            &request.message_id,
            serde_json::json!({
                "partition": inner.index,
                "attempt": attempt,
                "routing_key": request.routing_key(),
            }),
        );

        match dispatch(inner, &request).await {
            Ok((receipt, resolution, security)) => {
                if let Ok(mut state) = inner.state.lock() {
                    state.idempotency.record(&request.idempotency_key, &receipt.message_id);
                }
                inner.telemetry.emit_correlated(
                    names::MESSAGE_SENT,
                    None,
                    &request.message_id,
                    serde_json::json!({
                        "partition": inner.index,
                        "attempts": attempt,
                        "external_message_id": receipt.message_id,
                    }),
                );
                let _ = respond.send(Ok(SuccessResponse {
                    operation: request.operation,
                    message_id: receipt.message_id,
                    partition: inner.index,
                    attempts: attempt,
                    routing_key: request.routing_key(),
                    pressure_level: level,
                    idempotent: false,
                    route_resolution: resolution,
                    security,
                    media: media_summary(&request),
                }));
                return;
            }
            Err(reason) => {
                let category = reason.category();
                if category == ErrorCategory::Retryable && attempt < max_attempts {
                    let delay = jittered_backoff(inner, attempt);
                    inner.telemetry.emit_correlated(
                        names::DELIVERY_RETRY_SCHEDULED,
                        None,
                        &request.message_id,
                        serde_json::json!({
                            "partition": inner.index,
                            "attempt": attempt,
                            "delay_ms": delay.as_millis() as u64,
                            "reason": reason.describe(),
                        }),
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }

                let disposition = if category == ErrorCategory::Retryable {
                    FailureDisposition::Retry
                } else {
                    FailureDisposition::Terminal
                };
                inner.telemetry.emit_correlated(
                    names::DELIVERY_GAVE_UP,
                    None,
                    &request.message_id,
                    serde_json::json!({
                        "partition": inner.index,
                        "attempt": attempt,
                        "category": format!("{category:?}").to_lowercase(),
                        "reason": reason.describe(),
                    }),
                );
                inner
                    .dead_letters
                    .capture(CaptureRequest {
                        category,
                        disposition,
                        reason: reason.describe(),
                        attempt,
                        max_attempts,
                        partition: inner.index,
                        request: request.clone(),
                        diagnostics: serde_json::json!({
                            "routing_key": request.routing_key(),
                        }),
                    })
                    .await;
                let _ = respond.send(Err(ErrorResponse {
                    category,
                    disposition,
                    reason,
                    attempt,
                    max_attempts,
                    partition: inner.index,
                    routing_key: request.routing_key(),
                    retryable: category == ErrorCategory::Retryable,
                }));
                return;
            }
        }
    }
}

fn jittered_backoff(inner: &Arc<PartitionInner>, attempt: u32) -> Duration {
    let base = inner.config.retry.backoff_ms(attempt) as f64;
    let jitter = inner.config.retry.jitter;
    let factor = 1.0 + rand::thread_rng().gen_range(-jitter..=jitter);
    Duration::from_millis((base * factor).max(0.0) as u64)
}

type DispatchOutcome =
    (SendReceipt, Option<RouteResolutionInfo>, Option<serde_json::Value>);

async fn dispatch(
    inner: &Arc<PartitionInner>,
    request: &DeliveryRequest,
) -> std::result::Result<DispatchOutcome, OutboundReason> {
    // Route resolution goes through the session store when the caller
    // scoped the request to a conversation.
    let (route, resolution) = resolve_route(inner, request);

    let bridge = inner
        .bridges
        .bridge(&route.bridge_id)
        .ok_or_else(|| OutboundReason::InvalidRequest(format!("unknown bridge '{}'", route.bridge_id)))?;

    if let Some(missing) = missing_capability(&bridge, request.operation) {
        return Err(OutboundReason::Adapter(missing));
    }

    let mut opts = request.payload.opts.clone();
    if opts.external_thread_id.is_none() {
        opts.external_thread_id = route.external_thread_id.clone();
    }

    let mut security = None;
    let text = match request.payload.text.as_deref() {
        Some(original)
            if matches!(request.operation, Operation::Send | Operation::Edit) =>
        {
            match bridge.sanitize_outbound(original, SANITIZE_TIMEOUT).await {
                Ok(SanitizeOutcome::Ok(clean)) => {
                    if clean != original {
                        security = Some(serde_json::json!({"sanitized": true}));
                    }
                    Some(clean)
                }
                Ok(SanitizeOutcome::Deny { reason, retryable }) => {
                    return Err(OutboundReason::SanitizeDenied { reason, retryable });
                }
                Err(failure) => return Err(OutboundReason::Adapter(failure.reason)),
            }
        }
        other => other.map(str::to_string),
    };

    let receipt = match request.operation {
        Operation::Send => {
            let text = text
                .ok_or_else(|| OutboundReason::InvalidRequest("send without text".into()))?;
            bridge
                .send_message(&route.external_room_id, &text, &opts)
                .await
                .map_err(OutboundReason::Adapter)?
        }
        Operation::Edit => {
            let external_id = request
                .payload
                .external_message_id
                .as_deref()
                .ok_or(OutboundReason::MissingExternalMessageId)?;
            let text = text
                .ok_or_else(|| OutboundReason::InvalidRequest("edit without text".into()))?;
            bridge
                .edit_message(&route.external_room_id, external_id, &text, &opts)
                .await
                .map_err(OutboundReason::Adapter)?
        }
        Operation::SendMedia => {
            if request.payload.media.is_empty() {
                return Err(OutboundReason::InvalidRequest("send_media without media".into()));
            }
            bridge
                .send_media(&route.external_room_id, &request.payload.media, &opts)
                .await
                .map_err(OutboundReason::Adapter)?
        }
        Operation::EditMedia => {
            let external_id = request
                .payload
                .external_message_id
                .as_deref()
                .ok_or(OutboundReason::MissingExternalMessageId)?;
            if request.payload.media.is_empty() {
                return Err(OutboundReason::InvalidRequest("edit_media without media".into()));
            }
            bridge
                .edit_media(&route.external_room_id, external_id, &request.payload.media, &opts)
                .await
                .map_err(OutboundReason::Adapter)?
        }
    };

    Ok((receipt, resolution, security))
}

fn resolve_route(
    inner: &Arc<PartitionInner>,
    request: &DeliveryRequest,
) -> (Route, Option<RouteResolutionInfo>) {
    let Some(session_key) = &request.session_key else {
        return (request.route.clone(), None);
    };
    let mut fallbacks = Vec::with_capacity(1 + request.fallback_routes.len());
    fallbacks.push(request.route.clone());
    fallbacks.extend(request.fallback_routes.iter().cloned());

    match inner.sessions.resolve(session_key, &fallbacks) {
        Some(resolution) => {
            let info = RouteResolutionInfo {
                source: match resolution.source {
                    RouteSource::Session => "session",
                    RouteSource::SessionStale => "session_stale",
                    RouteSource::Provided => "provided",
                },
                fallback: resolution.fallback,
                stale: resolution.stale,
                fallback_reason: resolution.fallback_reason.map(|r| match r {
                    FallbackReason::Expired => "expired",
                    FallbackReason::NotFound => "not_found",
                    FallbackReason::SessionUnavailable => "session_unavailable",
                }),
            };
            (resolution.route, Some(info))
        }
        None => (request.route.clone(), None),
    }
}

fn missing_capability(
    bridge: &crate::bridge::AdapterBridge,
    operation: Operation,
) -> Option<switchboard_core::failure::FailureReason> {
    use switchboard_core::adapter::Capability;
    use switchboard_core::failure::FailureReason;
    let required = match operation {
        Operation::Send => return None,
        Operation::Edit => Capability::MessageEdit,
        Operation::SendMedia => Capability::MediaSend,
        Operation::EditMedia => Capability::MediaEdit,
    };
    if bridge.supports(required) {
        None
    } else {
        Some(FailureReason::UnsupportedMethod { method: operation.as_str().to_string() })
    }
}

fn media_summary(request: &DeliveryRequest) -> Option<serde_json::Value> {
    if request.payload.media.is_empty() {
        return None;
    }
    Some(serde_json::json!({
        "items": request.payload.media.len(),
        "bytes": request.payload.media.iter().map(|m| m.data.len()).sum::<usize>(),
    }))
}
