// ABOUTME: Outbound route resolution and dispatch for a room
// ABOUTME: Bindings + bridge configs + routing policy decide which bridges carry a send

use std::sync::Arc;

use futures_util::future::join_all;

use switchboard_core::delivery::{Operation, Priority, Route, SessionKey};
use switchboard_core::error::{DeliveryFailure, DeliverySummary, Error, Result};
use switchboard_core::events::names;
use switchboard_core::routing::{
    BridgeConfig, DedupeScope, DeliveryMode, FailoverPolicy, RoutingPolicy,
};
use switchboard_core::storage::Storage;

use crate::outbound::{
    BridgeSource, DeliveryPayload, DeliveryRequest, OutboundGateway, SuccessResponse,
};
use crate::telemetry::Telemetry;

/// Per-call options for `route_outbound`.
#[derive(Debug, Clone, Default)]
pub struct RouteOpts {
    /// Internal message id this delivery carries; also the idempotency
    /// base. Generated when absent.
    pub message_id: Option<String>,
    pub idempotency_key: Option<String>,
    /// Pin delivery to one bridge, overriding binding and policy order.
    pub forced_bridge_id: Option<String>,
    pub priority: Priority,
    /// Post into a platform thread when the route supports it.
    pub external_thread_id: Option<String>,
    /// Chunk text to this many bytes per send, overriding whatever limit
    /// the route's adapter advertises via `max_message_length`.
    pub chunk_size: Option<usize>,
}

/// What one delivered route reported back. `external_message_id`,
/// `idempotent` and `pressure` come from the first chunk; `attempts` sums
/// over chunks.
#[derive(Debug, Clone)]
pub struct RouteDelivery {
    pub bridge_id: String,
    pub external_room_id: String,
    pub external_message_id: String,
    pub attempts: u32,
    pub idempotent: bool,
    pub chunks: usize,
}

/// Full outcome of `route_outbound`.
#[derive(Debug, Clone)]
pub struct RouteOutcome {
    pub room_id: String,
    pub policy: RoutingPolicy,
    pub attempted: usize,
    pub delivered: Vec<RouteDelivery>,
    pub failed: Vec<DeliveryFailure>,
}

/// Resolves outbound targets for a room and dispatches through the
/// gateway, honoring the room's routing policy.
pub struct OutboundRouter {
    storage: Arc<dyn Storage>,
    gateway: Arc<OutboundGateway>,
    bridges: Arc<dyn BridgeSource>,
    telemetry: Telemetry,
}

struct Candidate {
    bridge_id: String,
    channel: String,
    external_room_id: String,
}

impl OutboundRouter {
    pub fn new(
        storage: Arc<dyn Storage>,
        gateway: Arc<OutboundGateway>,
        bridges: Arc<dyn BridgeSource>,
        telemetry: Telemetry,
    ) -> Self {
        Self { storage, gateway, bridges, telemetry }
    }

    /// Route a text send to every eligible binding of a room.
    pub async fn route_outbound(
        &self,
        room_id: &str,
        text: &str,
        opts: RouteOpts,
    ) -> Result<RouteOutcome> {
        let bindings: Vec<_> = self
            .storage
            .list_room_bindings(room_id)
            .await?
            .into_iter()
            .filter(|b| b.enabled && b.direction.allows_outbound())
            .collect();
        if bindings.is_empty() {
            return Err(Error::NoRoutes);
        }

        let mut configs: Vec<BridgeConfig> = self
            .storage
            .list_bridge_configs()
            .await?
            .into_iter()
            .filter(|c| c.enabled)
            .collect();
        configs.sort_by(|a, b| a.id.cmp(&b.id));

        let policy = self
            .storage
            .get_routing_policy(room_id)
            .await?
            .unwrap_or_else(|| RoutingPolicy::new(room_id));

        // Resolve a bridge per binding, then order by the policy's
        // fallback chain.
        let mut candidates = Vec::new();
        for binding in &bindings {
            let Some(bridge_id) =
                self.resolve_bridge(&opts.forced_bridge_id, &binding.bridge_id, &policy, &configs, &binding.channel)
            else {
                continue;
            };
            candidates.push(Candidate {
                bridge_id,
                channel: binding.channel.clone(),
                external_room_id: binding.external_room_id.clone(),
            });
        }
        if candidates.is_empty() {
            return Err(Error::NoRoutes);
        }
        order_by_fallback(&mut candidates, &policy.fallback_order);

        let message_id =
            opts.message_id.clone().unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let dedupe_base = dedupe_key_base(&policy, room_id, &message_id, &opts);
        let multi_route = candidates.len() > 1;
        let chunked: Vec<Vec<DeliveryRequest>> = candidates
            .iter()
            .map(|candidate| {
                self.build_requests(&message_id, &dedupe_base, candidate, text, &opts, multi_route)
            })
            .collect();

        let mut outcome = RouteOutcome {
            room_id: room_id.to_string(),
            policy: policy.clone(),
            attempted: 0,
            delivered: Vec::new(),
            failed: Vec::new(),
        };

        match policy.delivery_mode {
            DeliveryMode::Broadcast => {
                outcome.attempted = candidates.len();
                let results = join_all(
                    candidates
                        .iter()
                        .zip(chunked)
                        .map(|(candidate, requests)| self.deliver_candidate(candidate, requests)),
                )
                .await;
                for result in results {
                    match result {
                        Ok(delivery) => outcome.delivered.push(delivery),
                        Err(failure) => outcome.failed.push(failure),
                    }
                }
            }
            DeliveryMode::BestEffort | DeliveryMode::Primary => {
                for (candidate, requests) in candidates.iter().zip(chunked) {
                    outcome.attempted += 1;
                    match self.deliver_candidate(candidate, requests).await {
                        Ok(delivery) => {
                            outcome.delivered.push(delivery);
                            break;
                        }
                        Err(failure) => {
                            outcome.failed.push(failure);
                            match policy.failover_policy {
                                FailoverPolicy::NextAvailable | FailoverPolicy::Broadcast => {}
                                FailoverPolicy::None => break,
                            }
                        }
                    }
                }
            }
        }

        if outcome.delivered.is_empty() {
            self.telemetry.emit_correlated(
                names::MESSAGE_FAILED,
                Some(room_id),
                &message_id,
                serde_json::json!({"attempted": outcome.attempted}),
            );
            return Err(Error::DeliveryFailed(summarize(&outcome)));
        }
        Ok(outcome)
    }

    /// Spec'd resolution chain: forced bridge, the binding's own bridge,
    /// the policy fallback order, then the first enabled config whose
    /// channel matches (configs pre-sorted by id for determinism).
    fn resolve_bridge(
        &self,
        forced: &Option<String>,
        binding_bridge: &str,
        policy: &RoutingPolicy,
        configs: &[BridgeConfig],
        channel: &str,
    ) -> Option<String> {
        let enabled = |id: &str| configs.iter().any(|c| c.id == id);
        if let Some(forced) = forced {
            if enabled(forced) {
                return Some(forced.clone());
            }
        }
        if enabled(binding_bridge) {
            return Some(binding_bridge.to_string());
        }
        for fallback in &policy.fallback_order {
            if enabled(fallback) {
                return Some(fallback.clone());
            }
        }
        configs
            .iter()
            .find(|c| {
                self.bridges
                    .bridge(&c.id)
                    .map(|b| b.channel_type() == channel)
                    .unwrap_or(false)
            })
            .map(|c| c.id.clone())
    }

    /// One delivery request per chunk for a candidate. A caller-supplied
    /// `chunk_size` overrides the limit the candidate's adapter advertises
    /// through `max_message_length`; with neither, the payload goes out
    /// whole. Chunks share the candidate's routing key, so partition FIFO
    /// keeps them in order; the first chunk carries the dedupe key and
    /// later chunks suffix `:chunk:<n>`.
    #[allow(clippy::too_many_arguments)]
    fn build_requests(
        &self,
        message_id: &str,
        dedupe_base: &str,
        candidate: &Candidate,
        text: &str,
        opts: &RouteOpts,
        multi_route: bool,
    ) -> Vec<DeliveryRequest> {
        let limit = opts.chunk_size.or_else(|| {
            self.bridges
                .bridge(&candidate.bridge_id)
                .and_then(|bridge| bridge.max_message_length())
        });
        let chunks = match limit {
            Some(max) => crate::util::chunk_text(text, max),
            None => vec![text.to_string()],
        };

        let base_key = if multi_route {
            format!("{dedupe_base}:{}", candidate.bridge_id)
        } else {
            dedupe_base.to_string()
        };
        let mut session_key = SessionKey::new(
            &candidate.channel,
            &candidate.bridge_id,
            &candidate.external_room_id,
        );
        if let Some(thread) = &opts.external_thread_id {
            session_key = session_key.with_thread(thread);
        }
        let mut route = Route::new(&candidate.bridge_id, &candidate.external_room_id);
        route.external_thread_id = opts.external_thread_id.clone();

        chunks
            .into_iter()
            .enumerate()
            .map(|(index, chunk)| {
                let idempotency_key = if index == 0 {
                    base_key.clone()
                } else {
                    format!("{base_key}:chunk:{index}")
                };
                DeliveryRequest {
                    message_id: message_id.to_string(),
                    idempotency_key,
                    route: route.clone(),
                    operation: Operation::Send,
                    payload: DeliveryPayload::text(chunk),
                    priority: opts.priority,
                    session_key: Some(session_key.clone()),
                    fallback_routes: Vec::new(),
                    metadata: serde_json::Value::Null,
                }
            })
            .collect()
    }

    /// Send every chunk of a candidate, in order. The candidate counts as
    /// delivered only when all of its chunks were accepted; the first
    /// failing chunk fails the whole candidate.
    async fn deliver_candidate(
        &self,
        candidate: &Candidate,
        requests: Vec<DeliveryRequest>,
    ) -> std::result::Result<RouteDelivery, DeliveryFailure> {
        let chunks = requests.len();
        let mut first: Option<SuccessResponse> = None;
        let mut attempts = 0;
        for (index, request) in requests.into_iter().enumerate() {
            match self.gateway.enqueue(request).await {
                Ok(response) => {
                    attempts += response.attempts;
                    if first.is_none() {
                        first = Some(response);
                    }
                }
                Err(error) => {
                    let reason = if chunks > 1 {
                        format!("chunk {index}: {}", error.reason.describe())
                    } else {
                        error.reason.describe()
                    };
                    return Err(DeliveryFailure {
                        bridge_id: candidate.bridge_id.clone(),
                        reason,
                    });
                }
            }
        }
        let Some(first) = first else {
            return Err(DeliveryFailure {
                bridge_id: candidate.bridge_id.clone(),
                reason: "empty payload".into(),
            });
        };
        Ok(RouteDelivery {
            bridge_id: candidate.bridge_id.clone(),
            external_room_id: candidate.external_room_id.clone(),
            external_message_id: first.message_id,
            attempts,
            idempotent: first.idempotent,
            chunks,
        })
    }
}

/// The policy's dedupe scope picks the idempotency-key base: per message
/// (default), per thread, or one send per room.
fn dedupe_key_base(
    policy: &RoutingPolicy,
    room_id: &str,
    message_id: &str,
    opts: &RouteOpts,
) -> String {
    if let Some(explicit) = &opts.idempotency_key {
        return explicit.clone();
    }
    match policy.dedupe_scope {
        DedupeScope::MessageId => message_id.to_string(),
        DedupeScope::Thread => opts
            .external_thread_id
            .clone()
            .map(|thread| format!("thread:{thread}"))
            .unwrap_or_else(|| message_id.to_string()),
        DedupeScope::Room => format!("room:{room_id}"),
    }
}

fn summarize(outcome: &RouteOutcome) -> DeliverySummary {
    DeliverySummary {
        room_id: outcome.room_id.clone(),
        attempted: outcome.attempted,
        delivered: outcome.delivered.iter().map(|d| d.bridge_id.clone()).collect(),
        failed: outcome.failed.clone(),
    }
}

/// Bridges named in `fallback_order` come first, in order; the rest keep
/// their relative position after them.
fn order_by_fallback(candidates: &mut [Candidate], fallback_order: &[String]) {
    let rank = |bridge_id: &str| {
        fallback_order
            .iter()
            .position(|id| id == bridge_id)
            .unwrap_or(fallback_order.len())
    };
    candidates.sort_by_key(|c| rank(&c.bridge_id));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_ordering() {
        let mut candidates = vec![
            Candidate { bridge_id: "c".into(), channel: "x".into(), external_room_id: "1".into() },
            Candidate { bridge_id: "a".into(), channel: "x".into(), external_room_id: "2".into() },
            Candidate { bridge_id: "b".into(), channel: "x".into(), external_room_id: "3".into() },
        ];
        order_by_fallback(&mut candidates, &["b".to_string(), "a".to_string()]);
        let order: Vec<&str> = candidates.iter().map(|c| c.bridge_id.as_str()).collect();
        assert_eq!(order, vec!["b", "a", "c"]);
    }
}
