// ABOUTME: Root library module exposing the messaging runtime subsystems
// ABOUTME: Ingest, rooms, agents, outbound gateway, dead letters, lifecycle, routing

pub mod agent;
pub mod bridge;
pub mod config_store;
pub mod dead_letter;
pub mod dedup;
pub mod ingest;
pub mod instance;
pub mod lifecycle;
pub mod outbound;
pub mod room;
pub mod router;
pub mod session_route;
pub mod storage;
pub mod supervisor;
pub mod telemetry;
pub mod util;

// Re-export the domain crate for downstream convenience
pub use switchboard_core as core;

pub use agent::{AgentConfig, AgentHandle, AgentHandler, HandlerOutcome, Trigger};
pub use bridge::registry::{BridgeRegistry, CollisionPolicy, LoadRequirement};
pub use bridge::AdapterBridge;
pub use dead_letter::{DeadLetterRecord, DeadLetterStore, ReplayOpts};
pub use dedup::{DedupFilter, DedupVerdict, Fingerprint};
pub use ingest::{
    GateDecision, Gater, IngestOpts, IngestOutcome, ModerationDecision, Moderator,
    PolicyPipeline,
};
pub use instance::{MessagingInstance, PostOpts, SharedRegistry};
pub use lifecycle::{ConnectionStatus, LifecycleHandle, LifecycleSnapshot};
pub use outbound::{
    DeliveryPayload, DeliveryRequest, DeliveryResult, ErrorResponse, OutboundGateway,
    PressureLevel, SuccessResponse,
};
pub use room::{ReactionOutcome, ReadOpts, RoomEvent, RoomHandle, RoomHub};
pub use router::{OutboundRouter, RouteOpts, RouteOutcome};
pub use session_route::SessionRouteStore;
pub use storage::MemoryStorage;
pub use telemetry::Telemetry;
