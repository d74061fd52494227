// ABOUTME: Domain model and contracts for the switchboard messaging runtime
// ABOUTME: Types, adapter/storage traits, failure taxonomy, config, telemetry names

pub mod adapter;
pub mod config;
pub mod delivery;
pub mod error;
pub mod events;
pub mod failure;
pub mod model;
pub mod routing;
pub mod storage;

pub use error::{DeliveryFailure, DeliverySummary, Error, MediaViolation, PolicyStage, Result};
pub use failure::{CallbackFailure, Disposition, FailureClass, FailureReason};

// Re-export the model for convenient access
pub use model::{
    BindingDirection,
    ContentBlock,
    ExternalBinding,
    MediaKind,
    Message,
    MessageStatus,
    Participant,
    ParticipantType,
    Presence,
    Receipt,
    Role,
    Room,
    RoomBinding,
    RoomType,
};

pub use adapter::{
    AdapterResult,
    Capability,
    CapabilitySet,
    ChannelAdapter,
    ChatType,
    Incoming,
    IncomingMedia,
    ListenerSpec,
    OutboundMedia,
    SanitizeOutcome,
    SendOpts,
    SendReceipt,
    VerifyOutcome,
};

pub use delivery::{ErrorCategory, Operation, Priority, Route, SessionKey};
pub use routing::{BridgeConfig, DedupeScope, DeliveryMode, FailoverPolicy, RoutingPolicy};
pub use storage::{ParticipantAttrs, RoomAttrs, Storage};
