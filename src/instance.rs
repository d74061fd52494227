// ABOUTME: MessagingInstance: one isolated runtime wiring every subsystem together
// ABOUTME: Many instances can coexist in a process; nothing here is global

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, Weak};

use async_trait::async_trait;

use switchboard_core::adapter::ChannelAdapter;
use switchboard_core::config::RuntimeConfig;
use switchboard_core::error::{Error, Result};
use switchboard_core::events::names;
use switchboard_core::model::{Message, MessageStatus, Role};
use switchboard_core::storage::Storage;

use crate::agent::{start_agent, AgentConfig, AgentHandle, ReplySink};
use crate::bridge::registry::{
    AdapterFactory, BridgeRegistry, CollisionPolicy, LoadRequirement,
};
use crate::bridge::AdapterBridge;
use crate::config_store::{ConfigChange, ConfigStore};
use crate::dead_letter::{DeadLetterStore, ReplayError, ReplayOpts};
use crate::dedup::DedupFilter;
use crate::ingest::{IngestOpts, IngestOutcome, IngestPipeline, PolicyPipeline};
use crate::lifecycle::{start_lifecycle, LifecycleHandle};
use crate::outbound::{BridgeSource, DeliveryResult, OutboundGateway};
use crate::room::{ReadOpts, RoomActors, RoomHub};
use crate::router::{OutboundRouter, RouteOpts, RouteOutcome};
use crate::session_route::SessionRouteStore;
use crate::supervisor::{ActorTable, Supervisor};
use crate::telemetry::Telemetry;

/// `BridgeSource` view over the instance's registry.
#[derive(Clone)]
pub struct SharedRegistry(Arc<RwLock<BridgeRegistry>>);

impl BridgeSource for SharedRegistry {
    fn bridge(&self, bridge_id: &str) -> Option<AdapterBridge> {
        self.0.read().ok()?.get(bridge_id).cloned()
    }
}

/// Options for posting an outbound message into a room.
#[derive(Debug, Clone)]
pub struct PostOpts {
    pub sender_id: String,
    pub role: Role,
    pub reply_to_id: Option<String>,
    pub route: RouteOpts,
}

impl Default for PostOpts {
    fn default() -> Self {
        Self {
            sender_id: "system".into(),
            role: Role::System,
            reply_to_id: None,
            route: RouteOpts::default(),
        }
    }
}

/// One isolated messaging runtime.
pub struct MessagingInstance {
    id: String,
    telemetry: Telemetry,
    storage: Arc<dyn Storage>,
    registry: Arc<RwLock<BridgeRegistry>>,
    sessions: Arc<SessionRouteStore>,
    rooms: Arc<RoomActors>,
    ingest: IngestPipeline,
    gateway: Arc<OutboundGateway>,
    dead_letters: Arc<DeadLetterStore>,
    router: OutboundRouter,
    config_store: Arc<ConfigStore>,
    supervisor: Arc<Supervisor>,
    agents: ActorTable<(String, String), AgentHandle>,
    lifecycles: Mutex<HashMap<String, LifecycleHandle>>,
    self_ref: Mutex<Weak<MessagingInstance>>,
}

impl MessagingInstance {
    pub fn new(
        id: impl Into<String>,
        config: RuntimeConfig,
        storage: Arc<dyn Storage>,
        policy: PolicyPipeline,
    ) -> Arc<Self> {
        let id = id.into();
        let telemetry = Telemetry::new(&id);
        let registry = Arc::new(RwLock::new(BridgeRegistry::new(
            CollisionPolicy::PreferLast,
            telemetry.clone(),
        )));
        let bridges: Arc<dyn BridgeSource> = Arc::new(SharedRegistry(Arc::clone(&registry)));

        let dedup = Arc::new(DedupFilter::new(&config.dedup));
        let sessions = Arc::new(SessionRouteStore::new(&config.session));
        SessionRouteStore::start_pruner(Arc::clone(&sessions));

        let hub = RoomHub::new();
        let rooms = Arc::new(RoomActors::new(
            config.room.clone(),
            hub,
            telemetry.clone(),
            Arc::clone(&storage),
        ));

        let dead_letters = DeadLetterStore::new(config.dead_letter.clone(), telemetry.clone());
        let gateway = OutboundGateway::new(
            config.outbound.clone(),
            Arc::clone(&bridges),
            Arc::clone(&sessions),
            Arc::clone(&dead_letters),
            telemetry.clone(),
        );
        dead_letters.start_replay_workers(Arc::clone(&gateway));

        let ingest = IngestPipeline::new(
            config.ingest.clone(),
            config.media.clone(),
            dedup,
            Arc::new(policy),
            Arc::clone(&storage),
            Arc::clone(&sessions),
            Arc::clone(&rooms),
            telemetry.clone(),
        );
        let router = OutboundRouter::new(
            Arc::clone(&storage),
            Arc::clone(&gateway),
            Arc::clone(&bridges),
            telemetry.clone(),
        );
        let config_store = ConfigStore::new(Arc::clone(&storage));
        let supervisor = Supervisor::new(config.supervisor.instance);

        let instance = Arc::new(Self {
            telemetry: telemetry.clone(),
            storage,
            registry,
            sessions,
            rooms,
            ingest,
            gateway,
            dead_letters,
            router,
            config_store,
            supervisor,
            agents: ActorTable::new(),
            lifecycles: Mutex::new(HashMap::new()),
            self_ref: Mutex::new(Weak::new()),
            id,
        });
        *instance.self_ref.lock().unwrap_or_else(|p| p.into_inner()) =
            Arc::downgrade(&instance);
        instance.spawn_reconciler();
        telemetry.emit(names::INSTANCE_STARTED, serde_json::json!({"instance": instance.id}));
        instance
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    /// Subscribe to the instance's structured signal stream.
    pub fn signals(&self) -> tokio::sync::broadcast::Receiver<switchboard_core::events::Signal> {
        self.telemetry.subscribe()
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn dead_letters(&self) -> &Arc<DeadLetterStore> {
        &self.dead_letters
    }

    pub fn config_store(&self) -> &Arc<ConfigStore> {
        &self.config_store
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub fn sessions(&self) -> &Arc<SessionRouteStore> {
        &self.sessions
    }

    pub fn gateway(&self) -> &Arc<OutboundGateway> {
        &self.gateway
    }

    // -----------------------------------------------------------------
    // Bridges
    // -----------------------------------------------------------------

    /// Install a pre-built adapter under a bridge id, and hand its
    /// listener tree to the supervisor.
    pub fn register_adapter(&self, bridge_id: &str, adapter: Arc<dyn ChannelAdapter>) {
        let bridge = AdapterBridge::new(bridge_id, Arc::clone(&adapter));
        for spec in adapter.listener_child_specs(&self.id) {
            self.supervisor.supervise(crate::supervisor::RunnableSpec::new(
                format!("{bridge_id}/{}", spec.id),
                move_spec(spec),
            ));
        }
        if let Ok(mut registry) = self.registry.write() {
            registry.install(bridge);
        }
    }

    pub fn register_adapter_factory(&self, module: &str, factory: AdapterFactory) {
        if let Ok(mut registry) = self.registry.write() {
            registry.register_factory(module, factory);
        }
    }

    pub fn load_manifest(&self, json: &str, requirement: LoadRequirement) -> Result<()> {
        let mut registry = self
            .registry
            .write()
            .map_err(|_| Error::storage("bridge registry lock poisoned"))?;
        registry.load_manifest_json(json, requirement)
    }

    pub fn finish_bootstrap(&self) {
        if let Ok(registry) = self.registry.read() {
            registry.finish_bootstrap();
        }
    }

    pub fn bridge(&self, bridge_id: &str) -> Option<AdapterBridge> {
        self.registry.read().ok()?.get(bridge_id).cloned()
    }

    // -----------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------

    /// Ingest a raw platform payload arriving on a bridge.
    pub async fn ingest_incoming(
        &self,
        bridge_id: &str,
        raw: serde_json::Value,
        opts: IngestOpts,
    ) -> Result<IngestOutcome> {
        let bridge = self
            .bridge(bridge_id)
            .ok_or_else(|| Error::not_found(format!("bridge '{bridge_id}'")))?;
        self.ingest.ingest_incoming(&bridge, raw, opts).await
    }

    // -----------------------------------------------------------------
    // Outbound
    // -----------------------------------------------------------------

    /// Create, persist and deliver an outbound message for a room. The
    /// message lands in room history and fans out before dispatch.
    pub async fn post_message(
        &self,
        room_id: &str,
        text: &str,
        opts: PostOpts,
    ) -> Result<(Message, RouteOutcome)> {
        let room = self
            .storage
            .get_room(room_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("room '{room_id}'")))?;

        let mut message = Message::new(room_id, &opts.sender_id, opts.role).with_text(text);
        message.reply_to_id = opts.reply_to_id.clone();
        self.storage.save_message(&message).await?;
        let handle = self.rooms.handle_for(&room);
        let message = handle.add_message(message).await?;

        let mut route_opts = opts.route.clone();
        route_opts.message_id = Some(message.id.clone());
        match self.router.route_outbound(room_id, text, route_opts).await {
            Ok(outcome) => {
                let mut message = message;
                if let Some(first) = outcome.delivered.first() {
                    self.storage
                        .update_message_external_id(&message.id, &first.external_message_id)
                        .await?;
                    message.external_id = Some(first.external_message_id.clone());
                }
                message.advance_status(MessageStatus::Sent);
                self.storage.save_message(&message).await?;
                Ok((message, outcome))
            }
            Err(error) => {
                let mut message = message;
                message.advance_status(MessageStatus::Failed);
                self.storage.save_message(&message).await?;
                Err(error)
            }
        }
    }

    /// Direct delivery summary for a room without creating a message
    /// record (edits, replays, diagnostics).
    pub async fn route_outbound(
        &self,
        room_id: &str,
        text: &str,
        opts: RouteOpts,
    ) -> Result<RouteOutcome> {
        self.router.route_outbound(room_id, text, opts).await
    }

    pub async fn replay_dead_letter(
        &self,
        record_id: &str,
        opts: ReplayOpts,
    ) -> std::result::Result<DeliveryResult, ReplayError> {
        self.dead_letters.replay(record_id, opts).await
    }

    // -----------------------------------------------------------------
    // Rooms
    // -----------------------------------------------------------------

    pub fn rooms(&self) -> &Arc<RoomActors> {
        &self.rooms
    }

    pub async fn room_messages(&self, room_id: &str, opts: ReadOpts) -> Result<Vec<Message>> {
        let room = self
            .storage
            .get_room(room_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("room '{room_id}'")))?;
        self.rooms.handle_for(&room).get_messages(opts).await
    }

    // -----------------------------------------------------------------
    // Agents
    // -----------------------------------------------------------------

    /// Start an agent subscribed to a room. At most one actor runs per
    /// (room, agent) pair.
    pub fn start_agent(
        &self,
        room_id: &str,
        agent_id: &str,
        config: AgentConfig,
    ) -> AgentHandle {
        let sink: Arc<dyn ReplySink> = Arc::new(InstanceReplySink {
            instance: self.self_ref.lock().unwrap_or_else(|p| p.into_inner()).clone(),
        });
        let hub = self.rooms.hub().clone();
        let telemetry = self.telemetry.clone();
        let (room_id_owned, agent_id_owned) = (room_id.to_string(), agent_id.to_string());
        self.agents.get_or_start(
            (room_id.to_string(), agent_id.to_string()),
            AgentHandle::is_alive,
            move || start_agent(room_id_owned, agent_id_owned, config, hub, telemetry, sink),
        )
    }

    pub fn stop_agent(&self, room_id: &str, agent_id: &str) {
        if let Some(handle) =
            self.agents.remove(&(room_id.to_string(), agent_id.to_string()))
        {
            handle.stop();
        }
    }

    // -----------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------

    /// Start (or return) the connection lifecycle for a bridge.
    pub fn start_bridge_lifecycle(
        &self,
        bridge_id: &str,
        config: switchboard_core::config::LifecycleConfig,
    ) -> Result<LifecycleHandle> {
        let bridge = self
            .bridge(bridge_id)
            .ok_or_else(|| Error::not_found(format!("bridge '{bridge_id}'")))?;
        let mut lifecycles = self.lifecycles.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(existing) = lifecycles.get(bridge_id) {
            if !existing.is_terminal() {
                return Ok(existing.clone());
            }
        }
        let gateway = Arc::clone(&self.gateway);
        let handle = start_lifecycle(
            bridge,
            config,
            self.telemetry.clone(),
            Some(Arc::new(move || gateway.total_depth())),
        );
        lifecycles.insert(bridge_id.to_string(), handle.clone());
        Ok(handle)
    }

    pub fn bridge_lifecycle(&self, bridge_id: &str) -> Option<LifecycleHandle> {
        self.lifecycles
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(bridge_id)
            .cloned()
    }

    // -----------------------------------------------------------------
    // Reconciliation
    // -----------------------------------------------------------------

    /// Apply control-plane writes to the live registry asynchronously.
    fn spawn_reconciler(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let mut changes = self.config_store.subscribe();
        tokio::spawn(async move {
            while let Ok(change) = changes.recv().await {
                let Some(instance) = weak.upgrade() else { return };
                match change {
                    ConfigChange::BridgeUpserted(config) => {
                        if !config.enabled {
                            if let Ok(mut registry) = instance.registry.write() {
                                registry.remove(&config.id);
                            }
                            tracing::info!(bridge_id = %config.id, "bridge disabled, removed from registry");
                        } else if let Ok(mut registry) = instance.registry.write() {
                            if let Some(bridge) = registry.get(&config.id).cloned() {
                                if !config.capabilities.is_empty() {
                                    registry.install(
                                        bridge.with_capabilities(config.capabilities.iter()),
                                    );
                                }
                            }
                        }
                    }
                    ConfigChange::BridgeDeleted(bridge_id) => {
                        if let Ok(mut registry) = instance.registry.write() {
                            registry.remove(&bridge_id);
                        }
                    }
                    ConfigChange::PolicyUpserted(_) | ConfigChange::PolicyDeleted(_) => {
                        // Policies are read per-dispatch; nothing to push
                    }
                }
            }
        });
    }
}

fn move_spec(
    spec: switchboard_core::adapter::ListenerSpec,
) -> impl Fn() -> tokio::task::JoinHandle<()> + Send + Sync + 'static {
    // Adapter listener specs are one-shot factories; rebuildable specs
    // would come from the adapter again after escalation
    let run = Mutex::new(Some(spec.run));
    move || {
        if let Some(run) = run.lock().unwrap_or_else(|p| p.into_inner()).take() {
            run()
        } else {
            tokio::spawn(async {})
        }
    }
}

struct InstanceReplySink {
    instance: Weak<MessagingInstance>,
}

#[async_trait]
impl ReplySink for InstanceReplySink {
    async fn deliver_reply(&self, message: Message) -> Result<()> {
        let instance = self
            .instance
            .upgrade()
            .ok_or_else(|| Error::storage("instance dropped"))?;
        let text = message.concatenated_text();
        let opts = PostOpts {
            sender_id: message.sender_id.clone(),
            role: message.role,
            reply_to_id: message.reply_to_id.clone(),
            route: RouteOpts::default(),
        };
        instance.post_message(&message.room_id, &text, opts).await.map(|_| ())
    }
}
