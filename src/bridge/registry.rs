// ABOUTME: Manifest-driven, id-addressed catalog of adapter bridges
// ABOUTME: Required bridges fail bootstrap; optional failures become diagnostics

use std::collections::HashMap;
use std::sync::Arc;

use regex::Regex;
use serde::Deserialize;

use switchboard_core::adapter::{Capability, ChannelAdapter};
use switchboard_core::error::{Error, Result};
use switchboard_core::events::names;

use crate::bridge::AdapterBridge;
use crate::telemetry::Telemetry;

const MANIFEST_VERSION: u32 = 1;

/// Bridge manifest, one per adapter binding.
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeManifest {
    pub manifest_version: u32,
    pub id: String,
    pub adapter_module: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub capabilities: Option<Vec<String>>,
    /// Auxiliary adapter modules keyed by kind, resolved lazily by
    /// whoever consumes them.
    #[serde(default)]
    pub adapters: HashMap<String, String>,
}

/// Constructor for a named adapter module. Factories receive the manifest
/// so credentials/opts can flow into construction.
pub type AdapterFactory =
    Arc<dyn Fn(&BridgeManifest) -> anyhow::Result<Arc<dyn ChannelAdapter>> + Send + Sync>;

/// How two manifests claiming the same bridge id are resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollisionPolicy {
    PreferFirst,
    PreferLast,
}

/// Whether a manifest's bridge must load for the instance to start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadRequirement {
    Required,
    Optional,
}

/// A non-fatal problem recorded while loading manifests.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub bridge_id: String,
    pub detail: String,
}

/// One loaded bridge plus its manifest bookkeeping.
#[derive(Clone)]
pub struct RegistryEntry {
    pub bridge: AdapterBridge,
    pub label: Option<String>,
    pub sub_adapters: HashMap<String, String>,
}

/// Process-wide keyed catalog of adapter bridges for one instance.
pub struct BridgeRegistry {
    factories: HashMap<String, AdapterFactory>,
    entries: HashMap<String, RegistryEntry>,
    collision_policy: CollisionPolicy,
    diagnostics: Vec<Diagnostic>,
    id_pattern: Regex,
    telemetry: Telemetry,
}

impl BridgeRegistry {
    pub fn new(collision_policy: CollisionPolicy, telemetry: Telemetry) -> Self {
        Self {
            factories: HashMap::new(),
            entries: HashMap::new(),
            collision_policy,
            diagnostics: Vec::new(),
            // Bridge ids are lowercase slugs; anything else is a manifest bug
            id_pattern: Regex::new(r"^[a-z0-9][a-z0-9_-]*$").expect("static pattern"),
            telemetry,
        }
    }

    /// Register a named adapter constructor. Manifests resolve
    /// `adapter_module` against this table.
    pub fn register_factory(&mut self, module: impl Into<String>, factory: AdapterFactory) {
        self.factories.insert(module.into(), factory);
    }

    /// Load one manifest from JSON text.
    pub fn load_manifest_json(
        &mut self,
        json: &str,
        requirement: LoadRequirement,
    ) -> Result<()> {
        let manifest: BridgeManifest = serde_json::from_str(json)
            .map_err(|e| Error::Storage(format!("manifest parse error: {e}")))?;
        self.load_manifest(manifest, requirement)
    }

    /// Load a parsed manifest. Required failures abort; optional failures
    /// are recorded as diagnostics and loading continues.
    pub fn load_manifest(
        &mut self,
        manifest: BridgeManifest,
        requirement: LoadRequirement,
    ) -> Result<()> {
        let outcome = self.try_load(&manifest);
        self.telemetry.emit(
            names::MANIFEST_LOAD,
            serde_json::json!({
                "id": manifest.id,
                "adapter_module": manifest.adapter_module,
                "ok": outcome.is_ok(),
            }),
        );
        match outcome {
            Ok(loaded) => {
                if !loaded {
                    // Collision resolved against this manifest
                    self.diagnostics.push(Diagnostic {
                        bridge_id: manifest.id.clone(),
                        detail: format!(
                            "manifest for '{}' lost id collision ({:?})",
                            manifest.id, self.collision_policy
                        ),
                    });
                }
                Ok(())
            }
            Err(detail) => match requirement {
                LoadRequirement::Required => {
                    tracing::error!(bridge_id = %manifest.id, %detail, "required bridge failed to load");
                    Err(Error::Storage(format!(
                        "required bridge '{}' failed to load: {detail}",
                        manifest.id
                    )))
                }
                LoadRequirement::Optional => {
                    tracing::warn!(bridge_id = %manifest.id, %detail, "optional bridge failed to load");
                    self.diagnostics.push(Diagnostic { bridge_id: manifest.id, detail });
                    Ok(())
                }
            },
        }
    }

    /// Returns Ok(true) when the bridge was installed, Ok(false) when a
    /// collision kept the existing entry, Err(detail) on load failure.
    fn try_load(&mut self, manifest: &BridgeManifest) -> std::result::Result<bool, String> {
        if manifest.manifest_version != MANIFEST_VERSION {
            return Err(format!(
                "unsupported manifest_version {}",
                manifest.manifest_version
            ));
        }
        if !self.id_pattern.is_match(&manifest.id) {
            return Err(format!("invalid bridge id '{}'", manifest.id));
        }
        if self.entries.contains_key(&manifest.id)
            && self.collision_policy == CollisionPolicy::PreferFirst
        {
            return Ok(false);
        }

        let factory = self
            .factories
            .get(&manifest.adapter_module)
            .ok_or_else(|| format!("unknown adapter module '{}'", manifest.adapter_module))?;
        let adapter = factory(manifest).map_err(|e| format!("adapter construction failed: {e}"))?;

        let mut bridge = AdapterBridge::new(&manifest.id, adapter);
        if let Some(declared) = &manifest.capabilities {
            let mut parsed = Vec::with_capacity(declared.len());
            for raw in declared {
                match Capability::parse(raw) {
                    Some(c) => parsed.push(c),
                    None => return Err(format!("unknown capability '{raw}'")),
                }
            }
            bridge = bridge.with_capabilities(parsed);
        }

        if self.entries.contains_key(&manifest.id) {
            // PreferLast: record the replaced entry as the loser
            self.diagnostics.push(Diagnostic {
                bridge_id: manifest.id.clone(),
                detail: format!("manifest for '{}' replaced an earlier entry", manifest.id),
            });
        }
        self.entries.insert(
            manifest.id.clone(),
            RegistryEntry {
                bridge,
                label: manifest.label.clone(),
                sub_adapters: manifest.adapters.clone(),
            },
        );
        Ok(true)
    }

    /// Finish bootstrap: emit the summary event and log diagnostics.
    pub fn finish_bootstrap(&self) {
        self.telemetry.emit(
            names::REGISTRY_BOOTSTRAP,
            serde_json::json!({
                "bridges": self.entries.len(),
                "diagnostics": self.diagnostics.len(),
            }),
        );
        for diag in &self.diagnostics {
            tracing::warn!(bridge_id = %diag.bridge_id, detail = %diag.detail, "bridge diagnostic");
        }
    }

    /// O(1) lookup. Missing ids are `None`.
    pub fn get(&self, bridge_id: &str) -> Option<&AdapterBridge> {
        self.entries.get(bridge_id).map(|e| &e.bridge)
    }

    /// Lookup that fails on missing ids.
    pub fn get_required(&self, bridge_id: &str) -> Result<&AdapterBridge> {
        self.get(bridge_id)
            .ok_or_else(|| Error::not_found(format!("bridge '{bridge_id}'")))
    }

    pub fn entry(&self, bridge_id: &str) -> Option<&RegistryEntry> {
        self.entries.get(bridge_id)
    }

    pub fn bridge_ids(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    /// Drop a bridge from the catalog (config-plane disable/delete).
    pub fn remove(&mut self, bridge_id: &str) -> Option<RegistryEntry> {
        self.entries.remove(bridge_id)
    }

    /// Install a pre-built bridge directly (tests, embedders).
    pub fn install(&mut self, bridge: AdapterBridge) {
        self.entries.insert(
            bridge.bridge_id().to_string(),
            RegistryEntry { bridge, label: None, sub_adapters: HashMap::new() },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use switchboard_core::adapter::{Incoming, SendOpts, SendReceipt};
    use switchboard_core::failure::FailureReason;

    struct NullAdapter {
        channel: &'static str,
    }

    #[async_trait]
    impl ChannelAdapter for NullAdapter {
        fn channel_type(&self) -> &str {
            self.channel
        }

        fn transform_incoming(
            &self,
            _raw: serde_json::Value,
        ) -> std::result::Result<Incoming, FailureReason> {
            Ok(Incoming { external_room_id: "r".into(), ..Default::default() })
        }

        async fn send_message(
            &self,
            _room: &str,
            _text: &str,
            _opts: &SendOpts,
        ) -> std::result::Result<SendReceipt, FailureReason> {
            Ok(SendReceipt::new("m"))
        }
    }

    fn registry(policy: CollisionPolicy) -> BridgeRegistry {
        let mut registry = BridgeRegistry::new(policy, Telemetry::new("test"));
        registry.register_factory(
            "null",
            Arc::new(|_m: &BridgeManifest| {
                Ok(Arc::new(NullAdapter { channel: "null" }) as Arc<dyn ChannelAdapter>)
            }),
        );
        registry
    }

    fn manifest(id: &str) -> String {
        format!(r#"{{"manifest_version": 1, "id": "{id}", "adapter_module": "null"}}"#)
    }

    #[test]
    fn test_load_and_lookup() {
        let mut r = registry(CollisionPolicy::PreferFirst);
        r.load_manifest_json(&manifest("tg-main"), LoadRequirement::Required).unwrap();
        assert!(r.get("tg-main").is_some());
        assert!(r.get("absent").is_none());
        assert!(r.get_required("absent").is_err());
        assert_eq!(r.len(), 1);
    }

    #[test]
    fn test_required_unknown_module_is_fatal() {
        let mut r = registry(CollisionPolicy::PreferFirst);
        let bad = r#"{"manifest_version": 1, "id": "x1", "adapter_module": "missing"}"#;
        assert!(r.load_manifest_json(bad, LoadRequirement::Required).is_err());
        assert!(r.is_empty());
    }

    #[test]
    fn test_optional_failure_records_diagnostic() {
        let mut r = registry(CollisionPolicy::PreferFirst);
        let bad = r#"{"manifest_version": 1, "id": "x1", "adapter_module": "missing"}"#;
        r.load_manifest_json(bad, LoadRequirement::Optional).unwrap();
        assert!(r.is_empty());
        assert_eq!(r.diagnostics().len(), 1);
        assert_eq!(r.diagnostics()[0].bridge_id, "x1");
    }

    #[test]
    fn test_collision_prefer_first_keeps_original() {
        let mut r = registry(CollisionPolicy::PreferFirst);
        r.load_manifest_json(&manifest("dup"), LoadRequirement::Required).unwrap();
        r.load_manifest_json(&manifest("dup"), LoadRequirement::Required).unwrap();
        assert_eq!(r.len(), 1);
        assert_eq!(r.diagnostics().len(), 1, "loser recorded");
    }

    #[test]
    fn test_collision_prefer_last_replaces() {
        let mut r = registry(CollisionPolicy::PreferLast);
        r.load_manifest_json(&manifest("dup"), LoadRequirement::Required).unwrap();
        r.load_manifest_json(&manifest("dup"), LoadRequirement::Required).unwrap();
        assert_eq!(r.len(), 1);
        assert_eq!(r.diagnostics().len(), 1);
    }

    #[test]
    fn test_bad_manifest_version_rejected() {
        let mut r = registry(CollisionPolicy::PreferFirst);
        let bad = r#"{"manifest_version": 2, "id": "x1", "adapter_module": "null"}"#;
        assert!(r.load_manifest_json(bad, LoadRequirement::Required).is_err());
    }

    #[test]
    fn test_invalid_id_rejected() {
        let mut r = registry(CollisionPolicy::PreferFirst);
        let bad = r#"{"manifest_version": 1, "id": "Bad Id!", "adapter_module": "null"}"#;
        assert!(r.load_manifest_json(bad, LoadRequirement::Required).is_err());
    }

    #[test]
    fn test_declared_capabilities_applied() {
        let mut r = registry(CollisionPolicy::PreferFirst);
        let json = r#"{"manifest_version": 1, "id": "caps", "adapter_module": "null",
                       "capabilities": ["reactions", "threads"]}"#;
        r.load_manifest_json(json, LoadRequirement::Required).unwrap();
        let bridge = r.get("caps").unwrap();
        assert!(bridge.supports(Capability::Reactions));
        assert!(bridge.supports(Capability::Threads));
        assert!(bridge.supports(Capability::Text));
    }

    #[test]
    fn test_unknown_capability_string_rejected() {
        let mut r = registry(CollisionPolicy::PreferFirst);
        let json = r#"{"manifest_version": 1, "id": "caps", "adapter_module": "null",
                       "capabilities": ["levitation"]}"#;
        assert!(r.load_manifest_json(json, LoadRequirement::Required).is_err());
    }
}
