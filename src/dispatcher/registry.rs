//! Plugin registry
//!
//! Handles live here in load order together with the derived tool index.
//! Mutation happens under the dispatcher's write lock; health and in-flight
//! counters are atomics so the invoke path can read them without it.

use crate::error::LoadError;
use crate::plugins::{Plugin, PluginCategory, PluginMetadata};
use crate::policy::PolicyEngine;
use crate::schema::ToolDescriptor;
use crate::validator::DescriptorSchemas;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Notify, Semaphore};

/// Prefix of the origin recorded for in-process plugins
pub const BUILTIN_ORIGIN: &str = "builtin:";

static NEXT_PLUGIN_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique plugin identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct PluginId(u64);

impl PluginId {
    pub(crate) fn next() -> Self {
        Self(NEXT_PLUGIN_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PluginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "plugin-{}", self.0)
    }
}

/// Lifecycle state of a handle.
///
/// A plugin that fails to initialize never gets a handle, so there is no
/// failed state to observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginState {
    Loaded,
    Unloaded,
}

impl PluginState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => PluginState::Loaded,
            _ => PluginState::Unloaded,
        }
    }
}

/// Fault-derived health of a plugin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    Healthy,
    Degraded,
    /// Calls short-circuit to `PolicyDenied` until the plugin is reloaded
    Quarantined,
}

impl Health {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Health::Healthy,
            1 => Health::Degraded,
            _ => Health::Quarantined,
        }
    }
}

/// One registered tool with its compiled schemas
#[derive(Debug)]
pub(crate) struct Tool {
    pub descriptor: ToolDescriptor,
    pub schemas: DescriptorSchemas,
}

/// A loaded plugin owned by the dispatcher
pub(crate) struct PluginHandle {
    pub id: PluginId,
    pub origin: String,
    pub metadata: PluginMetadata,
    /// Category whose isolation rules apply
    pub category: PluginCategory,
    pub plugin: Arc<dyn Plugin>,
    pub tools: Vec<Tool>,
    pub limiter: Option<Arc<Semaphore>>,
    state: AtomicU8,
    health: AtomicU8,
    faults: AtomicU32,
    in_flight: AtomicUsize,
    idle: Notify,
}

impl fmt::Debug for PluginHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginHandle")
            .field("id", &self.id)
            .field("origin", &self.origin)
            .field("name", &self.metadata.name)
            .field("health", &self.health())
            .finish()
    }
}

impl PluginHandle {
    /// Describe the plugin and compile every descriptor.
    ///
    /// Nothing is registered here; a failure discards the plugin.
    pub fn new(
        id: PluginId,
        origin: String,
        plugin: Arc<dyn Plugin>,
        policy: &PolicyEngine,
    ) -> Result<Self, LoadError> {
        let metadata = plugin.metadata();
        let init_failed = |reason: String| LoadError::InitializationFailed {
            origin: origin.clone(),
            reason,
        };

        let descriptors = plugin
            .describe()
            .map_err(|e| init_failed(format!("describe failed: {e}")))?;

        let mut seen = HashSet::new();
        let mut tools = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            if descriptor.name.trim().is_empty() {
                return Err(init_failed("tool with an empty name".to_string()));
            }
            if !seen.insert(descriptor.name.clone()) {
                return Err(LoadError::DuplicateToolName {
                    tool: descriptor.name,
                    origin: origin.clone(),
                    existing: origin.clone(),
                });
            }
            let schemas = DescriptorSchemas::compile(&descriptor).map_err(|e| init_failed(e.to_string()))?;
            tools.push(Tool { descriptor, schemas });
        }

        let limiter = metadata
            .max_concurrency
            .map(|n| Arc::new(Semaphore::new(n.max(1))));

        Ok(Self {
            id,
            category: policy.category_for(&metadata),
            origin,
            metadata,
            plugin,
            tools,
            limiter,
            state: AtomicU8::new(PluginState::Loaded as u8),
            health: AtomicU8::new(Health::Healthy as u8),
            faults: AtomicU32::new(0),
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn is_builtin(&self) -> bool {
        self.origin.starts_with(BUILTIN_ORIGIN)
    }

    pub fn state(&self) -> PluginState {
        PluginState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: PluginState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn health(&self) -> Health {
        Health::from_u8(self.health.load(Ordering::Acquire))
    }

    pub fn faults(&self) -> u32 {
        self.faults.load(Ordering::Acquire)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Count a fault and return the resulting health.
    ///
    /// Callers hold the registry write lock.
    pub fn record_fault(&self, threshold: u32) -> Health {
        let faults = self.faults.fetch_add(1, Ordering::AcqRel) + 1;
        let health = if faults >= threshold {
            Health::Quarantined
        } else {
            Health::Degraded
        };
        self.health.store(health as u8, Ordering::Release);
        health
    }

    /// Mark one call in flight until the guard drops
    pub fn enter(self: &Arc<Self>) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        InFlightGuard {
            handle: Arc::clone(self),
        }
    }

    /// Resolve once no call is in flight
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            // Register before checking so a final release cannot be missed
            notified.as_mut().enable();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }

    pub fn info(&self) -> PluginInfo {
        PluginInfo {
            id: self.id,
            name: self.metadata.name.clone(),
            version: self.metadata.version.clone(),
            origin: self.origin.clone(),
            category: self.category,
            state: self.state(),
            health: self.health(),
            faults: self.faults(),
            in_flight: self.in_flight(),
            tools: self.tools.iter().map(|t| t.descriptor.name.clone()).collect(),
        }
    }
}

/// Keeps a plugin's in-flight count raised
#[derive(Debug)]
pub(crate) struct InFlightGuard {
    handle: Arc<PluginHandle>,
}

impl InFlightGuard {
    pub fn handle(&self) -> &Arc<PluginHandle> {
        &self.handle
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.handle.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.handle.idle.notify_waiters();
        }
    }
}

/// Snapshot of a registered plugin
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginInfo {
    pub id: PluginId,
    pub name: String,
    pub version: String,
    pub origin: String,
    pub category: PluginCategory,
    pub state: PluginState,
    pub health: Health,
    pub faults: u32,
    pub in_flight: usize,
    pub tools: Vec<String>,
}

/// How `unload_plugin` treats calls still running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnloadMode {
    /// Remove the plugin now and wait for its running calls to finish
    #[default]
    Wait,
    /// Refuse with `StillInFlight` while calls are running
    NoWait,
}

#[derive(Debug, Default)]
pub(crate) struct Registry {
    plugins: Vec<Arc<PluginHandle>>,
    tools: HashMap<String, (Arc<PluginHandle>, usize)>,
}

impl Registry {
    pub fn resolve(&self, tool: &str) -> Option<(&Arc<PluginHandle>, usize)> {
        self.tools.get(tool).map(|(handle, index)| (handle, *index))
    }

    pub fn get(&self, id: PluginId) -> Option<&Arc<PluginHandle>> {
        self.plugins.iter().find(|h| h.id == id)
    }

    pub fn handles(&self) -> &[Arc<PluginHandle>] {
        &self.plugins
    }

    fn check_names(&self, handle: &PluginHandle, replacing: Option<PluginId>) -> Result<(), LoadError> {
        for tool in &handle.tools {
            if let Some((existing, _)) = self.tools.get(&tool.descriptor.name) {
                if Some(existing.id) != replacing {
                    return Err(LoadError::DuplicateToolName {
                        tool: tool.descriptor.name.clone(),
                        origin: handle.origin.clone(),
                        existing: existing.origin.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    fn index_tools(&mut self, handle: &Arc<PluginHandle>) {
        for (index, tool) in handle.tools.iter().enumerate() {
            self.tools
                .insert(tool.descriptor.name.clone(), (Arc::clone(handle), index));
        }
    }

    fn unindex_tools(&mut self, handle: &PluginHandle) {
        for tool in &handle.tools {
            self.tools.remove(&tool.descriptor.name);
        }
    }

    /// Register every tool of `handle` or none of them
    pub fn insert(&mut self, handle: Arc<PluginHandle>) -> Result<(), LoadError> {
        self.check_names(&handle, None)?;
        self.index_tools(&handle);
        self.plugins.push(handle);
        Ok(())
    }

    /// Swap in a fresh handle at the old one's position.
    ///
    /// Returns the replaced handle, or `None` if `fresh.id` is unknown.
    pub fn replace(
        &mut self,
        fresh: Arc<PluginHandle>,
    ) -> Result<Option<Arc<PluginHandle>>, LoadError> {
        let Some(position) = self.plugins.iter().position(|h| h.id == fresh.id) else {
            return Ok(None);
        };
        self.check_names(&fresh, Some(fresh.id))?;

        let old = std::mem::replace(&mut self.plugins[position], Arc::clone(&fresh));
        self.unindex_tools(&old);
        self.index_tools(&fresh);
        Ok(Some(old))
    }

    pub fn remove(&mut self, id: PluginId) -> Option<Arc<PluginHandle>> {
        let position = self.plugins.iter().position(|h| h.id == id)?;
        let handle = self.plugins.remove(position);
        self.unindex_tools(&handle);
        Some(handle)
    }

    /// Descriptors in load order, then declaration order
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.plugins
            .iter()
            .flat_map(|h| h.tools.iter().map(|t| t.descriptor.clone()))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}
