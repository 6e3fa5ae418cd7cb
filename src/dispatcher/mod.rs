//! Dispatcher
//!
//! Owns the plugin registry and turns an [`InvocationEnvelope`] into exactly
//! one [`InvocationResult`]: resolve, check health, validate, apply the
//! isolation policy, then run the plugin under a deadline and a child
//! cancellation token.
//!
//! A plugin that overruns its deadline or is cancelled gets the grace
//! period to wind down; after that the caller gets its answer and the
//! plugin task is left to finish on its own. It keeps its `Arc` to the
//! plugin, so nothing is unloaded underneath it.

mod registry;

pub use registry::{Health, PluginId, PluginInfo, PluginState, UnloadMode, BUILTIN_ORIGIN};

use crate::config::{DispatcherConfig, HostConfig, PluginConfig};
use crate::envelope::{CorrelationId, FailureKind, InvocationEnvelope, InvocationResult};
use crate::error::{ConfigError, LoadError, ToolhostError, UnloadError};
use crate::logging::AuditLogger;
use crate::plugins::abi::panic_message;
use crate::plugins::{Plugin, PluginLoader};
use crate::policy::PolicyEngine;
use crate::schema::ToolDescriptor;
use crate::validator::normalize_arguments;
use parking_lot::{Mutex, RwLock};
use registry::{InFlightGuard, PluginHandle, Registry};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Central runtime routing tool calls to plugins
pub struct Dispatcher {
    config: DispatcherConfig,
    policy: PolicyEngine,
    loader: PluginLoader,
    registry: RwLock<Registry>,
    /// Child tokens of running calls, by correlation id
    active: Mutex<HashMap<CorrelationId, CancellationToken>>,
    audit: Option<Mutex<AuditLogger>>,
}

/// Removes a correlation id from the active set when the call ends
struct ActiveCall<'a> {
    active: &'a Mutex<HashMap<CorrelationId, CancellationToken>>,
    id: CorrelationId,
}

impl Drop for ActiveCall<'_> {
    fn drop(&mut self) {
        self.active.lock().remove(&self.id);
    }
}

impl Dispatcher {
    /// Create a dispatcher with no plugins
    pub fn new(config: DispatcherConfig, policy: PolicyEngine) -> Self {
        Self {
            config,
            policy,
            loader: PluginLoader::new(),
            registry: RwLock::new(Registry::default()),
            active: Mutex::new(HashMap::new()),
            audit: None,
        }
    }

    /// Build a dispatcher from the host configuration
    pub fn from_config(config: &HostConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let policy = PolicyEngine::from_config(&config.policy)?;
        let mut dispatcher = Self::new(config.dispatcher.clone(), policy);
        if config.audit.enabled {
            dispatcher = dispatcher.with_audit_logger(AuditLogger::new(config.audit.clone()));
        }
        Ok(dispatcher)
    }

    pub fn with_audit_logger(mut self, logger: AuditLogger) -> Self {
        self.audit = Some(Mutex::new(logger));
        self
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    // ---- registration ----

    /// Register an in-process plugin
    pub fn register_plugin(&self, plugin: Arc<dyn Plugin>) -> Result<PluginId, LoadError> {
        let origin = format!("{}{}", BUILTIN_ORIGIN, plugin.metadata().name);
        self.register(plugin, origin)
    }

    /// Load a plugin library and register its tools
    pub fn load_plugin(&self, origin: impl AsRef<Path>) -> Result<PluginId, LoadError> {
        let origin = origin.as_ref();
        let plugin = self.loader.load(origin)?;
        self.register(Arc::new(plugin), origin.display().to_string())
    }

    /// Load every library selected by the plugin configuration.
    ///
    /// A failing library is logged and reported; the others still load.
    pub fn load_configured(
        &self,
        config: &PluginConfig,
    ) -> Vec<(PathBuf, Result<PluginId, LoadError>)> {
        self.loader
            .discover(config)
            .into_iter()
            .map(|path| {
                let result = self.load_plugin(&path);
                if let Err(e) = &result {
                    warn!("Failed to load plugin {:?}: {}", path, e);
                }
                (path, result)
            })
            .collect()
    }

    fn register(&self, plugin: Arc<dyn Plugin>, origin: String) -> Result<PluginId, LoadError> {
        let handle = Arc::new(PluginHandle::new(PluginId::next(), origin, plugin, &self.policy)?);
        self.registry.write().insert(Arc::clone(&handle))?;

        info!(
            "Registered plugin '{}' ({}) from {} with {} tool(s)",
            handle.name(),
            handle.id,
            handle.origin,
            handle.tools.len()
        );
        if let Some(audit) = &self.audit {
            let tools: Vec<String> = handle.tools.iter().map(|t| t.descriptor.name.clone()).collect();
            audit.lock().log_load(handle.name(), &handle.origin, &tools);
        }
        Ok(handle.id)
    }

    /// Remove a plugin from the registry.
    ///
    /// The plugin's tools stop resolving immediately. With
    /// [`UnloadMode::Wait`] this resolves once its running calls finish;
    /// with [`UnloadMode::NoWait`] a plugin with running calls is left in
    /// place and `StillInFlight` is returned.
    pub async fn unload_plugin(&self, id: PluginId, mode: UnloadMode) -> Result<(), UnloadError> {
        let handle = {
            let mut registry = self.registry.write();
            let handle = registry
                .get(id)
                .cloned()
                .ok_or(UnloadError::UnknownPlugin(id))?;

            // Calls only enter under the read lock, so this count is exact
            let in_flight = handle.in_flight();
            if in_flight > 0 && mode == UnloadMode::NoWait {
                return Err(UnloadError::StillInFlight { id, in_flight });
            }
            registry.remove(id);
            handle
        };

        if handle.in_flight() > 0 {
            debug!(
                "Waiting for {} call(s) to '{}' before unloading",
                handle.in_flight(),
                handle.name()
            );
        }
        handle.wait_idle().await;
        handle.set_state(PluginState::Unloaded);

        info!("Unloaded plugin '{}' ({})", handle.name(), id);
        if let Some(audit) = &self.audit {
            audit.lock().log_unload(handle.name());
        }
        Ok(())
    }

    /// Re-create a plugin from its origin, clearing faults and quarantine.
    ///
    /// Calls already running on the old instance finish there.
    pub fn reload_plugin(&self, id: PluginId) -> Result<(), ToolhostError> {
        let old = self
            .registry
            .read()
            .get(id)
            .cloned()
            .ok_or(UnloadError::UnknownPlugin(id))?;

        let plugin: Arc<dyn Plugin> = if old.is_builtin() {
            Arc::clone(&old.plugin)
        } else {
            Arc::new(self.loader.load(Path::new(&old.origin))?)
        };
        let fresh = Arc::new(PluginHandle::new(id, old.origin.clone(), plugin, &self.policy)?);

        let replaced = self.registry.write().replace(fresh)?;
        match replaced {
            Some(old) => {
                old.set_state(PluginState::Unloaded);
                info!("Reloaded plugin '{}' ({})", old.name(), id);
                Ok(())
            }
            None => Err(UnloadError::UnknownPlugin(id).into()),
        }
    }

    // ---- queries ----

    /// Every registered tool: load order, then declaration order
    pub fn list_tools(&self) -> Vec<ToolDescriptor> {
        self.registry.read().descriptors()
    }

    /// Snapshots of every registered plugin in load order
    pub fn plugins(&self) -> Vec<PluginInfo> {
        self.registry.read().handles().iter().map(|h| h.info()).collect()
    }

    pub fn plugin_info(&self, id: PluginId) -> Option<PluginInfo> {
        self.registry.read().get(id).map(|h| h.info())
    }

    /// Plugin providing a tool
    pub fn plugin_for_tool(&self, tool: &str) -> Option<PluginId> {
        self.registry.read().resolve(tool).map(|(h, _)| h.id)
    }

    pub fn is_empty(&self) -> bool {
        self.registry.read().is_empty()
    }

    // ---- invocation ----

    /// Cancel a running call by correlation id.
    ///
    /// Returns `false` if no call with that id is running.
    pub fn cancel(&self, correlation_id: &CorrelationId) -> bool {
        match self.active.lock().get(correlation_id) {
            Some(token) => {
                debug!("Cancelling invocation {}", correlation_id);
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Run a call on its own task
    pub fn submit(self: &Arc<Self>, envelope: InvocationEnvelope) -> PendingInvocation {
        let correlation_id = envelope.correlation_id.clone();
        let cancellation = envelope.cancellation.clone();
        let dispatcher = Arc::clone(self);
        let task = tokio::spawn(async move { dispatcher.invoke(envelope).await });
        PendingInvocation {
            correlation_id,
            cancellation,
            task,
        }
    }

    /// Invoke a tool and return its terminal result
    pub async fn invoke(&self, envelope: InvocationEnvelope) -> InvocationResult {
        let started = Instant::now();
        let InvocationEnvelope {
            correlation_id,
            tool_name,
            arguments,
            deadline,
            cancellation,
        } = envelope;
        let arguments = normalize_arguments(arguments);
        let audit_arguments = self.audit.as_ref().map(|_| arguments.clone());

        let token = cancellation.child_token();
        let _active = {
            let mut active = self.active.lock();
            if active.contains_key(&correlation_id) {
                return InvocationResult::failure(
                    FailureKind::InvalidArguments,
                    format!("correlation id {correlation_id} is already in flight"),
                );
            }
            active.insert(correlation_id.clone(), token.clone());
            ActiveCall {
                active: &self.active,
                id: correlation_id.clone(),
            }
        };

        let resolved = {
            let registry = self.registry.read();
            registry
                .resolve(&tool_name)
                .map(|(handle, index)| (handle.enter(), index))
        };

        let (plugin_name, result) = match resolved {
            None => {
                debug!("Unknown tool '{}' ({})", tool_name, correlation_id);
                (
                    None,
                    InvocationResult::failure(
                        FailureKind::ToolNotFound,
                        format!("no tool named '{tool_name}'"),
                    ),
                )
            }
            Some((guard, index)) => {
                let name = guard.handle().name().to_string();
                let deadline =
                    deadline.unwrap_or_else(|| Instant::now() + self.config.default_timeout());
                (Some(name), self.run(guard, index, arguments, deadline, token).await)
            }
        };

        debug!(
            "Invocation {} of '{}' finished: {} in {:?}",
            correlation_id,
            tool_name,
            result.outcome_label(),
            started.elapsed()
        );
        // TODO: move audit writes and rotation to a dedicated writer thread
        // fed by a channel, flushed on drop; this blocks a runtime worker
        if let (Some(audit), Some(arguments)) = (&self.audit, &audit_arguments) {
            audit.lock().log_invocation(
                &correlation_id,
                &tool_name,
                plugin_name.as_deref().unwrap_or("-"),
                arguments,
                &result,
                started.elapsed(),
            );
        }
        result
    }

    async fn run(
        &self,
        guard: InFlightGuard,
        index: usize,
        arguments: Value,
        deadline: Instant,
        token: CancellationToken,
    ) -> InvocationResult {
        let handle = Arc::clone(guard.handle());
        let tool = &handle.tools[index];

        if handle.health() == Health::Quarantined {
            return InvocationResult::failure(
                FailureKind::PolicyDenied,
                format!("plugin '{}' is quarantined after repeated faults", handle.name()),
            );
        }

        if let Err(e) = tool.schemas.parameters.validate(&arguments) {
            return InvocationResult::failure(
                FailureKind::InvalidArguments,
                format!("invalid arguments for '{}': {}", tool.descriptor.name, e),
            );
        }

        if let Err(violation) = self.policy.check(handle.category, &arguments) {
            warn!("Denied call to '{}': {}", tool.descriptor.name, violation);
            return InvocationResult::failure(FailureKind::PolicyDenied, violation.to_string());
        }

        let permit = match &handle.limiter {
            None => None,
            Some(limiter) => {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => return cancelled(),
                    _ = sleep_until(deadline) => return timed_out(&tool.descriptor.name),
                    permit = Arc::clone(limiter).acquire_owned() => match permit {
                        Ok(permit) => Some(permit),
                        Err(_) => return InvocationResult::failure(
                            FailureKind::PluginFault,
                            "plugin concurrency limiter closed",
                        ),
                    },
                }
            }
        };

        let plugin = Arc::clone(&handle.plugin);
        let operation = tool.descriptor.name.clone();
        let plugin_token = token.clone();
        let mut task: JoinHandle<InvocationResult> = tokio::spawn(async move {
            let _guard = guard;
            let _permit = permit;
            plugin.execute(&operation, arguments, plugin_token).await
        });

        let abandoned = tokio::select! {
            biased;
            joined = &mut task => return self.finish(&handle, index, joined),
            _ = token.cancelled() => cancelled(),
            _ = sleep_until(deadline) => timed_out(&tool.descriptor.name),
        };

        token.cancel();
        if timeout(self.config.grace_period(), &mut task).await.is_err() {
            warn!(
                "Plugin '{}' did not stop within {:?} of cancellation",
                handle.name(),
                self.config.grace_period()
            );
        }
        abandoned
    }

    /// Turn a finished plugin task into the terminal result
    fn finish(
        &self,
        handle: &Arc<PluginHandle>,
        index: usize,
        joined: Result<InvocationResult, JoinError>,
    ) -> InvocationResult {
        let tool = &handle.tools[index];
        let result = match joined {
            Ok(InvocationResult::Success { payload }) if self.config.validate_results => {
                match tool.schemas.result.validate(&payload) {
                    Ok(()) => InvocationResult::success(payload),
                    Err(e) => InvocationResult::failure_with(
                        FailureKind::PluginFault,
                        format!("result of '{}' violates its schema: {}", tool.descriptor.name, e),
                        false,
                    ),
                }
            }
            Ok(result) => result,
            Err(e) if e.is_panic() => InvocationResult::failure_with(
                FailureKind::PluginFault,
                format!("plugin panicked: {}", panic_message(&*e.into_panic())),
                false,
            ),
            Err(e) => InvocationResult::failure_with(
                FailureKind::PluginFault,
                format!("plugin task failed: {e}"),
                false,
            ),
        };

        if result.failure_kind() == Some(FailureKind::PluginFault) {
            self.record_fault(handle);
        }
        result
    }

    fn record_fault(&self, handle: &PluginHandle) {
        // Health changes are serialized with registry mutation
        let _registry = self.registry.write();
        match handle.record_fault(self.config.fault_threshold) {
            Health::Quarantined => warn!(
                "Plugin '{}' quarantined after {} fault(s)",
                handle.name(),
                handle.faults()
            ),
            health => debug!("Plugin '{}' is now {:?}", handle.name(), health),
        }
    }
}

fn cancelled() -> InvocationResult {
    InvocationResult::failure(FailureKind::Cancelled, "invocation cancelled")
}

fn timed_out(tool: &str) -> InvocationResult {
    InvocationResult::failure(FailureKind::Timeout, format!("'{tool}' exceeded its deadline"))
}

/// A call started with [`Dispatcher::submit`]
#[derive(Debug)]
pub struct PendingInvocation {
    correlation_id: CorrelationId,
    cancellation: CancellationToken,
    task: JoinHandle<InvocationResult>,
}

impl PendingInvocation {
    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    /// Wait for the terminal result
    pub async fn result(self) -> InvocationResult {
        self.task.await.unwrap_or_else(|e| {
            InvocationResult::failure_with(
                FailureKind::PluginFault,
                format!("dispatch task failed: {e}"),
                false,
            )
        })
    }
}
