//! Plugin contract
//!
//! Every tool library, whether compiled into the host or loaded from a
//! dynamic library, is driven exclusively through [`Plugin`].

use crate::envelope::InvocationResult;
use crate::error::PluginError;
use crate::schema::ToolDescriptor;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tokio_util::sync::CancellationToken;

/// Domain a plugin belongs to; selects the isolation rule set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginCategory {
    Filesystem,
    Network,
    Subprocess,
    #[default]
    General,
}

impl PluginCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            PluginCategory::Filesystem => "filesystem",
            PluginCategory::Network => "network",
            PluginCategory::Subprocess => "subprocess",
            PluginCategory::General => "general",
        }
    }
}

impl fmt::Display for PluginCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static facts a plugin declares about itself
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginMetadata {
    /// Plugin name (e.g., "time")
    pub name: String,
    /// Plugin version
    #[serde(default)]
    pub version: String,
    /// Isolation category
    #[serde(default)]
    pub category: PluginCategory,
    /// Maximum concurrent calls; `None` means unbounded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,
    /// Human-readable description
    #[serde(default)]
    pub description: String,
}

impl PluginMetadata {
    pub fn new(name: impl Into<String>, category: PluginCategory) -> Self {
        Self {
            name: name.into(),
            version: "0.0.0".to_string(),
            category,
            max_concurrency: None,
            description: String::new(),
        }
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Declare the plugin able to serve at most `n` calls at a time
    pub fn max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = Some(n);
        self
    }
}

/// Capability interface every tool library implements.
///
/// The dispatcher only ever calls these three methods; domain behavior
/// lives entirely behind them.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Static plugin facts
    fn metadata(&self) -> PluginMetadata;

    /// Tools offered by this plugin.
    ///
    /// Must be deterministic and free of side effects. Called once at load
    /// time; an error fails the load.
    fn describe(&self) -> Result<Vec<ToolDescriptor>, PluginError>;

    /// Execute a named operation with already validated arguments.
    ///
    /// Implementations must watch `cancel` in I/O loops and return promptly
    /// once it fires.
    async fn execute(
        &self,
        operation: &str,
        arguments: Value,
        cancel: CancellationToken,
    ) -> InvocationResult;
}
