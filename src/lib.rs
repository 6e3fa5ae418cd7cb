//! toolhost - a plugin host for agent tools
//!
//! Tool libraries describe their tools with JSON-schema descriptors and are
//! either registered in-process or loaded from dynamic libraries. The
//! [`Dispatcher`] validates each call against the tool's schema, applies the
//! isolation policy of the plugin's category and runs the plugin under a
//! deadline with cooperative cancellation.

pub mod config;
pub mod dispatcher;
pub mod envelope;
pub mod error;
pub mod logging;
pub mod plugins;
pub mod policy;
pub mod schema;
pub mod validator;

pub use config::HostConfig;
pub use dispatcher::{Dispatcher, PendingInvocation, PluginId, PluginInfo, UnloadMode};
pub use envelope::{CorrelationId, Failure, FailureKind, InvocationEnvelope, InvocationResult};
pub use error::{LoadError, PluginError, ToolhostError, UnloadError};
pub use plugins::{Plugin, PluginCategory, PluginMetadata};
pub use schema::{ParameterDef, ToolDescriptor};
