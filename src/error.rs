//! Error types for toolhost

use crate::dispatcher::PluginId;
use thiserror::Error;

/// Top-level error type for toolhost
#[derive(Error, Debug)]
pub enum ToolhostError {
    #[error("Load error: {0}")]
    Load(#[from] LoadError),

    #[error("Unload error: {0}")]
    Unload(#[from] UnloadError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Reasons a plugin could not be loaded.
///
/// None of these are fatal to the host, and a failed load never leaves a
/// partial registration behind.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    #[error("Plugin origin not found: {origin} ({reason})")]
    OriginNotFound { origin: String, reason: String },

    #[error("Plugin {origin} does not export symbol '{symbol}'")]
    SymbolMissing { origin: String, symbol: String },

    #[error("Plugin {origin} speaks ABI version {found}, host requires {expected}")]
    VersionMismatch {
        origin: String,
        expected: u32,
        found: u32,
    },

    #[error("Plugin {origin} failed to initialize: {reason}")]
    InitializationFailed { origin: String, reason: String },

    #[error("Tool '{tool}' from {origin} is already provided by {existing}")]
    DuplicateToolName {
        tool: String,
        origin: String,
        existing: String,
    },
}

impl LoadError {
    /// Short stable identifier of the error kind, used in logs and CLI output
    pub fn kind(&self) -> &'static str {
        match self {
            LoadError::OriginNotFound { .. } => "origin_not_found",
            LoadError::SymbolMissing { .. } => "symbol_missing",
            LoadError::VersionMismatch { .. } => "version_mismatch",
            LoadError::InitializationFailed { .. } => "initialization_failed",
            LoadError::DuplicateToolName { .. } => "duplicate_tool_name",
        }
    }
}

/// Reasons a plugin could not be unloaded
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UnloadError {
    #[error("Plugin {id} still has {in_flight} invocation(s) in flight")]
    StillInFlight { id: PluginId, in_flight: usize },

    #[error("No plugin registered with id {0}")]
    UnknownPlugin(PluginId),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(String),

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Error reported by a plugin while describing itself
#[derive(Error, Debug)]
pub enum PluginError {
    #[error("{0}")]
    Message(String),

    #[error("Malformed plugin payload: {0}")]
    Payload(#[from] serde_json::Error),
}

impl PluginError {
    pub fn new(message: impl Into<String>) -> Self {
        PluginError::Message(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_error_kinds_are_distinct() {
        let errors = [
            LoadError::OriginNotFound {
                origin: "a".into(),
                reason: "missing".into(),
            },
            LoadError::SymbolMissing {
                origin: "a".into(),
                symbol: "entry".into(),
            },
            LoadError::VersionMismatch {
                origin: "a".into(),
                expected: 1,
                found: 2,
            },
            LoadError::InitializationFailed {
                origin: "a".into(),
                reason: "boom".into(),
            },
            LoadError::DuplicateToolName {
                tool: "now".into(),
                origin: "a".into(),
                existing: "b".into(),
            },
        ];

        let mut kinds: Vec<_> = errors.iter().map(|e| e.kind()).collect();
        kinds.sort();
        kinds.dedup();
        assert_eq!(kinds.len(), 5);
    }

    #[test]
    fn test_version_mismatch_message() {
        let err = LoadError::VersionMismatch {
            origin: "/tmp/libx.so".into(),
            expected: 1,
            found: 7,
        };
        let msg = err.to_string();
        assert!(msg.contains("7"));
        assert!(msg.contains("requires 1"));
    }
}
