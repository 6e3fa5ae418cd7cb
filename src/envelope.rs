//! Invocation envelope and result types
//!
//! An [`InvocationEnvelope`] is the structured request for one tool call; an
//! [`InvocationResult`] is its single terminal answer.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Identifier matching an invocation to its result and to cancellation requests
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Generate a fresh random id
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CorrelationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for CorrelationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Request for one tool invocation
#[derive(Debug, Clone)]
pub struct InvocationEnvelope {
    /// Correlation id (generated unless supplied)
    pub correlation_id: CorrelationId,
    /// Tool name to invoke
    pub tool_name: String,
    /// Argument payload
    pub arguments: Value,
    /// Absolute deadline; the dispatcher default applies when absent
    pub deadline: Option<Instant>,
    /// Caller-owned cancellation token
    pub cancellation: CancellationToken,
}

impl InvocationEnvelope {
    /// Create a new envelope with a generated correlation id and no deadline
    pub fn new(tool_name: impl Into<String>, arguments: Value) -> Self {
        Self {
            correlation_id: CorrelationId::generate(),
            tool_name: tool_name.into(),
            arguments,
            deadline: None,
            cancellation: CancellationToken::new(),
        }
    }

    pub fn with_correlation_id(mut self, id: impl Into<CorrelationId>) -> Self {
        self.correlation_id = id.into();
        self
    }

    /// Set the deadline relative to now
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Cancel this invocation from the caller's side
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }
}

/// Typed failure categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ToolNotFound,
    InvalidArguments,
    PolicyDenied,
    Timeout,
    PluginFault,
    Cancelled,
}

impl FailureKind {
    /// Whether resending the same envelope is safe by default
    pub fn default_retryable(self) -> bool {
        matches!(self, FailureKind::Timeout | FailureKind::PluginFault)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::ToolNotFound => "tool_not_found",
            FailureKind::InvalidArguments => "invalid_arguments",
            FailureKind::PolicyDenied => "policy_denied",
            FailureKind::Timeout => "timeout",
            FailureKind::PluginFault => "plugin_fault",
            FailureKind::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal failure of an invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
    pub retryable: bool,
}

/// Terminal result of an invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum InvocationResult {
    Success { payload: Value },
    Failure(Failure),
}

impl InvocationResult {
    /// Create a success result
    pub fn success(payload: Value) -> Self {
        InvocationResult::Success { payload }
    }

    /// Create a failure with the kind's default retryability
    pub fn failure(kind: FailureKind, message: impl Into<String>) -> Self {
        Self::failure_with(kind, message, kind.default_retryable())
    }

    pub fn failure_with(kind: FailureKind, message: impl Into<String>, retryable: bool) -> Self {
        InvocationResult::Failure(Failure {
            kind,
            message: message.into(),
            retryable,
        })
    }

    pub fn is_success(&self) -> bool {
        matches!(self, InvocationResult::Success { .. })
    }

    pub fn payload(&self) -> Option<&Value> {
        match self {
            InvocationResult::Success { payload } => Some(payload),
            InvocationResult::Failure(_) => None,
        }
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            InvocationResult::Success { .. } => None,
            InvocationResult::Failure(f) => Some(f.kind),
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            InvocationResult::Success { .. } => false,
            InvocationResult::Failure(f) => f.retryable,
        }
    }

    /// Short label for logs: "success" or the failure kind
    pub fn outcome_label(&self) -> &'static str {
        match self {
            InvocationResult::Success { .. } => "success",
            InvocationResult::Failure(f) => f.kind.as_str(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_new() {
        let env = InvocationEnvelope::new("now", json!({}));
        assert_eq!(env.tool_name, "now");
        assert!(env.deadline.is_none());
        assert!(!env.cancellation.is_cancelled());
        assert!(!env.correlation_id.as_str().is_empty());
    }

    #[test]
    fn test_generated_ids_differ() {
        let a = InvocationEnvelope::new("now", json!({}));
        let b = InvocationEnvelope::new("now", json!({}));
        assert_ne!(a.correlation_id, b.correlation_id);
    }

    #[tokio::test]
    async fn test_envelope_with_timeout_sets_deadline() {
        let env = InvocationEnvelope::new("now", json!({}))
            .with_correlation_id("req-1")
            .with_timeout(Duration::from_secs(2));
        assert_eq!(env.correlation_id.as_str(), "req-1");
        assert!(env.deadline.unwrap() > Instant::now());
    }

    #[test]
    fn test_cancel_marks_token() {
        let env = InvocationEnvelope::new("now", json!({}));
        let token = env.cancellation.clone();
        env.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_default_retryable() {
        assert!(FailureKind::Timeout.default_retryable());
        assert!(FailureKind::PluginFault.default_retryable());
        assert!(!FailureKind::InvalidArguments.default_retryable());
        assert!(!FailureKind::PolicyDenied.default_retryable());
        assert!(!FailureKind::ToolNotFound.default_retryable());
        assert!(!FailureKind::Cancelled.default_retryable());
    }

    #[test]
    fn test_result_serialization() {
        let ok = InvocationResult::success(json!({"timestamp": "2026-01-01T00:00:00Z"}));
        let value = serde_json::to_value(&ok).unwrap();
        assert_eq!(value["status"], "success");
        assert_eq!(value["payload"]["timestamp"], "2026-01-01T00:00:00Z");

        let err = InvocationResult::failure(FailureKind::Timeout, "too slow");
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["status"], "failure");
        assert_eq!(value["kind"], "timeout");
        assert_eq!(value["retryable"], true);

        let back: InvocationResult = serde_json::from_value(value).unwrap();
        assert_eq!(back.failure_kind(), Some(FailureKind::Timeout));
    }
}
