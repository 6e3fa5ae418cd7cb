//! Built-in plugins
//!
//! Reference plugins compiled into the host. `time` is also exported as a
//! dynamic library by the `toolhost-time` workspace member, so it must not
//! depend on a running tokio runtime.

use super::contract::{Plugin, PluginCategory, PluginMetadata};
use crate::envelope::{FailureKind, InvocationResult};
use crate::error::PluginError;
use crate::schema::{ParameterDef, ToolDescriptor};
use async_trait::async_trait;
use chrono::{DateTime, Duration, FixedOffset, Offset, SecondsFormat, Utc};
use serde_json::{json, Value};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

/// Largest shift accepted by `add_duration` (about a century)
const MAX_SHIFT_SECONDS: f64 = 3_155_760_000.0;

/// Default read limit for `read_file`
const DEFAULT_MAX_BYTES: u64 = 102_400;

fn str_arg<'a>(arguments: &'a Value, name: &str) -> Option<&'a str> {
    arguments.get(name).and_then(|v| v.as_str())
}

/// Clock tools
#[derive(Debug, Default, Clone)]
pub struct TimePlugin;

impl TimePlugin {
    pub fn new() -> Self {
        Self
    }

    fn now(arguments: &Value) -> InvocationResult {
        let offset = match str_arg(arguments, "utc_offset").map(parse_offset) {
            Some(Ok(offset)) => offset,
            Some(Err(e)) => return InvocationResult::failure(FailureKind::InvalidArguments, e),
            None => Utc.fix(),
        };

        let now = Utc::now().with_timezone(&offset);
        InvocationResult::success(json!({
            "timestamp": now.to_rfc3339_opts(SecondsFormat::Millis, true),
            "unix": now.timestamp(),
            "timezone": offset.to_string(),
        }))
    }

    fn add_duration(arguments: &Value) -> InvocationResult {
        let Some(raw) = str_arg(arguments, "timestamp") else {
            return InvocationResult::failure(FailureKind::InvalidArguments, "missing timestamp");
        };
        let start = match DateTime::parse_from_rfc3339(raw) {
            Ok(t) => t,
            Err(e) => {
                return InvocationResult::failure(
                    FailureKind::InvalidArguments,
                    format!("invalid timestamp '{raw}': {e}"),
                )
            }
        };

        let seconds = arguments.get("seconds").and_then(|v| v.as_i64()).unwrap_or(0);
        match start.checked_add_signed(Duration::seconds(seconds)) {
            Some(end) => InvocationResult::success(json!({
                "timestamp": end.to_rfc3339_opts(SecondsFormat::AutoSi, true),
                "unix": end.timestamp(),
            })),
            None => InvocationResult::failure(
                FailureKind::InvalidArguments,
                "resulting timestamp is out of range",
            ),
        }
    }
}

/// Parse `Z`, `+HH:MM` or `-HH:MM`
fn parse_offset(raw: &str) -> Result<FixedOffset, String> {
    if raw.eq_ignore_ascii_case("z") || raw.eq_ignore_ascii_case("utc") {
        return Ok(Utc.fix());
    }

    let invalid = || format!("invalid utc_offset '{raw}', expected +HH:MM");
    let (sign, rest) = if let Some(rest) = raw.strip_prefix('+') {
        (1, rest)
    } else if let Some(rest) = raw.strip_prefix('-') {
        (-1, rest)
    } else {
        return Err(invalid());
    };
    let (hours, minutes) = rest.split_once(':').ok_or_else(invalid)?;
    let hours: i32 = hours.parse().map_err(|_| invalid())?;
    let minutes: i32 = minutes.parse().map_err(|_| invalid())?;
    if minutes >= 60 {
        return Err(invalid());
    }

    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).ok_or_else(invalid)
}

#[async_trait]
impl Plugin for TimePlugin {
    fn metadata(&self) -> PluginMetadata {
        PluginMetadata::new("time", PluginCategory::General)
            .version(env!("CARGO_PKG_VERSION"))
            .description("Current time and date arithmetic")
    }

    fn describe(&self) -> Result<Vec<ToolDescriptor>, PluginError> {
        Ok(vec![
            ToolDescriptor::builder("now")
                .summary("Current time as an RFC 3339 timestamp")
                .param(
                    ParameterDef::string("utc_offset")
                        .describe("Offset such as +02:00 (default UTC)")
                        .pattern("^([Zz]|UTC|utc|[+-][0-9]{2}:[0-9]{2})$"),
                )
                .returns(json!({
                    "type": "object",
                    "properties": {
                        "timestamp": { "type": "string" },
                        "unix": { "type": "integer" },
                        "timezone": { "type": "string" }
                    },
                    "required": ["timestamp", "unix", "timezone"]
                }))
                .build(),
            ToolDescriptor::builder("add_duration")
                .summary("Shift a timestamp by a number of seconds")
                .param(
                    ParameterDef::string("timestamp")
                        .describe("RFC 3339 timestamp")
                        .required(),
                )
                .param(
                    ParameterDef::integer("seconds")
                        .describe("Seconds to add (negative to subtract)")
                        .range(Some(-MAX_SHIFT_SECONDS), Some(MAX_SHIFT_SECONDS))
                        .required(),
                )
                .returns(json!({
                    "type": "object",
                    "properties": {
                        "timestamp": { "type": "string" },
                        "unix": { "type": "integer" }
                    },
                    "required": ["timestamp"]
                }))
                .build(),
        ])
    }

    async fn execute(
        &self,
        operation: &str,
        arguments: Value,
        _cancel: CancellationToken,
    ) -> InvocationResult {
        match operation {
            "now" => Self::now(&arguments),
            "add_duration" => Self::add_duration(&arguments),
            _ => InvocationResult::failure(
                FailureKind::ToolNotFound,
                format!("Unknown tool: {operation}"),
            ),
        }
    }
}

/// Read-only file tools rooted at a directory
#[derive(Debug, Clone)]
pub struct FilesystemPlugin {
    root: PathBuf,
}

impl FilesystemPlugin {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Relative paths are taken from the plugin root
    fn resolve(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    async fn read_file(&self, arguments: &Value, cancel: &CancellationToken) -> InvocationResult {
        let Some(path) = str_arg(arguments, "path") else {
            return InvocationResult::failure(FailureKind::InvalidArguments, "missing path");
        };
        let max_bytes = arguments
            .get("max_bytes")
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_MAX_BYTES);

        let file = match tokio::fs::File::open(self.resolve(path)).await {
            Ok(f) => f,
            Err(e) => return io_failure("Failed to open file", e),
        };

        let mut buffer = Vec::new();
        let mut reader = file.take(max_bytes.saturating_add(1));
        // One extra byte tells a file of exactly `max_bytes` from a longer one
        let read = tokio::select! {
            _ = cancel.cancelled() => {
                return InvocationResult::failure(FailureKind::Cancelled, "read cancelled");
            }
            read = reader.read_to_end(&mut buffer) => read,
        };
        if let Err(e) = read {
            return io_failure("Failed to read file", e);
        }

        let truncated = buffer.len() as u64 > max_bytes;
        buffer.truncate(max_bytes as usize);

        InvocationResult::success(json!({
            "path": path,
            "size": buffer.len(),
            "truncated": truncated,
            "content": String::from_utf8_lossy(&buffer),
        }))
    }

    async fn list_dir(&self, arguments: &Value, cancel: &CancellationToken) -> InvocationResult {
        let path = str_arg(arguments, "path").unwrap_or(".");
        let show_hidden = arguments
            .get("hidden")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        let mut entries = match tokio::fs::read_dir(self.resolve(path)).await {
            Ok(entries) => entries,
            Err(e) => return io_failure("Failed to read directory", e),
        };

        let mut files: Vec<Value> = Vec::new();
        loop {
            if cancel.is_cancelled() {
                return InvocationResult::failure(FailureKind::Cancelled, "listing cancelled");
            }

            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => return io_failure("Failed to read directory", e),
            };

            let name = entry.file_name().to_string_lossy().to_string();
            // Skip hidden files if not requested
            if !show_hidden && name.starts_with('.') {
                continue;
            }

            let metadata = entry.metadata().await.ok();
            files.push(json!({
                "name": name,
                "is_dir": metadata.as_ref().is_some_and(|m| m.is_dir()),
                "size": metadata.map(|m| m.len()).unwrap_or(0),
            }));
        }

        files.sort_by(|a, b| {
            let a_name = a["name"].as_str().unwrap_or("");
            let b_name = b["name"].as_str().unwrap_or("");
            a_name.cmp(b_name)
        });

        InvocationResult::success(json!({
            "path": path,
            "count": files.len(),
            "entries": files,
        }))
    }
}

/// Caller mistakes are not plugin faults
fn io_failure(context: &str, e: std::io::Error) -> InvocationResult {
    match e.kind() {
        ErrorKind::NotFound | ErrorKind::PermissionDenied | ErrorKind::InvalidInput => {
            InvocationResult::failure(FailureKind::InvalidArguments, format!("{context}: {e}"))
        }
        _ => InvocationResult::failure(FailureKind::PluginFault, format!("{context}: {e}")),
    }
}

#[async_trait]
impl Plugin for FilesystemPlugin {
    fn metadata(&self) -> PluginMetadata {
        PluginMetadata::new("filesystem", PluginCategory::Filesystem)
            .version(env!("CARGO_PKG_VERSION"))
            .description("Read files and list directories")
            .max_concurrency(8)
    }

    fn describe(&self) -> Result<Vec<ToolDescriptor>, PluginError> {
        Ok(vec![
            ToolDescriptor::builder("read_file")
                .summary("Read contents of a file")
                .param(ParameterDef::string("path").describe("File path to read").required())
                .param(
                    ParameterDef::integer("max_bytes")
                        .describe("Maximum bytes to read (default 100KB)")
                        .range(Some(1.0), Some(10_485_760.0))
                        .default_value(json!(DEFAULT_MAX_BYTES)),
                )
                .returns(json!({
                    "type": "object",
                    "properties": {
                        "path": { "type": "string" },
                        "size": { "type": "integer" },
                        "truncated": { "type": "boolean" },
                        "content": { "type": "string" }
                    },
                    "required": ["path", "size", "truncated", "content"]
                }))
                .build(),
            ToolDescriptor::builder("list_dir")
                .summary("List directory contents")
                .param(ParameterDef::string("path").describe("Directory path (default root)"))
                .param(
                    ParameterDef::boolean("hidden")
                        .describe("Include hidden files")
                        .default_value(json!(false)),
                )
                .returns(json!({
                    "type": "object",
                    "properties": {
                        "count": { "type": "integer" },
                        "entries": { "type": "array" }
                    },
                    "required": ["count", "entries"]
                }))
                .build(),
        ])
    }

    async fn execute(
        &self,
        operation: &str,
        arguments: Value,
        cancel: CancellationToken,
    ) -> InvocationResult {
        match operation {
            "read_file" => self.read_file(&arguments, &cancel).await,
            "list_dir" => self.list_dir(&arguments, &cancel).await,
            _ => InvocationResult::failure(
                FailureKind::ToolNotFound,
                format!("Unknown tool: {operation}"),
            ),
        }
    }
}
