//! Configuration management for toolhost
//!
//! Handles loading and merging configuration from multiple sources:
//! 1. Compiled defaults
//! 2. System config (/etc/toolhost/config.toml)
//! 3. User config (~/.toolhost/config.toml)
//! 4. CLI-specified config file
//! 5. Environment variables
//!
//! Files are merged table by table, so a file only overrides the keys it names.

use crate::error::ConfigError;
use crate::plugins::PluginCategory;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub dispatcher: DispatcherConfig,
    pub plugins: PluginConfig,
    pub policy: PolicyConfig,
    pub audit: AuditConfig,
}

/// Invocation pipeline settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Deadline applied when an envelope carries none
    pub default_timeout_ms: u64,
    /// How long a timed-out or cancelled plugin may take to wind down
    pub grace_period_ms: u64,
    /// Faults before a plugin is quarantined
    pub fault_threshold: u32,
    /// Check successful payloads against the result schema
    pub validate_results: bool,
}

/// Plugin configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginConfig {
    /// Enable plugins
    pub enabled: bool,
    /// Plugin directory
    pub directory: PathBuf,
    /// Auto-load every library in the directory
    pub auto_load: bool,
    /// Specific plugins to load
    pub load: Vec<String>,
}

/// Domain isolation rules
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub filesystem: FilesystemPolicy,
    pub network: NetworkPolicy,
    pub subprocess: SubprocessPolicy,
    /// Category to enforce for a plugin name, replacing its declared one
    pub category_overrides: HashMap<String, PluginCategory>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilesystemPolicy {
    /// Directory every path argument must stay inside
    pub root: PathBuf,
    /// Argument names holding paths
    pub path_fields: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkPolicy {
    /// Argument names holding URLs or hosts
    pub url_fields: Vec<String>,
    pub allowed_schemes: Vec<String>,
    /// Host globs; empty allows any host not denied
    pub allow_hosts: Vec<String>,
    /// Host globs; checked before `allow_hosts`
    pub deny_hosts: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SubprocessPolicy {
    /// Argument names passed on to a child process
    pub argument_fields: Vec<String>,
    /// Argument names selecting the child's working directory
    pub working_directory_fields: Vec<String>,
    /// Directory child processes must run inside
    pub working_directory: PathBuf,
    /// Characters rejected in process arguments
    pub metacharacters: String,
    /// Regexes rejected in process arguments
    pub blocked_patterns: Vec<String>,
}

/// Invocation audit log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Record every terminal invocation result
    pub enabled: bool,
    /// Log file path
    pub path: PathBuf,
    /// Maximum log file size before rotation
    pub max_size: u64,
    /// Number of rotated logs to keep
    pub retention: u32,
    /// Redact secrets from argument previews
    pub redact_secrets: bool,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn toolhost_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".toolhost")
}

fn current_dir() -> PathBuf {
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

// Default implementations

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
            grace_period_ms: 500,
            fault_threshold: 3,
            validate_results: true,
        }
    }
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            directory: toolhost_home().join("plugins"),
            auto_load: true,
            load: vec![],
        }
    }
}

impl Default for FilesystemPolicy {
    fn default() -> Self {
        Self {
            root: current_dir(),
            path_fields: strings(&["path", "source", "destination", "directory", "file"]),
        }
    }
}

impl Default for NetworkPolicy {
    fn default() -> Self {
        Self {
            url_fields: strings(&["url", "uri", "endpoint", "host"]),
            allowed_schemes: strings(&["http", "https"]),
            allow_hosts: vec![],
            deny_hosts: strings(&["169.254.169.254", "metadata.google.internal"]),
        }
    }
}

impl Default for SubprocessPolicy {
    fn default() -> Self {
        Self {
            argument_fields: strings(&[
                "args", "arguments", "command", "ref", "branch", "message", "pathspec",
            ]),
            working_directory_fields: strings(&["cwd", "repo", "repository", "working_directory"]),
            working_directory: current_dir(),
            metacharacters: ";|&`$<>\n\r\\".to_string(),
            blocked_patterns: strings(&[
                r"^--upload-pack",
                r"^--receive-pack",
                r"^--exec\b",
                r"core\.sshCommand",
            ]),
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: toolhost_home().join("logs/invocations.log"),
            max_size: 10 * 1024 * 1024, // 10MB
            retention: 5,
            redact_secrets: true,
        }
    }
}

impl DispatcherConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

impl HostConfig {
    /// Load configuration from all sources
    pub fn load(cli_config: Option<&Path>) -> Result<Self, ConfigError> {
        let mut layers = vec![PathBuf::from("/etc/toolhost/config.toml")];
        if dirs::home_dir().is_some() {
            layers.push(toolhost_home().join("config.toml"));
        }

        let mut layers: Vec<PathBuf> = layers.into_iter().filter(|p| p.exists()).collect();

        // A CLI-specified file must exist
        if let Some(path) = cli_config {
            layers.push(path.to_path_buf());
        }

        let mut config = Self::from_files(&layers)?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Merge the given files in order over the compiled defaults
    pub fn from_files(paths: &[PathBuf]) -> Result<Self, ConfigError> {
        let mut merged = toml::Table::new();
        for path in paths {
            debug!("Loading config from {:?}", path);
            let contents = std::fs::read_to_string(path)
                .map_err(|e| ConfigError::Read(format!("{}: {}", path.display(), e)))?;
            let table: toml::Table = toml::from_str(&contents)
                .map_err(|e| ConfigError::Parse(format!("{}: {}", path.display(), e)))?;
            merge_tables(&mut merged, table);
        }

        toml::Value::Table(merged)
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::Parse(e.to_string()))
    }

    /// Parse a single TOML document
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("TOOLHOST_PLUGIN_DIR") {
            self.plugins.directory = PathBuf::from(dir);
        }
        if let Some(timeout) = lookup("TOOLHOST_TIMEOUT_MS") {
            match timeout.parse() {
                Ok(ms) => self.dispatcher.default_timeout_ms = ms,
                Err(_) => warn!("Ignoring invalid TOOLHOST_TIMEOUT_MS: {}", timeout),
            }
        }
        if let Some(root) = lookup("TOOLHOST_FS_ROOT") {
            self.policy.filesystem.root = PathBuf::from(root);
        }
        if let Some(dir) = lookup("TOOLHOST_WORKDIR") {
            self.policy.subprocess.working_directory = PathBuf::from(dir);
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dispatcher.default_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "dispatcher.default_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.dispatcher.fault_threshold == 0 {
            return Err(ConfigError::Invalid(
                "dispatcher.fault_threshold must be greater than zero".to_string(),
            ));
        }
        if self.policy.network.allowed_schemes.is_empty() {
            return Err(ConfigError::Invalid(
                "policy.network.allowed_schemes must not be empty".to_string(),
            ));
        }

        for pattern in &self.policy.subprocess.blocked_patterns {
            Regex::new(pattern).map_err(|e| {
                ConfigError::Invalid(format!("policy.subprocess.blocked_patterns: {e}"))
            })?;
        }
        let network = &self.policy.network;
        for pattern in network.allow_hosts.iter().chain(&network.deny_hosts) {
            glob::Pattern::new(pattern).map_err(|e| {
                ConfigError::Invalid(format!("policy.network host pattern '{pattern}': {e}"))
            })?;
        }

        Ok(())
    }
}

/// Merge `overlay` into `base`, recursing into tables present in both
fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match value {
            toml::Value::Table(incoming) => {
                if let Some(toml::Value::Table(existing)) = base.get_mut(&key) {
                    merge_tables(existing, incoming);
                    continue;
                }
                base.insert(key, toml::Value::Table(incoming));
            }
            other => {
                base.insert(key, other);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = HostConfig::default();
        assert_eq!(config.dispatcher.default_timeout_ms, 30_000);
        assert!(config.dispatcher.validate_results);
        assert!(config.policy.filesystem.path_fields.contains(&"path".to_string()));
        assert_eq!(config.policy.network.allowed_schemes, vec!["http", "https"]);
    }

    #[test]
    fn test_config_validation() {
        assert!(HostConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut config = HostConfig::default();
        config.dispatcher.default_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_fault_threshold_rejected() {
        let mut config = HostConfig::default();
        config.dispatcher.fault_threshold = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_bad_patterns_rejected() {
        let mut config = HostConfig::default();
        config.policy.subprocess.blocked_patterns = vec!["(unclosed".to_string()];
        assert!(config.validate().is_err());

        let mut config = HostConfig::default();
        config.policy.network.deny_hosts = vec!["[".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_config() {
        let toml_str = r#"
            [dispatcher]
            default_timeout_ms = 2000

            [policy.network]
            allow_hosts = ["*.example.com"]

            [policy.category_overrides]
            git = "subprocess"
        "#;

        let config = HostConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.dispatcher.default_timeout_ms, 2000);
        assert_eq!(config.dispatcher.grace_period_ms, 500);
        assert_eq!(config.policy.network.allow_hosts, vec!["*.example.com"]);
        assert_eq!(config.policy.network.url_fields.len(), 4);
        assert_eq!(
            config.policy.category_overrides.get("git"),
            Some(&PluginCategory::Subprocess)
        );
    }

    #[test]
    fn test_layered_files_merge_keys() {
        let temp_dir = TempDir::new().unwrap();
        let system = temp_dir.path().join("system.toml");
        let user = temp_dir.path().join("user.toml");
        fs::write(
            &system,
            "[dispatcher]\ndefault_timeout_ms = 1000\nfault_threshold = 7\n",
        )
        .unwrap();
        fs::write(&user, "[dispatcher]\ndefault_timeout_ms = 5000\n").unwrap();

        let config = HostConfig::from_files(&[system, user]).unwrap();
        assert_eq!(config.dispatcher.default_timeout_ms, 5000);
        // Not named by the later file, so the earlier value survives
        assert_eq!(config.dispatcher.fault_threshold, 7);
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let err = HostConfig::from_files(&[PathBuf::from("/nonexistent/toolhost.toml")])
            .unwrap_err();
        assert!(matches!(err, ConfigError::Read(_)));
    }

    #[test]
    fn test_malformed_file_is_parse_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("bad.toml");
        fs::write(&path, "[dispatcher\n").unwrap();
        let err = HostConfig::from_files(&[path]).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("TOOLHOST_PLUGIN_DIR", "/opt/plugins"),
            ("TOOLHOST_TIMEOUT_MS", "1500"),
            ("TOOLHOST_FS_ROOT", "/srv/data"),
        ]
        .into_iter()
        .collect();

        let mut config = HostConfig::default();
        config.apply_env_overrides(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(config.plugins.directory, PathBuf::from("/opt/plugins"));
        assert_eq!(config.dispatcher.default_timeout_ms, 1500);
        assert_eq!(config.policy.filesystem.root, PathBuf::from("/srv/data"));
    }

    #[test]
    fn test_invalid_env_timeout_ignored() {
        let mut config = HostConfig::default();
        config.apply_env_overrides(|key| {
            (key == "TOOLHOST_TIMEOUT_MS").then(|| "soon".to_string())
        });
        assert_eq!(config.dispatcher.default_timeout_ms, 30_000);
    }
}
