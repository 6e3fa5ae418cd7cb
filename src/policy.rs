//! Domain isolation policy
//!
//! Checks argument payloads against the rule set of a plugin's category
//! before any plugin code runs. Rules only look at arguments named in the
//! configuration, wherever they appear in the argument tree.

use crate::config::PolicyConfig;
use crate::error::ConfigError;
use crate::plugins::{PluginCategory, PluginMetadata};
use regex::Regex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use url::Url;

/// URL fields that hold a bare `host[:port]` instead of a URL
const HOST_FIELDS: &[&str] = &["host"];

/// A rule rejected an argument
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("argument '{field}' rejected by {category} policy: {reason}")]
pub struct PolicyViolation {
    /// JSON pointer of the offending value
    pub field: String,
    pub category: PluginCategory,
    pub reason: String,
}

#[derive(Debug)]
struct FilesystemRules {
    root: PathBuf,
    fields: HashSet<String>,
}

#[derive(Debug)]
struct NetworkRules {
    fields: HashSet<String>,
    schemes: HashSet<String>,
    allow: Vec<glob::Pattern>,
    deny: Vec<glob::Pattern>,
}

#[derive(Debug)]
struct SubprocessRules {
    argument_fields: HashSet<String>,
    directory_fields: HashSet<String>,
    working_directory: PathBuf,
    metacharacters: Vec<char>,
    blocked: Vec<Regex>,
}

/// Compiled isolation rules for every category
#[derive(Debug)]
pub struct PolicyEngine {
    filesystem: FilesystemRules,
    network: NetworkRules,
    subprocess: SubprocessRules,
    overrides: HashMap<String, PluginCategory>,
}

fn field_set(fields: &[String]) -> HashSet<String> {
    fields.iter().cloned().collect()
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        normalize_lexically(path)
    } else {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
        normalize_lexically(&cwd.join(path))
    }
}

impl PolicyEngine {
    /// Compile rules from configuration
    pub fn from_config(config: &PolicyConfig) -> Result<Self, ConfigError> {
        let globs = |patterns: &[String]| -> Result<Vec<glob::Pattern>, ConfigError> {
            patterns
                .iter()
                .map(|p| {
                    glob::Pattern::new(&p.to_ascii_lowercase()).map_err(|e| {
                        ConfigError::Invalid(format!("host pattern '{p}': {e}"))
                    })
                })
                .collect()
        };

        let blocked = config
            .subprocess
            .blocked_patterns
            .iter()
            .map(|p| {
                Regex::new(p)
                    .map_err(|e| ConfigError::Invalid(format!("blocked pattern '{p}': {e}")))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            filesystem: FilesystemRules {
                root: absolute(&config.filesystem.root),
                fields: field_set(&config.filesystem.path_fields),
            },
            network: NetworkRules {
                fields: field_set(&config.network.url_fields),
                schemes: config
                    .network
                    .allowed_schemes
                    .iter()
                    .map(|s| s.to_ascii_lowercase())
                    .collect(),
                allow: globs(&config.network.allow_hosts)?,
                deny: globs(&config.network.deny_hosts)?,
            },
            subprocess: SubprocessRules {
                argument_fields: field_set(&config.subprocess.argument_fields),
                directory_fields: field_set(&config.subprocess.working_directory_fields),
                working_directory: absolute(&config.subprocess.working_directory),
                metacharacters: config.subprocess.metacharacters.chars().collect(),
                blocked,
            },
            overrides: config.category_overrides.clone(),
        })
    }

    /// Category enforced for a plugin: the configured override or its own
    pub fn category_for(&self, metadata: &PluginMetadata) -> PluginCategory {
        self.overrides
            .get(&metadata.name)
            .copied()
            .unwrap_or(metadata.category)
    }

    /// Check arguments against the rules of `category`
    pub fn check(&self, category: PluginCategory, arguments: &Value) -> Result<(), PolicyViolation> {
        let violation = |field: String, reason: String| PolicyViolation {
            field,
            category,
            reason,
        };

        match category {
            PluginCategory::General => Ok(()),
            PluginCategory::Filesystem => {
                for found in collect_strings(arguments, &self.filesystem.fields) {
                    confine(&self.filesystem.root, found.value)
                        .map_err(|r| violation(found.pointer, r))?;
                }
                Ok(())
            }
            PluginCategory::Network => {
                for found in collect_strings(arguments, &self.network.fields) {
                    self.check_url(found.field, found.value)
                        .map_err(|r| violation(found.pointer, r))?;
                }
                Ok(())
            }
            PluginCategory::Subprocess => {
                let rules = &self.subprocess;
                for found in collect_strings(arguments, &rules.argument_fields) {
                    let value = found.value;
                    if let Some(c) = value.chars().find(|c| rules.metacharacters.contains(c)) {
                        return Err(violation(
                            found.pointer,
                            format!("contains shell metacharacter {c:?}"),
                        ));
                    }
                    if let Some(re) = rules.blocked.iter().find(|re| re.is_match(value)) {
                        return Err(violation(found.pointer, format!("matches blocked pattern '{re}'")));
                    }
                }
                for found in collect_strings(arguments, &rules.directory_fields) {
                    confine(&rules.working_directory, found.value)
                        .map_err(|r| violation(found.pointer, r))?;
                }
                Ok(())
            }
        }
    }

    /// Check the host a WHATWG-conforming client would connect to
    fn check_url(&self, field: &str, raw: &str) -> Result<(), String> {
        let rules = &self.network;
        let raw = raw.trim();

        let url = if HOST_FIELDS.contains(&field) && !raw.contains("://") {
            let not_a_host =
                |c: char| matches!(c, '/' | '\\' | '@' | '?' | '#') || c.is_whitespace();
            if raw.is_empty() || raw.contains(not_a_host) {
                return Err(format!("'{raw}' is not a bare host"));
            }
            Url::parse(&format!("http://{raw}"))
                .map_err(|e| format!("cannot parse host '{raw}': {e}"))?
        } else {
            // Clients disagree on where a backslash ends the authority
            if authority(raw).is_some_and(|a| a.contains('\\')) {
                return Err(format!("backslash in the authority of '{raw}'"));
            }
            let url = Url::parse(raw).map_err(|e| format!("cannot parse '{raw}': {e}"))?;
            if !rules.schemes.contains(url.scheme()) {
                return Err(format!("scheme '{}' is not allowed", url.scheme()));
            }
            url
        };

        let host = url
            .host_str()
            .unwrap_or_default()
            .trim_matches(|c| c == '[' || c == ']')
            .trim_end_matches('.')
            .to_ascii_lowercase();
        if host.is_empty() {
            return Err(format!("no host in '{raw}'"));
        }

        if let Some(pattern) = rules.deny.iter().find(|p| p.matches(&host)) {
            return Err(format!("host '{host}' is denied by '{pattern}'"));
        }
        if !rules.allow.is_empty() && !rules.allow.iter().any(|p| p.matches(&host)) {
            return Err(format!("host '{host}' is not in the allow list"));
        }
        Ok(())
    }
}

/// Scheme-relative authority of a URL: everything after `scheme:` and the
/// leading slashes, up to the path, query or fragment
fn authority(raw: &str) -> Option<&str> {
    let (_, rest) = raw.split_once(':')?;
    rest.trim_start_matches(['/', '\\'])
        .split(['/', '?', '#'])
        .next()
}

/// A string found under a configured field
#[derive(Debug)]
struct FieldString<'a> {
    /// JSON pointer of the string
    pointer: String,
    /// Configured field name it was found under
    field: &'a str,
    value: &'a str,
}

/// Every string held under one of `fields`, anywhere in the tree
fn collect_strings<'a>(arguments: &'a Value, fields: &HashSet<String>) -> Vec<FieldString<'a>> {
    fn strings_below<'a>(
        value: &'a Value,
        pointer: String,
        field: &'a str,
        out: &mut Vec<FieldString<'a>>,
    ) {
        match value {
            Value::String(s) => out.push(FieldString {
                pointer,
                field,
                value: s,
            }),
            Value::Array(items) => {
                for (i, item) in items.iter().enumerate() {
                    strings_below(item, format!("{pointer}/{i}"), field, out);
                }
            }
            Value::Object(map) => {
                for (key, item) in map {
                    strings_below(item, format!("{pointer}/{key}"), field, out);
                }
            }
            _ => {}
        }
    }

    fn walk<'a>(
        value: &'a Value,
        pointer: String,
        fields: &HashSet<String>,
        out: &mut Vec<FieldString<'a>>,
    ) {
        match value {
            Value::Object(map) => {
                for (key, item) in map {
                    let child = format!("{pointer}/{key}");
                    if fields.contains(key) {
                        strings_below(item, child, key, out);
                    } else {
                        walk(item, child, fields, out);
                    }
                }
            }
            Value::Array(items) => {
                for (i, item) in items.iter().enumerate() {
                    walk(item, format!("{pointer}/{i}"), fields, out);
                }
            }
            _ => {}
        }
    }

    let mut out = Vec::new();
    walk(arguments, String::new(), fields, &mut out);
    out
}

/// Collapse `.` and `..` without touching the filesystem
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                // Never climb above the filesystem root
                if !matches!(out.components().next_back(), Some(Component::RootDir) | None) {
                    out.pop();
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Resolve `candidate` against `root` and require it to stay inside
fn confine(root: &Path, candidate: &str) -> Result<PathBuf, String> {
    if candidate.contains('\0') {
        return Err("path contains a NUL byte".to_string());
    }

    let joined = root.join(candidate);
    let lexical = normalize_lexically(&joined);
    if !lexical.starts_with(root) {
        return Err(format!(
            "'{candidate}' resolves outside {}",
            root.display()
        ));
    }

    // Symlinks along the existing part of the path may still lead out
    if let Ok(canonical_root) = root.canonicalize() {
        let mut existing = lexical.as_path();
        loop {
            match existing.canonicalize() {
                Ok(canonical) => {
                    if !canonical.starts_with(&canonical_root) {
                        return Err(format!(
                            "'{candidate}' escapes {} through a symlink",
                            root.display()
                        ));
                    }
                    break;
                }
                // An entry that exists but cannot be resolved is a dangling
                // symlink whose target could be created outside the root
                Err(_) if fs::symlink_metadata(existing).is_ok() => {
                    return Err(format!(
                        "'{candidate}' goes through the unresolvable link {}",
                        existing.display()
                    ));
                }
                Err(_) => {}
            }
            match existing.parent() {
                Some(parent) => existing = parent,
                None => break,
            }
        }
    }

    Ok(lexical)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PolicyConfig;
    use serde_json::json;
    use std::fs;
    use tempfile::TempDir;

    fn engine_with_root(root: &Path) -> PolicyEngine {
        let mut config = PolicyConfig::default();
        config.filesystem.root = root.to_path_buf();
        config.subprocess.working_directory = root.to_path_buf();
        PolicyEngine::from_config(&config).unwrap()
    }

    fn engine() -> PolicyEngine {
        engine_with_root(Path::new("/srv/data"))
    }

    #[test]
    fn test_general_has_no_rules() {
        let args = json!({"path": "../../etc/passwd", "url": "ftp://x"});
        assert!(engine().check(PluginCategory::General, &args).is_ok());
    }

    #[test]
    fn test_relative_path_inside_root() {
        let args = json!({"path": "reports/2026/q1.csv"});
        assert!(engine().check(PluginCategory::Filesystem, &args).is_ok());
    }

    #[test]
    fn test_traversal_rejected() {
        let args = json!({"path": "reports/../../../etc/passwd"});
        let err = engine().check(PluginCategory::Filesystem, &args).unwrap_err();
        assert_eq!(err.field, "/path");
        assert!(err.reason.contains("outside"));
    }

    #[test]
    fn test_traversal_that_returns_is_allowed() {
        let args = json!({"path": "a/../b/./c.txt"});
        assert!(engine().check(PluginCategory::Filesystem, &args).is_ok());
    }

    #[test]
    fn test_absolute_path_outside_root() {
        let args = json!({"source": "/etc/shadow"});
        assert!(engine().check(PluginCategory::Filesystem, &args).is_err());

        let args = json!({"source": "/srv/data/ok.txt"});
        assert!(engine().check(PluginCategory::Filesystem, &args).is_ok());
    }

    #[test]
    fn test_sibling_prefix_is_outside() {
        let args = json!({"path": "/srv/database/secrets"});
        assert!(engine().check(PluginCategory::Filesystem, &args).is_err());
    }

    #[test]
    fn test_nested_path_fields() {
        let args = json!({
            "operations": [
                {"source": "in.txt", "destination": "out.txt"},
                {"source": "in.txt", "destination": "../../escape.txt"}
            ]
        });
        let err = engine().check(PluginCategory::Filesystem, &args).unwrap_err();
        assert_eq!(err.field, "/operations/1/destination");
    }

    #[test]
    fn test_unlisted_fields_ignored() {
        let args = json!({"content": "../../etc/passwd"});
        assert!(engine().check(PluginCategory::Filesystem, &args).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_escape_rejected() {
        let root = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        fs::write(outside.path().join("secret.txt"), "s3cr3t").unwrap();
        std::os::unix::fs::symlink(outside.path(), root.path().join("link")).unwrap();

        let policy = engine_with_root(root.path());
        let args = json!({"path": "link/secret.txt"});
        let err = policy.check(PluginCategory::Filesystem, &args).unwrap_err();
        assert!(err.reason.contains("symlink"));

        // Not yet existing files below a real directory are fine
        fs::create_dir(root.path().join("real")).unwrap();
        let args = json!({"path": "real/new.txt"});
        assert!(policy.check(PluginCategory::Filesystem, &args).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn test_dangling_symlink_rejected() {
        let root = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        let target = outside.path().join("not-yet-created");
        std::os::unix::fs::symlink(&target, root.path().join("link")).unwrap();

        let policy = engine_with_root(root.path());
        for path in ["link", "link/x"] {
            let err = policy
                .check(PluginCategory::Filesystem, &json!({"path": path}))
                .unwrap_err();
            assert!(err.reason.contains("unresolvable link"), "{}", err.reason);
        }
        assert!(!target.exists());
    }

    #[test]
    fn test_url_scheme() {
        let policy = engine();
        let ok = json!({"url": "https://docs.rs/tokio"});
        assert!(policy.check(PluginCategory::Network, &ok).is_ok());

        let err = policy
            .check(PluginCategory::Network, &json!({"url": "file:///etc/passwd"}))
            .unwrap_err();
        assert!(err.reason.contains("scheme"));
    }

    #[test]
    fn test_default_deny_metadata_endpoint() {
        let args = json!({"url": "http://169.254.169.254/latest/meta-data"});
        assert!(engine().check(PluginCategory::Network, &args).is_err());
    }

    #[test]
    fn test_allow_and_deny_lists() {
        let mut config = PolicyConfig::default();
        config.network.allow_hosts = vec!["*.example.com".into(), "example.com".into()];
        config.network.deny_hosts = vec!["internal.example.com".into()];
        let policy = PolicyEngine::from_config(&config).unwrap();

        let check = |url: &str| policy.check(PluginCategory::Network, &json!({"url": url}));
        assert!(check("https://api.example.com/v1").is_ok());
        assert!(check("https://user:pw@EXAMPLE.com:8443/").is_ok());
        assert!(check("https://internal.example.com/").is_err());
        assert!(check("https://example.org/").is_err());
    }

    #[test]
    fn test_bare_host_field() {
        let mut config = PolicyConfig::default();
        config.network.deny_hosts = vec!["localhost".into()];
        let policy = PolicyEngine::from_config(&config).unwrap();
        assert!(policy
            .check(PluginCategory::Network, &json!({"host": "localhost:6379"}))
            .is_err());
        assert!(policy
            .check(PluginCategory::Network, &json!({"host": "db.example.net"}))
            .is_ok());
    }

    #[test]
    fn test_empty_host_rejected() {
        let policy = engine();
        assert!(policy
            .check(PluginCategory::Network, &json!({"url": "http://:80/"}))
            .is_err());
        assert!(policy
            .check(PluginCategory::Network, &json!({"host": ""}))
            .is_err());
    }

    #[test]
    fn test_backslash_authority_cannot_reach_other_host() {
        let mut config = PolicyConfig::default();
        config.network.allow_hosts = vec!["allowed.com".into()];
        let policy = PolicyEngine::from_config(&config).unwrap();
        let check = |url: &str| policy.check(PluginCategory::Network, &json!({"url": url}));

        assert!(check("http://allowed.com/").is_ok());
        let err = check("http://evil.com\\@allowed.com/").unwrap_err();
        assert!(err.reason.contains("backslash"));
        assert!(check("http:\\\\evil.com\\@allowed.com/").is_err());
        assert!(check("http://evil.com#@allowed.com/").is_err());
        assert!(check("http://evil.com?@allowed.com/").is_err());
    }

    #[test]
    fn test_checked_host_is_the_parsed_host() {
        let policy = engine();
        let check = |url: &str| policy.check(PluginCategory::Network, &json!({"url": url}));
        // Hex and dotted-decimal spellings of the metadata address
        assert!(check("http://0xA9FEA9FE/latest").is_err());
        assert!(check("http://169.254.169.254./").is_err());
        // Only the `host` field accepts a value without a scheme
        assert!(check("example.com/path").is_err());
        assert!(policy
            .check(PluginCategory::Network, &json!({"endpoint": "localhost:8080"}))
            .is_err());
    }

    #[test]
    fn test_bare_host_must_be_only_a_host() {
        let mut config = PolicyConfig::default();
        config.network.allow_hosts = vec!["allowed.com".into()];
        let policy = PolicyEngine::from_config(&config).unwrap();
        let check = |host: &str| policy.check(PluginCategory::Network, &json!({"host": host}));

        assert!(check("allowed.com:443").is_ok());
        assert!(check("evil.com\\@allowed.com").is_err());
        assert!(check("evil.com/@allowed.com").is_err());
        assert!(check("allowed.com evil.com").is_err());
    }

    #[test]
    fn test_metacharacters_rejected() {
        let policy = engine();
        let ok = json!({"args": ["log", "--oneline", "-n", "5"], "ref": "main"});
        assert!(policy.check(PluginCategory::Subprocess, &ok).is_ok());

        let err = policy
            .check(PluginCategory::Subprocess, &json!({"ref": "main; rm -rf /"}))
            .unwrap_err();
        assert!(err.reason.contains("metacharacter"));

        let err = policy
            .check(PluginCategory::Subprocess, &json!({"args": ["log", "$(id)"]}))
            .unwrap_err();
        assert_eq!(err.field, "/args/1");
    }

    #[test]
    fn test_line_breaks_are_metacharacters() {
        let policy = engine();
        for value in ["main\nid", "main\rid", "main\\\nid"] {
            let err = policy
                .check(PluginCategory::Subprocess, &json!({"ref": value}))
                .unwrap_err();
            assert_eq!(err.field, "/ref");
            assert!(err.reason.contains("metacharacter"), "{}", err.reason);
        }
        let err = policy
            .check(PluginCategory::Subprocess, &json!({"args": ["a\nb"]}))
            .unwrap_err();
        assert!(err.reason.contains("'\\n'"), "{}", err.reason);
    }

    #[test]
    fn test_blocked_argument_patterns() {
        let args = json!({"args": ["fetch", "--upload-pack=touch /tmp/x"]});
        let err = engine().check(PluginCategory::Subprocess, &args).unwrap_err();
        assert!(err.reason.contains("blocked"));
    }

    #[test]
    fn test_working_directory_confined() {
        let policy = engine();
        assert!(policy
            .check(PluginCategory::Subprocess, &json!({"repo": "projects/app"}))
            .is_ok());
        assert!(policy
            .check(PluginCategory::Subprocess, &json!({"cwd": "/home/someone"}))
            .is_err());
    }

    #[test]
    fn test_category_override() {
        let mut config = PolicyConfig::default();
        config
            .category_overrides
            .insert("git".into(), PluginCategory::Subprocess);
        let policy = PolicyEngine::from_config(&config).unwrap();

        let git = PluginMetadata::new("git", PluginCategory::General);
        let time = PluginMetadata::new("time", PluginCategory::General);
        assert_eq!(policy.category_for(&git), PluginCategory::Subprocess);
        assert_eq!(policy.category_for(&time), PluginCategory::General);
    }

    #[test]
    fn test_invalid_patterns_fail_compilation() {
        let mut config = PolicyConfig::default();
        config.subprocess.blocked_patterns = vec!["[".into()];
        assert!(PolicyEngine::from_config(&config).is_err());
    }

    #[test]
    fn test_normalize_lexically() {
        assert_eq!(normalize_lexically(Path::new("/a/b/../c/./d")), PathBuf::from("/a/c/d"));
        assert_eq!(normalize_lexically(Path::new("/../../etc")), PathBuf::from("/etc"));
    }
}
