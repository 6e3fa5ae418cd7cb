//! Plugin loader
//!
//! Discovers plugin libraries, opens them, negotiates the ABI version and
//! wraps each one into a [`Plugin`] the dispatcher can drive.

use super::abi::{CancelFlag, DescribeReply, EntryFn, PluginVTable, ABI_VERSION, ENTRY_SYMBOL};
use super::contract::{Plugin, PluginMetadata};
use crate::config::PluginConfig;
use crate::envelope::{FailureKind, InvocationResult};
use crate::error::{LoadError, PluginError};
use crate::schema::ToolDescriptor;
use async_trait::async_trait;
use libloading::Library;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::ffi::{c_char, c_void, CStr, CString};
use std::fs;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Opens plugin libraries
#[derive(Debug, Default, Clone)]
pub struct PluginLoader;

impl PluginLoader {
    /// Create a new plugin loader
    pub fn new() -> Self {
        Self
    }

    /// Open the library at `origin` and negotiate the plugin contract
    pub fn load(&self, origin: &Path) -> Result<LibraryPlugin, LoadError> {
        let origin_str = origin.display().to_string();

        if !origin.is_file() {
            return Err(LoadError::OriginNotFound {
                origin: origin_str,
                reason: "no such file".to_string(),
            });
        }

        // SAFETY: loading a library runs its initializers; plugin libraries
        // are trusted to the same degree as the host binary.
        let library = unsafe { Library::new(origin) }.map_err(|e| LoadError::OriginNotFound {
            origin: origin_str.clone(),
            reason: e.to_string(),
        })?;

        debug!("Opened plugin library {}", origin_str);
        resolve_entry(library, &origin_str)
    }

    /// Library paths selected by the plugin configuration, in load order
    pub fn discover(&self, config: &PluginConfig) -> Vec<PathBuf> {
        if !config.enabled {
            debug!("Plugins disabled in configuration");
            return Vec::new();
        }

        let dir = &config.directory;
        if !dir.is_dir() {
            debug!("Plugin directory does not exist: {:?}", dir);
            return Vec::new();
        }

        // If specific plugins are configured, load only those
        if !config.load.is_empty() {
            return config
                .load
                .iter()
                .filter_map(|name| {
                    let found = library_candidates(dir, name).into_iter().find(|p| p.is_file());
                    if found.is_none() {
                        warn!("Configured plugin '{}' not found in {:?}", name, dir);
                    }
                    found
                })
                .collect();
        }

        if !config.auto_load {
            return Vec::new();
        }

        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Failed to read plugin directory {:?}: {}", dir, e);
                return Vec::new();
            }
        };

        let mut found: Vec<PathBuf> = entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| {
                let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
                // Skip hidden files and anything that is not a dynamic library
                !name.starts_with('.')
                    && path.is_file()
                    && path.extension().and_then(|e| e.to_str())
                        == Some(std::env::consts::DLL_EXTENSION)
            })
            .collect();
        found.sort();
        found
    }
}

/// Paths a configured plugin name may refer to
fn library_candidates(dir: &Path, name: &str) -> Vec<PathBuf> {
    let ext = std::env::consts::DLL_EXTENSION;
    let prefix = std::env::consts::DLL_PREFIX;
    vec![
        dir.join(name),
        dir.join(format!("{name}.{ext}")),
        dir.join(format!("{prefix}{name}.{ext}")),
    ]
}

/// Resolve the entry symbol of an opened library
pub(crate) fn resolve_entry(library: Library, origin: &str) -> Result<LibraryPlugin, LoadError> {
    let entry: EntryFn = {
        // SAFETY: the symbol type is fixed by the ABI; a library exporting
        // the name with another signature violates the plugin contract.
        let symbol = unsafe { library.get::<EntryFn>(ENTRY_SYMBOL.as_bytes()) }.map_err(|_| {
            LoadError::SymbolMissing {
                origin: origin.to_string(),
                symbol: ENTRY_SYMBOL.to_string(),
            }
        })?;
        *symbol
    };

    // SAFETY: the entry point takes no arguments and returns a static table
    let vtable = unsafe { entry() };
    LibraryPlugin::from_vtable(origin, vtable, Some(library))
}

/// Plugin instance living inside a dynamic library
struct LibraryInstance {
    vtable: PluginVTable,
    instance: NonNull<c_void>,
    metadata: PluginMetadata,
    origin: String,
    // Dropped after `instance` is destroyed
    _library: Option<Library>,
}

// SAFETY: the contract requires plugin instances to be `Send + Sync`; the
// exported glue only hands out shared references to the instance.
unsafe impl Send for LibraryInstance {}
unsafe impl Sync for LibraryInstance {}

impl Drop for LibraryInstance {
    fn drop(&mut self) {
        debug!("Destroying plugin instance from {}", self.origin);
        // SAFETY: `instance` came from this table's `create` and is destroyed once
        unsafe { (self.vtable.destroy)(self.instance.as_ptr()) };
    }
}

impl LibraryInstance {
    /// Copy a plugin-owned string and release it through the plugin
    fn take_string(&self, raw: *mut c_char) -> Option<String> {
        if raw.is_null() {
            return None;
        }
        // SAFETY: non-null strings returned by the glue are NUL-terminated
        let text = unsafe { CStr::from_ptr(raw) }.to_string_lossy().into_owned();
        unsafe { (self.vtable.free_string)(raw) };
        Some(text)
    }

    fn take_json<T: DeserializeOwned>(&self, raw: *mut c_char, what: &str) -> Result<T, String> {
        let text = self
            .take_string(raw)
            .ok_or_else(|| format!("plugin returned no {what}"))?;
        serde_json::from_str(&text).map_err(|e| format!("plugin returned malformed {what}: {e}"))
    }

    fn call_execute(&self, operation: &CStr, arguments: &CStr, flag: &CancelFlag) -> InvocationResult {
        // SAFETY: all pointers stay valid for the duration of the call
        let raw = unsafe {
            (self.vtable.execute)(
                self.instance.as_ptr(),
                operation.as_ptr(),
                arguments.as_ptr(),
                flag,
            )
        };
        self.take_json(raw, "result").unwrap_or_else(|e| {
            InvocationResult::failure_with(FailureKind::PluginFault, e, false)
        })
    }
}

/// [`Plugin`] backed by a dynamic library
#[derive(Clone)]
pub struct LibraryPlugin {
    inner: Arc<LibraryInstance>,
}

impl std::fmt::Debug for LibraryPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LibraryPlugin")
            .field("origin", &self.inner.origin)
            .field("metadata", &self.inner.metadata)
            .finish()
    }
}

impl LibraryPlugin {
    /// Negotiate with a plugin function table.
    ///
    /// Only `abi_version` is read before the version check passes.
    pub(crate) fn from_vtable(
        origin: &str,
        vtable: *const PluginVTable,
        library: Option<Library>,
    ) -> Result<Self, LoadError> {
        let init_failed = |reason: String| LoadError::InitializationFailed {
            origin: origin.to_string(),
            reason,
        };

        if vtable.is_null() {
            return Err(init_failed("entry point returned a null table".to_string()));
        }

        // SAFETY: every ABI revision starts with a u32 version token
        let found = unsafe { std::ptr::read(vtable as *const u32) };
        if found != ABI_VERSION {
            return Err(LoadError::VersionMismatch {
                origin: origin.to_string(),
                expected: ABI_VERSION,
                found,
            });
        }

        // SAFETY: the version matches, so the table has this layout
        let vtable = unsafe { *vtable };
        let instance = NonNull::new(unsafe { (vtable.create)() })
            .ok_or_else(|| init_failed("plugin constructor failed".to_string()))?;

        let mut loaded = LibraryInstance {
            vtable,
            instance,
            metadata: PluginMetadata::new("", Default::default()),
            origin: origin.to_string(),
            _library: library,
        };

        let raw = unsafe { (vtable.metadata)(instance.as_ptr()) };
        loaded.metadata = loaded.take_json(raw, "metadata").map_err(init_failed)?;
        if loaded.metadata.name.trim().is_empty() {
            return Err(init_failed("plugin metadata has an empty name".to_string()));
        }

        info!(
            "Loaded plugin library '{}' v{} from {}",
            loaded.metadata.name, loaded.metadata.version, origin
        );
        Ok(Self {
            inner: Arc::new(loaded),
        })
    }

    pub fn origin(&self) -> &str {
        &self.inner.origin
    }
}

/// Aborts the wrapped task when dropped
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[async_trait]
impl Plugin for LibraryPlugin {
    fn metadata(&self) -> PluginMetadata {
        self.inner.metadata.clone()
    }

    fn describe(&self) -> Result<Vec<ToolDescriptor>, PluginError> {
        let raw = unsafe { (self.inner.vtable.describe)(self.inner.instance.as_ptr()) };
        match self.inner.take_json(raw, "descriptors").map_err(PluginError::new)? {
            DescribeReply::Ok(tools) => Ok(tools),
            DescribeReply::Error(e) => Err(PluginError::new(e)),
        }
    }

    async fn execute(
        &self,
        operation: &str,
        arguments: Value,
        cancel: CancellationToken,
    ) -> InvocationResult {
        let operation = match CString::new(operation) {
            Ok(op) => op,
            Err(_) => {
                return InvocationResult::failure(
                    FailureKind::InvalidArguments,
                    "operation name contains a NUL byte",
                )
            }
        };
        // serde_json escapes control characters, so no interior NUL can appear
        let arguments = match serde_json::to_string(&arguments).map(CString::new) {
            Ok(Ok(args)) => args,
            _ => {
                return InvocationResult::failure(
                    FailureKind::InvalidArguments,
                    "arguments could not be encoded",
                )
            }
        };

        let flag = Arc::new(CancelFlag::new());
        let _watcher = {
            let flag = flag.clone();
            AbortOnDrop(tokio::spawn(async move {
                cancel.cancelled().await;
                flag.cancel();
            }))
        };

        let inner = self.inner.clone();
        let joined = tokio::task::spawn_blocking(move || {
            inner.call_execute(&operation, &arguments, &flag)
        })
        .await;

        joined.unwrap_or_else(|e| {
            InvocationResult::failure_with(
                FailureKind::PluginFault,
                format!("plugin call did not complete: {e}"),
                false,
            )
        })
    }
}
