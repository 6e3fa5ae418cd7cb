//! C ABI between the host and plugin libraries
//!
//! A plugin library exports one symbol, [`ENTRY_SYMBOL`], returning a pointer
//! to a [`PluginVTable`]. The host reads only `abi_version` (always the
//! first field) before deciding whether the rest of the table can be trusted.
//! Everything else crosses the boundary as UTF-8 JSON strings owned by the
//! plugin and released through its own `free_string`.
//!
//! Plugin authors never touch this module directly; [`export_plugin!`]
//! generates the glue for any [`Plugin`] implementation.
//!
//! [`export_plugin!`]: crate::export_plugin

use super::contract::Plugin;
use crate::envelope::{FailureKind, InvocationResult};
use crate::schema::ToolDescriptor;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::ffi::{c_char, c_void, CStr, CString};
use std::panic::{self, AssertUnwindSafe, UnwindSafe};
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Version token both sides must agree on
pub const ABI_VERSION: u32 = 1;

/// Name of the exported entry point
pub const ENTRY_SYMBOL: &str = "toolhost_plugin_entry";

/// How often the plugin-side glue looks at the host's cancel flag
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Host-owned cancellation flag shared with a running call
#[repr(C)]
#[derive(Debug, Default)]
pub struct CancelFlag {
    cancelled: AtomicBool,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

pub type CreateFn = unsafe extern "C" fn() -> *mut c_void;
pub type JsonFn = unsafe extern "C" fn(instance: *mut c_void) -> *mut c_char;
pub type ExecuteFn = unsafe extern "C" fn(
    instance: *mut c_void,
    operation: *const c_char,
    arguments: *const c_char,
    cancel: *const CancelFlag,
) -> *mut c_char;
pub type FreeStringFn = unsafe extern "C" fn(s: *mut c_char);
pub type DestroyFn = unsafe extern "C" fn(instance: *mut c_void);
pub type EntryFn = unsafe extern "C" fn() -> *const PluginVTable;

/// Function table exported by a plugin library
#[repr(C)]
#[derive(Clone, Copy)]
pub struct PluginVTable {
    /// Must stay the first field across every ABI revision
    pub abi_version: u32,
    /// Instantiate the plugin; null on failure
    pub create: CreateFn,
    /// JSON-encoded `PluginMetadata`
    pub metadata: JsonFn,
    /// JSON-encoded [`DescribeReply`]
    pub describe: JsonFn,
    /// JSON-encoded `InvocationResult`
    pub execute: ExecuteFn,
    pub free_string: FreeStringFn,
    pub destroy: DestroyFn,
}

/// Wire form of `Plugin::describe`
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DescribeReply {
    Ok(Vec<ToolDescriptor>),
    Error(String),
}

/// Build the function table for plugin type `P`.
///
/// `_ctor` only pins down `P`; `create` is the `extern "C"` wrapper around
/// the same constructor.
pub fn vtable_like<P: Plugin + 'static>(create: CreateFn, _ctor: fn() -> P) -> PluginVTable {
    PluginVTable {
        abi_version: ABI_VERSION,
        create,
        metadata: metadata_glue::<P>,
        describe: describe_glue::<P>,
        execute: execute_glue::<P>,
        free_string: free_string_glue,
        destroy: destroy_glue::<P>,
    }
}

/// Run a constructor and leak the instance for the host; null if it panics
pub fn create_instance<P: Plugin + 'static>(ctor: impl FnOnce() -> P + UnwindSafe) -> *mut c_void {
    match panic::catch_unwind(ctor) {
        Ok(plugin) => Box::into_raw(Box::new(plugin)) as *mut c_void,
        Err(_) => ptr::null_mut(),
    }
}

/// Best-effort text of a panic payload
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn into_c_string(s: String) -> *mut c_char {
    match CString::new(s) {
        Ok(c) => c.into_raw(),
        Err(_) => ptr::null_mut(),
    }
}

unsafe extern "C" fn metadata_glue<P: Plugin>(instance: *mut c_void) -> *mut c_char {
    let json = panic::catch_unwind(AssertUnwindSafe(|| {
        let plugin = unsafe { &*(instance as *const P) };
        serde_json::to_string(&plugin.metadata())
    }));
    match json {
        Ok(Ok(s)) => into_c_string(s),
        _ => ptr::null_mut(),
    }
}

unsafe extern "C" fn describe_glue<P: Plugin>(instance: *mut c_void) -> *mut c_char {
    let reply = panic::catch_unwind(AssertUnwindSafe(|| {
        let plugin = unsafe { &*(instance as *const P) };
        match plugin.describe() {
            Ok(tools) => DescribeReply::Ok(tools),
            Err(e) => DescribeReply::Error(e.to_string()),
        }
    }))
    .unwrap_or_else(|payload| {
        DescribeReply::Error(format!("describe panicked: {}", panic_message(&*payload)))
    });

    match serde_json::to_string(&reply) {
        Ok(s) => into_c_string(s),
        Err(_) => ptr::null_mut(),
    }
}

unsafe extern "C" fn execute_glue<P: Plugin>(
    instance: *mut c_void,
    operation: *const c_char,
    arguments: *const c_char,
    cancel: *const CancelFlag,
) -> *mut c_char {
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        let plugin = unsafe { &*(instance as *const P) };
        let operation = unsafe { CStr::from_ptr(operation) }
            .to_string_lossy()
            .into_owned();
        let arguments = match serde_json::from_slice(unsafe { CStr::from_ptr(arguments) }.to_bytes())
        {
            Ok(v) => v,
            Err(e) => {
                return InvocationResult::failure(
                    FailureKind::InvalidArguments,
                    format!("arguments are not valid JSON: {e}"),
                )
            }
        };
        let flag = unsafe { cancel.as_ref() };
        run_to_completion(plugin, &operation, arguments, flag)
    }))
    .unwrap_or_else(|payload| {
        InvocationResult::failure_with(
            FailureKind::PluginFault,
            format!("plugin panicked: {}", panic_message(&*payload)),
            false,
        )
    });

    match serde_json::to_string(&result) {
        Ok(s) => into_c_string(s),
        Err(_) => ptr::null_mut(),
    }
}

unsafe extern "C" fn free_string_glue(s: *mut c_char) {
    if !s.is_null() {
        drop(unsafe { CString::from_raw(s) });
    }
}

unsafe extern "C" fn destroy_glue<P: Plugin>(instance: *mut c_void) {
    if instance.is_null() {
        return;
    }
    let _ = panic::catch_unwind(AssertUnwindSafe(|| {
        drop(unsafe { Box::from_raw(instance as *mut P) });
    }));
}

struct SetOnDrop<'a>(&'a AtomicBool);

impl Drop for SetOnDrop<'_> {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Release);
    }
}

/// Drive an async `execute` on the calling thread, mirroring the host's
/// cancel flag into a `CancellationToken` from a watcher thread.
///
/// The library has no async runtime of its own, so plugins exported this
/// way must not depend on runtime-specific I/O.
fn run_to_completion<P: Plugin>(
    plugin: &P,
    operation: &str,
    arguments: serde_json::Value,
    flag: Option<&CancelFlag>,
) -> InvocationResult {
    let token = CancellationToken::new();
    let done = AtomicBool::new(false);

    std::thread::scope(|scope| {
        if let Some(flag) = flag {
            let token = token.clone();
            let done = &done;
            scope.spawn(move || {
                while !done.load(Ordering::Acquire) {
                    if flag.is_cancelled() {
                        token.cancel();
                        break;
                    }
                    std::thread::sleep(CANCEL_POLL_INTERVAL);
                }
            });
        }

        // Also stops the watcher when execute unwinds
        let _done = SetOnDrop(&done);
        futures::executor::block_on(plugin.execute(operation, arguments, token.clone()))
    })
}

/// Export a [`Plugin`](crate::plugins::Plugin) from a `cdylib`.
///
/// ```ignore
/// toolhost::export_plugin!(TimePlugin::new);
/// ```
///
/// The argument is a path to a zero-argument constructor.
#[macro_export]
macro_rules! export_plugin {
    ($ctor:path) => {
        #[no_mangle]
        pub extern "C" fn toolhost_plugin_entry() -> *const $crate::plugins::abi::PluginVTable {
            unsafe extern "C" fn __toolhost_create() -> *mut ::std::ffi::c_void {
                $crate::plugins::abi::create_instance($ctor)
            }

            static VTABLE: ::std::sync::OnceLock<$crate::plugins::abi::PluginVTable> =
                ::std::sync::OnceLock::new();
            VTABLE.get_or_init(|| $crate::plugins::abi::vtable_like(__toolhost_create, $ctor))
                as *const $crate::plugins::abi::PluginVTable
        }
    };
}
