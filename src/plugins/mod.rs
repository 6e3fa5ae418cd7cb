//! Plugin system for toolhost
//!
//! Tool libraries implement [`Plugin`] and are either compiled into the host
//! or loaded from dynamic libraries through a versioned C ABI.

pub mod abi;
pub mod builtin;
mod contract;
mod loader;

pub use builtin::{FilesystemPlugin, TimePlugin};
pub use contract::{Plugin, PluginCategory, PluginMetadata};
pub use loader::{LibraryPlugin, PluginLoader};
