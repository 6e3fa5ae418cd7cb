//! `time` tool plugin as a dynamically loadable library.
//!
//! Build with `cargo build -p toolhost-time` and point the host at the
//! resulting `libtoolhost_time.so` / `.dylib` / `.dll`.

use toolhost::plugins::builtin::TimePlugin;

toolhost::export_plugin!(TimePlugin::new);
