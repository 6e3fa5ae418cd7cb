//! toolhost - load tool plugins and dispatch tool calls
//!
//! This is the main entry point for the toolhost binary.

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

mod cli;

use cli::{Args, Command};
use toolhost::config::HostConfig;
use toolhost::plugins::{FilesystemPlugin, Plugin, PluginLoader, TimePlugin};
use toolhost::{Dispatcher, InvocationEnvelope};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logging
    init_logging(args.debug);

    info!("Starting toolhost v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = match HostConfig::load(args.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            HostConfig::default()
        }
    };

    match args.command {
        Command::Inspect { library } => inspect(&library),
        Command::List { json } => {
            let dispatcher = build_dispatcher(&config, &args.plugins, args.no_builtins)?;
            list(&dispatcher, json)
        }
        Command::Invoke {
            tool,
            args: raw_arguments,
            timeout_ms,
            correlation_id,
        } => {
            let arguments: Value = serde_json::from_str(&raw_arguments)
                .with_context(|| format!("--args is not valid JSON: {raw_arguments}"))?;

            let mut envelope = InvocationEnvelope::new(tool, arguments);
            if let Some(ms) = timeout_ms {
                envelope = envelope.with_timeout(Duration::from_millis(ms));
            }
            if let Some(id) = correlation_id {
                envelope = envelope.with_correlation_id(id);
            }

            let dispatcher = Arc::new(build_dispatcher(&config, &args.plugins, args.no_builtins)?);
            let pending = dispatcher.submit(envelope);
            let correlation_id = pending.correlation_id().clone();
            let outcome = pending.result();
            tokio::pin!(outcome);

            let result = tokio::select! {
                result = &mut outcome => result,
                _ = tokio::signal::ctrl_c() => {
                    warn!("Interrupted, cancelling invocation {}", correlation_id);
                    dispatcher.cancel(&correlation_id);
                    outcome.await
                }
            };

            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.is_success() {
                std::process::exit(1);
            }
            Ok(())
        }
    }
}

/// Create the dispatcher and register plugins in load order:
/// built-ins, configured libraries, then `--plugin` libraries
fn build_dispatcher(config: &HostConfig, plugins: &[PathBuf], no_builtins: bool) -> Result<Dispatcher> {
    let dispatcher = Dispatcher::from_config(config).context("Invalid configuration")?;

    if !no_builtins {
        dispatcher.register_plugin(Arc::new(TimePlugin::new()))?;
        dispatcher.register_plugin(Arc::new(FilesystemPlugin::new(
            config.policy.filesystem.root.clone(),
        )))?;
    }

    for (path, result) in dispatcher.load_configured(&config.plugins) {
        if let Ok(id) = result {
            info!("Loaded {:?} as {}", path, id);
        }
    }

    for path in plugins {
        dispatcher
            .load_plugin(path)
            .with_context(|| format!("Failed to load plugin {}", path.display()))?;
    }

    Ok(dispatcher)
}

fn list(dispatcher: &Dispatcher, as_json: bool) -> Result<()> {
    if as_json {
        println!("{}", serde_json::to_string_pretty(&dispatcher.list_tools())?);
        return Ok(());
    }

    for plugin in dispatcher.plugins() {
        println!(
            "{} {} [{}] {}",
            plugin.name,
            plugin.version,
            plugin.category.as_str(),
            plugin.origin
        );
        for tool in &plugin.tools {
            println!("  {}", tool);
        }
    }
    Ok(())
}

fn inspect(library: &Path) -> Result<()> {
    let plugin = PluginLoader::new().load(library)?;
    let descriptors = match plugin.describe() {
        Ok(descriptors) => descriptors,
        Err(e) => bail!("{} failed to describe its tools: {}", plugin.origin(), e),
    };

    let report = json!({
        "origin": plugin.origin(),
        "metadata": plugin.metadata(),
        "tools": descriptors,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Initialize the logging/tracing subsystem
fn init_logging(debug: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();
}
