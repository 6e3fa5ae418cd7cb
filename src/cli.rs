//! Command-line argument parsing for toolhost

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// toolhost - load tool plugins and dispatch tool calls
#[derive(Parser, Debug)]
#[command(name = "toolhost")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,

    /// Load an additional plugin library (repeatable, before the subcommand)
    #[arg(short, long = "plugin", value_name = "PATH")]
    pub plugins: Vec<PathBuf>,

    /// Do not register the built-in time and filesystem plugins
    #[arg(long, global = true)]
    pub no_builtins: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Command {
    /// List registered plugins and their tools
    List {
        /// Print tool descriptors as JSON
        #[arg(long)]
        json: bool,
    },

    /// Invoke a tool and print its result
    Invoke {
        /// Tool name
        tool: String,

        /// Arguments as a JSON object
        #[arg(short, long, value_name = "JSON", default_value = "{}")]
        args: String,

        /// Deadline in milliseconds (defaults to the configured timeout)
        #[arg(short, long, value_name = "MS")]
        timeout_ms: Option<u64>,

        /// Correlation id to use instead of a generated one
        #[arg(long, value_name = "ID")]
        correlation_id: Option<String>,
    },

    /// Load a plugin library and print what it declares, without registering it
    Inspect {
        /// Path to the library
        #[arg(value_name = "LIBRARY")]
        library: PathBuf,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_list() {
        let args = Args::parse_from(["toolhost", "list"]);
        assert!(args.config.is_none());
        assert!(!args.debug);
        assert!(args.plugins.is_empty());
        assert_eq!(args.command, Command::List { json: false });
    }

    #[test]
    fn test_args_invoke() {
        let args = Args::parse_from([
            "toolhost",
            "invoke",
            "now",
            "--args",
            r#"{"utc_offset":"+02:00"}"#,
            "--timeout-ms",
            "500",
        ]);
        match args.command {
            Command::Invoke {
                tool,
                args,
                timeout_ms,
                correlation_id,
            } => {
                assert_eq!(tool, "now");
                assert!(args.contains("+02:00"));
                assert_eq!(timeout_ms, Some(500));
                assert!(correlation_id.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_args_invoke_defaults_to_empty_object() {
        let args = Args::parse_from(["toolhost", "invoke", "now"]);
        match args.command {
            Command::Invoke { args, .. } => assert_eq!(args, "{}"),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_args_global_flags() {
        let args = Args::parse_from([
            "toolhost",
            "--debug",
            "--config",
            "/tmp/toolhost.toml",
            "--plugin",
            "/opt/a.so",
            "-p",
            "/opt/c.so",
            "inspect",
            "/opt/b.so",
            "--no-builtins",
        ]);
        assert!(args.debug);
        assert!(args.no_builtins);
        assert_eq!(args.config, Some(PathBuf::from("/tmp/toolhost.toml")));
        assert_eq!(
            args.plugins,
            vec![PathBuf::from("/opt/a.so"), PathBuf::from("/opt/c.so")]
        );
        assert_eq!(
            args.command,
            Command::Inspect {
                library: PathBuf::from("/opt/b.so")
            }
        );
    }

    #[test]
    fn test_plugin_flag_after_subcommand_rejected() {
        // Repeated values would not accumulate across the subcommand boundary
        let err = Args::try_parse_from([
            "toolhost",
            "--plugin",
            "/opt/a.so",
            "list",
            "--plugin",
            "/opt/c.so",
        ])
        .unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::UnknownArgument);
    }

    #[test]
    fn test_args_require_subcommand() {
        assert!(Args::try_parse_from(["toolhost"]).is_err());
    }
}
