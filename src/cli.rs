//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Cluster authentication gateway - encrypted, self-contained session tokens
#[derive(Parser, Debug)]
#[command(name = "cluster-auth-gateway")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "AUTH_GATEWAY_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "AUTH_GATEWAY_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "AUTH_GATEWAY_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "AUTH_GATEWAY_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "AUTH_GATEWAY_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the gateway server (default)
    Serve,

    /// Key ring maintenance against the configured store
    #[command(subcommand)]
    Keys(KeysCommand),
}

/// Key ring subcommands
#[derive(Subcommand, Debug)]
pub enum KeysCommand {
    /// List keys with their state
    List {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Retire the active key and create a new one
    Rotate,

    /// Remove retired keys past the grace period
    Prune,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_subcommand_means_serve() {
        let cli = Cli::parse_from(["cluster-auth-gateway"]);
        assert!(cli.command.is_none());
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::parse_from([
            "cluster-auth-gateway",
            "keys",
            "list",
            "--format",
            "json",
            "--config",
            "gateway.yaml",
            "--log-format",
            "json",
        ]);
        assert_eq!(cli.config, Some(PathBuf::from("gateway.yaml")));
        assert_eq!(cli.log_format.as_deref(), Some("json"));
        assert!(matches!(
            cli.command,
            Some(Command::Keys(KeysCommand::List { ref format })) if format == "json"
        ));
    }

    #[test]
    fn rotate_and_prune_parse() {
        let cli = Cli::parse_from(["cluster-auth-gateway", "keys", "rotate"]);
        assert!(matches!(cli.command, Some(Command::Keys(KeysCommand::Rotate))));
        let cli = Cli::parse_from(["cluster-auth-gateway", "keys", "prune"]);
        assert!(matches!(cli.command, Some(Command::Keys(KeysCommand::Prune))));
    }
}
