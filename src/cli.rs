use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "logstat", version, about = "Real-time log telemetry collector")]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "logstat.toml", global = true)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the collector (default)
    Serve {
        /// Listen address for both the TCP receiver and the HTTP server
        #[arg(long)]
        host: Option<String>,

        /// TCP port for the log receiver
        #[arg(long)]
        tcp_port: Option<u16>,

        /// HTTP port for the query API and WebSocket subscribers
        #[arg(long)]
        http_port: Option<u16>,

        /// SQLite database file
        #[arg(long)]
        db_path: Option<String>,

        /// Bucket size in minutes (1, 5, 10, 15, 20, 30, 60)
        #[arg(long)]
        bucket_minutes: Option<u32>,
    },

    /// Query persisted log statistics
    Query(crate::commands::query::QueryArgs),

    /// Configuration management commands
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },

    /// Show version information
    Version,
}

#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommands {
    /// Display the effective configuration
    Show,

    /// Validate the configuration file
    Validate,
}

impl Cli {
    /// Get the command to execute, defaulting to Serve if none provided
    pub fn get_command(&self) -> Commands {
        self.command.clone().unwrap_or(Commands::Serve {
            host: None,
            tcp_port: None,
            http_port: None,
            db_path: None,
            bucket_minutes: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_command_is_serve() {
        let cli = Cli::try_parse_from(["logstat"]).unwrap();
        assert!(matches!(cli.get_command(), Commands::Serve { .. }));
    }

    #[test]
    fn serve_accepts_overrides() {
        let cli =
            Cli::try_parse_from(["logstat", "serve", "--tcp-port", "4001", "--bucket-minutes", "5"])
                .unwrap();
        match cli.get_command() {
            Commands::Serve {
                tcp_port,
                bucket_minutes,
                ..
            } => {
                assert_eq!(tcp_port, Some(4001));
                assert_eq!(bucket_minutes, Some(5));
            }
            _ => panic!("expected serve command"),
        }
    }

    #[test]
    fn query_parses_filters() {
        let cli = Cli::try_parse_from([
            "logstat", "query", "--level", "ERROR", "--logger", "^com\\.example", "--aggregated",
        ])
        .unwrap();
        match cli.get_command() {
            Commands::Query(args) => {
                assert_eq!(args.level.as_deref(), Some("ERROR"));
                assert!(args.aggregated);
            }
            _ => panic!("expected query command"),
        }
    }

    #[test]
    fn config_show_parses() {
        let cli = Cli::try_parse_from(["logstat", "config", "show"]).unwrap();
        assert!(matches!(
            cli.get_command(),
            Commands::Config {
                action: ConfigCommands::Show
            }
        ));
    }
}
