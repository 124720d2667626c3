//! pgpubsub - listen to and publish PostgreSQL notifications.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use observability::{LogConfig, LogFormat};
use pg_pubsub::{NotificationBus, PubSubConfig};
use pg_pubsub_postgres::PostgresConnector;

/// pgpubsub command-line interface.
#[derive(Parser)]
#[command(name = "pgpubsub")]
#[command(about = "Listen to and publish PostgreSQL LISTEN/NOTIFY notifications")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// PostgreSQL connection URL or key=value connection string
    #[arg(long, env = "PGPUBSUB_URL", global = true, hide_env_values = true)]
    url: Option<String>,

    /// JSON configuration file for the notification bus
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    /// Log format (compact, json)
    #[arg(long, default_value = "compact", global = true)]
    log_format: LogFormat,
}

#[derive(Subcommand)]
enum Commands {
    /// Print notifications on the given channels as JSON lines until Ctrl-C
    Listen {
        /// Channels to listen on
        #[arg(required = true)]
        channels: Vec<String>,
    },
    /// Publish one notification and wait for the server to accept it
    Notify {
        /// Target channel
        channel: String,
        /// Optional payload
        payload: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();

    observability::init_with_config(LogConfig {
        service_name: "pgpubsub".into(),
        default_level: cli.log_level.clone(),
        format: cli.log_format,
    });

    let config = match &cli.config {
        Some(path) => PubSubConfig::load(path)?,
        None => PubSubConfig::new(),
    };
    let url = cli
        .url
        .as_deref()
        .ok_or("missing connection URL: pass --url or set PGPUBSUB_URL")?;
    let bus = NotificationBus::new(PostgresConnector::from_url(url)?, config)?;

    match cli.command {
        Commands::Listen { channels } => {
            commands::listen(&bus, channels).await?;
        }
        Commands::Notify { channel, payload } => {
            commands::notify(&bus, channel, payload).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_listen() {
        let cli = Cli::try_parse_from([
            "pgpubsub",
            "--url",
            "postgres://localhost/app",
            "listen",
            "orders",
            "invoices",
        ])
        .unwrap();

        assert_eq!(cli.url.as_deref(), Some("postgres://localhost/app"));
        match cli.command {
            Commands::Listen { channels } => assert_eq!(channels, vec!["orders", "invoices"]),
            Commands::Notify { .. } => panic!("expected listen"),
        }
    }

    #[test]
    fn test_parse_notify_with_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "pgpubsub",
            "notify",
            "orders",
            "created",
            "--log-level",
            "debug",
            "--log-format",
            "json",
        ])
        .unwrap();

        assert_eq!(cli.log_level, "debug");
        assert_eq!(cli.log_format, LogFormat::Json);
        match cli.command {
            Commands::Notify { channel, payload } => {
                assert_eq!(channel, "orders");
                assert_eq!(payload.as_deref(), Some("created"));
            }
            Commands::Listen { .. } => panic!("expected notify"),
        }
    }

    #[test]
    fn test_listen_requires_a_channel() {
        assert!(Cli::try_parse_from(["pgpubsub", "listen"]).is_err());
    }

    #[test]
    fn test_unknown_log_format_rejected() {
        assert!(Cli::try_parse_from(["pgpubsub", "--log-format", "xml", "notify", "c"]).is_err());
    }
}
