//! CLI command definitions

use clap::{Args, Parser, Subcommand};
use pg_eventserv::config::{DeliveryMode, Settings};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "pg_eventserv")]
#[command(about = "Relay PostgreSQL LISTEN/NOTIFY events to WebSocket clients", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// TOML settings file; by default pg_eventserv.toml is looked for in
    /// ./config, /config and /etc
    #[arg(short, long, env = "ES_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Database URL or key=value connection string
    #[arg(long, env = "DATABASE_URL", global = true)]
    pub database_url: Option<String>,

    /// Log at trace level
    #[arg(short, long, env = "ES_DEBUG", global = true)]
    pub debug: bool,
}

impl Cli {
    /// Overlay the global flags on `settings`
    pub fn apply(&self, settings: &mut Settings) {
        if let Some(url) = &self.database_url {
            settings.db_connection = url.clone();
        }
        if self.debug {
            settings.debug = true;
        }
        if let Commands::Serve(args) = &self.command {
            args.apply(settings);
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the event server
    Serve(ServeArgs),

    /// Send a notification through the database
    ///
    /// Examples:
    ///   pg_eventserv notify alerts 'disk full'
    Notify {
        /// Channel to notify
        channel: String,

        /// Payload text
        payload: String,
    },

    /// Check database connectivity
    Status,
}

/// Serve flags; anything left unset falls back to the settings file, then to
/// the built-in default shown in brackets
#[derive(Args, Debug, Clone, Default)]
pub struct ServeArgs {
    /// Address to bind to [0.0.0.0]
    #[arg(long, env = "ES_HTTPHOST")]
    pub host: Option<String>,

    /// Port to listen on [7700]
    #[arg(short, long, env = "ES_HTTPPORT")]
    pub port: Option<u16>,

    /// Path prefix for all routes [/]
    #[arg(long, env = "ES_BASEPATH")]
    pub base_path: Option<String>,

    /// Public URL advertised to clients, e.g. https://events.example.com
    #[arg(long, env = "ES_URLBASE")]
    pub url_base: Option<String>,

    /// Comma-separated glob patterns of channels clients may listen to [*]
    #[arg(long, env = "ES_CHANNELS", value_delimiter = ',')]
    pub channels: Option<Vec<String>>,

    /// Seconds between keepalive pings [2]
    #[arg(long, env = "ES_KEEPALIVE_SECS")]
    pub keepalive_secs: Option<u64>,

    /// Seconds allowed for a single frame write [2]
    #[arg(long, env = "ES_WRITE_TIMEOUT_SECS")]
    pub write_timeout_secs: Option<u64>,

    /// What to do when a client falls behind [blocking]
    #[arg(long, env = "ES_DELIVERY", value_enum)]
    pub delivery: Option<DeliveryMode>,

    /// Notifications held per client; drop-oldest keeps exactly this many [1]
    #[arg(long, env = "ES_MAILBOX_DEPTH")]
    pub mailbox_depth: Option<usize>,

    /// Seconds shutdown waits for sessions to close [5]
    #[arg(long, env = "ES_SHUTDOWN_GRACE_SECS")]
    pub shutdown_grace_secs: Option<u64>,

    /// Size of the database query pool [4]
    #[arg(long, env = "ES_DBPOOLMAXCONNS")]
    pub db_pool_max_conns: Option<usize>,

    /// Age after which pooled connections are replaced, e.g. 30m; 0 keeps them [1h]
    #[arg(long, env = "ES_DBPOOLMAXCONNLIFETIME")]
    pub db_pool_max_conn_lifetime: Option<String>,

    /// Maximum dedicated LISTEN connections [16]
    #[arg(long, env = "ES_DBMAXLISTENERS")]
    pub db_max_listeners: Option<usize>,
}

impl ServeArgs {
    pub fn apply(&self, settings: &mut Settings) {
        fn set<T: Clone>(target: &mut T, value: &Option<T>) {
            if let Some(value) = value {
                *target = value.clone();
            }
        }

        set(&mut settings.http_host, &self.host);
        set(&mut settings.http_port, &self.port);
        set(&mut settings.base_path, &self.base_path);
        set(&mut settings.channels, &self.channels);
        set(&mut settings.keepalive_secs, &self.keepalive_secs);
        set(&mut settings.write_timeout_secs, &self.write_timeout_secs);
        set(&mut settings.delivery, &self.delivery);
        set(&mut settings.mailbox_depth, &self.mailbox_depth);
        set(&mut settings.shutdown_grace_secs, &self.shutdown_grace_secs);
        set(&mut settings.db_pool_max_conns, &self.db_pool_max_conns);
        set(&mut settings.db_pool_max_conn_lifetime, &self.db_pool_max_conn_lifetime);
        set(&mut settings.db_max_listeners, &self.db_max_listeners);
        if self.url_base.is_some() {
            settings.url_base = self.url_base.clone().filter(|url| !url.trim().is_empty());
        }
    }
}
