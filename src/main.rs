//! pg_eventserv entry point

mod cli;

use crate::cli::{Cli, Commands};
use anyhow::{Context, Result};
use clap::Parser;
use pg_eventserv::channels::{AllowList, ChannelName};
use pg_eventserv::config::{Settings, CONFIG_SEARCH_PATH};
use pg_eventserv::hub::EventHub;
use pg_eventserv::server::{EventServer, EventServerConfig};
use pg_eventserv::upstream::{PgConnectionPool, PostgresConfig};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let (mut settings, config_file) = Settings::load(cli.config.as_deref(), &CONFIG_SEARCH_PATH)
        .context("Unable to load settings")?;
    cli.apply(&mut settings);
    settings.validate().context("Invalid settings")?;

    let default_level = if settings.debug { "trace" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with(tracing_subscriber::fmt::layer())
        .init();

    match &config_file {
        Some(path) => info!(path = %path.display(), "using config file"),
        None => info!("config file not found, using defaults and environment"),
    }

    let db_config = PostgresConfig::from_env(&settings.db_connection)
        .context("Invalid database connection string")?
        .with_limits(settings.db_pool_max_conns, settings.db_max_listeners)
        .with_max_conn_lifetime(settings.max_conn_lifetime()?);

    match cli.command {
        Commands::Serve(_) => serve(db_config, settings).await,
        Commands::Notify { ref channel, ref payload } => notify(db_config, channel, payload).await,
        Commands::Status => status(db_config).await,
    }
}

async fn serve(db_config: PostgresConfig, settings: Settings) -> Result<()> {
    let allow_list = AllowList::new(&settings.channels).context("Invalid channel pattern")?;
    let bind_addr = settings.bind_addr().context("Invalid bind address")?;

    let db = PgConnectionPool::connect(db_config)
        .await
        .context("Unable to connect to database")?;
    match db.server_version().await {
        Ok(version) => info!(version = %version, "database server"),
        Err(e) => warn!(error = %e, "unable to read database version"),
    }

    let hub_config = settings.hub_config();
    let shutdown = CancellationToken::new();
    let hub = Arc::new(EventHub::new(
        hub_config,
        Arc::new(db),
        Arc::new(allow_list),
        shutdown.child_token(),
    ));

    let server = EventServer::new(
        EventServerConfig {
            bind_addr,
            base_path: settings.base_path.clone(),
            url_base: settings.url_base.clone(),
            allowed: settings.channels.clone(),
        },
        hub,
    );

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received, stopping server");
        signal_token.cancel();
    });

    info!(
        channels = %settings.channels.join(","),
        delivery = ?hub_config.delivery,
        "pg_eventserv starting"
    );
    server.run(shutdown).await?;

    info!("pg_eventserv stopped");
    Ok(())
}

async fn notify(db_config: PostgresConfig, channel: &str, payload: &str) -> Result<()> {
    let channel = ChannelName::parse(channel).context("Invalid channel name")?;
    let db = PgConnectionPool::connect(db_config).await?;
    db.notify(&channel, payload).await?;

    println!("Sent notification on {}", channel);
    Ok(())
}

async fn status(db_config: PostgresConfig) -> Result<()> {
    let db = PgConnectionPool::connect(db_config).await?;
    let version = db.server_version().await?;
    let config = db.config();

    println!("pg_eventserv Status");
    println!("===================");
    println!("Database: Connected");
    println!("Server:   {}", config.describe());
    println!("Version:  {}", version);

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "unable to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "unable to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
