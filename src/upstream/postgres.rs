//! PostgreSQL connection source

use super::{Connection, ConnectionPool, RawNotification, UpstreamError};
use crate::channels::ChannelName;
use async_trait::async_trait;
use deadpool_postgres::{Hook, HookError, Manager, ManagerConfig, Pool, RecyclingMethod, Runtime};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_postgres::config::{Host, SslMode};
use tokio_postgres::{AsyncMessage, NoTls};
use tracing::{debug, error, info};

/// Notifications buffered per listener connection before the driver stops
/// reading from the socket
const NOTIFICATION_BUFFER: usize = 64;

const APPLICATION_NAME: &str = "pg_eventserv";

/// Postgres configuration
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    connection: tokio_postgres::Config,
    /// Size of the pool used for ordinary queries
    pub max_conns: usize,
    /// Upper bound on dedicated listener connections
    pub max_listeners: usize,
    /// Pooled connections older than this are closed instead of reused
    pub max_conn_lifetime: Option<Duration>,
}

impl PostgresConfig {
    /// Parse a `postgres://` URL or a libpq `key=value` connection string
    pub fn parse(conn: &str) -> Result<Self, UpstreamError> {
        let connection: tokio_postgres::Config = conn
            .trim()
            .parse()
            .map_err(|e: tokio_postgres::Error| UpstreamError::InvalidConfig(e.to_string()))?;

        if connection.get_ssl_mode() == SslMode::Require {
            return Err(UpstreamError::InvalidConfig(
                "sslmode=require is not supported, TLS is unavailable".to_string(),
            ));
        }

        Ok(Self {
            connection,
            max_conns: 4,
            max_listeners: 16,
            max_conn_lifetime: Some(Duration::from_secs(60 * 60)),
        })
    }

    /// Parse `conn` and fill whatever it leaves out from the `PG*` variables
    pub fn from_env(conn: &str) -> Result<Self, UpstreamError> {
        Ok(Self::parse(conn)?.with_defaults(|key| std::env::var(key).ok()))
    }

    /// Fill unset connection settings from `lookup` (`PGHOST`, `PGPORT`,
    /// `PGUSER`, `PGPASSWORD`, `PGDATABASE`)
    pub fn with_defaults<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let c = &mut self.connection;
        if c.get_hosts().is_empty() {
            let host = lookup("PGHOST").unwrap_or_else(|| "localhost".to_string());
            c.host(&host);
        }
        if c.get_ports().is_empty() {
            if let Some(port) = lookup("PGPORT").and_then(|p| p.parse().ok()) {
                c.port(port);
            }
        }
        if c.get_user().is_none() {
            if let Some(user) = lookup("PGUSER").or_else(|| lookup("USER")) {
                c.user(&user);
            }
        }
        if c.get_password().is_none() {
            if let Some(password) = lookup("PGPASSWORD") {
                c.password(password);
            }
        }
        if c.get_dbname().is_none() {
            if let Some(dbname) = lookup("PGDATABASE") {
                c.dbname(&dbname);
            }
        }
        if c.get_application_name().is_none() {
            c.application_name(APPLICATION_NAME);
        }
        self
    }

    pub fn with_limits(mut self, max_conns: usize, max_listeners: usize) -> Self {
        self.max_conns = max_conns.max(1);
        self.max_listeners = max_listeners.max(1);
        self
    }

    /// `None` or a zero duration keeps pooled connections forever
    pub fn with_max_conn_lifetime(mut self, lifetime: Option<Duration>) -> Self {
        self.max_conn_lifetime = lifetime.filter(|d| !d.is_zero());
        self
    }

    pub fn connection(&self) -> &tokio_postgres::Config {
        &self.connection
    }

    /// `user@host:port/database`, without the password
    pub fn describe(&self) -> String {
        let hosts: Vec<String> = self
            .connection
            .get_hosts()
            .iter()
            .map(|host| match host {
                Host::Tcp(name) => name.clone(),
                #[cfg(unix)]
                Host::Unix(path) => path.display().to_string(),
            })
            .collect();
        let port = self.connection.get_ports().first().copied().unwrap_or(5432);
        let user = self.connection.get_user().unwrap_or_default();
        format!(
            "{}@{}:{}/{}",
            user,
            hosts.join(","),
            port,
            self.connection.get_dbname().unwrap_or(user)
        )
    }
}

/// Query pool plus a bounded supply of dedicated listener connections
///
/// Pooled connections cannot surface asynchronous notifications, so every
/// listener gets its own `tokio_postgres` connection whose driver task is
/// owned by the returned [`PgListenConnection`].
pub struct PgConnectionPool {
    pool: Pool,
    config: PostgresConfig,
    listeners: Arc<Semaphore>,
}

impl PgConnectionPool {
    /// Build the pool and check that the database answers
    pub async fn connect(config: PostgresConfig) -> Result<Self, UpstreamError> {
        let mut manager_config = ManagerConfig::default();
        manager_config.recycling_method = RecyclingMethod::Fast;
        let manager = Manager::from_config(config.connection.clone(), NoTls, manager_config);

        let mut builder = Pool::builder(manager)
            .max_size(config.max_conns.max(1))
            .runtime(Runtime::Tokio1);
        if let Some(lifetime) = config.max_conn_lifetime {
            builder = builder.pre_recycle(Hook::sync_fn(move |_, metrics| {
                if metrics.age() > lifetime {
                    return Err(HookError::Message("connection exceeded its maximum lifetime".into()));
                }
                Ok(())
            }));
        }
        let pool = builder
            .build()
            .map_err(|e| UpstreamError::Database(e.to_string()))?;

        let listeners = Arc::new(Semaphore::new(config.max_listeners.max(1)));
        let db = Self {
            pool,
            config,
            listeners,
        };
        db.ping().await?;

        info!(
            server = %db.config.describe(),
            max_conns = db.config.max_conns,
            max_listeners = db.config.max_listeners,
            "connected to database"
        );
        Ok(db)
    }

    async fn client(&self) -> Result<deadpool_postgres::Object, UpstreamError> {
        self.pool
            .get()
            .await
            .map_err(|e| UpstreamError::Acquire(e.to_string()))
    }

    async fn ping(&self) -> Result<(), UpstreamError> {
        let client = self.client().await?;
        client
            .simple_query("SELECT 1")
            .await
            .map_err(|e| UpstreamError::Database(e.to_string()))?;
        Ok(())
    }

    /// Publish a notification through the database
    pub async fn notify(&self, channel: &ChannelName, payload: &str) -> Result<(), UpstreamError> {
        let client = self.client().await?;
        client
            .execute("SELECT pg_notify($1, $2)", &[&channel.as_str(), &payload])
            .await
            .map_err(|e| UpstreamError::Database(e.to_string()))?;
        Ok(())
    }

    pub async fn server_version(&self) -> Result<String, UpstreamError> {
        let client = self.client().await?;
        let row = client
            .query_one("SHOW server_version", &[])
            .await
            .map_err(|e| UpstreamError::Database(e.to_string()))?;
        Ok(row.get(0))
    }

    pub fn config(&self) -> &PostgresConfig {
        &self.config
    }
}

#[async_trait]
impl ConnectionPool for PgConnectionPool {
    async fn acquire_dedicated(&self) -> Result<Box<dyn Connection>, UpstreamError> {
        let permit = self
            .listeners
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| UpstreamError::Acquire(e.to_string()))?;

        let (client, mut connection) = self
            .config
            .connection
            .connect(NoTls)
            .await
            .map_err(|e| UpstreamError::Acquire(e.to_string()))?;

        let (tx, rx) = mpsc::channel(NOTIFICATION_BUFFER);
        let driver = tokio::spawn(async move {
            let messages = futures::stream::poll_fn(move |cx| connection.poll_message(cx));
            futures::pin_mut!(messages);
            while let Some(message) = messages.next().await {
                match message {
                    Ok(AsyncMessage::Notification(n)) => {
                        let raw = RawNotification {
                            channel: n.channel().to_string(),
                            payload: n.payload().to_string(),
                        };
                        if tx.send(Ok(raw)).await.is_err() {
                            break;
                        }
                    }
                    Ok(AsyncMessage::Notice(notice)) => {
                        debug!(notice = %notice.message(), "Postgres notice");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(error = %e, "Postgres LISTEN connection error");
                        let _ = tx.send(Err(UpstreamError::ConnectionLost(e.to_string()))).await;
                        break;
                    }
                }
            }
        });

        Ok(Box::new(PgListenConnection {
            client,
            notifications: rx,
            driver: Some(driver),
            _permit: permit,
        }))
    }
}

/// A dedicated connection used for `LISTEN`
pub struct PgListenConnection {
    client: tokio_postgres::Client,
    notifications: mpsc::Receiver<Result<RawNotification, UpstreamError>>,
    driver: Option<JoinHandle<()>>,
    _permit: OwnedSemaphorePermit,
}

#[async_trait]
impl Connection for PgListenConnection {
    async fn execute(&mut self, command: &str) -> Result<(), UpstreamError> {
        self.client
            .batch_execute(command)
            .await
            .map_err(|e| UpstreamError::Command {
                command: command.to_string(),
                message: e.to_string(),
            })
    }

    async fn wait_for_notification(&mut self) -> Result<RawNotification, UpstreamError> {
        match self.notifications.recv().await {
            Some(next) => next,
            None => Err(UpstreamError::ConnectionLost("connection closed".to_string())),
        }
    }

    async fn release(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.abort();
            let _ = driver.await;
        }
        self.notifications.close();
    }
}

impl Drop for PgListenConnection {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }
}
