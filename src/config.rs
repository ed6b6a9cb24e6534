//! Server settings
//!
//! Settings start from built-in defaults, are overlaid by an optional TOML
//! file and finally by command-line flags and `ES_*` environment variables.
//! File keys use the PascalCase names below, e.g.
//!
//! ```toml
//! DbConnection = "postgres://app@localhost/events"
//! HttpPort = 7700
//! Channels = ["public_*", "alerts"]
//! DbPoolMaxConnLifeTime = "30m"
//! ```

use crate::hub::HubConfig;
use crate::relay::DeliveryPolicy;
use crate::session::SessionConfig;
use clap::ValueEnum;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// File name looked for in each of [`CONFIG_SEARCH_PATH`]
pub const CONFIG_FILE: &str = "pg_eventserv.toml";

pub const CONFIG_SEARCH_PATH: [&str; 3] = ["./config", "/config", "/etc"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

/// What to do when a client falls behind
#[derive(ValueEnum, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum DeliveryMode {
    /// Slow clients hold up the channel
    Blocking,
    /// Slow clients lose their oldest pending notifications
    DropOldest,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct Settings {
    /// Connection string, either a URL or `key=value` pairs
    pub db_connection: String,
    pub http_host: String,
    pub http_port: u16,
    /// Public URL advertised to clients
    pub url_base: Option<String>,
    pub base_path: String,
    /// Glob patterns of channels clients may listen to
    pub channels: Vec<String>,
    pub debug: bool,
    pub db_pool_max_conns: usize,
    /// Go-style duration such as `1h` or `90s`; `0` disables recycling
    #[serde(rename = "DbPoolMaxConnLifeTime")]
    pub db_pool_max_conn_lifetime: String,
    pub db_max_listeners: usize,
    pub keepalive_secs: u64,
    pub write_timeout_secs: u64,
    pub delivery: DeliveryMode,
    pub mailbox_depth: usize,
    pub shutdown_grace_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            db_connection: "sslmode=disable".to_string(),
            http_host: "0.0.0.0".to_string(),
            http_port: 7700,
            url_base: None,
            base_path: "/".to_string(),
            channels: vec!["*".to_string()],
            debug: false,
            db_pool_max_conns: 4,
            db_pool_max_conn_lifetime: "1h".to_string(),
            db_max_listeners: 16,
            keepalive_secs: 2,
            write_timeout_secs: 2,
            delivery: DeliveryMode::Blocking,
            mailbox_depth: 1,
            shutdown_grace_secs: 5,
        }
    }
}

impl Settings {
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Self::parse_labeled(text, "<string>")
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse_labeled(&text, &path.display().to_string())
    }

    fn parse_labeled(text: &str, label: &str) -> Result<Self, ConfigError> {
        let mut settings: Settings = toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: label.to_string(),
            source,
        })?;
        if settings.url_base.as_deref().is_some_and(|url| url.trim().is_empty()) {
            settings.url_base = None;
        }
        settings.validate()?;
        Ok(settings)
    }

    /// Read `explicit` if given, otherwise the first [`CONFIG_FILE`] found in
    /// `search`. Returns the defaults when nothing is found.
    pub fn load<P: AsRef<Path>>(
        explicit: Option<&Path>,
        search: &[P],
    ) -> Result<(Self, Option<PathBuf>), ConfigError> {
        let found = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => search
                .iter()
                .map(|dir| dir.as_ref().join(CONFIG_FILE))
                .find(|candidate| candidate.is_file()),
        };

        match found {
            Some(path) => {
                let settings = Self::from_file(&path)?;
                Ok((settings, Some(path)))
            }
            None => {
                debug!("no config file found, using defaults");
                Ok((Self::default(), None))
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.max_conn_lifetime()?;
        if self.channels.iter().all(|c| c.trim().is_empty()) {
            return Err(ConfigError::Invalid {
                key: "Channels",
                message: "at least one pattern is required".to_string(),
            });
        }
        if self.mailbox_depth == 0 {
            return Err(ConfigError::Invalid {
                key: "MailboxDepth",
                message: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// `None` when pooled connections are never recycled for age
    pub fn max_conn_lifetime(&self) -> Result<Option<Duration>, ConfigError> {
        let lifetime = parse_duration(&self.db_pool_max_conn_lifetime).map_err(|message| {
            ConfigError::Invalid {
                key: "DbPoolMaxConnLifeTime",
                message,
            }
        })?;
        Ok(Some(lifetime).filter(|d| !d.is_zero()))
    }

    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.http_host, self.http_port)
            .parse()
            .map_err(|e: std::net::AddrParseError| ConfigError::Invalid {
                key: "HttpHost",
                message: e.to_string(),
            })
    }

    pub fn delivery_policy(&self) -> DeliveryPolicy {
        match self.delivery {
            DeliveryMode::Blocking => DeliveryPolicy::Blocking(self.mailbox_depth),
            DeliveryMode::DropOldest => DeliveryPolicy::DropOldest(self.mailbox_depth),
        }
    }

    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            session: SessionConfig {
                keepalive_interval: Duration::from_secs(self.keepalive_secs.max(1)),
                write_timeout: Duration::from_secs(self.write_timeout_secs.max(1)),
            },
            delivery: self.delivery_policy(),
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
        }
    }
}

/// Parse a duration written as `1h`, `1h30m`, `90s`, `250ms` or `1.5h`
///
/// Units are `ns`, `us` (or `µs`), `ms`, `s`, `m` and `h`. A bare `0` is
/// accepted.
pub fn parse_duration(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    if value == "0" {
        return Ok(Duration::ZERO);
    }
    if value.is_empty() {
        return Err("empty duration".to_string());
    }

    let mut nanos = 0f64;
    let mut rest = value;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        let (number, tail) = rest.split_at(number_len);
        let amount: f64 = number
            .parse()
            .map_err(|_| format!("invalid duration '{value}'"))?;

        let unit_len = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, tail) = tail.split_at(unit_len);
        let scale = match unit {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            "" => return Err(format!("missing unit in duration '{value}'")),
            other => return Err(format!("unknown unit '{other}' in duration '{value}'")),
        };
        nanos += amount * scale;
        rest = tail;
    }

    if !nanos.is_finite() || nanos >= u64::MAX as f64 {
        return Err(format!("duration '{value}' is out of range"));
    }
    Ok(Duration::from_nanos(nanos.round() as u64))
}
