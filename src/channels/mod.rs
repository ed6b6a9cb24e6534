//! Channel naming and allow-list matching
//!
//! A channel is a PostgreSQL notification channel name. Clients may only
//! subscribe to channels that match one of the configured glob patterns:
//!
//! - `*` matches every channel
//! - `public_*` matches `public_alerts`, `public_news`, ...
//! - `alerts` matches only `alerts`

use globset::{Glob, GlobMatcher, GlobSet, GlobSetBuilder};
use std::fmt;
use thiserror::Error;
use tracing::info;

/// Longest identifier PostgreSQL keeps without truncation (NAMEDATALEN - 1)
pub const MAX_CHANNEL_LEN: usize = 63;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel name cannot be empty")]
    Empty,

    #[error("channel name is {0} bytes, the limit is {MAX_CHANNEL_LEN}")]
    TooLong(usize),

    #[error("channel name contains a control character")]
    ControlCharacter,

    #[error("invalid channel pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },
}

/// A validated channel name
///
/// Equality is exact: `Alerts` and `alerts` are different channels.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelName(String);

impl ChannelName {
    /// Parse and validate a channel name
    pub fn parse(name: &str) -> Result<Self, ChannelError> {
        if name.is_empty() {
            return Err(ChannelError::Empty);
        }
        if name.len() > MAX_CHANNEL_LEN {
            return Err(ChannelError::TooLong(name.len()));
        }
        if name.chars().any(char::is_control) {
            return Err(ChannelError::ControlCharacter);
        }
        Ok(Self(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The name as a quoted SQL identifier, safe to splice into `LISTEN`
    pub fn quoted(&self) -> String {
        format!("\"{}\"", self.0.replace('"', "\"\""))
    }

    /// The command that subscribes a database connection to this channel
    pub fn listen_command(&self) -> String {
        format!("LISTEN {}", self.quoted())
    }
}

impl fmt::Display for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ChannelName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A single glob pattern from the allow-list
#[derive(Debug, Clone)]
pub struct ChannelPattern {
    source: String,
    matcher: GlobMatcher,
}

impl ChannelPattern {
    pub fn parse(pattern: &str) -> Result<Self, ChannelError> {
        let glob = compile(pattern)?;
        Ok(Self {
            source: pattern.to_string(),
            matcher: glob.compile_matcher(),
        })
    }

    pub fn matches(&self, channel: &str) -> bool {
        self.matcher.is_match(channel)
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl fmt::Display for ChannelPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn compile(pattern: &str) -> Result<Glob, ChannelError> {
    if pattern.is_empty() {
        return Err(ChannelError::InvalidPattern {
            pattern: String::new(),
            message: "pattern cannot be empty".to_string(),
        });
    }
    Glob::new(pattern).map_err(|e| ChannelError::InvalidPattern {
        pattern: pattern.to_string(),
        message: e.kind().to_string(),
    })
}

/// Decides whether clients may subscribe to a channel
pub trait ChannelAuthorizer: Send + Sync {
    fn is_allowed(&self, channel: &str) -> bool;
}

/// Allow-list of glob patterns; a channel is allowed if any pattern matches
#[derive(Debug, Clone)]
pub struct AllowList {
    patterns: Vec<ChannelPattern>,
    set: GlobSet,
}

impl AllowList {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, ChannelError> {
        let mut builder = GlobSetBuilder::new();
        let mut sources = Vec::with_capacity(patterns.len());
        for pattern in patterns {
            let pattern = ChannelPattern::parse(pattern.as_ref().trim())?;
            builder.add(compile(pattern.as_str())?);
            sources.push(pattern);
        }
        let set = builder.build().map_err(|e| ChannelError::InvalidPattern {
            pattern: sources.iter().map(ChannelPattern::as_str).collect::<Vec<_>>().join(","),
            message: e.to_string(),
        })?;
        Ok(Self {
            patterns: sources,
            set,
        })
    }

    pub fn patterns(&self) -> &[ChannelPattern] {
        &self.patterns
    }
}

impl ChannelAuthorizer for AllowList {
    fn is_allowed(&self, channel: &str) -> bool {
        let allowed = self.set.is_match(channel);
        if !allowed {
            info!(channel = %channel, "channel not in allow-list");
        }
        allowed
    }
}
