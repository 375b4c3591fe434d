//! Channel names and issuing patterns
//!
//! A channel is one or more dot-separated segments of `[A-Za-z0-9_-]`, e.g.
//! the shared `training_logs` or a per-run `training_logs.3f2a9c1e`.
//! Patterns used by the issuing policy are an exact channel, `<channel>.*`
//! for everything strictly below it, or `*` for everything.

use std::fmt;
use thiserror::Error;

/// Default shared channel that training runs log to
pub const DEFAULT_CHANNEL: &str = "training_logs";

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel name cannot be empty")]
    Empty,

    #[error("invalid segment '{0}': must match [a-zA-Z0-9_-]+")]
    InvalidSegment(String),

    #[error("wildcard '*' can only appear as the last segment")]
    WildcardNotAtEnd,

    #[error("empty segment in channel name")]
    EmptySegment,
}

fn check_segments(name: &str) -> Result<(), ChannelError> {
    if name.is_empty() {
        return Err(ChannelError::Empty);
    }

    for segment in name.split('.') {
        match segment {
            "" => return Err(ChannelError::EmptySegment),
            "*" => return Err(ChannelError::WildcardNotAtEnd),
            s if s
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') => {}
            s => return Err(ChannelError::InvalidSegment(s.to_string())),
        }
    }
    Ok(())
}

/// A validated channel name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Channel(String);

impl Channel {
    pub fn parse(name: &str) -> Result<Self, ChannelError> {
        check_segments(name)?;
        Ok(Self(name.to_string()))
    }

    /// Per-run channel `<base>.<run_id>`, so concurrent runs never interleave
    pub fn scoped(base: &str, run_id: &str) -> Result<Self, ChannelError> {
        Self::parse(&format!("{}.{}", base, run_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether `self` lies strictly below `parent`
    pub fn is_below(&self, parent: &Channel) -> bool {
        self.0
            .strip_prefix(parent.as_str())
            .is_some_and(|rest| rest.starts_with('.'))
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Set of channels a token may be issued for
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChannelPattern {
    /// `*`
    Any,
    /// `training_logs`
    Exact(Channel),
    /// `training_logs.*`, not including `training_logs` itself
    Below(Channel),
}

impl ChannelPattern {
    pub fn parse(pattern: &str) -> Result<Self, ChannelError> {
        if pattern == "*" {
            return Ok(ChannelPattern::Any);
        }

        match pattern.strip_suffix(".*") {
            Some(parent) => Ok(ChannelPattern::Below(Channel::parse(parent)?)),
            // "training*" has no dot before the wildcard
            None if pattern.ends_with('*') => Err(ChannelError::WildcardNotAtEnd),
            None => Ok(ChannelPattern::Exact(Channel::parse(pattern)?)),
        }
    }

    pub fn any() -> Self {
        ChannelPattern::Any
    }

    pub fn matches(&self, channel: &Channel) -> bool {
        match self {
            ChannelPattern::Any => true,
            ChannelPattern::Exact(exact) => exact == channel,
            ChannelPattern::Below(parent) => channel.is_below(parent),
        }
    }
}

impl fmt::Display for ChannelPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelPattern::Any => f.write_str("*"),
            ChannelPattern::Exact(channel) => write!(f, "{}", channel),
            ChannelPattern::Below(parent) => write!(f, "{}.*", parent),
        }
    }
}
