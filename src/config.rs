//! Runtime configuration
//!
//! Values come from the environment (a `.env` file is loaded by the binaries
//! through `dotenvy`). Every variable has a default suitable for a local demo:
//!
//! | Variable                 | Default                                     |
//! |--------------------------|---------------------------------------------|
//! | `RELAY_URL`              | `ws://localhost:8000/connection/websocket`  |
//! | `RELAY_SECRET`           | `secret`                                    |
//! | `RELAY_SUBJECT`          | `42`                                        |
//! | `RELAY_CHANNEL`          | `training_logs`                             |
//! | `RELAY_CHANNEL_PER_RUN`  | `false`                                     |
//! | `RELAY_ALLOWED_SUBJECTS` | empty (permissive issuing)                  |
//! | `RELAY_TIMEOUT_SECS`     | unset (transport defaults)                  |
//! | `PUSHGATEWAY_URL`        | `localhost:9091`, empty disables heartbeats |
//! | `PUSHGATEWAY_USER`       | `admin`                                     |
//! | `PUSHGATEWAY_PASSWORD`   | `admin`                                     |
//! | `HOST_NAME`              | `http://127.0.0.1:8080`                     |
//! | `TRAIN_WORKDIR`          | `.`                                         |
//! | `STOP_PATTERN`           | `main.py`                                   |
//! | `TENSORBOARD_LOGDIR`     | `/app/logs`                                 |
//! | `TENSORBOARD_PORT`       | `6006`                                      |

use crate::auth::{IssuePolicy, IssuerTokens, TokenIssuer};
use crate::channels::{Channel, ChannelPattern, DEFAULT_CHANNEL};
use crate::telemetry::{GatewayError, Heartbeat, NoopHeartbeat, PushGateway};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    fn invalid(var: &'static str, value: &str, reason: impl ToString) -> Self {
        ConfigError::Invalid {
            var,
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Everything needed to reach the broker
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub url: String,
    pub secret: String,
    pub subject: String,
    /// Shared channel, or the base of per-run channels
    pub channel: String,
    /// Give every run its own `<channel>.<run_id>` channel
    pub channel_per_run: bool,
    /// Subjects the issuer may sign for; empty means permissive
    pub allowed_subjects: Vec<String>,
    /// Bound on each broker round trip
    pub operation_timeout: Option<Duration>,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8000/connection/websocket".to_string(),
            secret: "secret".to_string(),
            subject: "42".to_string(),
            channel: DEFAULT_CHANNEL.to_string(),
            channel_per_run: false,
            allowed_subjects: Vec::new(),
            operation_timeout: None,
        }
    }
}

impl RelaySettings {
    /// Settings for a broker at `url` with the demo credentials
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Issuing policy for this deployment
    ///
    /// With an allow-list, subjects may only receive tokens for the configured
    /// channel and its per-run channels.
    pub fn issue_policy(&self) -> IssuePolicy {
        if self.allowed_subjects.is_empty() {
            return IssuePolicy::permissive();
        }

        let mut policy = IssuePolicy::restricted();
        for subject in &self.allowed_subjects {
            policy = policy.allow_subject(subject.clone());
        }
        for pattern in [self.channel.clone(), format!("{}.*", self.channel)] {
            if let Ok(pattern) = ChannelPattern::parse(&pattern) {
                policy = policy.allow_channels(pattern);
            }
        }
        policy
    }

    pub fn issuer(&self) -> Arc<TokenIssuer> {
        Arc::new(TokenIssuer::new(
            self.secret.clone().into_bytes(),
            self.issue_policy(),
        ))
    }

    /// Token source for the configured subject
    pub fn tokens(&self) -> IssuerTokens {
        IssuerTokens::new(self.issuer(), self.subject.clone())
    }

    /// Channel a run logs to
    pub fn channel_for_run(&self, run_id: &str) -> String {
        if self.channel_per_run {
            if let Ok(channel) = Channel::scoped(&self.channel, run_id) {
                return channel.as_str().to_string();
            }
        }
        self.channel.clone()
    }
}

/// Monitoring gateway for heartbeats
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    /// `None` disables heartbeats
    pub url: Option<String>,
    pub user: String,
    pub password: String,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            url: Some("localhost:9091".to_string()),
            user: "admin".to_string(),
            password: "admin".to_string(),
        }
    }
}

impl GatewaySettings {
    /// The configured heartbeat sink; a no-op when disabled
    pub fn heartbeat(&self) -> Result<Arc<dyn Heartbeat>, GatewayError> {
        match &self.url {
            Some(url) => Ok(Arc::new(
                PushGateway::new(url)?.basic_auth(&self.user, &self.password),
            )),
            None => Ok(Arc::new(NoopHeartbeat)),
        }
    }
}

/// Complete runtime configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub relay: RelaySettings,
    pub gateway: GatewaySettings,
    /// Base URL of the model marketplace
    pub marketplace_host: String,
    /// Directory holding models, datasets and run outputs
    pub workdir: PathBuf,
    /// Command-line pattern killed by `stop`
    pub stop_pattern: String,
    pub tensorboard_logdir: PathBuf,
    pub tensorboard_port: u16,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            relay: RelaySettings::default(),
            gateway: GatewaySettings::default(),
            marketplace_host: "http://127.0.0.1:8080".to_string(),
            workdir: PathBuf::from("."),
            stop_pattern: "main.py".to_string(),
            tensorboard_logdir: PathBuf::from("/app/logs"),
            tensorboard_port: 6006,
        }
    }
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::invalid(var, value, "expected a boolean")),
    }
}

impl AppConfig {
    /// Read configuration from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Read configuration through `lookup`, falling back to defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup("RELAY_URL") {
            config.relay.url = url;
        }
        if let Some(secret) = lookup("RELAY_SECRET") {
            config.relay.secret = secret;
        }
        if let Some(subject) = lookup("RELAY_SUBJECT") {
            config.relay.subject = subject;
        }
        if let Some(channel) = lookup("RELAY_CHANNEL") {
            Channel::parse(&channel)
                .map_err(|e| ConfigError::invalid("RELAY_CHANNEL", &channel, e))?;
            config.relay.channel = channel;
        }
        if let Some(value) = lookup("RELAY_CHANNEL_PER_RUN") {
            config.relay.channel_per_run = parse_bool("RELAY_CHANNEL_PER_RUN", &value)?;
        }
        if let Some(value) = lookup("RELAY_ALLOWED_SUBJECTS") {
            config.relay.allowed_subjects = value
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(value) = lookup("RELAY_TIMEOUT_SECS") {
            let secs: u64 = value
                .parse()
                .map_err(|e| ConfigError::invalid("RELAY_TIMEOUT_SECS", &value, e))?;
            config.relay.operation_timeout = Some(Duration::from_secs(secs));
        }

        if let Some(url) = lookup("PUSHGATEWAY_URL") {
            config.gateway.url = (!url.trim().is_empty()).then_some(url);
        }
        if let Some(user) = lookup("PUSHGATEWAY_USER") {
            config.gateway.user = user;
        }
        if let Some(password) = lookup("PUSHGATEWAY_PASSWORD") {
            config.gateway.password = password;
        }

        if let Some(host) = lookup("HOST_NAME") {
            config.marketplace_host = host;
        }
        if let Some(dir) = lookup("TRAIN_WORKDIR") {
            config.workdir = PathBuf::from(dir);
        }
        if let Some(pattern) = lookup("STOP_PATTERN") {
            config.stop_pattern = pattern;
        }
        if let Some(dir) = lookup("TENSORBOARD_LOGDIR") {
            config.tensorboard_logdir = PathBuf::from(dir);
        }
        if let Some(value) = lookup("TENSORBOARD_PORT") {
            config.tensorboard_port = value
                .parse()
                .map_err(|e| ConfigError::invalid("TENSORBOARD_PORT", &value, e))?;
        }

        Ok(config)
    }
}
