//! Job heartbeats pushed to a Prometheus Pushgateway
//!
//! Each beat replaces the metrics of one job group with a single gauge,
//! `job_last_success_unixtime`, set to the current time.

use async_trait::async_trait;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::debug;

/// Gauge carried by every heartbeat
pub const METRIC_NAME: &str = "job_last_success_unixtime";

const METRIC_HELP: &str = "Last time a batch job successfully finished";

/// Job label pushed before the external process starts
pub const JOB_STARTED: &str = "training";

/// Job label pushed after the external process exits
pub const JOB_FINISHED: &str = "finish";

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("gateway request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("gateway returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid job name: {0:?}")]
    InvalidJob(String),
}

/// Receives lifecycle heartbeats
#[async_trait]
pub trait Heartbeat: Send + Sync {
    /// Record that `job` reached a lifecycle point now
    async fn beat(&self, job: &str) -> Result<(), GatewayError>;
}

/// Heartbeat sink that drops everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHeartbeat;

#[async_trait]
impl Heartbeat for NoopHeartbeat {
    async fn beat(&self, job: &str) -> Result<(), GatewayError> {
        debug!(job = job, "Heartbeat disabled");
        Ok(())
    }
}

/// Render the text exposition body for one heartbeat
pub fn render_heartbeat(timestamp: f64) -> String {
    format!(
        "# HELP {name} {help}\n# TYPE {name} gauge\n{name} {timestamp}\n",
        name = METRIC_NAME,
        help = METRIC_HELP,
        timestamp = timestamp,
    )
}

fn now_unix() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

/// Pushgateway client using `PUT /metrics/job/<job>`
#[derive(Debug, Clone)]
pub struct PushGateway {
    client: reqwest::Client,
    base_url: String,
    credentials: Option<(String, String)>,
}

impl PushGateway {
    /// `base_url` may omit the scheme (`host:9091`), in which case `http://` is used
    pub fn new(base_url: &str) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        let base_url = if base_url.contains("://") {
            base_url.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", base_url.trim_end_matches('/'))
        };

        Ok(Self {
            client,
            base_url,
            credentials: None,
        })
    }

    /// Authenticate pushes with HTTP basic auth
    pub fn basic_auth(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some((user.into(), password.into()));
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// URL of the group for `job`
    pub fn job_url(&self, job: &str) -> String {
        format!("{}/metrics/job/{}", self.base_url, job)
    }
}

#[async_trait]
impl Heartbeat for PushGateway {
    async fn beat(&self, job: &str) -> Result<(), GatewayError> {
        if job.is_empty() || job.contains('/') {
            return Err(GatewayError::InvalidJob(job.to_string()));
        }

        let mut request = self
            .client
            .put(self.job_url(job))
            .header("Content-Type", "text/plain; version=0.0.4")
            .body(render_heartbeat(now_unix()));

        if let Some((user, password)) = &self.credentials {
            request = request.basic_auth(user, Some(password));
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Status {
                status: status.as_u16(),
                body,
            });
        }

        debug!(job = job, gateway = %self.base_url, "Heartbeat pushed");
        Ok(())
    }
}
