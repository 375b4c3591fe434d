//! Command dispatcher exposed to the model-serving host
//!
//! The host sends `{project, command, collection, ..kwargs}` and receives
//! `{message, result}`. Only `logs` and `predict` wait on the network;
//! `train` returns as soon as its job is running in the background.

mod train;

pub use train::{ensure_checkpoint, ensure_dataset, TrainPipeline, TrainRequest, Workspace};

use crate::config::AppConfig;
use crate::jobs::{ExternalCommand, JobError, JobHandle, JobRegistry, JobRunner, JobState};
use crate::relay::fetch_logs;
use crate::runtime::block_on_isolated;
use crate::telemetry::{GatewayError, Heartbeat};
use crate::transfer::{MarketplaceClient, TransferError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use train::kwarg_string;
use uuid::Uuid;

/// Input used by `predict` when the host sends none
pub const DEFAULT_PREDICT_INPUT: &str = "https://ultralytics.com/images/zidane.jpg";

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("{0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Job(#[from] JobError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

/// One host call
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct CommandRequest {
    #[serde(default)]
    pub project: Value,
    pub command: String,
    #[serde(default)]
    pub collection: Value,
    /// Everything else the host sent
    #[serde(flatten)]
    pub kwargs: Map<String, Value>,
}

impl CommandRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    pub fn kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }
}

/// Reply to the host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub message: String,
    pub result: Value,
}

impl CommandResponse {
    pub fn new(message: impl Into<String>, result: Value) -> Self {
        Self {
            message: message.into(),
            result,
        }
    }

    pub fn failed(action: &str, reason: impl std::fmt::Display) -> Self {
        Self::new(format!("{} failed: {}", action, reason), Value::Null)
    }
}

/// Detector output in the host's wire shape
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// `[x1, y1, x2, y2]` per object
    pub boxes: Vec<[f32; 4]>,
    /// Class index to class name
    pub names: BTreeMap<u32, String>,
    /// Class index per box
    pub labels: Vec<f32>,
}

#[derive(Debug, Error)]
#[error("detection failed: {0}")]
pub struct DetectorError(pub String);

/// Object detection backend supplied by the host
pub trait Detector: Send + Sync {
    /// Run on `input`, using `weights` when given and the stock model otherwise
    fn detect(&self, weights: Option<&Path>, input: &Value) -> Result<Detection, DetectorError>;
}

/// Dispatches host commands
pub struct Plugin {
    config: AppConfig,
    heartbeat: Arc<dyn Heartbeat>,
    jobs: JobRegistry,
    detector: Option<Arc<dyn Detector>>,
    train_command: Option<ExternalCommand>,
}

impl Plugin {
    pub fn new(config: AppConfig) -> Result<Self, PluginError> {
        let heartbeat = config.gateway.heartbeat()?;
        Ok(Self::with_heartbeat(config, heartbeat))
    }

    pub fn with_heartbeat(config: AppConfig, heartbeat: Arc<dyn Heartbeat>) -> Self {
        Self {
            config,
            heartbeat,
            jobs: JobRegistry::new(),
            detector: None,
            train_command: None,
        }
    }

    pub fn detector(mut self, detector: Arc<dyn Detector>) -> Self {
        self.detector = Some(detector);
        self
    }

    /// Run `command` for every `train` instead of the torchrun launch
    pub fn train_command(mut self, command: ExternalCommand) -> Self {
        self.train_command = Some(command);
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn jobs(&self) -> &JobRegistry {
        &self.jobs
    }

    fn workspace(&self) -> Workspace {
        Workspace::new(&self.config.workdir)
    }

    pub fn dispatch(&self, request: CommandRequest) -> CommandResponse {
        let command = request.command.trim().to_ascii_lowercase();
        info!(command = %command, project = %request.project, "Dispatching command");

        match command.as_str() {
            "train" => self.train(&request.kwargs),
            "status" => self.status(&request.kwargs),
            "logs" => self.logs(&request.kwargs),
            "stop" => self.stop(),
            "tensorboard" => self.tensorboard(),
            "predict" => self.predict(&request.kwargs),
            "toolbar" => self.toolbar(&request.kwargs),
            _ => {
                warn!(command = %request.command, "Unsupported command");
                CommandResponse::new("command not supported", Value::Null)
            }
        }
    }

    fn train(&self, kwargs: &Map<String, Value>) -> CommandResponse {
        match self.start_training(kwargs) {
            Ok(result) => CommandResponse::new("train started successfully", result),
            Err(e) => CommandResponse::failed("train", e),
        }
    }

    fn start_training(&self, kwargs: &Map<String, Value>) -> Result<Value, PluginError> {
        let request = TrainRequest::from_kwargs(kwargs)?;
        let market = MarketplaceClient::new(&self.config.marketplace_host, request.token.clone())?;

        let run_id = Uuid::new_v4().to_string();
        let channel = self.config.relay.channel_for_run(&run_id);
        let runner = JobRunner::new(self.config.relay.clone(), channel.clone(), self.heartbeat.clone());
        let pipeline = TrainPipeline::new(
            request,
            self.workspace(),
            market,
            runner,
            self.train_command.clone(),
        );
        info!(run_id = %run_id, channel = %channel, command = %pipeline.command(), "Starting training job");

        let handle = JobHandle::spawn(run_id, channel, move |tracker| pipeline.run(tracker))?;
        let summary = self.jobs.insert(handle);

        Ok(json!({ "run_id": summary.run_id, "channel": summary.channel }))
    }

    fn status(&self, kwargs: &Map<String, Value>) -> CommandResponse {
        match kwarg_string(kwargs, "run_id") {
            Some(run_id) => match self.jobs.get(&run_id) {
                Some(summary) => match (summary.state, summary.error.as_deref()) {
                    (JobState::Failed, Some(reason)) => {
                        CommandResponse::new(format!("train failed: {}", reason), json!(summary))
                    }
                    _ => CommandResponse::new("status fetched successfully", json!(summary)),
                },
                None => CommandResponse::failed("status", format!("unknown run {}", run_id)),
            },
            None => CommandResponse::new("status fetched successfully", json!(self.jobs.summaries())),
        }
    }

    fn logs(&self, kwargs: &Map<String, Value>) -> CommandResponse {
        let channel = match kwarg_string(kwargs, "run_id") {
            Some(run_id) => match self.jobs.get(&run_id) {
                Some(summary) => summary.channel,
                None => self.config.relay.channel_for_run(&run_id),
            },
            None => self.config.relay.channel.clone(),
        };

        match fetch_logs(&self.config.relay, &channel) {
            Ok(lines) => CommandResponse::new("logs fetched successfully", json!(lines)),
            Err(e) => {
                warn!(channel = %channel, error = %e, "Log fetch failed");
                CommandResponse::failed("logs", e)
            }
        }
    }

    /// Best-effort kill of training processes
    fn stop(&self) -> CommandResponse {
        let pattern = &self.config.stop_pattern;
        match Command::new("pkill").args(["-9", "-f", pattern.as_str()]).status() {
            Ok(status) => {
                // pkill exits 1 when nothing matched
                info!(pattern = %pattern, exit_code = ?status.code(), "Stop issued");
            }
            Err(e) => warn!(pattern = %pattern, error = %e, "Failed to run pkill"),
        }
        CommandResponse::new("stop completed successfully", json!("Done"))
    }

    fn tensorboard(&self) -> CommandResponse {
        let port = format!("--port={}", self.config.tensorboard_port);
        let spawned = Command::new("tensorboard")
            .arg("--logdir")
            .arg(&self.config.tensorboard_logdir)
            .args(["--host", "0.0.0.0", port.as_str(), "--load_fast=false"])
            .stdout(Stdio::null())
            .spawn();

        match spawned {
            Ok(child) => {
                info!(pid = child.id(), port = self.config.tensorboard_port, "TensorBoard started");
                CommandResponse::new("tensorboard started successfully", Value::Null)
            }
            Err(e) => CommandResponse::failed("tensorboard", e),
        }
    }

    fn predict(&self, kwargs: &Map<String, Value>) -> CommandResponse {
        let result = self
            .checkpoint_weights(kwargs)
            .and_then(|weights| self.detect(weights.as_deref(), kwargs));

        match result {
            Ok(detection) => CommandResponse::new("predict completed successfully", json!(detection)),
            Err(e) => {
                warn!(error = %e, "Prediction failed");
                CommandResponse::new("predict failed", Value::Null)
            }
        }
    }

    /// Prediction with the stock model only
    fn toolbar(&self, kwargs: &Map<String, Value>) -> CommandResponse {
        match self.detect(None, kwargs) {
            Ok(detection) => CommandResponse::new("predict completed successfully", json!(detection)),
            Err(e) => {
                warn!(error = %e, "Toolbar prediction failed");
                CommandResponse::new("predict failed", Value::Null)
            }
        }
    }

    /// Local weights for the requested checkpoint, fetched if needed
    fn checkpoint_weights(&self, kwargs: &Map<String, Value>) -> Result<Option<PathBuf>, PluginError> {
        let (Some(version), Some(checkpoint)) = (
            kwarg_string(kwargs, "checkpoint_version"),
            kwarg_string(kwargs, "checkpoint"),
        ) else {
            return Ok(None);
        };

        let project_id = kwarg_string(kwargs, "project_id").unwrap_or_default();
        let token = kwarg_string(kwargs, "token").unwrap_or_default();
        let market = MarketplaceClient::new(&self.config.marketplace_host, token)?;
        let workspace = self.workspace();

        let fetched = block_on_isolated("checkpoint-fetch", async move {
            ensure_checkpoint(&market, &workspace, &project_id, &checkpoint, &version).await
        })
        .map_err(JobError::from)??;
        Ok(fetched)
    }

    fn detect(&self, weights: Option<&Path>, kwargs: &Map<String, Value>) -> Result<Detection, PluginError> {
        let detector = self
            .detector
            .as_ref()
            .ok_or_else(|| PluginError::InvalidArgument("no detector configured".to_string()))?;

        let input = match kwargs.get("data") {
            Some(data) if !data.is_null() && data != "" => data.clone(),
            _ => json!({ "img": DEFAULT_PREDICT_INPUT }),
        };

        detector
            .detect(weights, &input)
            .map_err(|e| PluginError::InvalidArgument(e.to_string()))
    }
}
