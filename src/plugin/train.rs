//! The `train` command: fetch inputs, run the trainer, publish the result

use crate::jobs::{
    ExternalCommand, JobError, JobOutcome, JobRunner, JobState, StateTracker, TrainParams,
};
use crate::plugin::PluginError;
use crate::transfer::{extract_archive, rewrite_dataset_yaml, MarketplaceClient, TransferError};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};
use uuid::Uuid;

/// `train` arguments as sent by the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainRequest {
    pub epochs: u32,
    pub project_id: String,
    pub token: String,
    pub checkpoint_version: Option<String>,
    pub checkpoint: Option<String>,
    pub dataset_version: Option<String>,
    pub dataset: Option<String>,
    pub world_size: String,
    pub rank: String,
    pub master_addr: Option<String>,
    pub master_port: String,
}

/// String view of a kwarg; numbers are accepted for convenience
pub(crate) fn kwarg_string(kwargs: &Map<String, Value>, key: &str) -> Option<String> {
    match kwargs.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn kwarg_u32(kwargs: &Map<String, Value>, key: &str, default: u32) -> Result<u32, PluginError> {
    match kwarg_string(kwargs, key) {
        Some(raw) => raw
            .parse()
            .map_err(|_| {
                PluginError::InvalidArgument(format!(
                    "{} must be a positive integer, got {:?}",
                    key, raw
                ))
            }),
        None => Ok(default),
    }
}

impl TrainRequest {
    pub fn from_kwargs(kwargs: &Map<String, Value>) -> Result<Self, PluginError> {
        let project_id = kwarg_string(kwargs, "project_id")
            .ok_or_else(|| PluginError::InvalidArgument("missing project_id".to_string()))?;
        if project_id.contains('/') || project_id == ".." {
            return Err(PluginError::InvalidArgument(format!(
                "invalid project_id {:?}",
                project_id
            )));
        }

        Ok(Self {
            epochs: kwarg_u32(kwargs, "epochs", 2)?,
            project_id,
            token: kwarg_string(kwargs, "token").unwrap_or_default(),
            checkpoint_version: kwarg_string(kwargs, "checkpoint_version"),
            checkpoint: kwarg_string(kwargs, "checkpoint"),
            dataset_version: kwarg_string(kwargs, "dataset_version"),
            dataset: kwarg_string(kwargs, "dataset"),
            world_size: kwarg_string(kwargs, "world_size").unwrap_or_else(|| "1".to_string()),
            rank: kwarg_string(kwargs, "rank").unwrap_or_else(|| "0".to_string()),
            master_addr: kwarg_string(kwargs, "master_add"),
            master_port: kwarg_string(kwargs, "master_port").unwrap_or_else(|| "12345".to_string()),
        })
    }

    /// torchrun parameters for this request inside `workspace`
    pub fn params(&self, workspace: &Workspace) -> TrainParams {
        let mut params = TrainParams::new(workspace.train_dir(&self.project_id));
        params.epochs = self.epochs;
        params.world_size = self.world_size.clone();
        params.rank = self.rank.clone();
        if let Some(addr) = &self.master_addr {
            params.master_addr = addr.clone();
        }
        params.master_port = self.master_port.clone();
        params
    }
}

/// Directory layout under the working directory
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Scratch space for downloaded archives
    pub fn archives(&self) -> PathBuf {
        self.root.join("data_zip")
    }

    /// Archive path of its own for one download, e.g. `data_zip/weights-<uuid>.zip`
    pub fn scratch_archive(&self, stem: &str) -> PathBuf {
        self.archives().join(format!("{}-{}.zip", stem, Uuid::new_v4().simple()))
    }

    pub fn model_dir(&self, name: &str) -> PathBuf {
        self.root.join("models").join(name)
    }

    pub fn dataset_dir(&self, version: &str) -> PathBuf {
        self.root.join("datasets").join(version)
    }

    pub fn train_dir(&self, project_id: &str) -> PathBuf {
        self.root.join(project_id)
    }
}

async fn extract_and_discard(archive: &Path, dest: &Path) -> Result<(), TransferError> {
    let result = extract_archive(archive, dest).await;
    let _ = tokio::fs::remove_file(archive).await;
    result
}

/// Make `models/<version>` available, downloading it if missing
///
/// Returns `None` when the marketplace has no such checkpoint.
pub async fn ensure_checkpoint(
    market: &MarketplaceClient,
    workspace: &Workspace,
    project_id: &str,
    checkpoint_id: &str,
    version: &str,
) -> Result<Option<PathBuf>, TransferError> {
    let dest = workspace.model_dir(version);
    if dest.exists() {
        return Ok(Some(dest));
    }

    let archive = workspace.scratch_archive("weights");
    match market
        .download_checkpoint(project_id, checkpoint_id, &archive)
        .await?
    {
        Some(name) => {
            extract_and_discard(&archive, &dest).await?;
            info!(checkpoint = %name, dest = %dest.display(), "Checkpoint ready");
            Ok(Some(dest))
        }
        None => Ok(None),
    }
}

/// Make `datasets/<version>` available, downloading it if missing
pub async fn ensure_dataset(
    market: &MarketplaceClient,
    workspace: &Workspace,
    project_id: &str,
    dataset_id: &str,
    version: &str,
) -> Result<Option<PathBuf>, TransferError> {
    let dest = workspace.dataset_dir(version);
    if dest.exists() {
        return Ok(Some(dest));
    }

    let archive = workspace.scratch_archive("data");
    match market.download_dataset(project_id, dataset_id, &archive).await? {
        Some(name) => {
            extract_and_discard(&archive, &dest).await?;
            let manifest = dest.join("data.yaml");
            if manifest.exists() {
                rewrite_dataset_yaml(&manifest)?;
            } else {
                warn!(dataset = %name, "Dataset has no data.yaml");
            }
            info!(dataset = %name, dest = %dest.display(), "Dataset ready");
            Ok(Some(dest))
        }
        None => Ok(None),
    }
}

/// One background training run: prepare, train, upload
pub struct TrainPipeline {
    request: TrainRequest,
    workspace: Workspace,
    market: MarketplaceClient,
    runner: JobRunner,
    command: ExternalCommand,
}

impl TrainPipeline {
    pub fn new(
        request: TrainRequest,
        workspace: Workspace,
        market: MarketplaceClient,
        runner: JobRunner,
        command: Option<ExternalCommand>,
    ) -> Self {
        let command = command.unwrap_or_else(|| request.params(&workspace).command());
        Self {
            request,
            workspace,
            market,
            runner,
            command,
        }
    }

    pub fn command(&self) -> &ExternalCommand {
        &self.command
    }

    pub async fn run(self, tracker: StateTracker) -> Result<JobOutcome, JobError> {
        tracker.set(JobState::Preparing);
        self.prepare()
            .await
            .map_err(|e| JobError::Prepare(e.to_string()))?;

        let outcome = self.runner.run(&self.command, &tracker).await?;
        self.upload().await;
        Ok(outcome)
    }

    async fn prepare(&self) -> Result<(), TransferError> {
        let req = &self.request;
        let archives = self.workspace.archives();
        tokio::fs::create_dir_all(&archives)
            .await
            .map_err(|e| TransferError::Io {
                path: archives.clone(),
                source: e,
            })?;

        if let (Some(version), Some(id)) = (&req.checkpoint_version, &req.checkpoint) {
            if ensure_checkpoint(&self.market, &self.workspace, &req.project_id, id, version)
                .await?
                .is_none()
            {
                warn!(checkpoint = %id, "Checkpoint unavailable, training from scratch");
            }
        }

        if let (Some(version), Some(id)) = (&req.dataset_version, &req.dataset) {
            if ensure_dataset(&self.market, &self.workspace, &req.project_id, id, version)
                .await?
                .is_none()
            {
                warn!(dataset = %id, "Dataset unavailable");
            }
        }

        let train_dir = self.workspace.train_dir(&req.project_id);
        tokio::fs::create_dir_all(&train_dir)
            .await
            .map_err(|e| TransferError::Io {
                path: train_dir,
                source: e,
            })?;
        Ok(())
    }

    /// Upload `last.pt` if training produced one; failures are logged only
    async fn upload(&self) {
        let checkpoint = self.request.params(&self.workspace).checkpoint_path();
        if !checkpoint.exists() {
            info!(path = %checkpoint.display(), "No checkpoint produced, skipping upload");
            return;
        }

        let name = match self
            .market
            .upload_checkpoint(&self.request.project_id, &checkpoint)
            .await
        {
            Ok(Some(name)) => name,
            Ok(None) => return,
            Err(e) => {
                error!(error = %e, "Checkpoint upload failed");
                return;
            }
        };

        let dest = self.workspace.model_dir(&name);
        let copied = async {
            tokio::fs::create_dir_all(&dest).await?;
            tokio::fs::copy(&checkpoint, dest.join("last.pt")).await?;
            Ok::<_, std::io::Error>(())
        }
        .await;
        if let Err(e) = copied {
            error!(dest = %dest.display(), error = %e, "Failed to keep uploaded checkpoint");
        }
    }
}
