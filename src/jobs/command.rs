//! External process description

use crate::jobs::{JobError, JobOutcome};
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::process::Command;

/// A program plus arguments, run to completion by a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalCommand {
    pub program: String,
    pub args: Vec<String>,
    pub current_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl ExternalCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
            env: Vec::new(),
        }
    }

    /// `sh -c <script>`
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new("sh").arg("-c").arg(script)
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Run to completion, inheriting stdio
    ///
    /// A non-zero exit is an outcome, not an error; only failing to start is.
    pub async fn run(&self) -> Result<JobOutcome, JobError> {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        if let Some(dir) = &self.current_dir {
            command.current_dir(dir);
        }
        for (key, value) in &self.env {
            command.env(key, value);
        }

        let status = command.status().await.map_err(|source| JobError::Spawn {
            program: self.program.clone(),
            source,
        })?;

        Ok(JobOutcome {
            success: status.success(),
            exit_code: status.code(),
        })
    }
}

impl fmt::Display for ExternalCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Parameters of a distributed training launch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainParams {
    pub epochs: u32,
    pub world_size: String,
    pub rank: String,
    pub master_addr: String,
    pub master_port: String,
    /// Directory receiving `last.pt`
    pub train_dir: PathBuf,
    /// Training entry point handed to torchrun
    pub script: String,
}

impl TrainParams {
    pub fn new(train_dir: impl Into<PathBuf>) -> Self {
        Self {
            epochs: 2,
            world_size: "1".to_string(),
            rank: "0".to_string(),
            master_addr: "127.0.0.1".to_string(),
            master_port: "12345".to_string(),
            train_dir: train_dir.into(),
            script: "main.py".to_string(),
        }
    }

    /// Where the trained checkpoint is written
    pub fn checkpoint_path(&self) -> PathBuf {
        self.train_dir.join("last.pt")
    }

    /// Single-GPU-per-node torchrun launch with c10d rendezvous
    pub fn command(&self) -> ExternalCommand {
        let endpoint = format!("{}:{}", self.master_addr, self.master_port);

        ExternalCommand::new("torchrun")
            .args(["--nproc_per_node", "1"])
            .args(["--rdzv-backend", "c10d"])
            .args(["--node-rank", self.rank.as_str()])
            .args(["--nnodes", self.world_size.as_str()])
            .args(["--rdzv-endpoint", endpoint.as_str()])
            .args(["--master-addr", self.master_addr.as_str()])
            .args(["--master-port", self.master_port.as_str()])
            .arg(self.script.as_str())
            .arg("--epochs")
            .arg(self.epochs.to_string())
            .arg("--save_path")
            .arg(path_arg(&self.checkpoint_path()))
            .env("LOGLEVEL", "ERROR")
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
