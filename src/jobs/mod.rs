//! Training jobs
//!
//! - `ExternalCommand`: the process a job runs
//! - `JobRunner`: brackets the process with status lines and heartbeats
//! - `JobHandle`: a job running on its own worker thread, with queryable state

mod command;
mod handle;
mod runner;

pub use command::{ExternalCommand, TrainParams};
pub use handle::{JobHandle, JobRegistry, JobSummary};
pub use runner::{JobRunner, MSG_COMPLETED, MSG_STARTED, MSG_TRAINING};

use crate::runtime::RuntimeError;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use trainrelay_client::RelayError;

#[derive(Debug, Error)]
pub enum JobError {
    /// Broker connect/subscribe/publish failed
    #[error("relay error: {0}")]
    Relay(#[from] RelayError),

    /// The external process could not be started
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Work before the process (downloads, extraction) failed
    #[error("preparation failed: {0}")]
    Prepare(String),

    /// The worker thread or its runtime failed
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

/// How the external process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct JobOutcome {
    pub success: bool,
    /// `None` when terminated by a signal
    pub exit_code: Option<i32>,
}

/// Lifecycle of one job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Idle,
    /// Fetching checkpoints and datasets
    Preparing,
    Connecting,
    Subscribing,
    LoggingStart,
    Running,
    LoggingEnd,
    Disconnecting,
    Done,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Done | JobState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Idle => "idle",
            JobState::Preparing => "preparing",
            JobState::Connecting => "connecting",
            JobState::Subscribing => "subscribing",
            JobState::LoggingStart => "logging_start",
            JobState::Running => "running",
            JobState::LoggingEnd => "logging_end",
            JobState::Disconnecting => "disconnecting",
            JobState::Done => "done",
            JobState::Failed => "failed",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared, observable job state
#[derive(Debug, Clone)]
pub struct StateTracker {
    tx: Arc<watch::Sender<JobState>>,
}

impl Default for StateTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StateTracker {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(JobState::Idle);
        Self { tx: Arc::new(tx) }
    }

    pub fn get(&self) -> JobState {
        *self.tx.borrow()
    }

    /// Move to `state`; terminal states are final
    pub fn set(&self, state: JobState) {
        self.tx.send_if_modified(|current| {
            if current.is_terminal() || *current == state {
                return false;
            }
            *current = state;
            true
        });
    }

    /// Wait until the job reaches `Done` or `Failed`
    pub async fn wait_terminal(&self) -> JobState {
        let mut rx = self.tx.subscribe();
        let state = match rx.wait_for(|s| s.is_terminal()).await {
            Ok(state) => *state,
            // The sender lives in self, so the channel cannot close here
            Err(_) => self.get(),
        };
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracker_terminal_is_final() {
        let tracker = StateTracker::new();
        assert_eq!(tracker.get(), JobState::Idle);

        tracker.set(JobState::Running);
        tracker.set(JobState::Failed);
        tracker.set(JobState::Done);
        assert_eq!(tracker.get(), JobState::Failed);
    }

    #[tokio::test]
    async fn test_wait_terminal() {
        let tracker = StateTracker::new();
        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.wait_terminal().await })
        };

        tracker.set(JobState::Connecting);
        tracker.set(JobState::Done);
        assert_eq!(waiter.await.unwrap(), JobState::Done);
    }

    #[test]
    fn test_state_names() {
        assert_eq!(JobState::LoggingStart.to_string(), "logging_start");
        assert_eq!(
            serde_json::to_string(&JobState::LoggingEnd).unwrap(),
            "\"logging_end\""
        );
    }

    #[test]
    fn test_spawn_error_display() {
        let err = JobError::Spawn {
            program: "torchrun".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
        };
        assert_eq!(err.to_string(), "failed to start torchrun: not found");
    }
}
