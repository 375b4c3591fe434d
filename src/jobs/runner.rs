//! Bracketing a training process with status lines and heartbeats

use crate::config::RelaySettings;
use crate::jobs::{ExternalCommand, JobError, JobOutcome, JobState, StateTracker};
use crate::relay::LogRelay;
use crate::runtime::block_on_isolated;
use crate::telemetry::{Heartbeat, JOB_FINISHED, JOB_STARTED};
use std::sync::Arc;
use tracing::{error, info, warn};

pub const MSG_STARTED: &str = "Training started";
pub const MSG_TRAINING: &str = "Training training";
pub const MSG_COMPLETED: &str = "Training completed";

/// Runs one external command per call, publishing its lifecycle to a channel
///
/// Sequence: connect, subscribe, `Training started`, `Training training`,
/// `training` heartbeat, run the process, `finish` heartbeat,
/// `Training completed`, disconnect. Heartbeat failures never abort a run.
#[derive(Clone)]
pub struct JobRunner {
    settings: RelaySettings,
    channel: String,
    heartbeat: Arc<dyn Heartbeat>,
}

impl JobRunner {
    pub fn new(
        settings: RelaySettings,
        channel: impl Into<String>,
        heartbeat: Arc<dyn Heartbeat>,
    ) -> Self {
        Self {
            settings,
            channel: channel.into(),
            heartbeat,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Drive one run, reporting progress through `tracker`
    ///
    /// A non-zero exit is reported as `success: false`; the completion line
    /// is still published.
    pub async fn run(
        &self,
        command: &ExternalCommand,
        tracker: &StateTracker,
    ) -> Result<JobOutcome, JobError> {
        tracker.set(JobState::Connecting);
        let relay = LogRelay::new(&self.settings, &self.channel);
        if let Err(e) = relay.connect().await {
            error!(channel = %self.channel, error = %e, "Relay connect failed");
            tracker.set(JobState::Failed);
            return Err(e.into());
        }

        match self.drive(&relay, command, tracker).await {
            Ok(outcome) => {
                tracker.set(JobState::Disconnecting);
                relay.disconnect().await;
                tracker.set(JobState::Done);
                info!(
                    channel = %self.channel,
                    success = outcome.success,
                    exit_code = ?outcome.exit_code,
                    "Training run finished"
                );
                Ok(outcome)
            }
            Err(e) => {
                error!(channel = %self.channel, error = %e, "Training run failed");
                relay.disconnect().await;
                tracker.set(JobState::Failed);
                Err(e)
            }
        }
    }

    /// Run on a dedicated event loop, blocking the caller
    pub fn run_blocking(&self, command: &ExternalCommand) -> Result<JobOutcome, JobError> {
        let runner = self.clone();
        let command = command.clone();

        block_on_isolated("job-runner", async move {
            runner.run(&command, &StateTracker::new()).await
        })?
    }

    async fn drive(
        &self,
        relay: &LogRelay,
        command: &ExternalCommand,
        tracker: &StateTracker,
    ) -> Result<JobOutcome, JobError> {
        tracker.set(JobState::Subscribing);
        relay.subscribe().await?;

        tracker.set(JobState::LoggingStart);
        relay.publish(MSG_STARTED).await?;
        relay.publish(MSG_TRAINING).await?;
        self.beat(JOB_STARTED).await;

        tracker.set(JobState::Running);
        info!(channel = %self.channel, command = %command, "Starting training process");
        let outcome = command.run().await?;
        if !outcome.success {
            warn!(exit_code = ?outcome.exit_code, "Training process exited unsuccessfully");
        }

        tracker.set(JobState::LoggingEnd);
        self.beat(JOB_FINISHED).await;
        relay.publish(MSG_COMPLETED).await?;

        Ok(outcome)
    }

    async fn beat(&self, job: &str) {
        if let Err(e) = self.heartbeat.beat(job).await {
            warn!(job = job, error = %e, "Heartbeat failed");
        }
    }
}
