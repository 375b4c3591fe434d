//! Jobs running in the background

use crate::jobs::{JobError, JobOutcome, JobState, StateTracker};
use crate::runtime::{join_isolated, spawn_isolated, RuntimeError};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, warn};

type Worker = JoinHandle<Result<Result<JobOutcome, JobError>, RuntimeError>>;

/// Finished jobs remembered by a registry after their worker is reaped
pub const DEFAULT_RETENTION: usize = 100;

/// Marks the tracker `Failed` if the work is dropped before finishing,
/// which includes unwinding out of a panic
struct FailOnDrop {
    tracker: StateTracker,
    error: Arc<Mutex<Option<String>>>,
}

impl Drop for FailOnDrop {
    fn drop(&mut self) {
        if !self.tracker.get().is_terminal() {
            self.error
                .lock()
                .get_or_insert_with(|| "job stopped before finishing".to_string());
            self.tracker.set(JobState::Failed);
        }
    }
}

/// A job on its own worker thread and event loop
pub struct JobHandle {
    run_id: String,
    channel: String,
    tracker: StateTracker,
    error: Arc<Mutex<Option<String>>>,
    worker: Worker,
}

impl JobHandle {
    /// Start `work` in the background
    ///
    /// `work` receives the tracker the handle reports from. An `Err` result
    /// leaves the job `Failed` with the error text kept for `summary()`; an
    /// `Ok` result leaves it `Done` even if the work never touched the tracker.
    pub fn spawn<F, Fut>(
        run_id: impl Into<String>,
        channel: impl Into<String>,
        work: F,
    ) -> Result<Self, JobError>
    where
        F: FnOnce(StateTracker) -> Fut,
        Fut: Future<Output = Result<JobOutcome, JobError>> + Send + 'static,
    {
        let run_id = run_id.into();
        let channel = channel.into();
        let tracker = StateTracker::new();
        let error = Arc::new(Mutex::new(None));
        let fut = work(tracker.clone());
        let guard = FailOnDrop {
            tracker: tracker.clone(),
            error: error.clone(),
        };

        let thread_name = format!("job-{}", run_id.chars().take(8).collect::<String>());
        let worker = spawn_isolated(thread_name, async move {
            let result = fut.await;
            match &result {
                Ok(_) => guard.tracker.set(JobState::Done),
                Err(e) => {
                    *guard.error.lock() = Some(e.to_string());
                    guard.tracker.set(JobState::Failed);
                }
            }
            drop(guard);
            result
        })?;

        debug!(run_id = %run_id, channel = %channel, "Job spawned");
        Ok(Self {
            run_id,
            channel,
            tracker,
            error,
            worker,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn state(&self) -> JobState {
        self.tracker.get()
    }

    /// Why the job failed, once it has
    pub fn error(&self) -> Option<String> {
        self.error.lock().clone()
    }

    pub fn is_finished(&self) -> bool {
        self.worker.is_finished()
    }

    /// Suspends until the job is `Done` or `Failed`
    pub async fn wait(&self) -> JobState {
        self.tracker.wait_terminal().await
    }

    /// Block until the worker exits and return its result
    pub fn join(self) -> Result<JobOutcome, JobError> {
        join_isolated(self.worker)?
    }

    pub fn summary(&self) -> JobSummary {
        JobSummary {
            run_id: self.run_id.clone(),
            channel: self.channel.clone(),
            state: self.state(),
            error: self.error(),
        }
    }
}

/// Serializable view of a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobSummary {
    pub run_id: String,
    pub channel: String,
    pub state: JobState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Jobs started by this process, keyed by run id
///
/// Workers that have exited are joined on the next `insert`, `get` or
/// `summaries`, and only their summaries are kept, oldest dropped first.
pub struct JobRegistry {
    jobs: DashMap<String, JobHandle>,
    finished: Mutex<VecDeque<JobSummary>>,
    retention: usize,
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::with_retention(DEFAULT_RETENTION)
    }
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry remembering at most `retention` finished jobs
    pub fn with_retention(retention: usize) -> Self {
        Self {
            jobs: DashMap::new(),
            finished: Mutex::new(VecDeque::new()),
            retention,
        }
    }

    pub fn insert(&self, handle: JobHandle) -> JobSummary {
        self.reap();
        let summary = handle.summary();
        self.jobs.insert(handle.run_id.clone(), handle);
        summary
    }

    pub fn get(&self, run_id: &str) -> Option<JobSummary> {
        self.reap();
        if let Some(handle) = self.jobs.get(run_id) {
            return Some(handle.summary());
        }
        self.finished
            .lock()
            .iter()
            .find(|s| s.run_id == run_id)
            .cloned()
    }

    /// Remove a live job so it can be joined
    pub fn take(&self, run_id: &str) -> Option<JobHandle> {
        self.jobs.remove(run_id).map(|(_, h)| h)
    }

    /// Live and remembered jobs, ordered by run id
    pub fn summaries(&self) -> Vec<JobSummary> {
        self.reap();
        let mut all: Vec<JobSummary> = self.jobs.iter().map(|h| h.summary()).collect();
        all.extend(self.finished.lock().iter().cloned());
        all.sort_by(|a, b| a.run_id.cmp(&b.run_id));
        all
    }

    /// Whether any job has not reached a terminal state
    pub fn has_active(&self) -> bool {
        self.jobs.iter().any(|h| !h.state().is_terminal())
    }

    /// Number of jobs whose worker has not been reaped yet
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Join exited workers and keep their summaries
    fn reap(&self) {
        let exited: Vec<String> = self
            .jobs
            .iter()
            .filter(|h| h.is_finished())
            .map(|h| h.run_id.clone())
            .collect();

        for run_id in exited {
            let Some((_, handle)) = self.jobs.remove(&run_id) else {
                continue;
            };
            let summary = handle.summary();
            if let Err(e) = handle.join() {
                warn!(run_id = %run_id, error = %e, "Job finished with error");
            }

            let mut finished = self.finished.lock();
            finished.push_back(summary);
            while finished.len() > self.retention {
                finished.pop_front();
            }
        }
    }
}
