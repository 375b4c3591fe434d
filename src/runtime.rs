//! Dedicated event loops
//!
//! Every relay usage (one training run, one history fetch) gets its own OS
//! thread driving its own single-threaded runtime, which is torn down when
//! the work finishes. Callers may therefore be sync code or code already
//! running inside another runtime; loops are never shared or nested.

use std::any::Any;
use std::future::Future;
use std::thread;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("failed to start worker thread: {0}")]
    Spawn(std::io::Error),

    #[error("failed to build runtime: {0}")]
    Build(std::io::Error),

    #[error("worker panicked: {0}")]
    Panicked(String),
}

/// Best-effort text of a panic payload
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Start `fut` on a new named thread with its own current-thread runtime
pub fn spawn_isolated<F>(
    name: impl Into<String>,
    fut: F,
) -> Result<thread::JoinHandle<Result<F::Output, RuntimeError>>, RuntimeError>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    thread::Builder::new()
        .name(name.into())
        .spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(RuntimeError::Build)?;
            Ok(runtime.block_on(fut))
        })
        .map_err(RuntimeError::Spawn)
}

/// Wait for a thread started by [`spawn_isolated`]
pub fn join_isolated<T>(
    handle: thread::JoinHandle<Result<T, RuntimeError>>,
) -> Result<T, RuntimeError> {
    handle
        .join()
        .map_err(|payload| RuntimeError::Panicked(panic_message(payload.as_ref())))?
}

/// Run `fut` to completion on a fresh isolated runtime, blocking the caller
pub fn block_on_isolated<F>(name: impl Into<String>, fut: F) -> Result<F::Output, RuntimeError>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    join_isolated(spawn_isolated(name, fut)?)
}
