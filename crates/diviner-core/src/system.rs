//! The system interface — worker pools that execute shell scripts.
//!
//! A [`System`] names a pool of workers (an id, a parallelism cap, and a
//! provider). The runner enforces the parallelism cap with its own
//! per-system semaphore; any limit the provider applies underneath is an
//! additional, inclusive cap.
//!
//! Error discipline: an `Err` from [`SystemProvider::acquire`],
//! [`Worker::start`], or the execution's wait channel is a machine-level
//! failure and is retryable. A script that runs to completion reports its
//! exit code through `Ok`; a non-zero code is a terminal script failure.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::sync::oneshot;

/// Machine-level failures. All variants are transient from the runner's
/// point of view.
#[derive(Debug, Clone, Error)]
pub enum SystemError {
    #[error("no worker available: {0}")]
    Unavailable(String),
    #[error("failed to start script: {0}")]
    Spawn(String),
    #[error("failed to ship files: {0}")]
    Transport(String),
    #[error("worker lost: {0}")]
    Lost(String),
}

/// A named worker pool with a parallelism budget.
pub struct System {
    pub id: String,
    /// Concurrent trials the runner may keep on this system. Zero is
    /// treated as one.
    pub parallelism: usize,
    pub provider: Arc<dyn SystemProvider>,
}

impl System {
    pub fn new(
        id: impl Into<String>,
        parallelism: usize,
        provider: Arc<dyn SystemProvider>,
    ) -> Arc<Self> {
        Arc::new(System {
            id: id.into(),
            parallelism,
            provider,
        })
    }

    /// The semaphore capacity for this system.
    pub fn slots(&self) -> usize {
        self.parallelism.max(1)
    }
}

impl fmt::Debug for System {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("System")
            .field("id", &self.id)
            .field("parallelism", &self.parallelism)
            .finish()
    }
}

/// Acquires workers from a pool.
#[async_trait]
pub trait SystemProvider: Send + Sync {
    async fn acquire(&self) -> Result<Box<dyn Worker>, SystemError>;
}

/// One acquired worker. Runs a single script at a time.
#[async_trait]
pub trait Worker: Send {
    /// Ship `local_files` to the worker and start `script` under a shell.
    /// The returned execution streams the script's merged stdout/stderr.
    async fn start(
        &mut self,
        local_files: &[PathBuf],
        script: &str,
    ) -> Result<Execution, SystemError>;

    /// Tear the worker down, killing any script still running.
    async fn stop(&mut self);
}

/// A started script: its live log stream and a settled-exit channel.
pub struct Execution {
    /// Merged stdout/stderr, streamed while the script runs.
    pub log: Box<dyn AsyncRead + Send + Unpin>,
    /// Resolves once the script settles. `Ok(code)` is the script's exit
    /// code; `Err` is a machine-level failure. A dropped sender counts as
    /// a lost worker.
    pub exit: oneshot::Receiver<Result<i32, SystemError>>,
}

impl Execution {
    /// Wait for the script to settle.
    pub async fn wait(self) -> Result<i32, SystemError> {
        match self.exit.await {
            Ok(result) => result,
            Err(_) => Err(SystemError::Lost("execution abandoned".into())),
        }
    }
}
