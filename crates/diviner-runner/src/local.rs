//! Local system provider — workers are host subprocesses.
//!
//! Each worker owns a scratch directory under the provider's root.
//! Shipped files are copied in, and scripts run under `sh -c` with
//! stdout and stderr merged at the file-descriptor level so the log
//! stream preserves interleaving. Workers released intact go back to an
//! idle pool and are reused by later acquisitions.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::oneshot;

use diviner_core::system::{Execution, System, SystemError, SystemProvider, Worker};

struct LocalInner {
    root: PathBuf,
    next_worker: AtomicU64,
    idle: Mutex<Vec<PathBuf>>,
    running: AtomicU64,
}

/// A pool of subprocess workers rooted at one scratch directory.
/// Cheap to clone; clones share the pool.
#[derive(Clone)]
pub struct LocalSystem {
    inner: Arc<LocalInner>,
}

impl LocalSystem {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(LocalInner {
                root: root.into(),
                next_worker: AtomicU64::new(0),
                idle: Mutex::new(Vec::new()),
                running: AtomicU64::new(0),
            }),
        }
    }

    /// A [`System`] backed by this pool.
    pub fn system(&self, id: impl Into<String>, parallelism: usize) -> Arc<System> {
        System::new(id, parallelism, Arc::new(self.clone()))
    }

    /// Distinct workers created so far. With reuse, this tracks peak
    /// concurrency rather than trial count.
    pub fn workers_started(&self) -> u64 {
        self.inner.next_worker.load(Ordering::SeqCst)
    }

    /// Scripts currently executing.
    pub fn scripts_running(&self) -> u64 {
        self.inner.running.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SystemProvider for LocalSystem {
    async fn acquire(&self) -> Result<Box<dyn Worker>, SystemError> {
        let reused = self.inner.idle.lock().unwrap().pop();
        let dir = match reused {
            Some(dir) => dir,
            None => {
                let n = self.inner.next_worker.fetch_add(1, Ordering::SeqCst);
                let dir = self.inner.root.join(format!("worker-{n}"));
                tokio::fs::create_dir_all(&dir)
                    .await
                    .map_err(|err| SystemError::Unavailable(err.to_string()))?;
                tracing::debug!(dir = %dir.display(), "local worker created");
                dir
            }
        };
        Ok(Box::new(LocalWorker {
            pool: Arc::clone(&self.inner),
            dir,
            kill: None,
            stopped: false,
        }))
    }
}

struct LocalWorker {
    pool: Arc<LocalInner>,
    dir: PathBuf,
    kill: Option<oneshot::Sender<()>>,
    stopped: bool,
}

#[async_trait]
impl Worker for LocalWorker {
    async fn start(
        &mut self,
        local_files: &[PathBuf],
        script: &str,
    ) -> Result<Execution, SystemError> {
        for file in local_files {
            let name = file
                .file_name()
                .ok_or_else(|| SystemError::Transport(format!("no file name: {}", file.display())))?;
            tokio::fs::copy(file, self.dir.join(name))
                .await
                .map_err(|err| SystemError::Transport(format!("{}: {err}", file.display())))?;
        }

        // `exec 2>&1` points stderr at the stdout pipe inside the shell,
        // merging the streams in write order.
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(format!("exec 2>&1\n{script}"))
            .current_dir(&self.dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|err| SystemError::Spawn(err.to_string()))?;
        let log = child
            .stdout
            .take()
            .ok_or_else(|| SystemError::Spawn("no stdout pipe".into()))?;

        let (kill_tx, kill_rx) = oneshot::channel();
        self.kill = Some(kill_tx);
        let (exit_tx, exit_rx) = oneshot::channel();

        self.pool.running.fetch_add(1, Ordering::SeqCst);
        let pool = Arc::clone(&self.pool);
        tokio::spawn(async move {
            let exited = tokio::select! {
                status = child.wait() => Some(status),
                _ = kill_requested(kill_rx) => None,
            };
            let result = match exited {
                Some(Ok(status)) => match status.code() {
                    Some(code) => Ok(code),
                    None => Err(SystemError::Lost("script killed by signal".into())),
                },
                Some(Err(err)) => Err(SystemError::Lost(err.to_string())),
                None => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    Err(SystemError::Lost("worker stopped".into()))
                }
            };
            pool.running.fetch_sub(1, Ordering::SeqCst);
            let _ = exit_tx.send(result);
        });

        Ok(Execution {
            log: Box::new(log),
            exit: exit_rx,
        })
    }

    async fn stop(&mut self) {
        self.stopped = true;
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
    }
}

impl Drop for LocalWorker {
    fn drop(&mut self) {
        // A worker released intact goes back to the pool; a stopped one
        // is abandoned with its directory.
        if !self.stopped {
            self.pool.idle.lock().unwrap().push(self.dir.clone());
        }
    }
}

/// Resolves only on an actual kill request; a dropped sender means the
/// worker was released and the script should run to completion.
async fn kill_requested(rx: oneshot::Receiver<()>) {
    if rx.await.is_err() {
        std::future::pending::<()>().await;
    }
}
