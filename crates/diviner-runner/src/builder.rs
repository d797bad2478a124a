//! Deduplicated dataset builds.
//!
//! The builder maps `(study, dataset, system)` to a build future. The
//! first requester owns the build: it acquires a worker, ships the
//! dataset's files, and runs its script. Concurrent requesters attach to
//! the same future and observe the same outcome.
//!
//! Script outcomes are sticky for the life of the runner: a dataset that
//! succeeded is never rebuilt, and one whose script exited non-zero fails
//! every dependent trial. A machine-level failure is different — the entry
//! is dropped from the registry so the next requester retries from
//! scratch, and current waiters get a transient error for the runner's
//! retry policy.
//!
//! Cross-restart idempotence belongs to the dataset script itself (the
//! usual shape: `test -f OUT && exit 1; ... > OUT`); the builder only
//! guarantees at-most-once invocation per runner lifetime.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::io::AsyncReadExt;
use tokio::sync::watch;

use diviner_core::study::Dataset;
use diviner_core::system::SystemError;

use crate::error::RunnerError;
use crate::executor::wait_cancelled;

type BuildKey = (String, String, String);

#[derive(Debug, Clone)]
enum Outcome {
    Built,
    /// The dataset script exited non-zero. Sticky.
    ScriptFailed(i32),
    /// A worker died or transport broke before the script settled.
    Machine(SystemError),
    Cancelled,
}

#[derive(Default)]
pub struct DatasetBuilder {
    builds: Mutex<HashMap<BuildKey, watch::Receiver<Option<Outcome>>>>,
}

impl DatasetBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until the dataset is known-built. Returns `Ok(())` once the
    /// dataset's script has completed successfully, whether in this call
    /// or an earlier one.
    pub async fn ensure(
        &self,
        study: &str,
        dataset: &Dataset,
        cancel: watch::Receiver<bool>,
    ) -> Result<(), RunnerError> {
        let key = (
            study.to_string(),
            dataset.name.clone(),
            dataset.system.id.clone(),
        );

        // Lookup-or-insert under a short-lived lock; the build itself runs
        // without it.
        let owner = {
            let mut builds = self.builds.lock().unwrap();
            match builds.get(&key) {
                Some(rx) => Err(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    builds.insert(key.clone(), rx);
                    Ok(tx)
                }
            }
        };

        let outcome = match owner {
            Ok(tx) => {
                let outcome = build(dataset, cancel).await;
                if !matches!(outcome, Outcome::Built | Outcome::ScriptFailed(_)) {
                    // Not sticky: let the next requester start over.
                    self.builds.lock().unwrap().remove(&key);
                }
                let _ = tx.send(Some(outcome.clone()));
                outcome
            }
            Err(mut rx) => match rx.wait_for(|o| o.is_some()).await {
                Ok(guard) => guard.clone().unwrap_or(Outcome::Cancelled),
                // Owner dropped without publishing; treat as a lost worker.
                Err(_) => Outcome::Machine(SystemError::Lost("dataset build abandoned".into())),
            },
        };

        match outcome {
            Outcome::Built => Ok(()),
            Outcome::ScriptFailed(code) => Err(RunnerError::Dataset {
                name: dataset.name.clone(),
                reason: format!("script exited with code {code}"),
            }),
            Outcome::Machine(err) => Err(RunnerError::Machine(err)),
            Outcome::Cancelled => Err(RunnerError::Cancelled),
        }
    }
}

/// Run the dataset script on a freshly acquired worker.
async fn build(dataset: &Dataset, mut cancel: watch::Receiver<bool>) -> Outcome {
    if *cancel.borrow() {
        return Outcome::Cancelled;
    }
    tracing::info!(
        dataset = %dataset.name,
        system = %dataset.system.id,
        "building dataset"
    );

    let mut worker = tokio::select! {
        acquired = dataset.system.provider.acquire() => match acquired {
            Ok(worker) => worker,
            Err(err) => return Outcome::Machine(err),
        },
        _ = wait_cancelled(&mut cancel) => return Outcome::Cancelled,
    };

    let exec = tokio::select! {
        started = worker.start(&dataset.local_files, &dataset.script) => match started {
            Ok(exec) => exec,
            Err(err) => return Outcome::Machine(err),
        },
        _ = wait_cancelled(&mut cancel) => return Outcome::Cancelled,
    };

    // Dataset logs are not persisted, but the stream must drain or the
    // script can stall on a full pipe.
    let mut log = exec.log;
    let mut sink = [0u8; 4096];
    loop {
        tokio::select! {
            read = log.read(&mut sink) => match read {
                Ok(0) => break,
                Ok(_) => {}
                Err(err) => return Outcome::Machine(SystemError::Lost(err.to_string())),
            },
            _ = wait_cancelled(&mut cancel) => {
                worker.stop().await;
                return Outcome::Cancelled;
            }
        }
    }

    let settled = tokio::select! {
        settled = exec.exit => settled,
        _ = wait_cancelled(&mut cancel) => {
            worker.stop().await;
            return Outcome::Cancelled;
        }
    };

    match settled {
        Ok(Ok(0)) => {
            tracing::info!(dataset = %dataset.name, "dataset built");
            Outcome::Built
        }
        Ok(Ok(code)) => {
            tracing::warn!(dataset = %dataset.name, code, "dataset script failed");
            Outcome::ScriptFailed(code)
        }
        Ok(Err(err)) => Outcome::Machine(err),
        Err(_) => Outcome::Machine(SystemError::Lost("execution abandoned".into())),
    }
}
