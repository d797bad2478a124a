//! Trial execution — the lifecycle of one run.
//!
//! Pipeline: dataset prerequisites, a per-system parallelism slot, a
//! worker, then ship + run. The live log stream is teed into the run's
//! persistent log and the metrics scraper; each scraped record is
//! appended to the run. A zero exit settles the run as `Success`,
//! a non-zero exit as `Failure`, and a machine-level error surfaces to
//! the runner for its retry policy.

use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::sync::{watch, Semaphore};

use diviner_core::db::RunHandle;
use diviner_core::run::{Metrics, RunState};
use diviner_core::scrape::MetricsScraper;
use diviner_core::study::RunConfig;
use diviner_core::system::SystemError;
use diviner_core::value::Values;

use crate::builder::DatasetBuilder;
use crate::error::RunnerError;

/// Settlement message sent back to the runner loop.
pub(crate) struct Settled {
    pub values: Values,
    /// 0-indexed attempt at this point.
    pub attempt: u32,
    pub result: Result<Metrics, RunnerError>,
}

/// Resolves once cancellation is signalled. A dropped sender counts as
/// cancellation: the runner is gone.
pub(crate) async fn wait_cancelled(cancel: &mut watch::Receiver<bool>) {
    let _ = cancel.wait_for(|cancelled| *cancelled).await;
}

/// Run one trial to settlement, completing its run record.
pub(crate) async fn execute<R: RunHandle>(
    run: R,
    config: RunConfig,
    builder: Arc<DatasetBuilder>,
    slots: Arc<Semaphore>,
    mut cancel: watch::Receiver<bool>,
) -> Result<Metrics, RunnerError> {
    let result = drive(&run, &config, &builder, &slots, &mut cancel).await;
    settle(&run, result)
}

async fn drive<R: RunHandle>(
    run: &R,
    config: &RunConfig,
    builder: &DatasetBuilder,
    slots: &Arc<Semaphore>,
    cancel: &mut watch::Receiver<bool>,
) -> Result<Metrics, RunnerError> {
    // Prerequisites, before taking a parallelism slot: dataset builds run
    // on their own workers.
    for dataset in &config.datasets {
        run.set_status(&format!("ensuring dataset {}", dataset.name));
        builder.ensure(run.study(), dataset, cancel.clone()).await?;
    }

    run.set_status("waiting for a slot");
    let _slot = tokio::select! {
        permit = Arc::clone(slots).acquire_owned() => {
            permit.map_err(|_| RunnerError::Cancelled)?
        }
        _ = wait_cancelled(cancel) => return Err(RunnerError::Cancelled),
    };

    run.set_status("acquiring worker");
    let mut worker = tokio::select! {
        acquired = config.system.provider.acquire() => acquired?,
        _ = wait_cancelled(cancel) => return Err(RunnerError::Cancelled),
    };

    run.set_status("running");
    let exec = tokio::select! {
        started = worker.start(&config.local_files, &config.script) => started?,
        _ = wait_cancelled(cancel) => {
            worker.stop().await;
            return Err(RunnerError::Cancelled);
        }
    };

    // Tee the live log into the persistent record and the scraper.
    let mut scraper = MetricsScraper::new();
    let mut log = exec.log;
    let mut buf = [0u8; 4096];
    loop {
        tokio::select! {
            read = log.read(&mut buf) => {
                let n = read.map_err(|err| SystemError::Lost(err.to_string()))?;
                if n == 0 {
                    break;
                }
                run.write(&buf[..n])?;
                for metrics in scraper.push(&buf[..n]) {
                    run.update(&metrics)?;
                }
            }
            _ = wait_cancelled(cancel) => {
                worker.stop().await;
                return Err(RunnerError::Cancelled);
            }
        }
    }
    if let Some(metrics) = scraper.finish() {
        run.update(&metrics)?;
    }
    if scraper.discarded() > 0 {
        tracing::warn!(
            run = %run.id(),
            discarded = scraper.discarded(),
            "malformed metrics lines discarded"
        );
    }

    let code = tokio::select! {
        settled = exec.exit => match settled {
            Ok(result) => result?,
            Err(_) => return Err(SystemError::Lost("execution abandoned".into()).into()),
        },
        _ = wait_cancelled(cancel) => {
            worker.stop().await;
            return Err(RunnerError::Cancelled);
        }
    };
    if code != 0 {
        return Err(RunnerError::Script { code });
    }
    Ok(run.metrics()?)
}

/// Flush buffered log output and record the trial's terminal state.
/// Persistence failures replace the trial result: they terminate the
/// runner.
fn settle<R: RunHandle>(
    run: &R,
    result: Result<Metrics, RunnerError>,
) -> Result<Metrics, RunnerError> {
    run.flush()?;
    match &result {
        Ok(_) => {
            run.set_status("ok");
            run.complete(RunState::Success)?;
        }
        Err(RunnerError::Script { code }) => {
            run.set_status(&format!("script exited with code {code}"));
            run.complete(RunState::Failure)?;
        }
        Err(RunnerError::Dataset { name, reason }) => {
            run.set_status(&format!("dataset {name}: {reason}"));
            run.complete(RunState::Failure)?;
        }
        Err(RunnerError::Cancelled) => {
            run.set_status("cancelled");
            run.complete(RunState::Failure)?;
        }
        Err(RunnerError::Machine(err)) => {
            // The point may be retried as a fresh run; this record is done.
            run.set_status(&format!("machine failure: {err}"));
            run.complete(RunState::Failure)?;
        }
        Err(_) => {
            // Validation or persistence trouble: leave the run alone and
            // let the runner surface the error.
        }
    }
    result
}
