//! The runner loop: oracle-driven proposals, parallelism accounting,
//! retries, termination.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, watch, Semaphore};

use diviner_core::db::{Database, DbError, RunHandle};
use diviner_core::run::{StateMask, Trial};
use diviner_core::study::Study;
use diviner_core::system::System;
use diviner_core::value::Values;

use crate::builder::DatasetBuilder;
use crate::config::RunnerConfig;
use crate::error::RunnerError;
use crate::executor::{execute, wait_cancelled, Settled};
use crate::retry::RetryPolicy;

/// Runner progress counters, exposed as a snapshot for observability.
#[derive(Debug, Default)]
struct Counters {
    npending: AtomicU64,
    ndone: AtomicU64,
    nfail: AtomicU64,
    nretry: AtomicU64,
    nsuccess: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> BTreeMap<&'static str, u64> {
        BTreeMap::from([
            ("npending", self.npending.load(Ordering::SeqCst)),
            ("ndone", self.ndone.load(Ordering::SeqCst)),
            ("nfail", self.nfail.load(Ordering::SeqCst)),
            ("nretry", self.nretry.load(Ordering::SeqCst)),
            ("nsuccess", self.nsuccess.load(Ordering::SeqCst)),
        ])
    }
}

struct SystemSlots {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

/// Drives one study against one database.
///
/// The runner owns the dataset builder and the per-system parallelism
/// semaphores; executors borrow both for the duration of a trial.
pub struct Runner<D: Database> {
    study: Study,
    db: D,
    policy: RetryPolicy,
    oracle_batch: usize,
    builder: Arc<DatasetBuilder>,
    systems: DashMap<String, SystemSlots>,
    counters: Counters,
    cancel_tx: watch::Sender<bool>,
}

impl<D: Database> Runner<D> {
    pub fn new(study: Study, db: D) -> Self {
        Self::with_config(study, db, RunnerConfig::default())
    }

    pub fn with_config(study: Study, db: D, config: RunnerConfig) -> Self {
        let (cancel_tx, _) = watch::channel(false);
        Self {
            study,
            db,
            policy: RetryPolicy::new(config.retry),
            oracle_batch: config.oracle_batch.max(1),
            builder: Arc::new(DatasetBuilder::new()),
            systems: DashMap::new(),
            counters: Counters::default(),
            cancel_tx,
        }
    }

    /// Cancel the runner. Pending worker acquisitions, dataset builds,
    /// and script executions abort; in-flight runs settle as `Failure`
    /// with a cancellation marker, and [`Runner::run`] returns once they
    /// have drained.
    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }

    /// A snapshot of the progress counters.
    pub fn counters(&self) -> BTreeMap<&'static str, u64> {
        self.counters.snapshot()
    }

    /// Drive the study. With `ntarget > 0` the runner shuts down once
    /// that many trials are done; with `ntarget == 0` it runs until the
    /// oracle is exhausted.
    ///
    /// Returns `Ok(true)` when the oracle declared the study exhausted
    /// and every dispatched trial drained. Returns `Ok(false)` when the
    /// runner stopped short of that: target reached, cancelled, or stuck
    /// (every remaining proposal already failed terminally — the
    /// counters tell why).
    pub async fn run(&self, ntarget: u64) -> Result<bool, RunnerError> {
        let result = self.run_loop(ntarget).await;
        if result.is_err() {
            // Executors may still be in flight when the loop aborts; make
            // sure they stop.
            let _ = self.cancel_tx.send(true);
        }
        result
    }

    async fn run_loop(&self, ntarget: u64) -> Result<bool, RunnerError> {
        let mut cancel = self.cancel_tx.subscribe();
        let mut history = self.load_history()?;
        // Every point launched by this invocation, by canonical identity.
        // Seeded with history so an oracle re-proposing a completed point
        // is caught the same way.
        let mut proposed: HashSet<String> =
            history.iter().map(|t| t.values.to_string()).collect();

        let (settle_tx, mut settle_rx) = mpsc::unbounded_channel::<Settled>();
        let mut inflight: usize = 0;
        let mut draining = false;

        loop {
            let mut exhausted = false;
            if !draining && !*cancel.borrow() {
                let want = self.proposal_want(inflight);
                if want > 0 {
                    let points = self
                        .study
                        .oracle
                        .next(&history, &self.study.params, &self.study.objective, want)
                        .await?;
                    if points.is_empty() {
                        exhausted = true;
                    } else {
                        let mut launched = 0usize;
                        for values in points {
                            if !proposed.insert(values.to_string()) {
                                // The oracle is responsible for not
                                // re-proposing on unchanged history; skip
                                // and note it.
                                tracing::debug!(point = %values, "known point re-proposed; skipped");
                                continue;
                            }
                            self.validate(&values)?;
                            self.launch(values, 0, Duration::ZERO, &settle_tx)?;
                            inflight += 1;
                            launched += 1;
                        }
                        if launched == 0 && inflight == 0 {
                            // Nothing new to start and nothing running:
                            // the only points left have already been tried
                            // and failed terminally. The study is stuck.
                            tracing::warn!(study = %self.study.name, "study stuck; see counters");
                            return Ok(false);
                        }
                    }
                }
            }

            if inflight == 0 {
                if exhausted {
                    return Ok(true);
                }
                if draining || *cancel.borrow() {
                    return Ok(false);
                }
            }

            let settled = tokio::select! {
                settled = settle_rx.recv() => match settled {
                    Some(settled) => settled,
                    // We hold a sender; unreachable, but drain cleanly.
                    None => return Ok(false),
                },
                _ = cancel.changed() => {
                    tracing::info!(study = %self.study.name, "cancelled; draining executors");
                    draining = true;
                    continue;
                }
            };
            inflight -= 1;
            self.counters.npending.fetch_sub(1, Ordering::SeqCst);

            match settled.result {
                Ok(metrics) => {
                    self.counters.nsuccess.fetch_add(1, Ordering::SeqCst);
                    self.counters.ndone.fetch_add(1, Ordering::SeqCst);
                    tracing::info!(point = %settled.values, "trial succeeded");
                    history.push(Trial {
                        values: settled.values,
                        metrics,
                    });
                }
                Err(err) if err.is_transient() => {
                    let next_attempt = settled.attempt + 1;
                    if next_attempt < self.policy.max_attempts() && !draining && !*cancel.borrow()
                    {
                        let delay = self.policy.delay(settled.attempt);
                        tracing::info!(
                            point = %settled.values,
                            attempt = next_attempt,
                            ?delay,
                            error = %err,
                            "machine failure; retrying"
                        );
                        self.counters.nretry.fetch_add(1, Ordering::SeqCst);
                        self.launch(settled.values, next_attempt, delay, &settle_tx)?;
                        inflight += 1;
                    } else {
                        tracing::warn!(point = %settled.values, error = %err, "retries exhausted");
                        self.counters.nfail.fetch_add(1, Ordering::SeqCst);
                        self.counters.ndone.fetch_add(1, Ordering::SeqCst);
                    }
                }
                Err(err) if err.fails_trial() => {
                    tracing::info!(point = %settled.values, error = %err, "trial failed");
                    self.counters.nfail.fetch_add(1, Ordering::SeqCst);
                    self.counters.ndone.fetch_add(1, Ordering::SeqCst);
                }
                // Validation, persistence, or unclassified: terminate.
                Err(err) => return Err(err),
            }

            if ntarget > 0 && self.counters.ndone.load(Ordering::SeqCst) >= ntarget {
                draining = true;
            }
        }
    }

    fn load_history(&self) -> Result<Vec<Trial>, RunnerError> {
        let runs = match self.db.runs(&self.study.name, StateMask::SUCCESS) {
            Ok(runs) => runs,
            // A study that has never run has no history.
            Err(DbError::NoSuchStudy(_)) => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut history = Vec::with_capacity(runs.len());
        for run in runs {
            history.push(run.trial()?);
        }
        Ok(history)
    }

    /// How many points to request from the oracle: enough to keep every
    /// known system's pipe full with headroom, capped, and at least one
    /// whenever nothing is in flight.
    fn proposal_want(&self, inflight: usize) -> usize {
        let capacity: usize = self.systems.iter().map(|e| e.value().capacity).sum();
        let target = if capacity == 0 {
            self.oracle_batch
        } else {
            (2 * capacity).min(self.oracle_batch)
        };
        let want = target.saturating_sub(inflight);
        if want == 0 && inflight == 0 {
            1
        } else {
            want
        }
    }

    /// Proposed points must conform to the study's parameter space.
    fn validate(&self, values: &Values) -> Result<(), RunnerError> {
        for (name, value) in values.iter() {
            match self.study.params.get(name) {
                None => {
                    return Err(RunnerError::Validation(format!(
                        "proposal names unknown parameter {name}"
                    )))
                }
                Some(param) if param.kind() != value.kind() => {
                    return Err(RunnerError::Validation(format!(
                        "parameter {name}: expected {} value, got {}",
                        param.kind(),
                        value.kind()
                    )))
                }
                Some(_) => {}
            }
        }
        for name in self.study.params.keys() {
            if !values.contains_key(name) {
                return Err(RunnerError::Validation(format!(
                    "proposal missing parameter {name}"
                )));
            }
        }
        Ok(())
    }

    fn slots_for(&self, system: &Arc<System>) -> Arc<Semaphore> {
        let entry = self
            .systems
            .entry(system.id.clone())
            .or_insert_with(|| SystemSlots {
                semaphore: Arc::new(Semaphore::new(system.slots())),
                capacity: system.slots(),
            });
        Arc::clone(&entry.semaphore)
    }

    /// Create a run for the point and dispatch its executor, optionally
    /// after a retry delay.
    fn launch(
        &self,
        values: Values,
        attempt: u32,
        delay: Duration,
        settle_tx: &mpsc::UnboundedSender<Settled>,
    ) -> Result<(), RunnerError> {
        let config = (self.study.run)(&values);
        let slots = self.slots_for(&config.system);
        let run = self.db.new_run(&self.study, values.clone())?;
        let builder = Arc::clone(&self.builder);
        let cancel = self.cancel_tx.subscribe();
        let settle_tx = settle_tx.clone();

        self.counters.npending.fetch_add(1, Ordering::SeqCst);
        tracing::info!(run = %run.id(), point = %values, attempt, "run dispatched");

        tokio::spawn(async move {
            if !delay.is_zero() {
                let mut cancel = cancel.clone();
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = wait_cancelled(&mut cancel) => {}
                }
            }
            let result = execute(run, config, builder, slots, cancel).await;
            let _ = settle_tx.send(Settled {
                values,
                attempt,
                result,
            });
        });
        Ok(())
    }
}
