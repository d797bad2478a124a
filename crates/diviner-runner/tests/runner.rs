//! End-to-end runner tests against the embedded database and local
//! subprocess workers.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use diviner_core::db::{Database, RunHandle};
use diviner_core::oracle::GridSearch;
use diviner_core::params::{Param, Params};
use diviner_core::run::{Metrics, StateMask, Trial};
use diviner_core::study::{Dataset, Objective, RunConfig, Study};
use diviner_core::system::{System, SystemError, SystemProvider, Worker};
use diviner_core::value::Values;
use diviner_db::Db;
use diviner_runner::{LocalSystem, RetryConfig, Runner, RunnerConfig};

fn init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn int_params(name: &str, domain: impl IntoIterator<Item = i64>) -> Params {
    let mut params = Params::new();
    params.insert(name.to_string(), Param::discrete(domain).unwrap());
    params
}

fn fast_retries() -> RunnerConfig {
    RunnerConfig {
        retry: RetryConfig {
            initial_ms: 5,
            max_ms: 50,
            multiplier: 1.5,
            jitter: 0.2,
            max_attempts: 3,
        },
        ..RunnerConfig::default()
    }
}

async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(30);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn grid_search_runs_every_point() {
    init();
    let dir = tempfile::tempdir().unwrap();
    let db = Db::open(dir.path().join("test.ddb")).unwrap();
    let local = LocalSystem::new(dir.path().join("workers"));
    let system = local.system("test", 2);

    // The sentinel makes a second build fail, and every trial asserts the
    // dataset exists before running: three successes prove the dataset
    // script ran exactly once, before any trial.
    let sentinel = dir.path().join("dataset");
    let dataset = Dataset {
        name: "testset".to_string(),
        system: Arc::clone(&system),
        local_files: Vec::new(),
        script: format!(
            "test -f {0} && exit 1\necho ran > {0}\n",
            sentinel.display()
        ),
    };

    let study = Study {
        name: "test".to_string(),
        params: int_params("param", [0, 1, 2]),
        objective: Objective::maximize("acc"),
        run: {
            let system = Arc::clone(&system);
            let dataset = dataset.clone();
            let sentinel = sentinel.clone();
            Arc::new(move |values: &Values| RunConfig {
                system: Arc::clone(&system),
                datasets: vec![dataset.clone()],
                local_files: Vec::new(),
                script: format!(
                    "test -f {} || exit 1\n\
                     echo hello world\n\
                     echo METRICS: paramvalue=1\n\
                     echo METRICS: another=3,paramvalue={}\n",
                    sentinel.display(),
                    values["param"],
                ),
            })
        },
        oracle: Arc::new(GridSearch),
    };

    let runner = Runner::new(study, db.clone());
    let done = runner.run(0).await.unwrap();
    assert!(done, "grid study should finish");

    let runs = db.runs("test", StateMask::COMPLETE).unwrap();
    let mut trials: Vec<Trial> = runs.iter().map(|r| r.trial().unwrap()).collect();
    trials.sort_by_key(|t| t.values["param"].as_int());
    assert_eq!(trials.len(), 3);
    for (i, trial) in trials.iter().enumerate() {
        assert_eq!(trial.values, Values::new().with("param", i as i64));
        let want: Metrics = [
            ("another".to_string(), 3.0),
            ("paramvalue".to_string(), i as f64),
        ]
        .into_iter()
        .collect();
        assert_eq!(trial.metrics, want, "trial {i}");
    }

    let counters = runner.counters();
    assert_eq!(counters["ndone"], 3);
    assert_eq!(counters["nsuccess"], 3);
    assert_eq!(counters["nfail"], 0);
    assert_eq!(counters["npending"], 0);

    // Two parallel slots bound the worker pool.
    let started = local.workers_started();
    assert!((1..=2).contains(&started), "workers started: {started}");
}

#[tokio::test]
async fn failing_dataset_fails_dependent_trials() {
    init();
    let dir = tempfile::tempdir().unwrap();
    let db = Db::open(dir.path().join("test.ddb")).unwrap();
    let local = LocalSystem::new(dir.path().join("workers"));
    let system = local.system("test", 0);

    let dataset = Dataset {
        name: "testset".to_string(),
        system: Arc::clone(&system),
        local_files: Vec::new(),
        script: "exit 1".to_string(),
    };

    let study = Study {
        name: "test".to_string(),
        params: int_params("param", [0, 1]),
        objective: Objective::maximize("acc"),
        run: {
            let system = Arc::clone(&system);
            let dataset = dataset.clone();
            Arc::new(move |values: &Values| {
                let mut config = RunConfig {
                    system: Arc::clone(&system),
                    datasets: Vec::new(),
                    local_files: Vec::new(),
                    script: "exit 1".to_string(),
                };
                if values["param"].as_int() == 0 {
                    // This trial fails on its prerequisite, before its own
                    // script could run.
                    config.datasets = vec![dataset.clone()];
                }
                config
            })
        },
        oracle: Arc::new(GridSearch),
    };

    let runner = Runner::new(study, db.clone());
    let done = runner.run(0).await.unwrap();
    assert!(!done, "a study with no successes is stuck, not done");

    let counters = runner.counters();
    assert_eq!(counters["ndone"], 2);
    assert_eq!(counters["nfail"], 2);
    assert_eq!(counters["nsuccess"], 0);

    assert!(db.runs("test", StateMask::SUCCESS).unwrap().is_empty());
    assert_eq!(db.runs("test", StateMask::COMPLETE).unwrap().len(), 2);
}

#[tokio::test]
async fn later_metrics_record_wins() {
    init();
    let dir = tempfile::tempdir().unwrap();
    let db = Db::open(dir.path().join("test.ddb")).unwrap();
    let local = LocalSystem::new(dir.path().join("workers"));
    let system = local.system("test", 1);

    let study = Study {
        name: "test".to_string(),
        params: int_params("param", [1]),
        objective: Objective::maximize("second"),
        run: {
            let system = Arc::clone(&system);
            Arc::new(move |_: &Values| RunConfig {
                system: Arc::clone(&system),
                datasets: Vec::new(),
                local_files: Vec::new(),
                script: "echo METRICS: first=1\necho METRICS: second=3\n".to_string(),
            })
        },
        oracle: Arc::new(GridSearch),
    };

    let runner = Runner::new(study, db.clone());
    assert!(runner.run(0).await.unwrap());

    let runs = db.runs("test", StateMask::SUCCESS).unwrap();
    assert_eq!(runs.len(), 1);
    // The current metrics are the last appended record, not a merge.
    let want: Metrics = [("second".to_string(), 3.0)].into_iter().collect();
    assert_eq!(runs[0].metrics().unwrap(), want);
}

#[tokio::test]
async fn cancellation_drains_executors() {
    init();
    let dir = tempfile::tempdir().unwrap();
    let db = Db::open(dir.path().join("test.ddb")).unwrap();
    let local = LocalSystem::new(dir.path().join("workers"));
    let system = local.system("test", 2);

    let study = Study {
        name: "test".to_string(),
        params: int_params("param", [0, 1, 2]),
        objective: Objective::maximize("acc"),
        run: {
            let system = Arc::clone(&system);
            Arc::new(move |values: &Values| RunConfig {
                system: Arc::clone(&system),
                datasets: Vec::new(),
                local_files: Vec::new(),
                script: if values["param"].as_int() == 0 {
                    "echo METRICS: acc=1".to_string()
                } else {
                    "sleep 30".to_string()
                },
            })
        },
        oracle: Arc::new(GridSearch),
    };

    let runner = Arc::new(Runner::new(study, db.clone()));
    let driver = tokio::spawn({
        let runner = Arc::clone(&runner);
        async move { runner.run(0).await }
    });

    wait_until("first trial to settle", || runner.counters()["ndone"] >= 1).await;
    runner.cancel();

    let done = driver.await.unwrap().unwrap();
    assert!(!done);

    // Every dispatched run settled; the sleepers were killed.
    wait_until("workers to stop", || local.scripts_running() == 0).await;
    assert!(db.runs("test", StateMask::PENDING).unwrap().is_empty());
    let counters = runner.counters();
    assert_eq!(counters["ndone"], counters["nsuccess"] + counters["nfail"]);
    assert!(counters["nfail"] >= 2, "sleepers should fail: {counters:?}");
}

/// Fails the first `remaining` worker acquisitions, then delegates.
#[derive(Clone)]
struct FlakyProvider {
    inner: LocalSystem,
    remaining: Arc<AtomicU32>,
}

#[async_trait]
impl SystemProvider for FlakyProvider {
    async fn acquire(&self) -> Result<Box<dyn Worker>, SystemError> {
        let injected = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(SystemError::Unavailable("injected outage".to_string()));
        }
        self.inner.acquire().await
    }
}

#[tokio::test]
async fn machine_failure_retries_with_backoff() {
    init();
    let dir = tempfile::tempdir().unwrap();
    let db = Db::open(dir.path().join("test.ddb")).unwrap();
    let provider = FlakyProvider {
        inner: LocalSystem::new(dir.path().join("workers")),
        remaining: Arc::new(AtomicU32::new(1)),
    };
    let system = System::new("flaky", 1, Arc::new(provider));

    let study = Study {
        name: "test".to_string(),
        params: int_params("param", [7]),
        objective: Objective::maximize("acc"),
        run: {
            let system = Arc::clone(&system);
            Arc::new(move |_: &Values| RunConfig {
                system: Arc::clone(&system),
                datasets: Vec::new(),
                local_files: Vec::new(),
                script: "echo METRICS: acc=7".to_string(),
            })
        },
        oracle: Arc::new(GridSearch),
    };

    let runner = Runner::with_config(study, db.clone(), fast_retries());
    let done = runner.run(0).await.unwrap();
    assert!(done);

    let counters = runner.counters();
    assert_eq!(counters["nretry"], 1);
    assert_eq!(counters["nsuccess"], 1);
    assert_eq!(counters["ndone"], 1);
    assert_eq!(counters["nfail"], 0);

    // The failed attempt left a Failure record; the retry is a fresh run.
    assert_eq!(db.runs("test", StateMask::COMPLETE).unwrap().len(), 2);
    let successes = db.runs("test", StateMask::SUCCESS).unwrap();
    assert_eq!(successes.len(), 1);
    let want: Metrics = [("acc".to_string(), 7.0)].into_iter().collect();
    assert_eq!(successes[0].metrics().unwrap(), want);
}

#[tokio::test]
async fn target_count_stops_proposing_and_drains() {
    init();
    let dir = tempfile::tempdir().unwrap();
    let db = Db::open(dir.path().join("test.ddb")).unwrap();
    let local = LocalSystem::new(dir.path().join("workers"));
    let system = local.system("test", 2);

    let study = Study {
        name: "test".to_string(),
        params: int_params("param", [0, 1, 2]),
        objective: Objective::maximize("acc"),
        run: {
            let system = Arc::clone(&system);
            Arc::new(move |values: &Values| RunConfig {
                system: Arc::clone(&system),
                datasets: Vec::new(),
                local_files: Vec::new(),
                script: format!("echo METRICS: acc={}", values["param"]),
            })
        },
        oracle: Arc::new(GridSearch),
    };

    let runner = Runner::new(study, db.clone());
    let done = runner.run(1).await.unwrap();
    // The target cuts the study short of exhaustion, but everything
    // already dispatched drains.
    assert!(!done);

    let counters = runner.counters();
    assert!(counters["ndone"] >= 1);
    assert_eq!(counters["npending"], 0);
    assert_eq!(
        counters["ndone"],
        db.runs("test", StateMask::COMPLETE).unwrap().len() as u64
    );
}
