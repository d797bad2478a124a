//! Studies — a named parameter search with an objective and an oracle.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::oracle::Oracle;
use crate::params::Params;
use crate::system::System;
use crate::value::Values;

/// Whether the objective metric is minimized or maximized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Minimize,
    Maximize,
}

/// The study's optimization target: a direction over a named metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Objective {
    pub direction: Direction,
    pub metric: String,
}

impl Objective {
    pub fn maximize(metric: impl Into<String>) -> Self {
        Objective {
            direction: Direction::Maximize,
            metric: metric.into(),
        }
    }

    pub fn minimize(metric: impl Into<String>) -> Self {
        Objective {
            direction: Direction::Minimize,
            metric: metric.into(),
        }
    }
}

impl fmt::Display for Objective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.direction {
            Direction::Minimize => write!(f, "minimize({})", self.metric),
            Direction::Maximize => write!(f, "maximize({})", self.metric),
        }
    }
}

/// A named, script-produced artifact shared by trials on one system.
/// Two datasets with the same `(name, system)` are the same dataset.
#[derive(Clone)]
pub struct Dataset {
    pub name: String,
    pub system: Arc<System>,
    /// Files shipped to the worker before the script runs.
    pub local_files: Vec<PathBuf>,
    /// Shell script that produces the dataset. The script is responsible
    /// for being idempotent relative to its output path across restarts;
    /// the runner only guarantees at-most-once invocation per lifetime.
    pub script: String,
}

impl fmt::Debug for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dataset")
            .field("name", &self.name)
            .field("system", &self.system.id)
            .finish()
    }
}

/// The concrete plan for one trial, produced by the study's run callback.
#[derive(Clone)]
pub struct RunConfig {
    pub system: Arc<System>,
    /// Datasets to ensure built before the script starts.
    pub datasets: Vec<Dataset>,
    /// Files shipped to the worker.
    pub local_files: Vec<PathBuf>,
    /// The trial's shell script.
    pub script: String,
}

impl fmt::Debug for RunConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunConfig")
            .field("system", &self.system.id)
            .field("datasets", &self.datasets)
            .finish()
    }
}

/// Maps a trial point to its concrete run plan.
pub type RunConfigFn = Arc<dyn Fn(&Values) -> RunConfig + Send + Sync>;

/// An immutable study definition.
///
/// Study names may not contain `/`: run identifiers are `study/seq`.
#[derive(Clone)]
pub struct Study {
    pub name: String,
    pub params: Params,
    pub objective: Objective,
    /// Produces the run plan for a proposed point.
    pub run: RunConfigFn,
    pub oracle: Arc<dyn Oracle>,
}

impl fmt::Debug for Study {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Study")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("objective", &self.objective)
            .finish()
    }
}
