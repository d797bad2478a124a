//! diviner-core — shared types and interfaces for the Diviner
//! hyperparameter-search orchestrator. The database and runner crates
//! depend on this one.

pub mod db;
pub mod oracle;
pub mod params;
pub mod run;
pub mod scrape;
pub mod study;
pub mod system;
pub mod value;

pub use db::{Database, DbError, RunHandle};
pub use oracle::{GridSearch, Oracle, OracleError};
pub use params::{Param, ParamError, Params};
pub use run::{Metrics, RunState, StateMask, Trial};
pub use scrape::MetricsScraper;
pub use study::{Dataset, Direction, Objective, RunConfig, RunConfigFn, Study};
pub use system::{Execution, System, SystemError, SystemProvider, Worker};
pub use value::{Kind, Value, Values};
