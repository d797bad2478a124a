//! The persistence contract the runner requires.
//!
//! A database records runs: their point, state, streamed log output, and
//! appended metric series. The runner depends only on these traits; the
//! embedded implementation lives in its own crate.

use std::io::Read;

use thiserror::Error;

use crate::run::{Metrics, RunState, StateMask, Trial};
use crate::study::Study;
use crate::value::Values;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("no such study: {0}")]
    NoSuchStudy(String),
    #[error("no such run: {0}")]
    NoSuchRun(String),
    #[error("invalid run ID: {0}")]
    InvalidRunId(String),
    /// Rejected state transition: the run already settled in a different
    /// terminal state. Repeating the same terminal state is permitted.
    #[error("run {id} already complete ({state})")]
    AlreadyComplete { id: String, state: RunState },
    #[error("storage: {0}")]
    Storage(String),
    #[error("codec: {0}")]
    Codec(String),
}

/// A durable record of studies and their runs.
pub trait Database: Clone + Send + Sync + 'static {
    type Run: RunHandle;

    /// Allocate the next sequence number under the study, persist the run
    /// as `Pending`, and register it in the in-memory liveset.
    fn new_run(&self, study: &Study, values: Values) -> Result<Self::Run, DbError>;

    /// Load a run by its `study/seq` identifier.
    fn run(&self, id: &str) -> Result<Self::Run, DbError>;

    /// Enumerate a study's runs matching the state mask. `Pending` matches
    /// only liveset members; a pending run without an owning process is
    /// orphaned and excluded.
    fn runs(&self, study: &str, states: StateMask) -> Result<Vec<Self::Run>, DbError>;
}

/// A handle on one persistent run.
///
/// Log writes are buffered and flushed in blocks; callers flush before
/// completing so no buffered block is lost. All persistent updates are
/// serialized per run by the underlying store's transaction discipline.
pub trait RunHandle: Clone + Send + Sync + 'static {
    /// `study/seq`.
    fn id(&self) -> String;
    fn seq(&self) -> u64;
    fn study(&self) -> &str;
    fn values(&self) -> &Values;
    fn state(&self) -> RunState;

    /// Append to the run's log. Buffered; see [`RunHandle::flush`].
    fn write(&self, buf: &[u8]) -> Result<(), DbError>;

    /// Flush any buffered log output to storage.
    fn flush(&self) -> Result<(), DbError>;

    /// A reader over the full log, blocks decompressed in write order.
    fn log_reader(&self) -> Box<dyn Read + Send>;

    /// Append a metrics record to the run's series.
    fn update(&self, metrics: &Metrics) -> Result<(), DbError>;

    /// The most recently appended metrics record, or empty if none.
    fn metrics(&self) -> Result<Metrics, DbError>;

    /// Atomically transition to a terminal state. On persistence failure
    /// the in-memory state is rolled back and the error surfaced.
    fn complete(&self, state: RunState) -> Result<(), DbError>;

    /// Volatile, in-memory status string. Not persisted.
    fn set_status(&self, status: &str);
    fn status(&self) -> String;

    /// The run as a (point, current metrics) pair.
    fn trial(&self) -> Result<Trial, DbError> {
        Ok(Trial {
            values: self.values().clone(),
            metrics: self.metrics()?,
        })
    }
}
