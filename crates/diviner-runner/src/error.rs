//! Runner error classification.
//!
//! The runner distinguishes six kinds of failure:
//!
//! - validation: malformed proposals, unknown studies; never retried
//! - machine-transient: a worker died or a transport broke; retried with
//!   backoff up to a bounded attempt count
//! - script-terminal: the user script exited non-zero; the run fails
//! - dataset-terminal: a dataset script failed permanently; dependent
//!   trials fail without attempting their own script
//! - persistence: a database write failed; surfaced from the runner
//! - cancelled: the runner was cancelled
//!
//! Anything else is propagated unclassified and terminates the runner.

use thiserror::Error;

use diviner_core::db::DbError;
use diviner_core::oracle::OracleError;
use diviner_core::system::SystemError;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("validation: {0}")]
    Validation(String),

    /// Machine-level failure; eligible for retry.
    #[error(transparent)]
    Machine(#[from] SystemError),

    /// The trial script exited non-zero. Terminal for the trial.
    #[error("script exited with code {code}")]
    Script { code: i32 },

    /// A dataset prerequisite failed permanently. Terminal for the trial.
    #[error("dataset {name}: {reason}")]
    Dataset { name: String, reason: String },

    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Oracle(#[from] OracleError),

    #[error("cancelled")]
    Cancelled,
}

impl RunnerError {
    /// Whether the failure is worth another attempt at the same point.
    pub fn is_transient(&self) -> bool {
        matches!(self, RunnerError::Machine(_))
    }

    /// Whether the failure settles the trial without terminating the
    /// runner: the run ends in `Failure` and the loop moves on.
    pub fn fails_trial(&self) -> bool {
        matches!(
            self,
            RunnerError::Script { .. } | RunnerError::Dataset { .. } | RunnerError::Cancelled
        )
    }
}
