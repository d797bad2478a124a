//! diviner-db — the embedded study/run database, on redb.
//!
//! Layout (composite keys; u64 components preserve numeric order, the
//! equivalent of big-endian sequence keys):
//!
//! - `studies`: study name → serialized params
//! - `runs`:    (study, seq) → serialized run header
//! - `logs`:    (study, seq, block) → gzip-compressed log block
//! - `metrics`: (study, seq, update) → serialized metrics map
//! - `seqs`:    study name → last allocated run sequence
//!
//! Records are bincode-serialized; values are tagged enums, so kinds
//! round-trip exactly. Run sequences are dense and monotonic per study.
//!
//! The liveset distinguishes pending runs owned by this process from
//! orphans left behind by an earlier one: `Pending` queries match liveset
//! members only.

mod run;

pub use run::Run;

use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use redb::{ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};

use diviner_core::db::{Database, DbError};
use diviner_core::run::{RunState, StateMask};
use diviner_core::study::Study;
use diviner_core::value::Values;

const STUDIES: TableDefinition<&str, &[u8]> = TableDefinition::new("studies");
const RUNS: TableDefinition<(&str, u64), &[u8]> = TableDefinition::new("runs");
const LOGS: TableDefinition<(&str, u64, u64), &[u8]> = TableDefinition::new("logs");
const METRICS: TableDefinition<(&str, u64, u64), &[u8]> = TableDefinition::new("metrics");
const SEQS: TableDefinition<&str, u64> = TableDefinition::new("seqs");

/// The persistent header of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct RunHeader {
    pub seq: u64,
    pub study: String,
    pub values: Values,
    pub state: RunState,
}

pub(crate) struct DbInner {
    pub db: redb::Database,
    /// Runs created by this process and not yet complete.
    pub live: DashMap<(String, u64), ()>,
}

/// An embedded Diviner database. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Db {
    inner: Arc<DbInner>,
}

impl Db {
    /// Open the database at `path`, creating the file and its tables if
    /// they do not already exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Db, DbError> {
        let db = redb::Database::create(path).map_err(storage)?;
        let txn = db.begin_write().map_err(storage)?;
        {
            txn.open_table(STUDIES).map_err(storage)?;
            txn.open_table(RUNS).map_err(storage)?;
            txn.open_table(LOGS).map_err(storage)?;
            txn.open_table(METRICS).map_err(storage)?;
            txn.open_table(SEQS).map_err(storage)?;
        }
        txn.commit().map_err(storage)?;
        Ok(Db {
            inner: Arc::new(DbInner {
                db,
                live: DashMap::new(),
            }),
        })
    }
}

impl Database for Db {
    type Run = Run;

    fn new_run(&self, study: &Study, values: Values) -> Result<Run, DbError> {
        let name = study.name.as_str();
        let txn = self.inner.db.begin_write().map_err(storage)?;
        let header;
        {
            let mut studies = txn.open_table(STUDIES).map_err(storage)?;
            if studies.get(name).map_err(storage)?.is_none() {
                let meta = bincode::serialize(&study.params).map_err(codec)?;
                studies.insert(name, meta.as_slice()).map_err(storage)?;
            }

            let mut seqs = txn.open_table(SEQS).map_err(storage)?;
            let last = seqs.get(name).map_err(storage)?.map_or(0, |g| g.value());
            let seq = last + 1;
            seqs.insert(name, seq).map_err(storage)?;

            header = RunHeader {
                seq,
                study: study.name.clone(),
                values,
                state: RunState::Pending,
            };
            let mut runs = txn.open_table(RUNS).map_err(storage)?;
            runs.insert(
                (name, seq),
                bincode::serialize(&header).map_err(codec)?.as_slice(),
            )
            .map_err(storage)?;
        }
        txn.commit().map_err(storage)?;
        // Liveset registration happens after the commit: a concurrent
        // Pending query may briefly miss this run.
        self.inner
            .live
            .insert((header.study.clone(), header.seq), ());
        tracing::debug!(study = %header.study, seq = header.seq, "run created");
        Ok(Run::from_header(Arc::clone(&self.inner), header, true))
    }

    fn run(&self, id: &str) -> Result<Run, DbError> {
        let (study, seq) = parse_run_id(id)?;
        let txn = self.inner.db.begin_read().map_err(storage)?;
        let runs = txn.open_table(RUNS).map_err(storage)?;
        let guard = runs
            .get((study, seq))
            .map_err(storage)?
            .ok_or_else(|| DbError::NoSuchRun(id.to_string()))?;
        let header: RunHeader = bincode::deserialize(guard.value()).map_err(codec)?;
        Ok(Run::from_header(Arc::clone(&self.inner), header, false))
    }

    fn runs(&self, study: &str, states: StateMask) -> Result<Vec<Run>, DbError> {
        let txn = self.inner.db.begin_read().map_err(storage)?;
        let studies = txn.open_table(STUDIES).map_err(storage)?;
        if studies.get(study).map_err(storage)?.is_none() {
            return Err(DbError::NoSuchStudy(study.to_string()));
        }
        let runs = txn.open_table(RUNS).map_err(storage)?;
        let mut out = Vec::new();
        for entry in runs
            .range((study, 0u64)..=(study, u64::MAX))
            .map_err(storage)?
        {
            let (_, guard) = entry.map_err(storage)?;
            let header: RunHeader = bincode::deserialize(guard.value()).map_err(codec)?;
            let state = header.state;
            // Pending runs must be in the liveset; otherwise they are
            // orphaned and excluded.
            let live = state != RunState::Pending
                || self
                    .inner
                    .live
                    .contains_key(&(header.study.clone(), header.seq));
            if states.contains(state) && live {
                out.push(Run::from_header(Arc::clone(&self.inner), header, false));
            }
        }
        Ok(out)
    }
}

fn parse_run_id(id: &str) -> Result<(&str, u64), DbError> {
    let invalid = || DbError::InvalidRunId(id.to_string());
    let (study, seq) = id.split_once('/').ok_or_else(invalid)?;
    if study.is_empty() {
        return Err(invalid());
    }
    let seq: u64 = seq.parse().map_err(|_| invalid())?;
    Ok((study, seq))
}

pub(crate) fn storage<E: std::fmt::Display>(err: E) -> DbError {
    DbError::Storage(err.to_string())
}

pub(crate) fn codec(err: bincode::Error) -> DbError {
    DbError::Codec(err.to_string())
}
