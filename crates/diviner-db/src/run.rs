//! The persistent run handle: log blocks, metric series, state transitions.

use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use redb::ReadableTable;

use diviner_core::db::{DbError, RunHandle};
use diviner_core::run::{Metrics, RunState};
use diviner_core::value::Values;

use crate::{codec, storage, DbInner, RunHeader, LOGS, METRICS, RUNS};

/// Log writes accumulate here and are flushed in blocks of this size.
const LOG_BLOCK: usize = 4 << 10;

struct LogBuffer {
    buf: Vec<u8>,
    /// Next block sub-key. `None` until we either know this run is fresh
    /// or have looked up the last persisted block.
    next_block: Option<u64>,
}

pub(crate) struct RunInner {
    db: Arc<DbInner>,
    seq: u64,
    study: String,
    values: Values,
    state: Mutex<RunState>,
    status: Mutex<String>,
    log: Mutex<LogBuffer>,
}

/// A handle on one run. Cheap to clone; clones share buffers and state.
#[derive(Clone)]
pub struct Run {
    inner: Arc<RunInner>,
}

impl Run {
    pub(crate) fn from_header(db: Arc<DbInner>, header: RunHeader, fresh: bool) -> Run {
        Run {
            inner: Arc::new(RunInner {
                db,
                seq: header.seq,
                study: header.study,
                values: header.values,
                state: Mutex::new(header.state),
                status: Mutex::new(String::new()),
                log: Mutex::new(LogBuffer {
                    buf: Vec::new(),
                    next_block: if fresh { Some(0) } else { None },
                }),
            }),
        }
    }

    fn marshal(&self, state: RunState) -> Result<(), DbError> {
        let header = RunHeader {
            seq: self.inner.seq,
            study: self.inner.study.clone(),
            values: self.inner.values.clone(),
            state,
        };
        let txn = self.inner.db.db.begin_write().map_err(storage)?;
        {
            let mut runs = txn.open_table(RUNS).map_err(storage)?;
            runs.insert(
                (self.inner.study.as_str(), self.inner.seq),
                bincode::serialize(&header).map_err(codec)?.as_slice(),
            )
            .map_err(storage)?;
        }
        txn.commit().map_err(storage)
    }

    /// Persist one gzip-compressed log block under the next sub-key.
    fn flush_block(&self, log: &mut LogBuffer, upto: usize) -> Result<(), DbError> {
        let block = match log.next_block {
            Some(block) => block,
            None => self.last_log_block()?.map_or(0, |b| b + 1),
        };

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&log.buf[..upto]).map_err(storage)?;
        let compressed = encoder.finish().map_err(storage)?;

        let txn = self.inner.db.db.begin_write().map_err(storage)?;
        {
            let mut logs = txn.open_table(LOGS).map_err(storage)?;
            logs.insert(
                (self.inner.study.as_str(), self.inner.seq, block),
                compressed.as_slice(),
            )
            .map_err(storage)?;
        }
        txn.commit().map_err(storage)?;

        log.buf.drain(..upto);
        log.next_block = Some(block + 1);
        Ok(())
    }

    fn last_log_block(&self) -> Result<Option<u64>, DbError> {
        let txn = self.inner.db.db.begin_read().map_err(storage)?;
        let logs = txn.open_table(LOGS).map_err(storage)?;
        let study = self.inner.study.as_str();
        let seq = self.inner.seq;
        let last = logs
            .range((study, seq, 0u64)..=(study, seq, u64::MAX))
            .map_err(storage)?
            .next_back()
            .transpose()
            .map_err(storage)?
            .map(|(key, _)| key.value().2);
        Ok(last)
    }

    fn last_metrics_update(&self) -> Result<Option<(u64, Metrics)>, DbError> {
        let txn = self.inner.db.db.begin_read().map_err(storage)?;
        let metrics = txn.open_table(METRICS).map_err(storage)?;
        let study = self.inner.study.as_str();
        let seq = self.inner.seq;
        let last = metrics
            .range((study, seq, 0u64)..=(study, seq, u64::MAX))
            .map_err(storage)?
            .next_back()
            .transpose()
            .map_err(storage)?;
        match last {
            Some((key, value)) => {
                let record: Metrics = bincode::deserialize(value.value()).map_err(codec)?;
                Ok(Some((key.value().2, record)))
            }
            None => Ok(None),
        }
    }
}

impl RunHandle for Run {
    fn id(&self) -> String {
        format!("{}/{}", self.inner.study, self.inner.seq)
    }

    fn seq(&self) -> u64 {
        self.inner.seq
    }

    fn study(&self) -> &str {
        &self.inner.study
    }

    fn values(&self) -> &Values {
        &self.inner.values
    }

    fn state(&self) -> RunState {
        *self.inner.state.lock().unwrap()
    }

    fn write(&self, buf: &[u8]) -> Result<(), DbError> {
        let mut log = self.inner.log.lock().unwrap();
        log.buf.extend_from_slice(buf);
        while log.buf.len() >= LOG_BLOCK {
            self.flush_block(&mut log, LOG_BLOCK)?;
        }
        Ok(())
    }

    fn flush(&self) -> Result<(), DbError> {
        let mut log = self.inner.log.lock().unwrap();
        if !log.buf.is_empty() {
            let upto = log.buf.len();
            self.flush_block(&mut log, upto)?;
        }
        Ok(())
    }

    fn log_reader(&self) -> Box<dyn Read + Send> {
        Box::new(LogReader {
            db: Arc::clone(&self.inner.db),
            study: self.inner.study.clone(),
            seq: self.inner.seq,
            next_block: 0,
            buf: Vec::new(),
            pos: 0,
        })
    }

    fn update(&self, metrics: &Metrics) -> Result<(), DbError> {
        let next = self.last_metrics_update()?.map_or(0, |(seq, _)| seq + 1);
        let txn = self.inner.db.db.begin_write().map_err(storage)?;
        {
            let mut table = txn.open_table(METRICS).map_err(storage)?;
            table
                .insert(
                    (self.inner.study.as_str(), self.inner.seq, next),
                    bincode::serialize(metrics).map_err(codec)?.as_slice(),
                )
                .map_err(storage)?;
        }
        txn.commit().map_err(storage)
    }

    fn metrics(&self) -> Result<Metrics, DbError> {
        Ok(self
            .last_metrics_update()?
            .map(|(_, record)| record)
            .unwrap_or_default())
    }

    fn complete(&self, state: RunState) -> Result<(), DbError> {
        assert!(state.is_terminal(), "complete requires a terminal state");
        let mut current = self.inner.state.lock().unwrap();
        if current.is_terminal() {
            if *current == state {
                return Ok(());
            }
            return Err(DbError::AlreadyComplete {
                id: self.id(),
                state: *current,
            });
        }
        let saved = *current;
        *current = state;
        if let Err(err) = self.marshal(state) {
            *current = saved;
            return Err(err);
        }
        drop(current);
        self.inner
            .db
            .live
            .remove(&(self.inner.study.clone(), self.inner.seq));
        tracing::debug!(run = %self.id(), %state, "run complete");
        Ok(())
    }

    fn set_status(&self, status: &str) {
        *self.inner.status.lock().unwrap() = status.to_string();
    }

    fn status(&self) -> String {
        self.inner.status.lock().unwrap().clone()
    }
}

/// Streams a run's log, inflating blocks in write order.
struct LogReader {
    db: Arc<DbInner>,
    study: String,
    seq: u64,
    next_block: u64,
    buf: Vec<u8>,
    pos: usize,
}

impl Read for LogReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        while self.pos == self.buf.len() {
            match self.load_next_block() {
                Ok(Some(())) => {}
                Ok(None) => return Ok(0),
                Err(err) => return Err(io::Error::other(err.to_string())),
            }
        }
        let n = (self.buf.len() - self.pos).min(out.len());
        out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

impl LogReader {
    fn load_next_block(&mut self) -> Result<Option<()>, DbError> {
        let txn = self.db.db.begin_read().map_err(storage)?;
        let logs = txn.open_table(LOGS).map_err(storage)?;
        let Some(guard) = logs
            .get((self.study.as_str(), self.seq, self.next_block))
            .map_err(storage)?
        else {
            return Ok(None);
        };
        let mut decoder = GzDecoder::new(guard.value());
        let mut inflated = Vec::new();
        decoder.read_to_end(&mut inflated).map_err(storage)?;
        self.buf = inflated;
        self.pos = 0;
        self.next_block += 1;
        Ok(Some(()))
    }
}
