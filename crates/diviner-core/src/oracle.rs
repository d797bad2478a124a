//! Oracles — strategies that propose new trial points from history.

use std::collections::HashSet;

use async_trait::async_trait;
use thiserror::Error;

use crate::params::Params;
use crate::run::Trial;
use crate::study::Objective;
use crate::value::Values;

#[derive(Debug, Error)]
#[error("oracle: {message}")]
pub struct OracleError {
    pub message: String,
}

impl OracleError {
    pub fn new(message: impl Into<String>) -> Self {
        OracleError {
            message: message.into(),
        }
    }
}

/// Proposes up to `n` new points given the history of successful trials.
///
/// Returning an empty vector signals exhaustion for the current history:
/// the oracle has nothing further to propose until history grows.
/// Implementations may hold private state across calls within one runner
/// invocation; grid search is stateless.
#[async_trait]
pub trait Oracle: Send + Sync {
    async fn next(
        &self,
        history: &[Trial],
        params: &Params,
        objective: &Objective,
        n: usize,
    ) -> Result<Vec<Values>, OracleError>;
}

/// Exhaustive enumeration of the Cartesian product of parameter domains.
///
/// Points come out in a deterministic order: parameter names sorted
/// lexicographically, each domain enumerated in declaration order, the last
/// parameter varying fastest. Points already present in history are skipped.
#[derive(Debug, Default, Clone, Copy)]
pub struct GridSearch;

#[async_trait]
impl Oracle for GridSearch {
    async fn next(
        &self,
        history: &[Trial],
        params: &Params,
        _objective: &Objective,
        n: usize,
    ) -> Result<Vec<Values>, OracleError> {
        if n == 0 || params.is_empty() {
            return Ok(Vec::new());
        }
        let seen: HashSet<String> = history.iter().map(|t| t.values.to_string()).collect();

        let names: Vec<&String> = params.keys().collect();
        let domains: Vec<_> = params.values().map(|p| p.values()).collect();

        let mut proposals = Vec::new();
        let mut odometer = vec![0usize; names.len()];
        'points: loop {
            let point: Values = names
                .iter()
                .enumerate()
                .map(|(pos, name)| ((*name).clone(), domains[pos][odometer[pos]].clone()))
                .collect();
            if !seen.contains(&point.to_string()) {
                proposals.push(point);
                if proposals.len() == n {
                    break;
                }
            }
            // Advance the odometer, last parameter fastest.
            for pos in (0..odometer.len()).rev() {
                odometer[pos] += 1;
                if odometer[pos] < domains[pos].len() {
                    continue 'points;
                }
                odometer[pos] = 0;
            }
            break;
        }
        Ok(proposals)
    }
}
