//! Metric scraping from live log streams.
//!
//! A metrics line, after leading whitespace, begins with the literal prefix
//! `METRICS:` followed by comma-separated `name=value` pairs:
//!
//! ```text
//! METRICS: train_loss=0.31,acc=0.92
//! ```
//!
//! Names match `[A-Za-z_][A-Za-z0-9_]*`; values parse as finite decimal
//! floats. A line with any malformed pair is discarded whole (counted,
//! non-fatal). All other lines pass through untouched.

use crate::run::Metrics;

const PREFIX: &str = "METRICS:";

/// Incremental scraper over a byte stream. Feed chunks with
/// [`push`](MetricsScraper::push); call [`finish`](MetricsScraper::finish)
/// at EOF to flush a final unterminated line.
#[derive(Debug, Default)]
pub struct MetricsScraper {
    partial: Vec<u8>,
    discarded: u64,
}

impl MetricsScraper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume a chunk of log output, returning one metrics record per
    /// well-formed metrics line completed by this chunk.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Metrics> {
        let mut records = Vec::new();
        for &byte in chunk {
            if byte == b'\n' {
                if let Some(metrics) = self.take_line() {
                    records.push(metrics);
                }
            } else {
                self.partial.push(byte);
            }
        }
        records
    }

    /// Flush the final partial line, if any.
    pub fn finish(&mut self) -> Option<Metrics> {
        if self.partial.is_empty() {
            return None;
        }
        self.take_line()
    }

    /// Metrics lines dropped because of a malformed pair.
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    fn take_line(&mut self) -> Option<Metrics> {
        let line = std::mem::take(&mut self.partial);
        match scrape_line(&String::from_utf8_lossy(&line)) {
            Scraped::Record(metrics) => Some(metrics),
            Scraped::Malformed => {
                self.discarded += 1;
                tracing::debug!(line = %String::from_utf8_lossy(&line), "malformed metrics line discarded");
                None
            }
            Scraped::Passthrough => None,
        }
    }
}

enum Scraped {
    /// Not a metrics line at all; passes through unchanged.
    Passthrough,
    /// Carried the prefix but a pair failed to parse; drop the line.
    Malformed,
    Record(Metrics),
}

fn scrape_line(line: &str) -> Scraped {
    let stripped = line.trim_start_matches([' ', '\t']);
    let Some(rest) = stripped.strip_prefix(PREFIX) else {
        return Scraped::Passthrough;
    };
    let rest = rest.trim_matches([' ', '\t']);
    if rest.is_empty() {
        return Scraped::Malformed;
    }
    let mut metrics = Metrics::new();
    for pair in rest.split(',') {
        let Some((name, value)) = pair.split_once('=') else {
            return Scraped::Malformed;
        };
        if !valid_name(name) {
            return Scraped::Malformed;
        }
        match value.parse::<f64>() {
            Ok(v) if v.is_finite() => {
                metrics.insert(name.to_string(), v);
            }
            _ => return Scraped::Malformed,
        }
    }
    Scraped::Record(metrics)
}

fn valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(pairs: &[(&str, f64)]) -> Metrics {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn scrapes_basic_line() {
        let mut s = MetricsScraper::new();
        let got = s.push(b"METRICS: acc=0.9,loss=0.1\n");
        assert_eq!(got, vec![metrics(&[("acc", 0.9), ("loss", 0.1)])]);
    }

    #[test]
    fn leading_whitespace_allowed() {
        let mut s = MetricsScraper::new();
        let got = s.push(b" \tMETRICS:acc=1\n");
        assert_eq!(got, vec![metrics(&[("acc", 1.0)])]);
    }

    #[test]
    fn non_metric_lines_pass_through() {
        let mut s = MetricsScraper::new();
        assert!(s.push(b"epoch 3 of 10\nsaving checkpoint\n").is_empty());
        assert_eq!(s.discarded(), 0);
    }

    #[test]
    fn malformed_pair_discards_whole_line() {
        let mut s = MetricsScraper::new();
        assert!(s.push(b"METRICS: acc=0.9,bogus\n").is_empty());
        assert!(s.push(b"METRICS: 9lives=1\n").is_empty());
        assert!(s.push(b"METRICS: acc=NaN\n").is_empty());
        assert!(s.push(b"METRICS:\n").is_empty());
        assert_eq!(s.discarded(), 4);
    }

    #[test]
    fn line_split_across_chunks() {
        let mut s = MetricsScraper::new();
        assert!(s.push(b"METRICS: ac").is_empty());
        let got = s.push(b"c=0.5\nnext line");
        assert_eq!(got, vec![metrics(&[("acc", 0.5)])]);
    }

    #[test]
    fn finish_flushes_final_partial_line() {
        let mut s = MetricsScraper::new();
        assert!(s.push(b"METRICS: last=2").is_empty());
        assert_eq!(s.finish(), Some(metrics(&[("last", 2.0)])));
        assert_eq!(s.finish(), None);
    }

    #[test]
    fn underscore_names_and_negative_values() {
        let mut s = MetricsScraper::new();
        let got = s.push(b"METRICS: _grad_norm=-1.5e-3\n");
        assert_eq!(got, vec![metrics(&[("_grad_norm", -1.5e-3)])]);
    }
}
