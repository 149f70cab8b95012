use crate::percentile::percentiles;
use crate::recorder::RecordedSamples;
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::time::Duration;

/// Aggregate for one (variant, concurrency level) cell.
///
/// Rates and averages are zero, and percentiles empty, unless
/// `success_requests > 0`. Percentiles then cover every observed latency,
/// failures included.
#[derive(Debug, Clone, Serialize)]
pub struct CellResult {
    pub variant: String,
    pub concurrency: usize,
    pub stream: bool,
    pub total_requests: u64,
    pub success_requests: u64,
    pub failed_requests: u64,
    #[serde(rename = "elapsed_ms", serialize_with = "millis")]
    pub elapsed: Duration,
    #[serde(rename = "avg_latency_ms", serialize_with = "millis")]
    pub avg_latency: Duration,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub avg_input_tokens: f64,
    pub avg_output_tokens: f64,
    pub avg_total_tokens: f64,
    pub requests_per_sec: f64,
    pub tokens_per_sec: f64,
    #[serde(rename = "avg_time_to_first_token_ms", serialize_with = "opt_millis")]
    pub avg_time_to_first_token: Option<Duration>,
    pub avg_stream_tokens_per_sec: Option<f64>,
    #[serde(rename = "latency_percentiles_ms", serialize_with = "map_millis")]
    pub latency_percentiles: BTreeMap<u8, Duration>,
    #[serde(rename = "all_latencies_ms", serialize_with = "seq_millis")]
    pub all_latencies: Vec<Duration>,
    pub errors: Vec<String>,
}

impl CellResult {
    pub fn aggregate(
        variant: &str,
        concurrency: usize,
        stream: bool,
        total_requests: u64,
        elapsed: Duration,
        samples: RecordedSamples,
        requested_percentiles: &[u8],
    ) -> Self {
        let mut result = CellResult {
            variant: variant.to_string(),
            concurrency,
            stream,
            total_requests,
            success_requests: samples.success,
            failed_requests: samples.failed,
            elapsed,
            avg_latency: Duration::ZERO,
            input_tokens: 0,
            output_tokens: 0,
            total_tokens: 0,
            avg_input_tokens: 0.0,
            avg_output_tokens: 0.0,
            avg_total_tokens: 0.0,
            requests_per_sec: 0.0,
            tokens_per_sec: 0.0,
            avg_time_to_first_token: None,
            avg_stream_tokens_per_sec: None,
            latency_percentiles: BTreeMap::new(),
            all_latencies: samples.all_latencies,
            errors: samples.errors,
        };

        if samples.success == 0 {
            return result;
        }

        let n = samples.success;
        let secs = elapsed.as_secs_f64();
        let total_tokens = samples.input_tokens + samples.output_tokens;

        result.avg_latency = mean(samples.success_latency_total, n);
        result.input_tokens = samples.input_tokens;
        result.output_tokens = samples.output_tokens;
        result.total_tokens = total_tokens;
        result.avg_input_tokens = samples.input_tokens as f64 / n as f64;
        result.avg_output_tokens = samples.output_tokens as f64 / n as f64;
        result.avg_total_tokens = total_tokens as f64 / n as f64;
        if secs > 0.0 {
            result.requests_per_sec = n as f64 / secs;
            result.tokens_per_sec = total_tokens as f64 / secs;
        }
        if !samples.first_token.is_empty() {
            let sum: Duration = samples.first_token.iter().sum();
            result.avg_time_to_first_token = Some(mean(sum, samples.first_token.len() as u64));
        }
        if !samples.token_rates.is_empty() {
            let sum: f64 = samples.token_rates.iter().sum();
            result.avg_stream_tokens_per_sec = Some(sum / samples.token_rates.len() as f64);
        }
        result.latency_percentiles = percentiles(&result.all_latencies, requested_percentiles);

        result
    }

    pub fn key(&self) -> CellKey {
        CellKey {
            variant: self.variant.clone(),
            concurrency: self.concurrency,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct CellKey {
    pub variant: String,
    pub concurrency: usize,
}

/// Results of a matrix run, keyed by (variant, concurrency) in run order.
/// Inserting an existing key replaces that cell in place.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct ResultSet {
    cells: Vec<CellResult>,
}

impl ResultSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a cell, returning the one it replaced, if any.
    pub fn insert(&mut self, cell: CellResult) -> Option<CellResult> {
        match self
            .cells
            .iter_mut()
            .find(|c| c.variant == cell.variant && c.concurrency == cell.concurrency)
        {
            Some(existing) => Some(std::mem::replace(existing, cell)),
            None => {
                self.cells.push(cell);
                None
            }
        }
    }

    pub fn get(&self, variant: &str, concurrency: usize) -> Option<&CellResult> {
        self.cells
            .iter()
            .find(|c| c.variant == variant && c.concurrency == concurrency)
    }

    pub fn keys(&self) -> impl Iterator<Item = CellKey> + '_ {
        self.cells.iter().map(CellResult::key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CellResult> {
        self.cells.iter()
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

fn mean(total: Duration, count: u64) -> Duration {
    if count == 0 {
        return Duration::ZERO;
    }
    let nanos = total.as_nanos() / u128::from(count);
    Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
}

fn as_ms(d: &Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

fn millis<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(as_ms(d))
}

fn opt_millis<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
    match d {
        Some(d) => s.serialize_some(&as_ms(d)),
        None => s.serialize_none(),
    }
}

fn seq_millis<S: Serializer>(d: &[Duration], s: S) -> Result<S::Ok, S::Error> {
    s.collect_seq(d.iter().map(as_ms))
}

fn map_millis<S: Serializer>(m: &BTreeMap<u8, Duration>, s: S) -> Result<S::Ok, S::Error> {
    s.collect_map(m.iter().map(|(p, d)| (format!("p{p}"), as_ms(d))))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn samples(success_ms: &[u64], failed: u64) -> RecordedSamples {
        mixed(success_ms, &vec![1; failed as usize])
    }

    /// Successes first, then failures, each with its own latency.
    fn mixed(success_ms: &[u64], failed_ms: &[u64]) -> RecordedSamples {
        let ms = |v: &u64| Duration::from_millis(*v);
        RecordedSamples {
            success: success_ms.len() as u64,
            failed: failed_ms.len() as u64,
            success_latency_total: success_ms.iter().map(ms).sum(),
            input_tokens: 10 * success_ms.len() as u64,
            output_tokens: 20 * success_ms.len() as u64,
            all_latencies: success_ms.iter().chain(failed_ms).map(ms).collect(),
            errors: (0..failed_ms.len()).map(|i| format!("err {i}")).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_aggregate_rates() {
        let cell = CellResult::aggregate(
            "m",
            4,
            false,
            6,
            Duration::from_secs(2),
            samples(&[10, 20, 30, 40, 50], 1),
            &[50, 99],
        );

        assert_eq!(cell.success_requests + cell.failed_requests, cell.total_requests);
        assert_eq!(cell.avg_latency, Duration::from_millis(30));
        assert!((cell.requests_per_sec - 2.5).abs() < 1e-9);
        assert!((cell.tokens_per_sec - 75.0).abs() < 1e-9);
        assert_eq!(cell.avg_total_tokens, 30.0);
        // [1, 10, 20, 30, 40, 50]: the failed request's 1ms sample counts too.
        assert_eq!(cell.latency_percentiles[&50], Duration::from_millis(20));
        assert_eq!(cell.latency_percentiles[&99], Duration::from_millis(40));
        assert!(cell.avg_time_to_first_token.is_none());
    }

    #[test]
    fn test_percentiles_include_failed_requests() {
        let cell = CellResult::aggregate(
            "m",
            5,
            false,
            5,
            Duration::from_secs(30),
            mixed(&[10, 10], &[30_000, 30_000, 30_000]),
            &[50, 99],
        );

        assert_eq!(cell.avg_latency, Duration::from_millis(10));
        assert_eq!(cell.latency_percentiles[&50], Duration::from_secs(30));
        assert_eq!(cell.latency_percentiles[&99], Duration::from_secs(30));
    }

    #[test]
    fn test_mean_handles_large_counts() {
        let total = Duration::from_secs(1 << 33);
        assert_eq!(mean(total, 1 << 32), Duration::from_secs(2));
        assert_eq!(mean(total, 0), Duration::ZERO);
    }

    #[test]
    fn test_aggregate_zero_success() {
        let cell = CellResult::aggregate(
            "m",
            2,
            true,
            3,
            Duration::from_secs(1),
            samples(&[], 3),
            &[50, 90],
        );

        assert_eq!(cell.success_requests, 0);
        assert_eq!(cell.failed_requests, 3);
        assert_eq!(cell.requests_per_sec, 0.0);
        assert_eq!(cell.tokens_per_sec, 0.0);
        assert_eq!(cell.avg_latency, Duration::ZERO);
        assert!(cell.latency_percentiles.is_empty());
        assert_eq!(cell.errors.len(), 3);
    }

    #[test]
    fn test_result_set_overwrites_same_key() {
        let mut set = ResultSet::new();
        let first = CellResult::aggregate("a", 5, false, 1, Duration::from_secs(1), samples(&[10], 0), &[]);
        let other = CellResult::aggregate("a", 10, false, 1, Duration::from_secs(1), samples(&[10], 0), &[]);
        let again = CellResult::aggregate("a", 5, false, 2, Duration::from_secs(1), samples(&[10, 20], 0), &[]);

        assert!(set.insert(first).is_none());
        assert!(set.insert(other).is_none());
        let replaced = set.insert(again).unwrap();

        assert_eq!(replaced.total_requests, 1);
        assert_eq!(set.len(), 2);
        assert_eq!(set.get("a", 5).unwrap().total_requests, 2);
        let keys: Vec<_> = set.keys().map(|k| k.concurrency).collect();
        assert_eq!(keys, vec![5, 10]);
    }

    #[test]
    fn test_serializes_durations_as_millis() {
        let cell = CellResult::aggregate(
            "m",
            1,
            false,
            2,
            Duration::from_secs(1),
            samples(&[10, 20], 0),
            &[50],
        );
        let json = serde_json::to_value(&cell).unwrap();
        assert_eq!(json["elapsed_ms"], 1000.0);
        assert_eq!(json["latency_percentiles_ms"]["p50"], 10.0);
        assert_eq!(json["all_latencies_ms"][1], 20.0);
        assert!(json["avg_time_to_first_token_ms"].is_null());
    }
}
