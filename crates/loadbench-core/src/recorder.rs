use crate::error::InvokeError;
use crate::invoker::Completion;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Result of one invocation as seen by a worker.
#[derive(Debug, Clone)]
pub struct WorkOutcome {
    pub success: bool,
    pub latency: Duration,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub error: Option<String>,
    pub time_to_first_token: Option<Duration>,
    pub tokens_per_sec: Option<f64>,
}

impl WorkOutcome {
    pub fn new(latency: Duration, result: Result<Completion, InvokeError>) -> Self {
        match result {
            Ok(c) => Self {
                success: true,
                latency,
                input_tokens: c.input_tokens,
                output_tokens: c.output_tokens,
                error: None,
                time_to_first_token: c.time_to_first_token,
                tokens_per_sec: c.tokens_per_sec,
            },
            Err(e) => Self {
                success: false,
                latency,
                input_tokens: 0,
                output_tokens: 0,
                error: Some(e.to_string()),
                time_to_first_token: None,
                tokens_per_sec: None,
            },
        }
    }
}

#[derive(Debug, Default)]
struct SampleLists {
    all_latencies: Vec<Duration>,
    errors: Vec<String>,
    first_token: Vec<Duration>,
    token_rates: Vec<f64>,
}

/// Concurrent sink for one cell's outcomes.
///
/// Scalar totals are lock-free atomics; the ordered sample lists share a
/// single mutex so one outcome is appended atomically.
#[derive(Debug, Default)]
pub struct SampleRecorder {
    success: AtomicU64,
    failed: AtomicU64,
    success_latency_nanos: AtomicU64,
    input_tokens: AtomicU64,
    output_tokens: AtomicU64,
    lists: Mutex<SampleLists>,
}

/// Point-in-time counters, used for progress display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecorderCounts {
    pub success: u64,
    pub failed: u64,
}

/// Everything a finished cell recorded.
#[derive(Debug, Clone, Default)]
pub struct RecordedSamples {
    pub success: u64,
    pub failed: u64,
    pub success_latency_total: Duration,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub all_latencies: Vec<Duration>,
    pub errors: Vec<String>,
    pub first_token: Vec<Duration>,
    pub token_rates: Vec<f64>,
}

impl SampleRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, outcome: WorkOutcome) {
        {
            let mut lists = self.lists.lock().unwrap_or_else(PoisonError::into_inner);
            lists.all_latencies.push(outcome.latency);
            if outcome.success {
                if let Some(ttft) = outcome.time_to_first_token {
                    lists.first_token.push(ttft);
                }
                if let Some(rate) = outcome.tokens_per_sec {
                    lists.token_rates.push(rate);
                }
            } else if let Some(err) = outcome.error {
                lists.errors.push(err);
            }
        }

        if outcome.success {
            let nanos = u64::try_from(outcome.latency.as_nanos()).unwrap_or(u64::MAX);
            self.success_latency_nanos.fetch_add(nanos, Ordering::Relaxed);
            self.input_tokens
                .fetch_add(outcome.input_tokens, Ordering::Relaxed);
            self.output_tokens
                .fetch_add(outcome.output_tokens, Ordering::Relaxed);
            self.success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn counts(&self) -> RecorderCounts {
        RecorderCounts {
            success: self.success.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    /// Number of outcomes recorded so far, successful or not.
    pub fn completed(&self) -> u64 {
        let counts = self.counts();
        counts.success + counts.failed
    }

    /// Take the recorded data. Call only once every worker has exited.
    pub fn finish(&self) -> RecordedSamples {
        let lists = std::mem::take(&mut *self.lists.lock().unwrap_or_else(PoisonError::into_inner));
        RecordedSamples {
            success: self.success.load(Ordering::Acquire),
            failed: self.failed.load(Ordering::Acquire),
            success_latency_total: Duration::from_nanos(
                self.success_latency_nanos.load(Ordering::Acquire),
            ),
            input_tokens: self.input_tokens.load(Ordering::Acquire),
            output_tokens: self.output_tokens.load(Ordering::Acquire),
            all_latencies: lists.all_latencies,
            errors: lists.errors,
            first_token: lists.first_token,
            token_rates: lists.token_rates,
        }
    }
}
