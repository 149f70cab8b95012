use crate::config::{PromptConfig, RunConfig};
use crate::error::CellError;
use crate::invoker::InvokeRequest;
use crate::pool::{DispatchToken, WorkerContext, WorkerPool};
use crate::recorder::SampleRecorder;
use crate::result::CellResult;
use crate::variant::TargetVariant;
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{info, warn};

const PROGRESS_EVERY: u64 = 64;

/// Run one (variant, concurrency) cell: warmup, dispatch for the configured
/// duration, drain every in-flight request, then aggregate.
///
/// The measured elapsed time runs from dispatch start until the last worker
/// exits, so it exceeds `run.duration` by at most the slowest drained
/// request (itself bounded by the request timeout).
pub async fn run_cell(
    variant: &TargetVariant,
    concurrency: usize,
    run: &RunConfig,
    prompt: &PromptConfig,
) -> Result<CellResult, CellError> {
    if concurrency == 0 {
        return Err(CellError::ZeroConcurrency);
    }

    let stream = variant.stream_or(prompt.stream);
    let capacity = run.queue_depth.capacity(concurrency);
    info!(
        "Cell {} @ concurrency {}: stream={} queue_depth={} duration={:?}",
        variant.name, concurrency, stream, capacity, run.duration
    );

    if !run.warmup.is_zero() {
        info!("Warming up for {:?}", run.warmup);
        sleep(run.warmup).await;
    }

    let recorder = Arc::new(SampleRecorder::new());
    let ctx = Arc::new(WorkerContext {
        variant: variant.name.clone(),
        invoker: variant.invoker.clone(),
        request: InvokeRequest {
            system_prompt: prompt.system_message.clone(),
            user_prompt: prompt.user_message.clone(),
            stream,
            timeout: run.request_timeout,
        },
        request_timeout: run.request_timeout,
        recorder: recorder.clone(),
    });

    let progress = run
        .show_progress
        .then(|| spinner(&variant.name, concurrency));

    let (tx, rx) = async_channel::bounded::<DispatchToken>(capacity);
    let pool = WorkerPool::spawn(concurrency, rx, ctx)?;

    let start = Instant::now();
    let deadline = start + run.duration;
    let timer = sleep_until(deadline);
    tokio::pin!(timer);

    // Capacity buffers tokens, it does not pace them: a full channel only
    // delays the next push until a worker frees a slot.
    let mut scheduled = 0u64;
    loop {
        tokio::select! {
            biased;
            _ = &mut timer => break,
            sent = tx.send(DispatchToken { seq: scheduled }) => {
                if sent.is_err() {
                    warn!("Every worker for {} exited before the deadline", variant.name);
                    break;
                }
                scheduled += 1;
                if let Some(pb) = &progress {
                    if scheduled % PROGRESS_EVERY == 0 {
                        let counts = recorder.counts();
                        pb.set_message(format!(
                            "scheduled={} ok={} failed={}",
                            scheduled, counts.success, counts.failed
                        ));
                    }
                }
            }
        }
    }

    tx.close();
    info!(
        "Dispatch window closed after {} requests, draining {} workers",
        scheduled,
        pool.size()
    );
    let joined = pool.join().await;
    let elapsed = start.elapsed();
    if let Some(pb) = &progress {
        pb.finish_and_clear();
    }
    joined?;

    let completed = recorder.completed();
    if completed != scheduled {
        return Err(CellError::Unreconciled {
            scheduled,
            completed,
        });
    }

    let cell = CellResult::aggregate(
        &variant.name,
        concurrency,
        stream,
        scheduled,
        elapsed,
        recorder.finish(),
        &run.percentiles,
    );
    info!(
        "Cell {} @ {} done in {:?}: total={} ok={} failed={} rps={:.2}",
        cell.variant,
        cell.concurrency,
        elapsed,
        cell.total_requests,
        cell.success_requests,
        cell.failed_requests,
        cell.requests_per_sec
    );

    Ok(cell)
}

fn spinner(variant: &str, concurrency: usize) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("{spinner} {prefix} {elapsed} {msg}") {
        pb.set_style(style);
    }
    pb.set_prefix(format!("{variant} @ {concurrency}"));
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueDepth;
    use crate::error::InvokeError;
    use crate::invoker::{Completion, InvokeFuture, Invoker, MockInvoker};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn prompt() -> PromptConfig {
        PromptConfig {
            system_message: String::new(),
            user_message: "benchmark".into(),
            stream: false,
        }
    }

    fn run_config(duration_ms: u64) -> RunConfig {
        RunConfig {
            duration: Duration::from_millis(duration_ms),
            request_timeout: Duration::from_secs(2),
            ..RunConfig::default()
        }
    }

    /// Sleeps for a fixed time and tracks the peak number of concurrent calls.
    struct GaugedInvoker {
        latency: Duration,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl GaugedInvoker {
        fn new(latency: Duration) -> Self {
            Self {
                latency,
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }
    }

    impl Invoker for GaugedInvoker {
        fn name(&self) -> &'static str {
            "gauged"
        }

        fn invoke<'a>(&'a self, _request: &'a InvokeRequest) -> InvokeFuture<'a> {
            Box::pin(async move {
                let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(self.latency).await;
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(Completion {
                    content: "ok".into(),
                    input_tokens: 3,
                    output_tokens: 5,
                    ..Default::default()
                })
            })
        }
    }

    struct FailingInvoker;

    impl Invoker for FailingInvoker {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn invoke<'a>(&'a self, _request: &'a InvokeRequest) -> InvokeFuture<'a> {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Err(InvokeError::Status {
                    status: 503,
                    body: "overloaded".into(),
                })
            })
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_end_to_end_fixed_latency() {
        let invoker = Arc::new(GaugedInvoker::new(Duration::from_millis(50)));
        let variant = TargetVariant::new("stub", invoker);
        let run = RunConfig {
            queue_depth: QueueDepth::Fixed(1),
            ..run_config(1000)
        };

        let cell = run_cell(&variant, 10, &run, &prompt()).await.unwrap();

        assert_eq!(cell.failed_requests, 0);
        assert!(
            (180..=220).contains(&cell.total_requests),
            "total_requests: {}",
            cell.total_requests
        );
        assert_eq!(cell.success_requests + cell.failed_requests, cell.total_requests);
        assert!(cell.elapsed >= Duration::from_secs(1));
        let expected_rps = cell.success_requests as f64 / cell.elapsed.as_secs_f64();
        assert!((cell.requests_per_sec - expected_rps).abs() < 1e-9);
        assert_eq!(cell.all_latencies.len() as u64, cell.total_requests);
        assert!(cell.latency_percentiles[&50] >= Duration::from_millis(50));
        assert!(cell.latency_percentiles[&50] <= cell.latency_percentiles[&90]);
        assert!(cell.latency_percentiles[&90] <= cell.latency_percentiles[&95]);
        assert!(cell.latency_percentiles[&95] <= cell.latency_percentiles[&99]);
        assert_eq!(cell.avg_input_tokens, 3.0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_in_flight_never_exceeds_concurrency() {
        let invoker = Arc::new(GaugedInvoker::new(Duration::from_millis(10)));
        let variant = TargetVariant::new("gauged", invoker.clone());

        let cell = run_cell(&variant, 20, &run_config(300), &prompt())
            .await
            .unwrap();

        let peak = invoker.peak.load(Ordering::SeqCst);
        assert!(peak <= 20, "peak in-flight: {}", peak);
        assert!(peak > 0);
        assert_eq!(invoker.in_flight.load(Ordering::SeqCst), 0);
        assert_eq!(cell.total_requests, cell.success_requests);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_zero_success_cell_has_no_rates() {
        let variant = TargetVariant::new("down", Arc::new(FailingInvoker));

        let cell = run_cell(&variant, 3, &run_config(100), &prompt())
            .await
            .unwrap();

        assert!(cell.total_requests > 0);
        assert_eq!(cell.success_requests, 0);
        assert_eq!(cell.failed_requests, cell.total_requests);
        assert_eq!(cell.requests_per_sec, 0.0);
        assert_eq!(cell.tokens_per_sec, 0.0);
        assert!(cell.latency_percentiles.is_empty());
        assert_eq!(cell.errors.len() as u64, cell.failed_requests);
        assert!(cell.errors[0].contains("503"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_streaming_variant_override() {
        let variant = TargetVariant::new(
            "sim",
            Arc::new(MockInvoker::new(Duration::from_millis(20))),
        )
        .with_stream(true);

        let cell = run_cell(&variant, 2, &run_config(100), &prompt())
            .await
            .unwrap();

        assert!(cell.stream);
        assert!(cell.success_requests > 0);
        assert!(cell.avg_time_to_first_token.is_some());
        assert!(cell.avg_stream_tokens_per_sec.is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_warmup_is_not_measured() {
        let variant = TargetVariant::new(
            "sim",
            Arc::new(MockInvoker::new(Duration::from_millis(5))),
        );
        let run = RunConfig {
            warmup: Duration::from_millis(200),
            ..run_config(100)
        };

        let started = std::time::Instant::now();
        let cell = run_cell(&variant, 1, &run, &prompt()).await.unwrap();

        assert!(started.elapsed() >= Duration::from_millis(300));
        assert!(cell.elapsed < Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_zero_concurrency_is_cell_fatal() {
        let variant = TargetVariant::new(
            "sim",
            Arc::new(MockInvoker::new(Duration::from_millis(1))),
        );
        let err = run_cell(&variant, 0, &run_config(10), &prompt())
            .await
            .unwrap_err();
        assert!(matches!(err, CellError::ZeroConcurrency));
    }
}
