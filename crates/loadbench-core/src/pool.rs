use crate::error::{CellError, InvokeError};
use crate::invoker::{InvokeRequest, Invoker};
use crate::recorder::{SampleRecorder, WorkOutcome};
use async_channel::Receiver;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::timeout;
use tracing::{debug, warn};

/// One unit of scheduled work; each token is consumed by exactly one worker.
#[derive(Debug, Clone, Copy)]
pub struct DispatchToken {
    pub seq: u64,
}

/// Shared, read-only inputs for every worker of a cell.
pub struct WorkerContext {
    pub variant: String,
    pub invoker: Arc<dyn Invoker>,
    pub request: InvokeRequest,
    pub request_timeout: Duration,
    pub recorder: Arc<SampleRecorder>,
}

/// Fixed set of long-lived workers draining a dispatch channel.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn exactly `concurrency` workers. At most `concurrency` invocations
    /// are in flight at any instant.
    pub fn spawn(
        concurrency: usize,
        tokens: Receiver<DispatchToken>,
        ctx: Arc<WorkerContext>,
    ) -> Result<Self, CellError> {
        if concurrency == 0 {
            return Err(CellError::ZeroConcurrency);
        }

        let in_flight = Arc::new(Semaphore::new(concurrency));
        let handles = (0..concurrency)
            .map(|id| {
                tokio::spawn(worker_loop(
                    id,
                    tokens.clone(),
                    in_flight.clone(),
                    ctx.clone(),
                ))
            })
            .collect();

        Ok(Self { handles })
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Wait for every worker to exit. Workers exit once the dispatch channel
    /// is closed and drained. A panicking worker aborts the rest and fails
    /// the cell.
    pub async fn join(self) -> Result<(), CellError> {
        let mut handles = self.handles.into_iter();
        let mut failure = None;
        for handle in handles.by_ref() {
            if let Err(e) = handle.await {
                failure = Some(join_failure(e));
                break;
            }
        }

        match failure {
            Some(err) => {
                for rest in handles {
                    rest.abort();
                    let _ = rest.await;
                }
                Err(err)
            }
            None => Ok(()),
        }
    }
}

fn join_failure(err: JoinError) -> CellError {
    if !err.is_panic() {
        return CellError::WorkerCancelled;
    }
    let payload = err.into_panic();
    let msg = if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    };
    CellError::WorkerPanicked(msg)
}

async fn worker_loop(
    id: usize,
    tokens: Receiver<DispatchToken>,
    in_flight: Arc<Semaphore>,
    ctx: Arc<WorkerContext>,
) {
    let mut handled = 0u64;

    while let Ok(_token) = tokens.recv().await {
        // Never closed while the pool is alive.
        let Ok(_permit) = in_flight.acquire().await else {
            break;
        };

        let start = Instant::now();
        let result = match timeout(ctx.request_timeout, ctx.invoker.invoke(&ctx.request)).await {
            Ok(result) => result,
            Err(_) => Err(InvokeError::DeadlineExceeded(ctx.request_timeout)),
        };
        let latency = start.elapsed();

        if let Err(e) = &result {
            warn!("Request to {} failed: {}", ctx.variant, e);
        }
        ctx.recorder.record(WorkOutcome::new(latency, result));
        handled += 1;
    }

    debug!("Worker {} for {} exiting after {} requests", id, ctx.variant, handled);
}
