use crate::error::InvokeError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::time::sleep;

pub type InvokeFuture<'a> = Pin<Box<dyn Future<Output = Result<Completion, InvokeError>> + Send + 'a>>;

/// One request to a target under test.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvokeRequest {
    pub system_prompt: String,
    pub user_prompt: String,
    pub stream: bool,
    /// Per-request deadline. The engine enforces it by dropping the future;
    /// implementations may also pass it to their transport.
    pub timeout: Duration,
}

/// A completed response. Streaming fields are only set for streamed calls.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Completion {
    pub content: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub time_to_first_token: Option<Duration>,
    pub tokens_per_sec: Option<f64>,
}

/// Capability to send a request to one target and wait for the full response.
pub trait Invoker: Send + Sync {
    fn name(&self) -> &'static str;

    fn invoke<'a>(&'a self, request: &'a InvokeRequest) -> InvokeFuture<'a>;
}

/// Rough token estimate used where no tokenizer is available.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.split_whitespace().count() + text.len() / 4) as u64
}

/// In-process simulated target.
///
/// Latency grows with the prompt size (`base + input_tokens / 8` ms) plus an
/// optional uniform jitter, and a configurable share of calls fail.
pub struct MockInvoker {
    latency: Duration,
    jitter: Duration,
    failure_rate: f64,
}

const MOCK_REPLY: &str = "This is a simulated completion from the mock target.";

impl MockInvoker {
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            jitter: Duration::ZERO,
            failure_rate: 0.0,
        }
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_failure_rate(mut self, failure_rate: f64) -> Self {
        self.failure_rate = failure_rate.clamp(0.0, 1.0);
        self
    }

    fn sample_latency(&self, input_tokens: u64) -> (Duration, bool) {
        let mut rng = rand::thread_rng();
        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms > 0 {
            Duration::from_millis(rng.gen_range(0..=jitter_ms))
        } else {
            Duration::ZERO
        };
        let fail = self.failure_rate > 0.0 && rng.gen_bool(self.failure_rate);
        (
            self.latency + Duration::from_millis(input_tokens / 8) + jitter,
            fail,
        )
    }
}

impl Invoker for MockInvoker {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn invoke<'a>(&'a self, request: &'a InvokeRequest) -> InvokeFuture<'a> {
        Box::pin(async move {
            let prompt = format!("{}{}", request.system_prompt, request.user_prompt);
            let input_tokens = estimate_tokens(&prompt);
            let (latency, fail) = self.sample_latency(input_tokens);

            if !request.stream {
                sleep(latency).await;
                if fail {
                    return Err(InvokeError::Simulated("mock target rejected the request".into()));
                }
                return Ok(Completion {
                    content: MOCK_REPLY.to_string(),
                    input_tokens,
                    output_tokens: estimate_tokens(MOCK_REPLY),
                    ..Default::default()
                });
            }

            let ttft = latency / 4;
            sleep(ttft).await;
            if fail {
                return Err(InvokeError::Stream("mock stream closed unexpectedly".into()));
            }
            let streaming = latency - ttft;
            sleep(streaming).await;

            let output_tokens = estimate_tokens(MOCK_REPLY);
            let secs = streaming.as_secs_f64();
            Ok(Completion {
                content: MOCK_REPLY.to_string(),
                input_tokens,
                output_tokens,
                time_to_first_token: Some(ttft),
                tokens_per_sec: (secs > 0.0).then(|| output_tokens as f64 / secs),
            })
        })
    }
}
