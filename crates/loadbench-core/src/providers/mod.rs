//! HTTP-backed invokers for hosted completion APIs.
pub mod anthropic;
pub mod openai;

pub use anthropic::AnthropicInvoker;
pub use openai::OpenAiInvoker;

use crate::error::{InvokeError, TargetError};
use reqwest::Client;
use std::time::{Duration, Instant};
use tracing::warn;

/// Connection settings shared by the HTTP invokers.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub variant: String,
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub proxy_url: Option<String>,
    /// Connection pool size per host, usually the largest concurrency level
    pub pool_size: usize,
}

impl EndpointConfig {
    pub(crate) fn url(&self, path: &str) -> Result<String, TargetError> {
        let base = url::Url::parse(&self.base_url).map_err(|_| TargetError::BaseUrl {
            variant: self.variant.clone(),
            url: self.base_url.clone(),
        })?;
        Ok(format!("{}/{}", base.as_str().trim_end_matches('/'), path))
    }
}

/// Build the HTTP client for one variant, routed through its proxy when one
/// is configured. An unusable proxy falls back to a direct connection.
pub(crate) fn build_client(config: &EndpointConfig) -> Result<Client, TargetError> {
    let mut builder = Client::builder()
        .tcp_keepalive(Duration::from_secs(30))
        .pool_idle_timeout(Duration::from_secs(30))
        .pool_max_idle_per_host(config.pool_size.max(1));

    if let Some(proxy_url) = &config.proxy_url {
        match reqwest::Proxy::all(proxy_url) {
            Ok(proxy) => builder = builder.proxy(proxy),
            Err(e) => warn!(
                "Ignoring proxy {} for {}: {}, using direct connection",
                proxy_url, config.variant, e
            ),
        }
    }

    builder.build().map_err(|e| TargetError::Client {
        variant: config.variant.clone(),
        reason: e.to_string(),
    })
}

/// Turn a non-success HTTP response into an [`InvokeError::Status`].
pub(crate) async fn status_error(response: reqwest::Response) -> InvokeError {
    let status = response.status().as_u16();
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<unreadable body>".to_string());
    InvokeError::Status { status, body }
}

/// Tracks first-token time and emission rate over a streamed response.
#[derive(Debug)]
pub(crate) struct StreamClock {
    started: Instant,
    first_token: Option<Instant>,
}

impl StreamClock {
    pub(crate) fn start() -> Self {
        Self {
            started: Instant::now(),
            first_token: None,
        }
    }

    pub(crate) fn mark_token(&mut self) {
        if self.first_token.is_none() {
            self.first_token = Some(Instant::now());
        }
    }

    pub(crate) fn time_to_first_token(&self) -> Option<Duration> {
        self.first_token.map(|t| t.duration_since(self.started))
    }

    pub(crate) fn tokens_per_sec(&self, tokens: u64) -> Option<f64> {
        let first = self.first_token?;
        let secs = first.elapsed().as_secs_f64();
        (tokens > 0 && secs > 0.0).then(|| tokens as f64 / secs)
    }
}
