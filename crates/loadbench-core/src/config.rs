use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub test: TestConfig,
    pub prompt: PromptConfig,
    pub models: Vec<ModelConfig>,
    #[serde(default)]
    pub proxies: Vec<ProxyConfig>,
}

impl Config {
    /// Load and validate a configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let config = Self::from_file_unvalidated(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file with defaults applied but without validation,
    /// so callers can layer overrides on top before calling [`Config::validate`].
    pub fn from_file_unvalidated(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.test.validate()?;

        if self.models.is_empty() {
            bail!("at least one [[models]] entry is required");
        }
        if self.prompt.user_message.trim().is_empty() {
            bail!("prompt.user_message must not be empty");
        }

        let mut seen = BTreeSet::new();
        for (idx, model) in self.models.iter().enumerate() {
            if model.name.is_empty() {
                bail!("model #{} has no name", idx + 1);
            }
            model
                .validate()
                .with_context(|| format!("invalid model '{}'", model.name))?;
            if !seen.insert(model.name.as_str()) {
                bail!("duplicate model name '{}'", model.name);
            }
        }

        for proxy in &self.proxies {
            if proxy.name.is_empty() {
                bail!("proxy entries require a name");
            }
        }

        Ok(())
    }

    /// Models that take part in the run, in configured order.
    pub fn active_models(&self) -> impl Iterator<Item = &ModelConfig> {
        self.models.iter().filter(|m| !m.skip)
    }

    pub fn proxy_url(&self, name: &str) -> Option<&str> {
        self.proxies
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.url.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestConfig {
    /// Concurrency used when neither the model nor `concurrency_levels` set one
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Global list of concurrency levels, overrides `concurrency` when non-empty
    #[serde(default)]
    pub concurrency_levels: Vec<usize>,
    /// Measured dispatch window per cell in milliseconds
    #[serde(default = "default_duration_ms")]
    pub duration_ms: u64,
    /// Idle period before each cell's measurement starts
    #[serde(default)]
    pub warmup_ms: u64,
    /// Deadline applied to every single request
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Dispatch channel capacity; 0 means twice the concurrency level
    #[serde(default)]
    pub queue_depth: usize,
    #[serde(default)]
    pub show_progress: bool,
    /// Parsed for compatibility; requests are never retried
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_percentiles")]
    pub latency_percentiles: Vec<u8>,
}

fn default_concurrency() -> usize {
    1
}

fn default_duration_ms() -> u64 {
    30_000
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_percentiles() -> Vec<u8> {
    vec![50, 90, 95, 99]
}

impl TestConfig {
    fn validate(&self) -> anyhow::Result<()> {
        if self.concurrency == 0 {
            bail!("test.concurrency must be greater than 0");
        }
        if self.concurrency_levels.iter().any(|&c| c == 0) {
            bail!("test.concurrency_levels entries must be greater than 0");
        }
        if self.duration_ms == 0 {
            bail!("test.duration_ms must be greater than 0");
        }
        if self.request_timeout_ms == 0 {
            bail!("test.request_timeout_ms must be greater than 0");
        }
        if let Some(p) = self.latency_percentiles.iter().find(|&&p| p > 100) {
            bail!("latency percentile {} is outside 0..=100", p);
        }
        Ok(())
    }

    /// Global concurrency levels: the level list if set, else the single value.
    pub fn global_levels(&self) -> Vec<usize> {
        if self.concurrency_levels.is_empty() {
            vec![self.concurrency]
        } else {
            self.concurrency_levels.clone()
        }
    }

    pub fn run_config(&self) -> RunConfig {
        let queue_depth = if self.queue_depth == 0 {
            QueueDepth::PerWorker(2)
        } else {
            QueueDepth::Fixed(self.queue_depth)
        };

        RunConfig {
            duration: Duration::from_millis(self.duration_ms),
            warmup: Duration::from_millis(self.warmup_ms),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            queue_depth,
            percentiles: self.latency_percentiles.clone(),
            show_progress: self.show_progress,
        }
    }
}

/// Capacity policy for a cell's dispatch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueDepth {
    /// Buffer `n` tokens per worker
    PerWorker(usize),
    Fixed(usize),
}

impl QueueDepth {
    pub fn capacity(self, concurrency: usize) -> usize {
        match self {
            QueueDepth::PerWorker(n) => concurrency.saturating_mul(n).max(1),
            QueueDepth::Fixed(n) => n.max(1),
        }
    }
}

/// Immutable engine settings shared by every cell of a matrix run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub duration: Duration,
    pub warmup: Duration,
    pub request_timeout: Duration,
    pub queue_depth: QueueDepth,
    pub percentiles: Vec<u8>,
    pub show_progress: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            duration: Duration::from_millis(default_duration_ms()),
            warmup: Duration::ZERO,
            request_timeout: Duration::from_millis(default_request_timeout_ms()),
            queue_depth: QueueDepth::PerWorker(2),
            percentiles: default_percentiles(),
            show_progress: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptConfig {
    #[serde(default)]
    pub system_message: String,
    pub user_message: String,
    /// Global streaming mode, overridable per model
    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    #[serde(rename = "openai")]
    OpenAi,
    Anthropic,
    Mock,
}

impl TargetKind {
    pub fn requires_api_key(self) -> bool {
        !matches!(self, TargetKind::Mock)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: TargetKind,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub params: ModelParams,
    #[serde(default)]
    pub skip: bool,
    /// Model-specific concurrency levels, overriding the global ones
    #[serde(default)]
    pub concurrency_levels: Option<Vec<usize>>,
    /// Model-specific streaming mode, overriding `prompt.stream`
    #[serde(default)]
    pub stream: Option<bool>,
    #[serde(default)]
    pub proxy_name: Option<String>,
}

impl ModelConfig {
    fn validate(&self) -> anyhow::Result<()> {
        if self.kind.requires_api_key() && self.api_key.is_empty() {
            bail!("api_key is required for {:?} targets", self.kind);
        }
        if let Some(levels) = &self.concurrency_levels {
            if levels.iter().any(|&c| c == 0) {
                bail!("concurrency_levels entries must be greater than 0");
            }
        }
        if let Some(base_url) = &self.base_url {
            url::Url::parse(base_url).with_context(|| format!("invalid base_url: {base_url}"))?;
        }
        let rate = self.params.mock_failure_rate;
        if !(0.0..=1.0).contains(&rate) {
            bail!("params.mock_failure_rate must be within 0.0..=1.0");
        }
        Ok(())
    }

    /// Upstream model identifier sent on the wire.
    pub fn remote_model(&self) -> &str {
        self.params.model.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelParams {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_mock_latency_ms")]
    pub mock_latency_ms: u64,
    #[serde(default)]
    pub mock_jitter_ms: u64,
    #[serde(default)]
    pub mock_failure_rate: f64,
}

fn default_temperature() -> f64 {
    0.7
}

fn default_max_tokens() -> u32 {
    1024
}

fn default_mock_latency_ms() -> u64 {
    250
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            model: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            mock_latency_ms: default_mock_latency_ms(),
            mock_jitter_ms: 0,
            mock_failure_rate: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub name: String,
    pub url: String,
}
