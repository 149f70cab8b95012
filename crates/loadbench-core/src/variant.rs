use crate::config::{Config, ModelConfig, TargetKind};
use crate::error::TargetError;
use crate::invoker::{Invoker, MockInvoker};
use crate::providers::{anthropic, openai, AnthropicInvoker, EndpointConfig, OpenAiInvoker};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// One target under test. Immutable once built.
#[derive(Clone)]
pub struct TargetVariant {
    pub name: String,
    pub invoker: Arc<dyn Invoker>,
    /// Overrides the global concurrency levels when set and non-empty
    pub concurrency_levels: Option<Vec<usize>>,
    /// Overrides the global streaming mode when set
    pub stream: Option<bool>,
}

impl TargetVariant {
    pub fn new(name: impl Into<String>, invoker: Arc<dyn Invoker>) -> Self {
        Self {
            name: name.into(),
            invoker,
            concurrency_levels: None,
            stream: None,
        }
    }

    pub fn with_levels(mut self, levels: Vec<usize>) -> Self {
        self.concurrency_levels = Some(levels);
        self
    }

    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = Some(stream);
        self
    }

    pub fn stream_or(&self, default: bool) -> bool {
        self.stream.unwrap_or(default)
    }
}

impl fmt::Debug for TargetVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetVariant")
            .field("name", &self.name)
            .field("invoker", &self.invoker.name())
            .field("concurrency_levels", &self.concurrency_levels)
            .field("stream", &self.stream)
            .finish()
    }
}

/// Build variants for every non-skipped model, in configured order.
pub fn build_variants(config: &Config) -> Result<Vec<TargetVariant>, TargetError> {
    config
        .active_models()
        .map(|model| {
            let invoker = build_invoker(config, model)?;
            info!("Target {} uses the {} invoker", model.name, invoker.name());
            Ok(variant_for(model, invoker))
        })
        .collect()
}

/// Build variants that all talk to an in-process [`MockInvoker`], keeping
/// each model's matrix settings. Useful for rehearsing a configuration.
pub fn mock_variants(config: &Config) -> Vec<TargetVariant> {
    config
        .active_models()
        .map(|model| variant_for(model, Arc::new(mock_invoker(model))))
        .collect()
}

fn variant_for(model: &ModelConfig, invoker: Arc<dyn Invoker>) -> TargetVariant {
    TargetVariant {
        name: model.name.clone(),
        invoker,
        concurrency_levels: model.concurrency_levels.clone().filter(|l| !l.is_empty()),
        stream: model.stream,
    }
}

fn mock_invoker(model: &ModelConfig) -> MockInvoker {
    MockInvoker::new(Duration::from_millis(model.params.mock_latency_ms))
        .with_jitter(Duration::from_millis(model.params.mock_jitter_ms))
        .with_failure_rate(model.params.mock_failure_rate)
}

fn build_invoker(config: &Config, model: &ModelConfig) -> Result<Arc<dyn Invoker>, TargetError> {
    let default_base = match model.kind {
        TargetKind::Mock => return Ok(Arc::new(mock_invoker(model))),
        TargetKind::OpenAi => openai::DEFAULT_BASE_URL,
        TargetKind::Anthropic => anthropic::DEFAULT_BASE_URL,
    };

    let endpoint = EndpointConfig {
        variant: model.name.clone(),
        base_url: model
            .base_url
            .clone()
            .unwrap_or_else(|| default_base.to_string()),
        api_key: model.api_key.clone(),
        model: model.remote_model().to_string(),
        temperature: model.params.temperature,
        max_tokens: model.params.max_tokens,
        proxy_url: resolve_proxy(config, model),
        pool_size: max_level(config, model),
    };

    Ok(match model.kind {
        TargetKind::Anthropic => Arc::new(AnthropicInvoker::new(endpoint)?),
        _ => Arc::new(OpenAiInvoker::new(endpoint)?),
    })
}

fn resolve_proxy(config: &Config, model: &ModelConfig) -> Option<String> {
    let name = model.proxy_name.as_deref().filter(|n| !n.is_empty())?;
    match config.proxy_url(name) {
        Some(url) => {
            info!("Target {} routes through proxy {}", model.name, name);
            Some(url.to_string())
        }
        None => {
            warn!(
                "Proxy {} for target {} is not configured, using direct connection",
                name, model.name
            );
            None
        }
    }
}

fn max_level(config: &Config, model: &ModelConfig) -> usize {
    model
        .concurrency_levels
        .iter()
        .flatten()
        .chain(config.test.global_levels().iter())
        .copied()
        .max()
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
[test]
concurrency_levels = [10, 20]

[prompt]
user_message = "hi"

[[proxies]]
name = "corp"
url = "http://127.0.0.1:3128"

[[models]]
name = "gpt"
type = "openai"
api_key = "sk"
concurrency_levels = [5, 64]
proxy_name = "corp"

[[models]]
name = "claude"
type = "anthropic"
api_key = "key"
stream = true
proxy_name = "missing"

[[models]]
name = "parked"
type = "mock"
skip = true

[[models]]
name = "sim"
type = "mock"
concurrency_levels = []
    "#;

    fn config() -> Config {
        let config: Config = toml::from_str(CONFIG).unwrap();
        config.validate().unwrap();
        config
    }

    #[test]
    fn test_build_variants_in_order_skipping() {
        let variants = build_variants(&config()).unwrap();
        let names: Vec<_> = variants.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["gpt", "claude", "sim"]);

        assert_eq!(variants[0].invoker.name(), "openai");
        assert_eq!(variants[0].concurrency_levels, Some(vec![5, 64]));
        assert_eq!(variants[1].invoker.name(), "anthropic");
        assert_eq!(variants[1].stream, Some(true));
        assert!(variants[1].stream_or(false));
        assert_eq!(variants[2].invoker.name(), "mock");
        // An empty override list falls back to the global levels.
        assert_eq!(variants[2].concurrency_levels, None);
    }

    #[test]
    fn test_mock_variants_keep_matrix_settings() {
        let variants = mock_variants(&config());
        assert_eq!(variants.len(), 3);
        assert!(variants.iter().all(|v| v.invoker.name() == "mock"));
        assert_eq!(variants[0].concurrency_levels, Some(vec![5, 64]));
    }

    #[test]
    fn test_proxy_and_pool_resolution() {
        let config = config();
        assert_eq!(
            resolve_proxy(&config, &config.models[0]).as_deref(),
            Some("http://127.0.0.1:3128")
        );
        assert_eq!(resolve_proxy(&config, &config.models[1]), None);
        assert_eq!(max_level(&config, &config.models[0]), 64);
        assert_eq!(max_level(&config, &config.models[1]), 20);
    }

    #[test]
    fn test_bad_base_url_names_variant() {
        let mut config = config();
        config.models[0].base_url = Some("::nope".into());
        let err = build_variants(&config).unwrap_err();
        assert!(err.to_string().contains("gpt"));
    }
}
