use super::{build_client, status_error, EndpointConfig, StreamClock};
use crate::error::{InvokeError, TargetError};
use crate::invoker::{Completion, InvokeFuture, InvokeRequest, Invoker};
use futures::StreamExt;
use reqwest::Client;
use reqwest_eventsource::{Event, EventSource};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// OpenAI-compatible `chat/completions` target.
pub struct OpenAiInvoker {
    client: Client,
    endpoint: String,
    config: EndpointConfig,
}

impl OpenAiInvoker {
    pub fn new(config: EndpointConfig) -> Result<Self, TargetError> {
        let client = build_client(&config)?;
        let endpoint = config.url("chat/completions")?;
        Ok(Self {
            client,
            endpoint,
            config,
        })
    }

    fn body<'a>(&'a self, request: &'a InvokeRequest) -> ChatRequest<'a> {
        let mut messages = Vec::with_capacity(2);
        if !request.system_prompt.is_empty() {
            messages.push(ChatMessage {
                role: "system",
                content: &request.system_prompt,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: &request.user_prompt,
        });

        ChatRequest {
            model: &self.config.model,
            messages,
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            stream: request.stream,
            stream_options: request.stream.then_some(StreamOptions {
                include_usage: true,
            }),
        }
    }

    async fn complete(&self, request: &InvokeRequest) -> Result<Completion, InvokeError> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.config.api_key)
            .timeout(request.timeout)
            .json(&self.body(request))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(status_error(response).await);
        }

        let parsed: ChatResponse = response.json().await?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();
        let usage = parsed.usage.unwrap_or_default();

        Ok(Completion {
            content,
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
            ..Default::default()
        })
    }

    async fn stream(&self, request: &InvokeRequest) -> Result<Completion, InvokeError> {
        let builder = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.config.api_key)
            .timeout(request.timeout)
            .json(&self.body(request));

        let mut source =
            EventSource::new(builder).map_err(|e| InvokeError::Http(e.to_string()))?;
        let mut clock = StreamClock::start();
        let mut content = String::new();
        let mut usage = Usage::default();
        let mut chunks = 0u64;

        while let Some(event) = source.next().await {
            match event {
                Ok(Event::Open) => {}
                Ok(Event::Message(msg)) => {
                    if msg.data.trim() == "[DONE]" {
                        break;
                    }
                    let chunk: ChatChunk = match serde_json::from_str(&msg.data) {
                        Ok(chunk) => chunk,
                        Err(e) => {
                            debug!("Skipping unparsable chunk: {} ({})", e, msg.data);
                            continue;
                        }
                    };
                    if let Some(u) = chunk.usage {
                        usage = u;
                    }
                    if let Some(choice) = chunk.choices.first() {
                        clock.mark_token();
                        if let Some(text) = choice.delta.content.as_deref() {
                            content.push_str(text);
                            chunks += 1;
                        }
                    }
                }
                Err(reqwest_eventsource::Error::StreamEnded) => break,
                Err(reqwest_eventsource::Error::InvalidStatusCode(_, response)) => {
                    source.close();
                    return Err(status_error(response).await);
                }
                Err(e) => {
                    source.close();
                    return Err(InvokeError::Stream(e.to_string()));
                }
            }
        }
        source.close();

        // Servers without usage reporting: fall back to content chunk count.
        let output_tokens = if usage.completion_tokens > 0 {
            usage.completion_tokens
        } else {
            chunks
        };

        Ok(Completion {
            content,
            input_tokens: usage.prompt_tokens,
            output_tokens,
            time_to_first_token: clock.time_to_first_token(),
            tokens_per_sec: clock.tokens_per_sec(usage.prompt_tokens + output_tokens),
        })
    }
}

impl Invoker for OpenAiInvoker {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn invoke<'a>(&'a self, request: &'a InvokeRequest) -> InvokeFuture<'a> {
        Box::pin(async move {
            if request.stream {
                self.stream(request).await
            } else {
                self.complete(request).await
            }
        })
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f64,
    max_tokens: u32,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Delta,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    content: Option<String>,
}
