use super::{build_client, status_error, EndpointConfig, StreamClock};
use crate::error::{InvokeError, TargetError};
use crate::invoker::{Completion, InvokeFuture, InvokeRequest, Invoker};
use futures::StreamExt;
use reqwest::{Client, RequestBuilder};
use reqwest_eventsource::{Event, EventSource};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const API_VERSION: &str = "2023-06-01";

/// Anthropic `messages` target.
pub struct AnthropicInvoker {
    client: Client,
    endpoint: String,
    config: EndpointConfig,
}

impl AnthropicInvoker {
    pub fn new(config: EndpointConfig) -> Result<Self, TargetError> {
        let client = build_client(&config)?;
        let endpoint = config.url("messages")?;
        Ok(Self {
            client,
            endpoint,
            config,
        })
    }

    fn post(&self, request: &InvokeRequest) -> RequestBuilder {
        let body = MessagesRequest {
            model: &self.config.model,
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
            system: (!request.system_prompt.is_empty()).then_some(request.system_prompt.as_str()),
            messages: vec![Message {
                role: "user",
                content: &request.user_prompt,
            }],
            stream: request.stream,
        };

        self.client
            .post(&self.endpoint)
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", API_VERSION)
            .timeout(request.timeout)
            .json(&body)
    }

    async fn complete(&self, request: &InvokeRequest) -> Result<Completion, InvokeError> {
        let response = self.post(request).send().await?;
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }

        let parsed: MessagesResponse = response.json().await?;
        let content = parsed
            .content
            .into_iter()
            .filter_map(|block| block.text)
            .collect::<String>();

        Ok(Completion {
            content,
            input_tokens: parsed.usage.input_tokens,
            output_tokens: parsed.usage.output_tokens,
            ..Default::default()
        })
    }

    async fn stream(&self, request: &InvokeRequest) -> Result<Completion, InvokeError> {
        let mut source =
            EventSource::new(self.post(request)).map_err(|e| InvokeError::Http(e.to_string()))?;
        let mut clock = StreamClock::start();
        let mut content = String::new();
        let mut input_tokens = 0u64;
        let mut output_tokens = 0u64;

        while let Some(event) = source.next().await {
            match event {
                Ok(Event::Open) => {}
                Ok(Event::Message(msg)) => {
                    let parsed: StreamEvent = match serde_json::from_str(&msg.data) {
                        Ok(ev) => ev,
                        Err(e) => {
                            debug!("Skipping unparsable event {}: {}", msg.event, e);
                            continue;
                        }
                    };
                    match parsed {
                        StreamEvent::MessageStart { message } => {
                            input_tokens = message.usage.input_tokens;
                            output_tokens = message.usage.output_tokens;
                        }
                        StreamEvent::ContentBlockDelta { delta } => {
                            clock.mark_token();
                            if let Some(text) = delta.text {
                                content.push_str(&text);
                            }
                        }
                        StreamEvent::MessageDelta { usage } => {
                            output_tokens = usage.output_tokens;
                        }
                        StreamEvent::MessageStop => break,
                        StreamEvent::Error { error } => {
                            source.close();
                            return Err(InvokeError::Stream(error.message));
                        }
                        StreamEvent::Other => {}
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

        Ok(Completion {
            content,
            input_tokens,
            output_tokens,
            time_to_first_token: clock.time_to_first_token(),
            tokens_per_sec: clock.tokens_per_sec(input_tokens + output_tokens),
        })
    }
}

impl Invoker for AnthropicInvoker {
    fn name(&self) -> &'static str {
        "anthropic"
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
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    messages: Vec<Message<'a>>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Usage,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    MessageStart { message: StartMessage },
    ContentBlockDelta { delta: TextDelta },
    MessageDelta { usage: Usage },
    MessageStop,
    Error { error: StreamFault },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct StartMessage {
    #[serde(default)]
    usage: Usage,
}

#[derive(Debug, Deserialize)]
struct TextDelta {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamFault {
    message: String,
}
