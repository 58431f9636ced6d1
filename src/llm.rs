//! OpenAI-compatible chat-completions client.
//!
//! The rest of the service only sees [`LlmClient`], so handlers and
//! orchestrators can be exercised against a stub.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use eventsource_stream::{Event, Eventsource};
use futures::{future, Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::LlmConfig;

/// Lazily produced text fragments of one model reply.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, LlmError>> + Send>>;

#[derive(Error, Debug)]
pub enum LlmError {
    #[error("Failed to connect to LLM API: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("LLM API returned status code {status}: {body}")]
    Status { status: u16, body: String },

    #[error("No content returned from LLM API")]
    MissingContent,

    #[error("LLM stream interrupted: {0}")]
    Stream(String),
}

/// User turn sent to the model.
#[derive(Debug, Clone)]
pub enum UserContent {
    Text(String),
    /// Text prompt plus an image passed as a `data:` URL.
    Vision { prompt: String, image_url: String },
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// One-shot completion returning the whole reply text.
    async fn complete(&self, system_prompt: &str, content: UserContent) -> Result<String, LlmError>;

    /// Streams the reply as it is generated.
    async fn stream(&self, system_prompt: &str, user_text: &str) -> Result<TokenStream, LlmError>;
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_completion_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reasoning_effort: Option<&'a str>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'static str,
    content: MessageContent<'a>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum MessageContent<'a> {
    Text(&'a str),
    Parts(Vec<ContentPart<'a>>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart<'a> {
    Text { text: &'a str },
    ImageUrl { image_url: ImageUrl<'a> },
}

#[derive(Debug, Serialize)]
struct ImageUrl<'a> {
    url: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    content: Option<String>,
}

pub struct OpenAiClient {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    vision_model: String,
    reasoning_effort: String,
    max_completion_tokens: u32,
    vision_max_tokens: u32,
}

impl OpenAiClient {
    pub fn from_config(config: &LlmConfig) -> Result<Self, LlmError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            vision_model: config.vision_model.clone(),
            reasoning_effort: config.reasoning_effort.clone(),
            max_completion_tokens: config.max_completion_tokens,
            vision_max_tokens: config.vision_max_tokens,
        })
    }

    fn text_request<'a>(
        &'a self,
        system_prompt: &'a str,
        user_text: &'a str,
        stream: bool,
    ) -> ChatRequest<'a> {
        ChatRequest {
            model: &self.model,
            messages: vec![
                Message {
                    role: "system",
                    content: MessageContent::Text(system_prompt),
                },
                Message {
                    role: "user",
                    content: MessageContent::Text(user_text),
                },
            ],
            max_completion_tokens: Some(self.max_completion_tokens),
            max_tokens: None,
            reasoning_effort: Some(&self.reasoning_effort),
            stream,
        }
    }

    async fn post(&self, request: &ChatRequest<'_>) -> Result<reqwest::Response, LlmError> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            warn!(status, body = %body, "LLM API returned an error");
            return Err(LlmError::Status { status, body });
        }
        Ok(response)
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(&self, system_prompt: &str, content: UserContent) -> Result<String, LlmError> {
        let request = match &content {
            UserContent::Text(text) => self.text_request(system_prompt, text, false),
            UserContent::Vision { prompt, image_url } => ChatRequest {
                model: &self.vision_model,
                messages: vec![
                    Message {
                        role: "system",
                        content: MessageContent::Text(system_prompt),
                    },
                    Message {
                        role: "user",
                        content: MessageContent::Parts(vec![
                            ContentPart::Text { text: prompt },
                            ContentPart::ImageUrl {
                                image_url: ImageUrl { url: image_url },
                            },
                        ]),
                    },
                ],
                max_completion_tokens: None,
                max_tokens: Some(self.vision_max_tokens),
                reasoning_effort: None,
                stream: false,
            },
        };

        let completion: ChatCompletion = self.post(&request).await?.json().await?;
        let text = completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or(LlmError::MissingContent)?;

        debug!(chars = text.len(), "LLM completion received");
        Ok(text)
    }

    async fn stream(&self, system_prompt: &str, user_text: &str) -> Result<TokenStream, LlmError> {
        let request = self.text_request(system_prompt, user_text, true);
        let response = self.post(&request).await?;
        Ok(tokens_from_sse(response.bytes_stream()))
    }
}

const DONE_SENTINEL: &str = "[DONE]";

/// Delta text carried by one streamed chunk, if any.
fn delta_content(event: &Event) -> Option<String> {
    if event.data.is_empty() {
        return None;
    }
    match serde_json::from_str::<StreamChunk>(&event.data) {
        Ok(chunk) => chunk
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.delta.content)
            .filter(|content| !content.is_empty()),
        Err(err) => {
            warn!(error = %err, data = %event.data, "skipping undecodable stream event");
            None
        }
    }
}

/// Adapts a raw SSE body into a [`TokenStream`] that ends at `[DONE]`
/// or after the first transport error.
pub fn tokens_from_sse<S, E>(body: S) -> TokenStream
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let mut failed = false;
    body.eventsource()
        .take_while(|event| {
            future::ready(!matches!(event, Ok(event) if event.data == DONE_SENTINEL))
        })
        .filter_map(|event| {
            future::ready(match event {
                Ok(event) => delta_content(&event).map(Ok),
                Err(err) => Some(Err(LlmError::Stream(err.to_string()))),
            })
        })
        .take_while(move |item| {
            let keep = !failed;
            failed |= item.is_err();
            future::ready(keep)
        })
        .boxed()
}
