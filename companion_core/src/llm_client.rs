use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::config::ModelConfig;
use crate::http_client::build_http_client;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: ChatRole,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingParams {
    pub temperature: f32,
    pub max_tokens: u32,
    pub stream: bool,
}

/// Failure of a completion call. Every variant renders to a short sentence that can be
/// shown to the user as-is.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompletionError {
    #[error("The request timed out, please check your network connection")]
    Timeout,
    #[error("Network connection failed, please check your network")]
    Connection,
    #[error("The API key was rejected, please check your API key")]
    Unauthorized,
    #[error("API access was denied, please check your permissions")]
    Forbidden,
    #[error("Too many requests, please try again later")]
    RateLimited,
    #[error("API request failed: {0}")]
    Status(u16),
    #[error("The model returned an empty response")]
    EmptyResponse,
    #[error("This model cannot look at images")]
    Unsupported,
    #[error("An error occurred: {0}")]
    Other(String),
}

impl CompletionError {
    pub fn from_status(status: u16) -> Self {
        match status {
            401 => CompletionError::Unauthorized,
            403 => CompletionError::Forbidden,
            429 => CompletionError::RateLimited,
            other => CompletionError::Status(other),
        }
    }

    fn from_reqwest(error: &reqwest::Error) -> Self {
        if error.is_timeout() {
            CompletionError::Timeout
        } else if error.is_connect() {
            CompletionError::Connection
        } else if let Some(status) = error.status() {
            CompletionError::from_status(status.as_u16())
        } else {
            CompletionError::Other(error.to_string())
        }
    }

    /// Text shown in place of a model reply.
    pub fn diagnostic(&self) -> String {
        self.to_string()
    }
}

/// Text-completion oracle. Implementations own transport, auth and timeouts.
#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn complete(
        &self,
        messages: &[Message],
        params: &SamplingParams,
    ) -> Result<String, CompletionError>;

    /// Single instruction about one inline base64 raster image.
    async fn complete_with_image(
        &self,
        system: &str,
        instruction: &str,
        image_base64: &str,
        params: &SamplingParams,
    ) -> Result<String, CompletionError> {
        let _ = (system, instruction, image_base64, params);
        Err(CompletionError::Unsupported)
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a, M: Serialize> {
    model: &'a str,
    messages: M,
    temperature: f32,
    max_tokens: u32,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
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
    #[serde(default)]
    content: Option<String>,
}

/// OpenAI-compatible `/chat/completions` client (DeepSeek, SiliconFlow, Ollama, vLLM, ...).
#[derive(Clone)]
pub struct LlmClient {
    endpoint: String,
    api_key: Option<String>,
    model: String,
    client: reqwest::Client,
}

impl LlmClient {
    pub fn new(config: &ModelConfig) -> anyhow::Result<Self> {
        let timeout = (config.timeout_secs > 0).then(|| Duration::from_secs(config.timeout_secs));
        Ok(Self {
            endpoint: endpoint_url(&config.api_url),
            api_key: config.api_key.clone().filter(|key| !key.trim().is_empty()),
            model: config.model.clone(),
            client: build_http_client(timeout)?,
        })
    }

    async fn send<M>(&self, messages: M, params: &SamplingParams) -> Result<String, CompletionError>
    where
        M: Serialize + Send + Sync,
    {
        let request = ChatCompletionRequest {
            model: &self.model,
            messages,
            temperature: params.temperature,
            max_tokens: params.max_tokens,
            stream: params.stream,
        };

        let mut req = self.client.post(&self.endpoint).json(&request);

        // Local models usually run without a key
        if let Some(key) = &self.api_key {
            req = req.header("Authorization", format!("Bearer {}", key));
        }

        let response = req.send().await.map_err(|e| {
            tracing::warn!("Completion request to {} failed: {}", self.endpoint, e);
            CompletionError::from_reqwest(&e)
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            tracing::warn!("Completion API returned {}: {}", status, body);
            return Err(CompletionError::from_status(status.as_u16()));
        }

        let content = if params.stream {
            read_event_stream(response).await?
        } else {
            let completion: ChatCompletionResponse = response.json().await.map_err(|e| {
                CompletionError::Other(format!("failed to parse completion response: {}", e))
            })?;
            completion
                .choices
                .into_iter()
                .next()
                .and_then(|choice| choice.message.content)
                .unwrap_or_default()
        };

        let content = content.trim();
        if content.is_empty() {
            return Err(CompletionError::EmptyResponse);
        }
        Ok(content.to_string())
    }
}

#[async_trait]
impl CompletionService for LlmClient {
    async fn complete(
        &self,
        messages: &[Message],
        params: &SamplingParams,
    ) -> Result<String, CompletionError> {
        tracing::debug!(
            "Requesting completion from {} ({} messages)",
            self.model,
            messages.len()
        );
        self.send(messages, params).await
    }

    async fn complete_with_image(
        &self,
        system: &str,
        instruction: &str,
        image_base64: &str,
        params: &SamplingParams,
    ) -> Result<String, CompletionError> {
        let messages = serde_json::json!([
            { "role": "system", "content": system },
            {
                "role": "user",
                "content": [
                    {
                        "type": "image_url",
                        "image_url": {
                            "url": format!("data:image/png;base64,{}", strip_data_url(image_base64))
                        }
                    },
                    { "type": "text", "text": instruction }
                ]
            }
        ]);

        let params = SamplingParams {
            stream: false,
            ..*params
        };
        self.send(messages, &params).await
    }
}

async fn read_event_stream(response: reqwest::Response) -> Result<String, CompletionError> {
    let mut stream = response.bytes_stream();
    let mut decoder = SseDecoder::default();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| CompletionError::from_reqwest(&e))?;
        if decoder.feed(&chunk) {
            return Ok(decoder.content);
        }
    }

    Ok(decoder.finish())
}

/// Accumulates streamed deltas. Bytes are buffered until a full line is available,
/// so multi-byte characters split across network chunks decode intact.
#[derive(Debug, Default)]
struct SseDecoder {
    pending: Vec<u8>,
    content: String,
}

impl SseDecoder {
    /// Returns true once the stream has signalled completion.
    fn feed(&mut self, chunk: &[u8]) -> bool {
        self.pending.extend_from_slice(chunk);
        while let Some(newline) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=newline).collect();
            if self.accept(&line) {
                return true;
            }
        }
        false
    }

    fn finish(mut self) -> String {
        let rest = std::mem::take(&mut self.pending);
        self.accept(&rest);
        self.content
    }

    fn accept(&mut self, line: &[u8]) -> bool {
        let line = match std::str::from_utf8(line) {
            Ok(line) => line,
            Err(e) => {
                tracing::debug!("Skipping stream line with invalid UTF-8: {}", e);
                return false;
            }
        };
        match parse_sse_line(line) {
            SseLine::Content(delta) => {
                self.content.push_str(&delta);
                false
            }
            SseLine::Done => true,
            SseLine::Ignore => false,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum SseLine {
    Content(String),
    Done,
    Ignore,
}

fn parse_sse_line(line: &str) -> SseLine {
    let Some(data) = line.trim().strip_prefix("data:") else {
        return SseLine::Ignore;
    };
    let data = data.trim();
    if data == "[DONE]" {
        return SseLine::Done;
    }
    match serde_json::from_str::<StreamChunk>(data) {
        Ok(chunk) => chunk
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.delta.content)
            .map(SseLine::Content)
            .unwrap_or(SseLine::Ignore),
        Err(e) => {
            tracing::debug!("Skipping unparseable stream chunk: {}", e);
            SseLine::Ignore
        }
    }
}

fn endpoint_url(api_url: &str) -> String {
    let trimmed = api_url.trim().trim_end_matches('/');
    if trimmed.ends_with("/chat/completions") {
        trimmed.to_string()
    } else {
        format!("{}/chat/completions", trimmed)
    }
}

fn strip_data_url(image_base64: &str) -> &str {
    if image_base64.starts_with("data:image") {
        image_base64
            .split_once(',')
            .map(|(_, payload)| payload)
            .unwrap_or(image_base64)
    } else {
        image_base64
    }
}
