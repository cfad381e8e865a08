//! Streaming backend for OpenAI-compatible chat completion APIs
//!
//! Used for every provider that speaks `/chat/completions` with server-sent
//! events (OpenAI, Mistral and most self-hosted gateways).

use super::{ChatMessage, GenerationBackend, GenerationError, GenerationRequest, TextStream};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;
use tracing::debug;

/// Connection settings for one provider
#[derive(Debug, Clone)]
pub struct OpenAiBackendConfig {
    pub provider: String,
    pub base_url: String,
    pub api_key: Option<SecretString>,
    pub connect_timeout: Duration,
    /// Cap on a whole response, body included
    pub request_timeout: Duration,
}

/// OpenAI-compatible streaming backend
pub struct OpenAiCompatibleBackend {
    client: Client,
    config: OpenAiBackendConfig,
}

impl OpenAiCompatibleBackend {
    pub fn new(config: OpenAiBackendConfig) -> Result<Self, GenerationError> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| GenerationError::provider(&config.provider, e.to_string()))?;

        Ok(Self { client, config })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl GenerationBackend for OpenAiCompatibleBackend {
    async fn invoke(&self, request: &GenerationRequest) -> Result<TextStream, GenerationError> {
        let provider = self.config.provider.clone();
        let api_key = self.config.api_key.as_ref().ok_or_else(|| {
            GenerationError::provider(&provider, format!("{} API key not configured", provider))
        })?;

        let body = ChatCompletionRequest {
            model: &request.model,
            messages: &request.messages,
            max_tokens: Some(request.max_tokens),
            temperature: Some(request.temperature),
            stream: true,
        };

        debug!(
            "Calling {} chat completions: model={}, messages={}",
            provider,
            request.model,
            request.messages.len()
        );

        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(api_key.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| GenerationError::provider(&provider, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(&provider, status, &body));
        }

        Ok(sse_text_stream(provider, Box::pin(response.bytes_stream())))
    }
}

fn classify_status(provider: &str, status: StatusCode, body: &str) -> GenerationError {
    let cause = match status {
        StatusCode::TOO_MANY_REQUESTS => {
            format!("{} API quota exceeded (rate_limit): {}", provider, body)
        }
        StatusCode::UNAUTHORIZED => format!("{} API key is invalid: {}", provider, body),
        StatusCode::FORBIDDEN => format!("{} API key lacks permission: {}", provider, body),
        _ => format!("HTTP {}: {}", status, body),
    };
    GenerationError::provider(provider, cause)
}

type ByteStream = Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>;

struct SseState {
    bytes: ByteStream,
    buffer: Vec<u8>,
    pending: VecDeque<String>,
    done: bool,
}

/// Turn an SSE byte stream into text deltas
fn sse_text_stream(provider: String, bytes: ByteStream) -> TextStream {
    let state = SseState {
        bytes,
        buffer: Vec::new(),
        pending: VecDeque::new(),
        done: false,
    };

    Box::pin(futures::stream::unfold(state, move |mut state| {
        let provider = provider.clone();
        async move {
            loop {
                if let Some(text) = state.pending.pop_front() {
                    return Some((Ok(text), state));
                }
                if state.done {
                    return None;
                }

                match state.bytes.next().await {
                    Some(Ok(chunk)) => {
                        state.buffer.extend_from_slice(&chunk);
                        drain_lines(&mut state);
                    }
                    Some(Err(e)) => {
                        state.done = true;
                        return Some((Err(GenerationError::provider(&provider, e.to_string())), state));
                    }
                    None => {
                        state.buffer.push(b'\n');
                        drain_lines(&mut state);
                        state.done = true;
                    }
                }
            }
        }
    }))
}

fn drain_lines(state: &mut SseState) {
    while let Some(pos) = state.buffer.iter().position(|b| *b == b'\n') {
        let line: Vec<u8> = state.buffer.drain(..=pos).collect();
        let line = String::from_utf8_lossy(&line);
        match parse_sse_line(line.trim()) {
            SseLine::Delta(text) => state.pending.push_back(text),
            SseLine::Done => {
                state.done = true;
                state.buffer.clear();
                return;
            }
            SseLine::Ignore => {}
        }
    }
}

#[derive(Debug, PartialEq)]
enum SseLine {
    Delta(String),
    Done,
    Ignore,
}

fn parse_sse_line(line: &str) -> SseLine {
    let Some(data) = line.strip_prefix("data:") else {
        return SseLine::Ignore;
    };
    let data = data.trim();
    if data == "[DONE]" {
        return SseLine::Done;
    }

    match serde_json::from_str::<ChatCompletionChunk>(data) {
        Ok(chunk) => chunk
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.delta.content)
            .filter(|content| !content.is_empty())
            .map(SseLine::Delta)
            .unwrap_or(SseLine::Ignore),
        Err(_) => SseLine::Ignore,
    }
}

// OpenAI-compatible API types
#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    delta: ChunkDelta,
}

#[derive(Debug, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}
