use crate::config::Config;
use crate::error::EngineError;
use crate::translation::{ChatMessage, CompletionEngine, CompletionRequest};
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

/// OpenAI Chat Completion request with structured output
#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    response_format: ResponseFormat<'a>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ResponseFormat<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    json_schema: JsonSchemaFormat<'a>,
}

#[derive(Debug, Serialize)]
struct JsonSchemaFormat<'a> {
    name: &'a str,
    strict: bool,
    schema: &'a Value,
}

/// Non-streamed response body
#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChatMessage,
}

/// One `data:` payload of a streamed response
#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Delta,
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    content: Option<String>,
}

/// Collects streamed content deltas until the engine signals completion.
///
/// Bytes are buffered until a full server-sent event (terminated by a blank
/// line) is available, so multi-byte characters split across network chunks
/// survive intact.
#[derive(Debug, Default)]
struct StreamAccumulator {
    buffer: Vec<u8>,
    content: String,
    finished: bool,
}

impl StreamAccumulator {
    /// Feed raw bytes. Returns true once the stream is complete.
    fn push(&mut self, bytes: &[u8]) -> bool {
        self.buffer.extend_from_slice(bytes);

        while !self.finished {
            let Some(pos) = self.buffer.windows(2).position(|w| w == b"\n\n") else {
                break;
            };
            let event: Vec<u8> = self.buffer.drain(..pos + 2).collect();
            self.process_event(&String::from_utf8_lossy(&event));
        }

        self.finished
    }

    fn process_event(&mut self, event: &str) {
        for line in event.lines() {
            let line = line.trim_end_matches('\r');
            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();

            if data == "[DONE]" {
                self.finished = true;
                return;
            }

            let chunk: StreamChunk = match serde_json::from_str(data) {
                Ok(chunk) => chunk,
                Err(e) => {
                    warn!("Skipping unparseable stream chunk ({}): {}", e, data);
                    continue;
                }
            };

            if let Some(choice) = chunk.choices.first() {
                if let Some(content) = &choice.delta.content {
                    self.content.push_str(content);
                }
                if let Some(reason) = &choice.finish_reason {
                    debug!("Completion finished: {}", reason);
                    self.finished = true;
                    return;
                }
            }
        }
    }

    /// Flush a trailing event without a final blank line and return the text.
    fn finish(mut self) -> Result<String, EngineError> {
        if !self.finished && !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            self.process_event(&String::from_utf8_lossy(&rest));
        }

        if self.content.trim().is_empty() {
            return Err(EngineError::EmptyResponse);
        }

        Ok(self.content)
    }
}

/// Completion engine backed by the OpenAI chat-completions API.
pub struct OpenAiEngine {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    model: String,
}

impl OpenAiEngine {
    pub fn new(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.openai_timeout_secs))
            .build()
            .context("Failed to build OpenAI HTTP client")?;

        Ok(Self {
            client,
            api_url: config.openai_api_url.clone(),
            api_key: config.openai_api_key.clone(),
            model: config.openai_model.clone(),
        })
    }
}

#[async_trait]
impl CompletionEngine for OpenAiEngine {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, EngineError> {
        let body = ChatRequest {
            model: &self.model,
            messages: &request.messages,
            response_format: ResponseFormat {
                kind: "json_schema",
                json_schema: JsonSchemaFormat {
                    name: request.schema_name,
                    strict: true,
                    schema: &request.schema,
                },
            },
            stream: true,
        };

        let response = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(EngineError::Request)?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|e| format!("<failed to read body: {}>", e));
            return Err(EngineError::Status { status, body });
        }

        let is_event_stream = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("text/event-stream"));

        // Some compatible servers ignore `stream` and answer in one piece.
        if !is_event_stream {
            let chat_response: ChatResponse =
                response.json().await.map_err(EngineError::Request)?;
            return chat_response
                .choices
                .into_iter()
                .next()
                .map(|c| c.message.content)
                .filter(|content| !content.trim().is_empty())
                .ok_or(EngineError::EmptyResponse);
        }

        let mut stream = response.bytes_stream();
        let mut accumulator = StreamAccumulator::default();

        while let Some(chunk) = stream.next().await {
            let bytes = chunk.map_err(|e| EngineError::Stream(e.to_string()))?;
            if accumulator.push(&bytes) {
                break;
            }
        }

        accumulator.finish()
    }
}
