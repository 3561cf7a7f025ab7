//! LLM collaborator: streamed completions with cooperative cancellation.
//!
//! [`HttpLlmClient`] talks to an OpenAI-compatible chat-completions endpoint
//! and surfaces the SSE response as a chunk stream. [`collect_completion`]
//! aggregates any [`LlmClient`] stream into a full string, checking the
//! cancellation token between chunks and bounding the whole call with a
//! timeout so a stalled stream can never suspend a worker loop indefinitely.

use std::time::Duration;

use async_trait::async_trait;
use futures::{stream, StreamExt};
use serde_json::json;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::contract::{CompletionRequest, CompletionStream, LlmClient, LlmError};

#[derive(Debug, Error)]
pub enum CompletionError {
    /// The caller's cancellation signal fired; not a failure.
    #[error("completion cancelled")]
    Cancelled,
    #[error("completion timed out after {0:?}")]
    TimedOut(Duration),
    #[error("llm backend error: {0}")]
    Upstream(LlmError),
}

/// Drain a completion stream into one string.
///
/// Cancellation is checked between chunks: an in-flight chunk is still
/// awaited, but nothing further is consumed once the token fires.
pub async fn collect_completion<L>(
    client: &L,
    req: CompletionRequest,
    cancel: &CancellationToken,
    timeout: Duration,
) -> Result<String, CompletionError>
where
    L: LlmClient + ?Sized,
{
    let work = async {
        let mut stream = client
            .stream_complete(req)
            .await
            .map_err(CompletionError::Upstream)?;
        let mut out = String::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(CompletionError::Cancelled),
                chunk = stream.next() => match chunk {
                    Some(Ok(text)) => out.push_str(&text),
                    Some(Err(e)) => return Err(CompletionError::Upstream(e)),
                    None => return Ok(out),
                },
            }
        }
    };
    tokio::select! {
        _ = tokio::time::sleep(timeout) => Err(CompletionError::TimedOut(timeout)),
        result = work => result,
    }
}

/// Streaming client for an OpenAI-compatible `/chat/completions` endpoint.
pub struct HttpLlmClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl HttpLlmClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    /// Build a client from `LLM_API_BASE`, `LLM_API_KEY` and `LLM_MODEL`.
    pub fn from_env() -> Result<Self, LlmError> {
        let base_url = std::env::var("LLM_API_BASE").map_err(|_| "LLM_API_BASE missing")?;
        let api_key = std::env::var("LLM_API_KEY").map_err(|_| "LLM_API_KEY missing")?;
        let model =
            std::env::var("LLM_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());
        Ok(Self::new(base_url, api_key, model))
    }
}

/// Pull complete SSE lines off the front of `buf` and return the text deltas
/// they carry. Incomplete trailing lines stay buffered for the next chunk.
fn drain_sse_lines(buf: &mut String) -> Vec<String> {
    let mut deltas = Vec::new();
    while let Some(pos) = buf.find('\n') {
        let line = buf[..pos].trim().to_string();
        buf.drain(..=pos);
        let Some(data) = line.strip_prefix("data:") else {
            continue;
        };
        let data = data.trim();
        if data == "[DONE]" {
            continue;
        }
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(data) {
            if let Some(text) = value["choices"][0]["delta"]["content"].as_str() {
                deltas.push(text.to_string());
            }
        }
    }
    deltas
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn stream_complete(
        &self,
        req: CompletionRequest,
    ) -> Result<CompletionStream, LlmError> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let mut body = json!({
            "model": self.model,
            "stream": true,
            "messages": [{"role": "user", "content": req.prompt}],
        });
        if let Some(t) = req.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(m) = req.max_tokens {
            body["max_tokens"] = json!(m);
        }
        debug!(url = %url, model = %self.model, "Opening completion stream");

        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(format!("llm endpoint returned {status}: {text}").into());
        }

        let chunks = resp
            .bytes_stream()
            .scan(String::new(), |buf, next| {
                let out = match next {
                    Ok(bytes) => {
                        buf.push_str(&String::from_utf8_lossy(&bytes));
                        Ok(drain_sse_lines(buf))
                    }
                    Err(e) => Err(Box::new(e) as LlmError),
                };
                futures::future::ready(Some(out))
            })
            .flat_map(|result| match result {
                Ok(deltas) => stream::iter(deltas.into_iter().map(Ok)).boxed(),
                Err(e) => stream::iter(vec![Err(e)]).boxed(),
            })
            .boxed();
        Ok(chunks)
    }
}
