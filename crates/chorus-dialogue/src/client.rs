use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::provider::{ChatRequest, ChatResponse, LlmProvider, ProviderError};

/// Base delay for the retry backoff schedule.
const BACKOFF_BASE_MS: u64 = 500;

/// OpenAI-compatible chat-completions client.
///
/// Speaks the standard `{model, messages, temperature, max_tokens}` →
/// `{choices[{message{content}}], usage}` wire contract.
pub struct ChatCompletionsClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    chat_path: String,
    provider_name: String,
}

impl ChatCompletionsClient {
    pub fn new(api_key: String, base_url: String, request_timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(request_timeout)
                .build()
                .unwrap_or_default(),
            api_key,
            base_url,
            chat_path: "/v1/chat/completions".to_string(),
            provider_name: "chat-completions".to_string(),
        }
    }

    /// Override the completions path for nonstandard endpoints.
    pub fn with_chat_path(mut self, path: impl Into<String>) -> Self {
        self.chat_path = path.into();
        self
    }
}

#[async_trait]
impl LlmProvider for ChatCompletionsClient {
    fn name(&self) -> &str {
        &self.provider_name
    }

    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let url = format!("{}{}", self.base_url, self.chat_path);
        let body = serde_json::json!({
            "model": req.model,
            "messages": req.messages,
            "temperature": req.temperature,
            "max_tokens": req.max_tokens,
        });

        debug!(model = %req.model, "sending chat-completions request");

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if status == 429 {
            let retry = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|s| s * 1000)
                .unwrap_or(5000);
            return Err(ProviderError::RateLimited {
                retry_after_ms: retry,
            });
        }

        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "chat-completions API error");
            return Err(ProviderError::Api {
                status,
                message: text,
            });
        }

        let api_resp: ApiResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;
        parse_response(api_resp, &req.model)
    }
}

/// Call a provider with exponential backoff.
///
/// `attempts` is the number of retries after the first failure (default 2).
/// A rate-limit response waits out the server's `retry-after` instead of
/// the backoff schedule.
pub async fn chat_with_retry(
    provider: &dyn LlmProvider,
    req: &ChatRequest,
    attempts: u32,
) -> Result<ChatResponse, ProviderError> {
    let mut delay_ms = BACKOFF_BASE_MS;
    let mut last_err = None;

    for attempt in 0..=attempts {
        match provider.chat(req).await {
            Ok(resp) => return Ok(resp),
            Err(e) if attempt == attempts => return Err(e),
            Err(e) => {
                let wait_ms = match &e {
                    ProviderError::RateLimited { retry_after_ms } => *retry_after_ms,
                    _ => delay_ms,
                };
                warn!(
                    provider = provider.name(),
                    attempt = attempt + 1,
                    wait_ms,
                    error = %e,
                    "LLM call failed, retrying"
                );
                last_err = Some(e);
                tokio::time::sleep(Duration::from_millis(wait_ms)).await;
                delay_ms *= 2;
            }
        }
    }
    Err(last_err.unwrap_or(ProviderError::Unavailable("no attempts made".to_string())))
}

#[derive(Deserialize)]
struct ApiResponse {
    #[serde(default)]
    choices: Vec<ApiChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Deserialize)]
struct ApiChoice {
    message: ApiMessage,
}

#[derive(Deserialize)]
struct ApiMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize, Default)]
struct ApiUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

fn parse_response(api: ApiResponse, requested_model: &str) -> Result<ChatResponse, ProviderError> {
    let content = api
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .ok_or_else(|| ProviderError::Parse("response contained no choices".to_string()))?;
    let usage = api.usage.unwrap_or_default();
    Ok(ChatResponse {
        content,
        model: api.model.unwrap_or_else(|| requested_model.to_string()),
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
        total_tokens: usage.total_tokens,
    })
}
