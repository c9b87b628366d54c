//! Concrete LLM provider clients.
//!
//! Three wire formats: Ollama's native API, OpenAI-compatible chat
//! completions, and Anthropic messages. Ollama and OpenAI-compatible servers
//! enforce a supplied JSON Schema natively; the Anthropic format appends the
//! schema as a prompt instruction and relies on the caller's repair pass.

use std::time::Duration;

use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{CloudFormat, LlmProviderConfig};
use crate::llm::{LlmReply, LlmRequest, LlmUsage};
use crate::FabulaError;

const ANTHROPIC_VERSION: &str = "2023-06-01";

fn http_client() -> Client {
    // Per-request timeouts are set on each call; the builder timeout is a
    // backstop for requests that never specify one.
    Client::builder()
        .timeout(Duration::from_secs(300))
        .build()
        .unwrap_or_else(|_| Client::new())
}

async fn error_for_status(response: reqwest::Response) -> Result<reqwest::Response, FabulaError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    Err(FabulaError::LlmUnavailable(format!(
        "HTTP {status}: {}",
        crate::utils::text::truncate_chars(&body, 300)
    )))
}

/// Tagged provider variants; selected once at configuration time.
pub enum LlmClient {
    Ollama(OllamaClient),
    OpenAiCompatible(OpenAiClient),
    Anthropic(AnthropicClient),
}

impl LlmClient {
    pub fn from_provider(provider: &LlmProviderConfig) -> Self {
        match provider {
            LlmProviderConfig::Ollama {
                base_url,
                model,
                num_ctx,
            } => LlmClient::Ollama(OllamaClient::new(base_url, model, *num_ctx)),
            LlmProviderConfig::Cloud {
                base_url,
                api_key,
                model,
                format,
                max_tokens,
            } => match format {
                CloudFormat::Openai => LlmClient::OpenAiCompatible(OpenAiClient::new(
                    base_url, api_key, model, *max_tokens,
                )),
                CloudFormat::Anthropic => LlmClient::Anthropic(AnthropicClient::new(
                    base_url, api_key, model, *max_tokens,
                )),
            },
        }
    }

    pub async fn generate(&self, request: LlmRequest) -> Result<LlmReply, FabulaError> {
        match self {
            LlmClient::Ollama(c) => c.generate(request).await,
            LlmClient::OpenAiCompatible(c) => c.generate(request).await,
            LlmClient::Anthropic(c) => c.generate(request).await,
        }
    }

    pub fn generate_stream(
        &self,
        system: String,
        prompt: String,
        timeout: Duration,
    ) -> BoxStream<'static, Result<String, FabulaError>> {
        match self {
            LlmClient::Ollama(c) => c.generate_stream(system, prompt, timeout),
            LlmClient::OpenAiCompatible(c) => c.generate_stream(system, prompt, timeout),
            LlmClient::Anthropic(c) => c.generate_stream(system, prompt, timeout),
        }
    }
}

// ============================================================================
// Ollama (native API)
// ============================================================================

#[derive(Clone)]
pub struct OllamaClient {
    client: Client,
    base_url: String,
    model: String,
    num_ctx: u32,
}

#[derive(Serialize)]
struct OllamaGenerateRequest<'a> {
    model: &'a str,
    system: &'a str,
    prompt: &'a str,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<&'a serde_json::Value>,
    options: OllamaOptions,
}

#[derive(Serialize)]
struct OllamaOptions {
    temperature: f32,
    num_ctx: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
}

#[derive(Deserialize)]
struct OllamaGenerateResponse {
    #[serde(default)]
    response: String,
    #[serde(default)]
    prompt_eval_count: u64,
    #[serde(default)]
    eval_count: u64,
}

#[derive(Deserialize)]
struct OllamaStreamChunk {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
}

impl OllamaClient {
    pub fn new(base_url: &str, model: &str, num_ctx: u32) -> Self {
        OllamaClient {
            client: http_client(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            num_ctx,
        }
    }

    pub async fn generate(&self, request: LlmRequest) -> Result<LlmReply, FabulaError> {
        let body = OllamaGenerateRequest {
            model: &self.model,
            system: &request.system,
            prompt: &request.prompt,
            stream: false,
            format: request.format.as_ref(),
            options: OllamaOptions {
                temperature: request.temperature,
                num_ctx: request.num_ctx.unwrap_or(self.num_ctx),
                num_predict: request.max_tokens,
            },
        };
        let response = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .timeout(request.timeout)
            .json(&body)
            .send()
            .await?;
        let response = error_for_status(response).await?;
        let decoded: OllamaGenerateResponse = response
            .json()
            .await
            .map_err(|e| FabulaError::LlmUnavailable(format!("invalid response: {e}")))?;
        Ok(LlmReply {
            content: decoded.response,
            usage: LlmUsage {
                input_tokens: decoded.prompt_eval_count,
                output_tokens: decoded.eval_count,
            },
        })
    }

    pub fn generate_stream(
        &self,
        system: String,
        prompt: String,
        timeout: Duration,
    ) -> BoxStream<'static, Result<String, FabulaError>> {
        let client = self.client.clone();
        let url = format!("{}/api/generate", self.base_url);
        let model = self.model.clone();
        let num_ctx = self.num_ctx;
        Box::pin(async_stream::try_stream! {
            let body = serde_json::json!({
                "model": model,
                "system": system,
                "prompt": prompt,
                "stream": true,
                "options": { "temperature": 0.7, "num_ctx": num_ctx },
            });
            let response = client.post(&url).timeout(timeout).json(&body).send().await?;
            let response = error_for_status(response).await?;
            let mut bytes = response.bytes_stream();
            let mut buffer = String::new();
            while let Some(chunk) = bytes.next().await {
                let chunk = chunk?;
                buffer.push_str(&String::from_utf8_lossy(&chunk));
                while let Some(newline) = buffer.find('\n') {
                    let line: String = buffer.drain(..=newline).collect();
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    if let Ok(piece) = serde_json::from_str::<OllamaStreamChunk>(line) {
                        if !piece.response.is_empty() {
                            yield piece.response;
                        }
                        if piece.done {
                            return;
                        }
                    }
                }
            }
        })
    }
}

// ============================================================================
// OpenAI-compatible cloud
// ============================================================================

#[derive(Clone)]
pub struct OpenAiClient {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct OpenAiResponse {
    #[serde(default)]
    choices: Vec<OpenAiChoice>,
    usage: Option<OpenAiUsage>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
}

#[derive(Deserialize)]
struct OpenAiMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Deserialize)]
struct OpenAiStreamChunk {
    #[serde(default)]
    choices: Vec<OpenAiStreamChoice>,
}

#[derive(Deserialize)]
struct OpenAiStreamChoice {
    delta: OpenAiDelta,
}

#[derive(Deserialize)]
struct OpenAiDelta {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiClient {
    pub fn new(base_url: &str, api_key: &str, model: &str, max_tokens: u32) -> Self {
        let trimmed = base_url.trim_end_matches('/');
        let base_url = if trimmed.ends_with("/v1") {
            trimmed.to_string()
        } else {
            format!("{trimmed}/v1")
        };
        OpenAiClient {
            client: http_client(),
            base_url,
            api_key: api_key.to_string(),
            model: model.to_string(),
            max_tokens,
        }
    }

    fn request_body(&self, request: &LlmRequest, stream: bool) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": request.system },
                { "role": "user", "content": request.prompt },
            ],
            "temperature": request.temperature,
            "max_tokens": request.max_tokens.unwrap_or(self.max_tokens),
            "stream": stream,
        });
        if let Some(schema) = &request.format {
            body["response_format"] = serde_json::json!({
                "type": "json_schema",
                "json_schema": { "name": "structured_output", "schema": schema },
            });
        }
        body
    }

    pub async fn generate(&self, request: LlmRequest) -> Result<LlmReply, FabulaError> {
        let body = self.request_body(&request, false);
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .timeout(request.timeout)
            .json(&body)
            .send()
            .await?;
        let response = error_for_status(response).await?;
        let decoded: OpenAiResponse = response
            .json()
            .await
            .map_err(|e| FabulaError::LlmUnavailable(format!("invalid response: {e}")))?;
        let content = decoded
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| FabulaError::LlmUnavailable("no choices in response".to_string()))?;
        let usage = decoded
            .usage
            .map(|u| LlmUsage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
            })
            .unwrap_or_default();
        Ok(LlmReply { content, usage })
    }

    pub fn generate_stream(
        &self,
        system: String,
        prompt: String,
        timeout: Duration,
    ) -> BoxStream<'static, Result<String, FabulaError>> {
        let this = self.clone();
        Box::pin(async_stream::try_stream! {
            let request = LlmRequest::new(system, prompt);
            let body = this.request_body(&request, true);
            let response = this
                .client
                .post(format!("{}/chat/completions", this.base_url))
                .bearer_auth(&this.api_key)
                .timeout(timeout)
                .json(&body)
                .send()
                .await?;
            let response = error_for_status(response).await?;
            let mut bytes = response.bytes_stream();
            let mut buffer = String::new();
            while let Some(chunk) = bytes.next().await {
                let chunk = chunk?;
                buffer.push_str(&String::from_utf8_lossy(&chunk));
                while let Some(newline) = buffer.find('\n') {
                    let line: String = buffer.drain(..=newline).collect();
                    let line = line.trim();
                    let Some(data) = line.strip_prefix("data:") else {
                        continue;
                    };
                    let data = data.trim();
                    if data == "[DONE]" {
                        return;
                    }
                    if let Ok(piece) = serde_json::from_str::<OpenAiStreamChunk>(data) {
                        if let Some(text) = piece.choices.into_iter().next().and_then(|c| c.delta.content) {
                            if !text.is_empty() {
                                yield text;
                            }
                        }
                    }
                }
            }
        })
    }
}

// ============================================================================
// Anthropic-format cloud
// ============================================================================

#[derive(Clone)]
pub struct AnthropicClient {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct AnthropicResponse {
    #[serde(default)]
    content: Vec<AnthropicContent>,
    usage: Option<AnthropicUsage>,
}

#[derive(Deserialize)]
struct AnthropicContent {
    #[serde(default)]
    text: String,
}

#[derive(Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[derive(Deserialize)]
struct AnthropicStreamEvent {
    #[serde(rename = "type", default)]
    kind: String,
    delta: Option<AnthropicDelta>,
}

#[derive(Deserialize)]
struct AnthropicDelta {
    #[serde(default)]
    text: Option<String>,
}

impl AnthropicClient {
    pub fn new(base_url: &str, api_key: &str, model: &str, max_tokens: u32) -> Self {
        AnthropicClient {
            client: http_client(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            max_tokens,
        }
    }

    pub async fn generate(&self, request: LlmRequest) -> Result<LlmReply, FabulaError> {
        // No native schema enforcement; fold the schema into the prompt and
        // let the caller's repair pass handle drift.
        let prompt = match &request.format {
            Some(schema) => format!(
                "{}\n\n输出必须是符合以下 JSON Schema 的单个 JSON 对象，不要输出任何其他文字：\n{}",
                request.prompt, schema
            ),
            None => request.prompt.clone(),
        };
        let body = serde_json::json!({
            "model": self.model,
            "max_tokens": request.max_tokens.unwrap_or(self.max_tokens),
            "system": request.system,
            "messages": [{ "role": "user", "content": prompt }],
            "temperature": request.temperature,
        });
        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .timeout(request.timeout)
            .json(&body)
            .send()
            .await?;
        let response = error_for_status(response).await?;
        let decoded: AnthropicResponse = response
            .json()
            .await
            .map_err(|e| FabulaError::LlmUnavailable(format!("invalid response: {e}")))?;
        let content = decoded
            .content
            .into_iter()
            .map(|c| c.text)
            .collect::<String>();
        if content.is_empty() {
            debug!("anthropic response carried no text blocks");
        }
        let usage = decoded
            .usage
            .map(|u| LlmUsage {
                input_tokens: u.input_tokens,
                output_tokens: u.output_tokens,
            })
            .unwrap_or_default();
        Ok(LlmReply { content, usage })
    }

    pub fn generate_stream(
        &self,
        system: String,
        prompt: String,
        timeout: Duration,
    ) -> BoxStream<'static, Result<String, FabulaError>> {
        let this = self.clone();
        Box::pin(async_stream::try_stream! {
            let body = serde_json::json!({
                "model": this.model,
                "max_tokens": this.max_tokens,
                "system": system,
                "messages": [{ "role": "user", "content": prompt }],
                "stream": true,
            });
            let response = this
                .client
                .post(format!("{}/v1/messages", this.base_url))
                .header("x-api-key", &this.api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .timeout(timeout)
                .json(&body)
                .send()
                .await?;
            let response = error_for_status(response).await?;
            let mut bytes = response.bytes_stream();
            let mut buffer = String::new();
            while let Some(chunk) = bytes.next().await {
                let chunk = chunk?;
                buffer.push_str(&String::from_utf8_lossy(&chunk));
                while let Some(newline) = buffer.find('\n') {
                    let line: String = buffer.drain(..=newline).collect();
                    let line = line.trim();
                    let Some(data) = line.strip_prefix("data:") else {
                        continue;
                    };
                    if let Ok(event) = serde_json::from_str::<AnthropicStreamEvent>(data.trim()) {
                        if event.kind == "message_stop" {
                            return;
                        }
                        if let Some(text) = event.delta.and_then(|d| d.text) {
                            if !text.is_empty() {
                                yield text;
                            }
                        }
                    }
                }
            }
        })
    }
}
