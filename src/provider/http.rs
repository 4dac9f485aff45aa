use std::time::{Duration, Instant};

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures_util::stream::{self, BoxStream, StreamExt};
use reqwest::Client;
use serde::Deserialize;

use crate::error::DuhError;
use crate::provider::{
    ModelInfo, ModelProvider, ModelResponse, PromptMessage, Role, SendOptions, StreamChunk,
    ToolCallData, TokenUsage,
};

/// The two wire shapes every HTTP-backed vendor in this crate speaks.
/// OpenAI-compatible chat-completions covers OpenAI, Mistral, DeepSeek,
/// Together, and OpenRouter-fronted models; Anthropic covers the
/// Messages API directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiFormat {
    OpenAi,
    Anthropic,
}

pub const MAX_RESPONSE_BYTES: usize = 2 * 1024 * 1024;
const STALL_TIMEOUT: Duration = Duration::from_secs(60);
const HEADERS_TIMEOUT: Duration = Duration::from_secs(60);

/// Generic HTTP adapter for a single vendor, parameterized by wire
/// format. One `HttpProvider` instance corresponds to one `provider_id`
/// and owns the full `ModelInfo` catalog for that vendor.
pub struct HttpProvider {
    provider_id: String,
    base_url: String,
    api_key: String,
    api_format: ApiFormat,
    models: Vec<ModelInfo>,
    client: Client,
}

impl HttpProvider {
    pub fn new(
        provider_id: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        api_format: ApiFormat,
        models: Vec<ModelInfo>,
    ) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(4)
            .build()
            .expect("failed to build HTTP client");

        Self {
            provider_id: provider_id.into(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            api_format,
            models,
            client,
        }
    }

    fn build_body(&self, messages: &[PromptMessage], model_id: &str, opts: &SendOptions) -> serde_json::Value {
        match self.api_format {
            ApiFormat::OpenAi => {
                let msgs: Vec<_> = messages
                    .iter()
                    .map(|m| {
                        let role = match m.role {
                            Role::System => "system",
                            Role::User => "user",
                            Role::Assistant => "assistant",
                        };
                        serde_json::json!({"role": role, "content": m.content})
                    })
                    .collect();
                let mut body = serde_json::json!({
                    "model": model_id,
                    "messages": msgs,
                    "stream": true,
                });
                if let Some(temp) = opts.temperature {
                    body["temperature"] = serde_json::json!(temp);
                }
                if let Some(max) = opts.max_tokens {
                    body["max_tokens"] = serde_json::json!(max);
                }
                if !opts.stop_sequences.is_empty() {
                    body["stop"] = serde_json::json!(opts.stop_sequences);
                }
                if matches!(opts.response_format, Some(crate::provider::ResponseFormat::Json)) {
                    body["response_format"] = serde_json::json!({"type": "json_object"});
                }
                if !opts.tools.is_empty() {
                    body["tools"] = serde_json::json!(
                        opts.tools
                            .iter()
                            .map(|t| serde_json::json!({
                                "type": "function",
                                "function": {
                                    "name": t.name,
                                    "description": t.description,
                                    "parameters": t.parameters,
                                }
                            }))
                            .collect::<Vec<_>>()
                    );
                }
                body["stream_options"] = serde_json::json!({"include_usage": true});
                body
            }
            ApiFormat::Anthropic => {
                let system: Vec<&str> = messages
                    .iter()
                    .filter(|m| m.role == Role::System)
                    .map(|m| m.content.as_str())
                    .collect();
                let msgs: Vec<_> = messages
                    .iter()
                    .filter(|m| m.role != Role::System)
                    .map(|m| {
                        let role = if m.role == Role::Assistant { "assistant" } else { "user" };
                        serde_json::json!({"role": role, "content": m.content})
                    })
                    .collect();
                let mut body = serde_json::json!({
                    "model": model_id,
                    "messages": msgs,
                    "stream": true,
                    "max_tokens": opts.max_tokens.unwrap_or(4096),
                });
                if !system.is_empty() {
                    body["system"] = serde_json::json!(system.join("\n\n"));
                }
                if let Some(temp) = opts.temperature {
                    body["temperature"] = serde_json::json!(temp);
                }
                if !opts.tools.is_empty() {
                    body["tools"] = serde_json::json!(
                        opts.tools
                            .iter()
                            .map(|t| serde_json::json!({
                                "name": t.name,
                                "description": t.description,
                                "input_schema": t.parameters,
                            }))
                            .collect::<Vec<_>>()
                    );
                }
                body
            }
        }
    }

    fn build_request(&self, body: &serde_json::Value) -> reqwest::RequestBuilder {
        match self.api_format {
            ApiFormat::OpenAi => self
                .client
                .post(&self.base_url)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("Content-Type", "application/json")
                .json(body),
            ApiFormat::Anthropic => self
                .client
                .post(&self.base_url)
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", "2023-06-01")
                .header("Content-Type", "application/json")
                .json(body),
        }
    }

    async fn dispatch(&self, messages: &[PromptMessage], model_id: &str, opts: &SendOptions) -> Result<Accumulated, DuhError> {
        let start = Instant::now();
        let body = self.build_body(messages, model_id, opts);
        let request = self.build_request(&body);

        let mut response = tokio::time::timeout(HEADERS_TIMEOUT, request.send())
            .await
            .map_err(|_| DuhError::ProviderTimeout {
                provider_id: self.provider_id.clone(),
                timeout_ms: start.elapsed().as_millis() as u64,
            })?
            .map_err(DuhError::from)?;

        let status = response.status();

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            return Err(DuhError::ProviderRateLimit {
                provider_id: self.provider_id.clone(),
                retry_after,
            });
        }

        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(DuhError::ProviderAuth {
                provider_id: self.provider_id.clone(),
                message: format!("{status}"),
            });
        }

        if status.is_server_error() {
            return Err(DuhError::ProviderOverloaded {
                provider_id: self.provider_id.clone(),
                message: format!("{status}"),
            });
        }

        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let truncated: String = text.chars().take(500).collect();
            return Err(DuhError::ProviderOverloaded {
                provider_id: self.provider_id.clone(),
                message: format!("{status}: {truncated}"),
            });
        }

        read_sse_accumulated(response, self.api_format, &self.provider_id, start).await
    }
}

#[derive(Deserialize)]
struct OpenAiChunk {
    #[serde(default)]
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Deserialize)]
struct OpenAiUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    #[serde(default)]
    delta: OpenAiDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct OpenAiDelta {
    content: Option<String>,
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<OpenAiToolCallDelta>,
}

#[derive(Deserialize)]
struct OpenAiToolCallDelta {
    index: usize,
    id: Option<String>,
    function: Option<OpenAiFunctionDelta>,
}

#[derive(Deserialize)]
struct OpenAiFunctionDelta {
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Deserialize)]
struct AnthropicEvent {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    index: Option<usize>,
    #[serde(default)]
    delta: Option<AnthropicDelta>,
    #[serde(default)]
    content_block: Option<AnthropicContentBlock>,
    #[serde(default)]
    message: Option<AnthropicMessageStart>,
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Deserialize)]
struct AnthropicContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    id: Option<String>,
    name: Option<String>,
}

#[derive(Deserialize)]
struct AnthropicMessageStart {
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Deserialize, Default)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    cache_read_input_tokens: u64,
    #[serde(default)]
    cache_creation_input_tokens: u64,
}

#[derive(Deserialize)]
struct AnthropicDelta {
    #[serde(rename = "type")]
    delta_type: Option<String>,
    text: Option<String>,
    partial_json: Option<String>,
    stop_reason: Option<String>,
}

/// Accumulator for a single `tool_use` content block (Anthropic) or
/// tool-call slot (OpenAI), built up across streamed deltas.
struct PendingToolCall {
    id: String,
    name: String,
    arguments: String,
}

/// Everything a single dispatch call accumulates across its SSE body:
/// text, any tool calls, token usage, and the terminal finish reason.
struct Accumulated {
    text: String,
    tool_calls: Vec<ToolCallData>,
    usage: TokenUsage,
    finish_reason: String,
    latency_ms: u64,
}

enum ParsedEvent {
    Text(String),
    ToolCallStart { index: usize, id: String, name: String },
    ToolCallArgsDelta { index: usize, fragment: String },
    Usage(TokenUsage),
    FinishReason(String),
    Done,
    Skip,
}

fn parse_sse_event(data: &str, api_format: ApiFormat) -> ParsedEvent {
    match api_format {
        ApiFormat::OpenAi => {
            if data.trim() == "[DONE]" {
                return ParsedEvent::Done;
            }
            let Ok(chunk) = serde_json::from_str::<OpenAiChunk>(data) else {
                return ParsedEvent::Skip;
            };
            if let Some(usage) = chunk.usage {
                return ParsedEvent::Usage(TokenUsage {
                    input_tokens: usage.prompt_tokens,
                    output_tokens: usage.completion_tokens,
                    cache_read_tokens: 0,
                    cache_write_tokens: 0,
                });
            }
            let Some(choice) = chunk.choices.into_iter().next() else {
                return ParsedEvent::Skip;
            };
            if let Some(reason) = choice.finish_reason {
                return ParsedEvent::FinishReason(reason);
            }
            if let Some(tc) = choice.delta.tool_calls.into_iter().next() {
                if let Some(id) = tc.id {
                    return ParsedEvent::ToolCallStart {
                        index: tc.index,
                        id,
                        name: tc.function.as_ref().and_then(|f| f.name.clone()).unwrap_or_default(),
                    };
                }
                if let Some(fragment) = tc.function.and_then(|f| f.arguments) {
                    return ParsedEvent::ToolCallArgsDelta { index: tc.index, fragment };
                }
                return ParsedEvent::Skip;
            }
            let mut text = String::new();
            if let Some(rc) = &choice.delta.reasoning_content
                && !rc.is_empty()
            {
                text.push_str(rc);
            }
            if let Some(c) = &choice.delta.content
                && !c.is_empty()
            {
                text.push_str(c);
            }
            if text.is_empty() { ParsedEvent::Skip } else { ParsedEvent::Text(text) }
        }
        ApiFormat::Anthropic => {
            let Ok(event) = serde_json::from_str::<AnthropicEvent>(data) else {
                return ParsedEvent::Skip;
            };
            match event.event_type.as_str() {
                "message_start" => {
                    if let Some(usage) = event.message.and_then(|m| m.usage) {
                        return ParsedEvent::Usage(TokenUsage {
                            input_tokens: usage.input_tokens,
                            output_tokens: usage.output_tokens,
                            cache_read_tokens: usage.cache_read_input_tokens,
                            cache_write_tokens: usage.cache_creation_input_tokens,
                        });
                    }
                    ParsedEvent::Skip
                }
                "message_delta" => {
                    if let Some(usage) = event.usage {
                        return ParsedEvent::Usage(TokenUsage {
                            input_tokens: usage.input_tokens,
                            output_tokens: usage.output_tokens,
                            cache_read_tokens: usage.cache_read_input_tokens,
                            cache_write_tokens: usage.cache_creation_input_tokens,
                        });
                    }
                    if let Some(reason) = event.delta.and_then(|d| d.stop_reason) {
                        return ParsedEvent::FinishReason(reason);
                    }
                    ParsedEvent::Skip
                }
                "message_stop" => ParsedEvent::Done,
                "content_block_start" => {
                    if let Some(block) = event.content_block
                        && block.block_type == "tool_use"
                    {
                        ParsedEvent::ToolCallStart {
                            index: event.index.unwrap_or(0),
                            id: block.id.unwrap_or_default(),
                            name: block.name.unwrap_or_default(),
                        }
                    } else {
                        ParsedEvent::Skip
                    }
                }
                "content_block_delta" => {
                    if let Some(delta) = event.delta {
                        if delta.delta_type.as_deref() == Some("text_delta")
                            && let Some(text) = delta.text
                            && !text.is_empty()
                        {
                            return ParsedEvent::Text(text);
                        }
                        if delta.delta_type.as_deref() == Some("input_json_delta")
                            && let Some(fragment) = delta.partial_json
                        {
                            return ParsedEvent::ToolCallArgsDelta { index: event.index.unwrap_or(0), fragment };
                        }
                    }
                    ParsedEvent::Skip
                }
                _ => ParsedEvent::Skip,
            }
        }
    }
}

/// Consumes the SSE body to completion, accumulating text, tool calls
/// (keyed by the wire's `index`, in first-seen order), and usage. Single
/// stall-timeout layer (60s without a data event); full multi-layer
/// timeout staging from the teacher's streaming dispatcher is not needed
/// here since providers in this crate have no cooperative-cancel caller.
async fn read_sse_accumulated(
    response: reqwest::Response,
    api_format: ApiFormat,
    provider_id: &str,
    start: Instant,
) -> Result<Accumulated, DuhError> {
    let mut stream = response.bytes_stream().eventsource();
    let mut text = String::new();
    let mut usage = TokenUsage::default();
    let mut finish_reason = "stop".to_string();
    let mut tool_order: Vec<usize> = Vec::new();
    let mut tool_calls: std::collections::HashMap<usize, PendingToolCall> = std::collections::HashMap::new();
    let mut last_chunk_at = tokio::time::Instant::now();

    loop {
        let elapsed_since_chunk = tokio::time::Instant::now().saturating_duration_since(last_chunk_at);
        let remaining = STALL_TIMEOUT.saturating_sub(elapsed_since_chunk);

        tokio::select! {
            _ = tokio::time::sleep(remaining) => {
                if text.is_empty() && tool_calls.is_empty() {
                    return Err(DuhError::ProviderTimeout { provider_id: provider_id.to_string(), timeout_ms: STALL_TIMEOUT.as_millis() as u64 });
                }
                break;
            }
            event = stream.next() => match event {
                Some(Ok(ev)) => {
                    last_chunk_at = tokio::time::Instant::now();
                    match parse_sse_event(&ev.data, api_format) {
                        ParsedEvent::Done => break,
                        ParsedEvent::Text(fragment) => {
                            if text.len() + fragment.len() > MAX_RESPONSE_BYTES {
                                return Err(DuhError::ProviderOverloaded {
                                    provider_id: provider_id.to_string(),
                                    message: format!("streaming response too large: >{MAX_RESPONSE_BYTES}B"),
                                });
                            }
                            text.push_str(&fragment);
                        }
                        ParsedEvent::ToolCallStart { index, id, name } => {
                            if !tool_calls.contains_key(&index) {
                                tool_order.push(index);
                            }
                            tool_calls.insert(index, PendingToolCall { id, name, arguments: String::new() });
                        }
                        ParsedEvent::ToolCallArgsDelta { index, fragment } => {
                            if let Some(pending) = tool_calls.get_mut(&index) {
                                pending.arguments.push_str(&fragment);
                            }
                        }
                        ParsedEvent::Usage(parsed_usage) => usage = parsed_usage,
                        ParsedEvent::FinishReason(reason) => finish_reason = reason,
                        ParsedEvent::Skip => {}
                    }
                }
                Some(Err(e)) => {
                    if text.is_empty() && tool_calls.is_empty() {
                        tracing::warn!(provider_id, "SSE stream error with no data: {e}");
                        return Err(DuhError::ProviderOverloaded {
                            provider_id: provider_id.to_string(),
                            message: format!("SSE stream error: {e}"),
                        });
                    }
                    tracing::warn!(provider_id, bytes = text.len(), "SSE stream error after partial data: {e}");
                    break;
                }
                None => {
                    if text.is_empty() && tool_calls.is_empty() {
                        return Err(DuhError::ProviderOverloaded {
                            provider_id: provider_id.to_string(),
                            message: "stream ended without completion marker".to_string(),
                        });
                    }
                    break;
                }
            },
        }
    }

    if text.is_empty() && tool_calls.is_empty() {
        return Err(DuhError::ProviderOverloaded {
            provider_id: provider_id.to_string(),
            message: "empty streaming response".to_string(),
        });
    }

    let tool_calls = tool_order
        .into_iter()
        .filter_map(|index| tool_calls.remove(&index))
        .map(|pending| ToolCallData { id: pending.id, name: pending.name, arguments: pending.arguments })
        .collect();

    Ok(Accumulated { text, tool_calls, usage, finish_reason, latency_ms: start.elapsed().as_millis() as u64 })
}

#[async_trait]
impl ModelProvider for HttpProvider {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    fn list_models(&self) -> Vec<ModelInfo> {
        self.models.clone()
    }

    async fn send(
        &self,
        messages: &[PromptMessage],
        model_id: &str,
        opts: &SendOptions,
    ) -> Result<ModelResponse, DuhError> {
        let model_info = self
            .models
            .iter()
            .find(|m| m.model_id == model_id)
            .cloned()
            .ok_or_else(|| DuhError::ModelNotFound(format!("{}:{model_id}", self.provider_id)))?;
        let accumulated = self.dispatch(messages, model_id, opts).await?;
        Ok(ModelResponse {
            content: accumulated.text,
            model_info,
            usage: accumulated.usage,
            finish_reason: accumulated.finish_reason,
            latency_ms: accumulated.latency_ms,
            tool_calls: accumulated.tool_calls,
        })
    }

    async fn stream(
        &self,
        messages: &[PromptMessage],
        model_id: &str,
        opts: &SendOptions,
    ) -> Result<BoxStream<'static, Result<StreamChunk, DuhError>>, DuhError> {
        // A one-shot accumulate-then-replay stream: this crate's engine
        // consumes whole responses per round, so a full per-token live
        // stream is not required; the final chunk always carries usage.
        let accumulated = self.dispatch(messages, model_id, opts).await?;
        let chunk = StreamChunk { text: accumulated.text, is_final: true, usage: Some(accumulated.usage) };
        Ok(stream::once(async move { Ok(chunk) }).boxed())
    }

    async fn health_check(&self) -> bool {
        self.client
            .get(&self.base_url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .is_ok()
    }
}
