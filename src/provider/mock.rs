use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};

use crate::error::DuhError;
use crate::provider::{
    ModelCapability, ModelInfo, ModelProvider, ModelResponse, PromptMessage, SendOptions,
    StreamChunk, ToolCallData, TokenUsage,
};

/// Deterministic in-memory provider used by tests. Not grounded on a
/// teacher file directly — squall always calls live CLIs/HTTP — but
/// supplements it per the original source's test-double pattern for
/// `ModelProvider`, so the consensus/decompose/scheduler/voting pipeline
/// is fully testable without live network access.
pub struct MockProvider {
    provider_id: String,
    models: Vec<ModelInfo>,
    /// Canned response keyed by model_id; falls back to echoing the last
    /// user message with a model-specific prefix when absent.
    responses: Mutex<HashMap<String, Vec<String>>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl MockProvider {
    pub fn new(provider_id: impl Into<String>, models: Vec<ModelInfo>) -> Self {
        Self {
            provider_id: provider_id.into(),
            models,
            responses: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Queue a sequence of canned responses for a given model_id; each
    /// call to `send` pops the next one, repeating the last once
    /// exhausted.
    pub fn queue_responses(&self, model_id: impl Into<String>, responses: Vec<String>) {
        self.responses.lock().unwrap().insert(model_id.into(), responses);
    }

    pub fn call_count(&self, model_id: &str) -> usize {
        *self.calls.lock().unwrap().get(model_id).unwrap_or(&0)
    }

    fn next_response(&self, model_id: &str, messages: &[PromptMessage]) -> String {
        let mut calls = self.calls.lock().unwrap();
        let idx = calls.entry(model_id.to_string()).or_insert(0);
        let queued = self.responses.lock().unwrap();
        let text = queued.get(model_id).and_then(|v| v.get(*idx).or_else(|| v.last())).cloned();
        *idx += 1;
        text.unwrap_or_else(|| {
            let last_user = messages
                .iter()
                .rev()
                .find(|m| matches!(m.role, crate::provider::Role::User))
                .map(|m| m.content.as_str())
                .unwrap_or("");
            format!("[{model_id}] acknowledges: {last_user}")
        })
    }
}

pub fn model_info(
    provider_id: &str,
    model_id: &str,
    input_cost_per_mtok: f64,
    output_cost_per_mtok: f64,
    proposer_eligible: bool,
) -> ModelInfo {
    ModelInfo {
        provider_id: provider_id.to_string(),
        model_id: model_id.to_string(),
        display_name: model_id.to_string(),
        capability: ModelCapability::full(),
        context_window: 128_000,
        max_output_tokens: 4096,
        input_cost_per_mtok,
        output_cost_per_mtok,
        is_local: false,
        proposer_eligible,
    }
}

#[async_trait]
impl ModelProvider for MockProvider {
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
        _opts: &SendOptions,
    ) -> Result<ModelResponse, DuhError> {
        let model_info = self
            .models
            .iter()
            .find(|m| m.model_id == model_id)
            .cloned()
            .ok_or_else(|| DuhError::ModelNotFound(format!("{}:{model_id}", self.provider_id)))?;
        let content = self.next_response(model_id, messages);
        Ok(ModelResponse {
            content,
            model_info,
            usage: TokenUsage {
                input_tokens: 100,
                output_tokens: 50,
                cache_read_tokens: 0,
                cache_write_tokens: 0,
            },
            finish_reason: "stop".to_string(),
            latency_ms: 1,
            tool_calls: Vec::<ToolCallData>::new(),
        })
    }

    async fn stream(
        &self,
        messages: &[PromptMessage],
        model_id: &str,
        opts: &SendOptions,
    ) -> Result<BoxStream<'static, Result<StreamChunk, DuhError>>, DuhError> {
        let response = self.send(messages, model_id, opts).await?;
        let chunk = StreamChunk {
            text: response.content,
            is_final: true,
            usage: Some(response.usage),
        };
        Ok(stream::once(async move { Ok(chunk) }).boxed())
    }

    async fn health_check(&self) -> bool {
        true
    }
}
