pub mod http;
pub mod mock;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::DuhError;

/// Fixed capability set a model advertises. A bitmask or a fixed struct
/// of booleans both satisfy the contract; this crate uses the struct form
/// since no example in the corpus pulls in the `bitflags` crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ModelCapability {
    pub text: bool,
    pub streaming: bool,
    pub tool_use: bool,
    pub vision: bool,
    pub json_mode: bool,
    pub system_prompt: bool,
}

impl ModelCapability {
    pub const fn text_only() -> Self {
        Self {
            text: true,
            streaming: false,
            tool_use: false,
            vision: false,
            json_mode: false,
            system_prompt: true,
        }
    }

    pub const fn full() -> Self {
        Self {
            text: true,
            streaming: true,
            tool_use: true,
            vision: false,
            json_mode: true,
            system_prompt: true,
        }
    }
}

/// Static description of a model registered with a provider. Immutable
/// once constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub provider_id: String,
    pub model_id: String,
    pub display_name: String,
    pub capability: ModelCapability,
    pub context_window: u64,
    pub max_output_tokens: u64,
    pub input_cost_per_mtok: f64,
    pub output_cost_per_mtok: f64,
    pub is_local: bool,
    pub proposer_eligible: bool,
}

impl ModelInfo {
    /// Canonical `provider_id:model_id` identifier used for routing.
    pub fn model_ref(&self) -> String {
        format!("{}:{}", self.provider_id, self.model_id)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_write_tokens: u64,
}

impl TokenUsage {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: Role,
    pub content: String,
}

impl PromptMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallData {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseFormat {
    Plain,
    Json,
}

#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub max_tokens: Option<u64>,
    pub temperature: Option<f64>,
    pub stop_sequences: Vec<String>,
    pub response_format: Option<ResponseFormat>,
    pub tools: Vec<ToolDefinition>,
}

impl SendOptions {
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone)]
pub struct ModelResponse {
    pub content: String,
    pub model_info: ModelInfo,
    pub usage: TokenUsage,
    pub finish_reason: String,
    pub latency_ms: u64,
    pub tool_calls: Vec<ToolCallData>,
}

#[derive(Debug, Clone)]
pub struct StreamChunk {
    pub text: String,
    pub is_final: bool,
    pub usage: Option<TokenUsage>,
}

/// Uniform contract every backend — HTTP vendor API, mock, or any future
/// adapter — must satisfy. Trait-object-friendly (`Arc<dyn ModelProvider>`)
/// since the provider manager and consensus engine hold a heterogeneous set
/// of these behind one type.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    fn provider_id(&self) -> &str;

    /// The full `ModelInfo` set for this adapter. Deterministic within a
    /// session (models don't appear/disappear mid-run).
    fn list_models(&self) -> Vec<ModelInfo>;

    async fn send(
        &self,
        messages: &[PromptMessage],
        model_id: &str,
        opts: &SendOptions,
    ) -> Result<ModelResponse, DuhError>;

    async fn stream(
        &self,
        messages: &[PromptMessage],
        model_id: &str,
        opts: &SendOptions,
    ) -> Result<BoxStream<'static, Result<StreamChunk, DuhError>>, DuhError>;

    /// Never raises; a failed health probe simply yields `false`.
    async fn health_check(&self) -> bool;
}
