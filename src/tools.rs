use async_trait::async_trait;

use crate::error::DuhError;
use crate::provider::{ModelProvider, PromptMessage, ResponseFormat, SendOptions, TokenUsage, ToolCallData, ToolDefinition};

pub const DEFAULT_MAX_TOOL_ROUNDS: u32 = 5;

#[derive(Debug, Clone)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct ToolResult {
    pub content: String,
    pub is_error: bool,
}

/// The web-search / code-execution / file-read loop contract: a set of
/// named tools a model can invoke mid-generation. Individual tools are
/// external collaborators; this crate only drives the invoke loop.
#[async_trait]
pub trait ToolRegistry: Send + Sync {
    fn list_definitions(&self) -> Vec<ToolDefinition>;

    /// Never propagates — a failing tool call surfaces as a `ToolResult`
    /// with `is_error=true`, and the loop continues.
    async fn execute(&self, call: &ToolCall) -> ToolResult;
}

fn format_tool_result(name: &str, result: &ToolResult) -> String {
    if result.is_error {
        format!("Tool '{name}' error: {}", result.content)
    } else {
        format!("Tool '{name}' result: {}", result.content)
    }
}

async fn execute_tool_calls(registry: &dyn ToolRegistry, tool_calls: &[ToolCallData], log: &mut Vec<String>) -> Vec<String> {
    let mut results = Vec::with_capacity(tool_calls.len());
    for call_data in tool_calls {
        let arguments = serde_json::from_str(&call_data.arguments).unwrap_or(serde_json::Value::Null);
        let call = ToolCall {
            id: call_data.id.clone(),
            name: call_data.name.clone(),
            arguments,
        };
        log.push(format!("{}({})", call.name, call_data.arguments));
        let result = registry.execute(&call).await;
        results.push(format_tool_result(&call.name, &result));
    }
    results
}

fn add_usage(total: &mut TokenUsage, usage: &TokenUsage) {
    total.input_tokens += usage.input_tokens;
    total.output_tokens += usage.output_tokens;
    total.cache_read_tokens += usage.cache_read_tokens;
    total.cache_write_tokens += usage.cache_write_tokens;
}

/// Result of a tool-augmented send: the final text, the summed token
/// usage across every round the loop actually made (so callers can
/// record cost for the whole loop, not just the last call), and the
/// calls appended to this invocation's log.
pub struct ToolAugmentedResult {
    pub content: String,
    pub usage: TokenUsage,
    pub tool_calls_log: Vec<String>,
}

/// Sends a prompt with a tool-use loop: calls the model with tool
/// schemas, executes any tool calls the response carries, feeds results
/// back as a user message, and repeats until a text-only response
/// arrives or `max_tool_rounds` is exhausted. Every invocation is
/// appended to the returned `tool_calls_log`.
pub async fn tool_augmented_send(
    provider: &dyn ModelProvider,
    model_id: &str,
    messages: Vec<PromptMessage>,
    registry: &dyn ToolRegistry,
    max_tool_rounds: u32,
) -> Result<ToolAugmentedResult, DuhError> {
    let tool_defs = registry.list_definitions();
    let mut opts = SendOptions::new();
    opts.tools = tool_defs;
    opts.response_format = Some(ResponseFormat::Plain);

    let mut current_messages = messages;
    let mut usage = TokenUsage::default();
    let mut tool_calls_log = Vec::new();

    for _round in 0..max_tool_rounds {
        let response = provider.send(&current_messages, model_id, &opts).await?;
        add_usage(&mut usage, &response.usage);

        if response.tool_calls.is_empty() {
            return Ok(ToolAugmentedResult { content: response.content, usage, tool_calls_log });
        }

        let results = execute_tool_calls(registry, &response.tool_calls, &mut tool_calls_log).await;

        let assistant_content = if response.content.is_empty() {
            "(tool calls made)".to_string()
        } else {
            response.content
        };
        current_messages.push(PromptMessage::assistant(assistant_content));
        current_messages.push(PromptMessage::user(results.join("\n\n")));
    }

    // Max rounds reached — one final call, returned as-is even if it
    // still carries tool calls the loop will not execute.
    let response = provider.send(&current_messages, model_id, &opts).await?;
    add_usage(&mut usage, &response.usage);
    Ok(ToolAugmentedResult { content: response.content, usage, tool_calls_log })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::provider::mock::{model_info, MockProvider};

    struct EchoRegistry {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ToolRegistry for EchoRegistry {
        fn list_definitions(&self) -> Vec<ToolDefinition> {
            vec![ToolDefinition {
                name: "echo".to_string(),
                description: "echoes its input".to_string(),
                parameters: serde_json::json!({"type": "object"}),
            }]
        }

        async fn execute(&self, call: &ToolCall) -> ToolResult {
            self.calls.lock().unwrap().push(call.name.clone());
            ToolResult { content: "echoed".to_string(), is_error: false }
        }
    }

    #[tokio::test]
    async fn text_only_response_returns_immediately_without_tool_calls() {
        let provider = MockProvider::new("p1", vec![model_info("p1", "m1", 1.0, 1.0, true)]);
        provider.queue_responses("m1", vec!["plain answer".to_string()]);
        let registry = EchoRegistry { calls: Mutex::new(Vec::new()) };

        let result = tool_augmented_send(
            &provider,
            "m1",
            vec![PromptMessage::user("hi")],
            &registry,
            DEFAULT_MAX_TOOL_ROUNDS,
        )
        .await
        .unwrap();

        assert_eq!(result.content, "plain answer");
        assert!(result.tool_calls_log.is_empty());
    }
}
