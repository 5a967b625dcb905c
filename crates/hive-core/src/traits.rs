use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::*;

/// Model capability: a single non-streaming completion.
pub trait LlmProvider: Send + Sync + 'static {
    /// Provider name (e.g., "anthropic").
    fn name(&self) -> &str;

    /// Send a completion request.
    fn complete(&self, request: CompletionRequest) -> BoxFuture<'_, Result<LlmResponse>>;
}

/// A single named capability with a static schema.
pub trait Tool: Send + Sync + 'static {
    /// Tool name (used in LLM tool calls and plan steps).
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str;

    /// JSON Schema for tool input.
    fn input_schema(&self) -> serde_json::Value;

    /// Execute the tool with the given input.
    fn execute(&self, input: serde_json::Value) -> BoxFuture<'_, Result<ToolResult>>;

    /// Timeout in seconds for this tool.
    fn timeout_secs(&self) -> u64 {
        30
    }
}

/// Tool executor boundary.
///
/// Implementations never fail: unknown tools and executor errors are
/// reported as error results so callers can treat them as data.
pub trait ToolExecutor: Send + Sync + 'static {
    /// Execute a tool call.
    fn execute(&self, call: ToolUse) -> BoxFuture<'_, ToolResult>;

    /// Definitions of every tool this executor can run.
    fn definitions(&self) -> Vec<ToolDefinition>;
}
