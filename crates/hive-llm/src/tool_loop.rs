use futures::future::join_all;
use tracing::{debug, warn};

use hive_core::error::Result;
use hive_core::traits::{LlmProvider, ToolExecutor};
use hive_core::types::*;

pub const MAX_ITERATIONS_MESSAGE: &str = "Max tool iterations reached";

/// What the bounded tool loop produced.
#[derive(Debug, Clone)]
pub struct ToolLoopResult {
    /// The terminal response. When the ceiling is hit this is a synthetic
    /// response with `StopReason::MaxIterations`.
    pub response: LlmResponse,
    pub iterations: usize,
    pub tool_calls: Vec<(ToolUse, ToolResult)>,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl ToolLoopResult {
    pub fn hit_ceiling(&self) -> bool {
        self.response.stop_reason == StopReason::MaxIterations
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Run the model, executing any requested tools and feeding their results
/// back, until it answers without tool calls or `max_iterations` is hit.
///
/// Tool failures are returned to the model as error results; only provider
/// errors propagate.
pub async fn complete_with_tools(
    provider: &dyn LlmProvider,
    mut messages: Vec<ChatMessage>,
    system: Option<String>,
    tools: &dyn ToolExecutor,
    max_iterations: usize,
    max_tokens: Option<u32>,
) -> Result<ToolLoopResult> {
    let definitions = tools.definitions();
    let mut tool_calls = Vec::new();
    let mut input_tokens = 0;
    let mut output_tokens = 0;
    let mut last_model = String::new();

    for iteration in 0..max_iterations {
        let mut request = CompletionRequest::new(messages.clone()).with_tools(definitions.clone());
        request.system = system.clone();
        request.max_tokens = max_tokens;

        let response = provider.complete(request).await?;
        input_tokens += response.input_tokens;
        output_tokens += response.output_tokens;
        last_model = response.model.clone();

        if response.tool_uses.is_empty() {
            debug!(iteration, "Tool loop finished");
            return Ok(ToolLoopResult {
                response,
                iterations: iteration + 1,
                tool_calls,
                input_tokens,
                output_tokens,
            });
        }

        messages.push(response.assistant_message());

        let futures: Vec<_> = response
            .tool_uses
            .iter()
            .map(|tu| tools.execute(tu.clone()))
            .collect();
        let results = join_all(futures).await;

        let mut blocks = Vec::with_capacity(results.len());
        for (tu, result) in response.tool_uses.into_iter().zip(results) {
            debug!(tool = %tu.name, is_error = result.is_error, "Tool call in model loop");
            blocks.push((tu.id.clone(), result.clone()));
            tool_calls.push((tu, result));
        }
        messages.push(ChatMessage::tool_results(blocks));
    }

    warn!(max_iterations, "Tool loop hit iteration ceiling");
    Ok(ToolLoopResult {
        response: LlmResponse {
            content: MAX_ITERATIONS_MESSAGE.to_string(),
            model: last_model,
            input_tokens,
            output_tokens,
            stop_reason: StopReason::MaxIterations,
            tool_uses: vec![],
        },
        iterations: max_iterations,
        tool_calls,
        input_tokens,
        output_tokens,
    })
}
