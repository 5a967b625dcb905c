use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use futures::future::BoxFuture;
use futures::FutureExt;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use hive_core::error::Result;
use hive_core::goal::Goal;
use hive_core::traits::{LlmProvider, ToolExecutor};
use hive_core::types::{new_id, ChatMessage, ToolUse};
use hive_llm::tool_loop::{complete_with_tools, MAX_ITERATIONS_MESSAGE};

use crate::plan::{ActionSpec, ActionType, Plan, PlanStep};

/// What executing one step produced. Failures are data, not errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecutionResult {
    pub success: bool,
    #[serde(default)]
    pub output: serde_json::Value,
    #[serde(default)]
    pub error: Option<String>,
    /// Executor-specific detail (tool content, model stats, child run).
    #[serde(default)]
    pub raw: serde_json::Value,
    pub latency_ms: u64,
    #[serde(default)]
    pub tokens_used: u64,
}

impl StepExecutionResult {
    pub fn success(output: serde_json::Value) -> Self {
        Self {
            success: true,
            output,
            error: None,
            raw: serde_json::Value::Null,
            latency_ms: 0,
            tokens_used: 0,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: serde_json::Value::Null,
            error: Some(error.into()),
            raw: serde_json::Value::Null,
            latency_ms: 0,
            tokens_used: 0,
        }
    }

    pub fn with_raw(mut self, raw: serde_json::Value) -> Self {
        self.raw = raw;
        self
    }

    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.tokens_used = tokens;
        self
    }

    /// Short description used in decision outcomes and logs.
    pub fn summary(&self) -> String {
        if self.success {
            let text = match &self.output {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            truncate(&text, 200)
        } else {
            format!("failed: {}", self.error.as_deref().unwrap_or("unknown error"))
        }
    }
}

/// Result of a nested run, folded into the parent step's outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubplanReport {
    pub completed: bool,
    pub status: String,
    pub run_id: String,
    pub decisions: usize,
    pub output: serde_json::Value,
    pub error: Option<String>,
}

/// Runs a nested plan on a fresh engine.
pub trait SubplanRunner: Send + Sync {
    fn run_subplan(&self, goal: Goal, plan: Plan) -> BoxFuture<'static, Result<SubplanReport>>;
}

/// Executes a single plan step against the bound tool and model capabilities.
pub struct Worker {
    tools: Arc<dyn ToolExecutor>,
    llm: Option<Arc<dyn LlmProvider>>,
    llm_max_iterations: usize,
    max_tokens: Option<u32>,
    subplans: Option<Arc<dyn SubplanRunner>>,
}

impl Worker {
    pub fn new(tools: Arc<dyn ToolExecutor>) -> Self {
        Self {
            tools,
            llm: None,
            llm_max_iterations: 10,
            max_tokens: None,
            subplans: None,
        }
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmProvider>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.llm_max_iterations = max_iterations;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_subplans(mut self, runner: Arc<dyn SubplanRunner>) -> Self {
        self.subplans = Some(runner);
        self
    }

    /// Execute `step` with `context` available for `{{key}}` substitution.
    pub async fn execute(
        &self,
        step: &PlanStep,
        context: &BTreeMap<String, serde_json::Value>,
    ) -> StepExecutionResult {
        self.execute_action(&step.id, &step.action, context).await
    }

    /// Execute an explicit action, used when a reviewer modified the params.
    pub async fn execute_action(
        &self,
        step_id: &str,
        action: &ActionSpec,
        context: &BTreeMap<String, serde_json::Value>,
    ) -> StepExecutionResult {
        let start = Instant::now();
        let fut = AssertUnwindSafe(self.dispatch(action, context)).catch_unwind();
        let mut result = match fut.await {
            Ok(r) => r,
            Err(panic) => {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                warn!(step_id = %step_id, panic = %msg, "Step executor panicked");
                StepExecutionResult::failure(format!("executor panicked: {}", msg))
            }
        };
        result.latency_ms = start.elapsed().as_millis() as u64;
        debug!(
            step_id = %step_id,
            action = %action.action_type,
            success = result.success,
            latency_ms = result.latency_ms,
            "Step executed"
        );
        result
    }

    async fn dispatch(
        &self,
        action: &ActionSpec,
        context: &BTreeMap<String, serde_json::Value>,
    ) -> StepExecutionResult {
        match action.action_type {
            ActionType::ToolCall => self.run_tool(action, context).await,
            ActionType::LlmQuery => self.run_llm(action, context).await,
            ActionType::Subplan => self.run_subplan(action, context).await,
            ActionType::HumanApproval => {
                StepExecutionResult::failure("human_approval steps are handled by the approval gate")
            }
        }
    }

    async fn run_tool(
        &self,
        action: &ActionSpec,
        context: &BTreeMap<String, serde_json::Value>,
    ) -> StepExecutionResult {
        let Some(name) = action.tool_name.as_deref() else {
            return StepExecutionResult::failure("tool_call step has no tool_name");
        };
        let input = render_value(&action.tool_args, context);
        let call = ToolUse {
            id: new_id(),
            name: name.to_string(),
            input: input.clone(),
        };
        let result = self.tools.execute(call).await;
        let raw = serde_json::json!({
            "tool": name,
            "input": input,
            "content": result.content,
            "is_error": result.is_error,
        });

        if result.is_error {
            let message = match result.value() {
                serde_json::Value::Object(map) => map
                    .get("error")
                    .and_then(|e| e.as_str())
                    .map(String::from)
                    .unwrap_or_else(|| result.content.clone()),
                _ => result.content.clone(),
            };
            StepExecutionResult::failure(message).with_raw(raw)
        } else {
            StepExecutionResult::success(result.value()).with_raw(raw)
        }
    }

    async fn run_llm(
        &self,
        action: &ActionSpec,
        context: &BTreeMap<String, serde_json::Value>,
    ) -> StepExecutionResult {
        let Some(llm) = &self.llm else {
            return StepExecutionResult::failure("llm_query step but no model is configured");
        };
        let Some(prompt) = action.prompt.as_deref() else {
            return StepExecutionResult::failure("llm_query step has no prompt");
        };
        let prompt = render_template(prompt, context);
        let system = action
            .system_prompt
            .as_deref()
            .map(|s| render_template(s, context));

        let result = match complete_with_tools(
            llm.as_ref(),
            vec![ChatMessage::user(prompt)],
            system,
            self.tools.as_ref(),
            self.llm_max_iterations,
            self.max_tokens,
        )
        .await
        {
            Ok(r) => r,
            Err(e) => return StepExecutionResult::failure(e.to_string()),
        };

        let raw = serde_json::json!({
            "model": result.response.model,
            "iterations": result.iterations,
            "tool_calls": result.tool_calls.len(),
            "stop_reason": result.response.stop_reason,
            "input_tokens": result.input_tokens,
            "output_tokens": result.output_tokens,
        });
        let tokens = result.total_tokens();

        if result.hit_ceiling() {
            return StepExecutionResult::failure(MAX_ITERATIONS_MESSAGE)
                .with_raw(raw)
                .with_tokens(tokens);
        }

        let text = result.response.content.trim();
        let output = serde_json::from_str(text)
            .unwrap_or_else(|_| serde_json::Value::String(text.to_string()));
        StepExecutionResult::success(output)
            .with_raw(raw)
            .with_tokens(tokens)
    }

    async fn run_subplan(
        &self,
        action: &ActionSpec,
        context: &BTreeMap<String, serde_json::Value>,
    ) -> StepExecutionResult {
        let Some(spec) = &action.subplan else {
            return StepExecutionResult::failure("subplan step has no subplan");
        };
        let Some(runner) = &self.subplans else {
            return StepExecutionResult::failure("subplan depth limit reached");
        };

        let goal = spec.goal.clone();
        let mut plan = Plan::new(&goal, spec.steps.clone());
        plan.context = context.clone();

        match runner.run_subplan(goal, plan).await {
            Ok(report) => {
                let raw = serde_json::to_value(&report).unwrap_or_default();
                if report.completed {
                    StepExecutionResult::success(report.output).with_raw(raw)
                } else {
                    let error = report
                        .error
                        .unwrap_or_else(|| format!("subplan ended {}", report.status));
                    StepExecutionResult::failure(error).with_raw(raw)
                }
            }
            Err(e) => StepExecutionResult::failure(e.to_string()),
        }
    }
}

fn template_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z0-9_\-]+(?:\.[A-Za-z0-9_\-]+)*)\s*\}\}")
            .expect("template pattern is valid")
    })
}

fn lookup<'a>(
    path: &str,
    context: &'a BTreeMap<String, serde_json::Value>,
) -> Option<&'a serde_json::Value> {
    let mut parts = path.split('.');
    let mut current = context.get(parts.next()?)?;
    for part in parts {
        current = match current {
            serde_json::Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            other => other.get(part)?,
        };
    }
    Some(current)
}

/// Replace `{{key}}` (or `{{key.field}}`) with values from `context`.
/// Unknown keys are left untouched.
pub fn render_template(text: &str, context: &BTreeMap<String, serde_json::Value>) -> String {
    template_pattern()
        .replace_all(text, |caps: &regex::Captures| match lookup(&caps[1], context) {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => caps[0].to_string(),
        })
        .into_owned()
}

/// Render templates inside every string of a JSON value. A string that is
/// exactly one placeholder takes the referenced value with its type.
pub fn render_value(
    value: &serde_json::Value,
    context: &BTreeMap<String, serde_json::Value>,
) -> serde_json::Value {
    match value {
        serde_json::Value::String(s) => {
            if let Some(caps) = template_pattern().captures(s) {
                if caps[0].len() == s.trim().len() {
                    if let Some(v) = lookup(&caps[1], context) {
                        return v.clone();
                    }
                }
            }
            serde_json::Value::String(render_template(s, context))
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(|v| render_value(v, context)).collect())
        }
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render_value(v, context)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{}...", cut)
    }
}
