//! Shared mocks and fixtures for Hive tests.
//!
//! `MockProvider` replays a scripted sequence of model responses and
//! records every request. `FnExecutor` is a closure-backed tool executor
//! that records every call it receives.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use futures::future::BoxFuture;

use hive_core::error::{HiveError, Result};
use hive_core::goal::{CriterionType, Goal, SuccessCriterion};
use hive_core::traits::{LlmProvider, ToolExecutor};
use hive_core::types::*;

enum Scripted {
    Response(LlmResponse),
    Error(String),
}

/// Scripted model provider.
pub struct MockProvider {
    script: Mutex<VecDeque<Scripted>>,
    /// Text returned once the script is exhausted. None means error out.
    repeat: Option<String>,
    requests: Mutex<Vec<CompletionRequest>>,
    calls: AtomicUsize,
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            repeat: None,
            requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    /// A provider that answers every request with the same text.
    pub fn always(text: impl Into<String>) -> Self {
        let mut p = Self::new();
        p.repeat = Some(text.into());
        p
    }

    pub fn with_text(self, text: impl Into<String>) -> Self {
        self.with_response(text_response(text))
    }

    pub fn with_tool_use(self, name: impl Into<String>, input: serde_json::Value) -> Self {
        let n = self.script.lock().unwrap().len();
        self.with_response(LlmResponse {
            content: String::new(),
            model: "mock-model".into(),
            input_tokens: 10,
            output_tokens: 5,
            stop_reason: StopReason::ToolUse,
            tool_uses: vec![ToolUse {
                id: format!("tu_{}", n),
                name: name.into(),
                input,
            }],
        })
    }

    pub fn with_error(self, message: impl Into<String>) -> Self {
        self.script
            .lock()
            .unwrap()
            .push_back(Scripted::Error(message.into()));
        self
    }

    pub fn with_response(self, response: LlmResponse) -> Self {
        self.script
            .lock()
            .unwrap()
            .push_back(Scripted::Response(response));
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn text_response(text: impl Into<String>) -> LlmResponse {
    LlmResponse {
        content: text.into(),
        model: "mock-model".into(),
        input_tokens: 10,
        output_tokens: 5,
        stop_reason: StopReason::EndTurn,
        tool_uses: vec![],
    }
}

impl LlmProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn complete(&self, request: CompletionRequest) -> BoxFuture<'_, Result<LlmResponse>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().unwrap().push(request);
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(Scripted::Response(r)) => Ok(r),
                Some(Scripted::Error(e)) => Err(HiveError::LlmRequest(e)),
                None => match &self.repeat {
                    Some(text) => Ok(text_response(text.clone())),
                    None => Err(HiveError::LlmRequest("mock script exhausted".into())),
                },
            }
        })
    }
}

type ToolFn = Box<dyn Fn(serde_json::Value) -> Result<String> + Send + Sync>;

/// Closure-backed tool executor that records calls.
pub struct FnExecutor {
    tools: BTreeMap<String, ToolFn>,
    calls: Mutex<Vec<ToolUse>>,
}

impl FnExecutor {
    pub fn new() -> Self {
        Self {
            tools: BTreeMap::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_tool<F>(mut self, name: impl Into<String>, func: F) -> Self
    where
        F: Fn(serde_json::Value) -> Result<String> + Send + Sync + 'static,
    {
        self.tools.insert(name.into(), Box::new(func));
        self
    }

    /// Every call received, in order.
    pub fn calls(&self) -> Vec<ToolUse> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, name: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.name == name)
            .count()
    }
}

impl Default for FnExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolExecutor for FnExecutor {
    fn execute(&self, call: ToolUse) -> BoxFuture<'_, ToolResult> {
        Box::pin(async move {
            self.calls.lock().unwrap().push(call.clone());
            match self.tools.get(&call.name) {
                Some(f) => match f(call.input) {
                    Ok(content) => ToolResult::success(content),
                    Err(e) => ToolResult::error_json(e.to_string()),
                },
                None => ToolResult::error_json(format!("Unknown tool: {}", call.name)),
            }
        })
    }

    fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .keys()
            .map(|name| ToolDefinition {
                name: name.clone(),
                description: format!("test tool {}", name),
                input_schema: serde_json::json!({"type": "object"}),
            })
            .collect()
    }
}

/// A goal with no criteria.
pub fn simple_goal(description: &str) -> Goal {
    Goal::new("test-goal", description)
}

/// A goal whose output must contain `pattern`.
pub fn goal_expecting(description: &str, pattern: &str) -> Goal {
    Goal::new("test-goal", description).with_criterion(SuccessCriterion {
        id: "contains".into(),
        criterion_type: CriterionType::OutputContains {
            pattern: pattern.into(),
            case_sensitive: false,
        },
        weight: 1.0,
        description: format!("output contains {}", pattern),
    })
}

/// Tool failure helper for closures.
pub fn tool_error(tool: &str, message: &str) -> HiveError {
    HiveError::ToolExecution {
        tool: tool.into(),
        message: message.into(),
    }
}
