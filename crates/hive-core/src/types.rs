use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::approval::{ApprovalDecision, ApprovalRequest};
use crate::decision::{Decision, Judgment};
use crate::run::{Problem, RunStatus};

/// Generate a fresh identifier for runs, decisions, and plans.
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Generate a short identifier (first 8 hex chars) for protocol messages.
pub fn short_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}

/// Role in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single content block in a message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },

    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },

    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: bool,
    },
}

/// A chat message in the conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl ChatMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    /// Bundle several tool results into one user turn.
    pub fn tool_results(results: Vec<(String, ToolResult)>) -> Self {
        Self {
            role: Role::User,
            content: results
                .into_iter()
                .map(|(tool_use_id, r)| ContentBlock::ToolResult {
                    tool_use_id,
                    content: r.content,
                    is_error: r.is_error,
                })
                .collect(),
        }
    }

    /// Extract all text content from this message.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

/// Stop reason reported for a completion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    StopSequence,
    /// The bounded tool loop hit its iteration ceiling.
    MaxIterations,
}

/// A tool invocation requested by a model or a plan step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolUse {
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
}

/// Result of a tool execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub content: String,
    pub is_error: bool,
}

impl ToolResult {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }

    /// Structured error payload: `{"error": message}`.
    pub fn error_json(message: impl Into<String>) -> Self {
        Self::error(serde_json::json!({ "error": message.into() }).to_string())
    }

    /// Content parsed as JSON, falling back to a plain string value.
    pub fn value(&self) -> serde_json::Value {
        serde_json::from_str(&self.content)
            .unwrap_or_else(|_| serde_json::Value::String(self.content.clone()))
    }
}

/// Tool definition for sending to the LLM.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    #[serde(default = "empty_schema")]
    pub input_schema: serde_json::Value,
}

fn empty_schema() -> serde_json::Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

/// A single non-streaming completion request.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub system: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
    pub max_tokens: Option<u32>,
}

impl CompletionRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            ..Default::default()
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// A model response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    pub content: String,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub stop_reason: StopReason,
    #[serde(default)]
    pub tool_uses: Vec<ToolUse>,
}

impl LlmResponse {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    /// The assistant turn that produced this response, tool calls included.
    pub fn assistant_message(&self) -> ChatMessage {
        let mut content = Vec::new();
        if !self.content.is_empty() {
            content.push(ContentBlock::Text {
                text: self.content.clone(),
            });
        }
        for tu in &self.tool_uses {
            content.push(ContentBlock::ToolUse {
                id: tu.id.clone(),
                name: tu.name.clone(),
                input: tu.input.clone(),
            });
        }
        ChatMessage {
            role: Role::Assistant,
            content,
        }
    }
}

/// Runtime event broadcast to all subscribers.
#[derive(Debug, Clone)]
pub enum RuntimeEvent {
    /// A run started for a goal.
    RunStarted {
        run_id: String,
        goal_id: String,
        goal: String,
    },
    /// A step was handed to the worker.
    StepDispatched {
        run_id: String,
        step_id: String,
        decision_id: String,
        attempt: u32,
    },
    /// A step finished executing (before judgment).
    StepCompleted {
        run_id: String,
        step_id: String,
        success: bool,
        latency_ms: u64,
    },
    /// The judge decided what to do after a step.
    JudgmentMade {
        run_id: String,
        step_id: String,
        judgment: Judgment,
    },
    /// A decision was sealed with its outcome.
    DecisionRecorded { decision: Box<Decision> },
    /// A human approval was requested.
    ApprovalRequested { request: ApprovalRequest },
    /// A pending approval was resolved.
    ApprovalResolved {
        correlation_id: String,
        decision: ApprovalDecision,
    },
    /// The remaining plan was regenerated.
    Replanned {
        run_id: String,
        revision: u32,
        discarded: Vec<String>,
        added: Vec<String>,
    },
    /// A terminal failure record was attached to a run.
    ProblemReported { run_id: String, problem: Problem },
    /// A run parked on pending approvals. It may be resumed later.
    RunSuspended {
        run_id: String,
        pending: Vec<String>,
        decisions: usize,
    },
    /// A run reached a terminal status.
    RunCompleted {
        run_id: String,
        status: RunStatus,
        decisions: usize,
        duration_ms: u64,
    },
    /// An orchestration protocol message was emitted.
    MessageSent {
        id: String,
        message_type: String,
        from_agent: Option<String>,
        to_agent: Option<String>,
        intent: String,
    },
}

/// Timestamp helper used across records.
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_id_length() {
        let id = short_id();
        assert_eq!(id.len(), 8);
        assert_ne!(id, short_id());
    }

    #[test]
    fn test_tool_result_value_parses_json() {
        let r = ToolResult::success(r#"{"answer": 42}"#);
        assert_eq!(r.value()["answer"], 42);

        let r = ToolResult::success("plain text");
        assert_eq!(r.value(), serde_json::json!("plain text"));
    }

    #[test]
    fn test_error_json_shape() {
        let r = ToolResult::error_json("Unknown tool: nope");
        assert!(r.is_error);
        assert_eq!(r.value()["error"], "Unknown tool: nope");
    }

    #[test]
    fn test_assistant_message_includes_tool_uses() {
        let resp = LlmResponse {
            content: "let me check".into(),
            model: "m".into(),
            input_tokens: 3,
            output_tokens: 4,
            stop_reason: StopReason::ToolUse,
            tool_uses: vec![ToolUse {
                id: "tu_1".into(),
                name: "lookup".into(),
                input: serde_json::json!({"q": "x"}),
            }],
        };
        let msg = resp.assistant_message();
        assert_eq!(msg.role, Role::Assistant);
        assert_eq!(msg.content.len(), 2);
        assert_eq!(msg.text(), "let me check");
        assert_eq!(resp.total_tokens(), 7);
    }

    #[test]
    fn test_tool_definition_default_schema() {
        let def: ToolDefinition =
            serde_json::from_str(r#"{"name": "t", "description": "d"}"#).unwrap();
        assert_eq!(def.input_schema["type"], "object");
    }
}
