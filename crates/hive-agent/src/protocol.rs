use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use hive_core::error::{HiveError, Result};
use hive_core::run::Problem;
use hive_core::types::short_id;

/// Kinds of messages exchanged between the orchestrator and agents.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Work sent to an agent (or the root request from the user).
    Request,
    Response,
    /// One agent passing work to another.
    Handoff,
    Broadcast,
    CapabilityCheck,
    CapabilityResponse,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Response => "response",
            Self::Handoff => "handoff",
            Self::Broadcast => "broadcast",
            Self::CapabilityCheck => "capability_check",
            Self::CapabilityResponse => "capability_response",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One message in a dispatch. `from_agent = None` means the user or the
/// orchestrator itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMessage {
    pub id: String,
    pub message_type: MessageType,
    #[serde(default)]
    pub from_agent: Option<String>,
    #[serde(default)]
    pub to_agent: Option<String>,
    pub intent: String,
    #[serde(default)]
    pub content: serde_json::Value,
    #[serde(default = "default_requires_response")]
    pub requires_response: bool,
    /// Message this one answers or continues.
    #[serde(default)]
    pub parent_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

fn default_requires_response() -> bool {
    true
}

impl AgentMessage {
    pub fn new(message_type: MessageType, intent: impl Into<String>, content: serde_json::Value) -> Self {
        Self {
            id: short_id(),
            message_type,
            from_agent: None,
            to_agent: None,
            intent: intent.into(),
            content,
            requires_response: true,
            parent_id: None,
            timestamp: Utc::now(),
            metadata: BTreeMap::new(),
        }
    }

    /// Root request from the user.
    pub fn request(intent: impl Into<String>, content: serde_json::Value) -> Self {
        Self::new(MessageType::Request, intent, content)
    }

    pub fn sender(mut self, agent: impl Into<String>) -> Self {
        self.from_agent = Some(agent.into());
        self
    }

    pub fn recipient(mut self, agent: impl Into<String>) -> Self {
        self.to_agent = Some(agent.into());
        self
    }

    pub fn in_reply_to(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Build a reply addressed back to this message's sender.
    pub fn reply(
        &self,
        from_agent: impl Into<String>,
        content: serde_json::Value,
        message_type: MessageType,
    ) -> AgentMessage {
        AgentMessage {
            id: short_id(),
            message_type,
            from_agent: Some(from_agent.into()),
            to_agent: self.from_agent.clone(),
            intent: format!("Reply to: {}", self.intent),
            content,
            requires_response: false,
            parent_id: Some(self.id.clone()),
            timestamp: Utc::now(),
            metadata: BTreeMap::new(),
        }
    }

    /// Text used for keyword matching: intent plus content.
    pub fn text(&self) -> String {
        match &self.content {
            serde_json::Value::Null => self.intent.clone(),
            serde_json::Value::String(s) => format!("{} {}", self.intent, s),
            other => format!("{} {}", self.intent, other),
        }
    }
}

/// Append-only message log for one dispatch.
///
/// Every message with a `parent_id` must reference a message already in
/// the trace, so threads can always be walked back to the root.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageTrace {
    messages: Vec<AgentMessage>,
}

impl MessageTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: AgentMessage) -> Result<()> {
        if let Some(parent) = &message.parent_id {
            if !self.messages.iter().any(|m| &m.id == parent) {
                return Err(HiveError::BrokenThread {
                    id: message.id.clone(),
                    parent: parent.clone(),
                });
            }
        }
        self.messages.push(message);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&AgentMessage> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn messages(&self) -> &[AgentMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Chain from `id` back to the root, nearest first.
    pub fn thread(&self, id: &str) -> Vec<&AgentMessage> {
        let mut chain = Vec::new();
        let mut current = self.get(id);
        while let Some(message) = current {
            chain.push(message);
            current = message.parent_id.as_deref().and_then(|p| self.get(p));
        }
        chain
    }

    /// Agents that were sent work (`request` or `handoff`).
    pub fn invoked_agents(&self) -> Vec<String> {
        let mut agents: Vec<String> = Vec::new();
        for m in &self.messages {
            if matches!(m.message_type, MessageType::Request | MessageType::Handoff) {
                if let Some(to) = &m.to_agent {
                    if !agents.contains(to) {
                        agents.push(to.clone());
                    }
                }
            }
        }
        agents
    }

    pub fn into_messages(self) -> Vec<AgentMessage> {
        self.messages
    }
}

/// How well an agent thinks it fits a request, weakest first.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityLevel {
    CannotHandle,
    Uncertain,
    CanHandle,
    BestFit,
}

impl CapabilityLevel {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().replace(|c: char| c == ' ' || c == '-', "_").as_str() {
            "cannot_handle" => Some(Self::CannotHandle),
            "uncertain" => Some(Self::Uncertain),
            "can_handle" => Some(Self::CanHandle),
            "best_fit" => Some(Self::BestFit),
            _ => None,
        }
    }
}

impl std::fmt::Display for CapabilityLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::CannotHandle => "cannot_handle",
            Self::Uncertain => "uncertain",
            Self::CanHandle => "can_handle",
            Self::BestFit => "best_fit",
        };
        f.write_str(s)
    }
}

/// An agent's answer to a capability check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityResponse {
    pub agent_name: String,
    pub level: CapabilityLevel,
    /// Always within [0, 1].
    pub confidence: f64,
    pub reasoning: String,
    #[serde(default)]
    pub estimated_steps: Option<u32>,
    /// Agents whose results are needed first.
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl CapabilityResponse {
    pub fn new(
        agent_name: impl Into<String>,
        level: CapabilityLevel,
        confidence: f64,
        reasoning: impl Into<String>,
    ) -> Self {
        Self {
            agent_name: agent_name.into(),
            level,
            confidence: clamp_confidence(confidence),
            reasoning: reasoning.into(),
            estimated_steps: None,
            dependencies: vec![],
        }
    }

    pub fn with_estimated_steps(mut self, steps: u32) -> Self {
        self.estimated_steps = Some(steps);
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }

    /// Re-apply the confidence bounds, e.g. after deserializing.
    pub fn clamped(mut self) -> Self {
        self.confidence = clamp_confidence(self.confidence);
        self
    }
}

fn clamp_confidence(confidence: f64) -> f64 {
    if confidence.is_nan() {
        0.0
    } else {
        confidence.clamp(0.0, 1.0)
    }
}

/// What an agent hands back after doing the work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentReply {
    pub success: bool,
    #[serde(default)]
    pub output: serde_json::Value,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub run_id: Option<String>,
}

impl AgentReply {
    pub fn success(output: serde_json::Value) -> Self {
        Self {
            success: true,
            output,
            error: None,
            run_id: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: serde_json::Value::Null,
            error: Some(error.into()),
            run_id: None,
        }
    }
}

/// An addressable agent the orchestrator can negotiate with and invoke.
pub trait AgentHandle: Send + Sync {
    fn name(&self) -> &str;

    fn check_capability<'a>(&'a self, message: &'a AgentMessage) -> BoxFuture<'a, CapabilityResponse>;

    fn handle<'a>(&'a self, message: &'a AgentMessage) -> BoxFuture<'a, Result<AgentReply>>;
}

/// Registry entry.
#[derive(Clone)]
pub struct RegisteredAgent {
    pub name: String,
    pub runner: Arc<dyn AgentHandle>,
    pub description: String,
    /// High-level capability keywords used for candidate filtering.
    pub capabilities: Vec<String>,
    /// Higher is consulted first.
    pub priority: i32,
}

impl RegisteredAgent {
    pub fn new(name: impl Into<String>, runner: Arc<dyn AgentHandle>) -> Self {
        Self {
            name: name.into(),
            runner,
            description: String::new(),
            capabilities: vec![],
            priority: 0,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Whether any capability keyword appears in `text` (case-insensitive).
    pub fn matches(&self, text: &str) -> bool {
        let text = text.to_lowercase();
        self.capabilities
            .iter()
            .any(|c| !c.trim().is_empty() && text.contains(&c.to_lowercase()))
    }
}

impl std::fmt::Debug for RegisteredAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredAgent")
            .field("name", &self.name)
            .field("capabilities", &self.capabilities)
            .field("priority", &self.priority)
            .finish()
    }
}

/// Outcome of one dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorResult {
    pub success: bool,
    /// Agents whose work produced the result.
    pub handled_by: Vec<String>,
    /// Output per agent, dependencies included.
    pub results: BTreeMap<String, serde_json::Value>,
    /// Full message trace, kept whether or not the dispatch succeeded.
    pub messages: Vec<AgentMessage>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub problems: Vec<Problem>,
}
