use thiserror::Error;

#[derive(Debug, Error)]
pub enum HiveError {
    // LLM errors
    #[error("LLM request failed: {0}")]
    LlmRequest(String),

    #[error("LLM provider not supported: {0}")]
    UnsupportedProvider(String),

    #[error("LLM response parse error: {0}")]
    LlmParse(String),

    // Tool errors
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool execution failed: {tool}: {message}")]
    ToolExecution { tool: String, message: String },

    #[error("Tool timeout after {timeout_secs}s: {tool}")]
    ToolTimeout { tool: String, timeout_secs: u64 },

    #[error("Tool input validation failed: {0}")]
    ToolValidation(String),

    // Plan and decision errors
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Illegal step transition for {step}: {from} -> {to}")]
    InvalidTransition { step: String, from: String, to: String },

    #[error("Decision {0} already has an outcome")]
    DecisionSealed(String),

    #[error("Decision not found: {0}")]
    DecisionNotFound(String),

    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Planner failed: {0}")]
    Planner(String),

    // Sandbox errors
    #[error("Expression error: {0}")]
    Expression(String),

    // Approval errors
    #[error("Approval result {got} does not match pending request {expected}")]
    ApprovalMismatch { expected: String, got: String },

    #[error("Approval channel closed for {0}")]
    ApprovalClosed(String),

    // Orchestration errors
    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Duplicate agent registration: {0}")]
    DuplicateAgent(String),

    #[error("Message {id} references unknown parent {parent}")]
    BrokenThread { id: String, parent: String },

    #[error("{0}")]
    Orchestration(String),

    #[error("Cancelled")]
    Cancelled,

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Export errors
    #[error("Export not found: {0}")]
    ExportNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, HiveError>;
