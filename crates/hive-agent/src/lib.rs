pub mod approval;
pub mod executor;
pub mod export;
pub mod judge;
pub mod orchestrator;
pub mod plan;
pub mod planner;
pub mod protocol;
pub mod recorder;
pub mod run_log;
pub mod runner;
pub mod sandbox;
pub mod worker;

pub use approval::{ApprovalGate, ApprovalWait};
pub use executor::{
    ExecutionStatus, FlexibleExecutor, FlexibleExecutorBuilder, PendingApproval, PlanExecutionResult,
    SuspendedRun,
};
pub use export::{list_exports, load_export, AgentExport, RunnerOptions};
pub use judge::{create_default_judge, EvaluationRule, HybridJudge};
pub use orchestrator::{select_agent, AgentOrchestrator, OrchestratorBuilder};
pub use plan::{ActionSpec, ActionType, Plan, PlanStep, StepStatus, SubplanSpec};
pub use planner::{LlmPlanner, Planner, ReplanTrigger, StaticPlanner};
pub use protocol::{
    AgentHandle, AgentMessage, AgentReply, CapabilityLevel, CapabilityResponse, MessageTrace,
    MessageType, OrchestratorResult, RegisteredAgent,
};
pub use recorder::DecisionRecorder;
pub use run_log::RunLogger;
pub use runner::{AgentInfo, AgentRunner, ValidationResult};
pub use sandbox::{Bindings, SandboxError, SandboxLimits};
pub use worker::{StepExecutionResult, Worker};
