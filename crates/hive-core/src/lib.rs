pub mod approval;
pub mod config;
pub mod decision;
pub mod error;
pub mod event;
pub mod goal;
pub mod run;
pub mod traits;
pub mod types;

pub use approval::{ApprovalDecision, ApprovalRequest, ApprovalResult, RiskLevel};
pub use config::AppConfig;
pub use decision::{
    Decision, DecisionEvaluation, DecisionKind, DecisionOption, DecisionQuality, Judgment,
    JudgmentAction, JudgmentSource, Outcome,
};
pub use error::{HiveError, Result};
pub use event::EventBus;
pub use goal::{Goal, GoalStatus};
pub use run::{Problem, ProblemKind, Run, RunStatus, RunSummary};
pub use types::*;
