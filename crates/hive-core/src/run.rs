use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::decision::{Decision, DecisionEvaluation};
use crate::error::{HiveError, Result};
use crate::goal::Goal;
use crate::types::new_id;

/// Status of a run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Aborted,
    AwaitingApproval,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Aborted)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
            Self::AwaitingApproval => "awaiting_approval",
        };
        f.write_str(s)
    }
}

/// Kind of terminal failure.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProblemKind {
    StepFailure,
    JudgmentExhausted,
    ReplanExhausted,
    ApprovalRejected,
    ApprovalTimeout,
    Cancelled,
    Aborted,
    NoCapableAgent,
    Timeout,
    AgentFailed,
    UnknownAgent,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    #[default]
    Error,
    Critical,
}

/// A failure record attached to a run or a dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Problem {
    pub id: String,
    pub kind: ProblemKind,
    pub message: String,
    /// Decision (or protocol message) the failure originated from.
    #[serde(default)]
    pub decision_id: Option<String>,
    #[serde(default)]
    pub severity: Severity,
    pub recorded_at: DateTime<Utc>,
}

impl Problem {
    pub fn new(kind: ProblemKind, message: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            kind,
            message: message.into(),
            decision_id: None,
            severity: Severity::default(),
            recorded_at: Utc::now(),
        }
    }

    pub fn with_decision(mut self, decision_id: impl Into<String>) -> Self {
        self.decision_id = Some(decision_id.into());
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }
}

/// One execution of a goal: its sealed decisions and any problems.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    id: String,
    goal_id: String,
    goal_description: String,
    status: RunStatus,
    decisions: Vec<Decision>,
    problems: Vec<Problem>,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    output: serde_json::Value,
}

impl Run {
    pub fn start(goal: &Goal) -> Self {
        Self {
            id: new_id(),
            goal_id: goal.id.clone(),
            goal_description: goal.description.clone(),
            status: RunStatus::Running,
            decisions: vec![],
            problems: vec![],
            started_at: Utc::now(),
            completed_at: None,
            output: serde_json::Value::Null,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn goal_id(&self) -> &str {
        &self.goal_id
    }

    pub fn goal_description(&self) -> &str {
        &self.goal_description
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    /// Sealed decisions in completion order.
    pub fn decisions(&self) -> &[Decision] {
        &self.decisions
    }

    pub fn decision(&self, id: &str) -> Option<&Decision> {
        self.decisions.iter().find(|d| d.id() == id)
    }

    pub fn problems(&self) -> &[Problem] {
        &self.problems
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn output(&self) -> &serde_json::Value {
        &self.output
    }

    /// Append a sealed decision. Unsealed or foreign decisions are rejected.
    pub fn push_decision(&mut self, decision: Decision) -> Result<()> {
        if !decision.is_sealed() {
            return Err(HiveError::Validation(format!(
                "decision {} has no outcome",
                decision.id()
            )));
        }
        if decision.run_id() != self.id {
            return Err(HiveError::Validation(format!(
                "decision {} belongs to run {}",
                decision.id(),
                decision.run_id()
            )));
        }
        self.decisions.push(decision);
        Ok(())
    }

    /// Attach a quality evaluation to a recorded decision.
    pub fn evaluate_decision(&mut self, decision_id: &str, evaluation: DecisionEvaluation) -> Result<()> {
        let decision = self
            .decisions
            .iter_mut()
            .find(|d| d.id() == decision_id)
            .ok_or_else(|| HiveError::DecisionNotFound(decision_id.to_string()))?;
        decision.evaluate(evaluation);
        Ok(())
    }

    pub fn add_problem(&mut self, problem: Problem) {
        self.problems.push(problem);
    }

    pub fn set_output(&mut self, output: serde_json::Value) {
        self.output = output;
    }

    /// Mark the run suspended, waiting on a human.
    pub fn suspend(&mut self) {
        self.status = RunStatus::AwaitingApproval;
    }

    /// Resume a suspended run.
    pub fn resume(&mut self) {
        self.status = RunStatus::Running;
        self.completed_at = None;
    }

    pub fn finish(&mut self, status: RunStatus) {
        self.status = status;
        self.completed_at = Some(Utc::now());
    }

    pub fn duration_ms(&self) -> u64 {
        let end = self.completed_at.unwrap_or_else(Utc::now);
        (end - self.started_at).num_milliseconds().max(0) as u64
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary::from_run(self)
    }
}

/// Read-only aggregate derived from a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub goal_id: String,
    pub goal: String,
    pub status: RunStatus,
    pub total_decisions: usize,
    pub successful_decisions: usize,
    pub failed_decisions: usize,
    pub problem_count: usize,
    pub duration_ms: u64,
    /// Ids of decisions whose outcome was a failure.
    pub key_decisions: Vec<String>,
    pub problems: Vec<String>,
}

impl RunSummary {
    pub fn from_run(run: &Run) -> Self {
        let successful = run.decisions.iter().filter(|d| d.succeeded()).count();
        Self {
            run_id: run.id.clone(),
            goal_id: run.goal_id.clone(),
            goal: run.goal_description.clone(),
            status: run.status,
            total_decisions: run.decisions.len(),
            successful_decisions: successful,
            failed_decisions: run.decisions.len() - successful,
            problem_count: run.problems.len(),
            duration_ms: run.duration_ms(),
            key_decisions: run
                .decisions
                .iter()
                .filter(|d| !d.succeeded())
                .map(|d| d.id().to_string())
                .collect(),
            problems: run.problems.iter().map(|p| p.message.clone()).collect(),
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_decisions == 0 {
            return 0.0;
        }
        self.successful_decisions as f64 / self.total_decisions as f64
    }
}
