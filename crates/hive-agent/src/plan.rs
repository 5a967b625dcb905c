use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use hive_core::approval::RiskLevel;
use hive_core::error::{HiveError, Result};
use hive_core::goal::Goal;
use hive_core::types::new_id;

/// What a step does.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    ToolCall,
    LlmQuery,
    HumanApproval,
    Subplan,
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::ToolCall => "tool_call",
            Self::LlmQuery => "llm_query",
            Self::HumanApproval => "human_approval",
            Self::Subplan => "subplan",
        };
        f.write_str(s)
    }
}

/// A nested goal and its steps, executed by a fresh engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubplanSpec {
    pub goal: Goal,
    pub steps: Vec<PlanStep>,
}

/// Parameters for a step's action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionSpec {
    pub action_type: ActionType,
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub tool_args: serde_json::Value,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub subplan: Option<Box<SubplanSpec>>,
    #[serde(default)]
    pub approval_message: Option<String>,
    #[serde(default)]
    pub risk: RiskLevel,
}

impl ActionSpec {
    fn empty(action_type: ActionType) -> Self {
        Self {
            action_type,
            tool_name: None,
            tool_args: serde_json::Value::Null,
            prompt: None,
            system_prompt: None,
            subplan: None,
            approval_message: None,
            risk: RiskLevel::default(),
        }
    }

    pub fn tool_call(name: impl Into<String>, args: serde_json::Value) -> Self {
        let mut spec = Self::empty(ActionType::ToolCall);
        spec.tool_name = Some(name.into());
        spec.tool_args = args;
        spec
    }

    pub fn llm_query(prompt: impl Into<String>) -> Self {
        let mut spec = Self::empty(ActionType::LlmQuery);
        spec.prompt = Some(prompt.into());
        spec
    }

    pub fn human_approval(message: impl Into<String>) -> Self {
        let mut spec = Self::empty(ActionType::HumanApproval);
        spec.approval_message = Some(message.into());
        spec
    }

    pub fn subplan(goal: Goal, steps: Vec<PlanStep>) -> Self {
        let mut spec = Self::empty(ActionType::Subplan);
        spec.subplan = Some(Box::new(SubplanSpec { goal, steps }));
        spec
    }

    pub fn with_system_prompt(mut self, system: impl Into<String>) -> Self {
        self.system_prompt = Some(system.into());
        self
    }

    pub fn with_risk(mut self, risk: RiskLevel) -> Self {
        self.risk = risk;
        self
    }

    /// The parameters a reviewer sees and may replace.
    pub fn params(&self) -> serde_json::Value {
        match self.action_type {
            ActionType::ToolCall => self.tool_args.clone(),
            ActionType::LlmQuery => serde_json::json!({ "prompt": self.prompt }),
            ActionType::HumanApproval => serde_json::json!({ "message": self.approval_message }),
            ActionType::Subplan => serde_json::json!({
                "goal": self.subplan.as_ref().map(|s| s.goal.description.clone()),
            }),
        }
    }

    /// Copy of this action with reviewer-supplied parameters applied.
    pub fn with_params(&self, params: serde_json::Value) -> Self {
        let mut spec = self.clone();
        match spec.action_type {
            ActionType::ToolCall => spec.tool_args = params,
            ActionType::LlmQuery => {
                if let Some(prompt) = params.get("prompt").and_then(|p| p.as_str()) {
                    spec.prompt = Some(prompt.to_string());
                } else if let Some(prompt) = params.as_str() {
                    spec.prompt = Some(prompt.to_string());
                }
            }
            ActionType::HumanApproval | ActionType::Subplan => {}
        }
        spec
    }
}

/// Lifecycle of a step.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
    AwaitingApproval,
    Aborted,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Aborted => "aborted",
        }
    }

    /// Succeeded or skipped: dependents may run.
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Skipped)
    }

    pub fn can_transition_to(&self, to: StepStatus) -> bool {
        use StepStatus::*;
        matches!(
            (self, to),
            (Pending, Running)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, AwaitingApproval)
                | (AwaitingApproval, Succeeded)
                | (AwaitingApproval, Failed)
                | (Failed, Pending)
                | (Failed, Aborted)
        )
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of work in a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: String,
    pub description: String,
    pub action: ActionSpec,
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    /// Output keys that must be present for the step to count as done.
    #[serde(default)]
    pub expected_outputs: Vec<String>,
    #[serde(default)]
    pub requires_approval: bool,
    /// Overrides the engine-wide retry budget.
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    status: StepStatus,
    #[serde(default)]
    retry_count: u32,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl PlanStep {
    pub fn new(id: impl Into<String>, description: impl Into<String>, action: ActionSpec) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            action,
            dependencies: BTreeSet::new(),
            expected_outputs: vec![],
            requires_approval: false,
            max_retries: None,
            status: StepStatus::Pending,
            retry_count: 0,
            result: None,
            error: None,
        }
    }

    pub fn depends_on(mut self, step_id: impl Into<String>) -> Self {
        self.dependencies.insert(step_id.into());
        self
    }

    pub fn expects(mut self, key: impl Into<String>) -> Self {
        self.expected_outputs.push(key.into());
        self
    }

    pub fn requiring_approval(mut self) -> Self {
        self.requires_approval = true;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Mark the step skipped. Only valid while building or loading a plan.
    pub fn skipped(mut self) -> Self {
        self.status = StepStatus::Skipped;
        self
    }

    pub fn status(&self) -> StepStatus {
        self.status
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Whether this step must pass through the approval gate before running.
    pub fn needs_approval(&self) -> bool {
        self.requires_approval || self.action.action_type == ActionType::HumanApproval
    }

    /// Move to `to`, rejecting any edge outside the step lifecycle.
    pub fn transition(&mut self, to: StepStatus) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(HiveError::InvalidTransition {
                step: self.id.clone(),
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        self.status = to;
        Ok(())
    }

    /// failed -> pending, counting the retry.
    pub fn requeue(&mut self) -> Result<()> {
        self.transition(StepStatus::Pending)?;
        self.retry_count += 1;
        Ok(())
    }
}

/// Goal-scoped, mutable set of steps with a dependency DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default = "new_id")]
    pub id: String,
    #[serde(default)]
    pub goal_id: String,
    #[serde(default)]
    pub description: String,
    pub steps: Vec<PlanStep>,
    #[serde(default)]
    pub revision: u32,
    /// Accumulated outputs and inputs, keyed by step id or input name.
    #[serde(default)]
    pub context: BTreeMap<String, serde_json::Value>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Plan {
    pub fn new(goal: &Goal, steps: Vec<PlanStep>) -> Self {
        Self {
            id: new_id(),
            goal_id: goal.id.clone(),
            description: goal.description.clone(),
            steps,
            revision: 0,
            context: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    pub fn step(&self, id: &str) -> Option<&PlanStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn step_mut(&mut self, id: &str) -> Result<&mut PlanStep> {
        self.steps
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| HiveError::Validation(format!("unknown step: {}", id)))
    }

    /// Check structure before execution: unique ids, known dependencies,
    /// no cycles, and each action carrying what it needs.
    pub fn validate(&self) -> Result<()> {
        if self.steps.is_empty() {
            return Err(HiveError::Validation("plan has no steps".into()));
        }

        let mut ids = BTreeSet::new();
        for step in &self.steps {
            if step.id.trim().is_empty() {
                return Err(HiveError::Validation("step with empty id".into()));
            }
            if !ids.insert(step.id.as_str()) {
                return Err(HiveError::Validation(format!("duplicate step id: {}", step.id)));
            }
        }

        for step in &self.steps {
            for dep in &step.dependencies {
                if !ids.contains(dep.as_str()) {
                    return Err(HiveError::Validation(format!(
                        "step {} depends on unknown step {}",
                        step.id, dep
                    )));
                }
            }
            if matches!(step.status, StepStatus::Running | StepStatus::AwaitingApproval) {
                return Err(HiveError::Validation(format!(
                    "step {} cannot start in status {}",
                    step.id, step.status
                )));
            }
            validate_action(step)?;
        }

        if let Some(step) = self.find_cycle() {
            return Err(HiveError::Validation(format!(
                "dependency cycle through step {}",
                step
            )));
        }
        Ok(())
    }

    /// Kahn's algorithm; returns a step on a cycle if one exists.
    fn find_cycle(&self) -> Option<String> {
        let mut indegree: BTreeMap<&str, usize> = self
            .steps
            .iter()
            .map(|s| (s.id.as_str(), s.dependencies.len()))
            .collect();
        let mut ready: Vec<&str> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut visited = 0;

        while let Some(id) = ready.pop() {
            visited += 1;
            for step in &self.steps {
                if step.dependencies.contains(id) {
                    if let Some(d) = indegree.get_mut(step.id.as_str()) {
                        *d -= 1;
                        if *d == 0 {
                            ready.push(step.id.as_str());
                        }
                    }
                }
            }
        }

        if visited == self.steps.len() {
            None
        } else {
            indegree
                .into_iter()
                .find(|(_, d)| *d > 0)
                .map(|(id, _)| id.to_string())
        }
    }

    /// Pending steps whose dependencies are all done, in plan order.
    pub fn ready_steps(&self) -> Vec<String> {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Pending)
            .filter(|s| {
                s.dependencies
                    .iter()
                    .all(|d| self.step(d).map(|dep| dep.status.is_done()).unwrap_or(false))
            })
            .map(|s| s.id.clone())
            .collect()
    }

    /// Every step succeeded or skipped.
    pub fn is_complete(&self) -> bool {
        self.steps.iter().all(|s| s.status.is_done())
    }

    pub fn count(&self, status: StepStatus) -> usize {
        self.steps.iter().filter(|s| s.status == status).count()
    }

    /// Drop every step that has not succeeded (or been skipped) and append
    /// `new_steps`. Returns the ids of the discarded steps.
    pub fn replace_unfinished(&mut self, new_steps: Vec<PlanStep>) -> Vec<String> {
        let (kept, discarded): (Vec<_>, Vec<_>) =
            self.steps.drain(..).partition(|s| s.status.is_done());
        self.steps = kept;
        self.steps.extend(new_steps);
        self.revision += 1;
        discarded.into_iter().map(|s| s.id).collect()
    }

    /// Snapshot of progress for a replanner or a reviewer.
    pub fn to_feedback_context(&self) -> serde_json::Value {
        let steps: Vec<serde_json::Value> = self
            .steps
            .iter()
            .map(|s| {
                serde_json::json!({
                    "id": s.id,
                    "description": s.description,
                    "action_type": s.action.action_type.to_string(),
                    "status": s.status.as_str(),
                    "retry_count": s.retry_count,
                    "error": s.error,
                })
            })
            .collect();
        serde_json::json!({
            "plan_id": self.id,
            "revision": self.revision,
            "description": self.description,
            "steps": steps,
            "context": self.context,
        })
    }
}

fn validate_action(step: &PlanStep) -> Result<()> {
    let action = &step.action;
    match action.action_type {
        ActionType::ToolCall => {
            if action.tool_name.as_deref().map(str::trim).unwrap_or("").is_empty() {
                return Err(HiveError::Validation(format!(
                    "tool_call step {} has no tool_name",
                    step.id
                )));
            }
        }
        ActionType::LlmQuery => {
            if action.prompt.as_deref().map(str::trim).unwrap_or("").is_empty() {
                return Err(HiveError::Validation(format!(
                    "llm_query step {} has no prompt",
                    step.id
                )));
            }
        }
        ActionType::Subplan => match &action.subplan {
            Some(sub) if !sub.steps.is_empty() => {}
            _ => {
                return Err(HiveError::Validation(format!(
                    "subplan step {} has no steps",
                    step.id
                )))
            }
        },
        ActionType::HumanApproval => {}
    }
    Ok(())
}
