//! Decision records.
//!
//! A decision captures what an agent intended, which options it weighed,
//! which one it chose, and what actually happened. Decisions are opened at
//! dispatch time and sealed exactly once when the outcome is known; after
//! that only the quality evaluation may change.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{HiveError, Result};
use crate::types::new_id;

/// What kind of choice a decision records.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    /// Dispatching a plan step to the worker.
    StepExecution,
    /// The retry budget of a step ran out.
    RetryExhausted,
    /// The judge (or engine) stopped the run.
    Abort,
    /// The remaining plan was regenerated.
    Replan,
    /// A step was handed to a human.
    Escalation,
    /// A step passed through the approval gate before execution.
    Approval,
}

/// One option weighed before choosing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DecisionOption {
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub predicted_outcome: String,
    #[serde(default)]
    pub score: f64,
}

impl DecisionOption {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            predicted_outcome: String::new(),
            score: 0.0,
        }
    }

    pub fn with_prediction(mut self, predicted: impl Into<String>) -> Self {
        self.predicted_outcome = predicted.into();
        self
    }

    pub fn with_score(mut self, score: f64) -> Self {
        self.score = score;
        self
    }
}

/// What the judge decided after a step completed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JudgmentAction {
    Continue,
    Retry,
    Replan,
    Escalate,
    Abort,
}

impl JudgmentAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Continue => "continue",
            Self::Retry => "retry",
            Self::Replan => "replan",
            Self::Escalate => "escalate",
            Self::Abort => "abort",
        }
    }

    /// Parse an action name, tolerating case and common aliases.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "continue" | "accept" | "proceed" => Some(Self::Continue),
            "retry" => Some(Self::Retry),
            "replan" => Some(Self::Replan),
            "escalate" => Some(Self::Escalate),
            "abort" => Some(Self::Abort),
            _ => None,
        }
    }
}

impl std::fmt::Display for JudgmentAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which part of the judge produced a judgment.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JudgmentSource {
    Rule,
    Model,
    Fallback,
}

/// Verdict produced once per step completion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Judgment {
    pub action: JudgmentAction,
    #[serde(default)]
    pub rule_ids: Vec<String>,
    pub rationale: String,
    pub source: JudgmentSource,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
}

fn default_confidence() -> f64 {
    1.0
}

impl Judgment {
    pub fn from_rule(
        action: JudgmentAction,
        rule_id: impl Into<String>,
        rationale: impl Into<String>,
    ) -> Self {
        Self {
            action,
            rule_ids: vec![rule_id.into()],
            rationale: rationale.into(),
            source: JudgmentSource::Rule,
            confidence: 1.0,
        }
    }

    pub fn from_model(action: JudgmentAction, rationale: impl Into<String>, confidence: f64) -> Self {
        Self {
            action,
            rule_ids: vec![],
            rationale: rationale.into(),
            source: JudgmentSource::Model,
            confidence: confidence.clamp(0.0, 1.0),
        }
    }

    pub fn fallback(action: JudgmentAction, rationale: impl Into<String>) -> Self {
        Self {
            action,
            rule_ids: vec![],
            rationale: rationale.into(),
            source: JudgmentSource::Fallback,
            confidence: 0.5,
        }
    }
}

/// Observed result of a decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outcome {
    pub success: bool,
    #[serde(default)]
    pub result: serde_json::Value,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    #[serde(default)]
    pub judgment: Option<Judgment>,
    pub recorded_at: DateTime<Utc>,
}

impl Outcome {
    pub fn success(result: serde_json::Value, summary: impl Into<String>) -> Self {
        Self {
            success: true,
            result,
            error: None,
            summary: summary.into(),
            metrics: BTreeMap::new(),
            judgment: None,
            recorded_at: Utc::now(),
        }
    }

    pub fn failure(error: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            success: false,
            result: serde_json::Value::Null,
            error: Some(error.into()),
            summary: summary.into(),
            metrics: BTreeMap::new(),
            judgment: None,
            recorded_at: Utc::now(),
        }
    }

    pub fn with_result(mut self, result: serde_json::Value) -> Self {
        self.result = result;
        self
    }

    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }

    pub fn with_judgment(mut self, judgment: Judgment) -> Self {
        self.judgment = Some(judgment);
        self
    }
}

/// Quality rating assigned after the fact.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DecisionQuality {
    Good,
    Acceptable,
    Poor,
    Harmful,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionEvaluation {
    pub quality: DecisionQuality,
    pub rationale: String,
    pub evaluated_at: DateTime<Utc>,
}

impl DecisionEvaluation {
    pub fn new(quality: DecisionQuality, rationale: impl Into<String>) -> Self {
        Self {
            quality,
            rationale: rationale.into(),
            evaluated_at: Utc::now(),
        }
    }
}

/// A structured record of one consequential choice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    id: String,
    run_id: String,
    kind: DecisionKind,
    #[serde(default)]
    step_id: Option<String>,
    intent: String,
    #[serde(default)]
    options: Vec<DecisionOption>,
    #[serde(default)]
    chosen_option_id: Option<String>,
    #[serde(default)]
    reasoning: String,
    #[serde(default)]
    outcome: Option<Outcome>,
    #[serde(default)]
    evaluation: Option<DecisionEvaluation>,
    timestamp: DateTime<Utc>,
}

impl Decision {
    pub fn builder(
        run_id: impl Into<String>,
        kind: DecisionKind,
        intent: impl Into<String>,
    ) -> DecisionBuilder {
        DecisionBuilder {
            decision: Decision {
                id: new_id(),
                run_id: run_id.into(),
                kind,
                step_id: None,
                intent: intent.into(),
                options: vec![],
                chosen_option_id: None,
                reasoning: String::new(),
                outcome: None,
                evaluation: None,
                timestamp: Utc::now(),
            },
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn kind(&self) -> DecisionKind {
        self.kind
    }

    pub fn step_id(&self) -> Option<&str> {
        self.step_id.as_deref()
    }

    pub fn intent(&self) -> &str {
        &self.intent
    }

    pub fn options(&self) -> &[DecisionOption] {
        &self.options
    }

    pub fn chosen_option(&self) -> Option<&DecisionOption> {
        let chosen = self.chosen_option_id.as_deref()?;
        self.options.iter().find(|o| o.id == chosen)
    }

    pub fn chosen_option_id(&self) -> Option<&str> {
        self.chosen_option_id.as_deref()
    }

    pub fn reasoning(&self) -> &str {
        &self.reasoning
    }

    pub fn outcome(&self) -> Option<&Outcome> {
        self.outcome.as_ref()
    }

    pub fn evaluation(&self) -> Option<&DecisionEvaluation> {
        self.evaluation.as_ref()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Whether the outcome has been recorded.
    pub fn is_sealed(&self) -> bool {
        self.outcome.is_some()
    }

    /// True when the outcome is set and successful.
    pub fn succeeded(&self) -> bool {
        self.outcome.as_ref().map(|o| o.success).unwrap_or(false)
    }

    /// Record the observed outcome. Allowed exactly once.
    pub fn record_outcome(&mut self, outcome: Outcome) -> Result<()> {
        if self.outcome.is_some() {
            return Err(HiveError::DecisionSealed(self.id.clone()));
        }
        self.outcome = Some(outcome);
        Ok(())
    }

    /// Attach (or replace) the after-the-fact quality evaluation.
    pub fn evaluate(&mut self, evaluation: DecisionEvaluation) {
        self.evaluation = Some(evaluation);
    }
}

/// Assembles a decision before it is opened.
pub struct DecisionBuilder {
    decision: Decision,
}

impl DecisionBuilder {
    pub fn step(mut self, step_id: impl Into<String>) -> Self {
        self.decision.step_id = Some(step_id.into());
        self
    }

    pub fn option(mut self, option: DecisionOption) -> Self {
        self.decision.options.push(option);
        self
    }

    /// Choose an option. The id should name one of the listed options.
    pub fn choose(mut self, option_id: impl Into<String>, reasoning: impl Into<String>) -> Self {
        self.decision.chosen_option_id = Some(option_id.into());
        self.decision.reasoning = reasoning.into();
        self
    }

    pub fn build(self) -> Decision {
        self.decision
    }
}
