use serde::{Deserialize, Serialize};

use crate::types::new_id;

/// Lifecycle of a goal within its run.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GoalStatus {
    #[default]
    Pending,
    Active,
    Achieved,
    Failed,
    Abandoned,
}

/// What an agent is asked to achieve, and how the outcome is scored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Goal {
    #[serde(default = "new_id")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// The objective, in plain language.
    pub description: String,
    #[serde(default)]
    pub success_criteria: Vec<SuccessCriterion>,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
    #[serde(default)]
    pub status: GoalStatus,
    /// Weighted score the run output must reach, between 0 and 1.
    #[serde(default = "default_threshold")]
    pub success_threshold: f64,
}

fn default_threshold() -> f64 {
    0.9
}

fn default_weight() -> f64 {
    1.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuccessCriterion {
    pub id: String,
    pub criterion_type: CriterionType,
    /// Relative weight; weights are normalized over the criteria actually scored.
    #[serde(default = "default_weight")]
    pub weight: f64,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CriterionType {
    OutputContains {
        pattern: String,
        #[serde(default)]
        case_sensitive: bool,
    },
    OutputEquals {
        expected: String,
    },
    /// Scored by a model reading `prompt` and the output.
    LlmJudge {
        prompt: String,
    },
    /// Scored outside the runtime.
    Custom {
        name: String,
    },
}

impl SuccessCriterion {
    /// Score this criterion against `output` when that needs no model.
    pub fn check(&self, output: &str) -> Option<CriterionResult> {
        let (passed, reasoning) = match &self.criterion_type {
            CriterionType::OutputContains {
                pattern,
                case_sensitive,
            } => {
                let found = if *case_sensitive {
                    output.contains(pattern.as_str())
                } else {
                    output.to_lowercase().contains(&pattern.to_lowercase())
                };
                let verb = if found { "contains" } else { "lacks" };
                (found, format!("output {} '{}'", verb, pattern))
            }
            CriterionType::OutputEquals { expected } => {
                let same = output.trim() == expected.trim();
                let verb = if same { "matches" } else { "differs from" };
                (same, format!("output {} the expected value", verb))
            }
            CriterionType::LlmJudge { .. } | CriterionType::Custom { .. } => return None,
        };
        Some(CriterionResult {
            criterion_id: self.id.clone(),
            score: if passed { 1.0 } else { 0.0 },
            passed,
            reasoning,
        })
    }

    pub fn is_deterministic(&self) -> bool {
        matches!(
            self.criterion_type,
            CriterionType::OutputContains { .. } | CriterionType::OutputEquals { .. }
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Constraint {
    pub category: ConstraintCategory,
    pub kind: ConstraintKind,
    pub description: String,
    /// Limit or setting, read according to `category`.
    #[serde(default)]
    pub value: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintCategory {
    Time,
    Cost,
    Safety,
    Scope,
    Quality,
}

/// Hard constraints fail the goal outright; soft ones are only reported.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintKind {
    Hard,
    Soft,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriterionResult {
    pub criterion_id: String,
    pub score: f64,
    pub passed: bool,
    pub reasoning: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConstraintViolation {
    pub description: String,
    pub kind: ConstraintKind,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoalEvaluation {
    pub overall_score: f64,
    pub passed: bool,
    pub criteria_results: Vec<CriterionResult>,
    pub constraint_violations: Vec<ConstraintViolation>,
}

impl Goal {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            name: name.into(),
            description: description.into(),
            success_criteria: vec![],
            constraints: vec![],
            status: GoalStatus::Pending,
            success_threshold: default_threshold(),
        }
    }

    pub fn with_criterion(mut self, criterion: SuccessCriterion) -> Self {
        self.success_criteria.push(criterion);
        self
    }

    pub fn with_constraint(mut self, constraint: Constraint) -> Self {
        self.constraints.push(constraint);
        self
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.success_threshold = threshold;
        self
    }

    pub fn activate(&mut self) {
        self.status = GoalStatus::Active;
    }

    pub fn set_status(&mut self, status: GoalStatus) {
        self.status = status;
    }

    pub fn has_deterministic_criteria(&self) -> bool {
        self.success_criteria.iter().any(SuccessCriterion::is_deterministic)
    }

    pub fn hard_constraints(&self) -> impl Iterator<Item = &Constraint> {
        self.constraints.iter().filter(|c| c.kind == ConstraintKind::Hard)
    }

    /// Results for every criterion that can be scored from `output` alone.
    pub fn evaluate_deterministic(&self, output: &str) -> Vec<CriterionResult> {
        self.success_criteria
            .iter()
            .filter_map(|c| c.check(output))
            .collect()
    }

    /// Weighted score over the criteria present in `criteria_results`.
    ///
    /// Criteria with no result are left out of the weight total. Any hard
    /// violation fails the goal whatever the score.
    pub fn compute_evaluation(
        &self,
        criteria_results: Vec<CriterionResult>,
        constraint_violations: Vec<ConstraintViolation>,
    ) -> GoalEvaluation {
        let (weighted, total) = criteria_results
            .iter()
            .filter_map(|r| {
                self.success_criteria
                    .iter()
                    .find(|c| c.id == r.criterion_id)
                    .map(|c| (r.score * c.weight, c.weight))
            })
            .fold((0.0, 0.0), |(s, w), (score, weight)| (s + score, w + weight));
        let overall_score = if total > 0.0 { weighted / total } else { 0.0 };

        let hard_violation = constraint_violations
            .iter()
            .any(|v| v.kind == ConstraintKind::Hard);

        GoalEvaluation {
            overall_score,
            passed: !hard_violation && overall_score >= self.success_threshold,
            criteria_results,
            constraint_violations,
        }
    }
}
