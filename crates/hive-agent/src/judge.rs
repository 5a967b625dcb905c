use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use hive_core::decision::{Judgment, JudgmentAction};
use hive_core::traits::LlmProvider;
use hive_core::types::{ChatMessage, CompletionRequest};

use crate::plan::PlanStep;
use crate::sandbox::{self, Bindings, SandboxLimits};
use crate::worker::StepExecutionResult;

/// A deterministic rule: when `condition` holds, take `action`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationRule {
    pub id: String,
    #[serde(default)]
    pub description: String,
    /// Sandbox expression over the judge bindings.
    pub condition: String,
    pub action: JudgmentAction,
    /// Higher runs first; ties keep insertion order.
    #[serde(default)]
    pub priority: i32,
    /// Rationale text; `{step}` and `{error}` are substituted.
    #[serde(default)]
    pub feedback_template: String,
}

impl EvaluationRule {
    pub fn new(
        id: impl Into<String>,
        condition: impl Into<String>,
        action: JudgmentAction,
    ) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            condition: condition.into(),
            action,
            priority: 0,
            feedback_template: String::new(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_feedback(mut self, template: impl Into<String>) -> Self {
        self.feedback_template = template.into();
        self
    }

    fn rationale(&self, step: &PlanStep, outcome: &StepExecutionResult) -> String {
        let template = if self.feedback_template.is_empty() {
            if self.description.is_empty() {
                format!("rule {} matched", self.id)
            } else {
                self.description.clone()
            }
        } else {
            self.feedback_template.clone()
        };
        template
            .replace("{step}", &step.id)
            .replace("{error}", outcome.error.as_deref().unwrap_or(""))
    }
}

/// Decides control flow after each step.
///
/// Level 0: priority-ordered rules evaluated in the expression sandbox.
/// Level 1: a model classifies the outcome when no rule matched.
/// Without a model, success continues and anything else retries.
pub struct HybridJudge {
    rules: Vec<EvaluationRule>,
    llm: Option<Arc<dyn LlmProvider>>,
    limits: SandboxLimits,
}

impl HybridJudge {
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            llm: None,
            limits: SandboxLimits::default(),
        }
    }

    pub fn with_rule(mut self, rule: EvaluationRule) -> Self {
        self.rules.push(rule);
        // stable: equal priorities keep insertion order
        self.rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        self
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmProvider>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_limits(mut self, limits: SandboxLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn rules(&self) -> &[EvaluationRule] {
        &self.rules
    }

    /// Values the rule expressions can read.
    pub fn bindings(
        step: &PlanStep,
        outcome: &StepExecutionResult,
        context: &BTreeMap<String, serde_json::Value>,
    ) -> Bindings {
        let mut b = Bindings::new();
        b.insert("success".into(), serde_json::Value::Bool(outcome.success));
        b.insert(
            "error".into(),
            outcome
                .error
                .clone()
                .map(serde_json::Value::String)
                .unwrap_or(serde_json::Value::Null),
        );
        b.insert("output".into(), outcome.output.clone());
        b.insert(
            "step".into(),
            serde_json::json!({
                "id": step.id,
                "description": step.description,
                "action_type": step.action.action_type.to_string(),
                "retry_count": step.retry_count(),
                "max_retries": step.max_retries,
            }),
        );
        b.insert(
            "missing_outputs".into(),
            serde_json::json!(missing_outputs(step, &outcome.output)),
        );
        b.insert("latency_ms".into(), serde_json::json!(outcome.latency_ms));
        b.insert(
            "context".into(),
            serde_json::Value::Object(context.clone().into_iter().collect()),
        );
        b
    }

    /// Deterministic level only. Same inputs always give the same judgment.
    pub fn evaluate_rules(
        &self,
        step: &PlanStep,
        outcome: &StepExecutionResult,
        context: &BTreeMap<String, serde_json::Value>,
    ) -> Option<Judgment> {
        let bindings = Self::bindings(step, outcome, context);
        for rule in &self.rules {
            match sandbox::evaluate_bool(&rule.condition, &bindings, &self.limits) {
                Ok(true) => {
                    debug!(rule = %rule.id, step_id = %step.id, action = %rule.action, "Rule matched");
                    return Some(Judgment::from_rule(
                        rule.action,
                        rule.id.clone(),
                        rule.rationale(step, outcome),
                    ));
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(rule = %rule.id, error = %e, "Rule condition failed to evaluate, skipping");
                }
            }
        }
        None
    }

    pub async fn evaluate(
        &self,
        step: &PlanStep,
        outcome: &StepExecutionResult,
        context: &BTreeMap<String, serde_json::Value>,
    ) -> Judgment {
        if let Some(judgment) = self.evaluate_rules(step, outcome, context) {
            return judgment;
        }

        if let Some(llm) = &self.llm {
            match self.model_judgment(llm.as_ref(), step, outcome).await {
                Some(judgment) => return judgment,
                None => warn!(step_id = %step.id, "Model judgment unusable, using fallback"),
            }
        }

        Self::fallback(outcome)
    }

    fn fallback(outcome: &StepExecutionResult) -> Judgment {
        if outcome.success {
            Judgment::fallback(JudgmentAction::Continue, "step succeeded, no rule matched")
        } else {
            Judgment::fallback(
                JudgmentAction::Retry,
                format!(
                    "step failed, no rule matched: {}",
                    outcome.error.as_deref().unwrap_or("unknown error")
                ),
            )
        }
    }

    async fn model_judgment(
        &self,
        llm: &dyn LlmProvider,
        step: &PlanStep,
        outcome: &StepExecutionResult,
    ) -> Option<Judgment> {
        let prompt = format!(
            r#"You are a judge deciding what an agent should do after a plan step.

Step: {} ({})
Action: {}
Attempt: {}
Succeeded: {}
Error: {}
Output:
{}

Choose one action: "continue" (accept and move on), "retry" (run the step again),
"replan" (the approach is wrong, regenerate remaining steps), "escalate" (a human
must decide), or "abort" (stop the run).

Respond with ONLY valid JSON:
{{
  "action": "continue" | "retry" | "replan" | "escalate" | "abort",
  "confidence": 0.0-1.0,
  "reasoning": "brief explanation"
}}"#,
            step.id,
            step.description,
            step.action.action_type,
            step.retry_count() + 1,
            outcome.success,
            outcome.error.as_deref().unwrap_or("none"),
            truncate(&outcome.output.to_string(), 2000),
        );

        let request = CompletionRequest::new(vec![ChatMessage::user(prompt)]).with_max_tokens(512);
        match llm.complete(request).await {
            Ok(response) => parse_judgment(&response.content),
            Err(e) => {
                warn!(error = %e, "Judge model call failed");
                None
            }
        }
    }
}

impl Default for HybridJudge {
    fn default() -> Self {
        Self::new()
    }
}

/// The standard rule set.
pub fn create_default_judge() -> HybridJudge {
    HybridJudge::new()
        .with_rule(
            EvaluationRule::new(
                "expected_outputs_missing",
                "success and len(missing_outputs) > 0",
                JudgmentAction::Retry,
            )
            .with_priority(200)
            .with_description("Step succeeded without producing its expected outputs")
            .with_feedback("Step {step} did not produce all expected outputs"),
        )
        .with_rule(
            EvaluationRule::new("explicit_success", "success", JudgmentAction::Continue)
                .with_priority(100)
                .with_description("Step reported success")
                .with_feedback("Step {step} succeeded"),
        )
        .with_rule(
            EvaluationRule::new("explicit_error", "exists(error)", JudgmentAction::Retry)
                .with_priority(90)
                .with_description("Step reported an error")
                .with_feedback("Step {step} failed: {error}"),
        )
        .with_rule(
            EvaluationRule::new("explicit_failure", "not success", JudgmentAction::Retry)
                .with_priority(80)
                .with_description("Step reported failure")
                .with_feedback("Step {step} failed"),
        )
}

/// Expected output keys absent from a step's output.
pub fn missing_outputs(step: &PlanStep, output: &serde_json::Value) -> Vec<String> {
    match output {
        serde_json::Value::Object(map) => step
            .expected_outputs
            .iter()
            .filter(|k| !map.contains_key(k.as_str()))
            .cloned()
            .collect(),
        // a single expected output is the whole (non-object) value
        serde_json::Value::Null => step.expected_outputs.clone(),
        _ if step.expected_outputs.len() == 1 => vec![],
        _ => step.expected_outputs.clone(),
    }
}

#[derive(Deserialize)]
struct JudgeResponse {
    action: String,
    #[serde(default = "default_confidence")]
    confidence: f64,
    #[serde(default)]
    reasoning: String,
}

fn default_confidence() -> f64 {
    0.5
}

fn parse_judgment(response: &str) -> Option<Judgment> {
    let json_str = extract_json(response);
    match serde_json::from_str::<JudgeResponse>(json_str) {
        Ok(resp) => match JudgmentAction::parse(&resp.action) {
            Some(action) => Some(Judgment::from_model(action, resp.reasoning, resp.confidence)),
            None => {
                warn!(action = %resp.action, "Unknown action from judge model");
                None
            }
        },
        Err(e) => {
            warn!(error = %e, response = %response, "Failed to parse judge response");
            None
        }
    }
}

/// Extract JSON from a response that may contain markdown code fences.
pub(crate) fn extract_json(text: &str) -> &str {
    let trimmed = text.trim();
    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim();
        }
    }
    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            return after[..end].trim();
        }
    }
    let open = trimmed.find(|c| c == '{' || c == '[');
    if let Some(start) = open {
        let close = if trimmed[start..].starts_with('{') { '}' } else { ']' };
        if let Some(end) = trimmed.rfind(close) {
            if end > start {
                return &trimmed[start..=end];
            }
        }
    }
    trimmed
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &s[..end])
    }
}
