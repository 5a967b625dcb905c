use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use hive_core::error::Result;
use hive_core::goal::Goal;
use hive_core::traits::LlmProvider;
use hive_core::types::{new_id, ChatMessage, CompletionRequest};

use crate::executor::{FlexibleExecutor, PlanExecutionResult};
use crate::judge::extract_json;
use crate::plan::{ActionType, Plan};
use crate::protocol::{AgentHandle, AgentMessage, AgentReply, CapabilityLevel, CapabilityResponse};

/// Share of capability keywords that must appear for a `best_fit`.
const BEST_FIT_RATIO: f64 = 0.75;

/// One agent: a goal, a plan template, and the executor that runs it.
pub struct AgentRunner {
    name: String,
    description: String,
    capabilities: Vec<String>,
    priority: i32,
    goal: Goal,
    plan: Plan,
    executor: FlexibleExecutor,
    /// Used for capability self-assessment, not for plan steps.
    assessor: Option<Arc<dyn LlmProvider>>,
}

/// Static description of an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInfo {
    pub name: String,
    pub description: String,
    pub goal_name: String,
    pub goal_description: String,
    pub capabilities: Vec<String>,
    pub priority: i32,
    pub success_criteria: Vec<String>,
    pub constraints: Vec<String>,
    pub steps: Vec<StepInfo>,
    pub tools: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepInfo {
    pub id: String,
    pub description: String,
    pub action_type: String,
    pub dependencies: Vec<String>,
    pub requires_approval: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl AgentRunner {
    pub fn new(name: impl Into<String>, goal: Goal, plan: Plan, executor: FlexibleExecutor) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            capabilities: vec![],
            priority: 0,
            goal,
            plan,
            executor,
            assessor: None,
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

    /// Let a model judge capability instead of the keyword heuristic.
    pub fn with_assessor(mut self, llm: Arc<dyn LlmProvider>) -> Self {
        self.assessor = Some(llm);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn capabilities(&self) -> &[String] {
        &self.capabilities
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn goal(&self) -> &Goal {
        &self.goal
    }

    pub fn executor(&self) -> &FlexibleExecutor {
        &self.executor
    }

    /// Run the plan template once. Object inputs are merged key by key into
    /// the plan context; the whole input is also available as `input`.
    pub async fn run(&self, input: serde_json::Value) -> Result<PlanExecutionResult> {
        let mut plan = self.plan.clone();
        plan.id = new_id();

        let mut context = BTreeMap::new();
        if let serde_json::Value::Object(map) = &input {
            for (k, v) in map {
                context.insert(k.clone(), v.clone());
            }
        }
        context.insert("input".to_string(), input);

        info!(agent = %self.name, plan_id = %plan.id, "Agent run started");
        self.executor.execute(self.goal.clone(), plan, context).await
    }

    pub fn info(&self) -> AgentInfo {
        let mut tools: Vec<String> = self
            .executor
            .tool_definitions()
            .into_iter()
            .map(|d| d.name)
            .collect();
        tools.sort();

        AgentInfo {
            name: self.name.clone(),
            description: self.description.clone(),
            goal_name: self.goal.name.clone(),
            goal_description: self.goal.description.clone(),
            capabilities: self.capabilities.clone(),
            priority: self.priority,
            success_criteria: self
                .goal
                .success_criteria
                .iter()
                .map(|c| c.description.clone())
                .collect(),
            constraints: self
                .goal
                .constraints
                .iter()
                .map(|c| c.description.clone())
                .collect(),
            steps: self
                .plan
                .steps
                .iter()
                .map(|s| StepInfo {
                    id: s.id.clone(),
                    description: s.description.clone(),
                    action_type: s.action.action_type.to_string(),
                    dependencies: s.dependencies.iter().cloned().collect(),
                    requires_approval: s.needs_approval(),
                })
                .collect(),
            tools,
        }
    }

    /// Structural checks plus the bindings each step needs.
    pub fn validate(&self) -> ValidationResult {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        if let Err(e) = self.plan.validate() {
            errors.push(e.to_string());
        }

        let tools: Vec<String> = self
            .executor
            .tool_definitions()
            .into_iter()
            .map(|d| d.name)
            .collect();
        for step in &self.plan.steps {
            match step.action.action_type {
                ActionType::ToolCall => {
                    if let Some(name) = &step.action.tool_name {
                        if !tools.contains(name) {
                            errors.push(format!("step {} uses unknown tool {}", step.id, name));
                        }
                    }
                }
                ActionType::LlmQuery if !self.executor.has_llm() => {
                    warnings.push(format!(
                        "step {} queries a model but none is configured",
                        step.id
                    ));
                }
                _ => {}
            }
        }

        if self.goal.success_criteria.is_empty() {
            warnings.push("goal has no success criteria".to_string());
        }
        if self.capabilities.is_empty() {
            warnings.push("agent declares no capabilities; it is only chosen as a fallback".to_string());
        }

        ValidationResult {
            valid: errors.is_empty(),
            errors,
            warnings,
        }
    }

    /// Keyword-overlap estimate of fit.
    pub fn heuristic_capability(&self, message: &AgentMessage) -> CapabilityResponse {
        let keywords: Vec<&String> = self
            .capabilities
            .iter()
            .filter(|c| !c.trim().is_empty())
            .collect();
        let text = message.text().to_lowercase();
        let matched: Vec<&str> = keywords
            .iter()
            .filter(|k| text.contains(&k.to_lowercase()))
            .map(|k| k.as_str())
            .collect();

        if keywords.is_empty() || matched.is_empty() {
            return CapabilityResponse::new(
                &self.name,
                CapabilityLevel::Uncertain,
                0.2,
                "no capability keywords match the request",
            );
        }

        let ratio = matched.len() as f64 / keywords.len() as f64;
        let reasoning = format!("matched {} of {} keywords: {}", matched.len(), keywords.len(), matched.join(", "));
        let response = if ratio >= BEST_FIT_RATIO {
            CapabilityResponse::new(&self.name, CapabilityLevel::BestFit, ratio, reasoning)
        } else {
            CapabilityResponse::new(&self.name, CapabilityLevel::CanHandle, 0.5 + ratio / 2.0, reasoning)
        };
        response.with_estimated_steps(self.plan.steps.len() as u32)
    }

    async fn assess_with_model(
        &self,
        llm: &dyn LlmProvider,
        message: &AgentMessage,
    ) -> Option<CapabilityResponse> {
        let prompt = format!(
            r#"You are the agent "{}". {}

Your capabilities: {}

Request: {}
Content: {}

Can you handle this request? Respond with ONLY valid JSON:
{{
  "level": "best_fit" | "can_handle" | "uncertain" | "cannot_handle",
  "confidence": 0.0-1.0,
  "reasoning": "brief explanation",
  "estimated_steps": 3,
  "dependencies": []
}}"#,
            self.name,
            self.description,
            self.capabilities.join(", "),
            message.intent,
            message.content,
        );

        let request = CompletionRequest::new(vec![ChatMessage::user(prompt)]).with_max_tokens(512);
        let response = match llm.complete(request).await {
            Ok(r) => r,
            Err(e) => {
                warn!(agent = %self.name, error = %e, "Capability self-assessment failed");
                return None;
            }
        };
        parse_assessment(&self.name, &response.content)
    }
}

#[derive(Deserialize)]
struct Assessment {
    level: String,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    reasoning: String,
    #[serde(default)]
    estimated_steps: Option<u32>,
    #[serde(default)]
    dependencies: Vec<String>,
}

fn parse_assessment(agent: &str, text: &str) -> Option<CapabilityResponse> {
    let parsed: Assessment = serde_json::from_str(extract_json(text)).ok()?;
    let level = CapabilityLevel::parse(&parsed.level)?;
    let mut response = CapabilityResponse::new(agent, level, parsed.confidence, parsed.reasoning)
        .with_dependencies(parsed.dependencies);
    response.estimated_steps = parsed.estimated_steps;
    Some(response)
}

impl AgentHandle for AgentRunner {
    fn name(&self) -> &str {
        &self.name
    }

    fn check_capability<'a>(&'a self, message: &'a AgentMessage) -> BoxFuture<'a, CapabilityResponse> {
        Box::pin(async move {
            if let Some(llm) = &self.assessor {
                if let Some(response) = self.assess_with_model(llm.as_ref(), message).await {
                    debug!(agent = %self.name, level = %response.level, "Model capability assessment");
                    return response;
                }
                warn!(agent = %self.name, "Unusable capability assessment, using keyword heuristic");
            }
            self.heuristic_capability(message)
        })
    }

    fn handle<'a>(&'a self, message: &'a AgentMessage) -> BoxFuture<'a, Result<AgentReply>> {
        Box::pin(async move {
            let result = self.run(message.content.clone()).await?;
            let mut reply = if result.is_success() {
                AgentReply::success(result.output().clone())
            } else {
                AgentReply::failure(
                    result
                        .feedback
                        .clone()
                        .unwrap_or_else(|| format!("run ended {}", result.status)),
                )
            };
            reply.run_id = Some(result.run.id().to_string());
            Ok(reply)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{ActionSpec, PlanStep};
    use hive_test_utils::{simple_goal, FnExecutor, MockProvider};
    use serde_json::json;

    fn runner(capabilities: &[&str]) -> AgentRunner {
        let tools = Arc::new(
            FnExecutor::new().with_tool("echo", |input| Ok(json!({"echo": input["text"]}).to_string())),
        );
        let goal = simple_goal("echo text");
        let plan = Plan::new(
            &goal,
            vec![PlanStep::new(
                "echo",
                "echo the text",
                ActionSpec::tool_call("echo", json!({"text": "{{text}}"})),
            )],
        );
        AgentRunner::new("echoer", goal, plan, FlexibleExecutor::builder(tools).build())
            .with_capabilities(capabilities.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn test_heuristic_levels() {
        let r = runner(&["echo", "repeat", "text", "copy"]);
        let all = AgentMessage::request("echo and repeat this text, copy it", json!(null));
        assert_eq!(r.heuristic_capability(&all).level, CapabilityLevel::BestFit);

        let some = AgentMessage::request("please echo", json!(null));
        let resp = r.heuristic_capability(&some);
        assert_eq!(resp.level, CapabilityLevel::CanHandle);
        assert!(resp.confidence > 0.5 && resp.confidence < 1.0);

        let none = AgentMessage::request("book a flight", json!(null));
        let resp = r.heuristic_capability(&none);
        assert_eq!(resp.level, CapabilityLevel::Uncertain);
        assert_eq!(resp.confidence, 0.2);
    }

    #[test]
    fn test_heuristic_reads_content() {
        let r = runner(&["invoice"]);
        let msg = AgentMessage::request("process this", json!({"kind": "invoice"}));
        assert_eq!(r.heuristic_capability(&msg).level, CapabilityLevel::BestFit);
    }

    #[tokio::test]
    async fn test_model_assessment_and_fallback() {
        let llm = Arc::new(MockProvider::new().with_text(
            r#"{"level": "can_handle", "confidence": 1.4, "reasoning": "close enough", "dependencies": ["fetcher"]}"#,
        ));
        let r = runner(&["echo"]).with_assessor(llm);
        let msg = AgentMessage::request("book a flight", json!(null));
        let resp = r.check_capability(&msg).await;
        assert_eq!(resp.level, CapabilityLevel::CanHandle);
        assert_eq!(resp.confidence, 1.0);
        assert_eq!(resp.dependencies, vec!["fetcher".to_string()]);

        let bad = Arc::new(MockProvider::new().with_text("I think so?"));
        let r = runner(&["echo"]).with_assessor(bad);
        let resp = r.check_capability(&AgentMessage::request("echo", json!(null))).await;
        assert_eq!(resp.level, CapabilityLevel::BestFit);
    }

    #[tokio::test]
    async fn test_run_merges_input_into_context() {
        let r = runner(&["echo"]);
        let result = r.run(json!({"text": "hello"})).await.unwrap();
        assert!(result.is_success());
        assert_eq!(result.output(), &json!({"echo": "hello"}));
        assert_eq!(result.plan.context["input"], json!({"text": "hello"}));
    }

    #[tokio::test]
    async fn test_handle_maps_result_to_reply() {
        let r = runner(&["echo"]);
        let msg = AgentMessage::request("echo", json!({"text": "hi"}));
        let reply = r.handle(&msg).await.unwrap();
        assert!(reply.success);
        assert_eq!(reply.output["echo"], "hi");
        assert!(reply.run_id.is_some());
    }

    #[test]
    fn test_info_and_validate() {
        let r = runner(&["echo"]).with_description("repeats text");
        let info = r.info();
        assert_eq!(info.tools, vec!["echo".to_string()]);
        assert_eq!(info.steps[0].action_type, "tool_call");

        let report = r.validate();
        assert!(report.valid);
        assert!(report
            .warnings
            .iter()
            .any(|w| w.contains("success criteria")));

        let goal = simple_goal("x");
        let plan = Plan::new(
            &goal,
            vec![PlanStep::new("s", "s", ActionSpec::tool_call("missing", json!({})))],
        );
        let broken = AgentRunner::new(
            "broken",
            goal,
            plan,
            FlexibleExecutor::builder(Arc::new(FnExecutor::new())).build(),
        );
        let report = broken.validate();
        assert!(!report.valid);
        assert!(report.errors[0].contains("unknown tool missing"));
    }
}
