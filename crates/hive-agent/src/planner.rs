use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use hive_core::error::{HiveError, Result};
use hive_core::goal::Goal;
use hive_core::traits::LlmProvider;
use hive_core::types::{ChatMessage, CompletionRequest, ToolDefinition};

use crate::judge::extract_json;
use crate::plan::{Plan, PlanStep};

/// Why the engine asked for new steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplanTrigger {
    pub step_id: String,
    pub reason: String,
    #[serde(default)]
    pub error: Option<String>,
    /// 1-based count of replans in this run, including this one.
    pub attempt: u32,
}

/// Regenerates the unfinished part of a plan.
pub trait Planner: Send + Sync {
    fn replan<'a>(
        &'a self,
        goal: &'a Goal,
        plan: &'a Plan,
        trigger: &'a ReplanTrigger,
    ) -> BoxFuture<'a, Result<Vec<PlanStep>>>;
}

/// Returns a fixed list of recovery steps.
pub struct StaticPlanner {
    steps: Vec<PlanStep>,
}

impl StaticPlanner {
    pub fn new(steps: Vec<PlanStep>) -> Self {
        Self { steps }
    }
}

impl Planner for StaticPlanner {
    fn replan<'a>(
        &'a self,
        _goal: &'a Goal,
        _plan: &'a Plan,
        trigger: &'a ReplanTrigger,
    ) -> BoxFuture<'a, Result<Vec<PlanStep>>> {
        Box::pin(async move {
            if self.steps.is_empty() {
                return Err(HiveError::Planner(format!(
                    "no recovery steps declared for {}",
                    trigger.step_id
                )));
            }
            Ok(self.steps.clone())
        })
    }
}

/// Asks a model for a JSON array of replacement steps.
pub struct LlmPlanner {
    llm: Arc<dyn LlmProvider>,
    tools: Vec<ToolDefinition>,
    max_tokens: u32,
}

impl LlmPlanner {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self {
            llm,
            tools: vec![],
            max_tokens: 4096,
        }
    }

    /// Tools the model may reference in `tool_call` steps.
    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    fn prompt(&self, goal: &Goal, plan: &Plan, trigger: &ReplanTrigger) -> String {
        let tools = if self.tools.is_empty() {
            "(none)".to_string()
        } else {
            self.tools
                .iter()
                .map(|t| format!("- {}: {}", t.name, t.description))
                .collect::<Vec<_>>()
                .join("\n")
        };
        let progress = serde_json::to_string_pretty(&plan.to_feedback_context())
            .unwrap_or_else(|_| "{}".to_string());

        format!(
            r#"You are revising a plan that ran into trouble.

Goal: {}

Progress so far:
{}

Step `{}` needs a new approach: {}
Error: {}

Available tools:
{}

Steps that already succeeded are kept. Write the steps that replace everything
else. Use new, unique ids. Dependencies may reference kept steps.

Respond with ONLY a JSON array of steps:
[
  {{
    "id": "unique_id",
    "description": "what the step does",
    "action": {{"action_type": "tool_call", "tool_name": "name", "tool_args": {{}}}},
    "dependencies": ["other_id"]
  }}
]
For a model query use {{"action_type": "llm_query", "prompt": "..."}}."#,
            goal.description,
            progress,
            trigger.step_id,
            trigger.reason,
            trigger.error.as_deref().unwrap_or("none"),
            tools,
        )
    }
}

impl Planner for LlmPlanner {
    fn replan<'a>(
        &'a self,
        goal: &'a Goal,
        plan: &'a Plan,
        trigger: &'a ReplanTrigger,
    ) -> BoxFuture<'a, Result<Vec<PlanStep>>> {
        Box::pin(async move {
            let request = CompletionRequest::new(vec![ChatMessage::user(
                self.prompt(goal, plan, trigger),
            )])
            .with_max_tokens(self.max_tokens);

            let response = self
                .llm
                .complete(request)
                .await
                .map_err(|e| HiveError::Planner(format!("model call failed: {}", e)))?;

            let steps = parse_steps(&response.content)?;
            info!(
                step_id = %trigger.step_id,
                new_steps = steps.len(),
                attempt = trigger.attempt,
                "Model produced replacement steps"
            );
            Ok(steps)
        })
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StepsPayload {
    List(Vec<PlanStep>),
    Wrapped { steps: Vec<PlanStep> },
}

/// Parse steps from a model response (bare array or `{"steps": [...]}`).
pub fn parse_steps(response: &str) -> Result<Vec<PlanStep>> {
    let json_str = extract_json(response);
    let steps = match serde_json::from_str::<StepsPayload>(json_str) {
        Ok(StepsPayload::List(steps)) | Ok(StepsPayload::Wrapped { steps }) => steps,
        Err(e) => {
            warn!(error = %e, "Planner response was not a step list");
            return Err(HiveError::Planner(format!("unparseable steps: {}", e)));
        }
    };
    if steps.is_empty() {
        return Err(HiveError::Planner("planner returned no steps".into()));
    }
    Ok(steps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{ActionSpec, ActionType, StepStatus};
    use hive_test_utils::MockProvider;
    use serde_json::json;

    fn trigger() -> ReplanTrigger {
        ReplanTrigger {
            step_id: "fetch".into(),
            reason: "source is down".into(),
            error: Some("503".into()),
            attempt: 1,
        }
    }

    fn plan(goal: &Goal) -> Plan {
        Plan::new(
            goal,
            vec![PlanStep::new("fetch", "fetch", ActionSpec::tool_call("get", json!({})))],
        )
    }

    #[tokio::test]
    async fn test_static_planner() {
        let goal = Goal::new("g", "get data");
        let planner = StaticPlanner::new(vec![PlanStep::new(
            "mirror",
            "use the mirror",
            ActionSpec::tool_call("get_mirror", json!({})),
        )]);
        let steps = planner.replan(&goal, &plan(&goal), &trigger()).await.unwrap();
        assert_eq!(steps[0].id, "mirror");

        let empty = StaticPlanner::new(vec![]);
        assert!(empty.replan(&goal, &plan(&goal), &trigger()).await.is_err());
    }

    #[tokio::test]
    async fn test_llm_planner_parses_fenced_array() {
        let response = r#"```json
[
  {"id": "mirror", "description": "use mirror", "action": {"action_type": "tool_call", "tool_name": "get_mirror"}},
  {"id": "sum", "description": "summarize", "action": {"action_type": "llm_query", "prompt": "sum {{mirror}}"}, "dependencies": ["mirror"]}
]
```"#;
        let llm = Arc::new(MockProvider::new().with_text(response));
        let planner = LlmPlanner::new(llm.clone());
        let goal = Goal::new("g", "get data");
        let steps = planner.replan(&goal, &plan(&goal), &trigger()).await.unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[1].action.action_type, ActionType::LlmQuery);
        assert!(steps[1].dependencies.contains("mirror"));
        assert_eq!(steps[0].status(), StepStatus::Pending);

        let prompt = llm.requests()[0].messages[0].text();
        assert!(prompt.contains("source is down"));
        assert!(prompt.contains("get data"));
    }

    #[test]
    fn test_parse_wrapped_and_errors() {
        let wrapped = r#"{"steps": [{"id": "a", "description": "a", "action": {"action_type": "llm_query", "prompt": "x"}}]}"#;
        assert_eq!(parse_steps(wrapped).unwrap().len(), 1);
        assert!(parse_steps("[]").is_err());
        assert!(parse_steps("no idea").is_err());
    }

    #[tokio::test]
    async fn test_llm_planner_provider_error() {
        let llm = Arc::new(MockProvider::new().with_error("overloaded"));
        let planner = LlmPlanner::new(llm);
        let goal = Goal::new("g", "get data");
        let err = planner
            .replan(&goal, &plan(&goal), &trigger())
            .await
            .unwrap_err();
        assert!(matches!(err, HiveError::Planner(_)));
    }
}
