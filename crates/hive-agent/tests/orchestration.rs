use std::sync::Arc;

use serde_json::json;

use hive_agent::{
    ActionSpec, AgentOrchestrator, AgentRunner, FlexibleExecutor, MessageTrace, MessageType, Plan,
    PlanStep,
};
use hive_core::config::OrchestratorConfig;
use hive_core::{EventBus, ProblemKind, RuntimeEvent};
use hive_test_utils::{simple_goal, tool_error, FnExecutor};

fn agent(name: &str, capabilities: &[&str], tool: &str, output: serde_json::Value) -> AgentRunner {
    let tools = Arc::new(FnExecutor::new().with_tool(tool, move |_| Ok(output.to_string())));
    let goal = simple_goal(&format!("{} work", name));
    let plan = Plan::new(
        &goal,
        vec![PlanStep::new("work", "do the work", ActionSpec::tool_call(tool, json!({})))],
    );
    AgentRunner::new(name, goal, plan, FlexibleExecutor::builder(tools).build())
        .with_description(format!("{} agent", name))
        .with_capabilities(capabilities.iter().map(|c| c.to_string()).collect())
}

fn broken_agent(name: &str, capabilities: &[&str]) -> AgentRunner {
    let tools = Arc::new(FnExecutor::new().with_tool("explode", |_| Err(tool_error("explode", "offline"))));
    let goal = simple_goal("never works");
    let plan = Plan::new(
        &goal,
        vec![PlanStep::new("work", "try", ActionSpec::tool_call("explode", json!({}))).with_max_retries(0)],
    );
    AgentRunner::new(name, goal, plan, FlexibleExecutor::builder(tools).build())
        .with_capabilities(capabilities.iter().map(|c| c.to_string()).collect())
}

fn team(bus: Option<Arc<EventBus>>) -> AgentOrchestrator {
    let mut builder = AgentOrchestrator::builder()
        .register_runner(agent("researcher", &["research", "facts"], "search", json!({"facts": ["bees fly"]})))
        .register_runner(agent("writer", &["write", "article"], "draft", json!({"draft": "Bees fly."})));
    if let Some(bus) = bus {
        builder = builder.event_bus(bus);
    }
    builder.build().unwrap()
}

fn invoked(messages: &[hive_agent::AgentMessage]) -> Vec<String> {
    let mut trace = MessageTrace::new();
    for m in messages {
        trace.push(m.clone()).unwrap();
    }
    trace.invoked_agents()
}

#[tokio::test]
async fn test_dispatch_routes_by_keywords() {
    let bus = Arc::new(EventBus::default());
    let mut rx = bus.subscribe();
    let orch = team(Some(bus));

    let result = orch
        .dispatch(json!({"topic": "bees"}), "write an article about bees")
        .await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.handled_by, vec!["writer".to_string()]);
    assert_eq!(result.results["writer"], json!({"draft": "Bees fly."}));

    // only the matching agent was asked
    let checks: Vec<_> = result
        .messages
        .iter()
        .filter(|m| m.message_type == MessageType::CapabilityCheck)
        .collect();
    assert_eq!(checks.len(), 1);
    assert_eq!(checks[0].to_agent.as_deref(), Some("writer"));

    let invoked = invoked(&result.messages);
    assert!(result.handled_by.iter().all(|a| invoked.contains(a)));

    let mut published = 0;
    while let Ok(event) = rx.try_recv() {
        if matches!(event, RuntimeEvent::MessageSent { .. }) {
            published += 1;
        }
    }
    assert_eq!(published, result.messages.len());
}

#[tokio::test]
async fn test_unmatched_request_has_no_capable_agent() {
    let orch = team(None);
    let result = orch.dispatch(json!({}), "bake a cake").await;

    assert!(!result.success);
    assert!(result.handled_by.is_empty());
    assert_eq!(result.problems[0].kind, ProblemKind::NoCapableAgent);
    // root, a check and a response per agent, and the answer to the root
    assert_eq!(result.messages.len(), 6);
}

#[tokio::test]
async fn test_low_threshold_accepts_uncertain_agent() {
    let orch = AgentOrchestrator::builder()
        .config(OrchestratorConfig {
            uncertain_threshold: 0.1,
            ..OrchestratorConfig::default()
        })
        .register_runner(agent("generalist", &["anything"], "do", json!({"done": true})))
        .build()
        .unwrap();
    let result = orch.dispatch(json!({}), "bake a cake").await;
    assert!(result.success);
    assert_eq!(result.handled_by, vec!["generalist".to_string()]);
}

#[tokio::test]
async fn test_failing_agent_reports_problem() {
    let orch = AgentOrchestrator::builder()
        .register_runner(broken_agent("fragile", &["deploy"]))
        .build()
        .unwrap();
    let result = orch.dispatch(json!({}), "deploy the service").await;

    assert!(!result.success);
    assert!(result.handled_by.is_empty());
    assert_eq!(result.problems.last().unwrap().kind, ProblemKind::AgentFailed);
    let last = result.messages.last().unwrap();
    assert_eq!(last.message_type, MessageType::Response);
    assert_eq!(last.parent_id.as_deref(), Some(result.messages[0].id.as_str()));
    assert_eq!(last.content["success"], false);
    assert!(last.content["error"].as_str().unwrap().contains("fragile failed"));
}

#[tokio::test]
async fn test_broadcast_collects_every_agent() {
    let orch = team(None);
    let result = orch.broadcast("status report", json!({})).await;

    assert!(result.success);
    assert_eq!(result.results.len(), 2);
    assert_eq!(result.messages[0].message_type, MessageType::Broadcast);
    let invoked = invoked(&result.messages);
    assert!(result.handled_by.iter().all(|a| invoked.contains(a)));
}

fn unanswered(messages: &[hive_agent::AgentMessage]) -> Vec<String> {
    messages
        .iter()
        .filter(|m| m.requires_response)
        .filter(|m| {
            !messages.iter().any(|r| {
                r.parent_id.as_deref() == Some(m.id.as_str())
                    && matches!(r.message_type, MessageType::Response | MessageType::CapabilityResponse)
            })
        })
        .map(|m| format!("{} {}", m.message_type, m.id))
        .collect()
}

#[tokio::test]
async fn test_every_request_in_trace_is_answered() {
    let orch = team(None);

    let routed = orch.dispatch(json!({"topic": "bees"}), "write an article about bees").await;
    assert!(routed.success);
    assert_eq!(unanswered(&routed.messages), Vec::<String>::new());
    let answer = routed.messages.last().unwrap();
    assert_eq!(answer.from_agent.as_deref(), Some("orchestrator"));
    assert_eq!(answer.content["success"], true);
    assert_eq!(answer.content["results"]["writer"], json!({"draft": "Bees fly."}));

    let refused = orch.dispatch(json!({}), "bake a cake").await;
    assert!(!refused.success);
    assert_eq!(unanswered(&refused.messages), Vec::<String>::new());

    let direct = orch.dispatch_to("researcher", json!({}), "look it up").await.unwrap();
    assert!(direct.success);
    assert_eq!(unanswered(&direct.messages), Vec::<String>::new());

    let broadcast = orch.broadcast("status report", json!({})).await;
    assert!(broadcast.success);
    assert_eq!(unanswered(&broadcast.messages), Vec::<String>::new());
    let closing = broadcast.messages.last().unwrap();
    assert_eq!(closing.parent_id.as_deref(), Some(broadcast.messages[0].id.as_str()));

    let failing = AgentOrchestrator::builder()
        .register_runner(broken_agent("fragile", &["deploy"]))
        .build()
        .unwrap()
        .dispatch(json!({}), "deploy the service")
        .await;
    assert!(!failing.success);
    assert_eq!(unanswered(&failing.messages), Vec::<String>::new());
}
