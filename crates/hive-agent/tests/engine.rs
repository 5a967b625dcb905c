use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::json;
use tokio::task::JoinHandle;

use hive_agent::{
    create_default_judge, ActionSpec, ApprovalGate, EvaluationRule, ExecutionStatus,
    FlexibleExecutor, Plan, PlanStep, RunLogger,
};
use hive_core::config::{ApprovalMode, ExecutorConfig};
use hive_core::{
    ApprovalRequest, ApprovalResult, DecisionKind, EventBus, JudgmentAction, ProblemKind,
    RunStatus, RuntimeEvent,
};
use hive_test_utils::{simple_goal, tool_error, FnExecutor};

/// Answers every approval request seen on the bus until the run completes.
fn spawn_reviewer<F>(bus: &EventBus, gate: Arc<ApprovalGate>, answer: F) -> JoinHandle<Vec<ApprovalRequest>>
where
    F: Fn(&ApprovalRequest) -> ApprovalResult + Send + 'static,
{
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        let mut seen = Vec::new();
        loop {
            match rx.recv().await {
                Ok(RuntimeEvent::ApprovalRequested { request }) => {
                    assert!(gate.resolve(answer(&request)).await);
                    seen.push(request);
                }
                Ok(RuntimeEvent::RunCompleted { .. }) | Err(_) => break,
                Ok(_) => {}
            }
        }
        seen
    })
}

/// `transfer` refuses amounts above 100.
fn bank() -> Arc<FnExecutor> {
    Arc::new(FnExecutor::new().with_tool("transfer", |input| {
        let amount = input["amount"].as_i64().unwrap_or(0);
        if amount > 100 {
            Err(tool_error("transfer", "amount over limit"))
        } else {
            Ok(json!({ "sent": amount }).to_string())
        }
    }))
}

fn escalating_executor(tools: Arc<FnExecutor>, bus: Arc<EventBus>, gate: Arc<ApprovalGate>) -> FlexibleExecutor {
    let judge = create_default_judge().with_rule(
        EvaluationRule::new("failures_need_review", "not success", JudgmentAction::Escalate)
            .with_priority(300)
            .with_feedback("Step {step} failed ({error}), asking a reviewer"),
    );
    FlexibleExecutor::builder(tools)
        .judge(judge)
        .event_bus(bus)
        .approval_gate(gate)
        .build()
}

fn transfer_plan(amount: i64) -> (hive_core::Goal, Plan) {
    let goal = simple_goal("move money");
    let plan = Plan::new(
        &goal,
        vec![PlanStep::new(
            "pay",
            "pay the invoice",
            ActionSpec::tool_call("transfer", json!({ "amount": amount })),
        )],
    );
    (goal, plan)
}

#[tokio::test]
async fn test_escalation_rejected_fails_without_rerun() {
    let bus = Arc::new(EventBus::default());
    let gate = Arc::new(ApprovalGate::new(bus.clone()));
    let tools = bank();
    let reviewer = spawn_reviewer(&bus, gate.clone(), |req| {
        ApprovalResult::reject(&req.correlation_id, "too much money")
    });

    let executor = escalating_executor(tools.clone(), bus.clone(), gate);
    let (goal, plan) = transfer_plan(500);
    let result = executor.execute(goal, plan, BTreeMap::new()).await.unwrap();

    assert_eq!(result.status, ExecutionStatus::Failed);
    assert_eq!(result.run.status(), RunStatus::Failed);
    assert_eq!(tools.call_count("transfer"), 1);
    assert!(result
        .run
        .problems()
        .iter()
        .any(|p| p.kind == ProblemKind::ApprovalRejected));
    assert!(result
        .run
        .decisions()
        .iter()
        .any(|d| d.kind() == DecisionKind::Escalation));

    let seen = reviewer.await.unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].step_id, "pay");
}

#[tokio::test]
async fn test_escalation_approved_reruns_with_original_params() {
    let bus = Arc::new(EventBus::default());
    let gate = Arc::new(ApprovalGate::new(bus.clone()));
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    // fails once, then goes through
    let tools = Arc::new(FnExecutor::new().with_tool("transfer", move |input| {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            Err(tool_error("transfer", "bank offline"))
        } else {
            Ok(json!({ "sent": input["amount"] }).to_string())
        }
    }));
    let reviewer = spawn_reviewer(&bus, gate.clone(), |req| ApprovalResult::approve(&req.correlation_id));

    let executor = escalating_executor(tools.clone(), bus.clone(), gate);
    let (goal, plan) = transfer_plan(500);
    let result = executor.execute(goal, plan, BTreeMap::new()).await.unwrap();

    assert_eq!(result.status, ExecutionStatus::Completed);
    let calls = tools.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].input, json!({ "amount": 500 }));
    assert_eq!(result.output(), &json!({ "sent": 500 }));
    reviewer.await.unwrap();
}

#[tokio::test]
async fn test_escalation_modified_reruns_with_new_params() {
    let bus = Arc::new(EventBus::default());
    let gate = Arc::new(ApprovalGate::new(bus.clone()));
    let tools = bank();
    let reviewer = spawn_reviewer(&bus, gate.clone(), |req| {
        ApprovalResult::modify(&req.correlation_id, json!({ "amount": 50 }))
    });

    let executor = escalating_executor(tools.clone(), bus.clone(), gate);
    let (goal, plan) = transfer_plan(500);
    let result = executor.execute(goal, plan, BTreeMap::new()).await.unwrap();

    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(tools.calls()[1].input, json!({ "amount": 50 }));
    assert_eq!(result.output(), &json!({ "sent": 50 }));
    reviewer.await.unwrap();
}

/// `deploy` fails `failures` times before it goes through.
fn flaky_deploy(failures: usize) -> Arc<FnExecutor> {
    let attempts = Arc::new(AtomicUsize::new(0));
    Arc::new(FnExecutor::new().with_tool("deploy", move |_| {
        if attempts.fetch_add(1, Ordering::SeqCst) < failures {
            Err(tool_error("deploy", "registry busy"))
        } else {
            Ok(json!({ "deployed": true }).to_string())
        }
    }))
}

#[tokio::test]
async fn test_approved_step_failure_is_judged_and_retried() {
    let bus = Arc::new(EventBus::default());
    let gate = Arc::new(ApprovalGate::new(bus.clone()));
    let tools = flaky_deploy(1);
    let reviewer = spawn_reviewer(&bus, gate.clone(), |req| ApprovalResult::approve(&req.correlation_id));

    let goal = simple_goal("ship the release");
    let plan = Plan::new(
        &goal,
        vec![PlanStep::new("deploy", "deploy", ActionSpec::tool_call("deploy", json!({})))
            .requiring_approval()],
    );
    let executor = FlexibleExecutor::builder(tools.clone())
        .event_bus(bus)
        .approval_gate(gate)
        .build();
    let result = executor.execute(goal, plan, BTreeMap::new()).await.unwrap();

    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(tools.call_count("deploy"), 2);
    let judged: Vec<_> = result
        .run
        .decisions()
        .iter()
        .filter(|d| d.kind() == DecisionKind::StepExecution)
        .map(|d| d.outcome().unwrap().judgment.as_ref().map(|j| j.action))
        .collect();
    assert_eq!(judged, vec![Some(JudgmentAction::Retry), Some(JudgmentAction::Continue)]);

    let seen = reviewer.await.unwrap();
    assert_eq!(seen.len(), 1);
}

#[tokio::test]
async fn test_escalated_rerun_failure_goes_back_to_reviewer() {
    let bus = Arc::new(EventBus::default());
    let gate = Arc::new(ApprovalGate::new(bus.clone()));
    let tools = flaky_deploy(2);
    let reviewer = spawn_reviewer(&bus, gate.clone(), |req| ApprovalResult::approve(&req.correlation_id));

    let executor = escalating_executor(tools.clone(), bus.clone(), gate);
    let goal = simple_goal("ship the release");
    let plan = Plan::new(
        &goal,
        vec![PlanStep::new("deploy", "deploy", ActionSpec::tool_call("deploy", json!({})))],
    );
    let result = executor.execute(goal, plan, BTreeMap::new()).await.unwrap();

    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(tools.call_count("deploy"), 3);
    let escalations = result
        .run
        .decisions()
        .iter()
        .filter(|d| d.kind() == DecisionKind::Escalation)
        .count();
    assert_eq!(escalations, 2);
    assert_eq!(reviewer.await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_suspended_run_announces_suspension() {
    let bus = Arc::new(EventBus::default());
    let mut rx = bus.subscribe();
    let goal = simple_goal("wait for sign-off");
    let plan = Plan::new(
        &goal,
        vec![PlanStep::new("confirm", "sign-off", ActionSpec::human_approval("ok?"))],
    );
    let executor = FlexibleExecutor::builder(bank())
        .event_bus(bus)
        .config(ExecutorConfig {
            approval_mode: ApprovalMode::Suspend,
            ..ExecutorConfig::default()
        })
        .build();
    let result = executor.execute(goal, plan, BTreeMap::new()).await.unwrap();
    assert_eq!(result.status, ExecutionStatus::AwaitingApproval);

    let mut suspended = 0;
    while let Ok(event) = rx.try_recv() {
        match event {
            RuntimeEvent::RunCompleted { .. } => panic!("suspended run reported as completed"),
            RuntimeEvent::RunSuspended { pending, .. } => {
                assert_eq!(pending.len(), 1);
                suspended += 1;
            }
            _ => {}
        }
    }
    assert_eq!(suspended, 1);
}

#[tokio::test]
async fn test_human_approval_step_gates_downstream_work() {
    let bus = Arc::new(EventBus::default());
    let gate = Arc::new(ApprovalGate::new(bus.clone()));
    let tools = bank();
    let reviewer = spawn_reviewer(&bus, gate.clone(), |req| ApprovalResult::approve(&req.correlation_id));

    let goal = simple_goal("pay after sign-off");
    let plan = Plan::new(
        &goal,
        vec![
            PlanStep::new(
                "confirm",
                "manager sign-off",
                ActionSpec::human_approval("pay 10 to the vendor?"),
            ),
            PlanStep::new(
                "pay",
                "pay the vendor",
                ActionSpec::tool_call("transfer", json!({ "amount": 10 })),
            )
            .depends_on("confirm"),
        ],
    );
    let executor = FlexibleExecutor::builder(tools.clone())
        .event_bus(bus.clone())
        .approval_gate(gate)
        .build();
    let result = executor.execute(goal, plan, BTreeMap::new()).await.unwrap();

    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(tools.call_count("transfer"), 1);
    let seen = reviewer.await.unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].step_id, "confirm");
}

#[tokio::test]
async fn test_unanswered_approval_times_out() {
    let bus = Arc::new(EventBus::default());
    let tools = bank();
    let goal = simple_goal("wait forever");
    let plan = Plan::new(
        &goal,
        vec![PlanStep::new("confirm", "sign-off", ActionSpec::human_approval("ok?"))],
    );
    let executor = FlexibleExecutor::builder(tools)
        .event_bus(bus)
        .config(ExecutorConfig {
            approval_timeout_secs: Some(0),
            ..ExecutorConfig::default()
        })
        .build();
    let result = executor.execute(goal, plan, BTreeMap::new()).await.unwrap();

    assert_eq!(result.status, ExecutionStatus::Failed);
    assert!(result
        .run
        .problems()
        .iter()
        .any(|p| p.kind == ProblemKind::ApprovalTimeout));
}

#[tokio::test]
async fn test_run_log_follows_executor_run() {
    let tmp = tempfile::tempdir().unwrap();
    let bus = Arc::new(EventBus::default());
    let cancel = tokio_util::sync::CancellationToken::new();
    let logger = RunLogger::new(tmp.path().to_path_buf(), 3);
    let handle = logger.spawn(&bus, None, cancel.clone());

    let executor = FlexibleExecutor::builder(bank()).event_bus(bus).build();
    let (goal, plan) = transfer_plan(20);
    let result = executor.execute(goal, plan, BTreeMap::new()).await.unwrap();
    assert!(result.is_success());

    let path = handle.await.unwrap().unwrap();
    assert!(path.starts_with(tmp.path().join(result.run.id())));
    let content = std::fs::read_to_string(path).unwrap();
    let types: Vec<String> = content
        .lines()
        .map(|l| serde_json::from_str::<serde_json::Value>(l).unwrap()["event_type"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(types.first().map(String::as_str), Some("run_started"));
    assert_eq!(types.last().map(String::as_str), Some("run_completed"));
    assert!(types.iter().any(|t| t == "decision"));
}
