use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use hive_core::approval::{ApprovalDecision, ApprovalRequest, ApprovalResult};
use hive_core::config::{ApprovalMode, ExecutorConfig};
use hive_core::decision::{DecisionKind, DecisionOption, JudgmentAction, Outcome};
use hive_core::error::{HiveError, Result};
use hive_core::event::EventBus;
use hive_core::goal::{Goal, GoalStatus};
use hive_core::run::{Problem, ProblemKind, Run, RunStatus, RunSummary, Severity};
use hive_core::traits::{LlmProvider, ToolExecutor};
use hive_core::types::{RuntimeEvent, ToolDefinition};

use crate::approval::{ApprovalGate, ApprovalWait};
use crate::judge::{create_default_judge, HybridJudge};
use crate::plan::{ActionType, Plan, StepStatus};
use crate::planner::{Planner, ReplanTrigger};
use crate::recorder::DecisionRecorder;
use crate::worker::{StepExecutionResult, SubplanReport, SubplanRunner, Worker};

/// Terminal (or suspended) state of a plan execution.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Completed,
    Failed,
    Aborted,
    AwaitingApproval,
}

impl ExecutionStatus {
    pub fn run_status(&self) -> RunStatus {
        match self {
            Self::Completed => RunStatus::Completed,
            Self::Failed => RunStatus::Failed,
            Self::Aborted => RunStatus::Aborted,
            Self::AwaitingApproval => RunStatus::AwaitingApproval,
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Aborted => write!(f, "aborted"),
            Self::AwaitingApproval => write!(f, "awaiting_approval"),
        }
    }
}

/// One applied replan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplanRecord {
    pub revision: u32,
    pub trigger_step: String,
    pub decision_id: String,
    pub discarded: Vec<String>,
    pub added: Vec<String>,
}

/// Why a step is waiting on a human.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalReason {
    /// The step requires approval before it runs.
    Required,
    /// The judge escalated after the step ran.
    Escalated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingApproval {
    pub request: ApprovalRequest,
    pub step_id: String,
    pub decision_id: String,
    pub reason: ApprovalReason,
}

/// Everything one run owns. Serializable so a suspended run can be resumed
/// later, possibly by another process.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RunState {
    goal: Goal,
    plan: Plan,
    recorder: DecisionRecorder,
    step_results: BTreeMap<String, StepExecutionResult>,
    replans: Vec<ReplanRecord>,
    dispatches: usize,
    /// Steps a reviewer already approved; their retries skip the gate.
    #[serde(default)]
    approved: BTreeSet<String>,
    /// Open decision of each in-flight step, by step id.
    #[serde(skip)]
    running: BTreeMap<String, String>,
    /// Decisions of in-flight steps discarded by a replan; their completions are ignored.
    #[serde(skip)]
    orphaned: BTreeSet<String>,
}

/// A run parked on one or more approvals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuspendedRun {
    state: RunState,
    pending: Vec<PendingApproval>,
}

impl SuspendedRun {
    pub fn run_id(&self) -> &str {
        self.state.recorder.run_id()
    }

    pub fn pending(&self) -> &[PendingApproval] {
        &self.pending
    }

    pub fn plan(&self) -> &Plan {
        &self.state.plan
    }
}

/// Result of executing (or resuming) a plan.
#[derive(Debug, Clone)]
pub struct PlanExecutionResult {
    pub status: ExecutionStatus,
    /// The run with its decision log. A snapshot when suspended.
    pub run: Run,
    pub goal: Goal,
    pub plan: Plan,
    pub step_results: BTreeMap<String, StepExecutionResult>,
    pub replans: Vec<ReplanRecord>,
    /// Why the run ended the way it did.
    pub feedback: Option<String>,
    pub pending_approval: Option<ApprovalRequest>,
    pub suspended: Option<SuspendedRun>,
}

impl PlanExecutionResult {
    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Completed
    }

    pub fn summary(&self) -> RunSummary {
        self.run.summary()
    }

    /// Final output of the run.
    pub fn output(&self) -> &serde_json::Value {
        self.run.output()
    }
}

enum Flow {
    Continue,
    Terminal(ExecutionStatus, String),
    Suspend(PendingApproval),
}

/// What a judged step asks for next. Escalation is resolved by the caller.
enum Verdict {
    Flow(Flow),
    Escalate(String),
}

#[derive(Clone)]
struct ExecutorParts {
    tools: Arc<dyn ToolExecutor>,
    llm: Option<Arc<dyn LlmProvider>>,
    judge: Arc<HybridJudge>,
    planner: Option<Arc<dyn Planner>>,
    config: ExecutorConfig,
    event_bus: Option<Arc<EventBus>>,
    gate: Arc<ApprovalGate>,
    cancel: CancellationToken,
}

/// Builder for [`FlexibleExecutor`].
pub struct FlexibleExecutorBuilder {
    tools: Arc<dyn ToolExecutor>,
    llm: Option<Arc<dyn LlmProvider>>,
    judge: Option<HybridJudge>,
    planner: Option<Arc<dyn Planner>>,
    config: ExecutorConfig,
    event_bus: Option<Arc<EventBus>>,
    gate: Option<Arc<ApprovalGate>>,
    cancel: CancellationToken,
}

impl FlexibleExecutorBuilder {
    pub fn llm(mut self, llm: Arc<dyn LlmProvider>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn judge(mut self, judge: HybridJudge) -> Self {
        self.judge = Some(judge);
        self
    }

    pub fn planner(mut self, planner: Arc<dyn Planner>) -> Self {
        self.planner = Some(planner);
        self
    }

    pub fn config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn approval_gate(mut self, gate: Arc<ApprovalGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn build(self) -> FlexibleExecutor {
        let gate = self.gate.unwrap_or_else(|| {
            let bus = self.event_bus.clone().unwrap_or_default();
            Arc::new(ApprovalGate::new(bus))
        });
        let parts = ExecutorParts {
            tools: self.tools,
            llm: self.llm,
            judge: Arc::new(self.judge.unwrap_or_else(create_default_judge)),
            planner: self.planner,
            config: self.config,
            event_bus: self.event_bus,
            gate,
            cancel: self.cancel,
        };
        FlexibleExecutor::from_parts(parts, 0)
    }
}

/// Worker–Judge plan executor with approval gates.
///
/// Each step is dispatched to the [`Worker`], judged by the [`HybridJudge`],
/// and the judgment decides whether the step is accepted, retried, replanned,
/// escalated to a human, or the run aborted. Every choice is recorded as a
/// decision on the run.
pub struct FlexibleExecutor {
    parts: ExecutorParts,
    worker: Arc<Worker>,
    depth: usize,
}

impl FlexibleExecutor {
    pub fn builder(tools: Arc<dyn ToolExecutor>) -> FlexibleExecutorBuilder {
        FlexibleExecutorBuilder {
            tools,
            llm: None,
            judge: None,
            planner: None,
            config: ExecutorConfig::default(),
            event_bus: None,
            gate: None,
            cancel: CancellationToken::new(),
        }
    }

    fn from_parts(parts: ExecutorParts, depth: usize) -> Self {
        let mut worker = Worker::new(parts.tools.clone())
            .with_max_iterations(parts.config.llm_max_iterations);
        if let Some(llm) = &parts.llm {
            worker = worker.with_llm(llm.clone());
        }
        if depth < parts.config.max_subplan_depth {
            worker = worker.with_subplans(Arc::new(ChildRunner {
                parts: parts.clone(),
                depth: depth + 1,
            }));
        }
        Self {
            parts,
            worker: Arc::new(worker),
            depth,
        }
    }

    pub fn approval_gate(&self) -> &Arc<ApprovalGate> {
        &self.parts.gate
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.parts.config
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.parts.cancel.clone()
    }

    /// Tools the worker can call.
    pub fn tool_definitions(&self) -> Vec<ToolDefinition> {
        self.parts.tools.definitions()
    }

    pub fn has_llm(&self) -> bool {
        self.parts.llm.is_some()
    }

    pub fn has_planner(&self) -> bool {
        self.parts.planner.is_some()
    }

    /// Execute `plan` towards `goal`. `context` is merged into the plan
    /// context before the first step.
    ///
    /// Only an invalid plan is an error; every runtime failure is reported
    /// in the result's status, decisions, and problems.
    pub async fn execute(
        &self,
        mut goal: Goal,
        mut plan: Plan,
        context: BTreeMap<String, serde_json::Value>,
    ) -> Result<PlanExecutionResult> {
        plan.validate()?;
        plan.context.extend(context);
        if plan.goal_id.is_empty() {
            plan.goal_id = goal.id.clone();
        }
        goal.activate();

        let recorder = DecisionRecorder::start(&goal, self.parts.event_bus.clone());
        info!(
            run_id = %recorder.run_id(),
            goal = %goal.name,
            steps = plan.steps.len(),
            depth = self.depth,
            "Plan execution started"
        );

        let state = RunState {
            goal,
            plan,
            recorder,
            step_results: BTreeMap::new(),
            replans: vec![],
            dispatches: 0,
            approved: BTreeSet::new(),
            running: BTreeMap::new(),
            orphaned: BTreeSet::new(),
        };
        self.drive(state, vec![]).await
    }

    /// Continue a suspended run with the answer to one of its pending approvals.
    pub async fn resume(
        &self,
        suspended: SuspendedRun,
        result: ApprovalResult,
    ) -> Result<PlanExecutionResult> {
        let SuspendedRun { mut state, mut pending } = suspended;
        let idx = pending
            .iter()
            .position(|p| p.request.correlation_id == result.correlation_id)
            .ok_or_else(|| HiveError::ApprovalMismatch {
                expected: pending
                    .first()
                    .map(|p| p.request.correlation_id.clone())
                    .unwrap_or_default(),
                got: result.correlation_id.clone(),
            })?;
        let answered = pending.remove(idx);

        state.recorder.attach_event_bus(self.parts.event_bus.clone());
        state.recorder.resume();
        info!(
            run_id = %state.recorder.run_id(),
            step_id = %answered.step_id,
            decision = ?result.decision,
            "Resuming suspended run"
        );
        if let Some(bus) = &self.parts.event_bus {
            bus.publish(RuntimeEvent::ApprovalResolved {
                correlation_id: result.correlation_id.clone(),
                decision: result.decision,
            });
        }

        let flow = match self.apply_approval(&mut state, answered.clone(), result).await? {
            Verdict::Flow(flow) => flow,
            Verdict::Escalate(rationale) => {
                self.request_approval(
                    &mut state,
                    &answered.step_id,
                    ApprovalReason::Escalated,
                    Some(rationale),
                )
                .await?
            }
        };
        match flow {
            Flow::Continue => self.drive(state, pending).await,
            Flow::Suspend(p) => {
                pending.push(p);
                Ok(self.finish(state, ExecutionStatus::AwaitingApproval, None, pending))
            }
            Flow::Terminal(status, feedback) => {
                Ok(self.finish(state, status, Some(feedback), pending))
            }
        }
    }

    async fn drive(
        &self,
        mut state: RunState,
        mut pending: Vec<PendingApproval>,
    ) -> Result<PlanExecutionResult> {
        let max_parallel = self.parts.config.max_parallel_steps.max(1);
        let mut in_flight: JoinSet<(String, String, StepExecutionResult)> = JoinSet::new();
        let mut terminal: Option<(ExecutionStatus, String)> = None;

        loop {
            if terminal.is_none() && pending.is_empty() {
                if self.parts.cancel.is_cancelled() {
                    state.recorder.report_problem(Problem::new(
                        ProblemKind::Cancelled,
                        "run cancelled before the next dispatch",
                    ));
                    terminal = Some((ExecutionStatus::Aborted, "cancelled".into()));
                } else {
                    let ready = state.plan.ready_steps();
                    for step_id in ready {
                        if in_flight.len() >= max_parallel {
                            break;
                        }
                        if state.dispatches >= self.parts.config.max_total_dispatches {
                            let msg = format!(
                                "dispatch budget of {} exhausted",
                                self.parts.config.max_total_dispatches
                            );
                            state
                                .recorder
                                .report_problem(Problem::new(ProblemKind::JudgmentExhausted, &msg));
                            terminal = Some((ExecutionStatus::Aborted, msg));
                            break;
                        }

                        state.plan.step_mut(&step_id)?.transition(StepStatus::Running)?;
                        state.dispatches += 1;

                        let needs_approval = !state.approved.contains(&step_id)
                            && state
                                .plan
                                .step(&step_id)
                                .map(|s| s.needs_approval())
                                .unwrap_or(false);
                        if needs_approval {
                            match self
                                .request_approval(&mut state, &step_id, ApprovalReason::Required, None)
                                .await?
                            {
                                Flow::Continue => {}
                                Flow::Suspend(p) => {
                                    pending.push(p);
                                    break;
                                }
                                Flow::Terminal(status, feedback) => {
                                    terminal = Some((status, feedback));
                                    break;
                                }
                            }
                            continue;
                        }

                        let decision_id = self.open_step_decision(&mut state, &step_id, false)?;
                        state.running.insert(step_id.clone(), decision_id.clone());
                        let step = match state.plan.step(&step_id) {
                            Some(s) => s.clone(),
                            None => continue,
                        };
                        let context = state.plan.context.clone();
                        let worker = self.worker.clone();
                        in_flight.spawn(async move {
                            let result = worker.execute(&step, &context).await;
                            (step.id, decision_id, result)
                        });
                    }
                }
            }

            if in_flight.is_empty() {
                if terminal.is_some() || !pending.is_empty() {
                    break;
                }
                if state.plan.ready_steps().is_empty() {
                    terminal = Some(if state.plan.is_complete() {
                        (ExecutionStatus::Completed, "all steps done".into())
                    } else {
                        let stuck: Vec<String> = state
                            .plan
                            .steps
                            .iter()
                            .filter(|s| !s.status().is_done())
                            .map(|s| format!("{} ({})", s.id, s.status()))
                            .collect();
                        (
                            ExecutionStatus::Failed,
                            format!("no runnable steps left: {}", stuck.join(", ")),
                        )
                    });
                    break;
                }
                continue;
            }

            let halted = terminal.is_some() || !pending.is_empty();
            match in_flight.join_next().await {
                Some(Ok((step_id, decision_id, result))) => {
                    match self
                        .complete_step(&mut state, &step_id, &decision_id, result, halted)
                        .await?
                    {
                        Flow::Continue => {}
                        Flow::Suspend(p) => pending.push(p),
                        Flow::Terminal(status, feedback) => {
                            if terminal.is_none() {
                                terminal = Some((status, feedback));
                            }
                        }
                    }
                }
                Some(Err(e)) => {
                    error!(error = %e, "Step task failed to join");
                    state.recorder.report_problem(
                        Problem::new(ProblemKind::StepFailure, format!("step task lost: {}", e))
                            .with_severity(Severity::Critical),
                    );
                    if terminal.is_none() {
                        terminal = Some((ExecutionStatus::Failed, "step task lost".into()));
                    }
                }
                None => {}
            }
        }

        Ok(match terminal {
            Some((status, feedback)) => self.finish(state, status, Some(feedback), pending),
            None => self.finish(state, ExecutionStatus::AwaitingApproval, None, pending),
        })
    }

    fn open_step_decision(
        &self,
        state: &mut RunState,
        step_id: &str,
        approved: bool,
    ) -> Result<String> {
        let step = state
            .plan
            .step(step_id)
            .ok_or_else(|| HiveError::Validation(format!("unknown step: {}", step_id)))?;
        let attempt = step.retry_count() + 1;
        let max_retries = step
            .max_retries
            .unwrap_or(self.parts.config.max_retries_per_step);
        let reasoning = if approved {
            "approved by reviewer".to_string()
        } else if attempt > 1 {
            format!("retry {} of {}", attempt - 1, max_retries)
        } else {
            "dependencies satisfied".to_string()
        };
        let decision = state
            .recorder
            .decide(DecisionKind::StepExecution, &step.description)
            .step(step_id)
            .option(
                DecisionOption::new("execute", format!("run {} action", step.action.action_type))
                    .with_prediction(if step.expected_outputs.is_empty() {
                        "step succeeds".to_string()
                    } else {
                        format!("produces {}", step.expected_outputs.join(", "))
                    }),
            )
            .choose("execute", reasoning)
            .build();
        let decision_id = state.recorder.open(decision)?;

        debug!(step_id = %step_id, attempt, decision_id = %decision_id, "Step dispatched");
        if let Some(bus) = &self.parts.event_bus {
            bus.publish(RuntimeEvent::StepDispatched {
                run_id: state.recorder.run_id().to_string(),
                step_id: step_id.to_string(),
                decision_id: decision_id.clone(),
                attempt,
            });
        }
        Ok(decision_id)
    }

    async fn complete_step(
        &self,
        state: &mut RunState,
        step_id: &str,
        decision_id: &str,
        result: StepExecutionResult,
        halted: bool,
    ) -> Result<Flow> {
        if let Some(bus) = &self.parts.event_bus {
            bus.publish(RuntimeEvent::StepCompleted {
                run_id: state.recorder.run_id().to_string(),
                step_id: step_id.to_string(),
                success: result.success,
                latency_ms: result.latency_ms,
            });
        }

        if state.running.get(step_id).map(String::as_str) == Some(decision_id) {
            state.running.remove(step_id);
        }
        if state.orphaned.remove(decision_id) {
            debug!(step_id = %step_id, "Completion for a step discarded by replan");
            state
                .recorder
                .seal(decision_id, outcome_of(&result).with_metric("discarded", 1.0))?;
            return Ok(Flow::Continue);
        }

        match self
            .judge_step(state, step_id, decision_id, result, halted)
            .await?
        {
            Verdict::Flow(flow) => Ok(flow),
            Verdict::Escalate(rationale) => {
                self.request_approval(state, step_id, ApprovalReason::Escalated, Some(rationale))
                    .await
            }
        }
    }

    /// Judge a finished attempt, seal its decision, and apply the judgment.
    /// The step is `running`, or `awaiting_approval` for an approved re-run.
    async fn judge_step(
        &self,
        state: &mut RunState,
        step_id: &str,
        decision_id: &str,
        result: StepExecutionResult,
        halted: bool,
    ) -> Result<Verdict> {
        let run_id = state.recorder.run_id().to_string();
        let step = state
            .plan
            .step(step_id)
            .cloned()
            .ok_or_else(|| HiveError::Validation(format!("unknown step: {}", step_id)))?;
        let judgment = self
            .parts
            .judge
            .evaluate(&step, &result, &state.plan.context)
            .await;
        info!(
            step_id = %step_id,
            success = result.success,
            action = %judgment.action,
            source = ?judgment.source,
            "Step judged"
        );
        if let Some(bus) = &self.parts.event_bus {
            bus.publish(RuntimeEvent::JudgmentMade {
                run_id,
                step_id: step_id.to_string(),
                judgment: judgment.clone(),
            });
        }

        state
            .recorder
            .seal(decision_id, outcome_of(&result).with_judgment(judgment.clone()))?;
        state.step_results.insert(step_id.to_string(), result.clone());

        let action = if halted {
            // draining after a stop: settle the step, take no new branches
            if judgment.action == JudgmentAction::Continue {
                JudgmentAction::Continue
            } else {
                let s = state.plan.step_mut(step_id)?;
                s.transition(StepStatus::Failed)?;
                s.error = result.error.clone();
                return Ok(Verdict::Flow(Flow::Continue));
            }
        } else {
            judgment.action
        };

        let flow = match action {
            JudgmentAction::Continue => {
                self.accept_step(state, step_id, &result)?;
                Flow::Continue
            }
            JudgmentAction::Retry => self.retry_step(state, step_id, &result, &judgment.rationale)?,
            JudgmentAction::Replan => {
                let s = state.plan.step_mut(step_id)?;
                s.transition(StepStatus::Failed)?;
                s.error = result.error.clone();
                self.replan(state, step_id, &judgment.rationale, result.error.clone())
                    .await?
            }
            JudgmentAction::Escalate => return Ok(Verdict::Escalate(judgment.rationale)),
            JudgmentAction::Abort => {
                let s = state.plan.step_mut(step_id)?;
                s.transition(StepStatus::Failed)?;
                s.error = result.error.clone();
                s.transition(StepStatus::Aborted)?;
                let decision = state
                    .recorder
                    .decide(DecisionKind::Abort, format!("abort run after step {}", step_id))
                    .step(step_id)
                    .option(DecisionOption::new("abort", "stop the run"))
                    .choose("abort", &judgment.rationale)
                    .build();
                let abort_id = state.recorder.record(
                    decision,
                    Outcome::failure(
                        result.error.clone().unwrap_or_else(|| "aborted by judge".into()),
                        "run aborted",
                    )
                    .with_judgment(judgment.clone()),
                )?;
                state.recorder.report_problem(
                    Problem::new(ProblemKind::Aborted, judgment.rationale.clone())
                        .with_decision(abort_id)
                        .with_severity(Severity::Critical),
                );
                Flow::Terminal(ExecutionStatus::Aborted, judgment.rationale)
            }
        };
        Ok(Verdict::Flow(flow))
    }

    /// Mark a step succeeded and publish its outputs to the plan context.
    fn accept_step(
        &self,
        state: &mut RunState,
        step_id: &str,
        result: &StepExecutionResult,
    ) -> Result<()> {
        let step = state.plan.step_mut(step_id)?;
        step.transition(StepStatus::Succeeded)?;
        step.result = Some(result.output.clone());
        step.error = None;
        let expected = step.expected_outputs.clone();

        let context = &mut state.plan.context;
        context.insert(step_id.to_string(), result.output.clone());
        for key in &expected {
            match result.output.get(key) {
                Some(v) => {
                    context.insert(key.clone(), v.clone());
                }
                None if expected.len() == 1 => {
                    context.insert(key.clone(), result.output.clone());
                }
                None => {}
            }
        }
        Ok(())
    }

    fn retry_step(
        &self,
        state: &mut RunState,
        step_id: &str,
        result: &StepExecutionResult,
        rationale: &str,
    ) -> Result<Flow> {
        let max_retries = self.parts.config.max_retries_per_step;
        let step = state.plan.step_mut(step_id)?;
        step.transition(StepStatus::Failed)?;
        step.error = result.error.clone();
        let budget = step.max_retries.unwrap_or(max_retries);

        if step.retry_count() < budget {
            step.requeue()?;
            debug!(step_id = %step_id, retry = step.retry_count(), budget, "Step requeued");
            return Ok(Flow::Continue);
        }

        step.transition(StepStatus::Aborted)?;
        let attempts = step.retry_count() + 1;
        let msg = format!(
            "step {} failed {} times: {}",
            step_id,
            attempts,
            result.error.as_deref().unwrap_or(rationale)
        );
        let decision = state
            .recorder
            .decide(DecisionKind::RetryExhausted, format!("give up on step {}", step_id))
            .step(step_id)
            .option(DecisionOption::new("retry", "try again").with_score(0.0))
            .option(DecisionOption::new("abort", "stop the run").with_score(1.0))
            .choose("abort", format!("retry budget of {} spent", budget))
            .build();
        let decision_id = state.recorder.record(
            decision,
            Outcome::failure(msg.clone(), "retries exhausted")
                .with_metric("attempts", attempts as f64),
        )?;
        state.recorder.report_problem(
            Problem::new(ProblemKind::JudgmentExhausted, &msg)
                .with_decision(decision_id)
                .with_severity(Severity::Error),
        );
        Ok(Flow::Terminal(ExecutionStatus::Aborted, msg))
    }

    async fn replan(
        &self,
        state: &mut RunState,
        step_id: &str,
        rationale: &str,
        error: Option<String>,
    ) -> Result<Flow> {
        let attempt = state.replans.len() as u32 + 1;
        let decision = state
            .recorder
            .decide(DecisionKind::Replan, format!("regenerate steps after {}", step_id))
            .step(step_id)
            .option(DecisionOption::new("replan", "replace unfinished steps"))
            .option(DecisionOption::new("abort", "stop the run"))
            .choose("replan", rationale)
            .build();
        let decision_id = state.recorder.open(decision)?;

        let new_steps = match &self.parts.planner {
            None => Err(HiveError::Planner("no planner configured".into())),
            Some(_) if attempt > self.parts.config.max_replans => Err(HiveError::Planner(format!(
                "replan budget of {} spent",
                self.parts.config.max_replans
            ))),
            Some(planner) => {
                let trigger = ReplanTrigger {
                    step_id: step_id.to_string(),
                    reason: rationale.to_string(),
                    error,
                    attempt,
                };
                planner.replan(&state.goal, &state.plan, &trigger).await
            }
        };

        let applied = new_steps.and_then(|steps| {
            let added: Vec<String> = steps.iter().map(|s| s.id.clone()).collect();
            let mut candidate = state.plan.clone();
            let discarded = candidate.replace_unfinished(steps);
            candidate.validate()?;
            Ok((candidate, discarded, added))
        });

        match applied {
            Ok((plan, discarded, added)) => {
                for id in &discarded {
                    if let Some(decision_id) = state.running.remove(id) {
                        state.orphaned.insert(decision_id);
                    }
                    state.approved.remove(id);
                }
                state.plan = plan;
                state.recorder.seal(
                    &decision_id,
                    Outcome::success(
                        serde_json::json!({
                            "revision": state.plan.revision,
                            "discarded": discarded,
                            "added": added,
                        }),
                        format!("replaced {} steps with {}", discarded.len(), added.len()),
                    ),
                )?;
                info!(
                    step_id = %step_id,
                    revision = state.plan.revision,
                    discarded = ?discarded,
                    added = ?added,
                    "Plan revised"
                );
                if let Some(bus) = &self.parts.event_bus {
                    bus.publish(RuntimeEvent::Replanned {
                        run_id: state.recorder.run_id().to_string(),
                        revision: state.plan.revision,
                        discarded: discarded.clone(),
                        added: added.clone(),
                    });
                }
                state.replans.push(ReplanRecord {
                    revision: state.plan.revision,
                    trigger_step: step_id.to_string(),
                    decision_id,
                    discarded,
                    added,
                });
                Ok(Flow::Continue)
            }
            Err(e) => {
                let msg = format!("replan after {} failed: {}", step_id, e);
                state
                    .recorder
                    .seal(&decision_id, Outcome::failure(e.to_string(), "replan failed"))?;
                state.plan.step_mut(step_id)?.transition(StepStatus::Aborted)?;
                state.recorder.report_problem(
                    Problem::new(ProblemKind::ReplanExhausted, &msg)
                        .with_decision(decision_id)
                        .with_severity(Severity::Error),
                );
                Ok(Flow::Terminal(ExecutionStatus::Aborted, msg))
            }
        }
    }

    /// Put a step (already `awaiting_approval` or `running`) in front of a
    /// human. An approved re-run the judge escalates again goes back to the
    /// reviewer.
    async fn request_approval(
        &self,
        state: &mut RunState,
        step_id: &str,
        reason: ApprovalReason,
        rationale: Option<String>,
    ) -> Result<Flow> {
        let (mut reason, mut rationale) = (reason, rationale);
        loop {
            match self.ask_reviewer(state, step_id, reason, rationale).await? {
                Verdict::Flow(flow) => return Ok(flow),
                Verdict::Escalate(again) => {
                    reason = ApprovalReason::Escalated;
                    rationale = Some(again);
                }
            }
        }
    }

    async fn ask_reviewer(
        &self,
        state: &mut RunState,
        step_id: &str,
        reason: ApprovalReason,
        rationale: Option<String>,
    ) -> Result<Verdict> {
        let step = state.plan.step_mut(step_id)?;
        if step.status() == StepStatus::Running {
            step.transition(StepStatus::AwaitingApproval)?;
        }
        let step = step.clone();

        let rationale = rationale.unwrap_or_else(|| {
            step.action
                .approval_message
                .clone()
                .unwrap_or_else(|| format!("step {} requires approval", step.id))
        });
        let kind = match reason {
            ApprovalReason::Required => DecisionKind::Approval,
            ApprovalReason::Escalated => DecisionKind::Escalation,
        };
        let decision = state
            .recorder
            .decide(kind, format!("ask a human about step {}", step.id))
            .step(&step.id)
            .option(
                DecisionOption::new("ask_human", "pause for a reviewer")
                    .with_prediction("approve, modify or reject"),
            )
            .option(DecisionOption::new("proceed", "run without review").with_score(0.0))
            .choose("ask_human", &rationale)
            .build();
        let decision_id = state.recorder.open(decision)?;

        let request = ApprovalRequest::new(
            state.recorder.run_id(),
            &step.id,
            &step.description,
            &rationale,
        )
        .with_risk(step.action.risk)
        .with_preview(serde_json::json!({
            "action_type": step.action.action_type.to_string(),
            "params": step.action.params(),
            "last_error": step.error,
        }));
        let pending = PendingApproval {
            request: request.clone(),
            step_id: step.id.clone(),
            decision_id,
            reason,
        };

        if self.parts.config.approval_mode == ApprovalMode::Suspend {
            self.parts.gate.announce(&request);
            return Ok(Verdict::Flow(Flow::Suspend(pending)));
        }

        let correlation_id = request.correlation_id.clone();
        let rx = self.parts.gate.request(request).await;
        let timeout = self
            .parts
            .config
            .approval_timeout_secs
            .map(Duration::from_secs);

        let waited = tokio::select! {
            w = self.parts.gate.wait(&correlation_id, rx, timeout) => w,
            _ = self.parts.cancel.cancelled() => {
                self.parts.gate.cancel(&correlation_id).await;
                info!(step_id = %step.id, "Cancelled while awaiting approval, suspending");
                return Ok(Verdict::Flow(Flow::Suspend(pending)));
            }
        };

        match waited {
            ApprovalWait::Resolved(result) => self.apply_approval(state, pending, result).await,
            ApprovalWait::Closed => Ok(Verdict::Flow(Flow::Suspend(pending))),
            ApprovalWait::TimedOut => {
                let msg = format!("approval for step {} timed out", step.id);
                state.recorder.seal(
                    &pending.decision_id,
                    Outcome::failure(&msg, "no answer before the deadline"),
                )?;
                let s = state.plan.step_mut(&step.id)?;
                s.transition(StepStatus::Failed)?;
                s.error = Some(msg.clone());
                state.recorder.report_problem(
                    Problem::new(ProblemKind::ApprovalTimeout, &msg)
                        .with_decision(&pending.decision_id)
                        .with_severity(Severity::Error),
                );
                Ok(Verdict::Flow(Flow::Terminal(ExecutionStatus::Failed, msg)))
            }
        }
    }

    /// Apply a reviewer's answer. Only this path moves a step out of
    /// `awaiting_approval`.
    ///
    /// Approve and modify re-run the step; the re-run is judged like any
    /// other attempt, and later retries of the step skip the gate.
    async fn apply_approval(
        &self,
        state: &mut RunState,
        pending: PendingApproval,
        result: ApprovalResult,
    ) -> Result<Verdict> {
        let step_id = pending.step_id.as_str();
        let verdict = serde_json::json!({
            "decision": result.decision,
            "reason": result.reason,
            "modified_params": result.modified_params,
        });

        if result.decision == ApprovalDecision::Reject {
            let reason = result.reason.clone().unwrap_or_else(|| "no reason given".into());
            let msg = format!("step {} rejected: {}", step_id, reason);
            state.recorder.seal(
                &pending.decision_id,
                Outcome::failure(&msg, "rejected by reviewer").with_result(verdict),
            )?;
            let s = state.plan.step_mut(step_id)?;
            s.transition(StepStatus::Failed)?;
            s.error = Some(msg.clone());
            state.recorder.report_problem(
                Problem::new(ProblemKind::ApprovalRejected, &msg)
                    .with_decision(&pending.decision_id)
                    .with_severity(Severity::Error),
            );
            return Ok(Verdict::Flow(Flow::Terminal(ExecutionStatus::Failed, msg)));
        }

        state.recorder.seal(
            &pending.decision_id,
            Outcome::success(verdict, format!("{:?} by reviewer", result.decision).to_lowercase()),
        )?;

        let step = state
            .plan
            .step(step_id)
            .cloned()
            .ok_or_else(|| HiveError::Validation(format!("unknown step: {}", step_id)))?;

        if step.action.action_type == ActionType::HumanApproval {
            let output = serde_json::json!({
                "approved": true,
                "decision": result.decision,
                "params": result.modified_params,
            });
            let mut exec = StepExecutionResult::success(output);
            exec.raw = serde_json::json!({ "correlation_id": result.correlation_id });
            state.step_results.insert(step_id.to_string(), exec.clone());
            self.accept_step(state, step_id, &exec)?;
            return Ok(Verdict::Flow(Flow::Continue));
        }

        let action = match (&result.decision, &result.modified_params) {
            (ApprovalDecision::Modify, Some(params)) => step.action.with_params(params.clone()),
            _ => step.action.clone(),
        };
        // retries keep the reviewed parameters
        state.plan.step_mut(step_id)?.action = action.clone();
        state.approved.insert(step_id.to_string());

        if state.dispatches >= self.parts.config.max_total_dispatches {
            let msg = format!(
                "dispatch budget of {} exhausted",
                self.parts.config.max_total_dispatches
            );
            let s = state.plan.step_mut(step_id)?;
            s.transition(StepStatus::Failed)?;
            s.error = Some(msg.clone());
            s.transition(StepStatus::Aborted)?;
            state
                .recorder
                .report_problem(Problem::new(ProblemKind::JudgmentExhausted, &msg));
            return Ok(Verdict::Flow(Flow::Terminal(ExecutionStatus::Aborted, msg)));
        }
        state.dispatches += 1;

        let decision_id = self.open_step_decision(state, step_id, true)?;
        let exec = self
            .worker
            .execute_action(step_id, &action, &state.plan.context)
            .await;
        if let Some(bus) = &self.parts.event_bus {
            bus.publish(RuntimeEvent::StepCompleted {
                run_id: state.recorder.run_id().to_string(),
                step_id: step_id.to_string(),
                success: exec.success,
                latency_ms: exec.latency_ms,
            });
        }
        self.judge_step(state, step_id, &decision_id, exec, false).await
    }

    fn finish(
        &self,
        mut state: RunState,
        status: ExecutionStatus,
        feedback: Option<String>,
        pending: Vec<PendingApproval>,
    ) -> PlanExecutionResult {
        let output = final_output(&state);
        state.recorder.set_output(output);

        if status == ExecutionStatus::AwaitingApproval {
            state
                .recorder
                .suspend(pending.iter().map(|p| p.request.correlation_id.clone()).collect());
            info!(
                run_id = %state.recorder.run_id(),
                pending = pending.len(),
                "Run suspended awaiting approval"
            );
            let run = state.recorder.run().clone();
            return PlanExecutionResult {
                status,
                run,
                goal: state.goal.clone(),
                plan: state.plan.clone(),
                step_results: state.step_results.clone(),
                replans: state.replans.clone(),
                feedback,
                pending_approval: pending.first().map(|p| p.request.clone()),
                suspended: Some(SuspendedRun { state, pending }),
            };
        }

        let goal_status = match status {
            ExecutionStatus::Completed => {
                if state.goal.has_deterministic_criteria() {
                    let text = output_text(state.recorder.run().output());
                    let results = state.goal.evaluate_deterministic(&text);
                    let eval = state.goal.compute_evaluation(results, vec![]);
                    if eval.passed {
                        GoalStatus::Achieved
                    } else {
                        GoalStatus::Failed
                    }
                } else {
                    GoalStatus::Achieved
                }
            }
            ExecutionStatus::Failed => GoalStatus::Failed,
            _ => GoalStatus::Abandoned,
        };
        state.goal.set_status(goal_status);

        let RunState {
            goal,
            plan,
            recorder,
            step_results,
            replans,
            ..
        } = state;
        let run = recorder.finish(status.run_status());

        if status == ExecutionStatus::Completed {
            info!(
                run_id = %run.id(),
                decisions = run.decisions().len(),
                goal_status = ?goal.status,
                duration_ms = run.duration_ms(),
                "Plan execution completed"
            );
        } else {
            warn!(
                run_id = %run.id(),
                status = %status,
                feedback = feedback.as_deref().unwrap_or(""),
                "Plan execution did not complete"
            );
        }

        PlanExecutionResult {
            status,
            run,
            goal,
            plan,
            step_results,
            replans,
            feedback,
            pending_approval: None,
            suspended: None,
        }
    }
}

struct ChildRunner {
    parts: ExecutorParts,
    depth: usize,
}

impl SubplanRunner for ChildRunner {
    fn run_subplan(&self, goal: Goal, plan: Plan) -> BoxFuture<'static, Result<SubplanReport>> {
        let mut parts = self.parts.clone();
        parts.cancel = parts.cancel.child_token();
        // a nested run cannot hand a suspension back to its parent
        parts.config.approval_mode = ApprovalMode::Wait;
        let child = FlexibleExecutor::from_parts(parts, self.depth);
        let context = plan.context.clone();
        Box::pin(async move {
            let result = child.execute(goal, plan, context).await?;
            Ok(SubplanReport {
                completed: result.is_success(),
                status: result.status.to_string(),
                run_id: result.run.id().to_string(),
                decisions: result.run.decisions().len(),
                output: result.run.output().clone(),
                error: if result.is_success() { None } else { result.feedback },
            })
        })
    }
}

fn outcome_of(result: &StepExecutionResult) -> Outcome {
    let outcome = if result.success {
        Outcome::success(result.output.clone(), result.summary())
    } else {
        Outcome::failure(
            result.error.clone().unwrap_or_else(|| "unknown error".into()),
            result.summary(),
        )
        .with_result(result.raw.clone())
    };
    outcome
        .with_metric("latency_ms", result.latency_ms as f64)
        .with_metric("tokens_used", result.tokens_used as f64)
}

/// Output of the last succeeded step in plan order, or every output keyed
/// by step id when several leaf steps finished.
fn final_output(state: &RunState) -> serde_json::Value {
    let plan = &state.plan;
    let leaves: Vec<&str> = plan
        .steps
        .iter()
        .filter(|s| s.status() == StepStatus::Succeeded)
        .filter(|s| !plan.steps.iter().any(|o| o.dependencies.contains(&s.id)))
        .map(|s| s.id.as_str())
        .collect();
    match leaves.as_slice() {
        [] => serde_json::Value::Null,
        [only] => plan.context.get(*only).cloned().unwrap_or_default(),
        many => serde_json::Value::Object(
            many.iter()
                .map(|id| {
                    (
                        id.to_string(),
                        plan.context.get(*id).cloned().unwrap_or_default(),
                    )
                })
                .collect(),
        ),
    }
}

fn output_text(output: &serde_json::Value) -> String {
    match output {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::judge::EvaluationRule;
    use crate::plan::{ActionSpec, PlanStep};
    use crate::planner::StaticPlanner;
    use hive_test_utils::{goal_expecting, simple_goal, tool_error, FnExecutor};
    use serde_json::json;

    fn ok_tools() -> Arc<FnExecutor> {
        Arc::new(
            FnExecutor::new()
                .with_tool("fetch", |_| Ok(json!({"rows": [1, 2, 3]}).to_string()))
                .with_tool("count", |input| {
                    let n = input["rows"].as_array().map(|a| a.len()).unwrap_or(0);
                    Ok(json!({"count": n}).to_string())
                })
                .with_tool("fail", |_| Err(tool_error("fail", "always broken"))),
        )
    }

    fn two_step_plan(goal: &Goal) -> Plan {
        Plan::new(
            goal,
            vec![
                PlanStep::new("fetch", "fetch rows", ActionSpec::tool_call("fetch", json!({}))),
                PlanStep::new(
                    "count",
                    "count rows",
                    ActionSpec::tool_call("count", json!({"rows": "{{fetch.rows}}"})),
                )
                .depends_on("fetch"),
            ],
        )
    }

    #[tokio::test]
    async fn test_linear_plan_completes() {
        let tools = ok_tools();
        let executor = FlexibleExecutor::builder(tools.clone()).build();
        let goal = simple_goal("count rows");
        let plan = two_step_plan(&goal);
        let result = executor.execute(goal, plan, BTreeMap::new()).await.unwrap();

        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.run.status(), RunStatus::Completed);
        assert_eq!(result.goal.status, GoalStatus::Achieved);
        assert_eq!(result.run.decisions().len(), 2);
        assert_eq!(result.output(), &json!({"count": 3}));
        assert_eq!(tools.calls()[1].input, json!({"rows": [1, 2, 3]}));
        assert!(result.run.decisions().iter().all(|d| d.is_sealed()));
    }

    #[tokio::test]
    async fn test_invalid_plan_is_fatal_without_decisions() {
        let executor = FlexibleExecutor::builder(ok_tools()).build();
        let goal = simple_goal("x");
        let plan = Plan::new(
            &goal,
            vec![PlanStep::new("a", "a", ActionSpec::tool_call("fetch", json!({}))).depends_on("ghost")],
        );
        let err = executor.execute(goal, plan, BTreeMap::new()).await.unwrap_err();
        assert!(matches!(err, HiveError::Validation(_)));
    }

    #[tokio::test]
    async fn test_retry_exhaustion_records_four_decisions() {
        let tools = ok_tools();
        let executor = FlexibleExecutor::builder(tools.clone()).build();
        let goal = simple_goal("doomed");
        let plan = Plan::new(
            &goal,
            vec![PlanStep::new("f", "always fails", ActionSpec::tool_call("fail", json!({})))
                .with_max_retries(2)],
        );
        let result = executor.execute(goal, plan, BTreeMap::new()).await.unwrap();

        assert_eq!(result.status, ExecutionStatus::Aborted);
        assert_eq!(tools.call_count("fail"), 3);
        let decisions = result.run.decisions();
        assert_eq!(decisions.len(), 4);
        assert_eq!(decisions[3].kind(), DecisionKind::RetryExhausted);
        assert_eq!(result.run.problems()[0].kind, ProblemKind::JudgmentExhausted);
        assert_eq!(result.plan.step("f").unwrap().status(), StepStatus::Aborted);
        assert_eq!(result.goal.status, GoalStatus::Abandoned);
    }

    #[tokio::test]
    async fn test_unmet_goal_criteria_fail_goal() {
        let executor = FlexibleExecutor::builder(ok_tools()).build();
        let goal = goal_expecting("count", "\"count\":99");
        let plan = two_step_plan(&goal);
        let result = executor.execute(goal, plan, BTreeMap::new()).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.goal.status, GoalStatus::Failed);
    }

    #[tokio::test]
    async fn test_replan_preserves_succeeded_steps() {
        let tools = ok_tools();
        let judge = HybridJudge::new().with_rule(
            EvaluationRule::new("broken_source", "not success", JudgmentAction::Replan).with_priority(10),
        );
        let planner = Arc::new(StaticPlanner::new(vec![PlanStep::new(
            "count2",
            "count again",
            ActionSpec::tool_call("count", json!({"rows": "{{fetch.rows}}"})),
        )
        .depends_on("fetch")]));
        let executor = FlexibleExecutor::builder(tools.clone())
            .judge(judge)
            .planner(planner)
            .build();
        let goal = simple_goal("count");
        let plan = Plan::new(
            &goal,
            vec![
                PlanStep::new("fetch", "fetch", ActionSpec::tool_call("fetch", json!({}))),
                PlanStep::new("bad", "bad", ActionSpec::tool_call("fail", json!({}))).depends_on("fetch"),
                PlanStep::new("after", "after", ActionSpec::tool_call("count", json!({}))).depends_on("bad"),
            ],
        );
        let result = executor.execute(goal, plan, BTreeMap::new()).await.unwrap();

        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.plan.revision, 1);
        assert_eq!(result.replans.len(), 1);
        assert_eq!(result.replans[0].discarded, vec!["bad".to_string(), "after".to_string()]);
        assert_eq!(result.plan.step("fetch").unwrap().status(), StepStatus::Succeeded);
        assert!(result.plan.step("bad").is_none());
        assert_eq!(tools.call_count("fetch"), 1);

        let kinds: Vec<DecisionKind> = result.run.decisions().iter().map(|d| d.kind()).collect();
        assert!(kinds.contains(&DecisionKind::Replan));
    }

    #[tokio::test]
    async fn test_replan_without_planner_aborts() {
        let judge = HybridJudge::new()
            .with_rule(EvaluationRule::new("r", "not success", JudgmentAction::Replan));
        let executor = FlexibleExecutor::builder(ok_tools()).judge(judge).build();
        let goal = simple_goal("x");
        let plan = Plan::new(
            &goal,
            vec![PlanStep::new("bad", "bad", ActionSpec::tool_call("fail", json!({})))],
        );
        let result = executor.execute(goal, plan, BTreeMap::new()).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Aborted);
        assert_eq!(result.run.problems()[0].kind, ProblemKind::ReplanExhausted);
    }

    #[tokio::test]
    async fn test_judge_abort() {
        let judge = HybridJudge::new()
            .with_rule(EvaluationRule::new("stop", "not success", JudgmentAction::Abort));
        let executor = FlexibleExecutor::builder(ok_tools()).judge(judge).build();
        let goal = simple_goal("x");
        let plan = Plan::new(
            &goal,
            vec![PlanStep::new("bad", "bad", ActionSpec::tool_call("fail", json!({})))],
        );
        let result = executor.execute(goal, plan, BTreeMap::new()).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Aborted);
        let last = result.run.decisions().last().unwrap();
        assert_eq!(last.kind(), DecisionKind::Abort);
        assert_eq!(result.plan.step("bad").unwrap().status(), StepStatus::Aborted);
    }

    #[tokio::test]
    async fn test_cancelled_before_dispatch() {
        let token = CancellationToken::new();
        token.cancel();
        let tools = ok_tools();
        let executor = FlexibleExecutor::builder(tools.clone())
            .cancellation(token)
            .build();
        let goal = simple_goal("x");
        let plan = two_step_plan(&goal);
        let result = executor.execute(goal, plan, BTreeMap::new()).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Aborted);
        assert_eq!(result.run.problems()[0].kind, ProblemKind::Cancelled);
        assert!(tools.calls().is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_budget() {
        let config = ExecutorConfig {
            max_total_dispatches: 2,
            ..ExecutorConfig::default()
        };
        let executor = FlexibleExecutor::builder(ok_tools()).config(config).build();
        let goal = simple_goal("x");
        let plan = Plan::new(
            &goal,
            vec![PlanStep::new("bad", "bad", ActionSpec::tool_call("fail", json!({})))],
        );
        let result = executor.execute(goal, plan, BTreeMap::new()).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Aborted);
        assert_eq!(result.run.decisions().len(), 2);
        assert_eq!(result.run.problems()[0].kind, ProblemKind::JudgmentExhausted);
    }

    #[tokio::test]
    async fn test_parallel_independent_steps() {
        let config = ExecutorConfig {
            max_parallel_steps: 3,
            ..ExecutorConfig::default()
        };
        let executor = FlexibleExecutor::builder(ok_tools()).config(config).build();
        let goal = simple_goal("x");
        let plan = Plan::new(
            &goal,
            vec![
                PlanStep::new("a", "a", ActionSpec::tool_call("fetch", json!({}))),
                PlanStep::new("b", "b", ActionSpec::tool_call("fetch", json!({}))),
                PlanStep::new("c", "c", ActionSpec::tool_call("count", json!({"rows": "{{a.rows}}"})))
                    .depends_on("a")
                    .depends_on("b"),
            ],
        );
        let result = executor.execute(goal, plan, BTreeMap::new()).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.run.decisions().len(), 3);
        assert_eq!(result.output(), &json!({"count": 3}));
    }

    #[tokio::test]
    async fn test_skipped_step_never_runs() {
        let tools = ok_tools();
        let executor = FlexibleExecutor::builder(tools.clone()).build();
        let goal = simple_goal("x");
        let plan = Plan::new(
            &goal,
            vec![
                PlanStep::new("skip", "skip", ActionSpec::tool_call("fail", json!({}))).skipped(),
                PlanStep::new("a", "a", ActionSpec::tool_call("fetch", json!({}))).depends_on("skip"),
            ],
        );
        let result = executor.execute(goal, plan, BTreeMap::new()).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(tools.call_count("fail"), 0);
    }

    #[tokio::test]
    async fn test_subplan_runs_on_child_engine() {
        let executor = FlexibleExecutor::builder(ok_tools()).build();
        let goal = simple_goal("outer");
        let child_goal = Goal::new("inner", "fetch inside");
        let plan = Plan::new(
            &goal,
            vec![PlanStep::new(
                "nested",
                "nested fetch",
                ActionSpec::subplan(
                    child_goal,
                    vec![PlanStep::new("inner_fetch", "fetch", ActionSpec::tool_call("fetch", json!({})))],
                ),
            )],
        );
        let result = executor.execute(goal, plan, BTreeMap::new()).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Completed);
        let nested = &result.step_results["nested"];
        assert_eq!(nested.raw["decisions"], json!(1));
        assert_eq!(nested.output, json!({"rows": [1, 2, 3]}));
    }

    #[tokio::test]
    async fn test_subplan_depth_limit() {
        let config = ExecutorConfig {
            max_subplan_depth: 0,
            max_retries_per_step: 0,
            ..ExecutorConfig::default()
        };
        let executor = FlexibleExecutor::builder(ok_tools()).config(config).build();
        let goal = simple_goal("outer");
        let plan = Plan::new(
            &goal,
            vec![PlanStep::new(
                "nested",
                "nested",
                ActionSpec::subplan(
                    Goal::new("inner", "inner"),
                    vec![PlanStep::new("x", "x", ActionSpec::tool_call("fetch", json!({})))],
                ),
            )],
        );
        let result = executor.execute(goal, plan, BTreeMap::new()).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Aborted);
        assert!(result.step_results["nested"]
            .error
            .as_deref()
            .unwrap()
            .contains("depth"));
    }

    #[tokio::test]
    async fn test_suspend_and_resume_approve() {
        let config = ExecutorConfig {
            approval_mode: ApprovalMode::Suspend,
            ..ExecutorConfig::default()
        };
        let tools = ok_tools();
        let executor = FlexibleExecutor::builder(tools.clone()).config(config).build();
        let goal = simple_goal("x");
        let plan = Plan::new(
            &goal,
            vec![PlanStep::new("fetch", "fetch", ActionSpec::tool_call("fetch", json!({})))
                .requiring_approval()],
        );
        let result = executor.execute(goal, plan, BTreeMap::new()).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::AwaitingApproval);
        assert_eq!(result.run.status(), RunStatus::AwaitingApproval);
        assert_eq!(tools.call_count("fetch"), 0);
        let request = result.pending_approval.clone().unwrap();
        assert_eq!(
            result.plan.step("fetch").unwrap().status(),
            StepStatus::AwaitingApproval
        );

        // round-trip through JSON like a real suspension would
        let json = serde_json::to_string(&result.suspended.unwrap()).unwrap();
        let suspended: SuspendedRun = serde_json::from_str(&json).unwrap();

        let wrong = executor
            .resume(suspended.clone(), ApprovalResult::approve("other"))
            .await;
        assert!(matches!(wrong, Err(HiveError::ApprovalMismatch { .. })));

        let done = executor
            .resume(suspended, ApprovalResult::approve(&request.correlation_id))
            .await
            .unwrap();
        assert_eq!(done.status, ExecutionStatus::Completed);
        assert_eq!(tools.call_count("fetch"), 1);
        let kinds: Vec<DecisionKind> = done.run.decisions().iter().map(|d| d.kind()).collect();
        assert_eq!(kinds, vec![DecisionKind::Approval, DecisionKind::StepExecution]);
    }

    #[tokio::test]
    async fn test_approved_rerun_is_judged_and_retried() {
        let config = ExecutorConfig {
            approval_mode: ApprovalMode::Suspend,
            ..ExecutorConfig::default()
        };
        let attempts = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = attempts.clone();
        let tools = Arc::new(FnExecutor::new().with_tool("deploy", move |_| {
            if counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0 {
                Err(tool_error("deploy", "registry busy"))
            } else {
                Ok(json!({"deployed": true}).to_string())
            }
        }));
        let executor = FlexibleExecutor::builder(tools.clone()).config(config).build();
        let goal = simple_goal("ship");
        let plan = Plan::new(
            &goal,
            vec![PlanStep::new("deploy", "deploy", ActionSpec::tool_call("deploy", json!({})))
                .requiring_approval()],
        );
        let parked = executor.execute(goal, plan, BTreeMap::new()).await.unwrap();
        let request = parked.pending_approval.clone().unwrap();

        let done = executor
            .resume(parked.suspended.unwrap(), ApprovalResult::approve(&request.correlation_id))
            .await
            .unwrap();

        // the retry runs without asking the reviewer again
        assert_eq!(done.status, ExecutionStatus::Completed);
        assert!(done.pending_approval.is_none());
        assert_eq!(tools.call_count("deploy"), 2);
        assert_eq!(done.plan.step("deploy").unwrap().retry_count(), 1);

        let decisions = done.run.decisions();
        let kinds: Vec<DecisionKind> = decisions.iter().map(|d| d.kind()).collect();
        assert_eq!(
            kinds,
            vec![DecisionKind::Approval, DecisionKind::StepExecution, DecisionKind::StepExecution]
        );
        let first_run = decisions[1].outcome().unwrap();
        assert!(!first_run.success);
        assert_eq!(
            first_run.judgment.as_ref().map(|j| j.action),
            Some(JudgmentAction::Retry)
        );
    }

    /// `slow` sleeps, `quick` answers at once, anything else fails.
    struct TimedTools;

    impl ToolExecutor for TimedTools {
        fn execute(&self, call: hive_core::types::ToolUse) -> BoxFuture<'_, hive_core::types::ToolResult> {
            Box::pin(async move {
                match call.name.as_str() {
                    "slow" => {
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        hive_core::types::ToolResult::success(r#"{"slow": true}"#)
                    }
                    "quick" => hive_core::types::ToolResult::success(r#"{"quick": true}"#),
                    _ => hive_core::types::ToolResult::error_json("offline"),
                }
            })
        }

        fn definitions(&self) -> Vec<ToolDefinition> {
            vec![]
        }
    }

    #[tokio::test]
    async fn test_reused_step_id_is_not_taken_for_discarded_run() {
        let config = ExecutorConfig {
            max_parallel_steps: 2,
            ..ExecutorConfig::default()
        };
        let judge = HybridJudge::new().with_rule(
            EvaluationRule::new("source_down", "not success", JudgmentAction::Replan).with_priority(10),
        );
        // the new plan reuses the id of the step still in flight
        let planner = Arc::new(StaticPlanner::new(vec![PlanStep::new(
            "load",
            "load from cache",
            ActionSpec::tool_call("quick", json!({})),
        )]));
        let executor = FlexibleExecutor::builder(Arc::new(TimedTools))
            .config(config)
            .judge(judge)
            .planner(planner)
            .build();
        let goal = simple_goal("load data");
        let plan = Plan::new(
            &goal,
            vec![
                PlanStep::new("load", "load from origin", ActionSpec::tool_call("slow", json!({}))),
                PlanStep::new("check_source", "check the source", ActionSpec::tool_call("down", json!({}))),
            ],
        );
        let result = executor.execute(goal, plan, BTreeMap::new()).await.unwrap();

        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.replans.len(), 1);
        assert_eq!(result.step_results["load"].output, json!({"quick": true}));
        assert_eq!(result.plan.step("load").unwrap().result, Some(json!({"quick": true})));

        let discarded: Vec<_> = result
            .run
            .decisions()
            .iter()
            .filter(|d| d.outcome().is_some_and(|o| o.metrics.contains_key("discarded")))
            .collect();
        assert_eq!(discarded.len(), 1);
        assert_eq!(discarded[0].outcome().unwrap().result, json!({"slow": true}));
    }

    #[tokio::test]
    async fn test_outcome_metrics_recorded() {
        let executor = FlexibleExecutor::builder(ok_tools()).build();
        let goal = simple_goal("x");
        let plan = two_step_plan(&goal);
        let result = executor.execute(goal, plan, BTreeMap::new()).await.unwrap();
        let outcome = result.run.decisions()[0].outcome().unwrap();
        assert!(outcome.metrics.contains_key("latency_ms"));
        assert!(outcome.judgment.is_some());
    }
}
