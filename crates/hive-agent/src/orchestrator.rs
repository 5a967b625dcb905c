use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use hive_core::config::OrchestratorConfig;
use hive_core::error::{HiveError, Result};
use hive_core::event::EventBus;
use hive_core::run::{Problem, ProblemKind};
use hive_core::types::RuntimeEvent;

use crate::protocol::{
    AgentMessage, AgentReply, CapabilityLevel, CapabilityResponse, MessageTrace, MessageType,
    OrchestratorResult, RegisteredAgent,
};
use crate::runner::AgentRunner;

/// Sender name for messages the orchestrator writes itself.
const ORCHESTRATOR: &str = "orchestrator";

/// Collects agents, then freezes them into an [`AgentOrchestrator`].
#[derive(Default)]
pub struct OrchestratorBuilder {
    agents: Vec<RegisteredAgent>,
    config: OrchestratorConfig,
    event_bus: Option<Arc<EventBus>>,
}

impl OrchestratorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn register(mut self, agent: RegisteredAgent) -> Self {
        self.agents.push(agent);
        self
    }

    /// Register a runner under its own name, description, and capabilities.
    pub fn register_runner(self, runner: AgentRunner) -> Self {
        let agent = RegisteredAgent {
            name: runner.name().to_string(),
            description: runner.description().to_string(),
            capabilities: runner.capabilities().to_vec(),
            priority: runner.priority(),
            runner: Arc::new(runner),
        };
        self.register(agent)
    }

    /// Fails on duplicate names.
    pub fn build(self) -> Result<AgentOrchestrator> {
        let mut agents = BTreeMap::new();
        for agent in self.agents {
            if agents.contains_key(&agent.name) {
                return Err(HiveError::DuplicateAgent(agent.name));
            }
            agents.insert(agent.name.clone(), agent);
        }

        let mut order: Vec<String> = agents.keys().cloned().collect();
        order.sort_by(|a, b| agents[b].priority.cmp(&agents[a].priority).then_with(|| a.cmp(b)));

        info!(agents = order.len(), "Orchestrator ready");
        Ok(AgentOrchestrator {
            agents,
            order,
            config: self.config,
            event_bus: self.event_bus,
        })
    }
}

/// Routes requests to registered agents by capability negotiation.
///
/// Every dispatch produces a full message trace: the root request, one
/// capability check and response per candidate, handoffs to dependencies,
/// the request/response pair for each agent that did work, and a closing
/// response to the root. Every message that expects an answer gets one;
/// the orchestrator answers for agents that time out.
pub struct AgentOrchestrator {
    agents: BTreeMap<String, RegisteredAgent>,
    /// Names by priority desc, then name.
    order: Vec<String>,
    config: OrchestratorConfig,
    event_bus: Option<Arc<EventBus>>,
}

#[derive(Default)]
struct DispatchState {
    trace: MessageTrace,
    results: BTreeMap<String, serde_json::Value>,
    handled_by: Vec<String>,
    problems: Vec<Problem>,
}

impl DispatchState {
    fn fail(&mut self, kind: ProblemKind, message: impl Into<String>) -> HiveError {
        let message = message.into();
        warn!(kind = ?kind, message = %message, "Dispatch problem");
        self.problems.push(Problem::new(kind, message.clone()));
        HiveError::Orchestration(message)
    }

    fn finish(self, error: Option<String>) -> OrchestratorResult {
        OrchestratorResult {
            success: error.is_none(),
            handled_by: self.handled_by,
            results: self.results,
            messages: self.trace.into_messages(),
            error,
            problems: self.problems,
        }
    }
}

impl AgentOrchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    /// Registered agents, highest priority first.
    pub fn agents(&self) -> Vec<&RegisteredAgent> {
        self.order.iter().filter_map(|n| self.agents.get(n)).collect()
    }

    pub fn agent(&self, name: &str) -> Result<&RegisteredAgent> {
        self.agents
            .get(name)
            .ok_or_else(|| HiveError::AgentNotFound(name.to_string()))
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Negotiate, resolve dependencies, and run the selected agent.
    pub async fn dispatch(&self, request: serde_json::Value, intent: &str) -> OrchestratorResult {
        let mut state = DispatchState::default();
        let root = AgentMessage::request(intent, request);
        info!(message_id = %root.id, intent = %intent, "Dispatching request");

        let outcome = match self.record(&mut state, root.clone()) {
            Ok(()) => self.route(&mut state, &root).await,
            Err(e) => Err(e),
        };
        let result = self.conclude(state, &root, outcome);
        info!(
            message_id = %root.id,
            success = result.success,
            handled_by = ?result.handled_by,
            messages = result.messages.len(),
            "Dispatch finished"
        );
        result
    }

    /// Run a named agent directly, skipping negotiation.
    pub async fn dispatch_to(
        &self,
        agent_name: &str,
        request: serde_json::Value,
        intent: &str,
    ) -> Result<OrchestratorResult> {
        let agent = self.agent(agent_name)?;
        let mut state = DispatchState::default();
        let root = AgentMessage::request(intent, request.clone());
        let outcome = match self.record(&mut state, root.clone()) {
            Ok(()) => {
                let work = AgentMessage::new(MessageType::Request, intent, request)
                    .recipient(&agent.name)
                    .in_reply_to(&root.id);
                self.invoke(&mut state, agent, work).await
            }
            Err(e) => Err(e),
        };
        Ok(self.conclude(state, &root, outcome))
    }

    /// Send the same request to every agent concurrently.
    ///
    /// Succeeds only if every agent succeeds; each reply is kept either way.
    pub async fn broadcast(&self, intent: &str, content: serde_json::Value) -> OrchestratorResult {
        let mut state = DispatchState::default();
        let root = AgentMessage::new(MessageType::Broadcast, intent, content.clone());
        if let Err(e) = self.record(&mut state, root.clone()) {
            return self.conclude(state, &root, Err(e));
        }

        let agents = self.agents();
        let mut deliveries = Vec::with_capacity(agents.len());
        for agent in &agents {
            let msg = AgentMessage::new(MessageType::Request, intent, content.clone())
                .recipient(&agent.name)
                .in_reply_to(&root.id);
            if let Err(e) = self.record(&mut state, msg.clone()) {
                return self.conclude(state, &root, Err(e));
            }
            deliveries.push(msg);
        }

        let limit = Duration::from_secs(self.config.dispatch_timeout_secs);
        let futs = agents
            .iter()
            .zip(&deliveries)
            .map(|(agent, msg)| tokio::time::timeout(limit, agent.runner.handle(msg)));
        let replies = futures::future::join_all(futs).await;

        let mut failed = Vec::new();
        for ((agent, msg), reply) in agents.iter().zip(&deliveries).zip(replies) {
            if let Err(e) = self.settle(&mut state, agent, msg, reply) {
                failed.push(format!("{}: {}", agent.name, e));
            }
        }

        let outcome = if failed.is_empty() {
            Ok(serde_json::Value::Null)
        } else {
            Err(HiveError::Orchestration(format!(
                "{} of {} agents failed: {}",
                failed.len(),
                agents.len(),
                failed.join("; ")
            )))
        };
        self.conclude(state, &root, outcome)
    }

    /// Answer the root message with the overall outcome and close the trace.
    fn conclude(
        &self,
        mut state: DispatchState,
        root: &AgentMessage,
        outcome: Result<serde_json::Value>,
    ) -> OrchestratorResult {
        let error = match outcome {
            Ok(_) => None,
            Err(HiveError::Orchestration(msg)) => Some(msg),
            Err(e) => Some(e.to_string()),
        };
        let answer = root.reply(
            ORCHESTRATOR,
            serde_json::json!({
                "success": error.is_none(),
                "error": error,
                "results": state.results,
            }),
            MessageType::Response,
        );
        if let Err(e) = self.record(&mut state, answer) {
            warn!(message_id = %root.id, error = %e, "Could not record final response");
        }
        state.finish(error)
    }

    /// Agents whose keywords overlap `text`, or every agent when none do.
    fn candidates(&self, text: &str) -> Vec<&RegisteredAgent> {
        let all = self.agents();
        let matching: Vec<&RegisteredAgent> = all.iter().copied().filter(|a| a.matches(text)).collect();
        if matching.is_empty() {
            all
        } else {
            matching
        }
    }

    async fn route(&self, state: &mut DispatchState, root: &AgentMessage) -> Result<serde_json::Value> {
        let candidates = self.candidates(&root.text());
        if candidates.is_empty() {
            return Err(state.fail(ProblemKind::NoCapableAgent, "no agents registered"));
        }
        debug!(
            candidates = ?candidates.iter().map(|a| a.name.as_str()).collect::<Vec<_>>(),
            "Checking capabilities"
        );

        let answered = self.negotiate(state, root, &candidates).await?;
        let responses: Vec<CapabilityResponse> = answered.iter().map(|(r, _)| r.clone()).collect();
        let Some(selected) = select_agent(&responses, self.config.uncertain_threshold) else {
            return Err(state.fail(
                ProblemKind::NoCapableAgent,
                format!(
                    "no agent can handle the request ({} responses, uncertain threshold {})",
                    responses.len(),
                    self.config.uncertain_threshold
                ),
            ));
        };
        let selected = selected.clone();
        info!(
            agent = %selected.agent_name,
            level = %selected.level,
            confidence = selected.confidence,
            "Agent selected"
        );

        let agent = self.agent(&selected.agent_name)?;
        let capability_msg = answered
            .iter()
            .find(|(r, _)| r.agent_name == selected.agent_name)
            .map(|(_, m)| m.clone())
            .ok_or_else(|| HiveError::Orchestration("selected agent has no capability response".into()))?;

        let dependency_results = self
            .resolve_dependencies(state, &agent.name, &selected.dependencies, &capability_msg, &root.content, 1)
            .await?;

        let work = AgentMessage::new(
            MessageType::Request,
            root.intent.clone(),
            with_dependency_results(&root.content, &dependency_results),
        )
        .recipient(&agent.name)
        .in_reply_to(&root.id);
        self.invoke(state, agent, work).await
    }

    /// Send capability checks concurrently; responses are recorded in
    /// candidate order. Unanswered checks become timeout problems.
    async fn negotiate(
        &self,
        state: &mut DispatchState,
        root: &AgentMessage,
        candidates: &[&RegisteredAgent],
    ) -> Result<Vec<(CapabilityResponse, AgentMessage)>> {
        let checks: Vec<AgentMessage> = candidates
            .iter()
            .map(|agent| {
                AgentMessage::new(MessageType::CapabilityCheck, root.intent.clone(), root.content.clone())
                    .recipient(&agent.name)
                    .in_reply_to(&root.id)
            })
            .collect();
        for check in &checks {
            self.record(state, check.clone())?;
        }

        let limit = Duration::from_secs(self.config.capability_timeout_secs);
        let futs = candidates
            .iter()
            .zip(&checks)
            .map(|(agent, check)| tokio::time::timeout(limit, agent.runner.check_capability(check)));
        let answers = futures::future::join_all(futs).await;

        let mut responses = Vec::new();
        for ((agent, check), answer) in candidates.iter().zip(&checks).zip(answers) {
            match answer {
                Ok(response) => {
                    let mut response = response.clamped();
                    response.agent_name = agent.name.clone();
                    let reply = check.reply(
                        &agent.name,
                        serde_json::to_value(&response)?,
                        MessageType::CapabilityResponse,
                    );
                    self.record(state, reply.clone())?;
                    responses.push((response, reply));
                }
                Err(_) => {
                    let reason = format!(
                        "{} did not answer capability check {} within {}s",
                        agent.name, check.id, self.config.capability_timeout_secs
                    );
                    // counts as a refusal so the check is still answered
                    let refusal =
                        CapabilityResponse::new(&agent.name, CapabilityLevel::CannotHandle, 0.0, reason.clone());
                    let reply = check.reply(
                        ORCHESTRATOR,
                        serde_json::to_value(&refusal)?,
                        MessageType::CapabilityResponse,
                    );
                    self.record(state, reply)?;
                    let _ = state.fail(ProblemKind::Timeout, reason);
                }
            }
        }
        Ok(responses)
    }

    /// Run each dependency through a handoff from `from_agent`, depth first.
    /// Results accumulate in `state.results` even when a later one fails.
    fn resolve_dependencies<'a>(
        &'a self,
        state: &'a mut DispatchState,
        from_agent: &'a str,
        dependencies: &'a [String],
        parent: &'a AgentMessage,
        request: &'a serde_json::Value,
        depth: usize,
    ) -> futures::future::BoxFuture<'a, Result<BTreeMap<String, serde_json::Value>>> {
        Box::pin(async move {
            let mut resolved = BTreeMap::new();
            for dep in dependencies {
                if let Some(done) = state.results.get(dep) {
                    resolved.insert(dep.clone(), done.clone());
                    continue;
                }
                if depth > self.config.max_handoff_depth {
                    return Err(state.fail(
                        ProblemKind::AgentFailed,
                        format!(
                            "handoff from {} to {} exceeds depth limit {}",
                            from_agent, dep, self.config.max_handoff_depth
                        ),
                    ));
                }
                let Some(agent) = self.agents.get(dep) else {
                    return Err(state.fail(
                        ProblemKind::UnknownAgent,
                        format!("{} depends on unknown agent {}", from_agent, dep),
                    ));
                };

                let handoff = AgentMessage::new(
                    MessageType::Handoff,
                    format!("{} needs {}", from_agent, dep),
                    with_dependency_results(request, &resolved),
                )
                .sender(from_agent)
                .recipient(dep)
                .in_reply_to(&parent.id);
                self.record(state, handoff.clone())?;
                info!(from = %from_agent, to = %dep, depth, "Handoff to dependency");

                // the dependency may itself need others
                let check = tokio::time::timeout(
                    Duration::from_secs(self.config.capability_timeout_secs),
                    agent.runner.check_capability(&handoff),
                )
                .await;
                if let Ok(response) = check {
                    if !response.dependencies.is_empty() {
                        let response = response.clamped();
                        let reply = handoff.reply(
                            dep,
                            serde_json::to_value(&response)?,
                            MessageType::CapabilityResponse,
                        );
                        self.record(state, reply.clone())?;
                        let nested = self
                            .resolve_dependencies(state, dep, &response.dependencies, &reply, request, depth + 1)
                            .await?;
                        resolved.extend(nested);
                    }
                }

                let mut work = handoff.clone();
                work.content = with_dependency_results(request, &resolved);
                let reply = tokio::time::timeout(
                    Duration::from_secs(self.config.dispatch_timeout_secs),
                    agent.runner.handle(&work),
                )
                .await;
                let output = self.settle(state, agent, &handoff, reply)?;
                resolved.insert(dep.clone(), output);
            }
            Ok(resolved)
        })
    }

    /// Invoke `agent` with `message`, bounded by the dispatch timeout.
    async fn invoke(
        &self,
        state: &mut DispatchState,
        agent: &RegisteredAgent,
        message: AgentMessage,
    ) -> Result<serde_json::Value> {
        self.record(state, message.clone())?;
        let reply = tokio::time::timeout(
            Duration::from_secs(self.config.dispatch_timeout_secs),
            agent.runner.handle(&message),
        )
        .await;
        self.settle(state, agent, &message, reply)
    }

    /// Record the agent's answer to `message` and fold it into the state.
    fn settle(
        &self,
        state: &mut DispatchState,
        agent: &RegisteredAgent,
        message: &AgentMessage,
        reply: std::result::Result<Result<AgentReply>, tokio::time::error::Elapsed>,
    ) -> Result<serde_json::Value> {
        let reply = match reply {
            Err(_) => {
                let reason = format!(
                    "{} did not answer message {} within {}s",
                    agent.name, message.id, self.config.dispatch_timeout_secs
                );
                let timed_out = message.reply(
                    ORCHESTRATOR,
                    serde_json::to_value(AgentReply::failure(reason.clone()))?,
                    MessageType::Response,
                );
                self.record(state, timed_out)?;
                return Err(state.fail(ProblemKind::Timeout, reason));
            }
            Ok(Err(e)) => AgentReply::failure(e.to_string()),
            Ok(Ok(reply)) => reply,
        };

        let response = message.reply(&agent.name, serde_json::to_value(&reply)?, MessageType::Response);
        self.record(state, response)?;

        if reply.success {
            state.results.insert(agent.name.clone(), reply.output.clone());
            if !state.handled_by.contains(&agent.name) {
                state.handled_by.push(agent.name.clone());
            }
            Ok(reply.output)
        } else {
            Err(state.fail(
                ProblemKind::AgentFailed,
                format!(
                    "{} failed: {}",
                    agent.name,
                    reply.error.as_deref().unwrap_or("unknown error")
                ),
            ))
        }
    }

    fn record(&self, state: &mut DispatchState, message: AgentMessage) -> Result<()> {
        if let Some(bus) = &self.event_bus {
            bus.publish(RuntimeEvent::MessageSent {
                id: message.id.clone(),
                message_type: message.message_type.to_string(),
                from_agent: message.from_agent.clone(),
                to_agent: message.to_agent.clone(),
                intent: message.intent.clone(),
            });
        }
        debug!(
            id = %message.id,
            message_type = %message.message_type,
            to = message.to_agent.as_deref().unwrap_or("-"),
            "Message"
        );
        state.trace.push(message)
    }
}

/// Pick the agent to run from capability responses, given in candidate
/// (priority) order.
///
/// Any `best_fit` wins, first one first. Otherwise the most confident
/// `can_handle`, then the most confident `uncertain` strictly above
/// `uncertain_threshold`.
pub fn select_agent(responses: &[CapabilityResponse], uncertain_threshold: f64) -> Option<&CapabilityResponse> {
    if let Some(best) = responses.iter().find(|r| r.level == CapabilityLevel::BestFit) {
        return Some(best);
    }
    let most_confident = |level: CapabilityLevel| {
        responses
            .iter()
            .filter(|r| r.level == level)
            .fold(None::<&CapabilityResponse>, |best, r| match best {
                Some(b) if b.confidence >= r.confidence => Some(b),
                _ => Some(r),
            })
    };
    most_confident(CapabilityLevel::CanHandle).or_else(|| {
        most_confident(CapabilityLevel::Uncertain).filter(|r| r.confidence > uncertain_threshold)
    })
}

fn with_dependency_results(
    request: &serde_json::Value,
    dependencies: &BTreeMap<String, serde_json::Value>,
) -> serde_json::Value {
    if dependencies.is_empty() {
        return request.clone();
    }
    let deps = serde_json::Value::Object(
        dependencies
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    );
    match request {
        serde_json::Value::Object(map) => {
            let mut map = map.clone();
            map.insert("dependency_results".to_string(), deps);
            serde_json::Value::Object(map)
        }
        other => serde_json::json!({ "input": other, "dependency_results": deps }),
    }
}
