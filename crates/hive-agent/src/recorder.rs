use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use hive_core::decision::{Decision, DecisionBuilder, DecisionEvaluation, DecisionKind, Outcome};
use hive_core::error::{HiveError, Result};
use hive_core::event::EventBus;
use hive_core::goal::Goal;
use hive_core::run::{Problem, Run, RunStatus};
use hive_core::types::RuntimeEvent;

/// Captures decisions for one run.
///
/// Decisions are opened when a choice is made and sealed once the outcome
/// is known. Only sealed decisions enter the run's log, so the log is in
/// completion order. The recorder serializes with the open set intact,
/// which is how a suspended run keeps its pending escalation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecorder {
    run: Run,
    open: BTreeMap<String, Decision>,
    #[serde(skip)]
    event_bus: Option<Arc<EventBus>>,
}

impl DecisionRecorder {
    pub fn start(goal: &Goal, event_bus: Option<Arc<EventBus>>) -> Self {
        let run = Run::start(goal);
        if let Some(bus) = &event_bus {
            bus.publish(RuntimeEvent::RunStarted {
                run_id: run.id().to_string(),
                goal_id: goal.id.clone(),
                goal: goal.description.clone(),
            });
        }
        Self {
            run,
            open: BTreeMap::new(),
            event_bus,
        }
    }

    /// Re-attach an event bus after deserializing.
    pub fn attach_event_bus(&mut self, event_bus: Option<Arc<EventBus>>) {
        self.event_bus = event_bus;
    }

    pub fn run_id(&self) -> &str {
        self.run.id()
    }

    pub fn run(&self) -> &Run {
        &self.run
    }

    /// Start building a decision bound to this run.
    pub fn decide(&self, kind: DecisionKind, intent: impl Into<String>) -> DecisionBuilder {
        Decision::builder(self.run.id(), kind, intent)
    }

    /// Open a decision whose outcome is not yet known. Returns its id.
    pub fn open(&mut self, decision: Decision) -> Result<String> {
        if decision.run_id() != self.run.id() {
            return Err(HiveError::Validation(format!(
                "decision {} belongs to run {}",
                decision.id(),
                decision.run_id()
            )));
        }
        if decision.is_sealed() {
            return Err(HiveError::DecisionSealed(decision.id().to_string()));
        }
        let id = decision.id().to_string();
        debug!(decision_id = %id, kind = ?decision.kind(), "Decision opened");
        self.open.insert(id.clone(), decision);
        Ok(id)
    }

    /// Seal an open decision with its outcome and append it to the log.
    pub fn seal(&mut self, decision_id: &str, outcome: Outcome) -> Result<()> {
        let mut decision = match self.open.remove(decision_id) {
            Some(d) => d,
            None if self.run.decision(decision_id).is_some() => {
                return Err(HiveError::DecisionSealed(decision_id.to_string()))
            }
            None => return Err(HiveError::DecisionNotFound(decision_id.to_string())),
        };
        decision.record_outcome(outcome)?;
        if let Some(bus) = &self.event_bus {
            bus.publish(RuntimeEvent::DecisionRecorded {
                decision: Box::new(decision.clone()),
            });
        }
        self.run.push_decision(decision)
    }

    /// Record a decision whose outcome is known immediately.
    pub fn record(&mut self, decision: Decision, outcome: Outcome) -> Result<String> {
        let id = self.open(decision)?;
        self.seal(&id, outcome)?;
        Ok(id)
    }

    pub fn is_open(&self, decision_id: &str) -> bool {
        self.open.contains_key(decision_id)
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    pub fn evaluate(&mut self, decision_id: &str, evaluation: DecisionEvaluation) -> Result<()> {
        self.run.evaluate_decision(decision_id, evaluation)
    }

    pub fn report_problem(&mut self, problem: Problem) {
        warn!(
            run_id = %self.run.id(),
            kind = ?problem.kind,
            "{}",
            problem.message
        );
        if let Some(bus) = &self.event_bus {
            bus.publish(RuntimeEvent::ProblemReported {
                run_id: self.run.id().to_string(),
                problem: problem.clone(),
            });
        }
        self.run.add_problem(problem);
    }

    pub fn set_output(&mut self, output: serde_json::Value) {
        self.run.set_output(output);
    }

    /// Park the run on the given approval correlation ids.
    pub fn suspend(&mut self, pending: Vec<String>) {
        self.run.suspend();
        if let Some(bus) = &self.event_bus {
            bus.publish(RuntimeEvent::RunSuspended {
                run_id: self.run.id().to_string(),
                pending,
                decisions: self.run.decisions().len(),
            });
        }
    }

    pub fn resume(&mut self) {
        self.run.resume();
    }

    /// Close the run. Decisions still open are sealed as unresolved.
    pub fn finish(mut self, status: RunStatus) -> Run {
        let leftover: Vec<String> = self.open.keys().cloned().collect();
        for id in leftover {
            let outcome = Outcome::failure(
                format!("run ended with status {}", status),
                "unresolved when the run ended",
            );
            if let Err(e) = self.seal(&id, outcome) {
                warn!(decision_id = %id, error = %e, "Failed to seal leftover decision");
            }
        }
        self.run.finish(status);
        self.publish_status();
        self.run
    }

    fn publish_status(&self) {
        if let Some(bus) = &self.event_bus {
            bus.publish(RuntimeEvent::RunCompleted {
                run_id: self.run.id().to_string(),
                status: self.run.status(),
                decisions: self.run.decisions().len(),
                duration_ms: self.run.duration_ms(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hive_core::decision::{DecisionOption, DecisionQuality};
    use hive_core::run::ProblemKind;

    fn recorder() -> DecisionRecorder {
        DecisionRecorder::start(&Goal::new("g", "test goal"), None)
    }

    #[test]
    fn test_open_then_seal_appends_in_completion_order() {
        let mut rec = recorder();
        let a = rec
            .open(rec.decide(DecisionKind::StepExecution, "a").step("a").build())
            .unwrap();
        let b = rec
            .open(rec.decide(DecisionKind::StepExecution, "b").step("b").build())
            .unwrap();
        assert_eq!(rec.open_count(), 2);
        assert!(rec.run().decisions().is_empty());

        rec.seal(&b, Outcome::success(serde_json::json!(2), "b done")).unwrap();
        rec.seal(&a, Outcome::success(serde_json::json!(1), "a done")).unwrap();

        let ids: Vec<&str> = rec.run().decisions().iter().map(|d| d.id()).collect();
        assert_eq!(ids, vec![b.as_str(), a.as_str()]);
        assert_eq!(rec.open_count(), 0);
    }

    #[test]
    fn test_seal_twice_fails() {
        let mut rec = recorder();
        let id = rec
            .record(
                rec.decide(DecisionKind::Abort, "stop").build(),
                Outcome::failure("x", "aborted"),
            )
            .unwrap();
        let err = rec.seal(&id, Outcome::failure("y", "again")).unwrap_err();
        assert!(matches!(err, HiveError::DecisionSealed(_)));
        assert!(matches!(
            rec.seal("nope", Outcome::failure("y", "z")),
            Err(HiveError::DecisionNotFound(_))
        ));
    }

    #[test]
    fn test_foreign_decision_rejected() {
        let mut rec = recorder();
        let foreign = Decision::builder("other-run", DecisionKind::Replan, "x").build();
        assert!(rec.open(foreign).is_err());
    }

    #[test]
    fn test_evaluate_after_seal() {
        let mut rec = recorder();
        let id = rec
            .record(
                rec.decide(DecisionKind::StepExecution, "fetch")
                    .option(DecisionOption::new("tool", "call fetch"))
                    .choose("tool", "only option")
                    .build(),
                Outcome::success(serde_json::Value::Null, "ok"),
            )
            .unwrap();
        rec.evaluate(&id, DecisionEvaluation::new(DecisionQuality::Good, "fine"))
            .unwrap();
        let d = rec.run().decision(&id).unwrap();
        assert_eq!(d.evaluation().unwrap().quality, DecisionQuality::Good);
    }

    #[test]
    fn test_finish_seals_leftovers() {
        let mut rec = recorder();
        let id = rec
            .open(rec.decide(DecisionKind::Escalation, "ask human").build())
            .unwrap();
        rec.report_problem(Problem::new(ProblemKind::Cancelled, "cancelled").with_decision(&id));
        let run = rec.finish(RunStatus::Aborted);
        assert_eq!(run.status(), RunStatus::Aborted);
        assert_eq!(run.decisions().len(), 1);
        assert!(!run.decisions()[0].succeeded());
        assert_eq!(run.problems().len(), 1);
    }

    #[tokio::test]
    async fn test_events_published() {
        let bus = Arc::new(EventBus::default());
        let mut events = bus.subscribe();
        let mut rec = DecisionRecorder::start(&Goal::new("g", "goal"), Some(bus));
        rec.record(
            rec.decide(DecisionKind::StepExecution, "s").build(),
            Outcome::success(serde_json::Value::Null, "ok"),
        )
        .unwrap();
        rec.finish(RunStatus::Completed);

        assert!(matches!(events.recv().await.unwrap(), RuntimeEvent::RunStarted { .. }));
        assert!(matches!(
            events.recv().await.unwrap(),
            RuntimeEvent::DecisionRecorded { .. }
        ));
        match events.recv().await.unwrap() {
            RuntimeEvent::RunCompleted { status, decisions, .. } => {
                assert_eq!(status, RunStatus::Completed);
                assert_eq!(decisions, 1);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_suspend_is_not_completion() {
        let bus = Arc::new(EventBus::default());
        let mut events = bus.subscribe();
        let mut rec = DecisionRecorder::start(&Goal::new("g", "goal"), Some(bus));
        rec.suspend(vec!["corr-1".into()]);
        assert_eq!(rec.run().status(), RunStatus::AwaitingApproval);

        assert!(matches!(events.recv().await.unwrap(), RuntimeEvent::RunStarted { .. }));
        match events.recv().await.unwrap() {
            RuntimeEvent::RunSuspended { pending, .. } => assert_eq!(pending, vec!["corr-1".to_string()]),
            other => panic!("unexpected {:?}", other),
        }
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_serde_keeps_open_decisions() {
        let mut rec = recorder();
        let id = rec
            .open(rec.decide(DecisionKind::Escalation, "wait").build())
            .unwrap();
        let json = serde_json::to_string(&rec).unwrap();
        let mut back: DecisionRecorder = serde_json::from_str(&json).unwrap();
        assert!(back.is_open(&id));
        back.seal(&id, Outcome::success(serde_json::Value::Null, "approved"))
            .unwrap();
        assert_eq!(back.run().decisions().len(), 1);
    }
}
