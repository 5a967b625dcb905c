use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use hive_core::event::EventBus;
use hive_core::types::RuntimeEvent;

/// JSONL run logger.
///
/// Subscribes to the EventBus and writes one JSON object per line to
/// `{log_dir}/{run_id}/{timestamp}.jsonl`. Lines are flushed as they are
/// written, so a crash mid-run leaves every earlier line intact.
///
/// Levels: 1 = run start/end and problems, 2 = adds steps, approvals,
/// replans and protocol messages, 3 = adds judgments and decisions.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
}

#[derive(Serialize)]
struct LogEntry {
    timestamp: String,
    run_id: String,
    event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    step_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl RunLogger {
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    /// Log events for one run until it completes (or suspends), the bus
    /// closes, or `cancel` fires.
    ///
    /// With `run_id` unset, the logger follows the first run that starts.
    /// Returns the path of the log file, if one was opened.
    pub async fn run(
        self,
        event_bus: Arc<EventBus>,
        run_id: Option<String>,
        cancel: CancellationToken,
    ) -> Option<PathBuf> {
        let rx = event_bus.subscribe();
        self.follow(rx, run_id, cancel).await
    }

    /// Subscribe now and log in a background task, so no event published
    /// after this call returns is missed.
    pub fn spawn(
        self,
        event_bus: &EventBus,
        run_id: Option<String>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<Option<PathBuf>> {
        let rx = event_bus.subscribe();
        tokio::spawn(self.follow(rx, run_id, cancel))
    }

    async fn follow(
        self,
        mut rx: tokio::sync::broadcast::Receiver<RuntimeEvent>,
        run_id: Option<String>,
        cancel: CancellationToken,
    ) -> Option<PathBuf> {
        let mut run_id = run_id;
        let mut writer: Option<(PathBuf, BufWriter<File>)> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
                result = rx.recv() => {
                    let event = match result {
                        Ok(event) => event,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            debug!(skipped = n, "RunLogger lagged, skipped events");
                            continue;
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                            debug!("EventBus closed, RunLogger stopping");
                            break;
                        }
                    };

                    if run_id.is_none() {
                        if let RuntimeEvent::RunStarted { run_id: id, .. } = &event {
                            run_id = Some(id.clone());
                        }
                    }
                    let Some(current) = run_id.as_deref() else { continue };
                    if event_run_id(&event).is_some_and(|id| id != current) {
                        continue;
                    }
                    let Some(entry) = self.event_to_entry(current, &event) else { continue };

                    if writer.is_none() {
                        match open_log(&self.log_dir, current).await {
                            Ok(opened) => {
                                info!(path = %opened.0.display(), "RunLogger started");
                                writer = Some(opened);
                            }
                            Err(e) => {
                                error!(error = %e, "Failed to open run log");
                                return None;
                            }
                        }
                    }
                    let Some((_, out)) = writer.as_mut() else { break };

                    if let Ok(json) = serde_json::to_string(&entry) {
                        let line = format!("{}\n", json);
                        if let Err(e) = out.write_all(line.as_bytes()).await {
                            error!(error = %e, "Failed to write log entry");
                            break;
                        }
                        if let Err(e) = out.flush().await {
                            error!(error = %e, "Failed to flush log");
                        }
                    }

                    if matches!(&event, RuntimeEvent::RunCompleted { run_id, .. } if run_id == current) {
                        break;
                    }
                }
            }
        }

        let (path, mut out) = writer?;
        out.flush().await.ok();
        debug!(path = %path.display(), "RunLogger finished");
        Some(path)
    }

    /// Convert an event to a log entry, or None if the level filters it out.
    fn event_to_entry(&self, run_id: &str, event: &RuntimeEvent) -> Option<LogEntry> {
        let entry = |event_type: &str, step_id: Option<&str>, detail: Option<serde_json::Value>| LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            run_id: run_id.to_string(),
            event_type: event_type.to_string(),
            step_id: step_id.map(String::from),
            detail,
        };

        match event {
            RuntimeEvent::RunStarted { goal_id, goal, .. } => Some(entry(
                "run_started",
                None,
                Some(serde_json::json!({ "goal_id": goal_id, "goal": goal })),
            )),
            RuntimeEvent::RunCompleted {
                status,
                decisions,
                duration_ms,
                ..
            } => Some(entry(
                "run_completed",
                None,
                Some(serde_json::json!({
                    "status": status,
                    "decisions": decisions,
                    "duration_ms": duration_ms,
                })),
            )),
            RuntimeEvent::RunSuspended { pending, decisions, .. } => Some(entry(
                "run_suspended",
                None,
                Some(serde_json::json!({ "pending": pending, "decisions": decisions })),
            )),
            RuntimeEvent::ProblemReported { problem, .. } => Some(entry(
                "problem",
                None,
                Some(serde_json::json!({
                    "kind": problem.kind,
                    "severity": problem.severity,
                    "message": problem.message,
                    "decision_id": problem.decision_id,
                })),
            )),

            RuntimeEvent::StepDispatched {
                step_id,
                decision_id,
                attempt,
                ..
            } if self.level >= 2 => Some(entry(
                "step_dispatched",
                Some(step_id.as_str()),
                Some(serde_json::json!({ "decision_id": decision_id, "attempt": attempt })),
            )),
            RuntimeEvent::StepCompleted {
                step_id,
                success,
                latency_ms,
                ..
            } if self.level >= 2 => Some(entry(
                "step_completed",
                Some(step_id.as_str()),
                Some(serde_json::json!({ "success": success, "latency_ms": latency_ms })),
            )),
            RuntimeEvent::ApprovalRequested { request } if self.level >= 2 => Some(entry(
                "approval_requested",
                Some(request.step_id.as_str()),
                Some(serde_json::json!({
                    "correlation_id": request.correlation_id,
                    "risk": request.risk,
                    "rationale": truncate_str(&request.rationale, 200),
                })),
            )),
            RuntimeEvent::ApprovalResolved {
                correlation_id,
                decision,
            } if self.level >= 2 => Some(entry(
                "approval_resolved",
                None,
                Some(serde_json::json!({ "correlation_id": correlation_id, "decision": decision })),
            )),
            RuntimeEvent::Replanned {
                revision,
                discarded,
                added,
                ..
            } if self.level >= 2 => Some(entry(
                "replanned",
                None,
                Some(serde_json::json!({
                    "revision": revision,
                    "discarded": discarded,
                    "added": added,
                })),
            )),
            RuntimeEvent::MessageSent {
                id,
                message_type,
                from_agent,
                to_agent,
                intent,
            } if self.level >= 2 => Some(entry(
                "message",
                None,
                Some(serde_json::json!({
                    "id": id,
                    "type": message_type,
                    "from": from_agent,
                    "to": to_agent,
                    "intent": truncate_str(intent, 200),
                })),
            )),

            RuntimeEvent::JudgmentMade {
                step_id, judgment, ..
            } if self.level >= 3 => Some(entry(
                "judgment",
                Some(step_id.as_str()),
                Some(serde_json::json!({
                    "action": judgment.action,
                    "source": judgment.source,
                    "rules": judgment.rule_ids,
                    "confidence": judgment.confidence,
                    "rationale": truncate_str(&judgment.rationale, 200),
                })),
            )),
            RuntimeEvent::DecisionRecorded { decision } if self.level >= 3 => Some(entry(
                "decision",
                decision.step_id(),
                Some(serde_json::json!({
                    "decision_id": decision.id(),
                    "kind": decision.kind(),
                    "intent": decision.intent(),
                    "chosen": decision.chosen_option_id(),
                    "success": decision.succeeded(),
                    "outcome": decision.outcome().map(|o| truncate_json(&o.result, 500)),
                })),
            )),

            _ => None,
        }
    }
}

fn event_run_id(event: &RuntimeEvent) -> Option<&str> {
    match event {
        RuntimeEvent::RunStarted { run_id, .. }
        | RuntimeEvent::StepDispatched { run_id, .. }
        | RuntimeEvent::StepCompleted { run_id, .. }
        | RuntimeEvent::JudgmentMade { run_id, .. }
        | RuntimeEvent::Replanned { run_id, .. }
        | RuntimeEvent::ProblemReported { run_id, .. }
        | RuntimeEvent::RunSuspended { run_id, .. }
        | RuntimeEvent::RunCompleted { run_id, .. } => Some(run_id),
        RuntimeEvent::ApprovalRequested { request } => Some(&request.run_id),
        RuntimeEvent::DecisionRecorded { decision } => Some(decision.run_id()),
        RuntimeEvent::ApprovalResolved { .. } | RuntimeEvent::MessageSent { .. } => None,
    }
}

async fn open_log(log_dir: &Path, run_id: &str) -> std::io::Result<(PathBuf, BufWriter<File>)> {
    let run_dir = log_dir.join(run_id);
    tokio::fs::create_dir_all(&run_dir).await?;
    let timestamp = Utc::now().format("%Y%m%d_%H%M%S_%3f").to_string();
    let path = run_dir.join(format!("{}.jsonl", timestamp));
    let file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await?;
    Ok((path, BufWriter::new(file)))
}

fn truncate_json(value: &serde_json::Value, max_len: usize) -> String {
    let s = value.to_string();
    if s.len() <= max_len {
        s
    } else {
        format!("{}...", truncate_str(&s, max_len))
    }
}

/// Truncate on a char boundary.
fn truncate_str(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        return s;
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
