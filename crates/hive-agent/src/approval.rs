use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, Mutex};
use tracing::{info, warn};

use hive_core::approval::{ApprovalRequest, ApprovalResult};
use hive_core::error::{HiveError, Result};
use hive_core::event::EventBus;
use hive_core::types::RuntimeEvent;

/// What happened to a request the engine was waiting on.
#[derive(Debug)]
pub enum ApprovalWait {
    Resolved(ApprovalResult),
    TimedOut,
    /// The gate dropped the request (cancelled or shut down).
    Closed,
}

/// Holds pending approval requests, each paired with a oneshot sender.
///
/// Exactly one `ApprovalResult` is delivered per request; later resolves for
/// the same correlation id return `false`.
pub struct ApprovalGate {
    pending: Mutex<HashMap<String, (ApprovalRequest, oneshot::Sender<ApprovalResult>)>>,
    event_bus: Arc<EventBus>,
}

impl ApprovalGate {
    pub fn new(event_bus: Arc<EventBus>) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            event_bus,
        }
    }

    /// Register a request, publish it, and return the receiver to await.
    pub async fn request(&self, req: ApprovalRequest) -> oneshot::Receiver<ApprovalResult> {
        let (tx, rx) = oneshot::channel();
        let id = req.correlation_id.clone();
        info!(
            correlation_id = %id,
            step_id = %req.step_id,
            risk = %req.risk,
            "Approval requested"
        );

        // registered before publishing so a subscriber can resolve right away
        self.pending.lock().await.insert(id, (req.clone(), tx));
        self.event_bus.publish(RuntimeEvent::ApprovalRequested { request: req });
        rx
    }

    /// Publish a request without registering a waiter. Used when the run
    /// suspends and the answer arrives through a resume instead.
    pub fn announce(&self, req: &ApprovalRequest) {
        info!(correlation_id = %req.correlation_id, step_id = %req.step_id, "Approval requested, run suspended");
        self.event_bus.publish(RuntimeEvent::ApprovalRequested {
            request: req.clone(),
        });
    }

    /// Deliver a result to the correlated waiter.
    /// Returns true if the request was found and resolved.
    pub async fn resolve(&self, result: ApprovalResult) -> bool {
        let entry = self.pending.lock().await.remove(&result.correlation_id);
        match entry {
            Some((_req, tx)) => {
                self.event_bus.publish(RuntimeEvent::ApprovalResolved {
                    correlation_id: result.correlation_id.clone(),
                    decision: result.decision,
                });
                // Receiver may be gone after a timeout
                let _ = tx.send(result);
                true
            }
            None => {
                warn!(correlation_id = %result.correlation_id, "No pending approval for result");
                false
            }
        }
    }

    /// Drop a pending request; its waiter observes a closed channel.
    pub async fn cancel(&self, correlation_id: &str) -> bool {
        self.pending.lock().await.remove(correlation_id).is_some()
    }

    pub async fn pending_requests(&self) -> Vec<ApprovalRequest> {
        let mut list: Vec<ApprovalRequest> = self
            .pending
            .lock()
            .await
            .values()
            .map(|(req, _)| req.clone())
            .collect();
        list.sort_by_key(|r| r.requested_at);
        list
    }

    /// Find a pending request by prefix match on the correlation id.
    pub async fn find_by_prefix(&self, prefix: &str) -> Option<String> {
        let pending = self.pending.lock().await;
        pending.keys().find(|k| k.starts_with(prefix)).cloned()
    }

    pub async fn get(&self, correlation_id: &str) -> Result<ApprovalRequest> {
        self.pending
            .lock()
            .await
            .get(correlation_id)
            .map(|(req, _)| req.clone())
            .ok_or_else(|| HiveError::ApprovalClosed(correlation_id.to_string()))
    }

    /// Await a receiver with an optional timeout. On timeout the request is
    /// removed so a late resolve returns `false`.
    pub async fn wait(
        &self,
        correlation_id: &str,
        rx: oneshot::Receiver<ApprovalResult>,
        timeout: Option<Duration>,
    ) -> ApprovalWait {
        match timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(Ok(result)) => ApprovalWait::Resolved(result),
                Ok(Err(_)) => ApprovalWait::Closed,
                Err(_) => {
                    self.cancel(correlation_id).await;
                    warn!(correlation_id = %correlation_id, "Approval timed out");
                    ApprovalWait::TimedOut
                }
            },
            None => match rx.await {
                Ok(result) => ApprovalWait::Resolved(result),
                Err(_) => ApprovalWait::Closed,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate() -> ApprovalGate {
        ApprovalGate::new(Arc::new(EventBus::default()))
    }

    fn request(step: &str) -> ApprovalRequest {
        ApprovalRequest::new("run-1", step, "delete records", "irreversible")
    }

    #[tokio::test]
    async fn test_resolve_approve() {
        let gate = gate();
        let req = request("s1");
        let id = req.correlation_id.clone();
        let rx = gate.request(req).await;
        assert!(gate.resolve(ApprovalResult::approve(&id)).await);
        let result = rx.await.unwrap();
        assert!(result.is_approved());
    }

    #[tokio::test]
    async fn test_resolve_reject_carries_reason() {
        let gate = gate();
        let req = request("s1");
        let id = req.correlation_id.clone();
        let rx = gate.request(req).await;
        assert!(gate.resolve(ApprovalResult::reject(&id, "too risky")).await);
        let result = rx.await.unwrap();
        assert!(!result.is_approved());
        assert_eq!(result.reason.as_deref(), Some("too risky"));
    }

    #[tokio::test]
    async fn test_second_resolve_returns_false() {
        let gate = gate();
        let req = request("s1");
        let id = req.correlation_id.clone();
        let _rx = gate.request(req).await;
        assert!(gate.resolve(ApprovalResult::approve(&id)).await);
        assert!(!gate.resolve(ApprovalResult::approve(&id)).await);
        assert!(!gate.resolve(ApprovalResult::approve("nonexistent")).await);
    }

    #[tokio::test]
    async fn test_resolve_publishes_event() {
        let bus = Arc::new(EventBus::default());
        let mut events = bus.subscribe();
        let gate = ApprovalGate::new(bus);
        let req = request("s1");
        let id = req.correlation_id.clone();
        let _rx = gate.request(req).await;
        gate.resolve(ApprovalResult::approve(&id)).await;

        assert!(matches!(
            events.recv().await.unwrap(),
            RuntimeEvent::ApprovalRequested { .. }
        ));
        match events.recv().await.unwrap() {
            RuntimeEvent::ApprovalResolved { correlation_id, .. } => assert_eq!(correlation_id, id),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_wait_timeout_removes_request() {
        let gate = gate();
        let req = request("s1");
        let id = req.correlation_id.clone();
        let rx = gate.request(req).await;
        let outcome = gate.wait(&id, rx, Some(Duration::from_millis(10))).await;
        assert!(matches!(outcome, ApprovalWait::TimedOut));
        assert!(gate.pending_requests().await.is_empty());
        assert!(!gate.resolve(ApprovalResult::approve(&id)).await);
    }

    #[tokio::test]
    async fn test_cancel_closes_waiter() {
        let gate = gate();
        let req = request("s1");
        let id = req.correlation_id.clone();
        let rx = gate.request(req).await;
        assert!(gate.cancel(&id).await);
        let outcome = gate.wait(&id, rx, None).await;
        assert!(matches!(outcome, ApprovalWait::Closed));
    }

    #[tokio::test]
    async fn test_pending_and_prefix_lookup() {
        let gate = gate();
        let a = request("a");
        let prefix = a.correlation_id[..8].to_string();
        let full = a.correlation_id.clone();
        let _rx1 = gate.request(a).await;
        let _rx2 = gate.request(request("b")).await;

        assert_eq!(gate.pending_requests().await.len(), 2);
        assert_eq!(gate.find_by_prefix(&prefix).await, Some(full.clone()));
        assert_eq!(gate.get(&full).await.unwrap().step_id, "a");
        assert!(gate.get("missing").await.is_err());
    }
}
