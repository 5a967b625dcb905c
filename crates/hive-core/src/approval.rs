use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::new_id;

/// Risk descriptor attached to an approval request.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// A pending approval request for a plan step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub correlation_id: String,
    pub run_id: String,
    pub step_id: String,
    pub step_description: String,
    pub rationale: String,
    #[serde(default)]
    pub risk: RiskLevel,
    /// What would be executed, for the reviewer.
    #[serde(default)]
    pub preview: serde_json::Value,
    pub requested_at: DateTime<Utc>,
}

impl ApprovalRequest {
    pub fn new(
        run_id: impl Into<String>,
        step_id: impl Into<String>,
        step_description: impl Into<String>,
        rationale: impl Into<String>,
    ) -> Self {
        Self {
            correlation_id: new_id(),
            run_id: run_id.into(),
            step_id: step_id.into(),
            step_description: step_description.into(),
            rationale: rationale.into(),
            risk: RiskLevel::default(),
            preview: serde_json::Value::Null,
            requested_at: Utc::now(),
        }
    }

    pub fn with_risk(mut self, risk: RiskLevel) -> Self {
        self.risk = risk;
        self
    }

    pub fn with_preview(mut self, preview: serde_json::Value) -> Self {
        self.preview = preview;
        self
    }
}

/// Reviewer verdict.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalDecision {
    Approve,
    Reject,
    Modify,
}

impl ApprovalDecision {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "approve" | "approved" | "yes" | "y" => Some(Self::Approve),
            "reject" | "rejected" | "deny" | "no" | "n" => Some(Self::Reject),
            "modify" | "edit" => Some(Self::Modify),
            _ => None,
        }
    }
}

/// The answer to exactly one approval request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalResult {
    pub correlation_id: String,
    pub decision: ApprovalDecision,
    #[serde(default)]
    pub reason: Option<String>,
    /// Replacement parameters when the decision is `modify`.
    #[serde(default)]
    pub modified_params: Option<serde_json::Value>,
    pub decided_at: DateTime<Utc>,
}

impl ApprovalResult {
    pub fn approve(correlation_id: impl Into<String>) -> Self {
        Self::new(correlation_id, ApprovalDecision::Approve)
    }

    pub fn reject(correlation_id: impl Into<String>, reason: impl Into<String>) -> Self {
        let mut r = Self::new(correlation_id, ApprovalDecision::Reject);
        r.reason = Some(reason.into());
        r
    }

    pub fn modify(correlation_id: impl Into<String>, params: serde_json::Value) -> Self {
        let mut r = Self::new(correlation_id, ApprovalDecision::Modify);
        r.modified_params = Some(params);
        r
    }

    fn new(correlation_id: impl Into<String>, decision: ApprovalDecision) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            decision,
            reason: None,
            modified_params: None,
            decided_at: Utc::now(),
        }
    }

    pub fn is_approved(&self) -> bool {
        matches!(self.decision, ApprovalDecision::Approve | ApprovalDecision::Modify)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_risk_ordering() {
        assert!(RiskLevel::Low < RiskLevel::High);
        assert!(RiskLevel::Critical > RiskLevel::Medium);
        assert_eq!(RiskLevel::default(), RiskLevel::Medium);
    }

    #[test]
    fn test_decision_parse() {
        assert_eq!(ApprovalDecision::parse("Y"), Some(ApprovalDecision::Approve));
        assert_eq!(ApprovalDecision::parse("deny"), Some(ApprovalDecision::Reject));
        assert_eq!(ApprovalDecision::parse("edit"), Some(ApprovalDecision::Modify));
        assert_eq!(ApprovalDecision::parse("maybe"), None);
    }

    #[test]
    fn test_result_constructors() {
        assert!(ApprovalResult::approve("c").is_approved());
        assert!(ApprovalResult::modify("c", serde_json::json!({})).is_approved());
        let r = ApprovalResult::reject("c", "too risky");
        assert!(!r.is_approved());
        assert_eq!(r.reason.as_deref(), Some("too risky"));
    }
}
