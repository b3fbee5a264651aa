//! Deploy gate inputs and results.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Snapshot produced by CI/deploy tooling and evaluated by the gates.
///
/// Every field is optional; each gate decides individually how an absent
/// field is treated (see `core::gates`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GateContext {
    /// Secret scanner found credentials in the tree
    pub secrets_found: Option<bool>,

    /// Software bill of materials was produced
    pub sbom_generated: Option<bool>,

    pub tests_passed: Option<bool>,

    /// Risk grade from readiness simulation (GREEN, YELLOW, RED...)
    pub risk_grade: Option<String>,

    pub open_critical_incidents: Option<u32>,

    /// Container scan reported critical/high vulnerabilities
    pub container_high_vulns: Option<bool>,

    /// `Some(false)` means a human withdrew approval
    pub approved: Option<bool>,

    /// Outcome of the most recent receipt chain verification
    pub ledger_verified: Option<bool>,

    /// Any other fields supplied by tooling, kept for audit
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Overall verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    Allow,
    Deny,
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Decision::Allow => write!(f, "ALLOW"),
            Decision::Deny => write!(f, "DENY"),
        }
    }
}

/// Result of a single gate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateOutcome {
    pub id: String,
    pub name: String,
    pub passed: bool,
    pub fail_msg: Option<String>,
}

/// Full evaluation record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateResult {
    pub id: Uuid,
    pub decision: Decision,
    pub gates: Vec<GateOutcome>,
    pub failed_gates: Vec<String>,
    pub context: GateContext,
    pub evaluated_at: DateTime<Utc>,
}

impl GateResult {
    pub fn allowed(&self) -> bool {
        self.decision == Decision::Allow
    }
}

/// Evaluator summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateStatus {
    pub total_checks: u64,
    pub last_decision: Option<Decision>,
    pub gate_count: usize,
    pub last_evaluated_at: Option<DateTime<Utc>>,
}
