//! All-or-nothing deploy gates.
//!
//! Each gate is a named predicate over a [`GateContext`]. A deploy is allowed
//! only when every gate passes. A predicate that returns `Err` or panics is a
//! failed gate, never an allow.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::{Decision, GateContext, GateOutcome, GateResult, GateStatus};

/// Predicate signature shared by all gates
pub type GatePredicate = Arc<dyn Fn(&GateContext) -> anyhow::Result<bool> + Send + Sync>;

/// A named deploy precondition
#[derive(Clone)]
pub struct Gate {
    pub id: String,
    pub name: String,
    pub fail_msg: String,
    pub predicate: GatePredicate,
}

impl Gate {
    pub fn new<F>(
        id: impl Into<String>,
        name: impl Into<String>,
        fail_msg: impl Into<String>,
        predicate: F,
    ) -> Self
    where
        F: Fn(&GateContext) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            name: name.into(),
            fail_msg: fail_msg.into(),
            predicate: Arc::new(predicate),
        }
    }

    /// Run the predicate, treating errors and panics as failure
    pub fn check(&self, context: &GateContext) -> bool {
        match catch_unwind(AssertUnwindSafe(|| (self.predicate)(context))) {
            Ok(Ok(passed)) => passed,
            Ok(Err(e)) => {
                warn!(gate = %self.id, error = %e, "Gate predicate failed");
                false
            }
            Err(_) => {
                warn!(gate = %self.id, "Gate predicate panicked");
                false
            }
        }
    }
}

impl std::fmt::Debug for Gate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gate")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("fail_msg", &self.fail_msg)
            .finish_non_exhaustive()
    }
}

/// Gate evaluator configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatesConfig {
    /// Risk grades that may be promoted (compared case-insensitively)
    #[serde(default = "default_allowed_grades")]
    pub allowed_grades: Vec<String>,

    /// Evaluations kept in memory
    #[serde(default = "default_max_history")]
    pub max_history: usize,
}

fn default_allowed_grades() -> Vec<String> {
    vec!["GREEN".to_string(), "YELLOW".to_string()]
}

fn default_max_history() -> usize {
    200
}

impl Default for GatesConfig {
    fn default() -> Self {
        Self {
            allowed_grades: default_allowed_grades(),
            max_history: default_max_history(),
        }
    }
}

/// The standard ordered gate list.
///
/// Absent context fields fail their gate, except `approved`: only an
/// explicit withdrawal blocks a deploy.
pub fn standard_gates(allowed_grades: &[String]) -> Vec<Gate> {
    let grades: Vec<String> = allowed_grades.iter().map(|g| g.to_uppercase()).collect();

    vec![
        Gate::new("secrets_scan", "Secret Scan", "Secrets detected in codebase", |c| {
            Ok(c.secrets_found == Some(false))
        }),
        Gate::new("sbom_present", "SBOM Present", "SBOM not generated", |c| {
            Ok(c.sbom_generated == Some(true))
        }),
        Gate::new("tests_pass", "Tests Pass", "Tests failed", |c| {
            Ok(c.tests_passed == Some(true))
        }),
        Gate::new("risk_grade", "Readiness Risk Grade", "Risk grade too high", move |c| {
            Ok(c.risk_grade
                .as_deref()
                .map(|grade| grades.contains(&grade.to_uppercase()))
                .unwrap_or(false))
        }),
        Gate::new(
            "no_critical_incidents",
            "No Critical Incidents",
            "Open critical incidents",
            |c| Ok(c.open_critical_incidents == Some(0)),
        ),
        Gate::new(
            "container_scan",
            "Container Scan Clean",
            "Critical/high vulns in container",
            |c| Ok(c.container_high_vulns == Some(false)),
        ),
        Gate::new("approval", "Deployment Approved", "Deployment not approved", |c| {
            Ok(c.approved != Some(false))
        }),
        Gate::new(
            "receipt_chain",
            "Receipt Chain Verified",
            "Receipt chain not verified",
            |c| Ok(c.ledger_verified == Some(true)),
        ),
    ]
}

/// Evaluates a fixed gate list and keeps a bounded history
pub struct DeployGateEvaluator {
    gates: Vec<Gate>,
    history: Mutex<VecDeque<GateResult>>,
    max_history: usize,
    total_checks: AtomicU64,
}

impl DeployGateEvaluator {
    /// Evaluator over the standard gates
    pub fn new(config: GatesConfig) -> Self {
        Self::with_gates(standard_gates(&config.allowed_grades), config.max_history)
    }

    /// Evaluator over a custom gate list
    pub fn with_gates(gates: Vec<Gate>, max_history: usize) -> Self {
        Self {
            gates,
            history: Mutex::new(VecDeque::new()),
            max_history,
            total_checks: AtomicU64::new(0),
        }
    }

    pub fn gates(&self) -> &[Gate] {
        &self.gates
    }

    /// Run every gate against `context`. Never fails; a gate that errors is
    /// reported as failed.
    pub fn evaluate(&self, context: GateContext) -> GateResult {
        let outcomes: Vec<GateOutcome> = self
            .gates
            .iter()
            .map(|gate| {
                let passed = gate.check(&context);
                GateOutcome {
                    id: gate.id.clone(),
                    name: gate.name.clone(),
                    passed,
                    fail_msg: (!passed).then(|| gate.fail_msg.clone()),
                }
            })
            .collect();

        let failed_gates: Vec<String> = outcomes
            .iter()
            .filter(|o| !o.passed)
            .map(|o| o.id.clone())
            .collect();
        let decision = if failed_gates.is_empty() {
            Decision::Allow
        } else {
            Decision::Deny
        };

        let result = GateResult {
            id: Uuid::new_v4(),
            decision,
            gates: outcomes,
            failed_gates,
            context,
            evaluated_at: Utc::now(),
        };

        match decision {
            Decision::Allow => info!(id = %result.id, "Deploy gates passed"),
            Decision::Deny => {
                warn!(id = %result.id, failed = ?result.failed_gates, "Deploy denied")
            }
        }

        self.total_checks.fetch_add(1, Ordering::Relaxed);
        if self.max_history > 0 {
            let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
            history.push_back(result.clone());
            while history.len() > self.max_history {
                history.pop_front();
            }
        }

        result
    }

    /// Most recent `limit` evaluations, oldest first
    pub fn history(&self, limit: usize) -> Vec<GateResult> {
        let history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }

    pub fn status(&self) -> GateStatus {
        let history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        let last = history.back();
        GateStatus {
            total_checks: self.total_checks.load(Ordering::Relaxed),
            last_decision: last.map(|r| r.decision),
            gate_count: self.gates.len(),
            last_evaluated_at: last.map(|r| r.evaluated_at),
        }
    }
}

impl Default for DeployGateEvaluator {
    fn default() -> Self {
        Self::new(GatesConfig::default())
    }
}
