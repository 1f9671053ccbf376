//! Gate evaluation
//!
//! Decides whether a verdict from a quality or security tool lets the
//! pipeline continue. Evaluation is pure: no I/O, no clock, no state.

pub mod policy;

pub use policy::{Comparison, GatePolicy, Threshold};

use crate::pipeline::verdict::GateVerdict;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome of a gate evaluation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "lowercase")]
pub enum GateDecision {
    /// Every threshold holds
    Pass,
    /// At least one threshold is violated
    Block {
        /// Every violated requirement, in policy order
        violations: Vec<String>,
    },
}

impl GateDecision {
    /// Returns true if the gate passed
    #[must_use]
    pub fn is_pass(&self) -> bool {
        matches!(self, Self::Pass)
    }

    /// Returns true if the gate blocked
    #[must_use]
    pub fn is_block(&self) -> bool {
        matches!(self, Self::Block { .. })
    }

    /// Violations, empty when the gate passed
    #[must_use]
    pub fn violations(&self) -> &[String] {
        match self {
            Self::Pass => &[],
            Self::Block { violations } => violations,
        }
    }
}

impl fmt::Display for GateDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pass => write!(f, "gate passed"),
            Self::Block { violations } => {
                write!(f, "gate blocked: {}", violations.join("; "))
            }
        }
    }
}

/// Pass/block decision logic
pub struct GateEvaluator;

impl GateEvaluator {
    /// Evaluates a verdict against a policy
    ///
    /// All thresholds are checked and every violation is reported. A tool
    /// verdict flagged as blocking is itself a violation. A missing verdict
    /// blocks.
    #[must_use]
    pub fn evaluate(verdict: Option<&GateVerdict>, policy: &GatePolicy) -> GateDecision {
        let Some(verdict) = verdict else {
            return GateDecision::Block {
                violations: vec!["verdict unavailable".to_string()],
            };
        };

        let mut violations = Vec::new();

        if verdict.blocking {
            if verdict.detail.is_empty() {
                violations.push("tool reported a blocking verdict".to_string());
            } else {
                violations.push(format!("tool reported a blocking verdict: {}", verdict.detail));
            }
        }

        violations.extend(
            policy
                .thresholds
                .iter()
                .filter_map(|t| t.check(verdict.finding(&t.metric))),
        );

        if violations.is_empty() {
            GateDecision::Pass
        } else {
            GateDecision::Block { violations }
        }
    }

    /// Evaluates an unavailable verdict, recording why it is missing
    #[must_use]
    pub fn unavailable(reason: &str) -> GateDecision {
        GateDecision::Block {
            violations: vec![format!("verdict unavailable: {reason}")],
        }
    }
}
