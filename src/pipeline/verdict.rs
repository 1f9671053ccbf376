//! Normalized verdicts returned by quality and security tools

#![allow(clippy::must_use_candidate, clippy::return_self_not_must_use)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A single finding value reported by a tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Finding {
    /// Counts, percentages and other numeric measures
    Number(f64),
    /// Ratings and other categorical measures
    Category(String),
}

impl Finding {
    /// Returns the numeric value, if any
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Category(_) => None,
        }
    }

    /// Returns the categorical value, if any
    pub fn as_category(&self) -> Option<&str> {
        match self {
            Self::Number(_) => None,
            Self::Category(c) => Some(c),
        }
    }
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Category(c) => write!(f, "{c}"),
        }
    }
}

impl From<f64> for Finding {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<u32> for Finding {
    fn from(value: u32) -> Self {
        Self::Number(f64::from(value))
    }
}

impl From<&str> for Finding {
    fn from(value: &str) -> Self {
        Self::Category(value.to_string())
    }
}

/// Well-known finding names
pub mod metrics {
    /// New issues introduced by the change
    pub const NEW_ISSUES: &str = "newIssues";
    /// Line coverage percentage
    pub const COVERAGE: &str = "coverage";
    /// Critical bugs found by static analysis
    pub const CRITICAL_BUGS: &str = "criticalBugs";
    /// Maintainability or reliability rating
    pub const RATING: &str = "rating";
    /// Critical vulnerabilities
    pub const CRITICAL_CVES: &str = "criticalCVEs";
    /// High vulnerabilities
    pub const HIGH_CVES: &str = "highCVEs";
    /// Exposed secrets
    pub const SECRETS: &str = "secrets";
    /// Malware detections
    pub const MALWARE: &str = "malware";
}

/// Normalized result from a quality or security adapter
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GateVerdict {
    /// The tool itself considers the result blocking
    #[serde(default)]
    pub blocking: bool,

    /// Named findings
    #[serde(default)]
    pub findings: BTreeMap<String, Finding>,

    /// Free-form detail from the tool
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub detail: String,
}

impl GateVerdict {
    /// Creates an empty, non-blocking verdict
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a finding
    pub fn with_finding(mut self, name: impl Into<String>, value: impl Into<Finding>) -> Self {
        self.findings.insert(name.into(), value.into());
        self
    }

    /// Sets the blocking flag
    pub fn with_blocking(mut self, blocking: bool) -> Self {
        self.blocking = blocking;
        self
    }

    /// Sets the detail text
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }

    /// Looks up a finding by name
    pub fn finding(&self, name: &str) -> Option<&Finding> {
        self.findings.get(name)
    }
}

impl fmt::Display for GateVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let findings = self
            .findings
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(", ");
        write!(f, "verdict(blocking={}, {findings})", self.blocking)
    }
}
