//! Gate thresholds and policies
//!
//! Thresholds are written as `metric <op> limit`, for example
//! `criticalCVEs <= 0` or `rating <= B`.

#![allow(clippy::must_use_candidate, clippy::return_self_not_must_use)]

use crate::pipeline::errors::ValidationError;
use crate::pipeline::verdict::{Finding, metrics};
use crate::pipeline::Validate;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

static THRESHOLD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*([A-Za-z_][A-Za-z0-9_.]*)\s*(<=|>=|==|!=|<|>|=)\s*(\S.*?)\s*$")
        .expect("threshold pattern is valid")
});

/// Comparison operator of a threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Comparison {
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `==`
    Eq,
    /// `!=`
    Ne,
}

impl Comparison {
    /// Returns true if `ordering` (actual compared to limit) satisfies the operator
    pub fn holds(self, ordering: Ordering) -> bool {
        match self {
            Self::Lt => ordering == Ordering::Less,
            Self::Le => ordering != Ordering::Greater,
            Self::Gt => ordering == Ordering::Greater,
            Self::Ge => ordering != Ordering::Less,
            Self::Eq => ordering == Ordering::Equal,
            Self::Ne => ordering != Ordering::Equal,
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Eq => "==",
            Self::Ne => "!=",
        }
    }
}

impl FromStr for Comparison {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "<" => Ok(Self::Lt),
            "<=" => Ok(Self::Le),
            ">" => Ok(Self::Gt),
            ">=" => Ok(Self::Ge),
            "==" | "=" => Ok(Self::Eq),
            "!=" => Ok(Self::Ne),
            other => Err(format!("unknown operator '{other}'")),
        }
    }
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// One `metric <op> limit` requirement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Threshold {
    /// Finding name the threshold reads
    pub metric: String,
    /// Operator
    pub op: Comparison,
    /// Limit the finding is compared against
    pub limit: Finding,
}

impl Threshold {
    /// Creates a threshold
    pub fn new(metric: impl Into<String>, op: Comparison, limit: impl Into<Finding>) -> Self {
        Self {
            metric: metric.into(),
            op,
            limit: limit.into(),
        }
    }

    /// Checks an actual finding against this threshold
    ///
    /// Returns `None` when satisfied, or the reason it is violated.
    pub fn check(&self, actual: Option<&Finding>) -> Option<String> {
        let Some(actual) = actual else {
            return Some(format!("{}: finding missing (requires {self})", self.metric));
        };

        let ordering = match (actual, &self.limit) {
            (Finding::Number(a), Finding::Number(l)) => a.partial_cmp(l),
            (Finding::Category(a), Finding::Category(l)) => Some(a.as_str().cmp(l.as_str())),
            (Finding::Category(_), Finding::Number(_)) => {
                return Some(format!(
                    "{}: expected a number, got '{actual}' (requires {self})",
                    self.metric
                ));
            }
            (Finding::Number(_), Finding::Category(_)) => {
                return Some(format!(
                    "{}: expected a category, got {actual} (requires {self})",
                    self.metric
                ));
            }
        };

        match ordering {
            Some(ordering) if self.op.holds(ordering) => None,
            _ => Some(format!("{} is {actual} (requires {self})", self.metric)),
        }
    }
}

impl fmt::Display for Threshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.metric, self.op, self.limit)
    }
}

impl FromStr for Threshold {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let caps = THRESHOLD
            .captures(s)
            .ok_or_else(|| ValidationError::InvalidThreshold {
                metric: s.trim().to_string(),
                reason: "expected '<metric> <op> <limit>'".to_string(),
            })?;

        let metric = caps[1].to_string();
        let op = caps[2]
            .parse::<Comparison>()
            .map_err(|reason| ValidationError::InvalidThreshold {
                metric: metric.clone(),
                reason,
            })?;
        let raw = caps[3].trim_matches(|c| c == '"' || c == '\'');
        let limit = match raw.parse::<f64>() {
            Ok(n) => Finding::Number(n),
            Err(_) => Finding::Category(raw.to_string()),
        };

        let threshold = Self { metric, op, limit };
        threshold.validate()?;
        Ok(threshold)
    }
}

impl TryFrom<String> for Threshold {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Threshold> for String {
    fn from(value: Threshold) -> Self {
        value.to_string()
    }
}

impl Validate for Threshold {
    type Error = ValidationError;

    fn validate(&self) -> Result<(), Self::Error> {
        if self.metric.is_empty() {
            return Err(ValidationError::InvalidThreshold {
                metric: String::new(),
                reason: "metric cannot be empty".to_string(),
            });
        }
        match &self.limit {
            Finding::Number(n) if !n.is_finite() => Err(ValidationError::InvalidThreshold {
                metric: self.metric.clone(),
                reason: format!("limit must be finite, got {n}"),
            }),
            Finding::Category(c) if c.is_empty() => Err(ValidationError::InvalidThreshold {
                metric: self.metric.clone(),
                reason: "limit cannot be empty".to_string(),
            }),
            _ => Ok(()),
        }
    }
}

/// Set of thresholds a verdict must satisfy together
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GatePolicy {
    /// Thresholds; all of them must hold
    #[serde(default)]
    pub thresholds: Vec<Threshold>,
}

impl GatePolicy {
    /// Creates an empty policy (only the tool's blocking flag is checked)
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a threshold
    pub fn require(mut self, threshold: Threshold) -> Self {
        self.thresholds.push(threshold);
        self
    }

    /// Default static-analysis policy: no new issues, coverage of at least 80, no critical bugs
    pub fn default_quality() -> Self {
        Self::new()
            .require(Threshold::new(metrics::NEW_ISSUES, Comparison::Eq, 0.0))
            .require(Threshold::new(metrics::COVERAGE, Comparison::Ge, 80.0))
            .require(Threshold::new(metrics::CRITICAL_BUGS, Comparison::Eq, 0.0))
    }

    /// Default security policy: no critical CVEs, at most two high CVEs, no secrets, no malware
    pub fn default_security() -> Self {
        Self::new()
            .require(Threshold::new(metrics::CRITICAL_CVES, Comparison::Le, 0.0))
            .require(Threshold::new(metrics::HIGH_CVES, Comparison::Le, 2.0))
            .require(Threshold::new(metrics::SECRETS, Comparison::Eq, 0.0))
            .require(Threshold::new(metrics::MALWARE, Comparison::Eq, 0.0))
    }
}

impl Validate for GatePolicy {
    type Error = ValidationError;

    fn validate(&self) -> Result<(), Self::Error> {
        for threshold in &self.thresholds {
            threshold.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_threshold() {
        let t: Threshold = "criticalCVEs <= 0".parse().unwrap();
        assert_eq!(t, Threshold::new("criticalCVEs", Comparison::Le, 0.0));

        let t: Threshold = "coverage>=80".parse().unwrap();
        assert_eq!(t.op, Comparison::Ge);

        let t: Threshold = "rating <= 'B'".parse().unwrap();
        assert_eq!(t.limit, Finding::Category("B".to_string()));

        let t: Threshold = "newIssues = 0".parse().unwrap();
        assert_eq!(t.op, Comparison::Eq);
    }

    #[test]
    fn test_parse_threshold_rejects_garbage() {
        assert!("coverage".parse::<Threshold>().is_err());
        assert!("<= 3".parse::<Threshold>().is_err());
        assert!("coverage ~ 3".parse::<Threshold>().is_err());
    }

    #[test]
    fn test_threshold_round_trips_through_yaml() {
        let policy: GatePolicy =
            serde_yaml::from_str("thresholds:\n  - criticalCVEs <= 0\n  - highCVEs <= 2\n").unwrap();
        assert_eq!(policy.thresholds.len(), 2);
        let yaml = serde_yaml::to_string(&policy).unwrap();
        assert!(yaml.contains("highCVEs <= 2"));
    }

    #[test]
    fn test_threshold_check() {
        let t = Threshold::new("coverage", Comparison::Ge, 80.0);
        assert!(t.check(Some(&Finding::Number(85.0))).is_none());
        let reason = t.check(Some(&Finding::Number(72.5))).unwrap();
        assert!(reason.contains("coverage is 72.5"));
        assert!(reason.contains(">= 80"));
        assert!(t.check(None).unwrap().contains("missing"));
        assert!(t.check(Some(&Finding::Category("A".into()))).is_some());
    }

    #[test]
    fn test_categorical_threshold() {
        let t: Threshold = "rating <= B".parse().unwrap();
        assert!(t.check(Some(&Finding::Category("A".into()))).is_none());
        assert!(t.check(Some(&Finding::Category("B".into()))).is_none());
        assert!(t.check(Some(&Finding::Category("D".into()))).is_some());
    }

    #[test]
    fn test_comparison_holds() {
        assert!(Comparison::Le.holds(Ordering::Equal));
        assert!(!Comparison::Lt.holds(Ordering::Equal));
        assert!(Comparison::Ne.holds(Ordering::Less));
        assert!(!Comparison::Eq.holds(Ordering::Greater));
    }

    #[test]
    fn test_default_policies_are_valid() {
        assert!(GatePolicy::default_quality().validate().is_ok());
        assert!(GatePolicy::default_security().validate().is_ok());
        assert_eq!(GatePolicy::default_security().thresholds.len(), 4);
    }
}
