#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Decision-domain types for gating ingress admission on live scan results.
//!
//! This crate is deliberately free of Kubernetes and I/O concerns: it models
//! alert severities, per-severity counts and ceilings, and the pure verdict
//! function the admission handler applies per backend service.

use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, str::FromStr};

/// Alert criticality levels reported by the scan engine.
///
/// The variant order doubles as the evaluation order: a summary exceeding
/// several ceilings at once reports the most critical violation.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
pub enum Severity {
    High,
    Medium,
    Low,
    Informational,
}

impl Severity {
    pub const ALL: [Severity; 4] = [
        Severity::High,
        Severity::Medium,
        Severity::Low,
        Severity::Informational,
    ];

    fn as_str(&self) -> &'static str {
        match self {
            Severity::High => "High",
            Severity::Medium => "Medium",
            Severity::Low => "Low",
            Severity::Informational => "Informational",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = SummaryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "High" => Ok(Severity::High),
            "Medium" => Ok(Severity::Medium),
            "Low" => Ok(Severity::Low),
            "Informational" => Ok(Severity::Informational),
            other => Err(SummaryError::UnknownSeverity(other.to_string())),
        }
    }
}

/// Why a scan engine response could not be coerced into an [`AlertsSummary`].
///
/// A malformed summary is a hard error: it must never be mistaken for a
/// clean (zero-count) scan.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SummaryError {
    #[error("unknown severity label {0:?}")]
    UnknownSeverity(String),

    #[error("count for {severity:?} is not a non-negative integer: {value}")]
    InvalidCount { severity: String, value: String },

    #[error("alerts summary is not a JSON object")]
    NotAnObject,
}

/// Per-severity alert counts reported by a live scan.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AlertsSummary(BTreeMap<Severity, u32>);

impl AlertsSummary {
    /// Coerces the scan engine's loosely-typed summary object.
    ///
    /// Counts may arrive as JSON numbers or as numeric strings; anything
    /// else fails.
    pub fn from_value(value: &serde_json::Value) -> Result<Self, SummaryError> {
        let map = value.as_object().ok_or(SummaryError::NotAnObject)?;
        let mut counts = BTreeMap::new();
        for (label, raw) in map {
            let severity = label.parse::<Severity>()?;
            let count = coerce_count(raw).ok_or_else(|| SummaryError::InvalidCount {
                severity: label.clone(),
                value: raw.to_string(),
            })?;
            counts.insert(severity, count);
        }
        Ok(Self(counts))
    }

    pub fn count(&self, severity: Severity) -> u32 {
        self.0.get(&severity).copied().unwrap_or(0)
    }
}

impl FromIterator<(Severity, u32)> for AlertsSummary {
    fn from_iter<I: IntoIterator<Item = (Severity, u32)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

fn coerce_count(value: &serde_json::Value) -> Option<u32> {
    match value {
        serde_json::Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Per-severity alert ceilings.
///
/// The default is zero tolerance: any alert at a severity without an
/// explicitly configured ceiling denies admission.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SeverityThresholds {
    pub high: u32,
    pub medium: u32,
    pub low: u32,
    pub informational: u32,
}

impl SeverityThresholds {
    pub fn limit(&self, severity: Severity) -> u32 {
        match severity {
            Severity::High => self.high,
            Severity::Medium => self.medium,
            Severity::Low => self.low,
            Severity::Informational => self.informational,
        }
    }

    pub fn set(&mut self, severity: Severity, limit: u32) {
        match severity {
            Severity::High => self.high = limit,
            Severity::Medium => self.medium = limit,
            Severity::Low => self.low = limit,
            Severity::Informational => self.informational = limit,
        }
    }
}

/// The outcome of comparing one scan summary against the configured
/// ceilings.
///
/// A denial names the violation so the admission reason can identify what
/// tripped the gate rather than reporting a bare "thresholds exceeded".
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Deny {
        severity: Severity,
        count: u32,
        limit: u32,
    },
}

impl Verdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allow)
    }
}

/// Allows iff every reported count is at or under its ceiling.
///
/// Severities absent from the summary are zero and pass trivially.
pub fn decide(summary: &AlertsSummary, thresholds: &SeverityThresholds) -> Verdict {
    for severity in Severity::ALL {
        let count = summary.count(severity);
        let limit = thresholds.limit(severity);
        if count > limit {
            return Verdict::Deny {
                severity,
                count,
                limit,
            };
        }
    }
    Verdict::Allow
}
