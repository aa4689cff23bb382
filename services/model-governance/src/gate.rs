//! Promotion rules. Pure: the same candidate, report, thresholds and block
//! list always produce the same verdict with the same reasons.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::audit::FairnessReport;
use crate::error::{AuditDataError, GovernanceError, Result};
use crate::metrics::MetricName;
use crate::search::Candidate;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromotionThresholds {
    pub primary_metric: MetricName,
    pub min_quality: f64,
    pub max_disparity: f64,
    /// Per protected attribute overrides of `max_disparity`.
    pub per_attribute: BTreeMap<String, f64>,
    /// Attributes every fairness report must cover.
    pub required_attributes: Vec<String>,
}

impl Default for PromotionThresholds {
    fn default() -> Self { Self { primary_metric: MetricName::F1, min_quality: 0.80, max_disparity: 0.05, per_attribute: BTreeMap::new(), required_attributes: Vec::new() } }
}

impl PromotionThresholds {
    pub fn disparity_limit(&self, attribute: &str) -> f64 {
        self.per_attribute.get(attribute).copied().unwrap_or(self.max_disparity)
    }

    pub fn validate(&self) -> Result<()> {
        let bad = |v: f64| !v.is_finite() || v < 0.0;
        if bad(self.min_quality) { return Err(GovernanceError::InvalidInput(format!("min_quality {} must be a finite non-negative number", self.min_quality))); }
        if let Some((attr, v)) = std::iter::once(("*", &self.max_disparity)).chain(self.per_attribute.iter().map(|(k, v)| (k.as_str(), v))).find(|(_, v)| bad(**v)) {
            return Err(GovernanceError::InvalidInput(format!("disparity limit {v} for `{attr}` must be a finite non-negative number")));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectionReason {
    ReportMismatch { report_candidate_id: String },
    EmptyReport,
    MissingAttribute { attribute: String },
    MissingMetric { metric: MetricName },
    QualityBelowThreshold { metric: MetricName, value: f64, threshold: f64 },
    DisparityAboveThreshold { attribute: String, disparity: f64, threshold: f64 },
    UnresolvedAuditError(AuditDataError),
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectionReason::ReportMismatch { report_candidate_id } => write!(f, "fairness report belongs to `{report_candidate_id}`"),
            RejectionReason::EmptyReport => f.write_str("fairness report audits no protected attribute"),
            RejectionReason::MissingAttribute { attribute } => write!(f, "fairness report does not audit `{attribute}`"),
            RejectionReason::MissingMetric { metric } => write!(f, "candidate has no `{metric}` score"),
            RejectionReason::QualityBelowThreshold { metric, value, threshold } => write!(f, "{metric} {value:.4} below {threshold:.4}"),
            RejectionReason::DisparityAboveThreshold { attribute, disparity, threshold } => write!(f, "disparity {disparity:.4} on `{attribute}` above {threshold:.4}"),
            RejectionReason::UnresolvedAuditError(e) => write!(f, "unresolved audit error: {e}"),
        }
    }
}

/// A gate verdict against promotion. An expected outcome, not a fault.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromotionRejected {
    pub candidate_id: String,
    pub reasons: Vec<RejectionReason>,
}

impl PromotionRejected {
    pub fn cites_attribute(&self, attribute: &str) -> bool {
        self.reasons.iter().any(|r| matches!(r, RejectionReason::DisparityAboveThreshold { attribute: a, .. } if a == attribute))
    }
}

impl fmt::Display for PromotionRejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "candidate `{}` rejected: ", self.candidate_id)?;
        for (i, r) in self.reasons.iter().enumerate() {
            if i > 0 { f.write_str("; ")?; }
            write!(f, "{r}")?;
        }
        Ok(())
    }
}

/// Check every criterion and collect all failures, report-shape problems
/// first, then quality, then fairness (see [`fairness_violations`]), then
/// audit blocks.
pub fn evaluate(candidate: &Candidate, report: &FairnessReport, thresholds: &PromotionThresholds, blocks: &[AuditDataError]) -> std::result::Result<(), PromotionRejected> {
    let mut reasons = Vec::new();
    if report.candidate_id != candidate.candidate_id {
        reasons.push(RejectionReason::ReportMismatch { report_candidate_id: report.candidate_id.clone() });
    }
    if report.attributes.is_empty() { reasons.push(RejectionReason::EmptyReport); }

    let metric = thresholds.primary_metric;
    match candidate.metric(metric) {
        None => reasons.push(RejectionReason::MissingMetric { metric }),
        Some(value) if !(value >= thresholds.min_quality) => {
            reasons.push(RejectionReason::QualityBelowThreshold { metric, value, threshold: thresholds.min_quality });
        }
        Some(_) => {}
    }
    reasons.extend(fairness_violations(report, thresholds));
    reasons.extend(blocks.iter().cloned().map(RejectionReason::UnresolvedAuditError));

    if reasons.is_empty() { Ok(()) } else { Err(PromotionRejected { candidate_id: candidate.candidate_id.clone(), reasons }) }
}

/// Fairness criteria alone: required attributes the report skips, then each
/// audited attribute over its limit, in report order.
pub fn fairness_violations(report: &FairnessReport, thresholds: &PromotionThresholds) -> Vec<RejectionReason> {
    let missing = thresholds.required_attributes.iter()
        .filter(|a| report.attribute(a).is_none())
        .map(|a| RejectionReason::MissingAttribute { attribute: a.clone() });
    let over = report.attributes.iter().filter_map(|attr| {
        let threshold = thresholds.disparity_limit(&attr.protected_attribute);
        (!(attr.disparity_score <= threshold)).then(|| RejectionReason::DisparityAboveThreshold {
            attribute: attr.protected_attribute.clone(),
            disparity: attr.disparity_score,
            threshold,
        })
    });
    missing.chain(over).collect()
}
