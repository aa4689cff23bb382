//! Fairness and explainability audit of a trained candidate against a
//! holdout set.
//!
//! Per protected attribute the auditor groups holdout rows into subgroups,
//! computes the configured fairness metric for each subgroup large enough to
//! be meaningful, and reports the worst pairwise gap. Feature attributions
//! use occlusion: each feature is replaced by its holdout baseline and the
//! mean absolute change in predicted probability is its importance.

use itertools::Itertools;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::artifacts::{ArtifactHandle, ArtifactStore};
use crate::error::{AuditDataError, GovernanceError, Result};
use crate::metrics::Confusion;
use crate::model::TrainedModel;
use crate::schema::{category_counts, mode, Dataset, FeatureKind, Record, Value};
use crate::search::Candidate;
use crate::telemetry::governance_metrics;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FairnessMetric {
    #[default]
    FalseNegativeRate,
    FalsePositiveRate,
    TruePositiveRate,
    SelectionRate,
    Accuracy,
}

impl FairnessMetric {
    fn compute(self, c: &Confusion) -> Option<f64> {
        match self {
            FairnessMetric::FalseNegativeRate => c.false_negative_rate(),
            FairnessMetric::FalsePositiveRate => c.false_positive_rate(),
            FairnessMetric::TruePositiveRate => c.recall(),
            FairnessMetric::SelectionRate => c.selection_rate(),
            FairnessMetric::Accuracy => c.accuracy(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditSettings {
    pub fairness_metric: FairnessMetric,
    pub min_subgroup_size: usize,
    /// Rows used for occlusion attributions; the holdout prefix.
    pub max_explained_rows: usize,
    pub protected_attributes: Vec<String>,
    /// Share of cleaned data held out of search for auditing.
    pub holdout_fraction: f64,
    /// Top-ranked candidates audited per cycle before giving up.
    pub candidates_to_audit: usize,
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            fairness_metric: FairnessMetric::FalseNegativeRate,
            min_subgroup_size: 30,
            max_explained_rows: 500,
            protected_attributes: vec!["Gender".into(), "MaritalStatus".into()],
            holdout_fraction: 0.2,
            candidates_to_audit: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExclusionReason {
    BelowMinimumSize,
    /// The metric's denominator is empty in this subgroup (e.g. no positives for FNR).
    MetricUndefined,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExcludedSubgroup {
    pub subgroup: String,
    pub sample_count: usize,
    pub reason: ExclusionReason,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeFairness {
    pub protected_attribute: String,
    pub subgroup_metric: BTreeMap<String, f64>,
    pub disparity_score: f64,
    pub excluded_subgroups: Vec<ExcludedSubgroup>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureImportance {
    pub feature: String,
    pub importance: f64,
}

/// Audit outcome for one candidate. Written once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FairnessReport {
    pub candidate_id: String,
    pub fairness_metric: FairnessMetric,
    pub holdout_rows: usize,
    pub attributes: Vec<AttributeFairness>,
    /// Most important feature first.
    pub explanation_summary: Vec<FeatureImportance>,
}

impl FairnessReport {
    pub fn attribute(&self, name: &str) -> Option<&AttributeFairness> {
        self.attributes.iter().find(|a| a.protected_attribute == name)
    }

    pub fn max_disparity(&self) -> Option<f64> {
        self.attributes.iter().map(|a| a.disparity_score).max_by(|a, b| a.total_cmp(b))
    }
}

/// Largest absolute difference between any two subgroup values.
pub fn disparity<I>(values: I) -> f64
where
    I: IntoIterator<Item = f64>,
    I::IntoIter: Clone,
{
    values.into_iter().tuple_combinations().map(|(a, b): (f64, f64)| (a - b).abs()).fold(0.0, f64::max)
}

pub struct FairnessAuditor {
    artifacts: Arc<dyn ArtifactStore>,
    settings: AuditSettings,
}

impl FairnessAuditor {
    pub fn new(artifacts: Arc<dyn ArtifactStore>, settings: AuditSettings) -> Self { Self { artifacts, settings } }

    pub fn audit(&self, candidate: &Candidate, holdout: &Dataset, protected_attributes: &[String]) -> Result<FairnessReport> {
        self.audit_artifact(&candidate.candidate_id, &candidate.artifact, holdout, protected_attributes)
    }

    /// Audit the model stored under `artifact`, reporting it as `candidate_id`.
    #[instrument(skip(self, artifact, holdout, protected_attributes), fields(rows = holdout.len()))]
    pub fn audit_artifact(&self, candidate_id: &str, artifact: &ArtifactHandle, holdout: &Dataset, protected_attributes: &[String]) -> Result<FairnessReport> {
        if holdout.is_empty() { return Err(GovernanceError::InvalidInput("holdout set is empty".into())); }
        if protected_attributes.is_empty() { return Err(GovernanceError::InvalidInput("no protected attributes to audit".into())); }
        if let Some(unknown) = protected_attributes.iter().find(|a| holdout.schema().descriptor(a).is_none()) {
            return Err(GovernanceError::Schema(format!("protected attribute `{unknown}` is not a schema feature")));
        }
        let model = self.artifacts.load(artifact)?;
        let probs: Vec<f64> = holdout.rows().iter().map(|r| model.predict_proba(&r.features)).collect();
        let predicted: Vec<bool> = probs.iter().map(|p| *p >= model.threshold).collect();

        let attributes = protected_attributes.iter()
            .map(|attr| self.audit_attribute(attr, holdout, &predicted))
            .collect::<std::result::Result<Vec<_>, AuditDataError>>()
            .inspect_err(|e| {
                governance_metrics().audit_data_errors_total.add(1, &[]);
                warn!(candidate_id, attribute = %e.attribute, populated = e.populated, "attribute cannot be audited");
            })?;
        let explanation_summary = self.explain(&model, holdout, &probs);

        governance_metrics().audits_total.add(1, &[]);
        let report = FairnessReport {
            candidate_id: candidate_id.to_string(),
            fairness_metric: self.settings.fairness_metric,
            holdout_rows: holdout.len(),
            attributes,
            explanation_summary,
        };
        info!(
            candidate_id = %report.candidate_id,
            max_disparity = report.max_disparity(),
            top_feature = report.explanation_summary.first().map(|f| f.feature.as_str()),
            "audit complete"
        );
        Ok(report)
    }

    fn audit_attribute(&self, attribute: &str, holdout: &Dataset, predicted: &[bool]) -> std::result::Result<AttributeFairness, AuditDataError> {
        let mut groups: BTreeMap<String, (Vec<bool>, Vec<bool>)> = BTreeMap::new();
        for ((value, row), &p) in holdout.column(attribute).zip(holdout.rows()).zip(predicted) {
            let g = groups.entry(value.group_key()).or_default();
            g.0.push(row.label);
            g.1.push(p);
        }
        let mut subgroup_metric = BTreeMap::new();
        let mut excluded_subgroups = Vec::new();
        for (subgroup, (actual, pred)) in groups {
            let sample_count = actual.len();
            if sample_count < self.settings.min_subgroup_size {
                excluded_subgroups.push(ExcludedSubgroup { subgroup, sample_count, reason: ExclusionReason::BelowMinimumSize });
                continue;
            }
            match self.settings.fairness_metric.compute(&Confusion::from_predictions(&actual, &pred)) {
                Some(v) => { subgroup_metric.insert(subgroup, v); }
                None => excluded_subgroups.push(ExcludedSubgroup { subgroup, sample_count, reason: ExclusionReason::MetricUndefined }),
            }
        }
        if subgroup_metric.len() < 2 {
            return Err(AuditDataError { attribute: attribute.to_string(), populated: subgroup_metric.len(), min_subgroup_size: self.settings.min_subgroup_size });
        }
        let disparity_score = disparity(subgroup_metric.values().copied());
        Ok(AttributeFairness { protected_attribute: attribute.to_string(), subgroup_metric, disparity_score, excluded_subgroups })
    }

    fn explain(&self, model: &TrainedModel, holdout: &Dataset, probs: &[f64]) -> Vec<FeatureImportance> {
        let n = holdout.len().min(self.settings.max_explained_rows.max(1));
        let rows = &holdout.rows()[..n];
        let mut importances: Vec<FeatureImportance> = holdout.schema().features.par_iter().map(|desc| {
            let baseline = baseline(holdout, &desc.name, desc.kind);
            let total: f64 = rows.iter().zip(probs).map(|(row, p)| {
                let mut occluded: Record = row.features.clone();
                occluded.insert(desc.name.clone(), baseline.clone());
                (model.predict_proba(&occluded) - p).abs()
            }).sum();
            FeatureImportance { feature: desc.name.clone(), importance: total / n as f64 }
        }).collect();
        importances.sort_by(|a, b| b.importance.total_cmp(&a.importance).then_with(|| a.feature.cmp(&b.feature)));
        importances
    }
}

fn baseline(data: &Dataset, name: &str, kind: FeatureKind) -> Value {
    if kind.is_numeric() {
        let xs: Vec<f64> = data.column(name).filter_map(Value::as_f64).collect();
        if xs.is_empty() { return Value::Missing; }
        Value::Number(xs.iter().sum::<f64>() / xs.len() as f64)
    } else {
        mode(&category_counts(data.column(name))).map(Value::Text).unwrap_or(Value::Missing)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::artifacts::InMemoryArtifactStore;
    use crate::model::{FeatureEncoder, HyperValue, Hyperparameters, LogisticTrainer, Trainer};
    use crate::schema::LabeledRecord;
    use crate::search::tests::candidate;
    use crate::testing::synthetic_dataset;

    /// A candidate whose artifact is a logistic model fitted on `data`.
    pub(crate) fn trained_candidate(store: &Arc<InMemoryArtifactStore>, data: &Dataset) -> Candidate {
        let encoder = Arc::new(FeatureEncoder::fit(data));
        let mut hp = Hyperparameters::new();
        hp.insert("learning_rate".into(), HyperValue::Float(0.3));
        hp.insert("epochs".into(), HyperValue::Int(200));
        let predictor = LogisticTrainer.fit(&encoder.encode_all(data), &data.labels(), &hp).unwrap();
        let mut c = candidate(0, 0.85);
        c.artifact = store.save(Arc::new(TrainedModel::new(encoder, predictor))).unwrap();
        c
    }

    fn relabel(data: &Dataset, from: &str, to: &str) -> Dataset {
        let rows = data.rows().iter().map(|r| {
            let mut features = r.features.clone();
            let swapped = match features.get("Gender").and_then(Value::as_str) {
                Some(g) if g == from => to,
                Some(g) if g == to => from,
                _ => return r.clone(),
            };
            features.insert("Gender".into(), Value::Text(swapped.into()));
            LabeledRecord { features, label: r.label }
        }).collect();
        Dataset::new(data.schema().clone(), rows).unwrap()
    }

    fn setup(min_subgroup_size: usize) -> (FairnessAuditor, Candidate, Dataset) {
        let store = Arc::new(InMemoryArtifactStore::new());
        let (train, holdout) = synthetic_dataset(800, 0.0, 3).split(0.5, 1).unwrap();
        let c = trained_candidate(&store, &train);
        let settings = AuditSettings { min_subgroup_size, ..Default::default() };
        (FairnessAuditor::new(store, settings), c, holdout)
    }

    #[test]
    fn disparity_is_max_pairwise_gap() {
        assert!((disparity([0.2, 0.5, 0.35]) - 0.3).abs() < 1e-12);
        assert_eq!(disparity([0.4]), 0.0);
    }

    #[test]
    fn disparity_symmetric_under_subgroup_swap() {
        let (auditor, c, holdout) = setup(30);
        let model = auditor.artifacts.load(&c.artifact).unwrap();
        let predicted: Vec<bool> = holdout.rows().iter().map(|r| model.predict(&r.features)).collect();
        let fa = auditor.audit_attribute("Gender", &holdout, &predicted).unwrap();
        let fb = auditor.audit_attribute("Gender", &relabel(&holdout, "F", "M"), &predicted).unwrap();
        assert!((fa.disparity_score - fb.disparity_score).abs() < 1e-12);
        assert_eq!(fa.subgroup_metric["F"], fb.subgroup_metric["M"]);
    }

    #[test]
    fn too_few_populated_subgroups_is_audit_error() {
        let (auditor, c, holdout) = setup(10_000);
        match auditor.audit(&c, &holdout, &["Gender".to_string()]) {
            Err(GovernanceError::AuditData(e)) => {
                assert_eq!(e.attribute, "Gender");
                assert_eq!(e.populated, 0);
            }
            other => panic!("expected audit data error, got {other:?}"),
        }
    }

    #[test]
    fn small_subgroups_are_flagged_not_dropped() {
        let (auditor, c, holdout) = setup(30);
        let mut rows = holdout.rows().to_vec();
        for r in rows.iter_mut().take(5) { r.features.insert("Gender".into(), Value::Text("X".into())); }
        let holdout = Dataset::new(holdout.schema().clone(), rows).unwrap();
        let report = auditor.audit(&c, &holdout, &["Gender".to_string()]).unwrap();
        let g = report.attribute("Gender").unwrap();
        assert_eq!(g.excluded_subgroups, vec![ExcludedSubgroup { subgroup: "X".into(), sample_count: 5, reason: ExclusionReason::BelowMinimumSize }]);
        assert!(!g.subgroup_metric.contains_key("X"));
    }

    #[test]
    fn audit_is_deterministic_and_ranks_informative_features() {
        let (auditor, c, holdout) = setup(30);
        let attrs = vec!["Gender".to_string()];
        let a = auditor.audit(&c, &holdout, &attrs).unwrap();
        assert_eq!(a, auditor.audit(&c, &holdout, &attrs).unwrap());
        let ranked: Vec<&str> = a.explanation_summary.iter().map(|f| f.feature.as_str()).collect();
        assert_eq!(ranked.len(), 3);
        assert_eq!(ranked[2], "Gender");
        for w in a.explanation_summary.windows(2) { assert!(w[0].importance >= w[1].importance); }
    }

    #[test]
    fn unknown_attribute_is_schema_error() {
        let (auditor, c, holdout) = setup(30);
        assert!(matches!(auditor.audit(&c, &holdout, &["Department".to_string()]), Err(GovernanceError::Schema(_))));
    }
}
