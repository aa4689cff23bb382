//! Explicit tabular schema contract.
//!
//! Training data and prediction requests arrive as loosely typed JSON
//! objects; they are checked against an ordered set of typed feature
//! descriptors before anything downstream sees them.

use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{GovernanceError, Result};

pub type JsonRecord = serde_json::Map<String, serde_json::Value>;

pub(crate) static MISSING: Value = Value::Missing;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Number(f64),
    Text(String),
    Missing,
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self { Value::Number(v) => Some(*v), _ => None }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self { Value::Text(s) => Some(s), _ => None }
    }

    pub fn is_missing(&self) -> bool { matches!(self, Value::Missing) }

    /// Stable label used for subgroup keys and category counts.
    pub fn group_key(&self) -> String {
        match self {
            Value::Number(v) if v.fract() == 0.0 && v.abs() < 1e15 => format!("{}", *v as i64),
            Value::Number(v) => format!("{v}"),
            Value::Text(s) => s.clone(),
            Value::Missing => "<missing>".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureKind { Numeric, Ordinal, Categorical }

impl FeatureKind {
    pub fn is_numeric(self) -> bool { matches!(self, FeatureKind::Numeric | FeatureKind::Ordinal) }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureDescriptor {
    pub name: String,
    pub kind: FeatureKind,
}

impl FeatureDescriptor {
    pub fn numeric(name: &str) -> Self { Self { name: name.into(), kind: FeatureKind::Numeric } }
    pub fn ordinal(name: &str) -> Self { Self { name: name.into(), kind: FeatureKind::Ordinal } }
    pub fn categorical(name: &str) -> Self { Self { name: name.into(), kind: FeatureKind::Categorical } }
}

pub type Record = BTreeMap<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSchema {
    pub features: Vec<FeatureDescriptor>,
    pub target: String,
}

impl FeatureSchema {
    pub fn new(features: Vec<FeatureDescriptor>, target: &str) -> Result<Self> {
        if features.is_empty() { return Err(GovernanceError::Schema("schema declares no features".into())); }
        let mut seen = HashSet::new();
        for f in &features {
            if f.name == target { return Err(GovernanceError::Schema(format!("target `{target}` declared as a feature"))); }
            if !seen.insert(f.name.as_str()) { return Err(GovernanceError::Schema(format!("duplicate feature `{}`", f.name))); }
        }
        Ok(Self { features, target: target.to_string() })
    }

    pub fn descriptor(&self, name: &str) -> Option<&FeatureDescriptor> { self.features.iter().find(|f| f.name == name) }

    fn coerce(&self, desc: &FeatureDescriptor, raw: Option<&serde_json::Value>) -> Result<Value> {
        use serde_json::Value as J;
        match (desc.kind, raw) {
            (_, None) | (_, Some(J::Null)) => Ok(Value::Missing),
            (k, Some(J::Number(n))) if k.is_numeric() => n.as_f64().filter(|v| v.is_finite()).map(Value::Number)
                .ok_or_else(|| GovernanceError::Schema(format!("feature `{}` is not a finite number", desc.name))),
            (FeatureKind::Categorical, Some(J::String(s))) => Ok(Value::Text(s.clone())),
            (FeatureKind::Categorical, Some(J::Number(n))) => Ok(Value::Text(n.to_string())),
            (FeatureKind::Categorical, Some(J::Bool(b))) => Ok(Value::Text(b.to_string())),
            (kind, Some(other)) => Err(GovernanceError::Schema(format!("feature `{}` expects {:?}, got {}", desc.name, kind, other))),
        }
    }

    /// Validate and type one JSON object. With `strict`, fields the schema
    /// does not declare are rejected instead of dropped.
    pub fn parse_record(&self, raw: &JsonRecord, strict: bool) -> Result<Record> {
        if strict {
            if let Some(extra) = raw.keys().find(|k| self.descriptor(k).is_none() && **k != self.target) {
                return Err(GovernanceError::Schema(format!("unknown feature `{extra}`")));
            }
        }
        self.features.iter().map(|d| Ok((d.name.clone(), self.coerce(d, raw.get(&d.name))?))).collect()
    }

    /// Check an already typed record, as the serving path receives it.
    pub fn validate_record(&self, record: &Record) -> Result<()> {
        for (name, value) in record {
            let desc = self.descriptor(name).ok_or_else(|| GovernanceError::Schema(format!("unknown feature `{name}`")))?;
            let ok = match (desc.kind, value) {
                (_, Value::Missing) => true,
                (k, Value::Number(v)) => k.is_numeric() && v.is_finite(),
                (FeatureKind::Categorical, Value::Text(_)) => true,
                _ => false,
            };
            if !ok { return Err(GovernanceError::Schema(format!("feature `{name}` has wrong type for {:?}", desc.kind))); }
        }
        Ok(())
    }
}

fn parse_label(raw: &serde_json::Value) -> Option<bool> {
    use serde_json::Value as J;
    match raw {
        J::Bool(b) => Some(*b),
        J::Number(n) => n.as_f64().map(|v| v != 0.0),
        J::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "yes" | "y" | "true" | "1" => Some(true),
            "no" | "n" | "false" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabeledRecord {
    pub features: Record,
    pub label: bool,
}

/// Validated labeled rows sharing one schema.
#[derive(Debug, Clone)]
pub struct Dataset {
    schema: Arc<FeatureSchema>,
    rows: Vec<LabeledRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CleaningSummary {
    pub duplicates_dropped: usize,
    pub imputed: BTreeMap<String, usize>,
}

impl Dataset {
    pub fn new(schema: Arc<FeatureSchema>, rows: Vec<LabeledRecord>) -> Result<Self> {
        if rows.is_empty() { return Err(GovernanceError::InvalidInput("training data is empty".into())); }
        for (i, row) in rows.iter().enumerate() {
            schema.validate_record(&row.features).map_err(|e| GovernanceError::Schema(format!("row {i}: {e}")))?;
        }
        Ok(Self { schema, rows })
    }

    /// Build from raw JSON objects. Every row must carry the target column;
    /// columns outside the schema are dropped.
    pub fn from_json_records(schema: Arc<FeatureSchema>, records: &[JsonRecord]) -> Result<Self> {
        if records.is_empty() { return Err(GovernanceError::InvalidInput("training data is empty".into())); }
        let mut dropped_cols = 0usize;
        let mut rows = Vec::with_capacity(records.len());
        for (i, raw) in records.iter().enumerate() {
            let target = raw.get(&schema.target)
                .ok_or_else(|| GovernanceError::Schema(format!("row {i} missing target column `{}`", schema.target)))?;
            let label = parse_label(target)
                .ok_or_else(|| GovernanceError::Schema(format!("row {i} target `{target}` is not a binary label")))?;
            dropped_cols += raw.keys().filter(|k| schema.descriptor(k).is_none() && **k != schema.target).count();
            let features = schema.parse_record(raw, false).map_err(|e| GovernanceError::Schema(format!("row {i}: {e}")))?;
            rows.push(LabeledRecord { features, label });
        }
        if dropped_cols > 0 { debug!(dropped_cols, "ignored columns outside the schema"); }
        Ok(Self { schema, rows })
    }

    pub fn schema(&self) -> &Arc<FeatureSchema> { &self.schema }
    pub fn rows(&self) -> &[LabeledRecord] { &self.rows }
    pub fn len(&self) -> usize { self.rows.len() }
    pub fn is_empty(&self) -> bool { self.rows.is_empty() }
    pub fn labels(&self) -> Vec<bool> { self.rows.iter().map(|r| r.label).collect() }

    pub fn column<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Value> + 'a {
        self.rows.iter().map(move |r| r.features.get(name).unwrap_or(&MISSING))
    }

    /// Deterministic shuffled split into `(train, holdout)`.
    pub fn split(&self, holdout_fraction: f64, seed: u64) -> Result<(Dataset, Dataset)> {
        if self.rows.len() < 2 { return Err(GovernanceError::InsufficientData { rows: self.rows.len(), min_rows: 2 }); }
        if !(holdout_fraction > 0.0 && holdout_fraction < 1.0) {
            return Err(GovernanceError::InvalidInput(format!("holdout fraction {holdout_fraction} outside (0, 1)")));
        }
        let mut idx: Vec<usize> = (0..self.rows.len()).collect();
        idx.shuffle(&mut StdRng::seed_from_u64(seed));
        let n_hold = ((self.rows.len() as f64 * holdout_fraction).round() as usize).clamp(1, self.rows.len() - 1);
        let (hold, train) = idx.split_at(n_hold);
        let pick = |ix: &[usize]| ix.iter().map(|&i| self.rows[i].clone()).collect::<Vec<_>>();
        Ok((Dataset { schema: self.schema.clone(), rows: pick(train) }, Dataset { schema: self.schema.clone(), rows: pick(hold) }))
    }

    /// Drop exact duplicates, then fill numeric gaps with the column median
    /// and categorical gaps with the mode. Returns a new dataset.
    pub fn clean(&self) -> (Dataset, CleaningSummary) {
        let mut summary = CleaningSummary::default();
        let mut seen = HashSet::new();
        let mut rows: Vec<LabeledRecord> = Vec::with_capacity(self.rows.len());
        for row in &self.rows {
            let key = serde_json::to_string(row).unwrap_or_default();
            if seen.insert(key) { rows.push(row.clone()); } else { summary.duplicates_dropped += 1; }
        }
        for desc in &self.schema.features {
            let fill = if desc.kind.is_numeric() {
                let vals: Vec<f64> = rows.iter().filter_map(|r| r.features.get(&desc.name).and_then(Value::as_f64)).collect();
                Value::Number(median(&vals).unwrap_or(0.0))
            } else {
                let counts = category_counts(rows.iter().map(|r| r.features.get(&desc.name).unwrap_or(&MISSING)));
                match mode(&counts) { Some(m) => Value::Text(m), None => continue }
            };
            let mut filled = 0usize;
            for row in rows.iter_mut() {
                let slot = row.features.entry(desc.name.clone()).or_insert(Value::Missing);
                if slot.is_missing() { *slot = fill.clone(); filled += 1; }
            }
            if filled > 0 { summary.imputed.insert(desc.name.clone(), filled); }
        }
        info!(rows = rows.len(), duplicates = summary.duplicates_dropped, imputed_columns = summary.imputed.len(), "dataset cleaned");
        (Dataset { schema: self.schema.clone(), rows }, summary)
    }

    pub fn profile(&self) -> DatasetProfile {
        let columns = self.schema.features.iter().map(|d| {
            let col: Vec<&Value> = self.column(&d.name).collect();
            let p = if d.kind.is_numeric() { ColumnProfile::numeric(col.iter().copied()) } else { ColumnProfile::categorical(col.iter().copied()) };
            (d.name.clone(), p)
        }).collect();
        let positives = self.rows.iter().filter(|r| r.label).count();
        DatasetProfile { rows: self.rows.len(), positive_rate: positives as f64 / self.rows.len().max(1) as f64, columns }
    }
}

pub(crate) fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() { return None; }
    let mut v = values.to_vec();
    v.sort_by(|a, b| a.total_cmp(b));
    let mid = v.len() / 2;
    Some(if v.len() % 2 == 0 { (v[mid - 1] + v[mid]) / 2.0 } else { v[mid] })
}

pub(crate) fn category_counts<'a>(values: impl Iterator<Item = &'a Value>) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for v in values.filter(|v| !v.is_missing()) { *counts.entry(v.group_key()).or_insert(0) += 1; }
    counts
}

/// Most frequent category; ties resolve to the lexicographically smallest.
pub(crate) fn mode(counts: &BTreeMap<String, usize>) -> Option<String> {
    counts.iter().fold(None::<(&String, usize)>, |best, (k, &c)| match best {
        Some((_, bc)) if bc >= c => best,
        _ => Some((k, c)),
    }).map(|(k, _)| k.clone())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ColumnProfile {
    Numeric { count: usize, missing: usize, mean: f64, std: f64, min: f64, max: f64, skewness: f64 },
    Categorical { count: usize, missing: usize, counts: BTreeMap<String, usize>, mode: Option<String> },
}

impl ColumnProfile {
    fn numeric<'a>(values: impl Iterator<Item = &'a Value>) -> Self {
        let mut missing = 0;
        let mut xs = Vec::new();
        for v in values { match v.as_f64() { Some(x) => xs.push(x), None => missing += 1 } }
        let n = xs.len() as f64;
        if xs.is_empty() {
            return ColumnProfile::Numeric { count: 0, missing, mean: 0.0, std: 0.0, min: 0.0, max: 0.0, skewness: 0.0 };
        }
        let mean = xs.iter().sum::<f64>() / n;
        let m2 = xs.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
        let m3 = xs.iter().map(|x| (x - mean).powi(3)).sum::<f64>() / n;
        let std = if xs.len() > 1 { (m2 * n / (n - 1.0)).sqrt() } else { 0.0 };
        let skewness = if m2 > 1e-12 { m3 / m2.powf(1.5) } else { 0.0 };
        let min = xs.iter().copied().fold(f64::INFINITY, f64::min);
        let max = xs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        ColumnProfile::Numeric { count: xs.len(), missing, mean, std, min, max, skewness }
    }

    fn categorical<'a>(values: impl Iterator<Item = &'a Value> + Clone) -> Self {
        let missing = values.clone().filter(|v| v.is_missing()).count();
        let counts = category_counts(values);
        let count = counts.values().sum();
        let mode = mode(&counts);
        ColumnProfile::Categorical { count, missing, counts, mode }
    }
}

/// Summary statistics of a dataset, analogous to a `describe()` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetProfile {
    pub rows: usize,
    pub positive_rate: f64,
    pub columns: BTreeMap<String, ColumnProfile>,
}

impl DatasetProfile {
    /// Numeric columns with |skewness| above `threshold`, most skewed first.
    pub fn skewed_columns(&self, threshold: f64) -> Vec<String> {
        let mut skewed: Vec<(&String, f64)> = self.columns.iter().filter_map(|(name, p)| match p {
            ColumnProfile::Numeric { skewness, .. } if skewness.abs() > threshold => Some((name, *skewness)),
            _ => None,
        }).collect();
        skewed.sort_by(|a, b| b.1.abs().total_cmp(&a.1.abs()).then_with(|| a.0.cmp(b.0)));
        skewed.into_iter().map(|(n, _)| n.clone()).collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) fn schema() -> Arc<FeatureSchema> {
        Arc::new(FeatureSchema::new(vec![
            FeatureDescriptor::numeric("Age"),
            FeatureDescriptor::numeric("MonthlyIncome"),
            FeatureDescriptor::categorical("Gender"),
        ], "Attrition").unwrap())
    }

    fn obj(v: serde_json::Value) -> JsonRecord { v.as_object().cloned().unwrap() }

    #[test]
    fn rejects_missing_target() {
        let rows = vec![obj(json!({"Age": 30, "MonthlyIncome": 4000, "Gender": "F"}))];
        let err = Dataset::from_json_records(schema(), &rows).unwrap_err();
        assert!(err.to_string().contains("missing target"));
    }

    #[test]
    fn rejects_empty_and_wrong_types() {
        assert!(matches!(Dataset::from_json_records(schema(), &[]), Err(GovernanceError::InvalidInput(_))));
        let rows = vec![obj(json!({"Age": "thirty", "Gender": "F", "Attrition": "No"}))];
        assert!(matches!(Dataset::from_json_records(schema(), &rows), Err(GovernanceError::Schema(_))));
    }

    #[test]
    fn strict_parse_rejects_unknown_fields() {
        let s = schema();
        let raw = obj(json!({"Age": 30, "Gender": "M", "EmployeeNumber": 7}));
        assert!(s.parse_record(&raw, true).is_err());
        let rec = s.parse_record(&raw, false).unwrap();
        assert_eq!(rec.get("MonthlyIncome"), Some(&Value::Missing));
    }

    #[test]
    fn clean_drops_duplicates_and_imputes() {
        let rows = vec![
            obj(json!({"Age": 30, "MonthlyIncome": 1000, "Gender": "F", "Attrition": "Yes"})),
            obj(json!({"Age": 30, "MonthlyIncome": 1000, "Gender": "F", "Attrition": "Yes"})),
            obj(json!({"Age": 40, "MonthlyIncome": null, "Gender": "M", "Attrition": "No"})),
            obj(json!({"Age": 50, "MonthlyIncome": 3000, "Attrition": 0})),
        ];
        let ds = Dataset::from_json_records(schema(), &rows).unwrap();
        let (clean, summary) = ds.clean();
        assert_eq!(summary.duplicates_dropped, 1);
        assert_eq!(clean.len(), 3);
        assert_eq!(clean.rows()[1].features["MonthlyIncome"], Value::Number(2000.0));
        assert_eq!(clean.rows()[2].features["Gender"], Value::Text("F".into()));
        assert_eq!(ds.len(), 4, "source dataset untouched");
    }

    #[test]
    fn profile_reports_skew() {
        let mut rows = Vec::new();
        for i in 0..50 { rows.push(obj(json!({"Age": 30 + (i % 5), "MonthlyIncome": if i < 45 { 1000 } else { 90000 }, "Gender": "F", "Attrition": i % 2}))); }
        let ds = Dataset::from_json_records(schema(), &rows).unwrap();
        let profile = ds.profile();
        assert_eq!(profile.skewed_columns(0.75), vec!["MonthlyIncome".to_string()]);
        assert!((profile.positive_rate - 0.5).abs() < 1e-9);
    }

    #[test]
    fn split_is_deterministic() {
        let rows: Vec<_> = (0..20).map(|i| obj(json!({"Age": i, "MonthlyIncome": 10, "Gender": "F", "Attrition": "No"}))).collect();
        let ds = Dataset::from_json_records(schema(), &rows).unwrap();
        let (a, b) = ds.split(0.25, 7).unwrap();
        let (c, _) = ds.split(0.25, 7).unwrap();
        assert_eq!(b.len(), 5);
        assert_eq!(a.rows(), c.rows());
    }
}
