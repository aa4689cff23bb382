//! Drift detection of live inference traffic against the reference
//! snapshot captured when the serving version was promoted.
//!
//! Numeric features use the two-sample Kolmogorov-Smirnov test (PSI is
//! reported alongside); categorical features and the predicted label use a
//! chi-square homogeneity test. The window statistic is the largest KS
//! distance and its p-value the smallest p across all tests.

use arc_swap::{ArcSwap, ArcSwapOption};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{GovernanceError, Result};
use crate::inference_log::InferenceLog;
use crate::schema::{category_counts, Dataset, DatasetProfile, Record, Value, MISSING};
use crate::settings::GovernanceConfig;
use crate::store::GovernanceStore;
use crate::telemetry::governance_metrics;

pub const LABEL_FEATURE: &str = "__predicted_label__";
pub const PSI_BINS: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriftSettings {
    pub significance_level: f64,
    /// Inference entries needed before a window is evaluated.
    pub min_window: usize,
    pub max_window: usize,
    pub tick_interval_secs: u64,
    /// Cap on numeric points kept per feature in a reference snapshot.
    pub max_reference_points: usize,
}

impl Default for DriftSettings {
    fn default() -> Self {
        Self { significance_level: 0.01, min_window: 200, max_window: 2000, tick_interval_secs: 60, max_reference_points: 5000 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict { Stable, Drifted }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FeatureSummary {
    /// Sorted sample, evenly thinned when above the point cap.
    Numeric { sample: Vec<f64> },
    Categorical { counts: BTreeMap<String, usize> },
}

/// Immutable distribution summary taken at promotion time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceSnapshot {
    pub snapshot_id: String,
    pub version_id: Option<u64>,
    pub captured_at: DateTime<Utc>,
    pub rows: usize,
    pub features: BTreeMap<String, FeatureSummary>,
    /// Predicted-label counts, when predictions were supplied.
    pub label_counts: Option<BTreeMap<String, usize>>,
    pub profile: DatasetProfile,
}

fn thin(mut xs: Vec<f64>, max_points: usize) -> Vec<f64> {
    xs.sort_by(|a, b| a.total_cmp(b));
    if max_points == 0 || xs.len() <= max_points { return xs; }
    let step = (xs.len() - 1) as f64 / (max_points - 1).max(1) as f64;
    (0..max_points).map(|i| xs[((i as f64 * step).round() as usize).min(xs.len() - 1)]).collect()
}

fn label_counts(labels: &[bool]) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for l in labels { *counts.entry(l.to_string()).or_insert(0) += 1; }
    counts
}

impl ReferenceSnapshot {
    /// Summarise `data`. `predicted` holds the serving model's labels for
    /// `data`; leave it empty to skip the label test.
    pub fn capture(snapshot_id: impl Into<String>, version_id: Option<u64>, data: &Dataset, predicted: &[bool], max_points: usize) -> Self {
        let features = data.schema().features.iter().map(|d| {
            let summary = if d.kind.is_numeric() {
                FeatureSummary::Numeric { sample: thin(data.column(&d.name).filter_map(Value::as_f64).collect(), max_points) }
            } else {
                FeatureSummary::Categorical { counts: category_counts(data.column(&d.name)) }
            };
            (d.name.clone(), summary)
        }).collect();
        Self {
            snapshot_id: snapshot_id.into(),
            version_id,
            captured_at: Utc::now(),
            rows: data.len(),
            features,
            label_counts: (!predicted.is_empty()).then(|| label_counts(predicted)),
            profile: data.profile(),
        }
    }
}

/// Recent serving inputs and the labels the model predicted for them.
#[derive(Debug, Clone, Default)]
pub struct DriftWindow {
    pub window_id: String,
    pub records: Vec<Record>,
    pub predictions: Vec<bool>,
}

impl DriftWindow {
    pub fn new(records: Vec<Record>, predictions: Vec<bool>) -> Self {
        Self { window_id: format!("win-{}", Uuid::new_v4()), records, predictions }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftTest { KolmogorovSmirnov, ChiSquare }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureDrift {
    pub test: DriftTest,
    pub statistic: f64,
    pub p_value: f64,
    pub psi: Option<f64>,
    pub window_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftReport {
    pub window_id: String,
    pub reference_snapshot_id: String,
    pub version_id: Option<u64>,
    pub statistic: f64,
    pub p_value: f64,
    pub significance_level: f64,
    pub verdict: Verdict,
    pub window_size: usize,
    pub features: BTreeMap<String, FeatureDrift>,
    pub evaluated_at: DateTime<Utc>,
}

impl DriftReport {
    pub fn most_drifted(&self) -> Option<(&str, &FeatureDrift)> {
        self.features.iter().min_by(|a, b| a.1.p_value.total_cmp(&b.1.p_value)).map(|(k, v)| (k.as_str(), v))
    }
}

/// Two-sample KS distance between sorted samples.
pub fn ks_statistic(a: &[f64], b: &[f64]) -> f64 {
    let (mut i, mut j, mut d) = (0usize, 0usize, 0.0f64);
    let (na, nb) = (a.len() as f64, b.len() as f64);
    while i < a.len() && j < b.len() {
        let x = a[i].min(b[j]);
        while i < a.len() && a[i] <= x { i += 1; }
        while j < b.len() && b[j] <= x { j += 1; }
        d = d.max((i as f64 / na - j as f64 / nb).abs());
    }
    d
}

/// Asymptotic p-value of a KS distance `d` for sample sizes `n` and `m`.
pub fn ks_p_value(d: f64, n: usize, m: usize) -> f64 {
    if n == 0 || m == 0 { return 1.0; }
    let en = ((n * m) as f64 / (n + m) as f64).sqrt();
    let lambda = (en + 0.12 + 0.11 / en) * d;
    if lambda < 0.2 { return 1.0; }
    let mut sum = 0.0;
    let mut sign = 1.0;
    for j in 1..=100 {
        let term = sign * (-2.0 * (j * j) as f64 * lambda * lambda).exp();
        sum += term;
        if term.abs() < 1e-12 { break; }
        sign = -sign;
    }
    (2.0 * sum).clamp(0.0, 1.0)
}

/// Population stability index of `actual` against quantile bins of the
/// sorted `reference`.
pub fn psi(reference: &[f64], actual: &[f64], bins: usize) -> f64 {
    if reference.is_empty() || actual.is_empty() || bins < 2 { return 0.0; }
    let mut edges: Vec<f64> = (1..bins).map(|k| reference[(k * reference.len() / bins).min(reference.len() - 1)]).collect();
    edges.dedup();
    let bucket = |x: f64| edges.partition_point(|e| *e <= x);
    let mut r = vec![0usize; edges.len() + 1];
    let mut a = vec![0usize; edges.len() + 1];
    reference.iter().for_each(|x| r[bucket(*x)] += 1);
    actual.iter().for_each(|x| a[bucket(*x)] += 1);
    let eps = 1e-4;
    r.iter().zip(&a).map(|(&rc, &ac)| {
        let e = (rc as f64 / reference.len() as f64).max(eps);
        let o = (ac as f64 / actual.len() as f64).max(eps);
        (o - e) * (o / e).ln()
    }).sum()
}

fn ln_gamma(x: f64) -> f64 {
    const G: [f64; 6] = [76.180_091_729_471_46, -86.505_320_329_416_77, 24.014_098_240_830_91, -1.231_739_572_450_155, 0.001_208_650_973_866_179, -0.000_005_395_239_384_953];
    let tmp = x + 5.5;
    let tmp = tmp - (x + 0.5) * tmp.ln();
    let mut ser = 1.000_000_000_190_015;
    for (k, g) in G.iter().enumerate() { ser += g / (x + 1.0 + k as f64); }
    -tmp + (2.506_628_274_631_000_5 * ser / x).ln()
}

/// Upper regularized incomplete gamma Q(a, x).
fn gamma_q(a: f64, x: f64) -> f64 {
    if x <= 0.0 { return 1.0; }
    let gln = ln_gamma(a);
    if x < a + 1.0 {
        let (mut ap, mut sum) = (a, 1.0 / a);
        let mut del = sum;
        for _ in 0..500 {
            ap += 1.0;
            del *= x / ap;
            sum += del;
            if del.abs() < sum.abs() * 1e-14 { break; }
        }
        (1.0 - sum * (-x + a * x.ln() - gln).exp()).clamp(0.0, 1.0)
    } else {
        let tiny = 1e-300;
        let mut b = x + 1.0 - a;
        let mut c = 1.0 / tiny;
        let mut d = 1.0 / b;
        let mut h = d;
        for i in 1..500 {
            let an = -(i as f64) * (i as f64 - a);
            b += 2.0;
            d = an * d + b;
            if d.abs() < tiny { d = tiny; }
            c = b + an / c;
            if c.abs() < tiny { c = tiny; }
            d = 1.0 / d;
            let del = d * c;
            h *= del;
            if (del - 1.0).abs() < 1e-14 { break; }
        }
        ((-x + a * x.ln() - gln).exp() * h).clamp(0.0, 1.0)
    }
}

/// Chi-square homogeneity test between two category count tables.
/// Returns `(statistic, p_value)`.
pub fn chi_square(reference: &BTreeMap<String, usize>, window: &BTreeMap<String, usize>) -> (f64, f64) {
    let keys: BTreeSet<&String> = reference.keys().chain(window.keys()).collect();
    let (nr, nw) = (reference.values().sum::<usize>() as f64, window.values().sum::<usize>() as f64);
    if nr == 0.0 || nw == 0.0 || keys.len() < 2 { return (0.0, 1.0); }
    let total = nr + nw;
    let mut stat = 0.0;
    let mut df = 0usize;
    for k in keys {
        let (r, w) = (*reference.get(k).unwrap_or(&0) as f64, *window.get(k).unwrap_or(&0) as f64);
        let col = r + w;
        if col == 0.0 { continue; }
        df += 1;
        for (obs, n) in [(r, nr), (w, nw)] {
            let expected = n * col / total;
            stat += (obs - expected).powi(2) / expected;
        }
    }
    if df < 2 { return (0.0, 1.0); }
    (stat, gamma_q((df - 1) as f64 / 2.0, stat / 2.0))
}

/// Compare `window` against `snapshot` at `significance_level`.
pub fn evaluate(window: &DriftWindow, snapshot: &ReferenceSnapshot, significance_level: f64) -> Result<DriftReport> {
    if window.records.is_empty() { return Err(GovernanceError::InvalidInput("drift window is empty".into())); }
    if !(significance_level > 0.0 && significance_level < 1.0) {
        return Err(GovernanceError::InvalidInput(format!("significance level {significance_level} outside (0, 1)")));
    }
    let mut features = BTreeMap::new();
    for (name, summary) in &snapshot.features {
        let column = window.records.iter().map(|r| r.get(name).unwrap_or(&MISSING));
        let drift = match summary {
            FeatureSummary::Numeric { sample } => {
                let mut live: Vec<f64> = column.filter_map(Value::as_f64).collect();
                if live.is_empty() || sample.is_empty() { debug!(feature = %name, "no numeric values to compare"); continue; }
                live.sort_by(|a, b| a.total_cmp(b));
                let d = ks_statistic(sample, &live);
                FeatureDrift { test: DriftTest::KolmogorovSmirnov, statistic: d, p_value: ks_p_value(d, sample.len(), live.len()), psi: Some(psi(sample, &live, PSI_BINS)), window_count: live.len() }
            }
            FeatureSummary::Categorical { counts } => {
                let live = category_counts(column);
                let (stat, p) = chi_square(counts, &live);
                FeatureDrift { test: DriftTest::ChiSquare, statistic: stat, p_value: p, psi: None, window_count: live.values().sum() }
            }
        };
        features.insert(name.clone(), drift);
    }
    if let (Some(reference), false) = (&snapshot.label_counts, window.predictions.is_empty()) {
        let (stat, p) = chi_square(reference, &label_counts(&window.predictions));
        features.insert(LABEL_FEATURE.to_string(), FeatureDrift { test: DriftTest::ChiSquare, statistic: stat, p_value: p, psi: None, window_count: window.predictions.len() });
    }

    let statistic = features.values().filter(|f| f.test == DriftTest::KolmogorovSmirnov).map(|f| f.statistic).fold(0.0, f64::max);
    let p_value = features.values().map(|f| f.p_value).fold(1.0, f64::min);
    let verdict = if p_value < significance_level { Verdict::Drifted } else { Verdict::Stable };
    Ok(DriftReport {
        window_id: window.window_id.clone(),
        reference_snapshot_id: snapshot.snapshot_id.clone(),
        version_id: snapshot.version_id,
        statistic,
        p_value,
        significance_level,
        verdict,
        window_size: window.records.len(),
        features,
        evaluated_at: Utc::now(),
    })
}

/// Signal to the orchestration layer that the serving model should be
/// rebuilt. The monitor never starts a search itself.
#[derive(Debug, Clone)]
pub struct RetrainTrigger {
    pub report: Arc<DriftReport>,
}

/// Shared view of the most recent drift report.
#[derive(Debug, Clone, Default)]
pub struct DriftStatusHandle(Arc<ArcSwapOption<DriftReport>>);

impl DriftStatusHandle {
    pub fn last(&self) -> Option<Arc<DriftReport>> { self.0.load_full() }
    pub fn last_verdict(&self) -> Option<Verdict> { self.last().map(|r| r.verdict) }
    fn publish(&self, report: Arc<DriftReport>) { self.0.store(Some(report)); }
}

pub struct DriftMonitor {
    config: Arc<ArcSwap<GovernanceConfig>>,
    reference: ArcSwapOption<ReferenceSnapshot>,
    status: DriftStatusHandle,
    triggers: broadcast::Sender<RetrainTrigger>,
    store: Option<GovernanceStore>,
}

impl DriftMonitor {
    pub fn new(config: Arc<ArcSwap<GovernanceConfig>>, store: Option<GovernanceStore>) -> Self {
        let (triggers, _) = broadcast::channel(16);
        Self { config, reference: ArcSwapOption::empty(), status: DriftStatusHandle::default(), triggers, store }
    }

    pub fn status(&self) -> DriftStatusHandle { self.status.clone() }

    pub fn subscribe(&self) -> broadcast::Receiver<RetrainTrigger> { self.triggers.subscribe() }

    /// Start comparing traffic against `snapshot`.
    pub fn set_reference(&self, snapshot: ReferenceSnapshot) {
        info!(snapshot_id = %snapshot.snapshot_id, version_id = snapshot.version_id, "drift reference installed");
        self.reference.store(Some(Arc::new(snapshot)));
    }

    pub fn reference(&self) -> Option<Arc<ReferenceSnapshot>> { self.reference.load_full() }

    /// Evaluate one window from the inference log, if enough traffic for the
    /// reference version has accumulated.
    pub fn tick(&self, log: &InferenceLog) -> Result<Option<Arc<DriftReport>>> {
        let Some(reference) = self.reference.load_full() else { return Ok(None) };
        let settings = self.config.load().drift.clone();
        let Some(entries) = log.take_window(reference.version_id, settings.min_window, settings.max_window) else {
            debug!(buffered = log.len(), "not enough traffic for a drift window");
            return Ok(None);
        };
        let (records, predictions): (Vec<Record>, Vec<bool>) = entries.into_iter().map(|e| (e.features, e.prediction)).unzip();
        let report = Arc::new(evaluate(&DriftWindow::new(records, predictions), &reference, settings.significance_level)?);

        governance_metrics().drift_evaluations_total.add(1, &[]);
        if let Some(store) = &self.store { store.put_drift(&report)?; }
        self.status.publish(report.clone());
        match report.verdict {
            Verdict::Drifted => {
                governance_metrics().drift_detected_total.add(1, &[]);
                warn!(window_id = %report.window_id, p_value = report.p_value, statistic = report.statistic, feature = report.most_drifted().map(|f| f.0), "drift detected");
                let _ = self.triggers.send(RetrainTrigger { report: report.clone() });
            }
            Verdict::Stable => info!(window_id = %report.window_id, p_value = report.p_value, "window stable"),
        }
        Ok(Some(report))
    }

    /// Run `tick` on the configured interval until the task is aborted.
    pub fn spawn(self: Arc<Self>, log: Arc<InferenceLog>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let secs = self.config.load().drift.tick_interval_secs.max(1);
            let mut interval = tokio::time::interval(Duration::from_secs(secs));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if let Err(e) = self.tick(&log) { warn!(error = %e, "drift tick failed"); }
            }
        })
    }
}
