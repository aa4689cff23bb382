//! Seams to the external ML library: hyperparameter spaces, the
//! `Trainer`/`Predictor` traits, the feature encoder shared by every
//! candidate of a search, and a logistic-regression reference trainer.

use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use crate::error::{GovernanceError, Result};
use crate::schema::{Dataset, FeatureKind, Record, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HyperValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl HyperValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self { HyperValue::Int(i) => Some(*i as f64), HyperValue::Float(f) => Some(*f), _ => None }
    }
}

pub type Hyperparameters = BTreeMap<String, HyperValue>;

pub fn hp_f64(hp: &Hyperparameters, key: &str, default: f64) -> f64 {
    hp.get(key).and_then(HyperValue::as_f64).unwrap_or(default)
}

pub fn hp_bool(hp: &Hyperparameters, key: &str, default: bool) -> bool {
    match hp.get(key) { Some(HyperValue::Bool(b)) => *b, _ => default }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParamRange {
    Choice { values: Vec<HyperValue> },
    Uniform { low: f64, high: f64 },
    LogUniform { low: f64, high: f64 },
    IntRange { low: i64, high: i64 },
}

impl ParamRange {
    fn sample(&self, rng: &mut StdRng) -> Option<HyperValue> {
        Some(match self {
            ParamRange::Choice { values } if values.is_empty() => return None,
            ParamRange::Choice { values } => values[rng.gen_range(0..values.len())].clone(),
            ParamRange::Uniform { low, high } if high > low => HyperValue::Float(rng.gen_range(*low..*high)),
            ParamRange::Uniform { low, .. } => HyperValue::Float(*low),
            ParamRange::LogUniform { low, high } if *low > 0.0 && high > low => HyperValue::Float(rng.gen_range(low.ln()..high.ln()).exp()),
            ParamRange::LogUniform { low, .. } => HyperValue::Float(*low),
            ParamRange::IntRange { low, high } if high >= low => HyperValue::Int(rng.gen_range(*low..=*high)),
            ParamRange::IntRange { low, .. } => HyperValue::Int(*low),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchSpace {
    pub params: BTreeMap<String, ParamRange>,
}

impl SearchSpace {
    /// Hyperparameters for `iteration`, independent of evaluation order.
    pub fn sample(&self, seed: u64, iteration: usize) -> Hyperparameters {
        let mut rng = StdRng::seed_from_u64(seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) ^ iteration as u64);
        self.params.iter().filter_map(|(k, r)| r.sample(&mut rng).map(|v| (k.clone(), v))).collect()
    }
}

/// A fitted model over encoded feature vectors.
pub trait Predictor: Send + Sync + fmt::Debug {
    /// Probability of the positive class.
    fn predict_proba(&self, x: &[f64]) -> f64;
}

/// Fits predictors; implemented by the external ML library.
pub trait Trainer: Send + Sync {
    fn name(&self) -> &str;
    fn search_space(&self) -> SearchSpace;
    fn fit(&self, x: &[Vec<f64>], y: &[bool], hp: &Hyperparameters) -> Result<Arc<dyn Predictor>>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum ColumnCodec {
    Scaled { name: String, mean: f64, std: f64 },
    OneHot { name: String, vocab: Vec<String> },
}

/// Standardizes numeric columns and one-hot encodes categorical ones.
/// Missing numerics encode as the mean; unknown categories as all zeros.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureEncoder {
    columns: Vec<ColumnCodec>,
    dim: usize,
}

impl FeatureEncoder {
    pub fn fit(data: &Dataset) -> Self {
        let mut dim = 0;
        let columns = data.schema().features.iter().map(|d| {
            if d.kind == FeatureKind::Categorical {
                let vocab: BTreeSet<String> = data.column(&d.name).filter(|v| !v.is_missing()).map(Value::group_key).collect();
                dim += vocab.len();
                ColumnCodec::OneHot { name: d.name.clone(), vocab: vocab.into_iter().collect() }
            } else {
                let xs: Vec<f64> = data.column(&d.name).filter_map(Value::as_f64).collect();
                let n = xs.len().max(1) as f64;
                let mean = xs.iter().sum::<f64>() / n;
                let var = xs.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
                dim += 1;
                ColumnCodec::Scaled { name: d.name.clone(), mean, std: if var > 1e-12 { var.sqrt() } else { 1.0 } }
            }
        }).collect();
        Self { columns, dim }
    }

    pub fn encode(&self, record: &Record) -> Vec<f64> {
        let mut out = Vec::with_capacity(self.dim);
        for c in &self.columns {
            match c {
                ColumnCodec::Scaled { name, mean, std } => {
                    let x = record.get(name).and_then(Value::as_f64).unwrap_or(*mean);
                    out.push((x - mean) / std);
                }
                ColumnCodec::OneHot { name, vocab } => {
                    let key = record.get(name).filter(|v| !v.is_missing()).map(Value::group_key);
                    out.extend(vocab.iter().map(|v| if key.as_deref() == Some(v.as_str()) { 1.0 } else { 0.0 }));
                }
            }
        }
        out
    }

    pub fn encode_all(&self, data: &Dataset) -> Vec<Vec<f64>> {
        data.rows().iter().map(|r| self.encode(&r.features)).collect()
    }
}

/// Encoder plus predictor: everything needed to answer a request.
#[derive(Debug, Clone)]
pub struct TrainedModel {
    pub encoder: Arc<FeatureEncoder>,
    pub predictor: Arc<dyn Predictor>,
    pub threshold: f64,
}

impl TrainedModel {
    pub fn new(encoder: Arc<FeatureEncoder>, predictor: Arc<dyn Predictor>) -> Self {
        Self { encoder, predictor, threshold: 0.5 }
    }

    pub fn predict_proba(&self, record: &Record) -> f64 { self.predictor.predict_proba(&self.encoder.encode(record)) }

    pub fn predict(&self, record: &Record) -> bool { self.predict_proba(record) >= self.threshold }
}

fn sigmoid(z: f64) -> f64 {
    if z >= 0.0 { 1.0 / (1.0 + (-z).exp()) } else { let e = z.exp(); e / (1.0 + e) }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogisticModel {
    pub weights: Vec<f64>,
    pub bias: f64,
}

impl Predictor for LogisticModel {
    fn predict_proba(&self, x: &[f64]) -> f64 {
        sigmoid(self.bias + self.weights.iter().zip(x).map(|(w, v)| w * v).sum::<f64>())
    }
}

/// Full-batch gradient descent logistic regression.
///
/// Hyperparameters: `learning_rate`, `l2`, `epochs`, `balanced`.
#[derive(Debug, Clone, Default)]
pub struct LogisticTrainer;

impl Trainer for LogisticTrainer {
    fn name(&self) -> &str { "logistic_regression" }

    fn search_space(&self) -> SearchSpace {
        let mut params = BTreeMap::new();
        params.insert("learning_rate".into(), ParamRange::LogUniform { low: 0.01, high: 1.0 });
        params.insert("l2".into(), ParamRange::LogUniform { low: 1e-4, high: 1e-1 });
        params.insert("epochs".into(), ParamRange::IntRange { low: 50, high: 300 });
        params.insert("balanced".into(), ParamRange::Choice { values: vec![HyperValue::Bool(true), HyperValue::Bool(false)] });
        SearchSpace { params }
    }

    fn fit(&self, x: &[Vec<f64>], y: &[bool], hp: &Hyperparameters) -> Result<Arc<dyn Predictor>> {
        let lr = hp_f64(hp, "learning_rate", 0.1);
        let l2 = hp_f64(hp, "l2", 1e-3);
        let epochs = hp_f64(hp, "epochs", 100.0) as usize;
        let balanced = hp_bool(hp, "balanced", false);
        if !(lr > 0.0) || epochs == 0 || l2 < 0.0 {
            return Err(GovernanceError::Training(format!("invalid hyperparameters lr={lr} l2={l2} epochs={epochs}")));
        }
        if x.is_empty() || x.len() != y.len() {
            return Err(GovernanceError::Training(format!("{} feature rows for {} labels", x.len(), y.len())));
        }
        let d = x[0].len();
        if x.iter().any(|r| r.len() != d) { return Err(GovernanceError::Training("ragged feature matrix".into())); }
        let n = x.len() as f64;
        let pos = y.iter().filter(|v| **v).count() as f64;
        let (w_pos, w_neg) = if balanced && pos > 0.0 && pos < n { (n / (2.0 * pos), n / (2.0 * (n - pos))) } else { (1.0, 1.0) };

        let mut weights = vec![0.0; d];
        let mut bias = 0.0;
        let mut grad = vec![0.0; d];
        for _ in 0..epochs {
            grad.iter_mut().for_each(|g| *g = 0.0);
            let mut grad_b = 0.0;
            for (row, &label) in x.iter().zip(y) {
                let z = bias + weights.iter().zip(row).map(|(w, v)| w * v).sum::<f64>();
                let target = if label { 1.0 } else { 0.0 };
                let err = (sigmoid(z) - target) * if label { w_pos } else { w_neg };
                for (g, v) in grad.iter_mut().zip(row) { *g += err * v; }
                grad_b += err;
            }
            for (w, g) in weights.iter_mut().zip(&grad) { *w -= lr * (g / n + l2 * *w); }
            bias -= lr * grad_b / n;
        }
        if weights.iter().any(|w| !w.is_finite()) || !bias.is_finite() {
            return Err(GovernanceError::Training("diverged".into()));
        }
        Ok(Arc::new(LogisticModel { weights, bias }))
    }
}
