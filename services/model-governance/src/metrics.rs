//! Binary classification scores used to rank candidates and to gate
//! promotion.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricName { Accuracy, Precision, Recall, F1, RocAuc }

impl MetricName {
    pub const ALL: [MetricName; 5] = [MetricName::Accuracy, MetricName::Precision, MetricName::Recall, MetricName::F1, MetricName::RocAuc];

    pub fn as_str(self) -> &'static str {
        match self {
            MetricName::Accuracy => "accuracy",
            MetricName::Precision => "precision",
            MetricName::Recall => "recall",
            MetricName::F1 => "f1",
            MetricName::RocAuc => "roc_auc",
        }
    }
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Confusion { pub tp: usize, pub fp: usize, pub tn: usize, pub fn_: usize }

impl Confusion {
    pub fn from_predictions(actual: &[bool], predicted: &[bool]) -> Self {
        let mut c = Confusion::default();
        for (&a, &p) in actual.iter().zip(predicted) {
            match (a, p) {
                (true, true) => c.tp += 1,
                (false, true) => c.fp += 1,
                (false, false) => c.tn += 1,
                (true, false) => c.fn_ += 1,
            }
        }
        c
    }

    pub fn total(&self) -> usize { self.tp + self.fp + self.tn + self.fn_ }

    fn ratio(num: usize, den: usize) -> Option<f64> { (den > 0).then(|| num as f64 / den as f64) }

    pub fn accuracy(&self) -> Option<f64> { Self::ratio(self.tp + self.tn, self.total()) }
    pub fn precision(&self) -> Option<f64> { Self::ratio(self.tp, self.tp + self.fp) }
    pub fn recall(&self) -> Option<f64> { Self::ratio(self.tp, self.tp + self.fn_) }
    pub fn false_negative_rate(&self) -> Option<f64> { Self::ratio(self.fn_, self.tp + self.fn_) }
    pub fn false_positive_rate(&self) -> Option<f64> { Self::ratio(self.fp, self.fp + self.tn) }
    pub fn selection_rate(&self) -> Option<f64> { Self::ratio(self.tp + self.fp, self.total()) }

    pub fn f1(&self) -> Option<f64> {
        let den = 2 * self.tp + self.fp + self.fn_;
        Self::ratio(2 * self.tp, den)
    }
}

/// Area under the ROC curve via the rank statistic; ties count half.
pub fn roc_auc(actual: &[bool], scores: &[f64]) -> Option<f64> {
    let mut pairs: Vec<(f64, bool)> = scores.iter().copied().zip(actual.iter().copied()).collect();
    let pos = pairs.iter().filter(|p| p.1).count();
    let neg = pairs.len() - pos;
    if pos == 0 || neg == 0 { return None; }
    pairs.sort_by(|a, b| a.0.total_cmp(&b.0));
    let mut rank_sum = 0.0;
    let mut i = 0;
    while i < pairs.len() {
        let mut j = i;
        while j + 1 < pairs.len() && pairs[j + 1].0 == pairs[i].0 { j += 1; }
        let avg_rank = (i + j) as f64 / 2.0 + 1.0;
        rank_sum += avg_rank * pairs[i..=j].iter().filter(|p| p.1).count() as f64;
        i = j + 1;
    }
    Some((rank_sum - (pos * (pos + 1)) as f64 / 2.0) / (pos * neg) as f64)
}

/// All metrics for one scored evaluation. Undefined ratios score 0.
pub fn score(actual: &[bool], probabilities: &[f64], threshold: f64) -> BTreeMap<String, f64> {
    let predicted: Vec<bool> = probabilities.iter().map(|p| *p >= threshold).collect();
    let c = Confusion::from_predictions(actual, &predicted);
    MetricName::ALL.iter().map(|m| {
        let v = match m {
            MetricName::Accuracy => c.accuracy(),
            MetricName::Precision => c.precision(),
            MetricName::Recall => c.recall(),
            MetricName::F1 => c.f1(),
            MetricName::RocAuc => roc_auc(actual, probabilities),
        };
        (m.as_str().to_string(), v.unwrap_or(0.0))
    }).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confusion_rates() {
        let actual = [true, true, false, false, true];
        let pred = [true, false, false, true, true];
        let c = Confusion::from_predictions(&actual, &pred);
        assert_eq!(c, Confusion { tp: 2, fp: 1, tn: 1, fn_: 1 });
        assert!((c.f1().unwrap() - 2.0 / 3.0).abs() < 1e-12);
        assert!((c.false_negative_rate().unwrap() - 1.0 / 3.0).abs() < 1e-12);
        assert_eq!(Confusion::default().recall(), None);
    }

    #[test]
    fn auc_perfect_and_random() {
        assert_eq!(roc_auc(&[false, false, true, true], &[0.1, 0.2, 0.8, 0.9]), Some(1.0));
        assert_eq!(roc_auc(&[false, true], &[0.5, 0.5]), Some(0.5));
        assert_eq!(roc_auc(&[true, true], &[0.5, 0.7]), None);
    }

    #[test]
    fn score_has_every_metric() {
        let s = score(&[true, false], &[0.9, 0.2], 0.5);
        assert_eq!(s.len(), MetricName::ALL.len());
        assert_eq!(s["f1"], 1.0);
    }
}
