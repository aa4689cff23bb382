//! Seeded synthetic attrition data shared by unit tests.

use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::schema::{tests::schema, Dataset, LabeledRecord, Record, Value};

pub(crate) fn gaussian(rng: &mut StdRng) -> f64 {
    let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
    let u2: f64 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

/// `n` rows where younger, lower-paid employees leave more often. `shift`
/// moves the Age distribution by that many standard deviations.
pub(crate) fn synthetic_dataset(n: usize, shift: f64, seed: u64) -> Dataset {
    let mut rng = StdRng::seed_from_u64(seed);
    let rows = (0..n).map(|_| {
        let age = 40.0 + 8.0 * (gaussian(&mut rng) + shift);
        let income = (6000.0 + 2000.0 * gaussian(&mut rng)).max(1000.0);
        let gender = if rng.gen_bool(0.5) { "F" } else { "M" };
        let z = -(age - 40.0) / 4.0 - (income - 6000.0) / 1000.0 - 1.0;
        let label = rng.gen::<f64>() < 1.0 / (1.0 + (-z).exp());
        let mut features = Record::new();
        features.insert("Age".into(), Value::Number(age));
        features.insert("MonthlyIncome".into(), Value::Number(income));
        features.insert("Gender".into(), Value::Text(gender.into()));
        LabeledRecord { features, label }
    }).collect();
    Dataset::new(schema(), rows).unwrap()
}
