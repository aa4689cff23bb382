use arc_swap::ArcSwap;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde_json::json;
use std::sync::Arc;

use model_governance::artifacts::InMemoryArtifactStore;
use model_governance::drift::DriftStatusHandle;
use model_governance::inference_log::InferenceLog;
use model_governance::lifecycle::DeploymentPhase;
use model_governance::model::LogisticTrainer;
use model_governance::schema::{FeatureDescriptor, JsonRecord};
use model_governance::store::GovernanceStore;
use model_governance::{
    CancelToken, Dataset, DriftMonitor, FeatureSchema, GovernanceConfig, GovernanceError, ModelRegistry, ModelStatus, Orchestrator,
    ServingFacade, Verdict,
};

fn schema() -> Arc<FeatureSchema> {
    Arc::new(FeatureSchema::new(vec![
        FeatureDescriptor::numeric("Age"),
        FeatureDescriptor::numeric("MonthlyIncome"),
        FeatureDescriptor::categorical("OverTime"),
        FeatureDescriptor::categorical("Gender"),
    ], "Attrition").unwrap())
}

fn normal(rng: &mut StdRng) -> f64 {
    let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
    let u2: f64 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

/// Employee rows; `age_shift` moves the age distribution by that many years.
fn employees(n: usize, age_shift: f64, seed: u64) -> Vec<JsonRecord> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n).map(|_| {
        let age = 38.0 + age_shift + 9.0 * normal(&mut rng);
        let income = (6500.0 + 2500.0 * normal(&mut rng)).max(1000.0);
        let overtime = rng.gen_bool(0.3);
        let z = -(age - 38.0) / 5.0 - (income - 6500.0) / 1500.0 + if overtime { 1.0 } else { -1.5 };
        let left = rng.gen::<f64>() < 1.0 / (1.0 + (-z).exp());
        json!({
            "Age": age.round(),
            "MonthlyIncome": income.round(),
            "OverTime": if overtime { "Yes" } else { "No" },
            "Gender": if rng.gen_bool(0.5) { "Female" } else { "Male" },
            "Attrition": if left { "Yes" } else { "No" },
        }).as_object().cloned().unwrap()
    }).collect()
}

fn without_target(mut r: JsonRecord) -> JsonRecord { r.remove("Attrition"); r }

struct Service {
    config: Arc<ArcSwap<GovernanceConfig>>,
    store: GovernanceStore,
    registry: Arc<ModelRegistry>,
    monitor: Arc<DriftMonitor>,
    log: Arc<InferenceLog>,
    facade: ServingFacade,
    orch: Orchestrator,
}

fn service() -> Service {
    let mut cfg = GovernanceConfig::default();
    cfg.search.max_iterations = 6;
    cfg.search.parallelism = 3;
    cfg.audit.protected_attributes = vec!["Gender".into()];
    cfg.thresholds.min_quality = 0.3;
    cfg.thresholds.max_disparity = 0.5;
    cfg.drift.min_window = 100;
    let config = Arc::new(ArcSwap::from_pointee(cfg));

    let store = GovernanceStore::temporary().unwrap();
    let registry = Arc::new(ModelRegistry::open(store.clone()).unwrap());
    let artifacts = Arc::new(InMemoryArtifactStore::new());
    let log = Arc::new(InferenceLog::new(5_000));
    let monitor = Arc::new(DriftMonitor::new(config.clone(), Some(store.clone())));
    let facade = ServingFacade::new(registry.clone(), artifacts.clone(), schema(), log.clone(), monitor.status(), &config.load().serving);
    let orch = Orchestrator::new(config.clone(), Arc::new(LogisticTrainer), artifacts, registry.clone(), monitor.clone(), Some(store.clone()));
    Service { config, store, registry, monitor, log, facade, orch }
}

#[test]
fn search_to_drift_to_second_promotion() {
    let svc = service();
    assert!(matches!(svc.facade.predict(&without_target(employees(1, 0.0, 1).remove(0))), Err(GovernanceError::NoActiveModel)));

    let data = Dataset::from_json_records(schema(), &employees(900, 0.0, 2)).unwrap();
    let first = svc.orch.run_cycle(&data, &CancelToken::new()).unwrap();
    let v1 = first.promoted().expect("first cycle promotes").version_id;
    assert!(first.latency.total_ms >= first.latency.search_ms);
    assert!(svc.store.fairness(&first.audited[0]).unwrap().is_some());

    // Traffic that matches training keeps the verdict stable.
    for r in employees(150, 0.0, 3) {
        let resp = svc.facade.predict(&without_target(r)).unwrap();
        assert_eq!(resp.model_version, v1);
    }
    assert_eq!(svc.monitor.tick(&svc.log).unwrap().unwrap().verdict, Verdict::Stable);
    assert_eq!(svc.orch.serving_phase(), Some((v1, DeploymentPhase::Stable)));

    // An older workforce shows up.
    let mut triggers = svc.monitor.subscribe();
    for r in employees(150, 20.0, 4) { svc.facade.predict(&without_target(r)).unwrap(); }
    let drifted = svc.monitor.tick(&svc.log).unwrap().unwrap();
    assert_eq!(drifted.verdict, Verdict::Drifted);
    assert_eq!(triggers.try_recv().unwrap().report.window_id, drifted.window_id);
    assert_eq!(svc.facade.health().last_drift_verdict, Some(Verdict::Drifted));
    assert_eq!(svc.orch.serving_phase(), Some((v1, DeploymentPhase::Drifted)));

    let retrain = Dataset::from_json_records(schema(), &employees(900, 5.0, 5)).unwrap();
    let second = svc.orch.run_cycle(&retrain, &CancelToken::new()).unwrap();
    let v2 = second.promoted().expect("retrain promotes").version_id;
    assert!(v2 > v1);
    assert_eq!(svc.facade.predict(&without_target(employees(1, 5.0, 6).remove(0))).unwrap().model_version, v2);

    let statuses: Vec<(u64, ModelStatus)> = svc.registry.versions().iter().map(|v| (v.version_id, v.status)).collect();
    assert_eq!(statuses, vec![(v1, ModelStatus::Retired), (v2, ModelStatus::Active)]);
    assert_eq!(svc.monitor.reference().unwrap().version_id, Some(v2));
    assert_eq!(svc.store.drift_reports().unwrap().len(), 2);

    // The durable log replays to the same active version.
    let replayed = ModelRegistry::open(svc.store.clone()).unwrap();
    assert_eq!(replayed.get_active().map(|v| v.version_id), Some(v2));
    assert_eq!(replayed.transitions(), svc.registry.transitions());
}

#[test]
fn tightened_thresholds_reject_without_touching_the_registry() {
    let svc = service();
    let data = Dataset::from_json_records(schema(), &employees(900, 0.0, 7)).unwrap();
    let v1 = svc.orch.run_cycle(&data, &CancelToken::new()).unwrap().promoted().unwrap().version_id;

    let mut strict = (**svc.config.load()).clone();
    strict.thresholds.min_quality = 0.999;
    svc.config.store(Arc::new(strict));
    let before = svc.registry.transitions();
    let report = svc.orch.run_cycle(&Dataset::from_json_records(schema(), &employees(900, 0.0, 8)).unwrap(), &CancelToken::new()).unwrap();
    assert_eq!(report.phase, DeploymentPhase::Rejected);
    assert!(report.promoted().is_none());
    assert_eq!(svc.registry.transitions(), before);
    assert_eq!(svc.registry.get_active().unwrap().version_id, v1);
}

#[test]
fn strict_serving_schema() {
    let svc = service();
    let facade = ServingFacade::new(svc.registry.clone(), Arc::new(InMemoryArtifactStore::new()), schema(), svc.log.clone(), DriftStatusHandle::default(), &Default::default());
    let mut req = without_target(employees(1, 0.0, 9).remove(0));
    req.insert("Salary".into(), json!(1000));
    assert!(matches!(facade.predict(&req), Err(GovernanceError::Schema(_))));
    assert!(svc.log.is_empty());
}
