use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use govern_core::{clear_ready, init_metrics, init_tracing, load_config, mark_ready, watch_config, CONFIG_FILE_ENV};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use model_governance::artifacts::InMemoryArtifactStore;
use model_governance::inference_log::InferenceLog;
use model_governance::model::LogisticTrainer;
use model_governance::registry::RegistryEvent;
use model_governance::schema::JsonRecord;
use model_governance::store::GovernanceStore;
use model_governance::tracker::{GuardedTracker, LogTracker};
use model_governance::{http, CancelToken, Dataset, DriftMonitor, FeatureSchema, GovernanceConfig, ModelRegistry, Orchestrator, ServingFacade};

const SERVICE: &str = "model-governance";

fn load_training(cfg: &GovernanceConfig, schema: &Arc<FeatureSchema>) -> Result<Option<Dataset>> {
    let Some(path) = &cfg.data.training_file else { return Ok(None) };
    let bytes = std::fs::read(path).with_context(|| format!("reading training file {}", path.display()))?;
    let records: Vec<JsonRecord> = serde_json::from_slice(&bytes).context("training file must be a JSON array of objects")?;
    Ok(Some(Dataset::from_json_records(schema.clone(), &records)?))
}

async fn run_cycle(orch: Arc<Orchestrator>, config: Arc<ArcSwap<GovernanceConfig>>, schema: Arc<FeatureSchema>) {
    let res = tokio::task::spawn_blocking(move || -> Result<()> {
        let Some(data) = load_training(&config.load(), &schema)? else {
            info!("no training file configured; skipping cycle");
            return Ok(());
        };
        let report = orch.run_cycle(&data, &CancelToken::new())?;
        info!(phase = ?report.phase, promoted = ?report.promoted().map(|v| v.version_id), "cycle complete");
        Ok(())
    }).await;
    match res {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "governance cycle failed"),
        Err(e) => error!(error = %e, "governance cycle panicked"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing(SERVICE)?;
    init_metrics()?;

    let cfg: GovernanceConfig = load_config(SERVICE)?;
    cfg.validate()?;
    info!(bind = %cfg.serving.bind, store = %cfg.store.path.display(), "config loaded");
    let config = Arc::new(ArcSwap::from_pointee(cfg));
    if let Ok(path) = std::env::var(CONFIG_FILE_ENV) {
        watch_config(PathBuf::from(path), config.clone(), |c: &GovernanceConfig| Ok(c.validate()?));
    }
    let cfg = config.load_full();

    let schema = Arc::new(FeatureSchema::new(cfg.data.schema.features.clone(), &cfg.data.schema.target)?);
    let store = GovernanceStore::open(&cfg.store)?;
    let registry = Arc::new(ModelRegistry::open(store.clone())?);
    let artifacts = Arc::new(InMemoryArtifactStore::new());
    let log = Arc::new(InferenceLog::new(cfg.serving.inference_log_capacity));

    let monitor = Arc::new(DriftMonitor::new(config.clone(), Some(store.clone())));
    if let Some(active) = registry.get_active() {
        match store.snapshot_for_version(active.version_id)? {
            Some(snapshot) => monitor.set_reference(snapshot),
            None => warn!(version_id = active.version_id, "no reference snapshot for recovered version"),
        }
    }
    let _drift_task = monitor.clone().spawn(log.clone());

    let facade = Arc::new(ServingFacade::new(registry.clone(), artifacts.clone(), schema.clone(), log, monitor.status(), &cfg.serving));
    {
        let facade = facade.clone();
        let mut events = registry.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(RegistryEvent::Promoted { version, retired }) => {
                        info!(version_id = version.version_id, ?retired, "registry promoted a version");
                        facade.refresh();
                    }
                    Ok(RegistryEvent::Halted { reason }) => error!(%reason, "registry halted promotions"),
                    Err(RecvError::Lagged(n)) => { warn!(skipped = n, "registry events lagged"); facade.refresh(); }
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }
    let orch = Arc::new(
        Orchestrator::new(config.clone(), Arc::new(LogisticTrainer), artifacts, registry.clone(), monitor.clone(), Some(store))
            .with_tracker(Arc::new(GuardedTracker::new(Arc::new(LogTracker)))),
    );
    {
        let mut reaudits = facade.subscribe_reaudit();
        let orch = orch.clone();
        tokio::spawn(async move {
            loop {
                match reaudits.recv().await {
                    Ok(req) => {
                        let orch = orch.clone();
                        match tokio::task::spawn_blocking(move || orch.reaudit(&req)).await {
                            Ok(Ok(outcome)) if !outcome.passed() => warn!(version_id = outcome.version_id, violations = outcome.violations.len(), "serving version no longer clears the gate"),
                            Ok(Ok(_)) => {}
                            Ok(Err(e)) => warn!(error = %e, "re-audit failed"),
                            Err(e) => error!(error = %e, "re-audit panicked"),
                        }
                    }
                    Err(RecvError::Lagged(n)) => warn!(skipped = n, "re-audit requests lagged"),
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }
    facade.refresh();
    tokio::spawn(run_cycle(orch.clone(), config.clone(), schema.clone()));
    {
        let mut triggers = monitor.subscribe();
        tokio::spawn(async move {
            loop {
                match triggers.recv().await {
                    Ok(t) => {
                        info!(window_id = %t.report.window_id, p_value = t.report.p_value, "retrain triggered by drift");
                        run_cycle(orch.clone(), config.clone(), schema.clone()).await;
                    }
                    Err(RecvError::Lagged(n)) => warn!(skipped = n, "retrain triggers coalesced"),
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    let listener = tokio::net::TcpListener::bind(&cfg.serving.bind).await.with_context(|| format!("binding {}", cfg.serving.bind))?;
    info!(addr = %cfg.serving.bind, "serving");
    mark_ready();
    axum::serve(listener, http::router(facade))
        .with_graceful_shutdown(async { let _ = signal::ctrl_c().await; clear_ready(); })
        .await?;
    info!("shutdown");
    Ok(())
}
