//! Core shared utilities for the attrition governance services.
//!
//! Tracing setup, Prometheus-backed OpenTelemetry metrics, layered
//! configuration with file hot-reload, and the liveness/readiness routes
//! every service mounts next to its own API.

use anyhow::Result;
use arc_swap::ArcSwap;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Router};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use once_cell::sync::OnceCell;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use prometheus::{Encoder, TextEncoder};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static TRACING_INIT: OnceCell<()> = OnceCell::new();
static PROM_INIT: OnceCell<()> = OnceCell::new();
static NODE_READINESS: AtomicBool = AtomicBool::new(false);

/// Environment variable naming an optional configuration file.
pub const CONFIG_FILE_ENV: &str = "ATTRITION_CONFIG_FILE";
/// Prefix for environment overrides, e.g. `ATTRITION__DRIFT__SIGNIFICANCE_LEVEL`.
pub const ENV_PREFIX: &str = "ATTRITION";

pub use config::FileFormat;

pub fn mark_ready() { NODE_READINESS.store(true, Ordering::SeqCst); }
pub fn clear_ready() { NODE_READINESS.store(false, Ordering::SeqCst); }
pub fn is_ready() -> bool { NODE_READINESS.load(Ordering::SeqCst) }

/// Install the global subscriber. Safe to call more than once.
///
/// `RUST_LOG` drives filtering (default `info`); `ATTRITION_JSON_LOG=1`
/// switches to flattened JSON lines.
pub fn init_tracing(service: &str) -> Result<()> {
    TRACING_INIT.get_or_try_init(|| -> Result<()> {
        let json = std::env::var("ATTRITION_JSON_LOG").ok().map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false);
        let fmt_layer = if json {
            tracing_subscriber::fmt::layer()
                .json()
                .flatten_event(true)
                .with_current_span(true)
                .with_span_list(false)
                .boxed()
        } else {
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_line_number(true)
                .boxed()
        };
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        tracing_subscriber::registry().with(fmt_layer).with(env_filter).try_init()?;
        Ok(())
    })?;
    info!(target: "govern_core", service, "tracing initialized");
    Ok(())
}

/// Route OpenTelemetry instruments into the default Prometheus registry.
pub fn init_metrics() -> Result<()> {
    PROM_INIT.get_or_try_init(|| -> Result<()> {
        let exporter = opentelemetry_prometheus::exporter()
            .with_registry(prometheus::default_registry().clone())
            .build()?;
        let provider = SdkMeterProvider::builder().with_reader(exporter).build();
        opentelemetry::global::set_meter_provider(provider);
        Ok(())
    })?;
    Ok(())
}

pub async fn metrics_handler() -> Response {
    if PROM_INIT.get().is_none() {
        return (StatusCode::SERVICE_UNAVAILABLE, "metrics not initialized").into_response();
    }
    let metric_families = prometheus::default_registry().gather();
    let mut buf = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&metric_families, &mut buf) {
        return (StatusCode::INTERNAL_SERVER_ERROR, format!("encode error: {e}")).into_response();
    }
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], buf).into_response()
}

/// `/live`, `/ready` and `/metrics`, ready to be merged into a service router.
pub fn health_router() -> Router {
    Router::new()
        .route("/live", get(|| async { axum::Json(serde_json::json!({"live": true})) }))
        .route("/ready", get(|| async { axum::Json(serde_json::json!({"ready": is_ready()})) }))
        .route("/metrics", get(metrics_handler))
}

/// Layered load: serialized `T::default()`, then the optional file named by
/// [`CONFIG_FILE_ENV`], then `ATTRITION__*` environment variables.
pub fn load_config<T>(service: &str) -> Result<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    let defaults = config::Config::try_from(&T::default())?;
    let mut builder = config::Config::builder().add_source(defaults);
    if let Ok(file) = std::env::var(CONFIG_FILE_ENV) {
        builder = builder.add_source(config::File::with_name(&file).required(false));
    }
    builder = builder.add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__").try_parsing(true));
    let cfg = builder.build()?.try_deserialize()?;
    info!(target: "govern_core", service, "configuration loaded");
    Ok(cfg)
}

/// Parse a configuration document on top of `T::default()`.
pub fn parse_config<T>(text: &str, format: config::FileFormat) -> Result<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    let defaults = config::Config::try_from(&T::default())?;
    let cfg = config::Config::builder()
        .add_source(defaults)
        .add_source(config::File::from_str(text, format))
        .build()?
        .try_deserialize()?;
    Ok(cfg)
}

fn format_for(path: &Path) -> config::FileFormat {
    match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => config::FileFormat::Toml,
        Some("json") => config::FileFormat::Json,
        _ => config::FileFormat::Yaml,
    }
}

/// Reload `path` into `target` whenever the file changes. A document that
/// fails to parse or that `validate` refuses leaves the previous value in
/// place.
pub fn watch_config<T, V>(path: PathBuf, target: Arc<ArcSwap<T>>, validate: V)
where
    T: Serialize + DeserializeOwned + Default + Send + Sync + 'static,
    V: Fn(&T) -> Result<()> + Send + Sync + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = watch_loop(path, target, validate).await { warn!(error=?e, "config watch loop exited"); }
    });
}

async fn watch_loop<T, V>(path: PathBuf, target: Arc<ArcSwap<T>>, validate: V) -> Result<()>
where
    T: Serialize + DeserializeOwned + Default + Send + Sync + 'static,
    V: Fn(&T) -> Result<()> + Send + Sync + 'static,
{
    let (tx, mut rx) = tokio::sync::mpsc::channel(8);
    let mut watcher = RecommendedWatcher::new(move |res| { let _ = tx.blocking_send(res); }, notify::Config::default())?;
    watcher.watch(&path, RecursiveMode::NonRecursive)?;
    while let Some(evt) = rx.recv().await {
        match evt {
            Ok(ev) if matches!(ev.kind, EventKind::Modify(_) | EventKind::Create(_)) => {
                let text = match tokio::fs::read_to_string(&path).await {
                    Ok(t) => t,
                    Err(e) => { warn!(error=?e, path=%path.display(), "config reload read failed"); continue; }
                };
                match apply_reload(&text, format_for(&path), &target, &validate) {
                    Ok(()) => info!(path=%path.display(), "configuration reloaded"),
                    Err(e) => warn!(error=?e, path=%path.display(), "config reload rejected, keeping previous"),
                }
            }
            Ok(_) => {}
            Err(e) => warn!(error=?e, "config watch event error"),
        }
    }
    Ok(())
}

/// Parse and validate `text`, swapping it into `target` only if both pass.
pub fn apply_reload<T, V>(text: &str, format: config::FileFormat, target: &ArcSwap<T>, validate: V) -> Result<()>
where
    T: Serialize + DeserializeOwned + Default,
    V: Fn(&T) -> Result<()>,
{
    let cfg = parse_config::<T>(text, format)?;
    validate(&cfg)?;
    target.store(Arc::new(cfg));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    #[serde(default)]
    struct Sample { name: String, limit: u32, ratio: f64 }
    impl Default for Sample { fn default() -> Self { Self { name: "svc".into(), limit: 4, ratio: 0.5 } } }

    #[test]
    fn yaml_overrides_defaults() {
        let cfg: Sample = parse_config("limit: 9\n", config::FileFormat::Yaml).unwrap();
        assert_eq!(cfg, Sample { name: "svc".into(), limit: 9, ratio: 0.5 });
    }

    #[test]
    fn format_follows_extension() {
        assert!(matches!(format_for(Path::new("a.toml")), config::FileFormat::Toml));
        assert!(matches!(format_for(Path::new("a.yml")), config::FileFormat::Yaml));
    }

    #[test]
    fn invalid_reload_keeps_previous() {
        let target = ArcSwap::from_pointee(Sample::default());
        let bounded = |s: &Sample| if s.ratio <= 1.0 { Ok(()) } else { Err(anyhow::anyhow!("ratio {} above 1", s.ratio)) };
        assert!(apply_reload("ratio: 1.5\n", config::FileFormat::Yaml, &target, bounded).is_err());
        assert_eq!(**target.load(), Sample::default());
        assert!(apply_reload("limit: [\n", config::FileFormat::Yaml, &target, bounded).is_err());
        apply_reload("ratio: 0.9\n", config::FileFormat::Yaml, &target, bounded).unwrap();
        assert_eq!(target.load().ratio, 0.9);
    }

    #[test]
    fn readiness_flags_toggle() {
        mark_ready();
        assert!(is_ready());
        clear_ready();
        assert!(!is_ready());
    }
}
