//! OpenTelemetry instruments for the governance pipeline. Exported through
//! the Prometheus registry once `govern_core::init_metrics` has run; until
//! then they record into the no-op global meter.

use once_cell::sync::Lazy;
use opentelemetry::metrics::{Counter, Histogram, Meter};

pub struct GovernanceMetrics {
    pub searches_total: Counter<u64>,
    pub candidates_evaluated_total: Counter<u64>,
    pub candidates_failed_total: Counter<u64>,
    pub search_latency_ms: Histogram<f64>,
    pub audits_total: Counter<u64>,
    pub audit_data_errors_total: Counter<u64>,
    pub promotions_total: Counter<u64>,
    pub rejections_total: Counter<u64>,
    pub reaudits_total: Counter<u64>,
    pub drift_evaluations_total: Counter<u64>,
    pub drift_detected_total: Counter<u64>,
    pub predictions_total: Counter<u64>,
    pub prediction_errors_total: Counter<u64>,
    pub prediction_latency_ms: Histogram<f64>,
    pub inference_log_dropped_total: Counter<u64>,
}

static GOVERNANCE_METER: Lazy<Meter> = Lazy::new(|| opentelemetry::global::meter("attrition_governance"));

pub static GOVERNANCE_METRICS: Lazy<GovernanceMetrics> = Lazy::new(|| {
    let m = &*GOVERNANCE_METER;
    GovernanceMetrics {
        searches_total: m.u64_counter("governance_searches_total").with_description("Candidate searches started").build(),
        candidates_evaluated_total: m.u64_counter("governance_candidates_evaluated_total").with_description("Candidates trained and scored").build(),
        candidates_failed_total: m.u64_counter("governance_candidates_failed_total").with_description("Candidate evaluations that failed to train or store").build(),
        search_latency_ms: m.f64_histogram("governance_search_latency_ms").with_description("Wall time of a search").with_unit("ms").build(),
        audits_total: m.u64_counter("governance_audits_total").with_description("Fairness audits completed").build(),
        audit_data_errors_total: m.u64_counter("governance_audit_data_errors_total").with_description("Audits blocked by unpopulated subgroups").build(),
        promotions_total: m.u64_counter("governance_promotions_total").with_description("Candidates promoted to active").build(),
        rejections_total: m.u64_counter("governance_rejections_total").with_description("Promotion attempts rejected by the gate").build(),
        reaudits_total: m.u64_counter("governance_reaudits_total").with_description("Serving versions re-audited, by result").build(),
        drift_evaluations_total: m.u64_counter("governance_drift_evaluations_total").with_description("Drift windows evaluated").build(),
        drift_detected_total: m.u64_counter("governance_drift_detected_total").with_description("Drift windows with a Drifted verdict").build(),
        predictions_total: m.u64_counter("governance_predictions_total").with_description("Prediction requests answered").build(),
        prediction_errors_total: m.u64_counter("governance_prediction_errors_total").with_description("Prediction requests rejected").build(),
        prediction_latency_ms: m.f64_histogram("governance_prediction_latency_ms").with_description("Prediction handler latency").with_unit("ms").build(),
        inference_log_dropped_total: m.u64_counter("governance_inference_log_dropped_total").with_description("Inference log entries evicted before a drift window read them").build(),
    }
});

pub fn governance_metrics() -> &'static GovernanceMetrics { &GOVERNANCE_METRICS }
