//! axum binding of the serving façade.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::GovernanceError;
use crate::schema::JsonRecord;
use crate::serving::{HealthResponse, PredictResponse, ServingFacade};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictRequest {
    pub features: JsonRecord,
}

#[derive(Debug, Serialize)]
struct ErrorBody { error: String }

pub struct ApiError(GovernanceError);

impl From<GovernanceError> for ApiError {
    fn from(e: GovernanceError) -> Self { Self(e) }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            GovernanceError::Schema(_) | GovernanceError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            GovernanceError::NoActiveModel => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(ErrorBody { error: self.0.to_string() })).into_response()
    }
}

pub async fn predict(State(facade): State<Arc<ServingFacade>>, Json(req): Json<PredictRequest>) -> Result<Json<PredictResponse>, ApiError> {
    Ok(Json(facade.predict(&req.features)?))
}

pub async fn health(State(facade): State<Arc<ServingFacade>>) -> Json<HealthResponse> { Json(facade.health()) }

/// `POST /predict`, `GET /health`, plus the shared liveness, readiness and
/// metrics routes.
pub fn router(facade: Arc<ServingFacade>) -> Router {
    Router::new()
        .route("/predict", post(predict))
        .route("/health", get(health))
        .with_state(facade)
        .merge(govern_core::health_router())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serving::tests::{fixture, request};

    #[tokio::test]
    async fn predict_without_model_is_unavailable() {
        let f = fixture();
        let resp = predict(State(f.facade.clone()), Json(PredictRequest { features: request() })).await.into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn schema_violation_is_bad_request() {
        let f = fixture();
        let mut features = request();
        features.insert("Age".into(), serde_json::json!("old"));
        let resp = predict(State(f.facade.clone()), Json(PredictRequest { features })).await.into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn health_reports_versions() {
        let f = fixture();
        let Json(h) = health(State(f.facade.clone())).await;
        assert_eq!(h.active_version, None);
        let _router = router(f.facade.clone());
    }
}
