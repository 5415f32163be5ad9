// HTTP reporting façade and ingestion surface.
//
// Identity is delegated to an upstream gateway: requests arrive with an
// `x-user-id` header that is resolved against dim_users for role scoping.
// This service does no token verification of its own.
//
// Endpoints:
//   GET  /api/analytics/dashboard/
//   POST /api/analytics/generate-reports/
//   GET  /api/analytics/institution-analytics/
//   GET  /api/analytics/subject-analytics/
//   GET  /api/analytics/tutor-performance/
//   GET  /api/analytics/student-progress/
//   GET  /api/analytics/risk-assessments/
//   GET  /api/analytics/risk-assessments/{id}
//   DELETE /api/analytics/risk-assessments/{id}
//   GET  /api/analytics/recommended-actions/
//   POST /api/analytics/recommended-actions/{id}/complete
//   GET  /api/analytics/predictive-models/
//   POST /api/sessions/
//   POST /api/feedback/
//   GET  /api/health

pub mod routes;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;

use crate::error::{Error, Result};
use crate::storage::Database;

pub const DEFAULT_BIND: &str = "127.0.0.1:4810";

pub struct AppContext {
    pub db: Database,
}

pub async fn serve(db: Database, bind: &str) -> Result<()> {
    let addr: SocketAddr = bind
        .parse()
        .map_err(|e| Error::Config(format!("invalid bind address {bind}: {e}")))?;
    let router = build_router(Arc::new(AppContext { db }));

    log::info!("analytics API listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Server(format!("cannot bind {addr}: {e}")))?;
    axum::serve(listener, router)
        .await
        .map_err(|e| Error::Server(e.to_string()))?;
    Ok(())
}

pub fn build_router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/api/health", get(routes::health))
        .route("/api/analytics/dashboard/", get(routes::dashboard))
        .route(
            "/api/analytics/generate-reports/",
            post(routes::generate_reports),
        )
        .route(
            "/api/analytics/institution-analytics/",
            get(routes::list_institution_analytics),
        )
        .route(
            "/api/analytics/subject-analytics/",
            get(routes::list_subject_analytics),
        )
        .route(
            "/api/analytics/tutor-performance/",
            get(routes::list_tutor_performance),
        )
        .route(
            "/api/analytics/student-progress/",
            get(routes::list_student_progress),
        )
        .route(
            "/api/analytics/risk-assessments/",
            get(routes::list_risk_assessments),
        )
        .route(
            "/api/analytics/risk-assessments/{id}",
            get(routes::get_risk_assessment).delete(routes::delete_risk_assessment),
        )
        .route(
            "/api/analytics/recommended-actions/",
            get(routes::list_recommended_actions),
        )
        .route(
            "/api/analytics/recommended-actions/{id}/complete",
            post(routes::complete_recommended_action),
        )
        .route(
            "/api/analytics/predictive-models/",
            get(routes::list_predictive_models),
        )
        .route("/api/sessions/", post(routes::create_session))
        .route("/api/feedback/", post(routes::create_feedback))
        .layer(CorsLayer::permissive())
        .with_state(ctx)
}

/// Map domain errors onto HTTP statuses; everything else is a 500.
pub(crate) fn error_response(e: Error) -> (StatusCode, Json<Value>) {
    let status = match &e {
        Error::Validation(_) | Error::PeriodParse(_) => StatusCode::BAD_REQUEST,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        Error::Forbidden(_) => StatusCode::FORBIDDEN,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        log::error!("request failed: {e}");
    }
    (status, Json(json!({ "error": e.to_string() })))
}
