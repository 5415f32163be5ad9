use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use chrono::Utc;
use serde_json::{json, Value};

use super::{error_response, AppContext};
use crate::error::Error;
use crate::ingest::{self, NewFeedback, NewSession};
use crate::report::{self, ReportRequest};
use crate::storage::repository::{self, UserRow};

type HandlerResult = Result<Json<Value>, (StatusCode, Json<Value>)>;

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

// ── Identity and scoping ───────────────────────────────────────────

async fn current_user(
    ctx: &AppContext,
    headers: &HeaderMap,
) -> Result<UserRow, Error> {
    let user_id = headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .ok_or_else(|| Error::Unauthorized("missing x-user-id header".to_string()))?;

    let lookup = user_id.clone();
    ctx.db
        .reader()
        .call(move |conn| repository::get_user(conn, &lookup))
        .await
        .map_err(Error::from)?
        .ok_or_else(|| Error::Unauthorized(format!("unknown user {user_id}")))
}

fn require_staff(user: &UserRow) -> Result<(), Error> {
    if user.role == "staff" {
        Ok(())
    } else {
        Err(Error::Forbidden("staff role required".to_string()))
    }
}

/// Which students' rows a caller may read: everything for staff, their own
/// row for a student, their roster for an instructor, nothing otherwise.
async fn student_scope(
    ctx: &AppContext,
    user: &UserRow,
) -> Result<Option<Vec<String>>, Error> {
    match user.role.as_str() {
        "staff" => Ok(None),
        "student" => Ok(Some(vec![user.user_id.clone()])),
        "instructor" => {
            let instructor_id = user.user_id.clone();
            let ids = ctx
                .db
                .reader()
                .call(move |conn| repository::instructor_student_ids(conn, &instructor_id))
                .await?;
            Ok(Some(ids))
        }
        _ => Ok(Some(Vec::new())),
    }
}

fn scope_allows(scope: &Option<Vec<String>>, student_id: &str) -> bool {
    match scope {
        None => true,
        Some(ids) => ids.iter().any(|id| id == student_id),
    }
}

// ── Dashboard and reports ──────────────────────────────────────────

pub async fn dashboard(State(ctx): State<Arc<AppContext>>, headers: HeaderMap) -> HandlerResult {
    current_user(&ctx, &headers).await.map_err(error_response)?;

    let today = Utc::now().date_naive();
    let payload = report::dashboard(&ctx.db, today)
        .await
        .map_err(error_response)?;
    Ok(Json(json!(payload)))
}

pub async fn generate_reports(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Json(request): Json<ReportRequest>,
) -> HandlerResult {
    let user = current_user(&ctx, &headers).await.map_err(error_response)?;
    require_staff(&user).map_err(error_response)?;

    let payload = report::generate_report(&ctx.db, request)
        .await
        .map_err(error_response)?;
    Ok(Json(payload))
}

// ── Rollup listings ────────────────────────────────────────────────

pub async fn list_institution_analytics(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
) -> HandlerResult {
    let user = current_user(&ctx, &headers).await.map_err(error_response)?;
    require_staff(&user).map_err(error_response)?;

    let rows = ctx
        .db
        .reader()
        .call(|conn| repository::list_institution_rollups(conn))
        .await
        .map_err(|e| error_response(Error::from(e)))?;
    Ok(Json(json!(rows)))
}

pub async fn list_subject_analytics(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
) -> HandlerResult {
    current_user(&ctx, &headers).await.map_err(error_response)?;

    let rows = ctx
        .db
        .reader()
        .call(|conn| repository::list_subject_rollups(conn))
        .await
        .map_err(|e| error_response(Error::from(e)))?;
    Ok(Json(json!(rows)))
}

pub async fn list_tutor_performance(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
) -> HandlerResult {
    let user = current_user(&ctx, &headers).await.map_err(error_response)?;

    // Tutors see their own rows, staff see all, everyone else sees none.
    let tutor_filter = match user.role.as_str() {
        "staff" => None,
        "tutor" => Some(user.user_id.clone()),
        _ => {
            return Ok(Json(json!([])));
        }
    };
    let rows = ctx
        .db
        .reader()
        .call(move |conn| repository::list_tutor_rollups(conn, tutor_filter.as_deref()))
        .await
        .map_err(|e| error_response(Error::from(e)))?;
    Ok(Json(json!(rows)))
}

pub async fn list_student_progress(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
) -> HandlerResult {
    let user = current_user(&ctx, &headers).await.map_err(error_response)?;
    let scope = student_scope(&ctx, &user).await.map_err(error_response)?;

    let rows = ctx
        .db
        .reader()
        .call(move |conn| repository::list_student_rollups(conn, scope.as_deref()))
        .await
        .map_err(|e| error_response(Error::from(e)))?;
    Ok(Json(json!(rows)))
}

// ── Risk assessments ───────────────────────────────────────────────

pub async fn list_risk_assessments(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
) -> HandlerResult {
    let user = current_user(&ctx, &headers).await.map_err(error_response)?;
    let scope = student_scope(&ctx, &user).await.map_err(error_response)?;

    let rows = ctx
        .db
        .reader()
        .call(move |conn| repository::list_risk_assessments(conn, scope.as_deref()))
        .await
        .map_err(|e| error_response(Error::from(e)))?;
    Ok(Json(json!(rows)))
}

pub async fn get_risk_assessment(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> HandlerResult {
    let user = current_user(&ctx, &headers).await.map_err(error_response)?;
    let scope = student_scope(&ctx, &user).await.map_err(error_response)?;

    let row = ctx
        .db
        .reader()
        .call(move |conn| repository::get_risk_assessment(conn, id))
        .await
        .map_err(|e| error_response(Error::from(e)))?;

    // Out-of-scope rows read as absent, same as an unknown id.
    match row {
        Some(row) if scope_allows(&scope, &row.student_id) => Ok(Json(json!(row))),
        _ => Err(error_response(Error::NotFound(format!(
            "risk assessment {id}"
        )))),
    }
}

pub async fn delete_risk_assessment(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> HandlerResult {
    let user = current_user(&ctx, &headers).await.map_err(error_response)?;
    require_staff(&user).map_err(error_response)?;

    let deleted = ctx
        .db
        .writer()
        .call(move |conn| repository::delete_risk_assessment(conn, id))
        .await
        .map_err(|e| error_response(Error::from(e)))?;
    if deleted {
        Ok(Json(json!({ "deleted": id })))
    } else {
        Err(error_response(Error::NotFound(format!(
            "risk assessment {id}"
        ))))
    }
}

// ── Recommended actions ────────────────────────────────────────────

pub async fn list_recommended_actions(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
) -> HandlerResult {
    let user = current_user(&ctx, &headers).await.map_err(error_response)?;
    let scope = student_scope(&ctx, &user).await.map_err(error_response)?;

    let rows = ctx
        .db
        .reader()
        .call(move |conn| repository::list_recommended_actions(conn, scope.as_deref()))
        .await
        .map_err(|e| error_response(Error::from(e)))?;
    Ok(Json(json!(rows)))
}

pub async fn complete_recommended_action(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> HandlerResult {
    let user = current_user(&ctx, &headers).await.map_err(error_response)?;
    let scope = student_scope(&ctx, &user).await.map_err(error_response)?;

    let action = ctx
        .db
        .reader()
        .call(move |conn| repository::get_recommended_action(conn, id))
        .await
        .map_err(|e| error_response(Error::from(e)))?;
    let action = match action {
        Some(action) if scope_allows(&scope, &action.student_id) => action,
        _ => {
            return Err(error_response(Error::NotFound(format!(
                "recommended action {id}"
            ))))
        }
    };

    let completed_at = Utc::now().to_rfc3339();
    ctx.db
        .writer()
        .call(move |conn| repository::complete_recommended_action(conn, id, &completed_at))
        .await
        .map_err(|e| error_response(Error::from(e)))?;

    Ok(Json(json!({ "completed": action.action_id })))
}

// ── Predictive models ──────────────────────────────────────────────

pub async fn list_predictive_models(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
) -> HandlerResult {
    let user = current_user(&ctx, &headers).await.map_err(error_response)?;
    require_staff(&user).map_err(error_response)?;

    let rows = ctx
        .db
        .reader()
        .call(|conn| repository::list_predictive_models(conn))
        .await
        .map_err(|e| error_response(Error::from(e)))?;
    Ok(Json(json!(rows)))
}

// ── Ingestion (the write surface that fires rollup triggers) ───────

pub async fn create_session(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Json(input): Json<NewSession>,
) -> HandlerResult {
    let user = current_user(&ctx, &headers).await.map_err(error_response)?;
    if user.role == "student" {
        return Err(error_response(Error::Forbidden(
            "students cannot create sessions".to_string(),
        )));
    }

    let today = Utc::now().date_naive();
    let session = ingest::record_session(&ctx.db, input, today)
        .await
        .map_err(error_response)?;
    Ok(Json(json!(session)))
}

pub async fn create_feedback(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Json(input): Json<NewFeedback>,
) -> HandlerResult {
    current_user(&ctx, &headers).await.map_err(error_response)?;

    let feedback = ingest::record_feedback(&ctx.db, input, Utc::now())
        .await
        .map_err(error_response)?;
    Ok(Json(json!(feedback)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::repository::{
        add_instructor_student, upsert_risk_assessment, upsert_student_rollup, upsert_subject,
        upsert_user,
    };
    use crate::rollup::types::StudentRollup;
    use crate::storage::Database;

    async fn test_ctx() -> Arc<AppContext> {
        let db = Database::open_memory().await.unwrap();
        db.writer()
            .call(|conn| {
                upsert_subject(conn, "sub-1", "MATH101", "Calculus I")?;
                upsert_user(conn, "staff-1", "Ada Admin", None, "staff")?;
                upsert_user(conn, "tutor-1", "Tess Tutor", None, "tutor")?;
                upsert_user(conn, "stu-1", "Sam Student", None, "student")?;
                upsert_user(conn, "stu-2", "Uma Undergrad", None, "student")?;
                upsert_user(conn, "inst-1", "Ivan Instructor", None, "instructor")?;
                add_instructor_student(conn, "inst-1", "stu-1")?;

                for student_id in ["stu-1", "stu-2"] {
                    upsert_student_rollup(
                        conn,
                        &StudentRollup {
                            student_id: student_id.to_string(),
                            subject_id: "sub-1".to_string(),
                            period_start: "2026-07-01".to_string(),
                            period_end: "2026-07-31".to_string(),
                            sessions_attended: 2,
                            total_learning_hours: 3.0,
                            feedback_given_count: 1,
                            self_reported_confidence: 0.0,
                            self_reported_understanding: 0.0,
                        },
                    )?;
                }
                upsert_risk_assessment(
                    conn, "stu-1", "sub-1", "high", 0.8, "{}", None, "2026-08-01",
                )?;
                upsert_risk_assessment(
                    conn, "stu-2", "sub-1", "high", 0.8, "{}", None, "2026-08-01",
                )?;
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
        Arc::new(AppContext { db })
    }

    fn headers_for(user_id: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-user-id", user_id.parse().unwrap());
        headers
    }

    #[tokio::test]
    async fn test_missing_identity_is_unauthorized() {
        let ctx = test_ctx().await;

        let err = dashboard(State(ctx), HeaderMap::new()).await.unwrap_err();
        assert_eq!(err.0, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_unknown_identity_is_unauthorized() {
        let ctx = test_ctx().await;

        let err = dashboard(State(ctx), headers_for("ghost")).await.unwrap_err();
        assert_eq!(err.0, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_reports_require_staff() {
        let ctx = test_ctx().await;

        let err = generate_reports(
            State(ctx.clone()),
            headers_for("stu-1"),
            Json(ReportRequest::default()),
        )
        .await
        .unwrap_err();
        assert_eq!(err.0, StatusCode::FORBIDDEN);

        // Staff with an empty body gets the validation error instead.
        let err = generate_reports(
            State(ctx),
            headers_for("staff-1"),
            Json(ReportRequest::default()),
        )
        .await
        .unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_subject_report_without_id_is_bad_request() {
        let ctx = test_ctx().await;

        let request = ReportRequest {
            kind: Some("subject".to_string()),
            start_date: Some("2026-07-01".to_string()),
            end_date: Some("2026-07-31".to_string()),
            subject_id: None,
            tutor_id: None,
        };
        let err = generate_reports(State(ctx), headers_for("staff-1"), Json(request))
            .await
            .unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
        assert!(err.1 .0["error"].as_str().unwrap().contains("subject_id"));
    }

    #[tokio::test]
    async fn test_student_progress_scoping() {
        let ctx = test_ctx().await;

        // Student sees only their own row.
        let Json(body) = list_student_progress(State(ctx.clone()), headers_for("stu-1"))
            .await
            .unwrap();
        let rows = body.as_array().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["student_id"], "stu-1");

        // Instructor sees their roster.
        let Json(body) = list_student_progress(State(ctx.clone()), headers_for("inst-1"))
            .await
            .unwrap();
        assert_eq!(body.as_array().unwrap().len(), 1);

        // Staff sees all.
        let Json(body) = list_student_progress(State(ctx.clone()), headers_for("staff-1"))
            .await
            .unwrap();
        assert_eq!(body.as_array().unwrap().len(), 2);

        // Tutors see none.
        let Json(body) = list_student_progress(State(ctx), headers_for("tutor-1"))
            .await
            .unwrap();
        assert!(body.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_risk_assessment_out_of_scope_reads_as_absent() {
        let ctx = test_ctx().await;

        // stu-2's assessment has id 2; stu-1 cannot see it.
        let err = get_risk_assessment(State(ctx.clone()), headers_for("stu-1"), Path(2))
            .await
            .unwrap_err();
        assert_eq!(err.0, StatusCode::NOT_FOUND);

        let Json(body) = get_risk_assessment(State(ctx), headers_for("staff-1"), Path(2))
            .await
            .unwrap();
        assert_eq!(body["student_id"], "stu-2");
    }

    #[tokio::test]
    async fn test_delete_risk_assessment_staff_only() {
        let ctx = test_ctx().await;

        let err = delete_risk_assessment(State(ctx.clone()), headers_for("inst-1"), Path(1))
            .await
            .unwrap_err();
        assert_eq!(err.0, StatusCode::FORBIDDEN);

        let Json(body) = delete_risk_assessment(State(ctx.clone()), headers_for("staff-1"), Path(1))
            .await
            .unwrap();
        assert_eq!(body["deleted"], 1);

        let err = delete_risk_assessment(State(ctx), headers_for("staff-1"), Path(1))
            .await
            .unwrap_err();
        assert_eq!(err.0, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_students_cannot_create_sessions() {
        let ctx = test_ctx().await;

        let input = NewSession {
            session_id: "s1".to_string(),
            subject_id: "sub-1".to_string(),
            tutor_id: "tutor-1".to_string(),
            student_id: "stu-1".to_string(),
            scheduled_at: "2026-08-05T10:00:00Z".to_string(),
            duration_hours: Some(1.0),
            status: None,
        };
        let err = create_session(State(ctx), headers_for("stu-1"), Json(input))
            .await
            .unwrap_err();
        assert_eq!(err.0, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_session_and_feedback_round_trip() {
        let ctx = test_ctx().await;

        let input = NewSession {
            session_id: "s1".to_string(),
            subject_id: "sub-1".to_string(),
            tutor_id: "tutor-1".to_string(),
            student_id: "stu-1".to_string(),
            scheduled_at: "2026-08-05T10:00:00Z".to_string(),
            duration_hours: Some(1.0),
            status: Some("completed".to_string()),
        };
        create_session(State(ctx.clone()), headers_for("tutor-1"), Json(input))
            .await
            .unwrap();

        let feedback = NewFeedback {
            feedback_id: "f1".to_string(),
            session_id: "s1".to_string(),
            student_id: "stu-1".to_string(),
            overall_rating: 5,
            comments: String::new(),
        };
        create_feedback(State(ctx.clone()), headers_for("stu-1"), Json(feedback))
            .await
            .unwrap();

        let Json(body) = list_subject_analytics(State(ctx), headers_for("stu-1"))
            .await
            .unwrap();
        let rows = body.as_array().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["average_session_rating"], 5.0);
    }
}
