use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::rollup::types::{InstitutionRollup, SubjectRollup, TutorRollup};
use crate::storage::repository::{self, RecommendedActionRow, RiskAssessmentRow};
use crate::storage::Database;

// Read-only composition over the rollup store. Nothing here recomputes;
// stale rollups are served as-is.

const DASHBOARD_WINDOW_DAYS: i64 = 30;
const RISK_WINDOW_DAYS: i64 = 7;
const TOP_N: u32 = 5;
const ACTION_LIMIT: u32 = 10;
const RISK_LIMIT: u32 = 10;

#[derive(Debug, Clone, Serialize)]
pub struct Dashboard {
    pub institution_stats: Option<InstitutionRollup>,
    pub recent_subject_stats: Vec<SubjectRollup>,
    pub tutor_performance: Vec<TutorRollup>,
    pub at_risk_students: Vec<RiskAssessmentRow>,
    pub recent_recommendations: Vec<RecommendedActionRow>,
}

/// Assemble the dashboard payload: latest institution rollup, top subjects
/// and tutors over the last 30 days, fresh high-risk assessments, and open
/// high-priority recommendations.
pub async fn dashboard(db: &Database, today: NaiveDate) -> Result<Dashboard> {
    let rollup_cutoff = (today - Duration::days(DASHBOARD_WINDOW_DAYS))
        .format("%Y-%m-%d")
        .to_string();
    let risk_cutoff = (today - Duration::days(RISK_WINDOW_DAYS))
        .format("%Y-%m-%d")
        .to_string();

    db.reader()
        .call(move |conn| {
            Ok::<Dashboard, rusqlite::Error>(Dashboard {
                institution_stats: repository::latest_institution_rollup(conn)?,
                recent_subject_stats: repository::top_subject_rollups_since(
                    conn,
                    &rollup_cutoff,
                    TOP_N,
                )?,
                tutor_performance: repository::top_tutor_rollups_since(
                    conn,
                    &rollup_cutoff,
                    TOP_N,
                )?,
                at_risk_students: repository::recent_high_risk_assessments(
                    conn,
                    &risk_cutoff,
                    RISK_LIMIT,
                )?,
                recent_recommendations: repository::open_priority_actions(conn, 2, ACTION_LIMIT)?,
            })
        })
        .await
        .map_err(|e| Error::Database(e.to_string()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportKind {
    Institution,
    Subject,
    Tutor,
}

impl ReportKind {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "institution" => Ok(ReportKind::Institution),
            "subject" => Ok(ReportKind::Subject),
            "tutor" => Ok(ReportKind::Tutor),
            other => Err(Error::Validation(format!("invalid report type: {other}"))),
        }
    }
}

/// Raw report request as it arrives over HTTP; everything optional so the
/// validation errors are ours, with field-level messages.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReportRequest {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub subject_id: Option<String>,
    pub tutor_id: Option<String>,
}

/// Generate a report: a summary over the rollup rows in range plus the raw
/// per-period rows. Validation failures return before any data is read.
pub async fn generate_report(db: &Database, request: ReportRequest) -> Result<Value> {
    let kind = match request.kind.as_deref() {
        Some(kind) => ReportKind::parse(kind)?,
        None => {
            return Err(Error::Validation(
                "missing required parameters: type, start_date, end_date".to_string(),
            ))
        }
    };
    let (start, end) = match (request.start_date.as_deref(), request.end_date.as_deref()) {
        (Some(start), Some(end)) => (parse_date("start_date", start)?, parse_date("end_date", end)?),
        _ => {
            return Err(Error::Validation(
                "missing required parameters: type, start_date, end_date".to_string(),
            ))
        }
    };
    if start > end {
        return Err(Error::Validation(format!(
            "start_date {start} is after end_date {end}"
        )));
    }

    let start_key = start.format("%Y-%m-%d").to_string();
    let end_key = end.format("%Y-%m-%d").to_string();

    match kind {
        ReportKind::Institution => institution_report(db, start_key, end_key).await,
        ReportKind::Subject => {
            let subject_id = request.subject_id.ok_or_else(|| {
                Error::Validation("missing subject_id for subject report".to_string())
            })?;
            subject_report(db, subject_id, start_key, end_key).await
        }
        ReportKind::Tutor => {
            let tutor_id = request
                .tutor_id
                .ok_or_else(|| Error::Validation("missing tutor_id for tutor report".to_string()))?;
            tutor_report(db, tutor_id, start_key, end_key).await
        }
    }
}

fn parse_date(field: &str, value: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|_| Error::Validation(format!("invalid {field}: {value} (expected YYYY-MM-DD)")))
}

async fn institution_report(db: &Database, start: String, end: String) -> Result<Value> {
    let rows = db
        .reader()
        .call(move |conn| repository::institution_rollups_in_range(conn, &start, &end))
        .await?;

    let summary = json!({
        "total_sessions": rows.iter().map(|r| r.total_sessions).sum::<i64>(),
        "total_hours": rows.iter().map(|r| r.total_hours).sum::<f64>(),
        "avg_session_rating": mean(rows.iter().map(|r| r.average_session_rating)),
        "active_students": rows.iter().map(|r| r.active_students).max().unwrap_or(0),
        "active_tutors": rows.iter().map(|r| r.active_tutors).max().unwrap_or(0),
    });

    Ok(json!({ "summary": summary, "period_data": rows }))
}

async fn subject_report(
    db: &Database,
    subject_id: String,
    start: String,
    end: String,
) -> Result<Value> {
    let lookup = subject_id.clone();
    let subject: Option<(String, String)> = db
        .reader()
        .call(move |conn| {
            use rusqlite::OptionalExtension;
            conn.query_row(
                "SELECT code, name FROM dim_subjects WHERE subject_id = ?1",
                [lookup.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
        })
        .await?;
    let (code, name) = subject.ok_or_else(|| Error::NotFound(format!("subject {subject_id}")))?;

    let rows = {
        let subject_id = subject_id.clone();
        db.reader()
            .call(move |conn| repository::subject_rollups_in_range(conn, &subject_id, &start, &end))
            .await?
    };

    let summary = json!({
        "total_sessions": rows.iter().map(|r| r.total_sessions).sum::<i64>(),
        "total_hours": rows.iter().map(|r| r.total_hours).sum::<f64>(),
        "avg_session_rating": mean(rows.iter().map(|r| r.average_session_rating)),
        "avg_student_to_tutor_ratio": mean(rows.iter().map(|r| r.student_to_tutor_ratio)),
    });

    Ok(json!({
        "subject": { "subject_id": subject_id, "code": code, "name": name },
        "summary": summary,
        "period_data": rows,
    }))
}

async fn tutor_report(db: &Database, tutor_id: String, start: String, end: String) -> Result<Value> {
    let lookup = tutor_id.clone();
    let tutor = db
        .reader()
        .call(move |conn| repository::get_user(conn, &lookup))
        .await?
        .ok_or_else(|| Error::NotFound(format!("tutor {tutor_id}")))?;

    let rows = {
        let tutor_id = tutor.user_id.clone();
        db.reader()
            .call(move |conn| repository::tutor_rollups_in_range(conn, &tutor_id, &start, &end))
            .await?
    };

    let summary = json!({
        "total_sessions": rows.iter().map(|r| r.sessions_conducted).sum::<i64>(),
        "total_hours": rows.iter().map(|r| r.total_hours).sum::<f64>(),
        "avg_rating": mean(rows.iter().map(|r| r.average_rating)),
        "unique_students": rows.iter().map(|r| r.unique_students_helped).sum::<i64>(),
    });

    Ok(json!({
        "tutor": { "user_id": tutor.user_id, "name": tutor.name, "email": tutor.email },
        "summary": summary,
        "period_data": rows,
    }))
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let values: Vec<f64> = values.collect();
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}
