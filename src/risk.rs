use chrono::NaiveDate;
use serde::Serialize;
use serde_json::json;

use crate::error::Result;
use crate::period::Period;
use crate::rollup::{self, StudentRollup};
use crate::storage::{repository, Database};

/// Fraction of the population mean below which a student counts as
/// deficient on a metric.
const DEFICIENCY_THRESHOLD: f64 = 0.5;

/// Flagged students get a fixed level and score; this is a baseline filter,
/// not a trained model.
const FLAGGED_RISK_LEVEL: &str = "high";
const FLAGGED_RISK_SCORE: f64 = 0.8;

/// Outcome of the monthly rollup refresh job.
#[derive(Debug, Clone, Serialize)]
pub struct MonthlyRollupReport {
    pub period: String,
    pub subjects_refreshed: usize,
}

/// Outcome of the risk assessment job.
#[derive(Debug, Clone, Serialize)]
pub struct RiskAssessmentReport {
    pub period: String,
    pub students_assessed: usize,
    pub mean_sessions_attended: f64,
    pub mean_learning_hours: f64,
}

/// Refresh subject rollups for the previous calendar month: every subject
/// with at least one session in that month gets a full recompute, and an
/// institution rollup row is guaranteed to exist for the period. The
/// institution row is only created here, not recomputed; its numbers fill
/// in when the next session trigger runs an institution recompute.
pub async fn generate_monthly_rollups(
    db: &Database,
    today: NaiveDate,
) -> Result<MonthlyRollupReport> {
    let period = Period::previous(today);
    let (start, end) = period.date_keys();

    let subjects = {
        let (start, end) = (start.clone(), end.clone());
        db.reader()
            .call(move |conn| repository::subjects_with_sessions_between(conn, &start, &end))
            .await?
    };

    for subject_id in &subjects {
        rollup::recompute_subject(db, subject_id, period).await?;
    }

    db.writer()
        .call(move |conn| repository::ensure_institution_rollup(conn, &start, &end))
        .await?;

    log::info!(
        "monthly rollups for {}: refreshed {} subjects",
        period,
        subjects.len()
    );
    Ok(MonthlyRollupReport {
        period: period.key(),
        subjects_refreshed: subjects.len(),
    })
}

/// Flag students whose previous-month engagement fell below half the
/// population mean on BOTH attendance and learning hours. Each flagged
/// (student, subject) gets one assessment per day; a same-day re-run
/// updates the existing row. No-ops when no student rollups exist for the
/// period.
pub async fn generate_risk_assessments(
    db: &Database,
    today: NaiveDate,
) -> Result<RiskAssessmentReport> {
    let period = Period::previous(today);
    let (start, end) = period.date_keys();

    let rollups = db
        .reader()
        .call(move |conn| repository::student_rollups_for_period(conn, &start, &end))
        .await?;

    let Some((mean_sessions, mean_hours)) = population_means(&rollups) else {
        log::info!("no student rollups for {period}; skipping risk assessments");
        return Ok(RiskAssessmentReport {
            period: period.key(),
            students_assessed: 0,
            mean_sessions_attended: 0.0,
            mean_learning_hours: 0.0,
        });
    };

    let at_risk: Vec<&StudentRollup> = rollups
        .iter()
        .filter(|r| is_at_risk(r, mean_sessions, mean_hours))
        .collect();

    let factors = json!({
        "low_session_attendance": true,
        "low_learning_hours": true,
    })
    .to_string();
    let assessed_on = today.format("%Y-%m-%d").to_string();

    let assessed = at_risk.len();
    let flagged: Vec<(String, String)> = at_risk
        .iter()
        .map(|r| (r.student_id.clone(), r.subject_id.clone()))
        .collect();

    db.writer()
        .call(move |conn| {
            let model_id = repository::active_model_id(conn, "at_risk")?;
            for (student_id, subject_id) in &flagged {
                repository::upsert_risk_assessment(
                    conn,
                    student_id,
                    subject_id,
                    FLAGGED_RISK_LEVEL,
                    FLAGGED_RISK_SCORE,
                    &factors,
                    model_id.as_deref(),
                    &assessed_on,
                )?;
            }
            Ok::<(), rusqlite::Error>(())
        })
        .await?;

    log::info!("risk assessments for {period}: flagged {assessed} students");
    Ok(RiskAssessmentReport {
        period: period.key(),
        students_assessed: assessed,
        mean_sessions_attended: mean_sessions,
        mean_learning_hours: mean_hours,
    })
}

/// Population means of attendance and learning hours; None when there are
/// no rollups to average over.
fn population_means(rollups: &[StudentRollup]) -> Option<(f64, f64)> {
    if rollups.is_empty() {
        return None;
    }
    let n = rollups.len() as f64;
    let sessions: i64 = rollups.iter().map(|r| r.sessions_attended).sum();
    let hours: f64 = rollups.iter().map(|r| r.total_learning_hours).sum();
    Some((sessions as f64 / n, hours / n))
}

/// Both metrics must be deficient (logical AND, matching the upstream
/// product behavior) for a student to be flagged.
fn is_at_risk(rollup: &StudentRollup, mean_sessions: f64, mean_hours: f64) -> bool {
    (rollup.sessions_attended as f64) < mean_sessions * DEFICIENCY_THRESHOLD
        && rollup.total_learning_hours < mean_hours * DEFICIENCY_THRESHOLD
}
