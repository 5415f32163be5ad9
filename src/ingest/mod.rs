use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::period::Period;
use crate::rollup;
use crate::storage::repository::{self, FeedbackRow, SessionRow};
use crate::storage::Database;

// The write surface the scheduling subsystem feeds. Creating a row here is
// the triggering event for rollup recomputation: triggers run synchronously,
// in-process, after the row is durably inserted, and only on creation.
// Later edits to a session or feedback row do not re-fire them.
//
// A failed recompute propagates to the caller and fails the whole ingestion,
// so a session create can be rejected by an analytics error. There is no
// retry.

pub const SESSION_STATUSES: [&str; 4] = ["scheduled", "ongoing", "completed", "cancelled"];

/// A session row as produced by the scheduling subsystem, ids included.
#[derive(Debug, Clone, Deserialize)]
pub struct NewSession {
    pub session_id: String,
    pub subject_id: String,
    pub tutor_id: String,
    pub student_id: String,
    /// RFC 3339 timestamp of the scheduled start.
    pub scheduled_at: String,
    pub duration_hours: Option<f64>,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewFeedback {
    pub feedback_id: String,
    pub session_id: String,
    pub student_id: String,
    pub overall_rating: i64,
    #[serde(default)]
    pub comments: String,
}

/// Record a session and recompute the subject, tutor, and institution
/// rollups for the current period (the bucket is resolved from `today`,
/// not from the session's scheduled date, matching the trigger contract).
pub async fn record_session(
    db: &Database,
    input: NewSession,
    today: NaiveDate,
) -> Result<SessionRow> {
    let scheduled = DateTime::parse_from_rfc3339(&input.scheduled_at)
        .map_err(|e| Error::Validation(format!("invalid scheduled_at: {e}")))?;
    let status = input.status.unwrap_or_else(|| "scheduled".to_string());
    if !SESSION_STATUSES.contains(&status.as_str()) {
        return Err(Error::Validation(format!("invalid session status: {status}")));
    }
    if let Some(hours) = input.duration_hours {
        if !hours.is_finite() || hours < 0.0 {
            return Err(Error::Validation(format!("invalid duration_hours: {hours}")));
        }
    }

    ensure_user(db, &input.tutor_id, "tutor").await?;
    ensure_user(db, &input.student_id, "student").await?;
    ensure_subject(db, &input.subject_id).await?;

    let session = SessionRow {
        session_id: input.session_id,
        subject_id: input.subject_id,
        tutor_id: input.tutor_id,
        student_id: input.student_id,
        scheduled_date_key: scheduled.date_naive().format("%Y-%m-%d").to_string(),
        scheduled_at: input.scheduled_at,
        duration_hours: input.duration_hours,
        status,
    };

    let inserted = session.clone();
    db.writer()
        .call(move |conn| repository::insert_session(conn, &inserted))
        .await?;

    let period = Period::current(today);
    rollup::recompute_subject(db, &session.subject_id, period).await?;
    rollup::recompute_tutor(db, &session.tutor_id, &session.subject_id, period).await?;
    rollup::recompute_institution(db, period).await?;

    log::debug!(
        "recorded session {} and refreshed {} rollups",
        session.session_id,
        period
    );
    Ok(session)
}

/// Record feedback on a session and recompute the subject, tutor, and
/// student rollups for the current period. The student bucket recomputed is
/// the session's student (the feedback author is the session participant).
pub async fn record_feedback(
    db: &Database,
    input: NewFeedback,
    now: DateTime<Utc>,
) -> Result<FeedbackRow> {
    if !(1..=5).contains(&input.overall_rating) {
        return Err(Error::Validation(format!(
            "overall_rating must be between 1 and 5, got {}",
            input.overall_rating
        )));
    }

    let session_id = input.session_id.clone();
    let session = db
        .reader()
        .call(move |conn| repository::get_session(conn, &session_id))
        .await?
        .ok_or_else(|| Error::NotFound(format!("session {}", input.session_id)))?;
    ensure_user(db, &input.student_id, "student").await?;

    let feedback = FeedbackRow {
        feedback_id: input.feedback_id,
        session_id: input.session_id,
        student_id: input.student_id,
        overall_rating: input.overall_rating,
        comments: input.comments,
        created_at: now.to_rfc3339(),
        created_date_key: now.date_naive().format("%Y-%m-%d").to_string(),
    };

    let inserted = feedback.clone();
    db.writer()
        .call(move |conn| repository::insert_feedback(conn, &inserted))
        .await?;

    let period = Period::current(now.date_naive());
    rollup::recompute_subject(db, &session.subject_id, period).await?;
    rollup::recompute_tutor(db, &session.tutor_id, &session.subject_id, period).await?;
    rollup::recompute_student(db, &session.student_id, &session.subject_id, period).await?;

    log::debug!(
        "recorded feedback {} on session {} and refreshed {} rollups",
        feedback.feedback_id,
        feedback.session_id,
        period
    );
    Ok(feedback)
}

async fn ensure_user(db: &Database, user_id: &str, label: &str) -> Result<()> {
    let lookup = user_id.to_string();
    let found = db
        .reader()
        .call(move |conn| repository::get_user(conn, &lookup))
        .await?;
    match found {
        Some(_) => Ok(()),
        None => Err(Error::NotFound(format!("{label} {user_id}"))),
    }
}

async fn ensure_subject(db: &Database, subject_id: &str) -> Result<()> {
    let lookup = subject_id.to_string();
    let found = db
        .reader()
        .call(move |conn| repository::subject_exists(conn, &lookup))
        .await?;
    if found {
        Ok(())
    } else {
        Err(Error::NotFound(format!("subject {subject_id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::repository::{upsert_subject, upsert_user};
    use chrono::TimeZone;

    async fn test_db() -> Database {
        let db = Database::open_memory().await.unwrap();
        db.writer()
            .call(|conn| {
                upsert_subject(conn, "sub-1", "MATH101", "Calculus I")?;
                upsert_user(conn, "tutor-1", "Tess Tutor", None, "tutor")?;
                upsert_user(conn, "stu-1", "Sam Student", None, "student")?;
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
        db
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 8, 5).unwrap()
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 5, 12, 0, 0).unwrap()
    }

    fn session_input(session_id: &str) -> NewSession {
        NewSession {
            session_id: session_id.to_string(),
            subject_id: "sub-1".to_string(),
            tutor_id: "tutor-1".to_string(),
            student_id: "stu-1".to_string(),
            scheduled_at: "2026-08-05T10:00:00Z".to_string(),
            duration_hours: Some(1.5),
            status: Some("completed".to_string()),
        }
    }

    #[tokio::test]
    async fn test_record_session_materializes_rollups() {
        let db = test_db().await;

        record_session(&db, session_input("s1"), today()).await.unwrap();

        let (subject_rows, tutor_rows, institution_rows): (i64, i64, i64) = db
            .reader()
            .call(|conn| {
                Ok::<(i64, i64, i64), rusqlite::Error>((
                    conn.query_row("SELECT COUNT(*) FROM rollup_subject", [], |r| r.get(0))?,
                    conn.query_row("SELECT COUNT(*) FROM rollup_tutor", [], |r| r.get(0))?,
                    conn.query_row("SELECT COUNT(*) FROM rollup_institution", [], |r| r.get(0))?,
                ))
            })
            .await
            .unwrap();
        assert_eq!(subject_rows, 1);
        assert_eq!(tutor_rows, 1);
        assert_eq!(institution_rows, 1);
    }

    #[tokio::test]
    async fn test_record_session_unknown_subject() {
        let db = test_db().await;

        let mut input = session_input("s1");
        input.subject_id = "sub-404".to_string();
        let err = record_session(&db, input, today()).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)), "got {err:?}");

        // Nothing inserted, nothing materialized.
        let sessions: i64 = db
            .reader()
            .call(|conn| {
                Ok::<i64, rusqlite::Error>(conn.query_row(
                    "SELECT COUNT(*) FROM fact_sessions",
                    [],
                    |r| r.get(0),
                )?)
            })
            .await
            .unwrap();
        assert_eq!(sessions, 0);
    }

    #[tokio::test]
    async fn test_record_session_rejects_bad_input() {
        let db = test_db().await;

        let mut input = session_input("s1");
        input.scheduled_at = "yesterday".to_string();
        assert!(matches!(
            record_session(&db, input, today()).await.unwrap_err(),
            Error::Validation(_)
        ));

        let mut input = session_input("s2");
        input.status = Some("wrapped-up".to_string());
        assert!(matches!(
            record_session(&db, input, today()).await.unwrap_err(),
            Error::Validation(_)
        ));

        let mut input = session_input("s3");
        input.duration_hours = Some(-1.0);
        assert!(matches!(
            record_session(&db, input, today()).await.unwrap_err(),
            Error::Validation(_)
        ));
    }

    #[tokio::test]
    async fn test_record_feedback_updates_rollups() {
        let db = test_db().await;

        record_session(&db, session_input("s1"), today()).await.unwrap();
        record_feedback(
            &db,
            NewFeedback {
                feedback_id: "f1".to_string(),
                session_id: "s1".to_string(),
                student_id: "stu-1".to_string(),
                overall_rating: 4,
                comments: "clear explanations".to_string(),
            },
            now(),
        )
        .await
        .unwrap();

        let (rating, rate): (f64, f64) = db
            .reader()
            .call(|conn| {
                Ok::<(f64, f64), rusqlite::Error>(conn.query_row(
                    "SELECT average_session_rating, feedback_response_rate
                     FROM rollup_subject WHERE subject_id = 'sub-1'",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?)
            })
            .await
            .unwrap();
        assert_eq!(rating, 4.0);
        assert_eq!(rate, 100.0);

        let feedback_given: i64 = db
            .reader()
            .call(|conn| {
                Ok::<i64, rusqlite::Error>(conn.query_row(
                    "SELECT feedback_given_count FROM rollup_student
                     WHERE student_id = 'stu-1' AND subject_id = 'sub-1'",
                    [],
                    |row| row.get(0),
                )?)
            })
            .await
            .unwrap();
        assert_eq!(feedback_given, 1);
    }

    #[tokio::test]
    async fn test_record_feedback_rejects_out_of_range_rating() {
        let db = test_db().await;
        record_session(&db, session_input("s1"), today()).await.unwrap();

        for rating in [0, 6, -1] {
            let err = record_feedback(
                &db,
                NewFeedback {
                    feedback_id: format!("f{rating}"),
                    session_id: "s1".to_string(),
                    student_id: "stu-1".to_string(),
                    overall_rating: rating,
                    comments: String::new(),
                },
                now(),
            )
            .await
            .unwrap_err();
            assert!(matches!(err, Error::Validation(_)));
        }
    }

    #[tokio::test]
    async fn test_record_feedback_unknown_session() {
        let db = test_db().await;

        let err = record_feedback(
            &db,
            NewFeedback {
                feedback_id: "f1".to_string(),
                session_id: "s-404".to_string(),
                student_id: "stu-1".to_string(),
                overall_rating: 3,
                comments: String::new(),
            },
            now(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
