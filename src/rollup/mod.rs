pub mod types;

pub use types::*;

use crate::error::{Error, Result};
use crate::period::Period;
use crate::storage::{repository, Database};

// The aggregation engine: each function re-reads every transactional row in
// the bucket and overwrites the rollup row in place. O(sessions-in-period)
// per call, no incremental update. The read and the upsert run inside a
// single writer callback, so recomputes within one process serialize;
// concurrent writers from other processes remain last-writer-wins.
//
// Recomputes fire on row creation only. Later edits to sessions or feedback
// do not re-fire them, so rollups drift from the source rows until the next
// trigger or batch refresh touches the same bucket.

/// Recompute the subject rollup for one (subject, period) bucket.
pub async fn recompute_subject(
    db: &Database,
    subject_id: &str,
    period: Period,
) -> Result<SubjectRollup> {
    let subject_id = subject_id.to_string();
    let (start, end) = period.date_keys();

    db.writer()
        .call(move |conn| {
            let rollup = compute_subject(conn, &subject_id, &start, &end)?;
            repository::upsert_subject_rollup(conn, &rollup)?;
            Ok::<SubjectRollup, rusqlite::Error>(rollup)
        })
        .await
        .map_err(|e| Error::Database(e.to_string()))
}

/// Recompute the tutor rollup for one (tutor, subject, period) bucket.
pub async fn recompute_tutor(
    db: &Database,
    tutor_id: &str,
    subject_id: &str,
    period: Period,
) -> Result<TutorRollup> {
    let tutor_id = tutor_id.to_string();
    let subject_id = subject_id.to_string();
    let (start, end) = period.date_keys();

    db.writer()
        .call(move |conn| {
            let rollup = compute_tutor(conn, &tutor_id, &subject_id, &start, &end)?;
            repository::upsert_tutor_rollup(conn, &rollup)?;
            Ok::<TutorRollup, rusqlite::Error>(rollup)
        })
        .await
        .map_err(|e| Error::Database(e.to_string()))
}

/// Recompute the student rollup for one (student, subject, period) bucket.
pub async fn recompute_student(
    db: &Database,
    student_id: &str,
    subject_id: &str,
    period: Period,
) -> Result<StudentRollup> {
    let student_id = student_id.to_string();
    let subject_id = subject_id.to_string();
    let (start, end) = period.date_keys();

    db.writer()
        .call(move |conn| {
            let rollup = compute_student(conn, &student_id, &subject_id, &start, &end)?;
            repository::upsert_student_rollup(conn, &rollup)?;
            Ok::<StudentRollup, rusqlite::Error>(rollup)
        })
        .await
        .map_err(|e| Error::Database(e.to_string()))
}

/// Recompute the institution rollup for one period from the subject rollups
/// already materialized for it. Active-user and gamification fields are left
/// at their defaults; no producer for them exists in this service.
pub async fn recompute_institution(db: &Database, period: Period) -> Result<InstitutionRollup> {
    let (start, end) = period.date_keys();

    db.writer()
        .call(move |conn| {
            let rollup = compute_institution(conn, &start, &end)?;
            repository::upsert_institution_rollup(conn, &rollup)?;
            Ok::<InstitutionRollup, rusqlite::Error>(rollup)
        })
        .await
        .map_err(|e| Error::Database(e.to_string()))
}

// ── Internal SQL helpers ───────────────────────────────────────────

fn compute_subject(
    conn: &rusqlite::Connection,
    subject_id: &str,
    start: &str,
    end: &str,
) -> std::result::Result<SubjectRollup, rusqlite::Error> {
    let (total_sessions, total_hours, active_tutors, active_students): (i64, f64, i64, i64) =
        conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(duration_hours), 0),
                    COUNT(DISTINCT tutor_id),
                    COUNT(DISTINCT student_id)
             FROM fact_sessions
             WHERE subject_id = ?1
               AND scheduled_date_key >= ?2 AND scheduled_date_key <= ?3",
            rusqlite::params![subject_id, start, end],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )?;

    let student_to_tutor_ratio = if active_tutors > 0 {
        active_students as f64 / active_tutors as f64
    } else {
        0.0
    };

    let (feedback_count, avg_rating): (i64, Option<f64>) = conn.query_row(
        "SELECT COUNT(*), AVG(f.overall_rating)
         FROM fact_feedback f
         JOIN fact_sessions s ON s.session_id = f.session_id
         WHERE s.subject_id = ?1
           AND f.created_date_key >= ?2 AND f.created_date_key <= ?3",
        rusqlite::params![subject_id, start, end],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;

    let (average_session_rating, feedback_response_rate) = if feedback_count > 0 {
        let rate = if total_sessions > 0 {
            feedback_count as f64 / total_sessions as f64 * 100.0
        } else {
            0.0
        };
        (avg_rating.unwrap_or(0.0), rate)
    } else {
        (0.0, 0.0)
    };

    Ok(SubjectRollup {
        subject_id: subject_id.to_string(),
        period_start: start.to_string(),
        period_end: end.to_string(),
        total_sessions,
        total_hours,
        active_tutors,
        active_students,
        student_to_tutor_ratio,
        average_session_rating,
        feedback_response_rate,
    })
}

fn compute_tutor(
    conn: &rusqlite::Connection,
    tutor_id: &str,
    subject_id: &str,
    start: &str,
    end: &str,
) -> std::result::Result<TutorRollup, rusqlite::Error> {
    let (sessions_conducted, total_hours): (i64, f64) = conn.query_row(
        "SELECT COUNT(*), COALESCE(SUM(duration_hours), 0)
         FROM fact_sessions
         WHERE tutor_id = ?1 AND subject_id = ?2 AND status = 'completed'
           AND scheduled_date_key >= ?3 AND scheduled_date_key <= ?4",
        rusqlite::params![tutor_id, subject_id, start, end],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;

    // Per-student completed-session counts drive both student metrics.
    let mut stmt = conn.prepare(
        "SELECT student_id, COUNT(*)
         FROM fact_sessions
         WHERE tutor_id = ?1 AND subject_id = ?2 AND status = 'completed'
           AND scheduled_date_key >= ?3 AND scheduled_date_key <= ?4
         GROUP BY student_id",
    )?;
    let counts: Vec<i64> = stmt
        .query_map(rusqlite::params![tutor_id, subject_id, start, end], |row| {
            row.get::<_, i64>(1)
        })?
        .filter_map(|r| r.ok())
        .collect();
    let unique_students_helped = counts.len() as i64;
    let repeat_students = counts.iter().filter(|&&c| c > 1).count() as i64;

    let (feedback_count, avg_rating): (i64, Option<f64>) = conn.query_row(
        "SELECT COUNT(*), AVG(f.overall_rating)
         FROM fact_feedback f
         JOIN fact_sessions s ON s.session_id = f.session_id
         WHERE s.tutor_id = ?1 AND s.subject_id = ?2
           AND f.created_date_key >= ?3 AND f.created_date_key <= ?4",
        rusqlite::params![tutor_id, subject_id, start, end],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;

    Ok(TutorRollup {
        tutor_id: tutor_id.to_string(),
        subject_id: subject_id.to_string(),
        period_start: start.to_string(),
        period_end: end.to_string(),
        sessions_conducted,
        total_hours,
        average_rating: avg_rating.unwrap_or(0.0),
        feedback_count,
        unique_students_helped,
        repeat_students,
    })
}

fn compute_student(
    conn: &rusqlite::Connection,
    student_id: &str,
    subject_id: &str,
    start: &str,
    end: &str,
) -> std::result::Result<StudentRollup, rusqlite::Error> {
    let (sessions_attended, total_learning_hours): (i64, f64) = conn.query_row(
        "SELECT COUNT(*), COALESCE(SUM(duration_hours), 0)
         FROM fact_sessions
         WHERE student_id = ?1 AND subject_id = ?2 AND status = 'completed'
           AND scheduled_date_key >= ?3 AND scheduled_date_key <= ?4",
        rusqlite::params![student_id, subject_id, start, end],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;

    // Feedback given is counted across all subjects, not just this one.
    let feedback_given_count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM fact_feedback
         WHERE student_id = ?1
           AND created_date_key >= ?2 AND created_date_key <= ?3",
        rusqlite::params![student_id, start, end],
        |row| row.get(0),
    )?;

    Ok(StudentRollup {
        student_id: student_id.to_string(),
        subject_id: subject_id.to_string(),
        period_start: start.to_string(),
        period_end: end.to_string(),
        sessions_attended,
        total_learning_hours,
        feedback_given_count,
        self_reported_confidence: 0.0,
        self_reported_understanding: 0.0,
    })
}

fn compute_institution(
    conn: &rusqlite::Connection,
    start: &str,
    end: &str,
) -> std::result::Result<InstitutionRollup, rusqlite::Error> {
    let active_subjects: i64 = conn.query_row(
        "SELECT COUNT(*) FROM rollup_subject
         WHERE period_start = ?1 AND period_end = ?2 AND total_sessions > 0",
        rusqlite::params![start, end],
        |row| row.get(0),
    )?;

    let (total_sessions, total_hours, avg_rating): (i64, f64, Option<f64>) = conn.query_row(
        "SELECT COALESCE(SUM(total_sessions), 0),
                COALESCE(SUM(total_hours), 0),
                AVG(average_session_rating)
         FROM rollup_subject
         WHERE period_start = ?1 AND period_end = ?2",
        rusqlite::params![start, end],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
    )?;

    Ok(InstitutionRollup {
        period_start: start.to_string(),
        period_end: end.to_string(),
        active_subjects,
        total_sessions,
        total_hours,
        active_instructors: 0,
        active_tutors: 0,
        active_students: 0,
        average_session_rating: avg_rating.unwrap_or(0.0),
        points_awarded: 0,
        achievements_unlocked: 0,
    })
}
