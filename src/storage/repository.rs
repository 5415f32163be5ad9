use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use crate::rollup::types::{InstitutionRollup, StudentRollup, SubjectRollup, TutorRollup};

// ── Users and subjects ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct UserRow {
    pub user_id: String,
    pub name: String,
    pub email: Option<String>,
    pub role: String,
}

pub fn upsert_user(
    conn: &Connection,
    user_id: &str,
    name: &str,
    email: Option<&str>,
    role: &str,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO dim_users (user_id, name, email, role)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(user_id) DO UPDATE SET
           name = excluded.name,
           email = COALESCE(excluded.email, dim_users.email),
           role = excluded.role",
        params![user_id, name, email, role],
    )?;
    Ok(())
}

pub fn get_user(conn: &Connection, user_id: &str) -> Result<Option<UserRow>, rusqlite::Error> {
    conn.query_row(
        "SELECT user_id, name, email, role FROM dim_users WHERE user_id = ?1",
        [user_id],
        |row| {
            Ok(UserRow {
                user_id: row.get(0)?,
                name: row.get(1)?,
                email: row.get(2)?,
                role: row.get(3)?,
            })
        },
    )
    .optional()
}

pub fn upsert_subject(
    conn: &Connection,
    subject_id: &str,
    code: &str,
    name: &str,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO dim_subjects (subject_id, code, name)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(subject_id) DO UPDATE SET code = excluded.code, name = excluded.name",
        params![subject_id, code, name],
    )?;
    Ok(())
}

pub fn subject_exists(conn: &Connection, subject_id: &str) -> Result<bool, rusqlite::Error> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM dim_subjects WHERE subject_id = ?1",
            [subject_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

pub fn add_instructor_student(
    conn: &Connection,
    instructor_id: &str,
    student_id: &str,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT OR IGNORE INTO instructor_students (instructor_id, student_id)
         VALUES (?1, ?2)",
        params![instructor_id, student_id],
    )?;
    Ok(())
}

pub fn instructor_student_ids(
    conn: &Connection,
    instructor_id: &str,
) -> Result<Vec<String>, rusqlite::Error> {
    let mut stmt =
        conn.prepare("SELECT student_id FROM instructor_students WHERE instructor_id = ?1")?;
    let ids = stmt
        .query_map([instructor_id], |row| row.get(0))?
        .filter_map(|r| r.ok())
        .collect();
    Ok(ids)
}

// ── Sessions and feedback ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct SessionRow {
    pub session_id: String,
    pub subject_id: String,
    pub tutor_id: String,
    pub student_id: String,
    pub scheduled_at: String,
    pub scheduled_date_key: String,
    pub duration_hours: Option<f64>,
    pub status: String,
}

pub fn insert_session(conn: &Connection, session: &SessionRow) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO fact_sessions (
            session_id, subject_id, tutor_id, student_id,
            scheduled_at, scheduled_date_key, duration_hours, status
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            session.session_id,
            session.subject_id,
            session.tutor_id,
            session.student_id,
            session.scheduled_at,
            session.scheduled_date_key,
            session.duration_hours,
            session.status,
        ],
    )?;
    Ok(())
}

pub fn get_session(
    conn: &Connection,
    session_id: &str,
) -> Result<Option<SessionRow>, rusqlite::Error> {
    conn.query_row(
        "SELECT session_id, subject_id, tutor_id, student_id,
                scheduled_at, scheduled_date_key, duration_hours, status
         FROM fact_sessions WHERE session_id = ?1",
        [session_id],
        |row| {
            Ok(SessionRow {
                session_id: row.get(0)?,
                subject_id: row.get(1)?,
                tutor_id: row.get(2)?,
                student_id: row.get(3)?,
                scheduled_at: row.get(4)?,
                scheduled_date_key: row.get(5)?,
                duration_hours: row.get(6)?,
                status: row.get(7)?,
            })
        },
    )
    .optional()
}

/// Distinct subjects with at least one session scheduled in the key range.
pub fn subjects_with_sessions_between(
    conn: &Connection,
    start_key: &str,
    end_key: &str,
) -> Result<Vec<String>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT subject_id FROM fact_sessions
         WHERE scheduled_date_key >= ?1 AND scheduled_date_key <= ?2
         ORDER BY subject_id",
    )?;
    let ids = stmt
        .query_map(params![start_key, end_key], |row| row.get(0))?
        .filter_map(|r| r.ok())
        .collect();
    Ok(ids)
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedbackRow {
    pub feedback_id: String,
    pub session_id: String,
    pub student_id: String,
    pub overall_rating: i64,
    pub comments: String,
    pub created_at: String,
    pub created_date_key: String,
}

pub fn insert_feedback(conn: &Connection, feedback: &FeedbackRow) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO fact_feedback (
            feedback_id, session_id, student_id, overall_rating,
            comments, created_at, created_date_key
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            feedback.feedback_id,
            feedback.session_id,
            feedback.student_id,
            feedback.overall_rating,
            feedback.comments,
            feedback.created_at,
            feedback.created_date_key,
        ],
    )?;
    Ok(())
}

// ── Subject rollups ────────────────────────────────────────────────

pub fn upsert_subject_rollup(
    conn: &Connection,
    rollup: &SubjectRollup,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO rollup_subject (
            subject_id, period_start, period_end, total_sessions, total_hours,
            active_tutors, active_students, student_to_tutor_ratio,
            average_session_rating, feedback_response_rate, last_updated
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, datetime('now'))
        ON CONFLICT(subject_id, period_start, period_end) DO UPDATE SET
            total_sessions = excluded.total_sessions,
            total_hours = excluded.total_hours,
            active_tutors = excluded.active_tutors,
            active_students = excluded.active_students,
            student_to_tutor_ratio = excluded.student_to_tutor_ratio,
            average_session_rating = excluded.average_session_rating,
            feedback_response_rate = excluded.feedback_response_rate,
            last_updated = excluded.last_updated",
        params![
            rollup.subject_id,
            rollup.period_start,
            rollup.period_end,
            rollup.total_sessions,
            rollup.total_hours,
            rollup.active_tutors,
            rollup.active_students,
            rollup.student_to_tutor_ratio,
            rollup.average_session_rating,
            rollup.feedback_response_rate,
        ],
    )?;
    Ok(())
}

fn subject_rollup_from_row(row: &rusqlite::Row<'_>) -> Result<SubjectRollup, rusqlite::Error> {
    Ok(SubjectRollup {
        subject_id: row.get(0)?,
        period_start: row.get(1)?,
        period_end: row.get(2)?,
        total_sessions: row.get(3)?,
        total_hours: row.get(4)?,
        active_tutors: row.get(5)?,
        active_students: row.get(6)?,
        student_to_tutor_ratio: row.get(7)?,
        average_session_rating: row.get(8)?,
        feedback_response_rate: row.get(9)?,
    })
}

const SUBJECT_ROLLUP_COLS: &str = "subject_id, period_start, period_end, total_sessions, \
     total_hours, active_tutors, active_students, student_to_tutor_ratio, \
     average_session_rating, feedback_response_rate";

pub fn get_subject_rollup(
    conn: &Connection,
    subject_id: &str,
    period_start: &str,
    period_end: &str,
) -> Result<Option<SubjectRollup>, rusqlite::Error> {
    conn.query_row(
        &format!(
            "SELECT {SUBJECT_ROLLUP_COLS} FROM rollup_subject
             WHERE subject_id = ?1 AND period_start = ?2 AND period_end = ?3"
        ),
        params![subject_id, period_start, period_end],
        subject_rollup_from_row,
    )
    .optional()
}

pub fn subject_rollups_in_range(
    conn: &Connection,
    subject_id: &str,
    start: &str,
    end: &str,
) -> Result<Vec<SubjectRollup>, rusqlite::Error> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SUBJECT_ROLLUP_COLS} FROM rollup_subject
         WHERE subject_id = ?1 AND period_start >= ?2 AND period_end <= ?3
         ORDER BY period_start"
    ))?;
    let rows = stmt
        .query_map(params![subject_id, start, end], subject_rollup_from_row)?
        .filter_map(|r| r.ok())
        .collect();
    Ok(rows)
}

/// All subject rollups for one exact period (institution recompute input).
pub fn subject_rollups_for_period(
    conn: &Connection,
    period_start: &str,
    period_end: &str,
) -> Result<Vec<SubjectRollup>, rusqlite::Error> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SUBJECT_ROLLUP_COLS} FROM rollup_subject
         WHERE period_start = ?1 AND period_end = ?2
         ORDER BY subject_id"
    ))?;
    let rows = stmt
        .query_map(params![period_start, period_end], subject_rollup_from_row)?
        .filter_map(|r| r.ok())
        .collect();
    Ok(rows)
}

pub fn top_subject_rollups_since(
    conn: &Connection,
    cutoff_end: &str,
    limit: u32,
) -> Result<Vec<SubjectRollup>, rusqlite::Error> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SUBJECT_ROLLUP_COLS} FROM rollup_subject
         WHERE period_end >= ?1
         ORDER BY total_sessions DESC
         LIMIT ?2"
    ))?;
    let rows = stmt
        .query_map(params![cutoff_end, limit], subject_rollup_from_row)?
        .filter_map(|r| r.ok())
        .collect();
    Ok(rows)
}

pub fn list_subject_rollups(conn: &Connection) -> Result<Vec<SubjectRollup>, rusqlite::Error> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SUBJECT_ROLLUP_COLS} FROM rollup_subject ORDER BY period_end DESC, subject_id"
    ))?;
    let rows = stmt
        .query_map([], subject_rollup_from_row)?
        .filter_map(|r| r.ok())
        .collect();
    Ok(rows)
}

// ── Tutor rollups ──────────────────────────────────────────────────

pub fn upsert_tutor_rollup(
    conn: &Connection,
    rollup: &TutorRollup,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO rollup_tutor (
            tutor_id, subject_id, period_start, period_end, sessions_conducted,
            total_hours, average_rating, feedback_count, unique_students_helped,
            repeat_students, last_updated
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, datetime('now'))
        ON CONFLICT(tutor_id, subject_id, period_start, period_end) DO UPDATE SET
            sessions_conducted = excluded.sessions_conducted,
            total_hours = excluded.total_hours,
            average_rating = excluded.average_rating,
            feedback_count = excluded.feedback_count,
            unique_students_helped = excluded.unique_students_helped,
            repeat_students = excluded.repeat_students,
            last_updated = excluded.last_updated",
        params![
            rollup.tutor_id,
            rollup.subject_id,
            rollup.period_start,
            rollup.period_end,
            rollup.sessions_conducted,
            rollup.total_hours,
            rollup.average_rating,
            rollup.feedback_count,
            rollup.unique_students_helped,
            rollup.repeat_students,
        ],
    )?;
    Ok(())
}

fn tutor_rollup_from_row(row: &rusqlite::Row<'_>) -> Result<TutorRollup, rusqlite::Error> {
    Ok(TutorRollup {
        tutor_id: row.get(0)?,
        subject_id: row.get(1)?,
        period_start: row.get(2)?,
        period_end: row.get(3)?,
        sessions_conducted: row.get(4)?,
        total_hours: row.get(5)?,
        average_rating: row.get(6)?,
        feedback_count: row.get(7)?,
        unique_students_helped: row.get(8)?,
        repeat_students: row.get(9)?,
    })
}

const TUTOR_ROLLUP_COLS: &str = "tutor_id, subject_id, period_start, period_end, \
     sessions_conducted, total_hours, average_rating, feedback_count, \
     unique_students_helped, repeat_students";

pub fn get_tutor_rollup(
    conn: &Connection,
    tutor_id: &str,
    subject_id: &str,
    period_start: &str,
    period_end: &str,
) -> Result<Option<TutorRollup>, rusqlite::Error> {
    conn.query_row(
        &format!(
            "SELECT {TUTOR_ROLLUP_COLS} FROM rollup_tutor
             WHERE tutor_id = ?1 AND subject_id = ?2
               AND period_start = ?3 AND period_end = ?4"
        ),
        params![tutor_id, subject_id, period_start, period_end],
        tutor_rollup_from_row,
    )
    .optional()
}

pub fn tutor_rollups_in_range(
    conn: &Connection,
    tutor_id: &str,
    start: &str,
    end: &str,
) -> Result<Vec<TutorRollup>, rusqlite::Error> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {TUTOR_ROLLUP_COLS} FROM rollup_tutor
         WHERE tutor_id = ?1 AND period_start >= ?2 AND period_end <= ?3
         ORDER BY period_start"
    ))?;
    let rows = stmt
        .query_map(params![tutor_id, start, end], tutor_rollup_from_row)?
        .filter_map(|r| r.ok())
        .collect();
    Ok(rows)
}

pub fn top_tutor_rollups_since(
    conn: &Connection,
    cutoff_end: &str,
    limit: u32,
) -> Result<Vec<TutorRollup>, rusqlite::Error> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {TUTOR_ROLLUP_COLS} FROM rollup_tutor
         WHERE period_end >= ?1
         ORDER BY average_rating DESC
         LIMIT ?2"
    ))?;
    let rows = stmt
        .query_map(params![cutoff_end, limit], tutor_rollup_from_row)?
        .filter_map(|r| r.ok())
        .collect();
    Ok(rows)
}

/// Tutor rollups, optionally restricted to one tutor (role scoping).
pub fn list_tutor_rollups(
    conn: &Connection,
    tutor_id: Option<&str>,
) -> Result<Vec<TutorRollup>, rusqlite::Error> {
    let rows = match tutor_id {
        Some(tutor_id) => {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TUTOR_ROLLUP_COLS} FROM rollup_tutor
                 WHERE tutor_id = ?1 ORDER BY period_end DESC, subject_id"
            ))?;
            let rows = stmt
                .query_map([tutor_id], tutor_rollup_from_row)?
                .filter_map(|r| r.ok())
                .collect();
            rows
        }
        None => {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TUTOR_ROLLUP_COLS} FROM rollup_tutor
                 ORDER BY period_end DESC, tutor_id, subject_id"
            ))?;
            let rows = stmt
                .query_map([], tutor_rollup_from_row)?
                .filter_map(|r| r.ok())
                .collect();
            rows
        }
    };
    Ok(rows)
}

// ── Student rollups ────────────────────────────────────────────────

pub fn upsert_student_rollup(
    conn: &Connection,
    rollup: &StudentRollup,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO rollup_student (
            student_id, subject_id, period_start, period_end, sessions_attended,
            total_learning_hours, feedback_given_count,
            self_reported_confidence, self_reported_understanding, last_updated
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, datetime('now'))
        ON CONFLICT(student_id, subject_id, period_start, period_end) DO UPDATE SET
            sessions_attended = excluded.sessions_attended,
            total_learning_hours = excluded.total_learning_hours,
            feedback_given_count = excluded.feedback_given_count,
            last_updated = excluded.last_updated",
        params![
            rollup.student_id,
            rollup.subject_id,
            rollup.period_start,
            rollup.period_end,
            rollup.sessions_attended,
            rollup.total_learning_hours,
            rollup.feedback_given_count,
            rollup.self_reported_confidence,
            rollup.self_reported_understanding,
        ],
    )?;
    Ok(())
}

fn student_rollup_from_row(row: &rusqlite::Row<'_>) -> Result<StudentRollup, rusqlite::Error> {
    Ok(StudentRollup {
        student_id: row.get(0)?,
        subject_id: row.get(1)?,
        period_start: row.get(2)?,
        period_end: row.get(3)?,
        sessions_attended: row.get(4)?,
        total_learning_hours: row.get(5)?,
        feedback_given_count: row.get(6)?,
        self_reported_confidence: row.get(7)?,
        self_reported_understanding: row.get(8)?,
    })
}

const STUDENT_ROLLUP_COLS: &str = "student_id, subject_id, period_start, period_end, \
     sessions_attended, total_learning_hours, feedback_given_count, \
     self_reported_confidence, self_reported_understanding";

pub fn get_student_rollup(
    conn: &Connection,
    student_id: &str,
    subject_id: &str,
    period_start: &str,
    period_end: &str,
) -> Result<Option<StudentRollup>, rusqlite::Error> {
    conn.query_row(
        &format!(
            "SELECT {STUDENT_ROLLUP_COLS} FROM rollup_student
             WHERE student_id = ?1 AND subject_id = ?2
               AND period_start = ?3 AND period_end = ?4"
        ),
        params![student_id, subject_id, period_start, period_end],
        student_rollup_from_row,
    )
    .optional()
}

/// All student rollups for one exact period (risk-assessment input).
pub fn student_rollups_for_period(
    conn: &Connection,
    period_start: &str,
    period_end: &str,
) -> Result<Vec<StudentRollup>, rusqlite::Error> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {STUDENT_ROLLUP_COLS} FROM rollup_student
         WHERE period_start = ?1 AND period_end = ?2
         ORDER BY student_id, subject_id"
    ))?;
    let rows = stmt
        .query_map(params![period_start, period_end], student_rollup_from_row)?
        .filter_map(|r| r.ok())
        .collect();
    Ok(rows)
}

/// Student rollups, optionally restricted to a set of students (role scoping).
pub fn list_student_rollups(
    conn: &Connection,
    student_ids: Option<&[String]>,
) -> Result<Vec<StudentRollup>, rusqlite::Error> {
    match student_ids {
        None => {
            let mut stmt = conn.prepare(&format!(
                "SELECT {STUDENT_ROLLUP_COLS} FROM rollup_student
                 ORDER BY period_end DESC, student_id, subject_id"
            ))?;
            let rows = stmt
                .query_map([], student_rollup_from_row)?
                .filter_map(|r| r.ok())
                .collect();
            Ok(rows)
        }
        Some(ids) if ids.is_empty() => Ok(Vec::new()),
        Some(ids) => {
            let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
            let sql = format!(
                "SELECT {STUDENT_ROLLUP_COLS} FROM rollup_student
                 WHERE student_id IN ({placeholders})
                 ORDER BY period_end DESC, student_id, subject_id"
            );
            let mut stmt = conn.prepare(&sql)?;
            for (i, id) in ids.iter().enumerate() {
                stmt.raw_bind_parameter(i + 1, id)?;
            }
            let mut rows = stmt.raw_query();
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(student_rollup_from_row(row)?);
            }
            Ok(out)
        }
    }
}

// ── Institution rollups ────────────────────────────────────────────

/// Create a zeroed institution rollup row if none exists for the period.
pub fn ensure_institution_rollup(
    conn: &Connection,
    period_start: &str,
    period_end: &str,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT OR IGNORE INTO rollup_institution (period_start, period_end)
         VALUES (?1, ?2)",
        params![period_start, period_end],
    )?;
    Ok(())
}

pub fn upsert_institution_rollup(
    conn: &Connection,
    rollup: &InstitutionRollup,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO rollup_institution (
            period_start, period_end, active_subjects, total_sessions, total_hours,
            active_instructors, active_tutors, active_students,
            average_session_rating, points_awarded, achievements_unlocked, last_updated
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, datetime('now'))
        ON CONFLICT(period_start, period_end) DO UPDATE SET
            active_subjects = excluded.active_subjects,
            total_sessions = excluded.total_sessions,
            total_hours = excluded.total_hours,
            average_session_rating = excluded.average_session_rating,
            last_updated = excluded.last_updated",
        params![
            rollup.period_start,
            rollup.period_end,
            rollup.active_subjects,
            rollup.total_sessions,
            rollup.total_hours,
            rollup.active_instructors,
            rollup.active_tutors,
            rollup.active_students,
            rollup.average_session_rating,
            rollup.points_awarded,
            rollup.achievements_unlocked,
        ],
    )?;
    Ok(())
}

fn institution_rollup_from_row(
    row: &rusqlite::Row<'_>,
) -> Result<InstitutionRollup, rusqlite::Error> {
    Ok(InstitutionRollup {
        period_start: row.get(0)?,
        period_end: row.get(1)?,
        active_subjects: row.get(2)?,
        total_sessions: row.get(3)?,
        total_hours: row.get(4)?,
        active_instructors: row.get(5)?,
        active_tutors: row.get(6)?,
        active_students: row.get(7)?,
        average_session_rating: row.get(8)?,
        points_awarded: row.get(9)?,
        achievements_unlocked: row.get(10)?,
    })
}

const INSTITUTION_ROLLUP_COLS: &str = "period_start, period_end, active_subjects, \
     total_sessions, total_hours, active_instructors, active_tutors, active_students, \
     average_session_rating, points_awarded, achievements_unlocked";

pub fn get_institution_rollup(
    conn: &Connection,
    period_start: &str,
    period_end: &str,
) -> Result<Option<InstitutionRollup>, rusqlite::Error> {
    conn.query_row(
        &format!(
            "SELECT {INSTITUTION_ROLLUP_COLS} FROM rollup_institution
             WHERE period_start = ?1 AND period_end = ?2"
        ),
        params![period_start, period_end],
        institution_rollup_from_row,
    )
    .optional()
}

pub fn latest_institution_rollup(
    conn: &Connection,
) -> Result<Option<InstitutionRollup>, rusqlite::Error> {
    conn.query_row(
        &format!(
            "SELECT {INSTITUTION_ROLLUP_COLS} FROM rollup_institution
             ORDER BY period_end DESC LIMIT 1"
        ),
        [],
        institution_rollup_from_row,
    )
    .optional()
}

pub fn institution_rollups_in_range(
    conn: &Connection,
    start: &str,
    end: &str,
) -> Result<Vec<InstitutionRollup>, rusqlite::Error> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {INSTITUTION_ROLLUP_COLS} FROM rollup_institution
         WHERE period_start >= ?1 AND period_end <= ?2
         ORDER BY period_start"
    ))?;
    let rows = stmt
        .query_map(params![start, end], institution_rollup_from_row)?
        .filter_map(|r| r.ok())
        .collect();
    Ok(rows)
}

pub fn list_institution_rollups(
    conn: &Connection,
) -> Result<Vec<InstitutionRollup>, rusqlite::Error> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {INSTITUTION_ROLLUP_COLS} FROM rollup_institution ORDER BY period_end DESC"
    ))?;
    let rows = stmt
        .query_map([], institution_rollup_from_row)?
        .filter_map(|r| r.ok())
        .collect();
    Ok(rows)
}

// ── Risk assessments ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct RiskAssessmentRow {
    pub assessment_id: i64,
    pub student_id: String,
    pub subject_id: String,
    pub risk_level: String,
    pub risk_score: f64,
    pub contributing_factors: String,
    pub model_id: Option<String>,
    pub assessed_on: String,
}

/// The active model id for a model type, if one is registered.
pub fn active_model_id(
    conn: &Connection,
    model_type: &str,
) -> Result<Option<String>, rusqlite::Error> {
    conn.query_row(
        "SELECT model_id FROM predictive_models
         WHERE model_type = ?1 AND is_active = 1
         ORDER BY created_at LIMIT 1",
        [model_type],
        |row| row.get(0),
    )
    .optional()
}

/// At most one assessment per (student, subject, day): a same-day re-run
/// updates the existing row instead of inserting a duplicate.
pub fn upsert_risk_assessment(
    conn: &Connection,
    student_id: &str,
    subject_id: &str,
    risk_level: &str,
    risk_score: f64,
    contributing_factors: &str,
    model_id: Option<&str>,
    assessed_on: &str,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO risk_assessments (
            student_id, subject_id, risk_level, risk_score,
            contributing_factors, model_id, assessed_on
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        ON CONFLICT(student_id, subject_id, assessed_on) DO UPDATE SET
            risk_level = excluded.risk_level,
            risk_score = excluded.risk_score,
            contributing_factors = excluded.contributing_factors,
            model_id = excluded.model_id",
        params![
            student_id,
            subject_id,
            risk_level,
            risk_score,
            contributing_factors,
            model_id,
            assessed_on,
        ],
    )?;
    Ok(())
}

fn risk_assessment_from_row(
    row: &rusqlite::Row<'_>,
) -> Result<RiskAssessmentRow, rusqlite::Error> {
    Ok(RiskAssessmentRow {
        assessment_id: row.get(0)?,
        student_id: row.get(1)?,
        subject_id: row.get(2)?,
        risk_level: row.get(3)?,
        risk_score: row.get(4)?,
        contributing_factors: row.get(5)?,
        model_id: row.get(6)?,
        assessed_on: row.get(7)?,
    })
}

const RISK_COLS: &str = "assessment_id, student_id, subject_id, risk_level, risk_score, \
     contributing_factors, model_id, assessed_on";

pub fn recent_high_risk_assessments(
    conn: &Connection,
    cutoff: &str,
    limit: u32,
) -> Result<Vec<RiskAssessmentRow>, rusqlite::Error> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {RISK_COLS} FROM risk_assessments
         WHERE risk_level = 'high' AND assessed_on >= ?1
         ORDER BY assessed_on DESC
         LIMIT ?2"
    ))?;
    let rows = stmt
        .query_map(params![cutoff, limit], risk_assessment_from_row)?
        .filter_map(|r| r.ok())
        .collect();
    Ok(rows)
}

pub fn get_risk_assessment(
    conn: &Connection,
    assessment_id: i64,
) -> Result<Option<RiskAssessmentRow>, rusqlite::Error> {
    conn.query_row(
        &format!("SELECT {RISK_COLS} FROM risk_assessments WHERE assessment_id = ?1"),
        [assessment_id],
        risk_assessment_from_row,
    )
    .optional()
}

pub fn delete_risk_assessment(
    conn: &Connection,
    assessment_id: i64,
) -> Result<bool, rusqlite::Error> {
    let changed = conn.execute(
        "DELETE FROM risk_assessments WHERE assessment_id = ?1",
        [assessment_id],
    )?;
    Ok(changed > 0)
}

/// Risk assessments, optionally restricted to a set of students (role scoping).
pub fn list_risk_assessments(
    conn: &Connection,
    student_ids: Option<&[String]>,
) -> Result<Vec<RiskAssessmentRow>, rusqlite::Error> {
    match student_ids {
        None => {
            let mut stmt = conn.prepare(&format!(
                "SELECT {RISK_COLS} FROM risk_assessments ORDER BY assessed_on DESC"
            ))?;
            let rows = stmt
                .query_map([], risk_assessment_from_row)?
                .filter_map(|r| r.ok())
                .collect();
            Ok(rows)
        }
        Some(ids) if ids.is_empty() => Ok(Vec::new()),
        Some(ids) => {
            let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
            let sql = format!(
                "SELECT {RISK_COLS} FROM risk_assessments
                 WHERE student_id IN ({placeholders})
                 ORDER BY assessed_on DESC"
            );
            let mut stmt = conn.prepare(&sql)?;
            for (i, id) in ids.iter().enumerate() {
                stmt.raw_bind_parameter(i + 1, id)?;
            }
            let mut rows = stmt.raw_query();
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(risk_assessment_from_row(row)?);
            }
            Ok(out)
        }
    }
}

// ── Recommended actions ────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct RecommendedActionRow {
    pub action_id: i64,
    pub student_id: String,
    pub subject_id: String,
    pub action_type: String,
    pub description: String,
    pub priority: i64,
    pub risk_assessment_id: Option<i64>,
    pub related_session_id: Option<String>,
    pub related_tutor_id: Option<String>,
    pub is_completed: bool,
    pub completed_at: Option<String>,
    pub expires_at: Option<String>,
}

#[allow(clippy::too_many_arguments)]
pub fn insert_recommended_action(
    conn: &Connection,
    student_id: &str,
    subject_id: &str,
    action_type: &str,
    description: &str,
    priority: i64,
    risk_assessment_id: Option<i64>,
    related_tutor_id: Option<&str>,
) -> Result<i64, rusqlite::Error> {
    conn.execute(
        "INSERT INTO recommended_actions (
            student_id, subject_id, action_type, description, priority,
            risk_assessment_id, related_tutor_id
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            student_id,
            subject_id,
            action_type,
            description,
            priority,
            risk_assessment_id,
            related_tutor_id,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn recommended_action_from_row(
    row: &rusqlite::Row<'_>,
) -> Result<RecommendedActionRow, rusqlite::Error> {
    Ok(RecommendedActionRow {
        action_id: row.get(0)?,
        student_id: row.get(1)?,
        subject_id: row.get(2)?,
        action_type: row.get(3)?,
        description: row.get(4)?,
        priority: row.get(5)?,
        risk_assessment_id: row.get(6)?,
        related_session_id: row.get(7)?,
        related_tutor_id: row.get(8)?,
        is_completed: row.get::<_, i64>(9)? != 0,
        completed_at: row.get(10)?,
        expires_at: row.get(11)?,
    })
}

const ACTION_COLS: &str = "action_id, student_id, subject_id, action_type, description, \
     priority, risk_assessment_id, related_session_id, related_tutor_id, is_completed, \
     completed_at, expires_at";

pub fn get_recommended_action(
    conn: &Connection,
    action_id: i64,
) -> Result<Option<RecommendedActionRow>, rusqlite::Error> {
    conn.query_row(
        &format!("SELECT {ACTION_COLS} FROM recommended_actions WHERE action_id = ?1"),
        [action_id],
        recommended_action_from_row,
    )
    .optional()
}

/// Incomplete actions at or above the given priority (1 = highest).
pub fn open_priority_actions(
    conn: &Connection,
    max_priority: i64,
    limit: u32,
) -> Result<Vec<RecommendedActionRow>, rusqlite::Error> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ACTION_COLS} FROM recommended_actions
         WHERE is_completed = 0 AND priority <= ?1
         ORDER BY priority, created_at
         LIMIT ?2"
    ))?;
    let rows = stmt
        .query_map(params![max_priority, limit], recommended_action_from_row)?
        .filter_map(|r| r.ok())
        .collect();
    Ok(rows)
}

pub fn list_recommended_actions(
    conn: &Connection,
    student_ids: Option<&[String]>,
) -> Result<Vec<RecommendedActionRow>, rusqlite::Error> {
    match student_ids {
        None => {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ACTION_COLS} FROM recommended_actions
                 ORDER BY priority, created_at DESC"
            ))?;
            let rows = stmt
                .query_map([], recommended_action_from_row)?
                .filter_map(|r| r.ok())
                .collect();
            Ok(rows)
        }
        Some(ids) if ids.is_empty() => Ok(Vec::new()),
        Some(ids) => {
            let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
            let sql = format!(
                "SELECT {ACTION_COLS} FROM recommended_actions
                 WHERE student_id IN ({placeholders})
                 ORDER BY priority, created_at DESC"
            );
            let mut stmt = conn.prepare(&sql)?;
            for (i, id) in ids.iter().enumerate() {
                stmt.raw_bind_parameter(i + 1, id)?;
            }
            let mut rows = stmt.raw_query();
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(recommended_action_from_row(row)?);
            }
            Ok(out)
        }
    }
}

pub fn complete_recommended_action(
    conn: &Connection,
    action_id: i64,
    completed_at: &str,
) -> Result<bool, rusqlite::Error> {
    let changed = conn.execute(
        "UPDATE recommended_actions SET is_completed = 1, completed_at = ?2
         WHERE action_id = ?1 AND is_completed = 0",
        params![action_id, completed_at],
    )?;
    Ok(changed > 0)
}

// ── Predictive models ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct PredictiveModelRow {
    pub model_id: String,
    pub name: String,
    pub model_type: String,
    pub description: String,
    pub parameters: String,
    pub accuracy: Option<f64>,
    pub is_active: bool,
    pub trained_on: String,
}

pub fn list_predictive_models(
    conn: &Connection,
) -> Result<Vec<PredictiveModelRow>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT model_id, name, model_type, description, parameters, accuracy,
                is_active, trained_on
         FROM predictive_models ORDER BY created_at DESC",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok(PredictiveModelRow {
                model_id: row.get(0)?,
                name: row.get(1)?,
                model_type: row.get(2)?,
                description: row.get(3)?,
                parameters: row.get(4)?,
                accuracy: row.get(5)?,
                is_active: row.get::<_, i64>(6)? != 0,
                trained_on: row.get(7)?,
            })
        })?
        .filter_map(|r| r.ok())
        .collect();
    Ok(rows)
}

// ── Status ─────────────────────────────────────────────────────────

/// Row counts per table, for the `status` CLI command.
pub fn table_counts(conn: &Connection) -> Result<Vec<(String, i64)>, rusqlite::Error> {
    let tables = [
        "dim_users",
        "dim_subjects",
        "fact_sessions",
        "fact_feedback",
        "rollup_subject",
        "rollup_tutor",
        "rollup_student",
        "rollup_institution",
        "risk_assessments",
        "recommended_actions",
        "predictive_models",
    ];
    let mut counts = Vec::with_capacity(tables.len());
    for table in tables {
        let count: i64 =
            conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?;
        counts.push((table.to_string(), count));
    }
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Database;

    fn seed_refs(conn: &Connection) -> Result<(), rusqlite::Error> {
        upsert_subject(conn, "sub-1", "MATH101", "Calculus I")?;
        upsert_user(conn, "tutor-1", "Tess Tutor", Some("tess@example.edu"), "tutor")?;
        upsert_user(conn, "stu-1", "Sam Student", Some("sam@example.edu"), "student")?;
        Ok(())
    }

    #[tokio::test]
    async fn test_upsert_user_preserves_email() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                upsert_user(conn, "u1", "Alice", Some("alice@example.edu"), "student")?;
                // Re-upsert without an email keeps the stored one.
                upsert_user(conn, "u1", "Alice A.", None, "student")?;

                let user = get_user(conn, "u1")?.unwrap();
                assert_eq!(user.name, "Alice A.");
                assert_eq!(user.email, Some("alice@example.edu".to_string()));
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_subject_rollup_upsert_overwrites_in_place() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                seed_refs(conn)?;

                let mut rollup = SubjectRollup {
                    subject_id: "sub-1".to_string(),
                    period_start: "2026-07-01".to_string(),
                    period_end: "2026-07-31".to_string(),
                    total_sessions: 3,
                    total_hours: 4.5,
                    active_tutors: 1,
                    active_students: 2,
                    student_to_tutor_ratio: 2.0,
                    average_session_rating: 0.0,
                    feedback_response_rate: 0.0,
                };
                upsert_subject_rollup(conn, &rollup)?;

                rollup.total_sessions = 4;
                rollup.total_hours = 6.0;
                upsert_subject_rollup(conn, &rollup)?;

                let count: i64 =
                    conn.query_row("SELECT COUNT(*) FROM rollup_subject", [], |row| row.get(0))?;
                assert_eq!(count, 1);

                let stored =
                    get_subject_rollup(conn, "sub-1", "2026-07-01", "2026-07-31")?.unwrap();
                assert_eq!(stored.total_sessions, 4);
                assert_eq!(stored.total_hours, 6.0);
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_risk_assessment_same_day_updates_not_duplicates() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                seed_refs(conn)?;

                upsert_risk_assessment(
                    conn, "stu-1", "sub-1", "high", 0.8, "{}", None, "2026-08-05",
                )?;
                upsert_risk_assessment(
                    conn,
                    "stu-1",
                    "sub-1",
                    "high",
                    0.8,
                    r#"{"low_session_attendance":true}"#,
                    None,
                    "2026-08-05",
                )?;

                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM risk_assessments WHERE student_id = 'stu-1'",
                    [],
                    |row| row.get(0),
                )?;
                assert_eq!(count, 1);

                let factors: String = conn.query_row(
                    "SELECT contributing_factors FROM risk_assessments WHERE student_id = 'stu-1'",
                    [],
                    |row| row.get(0),
                )?;
                assert!(factors.contains("low_session_attendance"));
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_ensure_institution_rollup_does_not_clobber() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                let rollup = InstitutionRollup {
                    period_start: "2026-07-01".to_string(),
                    period_end: "2026-07-31".to_string(),
                    active_subjects: 2,
                    total_sessions: 10,
                    total_hours: 15.0,
                    active_instructors: 0,
                    active_tutors: 0,
                    active_students: 0,
                    average_session_rating: 4.2,
                    points_awarded: 0,
                    achievements_unlocked: 0,
                };
                upsert_institution_rollup(conn, &rollup)?;
                ensure_institution_rollup(conn, "2026-07-01", "2026-07-31")?;

                let stored = get_institution_rollup(conn, "2026-07-01", "2026-07-31")?.unwrap();
                assert_eq!(stored.total_sessions, 10);
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_list_student_rollups_scoping() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                seed_refs(conn)?;
                upsert_user(conn, "stu-2", "Uma Undergrad", None, "student")?;

                for student_id in ["stu-1", "stu-2"] {
                    let rollup = StudentRollup {
                        student_id: student_id.to_string(),
                        subject_id: "sub-1".to_string(),
                        period_start: "2026-07-01".to_string(),
                        period_end: "2026-07-31".to_string(),
                        sessions_attended: 1,
                        total_learning_hours: 1.0,
                        feedback_given_count: 0,
                        self_reported_confidence: 0.0,
                        self_reported_understanding: 0.0,
                    };
                    upsert_student_rollup(conn, &rollup)?;
                }

                let all = list_student_rollups(conn, None)?;
                assert_eq!(all.len(), 2);

                let own = list_student_rollups(conn, Some(&["stu-2".to_string()]))?;
                assert_eq!(own.len(), 1);
                assert_eq!(own[0].student_id, "stu-2");

                let none = list_student_rollups(conn, Some(&[]))?;
                assert!(none.is_empty());
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_complete_recommended_action() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                seed_refs(conn)?;

                let id = insert_recommended_action(
                    conn,
                    "stu-1",
                    "sub-1",
                    "tutoring_session",
                    "Book a calculus session this week",
                    1,
                    None,
                    Some("tutor-1"),
                )?;

                assert!(complete_recommended_action(conn, id, "2026-08-05T12:00:00Z")?);
                // Second completion is a no-op.
                assert!(!complete_recommended_action(conn, id, "2026-08-05T13:00:00Z")?);

                let open = open_priority_actions(conn, 2, 10)?;
                assert!(open.is_empty());
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }
}
