pub mod date_util;
pub mod error;
pub mod http;
pub mod ingest;
pub mod period;
pub mod report;
pub mod risk;
pub mod rollup;
pub mod storage;

pub use error::{Error, Result};
pub use ingest::{NewFeedback, NewSession};
pub use period::Period;
pub use report::{Dashboard, ReportKind, ReportRequest};
pub use risk::{MonthlyRollupReport, RiskAssessmentReport};
pub use rollup::{InstitutionRollup, StudentRollup, SubjectRollup, TutorRollup};
pub use storage::Database;

use chrono::{DateTime, NaiveDate, Utc};

use storage::repository::{self, FeedbackRow, SessionRow};

/// Main entry point for the tutoring analytics warehouse.
///
/// Every method that depends on the calendar takes an explicit date or
/// timestamp; the clock is read once at the boundary (CLI or HTTP handler)
/// and passed down, never inside the engine.
pub struct TutorDW {
    db: Database,
}

impl TutorDW {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Access the database (for direct queries in the CLI).
    pub fn db(&self) -> &Database {
        &self.db
    }

    // ── Ingestion (event triggers) ─────────────────────────────────

    pub async fn record_session(&self, input: NewSession, today: NaiveDate) -> Result<SessionRow> {
        ingest::record_session(&self.db, input, today).await
    }

    pub async fn record_feedback(
        &self,
        input: NewFeedback,
        now: DateTime<Utc>,
    ) -> Result<FeedbackRow> {
        ingest::record_feedback(&self.db, input, now).await
    }

    // ── Forced recomputes ──────────────────────────────────────────

    pub async fn recompute_subject(&self, subject_id: &str, period: Period) -> Result<SubjectRollup> {
        rollup::recompute_subject(&self.db, subject_id, period).await
    }

    pub async fn recompute_tutor(
        &self,
        tutor_id: &str,
        subject_id: &str,
        period: Period,
    ) -> Result<TutorRollup> {
        rollup::recompute_tutor(&self.db, tutor_id, subject_id, period).await
    }

    pub async fn recompute_student(
        &self,
        student_id: &str,
        subject_id: &str,
        period: Period,
    ) -> Result<StudentRollup> {
        rollup::recompute_student(&self.db, student_id, subject_id, period).await
    }

    pub async fn recompute_institution(&self, period: Period) -> Result<InstitutionRollup> {
        rollup::recompute_institution(&self.db, period).await
    }

    // ── Batch jobs ─────────────────────────────────────────────────

    pub async fn generate_monthly_rollups(&self, today: NaiveDate) -> Result<MonthlyRollupReport> {
        risk::generate_monthly_rollups(&self.db, today).await
    }

    pub async fn generate_risk_assessments(
        &self,
        today: NaiveDate,
    ) -> Result<RiskAssessmentReport> {
        risk::generate_risk_assessments(&self.db, today).await
    }

    // ── Reporting ──────────────────────────────────────────────────

    pub async fn dashboard(&self, today: NaiveDate) -> Result<Dashboard> {
        report::dashboard(&self.db, today).await
    }

    pub async fn generate_report(&self, request: ReportRequest) -> Result<serde_json::Value> {
        report::generate_report(&self.db, request).await
    }

    pub async fn status(&self) -> Result<Vec<(String, i64)>> {
        self.db
            .reader()
            .call(|conn| repository::table_counts(conn))
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    /// Insert a small, deterministic demo data set through the ingest path,
    /// so the triggers materialize real rollups.
    pub async fn seed_demo(&self, today: NaiveDate) -> Result<()> {
        self.db
            .writer()
            .call(|conn| {
                repository::upsert_subject(conn, "sub-math", "MATH101", "Calculus I")?;
                repository::upsert_subject(conn, "sub-phys", "PHYS201", "Mechanics")?;
                repository::upsert_user(conn, "staff-ada", "Ada Admin", Some("ada@studyhall.edu"), "staff")?;
                repository::upsert_user(conn, "inst-ivan", "Ivan Instructor", Some("ivan@studyhall.edu"), "instructor")?;
                repository::upsert_user(conn, "tutor-tess", "Tess Tutor", Some("tess@studyhall.edu"), "tutor")?;
                repository::upsert_user(conn, "tutor-theo", "Theo Tutor", Some("theo@studyhall.edu"), "tutor")?;
                repository::upsert_user(conn, "stu-sam", "Sam Student", Some("sam@studyhall.edu"), "student")?;
                repository::upsert_user(conn, "stu-uma", "Uma Undergrad", Some("uma@studyhall.edu"), "student")?;
                repository::upsert_user(conn, "stu-noa", "Noa Newcomer", Some("noa@studyhall.edu"), "student")?;
                repository::add_instructor_student(conn, "inst-ivan", "stu-sam")?;
                repository::add_instructor_student(conn, "inst-ivan", "stu-uma")?;
                Ok::<(), rusqlite::Error>(())
            })
            .await?;

        let sessions = [
            ("sess-001", "sub-math", "tutor-tess", "stu-sam", Some(1.5), "completed"),
            ("sess-002", "sub-math", "tutor-tess", "stu-sam", Some(1.0), "completed"),
            ("sess-003", "sub-math", "tutor-tess", "stu-uma", Some(2.0), "completed"),
            ("sess-004", "sub-math", "tutor-theo", "stu-noa", None, "scheduled"),
            ("sess-005", "sub-phys", "tutor-theo", "stu-uma", Some(1.0), "completed"),
        ];
        for (session_id, subject_id, tutor_id, student_id, duration_hours, status) in sessions {
            self.record_session(
                NewSession {
                    session_id: session_id.to_string(),
                    subject_id: subject_id.to_string(),
                    tutor_id: tutor_id.to_string(),
                    student_id: student_id.to_string(),
                    scheduled_at: format!("{}T16:00:00+00:00", today.format("%Y-%m-%d")),
                    duration_hours,
                    status: Some(status.to_string()),
                },
                today,
            )
            .await?;
        }

        let noon = today.and_hms_opt(12, 0, 0).unwrap().and_utc();
        let feedback = [
            ("fb-001", "sess-001", "stu-sam", 5, "Worked through every practice problem"),
            ("fb-002", "sess-003", "stu-uma", 4, "Helpful, want more examples"),
            ("fb-003", "sess-005", "stu-uma", 3, ""),
        ];
        for (feedback_id, session_id, student_id, overall_rating, comments) in feedback {
            self.record_feedback(
                NewFeedback {
                    feedback_id: feedback_id.to_string(),
                    session_id: session_id.to_string(),
                    student_id: student_id.to_string(),
                    overall_rating,
                    comments: comments.to_string(),
                },
                noon,
            )
            .await?;
        }

        self.db
            .writer()
            .call(|conn| {
                repository::insert_recommended_action(
                    conn,
                    "stu-noa",
                    "sub-math",
                    "tutoring_session",
                    "Book a first calculus session before the midterm",
                    1,
                    None,
                    Some("tutor-tess"),
                )?;
                Ok::<(), rusqlite::Error>(())
            })
            .await?;

        log::info!("seeded demo data for {today}");
        Ok(())
    }
}
